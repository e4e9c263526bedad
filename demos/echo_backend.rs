//! Backend for trying the load balancer by hand.
//!
//! Answers every request with `200 Hello, world!` on 127.0.0.1:8001 (or the
//! address given as the first argument).

use std::net::SocketAddr;

use axum::http::header;
use axum::Router;

const HELLO: &str = "Hello, world!";

async fn hello() -> ([(header::HeaderName, &'static str); 1], &'static str) {
    ([(header::CONTENT_TYPE, "text/plain; charset=UTF-8")], HELLO)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let addr: SocketAddr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:8001".to_string())
        .parse()?;

    let app = Router::new().fallback(hello);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    println!("Echo backend listening on http://{}", addr);
    axum::serve(listener, app).await?;
    Ok(())
}
