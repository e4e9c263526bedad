//! Bring up a backend and the load balancer in one process, send one request
//! through the front door and print what came back.
//!
//! ```text
//! cargo run --example quickstart
//! ```

use std::net::SocketAddr;

use axum::http::header;
use axum::Router;

use lb_proxy::config::{BackendConfig, LbConfig};
use lb_proxy::lifecycle;

async fn start_backend() -> Result<SocketAddr, std::io::Error> {
    let app = Router::new().fallback(|| async {
        (
            [(header::CONTENT_TYPE, "text/plain; charset=UTF-8")],
            "Hello, world!",
        )
    });
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    Ok(addr)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let backend = start_backend().await?;

    let mut config = LbConfig::default();
    config.listener.bind_address = "127.0.0.1:0".into();
    config.backends = vec![BackendConfig::new(format!("http://{backend}/"))];
    config.health_check.enabled = false;

    let lb = lifecycle::start(config)?;
    let url = format!("http://{}/", lb.local_addr());

    let response = reqwest::Client::builder()
        .no_proxy()
        .build()?
        .get(&url)
        .send()
        .await?;
    println!("{}", response.status().as_u16());
    println!("{}", response.text().await?);

    lb.stop().await?;
    Ok(())
}
