//! Shared utilities for integration and load testing.

#![allow(dead_code)]

use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

use lb_proxy::config::{BackendConfig, LbConfig};
use lb_proxy::lifecycle::{self, Running};

/// Counters kept by a mock backend.
#[derive(Debug, Default)]
pub struct BackendStats {
    pub connections: AtomicUsize,
    pub open: AtomicUsize,
    pub requests: AtomicUsize,
    pub active: AtomicUsize,
    pub peak: AtomicUsize,
}

impl BackendStats {
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Connections the peer has not closed yet.
    pub fn open(&self) -> usize {
        self.open.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

pub struct MockBackend {
    pub addr: SocketAddr,
    pub stats: Arc<BackendStats>,
}

impl MockBackend {
    pub fn url(&self) -> String {
        format!("http://{}/", self.addr)
    }
}

fn status_line(status: u16) -> &'static str {
    match status {
        200 => "200 OK",
        404 => "404 Not Found",
        500 => "500 Internal Server Error",
        502 => "502 Bad Gateway",
        503 => "503 Service Unavailable",
        _ => "200 OK",
    }
}

/// Read one request head; `None` once the peer closed the connection.
async fn read_head(reader: &mut BufReader<TcpStream>) -> Option<String> {
    let mut head = String::new();
    loop {
        let mut line = String::new();
        match reader.read_line(&mut line).await {
            Ok(0) | Err(_) => return None,
            Ok(_) => {}
        }
        if line == "\r\n" {
            return Some(head);
        }
        head.push_str(&line);
    }
}

fn content_length(head: &str) -> usize {
    head.lines()
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.trim().parse().ok())
        .unwrap_or(0)
}

/// Start a keep-alive HTTP/1.1 backend on a free port. `f` receives the raw
/// request head and returns status and body.
pub async fn start_programmable_backend<F, Fut>(f: F) -> MockBackend
where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = (u16, String)> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let stats = Arc::new(BackendStats::default());
    let f = Arc::new(f);

    let server_stats = stats.clone();
    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            server_stats.connections.fetch_add(1, Ordering::SeqCst);
            server_stats.open.fetch_add(1, Ordering::SeqCst);
            let f = f.clone();
            let stats = server_stats.clone();
            tokio::spawn(async move {
                let mut reader = BufReader::new(socket);
                while let Some(head) = read_head(&mut reader).await {
                    let mut body = vec![0u8; content_length(&head)];
                    if reader.read_exact(&mut body).await.is_err() {
                        break;
                    }

                    stats.requests.fetch_add(1, Ordering::SeqCst);
                    let active = stats.active.fetch_add(1, Ordering::SeqCst) + 1;
                    stats.peak.fetch_max(active, Ordering::SeqCst);
                    let (status, body) = f(head).await;
                    stats.active.fetch_sub(1, Ordering::SeqCst);

                    let response = format!(
                        "HTTP/1.1 {}\r\nContent-Type: text/plain; charset=UTF-8\r\nContent-Length: {}\r\n\r\n{}",
                        status_line(status),
                        body.len(),
                        body
                    );
                    if reader.get_mut().write_all(response.as_bytes()).await.is_err() {
                        break;
                    }
                }
                stats.open.fetch_sub(1, Ordering::SeqCst);
            });
        }
    });

    MockBackend { addr, stats }
}

/// Backend writing `response` verbatim after each request head, then
/// holding the connection until the peer closes it.
pub async fn start_raw_backend(response: &'static [u8]) -> MockBackend {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let stats = Arc::new(BackendStats::default());

    let server_stats = stats.clone();
    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            server_stats.connections.fetch_add(1, Ordering::SeqCst);
            server_stats.open.fetch_add(1, Ordering::SeqCst);
            let stats = server_stats.clone();
            tokio::spawn(async move {
                let mut reader = BufReader::new(socket);
                if read_head(&mut reader).await.is_some() {
                    stats.requests.fetch_add(1, Ordering::SeqCst);
                    if reader.get_mut().write_all(response).await.is_ok() {
                        let mut rest = Vec::new();
                        let _ = reader.read_to_end(&mut rest).await;
                    }
                }
                stats.open.fetch_sub(1, Ordering::SeqCst);
            });
        }
    });

    MockBackend { addr, stats }
}

/// Poll `check` every 20ms for up to two seconds.
pub async fn eventually(check: impl Fn() -> bool) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    check()
}

/// Backend answering every request with `200` and a fixed body.
pub async fn start_mock_backend(response: &'static str) -> MockBackend {
    start_programmable_backend(move |_| async move { (200, response.to_string()) }).await
}

/// Backend returning the request head it received as the body.
pub async fn start_echo_head_backend() -> MockBackend {
    start_programmable_backend(|head| async move { (200, head) }).await
}

/// An address with nothing listening on it.
pub async fn unused_addr() -> SocketAddr {
    TcpListener::bind("127.0.0.1:0")
        .await
        .unwrap()
        .local_addr()
        .unwrap()
}

/// Config for tests: ephemeral front door, no active health checks.
pub fn proxy_config(backends: &[String]) -> LbConfig {
    let mut config = LbConfig::default();
    config.listener.bind_address = "127.0.0.1:0".into();
    config.backends = backends.iter().map(|b| BackendConfig::new(b.clone())).collect();
    config.health_check.enabled = false;
    config.shutdown.grace_period_secs = 1;
    config
}

pub fn start_proxy(config: LbConfig) -> Running {
    lifecycle::start(config).unwrap()
}

pub fn client() -> reqwest::Client {
    reqwest::Client::builder().no_proxy().build().unwrap()
}
