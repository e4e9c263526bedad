//! In-memory connector for pool tests.

use std::convert::Infallible;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, Response};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;

use crate::load_balancer::Backend;
use crate::pool::connector::{handshake, ConnectError, Connector, Upstream};

/// Serves every connection from a hyper server on the other end of a
/// `tokio::io::duplex` pipe. Each request gets `200 ok`.
#[derive(Debug, Default)]
pub(crate) struct DuplexConnector {
    connects: AtomicUsize,
    failing: AtomicBool,
}

impl DuplexConnector {
    pub(crate) fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub(crate) fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl Connector for DuplexConnector {
    async fn connect(&self, _backend: &Backend) -> Result<Upstream, ConnectError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(ConnectError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "refused",
            )));
        }
        self.connects.fetch_add(1, Ordering::SeqCst);

        let (client, server) = tokio::io::duplex(64 * 1024);
        tokio::spawn(async move {
            let service = service_fn(|_req: Request<Incoming>| async {
                Ok::<_, Infallible>(Response::new(Body::from("ok")))
            });
            let _ = http1::Builder::new()
                .serve_connection(TokioIo::new(server), service)
                .await;
        });
        handshake(client, false).await
    }
}
