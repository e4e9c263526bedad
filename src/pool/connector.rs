//! Opening outbound connections.
//!
//! The pool only knows the [`Connector`] trait; the production
//! [`HttpConnector`] dials TCP and runs a hyper client handshake, speaking
//! HTTP/1.1 or HTTP/2 with prior knowledge.

use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use hyper::client::conn::{http1, http2};
use hyper_util::rt::{TokioExecutor, TokioIo};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;

use crate::config::PoolConfig;
use crate::load_balancer::Backend;
use crate::pool::connection::UpstreamSender;

/// Error type for opening a backend connection.
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("connect timed out after {0:?}")]
    Timeout(Duration),
    #[error("connect failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("handshake failed: {0}")]
    Handshake(#[from] hyper::Error),
}

/// A freshly opened transport: the request half and the task driving the connection.
#[derive(Debug)]
pub struct Upstream {
    pub sender: UpstreamSender,
    pub driver: JoinHandle<()>,
}

/// Opens transports to backends.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, backend: &Backend) -> Result<Upstream, ConnectError>;
}

/// TCP + hyper client handshake.
#[derive(Debug, Clone)]
pub struct HttpConnector {
    connect_timeout: Duration,
    http2: bool,
}

impl HttpConnector {
    pub fn new(connect_timeout: Duration, http2: bool) -> Self {
        Self {
            connect_timeout,
            http2,
        }
    }

    pub fn from_config(config: &PoolConfig) -> Self {
        Self::new(config.connect_timeout(), config.backend_http2)
    }
}

#[async_trait]
impl Connector for HttpConnector {
    async fn connect(&self, backend: &Backend) -> Result<Upstream, ConnectError> {
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(backend.authority()))
            .await
            .map_err(|_| ConnectError::Timeout(self.connect_timeout))??;
        stream.set_nodelay(true)?;

        tracing::debug!(backend = %backend.id, http2 = self.http2, "Opened backend connection");
        handshake(stream, self.http2).await
    }
}

/// Run the client handshake over any byte stream and spawn its driver task.
pub async fn handshake<T>(io: T, http2: bool) -> Result<Upstream, ConnectError>
where
    T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let io = TokioIo::new(io);
    if http2 {
        let (sender, connection) = http2::handshake(TokioExecutor::new(), io).await?;
        let driver = tokio::spawn(async move {
            if let Err(err) = connection.await {
                tracing::debug!(error = %err, "Backend connection closed with error");
            }
        });
        Ok(Upstream {
            sender: UpstreamSender::Http2(sender),
            driver,
        })
    } else {
        let (sender, connection) = http1::handshake::<_, Body>(io).await?;
        let driver = tokio::spawn(async move {
            if let Err(err) = connection.await {
                tracing::debug!(error = %err, "Backend connection closed with error");
            }
        });
        Ok(Upstream {
            sender: UpstreamSender::Http1(sender),
            driver,
        })
    }
}
