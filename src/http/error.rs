//! Errors a proxied request can end in, and their status codes.

use std::time::Duration;

use axum::body::Body;
use axum::http::{header, HeaderValue, Response, StatusCode};
use axum::response::IntoResponse;

use crate::pool::{ConnectError, PoolError};

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("could not connect to backend {backend}: {source}")]
    ConnectFailed {
        backend: String,
        #[source]
        source: ConnectError,
    },
    #[error("all candidate backends are at connection capacity")]
    PoolExhausted,
    #[error("no backend available")]
    Unavailable,
    #[error("request exceeded {0:?}")]
    Timeout(Duration),
    #[error("backend {backend} failed mid-request: {source}")]
    UpstreamProtocolError {
        backend: String,
        #[source]
        source: hyper::Error,
    },
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl ProxyError {
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::ConnectFailed { .. } => StatusCode::BAD_GATEWAY,
            ProxyError::PoolExhausted => StatusCode::SERVICE_UNAVAILABLE,
            ProxyError::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
            ProxyError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            ProxyError::UpstreamProtocolError { .. } => StatusCode::BAD_GATEWAY,
            ProxyError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        }
    }

    /// Short label for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            ProxyError::ConnectFailed { .. } => "connect_failed",
            ProxyError::PoolExhausted => "pool_exhausted",
            ProxyError::Unavailable => "unavailable",
            ProxyError::Timeout(_) => "timeout",
            ProxyError::UpstreamProtocolError { .. } => "upstream_protocol_error",
            ProxyError::InvalidRequest(_) => "invalid_request",
        }
    }

    /// Plain-text error response naming the request id.
    pub fn to_response(&self, request_id: &str) -> Response<Body> {
        let status = self.status();
        let reason = status.canonical_reason().unwrap_or("Error");
        let body = format!("{} {}: {} (request id {})\n", status.as_u16(), reason, self, request_id);

        let mut response = Response::new(Body::from(body));
        *response.status_mut() = status;
        response.headers_mut().insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/plain; charset=utf-8"),
        );
        response
    }
}

impl From<PoolError> for ProxyError {
    fn from(err: PoolError) -> Self {
        match err {
            PoolError::Busy { .. } => ProxyError::PoolExhausted,
            PoolError::ConnectFailed { backend, source } => {
                ProxyError::ConnectFailed { backend, source }
            }
            PoolError::NoBackends => ProxyError::Unavailable,
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> axum::response::Response {
        self.to_response("unknown")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert_eq!(ProxyError::Unavailable.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(ProxyError::PoolExhausted.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            ProxyError::Timeout(Duration::from_secs(30)).status(),
            StatusCode::GATEWAY_TIMEOUT
        );
        let refused = ProxyError::ConnectFailed {
            backend: "b1".into(),
            source: ConnectError::Timeout(Duration::from_secs(5)),
        };
        assert_eq!(refused.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(refused.kind(), "connect_failed");
    }

    #[tokio::test]
    async fn response_carries_request_id() {
        let response = ProxyError::Unavailable.to_response("abc-123");
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("abc-123"));
        assert!(text.starts_with("503 Service Unavailable"));
    }
}
