//! Header manipulation for forwarded requests and responses.
//!
//! # Responsibilities
//! - Strip hop-by-hop headers in both directions
//! - Add X-Forwarded-For, X-Forwarded-Proto, X-Forwarded-Host, X-Forwarded-Port
//! - Keep or rewrite `Host`
//!
//! # Design Decisions
//! - Existing X-Forwarded-* values are replaced unless the deployment
//!   sits behind a trusted proxy (`reuse_x_forwarded`)
//! - With reuse, X-Forwarded-For is appended to; the other three keep the
//!   first hop's value

use std::net::SocketAddr;

use axum::http::header::{self, HeaderMap, HeaderName, HeaderValue};

pub const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
pub const X_FORWARDED_PROTO: HeaderName = HeaderName::from_static("x-forwarded-proto");
pub const X_FORWARDED_HOST: HeaderName = HeaderName::from_static("x-forwarded-host");
pub const X_FORWARDED_PORT: HeaderName = HeaderName::from_static("x-forwarded-port");

const HOP_BY_HOP: [&str; 9] = [
    "connection",
    "keep-alive",
    "proxy-connection",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

pub fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP.contains(&name.as_str())
}

/// Remove hop-by-hop headers, including any listed in `Connection`.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|token| HeaderName::from_bytes(token.trim().as_bytes()).ok())
        .collect();
    for name in listed {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}

/// What this hop knows about the inbound connection.
#[derive(Debug, Clone)]
pub struct ForwardedInfo {
    pub peer: SocketAddr,
    pub local: SocketAddr,
    pub proto: &'static str,
    /// Host the caller addressed (`Host` header or URI authority).
    pub host: Option<HeaderValue>,
}

/// Set the X-Forwarded-* headers for this hop.
pub fn apply_forwarded(headers: &mut HeaderMap, info: &ForwardedInfo, reuse: bool) {
    let client = info.peer.ip().to_string();
    let xff = if reuse {
        let prior: Vec<&str> = headers
            .get_all(&X_FORWARDED_FOR)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .collect();
        if prior.is_empty() {
            client
        } else {
            format!("{}, {}", prior.join(", "), client)
        }
    } else {
        client
    };
    if let Ok(value) = HeaderValue::from_str(&xff) {
        headers.insert(X_FORWARDED_FOR, value);
    }

    let mut set = |name: &HeaderName, value: Option<HeaderValue>| {
        if reuse && headers.contains_key(name) {
            return;
        }
        match value {
            Some(value) => {
                headers.insert(name.clone(), value);
            }
            None => {
                headers.remove(name);
            }
        }
    };
    set(&X_FORWARDED_PROTO, Some(HeaderValue::from_static(info.proto)));
    set(&X_FORWARDED_HOST, info.host.clone());
    set(&X_FORWARDED_PORT, Some(HeaderValue::from(info.local.port())));
}

/// Decide the outbound `Host`.
///
/// `rewrite` forces the backend authority; otherwise the caller's value is
/// kept and only filled in when missing (HTTP/2 callers send `:authority`).
pub fn apply_host(
    headers: &mut HeaderMap,
    inbound_authority: Option<&str>,
    backend_authority: &str,
    rewrite: bool,
) {
    if !rewrite && headers.contains_key(header::HOST) {
        return;
    }
    let host = if rewrite {
        backend_authority
    } else {
        inbound_authority.unwrap_or(backend_authority)
    };
    if let Ok(value) = HeaderValue::from_str(host) {
        headers.insert(header::HOST, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info() -> ForwardedInfo {
        ForwardedInfo {
            peer: "10.0.0.7:51000".parse().unwrap(),
            local: "0.0.0.0:8000".parse().unwrap(),
            proto: "http",
            host: Some(HeaderValue::from_static("lb.example")),
        }
    }

    #[test]
    fn strips_standard_and_listed_hop_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive, x-private"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        headers.insert("x-private", HeaderValue::from_static("1"));
        headers.insert(header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        headers.insert(header::ACCEPT, HeaderValue::from_static("*/*"));

        strip_hop_by_hop(&mut headers);

        assert_eq!(headers.len(), 1);
        assert!(headers.contains_key(header::ACCEPT));
    }

    #[test]
    fn replaces_forwarded_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(X_FORWARDED_FOR, HeaderValue::from_static("1.2.3.4"));
        headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("https"));

        apply_forwarded(&mut headers, &info(), false);

        assert_eq!(headers[&X_FORWARDED_FOR], "10.0.0.7");
        assert_eq!(headers[&X_FORWARDED_PROTO], "http");
        assert_eq!(headers[&X_FORWARDED_HOST], "lb.example");
        assert_eq!(headers[&X_FORWARDED_PORT], "8000");
    }

    #[test]
    fn reuse_appends_client_and_keeps_first_hop() {
        let mut headers = HeaderMap::new();
        headers.insert(X_FORWARDED_FOR, HeaderValue::from_static("1.2.3.4"));
        headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("https"));

        apply_forwarded(&mut headers, &info(), true);

        assert_eq!(headers[&X_FORWARDED_FOR], "1.2.3.4, 10.0.0.7");
        assert_eq!(headers[&X_FORWARDED_PROTO], "https");
        assert_eq!(headers[&X_FORWARDED_HOST], "lb.example");
    }

    #[test]
    fn host_kept_unless_rewritten() {
        let mut headers = HeaderMap::new();
        headers.insert(header::HOST, HeaderValue::from_static("lb.example"));
        apply_host(&mut headers, None, "127.0.0.1:8001", false);
        assert_eq!(headers[header::HOST], "lb.example");

        apply_host(&mut headers, None, "127.0.0.1:8001", true);
        assert_eq!(headers[header::HOST], "127.0.0.1:8001");
    }

    #[test]
    fn missing_host_filled_from_authority() {
        let mut headers = HeaderMap::new();
        apply_host(&mut headers, Some("lb.example:8000"), "127.0.0.1:8001", false);
        assert_eq!(headers[header::HOST], "lb.example:8000");
    }
}
