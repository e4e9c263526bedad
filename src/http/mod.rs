//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! TCP connection
//!     → server.rs (hyper auto protocol detection, worker pool, request ID)
//!     → proxy.rs (dispatch, lease, forward, stream response)
//!     → headers.rs (hop-by-hop removal, X-Forwarded-*, Host)
//!     → error.rs (failures mapped to 502/503/504)
//!     → Send to client
//! ```

pub mod error;
pub mod headers;
pub mod proxy;
pub mod server;

pub use error::ProxyError;
pub use proxy::{ConnectionInfo, LeasedBody, ProxyHandler, RequestState, X_REQUEST_ID};
pub use server::{HttpServer, ServerError};
