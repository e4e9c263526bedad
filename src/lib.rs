//! Least-connections HTTP load balancer.
//!
//! ```text
//!  client ──▶ net::Listener ──▶ http::HttpServer ──▶ http::ProxyHandler
//!                                                        │
//!                               load_balancer::Dispatcher│(least leased connections)
//!                                                        ▼
//!                                             pool::ConnectionPool ──▶ backend
//! ```
//!
//! Cross-cutting: `config`, `health`, `observability`, `resilience`, `lifecycle`.

pub mod config;
pub mod health;
pub mod http;
pub mod lifecycle;
pub mod load_balancer;
pub mod net;
pub mod observability;
pub mod pool;
pub mod resilience;

pub use config::schema::LbConfig;
pub use http::{HttpServer, ProxyHandler};
pub use lifecycle::{Running, Shutdown};
pub use load_balancer::{Backend, BackendRegistry};
pub use pool::ConnectionPool;
