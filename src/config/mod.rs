//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML) + CLI overrides
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → LbConfig (validated, immutable)
//!     → shared via Arc to all subsystems
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; there is no hot reload
//! - Defaults reproduce the demonstrated deployment and are all enumerated
//!   in schema.rs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;

pub use loader::{load_config, ConfigError};
pub use schema::{
    BackendConfig, ExhaustedPolicy, HealthCheckConfig, LbConfig, ListenerConfig, LogFormat,
    ObservabilityConfig, PoolConfig, ProxyConfig, RuntimeConfig, ShutdownConfig, Strategy,
    UnavailablePolicy,
};
pub use validation::{validate_config, ValidationError};
