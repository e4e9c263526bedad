//! Process lifecycle.
//!
//! ```text
//! start:    validate → metrics exporter → registry + pool → bind → accept loop
//! stop:     signal → stop accepting → drain (grace period) → close idle upstreams
//! ```

pub mod shutdown;
pub mod signals;
pub mod startup;

pub use shutdown::Shutdown;
pub use signals::{shutdown_signal, spawn_signal_handler};
pub use startup::{build_runtime, start, start_server, Running, StartupError};
