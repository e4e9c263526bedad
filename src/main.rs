//! lb-proxy: least-connections HTTP load balancer.
//!
//! Starts with the demonstrated deployment (front door `0.0.0.0:8000`, one
//! backend `http://127.0.0.1:8001/`) unless a config file is given.

use std::path::PathBuf;

use clap::Parser;

use lb_proxy::config::{loader, validate_config, BackendConfig, ConfigError, LbConfig};
use lb_proxy::lifecycle::{self, Shutdown};
use lb_proxy::observability::logging;

#[derive(Parser, Debug)]
#[command(name = "lb-proxy")]
#[command(about = "Least-connections HTTP load balancer", long_about = None)]
struct Cli {
    /// TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Front-door bind address, overrides `listener.bind_address`.
    #[arg(short, long)]
    bind: Option<String>,

    /// Backend base URL; repeat for several. Replaces the configured list.
    #[arg(long = "backend")]
    backends: Vec<String>,
}

impl Cli {
    fn into_config(self) -> Result<LbConfig, ConfigError> {
        let mut config = match &self.config {
            Some(path) => loader::read_config(path)?,
            None => LbConfig::demonstrated(),
        };
        if let Some(bind) = self.bind {
            config.listener.bind_address = bind;
        }
        if !self.backends.is_empty() {
            config.backends = self.backends.into_iter().map(BackendConfig::new).collect();
        }
        validate_config(&config).map_err(ConfigError::Validation)?;
        Ok(config)
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Cli::parse().into_config()?;
    logging::init_logging(&config.observability)?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        bind_address = %config.listener.bind_address,
        backends = config.backends.len(),
        worker_count = config.runtime.worker_count,
        io_threads = config.runtime.io_threads,
        max_request_time_ms = config.proxy.max_request_time_ms,
        "Configuration loaded"
    );

    let runtime = lifecycle::build_runtime(&config.runtime)?;
    runtime.block_on(async move {
        let running = lifecycle::start(config)?;
        let shutdown: Shutdown = running.shutdown().clone();
        lifecycle::spawn_signal_handler(shutdown);
        running.wait().await
    })?;

    tracing::info!("Shutdown complete");
    Ok(())
}
