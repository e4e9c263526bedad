//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (timeouts > 0, capacities > 0)
//! - Check backend URLs are plain `http` with a host
//! - Detect duplicate backend identities
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: LbConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::collections::HashSet;
use std::net::SocketAddr;

use crate::config::schema::LbConfig;
use crate::load_balancer::backend::backend_identity;

/// A single semantic problem in the configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{field}: {message}")]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Validate a parsed configuration.
pub fn validate_config(config: &LbConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.listener.bind_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::new(
            "listener.bind_address",
            format!("'{}' is not a socket address", config.listener.bind_address),
        ));
    }
    if config.listener.backlog == 0 {
        errors.push(ValidationError::new("listener.backlog", "must be greater than 0"));
    }
    if config.listener.max_inbound_connections == 0 {
        errors.push(ValidationError::new(
            "listener.max_inbound_connections",
            "must be greater than 0",
        ));
    }

    if config.runtime.worker_count == 0 {
        errors.push(ValidationError::new("runtime.worker_count", "must be greater than 0"));
    }
    if config.runtime.io_threads == 0 {
        errors.push(ValidationError::new("runtime.io_threads", "must be greater than 0"));
    }

    if config.backends.is_empty() {
        errors.push(ValidationError::new("backends", "at least one backend is required"));
    }
    let mut seen = HashSet::new();
    for (i, backend) in config.backends.iter().enumerate() {
        let field = format!("backends[{i}]");
        match backend_identity(backend.name.as_deref(), &backend.address) {
            Ok(id) => {
                if !seen.insert(id.clone()) {
                    errors.push(ValidationError::new(
                        field.clone(),
                        format!("duplicate backend '{id}'"),
                    ));
                }
            }
            Err(e) => errors.push(ValidationError::new(format!("{field}.address"), e.to_string())),
        }
        if config.max_connections_for(backend) == 0 {
            errors.push(ValidationError::new(
                format!("{field}.max_connections"),
                "must be greater than 0",
            ));
        }
    }

    if config.pool.max_connections_per_backend == 0 {
        errors.push(ValidationError::new(
            "pool.max_connections_per_backend",
            "must be greater than 0",
        ));
    }
    if config.pool.sweep_interval_ms == 0 {
        errors.push(ValidationError::new("pool.sweep_interval_ms", "must be greater than 0"));
    }
    if config.pool.connect_timeout_ms == 0 {
        errors.push(ValidationError::new("pool.connect_timeout_ms", "must be greater than 0"));
    }

    if config.proxy.max_request_time_ms == 0 {
        errors.push(ValidationError::new("proxy.max_request_time_ms", "must be greater than 0"));
    }
    if config.proxy.failure_threshold == 0 {
        errors.push(ValidationError::new("proxy.failure_threshold", "must be greater than 0"));
    }

    if config.health_check.enabled {
        if config.health_check.interval_secs == 0 {
            errors.push(ValidationError::new(
                "health_check.interval_secs",
                "must be greater than 0",
            ));
        }
        if config.health_check.timeout_secs == 0 {
            errors.push(ValidationError::new(
                "health_check.timeout_secs",
                "must be greater than 0",
            ));
        }
        if config.health_check.healthy_threshold == 0 {
            errors.push(ValidationError::new(
                "health_check.healthy_threshold",
                "must be greater than 0",
            ));
        }
        if !config.health_check.path.starts_with('/') {
            errors.push(ValidationError::new("health_check.path", "must start with '/'"));
        }
    }

    if config.observability.metrics_enabled
        && config.observability.metrics_address.parse::<SocketAddr>().is_err()
    {
        errors.push(ValidationError::new(
            "observability.metrics_address",
            format!("'{}' is not a socket address", config.observability.metrics_address),
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
