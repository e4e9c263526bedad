//! Configuration loading from disk.

use std::fs;
use std::path::Path;

use crate::config::schema::LbConfig;
use crate::config::validation::{validate_config, ValidationError};

/// Error type for configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Validation failed: {}", join_errors(.0))]
    Validation(Vec<ValidationError>),
}

fn join_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Parse a TOML document without semantic validation.
pub fn parse_config(content: &str) -> Result<LbConfig, ConfigError> {
    Ok(toml::from_str(content)?)
}

/// Read a TOML file without semantic validation (CLI overrides come next).
pub fn read_config(path: &Path) -> Result<LbConfig, ConfigError> {
    let content = fs::read_to_string(path)?;
    parse_config(&content)
}

/// Load and validate configuration from a TOML file.
pub fn load_config(path: &Path) -> Result<LbConfig, ConfigError> {
    let config = read_config(path)?;
    validate_config(&config).map_err(ConfigError::Validation)?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_temp(name: &str, content: &str) -> std::path::PathBuf {
        let path = std::env::temp_dir().join(format!("lb-proxy-{}-{name}", std::process::id()));
        fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn loads_valid_file() {
        let path = write_temp(
            "valid.toml",
            r#"
            [listener]
            bind_address = "127.0.0.1:18000"

            [pool]
            max_connections_per_backend = 4

            [[backends]]
            name = "echo"
            address = "http://127.0.0.1:8001/"
            "#,
        );

        let config = load_config(&path).unwrap();
        assert_eq!(config.listener.bind_address, "127.0.0.1:18000");
        assert_eq!(config.pool.max_connections_per_backend, 4);
        assert_eq!(config.backends[0].name.as_deref(), Some("echo"));
        let _ = fs::remove_file(path);
    }

    #[test]
    fn reports_validation_failures() {
        let path = write_temp("invalid.toml", "[proxy]\nfailure_threshold = 0\n");

        match load_config(&path) {
            Err(ConfigError::Validation(errors)) => {
                assert!(errors.iter().any(|e| e.field == "proxy.failure_threshold"));
                assert!(errors.iter().any(|e| e.field == "backends"));
            }
            other => panic!("expected validation error, got {other:?}"),
        }
        let _ = fs::remove_file(path);
    }

    #[test]
    fn reports_parse_and_io_failures() {
        assert!(matches!(parse_config("[pool\n"), Err(ConfigError::Parse(_))));
        assert!(matches!(
            load_config(Path::new("/definitely/not/here.toml")),
            Err(ConfigError::Io(_))
        ));
    }
}
