//! Tracing subscriber setup for binaries and tools embedding the index.

use crate::config::{ConfigError, LoggingConfig};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install a global subscriber from `config`.
///
/// `RUST_LOG` takes precedence over the configured level. Fails if a global
/// subscriber is already installed.
pub fn init_logging(config: &LoggingConfig) -> Result<(), ConfigError> {
    let filter = match std::env::var("RUST_LOG") {
        Ok(directives) => EnvFilter::try_new(directives),
        Err(_) => EnvFilter::try_new(&config.level),
    }
    .map_err(|e| ConfigError::Logging(e.to_string()))?;

    let registry = tracing_subscriber::registry().with(filter);
    let result = match config.format.as_str() {
        "json" => registry.with(fmt::layer().json()).try_init(),
        "pretty" => registry.with(fmt::layer()).try_init(),
        other => {
            return Err(ConfigError::Invalid(format!(
                "unknown log format {:?}",
                other
            )))
        }
    };
    result.map_err(|e| ConfigError::Logging(e.to_string()))?;

    tracing::debug!(level = %config.level, format = %config.format, "Logging initialised");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_unknown_format() {
        let config = LoggingConfig {
            level: "info".to_string(),
            format: "xml".to_string(),
        };
        assert!(matches!(
            init_logging(&config),
            Err(ConfigError::Invalid(_)) | Err(ConfigError::Logging(_))
        ));
    }

    #[test]
    fn test_second_init_fails() {
        let config = LoggingConfig::default();
        // Another test may already own the global subscriber
        let _ = init_logging(&config);
        assert!(matches!(init_logging(&config), Err(ConfigError::Logging(_))));
    }
}
