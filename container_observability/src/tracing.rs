//! Tracing subscriber setup.

use std::io;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, Layer, Registry};

use container_core::error::{Error, Result};

/// Configuration for tracing.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TracingConfig {
    /// Service name, used as the log file prefix.
    pub service_name: String,

    /// Filter directive, e.g. `info` or `container_runtime=debug`.
    pub log_level: String,

    /// Whether to enable file logging.
    pub enable_file_logging: bool,

    /// Directory for log files.
    pub log_directory: Option<PathBuf>,

    /// Whether to enable console logging.
    pub enable_console_logging: bool,

    /// Whether to enable JSON formatting.
    pub enable_json_format: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            service_name: "container".to_string(),
            log_level: "info".to_string(),
            enable_file_logging: false,
            log_directory: None,
            enable_console_logging: true,
            enable_json_format: false,
        }
    }
}

/// Handle for tracing resources.
pub struct TracingGuard {
    /// Flushes the file writer on drop.
    _file_guard: Option<tracing_appender::non_blocking::WorkerGuard>,
}

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Initialize tracing.
///
/// Fails instead of panicking when a global subscriber is already set.
pub fn init_tracing(config: TracingConfig) -> Result<TracingGuard> {
    let filter = EnvFilter::try_new(&config.log_level)
        .map_err(|e| Error::Runtime(format!("Invalid log level '{}': {}", config.log_level, e)))?;

    let mut layers: Vec<BoxedLayer> = Vec::new();

    if config.enable_console_logging {
        if config.enable_json_format {
            layers.push(tracing_subscriber::fmt::layer().json().with_writer(io::stdout).boxed());
        } else {
            layers.push(tracing_subscriber::fmt::layer().with_writer(io::stdout).boxed());
        }
    }

    let file_guard = match (&config.log_directory, config.enable_file_logging) {
        (Some(log_dir), true) => {
            std::fs::create_dir_all(log_dir).map_err(|e| {
                Error::Runtime(format!("Failed to create log directory: {}", e))
            })?;

            let file_appender =
                tracing_appender::rolling::daily(log_dir, format!("{}.log", config.service_name));
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

            if config.enable_json_format {
                layers.push(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_ansi(false)
                        .with_writer(non_blocking)
                        .boxed(),
                );
            } else {
                layers.push(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(non_blocking)
                        .boxed(),
                );
            }
            Some(guard)
        }
        _ => None,
    };

    tracing_subscriber::registry()
        .with(layers)
        .with(filter)
        .try_init()
        .map_err(|e| Error::Runtime(format!("Failed to set global subscriber: {}", e)))?;

    Ok(TracingGuard {
        _file_guard: file_guard,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_bad_filter() {
        let config = TracingConfig {
            log_level: "not a [valid filter".to_string(),
            ..TracingConfig::default()
        };
        assert!(matches!(init_tracing(config), Err(Error::Runtime(_))));
    }

    #[test]
    fn test_second_init_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let config = TracingConfig {
            enable_console_logging: false,
            enable_file_logging: true,
            log_directory: Some(dir.path().join("logs")),
            ..TracingConfig::default()
        };

        // The first call may lose to another test that already installed a
        // subscriber; the second one can never succeed.
        let _first = init_tracing(config.clone());
        assert!(dir.path().join("logs").is_dir());
        assert!(init_tracing(config).is_err());
    }
}
