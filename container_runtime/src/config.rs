//! Configuration for the container.
//!
//! This module provides configuration management for the container,
//! including loading and saving configuration from files.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use container_concurrency::PoolConfig;
use container_core::error::{ConfigError, Error, Result};
use container_core::types::{AccessTimeout, ComponentKind, ConcurrencyManagement};

/// Deployment metadata of one component.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentDescriptor {
    /// Unique name within the container.
    pub name: String,

    /// Concurrency model.
    pub kind: ComponentKind,

    /// Create a singleton when the component starts instead of on first
    /// call.
    #[serde(default)]
    pub startup: bool,

    /// Who synchronizes a singleton.
    #[serde(default)]
    pub concurrency: ConcurrencyManagement,

    /// Pool settings, overriding the container default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pool: Option<PoolConfig>,

    /// Access timeout for methods that do not declare one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_timeout: Option<AccessTimeout>,

    /// Fault kinds reported as application failures.
    #[serde(default)]
    pub application_exceptions: Vec<String>,

    /// Match application exceptions against the whole cause chain.
    #[serde(default)]
    pub inherited_exceptions: bool,
}

impl ComponentDescriptor {
    /// Describe a component with default settings.
    pub fn new(name: impl Into<String>, kind: ComponentKind) -> Self {
        Self {
            name: name.into(),
            kind,
            startup: false,
            concurrency: ConcurrencyManagement::default(),
            pool: None,
            access_timeout: None,
            application_exceptions: Vec::new(),
            inherited_exceptions: false,
        }
    }

    /// Check the descriptor on its own.
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if let Some(pool) = &self.pool {
            pool.validate()?;
        }
        Ok(())
    }
}

/// Configuration for the container.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ContainerConfig {
    /// Pool settings for components without their own.
    #[serde(default)]
    pub default_pool: PoolConfig,

    /// Access timeout for components and methods without their own.
    #[serde(default)]
    pub default_access_timeout: AccessTimeout,

    /// Push a correlation id around every call.
    #[serde(default = "default_true")]
    pub invocation_ids: bool,

    /// Dispatch begin/end/error events.
    #[serde(default = "default_true")]
    pub emit_events: bool,

    /// Components known to the container.
    #[serde(default)]
    pub components: Vec<ComponentDescriptor>,

    /// Whether to enable observability.
    #[serde(default)]
    pub enable_observability: bool,

    /// Log level for tracing.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Whether to enable file logging.
    #[serde(default)]
    pub enable_file_logging: bool,

    /// Directory for log files.
    #[serde(default)]
    pub log_directory: Option<PathBuf>,

    /// Whether to enable console logging.
    #[serde(default = "default_true")]
    pub enable_console_logging: bool,

    /// Whether to enable JSON formatting for logs.
    #[serde(default)]
    pub enable_json_format: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            default_pool: PoolConfig::default(),
            default_access_timeout: AccessTimeout::default(),
            invocation_ids: true,
            emit_events: true,
            components: Vec::new(),
            enable_observability: false,
            log_level: default_log_level(),
            enable_file_logging: false,
            log_directory: None,
            enable_console_logging: true,
            enable_json_format: false,
        }
    }
}

impl ContainerConfig {
    /// Look up a component descriptor by name.
    pub fn component(&self, name: &str) -> Option<&ComponentDescriptor> {
        self.components.iter().find(|c| c.name == name)
    }

    /// Check pool bounds and descriptors.
    pub fn validate(&self) -> Result<()> {
        self.default_pool.validate()?;
        for component in &self.components {
            component.validate()?;
        }
        Ok(())
    }
}

/// Load configuration from a file.
pub fn load_config(path: &Path) -> Result<ContainerConfig> {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("toml");

    let content = std::fs::read_to_string(path)?;

    let config: ContainerConfig = match ext {
        "toml" => toml::from_str(&content)
            .map_err(|e| ConfigError::Parse(format!("TOML: {}", e)))?,
        "yaml" | "yml" => serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::Parse(format!("YAML: {}", e)))?,
        "json" => serde_json::from_str(&content)
            .map_err(|e| ConfigError::Parse(format!("JSON: {}", e)))?,
        _ => return Err(ConfigError::UnsupportedFormat(ext.to_string()).into()),
    };

    config.validate()?;
    Ok(config)
}

/// Save configuration to a file.
pub fn save_config(config: &ContainerConfig, path: &Path) -> Result<()> {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("toml");

    let content = match ext {
        "toml" => toml::to_string_pretty(config)
            .map_err(|e| ConfigError::Serialize(format!("TOML: {}", e)))?,
        "yaml" | "yml" => serde_yaml::to_string(config)
            .map_err(|e| ConfigError::Serialize(format!("YAML: {}", e)))?,
        "json" => serde_json::to_string_pretty(config)
            .map_err(|e| ConfigError::Serialize(format!("JSON: {}", e)))?,
        _ => return Err(Error::Config(ConfigError::UnsupportedFormat(ext.to_string()))),
    };

    std::fs::write(path, content)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use container_core::types::TimeUnit;

    fn sample() -> ContainerConfig {
        let mut cart = ComponentDescriptor::new("cart", ComponentKind::Stateful);
        cart.access_timeout = Some(AccessTimeout::new(5, TimeUnit::Seconds).unwrap());
        cart.application_exceptions = vec!["OutOfStock".to_string()];

        let mut catalog = ComponentDescriptor::new("catalog", ComponentKind::Singleton);
        catalog.startup = true;

        ContainerConfig {
            default_pool: PoolConfig {
                max_instances: 4,
                wait_timeout_ms: None,
                ..PoolConfig::default()
            },
            components: vec![cart, catalog],
            ..ContainerConfig::default()
        }
    }

    #[test]
    fn test_round_trip_all_formats() {
        let dir = tempfile::tempdir().unwrap();
        let config = sample();

        for file in ["container.toml", "container.yaml", "container.json"] {
            let path = dir.path().join(file);
            save_config(&config, &path).unwrap();
            let loaded = load_config(&path).unwrap();

            assert_eq!(loaded.default_pool, config.default_pool);
            assert_eq!(loaded.components, config.components);
            assert_eq!(loaded.default_access_timeout, AccessTimeout::INDEFINITE);
        }
    }

    #[test]
    fn test_unsupported_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("container.ini");
        assert_matches!(
            save_config(&ContainerConfig::default(), &path),
            Err(Error::Config(ConfigError::UnsupportedFormat(ext))) if ext == "ini"
        );
    }

    #[test]
    fn test_partial_file_uses_defaults_and_validates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("container.toml");

        std::fs::write(
            &path,
            "log_level = \"debug\"\n[default_access_timeout]\nvalue = 250\n",
        )
        .unwrap();
        let config = load_config(&path).unwrap();
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.default_access_timeout, AccessTimeout::millis(250));
        assert!(config.emit_events);

        std::fs::write(&path, "[default_pool]\nmin_instances = 5\nmax_instances = 2\n").unwrap();
        assert_matches!(
            load_config(&path),
            Err(Error::Config(ConfigError::InvalidPoolBounds { min: 5, max: 2 }))
        );
    }

    #[test]
    fn test_component_lookup() {
        let config = sample();
        assert!(config.component("catalog").unwrap().startup);
        assert!(config.component("missing").is_none());
    }
}
