//! Configuration schema for acceld
//!
//! Supports YAML files, environment variables with an `ACCELD_` prefix, and
//! defaults, merged in that order of precedence.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Core configuration shared by every acceld component
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Root data directory; slot stores live under `<data_root>/accelerator`
    pub data_root: PathBuf,

    /// Driver plugins reachable over the request/response transport
    #[serde(default)]
    pub plugins: Vec<PluginConfig>,

    /// Register the built-in mock driver (demo and test deployments)
    #[serde(default)]
    pub enable_mock_driver: bool,
}

/// One driver plugin entry: how to reach the driver by name
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginConfig {
    /// Driver name, as referenced by `--accel runtime@driver`
    pub name: String,

    /// Base URL of the plugin endpoint, e.g. `http://127.0.0.1:7070`
    pub endpoint: String,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (text, json)
    pub format: String,

    /// Show target in logs
    pub show_target: bool,

    /// Show thread IDs in logs
    pub show_thread_ids: bool,

    /// Show line numbers in logs
    pub show_line_numbers: bool,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            data_root: PathBuf::from("/var/lib/acceld"),
            plugins: Vec::new(),
            enable_mock_driver: false,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
            show_target: true,
            show_thread_ids: false,
            show_line_numbers: false,
        }
    }
}

impl CoreConfig {
    /// Load configuration from a specific file, layered over defaults
    pub fn load_from_file(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let builder = config::Config::builder()
            .add_source(config::Config::try_from(&Self::default())?)
            .add_source(config::File::from(path))
            .add_source(
                config::Environment::with_prefix("ACCELD")
                    .separator("__")
                    .try_parsing(true),
            );

        let parsed: Self = builder.build()?.try_deserialize()?;
        parsed.validate()?;
        Ok(parsed)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.data_root.as_os_str().is_empty() {
            return Err(crate::Error::bad_request("data_root must not be empty"));
        }
        for plugin in &self.plugins {
            if plugin.name.trim().is_empty() {
                return Err(crate::Error::bad_request("plugin name must not be empty"));
            }
            if plugin.endpoint.trim().is_empty() {
                return Err(crate::Error::bad_request(format!(
                    "plugin \"{}\": endpoint must not be empty",
                    plugin.name
                )));
            }
        }
        Ok(())
    }

    /// Resolve the endpoint configured for a driver, if any
    pub fn plugin_endpoint(&self, name: &str) -> Option<&str> {
        self.plugins
            .iter()
            .find(|p| p.name == name)
            .map(|p| p.endpoint.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        assert!(CoreConfig::default().validate().is_ok());
    }

    #[test]
    fn test_plugin_endpoint_lookup() {
        let mut cfg = CoreConfig::default();
        cfg.plugins.push(PluginConfig {
            name: "nvidia".to_string(),
            endpoint: "http://127.0.0.1:7070".to_string(),
        });
        assert_eq!(cfg.plugin_endpoint("nvidia"), Some("http://127.0.0.1:7070"));
        assert_eq!(cfg.plugin_endpoint("amd"), None);
    }

    #[test]
    fn test_validate_rejects_empty_plugin_endpoint() {
        let mut cfg = CoreConfig::default();
        cfg.plugins.push(PluginConfig {
            name: "nvidia".to_string(),
            endpoint: "".to_string(),
        });
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_load_from_yaml_file() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            file,
            "data_root: /tmp/acceld-test\nplugins:\n  - name: fpga\n    endpoint: http://localhost:7070"
        )
        .unwrap();

        let cfg = CoreConfig::load_from_file(file.path()).unwrap();
        assert_eq!(cfg.data_root, PathBuf::from("/tmp/acceld-test"));
        assert_eq!(cfg.plugin_endpoint("fpga"), Some("http://localhost:7070"));
        assert!(!cfg.enable_mock_driver);
    }
}
