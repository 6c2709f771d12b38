//! Configuration for the acceld daemon

use crate::Result;
use accel_core::{CoreConfig, LoggingConfig};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;

/// Complete configuration for the acceld daemon
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Core configuration (data root, driver plugins)
    #[serde(flatten)]
    pub core: CoreConfig,

    /// HTTP surface configuration
    pub http: HttpConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// HTTP surface configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpConfig {
    /// Bind address for the REST API
    pub listen: SocketAddr,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            core: CoreConfig::default(),
            http: HttpConfig {
                listen: "127.0.0.1:2380".parse().expect("static default address"),
            },
            logging: LoggingConfig::default(),
        }
    }
}

impl AgentConfig {
    /// Load configuration from a YAML file, layered over defaults and
    /// `ACCELD_`-prefixed environment variables
    pub fn load_from_file(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let builder = config::Config::builder()
            .add_source(config::Config::try_from(&Self::default()).map_err(core_err)?)
            .add_source(config::File::from(path))
            .add_source(
                config::Environment::with_prefix("ACCELD")
                    .separator("__")
                    .try_parsing(true),
            );

        let parsed: Self = builder
            .build()
            .map_err(core_err)?
            .try_deserialize()
            .map_err(core_err)?;
        parsed.validate()?;
        Ok(parsed)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.core.validate()?;
        Ok(())
    }

    /// Directory holding per-container state
    pub fn containers_dir(&self) -> PathBuf {
        self.core.data_root.join("containers")
    }
}

fn core_err(err: config::ConfigError) -> crate::AgentError {
    crate::AgentError::Core(accel_core::Error::Config(err))
}
