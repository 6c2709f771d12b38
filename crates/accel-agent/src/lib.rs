//! # accel-agent
//!
//! The daemon-side half of acceld: binds accelerator slots to container
//! lifecycles and exposes the HTTP surface.
//!
//! This crate provides:
//!
//! - The container model carrying accelerator requests and the three
//!   injected maps (`accel_bindings`, `accel_devices`, `accel_environments`)
//! - The binding layer driven by container create/start/stop/remove/update
//! - The mount merger that reconciles overlapping driver-supplied mounts
//! - The axum HTTP router over the controller operations
//! - The `acceld` daemon binary

pub mod binding;
pub mod config;
pub mod container;
pub mod http;
pub mod mounts;

pub use config::AgentConfig;
pub use container::Container;

/// Result type for agent operations
pub type Result<T> = std::result::Result<T, AgentError>;

/// Errors that can occur in the binding layer and HTTP surface
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Mount/device/environment merging error
    #[error("{0}")]
    Mount(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Controller error
    #[error("{0}")]
    Controller(#[from] accel_controller::ControllerError),

    /// Core error
    #[error("{0}")]
    Core(#[from] accel_core::Error),
}

impl From<AgentError> for accel_core::Error {
    fn from(err: AgentError) -> Self {
        match err {
            AgentError::Config(msg) => accel_core::Error::bad_request(msg),
            AgentError::Mount(msg) => accel_core::Error::bad_request(msg),
            AgentError::Io(e) => accel_core::Error::Io(e),
            AgentError::Serialization(e) => accel_core::Error::Json(e),
            AgentError::Controller(e) => e.into(),
            AgentError::Core(e) => e,
        }
    }
}

/// Initialize logging and tracing from the agent configuration
pub fn init_logging(logging: &accel_core::LoggingConfig) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&logging.level));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(logging.show_target)
        .with_thread_ids(logging.show_thread_ids)
        .with_line_number(logging.show_line_numbers);

    match logging.format.as_str() {
        "json" => subscriber.json().init(),
        _ => subscriber.init(),
    }

    Ok(())
}
