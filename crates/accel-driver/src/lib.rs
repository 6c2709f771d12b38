//! # accel-driver
//!
//! Driver plugin protocol for acceld.
//!
//! Every accelerator family is managed by an out-of-process driver plugin
//! reached over a JSON request/response transport. This crate provides:
//!
//! - The wire envelopes and stable error codes of the plugin protocol
//! - The `AcceleratorDriver` trait every driver (remote or in-process)
//!   implements, and the `DriverCallback` seam back into the controller
//! - `RemoteDriver`, the transport-level proxy with the sequence-number
//!   resync handshake
//! - `DriverRegistry`, the table of loaded drivers and their capabilities
//! - `MockDriver`, an in-process driver for tests and demo deployments

use thiserror::Error;

pub mod api;
pub mod driver;
pub mod mock;
pub mod proxy;
pub mod registry;

pub use api::DRIVER_ENDPOINT_TYPE;
pub use driver::{AcceleratorDriver, Capability, DriverCallback};
pub use mock::MockDriver;
pub use proxy::{HttpPluginEndpoint, PluginEndpoint, RemoteDriver};
pub use registry::DriverRegistry;

/// Result type for driver operations
pub type Result<T> = std::result::Result<T, DriverError>;

/// Errors that can occur while talking to a driver
#[derive(Error, Debug)]
pub enum DriverError {
    /// The driver does not implement the requested method
    #[error("Driver does not implement the requested method")]
    NotImplemented,

    /// Driver and daemon disagree on the sequence number; resync required
    #[error("Driver out of sync")]
    NotSync,

    /// The driver has no slot with the given id
    #[error("No such slot: {0}")]
    NoSuchSlot(String),

    /// The driver has no device backing the request
    #[error("No device: {0}")]
    NoDevice(String),

    /// The request was rejected by the driver as malformed
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// The driver cannot provide the requested service
    #[error("No service: {0}")]
    NoService(String),

    /// A driver with this name is already registered
    #[error("Driver \"{0}\" is already registered")]
    ActiveRegistration(String),

    /// The plugin endpoint could not be reached
    #[error("Transport error: {0}")]
    Transport(String),

    /// The plugin call exceeded its deadline
    #[error("Plugin call timed out: {0}")]
    Timeout(String),

    /// Generic error reported by the remote driver
    #[error("remote: {0}")]
    Remote(String),

    /// Envelope (de)serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Core error
    #[error("Core error: {0}")]
    Core(#[from] accel_core::Error),
}

impl From<DriverError> for accel_core::Error {
    fn from(err: DriverError) -> Self {
        match err {
            DriverError::NotImplemented => {
                accel_core::Error::not_implemented("driver method not implemented")
            }
            DriverError::NotSync => accel_core::Error::internal("driver out of sync"),
            DriverError::NoSuchSlot(msg) => {
                accel_core::Error::not_found(format!("No such slot: {}", msg))
            }
            DriverError::NoDevice(msg) => {
                accel_core::Error::no_service(format!("No device: {}", msg))
            }
            DriverError::BadRequest(msg) => accel_core::Error::bad_request(msg),
            DriverError::NoService(msg) => accel_core::Error::no_service(msg),
            DriverError::ActiveRegistration(name) => {
                accel_core::Error::forbidden(format!("Driver \"{}\" is already registered", name))
            }
            DriverError::Transport(msg) => accel_core::Error::no_service(msg),
            DriverError::Timeout(msg) => accel_core::Error::timeout(msg),
            DriverError::Remote(msg) => accel_core::Error::internal(format!("remote: {}", msg)),
            DriverError::Serialization(e) => accel_core::Error::Json(e),
            DriverError::Core(e) => e,
        }
    }
}
