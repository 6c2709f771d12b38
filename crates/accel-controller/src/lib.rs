//! # accel-controller
//!
//! The daemon-local authority over accelerator slots.
//!
//! The controller owns the slot namespace: it allocates and releases slots,
//! resolves lookups by name/id/prefix, enforces the scope rules, persists
//! every state change through CAS writes to the scoped KV stores, and keeps
//! the plugin-side slot tables consistent with its own records across
//! daemon and plugin restarts.
//!
//! Concurrency model: per-slot fields are guarded by a per-slot mutex and
//! cross-slot operations take no global lock. All serialisation goes through
//! compare-and-swap on the KV store, unique id generation, and the
//! single-owner rule for container-scoped slots.

use thiserror::Error;

pub mod controller;
pub mod reconcile;
pub mod slot;

pub use controller::Controller;
pub use reconcile::CleanupSummary;
pub use slot::{Slot, SlotRecord};

/// Result type for controller operations
pub type Result<T> = std::result::Result<T, ControllerError>;

/// Errors that can occur during controller operations
#[derive(Error, Debug)]
pub enum ControllerError {
    /// A slot query found no result
    #[error("No such slot: {0}")]
    NoSuchSlot(String),

    /// A query-by-id was invoked with an invalid id
    #[error("Invalid accelerator slot ID: \"{0}\"")]
    InvalidId(String),

    /// A create or query-by-name was invoked with an invalid name
    #[error("Invalid name: {0}")]
    InvalidName(String),

    /// A global slot with the same name already exists
    #[error("Slot with name {0} already exists")]
    SlotNameExists(String),

    /// An id prefix matched more than one slot
    #[error("Slot ID prefix \"{0}\" is ambiguous")]
    AmbiguousPrefix(String),

    /// An invalid driver name was passed
    #[error("Invalid driver bound to accelerator: \"{0}\"")]
    InvalidDriver(String),

    /// The requested runtime is not supported by any loaded driver
    #[error("runtime \"{0}\" not supported")]
    RuntimeNotSupported(String),

    /// Releasing an unhealthy slot without force
    #[error("Remove a {state} slot {id} needs \"force\"")]
    UnhealthyRemoval { state: &'static str, id: String },

    /// Releasing a global slot that still has an owner
    #[error("slot {id} is in use by container {owner}")]
    SlotInUse { id: String, owner: String },

    /// Store error
    #[error("Store error: {0}")]
    Store(#[from] accel_store::StoreError),

    /// Driver error
    #[error("Driver error: {0}")]
    Driver(#[from] accel_driver::DriverError),

    /// Core error
    #[error("Core error: {0}")]
    Core(#[from] accel_core::Error),
}

impl From<ControllerError> for accel_core::Error {
    fn from(err: ControllerError) -> Self {
        match err {
            ControllerError::NoSuchSlot(name) => {
                accel_core::Error::not_found(format!("No such slot: {}", name))
            }
            ControllerError::InvalidId(id) => {
                accel_core::Error::bad_request(format!("Invalid accelerator slot ID: \"{}\"", id))
            }
            ControllerError::InvalidName(name) => {
                accel_core::Error::bad_request(format!("Invalid name: {}", name))
            }
            ControllerError::SlotNameExists(name) => {
                accel_core::Error::forbidden(format!("Slot with name {} already exists", name))
            }
            ControllerError::AmbiguousPrefix(prefix) => {
                accel_core::Error::bad_request(format!("Slot ID prefix \"{}\" is ambiguous", prefix))
            }
            ControllerError::InvalidDriver(name) => {
                accel_core::Error::bad_request(format!("Invalid driver bound to accelerator: \"{}\"", name))
            }
            ControllerError::RuntimeNotSupported(rt) => {
                accel_core::Error::not_found(format!("runtime \"{}\" not supported", rt))
            }
            err @ ControllerError::UnhealthyRemoval { .. } => {
                accel_core::Error::forbidden(err.to_string())
            }
            err @ ControllerError::SlotInUse { .. } => {
                accel_core::Error::forbidden(err.to_string())
            }
            ControllerError::Store(e) => e.into(),
            ControllerError::Driver(e) => e.into(),
            ControllerError::Core(e) => e,
        }
    }
}
