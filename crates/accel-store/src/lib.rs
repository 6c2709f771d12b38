//! # accel-store
//!
//! Durable, atomic-CAS key/value persistence for acceld, partitioned by
//! slot scope.
//!
//! Each scope (`global`, `container`) is an independent namespace backed by
//! its own store file. Records are opaque byte strings; every write bumps a
//! per-store generation counter, and the generation of a record's last write
//! is what compare-and-swap operations check against. A write-through
//! in-memory cache fronts the file so reads never touch disk after start-up,
//! and can never observe a generation older than one already served.

use thiserror::Error;

pub mod store;

pub use store::{slot_key, slot_prefix, DataStore, KvEntry};

/// Result type for store operations
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors that can occur during store operations
#[derive(Error, Debug)]
pub enum StoreError {
    /// The key does not exist
    #[error("Key not found in store")]
    NotFound,

    /// A CAS operation observed a generation newer than the caller's
    #[error("Unable to complete atomic operation, key modified")]
    KeyModified,

    /// The caller passed an invalid record
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// I/O error from the backing file
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Record (de)serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<StoreError> for accel_core::Error {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound => accel_core::Error::not_found("key not found in store"),
            StoreError::KeyModified => {
                accel_core::Error::retry("atomic operation failed, key modified")
            }
            StoreError::BadRequest(msg) => accel_core::Error::bad_request(msg),
            StoreError::Io(e) => accel_core::Error::Io(e),
            StoreError::Serialization(e) => accel_core::Error::Json(e),
        }
    }
}
