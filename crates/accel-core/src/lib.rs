//! # accel-core
//!
//! Core types, traits, and utilities for acceld - the accelerator slot
//! controller embedded in a container-engine daemon.
//!
//! This crate provides the foundational data structures and interfaces that
//! are shared across all other acceld components. It includes:
//!
//! - The slot data model (scopes, state flags, per-container requests)
//! - Driver-facing data structures (devices, slot info, prepared config)
//! - The `--accel` request grammar and image `runtime` label parsing
//! - Error handling types with HTTP status mapping
//! - Configuration schema and parsing utilities

pub mod config;
pub mod error;
pub mod request;
pub mod types;

// Re-export commonly used types at the crate root
pub use config::{CoreConfig, LoggingConfig, PluginConfig};
pub use error::{Error, Result};
pub use request::{
    parse_accel_spec, parse_runtime_label, validate_accel, validate_accel_name,
    validate_accel_runtime,
};
pub use types::{
    generate_id, short_id, AcceleratorConfig, DeviceInfo, HostConfig, Mount, SlotConfig,
    SlotInfo, SlotScope, SLOT_STATE_BAD_DRIVER, SLOT_STATE_IN_DELETE, SLOT_STATE_NO_DEV,
};
