//! Core type definitions for acceld

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Maximum length accepted for slot/driver/runtime names on the API surface
pub const MAX_NAME_LEN: usize = 256;
/// Maximum number of driver options per slot
pub const MAX_OPTIONS_COUNT: usize = 128;
/// Maximum length of a single driver option
pub const MAX_OPTION_LEN: usize = 1024;
/// Maximum length of the `filters` query parameter
pub const MAX_FILTER_LEN: usize = 1024;

/// Slot is visible daemon-wide and managed by the user
pub const SLOT_STATE_BAD_DRIVER: u32 = 0x1;
/// Slot is being released; hidden from listings, accepts no new owners
pub const SLOT_STATE_IN_DELETE: u32 = 0x2;
/// The driver is up but no longer backs this slot with a device
pub const SLOT_STATE_NO_DEV: u32 = 0x4;

/// Lifetime class of a slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SlotScope {
    /// User-managed; survives any container, may be free or bound
    Global,
    /// Bound to exactly one container for its whole lifetime
    Container,
}

impl SlotScope {
    /// All scopes, in store-initialization order
    pub fn all() -> [SlotScope; 2] {
        [SlotScope::Global, SlotScope::Container]
    }

    /// Get the string representation of the scope
    pub fn as_str(&self) -> &'static str {
        match self {
            SlotScope::Global => "global",
            SlotScope::Container => "container",
        }
    }
}

impl fmt::Display for SlotScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for SlotScope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "global" => Ok(SlotScope::Global),
            "container" => Ok(SlotScope::Container),
            _ => Err(format!("Unknown slot scope: {}", s)),
        }
    }
}

/// Per-container accelerator request, attached to the container host config.
///
/// Persistent entries come from the user (`--accel`) and survive container
/// stop; non-persistent entries come from the image `runtime` label and are
/// allocated at start, released at stop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AcceleratorConfig {
    /// Label used inside the container
    pub name: String,

    /// Requested execution environment, e.g. "cuda:7.5"
    pub runtime: String,

    /// Driver that satisfies the runtime; empty until resolved
    #[serde(default)]
    pub driver: String,

    /// Opaque driver-specific options
    #[serde(default)]
    pub options: Vec<String>,

    /// Slot id once bound, empty before allocation
    #[serde(default)]
    pub sid: String,

    /// Whether the slot survives container stop
    #[serde(default)]
    pub is_persistent: bool,
}

impl AcceleratorConfig {
    /// Create a new request for the given name and runtime
    pub fn new(name: impl Into<String>, runtime: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            runtime: runtime.into(),
            driver: String::new(),
            options: Vec::new(),
            sid: String::new(),
            is_persistent: false,
        }
    }

    /// Whether a slot has been allocated for this request
    pub fn is_bound(&self) -> bool {
        !self.sid.is_empty()
    }
}

/// The accelerator slice of a container's host configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostConfig {
    /// Accelerator requests for this container
    #[serde(default)]
    pub accelerators: Vec<AcceleratorConfig>,
}

/// Driver-reported device attributes. Not persisted; used for listings
/// and the query step only.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DeviceInfo {
    /// Runtimes this device can satisfy
    pub supported_runtimes: Vec<String>,

    /// Stable device identity, e.g. a PCI address
    pub device_identify: String,

    /// Capacity attributes, driver-defined
    #[serde(default)]
    pub capacity: HashMap<String, String>,

    /// Device status string, driver-defined
    pub status: String,
}

/// Driver-side view of one slot, exchanged during registration and resync
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SlotInfo {
    /// Slot id
    pub sid: String,

    /// Driver-assigned slot name
    #[serde(default)]
    pub name: String,

    /// Device backing the slot
    #[serde(default)]
    pub device: String,

    /// Runtime the slot was allocated for
    pub runtime: String,
}

/// A mount the driver supplies for a prepared slot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Mount {
    /// Host path
    pub source: String,

    /// Path inside the container
    pub destination: String,

    /// Comma-separated mount mode, e.g. "ro" or "ro,cv"
    #[serde(default)]
    pub mode: String,
}

/// Everything a container needs to use one prepared slot
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SlotConfig {
    /// Bind mounts to inject
    #[serde(default)]
    pub binds: Vec<Mount>,

    /// Environment assignments to inject
    #[serde(default)]
    pub envs: HashMap<String, String>,

    /// Raw device paths to map through
    #[serde(default)]
    pub devices: Vec<String>,
}

/// Generate a random 64-hex slot identifier
pub fn generate_id() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill(&mut bytes);
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Truncate an id for log output
pub fn short_id(id: &str) -> &str {
    if id.len() > 12 {
        &id[..12]
    } else {
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_round_trip() {
        for scope in SlotScope::all() {
            let parsed: SlotScope = scope.as_str().parse().unwrap();
            assert_eq!(parsed, scope);
        }
        assert!("local".parse::<SlotScope>().is_err());
    }

    #[test]
    fn test_scope_serde_lowercase() {
        assert_eq!(serde_json::to_string(&SlotScope::Global).unwrap(), "\"global\"");
        assert_eq!(
            serde_json::from_str::<SlotScope>("\"container\"").unwrap(),
            SlotScope::Container
        );
    }

    #[test]
    fn test_generate_id() {
        let id = generate_id();
        assert_eq!(id.len(), 64);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(id, generate_id());
    }

    #[test]
    fn test_short_id() {
        let id = generate_id();
        assert_eq!(short_id(&id).len(), 12);
        assert_eq!(short_id("abc"), "abc");
    }

    #[test]
    fn test_accelerator_config_defaults() {
        // Container config files from older daemons omit driver/sid/options
        let cfg: AcceleratorConfig =
            serde_json::from_str(r#"{"name":"a","runtime":"cuda:7.5"}"#).unwrap();
        assert_eq!(cfg.name, "a");
        assert!(cfg.driver.is_empty());
        assert!(cfg.options.is_empty());
        assert!(!cfg.is_bound());
        assert!(!cfg.is_persistent);
    }

    #[test]
    fn test_slot_config_wire_keys() {
        let mut cfg = SlotConfig::default();
        cfg.devices.push("/dev/acc0".to_string());
        cfg.binds.push(Mount {
            source: "/var/lib/acc".to_string(),
            destination: "/usr/local/acc".to_string(),
            mode: "ro".to_string(),
        });
        let v = serde_json::to_value(&cfg).unwrap();
        assert!(v.get("Binds").is_some());
        assert!(v.get("Devices").is_some());
        assert_eq!(v["Binds"][0]["Source"], "/var/lib/acc");
    }
}
