//! Driver interface and controller callback seam

use crate::Result;
use accel_core::{DeviceInfo, SlotConfig, SlotInfo};
use async_trait::async_trait;

/// Capability a driver reports at registration: the runtimes it can satisfy
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Capability {
    pub runtimes: Vec<String>,
}

impl Capability {
    /// Whether this driver lists the given runtime
    pub fn supports_runtime(&self, runtime: &str) -> bool {
        self.runtimes.iter().any(|rt| rt == runtime)
    }
}

/// Interface every accelerator driver implements.
///
/// `sid` is the daemon-generated slot id; drivers store it opaquely and key
/// their own slot table by it.
#[async_trait]
pub trait AcceleratorDriver: Send + Sync {
    /// Name of this driver
    fn name(&self) -> &str;

    /// Runtimes supported by this driver, e.g. ["cuda", "opencl"].
    /// Errors are swallowed; an unreachable driver reports no runtimes.
    async fn runtimes(&self) -> Vec<String>;

    /// Check whether a specific runtime is supported, e.g. "cuda:7.5"
    async fn query_runtime(&self, runtime: &str) -> Result<()>;

    /// List all devices managed by this driver
    async fn list_devices(&self) -> Result<Vec<DeviceInfo>>;

    /// Allocate a slot with the requested id, runtime, and options
    async fn allocate_slot(&self, sid: &str, runtime: &str, options: &[String]) -> Result<()>;

    /// Release the slot with the given id
    async fn release_slot(&self, sid: &str) -> Result<()>;

    /// List the ids of all slots held by this driver
    async fn list_slots(&self) -> Result<Vec<String>>;

    /// Fetch the driver-side view of one slot
    async fn slot_info(&self, sid: &str) -> Result<SlotInfo>;

    /// Materialise the mounts/devices/environment for one slot
    async fn prepare_slot(&self, sid: &str) -> Result<SlotConfig>;
}

/// Callbacks a driver proxy uses to reach back into the controller during
/// registration and resync
#[async_trait]
pub trait DriverCallback: Send + Sync {
    /// The authoritative list of slots the controller records for a driver
    async fn query_managed_slots(&self, driver: &str) -> Result<Vec<SlotInfo>>;

    /// Apply a refreshed capability and mark the listed slots as lost
    async fn update_driver(
        &self,
        driver: &str,
        capability: Capability,
        invalid_slots: Vec<SlotInfo>,
    ) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capability_supports_runtime() {
        let cap = Capability {
            runtimes: vec!["cuda:7.5".to_string(), "opencl".to_string()],
        };
        assert!(cap.supports_runtime("cuda:7.5"));
        assert!(!cap.supports_runtime("cuda"));
        assert!(!Capability::default().supports_runtime("cuda:7.5"));
    }
}
