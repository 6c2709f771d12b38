//! In-process mock driver
//!
//! Simulates an accelerator driver plugin with a small fixed device table.
//! Used by tests throughout the workspace and registerable as a built-in
//! for demo deployments.

use crate::driver::AcceleratorDriver;
use crate::{DriverError, Result};
use accel_core::{DeviceInfo, Mount, SlotConfig, SlotInfo};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use tracing::debug;

#[derive(Debug, Clone)]
struct MockDevice {
    configured_runtime: String,
    bandwidth: u64,
    avail: bool,
}

#[derive(Debug, Default)]
struct MockState {
    /// device identity -> device
    devices: BTreeMap<String, MockDevice>,
    /// sid -> device identity
    slots: HashMap<String, String>,
    /// sids whose driver-side record is corrupt
    poisoned: Vec<String>,
}

/// Mock accelerator driver with a fixed device table
pub struct MockDriver {
    name: String,
    runtimes: Vec<String>,
    inner: Mutex<MockState>,
}

/// Options accepted by mock slot allocation
#[derive(Debug, Default, PartialEq)]
struct MockSlotOptions {
    device: String,
    bandwidth: u64,
}

impl MockDriver {
    /// Create a mock driver with four devices
    pub fn new(name: impl Into<String>, runtimes: Vec<String>) -> Self {
        Self::with_devices(name, runtimes, 4)
    }

    /// Create a mock driver with a given number of devices
    pub fn with_devices(name: impl Into<String>, runtimes: Vec<String>, devices: usize) -> Self {
        let mut state = MockState::default();
        for i in 1..=devices {
            state.devices.insert(
                format!("00ff:06:04.{}", i),
                MockDevice {
                    configured_runtime: String::new(),
                    bandwidth: 500000,
                    avail: true,
                },
            );
        }
        Self {
            name: name.into(),
            runtimes,
            inner: Mutex::new(state),
        }
    }

    /// Drop a slot from the driver-side table, as a plugin restart that
    /// lost its state would. The backing device stays busy.
    pub fn forget_slot(&self, sid: &str) {
        self.inner.lock().unwrap().slots.remove(sid);
    }

    /// Mark a slot so that `slot_info` fails with a generic driver error
    pub fn poison_slot(&self, sid: &str) {
        self.inner.lock().unwrap().poisoned.push(sid.to_string());
    }

    /// Number of slots currently held by the driver
    pub fn slot_count(&self) -> usize {
        self.inner.lock().unwrap().slots.len()
    }

    fn parse_options(&self, options: &[String]) -> Result<MockSlotOptions> {
        let mut parsed = MockSlotOptions::default();
        for opt in options {
            match opt.split_once('=') {
                Some(("device", device)) => parsed.device = device.to_string(),
                Some(("bandwidth", bw)) => {
                    parsed.bandwidth = bw.parse().map_err(|_| {
                        DriverError::BadRequest(format!("invalid bandwidth \"{}\"", bw))
                    })?;
                }
                _ => debug!(driver = %self.name, option = %opt, "ignoring unknown slot option"),
            }
        }
        Ok(parsed)
    }
}

#[async_trait]
impl AcceleratorDriver for MockDriver {
    fn name(&self) -> &str {
        &self.name
    }

    async fn runtimes(&self) -> Vec<String> {
        self.runtimes.clone()
    }

    async fn query_runtime(&self, runtime: &str) -> Result<()> {
        if self.runtimes.iter().any(|rt| rt == runtime) {
            Ok(())
        } else {
            Err(DriverError::NotImplemented)
        }
    }

    async fn list_devices(&self) -> Result<Vec<DeviceInfo>> {
        let state = self.inner.lock().unwrap();
        Ok(state
            .devices
            .iter()
            .map(|(identity, dev)| DeviceInfo {
                supported_runtimes: self.runtimes.clone(),
                device_identify: identity.clone(),
                capacity: HashMap::from([(
                    "bandwidth".to_string(),
                    dev.bandwidth.to_string(),
                )]),
                status: if dev.avail { "available" } else { "busy" }.to_string(),
            })
            .collect())
    }

    async fn allocate_slot(&self, sid: &str, runtime: &str, options: &[String]) -> Result<()> {
        if sid.is_empty() {
            return Err(DriverError::BadRequest("slot id can't be empty".to_string()));
        }
        let opts = self.parse_options(options)?;

        let mut state = self.inner.lock().unwrap();
        let identity = if opts.device.is_empty() {
            state
                .devices
                .iter()
                .find(|(_, dev)| dev.avail)
                .map(|(identity, _)| identity.clone())
                .ok_or_else(|| {
                    DriverError::NoService(format!("no available device for {}", sid))
                })?
        } else {
            let dev = state.devices.get(&opts.device).ok_or_else(|| {
                DriverError::NoService(format!("device \"{}\" not found", opts.device))
            })?;
            if !dev.avail {
                return Err(DriverError::NoService(format!(
                    "device \"{}\" busy",
                    opts.device
                )));
            }
            opts.device.clone()
        };

        let dev = state.devices.get_mut(&identity).unwrap();
        dev.configured_runtime = runtime.to_string();
        dev.avail = false;
        state.slots.insert(sid.to_string(), identity);
        Ok(())
    }

    async fn release_slot(&self, sid: &str) -> Result<()> {
        let mut state = self.inner.lock().unwrap();
        let identity = state
            .slots
            .remove(sid)
            .ok_or_else(|| DriverError::NoSuchSlot(format!("slot {} not found", sid)))?;
        if let Some(dev) = state.devices.get_mut(&identity) {
            dev.configured_runtime = String::new();
            dev.avail = true;
        }
        debug!(driver = %self.name, device = %identity, sid, "released slot");
        Ok(())
    }

    async fn list_slots(&self) -> Result<Vec<String>> {
        let state = self.inner.lock().unwrap();
        Ok(state.slots.keys().cloned().collect())
    }

    async fn slot_info(&self, sid: &str) -> Result<SlotInfo> {
        let state = self.inner.lock().unwrap();
        if state.poisoned.iter().any(|s| s == sid) {
            return Err(DriverError::Remote(format!("slot {} record corrupt", sid)));
        }
        let identity = state
            .slots
            .get(sid)
            .ok_or_else(|| DriverError::NoSuchSlot(format!("slot {} not found", sid)))?;
        Ok(SlotInfo {
            sid: sid.to_string(),
            name: format!("{}-dev", self.name),
            device: identity.clone(),
            runtime: state.devices[identity].configured_runtime.clone(),
        })
    }

    async fn prepare_slot(&self, _sid: &str) -> Result<SlotConfig> {
        let mut config = SlotConfig::default();
        config.devices.push(format!("/dev/{}_vf", self.name));
        config.binds.push(Mount {
            source: format!("/var/lib/{}_driver", self.name),
            destination: format!("/usr/local/{}_driver", self.name),
            mode: "ro".to_string(),
        });
        config.envs.insert(
            "LD_LIBRARY_PATH".to_string(),
            format!("/usr/local/{}_driver/lib", self.name),
        );
        config.envs.insert(
            "PATH".to_string(),
            format!("/usr/local/{}_driver/bin", self.name),
        );
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn driver() -> MockDriver {
        MockDriver::new(
            "fakefpga",
            vec!["ipsec.dh".to_string(), "ipsec.aes".to_string(), "snow3g".to_string()],
        )
    }

    #[tokio::test]
    async fn test_query_runtime() {
        let d = driver();
        assert!(d.query_runtime("snow3g").await.is_ok());
        assert!(matches!(
            d.query_runtime("cuda:7.5").await,
            Err(DriverError::NotImplemented)
        ));
    }

    #[tokio::test]
    async fn test_allocate_and_release() {
        let d = driver();
        d.allocate_slot("sid-1", "ipsec.aes", &[]).await.unwrap();
        assert_eq!(d.slot_count(), 1);

        let info = d.slot_info("sid-1").await.unwrap();
        assert_eq!(info.runtime, "ipsec.aes");
        assert!(!info.device.is_empty());

        d.release_slot("sid-1").await.unwrap();
        assert_eq!(d.slot_count(), 0);
        assert!(matches!(
            d.release_slot("sid-1").await,
            Err(DriverError::NoSuchSlot(_))
        ));
    }

    #[tokio::test]
    async fn test_allocate_named_device() {
        let d = driver();
        d.allocate_slot("sid-1", "snow3g", &["device=00ff:06:04.2".to_string()])
            .await
            .unwrap();
        let info = d.slot_info("sid-1").await.unwrap();
        assert_eq!(info.device, "00ff:06:04.2");

        // same device again is busy
        let err = d
            .allocate_slot("sid-2", "snow3g", &["device=00ff:06:04.2".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, DriverError::NoService(_)));

        // unknown device
        let err = d
            .allocate_slot("sid-3", "snow3g", &["device=00ff:09:00.0".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, DriverError::NoService(_)));
    }

    #[tokio::test]
    async fn test_devices_exhausted() {
        let d = MockDriver::with_devices("fpga", vec!["rt".to_string()], 1);
        d.allocate_slot("sid-1", "rt", &[]).await.unwrap();
        let err = d.allocate_slot("sid-2", "rt", &[]).await.unwrap_err();
        assert!(matches!(err, DriverError::NoService(_)));
    }

    #[tokio::test]
    async fn test_bad_options() {
        let d = driver();
        let err = d
            .allocate_slot("sid-1", "snow3g", &["bandwidth=fast".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, DriverError::BadRequest(_)));

        // unknown options are ignored
        d.allocate_slot("sid-1", "snow3g", &["color=red".to_string()])
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_empty_sid_rejected() {
        let d = driver();
        assert!(matches!(
            d.allocate_slot("", "snow3g", &[]).await,
            Err(DriverError::BadRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_prepare_slot_config() {
        let d = driver();
        d.allocate_slot("sid-1", "snow3g", &[]).await.unwrap();
        let config = d.prepare_slot("sid-1").await.unwrap();
        assert_eq!(config.devices, vec!["/dev/fakefpga_vf"]);
        assert_eq!(config.binds.len(), 1);
        assert_eq!(config.binds[0].mode, "ro");
        assert!(config.envs.contains_key("LD_LIBRARY_PATH"));
    }

    #[tokio::test]
    async fn test_forget_and_poison() {
        let d = driver();
        d.allocate_slot("sid-1", "snow3g", &[]).await.unwrap();

        d.poison_slot("sid-1");
        assert!(matches!(
            d.slot_info("sid-1").await,
            Err(DriverError::Remote(_))
        ));

        d.forget_slot("sid-1");
        assert_eq!(d.slot_count(), 0);
    }
}
