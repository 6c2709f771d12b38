//! Registry of loaded accelerator drivers

use crate::driver::{AcceleratorDriver, Capability};
use crate::{DriverError, Result};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

struct DriverData {
    driver: Arc<dyn AcceleratorDriver>,
    capability: Capability,
}

/// Notify function invoked when a new driver gets registered
pub type DriverNotifyFn = Box<dyn Fn(&str, &Capability) + Send + Sync>;

/// Table of all accelerator drivers the daemon knows about, keyed by name
pub struct DriverRegistry {
    drivers: RwLock<HashMap<String, DriverData>>,
    notify: Option<DriverNotifyFn>,
}

impl Default for DriverRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl DriverRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            drivers: RwLock::new(HashMap::new()),
            notify: None,
        }
    }

    /// Create a registry with a registration notify hook
    pub fn with_notify(notify: DriverNotifyFn) -> Self {
        Self {
            drivers: RwLock::new(HashMap::new()),
            notify: Some(notify),
        }
    }

    /// Register a driver when it gets discovered
    pub fn register(
        &self,
        name: &str,
        driver: Arc<dyn AcceleratorDriver>,
        capability: Capability,
    ) -> Result<()> {
        if name.trim().is_empty() {
            return Err(DriverError::BadRequest(
                "driver name string cannot be empty".to_string(),
            ));
        }

        {
            let drivers = self.drivers.read().unwrap();
            if drivers.contains_key(name) {
                return Err(DriverError::ActiveRegistration(name.to_string()));
            }
        }

        if let Some(notify) = &self.notify {
            notify(name, &capability);
        }

        self.drivers
            .write()
            .unwrap()
            .insert(name.to_string(), DriverData { driver, capability });
        Ok(())
    }

    /// Look up a driver and its capability by name
    pub fn driver(&self, name: &str) -> Option<(Arc<dyn AcceleratorDriver>, Capability)> {
        let drivers = self.drivers.read().unwrap();
        drivers
            .get(name)
            .map(|d| (d.driver.clone(), d.capability.clone()))
    }

    /// Replace the stored capability of a driver (resync outcome)
    pub fn update_capability(&self, name: &str, capability: Capability) -> Result<()> {
        let mut drivers = self.drivers.write().unwrap();
        match drivers.get_mut(name) {
            Some(data) => {
                data.capability = capability;
                Ok(())
            }
            None => Err(DriverError::NoService(format!(
                "driver \"{}\" is not registered",
                name
            ))),
        }
    }

    /// Walk the registered drivers; the walker returning `true` stops the walk
    pub fn walk_drivers<F>(&self, mut walker: F)
    where
        F: FnMut(&str, &Arc<dyn AcceleratorDriver>, &Capability) -> bool,
    {
        let snapshot: Vec<(String, Arc<dyn AcceleratorDriver>, Capability)> = {
            let drivers = self.drivers.read().unwrap();
            let mut entries: Vec<_> = drivers
                .iter()
                .map(|(name, data)| (name.clone(), data.driver.clone(), data.capability.clone()))
                .collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            entries
        };

        for (name, driver, capability) in &snapshot {
            if walker(name, driver, capability) {
                break;
            }
        }
    }

    /// Names of all registered drivers
    pub fn names(&self) -> Vec<String> {
        let drivers = self.drivers.read().unwrap();
        let mut names: Vec<_> = drivers.keys().cloned().collect();
        names.sort();
        names
    }
}
