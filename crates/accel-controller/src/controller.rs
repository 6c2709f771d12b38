//! Controller operations over the slot namespace

use crate::slot::{Slot, SlotRecord};
use crate::{ControllerError, Result};
use accel_core::{short_id, validate_accel_name, CoreConfig, DeviceInfo, SlotConfig, SlotInfo, SlotScope};
use accel_driver::{
    AcceleratorDriver, Capability, DriverCallback, DriverError, DriverRegistry,
    HttpPluginEndpoint, RemoteDriver,
};
use accel_store::{slot_key, slot_prefix, DataStore, StoreError};
use async_trait::async_trait;
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// The accelerator slot controller.
///
/// Cheap to clone; all state is shared. One instance lives for the whole
/// daemon lifetime.
#[derive(Clone)]
pub struct Controller {
    pub(crate) inner: Arc<ControllerInner>,
}

pub(crate) struct ControllerInner {
    id: String,
    config: CoreConfig,
    registry: DriverRegistry,
    stores: Vec<DataStore>,
    weak_self: Weak<ControllerInner>,
}

impl Controller {
    /// Create a controller, opening one slot store per scope under the
    /// configured data root.
    pub fn new(config: CoreConfig) -> Result<Self> {
        let mut stores = Vec::new();
        for scope in SlotScope::all() {
            stores.push(DataStore::open(&config.data_root, scope)?);
        }

        let registry = DriverRegistry::with_notify(Box::new(|name, capability| {
            info!(
                driver = name,
                runtimes = ?capability.runtimes,
                "detected accelerator driver"
            );
        }));

        let inner = Arc::new_cyclic(|weak| ControllerInner {
            id: Uuid::new_v4().to_string(),
            config,
            registry,
            stores,
            weak_self: weak.clone(),
        });

        Ok(Self { inner })
    }

    /// Unique identity of this controller instance
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Register an in-process driver (the built-in mock)
    pub async fn register_builtin(&self, driver: Arc<dyn AcceleratorDriver>) -> Result<()> {
        let capability = Capability { runtimes: driver.runtimes().await };
        let name = driver.name().to_string();
        self.inner.registry.register(&name, driver, capability)?;
        Ok(())
    }

    /// Resolve the driver satisfying a runtime.
    ///
    /// With an empty driver name, walks all registered drivers and returns
    /// the first whose capability lists the runtime. A named driver is
    /// loaded if needed, its capability checked, and probed with
    /// `QueryRuntime`.
    pub async fn query(&self, runtime: &str, driver: &str) -> Result<String> {
        let mut driver_name = driver.to_string();
        if driver_name.is_empty() {
            self.inner.registry.walk_drivers(|name, _, capability| {
                if capability.supports_runtime(runtime) {
                    driver_name = name.to_string();
                    true
                } else {
                    false
                }
            });
            if driver_name.is_empty() {
                return Err(ControllerError::RuntimeNotSupported(runtime.to_string()));
            }
        }

        let (drv, capability) = self.inner.resolve_driver(&driver_name, true).await?;
        if !capability.supports_runtime(runtime) {
            return Err(ControllerError::RuntimeNotSupported(runtime.to_string()));
        }
        drv.query_runtime(runtime).await?;

        Ok(driver_name)
    }

    /// Allocate a global-scoped slot; a valid, unique name is required
    pub async fn allocate_global_slot(
        &self,
        name: &str,
        sid: &str,
        runtime: &str,
        driver: &str,
        options: Vec<String>,
    ) -> Result<Slot> {
        if name.is_empty() || !validate_accel_name(name) {
            return Err(ControllerError::InvalidName(name.to_string()));
        }
        if self.slot_by_name(name).is_ok() {
            return Err(ControllerError::SlotNameExists(name.to_string()));
        }
        let slot = Slot::new(name, sid, SlotScope::Global, runtime, driver, options);
        self.inner.allocate_slot(slot).await
    }

    /// Allocate a container-scoped slot; the owner is stamped right after
    /// by the binding layer
    pub async fn allocate_container_slot(
        &self,
        sid: &str,
        runtime: &str,
        driver: &str,
        options: Vec<String>,
    ) -> Result<Slot> {
        let slot = Slot::new("", sid, SlotScope::Container, runtime, driver, options);
        self.inner.allocate_slot(slot).await
    }

    /// All live slots across both scopes; slots being deleted are hidden
    pub fn slots(&self) -> Vec<Slot> {
        self.inner
            .get_slots()
            .into_iter()
            .filter(|s| !s.is_in_delete())
            .collect()
    }

    /// Walk the live slots; the walker returning `true` stops the walk
    pub fn walk_slots<F>(&self, mut walker: F)
    where
        F: FnMut(&Slot) -> bool,
    {
        for slot in self.slots() {
            if walker(&slot) {
                return;
            }
        }
    }

    /// Look up a global slot by name
    pub fn slot_by_name(&self, name: &str) -> Result<Slot> {
        if name.is_empty() {
            return Err(ControllerError::InvalidName(name.to_string()));
        }
        // only global-scoped slots carry a name
        self.inner
            .slots_for_scope(SlotScope::Global)?
            .into_iter()
            .find(|s| !s.is_in_delete() && s.name() == name)
            .ok_or_else(|| ControllerError::NoSuchSlot(name.to_string()))
    }

    /// Look up a slot by id, across both scopes
    pub fn slot_by_id(&self, sid: &str) -> Result<Slot> {
        if sid.is_empty() {
            return Err(ControllerError::InvalidId(sid.to_string()));
        }
        self.inner.get_slot(sid)
    }

    /// Look up a slot by id prefix; more than one match is an error
    pub fn slots_by_id_prefix(&self, prefix: &str) -> Result<Slot> {
        if prefix.is_empty() {
            return Err(ControllerError::InvalidId(prefix.to_string()));
        }
        let mut matches: Vec<Slot> = self
            .slots()
            .into_iter()
            .filter(|s| s.id().starts_with(prefix))
            .collect();
        match matches.len() {
            0 => Err(ControllerError::NoSuchSlot(prefix.to_string())),
            1 => Ok(matches.remove(0)),
            _ => Err(ControllerError::AmbiguousPrefix(prefix.to_string())),
        }
    }

    /// Change a slot's owner and persist the change
    pub fn set_owner(&self, slot: &Slot, owner: &str) -> Result<()> {
        if !owner.is_empty() && slot.is_in_delete() {
            return Err(ControllerError::Core(accel_core::Error::forbidden(format!(
                "slot {} is being removed",
                slot.id()
            ))));
        }
        let prev = slot.owner();
        slot.set_owner(owner);
        if let Err(err) = self.inner.update_to_store(slot) {
            slot.set_owner(prev);
            return Err(err);
        }
        Ok(())
    }

    /// Release a slot: mark it for deletion, tell the driver, then drop the
    /// record. `force` tolerates driver errors and missing plugins; an
    /// unhealthy or owned global slot can only be removed with force.
    pub async fn release(&self, slot: &Slot, force: bool) -> Result<()> {
        let id = slot.id();
        if !force {
            if slot.is_bad_driver() {
                return Err(ControllerError::UnhealthyRemoval { state: "BADDRIVER", id });
            }
            if slot.is_no_dev() {
                return Err(ControllerError::UnhealthyRemoval { state: "NODEV", id });
            }
        }
        if slot.scope() == SlotScope::Global {
            let owner = slot.owner();
            if !owner.is_empty() && !(force && (slot.is_bad_driver() || slot.is_no_dev())) {
                return Err(ControllerError::SlotInUse { id, owner });
            }
        }

        // mark first: a crash from here on leaves a record the next
        // reconciliation completes
        if slot.mark_in_delete() {
            self.inner.update_to_store(slot)?;
        }

        match self.inner.resolve_driver(&slot.driver_name(), true).await {
            Ok((driver, _)) => {
                if let Err(err) = driver.release_slot(&id).await {
                    if !force {
                        return Err(err.into());
                    }
                    debug!(sid = short_id(&id), error = %err, "driver failed to release stale slot");
                }
            }
            Err(err) => {
                if !force {
                    return Err(err);
                }
                debug!(sid = short_id(&id), error = %err, "failed to load driver for slot");
            }
        }

        self.inner.delete_from_store(slot)
    }

    /// Materialise the mounts/devices/environment for one slot
    pub async fn prepare_slot(&self, slot: &Slot) -> Result<SlotConfig> {
        let (driver, _) = self.inner.resolve_driver(&slot.driver_name(), true).await?;
        Ok(driver.prepare_slot(&slot.id()).await?)
    }

    /// The device currently backing a slot, or empty if unavailable
    pub async fn slot_device(&self, slot: &Slot) -> String {
        let driver = match self.inner.resolve_driver(&slot.driver_name(), true).await {
            Ok((driver, _)) => driver,
            Err(err) => {
                debug!(error = %err, "failed to connect to accelerator driver plugin");
                return String::new();
            }
        };
        match driver.slot_info(&slot.id()).await {
            Ok(info) => info.device,
            Err(err) => {
                debug!(error = %err, "failed to get slot info");
                String::new()
            }
        }
    }

    /// List the devices managed by one driver
    pub async fn list_devices(&self, driver: &str) -> Result<Vec<DeviceInfo>> {
        let (drv, _) = self.inner.resolve_driver(driver, true).await?;
        Ok(drv.list_devices().await?)
    }

    /// Walk the registered drivers
    pub fn walk_drivers<F>(&self, walker: F)
    where
        F: FnMut(&str, &Arc<dyn AcceleratorDriver>, &Capability) -> bool,
    {
        self.inner.registry.walk_drivers(walker)
    }

    /// Eagerly load the plugins named in the configuration
    pub async fn preload_plugins(&self) -> Result<()> {
        let names: Vec<String> = self
            .inner
            .config
            .plugins
            .iter()
            .map(|p| p.name.clone())
            .collect();
        for name in names {
            debug!(driver = %name, "loading accelerator plugin");
            self.inner.resolve_driver(&name, true).await?;
        }
        Ok(())
    }
}

impl ControllerInner {
    fn store_for(&self, scope: SlotScope) -> Result<&DataStore> {
        self.stores.iter().find(|s| s.scope() == scope).ok_or_else(|| {
            ControllerError::Core(accel_core::Error::internal(format!(
                "datastore for scope \"{}\" is not initialized",
                scope
            )))
        })
    }

    pub(crate) fn get_slot(&self, sid: &str) -> Result<Slot> {
        for store in &self.stores {
            let key = slot_key(store.scope(), sid);
            match store.get(&key) {
                Ok((bytes, generation)) => {
                    let record: SlotRecord =
                        serde_json::from_slice(&bytes).map_err(StoreError::from)?;
                    return Ok(Slot::from_record(record, generation));
                }
                Err(StoreError::NotFound) => continue,
                Err(err) => {
                    debug!(sid, error = %err, "could not read slot");
                    continue;
                }
            }
        }
        Err(ControllerError::NoSuchSlot(sid.to_string()))
    }

    pub(crate) fn slots_for_scope(&self, scope: SlotScope) -> Result<Vec<Slot>> {
        let store = self.store_for(scope)?;
        let mut slots = Vec::new();
        for (_, bytes, generation) in store.list(&slot_prefix(scope))? {
            let record: SlotRecord = serde_json::from_slice(&bytes).map_err(StoreError::from)?;
            slots.push(Slot::from_record(record, generation));
        }
        Ok(slots)
    }

    pub(crate) fn get_slots(&self) -> Vec<Slot> {
        let mut slots = Vec::new();
        for scope in SlotScope::all() {
            match self.slots_for_scope(scope) {
                Ok(mut scoped) => slots.append(&mut scoped),
                Err(err) => debug!(scope = scope.as_str(), error = %err, "failed to list slots"),
            }
        }
        slots
    }

    pub(crate) fn update_to_store(&self, slot: &Slot) -> Result<()> {
        let record = slot.record();
        let store = self.store_for(record.scope)?;
        let key = slot_key(record.scope, &record.id);
        let bytes = serde_json::to_vec(&record).map_err(StoreError::from)?;
        let generation = store.put_atomic(&key, bytes, slot.db_index())?;
        slot.set_db_index(generation);
        Ok(())
    }

    pub(crate) fn delete_from_store(&self, slot: &Slot) -> Result<()> {
        let record = slot.record();
        let store = self.store_for(record.scope)?;
        let key = slot_key(record.scope, &record.id);
        loop {
            let prev = slot.db_index().ok_or(StoreError::NotFound)?;
            match store.delete_atomic(&key, prev) {
                Ok(()) => return Ok(()),
                Err(StoreError::KeyModified) => {
                    // refresh the index from the latest write and retry
                    let (_, generation) = store.get(&key)?;
                    slot.set_db_index(generation);
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    pub(crate) async fn allocate_slot(&self, slot: Slot) -> Result<Slot> {
        let driver_name = slot.driver_name();
        if driver_name.is_empty() {
            return Err(ControllerError::InvalidDriver(driver_name));
        }

        let (driver, capability) = self.resolve_driver(&driver_name, true).await?;
        let runtime = slot.runtime();
        if !capability.supports_runtime(&runtime) {
            return Err(ControllerError::RuntimeNotSupported(runtime));
        }

        let sid = slot.id();
        driver.allocate_slot(&sid, &runtime, &slot.options()).await?;

        if let Err(err) = self.update_to_store(&slot) {
            // the record never landed; undo the driver-side allocation
            if let Err(release_err) = driver.release_slot(&sid).await {
                debug!(sid = short_id(&sid), error = %release_err, "rollback release failed");
            }
            return Err(err);
        }

        Ok(slot)
    }

    pub(crate) async fn resolve_driver(
        &self,
        name: &str,
        load: bool,
    ) -> Result<(Arc<dyn AcceleratorDriver>, Capability)> {
        if let Some(found) = self.registry.driver(name) {
            return Ok(found);
        }
        if !load {
            return Err(ControllerError::Driver(DriverError::NoService(format!(
                "driver \"{}\" is not registered",
                name
            ))));
        }

        self.load_driver(name).await?;
        self.registry.driver(name).ok_or_else(|| {
            ControllerError::Core(accel_core::Error::internal(format!(
                "could not resolve driver {} in registry",
                name
            )))
        })
    }

    /// Load a remote driver through its configured endpoint. The
    /// registration handshake sends the controller's slot list for this
    /// driver so a restarted plugin resynchronizes immediately.
    async fn load_driver(&self, name: &str) -> Result<()> {
        let endpoint_url = self.config.plugin_endpoint(name).ok_or_else(|| {
            ControllerError::Core(accel_core::Error::not_found(format!(
                "accelerator driver plugin \"{}\" not found",
                name
            )))
        })?;

        let endpoint = Arc::new(HttpPluginEndpoint::new(endpoint_url)?);
        let callback: Weak<dyn DriverCallback> = self.weak_self.clone();
        let proxy = RemoteDriver::new(name, endpoint, callback);

        let managed = self.managed_slots(name)?;
        let (capability, invalid) = proxy.get_capability(managed).await?;

        self.registry.register(name, Arc::new(proxy), capability)?;
        if !invalid.is_empty() {
            self.apply_invalid_slots(name, &invalid)?;
        }
        Ok(())
    }

    fn managed_slots(&self, driver: &str) -> Result<Vec<SlotInfo>> {
        Ok(self
            .get_slots()
            .into_iter()
            .filter(|s| !s.is_in_delete() && s.driver_name() == driver)
            .map(|s| SlotInfo {
                sid: s.id(),
                name: s.name(),
                device: String::new(),
                runtime: s.runtime(),
            })
            .collect())
    }

    fn apply_invalid_slots(&self, driver: &str, invalid: &[SlotInfo]) -> Result<()> {
        for info in invalid {
            match self.get_slot(&info.sid) {
                Ok(slot) => {
                    warn!(
                        driver,
                        sid = short_id(&info.sid),
                        "driver could not recover slot, marking NODEV"
                    );
                    if slot.mark_no_dev() {
                        self.update_to_store(&slot)?;
                    }
                }
                Err(_) => {
                    debug!(driver, sid = short_id(&info.sid), "driver reported unknown slot");
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl DriverCallback for ControllerInner {
    async fn query_managed_slots(&self, driver: &str) -> accel_driver::Result<Vec<SlotInfo>> {
        self.managed_slots(driver)
            .map_err(|e| DriverError::Core(e.into()))
    }

    async fn update_driver(
        &self,
        driver: &str,
        capability: Capability,
        invalid_slots: Vec<SlotInfo>,
    ) -> accel_driver::Result<()> {
        if let Err(err) = self.registry.update_capability(driver, capability) {
            warn!(driver, error = %err, "failed to refresh driver capability");
        }
        self.apply_invalid_slots(driver, &invalid_slots)
            .map_err(|e| DriverError::Core(e.into()))
    }
}
