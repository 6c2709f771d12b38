//! The slot object: in-memory handle plus persisted KV record

use accel_core::{
    SlotScope, SLOT_STATE_BAD_DRIVER, SLOT_STATE_IN_DELETE, SLOT_STATE_NO_DEV,
};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};

/// The persisted form of a slot: a self-describing map stored at
/// `accel/v1/<scope>/slot/<id>`.
///
/// Records written by older daemons may omit `options` and `state`; they
/// decode as an empty list and a healthy state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SlotRecord {
    pub name: String,
    pub id: String,
    pub scope: SlotScope,
    pub driver_name: String,
    pub runtime: String,
    #[serde(default)]
    pub options: Vec<String>,
    #[serde(default)]
    pub owner: String,
    #[serde(default)]
    pub state: u32,
}

#[derive(Debug)]
struct SlotData {
    // persisted fields
    name: String,
    id: String,
    scope: SlotScope,
    driver_name: String,
    runtime: String,
    options: Vec<String>,
    owner: String,
    state: u32,
    // in-memory fields
    db_index: u64,
    db_exists: bool,
}

/// A reservation of one accelerator resource on one driver.
///
/// The handle is cheap to clone; all mutable fields sit behind the per-slot
/// mutex. Mutators only touch memory; persisting the resulting record is
/// the controller's job, so a failed CAS never leaves memory and store
/// half-applied across two writers.
#[derive(Debug, Clone)]
pub struct Slot {
    inner: Arc<Mutex<SlotData>>,
}

impl Slot {
    /// Create a fresh, not-yet-persisted slot
    pub fn new(
        name: impl Into<String>,
        id: impl Into<String>,
        scope: SlotScope,
        runtime: impl Into<String>,
        driver_name: impl Into<String>,
        options: Vec<String>,
    ) -> Self {
        Self {
            inner: Arc::new(Mutex::new(SlotData {
                name: name.into(),
                id: id.into(),
                scope,
                driver_name: driver_name.into(),
                runtime: runtime.into(),
                options,
                owner: String::new(),
                state: 0,
                db_index: 0,
                db_exists: false,
            })),
        }
    }

    /// Rebuild a slot handle from its persisted record
    pub fn from_record(record: SlotRecord, generation: u64) -> Self {
        Self {
            inner: Arc::new(Mutex::new(SlotData {
                name: record.name,
                id: record.id,
                scope: record.scope,
                driver_name: record.driver_name,
                runtime: record.runtime,
                options: record.options,
                owner: record.owner,
                state: record.state,
                db_index: generation,
                db_exists: true,
            })),
        }
    }

    /// Snapshot the persisted fields
    pub fn record(&self) -> SlotRecord {
        let data = self.inner.lock().unwrap();
        SlotRecord {
            name: data.name.clone(),
            id: data.id.clone(),
            scope: data.scope,
            driver_name: data.driver_name.clone(),
            runtime: data.runtime.clone(),
            options: data.options.clone(),
            owner: data.owner.clone(),
            state: data.state,
        }
    }

    pub fn name(&self) -> String {
        self.inner.lock().unwrap().name.clone()
    }

    pub fn id(&self) -> String {
        self.inner.lock().unwrap().id.clone()
    }

    pub fn scope(&self) -> SlotScope {
        self.inner.lock().unwrap().scope
    }

    pub fn driver_name(&self) -> String {
        self.inner.lock().unwrap().driver_name.clone()
    }

    pub fn runtime(&self) -> String {
        self.inner.lock().unwrap().runtime.clone()
    }

    pub fn options(&self) -> Vec<String> {
        self.inner.lock().unwrap().options.clone()
    }

    pub fn owner(&self) -> String {
        self.inner.lock().unwrap().owner.clone()
    }

    pub fn state(&self) -> u32 {
        self.inner.lock().unwrap().state
    }

    /// Set the owner in memory; the controller persists the change
    pub(crate) fn set_owner(&self, owner: impl Into<String>) {
        self.inner.lock().unwrap().owner = owner.into();
    }

    pub fn is_healthy(&self) -> bool {
        self.state() == 0
    }

    pub fn is_in_delete(&self) -> bool {
        self.state() & SLOT_STATE_IN_DELETE != 0
    }

    pub fn is_bad_driver(&self) -> bool {
        self.state() & SLOT_STATE_BAD_DRIVER != 0
    }

    pub fn is_no_dev(&self) -> bool {
        self.state() & SLOT_STATE_NO_DEV != 0
    }

    fn set_flag(&self, flag: u32, set: bool) -> bool {
        let mut data = self.inner.lock().unwrap();
        let next = if set { data.state | flag } else { data.state & !flag };
        if next == data.state {
            return false;
        }
        data.state = next;
        true
    }

    /// Flag the slot for deletion; returns whether the flag changed
    pub(crate) fn mark_in_delete(&self) -> bool {
        self.set_flag(SLOT_STATE_IN_DELETE, true)
    }

    pub(crate) fn mark_bad_driver(&self) -> bool {
        self.set_flag(SLOT_STATE_BAD_DRIVER, true)
    }

    pub(crate) fn clear_bad_driver(&self) -> bool {
        self.set_flag(SLOT_STATE_BAD_DRIVER, false)
    }

    pub(crate) fn mark_no_dev(&self) -> bool {
        self.set_flag(SLOT_STATE_NO_DEV, true)
    }

    pub(crate) fn clear_no_dev(&self) -> bool {
        self.set_flag(SLOT_STATE_NO_DEV, false)
    }

    /// Label used by the reconcile summary
    pub fn summary_state(&self) -> &'static str {
        if self.is_healthy() {
            if self.owner().is_empty() {
                "FREE"
            } else {
                "USED"
            }
        } else if self.is_bad_driver() {
            "BADDRV"
        } else if self.is_no_dev() {
            "NODEV"
        } else {
            "ERR"
        }
    }

    /// Generation of the last observed store write, if the slot is stored
    pub(crate) fn db_index(&self) -> Option<u64> {
        let data = self.inner.lock().unwrap();
        data.db_exists.then_some(data.db_index)
    }

    pub(crate) fn set_db_index(&self, generation: u64) {
        let mut data = self.inner.lock().unwrap();
        data.db_index = generation;
        data.db_exists = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot() -> Slot {
        Slot::new(
            "gpu0",
            "sid-1",
            SlotScope::Global,
            "cuda:7.5",
            "nvidia",
            vec!["device=0".to_string()],
        )
    }

    #[test]
    fn test_record_round_trip() {
        let s = slot();
        s.set_owner("cid-1");
        s.mark_bad_driver();

        let record = s.record();
        let bytes = serde_json::to_vec(&record).unwrap();
        let decoded: SlotRecord = serde_json::from_slice(&bytes).unwrap();
        let restored = Slot::from_record(decoded, 3);

        assert_eq!(restored.name(), "gpu0");
        assert_eq!(restored.id(), "sid-1");
        assert_eq!(restored.scope(), SlotScope::Global);
        assert_eq!(restored.driver_name(), "nvidia");
        assert_eq!(restored.runtime(), "cuda:7.5");
        assert_eq!(restored.options(), vec!["device=0"]);
        assert_eq!(restored.owner(), "cid-1");
        assert!(restored.is_bad_driver());
        assert_eq!(restored.db_index(), Some(3));
    }

    #[test]
    fn test_record_wire_keys() {
        let v = serde_json::to_value(slot().record()).unwrap();
        for key in ["name", "id", "scope", "driverName", "runtime", "options", "owner", "state"] {
            assert!(v.get(key).is_some(), "missing key {}", key);
        }
        assert_eq!(v["scope"], "global");
        assert_eq!(v["state"], 0);
    }

    #[test]
    fn test_record_back_compat_defaults() {
        // records from older daemons omit options and state
        let record: SlotRecord = serde_json::from_str(
            r#"{"name":"","id":"sid-1","scope":"container","driverName":"drv","runtime":"rt","owner":"cid-1"}"#,
        )
        .unwrap();
        assert!(record.options.is_empty());
        assert_eq!(record.state, 0);
    }

    #[test]
    fn test_state_flags() {
        let s = slot();
        assert!(s.is_healthy());
        assert_eq!(s.summary_state(), "FREE");

        assert!(s.mark_bad_driver());
        assert!(!s.mark_bad_driver());
        assert!(s.is_bad_driver());
        assert!(!s.is_healthy());
        assert_eq!(s.summary_state(), "BADDRV");

        assert!(s.clear_bad_driver());
        assert!(!s.clear_bad_driver());
        assert!(s.is_healthy());

        s.mark_no_dev();
        assert_eq!(s.summary_state(), "NODEV");
        s.clear_no_dev();

        s.set_owner("cid-1");
        assert_eq!(s.summary_state(), "USED");

        assert!(s.mark_in_delete());
        assert!(s.is_in_delete());
    }

    #[test]
    fn test_db_index_tracking() {
        let s = slot();
        assert_eq!(s.db_index(), None);
        s.set_db_index(7);
        assert_eq!(s.db_index(), Some(7));
    }
}
