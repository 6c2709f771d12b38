//! Start-up reconciliation of persisted slots against drivers and containers
//!
//! Invoked once during daemon start with the `slot-id -> container-id` map
//! derived from the container registry. Reconciliation converges three
//! independent views of the world: the persisted slot records, the live
//! container set, and each driver's own slot table.

use crate::controller::Controller;
use crate::slot::Slot;
use accel_core::{short_id, SlotScope};
use accel_driver::DriverError;
use std::collections::{HashMap, HashSet};
use tracing::{debug, info, warn};

/// Slot counts after a reconciliation pass
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CleanupSummary {
    pub free: usize,
    pub used: usize,
    pub baddrv: usize,
    pub nodev: usize,
    pub err: usize,
}

impl CleanupSummary {
    /// Healthy slots
    pub fn valid(&self) -> usize {
        self.free + self.used
    }

    /// Slots carrying a failure flag
    pub fn invalid(&self) -> usize {
        self.baddrv + self.nodev + self.err
    }
}

impl Controller {
    /// Reconcile every persisted slot.
    ///
    /// Rules, per slot:
    /// - driver not loadable: mark `BAD_DRIVER`, never touch the slot
    /// - driver loadable: clear stale flags, probe `SlotInfo`; a slot the
    ///   driver lost is re-allocated once, `NO_DEV` on failure; any other
    ///   probe error marks `BAD_DRIVER` for this slot only
    /// - ownership disagreements resolve toward the live container map when
    ///   the recorded owner is gone, and are kept (logged) otherwise
    /// - container-scoped slots no live container references are released
    /// - releases interrupted by a crash (`IN_DELETE`) are completed
    pub async fn cleanup_slots(&self, active: &HashMap<String, String>) -> CleanupSummary {
        let live_containers: HashSet<&str> = active.values().map(String::as_str).collect();
        let mut bad_drivers: HashSet<String> = HashSet::new();

        debug!("cleanup accelerator slots");
        for slot in self.inner.get_slots() {
            let sid = slot.id();

            if slot.is_in_delete() {
                if let Err(err) = self.release(&slot, true).await {
                    warn!(sid = short_id(&sid), error = %err, "failed to complete interrupted release");
                }
                continue;
            }

            let driver_name = slot.driver_name();
            if bad_drivers.contains(&driver_name) {
                self.persist_if_changed(&slot, slot.mark_bad_driver());
                continue;
            }
            let driver = match self.inner.resolve_driver(&driver_name, true).await {
                Ok((driver, _)) => driver,
                Err(err) => {
                    debug!(driver = %driver_name, error = %err, "accelerator driver not available");
                    bad_drivers.insert(driver_name);
                    self.persist_if_changed(&slot, slot.mark_bad_driver());
                    continue;
                }
            };

            // the driver is back; re-derive the failure flags from scratch
            self.persist_if_changed(&slot, slot.clear_bad_driver());
            self.persist_if_changed(&slot, slot.clear_no_dev());

            match driver.slot_info(&sid).await {
                Ok(_) => {}
                Err(DriverError::NoSuchSlot(_)) => {
                    // the driver lost this slot; try one re-allocation with
                    // the persisted runtime and options
                    match driver.allocate_slot(&sid, &slot.runtime(), &slot.options()).await {
                        Ok(()) => {
                            debug!(
                                sid = short_id(&sid),
                                runtime = %slot.runtime(),
                                driver = %slot.driver_name(),
                                "recovered slot the driver had lost"
                            );
                        }
                        Err(err) => {
                            debug!(
                                sid = short_id(&sid),
                                runtime = %slot.runtime(),
                                driver = %slot.driver_name(),
                                error = %err,
                                "slot recovery failed"
                            );
                            self.persist_if_changed(&slot, slot.mark_no_dev());
                        }
                    }
                }
                Err(err) => {
                    // the driver is up but this slot's record is corrupt
                    debug!(sid = short_id(&sid), error = %err, "driver rejected slot probe");
                    self.persist_if_changed(&slot, slot.mark_bad_driver());
                }
            }

            // cross-check ownership against the container registry
            match active.get(&sid).map(String::as_str) {
                Some(live_owner) => {
                    let recorded = slot.owner();
                    if recorded != live_owner {
                        if recorded.is_empty() || !live_containers.contains(recorded.as_str()) {
                            info!(
                                sid = short_id(&sid),
                                owner = live_owner,
                                "adopting live owner for slot"
                            );
                            if let Err(err) = self.set_owner(&slot, live_owner) {
                                warn!(sid = short_id(&sid), error = %err, "failed to adopt owner");
                            }
                        } else {
                            warn!(
                                sid = short_id(&sid),
                                recorded = %recorded,
                                live = live_owner,
                                "slot owner disagrees with container registry, keeping recorded owner"
                            );
                        }
                    }
                }
                None => {
                    if slot.scope() == SlotScope::Container {
                        // leaked from a crashed run
                        info!(sid = short_id(&sid), "releasing leaked container-scoped slot");
                        if let Err(err) = self.release(&slot, true).await {
                            warn!(sid = short_id(&sid), error = %err, "failed to release leaked slot");
                        }
                    } else {
                        let recorded = slot.owner();
                        if !recorded.is_empty() && !live_containers.contains(recorded.as_str()) {
                            info!(sid = short_id(&sid), "clearing stale owner of global slot");
                            if let Err(err) = self.set_owner(&slot, "") {
                                warn!(sid = short_id(&sid), error = %err, "failed to clear owner");
                            }
                        }
                    }
                }
            }
        }

        let mut summary = CleanupSummary::default();
        info!("accelerator slots summary");
        self.walk_slots(|slot| {
            let state = slot.summary_state();
            match state {
                "FREE" => summary.free += 1,
                "USED" => summary.used += 1,
                "BADDRV" => summary.baddrv += 1,
                "NODEV" => summary.nodev += 1,
                _ => summary.err += 1,
            }
            info!(
                sid = short_id(&slot.id()),
                name = %slot.name(),
                runtime = %slot.runtime(),
                driver = %slot.driver_name(),
                state,
                "slot"
            );
            false
        });
        info!(
            valid = summary.valid(),
            invalid = summary.invalid(),
            "accelerator slot cleanup done"
        );
        summary
    }

    fn persist_if_changed(&self, slot: &Slot, changed: bool) {
        if changed {
            if let Err(err) = self.inner.update_to_store(slot) {
                warn!(sid = short_id(&slot.id()), error = %err, "failed to persist slot state");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use accel_core::CoreConfig;
    use accel_driver::{AcceleratorDriver, MockDriver};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn config(dir: &TempDir) -> CoreConfig {
        CoreConfig {
            data_root: dir.path().to_path_buf(),
            ..Default::default()
        }
    }

    async fn controller_with_mock(dir: &TempDir, devices: usize) -> (Controller, Arc<MockDriver>) {
        let controller = Controller::new(config(dir)).unwrap();
        let mock = Arc::new(MockDriver::with_devices(
            "drv",
            vec!["rt:1.0".to_string()],
            devices,
        ));
        controller.register_builtin(mock.clone()).await.unwrap();
        (controller, mock)
    }

    #[tokio::test]
    async fn test_missing_driver_marks_bad_driver() {
        let dir = TempDir::new().unwrap();
        {
            let (controller, _) = controller_with_mock(&dir, 4).await;
            controller
                .allocate_global_slot("gpu0", "sid-1", "rt:1.0", "drv", vec![])
                .await
                .unwrap();
        }

        // restart without the driver
        let controller = Controller::new(config(&dir)).unwrap();
        let summary = controller.cleanup_slots(&HashMap::new()).await;
        assert_eq!(summary.baddrv, 1);
        assert_eq!(summary.valid(), 0);
        assert!(controller.slot_by_id("sid-1").unwrap().is_bad_driver());
    }

    #[tokio::test]
    async fn test_lost_slot_is_reallocated() {
        let dir = TempDir::new().unwrap();
        let (controller, mock) = controller_with_mock(&dir, 4).await;
        controller
            .allocate_global_slot("gpu0", "sid-1", "rt:1.0", "drv", vec![])
            .await
            .unwrap();

        mock.forget_slot("sid-1");
        let summary = controller.cleanup_slots(&HashMap::new()).await;

        assert_eq!(summary.free, 1);
        assert_eq!(summary.invalid(), 0);
        assert_eq!(mock.slot_count(), 1);
        assert!(controller.slot_by_id("sid-1").unwrap().is_healthy());
    }

    #[tokio::test]
    async fn test_unrecoverable_slot_marked_no_dev() {
        let dir = TempDir::new().unwrap();
        // a single device: once lost while busy, re-allocation cannot succeed
        let (controller, mock) = controller_with_mock(&dir, 1).await;
        controller
            .allocate_global_slot("gpu0", "sid-1", "rt:1.0", "drv", vec![])
            .await
            .unwrap();

        mock.forget_slot("sid-1");
        // occupy the only device so recovery fails
        mock.allocate_slot("sid-other", "rt:1.0", &[]).await.unwrap();

        let summary = controller.cleanup_slots(&HashMap::new()).await;
        assert_eq!(summary.nodev, 1);
        assert!(controller.slot_by_id("sid-1").unwrap().is_no_dev());
    }

    #[tokio::test]
    async fn test_corrupt_slot_marks_bad_driver_for_slot_only() {
        let dir = TempDir::new().unwrap();
        let (controller, mock) = controller_with_mock(&dir, 4).await;
        controller
            .allocate_global_slot("gpu0", "sid-1", "rt:1.0", "drv", vec![])
            .await
            .unwrap();
        controller
            .allocate_global_slot("gpu1", "sid-2", "rt:1.0", "drv", vec![])
            .await
            .unwrap();

        mock.poison_slot("sid-1");
        let summary = controller.cleanup_slots(&HashMap::new()).await;

        assert_eq!(summary.baddrv, 1);
        assert_eq!(summary.free, 1);
        assert!(controller.slot_by_id("sid-1").unwrap().is_bad_driver());
        assert!(controller.slot_by_id("sid-2").unwrap().is_healthy());
    }

    #[tokio::test]
    async fn test_leaked_container_slot_released() {
        let dir = TempDir::new().unwrap();
        let (controller, mock) = controller_with_mock(&dir, 4).await;
        let slot = controller
            .allocate_container_slot("sid-1", "rt:1.0", "drv", vec![])
            .await
            .unwrap();
        controller.set_owner(&slot, "cid-dead").unwrap();

        let summary = controller.cleanup_slots(&HashMap::new()).await;
        assert_eq!(summary, CleanupSummary::default());
        assert_eq!(mock.slot_count(), 0);
        assert!(controller.slot_by_id("sid-1").is_err());
    }

    #[tokio::test]
    async fn test_owner_adopted_when_recorded_owner_gone() {
        let dir = TempDir::new().unwrap();
        let (controller, _) = controller_with_mock(&dir, 4).await;
        let slot = controller
            .allocate_global_slot("gpu0", "sid-1", "rt:1.0", "drv", vec![])
            .await
            .unwrap();
        controller.set_owner(&slot, "cid-dead").unwrap();

        let active = HashMap::from([("sid-1".to_string(), "cid-live".to_string())]);
        controller.cleanup_slots(&active).await;

        assert_eq!(controller.slot_by_id("sid-1").unwrap().owner(), "cid-live");
    }

    #[tokio::test]
    async fn test_owner_kept_when_recorded_owner_still_live() {
        let dir = TempDir::new().unwrap();
        let (controller, _) = controller_with_mock(&dir, 4).await;
        let slot = controller
            .allocate_global_slot("gpu0", "sid-1", "rt:1.0", "drv", vec![])
            .await
            .unwrap();
        controller.set_owner(&slot, "cid-b").unwrap();

        // both cid-a and cid-b are live containers; the daemon's value wins
        let active = HashMap::from([
            ("sid-1".to_string(), "cid-a".to_string()),
            ("sid-9".to_string(), "cid-b".to_string()),
        ]);
        controller.cleanup_slots(&active).await;

        assert_eq!(controller.slot_by_id("sid-1").unwrap().owner(), "cid-b");
    }

    #[tokio::test]
    async fn test_stale_owner_of_global_slot_cleared() {
        let dir = TempDir::new().unwrap();
        let (controller, _) = controller_with_mock(&dir, 4).await;
        let slot = controller
            .allocate_global_slot("gpu0", "sid-1", "rt:1.0", "drv", vec![])
            .await
            .unwrap();
        controller.set_owner(&slot, "cid-dead").unwrap();

        let summary = controller.cleanup_slots(&HashMap::new()).await;
        assert_eq!(summary.free, 1);
        assert_eq!(controller.slot_by_id("sid-1").unwrap().owner(), "");
    }

    #[tokio::test]
    async fn test_interrupted_release_completed() {
        let dir = TempDir::new().unwrap();
        let (controller, mock) = controller_with_mock(&dir, 4).await;
        let slot = controller
            .allocate_global_slot("gpu0", "sid-1", "rt:1.0", "drv", vec![])
            .await
            .unwrap();
        // crash mid-release: marked but never deleted
        slot.mark_in_delete();
        controller.inner.update_to_store(&slot).unwrap();

        let summary = controller.cleanup_slots(&HashMap::new()).await;
        assert_eq!(summary, CleanupSummary::default());
        assert_eq!(mock.slot_count(), 0);
        assert!(controller.slot_by_id("sid-1").is_err());
    }

    #[tokio::test]
    async fn test_cleanup_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let (controller, mock) = controller_with_mock(&dir, 4).await;
        controller
            .allocate_global_slot("gpu0", "sid-1", "rt:1.0", "drv", vec![])
            .await
            .unwrap();
        let slot = controller
            .allocate_container_slot("sid-2", "rt:1.0", "drv", vec![])
            .await
            .unwrap();
        controller.set_owner(&slot, "cid-1").unwrap();

        let active = HashMap::from([("sid-2".to_string(), "cid-1".to_string())]);
        let first = controller.cleanup_slots(&active).await;
        let second = controller.cleanup_slots(&active).await;

        assert_eq!(first, second);
        assert_eq!(first.free, 1);
        assert_eq!(first.used, 1);
        assert_eq!(mock.slot_count(), 2);
    }
}
