//! Container binding layer
//!
//! Drives the controller from the container lifecycle:
//!
//! - *create*: [`merge_and_verify`] folds the image `runtime` label into the
//!   requested accelerators, binds requests to existing global slots, and
//!   verifies every runtime has a driver
//! - *start*: [`allocate_persistent`] (re-)allocates slots for persistent
//!   entries, then [`initialize_accel_resources`] allocates the
//!   non-persistent ones, prepares every bound slot, and merges the results
//!   into the container's injection maps
//! - *stop/remove*: [`release_accel_resources`] clears the injected state
//!   and returns or releases the slots
//! - *update*: [`update_accel_config`] re-allocates persistent entries,
//!   releasing old slots only after the container record is on disk

use crate::container::Container;
use crate::{mounts, AgentError, Result};
use accel_controller::{Controller, Slot};
use accel_core::{
    generate_id, parse_runtime_label, validate_accel, validate_accel_name,
    validate_accel_runtime, AcceleratorConfig, HostConfig, SlotScope,
};
use std::collections::HashMap;
use tracing::{debug, warn};

/// Merge image accelerator requirements into the host configuration and
/// verify every entry has a satisfiable runtime. Invoked at container
/// create.
pub async fn merge_and_verify(
    controller: &Controller,
    host_config: &mut HostConfig,
    image_labels: Option<&HashMap<String, String>>,
) -> Result<()> {
    // reject malformed and duplicate user-supplied requests
    for (idx, cfg) in host_config.accelerators.iter().enumerate() {
        if !validate_accel_name(&cfg.name) || !validate_accel_runtime(&cfg.runtime) {
            return Err(AgentError::Core(accel_core::Error::bad_request(format!(
                "invalid accelerator request \"{}={}\"",
                cfg.name, cfg.runtime
            ))));
        }
        validate_accel(cfg, &host_config.accelerators[..idx])?;
    }

    // bind user requests naming an existing global slot
    for cfg in host_config.accelerators.iter_mut() {
        if !cfg.is_persistent || !cfg.driver.is_empty() {
            continue;
        }
        bind_global_slot(controller, cfg)?;
    }

    // fold the image `runtime` label in
    if let Some(label) = image_labels.and_then(|labels| labels.get("runtime")) {
        for img_cfg in parse_runtime_label(label)? {
            match host_config.accelerators.iter().find(|c| c.name == img_cfg.name) {
                Some(existing) => {
                    if existing.runtime != img_cfg.runtime {
                        return Err(AgentError::Core(accel_core::Error::bad_request(format!(
                            "accelerator \"{}\": image requires runtime \"{}\" but \"{}\" was requested",
                            img_cfg.name, img_cfg.runtime, existing.runtime
                        ))));
                    }
                }
                None => host_config.accelerators.push(img_cfg),
            }
        }
    }

    // check availability of all accelerators
    for cfg in host_config.accelerators.iter_mut() {
        let driver = controller.query(&cfg.runtime, &cfg.driver).await?;
        cfg.driver = driver;
    }

    Ok(())
}

/// If the request's `runtime` names an existing global slot (by name or
/// id), bind to it by copying its id, driver, and runtime into the request.
fn bind_global_slot(controller: &Controller, cfg: &mut AcceleratorConfig) -> Result<()> {
    let slot = match controller
        .slot_by_name(&cfg.runtime)
        .or_else(|_| controller.slot_by_id(&cfg.runtime))
    {
        Ok(slot) => slot,
        Err(_) => return Ok(()), // not a slot reference; leave for driver lookup
    };
    if slot.scope() != SlotScope::Global {
        return Ok(());
    }
    if !slot.owner().is_empty() {
        return Err(AgentError::Core(accel_core::Error::forbidden(format!(
            "slot {} is in use by container {}",
            cfg.runtime,
            slot.owner()
        ))));
    }
    if slot.is_bad_driver() || slot.is_no_dev() {
        return Err(AgentError::Core(accel_core::Error::no_service(format!(
            "slot {} is not usable (state {})",
            cfg.runtime,
            slot.summary_state()
        ))));
    }

    debug!(name = %cfg.name, slot = %slot.name(), "binding request to global slot");
    cfg.sid = slot.id();
    cfg.driver = slot.driver_name();
    cfg.runtime = slot.runtime();
    Ok(())
}

/// Allocate slots for persistent entries. Invoked at container start,
/// before [`initialize_accel_resources`]. Entries already bound to a live
/// slot only get their ownership stamped; entries whose slot vanished (a
/// crash while calling the plugin) are re-allocated.
pub async fn allocate_persistent(controller: &Controller, container: &mut Container) -> Result<()> {
    let container_id = container.id.clone();
    let mut fresh: Vec<(usize, Slot)> = Vec::new();

    let result = async {
        for idx in 0..container.host_config.accelerators.len() {
            let cfg = &container.host_config.accelerators[idx];
            if !cfg.is_persistent {
                continue;
            }

            if !cfg.sid.is_empty() {
                match controller.slot_by_id(&cfg.sid) {
                    Ok(slot) => {
                        claim_slot(controller, &slot, &container_id)?;
                        continue;
                    }
                    Err(_) => {
                        warn!(
                            container = %container.name,
                            accel = %cfg.name,
                            "persistent accelerator lost its slot, re-allocating"
                        );
                        container.host_config.accelerators[idx].sid.clear();
                    }
                }
            }

            let cfg = &container.host_config.accelerators[idx];
            let driver = controller.query(&cfg.runtime, &cfg.driver).await?;
            let slot = controller
                .allocate_container_slot(&generate_id(), &cfg.runtime, &driver, cfg.options.clone())
                .await?;
            controller.set_owner(&slot, &container_id)?;

            let cfg = &mut container.host_config.accelerators[idx];
            cfg.sid = slot.id();
            cfg.driver = driver;
            fresh.push((idx, slot));
        }
        Ok(())
    }
    .await;

    if result.is_err() {
        rollback_slots(controller, container, &fresh).await;
    }
    result
}

/// Allocate non-persistent slots and prepare every slot bound to the
/// container. Invoked at container start, after [`allocate_persistent`].
pub async fn initialize_accel_resources(
    controller: &Controller,
    container: &mut Container,
) -> Result<()> {
    if container.host_config.accelerators.is_empty() {
        return Ok(());
    }
    debug!(container = %container.name, "initializing accelerator resources");

    let container_id = container.id.clone();
    let mut fresh: Vec<(usize, Slot)> = Vec::new();

    let result = async {
        for idx in 0..container.host_config.accelerators.len() {
            let cfg = &container.host_config.accelerators[idx];
            if cfg.is_persistent {
                continue;
            }
            if !cfg.driver.is_empty() && !cfg.sid.is_empty() {
                // leftovers of a daemon kill while the container ran; the
                // slot was released by reconciliation, allocate anew
                warn!(
                    container = %container.name,
                    accel = %cfg.name,
                    sid = %cfg.sid,
                    "non-persistent accelerator carries a stale binding"
                );
            }

            let driver = controller.query(&cfg.runtime, &cfg.driver).await?;
            let slot = controller
                .allocate_container_slot(&generate_id(), &cfg.runtime, &driver, cfg.options.clone())
                .await?;
            controller.set_owner(&slot, &container_id)?;

            let cfg = &mut container.host_config.accelerators[idx];
            cfg.sid = slot.id();
            cfg.driver = driver;
            fresh.push((idx, slot));
        }

        // claim global slots bound at create time, then prepare everything
        for cfg in &container.host_config.accelerators {
            if cfg.sid.is_empty() {
                continue;
            }
            let slot = controller.slot_by_id(&cfg.sid)?;
            if slot.owner() != container_id {
                claim_slot(controller, &slot, &container_id)?;
            }

            let slot_config = controller.prepare_slot(&slot).await?;
            mounts::merge_mounts(&mut container.accel_bindings, &slot_config.binds, &container.root)?;
            mounts::merge_devices(&mut container.accel_devices, &slot_config.devices)?;
            mounts::merge_env(&mut container.accel_environments, &slot_config.envs);
        }
        Ok(())
    }
    .await;

    if result.is_err() {
        container.accel_bindings.clear();
        container.accel_devices.clear();
        container.accel_environments.clear();
        if let Err(err) = mounts::remove_merged_mounts(&container.root) {
            warn!(container = %container.name, error = %err, "failed to clean merged mounts");
        }
        rollback_slots(controller, container, &fresh).await;
    }
    result
}

/// Release the accelerator resources of a container. Invoked at container
/// stop (`release_persistent = false`) and remove (`true`).
///
/// A missing controller is tolerated: the on-disk state is still cleaned
/// up, only the plugin calls are skipped.
pub async fn release_accel_resources(
    controller: Option<&Controller>,
    container: &mut Container,
    release_persistent: bool,
) -> Result<()> {
    if container.host_config.accelerators.is_empty() {
        return Ok(());
    }
    debug!(container = %container.name, "releasing accelerator resources");

    // clear the injected state and the merged-mount working tree
    container.accel_bindings.clear();
    container.accel_devices.clear();
    container.accel_environments.clear();
    mounts::remove_merged_mounts(&container.root)?;

    for cfg in container.host_config.accelerators.iter_mut() {
        if cfg.sid.is_empty() {
            continue;
        }
        if cfg.is_persistent && !release_persistent {
            continue;
        }
        let sid = std::mem::take(&mut cfg.sid);
        cfg.driver.clear();

        let controller = match controller {
            Some(controller) => controller,
            None => {
                // only happens when the daemon restarts after a kill
                debug!("accelerator controller not initialized, skipping driver release");
                continue;
            }
        };

        match controller.slot_by_id(&sid) {
            Err(err) => debug!(sid = %sid, error = %err, "unknown slot"),
            Ok(slot) => {
                let outcome = if slot.scope() == SlotScope::Global {
                    // global slots are returned, not destroyed
                    controller.set_owner(&slot, "").map_err(AgentError::from)
                } else {
                    controller.release(&slot, true).await.map_err(AgentError::from)
                };
                if let Err(err) = outcome {
                    warn!(sid = %sid, error = %err, "failed to release slot");
                }
            }
        }
    }

    Ok(())
}

/// Update the persistent accelerator entries of a container.
///
/// Matching is by name and the runtime must not change. Updated entries
/// receive fresh slots; the old slots are released only after the
/// container's on-disk record has been rewritten, so a crash mid-update
/// cannot orphan the new allocation.
pub async fn update_accel_config(
    controller: &Controller,
    new_host: &HostConfig,
    container: &mut Container,
) -> Result<()> {
    let container_id = container.id.clone();
    let mut fresh: Vec<(usize, Slot)> = Vec::new();
    let mut replaced: Vec<(usize, AcceleratorConfig)> = Vec::new();

    let result = async {
        for new_cfg in &new_host.accelerators {
            let Some(idx) = container
                .host_config
                .accelerators
                .iter()
                .position(|c| c.name == new_cfg.name)
            else {
                return Err(AgentError::Core(accel_core::Error::not_found(format!(
                    "no accelerator named \"{}\"",
                    new_cfg.name
                ))));
            };
            let current = &container.host_config.accelerators[idx];
            if !current.is_persistent {
                return Err(AgentError::Core(accel_core::Error::bad_request(format!(
                    "accelerator \"{}\" is not persistent and cannot be updated",
                    new_cfg.name
                ))));
            }
            if current.runtime != new_cfg.runtime {
                return Err(AgentError::Core(accel_core::Error::bad_request(format!(
                    "accelerator \"{}\": runtime cannot change on update",
                    new_cfg.name
                ))));
            }
            let unchanged = current.options == new_cfg.options
                && (new_cfg.driver.is_empty() || new_cfg.driver == current.driver);
            if unchanged {
                continue;
            }

            let driver = controller.query(&new_cfg.runtime, &new_cfg.driver).await?;
            let slot = controller
                .allocate_container_slot(&generate_id(), &new_cfg.runtime, &driver, new_cfg.options.clone())
                .await?;
            controller.set_owner(&slot, &container_id)?;

            replaced.push((idx, container.host_config.accelerators[idx].clone()));
            let cfg = &mut container.host_config.accelerators[idx];
            cfg.sid = slot.id();
            cfg.driver = driver;
            cfg.options = new_cfg.options.clone();
            fresh.push((idx, slot));
        }

        // the new bindings must be durable before the old slots go away
        container.save()?;
        Ok(())
    }
    .await;

    if let Err(err) = result {
        for (idx, old_cfg) in replaced {
            container.host_config.accelerators[idx] = old_cfg;
        }
        rollback_slots(controller, container, &fresh).await;
        return Err(err);
    }

    // now the old slots can go
    for (_, old_cfg) in replaced {
        if old_cfg.sid.is_empty() {
            continue;
        }
        match controller.slot_by_id(&old_cfg.sid) {
            Err(err) => debug!(sid = %old_cfg.sid, error = %err, "old slot already gone"),
            Ok(slot) => {
                if let Err(err) = controller.release(&slot, true).await {
                    warn!(sid = %old_cfg.sid, error = %err, "failed to release replaced slot");
                }
            }
        }
    }

    Ok(())
}

fn claim_slot(controller: &Controller, slot: &Slot, container_id: &str) -> Result<()> {
    let owner = slot.owner();
    if !owner.is_empty() && owner != container_id {
        return Err(AgentError::Core(accel_core::Error::forbidden(format!(
            "slot {} is in use by container {}",
            slot.id(),
            owner
        ))));
    }
    if slot.is_bad_driver() || slot.is_no_dev() {
        return Err(AgentError::Core(accel_core::Error::no_service(format!(
            "slot {} is not usable (state {})",
            slot.id(),
            slot.summary_state()
        ))));
    }
    if owner != container_id {
        controller.set_owner(slot, container_id)?;
    }
    Ok(())
}

async fn rollback_slots(controller: &Controller, container: &mut Container, fresh: &[(usize, Slot)]) {
    for (idx, slot) in fresh {
        if let Err(err) = controller.release(slot, true).await {
            warn!(sid = %slot.id(), error = %err, "rollback release failed");
        }
        if let Some(cfg) = container.host_config.accelerators.get_mut(*idx) {
            cfg.sid.clear();
            cfg.driver.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use accel_core::{parse_accel_spec, CoreConfig};
    use accel_driver::MockDriver;
    use std::sync::Arc;
    use tempfile::TempDir;

    async fn setup(dir: &TempDir) -> (Controller, Arc<MockDriver>) {
        let config = CoreConfig {
            data_root: dir.path().to_path_buf(),
            ..Default::default()
        };
        let controller = Controller::new(config).unwrap();
        let mock = Arc::new(MockDriver::new(
            "drv",
            vec!["fakeruntime:1.0".to_string(), "r1".to_string(), "r2".to_string(), "cuda:7.5".to_string()],
        ));
        controller.register_builtin(mock.clone()).await.unwrap();
        (controller, mock)
    }

    fn container(dir: &TempDir, id: &str) -> Container {
        Container::new(id, format!("name-{}", id), dir.path().join("containers").join(id))
    }

    fn labels(runtime: &str) -> HashMap<String, String> {
        HashMap::from([("runtime".to_string(), runtime.to_string())])
    }

    #[tokio::test]
    async fn test_merge_and_verify_fills_driver() {
        let dir = TempDir::new().unwrap();
        let (controller, _) = setup(&dir).await;

        let mut host = HostConfig::default();
        host.accelerators.push(parse_accel_spec("a=r1").unwrap());

        merge_and_verify(&controller, &mut host, None).await.unwrap();
        assert_eq!(host.accelerators[0].driver, "drv");
        assert!(host.accelerators[0].sid.is_empty());
    }

    #[tokio::test]
    async fn test_merge_and_verify_binds_global_slot() {
        let dir = TempDir::new().unwrap();
        let (controller, _) = setup(&dir).await;
        controller
            .allocate_global_slot("gpu0", "sid-1", "cuda:7.5", "drv", vec![])
            .await
            .unwrap();

        // `--accel name0=gpu0`: the slot name lands in `runtime`
        let mut host = HostConfig::default();
        host.accelerators.push(parse_accel_spec("name0=gpu0").unwrap());

        merge_and_verify(&controller, &mut host, None).await.unwrap();
        let cfg = &host.accelerators[0];
        assert_eq!(cfg.sid, "sid-1");
        assert_eq!(cfg.driver, "drv");
        assert_eq!(cfg.runtime, "cuda:7.5");
    }

    #[tokio::test]
    async fn test_merge_and_verify_rejects_owned_global_slot() {
        let dir = TempDir::new().unwrap();
        let (controller, _) = setup(&dir).await;
        let slot = controller
            .allocate_global_slot("gpu0", "sid-1", "cuda:7.5", "drv", vec![])
            .await
            .unwrap();
        controller.set_owner(&slot, "other-cid").unwrap();

        let mut host = HostConfig::default();
        host.accelerators.push(parse_accel_spec("name0=gpu0").unwrap());

        let err = merge_and_verify(&controller, &mut host, None).await.unwrap_err();
        assert!(err.to_string().contains("in use"));
    }

    #[tokio::test]
    async fn test_merge_and_verify_image_label() {
        let dir = TempDir::new().unwrap();
        let (controller, _) = setup(&dir).await;

        // image: LABEL runtime "a=r1;r2", run with --accel a=r1@drv
        let mut host = HostConfig::default();
        host.accelerators.push(parse_accel_spec("a=r1@drv").unwrap());

        merge_and_verify(&controller, &mut host, Some(&labels("a=r1;r2")))
            .await
            .unwrap();

        assert_eq!(host.accelerators.len(), 2);
        assert_eq!(host.accelerators[0].name, "a");
        assert_eq!(host.accelerators[0].runtime, "r1");
        assert_eq!(host.accelerators[0].driver, "drv");
        assert!(host.accelerators[0].is_persistent);
        assert_eq!(host.accelerators[1].name, "anon_img_accel_0");
        assert_eq!(host.accelerators[1].runtime, "r2");
        assert!(!host.accelerators[1].is_persistent);
    }

    #[tokio::test]
    async fn test_merge_and_verify_label_runtime_mismatch() {
        let dir = TempDir::new().unwrap();
        let (controller, _) = setup(&dir).await;

        let mut host = HostConfig::default();
        host.accelerators.push(parse_accel_spec("a=r1").unwrap());

        let err = merge_and_verify(&controller, &mut host, Some(&labels("a=r2")))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("runtime"));
    }

    #[tokio::test]
    async fn test_merge_and_verify_duplicate_names() {
        let dir = TempDir::new().unwrap();
        let (controller, _) = setup(&dir).await;

        let mut host = HostConfig::default();
        host.accelerators.push(parse_accel_spec("a=r1").unwrap());
        host.accelerators.push(parse_accel_spec("a=r2").unwrap());

        assert!(merge_and_verify(&controller, &mut host, None).await.is_err());
    }

    #[tokio::test]
    async fn test_merge_and_verify_rejects_bad_grammar() {
        let dir = TempDir::new().unwrap();
        let (controller, _) = setup(&dir).await;

        let mut host = HostConfig::default();
        host.accelerators.push(AcceleratorConfig::new("-bad", "r1"));
        assert!(merge_and_verify(&controller, &mut host, None).await.is_err());

        let mut host = HostConfig::default();
        host.accelerators.push(AcceleratorConfig::new("a", "r 1"));
        assert!(merge_and_verify(&controller, &mut host, None).await.is_err());
    }

    #[tokio::test]
    async fn test_merge_and_verify_unsatisfiable_runtime() {
        let dir = TempDir::new().unwrap();
        let (controller, _) = setup(&dir).await;

        let mut host = HostConfig::default();
        host.accelerators.push(parse_accel_spec("a=no-such-runtime").unwrap());

        assert!(merge_and_verify(&controller, &mut host, None).await.is_err());
    }

    #[tokio::test]
    async fn test_container_start_and_stop_round_trip() {
        let dir = TempDir::new().unwrap();
        let (controller, mock) = setup(&dir).await;

        // --accel slot0=fakeruntime:1.0@drv
        let mut c = container(&dir, "cid-1");
        c.host_config.accelerators.push(parse_accel_spec("slot0=fakeruntime:1.0@drv").unwrap());
        merge_and_verify(&controller, &mut c.host_config, None).await.unwrap();

        allocate_persistent(&controller, &mut c).await.unwrap();
        initialize_accel_resources(&controller, &mut c).await.unwrap();

        // exactly one container-scoped slot owned by the container
        let slots = controller.slots();
        assert_eq!(slots.len(), 1);
        assert_eq!(slots[0].scope(), SlotScope::Container);
        assert_eq!(slots[0].owner(), "cid-1");
        assert!(!c.accel_bindings.is_empty());
        assert!(!c.accel_devices.is_empty());
        assert!(c.accel_environments.contains_key("LD_LIBRARY_PATH"));

        // stop keeps the persistent slot, remove drops it
        release_accel_resources(Some(&controller), &mut c, false).await.unwrap();
        assert!(c.accel_bindings.is_empty());
        assert_eq!(controller.slots().len(), 1);

        release_accel_resources(Some(&controller), &mut c, true).await.unwrap();
        assert!(controller.slots().is_empty());
        assert_eq!(mock.slot_count(), 0);
        assert!(c.host_config.accelerators.iter().all(|cfg| cfg.sid.is_empty()));
    }

    #[tokio::test]
    async fn test_image_accelerators_released_on_stop() {
        let dir = TempDir::new().unwrap();
        let (controller, mock) = setup(&dir).await;

        let mut c = container(&dir, "cid-1");
        merge_and_verify(&controller, &mut c.host_config, Some(&labels("r1")))
            .await
            .unwrap();

        allocate_persistent(&controller, &mut c).await.unwrap();
        initialize_accel_resources(&controller, &mut c).await.unwrap();
        assert_eq!(controller.slots().len(), 1);

        // non-persistent slots do not survive stop
        release_accel_resources(Some(&controller), &mut c, false).await.unwrap();
        assert!(controller.slots().is_empty());
        assert_eq!(mock.slot_count(), 0);
    }

    #[tokio::test]
    async fn test_global_slot_returned_on_stop() {
        let dir = TempDir::new().unwrap();
        let (controller, _) = setup(&dir).await;
        controller
            .allocate_global_slot("gpu0", "sid-1", "cuda:7.5", "drv", vec![])
            .await
            .unwrap();

        let mut c = container(&dir, "cid-1");
        c.host_config.accelerators.push(parse_accel_spec("name0=gpu0").unwrap());
        merge_and_verify(&controller, &mut c.host_config, None).await.unwrap();
        allocate_persistent(&controller, &mut c).await.unwrap();
        initialize_accel_resources(&controller, &mut c).await.unwrap();

        let slot = controller.slot_by_id("sid-1").unwrap();
        assert_eq!(slot.owner(), "cid-1");

        release_accel_resources(Some(&controller), &mut c, true).await.unwrap();
        let slot = controller.slot_by_id("sid-1").unwrap();
        assert_eq!(slot.owner(), "");
        assert_eq!(controller.slots().len(), 1);
    }

    #[tokio::test]
    async fn test_initialize_rolls_back_on_failure() {
        let dir = TempDir::new().unwrap();
        let (controller, mock) = setup(&dir).await;

        let mut c = container(&dir, "cid-1");
        // the second entry cannot be satisfied
        merge_and_verify(&controller, &mut c.host_config, Some(&labels("r1")))
            .await
            .unwrap();
        c.host_config
            .accelerators
            .push(AcceleratorConfig::new("bad", "unsupported-rt"));

        assert!(initialize_accel_resources(&controller, &mut c).await.is_err());
        assert!(controller.slots().is_empty());
        assert_eq!(mock.slot_count(), 0);
        assert!(c.host_config.accelerators.iter().all(|cfg| cfg.sid.is_empty()));
        assert!(c.accel_bindings.is_empty());
    }

    #[tokio::test]
    async fn test_release_without_controller_cleans_state() {
        let dir = TempDir::new().unwrap();
        let (controller, _) = setup(&dir).await;

        let mut c = container(&dir, "cid-1");
        merge_and_verify(&controller, &mut c.host_config, Some(&labels("r1")))
            .await
            .unwrap();
        allocate_persistent(&controller, &mut c).await.unwrap();
        initialize_accel_resources(&controller, &mut c).await.unwrap();

        // daemon restarting: controller not yet available
        release_accel_resources(None, &mut c, true).await.unwrap();
        assert!(c.accel_bindings.is_empty());
        assert!(c.host_config.accelerators.iter().all(|cfg| cfg.sid.is_empty()));
        // the slot record stays for reconciliation to collect
        assert_eq!(controller.slots().len(), 1);
    }

    #[tokio::test]
    async fn test_allocate_persistent_reallocates_lost_slot() {
        let dir = TempDir::new().unwrap();
        let (controller, _) = setup(&dir).await;

        let mut c = container(&dir, "cid-1");
        c.host_config.accelerators.push(parse_accel_spec("a=r1").unwrap());
        merge_and_verify(&controller, &mut c.host_config, None).await.unwrap();
        // crash before the slot id ever landed: sid points nowhere
        c.host_config.accelerators[0].sid = "vanished".to_string();

        allocate_persistent(&controller, &mut c).await.unwrap();
        let sid = c.host_config.accelerators[0].sid.clone();
        assert_ne!(sid, "vanished");
        assert_eq!(controller.slot_by_id(&sid).unwrap().owner(), "cid-1");
    }

    #[tokio::test]
    async fn test_update_replaces_slot_after_saving_config() {
        let dir = TempDir::new().unwrap();
        let (controller, _) = setup(&dir).await;

        let mut c = container(&dir, "cid-1");
        c.host_config.accelerators.push(parse_accel_spec("a=r1@drv,device=00ff:06:04.1").unwrap());
        merge_and_verify(&controller, &mut c.host_config, None).await.unwrap();
        allocate_persistent(&controller, &mut c).await.unwrap();
        c.save().unwrap();
        let old_sid = c.host_config.accelerators[0].sid.clone();

        let mut new_host = HostConfig::default();
        new_host.accelerators.push(parse_accel_spec("a=r1@drv,device=00ff:06:04.2").unwrap());

        update_accel_config(&controller, &new_host, &mut c).await.unwrap();

        let new_sid = c.host_config.accelerators[0].sid.clone();
        assert_ne!(new_sid, old_sid);
        assert!(controller.slot_by_id(&old_sid).is_err());
        assert_eq!(controller.slot_by_id(&new_sid).unwrap().owner(), "cid-1");

        // the on-disk record carries the new binding
        let reloaded = Container::load(&c.root).unwrap();
        assert_eq!(reloaded.host_config.accelerators[0].sid, new_sid);
    }

    #[tokio::test]
    async fn test_update_rejects_runtime_change() {
        let dir = TempDir::new().unwrap();
        let (controller, _) = setup(&dir).await;

        let mut c = container(&dir, "cid-1");
        c.host_config.accelerators.push(parse_accel_spec("a=r1").unwrap());
        merge_and_verify(&controller, &mut c.host_config, None).await.unwrap();
        allocate_persistent(&controller, &mut c).await.unwrap();

        let mut new_host = HostConfig::default();
        new_host.accelerators.push(parse_accel_spec("a=r2").unwrap());

        let err = update_accel_config(&controller, &new_host, &mut c).await.unwrap_err();
        assert!(err.to_string().contains("runtime"));
    }

    #[tokio::test]
    async fn test_update_rejects_non_persistent() {
        let dir = TempDir::new().unwrap();
        let (controller, _) = setup(&dir).await;

        let mut c = container(&dir, "cid-1");
        merge_and_verify(&controller, &mut c.host_config, Some(&labels("r1")))
            .await
            .unwrap();
        initialize_accel_resources(&controller, &mut c).await.unwrap();

        let mut new_host = HostConfig::default();
        let mut cfg = AcceleratorConfig::new("anon_img_accel_0", "r1");
        cfg.options.push("device=00ff:06:04.2".to_string());
        new_host.accelerators.push(cfg);

        let err = update_accel_config(&controller, &new_host, &mut c).await.unwrap_err();
        assert!(err.to_string().contains("not persistent"));
    }
}
