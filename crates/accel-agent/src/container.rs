//! Container model
//!
//! acceld does not own the container runtime; this is the slice of a
//! container the binding layer reads and writes: its accelerator requests
//! and the three maps the runtime later injects into the container
//! configuration. The record is persisted to the container's state
//! directory so an `update` can rewrite it on disk before old slots are
//! released.

use crate::mounts::AccelMount;
use crate::Result;
use accel_core::HostConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

const CONFIG_FILE: &str = "config.json";

/// The accelerator-relevant state of one container
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Container {
    /// Container id
    pub id: String,

    /// Human-readable container name
    pub name: String,

    /// Per-container state directory; merged mounts live under
    /// `<root>/accelerators/`
    pub root: PathBuf,

    /// Host configuration slice owned by this subsystem
    pub host_config: HostConfig,

    /// Mounts to inject, keyed by destination
    #[serde(default)]
    pub accel_bindings: HashMap<String, AccelMount>,

    /// Devices to inject, destination -> host path
    #[serde(default)]
    pub accel_devices: HashMap<String, String>,

    /// Environment assignments to inject
    #[serde(default)]
    pub accel_environments: HashMap<String, String>,
}

impl Container {
    /// Create a container record rooted at `root`
    pub fn new(id: impl Into<String>, name: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            root: root.into(),
            host_config: HostConfig::default(),
            accel_bindings: HashMap::new(),
            accel_devices: HashMap::new(),
            accel_environments: HashMap::new(),
        }
    }

    /// Path of the persisted record
    pub fn config_path(&self) -> PathBuf {
        self.root.join(CONFIG_FILE)
    }

    /// Persist the record to the container state directory. The write is
    /// atomic so a crash mid-update leaves the previous record intact.
    pub fn save(&self) -> Result<()> {
        fs::create_dir_all(&self.root)?;
        let path = self.config_path();
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(self)?)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Load a container record from its state directory
    pub fn load(root: &Path) -> Result<Self> {
        let bytes = fs::read(root.join(CONFIG_FILE))?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Load every container record under the daemon's containers directory.
    /// Unreadable records are skipped with a warning.
    pub fn load_all(containers_dir: &Path) -> Vec<Container> {
        let mut containers = Vec::new();
        let entries = match fs::read_dir(containers_dir) {
            Ok(entries) => entries,
            Err(_) => return containers,
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            match Self::load(&path) {
                Ok(container) => containers.push(container),
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "skipping unreadable container record")
                }
            }
        }
        containers
    }

    /// The `slot-id -> container-id` pairs this container contributes to
    /// start-up reconciliation
    pub fn active_slots(&self) -> impl Iterator<Item = (String, String)> + '_ {
        self.host_config
            .accelerators
            .iter()
            .filter(|cfg| !cfg.sid.is_empty())
            .map(|cfg| (cfg.sid.clone(), self.id.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use accel_core::AcceleratorConfig;
    use tempfile::TempDir;

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("c1");
        let mut container = Container::new("cid-1", "web", &root);
        let mut cfg = AcceleratorConfig::new("a", "cuda:7.5");
        cfg.sid = "sid-1".to_string();
        cfg.is_persistent = true;
        container.host_config.accelerators.push(cfg);
        container
            .accel_environments
            .insert("PATH".to_string(), "/opt/acc/bin".to_string());
        container.save().unwrap();

        let loaded = Container::load(&root).unwrap();
        assert_eq!(loaded.id, "cid-1");
        assert_eq!(loaded.host_config.accelerators.len(), 1);
        assert_eq!(loaded.accel_environments["PATH"], "/opt/acc/bin");
    }

    #[test]
    fn test_load_all_skips_garbage() {
        let dir = TempDir::new().unwrap();
        let c1 = Container::new("cid-1", "a", dir.path().join("c1"));
        c1.save().unwrap();

        // a directory without a config file
        fs::create_dir_all(dir.path().join("junk")).unwrap();
        // a corrupt config file
        fs::create_dir_all(dir.path().join("c2")).unwrap();
        fs::write(dir.path().join("c2").join(CONFIG_FILE), b"{not json").unwrap();

        let containers = Container::load_all(dir.path());
        assert_eq!(containers.len(), 1);
        assert_eq!(containers[0].id, "cid-1");
    }

    #[test]
    fn test_active_slots() {
        let dir = TempDir::new().unwrap();
        let mut container = Container::new("cid-1", "a", dir.path());
        let mut bound = AcceleratorConfig::new("a", "rt");
        bound.sid = "sid-1".to_string();
        container.host_config.accelerators.push(bound);
        container
            .host_config
            .accelerators
            .push(AcceleratorConfig::new("b", "rt"));

        let active: Vec<_> = container.active_slots().collect();
        assert_eq!(active, vec![("sid-1".to_string(), "cid-1".to_string())]);
    }
}
