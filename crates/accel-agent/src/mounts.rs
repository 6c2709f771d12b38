//! Mount, device, and environment merging
//!
//! A container may bind several slots, and their drivers may hand back
//! overlapping mounts, devices, and environment variables. This module
//! reconciles them into the three maps the runtime injects:
//!
//! - devices are de-duplicated by destination, conflicting sources are a
//!   hard error
//! - environment values are combined as ordered, duplicate-free lists,
//!   keeping the delimiter the prior value already uses
//! - mounts are keyed by destination; two mounts sharing one destination
//!   are merged into a synthetic source directory, union-mounted when the
//!   kernel offers overlay/aufs and copied otherwise

use crate::{AgentError, Result};
use accel_core::Mount;
use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const MERGED_MOUNTS_DIR: &str = "accelerators";

const PROPAGATION_MODES: [&str; 6] =
    ["shared", "slave", "private", "rshared", "rslave", "rprivate"];

/// A driver-supplied mount after mode parsing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccelMount {
    pub source: String,
    pub destination: String,
    /// Mode string with the cover flag stripped
    pub mode: String,
    pub rw: bool,
    pub propagation: String,
    /// A covering mount yields to whatever is already at the destination
    pub cover: bool,
}

/// Parse a raw driver mount; the `cv` mode token marks a covering mount
pub fn parse_accel_mount(mount: &Mount) -> Result<AccelMount> {
    let mut cover = false;
    let mut rw = true;
    let mut propagation = String::new();
    let mut mode_tokens = Vec::new();

    for token in mount.mode.split(',') {
        match token {
            "" => {}
            "cv" => cover = true,
            "ro" => {
                rw = false;
                mode_tokens.push(token);
            }
            "rw" => {
                rw = true;
                mode_tokens.push(token);
            }
            _ if PROPAGATION_MODES.contains(&token) => {
                propagation = token.to_string();
                mode_tokens.push(token);
            }
            _ => {
                return Err(AgentError::Mount(format!(
                    "invalid mode \"{}\" in accelerator mount {}",
                    token, mount.destination
                )))
            }
        }
    }

    Ok(AccelMount {
        source: mount.source.clone(),
        destination: mount.destination.clone(),
        mode: mode_tokens.join(","),
        rw,
        propagation,
        cover,
    })
}

/// Merge driver environment assignments into the container's map
pub fn merge_env(existing: &mut HashMap<String, String>, new: &HashMap<String, String>) {
    for (key, value) in new {
        let merged = match existing.get(key) {
            Some(prior) => env_cat(prior, value),
            None => value.clone(),
        };
        existing.insert(key.clone(), merged);
    }
}

fn env_splitter(s: &str) -> char {
    if s.contains(',') {
        ','
    } else if s.contains(';') {
        ';'
    } else {
        ':'
    }
}

/// Append the parts of `newstr` that `former` does not already carry,
/// keeping the delimiter `former` uses
fn env_cat(former: &str, newstr: &str) -> String {
    if former.is_empty() {
        return newstr.to_string();
    }
    if newstr.is_empty() {
        return former.to_string();
    }

    let fsep = env_splitter(former);
    let nsep = env_splitter(newstr);
    let mut seen: HashSet<String> = former.split(fsep).map(str::to_string).collect();
    let mut merged = former.to_string();
    for part in newstr.split(nsep) {
        if seen.insert(part.to_string()) {
            merged.push(fsep);
            merged.push_str(part);
        }
    }
    merged
}

/// Merge driver device paths into the container's map, de-duplicated by
/// destination
pub fn merge_devices(existing: &mut HashMap<String, String>, devices: &[String]) -> Result<()> {
    for dev in devices {
        match existing.get(dev) {
            Some(prior) if prior != dev => {
                return Err(AgentError::Mount(format!("device {} conflict", dev)));
            }
            Some(_) => {}
            None => {
                existing.insert(dev.clone(), dev.clone());
            }
        }
    }
    Ok(())
}

/// Merge driver mounts into the container's map, keyed by destination
pub fn merge_mounts(
    existing: &mut HashMap<String, AccelMount>,
    mounts: &[Mount],
    container_root: &Path,
) -> Result<()> {
    for mount in mounts {
        let am = parse_accel_mount(mount)?;
        let prior = match existing.get(&am.destination) {
            None => {
                existing.insert(am.destination.clone(), am);
                continue;
            }
            Some(prior) => prior.clone(),
        };

        if prior.cover != am.cover {
            return Err(AgentError::Mount(format!(
                "failed to merge accel mount ({}) because of different cover mode",
                am.destination
            )));
        }
        if prior.rw != am.rw || prior.mode != am.mode || prior.propagation != am.propagation {
            return Err(AgentError::Mount(format!(
                "failed to merge accel mount ({}) because of different mount mode",
                am.destination
            )));
        }
        if prior.source == am.source {
            // identical mount from another slot; keep the first
            continue;
        }
        if am.cover {
            // the first mount wins, the covering one is discarded
            continue;
        }

        warn!(
            destination = %am.destination,
            first = %prior.source,
            second = %am.source,
            "conflicting accelerator mounts, merging sources"
        );
        let merged_source =
            merge_accel_path(&prior.source, &am.source, &am.destination, container_root)?;
        let mut merged = am;
        merged.source = merged_source;
        existing.insert(merged.destination.clone(), merged);
    }
    Ok(())
}

fn real_path(path: &str) -> Result<PathBuf> {
    fs::canonicalize(path)
        .map_err(|_| AgentError::Mount(format!("Directory path {} illegal", path)))
}

/// Merge two mount sources destined for the same path into one synthetic
/// source under `<containerRoot>/accelerators/<sanitized-destination>/`
fn merge_accel_path(
    src: &str,
    other: &str,
    dest: &str,
    container_root: &Path,
) -> Result<String> {
    // the two sources may be links to the same tree
    let real_src = real_path(src)?;
    let real_other = real_path(other)?;
    if real_src == real_other {
        return Ok(other.to_string());
    }

    // a directory and a regular file never merge
    if real_src.is_dir() != real_other.is_dir() {
        return Err(AgentError::Mount(
            "Fail to merge directory with regular file".to_string(),
        ));
    }
    if !real_src.is_dir() {
        // two regular files merge only if their content matches
        if md5_file(&real_src)? == md5_file(&real_other)? {
            return Ok(other.to_string());
        }
        return Err(AgentError::Mount(format!(
            "Conflicting file: {} and {}",
            src, other
        )));
    }

    // "/usr/lib64" becomes "usr_lib64"; the directory is removed when the
    // container is deleted
    let dir_name = dest.trim_start_matches('/').replace('/', "_");
    let new_path = container_root.join(MERGED_MOUNTS_DIR).join(&dir_name);
    fs::create_dir_all(&new_path)?;
    debug!(path = %new_path.display(), "created merged source for conflicting mounts");

    // detect per-file conflicts before attempting any merge
    let src_files: HashMap<String, PathBuf> = walk_files(&real_src)?.into_iter().collect();
    for (rel, path) in walk_files(&real_other)? {
        if let Some(prior) = src_files.get(&rel) {
            if md5_file(&path)? != md5_file(prior)? {
                return Err(AgentError::Mount(format!(
                    "Conflicting file: {} in {} and {}",
                    rel, src, other
                )));
            }
        }
    }

    // prefer a kernel union mount, fall back to a recursive copy
    match unionfs_supported() {
        Some("aufs") => {
            debug!("aufs supported, merging directories through aufs");
            if aufs_merge(&real_src, &real_other, &new_path).is_ok() {
                return Ok(new_path.to_string_lossy().into_owned());
            }
            warn!("aufs merge failed, copying instead");
        }
        Some("overlay") => {
            debug!("overlayfs supported, merging directories through overlayfs");
            if overlay_merge(&real_src, &real_other, &new_path).is_ok() {
                return Ok(new_path.to_string_lossy().into_owned());
            }
            warn!("overlayfs merge failed, copying instead");
        }
        _ => {}
    }

    dir_copy(&real_src, &new_path)?;
    dir_copy(&real_other, &new_path)?;
    Ok(new_path.to_string_lossy().into_owned())
}

/// Remove the merged-mount working tree of a container, unmounting any
/// union mount a prior crash left behind
pub fn remove_merged_mounts(container_root: &Path) -> Result<()> {
    let merged = container_root.join(MERGED_MOUNTS_DIR);
    let entries = match fs::read_dir(&merged) {
        Ok(entries) => entries,
        Err(_) => return Ok(()),
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            match nix::mount::umount(&path) {
                Ok(()) => debug!(path = %path.display(), "unmounted merged accelerator mount"),
                Err(_) => {
                    debug!(path = %path.display(), "merged mount not mounted, removing directly")
                }
            }
            fs::remove_dir_all(&path)?;
        } else {
            warn!(path = %path.display(), "unexpected regular file in accelerators directory");
            fs::remove_file(&path)?;
        }
    }
    Ok(())
}

fn walk_files(root: &Path) -> Result<Vec<(String, PathBuf)>> {
    let mut files = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.is_dir() {
                stack.push(path);
            } else {
                let rel = path
                    .strip_prefix(root)
                    .unwrap_or(&path)
                    .to_string_lossy()
                    .into_owned();
                files.push((rel, path));
            }
        }
    }
    Ok(files)
}

fn md5_file(path: &Path) -> Result<String> {
    let bytes = fs::read(path)?;
    let mut hasher = Md5::new();
    hasher.update(&bytes);
    Ok(hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect())
}

fn dir_copy(src: &Path, dest: &Path) -> Result<()> {
    if src == dest {
        return Ok(());
    }
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        copy_tree(&entry.path(), &dest.join(entry.file_name()))?;
    }
    Ok(())
}

fn copy_tree(src: &Path, dest: &Path) -> Result<()> {
    if src.is_dir() {
        fs::create_dir_all(dest)?;
        for entry in fs::read_dir(src)? {
            let entry = entry?;
            copy_tree(&entry.path(), &dest.join(entry.file_name()))?;
        }
    } else {
        fs::copy(src, dest)?;
    }
    Ok(())
}

fn unionfs_supported() -> Option<&'static str> {
    let filesystems = fs::read_to_string("/proc/filesystems").ok()?;
    for line in filesystems.lines() {
        if line.contains("aufs") {
            return Some("aufs");
        }
        if line.contains("overlay") {
            return Some("overlay");
        }
    }
    None
}

fn aufs_merge(ldir: &Path, udir: &Path, dest: &Path) -> Result<()> {
    let data = format!("br:{}=ro:{}=ro", ldir.display(), udir.display());
    nix::mount::mount(Some("none"), dest, Some("aufs"), nix::mount::MsFlags::empty(), Some(data.as_str()))
        .map_err(|e| AgentError::Mount(format!("aufs merge failed: {}", e)))
}

fn overlay_merge(ldir: &Path, udir: &Path, dest: &Path) -> Result<()> {
    let data = format!("lowerdir={}:{}", ldir.display(), udir.display());
    nix::mount::mount(
        Some("overlay"),
        dest,
        Some("overlay"),
        nix::mount::MsFlags::empty(),
        Some(data.as_str()),
    )
    .map_err(|e| AgentError::Mount(format!("overlay merge failed: {}", e)))
}
