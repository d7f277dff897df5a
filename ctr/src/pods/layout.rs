//! Path helpers for one pod directory's fixed internal layout
//! (`config`, `deps/`, `rootfs/`, `upper/`, `work/`), shared by `store.rs`
//! whether the directory currently lives under `active/`, `graveyard/`, or
//! a scoped tmp dir mid-prepare.

use std::path::{Path, PathBuf};

pub fn config_path(pod_dir: &Path) -> PathBuf {
    pod_dir.join("config")
}

/// Image ids resolved from `config.images` at `prepare` time, in the same
/// order, persisted alongside `config` so `run_prepared` mounts the exact
/// images that were ref-counted into `deps/` rather than re-resolving
/// selectors that may have been retagged since.
pub fn resolved_images_path(pod_dir: &Path) -> PathBuf {
    pod_dir.join("resolved-images")
}

pub fn deps_dir(pod_dir: &Path) -> PathBuf {
    pod_dir.join("deps")
}

pub fn dep_path(pod_dir: &Path, image_id: &str) -> PathBuf {
    deps_dir(pod_dir).join(image_id)
}

pub fn rootfs_dir(pod_dir: &Path) -> PathBuf {
    pod_dir.join("rootfs")
}

pub fn upper_dir(pod_dir: &Path) -> PathBuf {
    pod_dir.join("upper")
}

pub fn work_dir(pod_dir: &Path) -> PathBuf {
    pod_dir.join("work")
}

pub fn unit_dir(pod_dir: &Path) -> PathBuf {
    rootfs_dir(pod_dir).join("etc/systemd/system")
}
