//! The xar store: installs a named executable symlink into a selected
//! image's rootfs, execs it with the image's dependency pinned against
//! concurrent uninstall, and reclaims dangling entries.

use std::os::unix::fs::PermissionsExt;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

use ctr_types::{CtrError, ImageId, ImageSelector};

use crate::base::{owner, refcount, FileLock, LockMode};
use crate::images::ImageStore;

use super::layout;
use super::target;

#[derive(Debug, Clone)]
pub struct XarListEntry {
    pub name: String,
    pub image_id: Option<ImageId>,
    pub exec_relpath: Option<PathBuf>,
}

pub struct XarStore {
    xars_dir: PathBuf,
    script_dir: PathBuf,
    image_store: Arc<ImageStore>,
}

impl XarStore {
    pub fn new(xars_dir: impl Into<PathBuf>, script_dir: impl Into<PathBuf>, image_store: Arc<ImageStore>) -> Self {
        Self {
            xars_dir: xars_dir.into(),
            script_dir: script_dir.into(),
            image_store,
        }
    }

    fn xar_dir(&self, name: &str) -> PathBuf {
        layout::xar_dir(&self.xars_dir, name)
    }

    /// Resolves `selector` to an image, links it into `deps/` (idempotent),
    /// atomically replaces the `exec` symlink, and ensures the shim script
    /// exists on `script_dir`. A re-install with a different selector
    /// *accumulates* a new `deps/<id>` entry rather than replacing the old
    /// one — the previous image's dependency is only pruned by `cleanup`,
    /// so an in-flight `exec` of the old image keeps working throughout.
    pub fn install(
        &self,
        selector: &ImageSelector,
        xar_name: &str,
        exec_relpath: &Path,
    ) -> Result<(), CtrError> {
        layout::validate_xar_name(xar_name)?;
        let image_id = self
            .image_store
            .find(selector)?
            .ok_or_else(|| CtrError::NotFound(selector.to_string()))?;

        let xar_dir = self.xar_dir(xar_name);
        let deps_dir = layout::deps_dir(&xar_dir);
        std::fs::create_dir_all(&deps_dir).map_err(|e| CtrError::io(&deps_dir, e))?;
        owner::apply_dir(&xar_dir)?;
        owner::apply_dir(&deps_dir)?;

        self.ensure_dep_link(&xar_dir, &image_id)?;

        let exec_target = target::encode(&image_id, exec_relpath);
        let final_path = layout::exec_path(&xar_dir);
        let tmp_path = xar_dir.join(".exec.tmp");
        let _ = std::fs::remove_file(&tmp_path);
        std::os::unix::fs::symlink(&exec_target, &tmp_path).map_err(|e| CtrError::io(&tmp_path, e))?;
        std::fs::rename(&tmp_path, &final_path).map_err(|e| CtrError::io(&final_path, e))?;

        self.ensure_shim_script(xar_name)?;
        tracing::info!(xar = %xar_name, image_id = %image_id, "installed xar");
        Ok(())
    }

    fn ensure_dep_link(&self, xar_dir: &Path, image_id: &ImageId) -> Result<(), CtrError> {
        let dep_path = layout::dep_path(xar_dir, image_id.as_str());
        if dep_path.is_file() {
            return Ok(());
        }
        match refcount::add_ref(&self.image_store.metadata_path(image_id), &dep_path) {
            Ok(()) => Ok(()),
            Err(CtrError::Io { source, .. }) if source.kind() == std::io::ErrorKind::AlreadyExists => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn ensure_shim_script(&self, xar_name: &str) -> Result<(), CtrError> {
        std::fs::create_dir_all(&self.script_dir).map_err(|e| CtrError::io(&self.script_dir, e))?;
        let script_path = layout::script_path(&self.script_dir, xar_name);
        let content = shim_script_content(xar_name);
        if let Ok(existing) = std::fs::read_to_string(&script_path) {
            if existing == content {
                return Ok(());
            }
        }
        let tmp_path = self.script_dir.join(format!(".{xar_name}.tmp"));
        std::fs::write(&tmp_path, &content).map_err(|e| CtrError::io(&tmp_path, e))?;
        std::fs::set_permissions(&tmp_path, std::fs::Permissions::from_mode(0o755))
            .map_err(|e| CtrError::io(&tmp_path, e))?;
        std::fs::rename(&tmp_path, &script_path).map_err(|e| CtrError::io(&script_path, e))
    }

    /// Resolves `exec`, pins the current image against a concurrent
    /// `uninstall` with a shared lock on its `deps/` entry, and replaces
    /// this process image via `execve`. Only returns on failure (a
    /// successful `exec` never returns to the caller).
    pub fn exec(&self, xar_name: &str, argv: &[String]) -> Result<(), CtrError> {
        let xar_dir = self.xar_dir(xar_name);
        let exec_link = layout::exec_path(&xar_dir);
        let raw_target = std::fs::read_link(&exec_link).map_err(|e| CtrError::io(&exec_link, e))?;
        let (image_id, exec_relpath) = target::decode(&raw_target)?;

        let dep_path = layout::dep_path(&xar_dir, image_id.as_str());
        let _lock = FileLock::acquire(&dep_path, LockMode::Shared)?;

        let resolved = self.image_store.rootfs_path(&image_id).join(&exec_relpath);
        if !resolved.exists() {
            return Err(CtrError::NotFound(format!("{resolved:?}")));
        }

        let err = Command::new(&resolved).arg0(xar_name).args(argv).exec();
        Err(CtrError::io(&resolved, err))
    }

    /// Removes `exec` and the shim script, then unlinks every `deps/*`
    /// entry whose lock can be acquired exclusively (no concurrent `exec`
    /// holds it); entries still locked are left for `cleanup`. Removes the
    /// xar directory once `deps/` is empty.
    pub fn uninstall(&self, xar_name: &str) -> Result<(), CtrError> {
        let xar_dir = self.xar_dir(xar_name);
        let _ = std::fs::remove_file(layout::exec_path(&xar_dir));
        let _ = std::fs::remove_file(layout::script_path(&self.script_dir, xar_name));
        self.prune_deps_and_maybe_remove(&xar_dir)?;
        tracing::info!(xar = %xar_name, "uninstalled xar");
        Ok(())
    }

    fn prune_deps_and_maybe_remove(&self, xar_dir: &Path) -> Result<(), CtrError> {
        let deps_dir = layout::deps_dir(xar_dir);
        if !deps_dir.is_dir() {
            return Ok(());
        }

        let mut remaining = 0usize;
        for entry in std::fs::read_dir(&deps_dir).map_err(|e| CtrError::io(&deps_dir, e))? {
            let entry = entry.map_err(|e| CtrError::io(&deps_dir, e))?;
            let path = entry.path();
            match FileLock::try_acquire(&path, LockMode::Exclusive) {
                Ok(Some(_lock)) => {
                    refcount::remove_ref(&path)?;
                }
                Ok(None) => remaining += 1,
                Err(_) => remaining += 1,
            }
        }

        if remaining == 0 {
            std::fs::remove_dir_all(xar_dir).or_else(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    Ok(())
                } else {
                    Err(CtrError::io(xar_dir, e))
                }
            })?;
        }
        Ok(())
    }

    /// Scans `xars/` for directories without an `exec` symlink (an
    /// interrupted uninstall) and finishes pruning their deps; also
    /// removes shim scripts whose matching xar directory is gone.
    pub fn cleanup(&self) -> Result<(), CtrError> {
        if self.xars_dir.is_dir() {
            for entry in std::fs::read_dir(&self.xars_dir).map_err(|e| CtrError::io(&self.xars_dir, e))? {
                let entry = entry.map_err(|e| CtrError::io(&self.xars_dir, e))?;
                let xar_dir = entry.path();
                if layout::exec_path(&xar_dir).exists() {
                    continue;
                }
                self.prune_deps_and_maybe_remove(&xar_dir)?;
            }
        }

        if self.script_dir.is_dir() {
            for entry in std::fs::read_dir(&self.script_dir).map_err(|e| CtrError::io(&self.script_dir, e))? {
                let entry = entry.map_err(|e| CtrError::io(&self.script_dir, e))?;
                let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                    continue;
                };
                if name.starts_with('.') {
                    continue;
                }
                if !self.xar_dir(&name).is_dir() {
                    let _ = std::fs::remove_file(entry.path());
                }
            }
        }
        Ok(())
    }

    pub fn list(&self) -> Result<Vec<XarListEntry>, CtrError> {
        let mut entries = Vec::new();
        if !self.xars_dir.is_dir() {
            return Ok(entries);
        }
        for entry in std::fs::read_dir(&self.xars_dir).map_err(|e| CtrError::io(&self.xars_dir, e))? {
            let entry = entry.map_err(|e| CtrError::io(&self.xars_dir, e))?;
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            let exec_link = layout::exec_path(&entry.path());
            let (image_id, exec_relpath) = match std::fs::read_link(&exec_link) {
                Ok(raw) => match target::decode(&raw) {
                    Ok((id, relpath)) => (Some(id), Some(relpath)),
                    Err(_) => (None, None),
                },
                Err(_) => (None, None),
            };
            entries.push(XarListEntry { name, image_id, exec_relpath });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }
}

fn shim_script_content(xar_name: &str) -> String {
    format!("#!/bin/sh\nexec ctr xars exec {xar_name} \"$@\"\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn make_image_store(root: &Path) -> ImageStore {
        ImageStore::new(root.join("images/trees"), root.join("images/tags"), root.join("images/tmp"))
    }

    fn build_sample_image(store: &ImageStore, root: &Path) -> ImageId {
        let rootfs_src = root.join("src-rootfs");
        std::fs::create_dir_all(rootfs_src.join("bin")).unwrap();
        std::fs::write(rootfs_src.join("bin/app"), b"#!/bin/sh\necho hi\n").unwrap();
        store.build("sample", "1-0", &rootfs_src).unwrap()
    }

    #[test]
    fn install_creates_dep_link_and_exec_symlink() {
        let root = tempdir().unwrap();
        let image_store = make_image_store(root.path());
        let image_id = build_sample_image(&image_store, root.path());

        let xar_store = XarStore::new(root.path().join("xars"), root.path().join("bin"), Arc::new(image_store));
        xar_store
            .install(&ImageSelector::Id(image_id.clone()), "myapp", Path::new("bin/app"))
            .unwrap();

        let xar_dir = xar_store.xar_dir("myapp");
        assert!(layout::dep_path(&xar_dir, image_id.as_str()).is_file());
        let raw = std::fs::read_link(layout::exec_path(&xar_dir)).unwrap();
        let (decoded_id, relpath) = target::decode(&raw).unwrap();
        assert_eq!(decoded_id, image_id);
        assert_eq!(relpath, PathBuf::from("bin/app"));
        assert!(root.path().join("bin/myapp").is_file());
    }

    #[test]
    fn reinstall_with_different_image_accumulates_deps() {
        let root = tempdir().unwrap();
        let image_store = make_image_store(root.path());
        let id_a = build_sample_image(&image_store, root.path());

        let rootfs_src_b = root.path().join("src-rootfs-b");
        std::fs::create_dir_all(rootfs_src_b.join("bin")).unwrap();
        std::fs::write(rootfs_src_b.join("bin/app"), b"#!/bin/sh\necho bye\n").unwrap();
        let id_b = image_store.build("sample", "2-0", &rootfs_src_b).unwrap();

        let xar_store = XarStore::new(root.path().join("xars"), root.path().join("bin"), Arc::new(image_store));
        xar_store.install(&ImageSelector::Id(id_a.clone()), "myapp", Path::new("bin/app")).unwrap();
        xar_store.install(&ImageSelector::Id(id_b.clone()), "myapp", Path::new("bin/app")).unwrap();

        let xar_dir = xar_store.xar_dir("myapp");
        assert!(layout::dep_path(&xar_dir, id_a.as_str()).is_file());
        assert!(layout::dep_path(&xar_dir, id_b.as_str()).is_file());
    }

    #[test]
    fn uninstall_removes_exec_and_prunes_unlocked_deps() {
        let root = tempdir().unwrap();
        let image_store = make_image_store(root.path());
        let image_id = build_sample_image(&image_store, root.path());

        let xar_store = XarStore::new(root.path().join("xars"), root.path().join("bin"), Arc::new(image_store));
        xar_store.install(&ImageSelector::Id(image_id.clone()), "myapp", Path::new("bin/app")).unwrap();
        xar_store.uninstall("myapp").unwrap();

        let xar_dir = xar_store.xar_dir("myapp");
        assert!(!xar_dir.exists());
        assert!(!root.path().join("bin/myapp").exists());
    }

    #[test]
    fn list_reports_installed_xars() {
        let root = tempdir().unwrap();
        let image_store = make_image_store(root.path());
        let image_id = build_sample_image(&image_store, root.path());

        let xar_store = XarStore::new(root.path().join("xars"), root.path().join("bin"), Arc::new(image_store));
        xar_store.install(&ImageSelector::Id(image_id.clone()), "myapp", Path::new("bin/app")).unwrap();

        let listed = xar_store.list().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name, "myapp");
        assert_eq!(listed[0].image_id, Some(image_id));
    }
}
