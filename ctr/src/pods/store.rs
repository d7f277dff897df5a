//! The pod store: prepares pods from stacked images under `pods/active/`,
//! runs them through the external supervisor, and retires them through
//! `pods/graveyard/` on the schedule in spec's state machine.
//!
//! Shaped like `images::store::ImageStore` — no in-memory cache, every
//! operation re-reads the filesystem under the lock it needs.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};

use ctr_types::{CtrError, ImageId, PodId};

use crate::base::{grace, owner, refcount, DirLock, LockMode, ScopedTmpDir};
use crate::builders::{self, AppSpec};
use crate::images::ImageStore;

use super::config::PodConfig;
use super::{layout, overlay, supervisor};

#[derive(Debug, Clone)]
pub struct PodListEntry {
    pub id: PodId,
    pub name: String,
    pub version: String,
    pub mtime: SystemTime,
    pub active: bool,
}

#[derive(Debug, Clone)]
pub struct AppStatus {
    pub name: String,
    pub last_exit: Option<i32>,
    pub last_exit_time: Option<DateTime<Utc>>,
}

pub struct PodStore {
    active_dir: PathBuf,
    graveyard_dir: PathBuf,
    tmp_dir: PathBuf,
    image_store: Arc<ImageStore>,
}

impl PodStore {
    pub fn new(
        active_dir: impl Into<PathBuf>,
        graveyard_dir: impl Into<PathBuf>,
        tmp_dir: impl Into<PathBuf>,
        image_store: Arc<ImageStore>,
    ) -> Self {
        Self {
            active_dir: active_dir.into(),
            graveyard_dir: graveyard_dir.into(),
            tmp_dir: tmp_dir.into(),
            image_store,
        }
    }

    fn active_pod_dir(&self, id: &PodId) -> PathBuf {
        self.active_dir.join(id.as_str())
    }

    fn graveyard_pod_dir(&self, id: &PodId) -> PathBuf {
        self.graveyard_dir.join(id.as_str())
    }

    /// Resolves `config.images` to concrete ids, in order. A `Tag` selector
    /// may resolve to a different image than a prior `prepare` of the same
    /// config if the tag was reassigned in between; the ids resolved here
    /// are the ones persisted to `resolved-images` and ref-counted, so any
    /// later retag does not retroactively change what this pod runs.
    fn resolve_image_ids(&self, config: &PodConfig) -> Result<Vec<ImageId>, CtrError> {
        let mut ids = Vec::with_capacity(config.images.len());
        for image_ref in &config.images {
            let selector = image_ref.to_selector()?;
            let id = self
                .image_store
                .find(&selector)?
                .ok_or_else(|| CtrError::NotFound(selector.to_string()))?;
            ids.push(id);
        }
        Ok(ids)
    }

    /// Validates `config_path`, resolves every image, stages
    /// `deps/{upper,work,rootfs}` in a scoped tmp dir, hard-links each
    /// resolved image's `metadata` into `deps/`, mounts the overlay to
    /// populate `rootfs/` with the base images' contents, generates
    /// per-app units and pod identity files into it, unmounts, and commits
    /// the staged directory into `active/<pod_id>` by rename. On any
    /// failure the scoped tmp dir is discarded and no partial pod remains
    /// under `active/`.
    pub fn prepare(&self, pod_id: &PodId, config_path: &Path) -> Result<(), CtrError> {
        let config = PodConfig::load(config_path)?;
        let image_ids = self.resolve_image_ids(&config)?;

        let dest = self.active_pod_dir(pod_id);
        if dest.exists() {
            return Err(CtrError::Conflict(format!("pod {pod_id} already prepared")));
        }

        let staged = ScopedTmpDir::create(&self.tmp_dir)?;
        let pod_dir = staged.path();

        for sub in ["deps", "rootfs", "upper", "work"] {
            let dir = pod_dir.join(sub);
            std::fs::create_dir_all(&dir).map_err(|e| CtrError::io(&dir, e))?;
        }

        for id in &image_ids {
            let dep_path = layout::dep_path(pod_dir, id.as_str());
            refcount::add_ref(&self.image_store.metadata_path(id), &dep_path)?;
        }

        let config_json = serde_json::to_vec_pretty(&config)
            .map_err(|_| CtrError::validation("pod config", config.name.clone()))?;
        let config_path_staged = layout::config_path(pod_dir);
        std::fs::write(&config_path_staged, config_json).map_err(|e| CtrError::io(&config_path_staged, e))?;
        owner::apply_file(&config_path_staged)?;

        let resolved_path = layout::resolved_images_path(pod_dir);
        let resolved_json = serde_json::to_vec(&image_ids.iter().map(|id| id.as_str().to_string()).collect::<Vec<_>>())
            .expect("Vec<String> always serializes");
        std::fs::write(&resolved_path, resolved_json).map_err(|e| CtrError::io(&resolved_path, e))?;
        owner::apply_file(&resolved_path)?;

        let rootfs_paths: Vec<PathBuf> = image_ids.iter().map(|id| self.image_store.rootfs_path(id)).collect();
        let upper = layout::upper_dir(pod_dir);
        let work = layout::work_dir(pod_dir);
        let rootfs = layout::rootfs_dir(pod_dir);
        overlay::mount_overlay(&rootfs_paths, &upper, &work, &rootfs)?;

        let generate_result = self.generate_pod_identity(pod_id, &config, &rootfs);
        let unmount_result = overlay::umount(&rootfs);
        generate_result?;
        unmount_result?;

        owner::apply_dir(pod_dir)?;
        staged.commit(&dest)?;
        tracing::info!(pod_id = %pod_id, "prepared pod");
        Ok(())
    }

    fn generate_pod_identity(&self, pod_id: &PodId, config: &PodConfig, rootfs: &Path) -> Result<(), CtrError> {
        let unit_dir = rootfs.join("etc/systemd/system");
        std::fs::create_dir_all(unit_dir.join("pod.target.wants"))
            .map_err(|e| CtrError::io(&unit_dir, e))?;
        for app in &config.apps {
            let spec = AppSpec {
                name: app.name.clone(),
                exec: app.exec.clone(),
                user: app.user.clone(),
                group: app.group.clone(),
                kind: app.kind.clone(),
                kill_mode: app.kill_mode.clone(),
                service_section: app.service_section.clone(),
            };
            builders::generate_unit_file(&unit_dir, &config.name, &config.version, &spec)?;
        }

        builders::generate_machine_id(rootfs, &pod_id.without_dashes())?;
        let hostname_path = rootfs.join("etc/hostname");
        std::fs::write(&hostname_path, format!("{}\n", pod_id.short()))
            .map_err(|e| CtrError::io(&hostname_path, e))?;
        Ok(())
    }

    /// `prepare` followed by `run_prepared`.
    pub fn run(&self, pod_id: &PodId, config_path: &Path) -> Result<i32, CtrError> {
        self.prepare(pod_id, config_path)?;
        self.run_prepared(pod_id)
    }

    /// Re-reads the persisted `config`/`resolved-images` under
    /// `active/<pod_id>` (never a fresh config argument, so image ordering
    /// fixed at `prepare` time cannot be reshuffled by a later call),
    /// mounts the overlay, runs the supervisor to completion, and unmounts.
    pub fn run_prepared(&self, pod_id: &PodId) -> Result<i32, CtrError> {
        let pod_dir = self.active_pod_dir(pod_id);
        let _lock = DirLock::acquire(&pod_dir, LockMode::Exclusive, None)?;

        let config = PodConfig::load(&layout::config_path(&pod_dir))?;
        let resolved_bytes = std::fs::read(layout::resolved_images_path(&pod_dir))
            .map_err(|e| CtrError::io(&pod_dir, e))?;
        let resolved_ids: Vec<String> = serde_json::from_slice(&resolved_bytes)
            .map_err(|e| CtrError::Corruption(format!("malformed resolved-images at {pod_dir:?}: {e}")))?;
        let image_ids: Vec<ImageId> = resolved_ids
            .iter()
            .map(|s| ImageId::parse(s))
            .collect::<Result<_, _>>()?;

        let rootfs_paths: Vec<PathBuf> = image_ids.iter().map(|id| self.image_store.rootfs_path(id)).collect();
        let upper = layout::upper_dir(&pod_dir);
        let work = layout::work_dir(&pod_dir);
        let rootfs = layout::rootfs_dir(&pod_dir);
        overlay::mount_overlay(&rootfs_paths, &upper, &work, &rootfs)?;

        let binds: Vec<String> = config
            .volumes
            .iter()
            .map(|v| supervisor::bind_argument(&v.source, &v.target, v.read_only))
            .collect();
        let hostname = pod_id.short().to_string();

        let run_result = supervisor::run(&rootfs, &hostname, &binds);
        let unmount_result = overlay::umount(&rootfs);

        let code = run_result?;
        unmount_result?;
        tracing::info!(pod_id = %pod_id, exit_code = code, "pod supervisor exited");
        Ok(code)
    }

    /// Hard-links the pod's `config` to `dst`, an external ref-count
    /// mechanism for callers holding a pod from disappearing underneath
    /// them.
    pub fn add_ref(&self, pod_id: &PodId, dst: &Path) -> Result<(), CtrError> {
        let pod_dir = self.active_pod_dir(pod_id);
        refcount::add_ref(&layout::config_path(&pod_dir), dst)
    }

    /// Moves `active/<pod_id>` to `graveyard/<pod_id>` by atomic rename,
    /// best-effort unmounting the overlay first.
    pub fn remove(&self, pod_id: &PodId) -> Result<(), CtrError> {
        let pod_dir = self.active_pod_dir(pod_id);
        let _lock = DirLock::acquire(&pod_dir, LockMode::Exclusive, None)?;

        let _ = overlay::umount(&layout::rootfs_dir(&pod_dir));

        std::fs::create_dir_all(&self.graveyard_dir).map_err(|e| CtrError::io(&self.graveyard_dir, e))?;
        let dest = self.graveyard_pod_dir(pod_id);
        std::fs::rename(&pod_dir, &dest).map_err(|e| CtrError::io(&dest, e))?;
        tracing::info!(pod_id = %pod_id, "moved pod to graveyard");
        Ok(())
    }

    /// Re-mounts a stopped pod's overlay read-only, copies the composed
    /// rootfs through `filter_patterns`, and archives it to `output_path`
    /// as an image-shaped tar.gz — the path by which a running container
    /// becomes a buildable application image.
    pub fn export_overlay(&self, pod_id: &PodId, output_path: &Path, filter_patterns: &[String]) -> Result<(), CtrError> {
        let pod_dir = self.active_pod_dir(pod_id);
        let _lock = DirLock::acquire(&pod_dir, LockMode::Shared, None)?;

        let resolved_bytes = std::fs::read(layout::resolved_images_path(&pod_dir))
            .map_err(|e| CtrError::io(&pod_dir, e))?;
        let resolved_ids: Vec<String> = serde_json::from_slice(&resolved_bytes)
            .map_err(|e| CtrError::Corruption(format!("malformed resolved-images at {pod_dir:?}: {e}")))?;
        let rootfs_paths: Vec<PathBuf> = resolved_ids
            .iter()
            .map(|s| ImageId::parse(s).map(|id| self.image_store.rootfs_path(&id)))
            .collect::<Result<_, _>>()?;

        super::export::export_pod_overlay(
            &rootfs_paths,
            &layout::upper_dir(&pod_dir),
            &layout::work_dir(&pod_dir),
            &layout::rootfs_dir(&pod_dir),
            output_path,
            filter_patterns,
        )
    }

    /// For each `graveyard/` entry older than `grace`: unmount if still
    /// mounted, unlink every `deps/*` entry (decrementing image ref
    /// counts), then remove the subtree. For each `tmp/` entry older than
    /// `grace` whose lock can be exclusively acquired: remove.
    pub fn cleanup(&self, grace: Duration) -> Result<Vec<PodId>, CtrError> {
        let mut removed = Vec::new();

        if self.graveyard_dir.is_dir() {
            for entry in std::fs::read_dir(&self.graveyard_dir).map_err(|e| CtrError::io(&self.graveyard_dir, e))? {
                let entry = entry.map_err(|e| CtrError::io(&self.graveyard_dir, e))?;
                let Some(id_str) = entry.file_name().to_str().map(str::to_string) else {
                    continue;
                };
                let Ok(id) = PodId::parse(&id_str) else {
                    continue;
                };
                let pod_dir = entry.path();
                let Some(_lock) = DirLock::try_acquire(&pod_dir, LockMode::Exclusive)? else {
                    continue;
                };
                if !grace::is_old_enough(&pod_dir, grace)? {
                    continue;
                }

                let _ = overlay::umount(&layout::rootfs_dir(&pod_dir));

                let deps_dir = layout::deps_dir(&pod_dir);
                if deps_dir.is_dir() {
                    for dep in std::fs::read_dir(&deps_dir).map_err(|e| CtrError::io(&deps_dir, e))? {
                        let dep = dep.map_err(|e| CtrError::io(&deps_dir, e))?;
                        refcount::remove_ref(&dep.path())?;
                    }
                }

                std::fs::remove_dir_all(&pod_dir).map_err(|e| CtrError::io(&pod_dir, e))?;
                tracing::info!(pod_id = %id, "reclaimed graveyard pod after grace period");
                removed.push(id);
            }
        }

        if self.tmp_dir.is_dir() {
            for entry in std::fs::read_dir(&self.tmp_dir).map_err(|e| CtrError::io(&self.tmp_dir, e))? {
                let entry = entry.map_err(|e| CtrError::io(&self.tmp_dir, e))?;
                let path = entry.path();
                if !grace::is_old_enough(&path, grace)? {
                    continue;
                }
                let Some(_lock) = DirLock::try_acquire(&path, LockMode::Exclusive)? else {
                    continue;
                };
                std::fs::remove_dir_all(&path).map_err(|e| CtrError::io(&path, e))?;
            }
        }

        Ok(removed)
    }

    pub fn list(&self) -> Result<Vec<PodListEntry>, CtrError> {
        let mut entries = Vec::new();
        for (dir, active) in [(&self.active_dir, true), (&self.graveyard_dir, false)] {
            if !dir.is_dir() {
                continue;
            }
            for entry in std::fs::read_dir(dir).map_err(|e| CtrError::io(dir, e))? {
                let entry = entry.map_err(|e| CtrError::io(dir, e))?;
                let Some(id_str) = entry.file_name().to_str().map(str::to_string) else {
                    continue;
                };
                let Ok(id) = PodId::parse(&id_str) else {
                    continue;
                };
                let pod_dir = entry.path();
                let config = match PodConfig::load(&layout::config_path(&pod_dir)) {
                    Ok(c) => c,
                    Err(_) => continue,
                };
                let mtime = std::fs::metadata(&pod_dir)
                    .and_then(|m| m.modified())
                    .map_err(|e| CtrError::io(&pod_dir, e))?;
                entries.push(PodListEntry {
                    id,
                    name: config.name,
                    version: config.version,
                    mtime,
                    active,
                });
            }
        }
        entries.sort_by(|a, b| a.id.as_str().cmp(b.id.as_str()));
        Ok(entries)
    }

    pub fn show(&self, pod_id: &PodId) -> Result<Vec<AppStatus>, CtrError> {
        let pod_dir = self.active_pod_dir(pod_id);
        let config = PodConfig::load(&layout::config_path(&pod_dir))?;
        let rootfs = layout::rootfs_dir(&pod_dir);

        let mut statuses = Vec::with_capacity(config.apps.len());
        for app in &config.apps {
            let exit = builders::get_pod_app_exit_status(&rootfs, &app.name)?;
            statuses.push(AppStatus {
                name: app.name.clone(),
                last_exit: exit.as_ref().map(|(code, _)| *code),
                last_exit_time: exit.map(|(_, time)| time),
            });
        }
        Ok(statuses)
    }

    pub fn cat_config(&self, pod_id: &PodId) -> Result<Vec<u8>, CtrError> {
        let path = layout::config_path(&self.active_pod_dir(pod_id));
        std::fs::read(&path).map_err(|e| CtrError::io(&path, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::images::ImageStore;
    use tempfile::tempdir;

    fn write_sample_config(path: &Path, image_name: &str) {
        let body = format!(
            r#"{{"name":"test-pod","version":"0-0-1","apps":[{{"name":"hello","exec":["/bin/true"],"user":"root","group":"root"}}],"images":[{{"name":"{image_name}","version":"0-0-1"}}],"volumes":[]}}"#
        );
        std::fs::write(path, body).unwrap();
    }

    #[test]
    fn resolve_image_ids_reports_not_found() {
        let root = tempdir().unwrap();
        let image_store = Arc::new(ImageStore::new(
            root.path().join("images/trees"),
            root.path().join("images/tags"),
            root.path().join("images/tmp"),
        ));
        let pod_store = PodStore::new(
            root.path().join("pods/active"),
            root.path().join("pods/graveyard"),
            root.path().join("pods/tmp"),
            image_store,
        );

        let config_path = root.path().join("config.json");
        write_sample_config(&config_path, "missing-image");

        let pod_id = PodId::generate();
        let err = pod_store.prepare(&pod_id, &config_path).unwrap_err();
        assert!(matches!(err, CtrError::NotFound(_)));
    }

    #[test]
    fn list_is_empty_for_fresh_store() {
        let root = tempdir().unwrap();
        let image_store = Arc::new(ImageStore::new(
            root.path().join("images/trees"),
            root.path().join("images/tags"),
            root.path().join("images/tmp"),
        ));
        let pod_store = PodStore::new(
            root.path().join("pods/active"),
            root.path().join("pods/graveyard"),
            root.path().join("pods/tmp"),
            image_store,
        );
        assert!(pod_store.list().unwrap().is_empty());
    }
}
