//! The image store: a content-addressed catalogue of root filesystem trees
//! under `images/trees/<id>/`, tagged by symlinks under `images/tags/`.
//!
//! Shaped like `boxlite::litebox::manager::BoxManager` — a manager over a
//! directory that returns typed results — but without BoxManager's
//! in-memory cache: there is no cache here, the filesystem is the source
//! of truth, so every operation re-reads what it needs under the
//! appropriate lock.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};

use ctr_types::{validate_label, CtrError, ImageId, ImageSelector};

use crate::base::{grace, owner, refcount, DirLock, LockMode, ScopedTmpDir};

use super::archive;

/// `metadata` file contents: exactly `{name, version}`, unknown keys
/// rejected at parse.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ImageMetadata {
    pub name: String,
    pub version: String,
}

impl ImageMetadata {
    fn validate(&self) -> Result<(), CtrError> {
        validate_label("image name", &self.name)?;
        if self.version.is_empty() {
            return Err(CtrError::validation("image version", self.version.clone()));
        }
        validate_label("image version", &self.version)
    }
}

#[derive(Debug, Clone)]
pub struct ImageListEntry {
    pub id: ImageId,
    pub name: String,
    pub version: String,
    pub tags: Vec<String>,
    pub mtime: SystemTime,
    pub ref_count: u64,
}

pub struct ImageStore {
    trees_dir: PathBuf,
    tags_dir: PathBuf,
    tmp_dir: PathBuf,
}

impl ImageStore {
    pub fn new(trees_dir: impl Into<PathBuf>, tags_dir: impl Into<PathBuf>, tmp_dir: impl Into<PathBuf>) -> Self {
        Self {
            trees_dir: trees_dir.into(),
            tags_dir: tags_dir.into(),
            tmp_dir: tmp_dir.into(),
        }
    }

    pub(crate) fn tree_dir(&self, id: &ImageId) -> PathBuf {
        self.trees_dir.join(id.as_str())
    }

    pub(crate) fn metadata_path(&self, id: &ImageId) -> PathBuf {
        self.tree_dir(id).join(archive::METADATA_FILE)
    }

    /// The image's `rootfs/` directory, used by `pods` (overlay lower
    /// layers) and `xars` (the `exec` symlink target).
    pub fn rootfs_path(&self, id: &ImageId) -> PathBuf {
        self.tree_dir(id).join(archive::ROOTFS_DIR)
    }

    fn tag_path(&self, tag: &str) -> PathBuf {
        self.tags_dir.join(tag)
    }

    /// Extracts `archive_path` into a fresh tmp dir, derives the content id,
    /// and installs it at `trees/<id>` if not already present. Idempotent
    /// on id collision: an archive that re-produces an id already in the
    /// store only (optionally) applies the requested tag.
    pub fn import(&self, archive_path: &Path, tag: Option<&str>) -> Result<ImageId, CtrError> {
        let _trees_lock = DirLock::acquire(&self.trees_dir, LockMode::Shared, None)?;
        let staged = ScopedTmpDir::create(&self.tmp_dir)?;

        archive::extract(archive_path, staged.path())?;
        let id = self.install_staged(staged)?;

        if let Some(tag) = tag {
            self.tag(&ImageSelector::Id(id.clone()), tag)?;
        }
        Ok(id)
    }

    /// Tars and gzips `rootfs_dir` into a fresh image identified by its
    /// content, cataloguing it under `(name, version)`.
    pub fn build(&self, name: &str, version: &str, rootfs_dir: &Path) -> Result<ImageId, CtrError> {
        let metadata = ImageMetadata {
            name: name.to_string(),
            version: version.to_string(),
        };
        metadata.validate()?;

        let _trees_lock = DirLock::acquire(&self.trees_dir, LockMode::Shared, None)?;
        let staged = ScopedTmpDir::create(&self.tmp_dir)?;

        let metadata_json = serde_json::to_vec(&metadata)
            .map_err(|_| CtrError::validation("image metadata", format!("{name}/{version}")))?;
        std::fs::write(staged.path().join(archive::METADATA_FILE), metadata_json)
            .map_err(|e| CtrError::io(staged.path(), e))?;
        copy_dir_recursive(rootfs_dir, &staged.path().join(archive::ROOTFS_DIR))?;

        self.install_staged(staged)
    }

    /// Common tail of `import`/`build`: hash the staged directory and
    /// either discard it (id already present) or rename it into place.
    fn install_staged(&self, staged: ScopedTmpDir) -> Result<ImageId, CtrError> {
        let metadata = read_metadata(&staged.path().join(archive::METADATA_FILE))?;
        metadata.validate()?;

        let id_str = archive::canonical_hash(staged.path())?;
        let id = ImageId::parse(&id_str)?;
        let final_dir = self.tree_dir(&id);

        if final_dir.is_dir() {
            let existing = read_metadata(&final_dir.join(archive::METADATA_FILE))?;
            if existing.name != metadata.name || existing.version != metadata.version {
                return Err(CtrError::Corruption(format!(
                    "id collision at {final_dir:?}: existing metadata does not match"
                )));
            }
            // staged is dropped here, rolling back the tmp subtree.
            return Ok(id);
        }

        owner::apply_dir(staged.path())?;
        owner::apply_file(&staged.path().join(archive::METADATA_FILE))?;
        staged.commit(&final_dir)?;
        tracing::info!(image_id = %id, "imported image");
        Ok(id)
    }

    pub fn list(&self) -> Result<Vec<ImageListEntry>, CtrError> {
        let _trees_lock = DirLock::acquire(&self.trees_dir, LockMode::Shared, None)?;
        let tags_by_id = self.tags_index()?;

        let mut entries = Vec::new();
        if self.trees_dir.is_dir() {
            for entry in std::fs::read_dir(&self.trees_dir).map_err(|e| CtrError::io(&self.trees_dir, e))? {
                let entry = entry.map_err(|e| CtrError::io(&self.trees_dir, e))?;
                let Some(id_str) = entry.file_name().to_str().map(str::to_string) else {
                    continue;
                };
                let Ok(id) = ImageId::parse(&id_str) else {
                    continue;
                };
                let metadata_path = self.metadata_path(&id);
                let metadata = read_metadata(&metadata_path)?;
                let mtime = std::fs::metadata(entry.path())
                    .and_then(|m| m.modified())
                    .map_err(|e| CtrError::io(&entry.path(), e))?;
                let ref_count = refcount::ref_count(&metadata_path)?;
                let tags = tags_by_id.get(id.as_str()).cloned().unwrap_or_default();

                entries.push(ImageListEntry {
                    id,
                    name: metadata.name,
                    version: metadata.version,
                    tags,
                    mtime,
                    ref_count,
                });
            }
        }

        entries.sort_by(|a, b| (&a.name, &a.version, a.id.as_str()).cmp(&(&b.name, &b.version, b.id.as_str())));
        Ok(entries)
    }

    /// tag -> id for every symlink under `images/tags/`.
    fn tag_target_id(&self, tag_path: &Path) -> Result<Option<ImageId>, CtrError> {
        let target = match std::fs::read_link(tag_path) {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(CtrError::io(tag_path, e)),
        };
        let id_str = target
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default();
        Ok(ImageId::parse(id_str).ok())
    }

    fn tags_index(&self) -> Result<std::collections::HashMap<String, Vec<String>>, CtrError> {
        let mut index: std::collections::HashMap<String, Vec<String>> = std::collections::HashMap::new();
        if !self.tags_dir.is_dir() {
            return Ok(index);
        }
        let mut names: Vec<String> = std::fs::read_dir(&self.tags_dir)
            .map_err(|e| CtrError::io(&self.tags_dir, e))?
            .filter_map(|e| e.ok())
            .filter_map(|e| e.file_name().to_str().map(str::to_string))
            .collect();
        names.sort();
        for name in names {
            if let Some(id) = self.tag_target_id(&self.tag_path(&name))? {
                index.entry(id.as_str().to_string()).or_default().push(name);
            }
        }
        Ok(index)
    }

    /// Resolves a selector to at most one image id. `NameVersion` scans are
    /// defensive against invariant violations: more than one match is a
    /// `Conflict`, not silently the first one found.
    pub fn find(&self, selector: &ImageSelector) -> Result<Option<ImageId>, CtrError> {
        selector.validate()?;
        match selector {
            ImageSelector::Id(id) => {
                if self.tree_dir(id).is_dir() {
                    Ok(Some(id.clone()))
                } else {
                    Ok(None)
                }
            }
            ImageSelector::NameVersion { name, version } => {
                let _lock = DirLock::acquire(&self.trees_dir, LockMode::Shared, None)?;
                let mut matches = Vec::new();
                if self.trees_dir.is_dir() {
                    for entry in std::fs::read_dir(&self.trees_dir).map_err(|e| CtrError::io(&self.trees_dir, e))? {
                        let entry = entry.map_err(|e| CtrError::io(&self.trees_dir, e))?;
                        let Some(id_str) = entry.file_name().to_str().map(str::to_string) else {
                            continue;
                        };
                        let Ok(id) = ImageId::parse(&id_str) else {
                            continue;
                        };
                        let m = read_metadata(&self.metadata_path(&id))?;
                        if &m.name == name && &m.version == version {
                            matches.push(id);
                        }
                    }
                }
                match matches.len() {
                    0 => Ok(None),
                    1 => Ok(matches.pop()),
                    _ => Err(CtrError::Conflict(format!("{name}/{version} matches more than one image"))),
                }
            }
            ImageSelector::Tag(tag) => self.tag_target_id(&self.tag_path(tag)),
        }
    }

    /// Writes/replaces `tags/<new_tag>` to point at the image resolved by
    /// `selector`. Fails `NotFound` if the selector matches nothing.
    pub fn tag(&self, selector: &ImageSelector, new_tag: &str) -> Result<(), CtrError> {
        validate_label("tag", new_tag)?;
        let id = self
            .find(selector)?
            .ok_or_else(|| CtrError::NotFound(selector.to_string()))?;

        std::fs::create_dir_all(&self.tags_dir).map_err(|e| CtrError::io(&self.tags_dir, e))?;
        let _tags_lock = DirLock::acquire(&self.tags_dir, LockMode::Exclusive, None)?;

        let final_path = self.tag_path(new_tag);
        let tmp_link = self.tags_dir.join(format!(".{new_tag}.tmp"));
        let _ = std::fs::remove_file(&tmp_link);
        let relative_target = PathBuf::from("../trees").join(id.as_str());
        std::os::unix::fs::symlink(&relative_target, &tmp_link)
            .map_err(|e| CtrError::io(&tmp_link, e))?;
        std::fs::rename(&tmp_link, &final_path).map_err(|e| CtrError::io(&final_path, e))
    }

    /// Idempotent: removing an absent tag succeeds silently.
    pub fn remove_tag(&self, tag: &str) -> Result<(), CtrError> {
        std::fs::create_dir_all(&self.tags_dir).map_err(|e| CtrError::io(&self.tags_dir, e))?;
        let _tags_lock = DirLock::acquire(&self.tags_dir, LockMode::Exclusive, None)?;
        match std::fs::remove_file(self.tag_path(tag)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CtrError::io(&self.tag_path(tag), e)),
        }
    }

    /// Removes every tag pointing at `selector`'s image, then the tree
    /// itself. Refuses if `skip_active` and the image is still referenced
    /// by anything beyond the tree entry itself.
    pub fn remove(&self, selector: &ImageSelector, skip_active: bool) -> Result<(), CtrError> {
        let id = self
            .find(selector)?
            .ok_or_else(|| CtrError::NotFound(selector.to_string()))?;

        let _trees_lock = DirLock::acquire(&self.trees_dir, LockMode::Exclusive, None)?;
        let tree_dir = self.tree_dir(&id);
        let _tree_lock = DirLock::acquire(&tree_dir, LockMode::Exclusive, None)?;

        let rc = refcount::ref_count(&self.metadata_path(&id))?;
        if skip_active && rc > 1 {
            return Err(CtrError::Conflict(format!(
                "image {id} is still referenced ({rc} links)"
            )));
        }

        self.remove_all_tags_for(&id)?;
        std::fs::remove_dir_all(&tree_dir).map_err(|e| CtrError::io(&tree_dir, e))
    }

    fn remove_all_tags_for(&self, id: &ImageId) -> Result<(), CtrError> {
        if !self.tags_dir.is_dir() {
            return Ok(());
        }
        let _tags_lock = DirLock::acquire(&self.tags_dir, LockMode::Exclusive, None)?;
        for entry in std::fs::read_dir(&self.tags_dir).map_err(|e| CtrError::io(&self.tags_dir, e))? {
            let entry = entry.map_err(|e| CtrError::io(&self.tags_dir, e))?;
            if self.tag_target_id(&entry.path())?.as_ref() == Some(id) {
                std::fs::remove_file(entry.path()).map_err(|e| CtrError::io(&entry.path(), e))?;
            }
        }
        Ok(())
    }

    /// Removes every untagged image whose `ref_count == 1` and whose mtime
    /// is older than `grace`.
    pub fn cleanup(&self, grace: Duration) -> Result<Vec<ImageId>, CtrError> {
        let _trees_lock = DirLock::acquire(&self.trees_dir, LockMode::Shared, None)?;
        let tags_by_id = self.tags_index()?;
        let mut removed = Vec::new();

        if !self.trees_dir.is_dir() {
            return Ok(removed);
        }
        for entry in std::fs::read_dir(&self.trees_dir).map_err(|e| CtrError::io(&self.trees_dir, e))? {
            let entry = entry.map_err(|e| CtrError::io(&self.trees_dir, e))?;
            let Some(id_str) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            let Ok(id) = ImageId::parse(&id_str) else {
                continue;
            };
            if tags_by_id.contains_key(id.as_str()) {
                continue;
            }

            let tree_dir = entry.path();
            let Some(_lock) = DirLock::try_acquire(&tree_dir, LockMode::Exclusive)? else {
                continue;
            };
            let rc = refcount::ref_count(&self.metadata_path(&id))?;
            if rc != 1 {
                continue;
            }
            if !grace::is_old_enough(&tree_dir, grace)? {
                continue;
            }
            std::fs::remove_dir_all(&tree_dir).map_err(|e| CtrError::io(&tree_dir, e))?;
            tracing::info!(image_id = %id, "reclaimed image after grace period");
            removed.push(id);
        }
        Ok(removed)
    }
}

fn read_metadata(path: &Path) -> Result<ImageMetadata, CtrError> {
    let bytes = std::fs::read(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            CtrError::Corruption(format!("missing metadata at {path:?}"))
        } else {
            CtrError::io(path, e)
        }
    })?;
    serde_json::from_slice(&bytes)
        .map_err(|e| CtrError::validation("image metadata", format!("{path:?}: {e}")))
}

fn copy_dir_recursive(src: &Path, dst: &Path) -> Result<(), CtrError> {
    std::fs::create_dir_all(dst).map_err(|e| CtrError::io(dst, e))?;
    for entry in walkdir::WalkDir::new(src).min_depth(1).into_iter() {
        let entry = entry.map_err(|e| {
            CtrError::io(src, std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))
        })?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .expect("walkdir entries are under src");
        let target = dst.join(rel);
        let file_type = entry.file_type();
        if file_type.is_dir() {
            std::fs::create_dir_all(&target).map_err(|e| CtrError::io(&target, e))?;
        } else if file_type.is_symlink() {
            let link = std::fs::read_link(entry.path()).map_err(|e| CtrError::io(entry.path(), e))?;
            std::os::unix::fs::symlink(&link, &target).map_err(|e| CtrError::io(&target, e))?;
        } else {
            std::fs::copy(entry.path(), &target).map_err(|e| CtrError::io(&target, e))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn make_store(root: &Path) -> ImageStore {
        ImageStore::new(root.join("trees"), root.join("tags"), root.join("tmp"))
    }

    fn make_archive(dir: &Path, name: &str, version: &str) -> PathBuf {
        let staging = dir.join("staging");
        std::fs::create_dir_all(staging.join(archive::ROOTFS_DIR).join("etc")).unwrap();
        std::fs::write(
            staging.join(archive::METADATA_FILE),
            format!(r#"{{"name":"{name}","version":"{version}"}}"#),
        )
        .unwrap();
        std::fs::write(staging.join(archive::ROOTFS_DIR).join("etc/hostname"), b"x").unwrap();

        let archive_path = dir.join("image.tar.gz");
        archive::create(&staging, &archive_path).unwrap();
        archive_path
    }

    #[test]
    fn import_then_list_then_tag_then_remove() {
        let root = tempdir().unwrap();
        let store = make_store(root.path());
        let archive_path = make_archive(root.path(), "foo", "1-0");

        let id = store.import(&archive_path, Some("t1")).unwrap();
        let listed = store.list().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, id);
        assert_eq!(listed[0].tags, vec!["t1".to_string()]);

        store.tag(&ImageSelector::Tag("t1".to_string()), "t2").unwrap();
        let listed = store.list().unwrap();
        let mut tags = listed[0].tags.clone();
        tags.sort();
        assert_eq!(tags, vec!["t1".to_string(), "t2".to_string()]);

        store.remove_tag("t1").unwrap();
        let listed = store.list().unwrap();
        assert_eq!(listed[0].tags, vec!["t2".to_string()]);

        store.remove(&ImageSelector::Tag("t2".to_string()), true).unwrap();
        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn import_is_idempotent_on_id_collision() {
        let root = tempdir().unwrap();
        let store = make_store(root.path());
        let archive_path = make_archive(root.path(), "foo", "1-0");

        let id_a = store.import(&archive_path, None).unwrap();
        let id_b = store.import(&archive_path, None).unwrap();
        assert_eq!(id_a, id_b);
        assert_eq!(store.list().unwrap().len(), 1);
    }

    #[test]
    fn cleanup_respects_grace_period() {
        let root = tempdir().unwrap();
        let store = make_store(root.path());
        let archive_path = make_archive(root.path(), "foo", "1-0");
        let id = store.import(&archive_path, None).unwrap();

        let removed = store.cleanup(Duration::from_secs(3600)).unwrap();
        assert!(removed.is_empty());
        assert!(store.find(&ImageSelector::Id(id.clone())).unwrap().is_some());

        let removed = store.cleanup(Duration::ZERO).unwrap();
        assert_eq!(removed, vec![id.clone()]);
        assert!(store.find(&ImageSelector::Id(id)).unwrap().is_none());
    }

    #[test]
    fn build_from_directory() {
        let root = tempdir().unwrap();
        let store = make_store(root.path());

        let rootfs_src = root.path().join("src-rootfs");
        std::fs::create_dir_all(rootfs_src.join("bin")).unwrap();
        std::fs::write(rootfs_src.join("bin/true"), b"#!/bin/sh\n").unwrap();

        let id = store.build("foo", "2-0", &rootfs_src).unwrap();
        let listed = store.list().unwrap();
        assert_eq!(listed[0].id, id);
        assert_eq!(listed[0].name, "foo");
        assert_eq!(listed[0].version, "2-0");
    }
}
