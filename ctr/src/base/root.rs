//! Repository root resolution and idempotent initialization of the three
//! sub-repositories (`images/`, `pods/`, `xars/`) plus `REPO/VERSION`.
//!
//! Grounded in `boxlite::runtime::layout::FilesystemLayout::prepare()`'s
//! create-dir-all-then-chmod pattern, generalized from boxlite's single
//! runtime directory to this repo's three sibling sub-repositories.

use std::path::{Path, PathBuf};

use ctr_types::CtrError;

use super::owner;
use crate::version;

/// An absolute, initialized repository root.
#[derive(Debug, Clone)]
pub struct RepoRoot {
    path: PathBuf,
}

const SUB_DIRS: &[&str] = &[
    "images/trees",
    "images/tags",
    "images/tmp",
    "pods/active",
    "pods/graveyard",
    "pods/tmp",
    "xars",
];

impl RepoRoot {
    /// Resolves `path` and ensures the on-disk layout exists with the
    /// repo's ownership/mode policy. Idempotent: safe to call on an
    /// already-initialized repo.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, CtrError> {
        let path = path.into();
        if !path.is_absolute() {
            return Err(CtrError::validation("repo path", path.display().to_string()));
        }

        std::fs::create_dir_all(&path).map_err(|e| CtrError::io(&path, e))?;
        owner::apply_dir(&path)?;

        for sub in SUB_DIRS {
            let dir = path.join(sub);
            std::fs::create_dir_all(&dir).map_err(|e| CtrError::io(&dir, e))?;
            owner::apply_dir(&dir)?;
        }

        version::ensure_version(&path)?;

        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn images_trees(&self) -> PathBuf {
        self.path.join("images/trees")
    }

    pub fn images_tags(&self) -> PathBuf {
        self.path.join("images/tags")
    }

    pub fn images_tmp(&self) -> PathBuf {
        self.path.join("images/tmp")
    }

    pub fn pods_active(&self) -> PathBuf {
        self.path.join("pods/active")
    }

    pub fn pods_graveyard(&self) -> PathBuf {
        self.path.join("pods/graveyard")
    }

    pub fn pods_tmp(&self) -> PathBuf {
        self.path.join("pods/tmp")
    }

    pub fn xars(&self) -> PathBuf {
        self.path.join("xars")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn open_creates_full_layout() {
        let dir = tempdir().unwrap();
        let root = RepoRoot::open(dir.path().join("repo")).unwrap();

        for sub in SUB_DIRS {
            assert!(root.path().join(sub).is_dir(), "missing {sub}");
        }
        assert!(root.path().join("VERSION").is_file());
    }

    #[test]
    fn open_is_idempotent() {
        let dir = tempdir().unwrap();
        let repo_path = dir.path().join("repo");
        RepoRoot::open(&repo_path).unwrap();
        RepoRoot::open(&repo_path).unwrap();
    }

    #[test]
    fn rejects_relative_path() {
        assert!(RepoRoot::open("relative/path").is_err());
    }
}
