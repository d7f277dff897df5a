//! Scoped tmp directory: a locked staging area under a sub-repo's `tmp/`,
//! committed into place by rename or rolled back by removal.
//!
//! Generalizes the `tempfile::tempdir_in` usage pattern (temp dir on the
//! same filesystem as the eventual destination, so the commit step is a
//! same-filesystem rename rather than a cross-filesystem copy) into a
//! lock-guarded commit/rollback helper.

use std::path::{Path, PathBuf};

use tempfile::TempDir;

use ctr_types::CtrError;

use super::lock::{DirLock, LockMode};

pub struct ScopedTmpDir {
    inner: Option<TempDir>,
    _lock: DirLock,
}

impl ScopedTmpDir {
    /// Creates a fresh, uniquely-named directory under `tmp_root`, held
    /// under an exclusive lock for the lifetime of this handle.
    pub fn create(tmp_root: &Path) -> Result<Self, CtrError> {
        std::fs::create_dir_all(tmp_root).map_err(|e| CtrError::io(tmp_root, e))?;
        let inner = tempfile::Builder::new()
            .prefix("ctr-")
            .tempdir_in(tmp_root)
            .map_err(|e| CtrError::io(tmp_root, e))?;
        let lock = DirLock::acquire(inner.path(), LockMode::Exclusive, None)?;
        Ok(Self {
            inner: Some(inner),
            _lock: lock,
        })
    }

    pub fn path(&self) -> &Path {
        self.inner
            .as_ref()
            .expect("ScopedTmpDir used after commit")
            .path()
    }

    /// Commits the staged directory to `dest` via a same-filesystem rename.
    /// `dest`'s parent must already exist; `dest` itself must not.
    pub fn commit(mut self, dest: &Path) -> Result<(), CtrError> {
        let inner = self.inner.take().expect("ScopedTmpDir used after commit");
        let staged: PathBuf = inner.into_path();
        std::fs::rename(&staged, dest).map_err(|e| {
            let _ = std::fs::remove_dir_all(&staged);
            CtrError::io(dest, e)
        })
    }
}

// Dropping with `inner` still `Some` (the normal "didn't commit" path, which
// also covers panics/unwinds via TempDir's own Drop impl) removes the
// staged subtree. Rollback is therefore unconditional on every exit path
// that isn't an explicit `commit`.

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn commit_renames_into_place() {
        let root = tempdir().unwrap();
        let tmp_root = root.path().join("tmp");
        let dest = root.path().join("final");

        let staged = ScopedTmpDir::create(&tmp_root).unwrap();
        std::fs::write(staged.path().join("marker"), b"x").unwrap();
        staged.commit(&dest).unwrap();

        assert!(dest.join("marker").exists());
    }

    #[test]
    fn drop_without_commit_rolls_back() {
        let root = tempdir().unwrap();
        let tmp_root = root.path().join("tmp");

        let path = {
            let staged = ScopedTmpDir::create(&tmp_root).unwrap();
            staged.path().to_path_buf()
        };

        assert!(!path.exists());
    }
}
