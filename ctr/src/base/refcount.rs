//! Reference counting via hard links on an image's `metadata` file. No
//! separate bookkeeping is kept; the link count on `metadata` is the count.

use std::os::unix::fs::MetadataExt;
use std::path::Path;

use ctr_types::CtrError;

/// Hard-links `metadata_path` to `dst_path`, establishing one reference.
/// `dst_path`'s parent directory must already exist.
pub fn add_ref(metadata_path: &Path, dst_path: &Path) -> Result<(), CtrError> {
    std::fs::hard_link(metadata_path, dst_path).map_err(|e| CtrError::io(dst_path, e))
}

/// Removes one reference by unlinking `dst_path`. Idempotent: a missing
/// `dst_path` is not an error.
pub fn remove_ref(dst_path: &Path) -> Result<(), CtrError> {
    match std::fs::remove_file(dst_path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(CtrError::io(dst_path, e)),
    }
}

/// The link count on `metadata_path`, read via a single `fstatat`-backed
/// `stat`. Per spec: `1 (the image itself) + pods + xars + external refs`.
pub fn ref_count(metadata_path: &Path) -> Result<u64, CtrError> {
    let meta = std::fs::metadata(metadata_path).map_err(|e| CtrError::io(metadata_path, e))?;
    Ok(meta.nlink())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn fresh_metadata_has_refcount_one() {
        let dir = tempdir().unwrap();
        let meta = dir.path().join("metadata");
        std::fs::write(&meta, b"{}").unwrap();
        assert_eq!(ref_count(&meta).unwrap(), 1);
    }

    #[test]
    fn add_ref_increments_and_remove_ref_decrements() {
        let dir = tempdir().unwrap();
        let meta = dir.path().join("metadata");
        std::fs::write(&meta, b"{}").unwrap();
        let link = dir.path().join("link");

        add_ref(&meta, &link).unwrap();
        assert_eq!(ref_count(&meta).unwrap(), 2);

        remove_ref(&link).unwrap();
        assert_eq!(ref_count(&meta).unwrap(), 1);

        // idempotent
        remove_ref(&link).unwrap();
    }
}
