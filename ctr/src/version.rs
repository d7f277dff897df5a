//! `REPO/VERSION`: a single integer line. The code refuses to operate if the
//! on-disk version does not match `CURRENT_VERSION`, leaving room for future
//! migrations.
//!
//! Version 1 fixes the image-id hashing scheme as `ctr-hash-v1`: SHA-256
//! over `metadata` re-serialized with sorted keys, followed by a
//! deterministic `tar` walk of `rootfs/` (entries sorted by path, mtime
//! forced to 0, uid/gid forced to 0). See `ctr::images::archive`.

use std::path::Path;

use ctr_types::CtrError;

pub const CURRENT_VERSION: u32 = 1;

pub fn ensure_version(repo_path: &Path) -> Result<(), CtrError> {
    let version_path = repo_path.join("VERSION");
    match std::fs::read_to_string(&version_path) {
        Ok(contents) => check(&version_path, &contents),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            std::fs::write(&version_path, format!("{CURRENT_VERSION}\n"))
                .map_err(|e| CtrError::io(&version_path, e))
        }
        Err(e) => Err(CtrError::io(&version_path, e)),
    }
}

fn check(version_path: &Path, contents: &str) -> Result<(), CtrError> {
    let n: u32 = contents
        .trim()
        .parse()
        .map_err(|_| CtrError::Corruption(format!("malformed VERSION file at {version_path:?}")))?;
    if n != CURRENT_VERSION {
        return Err(CtrError::Corruption(format!(
            "repository at {version_path:?} is version {n}, this build supports {CURRENT_VERSION}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn writes_current_version_when_absent() {
        let dir = tempdir().unwrap();
        ensure_version(dir.path()).unwrap();
        let contents = std::fs::read_to_string(dir.path().join("VERSION")).unwrap();
        assert_eq!(contents.trim(), "1");
    }

    #[test]
    fn rejects_mismatched_version() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("VERSION"), "99\n").unwrap();
        assert!(matches!(
            ensure_version(dir.path()),
            Err(CtrError::Corruption(_))
        ));
    }

    #[test]
    fn rejects_malformed_version() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("VERSION"), "not-a-number\n").unwrap();
        assert!(matches!(
            ensure_version(dir.path()),
            Err(CtrError::Corruption(_))
        ));
    }
}
