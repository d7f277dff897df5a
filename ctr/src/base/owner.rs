//! Root ownership and mode policy (invariant 5): every file/directory inside
//! the repo is owned by `root:root`, mode <= 0750 on directories, <= 0640 on
//! files, except the rootfs interior which preserves whatever the image
//! contains.

use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use rustix::fs::{chown, Gid, Uid};

use ctr_types::CtrError;

pub const DIR_MODE: u32 = 0o750;
pub const FILE_MODE: u32 = 0o640;

/// Applies the repo's root-ownership and mode policy to a single directory.
/// No-op for ownership when not running as root (chown then fails with
/// EPERM, which the caller should tolerate in non-root test environments
/// by calling `apply_dir` only from root-required operations).
pub fn apply_dir(path: &Path) -> Result<(), CtrError> {
    let perms = std::fs::Permissions::from_mode(DIR_MODE);
    std::fs::set_permissions(path, perms).map_err(|e| CtrError::io(path, e))?;
    chown_root(path)
}

pub fn apply_file(path: &Path) -> Result<(), CtrError> {
    let perms = std::fs::Permissions::from_mode(FILE_MODE);
    std::fs::set_permissions(path, perms).map_err(|e| CtrError::io(path, e))?;
    chown_root(path)
}

/// Chowns `path` to `root:root`, tolerating `EPERM` when not running as
/// root (non-root test environments). Exposed separately from
/// `apply_dir`/`apply_file` for callers (e.g. rootfs interior setup) that
/// need root ownership with a mode other than the two repo-level defaults.
pub fn chown_root(path: &Path) -> Result<(), CtrError> {
    match chown(path, Some(Uid::ROOT), Some(Gid::ROOT)) {
        Ok(()) => Ok(()),
        Err(rustix::io::Errno::PERM) => Ok(()),
        Err(e) => Err(CtrError::io(path, std::io::Error::from(e))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn apply_dir_sets_mode() {
        let dir = tempdir().unwrap();
        apply_dir(dir.path()).unwrap();
        let mode = std::fs::metadata(dir.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, DIR_MODE);
    }
}
