//! OverlayFS assembly/teardown, invoked via the external `mount`/`umount`
//! tools rather than the `mount(2)` syscall directly — consistent with
//! `builders::base_image::prepare_base_rootfs`'s external-process approach
//! to privileged filesystem operations.

use std::path::{Path, PathBuf};
use std::process::Command;

use ctr_types::CtrError;

/// Mounts an overlay whose lower layers are `image_rootfs_paths`, ordered
/// deepest-first (index 0 is the base image). OverlayFS wants the opposite
/// order in `lowerdir` (topmost first), so this reverses the list before
/// joining with `:`.
pub fn mount_overlay(
    image_rootfs_paths: &[PathBuf],
    upper_path: &Path,
    work_path: &Path,
    target_path: &Path,
) -> Result<(), CtrError> {
    let lowerdir = image_rootfs_paths
        .iter()
        .rev()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(":");
    let options = format!(
        "lowerdir={lowerdir},upperdir={},workdir={}",
        upper_path.display(),
        work_path.display(),
    );

    let status = Command::new("mount")
        .arg("-t")
        .arg("overlay")
        .arg("-o")
        .arg(&options)
        .arg("overlay")
        .arg(target_path)
        .status()
        .map_err(|e| CtrError::io(target_path, e))?;

    if !status.success() {
        return Err(CtrError::External {
            command: "mount".to_string(),
            status: status.code(),
            stderr: String::new(),
        });
    }
    Ok(())
}

/// Best-effort unmount: tolerates "not currently a mountpoint" (overlay was
/// never mounted, or a previous unmount already succeeded), but refuses to
/// operate on a symlinked target — umount-ing through a symlink would
/// unmount whatever the link happens to point at, not the pod's rootfs.
pub fn umount(target_path: &Path) -> Result<(), CtrError> {
    if std::fs::symlink_metadata(target_path)
        .map(|m| m.file_type().is_symlink())
        .unwrap_or(false)
    {
        return Err(CtrError::validation(
            "overlay unmount target",
            format!("{target_path:?} is a symlink"),
        ));
    }

    let output = Command::new("umount")
        .arg(target_path)
        .output()
        .map_err(|e| CtrError::io(target_path, e))?;

    if output.status.success() {
        return Ok(());
    }
    let stderr = String::from_utf8_lossy(&output.stderr);
    if stderr.contains("not mounted") || stderr.contains("not found") {
        return Ok(());
    }
    Err(CtrError::External {
        command: "umount".to_string(),
        status: output.status.code(),
        stderr: stderr.into_owned(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lowerdir_reverses_to_topmost_first() {
        let paths = vec![PathBuf::from("/a/rootfs"), PathBuf::from("/b/rootfs"), PathBuf::from("/c/rootfs")];
        let lowerdir = paths
            .iter()
            .rev()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join(":");
        assert_eq!(lowerdir, "/c/rootfs:/b/rootfs:/a/rootfs");
    }

    #[test]
    fn umount_rejects_symlink_target() {
        let dir = tempfile::tempdir().unwrap();
        let real = dir.path().join("real");
        std::fs::create_dir(&real).unwrap();
        let link = dir.path().join("link");
        std::os::unix::fs::symlink(&real, &link).unwrap();

        let err = umount(&link).unwrap_err();
        assert!(matches!(err, CtrError::Validation { .. }));
    }
}
