//! Base image construction: `prepare-base-rootfs` (bootstrap a minimal
//! distro root via the external `debootstrap`) and `setup-base-rootfs` (the
//! deterministic mutation sequence that turns that root into a pod base).

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Command;

use ctr_types::CtrError;

use crate::base::owner;

use super::pipeline::{self, BoxedTask, PipelineTask, Stage};
use super::pod_exit::{self, UnitFile};

/// Ubuntu release codename `debootstrap` targets. The original source reads
/// this from a shared constant not present in this pack's retrieval; fixed
/// here for the "focal"-era unit layout the rest of `setup_base_rootfs`
/// assumes (the docstring of the original notes the 18.04 -> 20.04 changes
/// this module already accounts for).
pub const BASE_IMAGE_RELEASE_CODE_NAME: &str = "focal";

const DEBOOTSTRAP_MIRROR: &str = "http://us.archive.ubuntu.com/ubuntu/";

const PRUNE_DIRS: &[&str] = &[
    "usr/share/doc",
    "usr/share/info",
    "usr/share/man",
    "var/cache",
    "var/lib/apt",
    "var/lib/dpkg",
];

const IDENTITY_FILES: &[&str] = &[
    "etc/hostname",
    "etc/machine-id",
    "var/lib/dbus/machine-id",
    "etc/resolv.conf",
    "run/systemd/resolve/stub-resolv.conf",
];

/// Invokes `debootstrap` into `dest`, which must not already exist. External
/// process invocation; a non-zero exit surfaces as `CtrError::External`.
pub fn prepare_base_rootfs(dest: &Path) -> Result<(), CtrError> {
    if dest.exists() {
        return Err(CtrError::validation("base rootfs destination", dest.display().to_string()));
    }
    let status = Command::new("debootstrap")
        .arg("--variant=minbase")
        .arg("--components=main")
        .arg("--include=dbus,sudo,systemd,tzdata")
        .arg(BASE_IMAGE_RELEASE_CODE_NAME)
        .arg(dest)
        .arg(DEBOOTSTRAP_MIRROR)
        .status()
        .map_err(|e| CtrError::io(dest, e))?;

    if !status.success() {
        return Err(CtrError::External {
            command: "debootstrap".to_string(),
            status: status.code(),
            stderr: String::new(),
        });
    }
    Ok(())
}

/// Runs the deterministic mutation sequence over an already-bootstrapped
/// `image_rootfs_path`. Idempotent on a freshly-bootstrapped tree.
/// `prune_stash_path`, if given, receives pruned content instead of having
/// it deleted outright.
pub fn setup_base_rootfs(
    image_rootfs_path: &Path,
    prune_stash_path: Option<&Path>,
) -> Result<(), CtrError> {
    if !image_rootfs_path.is_dir() {
        return Err(CtrError::validation(
            "base rootfs",
            image_rootfs_path.display().to_string(),
        ));
    }

    let ctx = Ctx {
        root: image_rootfs_path.to_path_buf(),
        prune_stash_path: prune_stash_path.map(|p| p.to_path_buf()),
    };

    let stages = vec![
        Stage::sequential(vec![Box::new(PruneUnneededFiles) as BoxedTask<Ctx>]),
        Stage::sequential(vec![Box::new(RemoveIdentityFiles) as BoxedTask<Ctx>]),
        Stage::sequential(vec![Box::new(ReplaceConfigFiles) as BoxedTask<Ctx>]),
        Stage::sequential(vec![Box::new(SetupUnitFiles) as BoxedTask<Ctx>]),
        Stage::sequential(vec![Box::new(SetupPodExit) as BoxedTask<Ctx>]),
    ];
    pipeline::run(stages, &ctx)
}

struct Ctx {
    root: PathBuf,
    prune_stash_path: Option<PathBuf>,
}

struct PruneUnneededFiles;

impl PipelineTask<Ctx> for PruneUnneededFiles {
    fn run(&self, ctx: &Ctx) -> Result<(), CtrError> {
        for rel in PRUNE_DIRS {
            let dir_path = ctx.root.join(rel);
            if !dir_path.is_dir() {
                continue;
            }
            match &ctx.prune_stash_path {
                Some(stash) => {
                    let dst = stash.join(rel);
                    std::fs::create_dir_all(&dst).map_err(|e| CtrError::io(&dst, e))?;
                    move_dir_content(&dir_path, &dst)?;
                }
                None => clear_dir_content(&dir_path)?,
            }
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "prune-unneeded-files"
    }
}

struct RemoveIdentityFiles;

impl PipelineTask<Ctx> for RemoveIdentityFiles {
    fn run(&self, ctx: &Ctx) -> Result<(), CtrError> {
        for rel in IDENTITY_FILES {
            let path = ctx.root.join(rel);
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(CtrError::io(&path, e)),
            }
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "remove-identity-files"
    }
}

struct ReplaceConfigFiles;

impl PipelineTask<Ctx> for ReplaceConfigFiles {
    fn run(&self, ctx: &Ctx) -> Result<(), CtrError> {
        for (rel, content) in [
            ("etc/default/locale", pod_exit::LOCALE),
            ("etc/resolv.conf", pod_exit::RESOLV_CONF),
            ("etc/systemd/journald.conf", pod_exit::JOURNALD_CONF),
        ] {
            let path = ctx.root.join(rel);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).map_err(|e| CtrError::io(parent, e))?;
            }
            std::fs::write(&path, content).map_err(|e| CtrError::io(&path, e))?;
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "replace-config-files"
    }
}

struct SetupUnitFiles;

impl PipelineTask<Ctx> for SetupUnitFiles {
    fn run(&self, ctx: &Ctx) -> Result<(), CtrError> {
        let mut remaining: std::collections::HashSet<&str> =
            pod_exit::BASE_UNITS.iter().copied().collect();

        for unit_dir in ["etc/systemd/system", "usr/lib/systemd/system"] {
            let dir_path = ctx.root.join(unit_dir);
            if !dir_path.is_dir() {
                continue;
            }
            for entry in std::fs::read_dir(&dir_path).map_err(|e| CtrError::io(&dir_path, e))? {
                let entry = entry.map_err(|e| CtrError::io(&dir_path, e))?;
                let name = entry.file_name();
                let Some(name) = name.to_str() else { continue };
                if remaining.remove(name) {
                    continue;
                }
                if pod_exit::BASE_UNITS.contains(&name) {
                    continue;
                }
                let path = entry.path();
                if entry.file_type().map_err(|e| CtrError::io(&path, e))?.is_dir() {
                    std::fs::remove_dir_all(&path).map_err(|e| CtrError::io(&path, e))?;
                } else {
                    std::fs::remove_file(&path).map_err(|e| CtrError::io(&path, e))?;
                }
            }
        }

        if !remaining.is_empty() {
            let mut missing: Vec<&str> = remaining.into_iter().collect();
            missing.sort_unstable();
            return Err(CtrError::Corruption(format!(
                "base rootfs is missing expected unit(s): {}",
                missing.join(", ")
            )));
        }

        create_unit_files(&ctx.root.join("etc/systemd/system"), pod_exit::ETC_UNIT_FILES)?;
        create_unit_files(&ctx.root.join("usr/lib/systemd/system"), pod_exit::LIB_UNIT_FILES)
    }

    fn name(&self) -> &str {
        "setup-unit-files"
    }
}

fn create_unit_files(unit_dir: &Path, files: &[UnitFile]) -> Result<(), CtrError> {
    for unit in files {
        match unit {
            UnitFile::Dir(rel) => {
                let path = unit_dir.join(rel);
                std::fs::create_dir(&path).map_err(|e| CtrError::io(&path, e))?;
                owner::chown_root(&path)?;
            }
            UnitFile::File(rel, content) => {
                let path = unit_dir.join(rel);
                std::fs::write(&path, content).map_err(|e| CtrError::io(&path, e))?;
                std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644))
                    .map_err(|e| CtrError::io(&path, e))?;
                owner::chown_root(&path)?;
            }
            UnitFile::Symlink(rel, target) => {
                let path = unit_dir.join(rel);
                std::os::unix::fs::symlink(target, &path).map_err(|e| CtrError::io(&path, e))?;
                owner::chown_root(&path)?;
            }
        }
    }
    Ok(())
}

struct SetupPodExit;

impl PipelineTask<Ctx> for SetupPodExit {
    fn run(&self, ctx: &Ctx) -> Result<(), CtrError> {
        let pod_exit_path = ctx.root.join("usr/sbin/pod-exit");
        if let Some(parent) = pod_exit_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| CtrError::io(parent, e))?;
        }
        std::fs::write(&pod_exit_path, pod_exit::POD_EXIT_SCRIPT)
            .map_err(|e| CtrError::io(&pod_exit_path, e))?;
        std::fs::set_permissions(&pod_exit_path, std::fs::Permissions::from_mode(0o755))
            .map_err(|e| CtrError::io(&pod_exit_path, e))?;
        owner::chown_root(&pod_exit_path)?;

        for rel in ["var/lib/pod", "var/lib/pod/exit-status"] {
            let path = ctx.root.join(rel);
            std::fs::create_dir_all(&path).map_err(|e| CtrError::io(&path, e))?;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
                .map_err(|e| CtrError::io(&path, e))?;
            owner::chown_root(&path)?;
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "setup-pod-exit"
    }
}

fn clear_dir_content(dir: &Path) -> Result<(), CtrError> {
    for entry in std::fs::read_dir(dir).map_err(|e| CtrError::io(dir, e))? {
        let entry = entry.map_err(|e| CtrError::io(dir, e))?;
        let path = entry.path();
        if entry.file_type().map_err(|e| CtrError::io(&path, e))?.is_dir() {
            std::fs::remove_dir_all(&path).map_err(|e| CtrError::io(&path, e))?;
        } else {
            std::fs::remove_file(&path).map_err(|e| CtrError::io(&path, e))?;
        }
    }
    Ok(())
}

fn move_dir_content(src: &Path, dst: &Path) -> Result<(), CtrError> {
    for entry in std::fs::read_dir(src).map_err(|e| CtrError::io(src, e))? {
        let entry = entry.map_err(|e| CtrError::io(src, e))?;
        let target = dst.join(entry.file_name());
        std::fs::rename(entry.path(), &target).map_err(|e| CtrError::io(&target, e))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn minimal_bootstrapped_tree(root: &Path) {
        std::fs::create_dir_all(root.join("etc/systemd/system")).unwrap();
        std::fs::create_dir_all(root.join("usr/lib/systemd/system")).unwrap();
        std::fs::create_dir_all(root.join("usr/sbin")).unwrap();
        std::fs::create_dir_all(root.join("usr/share/doc")).unwrap();
        std::fs::write(root.join("etc/hostname"), b"bootstrap-host\n").unwrap();
        std::fs::write(
            root.join("etc/systemd/system/some-extra.service"),
            b"[Unit]\n",
        )
        .unwrap();
        for unit in pod_exit::BASE_UNITS {
            std::fs::write(root.join("usr/lib/systemd/system").join(unit), b"[Unit]\n").unwrap();
        }
    }

    #[test]
    fn setup_base_rootfs_is_idempotent() {
        let dir = tempdir().unwrap();
        minimal_bootstrapped_tree(dir.path());

        setup_base_rootfs(dir.path(), None).unwrap();

        assert!(!dir.path().join("etc/hostname").exists());
        assert!(!dir.path().join("etc/systemd/system/some-extra.service").exists());
        assert!(dir.path().join("usr/sbin/pod-exit").is_file());
        assert!(dir.path().join("var/lib/pod/exit-status").is_dir());
        assert!(dir.path().join("usr/lib/systemd/system/pod.target").is_file());

        // The cleanup step in `SetupUnitFiles` removes anything outside
        // `BASE_UNITS` before recreating the unit graph, so a second run
        // over the already-set-up tree succeeds and reproduces the same
        // layout rather than conflicting with it.
        setup_base_rootfs(dir.path(), None).unwrap();
        assert!(dir.path().join("usr/lib/systemd/system/pod.target").is_file());
    }

    #[test]
    fn prune_stash_path_preserves_content() {
        let dir = tempdir().unwrap();
        minimal_bootstrapped_tree(dir.path());
        std::fs::write(dir.path().join("usr/share/doc/readme"), b"hi").unwrap();

        let stash = tempdir().unwrap();
        setup_base_rootfs(dir.path(), Some(stash.path())).unwrap();

        assert!(stash.path().join("usr/share/doc/readme").is_file());
    }
}
