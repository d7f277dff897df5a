//! Invocation of the external container supervisor (`systemd-nspawn`,
//! opaque beyond its argv contract), blocking until it exits.
//!
//! Grounded in `boxlite::vmm::controller::spawn::spawn_subprocess`'s
//! piped-stdio + `RUST_LOG` passthrough, adapted to a blocking `wait()`
//! instead of a detached `Child` since a pod's `run` blocks for the whole
//! supervisor lifetime rather than returning a handle to poll later.

use std::path::Path;
use std::process::{Command, Stdio};

use ctr_types::CtrError;

const SUPERVISOR: &str = "systemd-nspawn";

/// One `--bind=SRC:DST` or `--bind-ro=SRC:DST` argument.
pub fn bind_argument(source: &Path, target: &Path, read_only: bool) -> String {
    let flag = if read_only { "--bind-ro" } else { "--bind" };
    format!("{flag}={}:{}", source.display(), target.display())
}

/// Runs the supervisor against `rootfs_path` with `hostname` and the given
/// bind arguments, blocking until it exits. Propagates `RUST_LOG` the same
/// way the wider toolbox's VM supervisor does, so a pod's systemd-journald
/// and this process's own tracing subscriber agree on verbosity.
pub fn run(rootfs_path: &Path, hostname: &str, binds: &[String]) -> Result<i32, CtrError> {
    let mut cmd = Command::new(SUPERVISOR);
    cmd.arg("--directory").arg(rootfs_path);
    cmd.arg(format!("--hostname={hostname}"));
    cmd.arg("--boot");
    for bind in binds {
        cmd.arg(bind);
    }

    if let Ok(rust_log) = std::env::var("RUST_LOG") {
        cmd.env("RUST_LOG", rust_log);
    }

    cmd.stdin(Stdio::inherit());
    cmd.stdout(Stdio::inherit());
    cmd.stderr(Stdio::inherit());

    let status = cmd.status().map_err(|e| CtrError::io(rootfs_path, e))?;
    Ok(status.code().unwrap_or(-1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_argument_formats_read_only_and_read_write() {
        assert_eq!(
            bind_argument(Path::new("/a"), Path::new("/b"), true),
            "--bind-ro=/a:/b"
        );
        assert_eq!(
            bind_argument(Path::new("/a"), Path::new("/b"), false),
            "--bind=/a:/b"
        );
    }
}
