//! Error taxonomy shared by every `ctr` component.
//!
//! The kinds here are the ones named in the core's error handling design:
//! Validation, NotFound, Conflict, Busy, Permission, IO, External, Corruption.
//! The CLI maps each kind to one of the exit codes in the external
//! interfaces section (0 success, 1 generic, 2 usage, 3 busy, 4 not found).

use std::path::PathBuf;

use thiserror::Error;

pub type CtrResult<T> = Result<T, CtrError>;

#[derive(Debug, Error)]
pub enum CtrError {
    /// Malformed id/name/version/tag, bad JSON, unknown config key, or an
    /// unknown/ambiguous selector combination.
    #[error("invalid {what}: {value:?}")]
    Validation { what: &'static str, value: String },

    /// A selector resolved to zero matches.
    #[error("not found: {0}")]
    NotFound(String),

    /// A selector resolved to more than one match, or a uniqueness
    /// constraint (name, version) would be violated.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Lock acquisition timed out.
    #[error("busy: {path}")]
    Busy { path: PathBuf },

    /// The operation requires root and the process is not root, or the
    /// filesystem returned EACCES.
    #[error("permission denied: {0}")]
    Permission(String),

    /// Any other filesystem error, with path context.
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A non-zero exit from an external process (debootstrap, tar, mount,
    /// the container supervisor).
    #[error("external command `{command}` failed (status {status:?}): {stderr}")]
    External {
        command: String,
        status: Option<i32>,
        stderr: String,
    },

    /// An on-disk invariant was violated. Never silently repaired.
    #[error("corrupt repository state: {0}")]
    Corruption(String),
}

impl CtrError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        let path = path.into();
        if source.kind() == std::io::ErrorKind::PermissionDenied {
            return CtrError::Permission(format!("{}: {}", path.display(), source));
        }
        CtrError::Io { path, source }
    }

    pub fn validation(what: &'static str, value: impl Into<String>) -> Self {
        CtrError::Validation {
            what,
            value: value.into(),
        }
    }

    /// Exit code per the external interfaces section: 1 generic, 2 usage,
    /// 3 busy, 4 not found.
    pub fn exit_code(&self) -> i32 {
        match self {
            CtrError::NotFound(_) => 4,
            CtrError::Busy { .. } => 3,
            CtrError::Validation { .. } | CtrError::Conflict(_) => 2,
            _ => 1,
        }
    }
}
