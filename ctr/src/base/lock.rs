//! Advisory file locking on directory inodes.
//!
//! Wraps POSIX `flock(2)` via `rustix`, the same systems-call crate family
//! used for mount/process operations elsewhere in this pack. Locks are
//! always taken on directory file descriptors, never on arbitrary files,
//! so they never interact with rename the way a lock on a regular file
//! that gets renamed-over would.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use rustix::fd::AsFd;
use rustix::fs::{flock, FlockOperation};

use ctr_types::CtrError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

/// A held advisory lock on one directory. Released on drop.
pub struct DirLock {
    path: PathBuf,
    file: File,
    mode: LockMode,
}

/// How long to back off between non-blocking retry attempts when a timeout
/// was requested. `flock` offers no interruptible-with-timeout primitive,
/// so a bounded poll loop is the straightforward portable substitute.
const RETRY_INTERVAL: Duration = Duration::from_millis(20);

impl DirLock {
    /// Block until the lock is acquired, or until `timeout` elapses (if
    /// given), returning `Busy` on timeout.
    pub fn acquire(path: &Path, mode: LockMode, timeout: Option<Duration>) -> Result<Self, CtrError> {
        let file = open_dir(path)?;

        match timeout {
            None => {
                let op = match mode {
                    LockMode::Shared => FlockOperation::LockShared,
                    LockMode::Exclusive => FlockOperation::LockExclusive,
                };
                flock(file.as_fd(), op)
                    .map_err(|e| CtrError::io(path, std::io::Error::from(e)))?;
            }
            Some(timeout) => {
                let deadline = Instant::now() + timeout;
                loop {
                    if try_flock(path, &file, mode)? {
                        break;
                    }
                    if Instant::now() >= deadline {
                        return Err(CtrError::Busy {
                            path: path.to_path_buf(),
                        });
                    }
                    std::thread::sleep(RETRY_INTERVAL);
                }
            }
        }

        Ok(Self {
            path: path.to_path_buf(),
            file,
            mode,
        })
    }

    /// Non-blocking: returns `Ok(None)` immediately if the lock is held
    /// elsewhere, rather than blocking or erroring.
    pub fn try_acquire(path: &Path, mode: LockMode) -> Result<Option<Self>, CtrError> {
        let file = open_dir(path)?;
        if try_flock(path, &file, mode)? {
            Ok(Some(Self {
                path: path.to_path_buf(),
                file,
                mode,
            }))
        } else {
            Ok(None)
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn mode(&self) -> LockMode {
        self.mode
    }

    /// Downgrade an exclusive lock to shared. The reverse (shared ->
    /// exclusive) is not guaranteed by `flock(2)` semantics and is not
    /// exposed here.
    pub fn downgrade(&mut self) -> Result<(), CtrError> {
        flock(self.file.as_fd(), FlockOperation::LockShared)
            .map_err(|e| CtrError::io(&self.path, std::io::Error::from(e)))?;
        self.mode = LockMode::Shared;
        Ok(())
    }
}

fn try_flock(path: &Path, file: &File, mode: LockMode) -> Result<bool, CtrError> {
    let op = match mode {
        LockMode::Shared => FlockOperation::NonBlockingLockShared,
        LockMode::Exclusive => FlockOperation::NonBlockingLockExclusive,
    };
    match flock(file.as_fd(), op) {
        Ok(()) => Ok(true),
        Err(rustix::io::Errno::WOULDBLOCK) => Ok(false),
        Err(e) => Err(CtrError::io(path, std::io::Error::from(e))),
    }
}

fn open_dir(path: &Path) -> Result<File, CtrError> {
    std::fs::create_dir_all(path).map_err(|e| CtrError::io(path, e))?;
    File::open(path).map_err(|e| CtrError::io(path, e))
}

/// An advisory lock on a regular file that must already exist — used for
/// the xar store's per-dependency locks (`xars/<name>/deps/<image_id>`,
/// hard links rather than directories), where `exec` takes a shared lock to
/// block a concurrent `uninstall` from unlinking the dependency out from
/// under a running process.
pub struct FileLock {
    path: PathBuf,
    file: File,
}

impl FileLock {
    pub fn try_acquire(path: &Path, mode: LockMode) -> Result<Option<Self>, CtrError> {
        let file = File::open(path).map_err(|e| CtrError::io(path, e))?;
        if try_flock(path, &file, mode)? {
            Ok(Some(Self {
                path: path.to_path_buf(),
                file,
            }))
        } else {
            Ok(None)
        }
    }

    pub fn acquire(path: &Path, mode: LockMode) -> Result<Self, CtrError> {
        let file = File::open(path).map_err(|e| CtrError::io(path, e))?;
        let op = match mode {
            LockMode::Shared => FlockOperation::LockShared,
            LockMode::Exclusive => FlockOperation::LockExclusive,
        };
        flock(file.as_fd(), op).map_err(|e| CtrError::io(path, std::io::Error::from(e)))?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn exclusive_lock_excludes_another_exclusive_try() {
        let dir = tempdir().unwrap();
        let _held = DirLock::acquire(dir.path(), LockMode::Exclusive, None).unwrap();
        let second = DirLock::try_acquire(dir.path(), LockMode::Exclusive).unwrap();
        assert!(second.is_none());
    }

    #[test]
    fn lock_released_on_drop_allows_reacquire() {
        let dir = tempdir().unwrap();
        {
            let _held = DirLock::acquire(dir.path(), LockMode::Exclusive, None).unwrap();
        }
        let second = DirLock::try_acquire(dir.path(), LockMode::Exclusive).unwrap();
        assert!(second.is_some());
    }

    #[test]
    fn shared_locks_do_not_exclude_each_other() {
        let dir = tempdir().unwrap();
        let _a = DirLock::acquire(dir.path(), LockMode::Shared, None).unwrap();
        let b = DirLock::try_acquire(dir.path(), LockMode::Shared).unwrap();
        assert!(b.is_some());
    }

    #[test]
    fn busy_times_out() {
        let dir = tempdir().unwrap();
        let _held = DirLock::acquire(dir.path(), LockMode::Exclusive, None).unwrap();
        let err = DirLock::acquire(dir.path(), LockMode::Exclusive, Some(Duration::from_millis(50)))
            .unwrap_err();
        assert!(matches!(err, CtrError::Busy { .. }));
    }
}
