//! Grace-period predicate used by every cleanup routine.

use std::path::Path;
use std::time::{Duration, SystemTime};

use ctr_types::CtrError;

/// True iff `path`'s mtime is older than `now - grace`.
pub fn is_old_enough(path: &Path, grace: Duration) -> Result<bool, CtrError> {
    let meta = std::fs::metadata(path).map_err(|e| CtrError::io(path, e))?;
    let mtime = meta.modified().map_err(|e| CtrError::io(path, e))?;
    let age = SystemTime::now()
        .duration_since(mtime)
        .unwrap_or(Duration::ZERO);
    Ok(age >= grace)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn fresh_dir_is_not_old_enough() {
        let dir = tempdir().unwrap();
        assert!(!is_old_enough(dir.path(), Duration::from_secs(3600)).unwrap());
    }

    #[test]
    fn zero_grace_reclaims_everything() {
        let dir = tempdir().unwrap();
        assert!(is_old_enough(dir.path(), Duration::ZERO).unwrap());
    }
}
