//! Xar name validation and path helpers for one xar's directory
//! (`deps/`, `exec`), plus the companion shim script's well-known path on
//! `PATH`.
//!
//! `xar_name` uses a looser charset than image/pod names — it's a
//! filename, not a content-addressed label, so dots and underscores (as in
//! `01_23.sh`) are permitted; only `/` and the empty string are rejected.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;

use ctr_types::CtrError;

fn xar_name_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9._-]+$").unwrap())
}

pub fn validate_xar_name(name: &str) -> Result<(), CtrError> {
    if name.is_empty() || !xar_name_re().is_match(name) {
        return Err(CtrError::validation("xar name", name));
    }
    Ok(())
}

pub fn xar_dir(xars_root: &Path, name: &str) -> PathBuf {
    xars_root.join(name)
}

pub fn deps_dir(xar_dir: &Path) -> PathBuf {
    xar_dir.join("deps")
}

pub fn dep_path(xar_dir: &Path, image_id: &str) -> PathBuf {
    deps_dir(xar_dir).join(image_id)
}

pub fn exec_path(xar_dir: &Path) -> PathBuf {
    xar_dir.join("exec")
}

pub fn script_path(script_dir: &Path, name: &str) -> PathBuf {
    script_dir.join(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_dots_and_underscores() {
        assert!(validate_xar_name("01_23.sh").is_ok());
        assert!(validate_xar_name("hello-world").is_ok());
    }

    #[test]
    fn rejects_empty_and_slash() {
        assert!(validate_xar_name("").is_err());
        assert!(validate_xar_name("a/b").is_err());
    }
}
