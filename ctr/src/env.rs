//! Environment/config layer: `CTR_REPO_PATH`, `CTR_GRACE_PERIOD`,
//! `CTR_XAR_SCRIPT_DIR`, each with a documented default.

use std::path::PathBuf;
use std::time::Duration;

use ctr_types::duration::{parse_duration, DEFAULT_GRACE};
use ctr_types::CtrError;

pub const DEFAULT_REPO_PATH: &str = "/var/lib/ctr";
pub const DEFAULT_XAR_SCRIPT_DIR: &str = "/usr/local/bin";

#[derive(Debug, Clone)]
pub struct EnvConfig {
    pub repo_path: PathBuf,
    pub grace_period: Duration,
    pub xar_script_dir: PathBuf,
}

impl EnvConfig {
    pub fn from_env() -> Result<Self, CtrError> {
        let repo_path = std::env::var_os("CTR_REPO_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_REPO_PATH));

        let grace_period = match std::env::var("CTR_GRACE_PERIOD") {
            Ok(s) => parse_duration(&s)?,
            Err(_) => DEFAULT_GRACE,
        };

        let xar_script_dir = std::env::var_os("CTR_XAR_SCRIPT_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_XAR_SCRIPT_DIR));

        Ok(Self {
            repo_path,
            grace_period,
            xar_script_dir,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_when_unset() {
        std::env::remove_var("CTR_REPO_PATH");
        std::env::remove_var("CTR_GRACE_PERIOD");
        std::env::remove_var("CTR_XAR_SCRIPT_DIR");
        let cfg = EnvConfig::from_env().unwrap();
        assert_eq!(cfg.repo_path, PathBuf::from(DEFAULT_REPO_PATH));
        assert_eq!(cfg.grace_period, DEFAULT_GRACE);
        assert_eq!(cfg.xar_script_dir, PathBuf::from(DEFAULT_XAR_SCRIPT_DIR));
    }
}
