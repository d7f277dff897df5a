//! Pod config schema (spec.md §4.4), loaded once at `prepare` and immutable
//! thereafter (the persisted `config` file under `active/<pod_id>/` is the
//! only copy consulted by `run_prepared`, so reordering `images` between
//! `prepare` and a later `run_prepared` is structurally impossible).
//!
//! Mirrors the config/state split of `boxlite::litebox::config::BoxConfig`:
//! this struct is pure data, validated on load; where a pod's state lives
//! (`active/` vs `graveyard/`) is inferred from directory location, not
//! carried in the config itself.

use std::collections::HashSet;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use ctr_types::{validate_label, CtrError, ImageSelector};

fn default_user() -> String {
    "root".to_string()
}

fn default_group() -> String {
    "root".to_string()
}

/// Exactly one of `id`, `(name, version)`, or `tag` must be set, matching
/// the image selector charset/shape used everywhere else in the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ImageRef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
}

impl ImageRef {
    pub fn to_selector(&self) -> Result<ImageSelector, CtrError> {
        let provided = [
            self.id.is_some(),
            self.name.is_some() || self.version.is_some(),
            self.tag.is_some(),
        ]
        .into_iter()
        .filter(|p| *p)
        .count();
        if provided != 1 {
            return Err(CtrError::validation(
                "pod config image ref",
                format!("{self:?}: expect exactly one of id, name+version, tag"),
            ));
        }

        if let Some(id) = &self.id {
            return Ok(ImageSelector::Id(ctr_types::ImageId::parse(id)?));
        }
        if let Some(tag) = &self.tag {
            return Ok(ImageSelector::Tag(tag.clone()));
        }
        match (&self.name, &self.version) {
            (Some(name), Some(version)) => Ok(ImageSelector::NameVersion {
                name: name.clone(),
                version: version.clone(),
            }),
            _ => Err(CtrError::validation(
                "pod config image ref",
                format!("{self:?}: name and version must both be set"),
            )),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    pub name: String,
    pub exec: Vec<String>,
    #[serde(default = "default_user")]
    pub user: String,
    #[serde(default = "default_group")]
    pub group: String,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kill_mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_section: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VolumeConfig {
    pub source: PathBuf,
    pub target: PathBuf,
    #[serde(default)]
    pub read_only: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PodConfig {
    pub name: String,
    pub version: String,
    pub apps: Vec<AppConfig>,
    pub images: Vec<ImageRef>,
    #[serde(default)]
    pub volumes: Vec<VolumeConfig>,
}

impl PodConfig {
    pub fn load(path: &std::path::Path) -> Result<Self, CtrError> {
        let bytes = std::fs::read(path).map_err(|e| CtrError::io(path, e))?;
        let config: PodConfig = serde_json::from_slice(&bytes)
            .map_err(|e| CtrError::validation("pod config", format!("{path:?}: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), CtrError> {
        validate_label("pod name", &self.name)?;
        validate_label("pod version", &self.version)?;

        if self.images.is_empty() {
            return Err(CtrError::validation("pod config images", "expect non-empty"));
        }
        for image in &self.images {
            image.to_selector()?;
        }

        let mut app_names = HashSet::new();
        for app in &self.apps {
            if app.exec.is_empty() {
                return Err(CtrError::validation("app exec", format!("{}: expect non-empty", app.name)));
            }
            if !app_names.insert(app.name.clone()) {
                return Err(CtrError::validation(
                    "pod config apps",
                    format!("expect unique app names: {}", app.name),
                ));
            }
        }

        let mut targets = HashSet::new();
        for volume in &self.volumes {
            if !volume.source.is_absolute() {
                return Err(CtrError::validation(
                    "volume source",
                    volume.source.display().to_string(),
                ));
            }
            if !volume.target.is_absolute() {
                return Err(CtrError::validation(
                    "volume target",
                    volume.target.display().to_string(),
                ));
            }
            if !targets.insert(volume.target.clone()) {
                return Err(CtrError::validation(
                    "pod config volumes",
                    format!("expect unique volume targets: {}", volume.target.display()),
                ));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> PodConfig {
        PodConfig {
            name: "test-pod".to_string(),
            version: "0-0-1".to_string(),
            apps: vec![AppConfig {
                name: "hello".to_string(),
                exec: vec!["/bin/echo".to_string(), "hello".to_string()],
                user: default_user(),
                group: default_group(),
                kind: None,
                kill_mode: None,
                service_section: None,
            }],
            images: vec![ImageRef {
                id: None,
                name: Some("base".to_string()),
                version: Some("0-0-1".to_string()),
                tag: None,
            }],
            volumes: vec![],
        }
    }

    #[test]
    fn validates_sample() {
        sample().validate().unwrap();
    }

    #[test]
    fn rejects_empty_images() {
        let mut config = sample();
        config.images.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_duplicate_app_names() {
        let mut config = sample();
        config.apps.push(config.apps[0].clone());
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_duplicate_volume_targets() {
        let mut config = sample();
        config.volumes = vec![
            VolumeConfig { source: "/p".into(), target: "/a".into(), read_only: false },
            VolumeConfig { source: "/q".into(), target: "/a".into(), read_only: false },
        ];
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_relative_volume_paths() {
        let mut config = sample();
        config.volumes = vec![VolumeConfig { source: "foo".into(), target: "/bar".into(), read_only: false }];
        assert!(config.validate().is_err());
    }

    #[test]
    fn image_ref_requires_exactly_one_selector() {
        assert!(ImageRef { id: None, name: None, version: None, tag: None }.to_selector().is_err());
        assert!(ImageRef { id: Some("x".into()), name: None, version: None, tag: Some("y".into()) }
            .to_selector()
            .is_err());
        assert!(ImageRef { id: None, name: Some("n".into()), version: None, tag: None }
            .to_selector()
            .is_err());
    }
}
