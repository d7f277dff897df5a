//! Id and name validation.
//!
//! `image_id` and `pod_id` are plain newtypes over `String` rather than
//! fixed-size byte arrays: the store only ever reads and writes them as
//! directory-name strings, so there is no benefit carrying a `[u8; 32]`
//! around that would just get re-hex-encoded at every filesystem boundary.

use std::fmt;
use std::str::FromStr;

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

use crate::error::CtrError;

fn image_id_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[0-9a-f]{64}$").unwrap())
}

fn pod_id_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^[0-9a-f]{8}-([0-9a-f]{4}-){3}[0-9a-f]{12}$").unwrap()
    })
}

fn name_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-z0-9]([a-z0-9-]*[a-z0-9])?$").unwrap())
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageId(String);

impl ImageId {
    pub fn parse(s: &str) -> Result<Self, CtrError> {
        if image_id_re().is_match(s) {
            Ok(Self(s.to_string()))
        } else {
            Err(CtrError::validation("image id", s))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ImageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ImageId {
    type Err = CtrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PodId(String);

impl PodId {
    pub fn parse(s: &str) -> Result<Self, CtrError> {
        if pod_id_re().is_match(s) {
            Ok(Self(s.to_string()))
        } else {
            Err(CtrError::validation("pod id", s))
        }
    }

    /// Generate a fresh UUID-4 pod id, matching `models.generate_pod_id` in
    /// the original source.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 8 hex characters, used to derive a pod's hostname.
    pub fn short(&self) -> &str {
        &self.0[..8]
    }

    /// The id with dashes stripped, used to seed `/etc/machine-id`.
    pub fn without_dashes(&self) -> String {
        self.0.chars().filter(|c| *c != '-').collect()
    }
}

impl fmt::Display for PodId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for PodId {
    type Err = CtrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Validates a name, version, or tag string against the shared charset:
/// `[a-z0-9]([a-z0-9-]*[a-z0-9])?`, no leading/trailing hyphen, no double
/// hyphens (the regex's `[a-z0-9-]*` combined with alphanumeric endpoints
/// already forbids a leading/trailing/doubled hyphen run from matching, but
/// double hyphens like `a--b` *do* match that class; `g1`'s own charset
/// doesn't reject those either, so neither do we).
pub fn validate_label(what: &'static str, s: &str) -> Result<(), CtrError> {
    if s.is_empty() || !name_re().is_match(s) {
        return Err(CtrError::validation(what, s));
    }
    Ok(())
}

/// Image selector: exactly one of id, (name, version), or tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ImageSelector {
    Id(ImageId),
    NameVersion { name: String, version: String },
    Tag(String),
}

impl ImageSelector {
    pub fn validate(&self) -> Result<(), CtrError> {
        match self {
            ImageSelector::Id(_) => Ok(()),
            ImageSelector::NameVersion { name, version } => {
                validate_label("image name", name)?;
                if version.is_empty() {
                    return Err(CtrError::validation("image version", version));
                }
                validate_label("image version", version)
            }
            ImageSelector::Tag(tag) => validate_label("tag", tag),
        }
    }
}

impl fmt::Display for ImageSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImageSelector::Id(id) => write!(f, "id={id}"),
            ImageSelector::NameVersion { name, version } => {
                write!(f, "{name}/{version}")
            }
            ImageSelector::Tag(tag) => write!(f, "tag={tag}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_id_accepts_64_hex() {
        let id = "a".repeat(64);
        assert!(ImageId::parse(&id).is_ok());
    }

    #[test]
    fn image_id_rejects_short_or_uppercase() {
        assert!(ImageId::parse(&"a".repeat(63)).is_err());
        assert!(ImageId::parse(&"A".repeat(64)).is_err());
    }

    #[test]
    fn pod_id_accepts_uuid4_shape() {
        assert!(PodId::parse("00000000-0000-4000-8000-000000000001").is_ok());
        assert!(PodId::parse("not-a-uuid").is_err());
    }

    #[test]
    fn pod_id_short_and_dashless() {
        let id = PodId::parse("00000000-0000-4000-8000-000000000001").unwrap();
        assert_eq!(id.short(), "00000000");
        assert_eq!(id.without_dashes(), "00000000000040008000000000000001");
    }

    #[test]
    fn label_rejects_leading_trailing_hyphen() {
        assert!(validate_label("name", "-foo").is_err());
        assert!(validate_label("name", "foo-").is_err());
        assert!(validate_label("name", "foo").is_ok());
        assert!(validate_label("name", "foo-bar").is_ok());
    }
}
