//! Encoding/decoding of the `exec` symlink's relative target, which doubles
//! as the only on-disk record of which image a xar currently resolves to
//! (there is no separate "current image" field — `readlink` is the source
//! of truth).

use std::path::{Path, PathBuf};

use ctr_types::{CtrError, ImageId};

const PREFIX: &str = "../../images/trees/";
const ROOTFS_SEGMENT: &str = "rootfs/";

/// `../../images/trees/<image_id>/rootfs/<exec_relpath>`, relative to
/// `xars/<name>/`.
pub fn encode(image_id: &ImageId, exec_relpath: &Path) -> PathBuf {
    PathBuf::from(format!(
        "{PREFIX}{}/{ROOTFS_SEGMENT}{}",
        image_id.as_str(),
        exec_relpath.display()
    ))
}

pub fn decode(target: &Path) -> Result<(ImageId, PathBuf), CtrError> {
    let s = target.to_string_lossy();
    let rest = s.strip_prefix(PREFIX).ok_or_else(|| {
        CtrError::Corruption(format!("exec target {s:?} does not start with `{PREFIX}`"))
    })?;
    let (id_str, rest) = rest
        .split_once('/')
        .ok_or_else(|| CtrError::Corruption(format!("exec target {s:?} missing image id segment")))?;
    let relpath = rest.strip_prefix(ROOTFS_SEGMENT).ok_or_else(|| {
        CtrError::Corruption(format!("exec target {s:?} missing `{ROOTFS_SEGMENT}` segment"))
    })?;
    let image_id = ImageId::parse(id_str)?;
    Ok((image_id, PathBuf::from(relpath)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_round_trips() {
        let id = ImageId::parse(&"a".repeat(64)).unwrap();
        let target = encode(&id, Path::new("bin/app"));
        assert_eq!(target, PathBuf::from(format!("../../images/trees/{}/rootfs/bin/app", "a".repeat(64))));

        let (decoded_id, relpath) = decode(&target).unwrap();
        assert_eq!(decoded_id, id);
        assert_eq!(relpath, PathBuf::from("bin/app"));
    }

    #[test]
    fn decode_rejects_malformed_target() {
        assert!(decode(Path::new("bin/app")).is_err());
        assert!(decode(Path::new("../../images/trees/not-hex/rootfs/app")).is_err());
        assert!(decode(Path::new("../../images/trees/deadbeef/no-rootfs-segment")).is_err());
    }
}
