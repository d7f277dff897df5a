//! Image archive format: a gzipped tar whose top-level entries are exactly
//! `metadata` (JSON) and `rootfs/` (a directory). Also implements the
//! `ctr-hash-v1` canonicalisation recorded in `REPO/VERSION`: a SHA-256
//! digest over `metadata` re-serialized with sorted keys, followed by a
//! deterministic tar walk of `rootfs/` (entries sorted by path, mtime
//! forced to 0, uid/gid forced to 0).

use std::fs::File;
use std::io::{self, Read, Write};
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use sha2::{Digest, Sha256};

use ctr_types::CtrError;

pub const METADATA_FILE: &str = "metadata";
pub const ROOTFS_DIR: &str = "rootfs";

/// Extracts `archive_path` (gzipped tar) into `dest`, which must not
/// already exist. Rejects any top-level entry other than `metadata` or
/// `rootfs/...` without writing anything outside `dest`.
pub fn extract(archive_path: &Path, dest: &Path) -> Result<(), CtrError> {
    let file = File::open(archive_path).map_err(|e| CtrError::io(archive_path, e))?;
    let decoder = GzDecoder::new(file);
    let mut archive = tar::Archive::new(decoder);

    std::fs::create_dir_all(dest).map_err(|e| CtrError::io(dest, e))?;

    let entries = archive
        .entries()
        .map_err(|e| CtrError::io(archive_path, e))?;
    for entry in entries {
        let mut entry = entry.map_err(|e| CtrError::io(archive_path, e))?;
        let path = entry
            .path()
            .map_err(|e| CtrError::io(archive_path, e))?
            .into_owned();
        validate_entry_path(&path)?;
        entry
            .unpack_in(dest)
            .map_err(|e| CtrError::io(archive_path, e))?;
    }

    if !dest.join(METADATA_FILE).is_file() {
        return Err(CtrError::Validation {
            what: "image archive",
            value: format!("{}: missing top-level `metadata`", archive_path.display()),
        });
    }
    if !dest.join(ROOTFS_DIR).is_dir() {
        return Err(CtrError::Validation {
            what: "image archive",
            value: format!("{}: missing top-level `rootfs/`", archive_path.display()),
        });
    }

    Ok(())
}

fn validate_entry_path(path: &Path) -> Result<(), CtrError> {
    let mut components = path.components();
    let first = components.next().and_then(|c| c.as_os_str().to_str());
    let ok = match first {
        Some(METADATA_FILE) => components.next().is_none(),
        Some(ROOTFS_DIR) => true,
        _ => false,
    };
    if !ok {
        return Err(CtrError::Validation {
            what: "image archive entry",
            value: path.display().to_string(),
        });
    }
    Ok(())
}

/// Builds a gzipped tar of `image_dir` (containing `metadata` and `rootfs/`)
/// at `output_path`, using the same canonical layout `extract` expects.
pub fn create(image_dir: &Path, output_path: &Path) -> Result<(), CtrError> {
    let out = File::create(output_path).map_err(|e| CtrError::io(output_path, e))?;
    let encoder = GzEncoder::new(out, Compression::default());
    let mut builder = tar::Builder::new(encoder);

    let metadata_path = image_dir.join(METADATA_FILE);
    builder
        .append_path_with_name(&metadata_path, METADATA_FILE)
        .map_err(|e| CtrError::io(&metadata_path, e))?;

    let rootfs = image_dir.join(ROOTFS_DIR);
    builder
        .append_dir_all(ROOTFS_DIR, &rootfs)
        .map_err(|e| CtrError::io(&rootfs, e))?;

    builder
        .into_inner()
        .map_err(|e| CtrError::io(output_path, e))?
        .finish()
        .map_err(|e| CtrError::io(output_path, e))?;
    Ok(())
}

/// Computes the `ctr-hash-v1` content id of an extracted image directory
/// (containing `metadata` and `rootfs/`).
pub fn canonical_hash(image_dir: &Path) -> Result<String, CtrError> {
    let metadata_path = image_dir.join(METADATA_FILE);
    let metadata_bytes =
        std::fs::read(&metadata_path).map_err(|e| CtrError::io(&metadata_path, e))?;
    let canonical: serde_json::Value = serde_json::from_slice(&metadata_bytes).map_err(|_| {
        CtrError::Corruption(format!("malformed metadata JSON at {metadata_path:?}"))
    })?;
    let canonical_bytes = serde_json::to_vec(&canonical)
        .map_err(|_| CtrError::Corruption(format!("unserializable metadata at {metadata_path:?}")))?;

    let mut hasher = HashWriter(Sha256::new());
    hasher
        .write_all(&canonical_bytes)
        .map_err(|e| CtrError::io(&metadata_path, e))?;

    let rootfs = image_dir.join(ROOTFS_DIR);
    write_deterministic_tar(&rootfs, &mut hasher)?;

    Ok(hex::encode(hasher.0.finalize()))
}

/// A `Write` sink that only accumulates a running digest, used so the
/// deterministic tar stream never actually touches disk when computing a
/// content hash.
struct HashWriter(Sha256);

impl Write for HashWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Writes a tar stream over `rootfs` with entries sorted by relative path,
/// mtime forced to 0, and uid/gid forced to 0 — the canonicalisation that
/// makes two byte-identical rootfs trees hash identically regardless of
/// extraction order or ownership left over from `debootstrap`.
fn write_deterministic_tar<W: Write>(rootfs: &Path, out: &mut W) -> Result<(), CtrError> {
    let mut entries: Vec<(PathBuf, walkdir::DirEntry)> = walkdir::WalkDir::new(rootfs)
        .min_depth(1)
        .into_iter()
        .map(|res| {
            let entry = res.map_err(|e| {
                CtrError::io(rootfs, io::Error::new(io::ErrorKind::Other, e.to_string()))
            })?;
            let rel = entry
                .path()
                .strip_prefix(rootfs)
                .expect("walkdir entries are under rootfs")
                .to_path_buf();
            Ok((rel, entry))
        })
        .collect::<Result<Vec<_>, CtrError>>()?;
    entries.sort_by(|a, b| a.0.cmp(&b.0));

    let mut builder = tar::Builder::new(out);
    for (rel, entry) in entries {
        let meta = entry
            .metadata()
            .map_err(|e| CtrError::io(entry.path(), io::Error::new(io::ErrorKind::Other, e.to_string())))?;
        let mut header = tar::Header::new_gnu();
        header.set_mtime(0);
        header.set_uid(0);
        header.set_gid(0);
        header.set_mode(meta.permissions().mode() & 0o7777);

        if meta.is_symlink() {
            let target = std::fs::read_link(entry.path()).map_err(|e| CtrError::io(entry.path(), e))?;
            header.set_entry_type(tar::EntryType::Symlink);
            header.set_size(0);
            header
                .set_link_name(&target)
                .map_err(|e| CtrError::io(entry.path(), e))?;
            builder
                .append_data(&mut header, &rel, io::empty())
                .map_err(|e| CtrError::io(entry.path(), e))?;
        } else if meta.is_dir() {
            header.set_entry_type(tar::EntryType::Directory);
            header.set_size(0);
            builder
                .append_data(&mut header, &rel, io::empty())
                .map_err(|e| CtrError::io(entry.path(), e))?;
        } else {
            header.set_entry_type(tar::EntryType::Regular);
            header.set_size(meta.size());
            let mut f = File::open(entry.path()).map_err(|e| CtrError::io(entry.path(), e))?;
            let mut buf = Vec::with_capacity(meta.size() as usize);
            f.read_to_end(&mut buf)
                .map_err(|e| CtrError::io(entry.path(), e))?;
            builder
                .append_data(&mut header, &rel, buf.as_slice())
                .map_err(|e| CtrError::io(entry.path(), e))?;
        }
    }
    builder
        .into_inner()
        .map_err(|e| CtrError::io(rootfs, e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn write_sample_image(dir: &Path, name: &str, version: &str) {
        std::fs::write(
            dir.join(METADATA_FILE),
            format!(r#"{{"name":"{name}","version":"{version}"}}"#),
        )
        .unwrap();
        let rootfs = dir.join(ROOTFS_DIR);
        std::fs::create_dir_all(rootfs.join("etc")).unwrap();
        std::fs::write(rootfs.join("etc/hostname"), b"placeholder").unwrap();
    }

    #[test]
    fn hash_is_stable_across_mtime_changes() {
        let a = tempdir().unwrap();
        write_sample_image(a.path(), "foo", "1-0");
        let hash_a = canonical_hash(a.path()).unwrap();

        let b = tempdir().unwrap();
        write_sample_image(b.path(), "foo", "1-0");
        std::thread::sleep(std::time::Duration::from_millis(10));
        std::fs::write(b.path().join(ROOTFS_DIR).join("etc/hostname"), b"placeholder").unwrap();
        let hash_b = canonical_hash(b.path()).unwrap();

        assert_eq!(hash_a, hash_b);
        assert_eq!(hash_a.len(), 64);
        assert!(hash_a.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn hash_differs_on_content_change() {
        let a = tempdir().unwrap();
        write_sample_image(a.path(), "foo", "1-0");
        let hash_a = canonical_hash(a.path()).unwrap();

        let b = tempdir().unwrap();
        write_sample_image(b.path(), "foo", "1-1");
        let hash_b = canonical_hash(b.path()).unwrap();

        assert_ne!(hash_a, hash_b);
    }

    #[test]
    fn create_then_extract_round_trips() {
        let src = tempdir().unwrap();
        write_sample_image(src.path(), "foo", "1-0");

        let archive_path = src.path().join("image.tar.gz");
        create(src.path(), &archive_path).unwrap();

        let dest_root = tempdir().unwrap();
        let dest = dest_root.path().join("extracted");
        extract(&archive_path, &dest).unwrap();

        assert!(dest.join(METADATA_FILE).is_file());
        assert!(dest.join(ROOTFS_DIR).join("etc/hostname").is_file());
    }

    #[test]
    fn extract_rejects_archive_without_rootfs() {
        let src = tempdir().unwrap();
        std::fs::write(src.path().join(METADATA_FILE), b"{}").unwrap();

        let archive_path = src.path().join("bad.tar.gz");
        let out = File::create(&archive_path).unwrap();
        let encoder = GzEncoder::new(out, Compression::default());
        let mut builder = tar::Builder::new(encoder);
        builder
            .append_path_with_name(src.path().join(METADATA_FILE), METADATA_FILE)
            .unwrap();
        builder.into_inner().unwrap().finish().unwrap();

        let dest_root = tempdir().unwrap();
        let dest = dest_root.path().join("extracted");
        assert!(extract(&archive_path, &dest).is_err());
    }
}
