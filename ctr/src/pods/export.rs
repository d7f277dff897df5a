//! `export_overlay`: captures a stopped pod's composed rootfs (its stacked
//! lower images plus the writable upper layer) as a filtered image archive,
//! the path by which a running container becomes a buildable application
//! image.

use std::path::{Path, PathBuf};

use regex::Regex;

use ctr_types::CtrError;

use crate::images::archive;

use super::overlay;

/// One rsync-style filter rule: `+pattern` includes, `-pattern` excludes. A
/// bare pattern (no leading sign) is treated as an include, matching rsync's
/// convention that the filter list is consulted in order and the first
/// matching rule wins; an unmatched path is included by default.
#[derive(Debug, Clone)]
struct FilterRule {
    exclude: bool,
    regex: Regex,
}

fn parse_filter_patterns(patterns: &[String]) -> Result<Vec<FilterRule>, CtrError> {
    patterns
        .iter()
        .map(|raw| {
            let (exclude, glob) = match raw.strip_prefix('-') {
                Some(rest) => (true, rest),
                None => (false, raw.strip_prefix('+').unwrap_or(raw)),
            };
            let regex = Regex::new(&glob_to_regex(glob.trim()))
                .map_err(|e| CtrError::validation("export filter pattern", format!("{raw}: {e}")))?;
            Ok(FilterRule { exclude, regex })
        })
        .collect()
}

/// Translates a shell-style glob (`*` any run, `?` one char, `**` any depth)
/// into an anchored regex matched against a `/`-joined relative path.
fn glob_to_regex(glob: &str) -> String {
    let mut out = String::from("^");
    let mut chars = glob.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' => {
                if chars.peek() == Some(&'*') {
                    chars.next();
                    out.push_str(".*");
                } else {
                    out.push_str("[^/]*");
                }
            }
            '?' => out.push_str("[^/]"),
            c if "\\.+()|[]{}^$".contains(c) => {
                out.push('\\');
                out.push(c);
            }
            c => out.push(c),
        }
    }
    out.push('$');
    out
}

/// True iff `rel_path` should be copied, per the first matching rule (or
/// the default-include rule if none match).
fn should_include(rel_path: &Path, rules: &[FilterRule]) -> bool {
    let path_str = rel_path.to_string_lossy();
    for rule in rules {
        if rule.regex.is_match(&path_str) {
            return !rule.exclude;
        }
    }
    true
}

/// Copies `composed_rootfs` (already-merged: the result of mounting the
/// overlay, or a prior read-only bind mount of it) into a fresh image
/// directory honoring `filter_patterns`, then archives it to
/// `output_path`. `composed_rootfs` must not be written to concurrently.
pub fn export_overlay(
    composed_rootfs: &Path,
    output_path: &Path,
    filter_patterns: &[String],
) -> Result<(), CtrError> {
    let rules = parse_filter_patterns(filter_patterns)?;

    let staging = tempfile::Builder::new()
        .prefix("ctr-export-")
        .tempdir()
        .map_err(|e| CtrError::io(output_path, e))?;
    let dest_rootfs = staging.path().join(archive::ROOTFS_DIR);
    std::fs::create_dir_all(&dest_rootfs).map_err(|e| CtrError::io(&dest_rootfs, e))?;

    copy_filtered(composed_rootfs, composed_rootfs, &dest_rootfs, &rules)?;

    // A placeholder; `ctr images build` (or a later `import`) is what
    // assigns this export its real name/version before it enters the
    // store proper.
    std::fs::write(
        staging.path().join(archive::METADATA_FILE),
        br#"{"name":"exported","version":"0"}"#,
    )
    .map_err(|e| CtrError::io(staging.path(), e))?;

    archive::create(staging.path(), output_path)
}

fn copy_filtered(root: &Path, src: &Path, dst: &Path, rules: &[FilterRule]) -> Result<(), CtrError> {
    for entry in std::fs::read_dir(src).map_err(|e| CtrError::io(src, e))? {
        let entry = entry.map_err(|e| CtrError::io(src, e))?;
        let rel = entry
            .path()
            .strip_prefix(root)
            .expect("entries are under root")
            .to_path_buf();
        if !should_include(&rel, rules) {
            continue;
        }

        let dst_path = dst.join(entry.file_name());
        let file_type = entry.file_type().map_err(|e| CtrError::io(&entry.path(), e))?;
        if file_type.is_dir() {
            std::fs::create_dir_all(&dst_path).map_err(|e| CtrError::io(&dst_path, e))?;
            copy_filtered(root, &entry.path(), &dst_path, rules)?;
        } else if file_type.is_symlink() {
            let target = std::fs::read_link(entry.path()).map_err(|e| CtrError::io(&entry.path(), e))?;
            std::os::unix::fs::symlink(&target, &dst_path).map_err(|e| CtrError::io(&dst_path, e))?;
        } else {
            std::fs::copy(entry.path(), &dst_path).map_err(|e| CtrError::io(&dst_path, e))?;
        }
    }
    Ok(())
}

/// Mounts the pod's overlay read-only (so export never mutates a stopped
/// pod's `upper/`), runs `export_overlay`, then unmounts.
pub fn export_pod_overlay(
    image_rootfs_paths: &[PathBuf],
    upper_path: &Path,
    work_path: &Path,
    target_path: &Path,
    output_path: &Path,
    filter_patterns: &[String],
) -> Result<(), CtrError> {
    overlay::mount_overlay(image_rootfs_paths, upper_path, work_path, target_path)?;
    let export_result = export_overlay(target_path, output_path, filter_patterns);
    let unmount_result = overlay::umount(target_path);
    export_result?;
    unmount_result?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn glob_matches_suffix_and_depth() {
        let rules = parse_filter_patterns(&["-*.log".to_string(), "+**".to_string()]).unwrap();
        assert!(!should_include(Path::new("var/log/app.log"), &rules));
        assert!(should_include(Path::new("etc/hostname"), &rules));
    }

    #[test]
    fn default_include_with_no_rules() {
        assert!(should_include(Path::new("anything"), &[]));
    }

    #[test]
    fn copy_filtered_excludes_matching_files() {
        let src = tempdir().unwrap();
        std::fs::create_dir_all(src.path().join("var/log")).unwrap();
        std::fs::write(src.path().join("var/log/app.log"), b"x").unwrap();
        std::fs::write(src.path().join("keep.txt"), b"y").unwrap();

        let dst = tempdir().unwrap();
        let rules = parse_filter_patterns(&["-var/log/*.log".to_string()]).unwrap();
        copy_filtered(src.path(), src.path(), dst.path(), &rules).unwrap();

        assert!(!dst.path().join("var/log/app.log").exists());
        assert!(dst.path().join("keep.txt").exists());
    }

    #[test]
    fn export_overlay_produces_archive() {
        let src = tempdir().unwrap();
        std::fs::write(src.path().join("hello"), b"world").unwrap();

        let output = tempdir().unwrap().path().join("out.tar.gz");
        export_overlay(src.path(), &output, &[]).unwrap();
        assert!(output.is_file());
    }
}
