//! Per-app unit generation, invoked at pod-prepare time, plus the small
//! amount of rootfs state the running pod's units read and write:
//! `/etc/machine-id` and `/var/lib/pod/exit-status/<unit>`.
//!
//! Transcribed from `examples/original_source/python/g1/containers/g1/containers/builders.py`'s
//! `generate_unit_file`/`_generate_unit_file_content`/`_quote_arg`/
//! `generate_machine_id`/`get_pod_app_exit_status`.

use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::time::SystemTime;

use chrono::{DateTime, Utc};

use ctr_types::CtrError;

use crate::base::owner;

/// One app's unit-generation inputs. Decoupled from `pods::config::AppConfig`
/// so `builders` never depends on `pods` (the data flow is the other way:
/// pods consumes builders).
#[derive(Debug, Clone)]
pub struct AppSpec {
    pub name: String,
    pub exec: Vec<String>,
    pub user: String,
    pub group: String,
    pub kind: Option<String>,
    pub kill_mode: Option<String>,
    pub service_section: Option<String>,
}

impl AppSpec {
    fn unit_filename(&self) -> String {
        format!("{}.service", self.name)
    }
}

/// Writes `<pod_etc>/<app>.service` and symlinks it under
/// `<pod_etc>/pod.target.wants/`. Both targets must not already exist.
pub fn generate_unit_file(
    pod_etc_path: &Path,
    pod_name: &str,
    pod_version: &str,
    app: &AppSpec,
) -> Result<(), CtrError> {
    if !pod_etc_path.is_dir() {
        return Err(CtrError::validation(
            "pod etc path",
            pod_etc_path.display().to_string(),
        ));
    }

    let unit_path = pod_etc_path.join(app.unit_filename());
    if unit_path.exists() || std::fs::symlink_metadata(&unit_path).is_ok() {
        return Err(CtrError::Corruption(format!(
            "unit file already exists at {unit_path:?}"
        )));
    }
    std::fs::write(&unit_path, generate_unit_file_content(pod_name, pod_version, app))
        .map_err(|e| CtrError::io(&unit_path, e))?;
    owner::apply_file(&unit_path)?;

    let wants_path = pod_etc_path
        .join("pod.target.wants")
        .join(app.unit_filename());
    if std::fs::symlink_metadata(&wants_path).is_ok() {
        return Err(CtrError::Corruption(format!(
            "wants symlink already exists at {wants_path:?}"
        )));
    }
    std::os::unix::fs::symlink(Path::new("..").join(app.unit_filename()), &wants_path)
        .map_err(|e| CtrError::io(&wants_path, e))?;
    owner::chown_root(&wants_path)?;

    tracing::info!(app = %app.name, "generated unit file");
    Ok(())
}

fn generate_unit_file_content(pod_name: &str, pod_version: &str, app: &AppSpec) -> String {
    let service_section = match &app.service_section {
        Some(literal) => literal.clone(),
        None => {
            let mut exec_start: Vec<String> = Vec::new();
            if app.user != "root" || app.group != "root" {
                // `sudo` rather than systemd's User=/Group=, or ExecStart
                // loses the journal socket connection and pod-exit's
                // ExecStopPost can't stop the pod.
                exec_start.push("/usr/bin/sudo".to_string());
                exec_start.push(format!("--user={}", app.user));
                exec_start.push(format!("--group={}", app.group));
                exec_start.extend(app.exec.iter().cloned());
            } else {
                exec_start.extend(app.exec.iter().cloned());
            }

            let service_type = app
                .kind
                .as_ref()
                .map(|k| format!("Type={k}\n"))
                .unwrap_or_default();
            let kill_mode = app
                .kill_mode
                .as_ref()
                .map(|k| format!("KillMode={k}\n"))
                .unwrap_or_default();
            let exec = exec_start
                .iter()
                .map(|a| quote_arg(a))
                .collect::<Vec<_>>()
                .join(" ");

            format!(
                "{service_type}Restart=no\nSyslogIdentifier={pod_name}/{app_name}@{pod_version}\nExecStart={exec}\nExecStopPost=/usr/sbin/pod-exit \"%n\"\n{kill_mode}LimitNOFILE=65536",
                app_name = app.name,
            )
        }
    };

    format!("[Unit]\nAfter=pod.target\n\n[Service]\n{service_section}\n")
}

/// Wraps `arg` in double quotes, escaping `'`, `"`, `$` (doubled), and `%`
/// (doubled) for systemd's `ExecStart=` line splitting. Backslash is
/// rejected outright (unhandled escape sequence).
fn quote_arg(arg: &str) -> String {
    assert!(!arg.contains('\\'), "backslash in exec argument: {arg:?}");
    let mut out = String::with_capacity(arg.len() + 2);
    out.push('"');
    for c in arg.chars() {
        match c {
            '\'' => out.push_str("\\'"),
            '"' => out.push_str("\\\""),
            '$' => out.push_str("$$"),
            '%' => out.push_str("%%"),
            other => out.push(other),
        }
    }
    out.push('"');
    out
}

/// Writes `machine_id` (already dash-stripped) to `/etc/machine-id` and
/// `/var/lib/dbus/machine-id`, the two files a freshly-started pod's systemd
/// and dbus read their machine identity from.
pub fn generate_machine_id(root_path: &Path, machine_id: &str) -> Result<(), CtrError> {
    let contents = format!("{machine_id}\n");
    for (rel, mode) in [("etc/machine-id", 0o444), ("var/lib/dbus/machine-id", 0o644)] {
        let path = root_path.join(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| CtrError::io(parent, e))?;
        }
        std::fs::write(&path, &contents).map_err(|e| CtrError::io(&path, e))?;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode))
            .map_err(|e| CtrError::io(&path, e))?;
        owner::chown_root(&path)?;
    }
    Ok(())
}

fn exit_status_path(root_path: &Path, app_name: &str) -> std::path::PathBuf {
    root_path
        .join("var/lib/pod/exit-status")
        .join(format!("{app_name}.service"))
}

/// Reads `/var/lib/pod/exit-status/<unit>`, returning the recorded exit
/// code and the time `pod-exit` wrote it, or `None` if the unit hasn't
/// exited yet.
pub fn get_pod_app_exit_status(
    root_path: &Path,
    app_name: &str,
) -> Result<Option<(i32, DateTime<Utc>)>, CtrError> {
    let path = exit_status_path(root_path, app_name);
    let contents = match std::fs::read_to_string(&path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(CtrError::io(&path, e)),
    };
    let code: i32 = contents
        .trim()
        .parse()
        .map_err(|_| CtrError::Corruption(format!("malformed exit status at {path:?}")))?;
    let mtime = std::fs::metadata(&path)
        .and_then(|m| m.modified())
        .map_err(|e| CtrError::io(&path, e))?;
    Ok(Some((code, system_time_to_utc(mtime))))
}

fn system_time_to_utc(t: SystemTime) -> DateTime<Utc> {
    DateTime::<Utc>::from(t)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_app(name: &str) -> AppSpec {
        AppSpec {
            name: name.to_string(),
            exec: vec!["/bin/true".to_string()],
            user: "root".to_string(),
            group: "root".to_string(),
            kind: None,
            kill_mode: None,
            service_section: None,
        }
    }

    #[test]
    fn generate_unit_file_writes_unit_and_wants_symlink() {
        let dir = tempdir().unwrap();
        let etc = dir.path().join("etc/systemd/system");
        std::fs::create_dir_all(etc.join("pod.target.wants")).unwrap();

        let app = sample_app("hello");
        generate_unit_file(&etc, "test-pod", "1.0", &app).unwrap();

        let content = std::fs::read_to_string(etc.join("hello.service")).unwrap();
        assert!(content.contains("ExecStart=\"/bin/true\""));
        assert!(content.contains("ExecStopPost=/usr/sbin/pod-exit \"%n\""));
        assert!(content.contains("SyslogIdentifier=test-pod/hello@1.0"));

        let wants = etc.join("pod.target.wants/hello.service");
        assert_eq!(std::fs::read_link(&wants).unwrap(), Path::new("../hello.service"));
    }

    #[test]
    fn non_root_user_is_wrapped_in_sudo() {
        let mut app = sample_app("hello");
        app.user = "nobody".to_string();
        app.group = "nogroup".to_string();
        let content = generate_unit_file_content("pod", "1.0", &app);
        assert!(content.contains("ExecStart=\"/usr/bin/sudo\" \"--user=nobody\" \"--group=nogroup\" \"/bin/true\""));
    }

    #[test]
    fn literal_service_section_used_verbatim() {
        let mut app = sample_app("hello");
        app.service_section = Some("ExecStart=/bin/custom\n".to_string());
        let content = generate_unit_file_content("pod", "1.0", &app);
        assert!(content.contains("[Service]\nExecStart=/bin/custom\n"));
        assert!(!content.contains("SyslogIdentifier"));
    }

    #[test]
    fn quote_arg_escapes_special_chars() {
        assert_eq!(quote_arg("plain"), "\"plain\"");
        assert_eq!(quote_arg("a'b"), "\"a\\'b\"");
        assert_eq!(quote_arg("a\"b"), "\"a\\\"b\"");
        assert_eq!(quote_arg("50%"), "\"50%%\"");
        assert_eq!(quote_arg("$HOME"), "\"$$HOME\"");
    }

    #[test]
    #[should_panic]
    fn quote_arg_rejects_backslash() {
        quote_arg("a\\b");
    }

    #[test]
    fn exit_status_round_trips() {
        let dir = tempdir().unwrap();
        let status_dir = dir.path().join("var/lib/pod/exit-status");
        std::fs::create_dir_all(&status_dir).unwrap();
        std::fs::write(status_dir.join("hello.service"), "7").unwrap();

        let (code, _) = get_pod_app_exit_status(dir.path(), "hello").unwrap().unwrap();
        assert_eq!(code, 7);
        assert!(get_pod_app_exit_status(dir.path(), "missing").unwrap().is_none());
    }

    #[test]
    fn machine_id_written_to_both_paths() {
        let dir = tempdir().unwrap();
        generate_machine_id(dir.path(), "abc123").unwrap();
        assert_eq!(
            std::fs::read_to_string(dir.path().join("etc/machine-id")).unwrap(),
            "abc123\n"
        );
        assert_eq!(
            std::fs::read_to_string(dir.path().join("var/lib/dbus/machine-id")).unwrap(),
            "abc123\n"
        );
    }
}
