//! Base rootfs config data: the `pod-exit` script, the unit allow-list, and
//! the project-specific unit graph. Transcribed verbatim from the original
//! `g1.containers.builders` module rather than reconstructed from the
//! distilled description, since the exact unit names and script logic are
//! normative (spec.md §4.3/§6).

/// Invoked as `ExecStopPost=/usr/sbin/pod-exit "%n"`. Records the first
/// non-zero `ExecMainStatus` seen across all units in a pod and propagates
/// it as the pod's own exit status.
pub const POD_EXIT_SCRIPT: &str = r#"#!/usr/bin/env bash

set -o errexit -o nounset -o pipefail

if [[ "${#}" -ne 1 ]]; then
  systemctl exit 1
  exit 1
fi

# Check whether there is already any status file.
has_status="$(ls -A /var/lib/pod/exit-status)"

status="$(systemctl show --property ExecMainStatus "${1}")"
status="${status#*=}"
status="${status:-1}"

echo "${status}" > "/var/lib/pod/exit-status/${1}"

# Check whether this is the first non-zero status.
if [[ "${status}" != 0 && -z "${has_status}" ]]; then
  systemctl exit "${status}"
else
  systemctl exit
fi
"#;

pub const LOCALE: &str = "LANG=\"en_US.UTF-8\"\n";
pub const RESOLV_CONF: &str = "nameserver 8.8.8.8\n";
pub const JOURNALD_CONF: &str = "[Journal]\nSystemMaxUse=64M\nRuntimeMaxUse=64M\n";

/// Units kept from the freshly-bootstrapped distro image; every other unit
/// under `etc/systemd/system` and `usr/lib/systemd/system` is removed.
pub const BASE_UNITS: &[&str] = &[
    "ctrl-alt-del.target",
    "dbus.service",
    "dbus.socket",
    "systemd-journald-audit.socket",
    "systemd-journald-dev-log.socket",
    "systemd-journald.service",
    "systemd-journald.socket",
    "systemd-journal-flush.service",
    "machine.slice",
    "slices.target",
    "user.slice",
    "systemd-tmpfiles-setup-dev.service",
    "systemd-tmpfiles-setup.service",
];

/// A unit-graph entry to materialize under one of the two unit directories.
pub enum UnitFile {
    Dir(&'static str),
    File(&'static str, &'static str),
    Symlink(&'static str, &'static str),
}

/// Installed under `etc/systemd/system/`.
pub const ETC_UNIT_FILES: &[UnitFile] = &[UnitFile::Dir("pod.target.wants")];

/// Installed under `usr/lib/systemd/system/`. Unit files must never be
/// empty, or systemd treats them as masked.
pub const LIB_UNIT_FILES: &[UnitFile] = &[
    UnitFile::File("sysinit.target", "[Unit]\n"),
    UnitFile::Dir("sysinit.target.wants"),
    UnitFile::Symlink("sysinit.target.wants/dbus.service", "../dbus.service"),
    UnitFile::Symlink(
        "sysinit.target.wants/systemd-journald.service",
        "../systemd-journald.service",
    ),
    UnitFile::Symlink(
        "sysinit.target.wants/systemd-journal-flush.service",
        "../systemd-journal-flush.service",
    ),
    UnitFile::Symlink(
        "sysinit.target.wants/systemd-tmpfiles-setup-dev.service",
        "../systemd-tmpfiles-setup-dev.service",
    ),
    UnitFile::Symlink(
        "sysinit.target.wants/systemd-tmpfiles-setup.service",
        "../systemd-tmpfiles-setup.service",
    ),
    UnitFile::File("sockets.target", "[Unit]\n"),
    UnitFile::Dir("sockets.target.wants"),
    UnitFile::Symlink("sockets.target.wants/dbus.socket", "../dbus.socket"),
    UnitFile::Symlink(
        "sockets.target.wants/systemd-journald-audit.socket",
        "../systemd-journald-audit.socket",
    ),
    UnitFile::Symlink(
        "sockets.target.wants/systemd-journald-dev-log.socket",
        "../systemd-journald-dev-log.socket",
    ),
    UnitFile::Symlink(
        "sockets.target.wants/systemd-journald.socket",
        "../systemd-journald.socket",
    ),
    UnitFile::File(
        "basic.target",
        "[Unit]\nRequires=sysinit.target\nWants=sockets.target slices.target\nAfter=sysinit.target sockets.target slices.target\n",
    ),
    UnitFile::File(
        "pod.target",
        "[Unit]\nRequires=basic.target\nAfter=basic.target\n",
    ),
    UnitFile::Symlink("default.target", "pod.target"),
    UnitFile::File(
        "shutdown.target",
        "[Unit]\nDefaultDependencies=no\nRefuseManualStart=yes\n",
    ),
    UnitFile::File(
        "exit.target",
        "[Unit]\nDefaultDependencies=no\nRequires=systemd-exit.service\nAfter=systemd-exit.service\nAllowIsolate=yes\n",
    ),
    UnitFile::File(
        "systemd-exit.service",
        "[Unit]\nDefaultDependencies=no\nRequires=shutdown.target\nAfter=shutdown.target\n\n[Service]\nType=oneshot\nExecStart=/bin/systemctl --force exit\n",
    ),
    UnitFile::Symlink("halt.target", "exit.target"),
    UnitFile::Symlink("poweroff.target", "exit.target"),
    UnitFile::Symlink("reboot.target", "exit.target"),
];
