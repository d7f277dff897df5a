//! Base image construction and per-app unit generation: bootstraps a minimal
//! distro root, prunes it down to a fixed systemd unit skeleton, and
//! generates per-app unit files at pod-prepare time.

pub mod apps;
pub mod base_image;
pub mod pipeline;
pub mod pod_exit;

pub use apps::{generate_machine_id, generate_unit_file, get_pod_app_exit_status, AppSpec};
pub use base_image::{prepare_base_rootfs, setup_base_rootfs, BASE_IMAGE_RELEASE_CODE_NAME};
