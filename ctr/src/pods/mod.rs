//! Pod runtime: composes a pod from a list of images via OverlayFS, writes
//! per-app systemd units, invokes an external container supervisor, and
//! harvests exit status. Consumes [`crate::images`] and [`crate::builders`].

pub mod config;
pub mod export;
pub mod layout;
pub mod overlay;
pub mod store;
pub mod supervisor;

pub use config::{AppConfig, ImageRef, PodConfig, VolumeConfig};
pub use export::export_overlay;
pub use store::{AppStatus, PodListEntry, PodStore};
