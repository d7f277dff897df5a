//! Xar store: installs a named executable symlink into a selected image's
//! rootfs, shares the same image store's ref-counting as [`crate::pods`].

pub mod layout;
pub mod store;
pub mod target;

pub use layout::validate_xar_name;
pub use store::{XarListEntry, XarStore};
