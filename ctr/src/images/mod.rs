//! Content-addressed image store: import/build/list/tag/remove/cleanup over
//! `images/trees/` and `images/tags/`.

pub mod archive;
pub mod store;

pub use store::{ImageListEntry, ImageMetadata, ImageStore};
