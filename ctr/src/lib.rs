//! `ctr`: a content-addressed image store, a pod launcher built from
//! OverlayFS-stacked images, and an xar installer sharing the same store.
//!
//! Data flows leaves-first: [`base`] is the shared foundation (repo root,
//! locking, scoped tmp dirs, ownership, grace period, ref-counting);
//! [`images`] builds on it; [`builders`] builds on `images`; [`pods`] and
//! [`xars`] build on both.

pub mod base;
pub mod builders;
pub mod env;
pub mod images;
pub mod pods;
pub mod version;
pub mod xars;

pub use base::RepoRoot;
pub use env::EnvConfig;
