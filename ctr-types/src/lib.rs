//! Shared types for the `ctr` container runtime: the error taxonomy, id and
//! selector newtypes, and grace-period duration parsing.

pub mod duration;
pub mod error;
pub mod ids;

pub use error::{CtrError, CtrResult};
pub use ids::{validate_label, ImageId, ImageSelector, PodId};
