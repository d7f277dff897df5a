//! Constructs the three stores from an opened repository root, sharing one
//! [`ImageStore`] between the pod and xar stores the way `PodStore`/`XarStore`
//! expect.

use std::sync::Arc;

use ctr::images::ImageStore;
use ctr::pods::PodStore;
use ctr::xars::XarStore;
use ctr::{EnvConfig, RepoRoot};
use ctr_types::CtrError;

pub fn open(env: &EnvConfig) -> Result<(RepoRoot, Arc<ImageStore>, PodStore, XarStore), CtrError> {
    let repo = RepoRoot::open(&env.repo_path)?;
    let image_store = Arc::new(ImageStore::new(repo.images_trees(), repo.images_tags(), repo.images_tmp()));
    let pod_store = PodStore::new(repo.pods_active(), repo.pods_graveyard(), repo.pods_tmp(), image_store.clone());
    let xar_store = XarStore::new(repo.xars(), env.xar_script_dir.clone(), image_store.clone());
    Ok((repo, image_store, pod_store, xar_store))
}
