//! `ctr images ...`: build, import, tag, and garbage-collect images.

use std::path::PathBuf;

use clap::{Args, Subcommand};

use ctr::builders::{prepare_base_rootfs, setup_base_rootfs, BASE_IMAGE_RELEASE_CODE_NAME};
use ctr::EnvConfig;
use ctr_types::{duration::parse_duration, CtrError, ImageSelector};

use crate::stores;

#[derive(Debug, Subcommand)]
pub enum ImagesCommand {
    /// Bootstrap, set up, and catalogue a fresh base image in one step.
    BuildBase {
        #[arg(long)]
        name: String,
        #[arg(long)]
        version: String,
        /// Where pruned files are stashed instead of being deleted.
        #[arg(long)]
        prune_stash_path: Option<PathBuf>,
    },
    /// Bootstrap a bare rootfs via `debootstrap` (useful for testing).
    PrepareBaseRootfs { path: PathBuf },
    /// Run the base-image mutation sequence over an existing rootfs.
    SetupBaseRootfs {
        path: PathBuf,
        #[arg(long)]
        prune_stash_path: Option<PathBuf>,
    },
    /// Catalogue an existing rootfs directory as a new image.
    Build {
        #[arg(long)]
        name: String,
        #[arg(long)]
        version: String,
        rootfs: PathBuf,
    },
    /// Import a `.tar.gz` image archive.
    Import {
        path: PathBuf,
        #[arg(long)]
        tag: Option<String>,
    },
    /// List every image in the store.
    List,
    /// Point a tag at the selected image.
    Tag {
        #[command(flatten)]
        select: SelectImage,
        new_tag: String,
    },
    /// Remove a tag (idempotent).
    RemoveTag { tag: String },
    /// Remove the selected image and every tag pointing at it.
    Remove {
        #[command(flatten)]
        select: SelectImage,
        /// Remove even if other images/pods/xars still reference it.
        #[arg(long)]
        force: bool,
    },
    /// Reclaim untagged, unreferenced images past their grace period.
    Cleanup {
        #[arg(long)]
        grace: Option<String>,
    },
}

#[derive(Debug, Args)]
pub struct SelectImage {
    #[arg(long)]
    pub id: Option<String>,
    #[arg(long)]
    pub name: Option<String>,
    #[arg(long)]
    pub version: Option<String>,
    #[arg(long)]
    pub tag: Option<String>,
}

impl SelectImage {
    pub fn into_selector(self) -> Result<ImageSelector, CtrError> {
        match (self.id, self.name, self.version, self.tag) {
            (Some(id), None, None, None) => Ok(ImageSelector::Id(id.parse()?)),
            (None, Some(name), Some(version), None) => Ok(ImageSelector::NameVersion { name, version }),
            (None, None, None, Some(tag)) => Ok(ImageSelector::Tag(tag)),
            _ => Err(CtrError::validation(
                "image selector",
                "expected exactly one of --id, --name/--version, or --tag",
            )),
        }
    }
}

pub fn run(command: ImagesCommand, env: &EnvConfig) -> Result<(), CtrError> {
    match command {
        ImagesCommand::BuildBase { name, version, prune_stash_path } => {
            let tmp = tempfile::tempdir().map_err(|e| CtrError::io(std::env::temp_dir(), e))?;
            let rootfs = tmp.path().join("rootfs");
            prepare_base_rootfs(&rootfs)?;
            setup_base_rootfs(&rootfs, prune_stash_path.as_deref())?;
            let (_repo, image_store, _pods, _xars) = stores::open(env)?;
            let id = image_store.build(&name, &version, &rootfs)?;
            println!("{id}");
            tracing::info!(image_id = %id, codename = BASE_IMAGE_RELEASE_CODE_NAME, "built base image");
            Ok(())
        }
        ImagesCommand::PrepareBaseRootfs { path } => prepare_base_rootfs(&path),
        ImagesCommand::SetupBaseRootfs { path, prune_stash_path } => {
            setup_base_rootfs(&path, prune_stash_path.as_deref())
        }
        ImagesCommand::Build { name, version, rootfs } => {
            let (_repo, image_store, _pods, _xars) = stores::open(env)?;
            let id = image_store.build(&name, &version, &rootfs)?;
            println!("{id}");
            Ok(())
        }
        ImagesCommand::Import { path, tag } => {
            let (_repo, image_store, _pods, _xars) = stores::open(env)?;
            let id = image_store.import(&path, tag.as_deref())?;
            println!("{id}");
            Ok(())
        }
        ImagesCommand::List => {
            let (_repo, image_store, _pods, _xars) = stores::open(env)?;
            for entry in image_store.list()? {
                println!(
                    "{}\t{}\t{}\t{}\t{}",
                    entry.id,
                    entry.name,
                    entry.version,
                    entry.tags.join(","),
                    entry.ref_count
                );
            }
            Ok(())
        }
        ImagesCommand::Tag { select, new_tag } => {
            let (_repo, image_store, _pods, _xars) = stores::open(env)?;
            let selector = select.into_selector()?;
            image_store.tag(&selector, &new_tag)
        }
        ImagesCommand::RemoveTag { tag } => {
            let (_repo, image_store, _pods, _xars) = stores::open(env)?;
            image_store.remove_tag(&tag)
        }
        ImagesCommand::Remove { select, force } => {
            let (_repo, image_store, _pods, _xars) = stores::open(env)?;
            let selector = select.into_selector()?;
            image_store.remove(&selector, !force)
        }
        ImagesCommand::Cleanup { grace } => {
            let grace = match grace {
                Some(s) => parse_duration(&s)?,
                None => env.grace_period,
            };
            let (_repo, image_store, _pods, _xars) = stores::open(env)?;
            let removed = image_store.cleanup(grace)?;
            for id in removed {
                println!("{id}");
            }
            Ok(())
        }
    }
}
