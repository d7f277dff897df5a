//! `ctr xars ...`: install, exec, uninstall, and garbage-collect xars.

use std::path::PathBuf;

use clap::{Args, Subcommand};

use ctr::EnvConfig;
use ctr_types::{CtrError, ImageSelector};

use crate::images::SelectImage;
use crate::stores;

#[derive(Debug, Subcommand)]
pub enum XarsCommand {
    /// Link a named executable into an image's rootfs plus a `PATH` shim.
    Install {
        #[command(flatten)]
        select: SelectImage,
        xar_name: String,
        /// Path to the executable, relative to the image's rootfs.
        exec_relpath: PathBuf,
    },
    /// List every installed xar.
    List,
    /// Resolve and `execve` into a xar's pinned executable.
    Exec {
        xar_name: String,
        argv: Vec<String>,
    },
    /// Remove a xar's exec symlink and shim script.
    Uninstall { xar_name: String },
    /// Finish interrupted uninstalls and reclaim orphan shim scripts.
    Cleanup,
}

pub fn run(command: XarsCommand, env: &EnvConfig) -> Result<(), CtrError> {
    match command {
        XarsCommand::Install { select, xar_name, exec_relpath } => {
            let (_repo, _images, _pods, xar_store) = stores::open(env)?;
            let selector: ImageSelector = select.into_selector()?;
            xar_store.install(&selector, &xar_name, &exec_relpath)
        }
        XarsCommand::List => {
            let (_repo, _images, _pods, xar_store) = stores::open(env)?;
            for entry in xar_store.list()? {
                println!(
                    "{}\t{}\t{}",
                    entry.name,
                    entry.image_id.map(|id| id.to_string()).unwrap_or_else(|| "-".to_string()),
                    entry
                        .exec_relpath
                        .map(|p| p.display().to_string())
                        .unwrap_or_else(|| "-".to_string()),
                );
            }
            Ok(())
        }
        XarsCommand::Exec { xar_name, argv } => {
            let (_repo, _images, _pods, xar_store) = stores::open(env)?;
            // On success this never returns: `exec` replaces the process image.
            xar_store.exec(&xar_name, &argv)
        }
        XarsCommand::Uninstall { xar_name } => {
            let (_repo, _images, _pods, xar_store) = stores::open(env)?;
            xar_store.uninstall(&xar_name)
        }
        XarsCommand::Cleanup => {
            let (_repo, _images, _pods, xar_store) = stores::open(env)?;
            xar_store.cleanup()
        }
    }
}
