//! Command-line front end for `ctr`: wires [`clap`] subcommands onto the
//! `ctr` library, mapping [`ctr_types::CtrError`] onto the exit codes its
//! error taxonomy documents.

mod images;
mod pods;
mod stores;
mod xars;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use ctr::{EnvConfig, RepoRoot};
use ctr_types::{duration::parse_duration, CtrError};

#[derive(Debug, Parser)]
#[command(name = "ctr", version, about = "Manage containerized applications")]
struct Cli {
    /// Repository root; defaults to `$CTR_REPO_PATH` or `/var/lib/ctr`.
    #[arg(long, global = true)]
    repo: Option<PathBuf>,

    #[command(subcommand)]
    entity: Entity,
}

#[derive(Debug, Subcommand)]
enum Entity {
    /// Initialize the repository layout.
    Init,
    /// Clean up pods, xars, and images past their grace period.
    Cleanup {
        #[arg(long)]
        grace: Option<String>,
    },
    /// Manage container images.
    Images {
        #[command(subcommand)]
        command: images::ImagesCommand,
    },
    /// Manage container pods.
    Pods {
        #[command(subcommand)]
        command: pods::PodsCommand,
    },
    /// Manage xars.
    Xars {
        #[command(subcommand)]
        command: xars::XarsCommand,
    },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .init();

    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(%err, "ctr command failed");
            eprintln!("ctr: {err}");
            ExitCode::from(err.exit_code() as u8)
        }
    }
}

fn run(cli: Cli) -> Result<(), CtrError> {
    let mut env = EnvConfig::from_env()?;
    if let Some(repo) = cli.repo {
        env.repo_path = repo;
    }

    match cli.entity {
        Entity::Init => {
            RepoRoot::open(&env.repo_path)?;
            Ok(())
        }
        Entity::Cleanup { grace } => {
            let grace = resolve_grace(grace.as_deref(), &env)?;
            let (_repo, image_store, pod_store, xar_store) = stores::open(&env)?;
            // Pods and xars depend on images, not vice versa, so they are
            // reclaimed first.
            pod_store.cleanup(grace)?;
            xar_store.cleanup()?;
            image_store.cleanup(grace)?;
            Ok(())
        }
        Entity::Images { command } => images::run(command, &env),
        Entity::Pods { command } => pods::run(command, &env),
        Entity::Xars { command } => xars::run(command, &env),
    }
}

fn resolve_grace(grace: Option<&str>, env: &EnvConfig) -> Result<std::time::Duration, CtrError> {
    match grace {
        Some(s) => parse_duration(s),
        None => Ok(env.grace_period),
    }
}
