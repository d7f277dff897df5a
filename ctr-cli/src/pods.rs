//! `ctr pods ...`: prepare, run, inspect, and garbage-collect pods.

use std::path::PathBuf;

use clap::{Args, Subcommand};

use ctr::EnvConfig;
use ctr_types::{duration::parse_duration, CtrError, PodId};

use crate::stores;

#[derive(Debug, Subcommand)]
pub enum PodsCommand {
    /// List every pod, active and in the graveyard.
    List,
    /// Show per-app exit status for an active pod.
    Show {
        #[command(flatten)]
        pod: SelectPod,
    },
    /// Print a pod's persisted config JSON.
    CatConfig {
        #[command(flatten)]
        pod: SelectPod,
    },
    /// Generate a fresh pod id (a UUID-4 string).
    GenerateId,
    /// Prepare a pod and immediately run it.
    Run {
        #[command(flatten)]
        pod: SelectPod,
        config: PathBuf,
    },
    /// Validate a config, resolve its images, and stage the pod directory.
    Prepare {
        #[command(flatten)]
        pod: SelectPod,
        config: PathBuf,
    },
    /// Run a pod that was already prepared.
    RunPrepared {
        #[command(flatten)]
        pod: SelectPod,
    },
    /// Hard-link a pod's config to `dst`, pinning it against cleanup.
    AddRef {
        #[command(flatten)]
        pod: SelectPod,
        dst: PathBuf,
    },
    /// Copy a stopped pod's composed rootfs into an image-shaped archive.
    ExportOverlay {
        #[command(flatten)]
        pod: SelectPod,
        output: PathBuf,
        /// rsync-style include/exclude filter pattern; may repeat.
        #[arg(long = "filter")]
        filters: Vec<String>,
    },
    /// Move a pod to the graveyard.
    Remove {
        #[command(flatten)]
        pod: SelectPod,
    },
    /// Reclaim graveyard pods and stale tmp dirs past their grace period.
    Cleanup {
        #[arg(long)]
        grace: Option<String>,
    },
}

#[derive(Debug, Args)]
pub struct SelectPod {
    #[arg(long)]
    pub id: String,
}

impl SelectPod {
    fn parse(self) -> Result<PodId, CtrError> {
        PodId::parse(&self.id)
    }
}

pub fn run(command: PodsCommand, env: &EnvConfig) -> Result<(), CtrError> {
    match command {
        PodsCommand::List => {
            let (_repo, _images, pod_store, _xars) = stores::open(env)?;
            for entry in pod_store.list()? {
                println!(
                    "{}\t{}\t{}\t{}",
                    entry.id,
                    entry.name,
                    entry.version,
                    if entry.active { "active" } else { "graveyard" }
                );
            }
            Ok(())
        }
        PodsCommand::Show { pod } => {
            let (_repo, _images, pod_store, _xars) = stores::open(env)?;
            let pod_id = pod.parse()?;
            for status in pod_store.show(&pod_id)? {
                println!(
                    "{}\t{}\t{}",
                    status.name,
                    status.last_exit.map(|c| c.to_string()).unwrap_or_else(|| "-".to_string()),
                    status.last_exit_time.map(|t| t.to_rfc3339()).unwrap_or_else(|| "-".to_string()),
                );
            }
            Ok(())
        }
        PodsCommand::CatConfig { pod } => {
            let (_repo, _images, pod_store, _xars) = stores::open(env)?;
            let pod_id = pod.parse()?;
            let bytes = pod_store.cat_config(&pod_id)?;
            std::io::Write::write_all(&mut std::io::stdout(), &bytes)
                .map_err(|e| CtrError::io("<stdout>", e))
        }
        PodsCommand::GenerateId => {
            println!("{}", PodId::generate());
            Ok(())
        }
        PodsCommand::Run { pod, config } => {
            let (_repo, _images, pod_store, _xars) = stores::open(env)?;
            let pod_id = pod.parse()?;
            let code = pod_store.run(&pod_id, &config)?;
            std::process::exit(code);
        }
        PodsCommand::Prepare { pod, config } => {
            let (_repo, _images, pod_store, _xars) = stores::open(env)?;
            let pod_id = pod.parse()?;
            pod_store.prepare(&pod_id, &config)
        }
        PodsCommand::RunPrepared { pod } => {
            let (_repo, _images, pod_store, _xars) = stores::open(env)?;
            let pod_id = pod.parse()?;
            let code = pod_store.run_prepared(&pod_id)?;
            std::process::exit(code);
        }
        PodsCommand::AddRef { pod, dst } => {
            let (_repo, _images, pod_store, _xars) = stores::open(env)?;
            let pod_id = pod.parse()?;
            pod_store.add_ref(&pod_id, &dst)
        }
        PodsCommand::ExportOverlay { pod, output, filters } => {
            let (_repo, _images, pod_store, _xars) = stores::open(env)?;
            let pod_id = pod.parse()?;
            pod_store.export_overlay(&pod_id, &output, &filters)
        }
        PodsCommand::Remove { pod } => {
            let (_repo, _images, pod_store, _xars) = stores::open(env)?;
            let pod_id = pod.parse()?;
            pod_store.remove(&pod_id)
        }
        PodsCommand::Cleanup { grace } => {
            let grace = match grace {
                Some(s) => parse_duration(&s)?,
                None => env.grace_period,
            };
            let (_repo, _images, pod_store, _xars) = stores::open(env)?;
            let removed = pod_store.cleanup(grace)?;
            for id in removed {
                println!("{id}");
            }
            Ok(())
        }
    }
}
