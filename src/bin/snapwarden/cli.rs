use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;

use snapwarden::consts::DEFAULT_CONFIG_PATH;
use snapwarden::lock::{try_acquire_instance_lock, InstanceLock};
use snapwarden::{CancelToken, SnapConfig};

/// Periodic snapshots of application storage, mounted for an external backup agent.
#[derive(Parser, Debug)]
#[command(name = "snapwarden", version, about = "snapwarden: snapshot lifecycle manager")]
pub struct Cli {
    /// Path to a configuration file (default: config.toml, optional)
    #[arg(short = 'c', long, global = true)]
    pub config: Option<PathBuf>,

    /// Override retention.max-count
    #[arg(short = 'r', long, global = true)]
    pub retention: Option<usize>,

    /// Override backup-containers: stopped while the snapshot is mounted
    /// (`-b restic -b rclone` or `-b restic,rclone`)
    #[arg(
        short = 'b',
        long = "backup-containers",
        global = true,
        action = ArgAction::Append,
        value_delimiter = ','
    )]
    pub backup_containers: Option<Vec<String>>,

    /// Override the monitor push URL
    #[arg(short = 'm', long = "monitor-url", global = true)]
    pub monitor_url: Option<String>,

    /// Verbosity: -v info, -vv debug (RUST_LOG wins)
    #[arg(short = 'v', long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub cmd: Cmd,
}

#[derive(Subcommand, Debug)]
pub enum Cmd {
    /// Reconcile, then one orchestrated run
    Run,
    /// Reconcile, then run on the configured interval until SIGINT/SIGTERM
    Daemon,
    /// Reconcile mount records with the OS and print the outcome
    Reconcile,
    /// Show snapshots (newest first) and mount records
    Status {
        #[arg(long)]
        json: bool,
    },
    /// Apply retention only (mounted snapshots are never pruned)
    Prune {
        #[arg(long)]
        dry_run: bool,
    },
}

impl Cli {
    pub fn parse() -> Self {
        <Self as Parser>::parse()
    }
}

/// defaults -> file -> env -> CLI flags, then validate.
pub fn load_config(cli: &Cli) -> Result<SnapConfig> {
    let (path, required) = match &cli.config {
        Some(p) => (p.clone(), true),
        None => (PathBuf::from(DEFAULT_CONFIG_PATH), false),
    };
    let cfg = apply_flags(cli, SnapConfig::load(&path, required)?);
    cfg.validate().context("invalid configuration")?;
    log::debug!("effective config: {}", cfg);
    Ok(cfg)
}

fn apply_flags(cli: &Cli, mut cfg: SnapConfig) -> SnapConfig {
    if let Some(n) = cli.retention {
        cfg = cfg.with_max_count(n);
    }
    if let Some(names) = &cli.backup_containers {
        let names = names
            .iter()
            .map(|n| n.trim())
            .filter(|n| !n.is_empty())
            .map(str::to_string)
            .collect();
        cfg = cfg.with_backup_containers(names);
    }
    if let Some(url) = &cli.monitor_url {
        cfg = cfg.with_monitor_url(Some(url.as_str()));
    }
    cfg
}

/// SIGINT/SIGTERM -> cancel.
pub fn install_signal_handler(cancel: &CancelToken) -> Result<()> {
    let c = cancel.clone();
    ctrlc::set_handler(move || {
        log::info!("signal received, finishing the current step and stopping");
        c.cancel();
    })
    .context("install SIGINT/SIGTERM handler")
}

/// Instance lock for one-shot mutating commands. None if another process holds it.
pub fn try_lock(cfg: &SnapConfig) -> Result<Option<InstanceLock>> {
    try_acquire_instance_lock(&cfg.state_dir)
}
