use anyhow::{anyhow, Context, Result};

use snapwarden::{CancelToken, Orchestrator, SnapConfig};

use crate::cli::try_lock;

pub fn exec(cfg: SnapConfig) -> Result<()> {
    let _lock = try_lock(&cfg)?.ok_or_else(|| {
        anyhow!(
            "another snapwarden process holds the instance lock in {}",
            cfg.state_dir.display()
        )
    })?;

    let orch = Orchestrator::from_config(&cfg, CancelToken::new())?;
    let rep = orch.reconcile().context("reconciliation failed")?;

    println!("reconcile: {}", rep);
    for r in &rep.adopted {
        println!("  adopted   {} (snapshot {})", r.mount_path.display(), r.snapshot_id);
    }
    for p in &rep.leaks_unmounted {
        println!("  unmounted {}", p.display());
    }
    for r in &rep.stale_dropped {
        println!("  dropped   {} (snapshot {})", r.mount_path.display(), r.snapshot_id);
    }
    Ok(())
}
