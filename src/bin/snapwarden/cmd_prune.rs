use anyhow::{anyhow, Result};
use log::info;

use snapwarden::{CancelToken, Orchestrator, RunState, SnapConfig};

use crate::cli::try_lock;

pub fn exec(cfg: SnapConfig, dry_run: bool) -> Result<()> {
    let _lock = match try_lock(&cfg)? {
        Some(l) => l,
        None => {
            info!("skipped: another snapwarden process holds the instance lock");
            println!("busy: another run is active");
            return Ok(());
        }
    };

    let orch = Orchestrator::from_config(&cfg, CancelToken::new())?;
    let rep = orch.prune(&RunState::new(), dry_run)?;

    let verb = if dry_run { "would prune" } else { "pruned" };
    for h in rep.plan.prune.iter().rev() {
        let failed = rep.failures.iter().find(|(id, _)| id == &h.id);
        match failed {
            Some((_, e)) => println!("  FAILED {}: {}", h.id, e),
            None => println!("  {} {}", verb, h.id),
        }
    }
    for h in &rep.plan.deferred {
        println!("  deferred {} (mounted)", h.id);
    }
    println!(
        "kept={} {}={} deferred={} failures={}",
        rep.plan.keep.len(),
        verb,
        if dry_run { rep.plan.prune.len() } else { rep.deleted.len() },
        rep.plan.deferred.len(),
        rep.failures.len()
    );

    if !rep.failures.is_empty() {
        return Err(anyhow!("{} snapshot(s) could not be deleted", rep.failures.len()));
    }
    Ok(())
}
