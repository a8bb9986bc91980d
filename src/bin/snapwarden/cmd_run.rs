use anyhow::{anyhow, Context, Result};
use log::info;

use snapwarden::{CancelToken, LifecycleError, Orchestrator, RunState, SnapConfig};

use crate::cli::{install_signal_handler, try_lock};

/// One run. Busy (lock held elsewhere) and cancellation are not failures.
pub fn exec(cfg: SnapConfig) -> Result<()> {
    let _lock = match try_lock(&cfg)? {
        Some(l) => l,
        None => {
            snapwarden::metrics::record_run_skipped_busy();
            info!("skipped: another snapwarden process holds the instance lock");
            println!("busy: another run is active");
            return Ok(());
        }
    };

    let cancel = CancelToken::new();
    install_signal_handler(&cancel)?;
    let orch = Orchestrator::from_config(&cfg, cancel)?;
    orch.reconcile()
        .context("startup reconciliation failed; refusing to run")?;

    let state = RunState::new();
    match orch.run(&state) {
        Ok(rep) if rep.succeeded() => {
            println!("ok: {}", rep.summary());
            Ok(())
        }
        Ok(rep) => Err(anyhow!("run finished in {}: {}", rep.final_phase, rep.summary())),
        Err(e) if e.is_busy() => {
            info!("skipped: {}", e);
            println!("busy: {}", e);
            Ok(())
        }
        Err(LifecycleError::Cancelled) => {
            println!("cancelled before snapshot creation");
            Ok(())
        }
        Err(e) => Err(e).context("run failed"),
    }
}
