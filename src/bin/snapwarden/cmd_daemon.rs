use anyhow::{anyhow, Context, Result};
use log::info;

use snapwarden::exporter::Exporter;
use snapwarden::{CancelToken, Orchestrator, RunState, Scheduler, SnapConfig};

use crate::cli::{install_signal_handler, try_lock};

pub fn exec(cfg: SnapConfig) -> Result<()> {
    // lock держим всё время жизни демона
    let _lock = try_lock(&cfg)?.ok_or_else(|| {
        anyhow!(
            "another snapwarden process holds the instance lock in {}",
            cfg.state_dir.display()
        )
    })?;
    info!("starting daemon: {}", cfg);

    let cancel = CancelToken::new();
    install_signal_handler(&cancel)?;

    let orch = Orchestrator::from_config(&cfg, cancel.clone())?;
    let rep = orch
        .reconcile()
        .context("startup reconciliation failed; refusing to schedule runs")?;
    if !rep.is_clean() {
        info!("startup reconciliation repaired state: {}", rep);
    }

    let exporter = match &cfg.metrics_addr {
        Some(addr) => Some(Exporter::spawn(addr, cancel.clone())?),
        None => None,
    };

    let state = RunState::new();
    let scheduler = Scheduler::new(cfg.interval, cancel.clone()).with_run_on_start(cfg.run_on_start);
    let res = scheduler.run(&orch, &state);

    // фатальная ошибка тоже должна остановить exporter
    cancel.cancel();
    if let Some(ex) = exporter {
        ex.join();
    }

    let summary = res.context("scheduler stopped on a fatal error")?;
    info!(
        "daemon stopped: runs={} ok={} failed={} busy={}",
        summary.fired, summary.succeeded, summary.failed, summary.busy
    );
    Ok(())
}
