//! Scheduler: fixed-rate triggering of orchestrated runs.
//!
//! - расписание привязано к старту (start + k*interval), не к концу прогона;
//! - тики, пропущенные пока шёл прогон, не догоняются: считаются skipped cycles;
//! - Busy от прогона: штатный пропуск, логируется на info;
//! - сон между прогонами прерывается CancelToken; прогон в полёте не прерывается,
//!   цикл просто не выдаёт новых триггеров.

use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};

use crate::error::LifecycleError;
use crate::metrics::record_cycles_skipped;
use crate::orchestrator::{Orchestrator, RunReport, RunState};
use crate::util::format_duration;

/// Cooperative cancellation flag with an interruptible wait.
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        let (m, cv) = &*self.inner;
        *m.lock().unwrap_or_else(|p| p.into_inner()) = true;
        cv.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        let (m, _) = &*self.inner;
        *m.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Sleep up to `timeout`. Returns true if cancelled (immediately or while waiting).
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let (m, cv) = &*self.inner;
        let deadline = Instant::now() + timeout;
        let mut g = m.lock().unwrap_or_else(|p| p.into_inner());
        while !*g {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            g = match cv.wait_timeout(g, deadline - now) {
                Ok((g, _)) => g,
                Err(p) => p.into_inner().0,
            };
        }
        true
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScheduleSummary {
    pub fired: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub busy: u64,
    pub skipped_cycles: u64,
}

pub struct Scheduler {
    interval: Duration,
    run_on_start: bool,
    cancel: CancelToken,
}

impl Scheduler {
    pub fn new(interval: Duration, cancel: CancelToken) -> Self {
        Self {
            interval,
            run_on_start: true,
            cancel,
        }
    }

    pub fn with_run_on_start(mut self, on: bool) -> Self {
        self.run_on_start = on;
        self
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Drive `orch` until cancellation.
    pub fn run(&self, orch: &Orchestrator, state: &RunState) -> Result<ScheduleSummary, LifecycleError> {
        self.run_with(|| orch.run(state))
    }

    /// Loop with an arbitrary trigger. Returns on cancellation or a fatal error.
    pub fn run_with<F>(&self, mut fire: F) -> Result<ScheduleSummary, LifecycleError>
    where
        F: FnMut() -> Result<RunReport, LifecycleError>,
    {
        let mut summary = ScheduleSummary::default();
        let start = Instant::now();
        let mut next = if self.run_on_start {
            start
        } else {
            start + self.interval
        };
        info!(
            "scheduler started: interval={}, run_on_start={}",
            format_duration(self.interval),
            self.run_on_start
        );

        loop {
            let now = Instant::now();
            if next > now && self.cancel.wait_timeout(next - now) {
                break;
            }
            if self.cancel.is_cancelled() {
                break;
            }

            summary.fired += 1;
            match fire() {
                Ok(report) if report.succeeded() => summary.succeeded += 1,
                Ok(report) => {
                    summary.failed += 1;
                    warn!("run finished in {}: {}", report.final_phase, report.summary());
                }
                Err(e) if e.is_busy() => {
                    summary.busy += 1;
                    info!("skipped cycle: {}", e);
                }
                Err(LifecycleError::Cancelled) => break,
                Err(e) if e.is_fatal() => {
                    error!("fatal error, stopping scheduler: {}", e);
                    return Err(e);
                }
                Err(e) => {
                    summary.failed += 1;
                    error!("run failed: {}", e);
                }
            }

            next += self.interval;
            let after = Instant::now();
            let mut skipped = 0u64;
            while next <= after {
                next += self.interval;
                skipped += 1;
            }
            if skipped > 0 {
                info!("run overran the interval: {} cycle(s) skipped", skipped);
                record_cycles_skipped(skipped);
                summary.skipped_cycles += skipped;
            }
            debug!("next run in {:?}", next.saturating_duration_since(after));
        }

        info!(
            "scheduler stopped: fired={} succeeded={} failed={} busy={} skipped_cycles={}",
            summary.fired, summary.succeeded, summary.failed, summary.busy, summary.skipped_cycles
        );
        Ok(summary)
    }
}
