//! Lightweight global metrics for snapwarden.
//!
//! Потокобезопасные атомарные счётчики для подсистем:
//! - Runs (orchestrator / scheduler)
//! - Snapshots (create / delete / compensation)
//! - Mounts (coordinator)
//! - Notifications
//! - Reconciliation

use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};

// ----- Runs -----
static RUNS_STARTED: AtomicU64 = AtomicU64::new(0);
static RUNS_SUCCEEDED: AtomicU64 = AtomicU64::new(0);
static RUNS_FAILED: AtomicU64 = AtomicU64::new(0);
static RUNS_SKIPPED_BUSY: AtomicU64 = AtomicU64::new(0);
static CYCLES_SKIPPED: AtomicU64 = AtomicU64::new(0);
static LAST_SUCCESS_UNIX: AtomicU64 = AtomicU64::new(0);

// ----- Snapshots -----
static SNAPSHOTS_CREATED: AtomicU64 = AtomicU64::new(0);
static SNAPSHOTS_DELETED: AtomicU64 = AtomicU64::new(0);
static SNAPSHOT_DELETE_FAILURES: AtomicU64 = AtomicU64::new(0);
static SNAPSHOT_COMPENSATIONS: AtomicU64 = AtomicU64::new(0);

// ----- Mounts -----
static MOUNTS_ACQUIRED: AtomicU64 = AtomicU64::new(0);
static MOUNTS_RELEASED: AtomicU64 = AtomicU64::new(0);
static MOUNT_RELEASE_FAILURES: AtomicU64 = AtomicU64::new(0);
static MOUNTS_ACTIVE: AtomicU64 = AtomicU64::new(0);

// ----- Notifications / containers -----
static NOTIFY_OK: AtomicU64 = AtomicU64::new(0);
static NOTIFY_FAILED: AtomicU64 = AtomicU64::new(0);
static CONTAINER_RESTART_FAILURES: AtomicU64 = AtomicU64::new(0);

// ----- Reconciliation -----
static RECONCILE_LEAKS_UNMOUNTED: AtomicU64 = AtomicU64::new(0);
static RECONCILE_STALE_DROPPED: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Default)]
pub struct MetricsSnapshot {
    pub runs_started: u64,
    pub runs_succeeded: u64,
    pub runs_failed: u64,
    pub runs_skipped_busy: u64,
    pub cycles_skipped: u64,
    pub last_success_unix: u64,

    pub snapshots_created: u64,
    pub snapshots_deleted: u64,
    pub snapshot_delete_failures: u64,
    pub snapshot_compensations: u64,

    pub mounts_acquired: u64,
    pub mounts_released: u64,
    pub mount_release_failures: u64,
    pub mounts_active: u64,

    pub notify_ok: u64,
    pub notify_failed: u64,
    pub container_restart_failures: u64,

    pub reconcile_leaks_unmounted: u64,
    pub reconcile_stale_dropped: u64,
}

impl MetricsSnapshot {
    pub fn success_ratio(&self) -> f64 {
        let done = self.runs_succeeded + self.runs_failed;
        if done == 0 {
            0.0
        } else {
            self.runs_succeeded as f64 / done as f64
        }
    }
}

// ----- Recorders (Runs) -----
pub fn record_run_started() {
    RUNS_STARTED.fetch_add(1, Ordering::Relaxed);
}

pub fn record_run_succeeded(now_unix: u64) {
    RUNS_SUCCEEDED.fetch_add(1, Ordering::Relaxed);
    LAST_SUCCESS_UNIX.store(now_unix, Ordering::Relaxed);
}

pub fn record_run_failed() {
    RUNS_FAILED.fetch_add(1, Ordering::Relaxed);
}

pub fn record_run_skipped_busy() {
    RUNS_SKIPPED_BUSY.fetch_add(1, Ordering::Relaxed);
}

pub fn record_cycles_skipped(n: u64) {
    CYCLES_SKIPPED.fetch_add(n, Ordering::Relaxed);
}

// ----- Recorders (Snapshots) -----
pub fn record_snapshot_created() {
    SNAPSHOTS_CREATED.fetch_add(1, Ordering::Relaxed);
}

pub fn record_snapshot_deleted() {
    SNAPSHOTS_DELETED.fetch_add(1, Ordering::Relaxed);
}

pub fn record_snapshot_delete_failure() {
    SNAPSHOT_DELETE_FAILURES.fetch_add(1, Ordering::Relaxed);
}

pub fn record_snapshot_compensation() {
    SNAPSHOT_COMPENSATIONS.fetch_add(1, Ordering::Relaxed);
}

// ----- Recorders (Mounts) -----
pub fn record_mount_acquired() {
    MOUNTS_ACQUIRED.fetch_add(1, Ordering::Relaxed);
    MOUNTS_ACTIVE.fetch_add(1, Ordering::Relaxed);
}

pub fn record_mount_released() {
    MOUNTS_RELEASED.fetch_add(1, Ordering::Relaxed);
    MOUNTS_ACTIVE
        .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| Some(v.saturating_sub(1)))
        .ok();
}

pub fn record_mount_release_failure() {
    MOUNT_RELEASE_FAILURES.fetch_add(1, Ordering::Relaxed);
}

/// Reconciliation adopts mounts from a previous process.
pub fn set_mounts_active(n: u64) {
    MOUNTS_ACTIVE.store(n, Ordering::Relaxed);
}

// ----- Recorders (Notifications / containers) -----
pub fn record_notify(ok: bool) {
    if ok {
        NOTIFY_OK.fetch_add(1, Ordering::Relaxed);
    } else {
        NOTIFY_FAILED.fetch_add(1, Ordering::Relaxed);
    }
}

pub fn record_container_restart_failure() {
    CONTAINER_RESTART_FAILURES.fetch_add(1, Ordering::Relaxed);
}

// ----- Recorders (Reconciliation) -----
pub fn record_reconcile(leaks_unmounted: u64, stale_dropped: u64) {
    RECONCILE_LEAKS_UNMOUNTED.fetch_add(leaks_unmounted, Ordering::Relaxed);
    RECONCILE_STALE_DROPPED.fetch_add(stale_dropped, Ordering::Relaxed);
}

// ----- Snapshot / Reset -----
pub fn snapshot() -> MetricsSnapshot {
    MetricsSnapshot {
        runs_started: RUNS_STARTED.load(Ordering::Relaxed),
        runs_succeeded: RUNS_SUCCEEDED.load(Ordering::Relaxed),
        runs_failed: RUNS_FAILED.load(Ordering::Relaxed),
        runs_skipped_busy: RUNS_SKIPPED_BUSY.load(Ordering::Relaxed),
        cycles_skipped: CYCLES_SKIPPED.load(Ordering::Relaxed),
        last_success_unix: LAST_SUCCESS_UNIX.load(Ordering::Relaxed),

        snapshots_created: SNAPSHOTS_CREATED.load(Ordering::Relaxed),
        snapshots_deleted: SNAPSHOTS_DELETED.load(Ordering::Relaxed),
        snapshot_delete_failures: SNAPSHOT_DELETE_FAILURES.load(Ordering::Relaxed),
        snapshot_compensations: SNAPSHOT_COMPENSATIONS.load(Ordering::Relaxed),

        mounts_acquired: MOUNTS_ACQUIRED.load(Ordering::Relaxed),
        mounts_released: MOUNTS_RELEASED.load(Ordering::Relaxed),
        mount_release_failures: MOUNT_RELEASE_FAILURES.load(Ordering::Relaxed),
        mounts_active: MOUNTS_ACTIVE.load(Ordering::Relaxed),

        notify_ok: NOTIFY_OK.load(Ordering::Relaxed),
        notify_failed: NOTIFY_FAILED.load(Ordering::Relaxed),
        container_restart_failures: CONTAINER_RESTART_FAILURES.load(Ordering::Relaxed),

        reconcile_leaks_unmounted: RECONCILE_LEAKS_UNMOUNTED.load(Ordering::Relaxed),
        reconcile_stale_dropped: RECONCILE_STALE_DROPPED.load(Ordering::Relaxed),
    }
}

pub fn reset() {
    RUNS_STARTED.store(0, Ordering::Relaxed);
    RUNS_SUCCEEDED.store(0, Ordering::Relaxed);
    RUNS_FAILED.store(0, Ordering::Relaxed);
    RUNS_SKIPPED_BUSY.store(0, Ordering::Relaxed);
    CYCLES_SKIPPED.store(0, Ordering::Relaxed);
    LAST_SUCCESS_UNIX.store(0, Ordering::Relaxed);

    SNAPSHOTS_CREATED.store(0, Ordering::Relaxed);
    SNAPSHOTS_DELETED.store(0, Ordering::Relaxed);
    SNAPSHOT_DELETE_FAILURES.store(0, Ordering::Relaxed);
    SNAPSHOT_COMPENSATIONS.store(0, Ordering::Relaxed);

    MOUNTS_ACQUIRED.store(0, Ordering::Relaxed);
    MOUNTS_RELEASED.store(0, Ordering::Relaxed);
    MOUNT_RELEASE_FAILURES.store(0, Ordering::Relaxed);
    MOUNTS_ACTIVE.store(0, Ordering::Relaxed);

    NOTIFY_OK.store(0, Ordering::Relaxed);
    NOTIFY_FAILED.store(0, Ordering::Relaxed);
    CONTAINER_RESTART_FAILURES.store(0, Ordering::Relaxed);

    RECONCILE_LEAKS_UNMOUNTED.store(0, Ordering::Relaxed);
    RECONCILE_STALE_DROPPED.store(0, Ordering::Relaxed);
}

/// Prometheus text exposition (version 0.0.4).
pub fn render_prometheus(m: &MetricsSnapshot) -> String {
    let mut out = String::new();

    let counters: [(&str, &str, u64); 17] = [
        ("snapwarden_runs_started_total", "Orchestrator runs started", m.runs_started),
        ("snapwarden_runs_succeeded_total", "Runs finished in Idle", m.runs_succeeded),
        ("snapwarden_runs_failed_total", "Runs finished in Error", m.runs_failed),
        ("snapwarden_runs_skipped_busy_total", "Triggers dropped because a run was active", m.runs_skipped_busy),
        ("snapwarden_cycles_skipped_total", "Schedule ticks missed while a run was in flight", m.cycles_skipped),
        ("snapwarden_snapshots_created_total", "Snapshots created", m.snapshots_created),
        ("snapwarden_snapshots_deleted_total", "Snapshots deleted by retention or compensation", m.snapshots_deleted),
        ("snapwarden_snapshot_delete_failures_total", "Snapshot deletions that failed", m.snapshot_delete_failures),
        ("snapwarden_snapshot_compensations_total", "Snapshots deleted after a failed mount", m.snapshot_compensations),
        ("snapwarden_mounts_acquired_total", "Snapshot mounts acquired", m.mounts_acquired),
        ("snapwarden_mounts_released_total", "Snapshot mounts released", m.mounts_released),
        ("snapwarden_mount_release_failures_total", "Unmounts that failed and were deferred", m.mount_release_failures),
        ("snapwarden_notify_ok_total", "Successful backup notifications", m.notify_ok),
        ("snapwarden_notify_failed_total", "Failed backup notifications", m.notify_failed),
        ("snapwarden_container_restart_failures_total", "Containers that could not be restarted", m.container_restart_failures),
        ("snapwarden_reconcile_leaks_unmounted_total", "Leaked mounts unmounted at startup", m.reconcile_leaks_unmounted),
        ("snapwarden_reconcile_stale_dropped_total", "Stale mount records dropped at startup", m.reconcile_stale_dropped),
    ];
    for (name, help, v) in counters {
        let _ = writeln!(out, "# HELP {} {}", name, help);
        let _ = writeln!(out, "# TYPE {} counter", name);
        let _ = writeln!(out, "{} {}", name, v);
    }

    let gauges: [(&str, &str, u64); 2] = [
        ("snapwarden_mounts_active", "Snapshot mounts currently held", m.mounts_active),
        ("snapwarden_last_success_unixtime", "Unix time of the last successful run", m.last_success_unix),
    ];
    for (name, help, v) in gauges {
        let _ = writeln!(out, "# HELP {} {}", name, help);
        let _ = writeln!(out, "# TYPE {} gauge", name);
        let _ = writeln!(out, "{} {}", name, v);
    }
    out
}
