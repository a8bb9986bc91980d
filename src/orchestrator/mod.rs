//! Lifecycle orchestrator: one run =
//! AcquiringLock -> CreatingSnapshot -> Mounting -> Notifying -> Unmounting -> Pruning -> Idle,
//! плюс Error как терминальное состояние прогона.
//!
//! Политика ошибок:
//! - create: прогон -> Error, без ретраев;
//! - mount: компенсирующий delete только что созданного снапшота, затем Error;
//! - notify: результат прогона (Error), но unmount и prune выполняются всё равно;
//! - unmount: warn, снапшот остаётся "смонтированным" и исключается из prune;
//! - delete при prune: best-effort, остальные удаляются, прогон не валится.
//!
//! Backup-контейнеры (агент, читающий mount) стоят всё окно
//! acquire_mount..release_mount и запускаются даже после отказа mount.
//!
//! Отмена проверяется только на двух границах: перед CreatingSnapshot
//! (прогон -> Cancelled, монитору уходит "down/interrupted") и перед Pruning
//! (prune откладывается).

pub mod state;

use std::collections::HashSet;
use std::fmt::Write as _;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::Result;
use log::{debug, error, info, warn};
use serde::Serialize;

pub use state::{Phase, RunGuard, RunState};

use crate::config::SnapConfig;
use crate::error::LifecycleError;
use crate::metrics::{
    record_container_restart_failure, record_notify, record_run_failed, record_run_skipped_busy,
    record_run_started, record_run_succeeded, record_snapshot_compensation,
    record_snapshot_created, record_snapshot_delete_failure, record_snapshot_deleted,
};
use crate::mounts::{store, MountCoordinator, ReconcileReport};
use crate::notify::{BackupNotifier, NoopNotifier, NotifyError, UptimeKumaNotifier};
use crate::provider::{MountRecord, SnapshotHandle, SnapshotProvider, ZfsProvider};
use crate::quiesce::{ContainerRuntime, DockerRuntime};
use crate::retention::{self, RetentionPlan, RetentionPolicy};
use crate::scheduler::CancelToken;
use crate::util::clock::{Clock, SystemClock};

/// Outcome of one run that got past CreatingSnapshot.
#[derive(Debug)]
pub struct RunReport {
    pub snapshot: Option<SnapshotHandle>,
    pub mount_path: Option<PathBuf>,
    pub notify_error: Option<NotifyError>,
    /// Unmount failed; the record lingers and the snapshot is kept.
    pub deferred_unmount: bool,
    /// Lingering records from earlier runs that still could not be released.
    pub lingering: Vec<String>,
    pub pruned: Vec<String>,
    pub prune_failures: Vec<(String, String)>,
    /// Cancellation arrived before Pruning.
    pub prune_skipped: bool,
    pub container_restart_error: Option<String>,
    /// Backup-agent containers could not be started after the mount window.
    pub backup_restart_error: Option<String>,
    pub final_phase: Phase,
}

impl Default for RunReport {
    fn default() -> Self {
        Self {
            snapshot: None,
            mount_path: None,
            notify_error: None,
            deferred_unmount: false,
            lingering: Vec::new(),
            pruned: Vec::new(),
            prune_failures: Vec::new(),
            prune_skipped: false,
            container_restart_error: None,
            backup_restart_error: None,
            final_phase: Phase::Idle,
        }
    }
}

impl RunReport {
    pub fn succeeded(&self) -> bool {
        self.final_phase == Phase::Idle
    }

    pub fn summary(&self) -> String {
        let mut s = String::new();
        match &self.snapshot {
            Some(h) => {
                let _ = write!(s, "snapshot={}", h.id);
            }
            None => s.push_str("snapshot=-"),
        }
        if let Some(p) = &self.mount_path {
            let _ = write!(s, " mount={}", p.display());
        }
        match &self.notify_error {
            Some(e) => {
                let _ = write!(s, " notify=failed({})", e);
            }
            None => s.push_str(" notify=ok"),
        }
        if self.deferred_unmount {
            s.push_str(" unmount=deferred");
        }
        let _ = write!(
            s,
            " pruned={} prune_failures={}",
            self.pruned.len(),
            self.prune_failures.len()
        );
        if self.prune_skipped {
            s.push_str(" prune=skipped");
        }
        if let Some(e) = &self.container_restart_error {
            let _ = write!(s, " containers=restart_failed({})", e);
        }
        if let Some(e) = &self.backup_restart_error {
            let _ = write!(s, " backup_containers=restart_failed({})", e);
        }
        s
    }
}

/// Result of a standalone retention sweep.
#[derive(Debug, Default)]
pub struct PruneReport {
    pub plan: RetentionPlan,
    pub deleted: Vec<String>,
    pub failures: Vec<(String, String)>,
    pub dry_run: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotStatus {
    #[serde(flatten)]
    pub handle: SnapshotHandle,
    pub mounted: bool,
    pub would_prune: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub source: String,
    pub policy: String,
    /// Newest first.
    pub snapshots: Vec<SnapshotStatus>,
    pub mounts: Vec<MountRecord>,
}

pub struct Orchestrator {
    source: String,
    provider: Arc<dyn SnapshotProvider>,
    mounts: Mutex<MountCoordinator>,
    notifier: Arc<dyn BackupNotifier>,
    runtime: Option<Arc<dyn ContainerRuntime>>,
    containers: Vec<String>,
    backup_containers: Vec<String>,
    policy: RetentionPolicy,
    clock: Arc<dyn Clock>,
    cancel: CancelToken,
}

impl Orchestrator {
    pub fn new(source: &str, provider: Arc<dyn SnapshotProvider>, mounts: MountCoordinator) -> Self {
        Self {
            source: source.to_string(),
            provider,
            mounts: Mutex::new(mounts),
            notifier: Arc::new(NoopNotifier),
            runtime: None,
            containers: Vec::new(),
            backup_containers: Vec::new(),
            policy: RetentionPolicy::default(),
            clock: Arc::new(SystemClock),
            cancel: CancelToken::new(),
        }
    }

    /// Production wiring: ZFS provider, persisted mount store, docker, monitor URL.
    pub fn from_config(cfg: &SnapConfig, cancel: CancelToken) -> Result<Self> {
        let provider: Arc<dyn SnapshotProvider> = Arc::new(
            ZfsProvider::new(&cfg.source, &cfg.snapshot_prefix, &cfg.mount_root)
                .with_children(cfg.children.clone()),
        );
        let mounts = MountCoordinator::new(provider.clone(), &cfg.mount_root)
            .with_store(store::store_path(&cfg.state_dir));
        let notifier: Arc<dyn BackupNotifier> = match &cfg.monitor_url {
            Some(url) => Arc::new(UptimeKumaNotifier::new(url, cfg.notify_timeout)?),
            None => Arc::new(NoopNotifier),
        };

        let mut orch = Self::new(&cfg.source, provider, mounts)
            .with_notifier(notifier)
            .with_policy(cfg.retention.clone())
            .with_cancel(cancel);
        if !cfg.containers.is_empty() || !cfg.backup_containers.is_empty() {
            let docker: Arc<dyn ContainerRuntime> = Arc::new(DockerRuntime::default());
            orch = orch
                .with_containers(docker.clone(), cfg.containers.clone())
                .with_backup_containers(docker, cfg.backup_containers.clone());
        }
        Ok(orch)
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn BackupNotifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_policy(mut self, policy: RetentionPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Application containers stopped around snapshot creation.
    pub fn with_containers(mut self, runtime: Arc<dyn ContainerRuntime>, names: Vec<String>) -> Self {
        self.runtime = Some(runtime);
        self.containers = names;
        self
    }

    /// Backup-agent containers kept down while the snapshot mount exists.
    /// Shares the runtime with `with_containers`; the last one set wins.
    pub fn with_backup_containers(
        mut self,
        runtime: Arc<dyn ContainerRuntime>,
        names: Vec<String>,
    ) -> Self {
        self.runtime = Some(runtime);
        self.backup_containers = names;
        self
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn policy(&self) -> &RetentionPolicy {
        &self.policy
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    fn mounts(&self) -> MutexGuard<'_, MountCoordinator> {
        self.mounts.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Mount records currently held by the coordinator.
    pub fn mount_records(&self) -> Vec<MountRecord> {
        self.mounts().records()
    }

    /// Startup reconciliation. Must succeed before the first run.
    pub fn reconcile(&self) -> Result<ReconcileReport, LifecycleError> {
        let report = self.mounts().reconcile()?;
        info!("reconciliation done: {}", report);
        Ok(report)
    }

    /// One orchestrated run. `Busy` if another run holds `state`.
    pub fn run(&self, state: &RunState) -> Result<RunReport, LifecycleError> {
        let guard = match state.begin() {
            Ok(g) => g,
            Err(e) => {
                record_run_skipped_busy();
                return Err(e);
            }
        };
        record_run_started();
        info!("run started: source={}", self.source);
        self.notifier.run_started();

        let mut mounts = self.mounts();
        let mut report = RunReport::default();

        for (rec, _) in mounts.release_lingering() {
            report.lingering.push(rec.snapshot_id);
        }

        if self.cancel.is_cancelled() {
            info!("cancellation requested before snapshot creation; run aborted");
            return Err(self.abort(guard, LifecycleError::Cancelled));
        }

        // ----- CreatingSnapshot -----
        guard.enter(Phase::CreatingSnapshot);
        let handle = match self.create_quiesced(&mut report) {
            Ok(h) => h,
            Err(e) => return Err(self.abort(guard, e)),
        };
        info!("created snapshot {}", handle);
        report.snapshot = Some(handle.clone());

        // ----- Mounting -----
        guard.enter(Phase::Mounting);
        if let Err(e) = self.stop_backup_agents() {
            self.compensate(&handle);
            return Err(self.abort(guard, e));
        }
        let record = match mounts.acquire_mount(&handle) {
            Ok(r) => r,
            Err(e) => {
                self.start_backup_agents(&mut report);
                self.compensate(&handle);
                return Err(self.abort(guard, e));
            }
        };
        info!("snapshot {} mounted at {}", handle.id, record.mount_path.display());
        report.mount_path = Some(record.mount_path.clone());

        // ----- Notifying -----
        guard.enter(Phase::Notifying);
        match self.notifier.notify(&handle, &record.mount_path) {
            Ok(()) => record_notify(true),
            Err(e) => {
                record_notify(false);
                error!("backup notification for snapshot {} failed: {}", handle.id, e);
                report.notify_error = Some(e);
            }
        }

        // ----- Unmounting -----
        guard.enter(Phase::Unmounting);
        if let Err(e) = mounts.release_mount(&record) {
            warn!(
                "unmount of {} failed, deferred to next run: {}",
                record.mount_path.display(),
                e
            );
            report.deferred_unmount = true;
        }
        self.start_backup_agents(&mut report);

        // ----- Pruning -----
        if self.cancel.is_cancelled() {
            info!("cancellation requested; pruning deferred to next run");
            report.prune_skipped = true;
        } else {
            guard.enter(Phase::Pruning);
            let excluded = mounts.mounted_ids();
            let now = self.clock.now_unix_sec();
            match self.provider.list_existing() {
                Ok(existing) => {
                    let plan = retention::plan(&existing, &self.policy, &excluded, now);
                    self.sweep(&plan, &mut report.pruned, &mut report.prune_failures);
                }
                Err(e) => {
                    warn!("cannot list snapshots for pruning: {}", e);
                    report.prune_failures.push(("*".to_string(), e.to_string()));
                }
            }
        }
        drop(mounts);

        let terminal = match &report.notify_error {
            None => {
                record_run_succeeded(self.clock.now_unix_sec());
                info!("run finished: {}", report.summary());
                Phase::Idle
            }
            Some(e) => {
                record_run_failed();
                self.notifier.run_failed(&format!("backup notification failed: {}", e));
                error!("run finished with error: {}", report.summary());
                Phase::Error
            }
        };
        report.final_phase = terminal;
        guard.finish(terminal);
        Ok(report)
    }

    /// Stop containers (reverse order), create, start them again whatever happened.
    fn create_quiesced(&self, report: &mut RunReport) -> Result<SnapshotHandle, LifecycleError> {
        let runtime = match &self.runtime {
            Some(rt) if !self.containers.is_empty() => rt,
            _ => {
                return self
                    .provider
                    .create(&self.source)
                    .map_err(|e| LifecycleError::provider("create", e))
                    .inspect(|_| record_snapshot_created());
            }
        };

        debug!("stopping containers: {}", self.containers.join(", "));
        if let Err(e) = runtime.stop(&self.containers) {
            // часть контейнеров могла остановиться
            if let Err(se) = runtime.start(&self.containers) {
                warn!("restarting containers after failed stop: {}", se);
            }
            return Err(LifecycleError::Container(format!("stop failed: {}", e)));
        }

        let created = self
            .provider
            .create(&self.source)
            .map_err(|e| LifecycleError::provider("create", e));
        if created.is_ok() {
            record_snapshot_created();
        }

        debug!("starting containers: {}", self.containers.join(", "));
        if let Err(e) = runtime.start(&self.containers) {
            record_container_restart_failure();
            error!("failed to restart containers: {}", e);
            report.container_restart_error = Some(e.to_string());
        }
        created
    }

    fn backup_runtime(&self) -> Option<&Arc<dyn ContainerRuntime>> {
        self.runtime
            .as_ref()
            .filter(|_| !self.backup_containers.is_empty())
    }

    /// Backup agents go down (reverse order) before the snapshot is mounted.
    fn stop_backup_agents(&self) -> Result<(), LifecycleError> {
        let runtime = match self.backup_runtime() {
            Some(rt) => rt,
            None => return Ok(()),
        };
        debug!("stopping backup containers: {}", self.backup_containers.join(", "));
        if let Err(e) = runtime.stop(&self.backup_containers) {
            if let Err(se) = runtime.start(&self.backup_containers) {
                warn!("restarting backup containers after failed stop: {}", se);
            }
            return Err(LifecycleError::Container(format!("backup stop failed: {}", e)));
        }
        Ok(())
    }

    /// Called once the mount is gone (or never appeared); failure does not fail the run.
    fn start_backup_agents(&self, report: &mut RunReport) {
        let runtime = match self.backup_runtime() {
            Some(rt) => rt,
            None => return,
        };
        debug!("starting backup containers: {}", self.backup_containers.join(", "));
        if let Err(e) = runtime.start(&self.backup_containers) {
            record_container_restart_failure();
            error!("failed to restart backup containers: {}", e);
            report.backup_restart_error = Some(e.to_string());
        }
    }

    fn compensate(&self, handle: &SnapshotHandle) {
        match self.provider.delete(handle) {
            Ok(()) => {
                record_snapshot_compensation();
                record_snapshot_deleted();
                info!("compensation: deleted unmounted snapshot {}", handle.id);
            }
            Err(e) => {
                record_snapshot_delete_failure();
                warn!(
                    "compensating delete of {} failed, left to retention: {}",
                    handle.id, e
                );
            }
        }
    }

    fn abort(&self, guard: RunGuard<'_>, e: LifecycleError) -> LifecycleError {
        match &e {
            LifecycleError::Cancelled => {
                info!("run interrupted in {}", guard.phase());
                self.notifier.run_failed("interrupted");
            }
            _ => {
                record_run_failed();
                error!("run aborted in {}: {}", guard.phase(), e);
                self.notifier.run_failed(&e.to_string());
            }
        }
        guard.finish(Phase::Error);
        e
    }

    /// Delete every planned snapshot; one failure does not stop the rest.
    fn sweep(
        &self,
        plan: &RetentionPlan,
        deleted: &mut Vec<String>,
        failures: &mut Vec<(String, String)>,
    ) {
        for h in &plan.deferred {
            info!("snapshot {} is due for pruning but mounted; deferred", h.id);
        }
        // старые первыми
        for h in plan.prune.iter().rev() {
            debug!("pruning snapshot {}", h);
            match self.provider.delete(h) {
                Ok(()) => {
                    record_snapshot_deleted();
                    info!("pruned snapshot {}", h.id);
                    deleted.push(h.id.clone());
                }
                Err(e) => {
                    record_snapshot_delete_failure();
                    warn!("failed to prune snapshot {}: {}", h.id, e);
                    failures.push((h.id.clone(), e.to_string()));
                }
            }
        }
    }

    /// Retention sweep outside of a run. Anything mounted, by record or at
    /// the OS level, is excluded.
    pub fn prune(&self, state: &RunState, dry_run: bool) -> Result<PruneReport, LifecycleError> {
        let guard = state.begin()?;
        guard.enter(Phase::Pruning);
        let mounts = self.mounts();
        let listed = self
            .provider
            .list_existing()
            .map_err(|e| LifecycleError::provider("list_existing", e))
            .and_then(|existing| {
                let live = self
                    .provider
                    .list_mounts()
                    .map_err(|e| LifecycleError::provider("list_mounts", e))?;
                Ok((existing, live))
            });
        let (existing, live) = match listed {
            Ok(v) => v,
            Err(e) => {
                guard.finish(Phase::Error);
                return Err(e);
            }
        };

        let mut excluded = mounts.mounted_ids();
        excluded.extend(live.into_iter().map(|m| m.snapshot_id));
        let plan = retention::plan(&existing, &self.policy, &excluded, self.clock.now_unix_sec());

        let mut report = PruneReport {
            dry_run,
            ..PruneReport::default()
        };
        if dry_run {
            for h in plan.prune.iter().rev() {
                info!("would prune snapshot {}", h);
            }
        } else {
            self.sweep(&plan, &mut report.deleted, &mut report.failures);
        }
        report.plan = plan;
        drop(mounts);
        guard.finish(Phase::Idle);
        Ok(report)
    }

    /// Read-only view for `status`.
    pub fn status(&self) -> Result<StatusReport, LifecycleError> {
        let mounts = self.mounts();
        let existing = self
            .provider
            .list_existing()
            .map_err(|e| LifecycleError::provider("list_existing", e))?;
        let mounted: HashSet<String> = match self.provider.list_mounts() {
            Ok(v) => v.into_iter().map(|m| m.snapshot_id).collect(),
            Err(e) => return Err(LifecycleError::provider("list_mounts", e)),
        };
        let plan = retention::plan(
            &existing,
            &self.policy,
            &mounted,
            self.clock.now_unix_sec(),
        );
        let doomed: HashSet<&str> = plan.prune.iter().map(|h| h.id.as_str()).collect();

        let mut snapshots: Vec<SnapshotStatus> = existing
            .iter()
            .map(|h| SnapshotStatus {
                handle: h.clone(),
                mounted: mounted.contains(&h.id),
                would_prune: doomed.contains(h.id.as_str()),
            })
            .collect();
        snapshots.sort_by(|a, b| b.handle.age_key().cmp(&a.handle.age_key()));

        Ok(StatusReport {
            source: self.source.clone(),
            policy: self.policy.to_string(),
            snapshots,
            mounts: mounts.persisted_records()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::{NotifyCall, RecordingNotifier};
    use crate::provider::MemoryProvider;
    use crate::util::clock::ManualClock;
    use std::path::Path;

    const NOW: u64 = 1_760_659_200;

    struct Fixture {
        provider: Arc<MemoryProvider>,
        notifier: Arc<RecordingNotifier>,
        orch: Orchestrator,
    }

    fn fixture(policy: RetentionPolicy) -> Fixture {
        let clock = Arc::new(ManualClock::new(NOW));
        let provider = Arc::new(MemoryProvider::new(clock.clone()));
        let notifier = Arc::new(RecordingNotifier::new());
        let mounts = MountCoordinator::new(provider.clone(), Path::new("/mnt"));
        let orch = Orchestrator::new("/data", provider.clone(), mounts)
            .with_notifier(notifier.clone())
            .with_policy(policy)
            .with_clock(clock);
        orch.reconcile().unwrap();
        Fixture {
            provider,
            notifier,
            orch,
        }
    }

    #[test]
    fn cancelled_before_create_makes_nothing() {
        let f = fixture(RetentionPolicy::default());
        f.orch.cancel_token().cancel();
        let st = RunState::new();
        assert!(matches!(f.orch.run(&st), Err(LifecycleError::Cancelled)));
        assert_eq!(f.provider.calls().create, 0);
        assert!(!st.is_active());
        assert_eq!(st.last_outcome(), Some(Phase::Error));
        assert_eq!(
            f.notifier.calls(),
            vec![NotifyCall::Started, NotifyCall::Failed("interrupted".to_string())]
        );
    }

    #[test]
    fn create_failure_aborts_without_mount() {
        let f = fixture(RetentionPolicy::default());
        f.provider.fail_next_creates(1);
        let st = RunState::new();
        let err = f.orch.run(&st).unwrap_err();
        assert!(matches!(err, LifecycleError::Provider { op: "create", .. }));
        assert_eq!(f.provider.calls().mount, 0);
        assert!(f.notifier.notified_paths().is_empty());
        assert_eq!(st.last_outcome(), Some(Phase::Error));
    }

    #[test]
    fn lingering_record_is_retried_next_run() {
        let f = fixture(RetentionPolicy::default());
        let st = RunState::new();

        f.provider.fail_next_unmounts(1);
        let r1 = f.orch.run(&st).unwrap();
        assert!(r1.deferred_unmount);
        assert!(r1.succeeded());
        assert_eq!(f.orch.mount_records().len(), 1);

        let r2 = f.orch.run(&st).unwrap();
        assert!(r2.lingering.is_empty());
        assert!(!r2.deferred_unmount);
        assert!(f.orch.mount_records().is_empty());
        assert!(f.provider.mounted_paths().is_empty());
    }

    #[test]
    fn status_marks_mounted_and_doomed() {
        let f = fixture(RetentionPolicy::new(1, None, 1));
        f.provider.seed_snapshot("A", NOW - 200, "/data");
        f.provider.seed_snapshot("B", NOW - 100, "/data");
        f.provider.seed_snapshot("C", NOW - 50, "/data");
        f.provider.seed_mount("A", Path::new("/mnt/other"));

        let s = f.orch.status().unwrap();
        let ids: Vec<&str> = s.snapshots.iter().map(|x| x.handle.id.as_str()).collect();
        assert_eq!(ids, vec!["C", "B", "A"]);
        assert!(!s.snapshots[0].would_prune);
        assert!(s.snapshots[1].would_prune);
        assert!(s.snapshots[2].mounted && !s.snapshots[2].would_prune);
    }

    #[test]
    fn prune_dry_run_deletes_nothing() {
        let f = fixture(RetentionPolicy::new(1, None, 1));
        f.provider.seed_snapshot("A", NOW - 200, "/data");
        f.provider.seed_snapshot("B", NOW - 100, "/data");
        let st = RunState::new();

        let rep = f.orch.prune(&st, true).unwrap();
        assert_eq!(rep.plan.prune.len(), 1);
        assert!(rep.deleted.is_empty());
        assert_eq!(f.provider.calls().delete, 0);

        let rep = f.orch.prune(&st, false).unwrap();
        assert_eq!(rep.deleted, vec!["A".to_string()]);
        assert_eq!(f.provider.snapshot_ids(), vec!["B".to_string()]);
    }
}
