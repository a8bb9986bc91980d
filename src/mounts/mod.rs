//! Mount Coordinator: snapshot id -> mount point.
//!
//! Гарантии:
//! - не более одной MountRecord на снапшот;
//! - пути записей не пересекаются (ни равенства, ни вложенности);
//! - release_mount идемпотентен: нет записи -> no-op, provider не вызывается;
//! - до reconcile() новые mount не выдаются.
//!
//! Record store опционально персистится в <state_dir>/mounts.json,
//! чтобы перезапущенный процесс отличал свои "зависшие" mount от утечек.

pub mod store;

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, info, warn};

use crate::error::LifecycleError;
use crate::metrics::{
    record_mount_acquired, record_mount_release_failure, record_mount_released, record_reconcile,
    set_mounts_active,
};
use crate::provider::{mount_path_for, MountRecord, MountState, SnapshotHandle, SnapshotProvider};
use crate::util::clock::{Clock, SystemClock};

/// Outcome of startup reconciliation.
#[derive(Debug, Clone, Default)]
pub struct ReconcileReport {
    /// OS mounts matching a persisted record: kept.
    pub adopted: Vec<MountRecord>,
    /// OS mounts unknown to the store: unmounted.
    pub leaks_unmounted: Vec<PathBuf>,
    /// Persisted records with no OS mount: forgotten.
    pub stale_dropped: Vec<MountRecord>,
}

impl ReconcileReport {
    pub fn is_clean(&self) -> bool {
        self.leaks_unmounted.is_empty() && self.stale_dropped.is_empty()
    }
}

impl fmt::Display for ReconcileReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "adopted={} leaks_unmounted={} stale_dropped={}",
            self.adopted.len(),
            self.leaks_unmounted.len(),
            self.stale_dropped.len()
        )
    }
}

pub struct MountCoordinator {
    provider: Arc<dyn SnapshotProvider>,
    mount_root: PathBuf,
    store_path: Option<PathBuf>,
    clock: Arc<dyn Clock>,
    records: BTreeMap<String, MountRecord>,
    reconciled: bool,
}

impl MountCoordinator {
    pub fn new(provider: Arc<dyn SnapshotProvider>, mount_root: &Path) -> Self {
        Self {
            provider,
            mount_root: mount_root.to_path_buf(),
            store_path: None,
            clock: Arc::new(SystemClock),
            records: BTreeMap::new(),
            reconciled: false,
        }
    }

    /// Persist records to this file (see `store`).
    pub fn with_store(mut self, path: PathBuf) -> Self {
        self.store_path = Some(path);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn mount_root(&self) -> &Path {
        &self.mount_root
    }

    pub fn is_reconciled(&self) -> bool {
        self.reconciled
    }

    /// Records sorted by snapshot id.
    pub fn records(&self) -> Vec<MountRecord> {
        self.records.values().cloned().collect()
    }

    pub fn record_for(&self, snapshot_id: &str) -> Option<&MountRecord> {
        self.records.get(snapshot_id)
    }

    /// Snapshot ids referenced by a live record (excluded from pruning).
    pub fn mounted_ids(&self) -> HashSet<String> {
        self.records.keys().cloned().collect()
    }

    /// Records as persisted on disk (before reconcile) or held in memory.
    pub fn persisted_records(&self) -> Result<Vec<MountRecord>, LifecycleError> {
        match &self.store_path {
            Some(p) if !self.reconciled => Ok(store::load(p)?),
            _ => Ok(self.records()),
        }
    }

    pub fn mount_path(&self, snapshot_id: &str) -> PathBuf {
        mount_path_for(&self.mount_root, snapshot_id)
    }

    pub fn acquire_mount(&mut self, handle: &SnapshotHandle) -> Result<MountRecord, LifecycleError> {
        if !self.reconciled {
            return Err(LifecycleError::Reconciliation(
                "mount requested before the record store was reconciled".to_string(),
            ));
        }
        if self.records.contains_key(&handle.id) {
            return Err(LifecycleError::AlreadyMounted {
                snapshot_id: handle.id.clone(),
            });
        }

        let path = self.mount_path(&handle.id);
        if let Some(existing) = self
            .records
            .values()
            .find(|r| paths_overlap(&r.mount_path, &path))
        {
            return Err(LifecycleError::PathOverlap {
                path,
                existing: existing.mount_path.clone(),
            });
        }

        debug!("mounting snapshot {} at {}", handle.id, path.display());
        self.provider
            .mount(handle, &path)
            .map_err(|e| LifecycleError::provider("mount", e))?;

        let rec = MountRecord::new(&handle.id, &path, self.clock.now_unix_sec());
        self.records.insert(handle.id.clone(), rec.clone());
        self.persist_best_effort();
        record_mount_acquired();
        set_mounts_active(self.records.len() as u64);
        Ok(rec)
    }

    /// Idempotent: an already released record is a no-op.
    pub fn release_mount(&mut self, record: &MountRecord) -> Result<(), LifecycleError> {
        let path = match self.records.get_mut(&record.snapshot_id) {
            Some(r) => {
                r.state = MountState::Unmounting;
                r.mount_path.clone()
            }
            None => {
                debug!(
                    "release of {} ignored: no live record for snapshot {}",
                    record.mount_path.display(),
                    record.snapshot_id
                );
                return Ok(());
            }
        };

        debug!("unmounting {}", path.display());
        match self.provider.unmount(&path) {
            Ok(()) => {
                self.records.remove(&record.snapshot_id);
                self.persist_best_effort();
                record_mount_released();
                set_mounts_active(self.records.len() as u64);
                Ok(())
            }
            Err(e) => {
                if let Some(r) = self.records.get_mut(&record.snapshot_id) {
                    r.state = MountState::Mounted;
                }
                record_mount_release_failure();
                Err(LifecycleError::provider("unmount", e))
            }
        }
    }

    /// Retry every lingering record. Returns the ones that still failed.
    pub fn release_lingering(&mut self) -> Vec<(MountRecord, LifecycleError)> {
        let mut failed = Vec::new();
        for rec in self.records() {
            info!(
                "releasing lingering mount {} (snapshot {})",
                rec.mount_path.display(),
                rec.snapshot_id
            );
            if let Err(e) = self.release_mount(&rec) {
                warn!("lingering mount {} still busy: {}", rec.mount_path.display(), e);
                failed.push((rec, e));
            }
        }
        failed
    }

    /// Diff persisted records against OS reality.
    ///
    /// Any OS mount under mount_root must belong to a snapshot the provider
    /// still lists; otherwise the topology is unknown and we refuse to go on.
    pub fn reconcile(&mut self) -> Result<ReconcileReport, LifecycleError> {
        let known: HashSet<String> = self
            .provider
            .list_existing()
            .map_err(|e| LifecycleError::provider("list_existing", e))?
            .into_iter()
            .map(|h| h.id)
            .collect();
        let live = self
            .provider
            .list_mounts()
            .map_err(|e| LifecycleError::provider("list_mounts", e))?;

        let stored: BTreeMap<String, MountRecord> = match &self.store_path {
            Some(p) => store::load(p)
                .map_err(|e| {
                    LifecycleError::Reconciliation(format!("mount record store unreadable: {:#}", e))
                })?
                .into_iter()
                .map(|r| (r.snapshot_id.clone(), r))
                .collect(),
            None => self.records.clone(),
        };

        // Сначала проверка, потом действия: при неизвестной топологии ничего не трогаем.
        if let Some(orphan) = live.iter().find(|m| !known.contains(&m.snapshot_id)) {
            return Err(LifecycleError::Reconciliation(format!(
                "mount {} (source '{}') matches no known snapshot",
                orphan.mount_path.display(),
                orphan.snapshot_id
            )));
        }

        let mut report = ReconcileReport::default();
        let mut kept: BTreeMap<String, MountRecord> = BTreeMap::new();

        for m in live {
            match stored.get(&m.snapshot_id) {
                Some(r) if r.mount_path == m.mount_path && !kept.contains_key(&r.snapshot_id) => {
                    let mut r = r.clone();
                    r.state = MountState::Mounted;
                    info!(
                        "adopting mount {} (snapshot {})",
                        r.mount_path.display(),
                        r.snapshot_id
                    );
                    report.adopted.push(r.clone());
                    kept.insert(r.snapshot_id.clone(), r);
                }
                _ => {
                    info!(
                        "unmounting leaked mount {} (snapshot {})",
                        m.mount_path.display(),
                        m.snapshot_id
                    );
                    self.provider.unmount(&m.mount_path).map_err(|e| {
                        LifecycleError::Reconciliation(format!(
                            "could not unmount leaked mount {}: {}",
                            m.mount_path.display(),
                            e
                        ))
                    })?;
                    report.leaks_unmounted.push(m.mount_path);
                }
            }
        }

        for (id, r) in stored {
            if !kept.contains_key(&id) {
                info!(
                    "dropping stale record {} (snapshot {}): not mounted",
                    r.mount_path.display(),
                    id
                );
                report.stale_dropped.push(r);
            }
        }

        self.records = kept;
        self.persist()?;
        self.reconciled = true;

        record_reconcile(
            report.leaks_unmounted.len() as u64,
            report.stale_dropped.len() as u64,
        );
        set_mounts_active(self.records.len() as u64);
        Ok(report)
    }

    fn persist(&self) -> Result<(), LifecycleError> {
        if let Some(p) = &self.store_path {
            let recs: Vec<MountRecord> = self.records.values().cloned().collect();
            store::save(p, &recs)?;
        }
        Ok(())
    }

    // In-memory records stay authoritative; a missed write is repaired by the
    // next successful persist or by reconciliation after a restart.
    fn persist_best_effort(&self) {
        if let Err(e) = self.persist() {
            warn!("failed to persist mount records: {:#}", e);
        }
    }
}

/// Equal paths or one nested under the other.
pub fn paths_overlap(a: &Path, b: &Path) -> bool {
    a.starts_with(b) || b.starts_with(a)
}
