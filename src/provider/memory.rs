//! In-process provider with failure injection.
//!
//! Поведение повторяет ZFS там, где это важно для инвариантов:
//! - delete смонтированного снапшота отклоняется ("busy");
//! - повторный mount в занятую точку отклоняется;
//! - unmount несмонтированного пути: no-op.
//!
//! MountGate позволяет "подвесить" прогон внутри mount (тесты на перекрытие прогонов).

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use super::{MountRecord, ProviderError, SnapshotHandle, SnapshotProvider};
use crate::util::clock::{Clock, SystemClock};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CallCounts {
    pub create: u64,
    pub delete: u64,
    pub mount: u64,
    pub unmount: u64,
}

#[derive(Default)]
struct Inner {
    snapshots: BTreeMap<String, SnapshotHandle>,
    mounts: BTreeMap<PathBuf, MountRecord>,
    fail_creates: u32,
    fail_mounts: u32,
    fail_unmounts: u32,
    fail_unmount_paths: HashSet<PathBuf>,
    fail_delete_ids: HashSet<String>,
    calls: CallCounts,
}

pub struct MemoryProvider {
    inner: Mutex<Inner>,
    clock: Arc<dyn Clock>,
    gate: Mutex<Option<Arc<MountGate>>>,
}

impl Default for MemoryProvider {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

impl MemoryProvider {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            clock,
            gate: Mutex::new(None),
        }
    }

    /// Pre-existing snapshot (as if created by an earlier process).
    pub fn seed_snapshot(&self, id: &str, created_unix: u64, source: &str) -> SnapshotHandle {
        let h = SnapshotHandle {
            id: id.to_string(),
            created_unix,
            source: source.to_string(),
            reference: format!("{}@mem-{}", source, id),
        };
        self.state().snapshots.insert(h.id.clone(), h.clone());
        h
    }

    /// Pre-existing OS-level mount (leftover from a crashed run).
    pub fn seed_mount(&self, snapshot_id: &str, path: &Path) {
        self.state()
            .mounts
            .insert(path.to_path_buf(), MountRecord::new(snapshot_id, path, 0));
    }

    pub fn fail_next_creates(&self, n: u32) {
        self.state().fail_creates = n;
    }

    pub fn fail_next_mounts(&self, n: u32) {
        self.state().fail_mounts = n;
    }

    pub fn fail_next_unmounts(&self, n: u32) {
        self.state().fail_unmounts = n;
    }

    /// Unmount of this path fails until `clear_failures`.
    pub fn fail_unmount_of(&self, path: &Path) {
        self.state().fail_unmount_paths.insert(path.to_path_buf());
    }

    /// Delete of this snapshot fails until `clear_failures`.
    pub fn fail_delete_of(&self, id: &str) {
        self.state().fail_delete_ids.insert(id.to_string());
    }

    pub fn clear_failures(&self) {
        let mut g = self.state();
        g.fail_creates = 0;
        g.fail_mounts = 0;
        g.fail_unmounts = 0;
        g.fail_unmount_paths.clear();
        g.fail_delete_ids.clear();
    }

    /// Block inside the next mount calls until the gate is opened.
    pub fn set_mount_gate(&self, gate: Arc<MountGate>) {
        *self.gate.lock().unwrap_or_else(PoisonError::into_inner) = Some(gate);
    }

    pub fn snapshot_ids(&self) -> Vec<String> {
        self.state().snapshots.keys().cloned().collect()
    }

    pub fn mounted_paths(&self) -> Vec<PathBuf> {
        self.state().mounts.keys().cloned().collect()
    }

    pub fn calls(&self) -> CallCounts {
        self.state().calls
    }

    fn state(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl SnapshotProvider for MemoryProvider {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn create(&self, source: &str) -> Result<SnapshotHandle, ProviderError> {
        let ts = self.clock.now_unix_sec();
        let mut g = self.state();
        g.calls.create += 1;
        if g.fail_creates > 0 {
            g.fail_creates -= 1;
            return Err(ProviderError::Injected(format!("create {}: injected failure", source)));
        }
        let mut id = ts.to_string();
        let mut n = 1;
        while g.snapshots.contains_key(&id) {
            id = format!("{}-{}", ts, n);
            n += 1;
        }
        let h = SnapshotHandle {
            id: id.clone(),
            created_unix: ts,
            source: source.to_string(),
            reference: format!("{}@mem-{}", source, id),
        };
        g.snapshots.insert(id, h.clone());
        Ok(h)
    }

    fn delete(&self, handle: &SnapshotHandle) -> Result<(), ProviderError> {
        let mut g = self.state();
        g.calls.delete += 1;
        if g.fail_delete_ids.contains(&handle.id) {
            return Err(ProviderError::Injected(format!(
                "delete {}: injected failure",
                handle.id
            )));
        }
        if g.mounts.values().any(|m| m.snapshot_id == handle.id) {
            return Err(ProviderError::Injected(format!(
                "delete {}: snapshot is busy (mounted)",
                handle.id
            )));
        }
        match g.snapshots.remove(&handle.id) {
            Some(_) => Ok(()),
            None => Err(ProviderError::NotFound(handle.id.clone())),
        }
    }

    fn mount(&self, handle: &SnapshotHandle, target: &Path) -> Result<(), ProviderError> {
        // gate ждём без удержания inner, иначе параллельный прогон не сможет даже прочитать состояние
        let gate = self.gate.lock().unwrap_or_else(PoisonError::into_inner).clone();
        if let Some(gate) = gate {
            gate.enter_and_wait();
        }

        let now = self.clock.now_unix_sec();
        let mut g = self.state();
        g.calls.mount += 1;
        if g.fail_mounts > 0 {
            g.fail_mounts -= 1;
            return Err(ProviderError::Injected(format!(
                "mount {} at {}: injected failure",
                handle.id,
                target.display()
            )));
        }
        if !g.snapshots.contains_key(&handle.id) {
            return Err(ProviderError::NotFound(handle.id.clone()));
        }
        if g.mounts.contains_key(target) {
            return Err(ProviderError::Injected(format!(
                "mount {}: target busy",
                target.display()
            )));
        }
        g.mounts
            .insert(target.to_path_buf(), MountRecord::new(&handle.id, target, now));
        Ok(())
    }

    fn unmount(&self, target: &Path) -> Result<(), ProviderError> {
        let mut g = self.state();
        g.calls.unmount += 1;
        if g.fail_unmounts > 0 {
            g.fail_unmounts -= 1;
            return Err(ProviderError::Injected(format!(
                "umount {}: injected failure",
                target.display()
            )));
        }
        if g.fail_unmount_paths.contains(target) {
            return Err(ProviderError::Injected(format!(
                "umount {}: target is busy",
                target.display()
            )));
        }
        g.mounts.remove(target);
        Ok(())
    }

    fn list_existing(&self) -> Result<Vec<SnapshotHandle>, ProviderError> {
        Ok(self.state().snapshots.values().cloned().collect())
    }

    fn list_mounts(&self) -> Result<Vec<MountRecord>, ProviderError> {
        Ok(self.state().mounts.values().cloned().collect())
    }
}

/// Блокирует mount до open(); entered() сигналит, что прогон уже внутри mount.
#[derive(Default)]
pub struct MountGate {
    state: Mutex<(bool, bool)>, // (entered, open)
    cv: Condvar,
}

impl MountGate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn enter_and_wait(&self) {
        let mut g = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        g.0 = true;
        self.cv.notify_all();
        while !g.1 {
            g = self.cv.wait(g).unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Wait until some caller is blocked inside mount.
    pub fn wait_entered(&self) {
        let mut g = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        while !g.0 {
            g = self.cv.wait(g).unwrap_or_else(PoisonError::into_inner);
        }
    }

    pub fn open(&self) {
        let mut g = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        g.1 = true;
        self.cv.notify_all();
    }
}
