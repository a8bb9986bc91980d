//! Instance lock: one mutating snapwarden process per state dir.
//!
//! Cross-platform (fs2) advisory lock on `<state_dir>/LOCK`.
//! Держат: daemon (всё время жизни), one-shot run/reconcile/prune.
//! Lock is released on Drop.

use anyhow::{anyhow, Context, Result};
use fs2::FileExt;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};

use crate::consts::LOCK_FILE;

pub struct InstanceLock {
    file: std::fs::File,
    path: PathBuf,
}

impl InstanceLock {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        // ошибки unlock при drop игнорируем
        let _ = self.file.unlock();
    }
}

fn lock_file_path(state_dir: &Path) -> PathBuf {
    state_dir.join(LOCK_FILE)
}

fn open_lock_file(state_dir: &Path) -> Result<std::fs::File> {
    fs::create_dir_all(state_dir)
        .with_context(|| format!("create state dir {}", state_dir.display()))?;
    let path = lock_file_path(state_dir);
    OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(&path)
        .with_context(|| format!("open lock file {}", path.display()))
}

/// Try to take the exclusive instance lock.
/// Ok(None) if another process holds it; Err only on I/O problems.
pub fn try_acquire_instance_lock(state_dir: &Path) -> Result<Option<InstanceLock>> {
    let file = open_lock_file(state_dir)?;
    let path = lock_file_path(state_dir);
    match file.try_lock_exclusive() {
        Ok(()) => Ok(Some(InstanceLock { file, path })),
        Err(e) if e.kind() == fs2::lock_contended_error().kind() => Ok(None),
        Err(e) => Err(anyhow!("try_lock_exclusive {}: {}", path.display(), e)),
    }
}

/// Blocking variant (waits for the other process to finish).
pub fn acquire_instance_lock(state_dir: &Path) -> Result<InstanceLock> {
    let file = open_lock_file(state_dir)?;
    let path = lock_file_path(state_dir);
    file.lock_exclusive()
        .with_context(|| format!("lock_exclusive {}", path.display()))?;
    Ok(InstanceLock { file, path })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tmp(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("snapwarden-lock-{}-{}", name, std::process::id()))
    }

    #[test]
    fn second_try_fails_until_drop() {
        let dir = tmp("excl");
        let first = try_acquire_instance_lock(&dir).unwrap().unwrap();
        assert_eq!(first.path(), dir.join("LOCK"));
        assert!(try_acquire_instance_lock(&dir).unwrap().is_none());
        drop(first);
        let again = try_acquire_instance_lock(&dir).unwrap().unwrap();
        drop(again);
        let blocking = acquire_instance_lock(&dir).unwrap();
        drop(blocking);
        let _ = fs::remove_dir_all(&dir);
    }
}
