//! Snapshot provider adapter: capability interface around OS/volume-specific
//! create/delete/mount/unmount primitives.
//!
//! Submodules:
//! - zfs.rs:    ZfsProvider (zfs/mount/umount через CommandRunner).
//! - memory.rs: MemoryProvider (in-process, с инъекцией отказов): тесты и dry-run.
//! - runner.rs: CommandRunner seam (SystemRunner / ScriptedRunner).
//!
//! Каждый вызов неатомарен относительно состояния ОС: после падения процесса
//! частичный результат виден через list_existing()/list_mounts(), которые
//! используются для reconciliation на старте.

pub mod memory;
pub mod runner;
pub mod zfs;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::consts::MOUNT_DIR_PREFIX;

pub use memory::MemoryProvider;
pub use runner::{CommandOutput, CommandRunner, ScriptedRunner, SystemRunner};
pub use zfs::ZfsProvider;

/// One snapshot instance. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SnapshotHandle {
    /// Provider-assigned, timestamp-derived id (e.g. "1760659200" or "1760659200-1").
    pub id: String,
    /// Unix seconds.
    pub created_unix: u64,
    /// Source volume/dataset/path the snapshot was taken from.
    pub source: String,
    /// Provider-specific reference (e.g. "tank/apps@backup-1760659200").
    pub reference: String,
}

impl SnapshotHandle {
    /// Creation-order key: newer sorts greater. On equal timestamps the
    /// collision counter decides ("T-2" < "T-10"); ids without a numeric
    /// `-<n>` suffix compare by the whole string.
    pub fn age_key(&self) -> (u64, &str, u64) {
        let (base, seq) = split_id_suffix(&self.id);
        (self.created_unix, base, seq)
    }
}

/// "1760659200-3" -> ("1760659200", 3); "1760659200" -> ("1760659200", 0).
fn split_id_suffix(id: &str) -> (&str, u64) {
    if let Some((base, n)) = id.rsplit_once('-') {
        if !base.is_empty() && !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()) {
            if let Ok(seq) = n.parse::<u64>() {
                return (base, seq);
            }
        }
    }
    (id, 0)
}

impl fmt::Display for SnapshotHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.id, self.reference)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MountState {
    Mounted,
    Unmounting,
    Unmounted,
}

impl fmt::Display for MountState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MountState::Mounted => "mounted",
            MountState::Unmounting => "unmounting",
            MountState::Unmounted => "unmounted",
        };
        f.write_str(s)
    }
}

/// An active mount of one snapshot. References the snapshot by id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountRecord {
    pub snapshot_id: String,
    pub mount_path: PathBuf,
    pub mounted_unix: u64,
    pub state: MountState,
}

impl MountRecord {
    pub fn new(snapshot_id: &str, mount_path: &Path, mounted_unix: u64) -> Self {
        Self {
            snapshot_id: snapshot_id.to_string(),
            mount_path: mount_path.to_path_buf(),
            mounted_unix,
            state: MountState::Mounted,
        }
    }
}

/// Mount path for a snapshot below `mount_root`: `<mount_root>/snap-<id>`.
/// Общий для всех провайдеров и для MountCoordinator.
pub fn mount_path_for(mount_root: &Path, snapshot_id: &str) -> PathBuf {
    mount_root.join(format!("{}{}", MOUNT_DIR_PREFIX, snapshot_id))
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("`{cmd}` exited with {status}: {stderr}")]
    Command {
        cmd: String,
        status: String,
        stderr: String,
    },

    #[error("{op}: {source}")]
    Io {
        op: String,
        #[source]
        source: std::io::Error,
    },

    #[error("unexpected output from {what}: {detail}")]
    Parse { what: String, detail: String },

    #[error("snapshot '{0}' not found")]
    NotFound(String),

    #[error("{0}")]
    Injected(String),
}

impl ProviderError {
    pub fn io(op: impl Into<String>, source: std::io::Error) -> Self {
        ProviderError::Io {
            op: op.into(),
            source,
        }
    }
}

/// Fixed capability interface. Any snapshot technology implements this and is
/// selected at configuration time. All calls are blocking.
pub trait SnapshotProvider: Send + Sync {
    /// Short provider name for logs/status.
    fn name(&self) -> &'static str;

    fn create(&self, source: &str) -> Result<SnapshotHandle, ProviderError>;

    fn delete(&self, handle: &SnapshotHandle) -> Result<(), ProviderError>;

    fn mount(&self, handle: &SnapshotHandle, target: &Path) -> Result<(), ProviderError>;

    fn unmount(&self, target: &Path) -> Result<(), ProviderError>;

    /// Snapshots managed by this provider, any order.
    fn list_existing(&self) -> Result<Vec<SnapshotHandle>, ProviderError>;

    /// Mounts visible at the OS level below the provider's mount root.
    fn list_mounts(&self) -> Result<Vec<MountRecord>, ProviderError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn h(id: &str, ts: u64) -> SnapshotHandle {
        SnapshotHandle {
            id: id.to_string(),
            created_unix: ts,
            source: "tank/apps".to_string(),
            reference: format!("tank/apps@backup-{id}"),
        }
    }

    #[test]
    fn age_key_breaks_ties_by_id() {
        let a = h("100", 100);
        let b = h("100-1", 100);
        let c = h("099", 101);
        assert!(a.age_key() < b.age_key(), "lower id is older on equal timestamps");
        assert!(b.age_key() < c.age_key());
    }

    #[test]
    fn age_key_orders_collision_counter_numerically() {
        let two = h("1000-2", 1000);
        let ten = h("1000-10", 1000);
        assert!(two.age_key() < ten.age_key(), "T-10 is newer than T-2");
        assert!(h("1000", 1000).age_key() < h("1000-1", 1000).age_key());
        // не наш формат: сравнение строкой
        assert!(h("nightly-a", 1000).age_key() < h("nightly-b", 1000).age_key());
    }

    #[test]
    fn mount_path_layout() {
        assert_eq!(
            mount_path_for(Path::new("/mnt"), "S1"),
            PathBuf::from("/mnt/snap-S1")
        );
        assert_eq!(
            mount_path_for(Path::new("/mnt/backup"), "1760659200-2"),
            PathBuf::from("/mnt/backup/snap-1760659200-2")
        );
    }

    #[test]
    fn provider_error_messages() {
        let e = ProviderError::Command {
            cmd: "zfs destroy -r tank@x".into(),
            status: "exit status: 1".into(),
            stderr: "dataset is busy".into(),
        };
        assert_eq!(
            e.to_string(),
            "`zfs destroy -r tank@x` exited with exit status: 1: dataset is busy"
        );
        assert_eq!(ProviderError::NotFound("7".into()).to_string(), "snapshot '7' not found");
    }
}
