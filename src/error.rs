//! Error kinds of the lifecycle core.
//!
//! Политика распространения:
//! - Provider при create/mount: прогон прерывается (с компенсацией);
//! - Provider при unmount/delete: логируется и откладывается, прогон не блокирует;
//! - Notifier: результат прогона, без отката снапшота/mount;
//! - Busy: не ошибка, пропущенный цикл;
//! - Reconciliation на старте: фатально.

use std::path::PathBuf;

use thiserror::Error;

use crate::notify::NotifyError;
use crate::provider::ProviderError;

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("provider {op} failed: {source}")]
    Provider {
        op: &'static str,
        #[source]
        source: ProviderError,
    },

    #[error("snapshot '{snapshot_id}' is already mounted")]
    AlreadyMounted { snapshot_id: String },

    #[error("mount path {} overlaps existing mount {}", .path.display(), .existing.display())]
    PathOverlap { path: PathBuf, existing: PathBuf },

    #[error("another run is already active")]
    Busy,

    #[error("backup notification failed: {0}")]
    Notifier(#[from] NotifyError),

    #[error("reconciliation failed: {0}")]
    Reconciliation(String),

    #[error("run cancelled before snapshot creation")]
    Cancelled,

    #[error("container runtime: {0}")]
    Container(String),

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

impl LifecycleError {
    pub fn provider(op: &'static str, source: ProviderError) -> Self {
        LifecycleError::Provider { op, source }
    }

    /// Busy is an expected scheduling outcome, not a failure.
    pub fn is_busy(&self) -> bool {
        matches!(self, LifecycleError::Busy)
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, LifecycleError::Reconciliation(_))
    }
}
