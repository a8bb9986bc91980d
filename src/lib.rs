//! snapwarden: периодические снапшоты хранилища приложения,
//! монтирование снапшота read-only и передача его внешнему backup-агенту.
//!
//! Раскладка (снизу вверх):
//! - provider:     capability-интерфейс create/delete/mount/unmount/list* (zfs, memory)
//! - retention:    чистая логика выбора снапшотов на удаление
//! - mounts:       MountCoordinator + persisted record store (mounts.json)
//! - orchestrator: state machine одного прогона + RunState
//! - scheduler:    периодический запуск, CancelToken
//! - notify/quiesce: внешние коллабораторы (monitor URL, docker)

// Базовые модули
pub mod consts;
pub mod config;
pub mod error;
pub mod lock;
pub mod metrics;
pub mod util;

// Ядро
pub mod provider;
pub mod retention;
pub mod mounts;
pub mod orchestrator;
pub mod scheduler;

// Внешние коллабораторы
pub mod notify;
pub mod quiesce;
pub mod exporter;

// Удобные реэкспорты
pub use config::SnapConfig;
pub use error::LifecycleError;
pub use mounts::MountCoordinator;
pub use orchestrator::{Orchestrator, Phase, RunReport, RunState};
pub use provider::{MountRecord, MountState, ProviderError, SnapshotHandle, SnapshotProvider};
pub use retention::{select_for_pruning, RetentionPolicy};
pub use scheduler::{CancelToken, Scheduler};
pub use util::clock::{Clock, ManualClock, SystemClock};
