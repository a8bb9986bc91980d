//! Backup notifier: hand-off of a mounted snapshot to the external backup agent.
//!
//! - UptimeKumaNotifier: GET `<url>?status=up&msg=...`, ответ `{"ok": true}`.
//!   Таймаут на весь запрос; истечение -> NotifyError::Timeout.
//! - NoopNotifier: monitor URL не задан: hand-off считается успешным.
//! - RecordingNotifier: запись вызовов + управляемый отказ (тесты).
//!
//! Ретраев здесь нет: один вызов, один исход.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result};
use log::{debug, error};
use serde::Deserialize;
use thiserror::Error;

use crate::provider::SnapshotHandle;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("request failed: {0}")]
    Transport(String),

    #[error("no response within {0:?}")]
    Timeout(Duration),

    #[error("unexpected HTTP status {0}")]
    Status(u16),

    #[error("could not decode response: {0}")]
    BadResponse(String),

    #[error("monitor rejected the notification: {0}")]
    Rejected(String),
}

pub trait BackupNotifier: Send + Sync {
    /// Hand the mounted snapshot off. Exactly one attempt.
    fn notify(&self, snapshot: &SnapshotHandle, mount_path: &Path) -> Result<(), NotifyError>;

    /// Best-effort "run started" signal.
    fn run_started(&self) {}

    /// Best-effort "run failed" signal.
    fn run_failed(&self, _message: &str) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNotifier;

impl BackupNotifier for NoopNotifier {
    fn notify(&self, snapshot: &SnapshotHandle, mount_path: &Path) -> Result<(), NotifyError> {
        debug!(
            "no monitor configured; snapshot {} left at {}",
            snapshot.id,
            mount_path.display()
        );
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct MonitorResponse {
    ok: bool,
    #[serde(default)]
    msg: Option<String>,
}

pub struct UptimeKumaNotifier {
    url: String,
    timeout: Duration,
    client: reqwest::blocking::Client,
}

impl UptimeKumaNotifier {
    pub fn new(url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .context("build HTTP client")?;
        Ok(Self {
            url: url.to_string(),
            timeout,
            client,
        })
    }

    fn classify(&self, e: reqwest::Error) -> NotifyError {
        if e.is_timeout() {
            NotifyError::Timeout(self.timeout)
        } else if e.is_decode() {
            NotifyError::BadResponse(e.to_string())
        } else {
            NotifyError::Transport(e.to_string())
        }
    }

    pub fn send(&self, status: &str, msg: &str) -> Result<(), NotifyError> {
        debug!("sending notification status=\"{}\" msg=\"{}\"", status, msg);
        let resp = self
            .client
            .get(&self.url)
            .query(&[("status", status), ("msg", msg)])
            .send()
            .map_err(|e| self.classify(e))?;

        let code = resp.status();
        if !code.is_success() {
            return Err(NotifyError::Status(code.as_u16()));
        }
        let body: MonitorResponse = resp.json().map_err(|e| self.classify(e))?;
        if !body.ok {
            return Err(NotifyError::Rejected(
                body.msg.unwrap_or_else(|| "ok=false".to_string()),
            ));
        }
        Ok(())
    }
}

impl BackupNotifier for UptimeKumaNotifier {
    fn notify(&self, snapshot: &SnapshotHandle, mount_path: &Path) -> Result<(), NotifyError> {
        let msg = format!("snapshot {} mounted at {}", snapshot.id, mount_path.display());
        self.send("up", &msg)
    }

    fn run_started(&self) {
        if let Err(e) = self.send("up", "start") {
            error!("failed to send start notification: {}", e);
        }
    }

    fn run_failed(&self, message: &str) {
        if let Err(e) = self.send("down", message) {
            error!("failed to send failure notification \"{}\": {}", message, e);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotifyCall {
    Notify { snapshot_id: String, mount_path: PathBuf },
    Started,
    Failed(String),
}

/// Records every call; `notify` fails while `set_failing(true)`.
#[derive(Default)]
pub struct RecordingNotifier {
    calls: Mutex<Vec<NotifyCall>>,
    failing: Mutex<bool>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, on: bool) {
        *self.failing.lock().unwrap_or_else(PoisonError::into_inner) = on;
    }

    pub fn calls(&self) -> Vec<NotifyCall> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn notified_paths(&self) -> Vec<PathBuf> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                NotifyCall::Notify { mount_path, .. } => Some(mount_path),
                _ => None,
            })
            .collect()
    }
}

impl BackupNotifier for RecordingNotifier {
    fn notify(&self, snapshot: &SnapshotHandle, mount_path: &Path) -> Result<(), NotifyError> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(NotifyCall::Notify {
                snapshot_id: snapshot.id.clone(),
                mount_path: mount_path.to_path_buf(),
            });
        if *self.failing.lock().unwrap_or_else(PoisonError::into_inner) {
            return Err(NotifyError::Transport("connection refused".to_string()));
        }
        Ok(())
    }

    fn run_started(&self) {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(NotifyCall::Started);
    }

    fn run_failed(&self, message: &str) {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(NotifyCall::Failed(message.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snap() -> SnapshotHandle {
        SnapshotHandle {
            id: "S1".into(),
            created_unix: 1,
            source: "/data".into(),
            reference: "/data@S1".into(),
        }
    }

    #[test]
    fn recording_notifier_fails_on_demand() {
        let n = RecordingNotifier::new();
        assert!(n.notify(&snap(), Path::new("/mnt/snap-S1")).is_ok());
        n.set_failing(true);
        assert!(n.notify(&snap(), Path::new("/mnt/snap-S1")).is_err());
        n.run_failed("boom");
        assert_eq!(n.notified_paths().len(), 2);
        assert_eq!(n.calls().last(), Some(&NotifyCall::Failed("boom".into())));
    }

    #[test]
    fn noop_always_succeeds() {
        assert!(NoopNotifier.notify(&snap(), Path::new("/x")).is_ok());
    }

    #[test]
    fn monitor_response_parsing() {
        let r: MonitorResponse = serde_json::from_str(r#"{"ok":false,"msg":"no such push token"}"#).unwrap();
        assert!(!r.ok);
        assert_eq!(r.msg.as_deref(), Some("no such push token"));
        let r: MonitorResponse = serde_json::from_str(r#"{"ok":true}"#).unwrap();
        assert!(r.ok && r.msg.is_none());
    }
}
