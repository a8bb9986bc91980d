//! Centralized configuration for snapwarden.
//!
//! Источники (по возрастанию приоритета):
//! 1. встроенные дефолты (consts);
//! 2. TOML-файл (`-c`, по умолчанию config.toml);
//! 3. переменные окружения SNAPWARDEN_*;
//! 4. флаги CLI (через with_* в бинаре).
//!
//! Пример файла:
//! ```toml
//! source = "tank/apps"
//! mount-root = "/mnt/snapwarden"
//! interval = "1d"
//! children = ["postgres", "media"]
//! containers = ["db", "web"]
//! backup-containers = ["restic"]
//! monitor-url = "https://kuma.example.org/api/push/abc"
//!
//! [retention]
//! max-count = 14
//! max-age = "30d"
//! min-count = 1
//! ```
//!
//! Длительности: `<n>{s,m,h,d,w}` или целое число секунд.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use log::warn;
use serde::Deserialize;

use crate::consts::{
    DEFAULT_INTERVAL_SECS, DEFAULT_MOUNT_ROOT, DEFAULT_NOTIFY_TIMEOUT_SECS,
    DEFAULT_SNAPSHOT_PREFIX, DEFAULT_STATE_DIR, ENV_PREFIX,
};
use crate::retention::RetentionPolicy;
use crate::util::{format_duration, parse_bool, parse_duration};

#[derive(Clone, Debug, PartialEq)]
pub struct SnapConfig {
    /// Dataset (or path) to snapshot.
    /// Env: SNAPWARDEN_SOURCE
    pub source: String,

    /// Snapshots are mounted at <mount_root>/snap-<id>.
    /// Env: SNAPWARDEN_MOUNT_ROOT (default /mnt/snapwarden)
    pub mount_root: PathBuf,

    /// Mount record store and instance lock live here.
    /// Env: SNAPWARDEN_STATE_DIR (default /var/lib/snapwarden)
    pub state_dir: PathBuf,

    /// Env: SNAPWARDEN_INTERVAL (default 1d)
    pub interval: Duration,

    /// ZFS snapshot name prefix: <source>@<prefix>-<id>.
    /// Env: SNAPWARDEN_SNAPSHOT_PREFIX (default "backup")
    pub snapshot_prefix: String,

    /// Child datasets mounted under the snapshot mount.
    /// Env: SNAPWARDEN_CHILDREN = "a,b,c"
    pub children: Vec<String>,

    /// Application containers stopped around snapshot creation (declared order).
    /// Env: SNAPWARDEN_CONTAINERS = "db,web"
    pub containers: Vec<String>,

    /// Backup-agent containers stopped while the snapshot mount exists.
    /// Env: SNAPWARDEN_BACKUP_CONTAINERS = "restic,rclone"
    pub backup_containers: Vec<String>,

    /// Monitor push URL; None -> no notifications.
    /// Env: SNAPWARDEN_MONITOR_URL
    pub monitor_url: Option<String>,

    /// Env: SNAPWARDEN_NOTIFY_TIMEOUT (default 20s)
    pub notify_timeout: Duration,

    /// Daemon fires the first run immediately.
    /// Env: SNAPWARDEN_RUN_ON_START (default true)
    pub run_on_start: bool,

    /// Prometheus exporter bind address (daemon only).
    /// Env: SNAPWARDEN_METRICS_ADDR = "127.0.0.1:9187"
    pub metrics_addr: Option<String>,

    /// Env: SNAPWARDEN_RETENTION_MAX_COUNT / _MAX_AGE / _MIN_COUNT
    pub retention: RetentionPolicy,
}

impl Default for SnapConfig {
    fn default() -> Self {
        Self {
            source: String::new(),
            mount_root: PathBuf::from(DEFAULT_MOUNT_ROOT),
            state_dir: PathBuf::from(DEFAULT_STATE_DIR),
            interval: Duration::from_secs(DEFAULT_INTERVAL_SECS),
            snapshot_prefix: DEFAULT_SNAPSHOT_PREFIX.to_string(),
            children: Vec::new(),
            containers: Vec::new(),
            backup_containers: Vec::new(),
            monitor_url: None,
            notify_timeout: Duration::from_secs(DEFAULT_NOTIFY_TIMEOUT_SECS),
            run_on_start: true,
            metrics_addr: None,
            retention: RetentionPolicy::default(),
        }
    }
}

/// Duration in TOML: "7d" or a plain number of seconds.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum DurationValue {
    Secs(u64),
    Text(String),
}

impl DurationValue {
    fn resolve(&self, key: &str) -> Result<Duration> {
        match self {
            DurationValue::Secs(n) => Ok(Duration::from_secs(*n)),
            DurationValue::Text(s) => parse_duration(s).with_context(|| format!("config key '{}'", key)),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct FileRetention {
    max_count: Option<usize>,
    max_age: Option<DurationValue>,
    min_count: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct FileConfig {
    source: Option<String>,
    mount_root: Option<PathBuf>,
    state_dir: Option<PathBuf>,
    interval: Option<DurationValue>,
    snapshot_prefix: Option<String>,
    children: Option<Vec<String>>,
    containers: Option<Vec<String>>,
    backup_containers: Option<Vec<String>>,
    monitor_url: Option<String>,
    notify_timeout: Option<DurationValue>,
    run_on_start: Option<bool>,
    metrics_addr: Option<String>,
    retention: Option<FileRetention>,
}

fn split_list(s: &str) -> Vec<String> {
    s.split(',')
        .map(str::trim)
        .filter(|x| !x.is_empty())
        .map(str::to_string)
        .collect()
}

fn non_empty(s: String) -> Option<String> {
    let t = s.trim();
    if t.is_empty() {
        None
    } else {
        Some(t.to_string())
    }
}

impl SnapConfig {
    /// Defaults overlaid with SNAPWARDEN_* environment variables.
    pub fn from_env() -> Self {
        Self::default().apply_env()
    }

    /// Full stack: defaults -> file (if present) -> env.
    /// A missing file is an error only when `required`.
    pub fn load(path: &Path, required: bool) -> Result<Self> {
        let cfg = if path.is_file() {
            let s = std::fs::read_to_string(path)
                .with_context(|| format!("read config {}", path.display()))?;
            Self::from_toml_str(&s).with_context(|| format!("parse config {}", path.display()))?
        } else if required {
            return Err(anyhow!("configuration file {} does not exist", path.display()));
        } else {
            Self::default()
        };
        Ok(cfg.apply_env())
    }

    /// Defaults overlaid with a TOML document.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let file: FileConfig = toml::from_str(s).context("parse TOML config")?;
        let mut cfg = Self::default();

        if let Some(v) = file.source {
            cfg.source = v;
        }
        if let Some(v) = file.mount_root {
            cfg.mount_root = v;
        }
        if let Some(v) = file.state_dir {
            cfg.state_dir = v;
        }
        if let Some(v) = file.interval {
            cfg.interval = v.resolve("interval")?;
        }
        if let Some(v) = file.snapshot_prefix {
            cfg.snapshot_prefix = v;
        }
        if let Some(v) = file.children {
            cfg.children = v;
        }
        if let Some(v) = file.containers {
            cfg.containers = v;
        }
        if let Some(v) = file.backup_containers {
            cfg.backup_containers = v;
        }
        cfg.monitor_url = file.monitor_url.and_then(non_empty);
        if let Some(v) = file.notify_timeout {
            cfg.notify_timeout = v.resolve("notify-timeout")?;
        }
        if let Some(v) = file.run_on_start {
            cfg.run_on_start = v;
        }
        cfg.metrics_addr = file.metrics_addr.and_then(non_empty);

        if let Some(r) = file.retention {
            if let Some(n) = r.max_count {
                cfg.retention.max_count = n;
            }
            if let Some(v) = r.max_age {
                cfg.retention.max_age = Some(v.resolve("retention.max-age")?);
            }
            if let Some(n) = r.min_count {
                cfg.retention.min_count = n;
            }
        }
        Ok(cfg)
    }

    /// Overlay process environment.
    pub fn apply_env(self) -> Self {
        self.apply_vars(|k| std::env::var(k).ok())
    }

    /// Overlay variables from `lookup` (name without prefix handled here).
    /// Unparsable values are ignored with a warning.
    pub fn apply_vars<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(&format!("{}{}", ENV_PREFIX, name));
        let dur = |name: &str| {
            var(name).and_then(|v| match parse_duration(&v) {
                Ok(d) => Some(d),
                Err(e) => {
                    warn!("ignoring {}{}: {:#}", ENV_PREFIX, name, e);
                    None
                }
            })
        };
        let count = |name: &str| {
            var(name).and_then(|v| match v.trim().parse::<usize>() {
                Ok(n) => Some(n),
                Err(e) => {
                    warn!("ignoring {}{}='{}': {}", ENV_PREFIX, name, v, e);
                    None
                }
            })
        };

        if let Some(v) = var("SOURCE").and_then(non_empty) {
            self.source = v;
        }
        if let Some(v) = var("MOUNT_ROOT").and_then(non_empty) {
            self.mount_root = PathBuf::from(v);
        }
        if let Some(v) = var("STATE_DIR").and_then(non_empty) {
            self.state_dir = PathBuf::from(v);
        }
        if let Some(d) = dur("INTERVAL") {
            self.interval = d;
        }
        if let Some(v) = var("SNAPSHOT_PREFIX").and_then(non_empty) {
            self.snapshot_prefix = v;
        }
        if let Some(v) = var("CHILDREN") {
            self.children = split_list(&v);
        }
        if let Some(v) = var("CONTAINERS") {
            self.containers = split_list(&v);
        }
        if let Some(v) = var("BACKUP_CONTAINERS") {
            self.backup_containers = split_list(&v);
        }
        if let Some(v) = var("MONITOR_URL") {
            self.monitor_url = non_empty(v);
        }
        if let Some(d) = dur("NOTIFY_TIMEOUT") {
            self.notify_timeout = d;
        }
        if let Some(v) = var("RUN_ON_START") {
            self.run_on_start = parse_bool(&v);
        }
        if let Some(v) = var("METRICS_ADDR") {
            self.metrics_addr = non_empty(v);
        }
        if let Some(n) = count("RETENTION_MAX_COUNT") {
            self.retention.max_count = n;
        }
        if let Some(d) = dur("RETENTION_MAX_AGE") {
            self.retention.max_age = Some(d);
        }
        if let Some(n) = count("RETENTION_MIN_COUNT") {
            self.retention.min_count = n;
        }
        self
    }

    // ----- builder-style overrides -----

    pub fn with_source<S: Into<String>>(mut self, source: S) -> Self {
        self.source = source.into();
        self
    }

    pub fn with_mount_root<P: Into<PathBuf>>(mut self, p: P) -> Self {
        self.mount_root = p.into();
        self
    }

    pub fn with_state_dir<P: Into<PathBuf>>(mut self, p: P) -> Self {
        self.state_dir = p.into();
        self
    }

    pub fn with_interval(mut self, d: Duration) -> Self {
        self.interval = d;
        self
    }

    pub fn with_containers(mut self, names: Vec<String>) -> Self {
        self.containers = names;
        self
    }

    pub fn with_backup_containers(mut self, names: Vec<String>) -> Self {
        self.backup_containers = names;
        self
    }

    pub fn with_children(mut self, names: Vec<String>) -> Self {
        self.children = names;
        self
    }

    pub fn with_monitor_url<S: Into<String>>(mut self, url: Option<S>) -> Self {
        self.monitor_url = url.map(Into::into);
        self
    }

    pub fn with_max_count(mut self, n: usize) -> Self {
        self.retention.max_count = n;
        self
    }

    pub fn with_retention(mut self, policy: RetentionPolicy) -> Self {
        self.retention = policy;
        self
    }

    pub fn with_metrics_addr<S: Into<String>>(mut self, addr: Option<S>) -> Self {
        self.metrics_addr = addr.map(Into::into);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.source.trim().is_empty() {
            return Err(anyhow!("source is not set (config key 'source' or {}SOURCE)", ENV_PREFIX));
        }
        if self.interval.is_zero() {
            return Err(anyhow!("interval must be > 0"));
        }
        if !self.mount_root.is_absolute() {
            return Err(anyhow!(
                "mount-root must be an absolute path, got {}",
                self.mount_root.display()
            ));
        }
        if self.snapshot_prefix.is_empty() || self.snapshot_prefix.contains(['@', '/', ' ']) {
            return Err(anyhow!("invalid snapshot-prefix '{}'", self.snapshot_prefix));
        }
        self.retention.validate()?;
        if self.retention.min_count > self.retention.max_count {
            warn!(
                "retention min_count ({}) > max_count ({}): min_count wins",
                self.retention.min_count, self.retention.max_count
            );
        }
        Ok(())
    }
}

impl fmt::Display for SnapConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SnapConfig {{ \
             source: {}, \
             mount_root: {}, \
             state_dir: {}, \
             interval: {}, \
             snapshot_prefix: {}, \
             children: [{}], \
             containers: [{}], \
             backup_containers: [{}], \
             monitor_url: {}, \
             notify_timeout: {}, \
             run_on_start: {}, \
             metrics_addr: {}, \
             retention: {} \
             }}",
            self.source,
            self.mount_root.display(),
            self.state_dir.display(),
            format_duration(self.interval),
            self.snapshot_prefix,
            self.children.join(", "),
            self.containers.join(", "),
            self.backup_containers.join(", "),
            self.monitor_url.as_deref().unwrap_or("none"),
            format_duration(self.notify_timeout),
            self.run_on_start,
            self.metrics_addr.as_deref().unwrap_or("off"),
            self.retention,
        )
    }
}
