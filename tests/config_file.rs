// tests/config_file.rs
//
// Загрузка конфигурации из файла: обязательный/необязательный файл,
// kebab-case ключи, секция [retention], длительности строкой и числом.

use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Result;

use snapwarden::SnapConfig;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

fn unique_root(prefix: &str) -> PathBuf {
    let pid = std::process::id();
    let t = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
    let base = std::env::temp_dir();
    base.join(format!("snapwarden-config-{prefix}-{pid}-{t}-{id}"))
}

#[test]
fn full_file_round_trip_through_validate() -> Result<()> {
    let root = unique_root("full");
    fs::create_dir_all(&root)?;
    let path = root.join("config.toml");
    fs::write(
        &path,
        r#"
source = "tank/apps"
mount-root = "/mnt/backup"
state-dir = "/var/lib/snapwarden-test"
interval = "6h"
snapshot-prefix = "nightly"
children = ["postgres", "media"]
containers = ["db", "web"]
backup-containers = ["restic"]
monitor-url = "https://kuma.example.org/api/push/abc"
notify-timeout = "30s"
run-on-start = false
metrics-addr = "127.0.0.1:9187"

[retention]
max-count = 7
max-age = "2w"
min-count = 2
"#,
    )?;

    let cfg = SnapConfig::load(&path, true)?;
    cfg.validate()?;
    assert_eq!(cfg.source, "tank/apps");
    assert_eq!(cfg.mount_root, PathBuf::from("/mnt/backup"));
    assert_eq!(cfg.interval, Duration::from_secs(6 * 3600));
    assert_eq!(cfg.snapshot_prefix, "nightly");
    assert_eq!(cfg.children, vec!["postgres", "media"]);
    assert_eq!(cfg.containers, vec!["db", "web"]);
    assert_eq!(cfg.backup_containers, vec!["restic"]);
    assert_eq!(cfg.monitor_url.as_deref(), Some("https://kuma.example.org/api/push/abc"));
    assert_eq!(cfg.notify_timeout, Duration::from_secs(30));
    assert!(!cfg.run_on_start);
    assert_eq!(cfg.metrics_addr.as_deref(), Some("127.0.0.1:9187"));
    assert_eq!(cfg.retention.max_count, 7);
    assert_eq!(cfg.retention.max_age, Some(Duration::from_secs(14 * 86_400)));
    assert_eq!(cfg.retention.min_count, 2);

    let _ = fs::remove_dir_all(&root);
    Ok(())
}

#[test]
fn missing_file_required_vs_optional() -> Result<()> {
    let root = unique_root("missing");
    let path = root.join("nope.toml");

    let err = SnapConfig::load(&path, true).unwrap_err();
    assert!(format!("{:#}", err).contains("does not exist"));

    let cfg = SnapConfig::load(&path, false)?;
    assert_eq!(cfg.retention.max_count, 14);
    Ok(())
}

#[test]
fn malformed_file_reports_path() -> Result<()> {
    let root = unique_root("bad");
    fs::create_dir_all(&root)?;
    let path = root.join("config.toml");
    fs::write(&path, "source = \"tank\"\n[retention]\nmax-count = \"many\"\n")?;

    let err = SnapConfig::load(&path, true).unwrap_err();
    assert!(format!("{:#}", err).contains("config.toml"));

    let _ = fs::remove_dir_all(&root);
    Ok(())
}
