//! Persisted mount-record store (best-effort durable).
//!
//! Формат: <state_dir>/mounts.json
//! {
//!   "version": 1,
//!   "records": [
//!     {"snapshot_id":"1760659200","mount_path":"/mnt/snapwarden/snap-1760659200",
//!      "mounted_unix":1760659201,"state":"Mounted"}
//!   ]
//! }
//!
//! Запись выполняется атомарно через tmp+rename.

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::consts::{MOUNT_STORE_FILE, MOUNT_STORE_VERSION};
use crate::provider::MountRecord;

#[derive(Debug, Serialize, Deserialize)]
struct StoreFile {
    version: u32,
    records: Vec<MountRecord>,
}

pub fn store_path(state_dir: &Path) -> PathBuf {
    state_dir.join(MOUNT_STORE_FILE)
}

/// Missing file means "no records".
pub fn load(path: &Path) -> Result<Vec<MountRecord>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let bytes = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    let file: StoreFile = serde_json::from_slice(&bytes)
        .with_context(|| format!("parse {}", path.display()))?;
    if file.version != MOUNT_STORE_VERSION {
        return Err(anyhow!(
            "{}: unsupported store version {} (expected {})",
            path.display(),
            file.version,
            MOUNT_STORE_VERSION
        ));
    }
    Ok(file.records)
}

pub fn save(path: &Path, records: &[MountRecord]) -> Result<()> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
    }
    let tmp = path.with_extension("json.tmp");

    let mut f = OpenOptions::new()
        .create(true)
        .truncate(true)
        .write(true)
        .open(&tmp)
        .with_context(|| format!("open {}", tmp.display()))?;

    let file = StoreFile {
        version: MOUNT_STORE_VERSION,
        records: records.to_vec(),
    };
    let data = serde_json::to_vec_pretty(&file).context("serialize mounts.json")?;
    f.write_all(&data)?;
    let _ = f.sync_all();

    fs::rename(&tmp, path)
        .with_context(|| format!("rename {} -> {}", tmp.display(), path.display()))?;
    Ok(())
}
