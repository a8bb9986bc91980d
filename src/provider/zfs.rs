//! ZFS provider.
//!
//! Снапшоты: `<source>@<prefix>-<id>` (recursive, -r), id = unix seconds
//! (+ "-N" при коллизии в пределах секунды).
//! Монтирование: `<mount_root>/snap-<id>` + дочерние датасеты в `<target>/<child>`.
//! Mounts на уровне ОС читаются из /proc/self/mountinfo (путь настраивается для тестов).

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, warn};

use super::runner::{CommandRunner, SystemRunner};
use super::{MountRecord, MountState, ProviderError, SnapshotHandle, SnapshotProvider};
use crate::consts::MOUNTINFO_PATH;
use crate::util::clock::{Clock, SystemClock};

pub struct ZfsProvider {
    source: String,
    prefix: String,
    children: Vec<String>,
    mount_root: PathBuf,
    mountinfo: PathBuf,
    runner: Arc<dyn CommandRunner>,
    clock: Arc<dyn Clock>,
}

impl ZfsProvider {
    pub fn new(source: &str, prefix: &str, mount_root: &Path) -> Self {
        Self {
            source: source.trim_end_matches('/').to_string(),
            prefix: prefix.to_string(),
            children: Vec::new(),
            mount_root: mount_root.to_path_buf(),
            mountinfo: PathBuf::from(MOUNTINFO_PATH),
            runner: Arc::new(SystemRunner),
            clock: Arc::new(SystemClock),
        }
    }

    /// Nested datasets (relative to source) mounted below the snapshot mount.
    pub fn with_children(mut self, children: Vec<String>) -> Self {
        self.children = children;
        self
    }

    pub fn with_runner(mut self, runner: Arc<dyn CommandRunner>) -> Self {
        self.runner = runner;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_mountinfo(mut self, path: &Path) -> Self {
        self.mountinfo = path.to_path_buf();
        self
    }

    fn snapshot_name(&self, source: &str, id: &str) -> String {
        format!("{}@{}-{}", source, self.prefix, id)
    }

    /// "tank/apps@backup-1760659200" -> Some("1760659200") if it belongs to us.
    fn id_from_name(&self, name: &str) -> Option<String> {
        let (ds, snap) = name.split_once('@')?;
        if ds != self.source {
            return None;
        }
        let id = snap.strip_prefix(&self.prefix)?.strip_prefix('-')?;
        if id.is_empty() {
            None
        } else {
            Some(id.to_string())
        }
    }

    fn is_mountpoint(&self, path: &Path) -> Result<bool, ProviderError> {
        let p = path.to_string_lossy();
        Ok(self.runner.run("mountpoint", &["-q", &p])?.success)
    }

    fn umount(&self, path: &Path) -> Result<(), ProviderError> {
        let p = path.to_string_lossy();
        debug!("umount {}", p);
        self.runner.run_checked("umount", &[&p]).map(|_| ())
    }

    fn unique_id(&self, ts: u64) -> Result<String, ProviderError> {
        let taken: HashSet<String> = self.list_existing()?.into_iter().map(|h| h.id).collect();
        let base = ts.to_string();
        if !taken.contains(&base) {
            return Ok(base);
        }
        let mut n = 1u32;
        loop {
            let cand = format!("{}-{}", base, n);
            if !taken.contains(&cand) {
                return Ok(cand);
            }
            n += 1;
        }
    }
}

impl SnapshotProvider for ZfsProvider {
    fn name(&self) -> &'static str {
        "zfs"
    }

    fn create(&self, source: &str) -> Result<SnapshotHandle, ProviderError> {
        let ts = self.clock.now_unix_sec();
        let id = self.unique_id(ts)?;
        let name = self.snapshot_name(source, &id);
        debug!("zfs snapshot -r {}", name);
        self.runner.run_checked("zfs", &["snapshot", "-r", &name])?;
        Ok(SnapshotHandle {
            id,
            created_unix: ts,
            source: source.to_string(),
            reference: name,
        })
    }

    fn delete(&self, handle: &SnapshotHandle) -> Result<(), ProviderError> {
        debug!("zfs destroy -r {}", handle.reference);
        self.runner
            .run_checked("zfs", &["destroy", "-r", &handle.reference])
            .map(|_| ())
    }

    fn mount(&self, handle: &SnapshotHandle, target: &Path) -> Result<(), ProviderError> {
        let t = target.to_string_lossy().into_owned();
        self.runner.run_checked("mkdir", &["-p", &t])?;

        debug!("mount -t zfs {} {}", handle.reference, t);
        self.runner
            .run_checked("mount", &["-t", "zfs", &handle.reference, &t])?;

        let snap = handle
            .reference
            .split_once('@')
            .map(|(_, s)| s.to_string())
            .ok_or_else(|| ProviderError::Parse {
                what: "snapshot reference".into(),
                detail: handle.reference.clone(),
            })?;

        let mut mounted: Vec<PathBuf> = Vec::new();
        for child in &self.children {
            let child_ref = format!("{}/{}@{}", handle.source, child, snap);
            let child_target = target.join(child);
            let ct = child_target.to_string_lossy().into_owned();
            debug!("mount -t zfs {} {}", child_ref, ct);
            if let Err(e) = self.runner.run_checked("mount", &["-t", "zfs", &child_ref, &ct]) {
                // откатываем то, что смонтировал этот вызов
                for p in mounted.iter().rev() {
                    if let Err(ue) = self.umount(p) {
                        warn!("rollback umount {} failed: {}", p.display(), ue);
                    }
                }
                if let Err(ue) = self.umount(target) {
                    warn!("rollback umount {} failed: {}", target.display(), ue);
                }
                return Err(e);
            }
            mounted.push(child_target);
        }
        Ok(())
    }

    fn unmount(&self, target: &Path) -> Result<(), ProviderError> {
        if !self.is_mountpoint(target)? {
            debug!("{} is not a mount point, nothing to unmount", target.display());
            return Ok(());
        }
        for child in self.children.iter().rev() {
            let p = target.join(child);
            if self.is_mountpoint(&p)? {
                self.umount(&p)?;
            }
        }
        self.umount(target)?;
        // пустой каталог точки монтирования больше не нужен (best-effort)
        let _ = fs::remove_dir(target);
        Ok(())
    }

    fn list_existing(&self) -> Result<Vec<SnapshotHandle>, ProviderError> {
        let out = self.runner.run_checked(
            "zfs",
            &[
                "list", "-H", "-p", "-t", "snapshot", "-d", "1", "-o", "name,creation",
                &self.source,
            ],
        )?;

        let mut v = Vec::new();
        for line in out.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let mut cols = line.split('\t');
            let name = cols.next().unwrap_or_default();
            let creation = cols.next().ok_or_else(|| ProviderError::Parse {
                what: "zfs list".into(),
                detail: line.to_string(),
            })?;
            let Some(id) = self.id_from_name(name) else {
                continue;
            };
            let created_unix = creation.trim().parse::<u64>().map_err(|e| ProviderError::Parse {
                what: "zfs list creation".into(),
                detail: format!("{}: {}", line, e),
            })?;
            v.push(SnapshotHandle {
                id,
                created_unix,
                source: self.source.clone(),
                reference: name.to_string(),
            });
        }
        Ok(v)
    }

    fn list_mounts(&self) -> Result<Vec<MountRecord>, ProviderError> {
        let text = fs::read_to_string(&self.mountinfo)
            .map_err(|e| ProviderError::io(format!("read {}", self.mountinfo.display()), e))?;

        let mut v = Vec::new();
        for line in text.lines() {
            let Some(entry) = parse_mountinfo_line(line) else {
                continue;
            };
            if entry.mount_point.parent() != Some(self.mount_root.as_path()) {
                continue;
            }
            // snapshot id: из source, если это наш снапшот; иначе сырой source,
            // который заведомо не совпадёт ни с одним снапшотом (reconciliation решит).
            let snapshot_id = if entry.fstype == "zfs" {
                self.id_from_name(&entry.source)
            } else {
                None
            }
            .unwrap_or_else(|| entry.source.clone());

            v.push(MountRecord {
                snapshot_id,
                mount_path: entry.mount_point,
                mounted_unix: 0,
                state: MountState::Mounted,
            });
        }
        Ok(v)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct MountInfoEntry {
    pub mount_point: PathBuf,
    pub fstype: String,
    pub source: String,
}

/// One line of /proc/<pid>/mountinfo:
/// `36 35 98:0 /mnt1 /mnt/parent rw,noatime master:1 - ext3 /dev/root rw`
pub(crate) fn parse_mountinfo_line(line: &str) -> Option<MountInfoEntry> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    let sep = fields.iter().position(|f| *f == "-")?;
    if sep < 6 || fields.len() < sep + 3 {
        return None;
    }
    Some(MountInfoEntry {
        mount_point: PathBuf::from(unescape_octal(fields[4])),
        fstype: fields[sep + 1].to_string(),
        source: unescape_octal(fields[sep + 2]),
    })
}

// mountinfo экранирует пробел/таб/перевод строки/обратный слэш как \ooo
fn unescape_octal(s: &str) -> String {
    let b = s.as_bytes();
    let mut out = Vec::with_capacity(b.len());
    let mut i = 0;
    while i < b.len() {
        if b[i] == b'\\' && i + 4 <= b.len() && b[i + 1..i + 4].iter().all(|c| (b'0'..=b'7').contains(c)) {
            let v = (b[i + 1] - b'0') as u32 * 64 + (b[i + 2] - b'0') as u32 * 8 + (b[i + 3] - b'0') as u32;
            if let Ok(v) = u8::try_from(v) {
                out.push(v);
                i += 4;
                continue;
            }
        }
        out.push(b[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::runner::{CommandOutput, ScriptedRunner};
    use crate::util::clock::ManualClock;

    fn provider(runner: Arc<ScriptedRunner>) -> ZfsProvider {
        ZfsProvider::new("tank/apps", "backup", Path::new("/mnt/snapwarden"))
            .with_runner(runner)
            .with_clock(Arc::new(ManualClock::new(1_760_659_200)))
    }

    #[test]
    fn create_runs_recursive_snapshot() {
        let r = Arc::new(ScriptedRunner::new());
        let p = provider(r.clone());
        let h = p.create("tank/apps").unwrap();
        assert_eq!(h.id, "1760659200");
        assert_eq!(h.reference, "tank/apps@backup-1760659200");
        assert_eq!(h.created_unix, 1_760_659_200);
        assert!(r
            .calls()
            .contains(&"zfs snapshot -r tank/apps@backup-1760659200".to_string()));
    }

    #[test]
    fn create_suffixes_id_on_collision() {
        let r = Arc::new(ScriptedRunner::new());
        r.on(
            "zfs list",
            CommandOutput::ok(
                "tank/apps@backup-1760659200\t1760659200\ntank/apps@backup-1760659200-1\t1760659200\n",
            ),
        );
        let p = provider(r.clone());
        let h = p.create("tank/apps").unwrap();
        assert_eq!(h.id, "1760659200-2");
    }

    #[test]
    fn create_failure_is_command_error() {
        let r = Arc::new(ScriptedRunner::new());
        r.on("zfs snapshot", CommandOutput::failed(1, "out of space"));
        let p = provider(r);
        match p.create("tank/apps") {
            Err(ProviderError::Command { stderr, .. }) => assert_eq!(stderr, "out of space"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn list_existing_filters_foreign_snapshots() {
        let r = Arc::new(ScriptedRunner::new());
        r.on(
            "zfs list",
            CommandOutput::ok(
                "tank/apps@backup-100\t100\n\
                 tank/apps@manual\t150\n\
                 tank/apps@backup-200\t200\n\
                 tank/other@backup-300\t300\n",
            ),
        );
        let p = provider(r);
        let v = p.list_existing().unwrap();
        let ids: Vec<_> = v.iter().map(|h| h.id.as_str()).collect();
        assert_eq!(ids, vec!["100", "200"]);
        assert_eq!(v[1].created_unix, 200);
    }

    #[test]
    fn list_existing_rejects_bad_creation() {
        let r = Arc::new(ScriptedRunner::new());
        r.on("zfs list", CommandOutput::ok("tank/apps@backup-100\tyesterday\n"));
        let p = provider(r);
        assert!(matches!(p.list_existing(), Err(ProviderError::Parse { .. })));
    }

    #[test]
    fn mount_with_children_and_rollback() {
        let r = Arc::new(ScriptedRunner::new());
        r.on(
            "mount -t zfs tank/apps/media@backup-7",
            CommandOutput::failed(1, "no such dataset"),
        );
        let p = provider(r.clone()).with_children(vec!["db".into(), "media".into()]);
        let h = SnapshotHandle {
            id: "7".into(),
            created_unix: 7,
            source: "tank/apps".into(),
            reference: "tank/apps@backup-7".into(),
        };
        let target = Path::new("/mnt/snapwarden/snap-7");
        assert!(p.mount(&h, target).is_err());

        let calls = r.calls();
        assert_eq!(calls[0], "mkdir -p /mnt/snapwarden/snap-7");
        assert_eq!(calls[1], "mount -t zfs tank/apps@backup-7 /mnt/snapwarden/snap-7");
        assert_eq!(calls[2], "mount -t zfs tank/apps/db@backup-7 /mnt/snapwarden/snap-7/db");
        // rollback: db child, then the parent
        assert_eq!(calls[4], "umount /mnt/snapwarden/snap-7/db");
        assert_eq!(calls[5], "umount /mnt/snapwarden/snap-7");
    }

    #[test]
    fn unmount_skips_non_mountpoint() {
        let r = Arc::new(ScriptedRunner::new());
        r.on("mountpoint", CommandOutput::failed(32, ""));
        let p = provider(r.clone());
        p.unmount(Path::new("/mnt/snapwarden/snap-1")).unwrap();
        assert!(r.calls_matching("umount").is_empty());
    }

    #[test]
    fn unmount_children_first() {
        let r = Arc::new(ScriptedRunner::new());
        let p = provider(r.clone()).with_children(vec!["db".into(), "media".into()]);
        p.unmount(Path::new("/mnt/snapwarden/snap-1")).unwrap();
        assert_eq!(
            r.calls_matching("umount"),
            vec![
                "umount /mnt/snapwarden/snap-1/media".to_string(),
                "umount /mnt/snapwarden/snap-1/db".to_string(),
                "umount /mnt/snapwarden/snap-1".to_string(),
            ]
        );
    }

    #[test]
    fn mountinfo_parsing() {
        let e = parse_mountinfo_line(
            "412 30 0:88 / /mnt/snapwarden/snap-100 ro,relatime shared:222 - zfs tank/apps@backup-100 ro,xattr",
        )
        .unwrap();
        assert_eq!(e.mount_point, PathBuf::from("/mnt/snapwarden/snap-100"));
        assert_eq!(e.fstype, "zfs");
        assert_eq!(e.source, "tank/apps@backup-100");

        let esc = parse_mountinfo_line("1 2 0:1 / /mnt/with\\040space rw - tmpfs tmpfs rw").unwrap();
        assert_eq!(esc.mount_point, PathBuf::from("/mnt/with space"));

        assert!(parse_mountinfo_line("garbage").is_none());
    }

    #[test]
    fn list_mounts_reads_direct_children_of_root() {
        let dir = std::env::temp_dir().join(format!("snapwarden-mi-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let mi = dir.join("mountinfo");
        fs::write(
            &mi,
            "22 1 8:1 / / rw - ext4 /dev/sda1 rw\n\
             412 30 0:88 / /mnt/snapwarden/snap-100 ro shared:1 - zfs tank/apps@backup-100 ro\n\
             413 412 0:89 / /mnt/snapwarden/snap-100/db ro shared:2 - zfs tank/apps/db@backup-100 ro\n\
             414 30 0:90 / /mnt/snapwarden/stray rw - tmpfs tmpfs rw\n",
        )
        .unwrap();

        let p = provider(Arc::new(ScriptedRunner::new())).with_mountinfo(&mi);
        let v = p.list_mounts().unwrap();
        assert_eq!(v.len(), 2);
        assert_eq!(v[0].snapshot_id, "100");
        assert_eq!(v[0].mount_path, PathBuf::from("/mnt/snapwarden/snap-100"));
        // чужой mount: id = сырой source
        assert_eq!(v[1].snapshot_id, "tmpfs");

        let _ = fs::remove_dir_all(&dir);
    }
}
