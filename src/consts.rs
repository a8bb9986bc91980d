//! Общие константы (state dir, имена снапшотов, дефолты конфигурации).

// -------- State dir --------
pub const LOCK_FILE: &str = "LOCK";
pub const MOUNT_STORE_FILE: &str = "mounts.json";
pub const MOUNT_STORE_VERSION: u32 = 1;

// -------- Snapshot naming --------
// ZFS: <source>@<prefix>-<id>, mount: <mount_root>/snap-<id>
pub const DEFAULT_SNAPSHOT_PREFIX: &str = "backup";
pub const MOUNT_DIR_PREFIX: &str = "snap-";

// -------- Defaults --------
pub const DEFAULT_CONFIG_PATH: &str = "config.toml";
pub const DEFAULT_MAX_COUNT: usize = 14;
pub const DEFAULT_MIN_COUNT: usize = 1;
pub const DEFAULT_INTERVAL_SECS: u64 = 24 * 3600;
pub const DEFAULT_NOTIFY_TIMEOUT_SECS: u64 = 20;
pub const DEFAULT_MOUNT_ROOT: &str = "/mnt/snapwarden";
pub const DEFAULT_STATE_DIR: &str = "/var/lib/snapwarden";

// -------- Env --------
pub const ENV_PREFIX: &str = "SNAPWARDEN_";

// -------- Linux --------
pub const MOUNTINFO_PATH: &str = "/proc/self/mountinfo";
