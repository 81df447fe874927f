use crate::Result;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// How the file-system lock backend implements mutual exclusion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FileLockStyle {
    /// OS advisory lock on an open file descriptor, acquired with a bounded
    /// spin. Self-recovering: the OS drops the lock when the holder exits.
    #[default]
    Flock,
    /// A lock file atomically published from a temp file, carrying its expiry
    /// timestamp; stale files are reclaimed by the next acquirer.
    Rename,
}

/// Selects and parameterizes the per-key lock backend.
///
/// # Example
///
/// ```toml
/// [lock]
/// backend = "file"
/// dir = "/var/run/myapp/locks"
/// style = "rename"
/// max_wait = "10s"
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum LockConfig {
    /// In-process locks. Single-node deployments and tests.
    Memory,

    /// Redis `SET NX EX` locks with token-checked release.
    Redis {
        /// Connection URL, e.g. `redis://127.0.0.1:6379`.
        url: String,
        /// Prefix for lock keys. Default: `lock`.
        #[serde(default = "default_lock_prefix")]
        key_prefix: String,
    },

    /// File-system locks for co-located processes sharing a directory.
    File {
        /// Directory holding the lock files; created if missing.
        dir: PathBuf,
        /// Locking style. Default: flock.
        #[serde(default)]
        style: FileLockStyle,
        /// Sleep between acquisition attempts. Default: 1 ms.
        #[serde(default = "default_spin_interval", with = "humantime_serde")]
        spin_interval: Duration,
        /// Give up acquiring after this long. Default: 10 s.
        #[serde(default = "default_max_wait", with = "humantime_serde")]
        max_wait: Duration,
    },
}

fn default_lock_prefix() -> String {
    "lock".to_string()
}
fn default_spin_interval() -> Duration {
    Duration::from_millis(1)
}
fn default_max_wait() -> Duration {
    Duration::from_secs(10)
}

impl LockConfig {
    /// Short backend name for logs and stats.
    pub fn backend_name(&self) -> &'static str {
        match self {
            LockConfig::Memory => "memory",
            LockConfig::Redis { .. } => "redis",
            LockConfig::File { .. } => "file",
        }
    }

    pub fn validate(&self) -> Result<()> {
        use crate::Error;

        match self {
            LockConfig::Memory => {}
            LockConfig::Redis { url, .. } => {
                if url.trim().is_empty() {
                    return Err(Error::config("lock.url is required for the redis backend"));
                }
            }
            LockConfig::File { dir, max_wait, .. } => {
                if dir.as_os_str().is_empty() {
                    return Err(Error::config("lock.dir is required for the file backend"));
                }
                if max_wait.is_zero() {
                    return Err(Error::config("lock.max_wait must be greater than zero"));
                }
            }
        }
        Ok(())
    }
}

impl Default for LockConfig {
    fn default() -> Self {
        LockConfig::Memory
    }
}
