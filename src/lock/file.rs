//! File-system lock backend, for co-located processes sharing a directory.
//!
//! Two styles:
//!
//! - **Flock** — an OS advisory lock on an open descriptor, acquired with a
//!   bounded spin. The OS releases it when the holder exits, so recovery does
//!   not depend on the expiry stamp (which is written into the file purely
//!   for diagnostics).
//! - **Rename** — a lock file carrying its expiry timestamp, published
//!   atomically by hard-linking a fully-written temp file into place. A file
//!   whose embedded expiry has passed is stale; contenders steal it with an
//!   atomic rename so only one of them reclaims the key.
//!
//! Lock paths are derived from a SHA-256 of the key, so arbitrary key bytes
//! never reach the file system. Held locks are tracked per backend instance
//! and released on drop.

use super::{KeyLock, LockToken, expiry_stamp};
use crate::{Error, FileLockStyle, Result, record::unix_now};
use async_trait::async_trait;
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use std::{
    fs::{self, File, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
    time::{Duration, Instant},
};

enum Held {
    Flock { file: File },
    Rename { path: PathBuf },
}

struct HeldLock {
    token: LockToken,
    held: Held,
}

/// Locks over a shared directory of lock files.
pub struct FileKeyLock {
    dir: PathBuf,
    style: FileLockStyle,
    spin_interval: Duration,
    max_wait: Duration,
    held: DashMap<String, HeldLock>,
}

impl FileKeyLock {
    /// Creates the backend, creating the lock directory if needed.
    pub fn new(
        dir: impl AsRef<Path>,
        style: FileLockStyle,
        spin_interval: Duration,
        max_wait: Duration,
    ) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).map_err(Error::from_io)?;
        Ok(Self {
            dir,
            style,
            spin_interval,
            max_wait,
            held: DashMap::new(),
        })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let digest = Sha256::digest(key.as_bytes());
        let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
        self.dir.join(format!("{hex}.lock"))
    }

    async fn acquire_flock(&self, key: &str, ttl: Duration) -> Result<Option<LockToken>> {
        let path = self.path_for(key);
        let deadline = Instant::now() + self.max_wait;

        loop {
            let mut file = OpenOptions::new()
                .create(true)
                .read(true)
                .write(true)
                .truncate(false)
                .open(&path)
                .map_err(Error::from_io)?;

            if fs2::FileExt::try_lock_exclusive(&file).is_ok() {
                // Expiry stamp is diagnostic only; the OS releases the lock
                // when the holder exits.
                let _ = file.set_len(0);
                let _ = write!(file, "{}", expiry_stamp(ttl));
                let _ = file.flush();

                let token = LockToken::fresh();
                self.held.insert(
                    key.to_string(),
                    HeldLock {
                        token: token.clone(),
                        held: Held::Flock { file },
                    },
                );
                return Ok(Some(token));
            }

            if Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(self.spin_interval).await;
        }
    }

    async fn acquire_rename(&self, key: &str, ttl: Duration) -> Result<Option<LockToken>> {
        let path = self.path_for(key);
        let deadline = Instant::now() + self.max_wait;
        let token = LockToken::fresh();

        let tmp = self.dir.join(format!(".{}.tmp", token.as_str()));
        fs::write(&tmp, format!("{} {}", expiry_stamp(ttl), token.as_str()))
            .map_err(Error::from_io)?;

        loop {
            match fs::hard_link(&tmp, &path) {
                Ok(()) => {
                    let _ = fs::remove_file(&tmp);
                    self.held.insert(
                        key.to_string(),
                        HeldLock {
                            token: token.clone(),
                            held: Held::Rename { path },
                        },
                    );
                    return Ok(Some(token));
                }
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                    if lock_file_is_stale(&path) {
                        // Steal via rename: only one contender wins, the
                        // rest see NotFound on their next link attempt.
                        let graveyard = self.dir.join(format!(".{}.stale", token.as_str()));
                        if fs::rename(&path, &graveyard).is_ok() {
                            let _ = fs::remove_file(&graveyard);
                        }
                        continue;
                    }
                    if Instant::now() >= deadline {
                        let _ = fs::remove_file(&tmp);
                        return Ok(None);
                    }
                    tokio::time::sleep(self.spin_interval).await;
                }
                Err(err) => {
                    let _ = fs::remove_file(&tmp);
                    return Err(Error::from_io(err));
                }
            }
        }
    }

    fn release_held(&self, held: HeldLock) {
        match held.held {
            Held::Flock { file } => {
                // The file itself stays: removing it would let a later opener
                // lock a different inode than a concurrent spinner holds.
                let _ = fs2::FileExt::unlock(&file);
            }
            Held::Rename { path } => {
                // Remove only while the file still carries our token; after
                // a stale steal it belongs to the new holder.
                let ours = fs::read_to_string(&path)
                    .ok()
                    .and_then(|content| {
                        content
                            .split_whitespace()
                            .nth(1)
                            .map(|t| t == held.token.as_str())
                    })
                    .unwrap_or(false);
                if ours {
                    let _ = fs::remove_file(&path);
                }
            }
        }
    }
}

/// A lock file is stale when its embedded expiry (the first field of
/// `"<expiry> <token>"`) has passed. Unreadable content also counts as
/// stale: a live holder always publishes a complete stamp, so garbage means
/// a crashed or foreign writer.
fn lock_file_is_stale(path: &Path) -> bool {
    match fs::read_to_string(path) {
        Ok(content) => content
            .split_whitespace()
            .next()
            .and_then(|field| field.parse::<u64>().ok())
            .map(|expires| expires < unix_now())
            .unwrap_or(true),
        // Vanished between link failure and read: not stale, just taken.
        Err(_) => false,
    }
}

#[async_trait]
impl KeyLock for FileKeyLock {
    async fn acquire(&self, key: &str, ttl: Duration) -> Result<Option<LockToken>> {
        if self.held.contains_key(key) {
            return Ok(None);
        }
        match self.style {
            FileLockStyle::Flock => self.acquire_flock(key, ttl).await,
            FileLockStyle::Rename => self.acquire_rename(key, ttl).await,
        }
    }

    async fn release(&self, key: &str, token: &LockToken) -> Result<bool> {
        match self.held.remove_if(key, |_, h| h.token == *token) {
            Some((_, held)) => {
                self.release_held(held);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn is_locked(&self, key: &str) -> Result<bool> {
        let path = self.path_for(key);
        match self.style {
            FileLockStyle::Flock => {
                let file = match OpenOptions::new().read(true).write(true).open(&path) {
                    Ok(file) => file,
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(false),
                    Err(err) => return Err(Error::from_io(err)),
                };
                if fs2::FileExt::try_lock_exclusive(&file).is_ok() {
                    let _ = fs2::FileExt::unlock(&file);
                    Ok(false)
                } else {
                    Ok(true)
                }
            }
            FileLockStyle::Rename => Ok(path.exists() && !lock_file_is_stale(&path)),
        }
    }
}

impl Drop for FileKeyLock {
    /// Releases every lock this instance still holds.
    fn drop(&mut self) {
        let keys: Vec<String> = self.held.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            if let Some((_, held)) = self.held.remove(&key) {
                self.release_held(held);
            }
        }
    }
}
