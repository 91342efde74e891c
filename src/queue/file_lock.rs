//! Cross-process advisory lock
//!
//! The lock is a sibling `<file>.lock` created with `create_new`, so exactly
//! one process can hold it. Acquisition retries with capped exponential
//! backoff; a lock file older than the staleness ceiling is assumed to belong
//! to a crashed holder and is broken.

use crate::core::config::duration;
use crate::core::error::{Error, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, warn};

/// Retry and staleness tuning for [`FileLock`]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockOptions {
    /// Attempts before giving up
    pub retries: u32,

    /// First backoff delay
    #[serde(with = "duration")]
    pub min_backoff: Duration,

    /// Backoff ceiling
    #[serde(with = "duration")]
    pub max_backoff: Duration,

    /// Age after which an existing lock is considered abandoned
    #[serde(with = "duration")]
    pub stale: Duration,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            retries: 200,
            min_backoff: Duration::from_millis(2),
            max_backoff: Duration::from_millis(100),
            stale: Duration::from_secs(10),
        }
    }
}

impl LockOptions {
    fn backoff(&self, attempt: u32) -> Duration {
        let exp = self.min_backoff.saturating_mul(1u32 << attempt.min(16));
        let capped = exp.min(self.max_backoff);
        // Jitter spreads out processes that collided on the same tick
        let jitter = rand::rng().random_range(0..=capped.as_micros().min(u64::MAX as u128) as u64 / 2);
        capped / 2 + Duration::from_micros(jitter)
    }
}

/// Held advisory lock; released when dropped
#[derive(Debug)]
pub struct FileLock {
    path: PathBuf,
}

impl FileLock {
    /// Lock file location for a target file
    pub fn lock_path(target: &Path) -> PathBuf {
        let mut name = target
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".lock");
        target.with_file_name(name)
    }

    /// Acquire the lock guarding `target`
    pub async fn acquire(target: &Path, options: &LockOptions) -> Result<FileLock> {
        let path = Self::lock_path(target);
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)?;
        }

        for attempt in 0..=options.retries {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    // Holder pid is informational only
                    let _ = writeln!(file, "{}", std::process::id());
                    debug!("Acquired file lock {:?} after {} attempts", path, attempt + 1);
                    return Ok(FileLock { path });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    if Self::is_stale(&path, options.stale) {
                        warn!("Breaking stale file lock {:?}", path);
                        match fs::remove_file(&path) {
                            Ok(()) => continue,
                            Err(e) if e.kind() == ErrorKind::NotFound => continue,
                            Err(e) => return Err(e.into()),
                        }
                    }
                    tokio::time::sleep(options.backoff(attempt)).await;
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(Error::Lock(format!(
            "Could not acquire {:?} after {} attempts",
            path,
            options.retries + 1
        )))
    }

    fn is_stale(path: &Path, stale: Duration) -> bool {
        fs::metadata(path)
            .and_then(|meta| meta.modified())
            .ok()
            .and_then(|modified| SystemTime::now().duration_since(modified).ok())
            .map(|age| age > stale)
            .unwrap_or(false)
    }

    /// Path of the lock file itself
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!("Failed to release file lock {:?}: {}", self.path, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quick() -> LockOptions {
        LockOptions {
            retries: 5,
            min_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
            stale: Duration::from_secs(60),
        }
    }

    #[tokio::test]
    async fn test_exclusive_until_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("db.json");

        let held = FileLock::acquire(&target, &quick()).await.unwrap();
        assert!(held.path().exists());
        assert_eq!(held.path(), dir.path().join("db.json.lock"));

        let contended = FileLock::acquire(&target, &quick()).await;
        assert!(matches!(contended, Err(Error::Lock(_))));

        drop(held);
        assert!(!dir.path().join("db.json.lock").exists());
        let again = FileLock::acquire(&target, &quick()).await;
        assert!(again.is_ok());
    }

    #[tokio::test]
    async fn test_stale_lock_is_broken() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("db.json");
        // Simulate a crashed holder that never cleaned up
        fs::write(FileLock::lock_path(&target), "12345").unwrap();

        let options = LockOptions {
            stale: Duration::from_millis(20),
            ..quick()
        };
        tokio::time::sleep(Duration::from_millis(40)).await;
        let lock = FileLock::acquire(&target, &options).await;
        assert!(lock.is_ok());
    }

    #[test]
    fn test_backoff_is_capped() {
        let options = quick();
        for attempt in 0..40 {
            assert!(options.backoff(attempt) <= options.max_backoff);
        }
    }
}
