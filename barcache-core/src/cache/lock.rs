//! Per-symbol write locking.
//!
//! Two layers: an in-process mutex per symbol, so threads sharing a store
//! queue up without touching the filesystem, and a `{SYMBOL}.lock` file
//! created with `create_new`, so separate stores and processes exclude
//! each other too.

use super::CacheError;
use rand::Rng;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockPolicy {
    /// Attempts after the first before giving up.
    pub retries: u32,
    /// Base delay, doubled per attempt.
    pub backoff: Duration,
    /// Lock files older than this are assumed abandoned.
    pub stale_after: Duration,
}

impl Default for LockPolicy {
    fn default() -> Self {
        Self {
            retries: 5,
            backoff: Duration::from_millis(50),
            stale_after: Duration::from_secs(120),
        }
    }
}

impl LockPolicy {
    fn delay(&self, attempt: u32) -> Duration {
        let base = self.backoff.saturating_mul(2u32.saturating_pow(attempt.min(10)));
        let jitter_ms = rand::thread_rng().gen_range(0..=self.backoff.as_millis() as u64);
        base + Duration::from_millis(jitter_ms)
    }
}

/// In-process registry of per-symbol mutexes.
#[derive(Debug, Default)]
pub struct SymbolLocks {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl SymbolLocks {
    pub fn for_symbol(&self, symbol: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(symbol.to_string()).or_default())
    }
}

/// Held `{SYMBOL}.lock` file. Removed on drop, but only while it still
/// carries this holder's token; a holder whose lock was broken as stale
/// leaves the new owner's file alone.
#[derive(Debug)]
pub struct LockFile {
    path: PathBuf,
    token: String,
}

impl LockFile {
    /// Take the lock file, retrying on contention. Breaking a stale lock
    /// does not use up an attempt.
    pub fn acquire(path: &Path, symbol: &str, policy: &LockPolicy) -> Result<Self, CacheError> {
        let attempts = policy.retries + 1;
        let mut contended = 0;
        while contended < attempts {
            match OpenOptions::new().write(true).create_new(true).open(path) {
                Ok(file) => return Self::claim(file, path, symbol),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    if is_stale(path, policy.stale_after) {
                        break_stale(path, symbol, policy.stale_after)?;
                        continue;
                    }
                    contended += 1;
                    if contended < attempts {
                        std::thread::sleep(policy.delay(contended - 1));
                    }
                }
                Err(e) => return Err(io_error(path, e)),
            }
        }

        Err(CacheError::LockContention {
            symbol: symbol.to_string(),
            attempts,
        })
    }

    /// Stamp a freshly created lock file with a unique token.
    fn claim(mut file: File, path: &Path, symbol: &str) -> Result<Self, CacheError> {
        let created = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        let token = format!(
            "pid={} nonce={:016x} created_ms={created}",
            std::process::id(),
            rand::random::<u64>()
        );
        if let Err(e) = writeln!(file, "{token}").and_then(|()| file.flush()) {
            let _ = fs::remove_file(path);
            return Err(io_error(path, e));
        }
        debug!(symbol, path = %path.display(), "acquired lock file");
        Ok(Self {
            path: path.to_path_buf(),
            token,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        match fs::read_to_string(&self.path) {
            Ok(contents) if contents.trim_end() == self.token => {
                if let Err(e) = fs::remove_file(&self.path) {
                    warn!(path = %self.path.display(), error = %e, "failed to remove lock file");
                }
            }
            Ok(_) => {
                warn!(path = %self.path.display(), "lock file was taken over after going stale; leaving it");
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "lock file missing on release");
            }
        }
    }
}

/// Move a stale lock aside under a unique name and re-check it there. A
/// moved file that is no longer stale was re-created by another writer
/// between the check and the rename, so it goes back.
fn break_stale(path: &Path, symbol: &str, stale_after: Duration) -> Result<(), CacheError> {
    let aside = aside_path(path);
    match fs::rename(path, &aside) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(io_error(path, e)),
    }

    if is_stale(&aside, stale_after) {
        warn!(symbol, path = %path.display(), "broke stale lock file");
    } else {
        debug!(symbol, path = %path.display(), "lock file renewed while breaking; restoring it");
        match fs::hard_link(&aside, path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                warn!(symbol, path = %path.display(), "lock file re-taken before restore");
            }
            Err(e) => {
                let _ = fs::remove_file(&aside);
                return Err(io_error(path, e));
            }
        }
    }

    if let Err(e) = fs::remove_file(&aside) {
        warn!(path = %aside.display(), error = %e, "failed to remove broken lock file");
    }
    Ok(())
}

fn aside_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(format!(".broken-{}-{:016x}", std::process::id(), rand::random::<u64>()));
    path.with_file_name(name)
}

fn io_error(path: &Path, source: io::Error) -> CacheError {
    CacheError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn is_stale(path: &Path, stale_after: Duration) -> bool {
    fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|mtime| mtime.elapsed().ok())
        .is_some_and(|age| age > stale_after)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quick() -> LockPolicy {
        LockPolicy {
            retries: 2,
            backoff: Duration::from_millis(1),
            stale_after: Duration::from_secs(3600),
        }
    }

    #[test]
    fn lock_file_is_exclusive_and_released_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("BTC.lock");

        let held = LockFile::acquire(&path, "BTC", &quick()).unwrap();
        assert!(path.exists());
        let err = LockFile::acquire(&path, "BTC", &quick()).unwrap_err();
        assert!(matches!(err, CacheError::LockContention { attempts: 3, .. }));

        drop(held);
        assert!(!path.exists());
        assert!(LockFile::acquire(&path, "BTC", &quick()).is_ok());
    }

    #[test]
    fn stale_lock_is_broken() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("BTC.lock");
        fs::write(&path, "pid=1").unwrap();
        std::thread::sleep(Duration::from_millis(20));

        let policy = LockPolicy {
            stale_after: Duration::from_millis(5),
            ..quick()
        };
        let held = LockFile::acquire(&path, "BTC", &policy).unwrap();
        let contents = fs::read_to_string(held.path()).unwrap();
        assert!(contents.starts_with(&format!("pid={}", std::process::id())));
    }

    #[test]
    fn stale_lock_is_broken_without_retries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("BTC.lock");
        fs::write(&path, "pid=1").unwrap();
        std::thread::sleep(Duration::from_millis(80));

        let policy = LockPolicy {
            retries: 0,
            backoff: Duration::from_millis(1),
            stale_after: Duration::from_millis(50),
        };
        let held = LockFile::acquire(&path, "BTC", &policy).unwrap();
        assert_ne!(fs::read_to_string(held.path()).unwrap(), "pid=1");
    }

    #[test]
    fn superseded_holder_leaves_new_owner_locked() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("BTC.lock");
        let short = LockPolicy {
            retries: 0,
            backoff: Duration::from_millis(1),
            stale_after: Duration::from_millis(50),
        };

        let first = LockFile::acquire(&path, "BTC", &short).unwrap();
        std::thread::sleep(Duration::from_millis(80));
        let second = LockFile::acquire(&path, "BTC", &short).unwrap();

        drop(first);
        assert!(path.exists());
        let err = LockFile::acquire(&path, "BTC", &quick()).unwrap_err();
        assert!(matches!(err, CacheError::LockContention { attempts: 3, .. }));

        drop(second);
        assert!(!path.exists());
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn fresh_lock_moved_aside_is_restored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("BTC.lock");
        fs::write(&path, "pid=7 nonce=1").unwrap();

        break_stale(&path, "BTC", Duration::from_secs(3600)).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "pid=7 nonce=1");
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn registry_returns_shared_mutex_per_symbol() {
        let locks = SymbolLocks::default();
        let a = locks.for_symbol("BTC");
        let b = locks.for_symbol("BTC");
        let c = locks.for_symbol("ETH");
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
    }
}
