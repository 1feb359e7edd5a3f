//! Echo suppression lock
//!
//! When the applier mutates a path on behalf of a remote host, the watch
//! source reports that mutation back to us a little later. The echo lock
//! remembers every path the applier touched together with a deadline; while
//! the deadline has not passed, local changes on that path are treated as
//! self-inflicted and are neither recorded nor published.
//!
//! Locks are never released by hand. Each acquire sets the deadline to
//! `now + ttl` (the latest acquire wins) and a single sweeper task purges
//! expired entries.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// Default lock TTL in milliseconds
pub const DEFAULT_ECHO_TTL_MS: u64 = mfs_core::DEFAULT_SYNC_INTERVAL_MS;

/// Path → expiry table shared between the applier, coalescer and publisher
#[derive(Clone)]
pub struct EchoLock {
    /// Lock deadlines by absolute path
    entries: Arc<RwLock<HashMap<PathBuf, Instant>>>,
    /// TTL used by `acquire`
    default_ttl: Duration,
}

impl EchoLock {
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            default_ttl,
        }
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Lock `path` for the default TTL
    pub fn acquire(&self, path: &Path) {
        self.acquire_for(path, self.default_ttl);
    }

    /// Lock `path` until `now + ttl`, replacing any earlier deadline
    pub fn acquire_for(&self, path: &Path, ttl: Duration) {
        let expires_at = Instant::now() + ttl;
        self.entries.write().insert(path.to_path_buf(), expires_at);
        trace!("Echo lock acquired: {:?} for {:?}", path, ttl);
    }

    /// True while `path` holds a deadline in the future
    pub fn is_locked(&self, path: &Path) -> bool {
        self.entries
            .read()
            .get(path)
            .map(|expires_at| Instant::now() < *expires_at)
            .unwrap_or(false)
    }

    /// Time until the lock on `path` expires, `None` if unlocked
    pub fn time_remaining(&self, path: &Path) -> Option<Duration> {
        let now = Instant::now();
        self.entries
            .read()
            .get(path)
            .filter(|expires_at| now < **expires_at)
            .map(|expires_at| expires_at.saturating_duration_since(now))
    }

    /// Drop every expired entry, returns how many were removed
    pub fn cleanup_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, expires_at| now < *expires_at);
        let removed = before - entries.len();
        if removed > 0 {
            debug!("Echo lock sweep removed {} expired entries", removed);
        }
        removed
    }

    /// Number of entries, expired ones included until the next sweep
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Spawn the background sweeper
    pub fn spawn_sweeper(&self, every: Duration) -> JoinHandle<()> {
        let lock = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(every);
            loop {
                tick.tick().await;
                lock.cleanup_expired();
            }
        })
    }
}

impl Default for EchoLock {
    fn default() -> Self {
        Self::new(Duration::from_millis(DEFAULT_ECHO_TTL_MS))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_and_expire() {
        let lock = EchoLock::new(Duration::from_millis(20));
        let path = Path::new("/data/a.txt");

        assert!(!lock.is_locked(path));
        lock.acquire(path);
        assert!(lock.is_locked(path));
        assert!(lock.time_remaining(path).is_some());
        assert!(!lock.is_locked(Path::new("/data/b.txt")));

        std::thread::sleep(Duration::from_millis(30));

        // Expired even before the sweeper runs
        assert!(!lock.is_locked(path));
        assert!(lock.time_remaining(path).is_none());
        assert_eq!(lock.len(), 1);

        assert_eq!(lock.cleanup_expired(), 1);
        assert!(lock.is_empty());
    }

    #[test]
    fn test_latest_acquire_wins() {
        let lock = EchoLock::new(Duration::from_secs(60));
        let path = Path::new("/data/x");

        lock.acquire(path);
        lock.acquire_for(path, Duration::from_millis(5));
        std::thread::sleep(Duration::from_millis(15));
        assert!(!lock.is_locked(path));

        lock.acquire(path);
        assert!(lock.is_locked(path));
        assert_eq!(lock.len(), 1);
    }

    #[test]
    fn test_concurrent_acquire() {
        let lock = EchoLock::new(Duration::from_secs(60));
        let mut handles = Vec::new();

        for t in 0..8 {
            let lock = lock.clone();
            handles.push(std::thread::spawn(move || {
                for i in 0..200 {
                    let shared = PathBuf::from("/data/shared");
                    lock.acquire(&shared);
                    assert!(lock.is_locked(&shared));
                    lock.acquire(&PathBuf::from(format!("/data/t{}/{}", t, i)));
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        // One shared entry plus every per-thread path, no lost updates
        assert_eq!(lock.len(), 1 + 8 * 200);
        assert!(lock.is_locked(Path::new("/data/shared")));
        assert_eq!(lock.cleanup_expired(), 0);
    }

    #[tokio::test]
    async fn test_sweeper_purges() {
        let lock = EchoLock::new(Duration::from_millis(10));
        lock.acquire(Path::new("/data/gone"));

        let sweeper = lock.spawn_sweeper(Duration::from_millis(5));
        tokio::time::sleep(Duration::from_millis(50)).await;
        sweeper.abort();

        assert!(lock.is_empty());
    }
}
