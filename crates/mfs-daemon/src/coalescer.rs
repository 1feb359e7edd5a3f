//! Change coalescer
//!
//! Collects raw change notifications into a per-path "latest pending change"
//! table and hands the whole table to the publisher on every flush.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, trace};

use mfs_core::{ChangeEvent, Operation};

use crate::echo_lock::EchoLock;

/// Counters for monitoring
#[derive(Clone, Debug, Default)]
pub struct CoalescerStatus {
    /// Paths waiting for the next flush
    pub pending: usize,
    /// Events recorded since start
    pub recorded: u64,
    /// Events dropped because their path held an echo lock
    pub suppressed: u64,
    /// Last flush time
    pub last_flush: Option<Instant>,
}

/// Pending change table
pub struct Coalescer {
    /// Latest change by absolute path
    pending: Mutex<HashMap<PathBuf, ChangeEvent>>,
    echo_lock: EchoLock,
    recorded: AtomicU64,
    suppressed: AtomicU64,
    last_flush: Mutex<Option<Instant>>,
}

impl Coalescer {
    pub fn new(echo_lock: EchoLock) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            echo_lock,
            recorded: AtomicU64::new(0),
            suppressed: AtomicU64::new(0),
            last_flush: Mutex::new(None),
        }
    }

    /// Record a change, overwriting any pending change for the same path.
    ///
    /// Returns false if the path is echo-locked and the change was dropped.
    pub fn record(&self, event: ChangeEvent) -> bool {
        if self.echo_lock.is_locked(&event.path) {
            self.suppressed.fetch_add(1, Ordering::Relaxed);
            trace!("Suppressed echo: {:?} {:?}", event.op, event.path);
            return false;
        }

        let mut pending = self.pending.lock();

        // A rename reported as from/to halves plus a combined event must not
        // also publish a removal of its source
        if event.op == Operation::Move {
            if let Some(from) = &event.old_path {
                if matches!(pending.get(from), Some(prev) if prev.op == Operation::Remove) {
                    pending.remove(from);
                }
            }
        }

        trace!("Recorded {:?} {:?}", event.op, event.path);
        pending.insert(event.path.clone(), event);
        self.recorded.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Take every pending change, leaving the table empty
    pub fn flush(&self) -> Vec<ChangeEvent> {
        let taken = std::mem::take(&mut *self.pending.lock());
        *self.last_flush.lock() = Some(Instant::now());
        taken.into_values().collect()
    }

    /// Check if a path has a pending change
    pub fn is_pending(&self, path: &Path) -> bool {
        self.pending.lock().contains_key(path)
    }

    /// Pending change for a path
    pub fn get_pending(&self, path: &Path) -> Option<ChangeEvent> {
        self.pending.lock().get(path).cloned()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn status(&self) -> CoalescerStatus {
        CoalescerStatus {
            pending: self.pending_count(),
            recorded: self.recorded.load(Ordering::Relaxed),
            suppressed: self.suppressed.load(Ordering::Relaxed),
            last_flush: *self.last_flush.lock(),
        }
    }
}

/// Background flush runner - hands coalesced changes to the publisher
pub struct FlushRunner {
    coalescer: Arc<Coalescer>,
    interval: Duration,
}

impl FlushRunner {
    pub fn new(coalescer: Arc<Coalescer>, interval: Duration) -> Self {
        Self {
            coalescer,
            interval,
        }
    }

    /// Run the flush loop
    ///
    /// Takes a callback that publishes one flushed batch.
    pub async fn run_loop<F, Fut>(self, mut publish_fn: F)
    where
        F: FnMut(Vec<ChangeEvent>) -> Fut,
        Fut: std::future::Future<Output = ()>,
    {
        use tokio::time::{interval, MissedTickBehavior};

        let mut tick = interval(self.interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tick.tick().await;

            let batch = self.coalescer.flush();
            if batch.is_empty() {
                continue;
            }

            debug!("Flushing {} coalesced changes", batch.len());
            publish_fn(batch).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coalescer() -> Coalescer {
        Coalescer::new(EchoLock::new(Duration::from_secs(60)))
    }

    #[test]
    fn test_later_event_overwrites() {
        let c = coalescer();
        c.record(ChangeEvent::new("/data/f", Operation::Create));
        c.record(ChangeEvent::new("/data/f", Operation::Write));

        assert_eq!(c.pending_count(), 1);
        assert_eq!(c.get_pending(Path::new("/data/f")).unwrap().op, Operation::Write);

        let batch = c.flush();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].op, Operation::Write);
        assert_eq!(c.pending_count(), 0);
        assert!(c.flush().is_empty());
    }

    #[test]
    fn test_locked_path_not_recorded() {
        let lock = EchoLock::new(Duration::from_millis(20));
        let c = Coalescer::new(lock.clone());
        let path = Path::new("/data/echo");

        lock.acquire(path);
        assert!(!c.record(ChangeEvent::new(path, Operation::Write)));
        assert!(!c.is_pending(path));

        std::thread::sleep(Duration::from_millis(30));
        assert!(c.record(ChangeEvent::new(path, Operation::Write)));
        assert!(c.is_pending(path));

        let status = c.status();
        assert_eq!(status.suppressed, 1);
        assert_eq!(status.recorded, 1);
    }

    #[test]
    fn test_move_supersedes_source_removal() {
        let c = coalescer();
        c.record(ChangeEvent::new("/data/a", Operation::Remove));
        c.record(ChangeEvent::new("/data/b", Operation::Create));
        c.record(ChangeEvent::moved("/data/a", "/data/b"));

        let batch = c.flush();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].op, Operation::Move);
        assert_eq!(batch[0].old_path, Some(PathBuf::from("/data/a")));
    }

    #[test]
    fn test_move_keeps_unrelated_source_change() {
        let c = coalescer();
        c.record(ChangeEvent::new("/data/a", Operation::Write));
        c.record(ChangeEvent::moved("/data/a", "/data/b"));
        assert_eq!(c.pending_count(), 2);
    }

    #[test]
    fn test_flush_records_time() {
        let c = coalescer();
        assert!(c.status().last_flush.is_none());
        c.flush();
        assert!(c.status().last_flush.is_some());
    }

    #[tokio::test]
    async fn test_flush_runner_publishes_batches() {
        let c = Arc::new(coalescer());
        c.record(ChangeEvent::new("/data/one", Operation::Write));
        c.record(ChangeEvent::new("/data/two", Operation::Remove));

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let runner = FlushRunner::new(c.clone(), Duration::from_millis(10));
        let handle = tokio::spawn(runner.run_loop(move |batch| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(batch);
            }
        }));

        let batch = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        handle.abort();

        assert_eq!(batch.len(), 2);
        assert_eq!(c.pending_count(), 0);
    }
}
