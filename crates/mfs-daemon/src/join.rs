//! Join synchronization
//!
//! A newly started host (the requester) asks its peers for a full snapshot
//! of the replicated tree:
//!
//! ```text
//! requester                         responder
//!     │  SYNC  request{hostname: H}     │
//!     │ ──────────────────────────────▶ │ walk root
//!     │  CREATE/WRITE  target_host = H  │
//!     │ ◀────────────────────────────── │ (one message per entry)
//!     │  SYNC  response{H, done}        │
//!     │ ◀────────────────────────────── │
//! ```
//!
//! The requester blocks until a `done` response for its own host arrives,
//! optionally bounded by a timeout.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use mfs_core::{ChangeEvent, Channel, Operation, ProtocolError, SyncMessage, SyncStatus};

use crate::bus::{BusError, MessageBus, Subscription};
use crate::publisher::Publisher;

/// Join errors
#[derive(Debug, Error)]
pub enum JoinError {
    #[error("no snapshot completed within {0:?}")]
    Timeout(Duration),

    #[error("sync channel closed before the snapshot completed")]
    Closed,

    #[error(transparent)]
    Bus(#[from] BusError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Requester-side state of one join handshake
pub struct SyncSession {
    requesting_host: String,
    status: watch::Sender<SyncStatus>,
}

impl SyncSession {
    pub fn new(requesting_host: impl Into<String>) -> Self {
        let (status, _) = watch::channel(SyncStatus::Pending);
        Self {
            requesting_host: requesting_host.into(),
            status,
        }
    }

    pub fn requesting_host(&self) -> &str {
        &self.requesting_host
    }

    pub fn status(&self) -> SyncStatus {
        *self.status.borrow()
    }

    pub fn is_done(&self) -> bool {
        self.status() == SyncStatus::Done
    }

    /// Move to `Done`. Returns true only for the first call.
    pub fn mark_done(&self) -> bool {
        self.status.send_if_modified(|status| {
            if *status == SyncStatus::Done {
                false
            } else {
                *status = SyncStatus::Done;
                true
            }
        })
    }

    /// Resolve once the session is done
    pub async fn wait(&self) {
        let mut rx = self.status.subscribe();
        // The sender lives in `self`, so this only ends on `Done`
        let _ = rx.wait_for(|status| *status == SyncStatus::Done).await;
    }
}

/// Ask peers for a snapshot and block until one completes.
///
/// `timeout = None` waits forever.
pub async fn request_snapshot(
    bus: &dyn MessageBus,
    host_id: &str,
    timeout: Option<Duration>,
) -> Result<Arc<SyncSession>, JoinError> {
    let session = Arc::new(SyncSession::new(host_id));

    // Subscribe before asking so the reply cannot be missed
    let mut subscription = bus.subscribe(Channel::Sync.as_str()).await?;

    let request = SyncMessage::request(host_id).encode()?;
    if let Err(e) = bus.publish(Channel::Sync.as_str(), request).await {
        let _ = bus.unsubscribe(subscription).await;
        return Err(e.into());
    }
    info!("Requested snapshot for {}", host_id);

    let waiting = wait_for_done(&mut subscription, &session);
    let result = match timeout {
        Some(limit) => match tokio::time::timeout(limit, waiting).await {
            Ok(result) => result,
            Err(_) => Err(JoinError::Timeout(limit)),
        },
        None => waiting.await,
    };

    if let Err(e) = bus.unsubscribe(subscription).await {
        debug!("Unsubscribe from sync channel failed: {}", e);
    }

    result.map(|()| session)
}

async fn wait_for_done(
    subscription: &mut Subscription,
    session: &SyncSession,
) -> Result<(), JoinError> {
    while let Some(payload) = subscription.next().await {
        match SyncMessage::decode(&payload) {
            Ok(SyncMessage::Response {
                hostname,
                status: SyncStatus::Done,
            }) if hostname == session.requesting_host() => {
                if session.mark_done() {
                    info!("Snapshot for {} complete", hostname);
                }
                return Ok(());
            }
            Ok(other) => debug!("Ignoring sync message: {:?}", other),
            Err(e) => warn!("Undecodable sync message: {}", e),
        }
    }
    Err(JoinError::Closed)
}

/// Serves snapshots to joining hosts
pub struct JoinResponder {
    bus: Arc<dyn MessageBus>,
    publisher: Arc<Publisher>,
    root: PathBuf,
}

impl JoinResponder {
    pub fn new(bus: Arc<dyn MessageBus>, publisher: Arc<Publisher>, root: impl Into<PathBuf>) -> Self {
        Self {
            bus,
            publisher,
            root: root.into(),
        }
    }

    /// Handle sync requests until the subscription ends
    pub async fn run(self, mut subscription: Subscription) {
        while let Some(payload) = subscription.next().await {
            match SyncMessage::decode(&payload) {
                Ok(SyncMessage::Request { hostname }) => {
                    if hostname == self.publisher.host_id() {
                        continue;
                    }
                    self.serve(&hostname).await;
                }
                Ok(SyncMessage::Response { .. }) => {}
                Err(e) => warn!("Undecodable sync message: {}", e),
            }
        }
        debug!("Sync request subscription ended");
    }

    /// Stream the whole tree to `requester`, then report done.
    ///
    /// Returns the number of messages sent for the tree.
    pub async fn serve(&self, requester: &str) -> usize {
        info!("Serving snapshot of {:?} to {}", self.root, requester);

        let root = self.root.clone();
        let entries = match tokio::task::spawn_blocking(move || snapshot_events(&root)).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Snapshot walk failed: {}", e);
                Vec::new()
            }
        };

        let mut sent = 0;
        for event in &entries {
            sent += self.publisher.publish(event, Some(requester)).await;
        }

        match SyncMessage::done(requester).encode() {
            Ok(done) => {
                if let Err(e) = self.bus.publish(Channel::Sync.as_str(), done).await {
                    warn!("Failed to send snapshot completion to {}: {}", requester, e);
                }
            }
            Err(e) => warn!("Failed to encode snapshot completion: {}", e),
        }

        info!(
            "Snapshot for {} sent: {} entries, {} messages",
            requester,
            entries.len(),
            sent
        );
        sent
    }
}

/// Walk `root` depth-first; directories and symlinks become creates, files writes
fn snapshot_events(root: &std::path::Path) -> Vec<ChangeEvent> {
    let mut events = Vec::new();

    for entry in WalkDir::new(root).min_depth(1).follow_links(false) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Snapshot walk error: {}", e);
                continue;
            }
        };

        let file_type = entry.file_type();
        let op = if file_type.is_dir() || file_type.is_symlink() {
            Operation::Create
        } else {
            Operation::Write
        };
        events.push(ChangeEvent::new(entry.into_path(), op));
    }

    events
}
