//! Outbound publisher
//!
//! Turns coalesced change events into wire messages and publishes them on
//! the bus. File type, mode and content are re-read from disk at publish
//! time; the metadata captured when the event was observed may be stale.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, warn};

use mfs_core::path::to_wire_path;
use mfs_core::{ChangeEvent, FileKind, FileMeta, FileOp, Operation, ProtocolError, WireMessage};

use crate::bus::MessageBus;
use crate::echo_lock::EchoLock;

/// Publishes local changes for one host
pub struct Publisher {
    bus: Arc<dyn MessageBus>,
    host_id: String,
    root: PathBuf,
    echo_lock: EchoLock,
}

impl Publisher {
    pub fn new(
        bus: Arc<dyn MessageBus>,
        host_id: impl Into<String>,
        root: impl Into<PathBuf>,
        echo_lock: EchoLock,
    ) -> Self {
        Self {
            bus,
            host_id: host_id.into(),
            root: root.into(),
            echo_lock,
        }
    }

    pub fn host_id(&self) -> &str {
        &self.host_id
    }

    /// Publish a flushed batch. A failed entry never stops the rest.
    pub async fn publish_batch(&self, events: Vec<ChangeEvent>) -> usize {
        let mut sent = 0;
        for event in &events {
            sent += self.publish(event, None).await;
        }
        sent
    }

    /// Publish one change, broadcast or addressed to `target`.
    ///
    /// Returns the number of messages sent.
    pub async fn publish(&self, event: &ChangeEvent, target: Option<&str>) -> usize {
        let target = target.filter(|t| !t.is_empty());

        // Join snapshots are not echoes, so only broadcasts check the lock
        if target.is_none() && self.is_echo(event) {
            debug!("Not publishing echo of {:?}", event.path);
            return 0;
        }

        let messages = match self.build_messages(event, target).await {
            Some(messages) => messages,
            None => return 0,
        };

        let mut sent = 0;
        for message in messages {
            let channel = message.channel();
            let payload = match message.encode() {
                Ok(payload) => payload,
                Err(e) => {
                    warn!("Dropping {} for {}: {}", message.op.name(), message.path, e);
                    continue;
                }
            };

            match self.bus.publish(channel.as_str(), payload).await {
                Ok(()) => {
                    debug!(
                        "Published {} {} on {} (target: {:?})",
                        message.op.name(),
                        message.path,
                        channel,
                        target
                    );
                    sent += 1;
                }
                Err(e) => warn!("Failed to publish {} on {}: {}", message.path, channel, e),
            }
        }
        sent
    }

    fn is_echo(&self, event: &ChangeEvent) -> bool {
        self.echo_lock.is_locked(&event.path)
            || event
                .old_path
                .as_deref()
                .map(|from| self.echo_lock.is_locked(from))
                .unwrap_or(false)
    }

    async fn build_messages(
        &self,
        event: &ChangeEvent,
        target: Option<&str>,
    ) -> Option<Vec<WireMessage>> {
        let wire_path = match to_wire_path(&self.root, &event.path) {
            Ok(p) => p,
            Err(e) => {
                warn!("Skipping change: {}", e);
                return None;
            }
        };

        let ops = match event.op {
            Operation::Remove => vec![FileOp::Remove],

            Operation::Move => {
                let from = match event.old_path.as_deref() {
                    Some(from) => from,
                    None => {
                        warn!("Move of {:?} without a source path", event.path);
                        return None;
                    }
                };
                match to_wire_path(&self.root, from) {
                    Ok(from) => vec![FileOp::Move { from }],
                    Err(e) => {
                        warn!("Skipping move into {}: {}", wire_path, e);
                        return None;
                    }
                }
            }

            Operation::Create | Operation::Write | Operation::Chmod => {
                let path = event.path.clone();
                let op = event.op;
                let built = tokio::task::spawn_blocking(move || read_ops(&path, op)).await;
                match built {
                    Ok(Ok(ops)) => ops,
                    Ok(Err(e)) => {
                        warn!("Dropping {:?} for {:?}: {}", event.op, event.path, e);
                        return None;
                    }
                    Err(e) => {
                        warn!("Publish task for {:?} failed: {}", event.path, e);
                        return None;
                    }
                }
            }
        };

        Some(
            ops.into_iter()
                .map(|op| {
                    WireMessage::new(self.host_id.as_str(), wire_path.as_str(), op)
                        .with_target(target)
                })
                .collect(),
        )
    }
}

/// Stat (and read) a path for the operations that carry metadata
fn read_ops(path: &Path, op: Operation) -> std::io::Result<Vec<FileOp>> {
    let meta = FileMeta::lstat(path)?;

    let ops = match (op, meta.kind) {
        (Operation::Create, FileKind::Directory) => vec![FileOp::CreateDir {
            mode: meta.mode,
            uid: meta.uid,
            gid: meta.gid,
        }],
        (Operation::Create, FileKind::Symlink) => {
            let target = fs::read_link(path)?.into_os_string().into_string().map_err(|raw| {
                std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    ProtocolError::NonUtf8(raw.to_string_lossy().into_owned()),
                )
            })?;
            vec![FileOp::Symlink { target }]
        }
        (Operation::Create | Operation::Write, FileKind::File) => vec![FileOp::WriteFile {
            mode: meta.mode,
            uid: meta.uid,
            gid: meta.gid,
            content: fs::read(path)?,
        }],
        (Operation::Write, _) => {
            debug!("Write on non-regular file {:?} skipped", path);
            Vec::new()
        }
        (Operation::Chmod, _) => vec![FileOp::Chmod { mode: meta.mode }],
        (Operation::Remove | Operation::Move, _) => Vec::new(),
    };

    Ok(ops)
}
