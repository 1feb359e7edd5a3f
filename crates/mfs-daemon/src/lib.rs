//! mfs Daemon - Replicates a directory tree across hosts
//!
//! Every host runs the same node. Local changes flow out, remote changes
//! flow in, both over a publish/subscribe bus:
//!
//! ```text
//! ┌──────────────┐  record   ┌───────────┐  flush   ┌───────────┐
//! │  FsWatcher   │ ────────▶ │ Coalescer │ ───────▶ │ Publisher │ ──▶ bus
//! └──────────────┘           └─────┬─────┘          └───────────┘
//!                                  │ is_locked?
//!                            ┌─────┴─────┐
//!                            │ EchoLock  │
//!                            └─────▲─────┘
//!                                  │ acquire
//! bus ──▶ CREATE/WRITE/REMOVE ──▶ Applier ──▶ local filesystem
//!         MOVE/CHMOD
//! ```
//!
//! The echo lock keeps a remote change that the applier wrote locally from
//! being picked up by the watcher and published a second time. Joining hosts
//! pull a full snapshot over the `SYNC` channel (see [`join`]).

pub mod applier;
pub mod bus;
pub mod coalescer;
pub mod echo_lock;
pub mod join;
pub mod publisher;
pub mod replicator;
pub mod watcher;

pub use applier::{ApplyError, ApplyOutcome, Applier, RetryPolicy};
pub use bus::{normalize_endpoint, BusError, MemoryBus, MessageBus, Subscription, WsBus};
pub use coalescer::{Coalescer, CoalescerStatus, FlushRunner};
pub use echo_lock::{EchoLock, DEFAULT_ECHO_TTL_MS};
pub use join::{request_snapshot, JoinError, JoinResponder, SyncSession};
pub use publisher::Publisher;
pub use replicator::{default_host_id, Replicator, ReplicatorConfig, ReplicatorError};
pub use watcher::FsWatcher;
