//! Replication node wiring
//!
//! Starts the inbound apply tasks, the echo-lock sweeper, the flush loop, the
//! optional watch source and the join role for one host, all sharing one
//! echo lock and one bus handle.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use mfs_core::{Channel, Config, SyncRole};

use crate::applier::{Applier, RetryPolicy};
use crate::bus::{BusError, MessageBus};
use crate::coalescer::{Coalescer, FlushRunner};
use crate::echo_lock::EchoLock;
use crate::join::{request_snapshot, JoinError, JoinResponder, SyncSession};
use crate::publisher::Publisher;
use crate::watcher::FsWatcher;

/// Startup errors
#[derive(Debug, Error)]
pub enum ReplicatorError {
    #[error("cannot prepare root {path:?}: {source}")]
    Root {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Bus(#[from] BusError),

    #[error(transparent)]
    Join(#[from] JoinError),

    #[error("watch failed: {0}")]
    Watch(#[from] notify::Error),
}

/// Local host identity: the OS hostname, or `localhost` if unavailable
pub fn default_host_id() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "localhost".into())
}

/// Runtime settings for one node
#[derive(Clone, Debug)]
pub struct ReplicatorConfig {
    pub root: PathBuf,
    pub host_id: String,
    pub role: SyncRole,
    pub interval: Duration,
    pub echo_ttl: Duration,
    pub join_timeout: Option<Duration>,
    pub retry: RetryPolicy,
    /// Start the filesystem watch source
    pub watch: bool,
}

impl ReplicatorConfig {
    pub fn new(root: impl Into<PathBuf>, host_id: impl Into<String>) -> Self {
        let sync = mfs_core::SyncConfig::default();
        Self {
            root: root.into(),
            host_id: host_id.into(),
            role: SyncRole::default(),
            interval: sync.interval(),
            echo_ttl: sync.echo_ttl(),
            join_timeout: None,
            retry: RetryPolicy::default(),
            watch: true,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        let host_id = config
            .node
            .host_id
            .clone()
            .filter(|h| !h.is_empty())
            .unwrap_or_else(default_host_id);

        Self {
            root: config.node.root.clone(),
            host_id,
            role: config.node.role,
            interval: config.sync.interval(),
            echo_ttl: config.sync.echo_ttl(),
            join_timeout: config.sync.join_timeout(),
            retry: RetryPolicy::new(
                config.sync.apply_attempts,
                Duration::from_millis(config.sync.retry_backoff_ms),
            ),
            watch: true,
        }
    }

    pub fn with_role(mut self, role: SyncRole) -> Self {
        self.role = role;
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_echo_ttl(mut self, ttl: Duration) -> Self {
        self.echo_ttl = ttl;
        self
    }

    pub fn with_join_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.join_timeout = timeout;
        self
    }

    pub fn with_watch(mut self, watch: bool) -> Self {
        self.watch = watch;
        self
    }
}

/// A running replication node
pub struct Replicator {
    config: ReplicatorConfig,
    echo_lock: EchoLock,
    coalescer: Arc<Coalescer>,
    publisher: Arc<Publisher>,
    join_session: Option<Arc<SyncSession>>,
    watcher: Option<FsWatcher>,
    tasks: Vec<JoinHandle<()>>,
}

impl Replicator {
    /// Start every component. A requester returns once its snapshot is done.
    pub async fn start(
        config: ReplicatorConfig,
        bus: Arc<dyn MessageBus>,
    ) -> Result<Self, ReplicatorError> {
        tokio::fs::create_dir_all(&config.root)
            .await
            .map_err(|source| ReplicatorError::Root {
                path: config.root.clone(),
                source,
            })?;

        info!(
            "Starting replication of {:?} as {} ({})",
            config.root, config.host_id, config.role
        );

        let echo_lock = EchoLock::new(config.echo_ttl);
        let coalescer = Arc::new(Coalescer::new(echo_lock.clone()));
        let publisher = Arc::new(Publisher::new(
            bus.clone(),
            config.host_id.clone(),
            config.root.clone(),
            echo_lock.clone(),
        ));
        let applier = Arc::new(
            Applier::new(config.host_id.clone(), config.root.clone(), echo_lock.clone())
                .with_retry(config.retry.clone()),
        );

        let mut replicator = Self {
            config,
            echo_lock,
            coalescer,
            publisher,
            join_session: None,
            watcher: None,
            tasks: Vec::new(),
        };

        // On error the partially started node is dropped, aborting its tasks
        for channel in Channel::FILE_CHANNELS {
            let mut subscription = bus.subscribe(channel.as_str()).await?;
            let applier = applier.clone();
            replicator.tasks.push(tokio::spawn(async move {
                while let Some(payload) = subscription.next().await {
                    let outcome = applier.handle_payload(&payload).await;
                    debug!("{}: {:?}", channel, outcome);
                }
                debug!("Subscription to {} ended", channel);
            }));
        }

        let sweep_every = replicator.config.echo_ttl.max(Duration::from_millis(10));
        replicator
            .tasks
            .push(replicator.echo_lock.spawn_sweeper(sweep_every));

        let runner = FlushRunner::new(replicator.coalescer.clone(), replicator.config.interval);
        let publisher = replicator.publisher.clone();
        replicator.tasks.push(tokio::spawn(runner.run_loop(move |batch| {
            let publisher = publisher.clone();
            async move {
                publisher.publish_batch(batch).await;
            }
        })));

        if replicator.config.watch {
            replicator.watcher = Some(FsWatcher::start(
                replicator.config.root.clone(),
                replicator.coalescer.clone(),
            )?);
        }

        match replicator.config.role {
            SyncRole::Responder => {
                let requests = bus.subscribe(Channel::Sync.as_str()).await?;
                let responder = JoinResponder::new(
                    bus.clone(),
                    replicator.publisher.clone(),
                    replicator.config.root.clone(),
                );
                replicator.tasks.push(tokio::spawn(responder.run(requests)));
            }
            SyncRole::Requester => {
                let session = request_snapshot(
                    bus.as_ref(),
                    &replicator.config.host_id,
                    replicator.config.join_timeout,
                )
                .await?;
                replicator.join_session = Some(session);
            }
            SyncRole::Disabled => {}
        }

        info!("Replication of {:?} running", replicator.config.root);
        Ok(replicator)
    }

    pub fn host_id(&self) -> &str {
        &self.config.host_id
    }

    pub fn root(&self) -> &Path {
        &self.config.root
    }

    pub fn coalescer(&self) -> &Arc<Coalescer> {
        &self.coalescer
    }

    pub fn echo_lock(&self) -> &EchoLock {
        &self.echo_lock
    }

    /// Completed join session, requesters only
    pub fn join_session(&self) -> Option<&Arc<SyncSession>> {
        self.join_session.as_ref()
    }

    /// Publish everything pending now instead of at the next tick
    pub async fn flush_now(&self) -> usize {
        let batch = self.coalescer.flush();
        if batch.is_empty() {
            return 0;
        }
        self.publisher.publish_batch(batch).await
    }

    /// Stop the watch source and every background task
    pub fn shutdown(&mut self) {
        self.watcher = None;
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for Replicator {
    fn drop(&mut self) {
        self.shutdown();
    }
}
