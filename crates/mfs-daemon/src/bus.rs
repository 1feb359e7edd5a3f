//! Message bus client seam
//!
//! The replication core talks to the bus only through [`MessageBus`]:
//! publish a payload on a channel, subscribe to a channel, unsubscribe.
//! Two implementations are provided:
//! - [`WsBus`] connects to an `mfs-bus` server over WebSocket
//! - [`MemoryBus`] delivers in-process, used to wire several nodes together in tests

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};
use url::Url;

use mfs_bus::BusFrame;
use mfs_core::ProtocolError;

/// Bus errors
#[derive(Debug, Error)]
pub enum BusError {
    #[error("invalid bus endpoint {endpoint}: {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },

    #[error("no bus endpoint reachable: {0}")]
    Unreachable(String),

    #[error("bus rejected handshake: {0}")]
    Rejected(String),

    #[error("bus operation timed out")]
    Timeout,

    #[error("websocket error: {0}")]
    WebSocket(String),

    #[error("bus connection closed")]
    Closed,

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// A live subscription to one channel
pub struct Subscription {
    id: u64,
    channel: String,
    rx: mpsc::UnboundedReceiver<String>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Next payload published on the channel, `None` once the bus is gone
    pub async fn next(&mut self) -> Option<String> {
        self.rx.recv().await
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("channel", &self.channel)
            .finish()
    }
}

/// Publish/subscribe transport used by the replication core
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Publish a payload to every subscriber of `channel`
    async fn publish(&self, channel: &str, payload: String) -> Result<(), BusError>;

    /// Start receiving payloads published on `channel`
    async fn subscribe(&self, channel: &str) -> Result<Subscription, BusError>;

    /// Stop a subscription
    async fn unsubscribe(&self, subscription: Subscription) -> Result<(), BusError>;
}

/// Local subscriber registry shared by both bus implementations
#[derive(Default)]
struct Subscribers {
    next_id: AtomicU64,
    channels: DashMap<String, Vec<(u64, mpsc::UnboundedSender<String>)>>,
}

impl Subscribers {
    /// Register a subscriber. The flag is true for the first one on the channel.
    fn add(&self, channel: &str) -> (Subscription, bool) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();

        let mut entry = self.channels.entry(channel.to_string()).or_default();
        let first = entry.is_empty();
        entry.push((id, tx));

        (
            Subscription {
                id,
                channel: channel.to_string(),
                rx,
            },
            first,
        )
    }

    /// Drop a subscriber. Returns true if the channel has none left.
    fn remove(&self, channel: &str, id: u64) -> bool {
        let mut last = false;
        if let Some(mut entry) = self.channels.get_mut(channel) {
            entry.retain(|(sub_id, _)| *sub_id != id);
            last = entry.is_empty();
        }
        if last {
            self.channels.remove_if(channel, |_, subs| subs.is_empty());
        }
        last
    }

    /// Hand a payload to every live subscriber of `channel`
    fn dispatch(&self, channel: &str, payload: &str) -> usize {
        let mut delivered = 0;
        if let Some(mut entry) = self.channels.get_mut(channel) {
            entry.retain(|(_, tx)| tx.send(payload.to_string()).is_ok());
            delivered = entry.len();
        }
        delivered
    }
}

/// In-process bus. Clones share the same channels.
#[derive(Clone, Default)]
pub struct MemoryBus {
    subscribers: Arc<Subscribers>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MessageBus for MemoryBus {
    async fn publish(&self, channel: &str, payload: String) -> Result<(), BusError> {
        let delivered = self.subscribers.dispatch(channel, &payload);
        debug!("memory bus: {} -> {} subscribers", channel, delivered);
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription, BusError> {
        Ok(self.subscribers.add(channel).0)
    }

    async fn unsubscribe(&self, subscription: Subscription) -> Result<(), BusError> {
        self.subscribers.remove(&subscription.channel, subscription.id);
        Ok(())
    }
}

/// WebSocket client for an `mfs-bus` server
pub struct WsBus {
    client_id: String,
    endpoint: String,
    subscribers: Arc<Subscribers>,
    outbound: mpsc::UnboundedSender<Message>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl WsBus {
    /// Connect to the first reachable endpoint, in order
    pub async fn connect(
        endpoints: &[String],
        token: &str,
        client_name: &str,
        connect_timeout: Duration,
    ) -> Result<Self, BusError> {
        let mut last_error = String::from("no endpoints configured");

        for endpoint in endpoints {
            match Self::connect_one(endpoint, token, client_name, connect_timeout).await {
                Ok(bus) => return Ok(bus),
                Err(BusError::Rejected(reason)) => return Err(BusError::Rejected(reason)),
                Err(e) => {
                    warn!("Bus endpoint {} unavailable: {}", endpoint, e);
                    last_error = format!("{}: {}", endpoint, e);
                }
            }
        }

        Err(BusError::Unreachable(last_error))
    }

    async fn connect_one(
        endpoint: &str,
        token: &str,
        client_name: &str,
        connect_timeout: Duration,
    ) -> Result<Self, BusError> {
        let url = normalize_endpoint(endpoint)?;
        debug!("Connecting to bus: {}", url);

        let (mut ws, _response) = timeout(connect_timeout, connect_async(url.as_str()))
            .await
            .map_err(|_| BusError::Timeout)?
            .map_err(|e| BusError::WebSocket(e.to_string()))?;

        let hello = BusFrame::Hello {
            token: token.to_string(),
            client_name: client_name.to_string(),
        };
        let json = hello
            .to_json()
            .map_err(|e| BusError::WebSocket(e.to_string()))?;
        ws.send(Message::Text(json))
            .await
            .map_err(|e| BusError::WebSocket(e.to_string()))?;

        // Wait for welcome
        let client_id = loop {
            let msg = timeout(connect_timeout, ws.next())
                .await
                .map_err(|_| BusError::Timeout)?;

            match msg {
                Some(Ok(Message::Text(text))) => match BusFrame::from_json(&text) {
                    Ok(BusFrame::Welcome { client_id }) => break client_id,
                    Ok(BusFrame::Error { message, .. }) => return Err(BusError::Rejected(message)),
                    Ok(other) => debug!("Ignoring frame before welcome: {:?}", other),
                    Err(e) => return Err(BusError::WebSocket(e.to_string())),
                },
                Some(Ok(Message::Close(_))) | None => return Err(BusError::Closed),
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(BusError::WebSocket(e.to_string())),
            }
        };

        let (mut sink, mut stream) = ws.split();
        let (outbound, mut rx) = mpsc::unbounded_channel::<Message>();

        let writer = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if let Err(e) = sink.send(msg).await {
                    warn!("Bus write failed: {}", e);
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let subscribers = Arc::new(Subscribers::default());
        let reader = {
            let subscribers = subscribers.clone();
            let outbound = outbound.clone();
            let endpoint = endpoint.to_string();
            tokio::spawn(async move {
                while let Some(msg) = stream.next().await {
                    let text = match msg {
                        Ok(Message::Text(text)) => text,
                        Ok(Message::Close(_)) => break,
                        Ok(_) => continue,
                        Err(e) => {
                            warn!("Bus read failed: {}", e);
                            break;
                        }
                    };

                    match BusFrame::from_json(&text) {
                        Ok(BusFrame::Deliver { channel, payload, .. }) => {
                            subscribers.dispatch(&channel, &payload);
                        }
                        Ok(BusFrame::Error { code, message }) => {
                            warn!("Bus error {:?}: {}", code, message);
                        }
                        Ok(BusFrame::Ping { timestamp }) => {
                            if let Ok(json) = (BusFrame::Pong { timestamp }).to_json() {
                                let _ = outbound.send(Message::Text(json));
                            }
                        }
                        Ok(other) => debug!("Ignoring bus frame: {:?}", other),
                        Err(e) => warn!("Undecodable bus frame: {}", e),
                    }
                }
                // Dropping the registry senders ends every local subscription
                subscribers.channels.clear();
                warn!("Disconnected from bus {}", endpoint);
            })
        };

        info!("Connected to bus {} as {}", endpoint, client_id);

        Ok(Self {
            client_id,
            endpoint: endpoint.to_string(),
            subscribers,
            outbound,
            reader,
            writer,
        })
    }

    /// Client id assigned by the server
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Endpoint this client is connected to
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn send_frame(&self, frame: &BusFrame) -> Result<(), BusError> {
        let json = frame
            .to_json()
            .map_err(|e| BusError::WebSocket(e.to_string()))?;
        self.outbound
            .send(Message::Text(json))
            .map_err(|_| BusError::Closed)
    }
}

#[async_trait]
impl MessageBus for WsBus {
    async fn publish(&self, channel: &str, payload: String) -> Result<(), BusError> {
        self.send_frame(&BusFrame::Publish {
            channel: channel.to_string(),
            payload,
        })
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription, BusError> {
        let (subscription, first) = self.subscribers.add(channel);
        if first {
            self.send_frame(&BusFrame::Subscribe {
                channel: channel.to_string(),
            })?;
        }
        Ok(subscription)
    }

    async fn unsubscribe(&self, subscription: Subscription) -> Result<(), BusError> {
        if self.subscribers.remove(&subscription.channel, subscription.id) {
            self.send_frame(&BusFrame::Unsubscribe {
                channel: subscription.channel.clone(),
            })?;
        }
        Ok(())
    }
}

impl Drop for WsBus {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}

/// Turn a configured endpoint into a WebSocket URL (`host:port` gets `ws://`)
pub fn normalize_endpoint(endpoint: &str) -> Result<Url, BusError> {
    let endpoint = endpoint.trim();
    let candidate = if endpoint.contains("://") {
        endpoint.to_string()
    } else {
        format!("ws://{}", endpoint)
    };

    let url = Url::parse(&candidate).map_err(|e| BusError::InvalidEndpoint {
        endpoint: endpoint.to_string(),
        reason: e.to_string(),
    })?;

    match url.scheme() {
        "ws" | "wss" => Ok(url),
        other => Err(BusError::InvalidEndpoint {
            endpoint: endpoint.to_string(),
            reason: format!("unsupported scheme {}", other),
        }),
    }
}
