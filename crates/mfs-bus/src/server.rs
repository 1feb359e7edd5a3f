//! WebSocket bus server implementation

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, info, warn};

use mfs_core::ServerConfig;

use crate::messages::{BusFrame, ErrorCode};
use crate::topic::{Topic, TopicError};
use crate::{CHANNEL_IDLE_TIMEOUT_SECS, CLEANUP_INTERVAL_SECS, MAX_SUBSCRIBERS_PER_CHANNEL};

type ClientTx = mpsc::UnboundedSender<Message>;

/// Server tunables
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Token clients must present in their hello (None = accept any)
    pub token: Option<String>,
    pub max_subscribers_per_channel: usize,
    pub channel_idle_timeout_secs: u64,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            token: None,
            max_subscribers_per_channel: MAX_SUBSCRIBERS_PER_CHANNEL,
            channel_idle_timeout_secs: CHANNEL_IDLE_TIMEOUT_SECS,
        }
    }
}

impl From<&ServerConfig> for ServerOptions {
    fn from(config: &ServerConfig) -> Self {
        Self {
            token: config.token.clone().filter(|t| !t.is_empty()),
            max_subscribers_per_channel: config.max_subscribers_per_channel,
            channel_idle_timeout_secs: config.channel_idle_timeout_secs,
        }
    }
}

/// Bus server state
#[derive(Clone)]
pub struct BusServer {
    /// Channels by name
    topics: Arc<DashMap<String, Topic>>,
    /// Outbound queues of authenticated clients
    clients: Arc<DashMap<String, ClientTx>>,
    options: Arc<ServerOptions>,
}

impl BusServer {
    pub fn new(options: ServerOptions) -> Self {
        Self {
            topics: Arc::new(DashMap::new()),
            clients: Arc::new(DashMap::new()),
            options: Arc::new(options),
        }
    }

    /// Bind `addr` and serve until the listener fails
    pub async fn serve(&self, addr: SocketAddr) -> Result<(), std::io::Error> {
        let listener = TcpListener::bind(addr).await?;
        info!("Bus server listening on {}", addr);
        self.serve_on(listener).await
    }

    /// Serve on an already bound listener
    pub async fn serve_on(&self, listener: TcpListener) -> Result<(), std::io::Error> {
        // Start channel cleanup task
        let topics = self.topics.clone();
        let idle_timeout = self.options.channel_idle_timeout_secs;
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(tokio::time::Duration::from_secs(CLEANUP_INTERVAL_SECS)).await;
                cleanup_idle_topics(&topics, idle_timeout);
            }
        });

        loop {
            let (stream, peer_addr) = listener.accept().await?;
            let server = self.clone();

            tokio::spawn(async move {
                if let Err(e) = server.handle_connection(stream, peer_addr).await {
                    debug!("Connection error from {}: {:?}", peer_addr, e);
                }
            });
        }
    }

    /// Number of channels with state on the server (for monitoring)
    pub fn topic_count(&self) -> usize {
        self.topics.len()
    }

    /// Number of authenticated clients (for monitoring)
    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Handle a single connection (HTTP or WebSocket)
    async fn handle_connection(
        &self,
        mut stream: TcpStream,
        peer_addr: SocketAddr,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        // WebSocket upgrades are GET requests too, so match on the probe paths
        let mut peek_buf = [0u8; 16];
        let n = stream.peek(&mut peek_buf).await?;
        if is_http_probe(&peek_buf[..n]) {
            return self.handle_http_request(&mut stream).await;
        }

        let ws_stream = accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        let writer = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if ws_sender.send(msg).await.is_err() {
                    break;
                }
            }
            let _ = ws_sender.close().await;
        });

        let client_id = generate_client_id();
        debug!("New connection from {} as {}", peer_addr, client_id);

        let mut authenticated = false;
        let mut subscriptions: HashSet<String> = HashSet::new();

        while let Some(msg) = ws_receiver.next().await {
            let text = match msg {
                Ok(Message::Text(text)) => text,
                Ok(Message::Close(_)) => break,
                Ok(Message::Ping(data)) => {
                    let _ = tx.send(Message::Pong(data));
                    continue;
                }
                Ok(_) => continue,
                Err(e) => {
                    debug!("WebSocket error: {:?}", e);
                    break;
                }
            };

            let frame = match BusFrame::from_json(&text) {
                Ok(f) => f,
                Err(e) => {
                    send_frame(
                        &tx,
                        &BusFrame::error(ErrorCode::InvalidFrame, format!("Invalid JSON: {}", e)),
                    );
                    continue;
                }
            };

            if !authenticated {
                match frame {
                    BusFrame::Hello { token, client_name } => {
                        if !self.token_matches(&token) {
                            warn!("Rejected client {} from {}: bad token", client_name, peer_addr);
                            send_frame(&tx, &BusFrame::error(ErrorCode::Unauthorized, "invalid token"));
                            break;
                        }
                        authenticated = true;
                        self.clients.insert(client_id.clone(), tx.clone());
                        info!("Client {} ({}) connected from {}", client_id, client_name, peer_addr);
                        send_frame(
                            &tx,
                            &BusFrame::Welcome {
                                client_id: client_id.clone(),
                            },
                        );
                    }
                    BusFrame::Ping { timestamp } => send_frame(&tx, &BusFrame::Pong { timestamp }),
                    _ => send_frame(
                        &tx,
                        &BusFrame::error(ErrorCode::NotAuthenticated, "send hello first"),
                    ),
                }
                continue;
            }

            if let Some(response) = self.handle_frame(frame, &client_id, &mut subscriptions) {
                send_frame(&tx, &response);
            }
        }

        // Cleanup on disconnect
        self.clients.remove(&client_id);
        for channel in subscriptions {
            if let Some(mut topic) = self.topics.get_mut(&channel) {
                topic.remove_subscriber(&client_id);
            }
        }

        drop(tx);
        let _ = writer.await;

        debug!("Connection closed: {}", client_id);
        Ok(())
    }

    fn token_matches(&self, presented: &str) -> bool {
        match self.options.token.as_deref() {
            None => true,
            Some(expected) => expected == presented,
        }
    }

    /// Handle a frame from an authenticated client
    fn handle_frame(
        &self,
        frame: BusFrame,
        client_id: &str,
        subscriptions: &mut HashSet<String>,
    ) -> Option<BusFrame> {
        match frame {
            BusFrame::Subscribe { channel } => {
                let mut topic = self
                    .topics
                    .entry(channel.clone())
                    .or_insert_with(|| Topic::new(channel.clone()));

                match topic.add_subscriber(client_id, self.options.max_subscribers_per_channel) {
                    Ok(_) => {
                        debug!("Client {} subscribed to {}", client_id, channel);
                        subscriptions.insert(channel);
                        None
                    }
                    Err(TopicError::Full) => Some(BusFrame::error(
                        ErrorCode::ChannelFull,
                        format!("channel {} is full", channel),
                    )),
                }
            }

            BusFrame::Unsubscribe { channel } => {
                if subscriptions.remove(&channel) {
                    if let Some(mut topic) = self.topics.get_mut(&channel) {
                        topic.remove_subscriber(client_id);
                    }
                    debug!("Client {} unsubscribed from {}", client_id, channel);
                }
                None
            }

            BusFrame::Publish { channel, payload } => {
                self.publish(&channel, client_id, payload);
                None
            }

            BusFrame::Ping { timestamp } => Some(BusFrame::Pong { timestamp }),

            BusFrame::Hello { .. } => None,

            _ => Some(BusFrame::error(
                ErrorCode::InvalidFrame,
                "Unhandled frame type",
            )),
        }
    }

    /// Fan a payload out to every subscriber of `channel`, publisher included
    fn publish(&self, channel: &str, from: &str, payload: String) {
        let subscribers = match self.topics.get_mut(channel) {
            Some(mut topic) => {
                topic.touch();
                topic.subscriber_ids()
            }
            None => {
                debug!("Publish to {} with no subscribers", channel);
                return;
            }
        };

        let frame = BusFrame::Deliver {
            channel: channel.to_string(),
            from: from.to_string(),
            payload,
        };
        let json = match frame.to_json() {
            Ok(json) => json,
            Err(e) => {
                warn!("Failed to encode delivery on {}: {}", channel, e);
                return;
            }
        };

        for id in subscribers {
            if let Some(client) = self.clients.get(&id) {
                let _ = client.send(Message::Text(json.clone()));
            }
        }
    }

    /// Handle an HTTP request (for health checks)
    async fn handle_http_request(
        &self,
        stream: &mut TcpStream,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        // Read the HTTP request
        let mut buf = vec![0u8; 1024];
        let n = stream.read(&mut buf).await?;
        let request = String::from_utf8_lossy(&buf[..n]);

        // Parse the request path
        let path = request
            .lines()
            .next()
            .and_then(|line| line.split_whitespace().nth(1))
            .unwrap_or("/");

        let (status, body) = match path {
            "/health" => (
                "200 OK",
                format!(
                    r#"{{"status":"healthy","channels":{},"clients":{}}}"#,
                    self.topic_count(),
                    self.client_count()
                ),
            ),
            "/stats" => {
                let channels: Vec<String> = self
                    .topics
                    .iter()
                    .map(|t| format!(r#""{}":{}"#, t.name, t.subscriber_count()))
                    .collect();
                (
                    "200 OK",
                    format!(
                        r#"{{"clients":{},"channels":{{{}}}}}"#,
                        self.client_count(),
                        channels.join(",")
                    ),
                )
            }
            _ => ("404 Not Found", r#"{"error":"not found"}"#.to_string()),
        };

        let response = format!(
            "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            status,
            body.len(),
            body
        );

        stream.write_all(response.as_bytes()).await?;
        Ok(())
    }
}

impl Default for BusServer {
    fn default() -> Self {
        Self::new(ServerOptions::default())
    }
}

fn send_frame(tx: &ClientTx, frame: &BusFrame) {
    match frame.to_json() {
        Ok(json) => {
            let _ = tx.send(Message::Text(json));
        }
        Err(e) => warn!("Failed to encode frame: {}", e),
    }
}

fn is_http_probe(head: &[u8]) -> bool {
    head.starts_with(b"GET /health") || head.starts_with(b"GET /stats")
}

/// Remove channels nobody subscribes to that have seen no traffic for a while
fn cleanup_idle_topics(topics: &DashMap<String, Topic>, timeout_secs: u64) {
    let to_remove: Vec<String> = topics
        .iter()
        .filter(|t| t.is_empty() && t.is_idle(timeout_secs))
        .map(|t| t.name.clone())
        .collect();

    for name in to_remove {
        topics.remove_if(&name, |_, t| t.is_empty());
        info!("Channel {} removed (idle timeout)", name);
    }
}

/// Generate a unique client ID
fn generate_client_id() -> String {
    static FALLBACK: AtomicU64 = AtomicU64::new(0);

    let mut bytes = [0u8; 8];
    if getrandom::fill(&mut bytes).is_err() {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or_default();
        let seq = FALLBACK.fetch_add(1, Ordering::Relaxed);
        bytes = (nanos ^ seq.rotate_left(32)).to_be_bytes();
    }
    hex::encode(bytes)
}
