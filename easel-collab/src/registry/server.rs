//! WebSocket host for a shared Ephemeral Registry.
//!
//! ```text
//! Client A ──┐                    ┌── MemoryRegistry (conn a) ── bindings
//!             ├── RegistryServer ─┤                              │
//! Client B ──┘                    └── MemoryRegistry (conn b)    ▼
//!                                          │               RegistryHub
//!                                          └── Snapshot fan-out ─┘
//! ```
//!
//! Each socket gets its own hub connection. When the socket closes, errors
//! or stays silent past the idle timeout, that connection is dropped and
//! every binding armed on it fires.

use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;

use super::memory::{MemoryRegistry, RegistryHub};
use super::protocol::{ProtocolError, RegistryMessage};
use super::EphemeralRegistry;
use easel_core::CollabError;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Snapshot buffer per subscription
    pub broadcast_capacity: usize,
    /// Interval between server pings and idle checks
    pub heartbeat_interval: Duration,
    /// Silence after which a connection is treated as dead
    pub idle_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9191".to_string(),
            broadcast_capacity: 256,
            heartbeat_interval: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(30),
        }
    }
}

impl ServerConfig {
    /// Defaults overridden by `EASEL_BIND_ADDR`, `EASEL_HEARTBEAT_SECS` and
    /// `EASEL_IDLE_TIMEOUT_SECS`. Without an explicit idle timeout it
    /// follows the heartbeat at 3x.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(addr) = lookup("EASEL_BIND_ADDR") {
            config.bind_addr = addr;
        }
        if let Some(secs) = parse_secs(&lookup, "EASEL_HEARTBEAT_SECS") {
            config.heartbeat_interval = secs;
            config.idle_timeout = secs * 3;
        }
        if let Some(secs) = parse_secs(&lookup, "EASEL_IDLE_TIMEOUT_SECS") {
            config.idle_timeout = secs;
        }
        config
    }
}

fn parse_secs(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<Duration> {
    let raw = lookup(name)?;
    match raw.trim().parse::<u64>() {
        Ok(secs) if secs > 0 => Some(Duration::from_secs(secs)),
        _ => {
            log::warn!("Ignoring {name}={raw:?}: expected a positive number of seconds");
            None
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    /// Connections dropped for silence.
    pub idle_disconnects: u64,
}

type SharedStats = Arc<RwLock<ServerStats>>;

pub struct RegistryServer {
    config: ServerConfig,
    hub: RegistryHub,
    stats: SharedStats,
}

impl RegistryServer {
    pub fn new(config: ServerConfig) -> Self {
        let hub = RegistryHub::new(config.broadcast_capacity);
        Self {
            config,
            hub,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Bind the configured address and serve forever.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Registry server listening on {}", self.config.bind_addr);
        self.run_on(listener).await
    }

    /// Serve on an already-bound listener.
    pub async fn run_on(&self, listener: TcpListener) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let hub = self.hub.clone();
            let stats = self.stats.clone();
            let config = self.config.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, hub, stats, config).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        hub: RegistryHub,
        stats: SharedStats,
        config: ServerConfig,
    ) -> Result<(), ProtocolError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        log::info!("WebSocket connection established from {addr}");

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let registry = hub.connect();
        let mut forwards: HashMap<String, JoinHandle<()>> = HashMap::new();
        let result = Self::serve(ws_stream, addr, &registry, &mut forwards, &stats, &config).await;

        for (_, task) in forwards.drain() {
            task.abort();
        }
        registry.disconnect();

        {
            let mut s = stats.write().await;
            s.active_connections = s.active_connections.saturating_sub(1);
        }
        result
    }

    async fn serve(
        ws_stream: tokio_tungstenite::WebSocketStream<TcpStream>,
        addr: SocketAddr,
        registry: &MemoryRegistry,
        forwards: &mut HashMap<String, JoinHandle<()>>,
        stats: &SharedStats,
        config: &ServerConfig,
    ) -> Result<(), ProtocolError> {
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<RegistryMessage>();

        let mut heartbeat = tokio::time::interval(config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_seen = Instant::now();

        loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            last_seen = Instant::now();
                            {
                                let mut s = stats.write().await;
                                s.total_messages += 1;
                                s.total_bytes += data.len() as u64;
                            }
                            match RegistryMessage::decode(&data) {
                                Ok(request) => {
                                    Self::handle_message(request, registry, &out_tx, forwards).await;
                                }
                                Err(e) => log::warn!("Failed to decode message from {addr}: {e}"),
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            last_seen = Instant::now();
                            ws_sender.send(Message::Pong(data)).await?;
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Connection closed from {addr}");
                            return Ok(());
                        }
                        Some(Err(e)) => {
                            log::error!("WebSocket error from {addr}: {e}");
                            return Ok(());
                        }
                        Some(Ok(_)) => {
                            last_seen = Instant::now();
                        }
                    }
                }

                Some(outgoing) = out_rx.recv() => {
                    let encoded = outgoing.encode()?;
                    ws_sender.send(Message::Binary(encoded.into())).await?;
                }

                _ = heartbeat.tick() => {
                    if last_seen.elapsed() > config.idle_timeout {
                        log::warn!(
                            "Connection from {addr} silent for {:?}, dropping",
                            last_seen.elapsed()
                        );
                        stats.write().await.idle_disconnects += 1;
                        return Ok(());
                    }
                    let ping = RegistryMessage::Ping.encode()?;
                    ws_sender.send(Message::Binary(ping.into())).await?;
                }
            }
        }
    }

    /// Apply one client message. Replies go through `out` so they stay
    /// ordered with snapshot fan-out.
    async fn handle_message(
        msg: RegistryMessage,
        registry: &MemoryRegistry,
        out: &mpsc::UnboundedSender<RegistryMessage>,
        forwards: &mut HashMap<String, JoinHandle<()>>,
    ) {
        log::trace!("Registry request: {}", msg.kind());
        let reply = match msg {
            RegistryMessage::Set { seq, namespace, key, value } => {
                reply_for(seq, registry.set(&namespace, &key, value).await)
            }
            RegistryMessage::Remove { seq, namespace, key } => {
                reply_for(seq, registry.remove(&namespace, &key).await)
            }
            RegistryMessage::OnDisconnect { seq, namespace, key, action } => {
                reply_for(seq, registry.on_disconnect(&namespace, &key, action).await)
            }
            RegistryMessage::CancelOnDisconnect { seq, namespace, key } => {
                reply_for(seq, registry.cancel_on_disconnect(&namespace, &key).await)
            }
            RegistryMessage::Subscribe { seq, namespace } => {
                match registry.subscribe(&namespace).await {
                    Ok(mut subscription) => {
                        let _ = out.send(RegistryMessage::Ack { seq });
                        let tx = out.clone();
                        let ns = namespace.clone();
                        let task = tokio::spawn(async move {
                            while let Some(entries) = subscription.next().await {
                                let snapshot = RegistryMessage::Snapshot {
                                    namespace: ns.clone(),
                                    entries: (*entries).clone(),
                                };
                                if tx.send(snapshot).is_err() {
                                    break;
                                }
                            }
                        });
                        if let Some(previous) = forwards.insert(namespace, task) {
                            previous.abort();
                        }
                        return;
                    }
                    Err(e) => RegistryMessage::Error { seq, message: e.to_string() },
                }
            }
            RegistryMessage::Unsubscribe { namespace } => {
                if let Some(task) = forwards.remove(&namespace) {
                    task.abort();
                }
                return;
            }
            RegistryMessage::Ping => RegistryMessage::Pong,
            RegistryMessage::Pong => return,
            other => {
                log::warn!("Unexpected {} message from client", other.kind());
                return;
            }
        };
        let _ = out.send(reply);
    }

    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    /// The hub behind every connection, for in-process inspection.
    pub fn hub(&self) -> &RegistryHub {
        &self.hub
    }
}

fn reply_for(seq: u64, result: Result<(), CollabError>) -> RegistryMessage {
    match result {
        Ok(()) => RegistryMessage::Ack { seq },
        Err(e) => RegistryMessage::Error { seq, message: e.to_string() },
    }
}
