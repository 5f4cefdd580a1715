//! WebSocket client for a `RegistryServer`.
//!
//! Provides:
//! - Connection lifecycle with a reconnect supervisor (exponential backoff)
//! - Request/ack round trips for writes and bindings
//! - Per-namespace snapshot feeds, closed whenever the connection drops
//! - Heartbeat pings so the server's idle timeout only fires on dead links
//!
//! Nothing armed on one connection carries over to the next. Callers watch
//! `connectivity()` and re-arm after every new epoch.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::MissedTickBehavior;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use super::protocol::{ProtocolError, RegistryMessage};
use super::{Connectivity, DisconnectAction, EphemeralRegistry, RegistrySnapshot};
use crate::feed::{Feed, Subscription};
use easel_core::CollabError;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server URL, e.g. `ws://127.0.0.1:9191`
    pub url: String,
    /// Interval between client pings
    pub heartbeat_interval: Duration,
    /// First reconnect delay
    pub backoff_min: Duration,
    /// Reconnect delay ceiling
    pub backoff_max: Duration,
    /// Buffered snapshots per namespace feed
    pub feed_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:9191".to_string(),
            heartbeat_interval: Duration::from_secs(10),
            backoff_min: Duration::from_millis(100),
            backoff_max: Duration::from_secs(5),
            feed_capacity: 256,
        }
    }
}

impl ClientConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }
}

/// Why a live connection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkEnd {
    Lost,
    Forced,
}

/// State of the current physical connection.
struct Link {
    epoch: u64,
    out: mpsc::UnboundedSender<RegistryMessage>,
    pending: HashMap<u64, oneshot::Sender<Result<(), ProtocolError>>>,
    feeds: HashMap<String, Feed<RegistrySnapshot>>,
    kill: Option<oneshot::Sender<()>>,
}

/// Channels the driver task needs for one link.
struct LinkIo {
    epoch: u64,
    ws: WsStream,
    out_rx: mpsc::UnboundedReceiver<RegistryMessage>,
    kill_rx: oneshot::Receiver<()>,
}

struct ClientShared {
    config: ClientConfig,
    link: Mutex<Option<Link>>,
    connectivity: watch::Sender<Connectivity>,
    next_seq: AtomicU64,
    next_epoch: AtomicU64,
    shutdown: AtomicBool,
}

impl ClientShared {
    fn link(&self) -> MutexGuard<'_, Option<Link>> {
        self.link.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a freshly opened socket as the current link.
    fn install(&self, ws: WsStream) -> LinkIo {
        let epoch = self.next_epoch.fetch_add(1, Ordering::SeqCst);
        let (out, out_rx) = mpsc::unbounded_channel();
        let (kill, kill_rx) = oneshot::channel();
        *self.link() = Some(Link {
            epoch,
            out,
            pending: HashMap::new(),
            feeds: HashMap::new(),
            kill: Some(kill),
        });
        self.connectivity.send_replace(Connectivity::up(epoch));
        log::info!("Connected to registry {} (epoch {epoch})", self.config.url);
        LinkIo { epoch, ws, out_rx, kill_rx }
    }

    /// Forget link `epoch`: fail its pending requests, end its feeds and
    /// report the drop.
    fn teardown(&self, epoch: u64) {
        let link = {
            let mut guard = self.link();
            if guard.as_ref().map(|link| link.epoch) == Some(epoch) {
                guard.take()
            } else {
                None
            }
        };
        let Some(link) = link else {
            return;
        };
        for feed in link.feeds.values() {
            feed.close();
        }
        if !link.pending.is_empty() {
            log::debug!("Failing {} pending registry requests", link.pending.len());
        }
        drop(link);
        self.connectivity.send_modify(|c| {
            if c.epoch == epoch {
                *c = c.down();
            }
        });
        log::info!("Registry connection epoch {epoch} closed");
    }

    fn dispatch(&self, epoch: u64, msg: RegistryMessage) {
        let mut guard = self.link();
        let Some(link) = guard.as_mut().filter(|link| link.epoch == epoch) else {
            return;
        };
        match msg {
            RegistryMessage::Ack { seq } => {
                if let Some(reply) = link.pending.remove(&seq) {
                    let _ = reply.send(Ok(()));
                }
            }
            RegistryMessage::Error { seq, message } => {
                log::warn!("Registry rejected request {seq}: {message}");
                if let Some(reply) = link.pending.remove(&seq) {
                    let _ = reply.send(Err(ProtocolError::Rejected(message)));
                }
            }
            RegistryMessage::Snapshot { namespace, entries } => {
                if let Some(feed) = link.feeds.get(&namespace) {
                    feed.publish(entries);
                }
            }
            RegistryMessage::Ping => {
                let _ = link.out.send(RegistryMessage::Pong);
            }
            RegistryMessage::Pong => {}
            other => log::warn!("Unexpected {} message from server", other.kind()),
        }
    }

    async fn request(&self, build: impl FnOnce(u64) -> RegistryMessage) -> Result<(), CollabError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        {
            let mut guard = self.link();
            let link = guard.as_mut().ok_or(ProtocolError::ConnectionClosed)?;
            let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
            link.out
                .send(build(seq))
                .map_err(|_| ProtocolError::ConnectionClosed)?;
            link.pending.insert(seq, reply_tx);
        }
        match reply_rx.await {
            Ok(result) => result.map_err(CollabError::from),
            Err(_) => Err(ProtocolError::ConnectionClosed.into()),
        }
    }
}

/// Networked `EphemeralRegistry`.
pub struct RegistryClient {
    shared: Arc<ClientShared>,
}

impl RegistryClient {
    /// Open the first connection and start the reconnect supervisor. Fails
    /// if the server is unreachable now; later drops are retried.
    pub async fn connect(config: ClientConfig) -> Result<Self, CollabError> {
        let (ws, _) = tokio_tungstenite::connect_async(&config.url)
            .await
            .map_err(ProtocolError::from)?;

        let shared = Arc::new(ClientShared {
            config,
            link: Mutex::new(None),
            connectivity: watch::Sender::new(Connectivity::default()),
            next_seq: AtomicU64::new(1),
            next_epoch: AtomicU64::new(1),
            shutdown: AtomicBool::new(false),
        });
        let io = shared.install(ws);
        tokio::spawn(supervise(shared.clone(), io));
        Ok(Self { shared })
    }

    /// Drop the current connection and open a new one immediately.
    pub fn reconnect(&self) {
        let kill = self.shared.link().as_mut().and_then(|link| link.kill.take());
        if let Some(kill) = kill {
            let _ = kill.send(());
        }
    }

    /// Shut down for good. Bindings on the server fire.
    pub fn close(&self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        self.reconnect();
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connectivity.borrow().connected
    }

    pub fn url(&self) -> &str {
        &self.shared.config.url
    }
}

impl Drop for RegistryClient {
    fn drop(&mut self) {
        self.close();
    }
}

async fn supervise(shared: Arc<ClientShared>, first: LinkIo) {
    let mut next = Some(first);
    let mut backoff = shared.config.backoff_min;

    loop {
        let io = match next.take() {
            Some(io) => io,
            None => match tokio_tungstenite::connect_async(&shared.config.url).await {
                Ok((ws, _)) => {
                    backoff = shared.config.backoff_min;
                    shared.install(ws)
                }
                Err(e) => {
                    log::warn!("Reconnect to {} failed: {e}; retrying in {backoff:?}", shared.config.url);
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(shared.config.backoff_max);
                    if shared.shutdown.load(Ordering::SeqCst) {
                        return;
                    }
                    continue;
                }
            },
        };

        let epoch = io.epoch;
        let end = drive(&shared, io).await;
        shared.teardown(epoch);

        if shared.shutdown.load(Ordering::SeqCst) {
            log::debug!("Registry client shut down");
            return;
        }
        if end == LinkEnd::Lost {
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(shared.config.backoff_max);
            if shared.shutdown.load(Ordering::SeqCst) {
                return;
            }
        }
    }
}

/// Pump one connection until it ends.
async fn drive(shared: &ClientShared, io: LinkIo) -> LinkEnd {
    let LinkIo { epoch, ws, mut out_rx, mut kill_rx } = io;
    let (mut sink, mut stream) = ws.split();

    let mut heartbeat = tokio::time::interval(shared.config.heartbeat_interval);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let end = loop {
        tokio::select! {
            msg = stream.next() => {
                match msg {
                    Some(Ok(Message::Binary(data))) => match RegistryMessage::decode(&data) {
                        Ok(msg) => shared.dispatch(epoch, msg),
                        Err(e) => log::warn!("Failed to decode registry message: {e}"),
                    },
                    Some(Ok(Message::Close(_))) | None => break LinkEnd::Lost,
                    Some(Err(e)) => {
                        log::warn!("Registry connection error: {e}");
                        break LinkEnd::Lost;
                    }
                    Some(Ok(_)) => {}
                }
            }

            Some(outgoing) = out_rx.recv() => {
                let sent = match outgoing.encode() {
                    Ok(bytes) => sink.send(Message::Binary(bytes.into())).await,
                    Err(e) => {
                        log::error!("Failed to encode {} message: {e}", outgoing.kind());
                        continue;
                    }
                };
                if let Err(e) = sent {
                    log::warn!("Registry send failed: {e}");
                    break LinkEnd::Lost;
                }
            }

            _ = heartbeat.tick() => {
                let ping = match RegistryMessage::Ping.encode() {
                    Ok(bytes) => bytes,
                    Err(_) => continue,
                };
                if sink.send(Message::Binary(ping.into())).await.is_err() {
                    break LinkEnd::Lost;
                }
            }

            _ = &mut kill_rx => break LinkEnd::Forced,
        }
    };

    let _ = sink.close().await;
    end
}

#[async_trait]
impl EphemeralRegistry for RegistryClient {
    async fn set(&self, namespace: &str, key: &str, value: Vec<u8>) -> Result<(), CollabError> {
        self.shared
            .request(|seq| RegistryMessage::Set {
                seq,
                namespace: namespace.to_string(),
                key: key.to_string(),
                value,
            })
            .await
    }

    async fn remove(&self, namespace: &str, key: &str) -> Result<(), CollabError> {
        self.shared
            .request(|seq| RegistryMessage::Remove {
                seq,
                namespace: namespace.to_string(),
                key: key.to_string(),
            })
            .await
    }

    async fn on_disconnect(
        &self,
        namespace: &str,
        key: &str,
        action: DisconnectAction,
    ) -> Result<(), CollabError> {
        self.shared
            .request(|seq| RegistryMessage::OnDisconnect {
                seq,
                namespace: namespace.to_string(),
                key: key.to_string(),
                action,
            })
            .await
    }

    async fn cancel_on_disconnect(&self, namespace: &str, key: &str) -> Result<(), CollabError> {
        self.shared
            .request(|seq| RegistryMessage::CancelOnDisconnect {
                seq,
                namespace: namespace.to_string(),
                key: key.to_string(),
            })
            .await
    }

    async fn subscribe(&self, namespace: &str) -> Result<Subscription<RegistrySnapshot>, CollabError> {
        let subscription = {
            let mut guard = self.shared.link();
            let link = guard.as_mut().ok_or(ProtocolError::ConnectionClosed)?;
            let capacity = self.shared.config.feed_capacity;
            link.feeds
                .entry(namespace.to_string())
                .or_insert_with(|| Feed::new(capacity))
                .subscribe()
        };
        self.shared
            .request(|seq| RegistryMessage::Subscribe {
                seq,
                namespace: namespace.to_string(),
            })
            .await?;
        Ok(subscription)
    }

    fn connectivity(&self) -> watch::Receiver<Connectivity> {
        self.shared.connectivity.subscribe()
    }
}
