//! Connection registry, subscriptions, fan-out, and heartbeat eviction.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::protocol::{ClientMessage, NotebookEvent, ServerMessage};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const DEFAULT_OUTBOUND_BUFFER: usize = 256;
const PRESENCE_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Ping period. Connections silent for twice this long are terminated.
    pub heartbeat_interval: Duration,
    /// Queued outbound frames per connection before new ones are dropped.
    pub outbound_buffer: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            outbound_buffer: DEFAULT_OUTBOUND_BUFFER,
        }
    }
}

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Frames queued for a connection's writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// Serialized JSON, shared between all recipients of a broadcast.
    Text(Arc<str>),
    /// Liveness check; the transport sends a protocol-level ping.
    Ping,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub id: String,
    /// The human or agent behind the connection. Several connections may
    /// share one actor (multiple tabs).
    pub actor_id: String,
}

/// A freshly registered connection: its identity, the queue its writer
/// drains, and a token cancelled when the hub terminates it.
pub struct Registration {
    pub info: ConnectionInfo,
    pub outbound: mpsc::Receiver<Outbound>,
    pub closed: CancellationToken,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Client closed the socket.
    Closed,
    /// No liveness signal within 2x the heartbeat interval.
    HeartbeatTimeout,
    /// Read or write failed.
    TransportError,
    /// Server shutting down.
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceEvent {
    Connected {
        connection_id: String,
        actor_id: String,
    },
    Disconnected {
        connection_id: String,
        actor_id: String,
        reason: DisconnectReason,
    },
}

/// Client requests the hub doesn't handle itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    LockCell {
        notebook_id: String,
        cell_id: String,
    },
    UnlockCell {
        notebook_id: String,
        cell_id: String,
    },
    ExecuteCell {
        notebook_id: String,
        cell_id: String,
        code: String,
    },
}

/// Application side of the protocol. Called in arrival order per
/// connection; long work must be spawned, not awaited.
#[async_trait]
pub trait InboundHandler: Send + Sync {
    async fn handle(&self, hub: &Hub, connection: &ConnectionInfo, command: Command);
}

// ---------------------------------------------------------------------------
// Hub
// ---------------------------------------------------------------------------

struct Connection {
    actor_id: String,
    tx: mpsc::Sender<Outbound>,
    subscriptions: HashSet<String>,
    last_seen: Instant,
    /// Pinged by the last heartbeat round and silent since.
    awaiting_pong: bool,
    dropped: u64,
    closed: CancellationToken,
}

/// Connection registry and notebook fan-out.
///
/// Connections and subscription sets live in sharded maps; no operation
/// holds a guard on one map while touching the other.
pub struct Hub {
    config: HubConfig,
    connections: DashMap<String, Connection>,
    notebooks: DashMap<String, HashSet<String>>,
    presence: broadcast::Sender<PresenceEvent>,
}

impl Hub {
    pub fn new(config: HubConfig) -> Self {
        let (presence, _) = broadcast::channel(PRESENCE_CHANNEL_CAPACITY);
        Self {
            config,
            connections: DashMap::new(),
            notebooks: DashMap::new(),
            presence,
        }
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    pub fn subscribe_presence(&self) -> broadcast::Receiver<PresenceEvent> {
        self.presence.subscribe()
    }

    /// Add a connection. Without an actor id the connection is its own actor.
    pub fn register(&self, actor_id: Option<String>) -> Registration {
        let id = uuid::Uuid::new_v4().to_string();
        let actor_id = actor_id
            .filter(|a| !a.is_empty())
            .unwrap_or_else(|| id.clone());
        let (tx, outbound) = mpsc::channel(self.config.outbound_buffer.max(1));
        let closed = CancellationToken::new();

        self.connections.insert(
            id.clone(),
            Connection {
                actor_id: actor_id.clone(),
                tx,
                subscriptions: HashSet::new(),
                last_seen: Instant::now(),
                awaiting_pong: false,
                dropped: 0,
                closed: closed.clone(),
            },
        );
        tracing::info!(connection_id = %id, actor_id = %actor_id, "connection registered");
        let _ = self.presence.send(PresenceEvent::Connected {
            connection_id: id.clone(),
            actor_id: actor_id.clone(),
        });

        Registration {
            info: ConnectionInfo { id, actor_id },
            outbound,
            closed,
        }
    }

    /// Record a liveness signal (any inbound frame counts).
    pub fn mark_alive(&self, connection_id: &str) {
        if let Some(mut conn) = self.connections.get_mut(connection_id) {
            conn.last_seen = Instant::now();
            conn.awaiting_pong = false;
        }
    }

    /// Apply one inbound text frame. Subscription and ping messages are
    /// answered directly; anything else is returned for the application.
    pub fn handle_text(&self, connection_id: &str, text: &str) -> Option<Command> {
        self.mark_alive(connection_id);
        let message = match ClientMessage::parse(text) {
            Ok(message) => message,
            Err(message) => {
                tracing::debug!(connection_id, %message, "rejecting inbound frame");
                self.send_to(connection_id, &ServerMessage::Error { message });
                return None;
            }
        };

        match message {
            ClientMessage::Subscribe { notebook_id } => {
                self.subscribe(connection_id, &notebook_id);
                self.send_to(connection_id, &ServerMessage::Subscribed { notebook_id });
                None
            }
            ClientMessage::Unsubscribe { notebook_id } => {
                self.unsubscribe(connection_id, &notebook_id);
                self.send_to(connection_id, &ServerMessage::Unsubscribed { notebook_id });
                None
            }
            ClientMessage::Ping => {
                self.send_to(connection_id, &ServerMessage::Pong);
                None
            }
            ClientMessage::LockCell {
                notebook_id,
                cell_id,
            } => Some(Command::LockCell {
                notebook_id,
                cell_id,
            }),
            ClientMessage::UnlockCell {
                notebook_id,
                cell_id,
            } => Some(Command::UnlockCell {
                notebook_id,
                cell_id,
            }),
            ClientMessage::ExecuteCell {
                notebook_id,
                cell_id,
                code,
            } => Some(Command::ExecuteCell {
                notebook_id,
                cell_id,
                code,
            }),
        }
    }

    pub fn subscribe(&self, connection_id: &str, notebook_id: &str) -> bool {
        let Some(mut conn) = self.connections.get_mut(connection_id) else {
            return false;
        };
        conn.subscriptions.insert(notebook_id.to_string());
        drop(conn);
        self.notebooks
            .entry(notebook_id.to_string())
            .or_default()
            .insert(connection_id.to_string());
        // A disconnect in between already detached its subscriptions.
        if !self.connections.contains_key(connection_id) {
            self.detach(connection_id, notebook_id);
            return false;
        }
        true
    }

    pub fn unsubscribe(&self, connection_id: &str, notebook_id: &str) -> bool {
        let removed = self
            .connections
            .get_mut(connection_id)
            .is_some_and(|mut conn| conn.subscriptions.remove(notebook_id));
        self.detach(connection_id, notebook_id);
        removed
    }

    /// Queue `event` for every subscriber of its notebook. Never waits: a
    /// full queue drops the frame for that connection only. Returns how many
    /// connections it was queued for.
    pub fn broadcast(&self, event: &NotebookEvent) -> usize {
        let text: Arc<str> = match serde_json::to_string(event) {
            Ok(text) => text.into(),
            Err(e) => {
                tracing::warn!(error = %e, "failed to serialize notebook event");
                return 0;
            }
        };
        let recipients: Vec<String> = match self.notebooks.get(&event.notebook_id) {
            Some(set) => set.iter().cloned().collect(),
            None => return 0,
        };

        let mut delivered = 0;
        for connection_id in recipients {
            if self.enqueue(&connection_id, Outbound::Text(Arc::clone(&text))) {
                delivered += 1;
            }
        }
        tracing::trace!(notebook_id = %event.notebook_id, kind = ?event.kind, delivered, "broadcast");
        delivered
    }

    /// Queue a direct reply for one connection.
    pub fn send_to(&self, connection_id: &str, message: &ServerMessage) -> bool {
        match serde_json::to_string(message) {
            Ok(text) => self.enqueue(connection_id, Outbound::Text(text.into())),
            Err(e) => {
                tracing::warn!(error = %e, "failed to serialize server message");
                false
            }
        }
    }

    /// Remove a connection and its subscriptions. Returns `false` when it was
    /// already gone.
    pub fn disconnect(&self, connection_id: &str, reason: DisconnectReason) -> bool {
        let Some((_, conn)) = self.connections.remove(connection_id) else {
            return false;
        };
        for notebook_id in &conn.subscriptions {
            self.detach(connection_id, notebook_id);
        }
        conn.closed.cancel();

        if conn.dropped > 0 {
            tracing::warn!(connection_id, dropped = conn.dropped, "connection dropped outbound frames");
        }
        tracing::info!(connection_id, actor_id = %conn.actor_id, ?reason, "connection removed");
        let _ = self.presence.send(PresenceEvent::Disconnected {
            connection_id: connection_id.to_string(),
            actor_id: conn.actor_id,
            reason,
        });
        true
    }

    /// One heartbeat round: terminate connections that stayed silent through
    /// the whole previous round, ping the rest. A connection silent since
    /// just before a round is therefore gone one round later, within twice
    /// the interval. Returns the terminated ids.
    pub fn heartbeat_tick(&self) -> Vec<String> {
        let mut expired = Vec::new();
        let mut alive = Vec::new();
        for mut conn in self.connections.iter_mut() {
            if conn.awaiting_pong {
                expired.push((conn.key().clone(), conn.last_seen.elapsed()));
            } else {
                conn.awaiting_pong = true;
                alive.push(conn.key().clone());
            }
        }

        for connection_id in &alive {
            self.enqueue(connection_id, Outbound::Ping);
        }
        expired
            .into_iter()
            .map(|(connection_id, silent)| {
                tracing::warn!(connection_id = %connection_id, silent_ms = silent.as_millis(), "heartbeat timeout");
                self.disconnect(&connection_id, DisconnectReason::HeartbeatTimeout);
                connection_id
            })
            .collect()
    }

    /// Run [`heartbeat_tick`](Self::heartbeat_tick) every interval until
    /// `shutdown` is cancelled.
    pub fn run_heartbeat(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let hub = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(hub.config.heartbeat_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately; nobody is overdue yet.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        hub.heartbeat_tick();
                    }
                    _ = shutdown.cancelled() => return,
                }
            }
        })
    }

    /// Disconnect everyone.
    pub fn close_all(&self) {
        let ids: Vec<String> = self.connections.iter().map(|c| c.key().clone()).collect();
        for connection_id in ids {
            self.disconnect(&connection_id, DisconnectReason::Shutdown);
        }
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn is_connected(&self, connection_id: &str) -> bool {
        self.connections.contains_key(connection_id)
    }

    /// Live connections belonging to `actor_id`.
    pub fn actor_connections(&self, actor_id: &str) -> usize {
        self.connections
            .iter()
            .filter(|c| c.actor_id == actor_id)
            .count()
    }

    pub fn subscriber_count(&self, notebook_id: &str) -> usize {
        self.notebooks.get(notebook_id).map_or(0, |set| set.len())
    }

    pub fn is_subscribed(&self, connection_id: &str, notebook_id: &str) -> bool {
        self.connections
            .get(connection_id)
            .is_some_and(|c| c.subscriptions.contains(notebook_id))
    }

    /// Frames dropped for a connection because its queue was full.
    pub fn dropped_frames(&self, connection_id: &str) -> Option<u64> {
        self.connections.get(connection_id).map(|c| c.dropped)
    }

    fn enqueue(&self, connection_id: &str, frame: Outbound) -> bool {
        let Some(mut conn) = self.connections.get_mut(connection_id) else {
            return false;
        };
        match conn.tx.try_send(frame) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                conn.dropped += 1;
                if conn.dropped.is_power_of_two() {
                    tracing::debug!(connection_id, dropped = conn.dropped, "outbound queue full, dropping");
                }
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    fn detach(&self, connection_id: &str, notebook_id: &str) {
        if let Some(mut set) = self.notebooks.get_mut(notebook_id) {
            set.remove(connection_id);
        }
        self.notebooks.remove_if(notebook_id, |_, set| set.is_empty());
    }
}
