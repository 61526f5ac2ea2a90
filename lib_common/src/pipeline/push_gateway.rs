//! # Push Gateway
//!
//! Owns the set of live dashboard connections and fans broadcast envelopes out
//! to them. The gateway is transport-agnostic: each connection is represented by
//! an unbounded outbound queue plus a cancellation token, and the websocket
//! session task (in the server crate) drains the queue onto the socket.
//!
//! ## Connection lifecycle
//!
//! `CONNECTING -> OPEN -> CLOSING -> CLOSED`
//!
//! - **Register**: the id is the remote `address:port`. A connection already
//!   holding that id is terminated first (last connection wins). The new one is
//!   marked alive and sent a `CONNECTION_STATUS` acknowledgement.
//! - **Liveness**: each sweep terminates connections that did not answer the
//!   previous probe, and probes the rest.
//! - **Broadcast**: serialize once, enqueue to every OPEN connection; a failed
//!   enqueue removes only that connection.
//! - **Shutdown**: terminate everything and clear the set.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::pipeline::event_bus::{EventBus, NEW_EVENT, SubscriptionHandle};
use crate::pipeline::model::{BroadcastEnvelope, iso_millis};

/// Default interval between liveness sweeps.
pub const DEFAULT_LIVENESS_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// Frames the gateway itself originates.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "data")]
pub enum ServerFrame {
    #[serde(rename = "CONNECTION_STATUS")]
    ConnectionStatus {
        status: String,
        #[serde(rename = "clientId")]
        client_id: String,
        timestamp: String,
    },
    #[serde(rename = "pong")]
    Pong,
}

#[derive(Debug, Deserialize)]
struct ClientFrame {
    #[serde(rename = "type")]
    frame_type: String,
}

/// What the session task should put on the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundFrame {
    Text(Arc<str>),
    /// Transport-level liveness probe.
    Ping,
    Close,
}

struct ClientConnection {
    generation: u64,
    is_alive: bool,
    last_activity: DateTime<Utc>,
    state: ConnectionState,
    sender: mpsc::UnboundedSender<OutboundFrame>,
    cancel: CancellationToken,
}

impl ClientConnection {
    fn terminate(&mut self) {
        self.state = ConnectionState::Closing;
        let _ = self.sender.send(OutboundFrame::Close);
        self.cancel.cancel();
        self.state = ConnectionState::Closed;
    }
}

/// Handed to the session task that serves one connection.
pub struct Registration {
    pub id: String,
    /// Distinguishes this session from an earlier one with the same id.
    pub generation: u64,
    pub outbound: mpsc::UnboundedReceiver<OutboundFrame>,
    /// Cancelled when the gateway terminates this connection.
    pub cancel: CancellationToken,
}

/// Snapshot of one tracked connection, for diagnostics.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionInfo {
    pub id: String,
    pub is_alive: bool,
    pub last_activity: DateTime<Utc>,
    pub state: ConnectionState,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub terminated: Vec<String>,
    pub probed: usize,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub removed: Vec<String>,
}

#[derive(Default)]
struct Connections {
    next_generation: u64,
    by_id: HashMap<String, ClientConnection>,
}

#[derive(Default)]
pub struct PushGateway {
    connections: Mutex<Connections>,
}

impl PushGateway {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Connections> {
        self.connections.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn connection_id(remote: SocketAddr) -> String {
        format!("{}:{}", remote.ip(), remote.port())
    }

    /// # Register
    ///
    /// Tracks a newly accepted connection and queues its acknowledgement frame.
    pub fn register(&self, remote: SocketAddr) -> Registration {
        let id = Self::connection_id(remote);
        let (sender, outbound) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let mut connections = self.lock();
        if let Some(mut stale) = connections.by_id.remove(&id) {
            warn!(client_id = %id, "Duplicate connection id, terminating previous session");
            stale.terminate();
        }
        connections.next_generation += 1;
        let generation = connections.next_generation;

        let mut connection = ClientConnection {
            generation,
            is_alive: true,
            last_activity: Utc::now(),
            state: ConnectionState::Connecting,
            sender,
            cancel: cancel.clone(),
        };

        let ack = ServerFrame::ConnectionStatus {
            status: "connected".to_string(),
            client_id: id.clone(),
            timestamp: iso_millis(Utc::now()),
        };
        if let Ok(text) = serde_json::to_string(&ack) {
            let _ = connection.sender.send(OutboundFrame::Text(text.into()));
        }
        connection.state = ConnectionState::Open;
        connections.by_id.insert(id.clone(), connection);
        info!(client_id = %id, total = connections.by_id.len(), "Client connected");

        Registration {
            id,
            generation,
            outbound,
            cancel,
        }
    }

    /// Removes the connection if it still belongs to the given session.
    pub fn deregister(&self, id: &str, generation: u64) -> bool {
        let mut connections = self.lock();
        let owned = connections
            .by_id
            .get(id)
            .is_some_and(|c| c.generation == generation);
        if owned {
            if let Some(mut connection) = connections.by_id.remove(id) {
                connection.state = ConnectionState::Closed;
            }
            info!(client_id = %id, total = connections.by_id.len(), "Client disconnected");
        }
        owned
    }

    /// Probe answered or other inbound traffic seen.
    pub fn mark_alive(&self, id: &str, generation: u64) {
        if let Some(connection) = self.lock().by_id.get_mut(id) {
            if connection.generation == generation {
                connection.is_alive = true;
                connection.last_activity = Utc::now();
            }
        }
    }

    /// Handles one inbound text frame. Any frame counts as activity; only
    /// `{"type":"ping"}` gets a reply.
    pub fn handle_inbound(&self, id: &str, generation: u64, text: &str) {
        self.mark_alive(id, generation);
        match serde_json::from_str::<ClientFrame>(text) {
            Ok(frame) if frame.frame_type == "ping" => {
                let Ok(pong) = serde_json::to_string(&ServerFrame::Pong) else { return };
                let connections = self.lock();
                match connections.by_id.get(id) {
                    Some(connection) if connection.generation == generation => {
                        let _ = connection.sender.send(OutboundFrame::Text(pong.into()));
                    }
                    _ => debug!(client_id = %id, generation, "Ping from a replaced session, not answered"),
                }
            }
            Ok(frame) => debug!(client_id = %id, frame_type = %frame.frame_type, "Ignoring client frame"),
            Err(e) => debug!(client_id = %id, error = %e, "Ignoring unparseable client frame"),
        }
    }

    /// # Sweep
    ///
    /// One liveness pass: connections still marked not-alive from the previous
    /// pass are terminated; every other connection is marked not-alive and
    /// probed.
    pub fn sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();
        let mut connections = self.lock();
        connections.by_id.retain(|id, connection| {
            if !connection.is_alive {
                connection.terminate();
                report.terminated.push(id.clone());
                return false;
            }
            connection.is_alive = false;
            if connection.sender.send(OutboundFrame::Ping).is_err() {
                connection.terminate();
                report.terminated.push(id.clone());
                return false;
            }
            report.probed += 1;
            true
        });
        for id in &report.terminated {
            info!(client_id = %id, "Terminated unresponsive client");
        }
        debug!(active = connections.by_id.len(), "Liveness sweep complete");
        report
    }

    /// # Broadcast
    ///
    /// Serializes the envelope once and enqueues it to every OPEN connection.
    pub fn broadcast(&self, envelope: &BroadcastEnvelope) -> BroadcastReport {
        let text: Arc<str> = match serde_json::to_string(envelope) {
            Ok(text) => text.into(),
            Err(e) => {
                warn!(error = %e, "Envelope could not be serialized, dropping");
                return BroadcastReport::default();
            }
        };

        let mut report = BroadcastReport::default();
        let mut connections = self.lock();
        connections.by_id.retain(|id, connection| {
            if connection.state != ConnectionState::Open {
                report.removed.push(id.clone());
                return false;
            }
            match connection.sender.send(OutboundFrame::Text(Arc::clone(&text))) {
                Ok(()) => {
                    report.delivered += 1;
                    true
                }
                Err(_) => {
                    connection.terminate();
                    report.removed.push(id.clone());
                    false
                }
            }
        });
        if !report.removed.is_empty() {
            debug!(removed = ?report.removed, "Pruned connections during broadcast");
        }
        report
    }

    pub fn connection_count(&self) -> usize {
        self.lock().by_id.len()
    }

    pub fn connections(&self) -> Vec<ConnectionInfo> {
        let mut listing: Vec<ConnectionInfo> = self
            .lock()
            .by_id
            .iter()
            .map(|(id, c)| ConnectionInfo {
                id: id.clone(),
                is_alive: c.is_alive,
                last_activity: c.last_activity,
                state: c.state,
            })
            .collect();
        listing.sort_by(|a, b| a.id.cmp(&b.id));
        listing
    }

    /// Terminates every connection and clears the set.
    pub fn shutdown(&self) {
        let mut connections = self.lock();
        let count = connections.by_id.len();
        for (_, mut connection) in connections.by_id.drain() {
            connection.terminate();
        }
        info!(terminated = count, "Push gateway shut down");
    }

    /// Routes every `newEvent` published on the bus into [`Self::broadcast`].
    pub fn attach(self: &Arc<Self>, bus: &EventBus<BroadcastEnvelope>) -> SubscriptionHandle {
        let gateway = Arc::clone(self);
        bus.subscribe(NEW_EVENT, move |envelope| {
            gateway.broadcast(envelope);
        })
    }

    /// Runs sweeps on a fixed interval until shutdown, then terminates all
    /// connections.
    pub async fn run_liveness(self: Arc<Self>, period: Duration, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("Liveness sweeper received shutdown signal.");
                    break;
                }
                _ = ticker.tick() => {
                    let report = self.sweep();
                    info!(
                        active = self.connection_count(),
                        terminated = report.terminated.len(),
                        "Active push connections"
                    );
                }
            }
        }
        self.shutdown();
    }
}
