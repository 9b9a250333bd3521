//! WebSocket sync client binding a local [`Replica`] to the sync server.
//!
//! ```text
//!   Replica ── outbox ──► pump ──► outgoing ──► writer ──► server
//!      ▲                                                     │
//!      └── apply / ack / reconcile ◄── reader ◄──────────────┘
//! ```
//!
//! Local edits are pumped to the server only while connected. While
//! offline they stay in the replica's pending log, and every time the
//! server announces its state vector the still-unconfirmed ones are sent
//! again.

use std::collections::HashSet;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};

use charge_core::signal::{Emitter, Notice};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::optimistic::PendingOp;
use crate::protocol::{MessageType, PeerInfo, ProtocolError, SyncMessage};
use crate::room::{Replica, StoragePort};

const EVENT_CAPACITY: usize = 256;
const OUTGOING_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events emitted by the client.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    Connected,
    Disconnected,
    /// Full server state applied; the room is loaded
    StateSynced,
    /// A delta from another peer was applied
    RemoteDelta { peer_id: Uuid, clock: u64 },
    /// The server accepted a local operation
    Acked(Uuid),
    /// The server refused a local operation (nil id: refused the join)
    Rejected { op_id: Uuid, reason: String },
    PeerJoined(PeerInfo),
    PeerLeft(Uuid),
}

/// Connection state shared with the background tasks.
struct Link {
    state: RwLock<ConnectionState>,
    outgoing: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
    /// Ops already sent over the current connection
    in_flight: StdMutex<HashSet<Uuid>>,
}

impl Link {
    async fn send(&self, msg: &SyncMessage) -> Result<(), ProtocolError> {
        let encoded = msg.encode()?;
        let tx = self.outgoing.lock().await.clone();
        match tx {
            Some(tx) => tx.send(encoded).await.map_err(|_| ProtocolError::ConnectionClosed),
            None => Err(ProtocolError::ConnectionClosed),
        }
    }

    async fn is_connected(&self) -> bool {
        *self.state.read().await == ConnectionState::Connected
    }

    fn lock_in_flight(&self) -> MutexGuard<'_, HashSet<Uuid>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Send `op` unless this connection already carried it.
    async fn send_op(&self, peer_id: Uuid, world_id: Uuid, op: &PendingOp) -> Result<(), ProtocolError> {
        if !self.lock_in_flight().insert(op.op_id) {
            return Ok(());
        }
        let sent = self.send(&delta_message(peer_id, world_id, op)).await;
        if sent.is_err() {
            self.lock_in_flight().remove(&op.op_id);
        }
        sent
    }
}

pub struct RoomClient {
    peer_info: PeerInfo,
    replica: Arc<Replica>,
    server_url: String,
    link: Arc<Link>,
    event_tx: mpsc::Sender<SyncEvent>,
    event_rx: Option<mpsc::Receiver<SyncEvent>>,
    loaded: watch::Sender<bool>,
    notices: Option<Emitter<Notice>>,
    pump: Option<JoinHandle<()>>,
    reader: Option<JoinHandle<()>>,
}

impl RoomClient {
    pub fn new(peer_info: PeerInfo, replica: Arc<Replica>, server_url: impl Into<String>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(EVENT_CAPACITY);
        let (loaded, _) = watch::channel(false);
        Self {
            peer_info,
            replica,
            server_url: server_url.into(),
            link: Arc::new(Link {
                state: RwLock::new(ConnectionState::Disconnected),
                outgoing: Mutex::new(None),
                in_flight: StdMutex::new(HashSet::new()),
            }),
            event_tx,
            event_rx: Some(event_rx),
            loaded,
            notices: None,
            pump: None,
            reader: None,
        }
    }

    /// Surface refused operations as user notices.
    pub fn with_notices(mut self, notices: Emitter<Notice>) -> Self {
        self.notices = Some(notices);
        self
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx.take()
    }

    /// Flips to `true` once the first full state has been applied.
    pub fn loaded(&self) -> watch::Receiver<bool> {
        self.loaded.subscribe()
    }

    pub fn peer_info(&self) -> &PeerInfo {
        &self.peer_info
    }

    pub fn world_id(&self) -> Uuid {
        self.replica.world_id()
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.link.state.read().await
    }

    /// Connect (or reconnect) and join the world.
    pub async fn connect(&mut self) -> Result<(), ProtocolError> {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        *self.link.state.write().await = ConnectionState::Connecting;
        let world_id = self.world_id();

        let url = format!("{}/{}", self.server_url, world_id);
        let (ws_stream, _) = match tokio_tungstenite::connect_async(&url).await {
            Ok(connected) => connected,
            Err(e) => {
                log::warn!("Failed to connect to {url}: {e}");
                *self.link.state.write().await = ConnectionState::Disconnected;
                return Err(ProtocolError::ConnectionClosed);
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(OUTGOING_CAPACITY);
        tokio::spawn(async move {
            while let Some(data) = out_rx.recv().await {
                if ws_writer.send(Message::Binary(data.into())).await.is_err() {
                    return;
                }
            }
            let _ = ws_writer.send(Message::Close(None)).await;
        });
        *self.link.outgoing.lock().await = Some(out_tx);
        self.link.lock_in_flight().clear();

        self.link
            .send(&SyncMessage::peer_joined(world_id, &self.peer_info)?)
            .await?;
        *self.link.state.write().await = ConnectionState::Connected;
        let _ = self.event_tx.try_send(SyncEvent::Connected);
        log::info!("Connected to world {world_id} as {}", self.peer_info.peer_id);

        self.start_pump();

        let ctx = ReaderContext {
            peer_id: self.peer_info.peer_id,
            replica: self.replica.clone(),
            link: self.link.clone(),
            events: self.event_tx.clone(),
            loaded: self.loaded.clone(),
            notices: self.notices.clone(),
        };
        self.reader = Some(tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Binary(data)) => match SyncMessage::decode(&data) {
                        Ok(sync_msg) => ctx.handle(sync_msg).await,
                        Err(e) => log::warn!("Undecodable message from server: {e}"),
                    },
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }
            ctx.link.outgoing.lock().await.take();
            *ctx.link.state.write().await = ConnectionState::Disconnected;
            let _ = ctx.events.try_send(SyncEvent::Disconnected);
            log::info!("Disconnected from world {}", ctx.replica.world_id());
        }));

        Ok(())
    }

    /// Forward local edits to the server while connected.
    fn start_pump(&mut self) {
        if self.pump.is_some() {
            return;
        }
        let Some(mut outbox) = self.replica.take_outbox() else {
            return;
        };
        let link = self.link.clone();
        let peer_id = self.peer_info.peer_id;
        let world_id = self.world_id();
        self.pump = Some(tokio::spawn(async move {
            while let Some(op) = outbox.recv().await {
                if !link.is_connected().await {
                    log::trace!("Offline, keeping op {} pending", op.op_id);
                    continue;
                }
                if let Err(e) = link.send_op(peer_id, world_id, &op).await {
                    log::debug!("Op {} stays pending: {e}", op.op_id);
                }
            }
        }));
    }

    /// Ping the server.
    pub async fn send_ping(&self) -> Result<(), ProtocolError> {
        self.link.send(&SyncMessage::ping(self.peer_info.peer_id)).await
    }

    /// Close the connection. Unconfirmed edits stay pending.
    pub async fn disconnect(&mut self) {
        *self.link.state.write().await = ConnectionState::Disconnected;
        self.link.outgoing.lock().await.take();
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

impl Drop for RoomClient {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

fn delta_message(peer_id: Uuid, world_id: Uuid, op: &PendingOp) -> SyncMessage {
    SyncMessage::delta(peer_id, world_id, op.op_id, op.clock, op.update.clone())
}

struct ReaderContext {
    peer_id: Uuid,
    replica: Arc<Replica>,
    link: Arc<Link>,
    events: mpsc::Sender<SyncEvent>,
    loaded: watch::Sender<bool>,
    notices: Option<Emitter<Notice>>,
}

impl ReaderContext {
    fn emit(&self, event: SyncEvent) {
        if self.events.try_send(event).is_err() {
            log::trace!("Sync event dropped, receiver full or gone");
        }
    }

    async fn handle(&self, msg: SyncMessage) {
        if msg.peer_id == self.peer_id {
            return;
        }
        match msg.msg_type {
            MessageType::SyncStep2 => match self.replica.apply_remote(&msg.payload) {
                Ok(()) => {
                    self.loaded.send_replace(true);
                    self.emit(SyncEvent::StateSynced);
                }
                Err(e) => log::error!("Could not apply server state: {e}"),
            },
            MessageType::SyncStep1 => {
                if let Err(e) = self.replica.reconcile(&msg.payload) {
                    log::warn!("Bad state vector from server: {e}");
                }
                if let Err(e) = self.replica.catch_up(&msg.payload) {
                    log::warn!("Could not build catch-up update: {e}");
                }
                let pending = self.replica.unconfirmed();
                if !pending.is_empty() {
                    log::info!("Resending {} unconfirmed op(s)", pending.len());
                }
                let world_id = self.replica.world_id();
                for op in &pending {
                    if self.link.send_op(self.peer_id, world_id, op).await.is_err() {
                        break;
                    }
                }
            }
            MessageType::Delta => match self.replica.apply_remote(&msg.payload) {
                Ok(()) => self.emit(SyncEvent::RemoteDelta {
                    peer_id: msg.peer_id,
                    clock: msg.clock,
                }),
                Err(e) => log::warn!("Dropping bad delta from {}: {e}", msg.peer_id),
            },
            MessageType::Ack => {
                self.link.lock_in_flight().remove(&msg.op_id);
                self.replica.acknowledge(msg.op_id);
                self.emit(SyncEvent::Acked(msg.op_id));
            }
            MessageType::Rejected => {
                let reason = msg.reason().unwrap_or_default();
                log::warn!("Server rejected op {}: {reason}", msg.op_id);
                self.link.lock_in_flight().remove(&msg.op_id);
                self.replica.acknowledge(msg.op_id);
                if let Some(notices) = &self.notices {
                    notices.emit(&Notice::error(format!("Change not saved: {reason}")));
                }
                self.emit(SyncEvent::Rejected {
                    op_id: msg.op_id,
                    reason,
                });
            }
            MessageType::PeerJoined => match msg.peer_info() {
                Ok(info) => self.emit(SyncEvent::PeerJoined(info)),
                Err(e) => log::debug!("Malformed peer info: {e}"),
            },
            MessageType::PeerLeft => self.emit(SyncEvent::PeerLeft(msg.peer_id)),
            MessageType::Pong | MessageType::Ping => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> RoomClient {
        let replica = Arc::new(Replica::new(Uuid::new_v4()));
        RoomClient::new(PeerInfo::new("u1", "Alice"), replica, "ws://127.0.0.1:1")
    }

    #[tokio::test]
    async fn test_client_initial_state() {
        let mut client = client();
        assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
        assert!(!*client.loaded().borrow());
        assert!(client.take_event_rx().is_some());
        assert!(client.take_event_rx().is_none());
    }

    #[tokio::test]
    async fn test_connect_failure_leaves_disconnected() {
        let mut client = client();
        assert!(client.connect().await.is_err());
        assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
        assert!(client.send_ping().await.is_err());
    }

    #[tokio::test]
    async fn test_reader_applies_ack_and_rejection() {
        let replica = Arc::new(Replica::new(Uuid::new_v4()));
        let (events, mut rx) = mpsc::channel(8);
        let (loaded, loaded_rx) = watch::channel(false);
        let ctx = ReaderContext {
            peer_id: Uuid::new_v4(),
            replica: replica.clone(),
            link: Arc::new(Link {
                state: RwLock::new(ConnectionState::Connected),
                outgoing: Mutex::new(None),
                in_flight: StdMutex::new(HashSet::new()),
            }),
            events,
            loaded,
            notices: None,
        };

        for n in 0..2 {
            replica
                .mutate(&mut |txn| {
                    txn.ensure_slot("clocks", crate::room::SlotKind::List)?;
                    let mut item = serde_json::Map::new();
                    item.insert("id".into(), n.to_string().into());
                    txn.list_push("clocks", &item)
                })
                .unwrap();
        }
        let ops = replica.unconfirmed();
        let world = replica.world_id();

        ctx.handle(SyncMessage::ack(Uuid::nil(), world, ops[0].op_id)).await;
        ctx.handle(SyncMessage::rejected(Uuid::nil(), world, ops[1].op_id, "no")).await;
        assert_eq!(replica.pending_len(), 0);
        assert_eq!(rx.recv().await, Some(SyncEvent::Acked(ops[0].op_id)));
        assert_eq!(
            rx.recv().await,
            Some(SyncEvent::Rejected {
                op_id: ops[1].op_id,
                reason: "no".into()
            })
        );

        let other = Replica::new(world);
        ctx.handle(SyncMessage::sync_step2(Uuid::nil(), world, other.encode_state())).await;
        assert!(*loaded_rx.borrow());
    }
}
