//! WebSocket sync server with per-world rooms.
//!
//! Architecture:
//! ```text
//! Client A ──┐
//!            ├── WorldRoom (world_id) ── Replica ── BroadcastGroup
//! Client B ──┘         │                    │
//!                      │                    ├── RoomStore (RocksDB)
//!                      │                    │     ├── snapshots
//!                      │                    │     └── deltas
//!                      │                    │
//!           MembershipRegistry          UpdateHub ──► SSE listeners
//! ```
//!
//! Each world room holds the authoritative replica and the fan-out group of
//! its connected peers. A room is loaded on first join (snapshot plus
//! trailing deltas), and when its last peer leaves it is snapshotted,
//! its deltas compacted, and it is dropped from memory.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use charge_core::membership::Role;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, RwLock};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::broadcast::BroadcastGroup;
use crate::membership::MembershipRegistry;
use crate::notify::UpdateHub;
use crate::protocol::{MessageType, PeerInfo, SyncMessage};
use crate::room::Replica;
use crate::storage::{RoomStore, StoreConfig, StoreError};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Maximum peers per world
    pub max_peers_per_room: usize,
    /// Broadcast channel capacity per world
    pub broadcast_capacity: usize,
    /// Interval between WebSocket pings to idle peers
    pub heartbeat_interval_secs: u64,
    /// Persistence storage path (None = in-memory only)
    pub storage_path: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_peers_per_room: 100,
            broadcast_capacity: 256,
            heartbeat_interval_secs: 30,
            storage_path: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_rooms: usize,
    pub persisted_deltas: u64,
    pub persisted_snapshots: u64,
    pub rejected_deltas: u64,
}

/// One world: authoritative replica plus fan-out.
struct WorldRoom {
    replica: Replica,
    broadcast: BroadcastGroup,
}

struct Shared {
    config: ServerConfig,
    rooms: RwLock<HashMap<Uuid, Arc<WorldRoom>>>,
    stats: RwLock<ServerStats>,
    store: Option<Arc<RoomStore>>,
    memberships: Arc<MembershipRegistry>,
    hub: Arc<UpdateHub>,
}

/// Outcome of a join attempt.
enum Join {
    Joined(Arc<WorldRoom>, broadcast::Receiver<Arc<Vec<u8>>>),
    Full,
}

/// Per-connection state once the peer has joined.
struct Session {
    info: PeerInfo,
    world_id: Uuid,
    role: Role,
    room: Arc<WorldRoom>,
}

/// The sync server. Clones share the same rooms.
#[derive(Clone)]
pub struct SyncServer {
    shared: Arc<Shared>,
}

impl SyncServer {
    /// Create a server, opening the room store when a path is configured.
    pub fn new(config: ServerConfig) -> Result<Self, StoreError> {
        let store = match &config.storage_path {
            Some(path) => Some(Arc::new(RoomStore::open(StoreConfig::at(path.clone()))?)),
            None => None,
        };
        Ok(Self::build(config, store))
    }

    /// In-memory server with default configuration.
    pub fn with_defaults() -> Self {
        Self::build(ServerConfig::default(), None)
    }

    /// Create with persistence enabled at the given path.
    pub fn with_storage(bind_addr: impl Into<String>, path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        Self::new(ServerConfig {
            bind_addr: bind_addr.into(),
            storage_path: Some(path.into()),
            ..ServerConfig::default()
        })
    }

    fn build(config: ServerConfig, store: Option<Arc<RoomStore>>) -> Self {
        let memberships = match &store {
            Some(store) => MembershipRegistry::with_store(store.clone()),
            None => MembershipRegistry::new(),
        };
        Self {
            shared: Arc::new(Shared {
                config,
                rooms: RwLock::new(HashMap::new()),
                stats: RwLock::new(ServerStats::default()),
                store,
                memberships: Arc::new(memberships),
                hub: Arc::new(UpdateHub::new()),
            }),
        }
    }

    /// Load every persisted world so it is ready when peers reconnect.
    pub async fn recover(&self) -> Result<usize, StoreError> {
        let Some(store) = &self.shared.store else {
            return Ok(0);
        };
        let worlds = store.list_worlds()?;
        let mut rooms = self.shared.rooms.write().await;
        for world_id in &worlds {
            if !rooms.contains_key(world_id) {
                let room = self.shared.load_room(*world_id)?;
                rooms.insert(*world_id, Arc::new(room));
            }
        }
        self.shared.stats.write().await.active_rooms = rooms.len();
        log::info!("Recovery complete: {} world(s) restored", worlds.len());
        Ok(worlds.len())
    }

    /// Recover, bind the configured address and serve forever.
    pub async fn run(&self) -> Result<(), BoxError> {
        self.recover().await?;
        let listener = TcpListener::bind(&self.shared.config.bind_addr).await?;
        self.run_on(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn run_on(&self, listener: TcpListener) -> Result<(), BoxError> {
        log::info!("Sync server listening on {}", listener.local_addr()?);
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");
            let shared = self.shared.clone();
            tokio::spawn(async move {
                if let Err(e) = shared.handle_connection(stream, addr).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    pub async fn stats(&self) -> ServerStats {
        self.shared.stats.read().await.clone()
    }

    pub fn bind_addr(&self) -> &str {
        &self.shared.config.bind_addr
    }

    pub fn hub(&self) -> Arc<UpdateHub> {
        self.shared.hub.clone()
    }

    pub fn memberships(&self) -> Arc<MembershipRegistry> {
        self.shared.memberships.clone()
    }

    pub fn store(&self) -> Option<&Arc<RoomStore>> {
        self.shared.store.as_ref()
    }

    pub async fn room_count(&self) -> usize {
        self.shared.rooms.read().await.len()
    }

    /// Authoritative room storage of a loaded world, as JSON.
    pub async fn world_json(&self, world_id: Uuid) -> Option<Value> {
        let rooms = self.shared.rooms.read().await;
        rooms.get(&world_id).map(|room| room.replica.to_json())
    }
}

impl Shared {
    /// Build a world's replica from its snapshot and trailing deltas.
    fn load_room(&self, world_id: Uuid) -> Result<WorldRoom, StoreError> {
        let replica = Replica::new(world_id);
        if let Some(store) = &self.store {
            if let Some((snapshot, deltas)) = store.load_world(world_id)? {
                for update in snapshot.iter().chain(deltas.iter()) {
                    if let Err(e) = replica.apply_remote(update) {
                        log::error!("Skipping unreadable stored update for world {world_id}: {e}");
                    }
                }
                log::info!(
                    "Loaded world {world_id} ({} trailing delta(s))",
                    deltas.len()
                );
            }
        }
        Ok(WorldRoom {
            replica,
            broadcast: BroadcastGroup::new(self.config.broadcast_capacity),
        })
    }

    /// Get or load the room and register the peer, under one lock so a
    /// closing room can never gain a peer.
    async fn join(&self, world_id: Uuid, info: PeerInfo) -> Result<Join, StoreError> {
        let mut rooms = self.rooms.write().await;
        let room = match rooms.get(&world_id) {
            Some(room) => room.clone(),
            None => {
                let room = Arc::new(self.load_room(world_id)?);
                rooms.insert(world_id, room.clone());
                room
            }
        };
        let joined = room
            .broadcast
            .add_peer(info, self.config.max_peers_per_room)
            .await;
        self.stats.write().await.active_rooms = rooms.len();
        Ok(match joined {
            Some(rx) => Join::Joined(room, rx),
            None => Join::Full,
        })
    }

    async fn leave(&self, session: &Session) {
        let world_id = session.world_id;
        let mut rooms = self.rooms.write().await;
        session.room.broadcast.remove_peer(&session.info.peer_id).await;
        let _ = session
            .room
            .broadcast
            .broadcast(&SyncMessage::peer_left(session.info.peer_id, world_id));
        log::info!("Peer {} left world {world_id}", session.info.peer_id);

        if session.room.broadcast.peer_count().await == 0 {
            self.persist_snapshot(world_id, &session.room.replica).await;
            rooms.remove(&world_id);
            log::info!("Room {world_id} closed (empty)");
        }
        self.stats.write().await.active_rooms = rooms.len();
    }

    async fn persist_snapshot(&self, world_id: Uuid, replica: &Replica) {
        let Some(store) = &self.store else {
            return;
        };
        match store.save_snapshot(world_id, &replica.encode_state()) {
            Ok(meta) => {
                if let Err(e) = store.compact_deltas(world_id, meta.snapshot_version) {
                    log::error!("Failed to compact deltas for world {world_id}: {e}");
                }
                self.stats.write().await.persisted_snapshots += 1;
            }
            Err(e) => log::error!("Failed to persist snapshot for world {world_id}: {e}"),
        }
    }

    async fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) -> Result<(), BoxError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        log::info!("WebSocket connection established from {addr}");

        {
            let mut s = self.stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let mut session: Option<Session> = None;
        let mut broadcast_rx: Option<broadcast::Receiver<Arc<Vec<u8>>>> = None;
        let mut heartbeat = tokio::time::interval(Duration::from_secs(
            self.config.heartbeat_interval_secs.max(1),
        ));
        heartbeat.tick().await;

        let result: Result<(), BoxError> = async {
            loop {
                tokio::select! {
                    msg = ws_receiver.next() => {
                        let bytes: Vec<u8> = match msg {
                            Some(Ok(Message::Binary(data))) => data.into(),
                            Some(Ok(Message::Ping(data))) => {
                                ws_sender.send(Message::Pong(data)).await?;
                                continue;
                            }
                            Some(Ok(Message::Close(_))) | None => {
                                log::info!("Connection closed from {addr}");
                                break;
                            }
                            Some(Err(e)) => {
                                log::error!("WebSocket error from {addr}: {e}");
                                break;
                            }
                            Some(Ok(_)) => continue,
                        };

                        let sync_msg = match SyncMessage::decode(&bytes) {
                            Ok(m) => m,
                            Err(e) => {
                                log::warn!("Failed to decode message from {addr}: {e}");
                                continue;
                            }
                        };
                        {
                            let mut s = self.stats.write().await;
                            s.total_messages += 1;
                            s.total_bytes += bytes.len() as u64;
                        }

                        match sync_msg.msg_type {
                            MessageType::PeerJoined if session.is_none() => {
                                let info = match sync_msg.peer_info() {
                                    Ok(info) => info,
                                    Err(e) => {
                                        log::warn!("Malformed join from {addr}: {e}");
                                        break;
                                    }
                                };
                                let world_id = sync_msg.world_id;
                                let role = match self.memberships.ensure_membership(world_id, &info.user_id).await {
                                    Ok(role) => role,
                                    Err(e) => {
                                        let refusal = SyncMessage::rejected(Uuid::nil(), world_id, Uuid::nil(), &e.to_string());
                                        ws_sender.send(Message::Binary(refusal.encode()?.into())).await?;
                                        break;
                                    }
                                };
                                let (room, rx) = match self.join(world_id, info.clone()).await? {
                                    Join::Joined(room, rx) => (room, rx),
                                    Join::Full => {
                                        log::warn!("World {world_id} is full, refusing {}", info.peer_id);
                                        let refusal = SyncMessage::rejected(Uuid::nil(), world_id, Uuid::nil(), "room is full");
                                        ws_sender.send(Message::Binary(refusal.encode()?.into())).await?;
                                        break;
                                    }
                                };
                                broadcast_rx = Some(rx);

                                let state = SyncMessage::sync_step2(Uuid::nil(), world_id, room.replica.encode_state());
                                ws_sender.send(Message::Binary(state.encode()?.into())).await?;
                                let sv = SyncMessage::sync_step1(Uuid::nil(), world_id, room.replica.state_vector());
                                ws_sender.send(Message::Binary(sv.encode()?.into())).await?;
                                let _ = room.broadcast.broadcast(&sync_msg);

                                log::info!(
                                    "Peer {} ({}, {role}) joined world {world_id}",
                                    info.name,
                                    info.peer_id
                                );
                                session = Some(Session { info, world_id, role, room });
                            }

                            MessageType::Ping => {
                                let pong = SyncMessage::pong(sync_msg.peer_id);
                                ws_sender.send(Message::Binary(pong.encode()?.into())).await?;
                            }

                            msg_type => {
                                let Some(s) = &session else {
                                    log::debug!("Ignoring {msg_type:?} from {addr} before join");
                                    continue;
                                };
                                match msg_type {
                                    MessageType::Delta => {
                                        let reply = self.accept_delta(s, &sync_msg).await;
                                        ws_sender.send(Message::Binary(reply.encode()?.into())).await?;
                                    }
                                    MessageType::SyncStep1 => match s.room.replica.diff(&sync_msg.payload) {
                                        Ok(diff) => {
                                            let response = SyncMessage::sync_step2(Uuid::nil(), s.world_id, diff);
                                            ws_sender.send(Message::Binary(response.encode()?.into())).await?;
                                        }
                                        Err(e) => log::warn!("Bad state vector from {addr}: {e}"),
                                    },
                                    other => log::debug!("Unhandled message type: {other:?}"),
                                }
                            }
                        }
                    }

                    msg = async {
                        match broadcast_rx.as_mut() {
                            Some(rx) => rx.recv().await,
                            None => std::future::pending().await,
                        }
                    } => {
                        let own_id = session.as_ref().map(|s| s.info.peer_id);
                        match msg {
                            Ok(data) => {
                                if let Ok(m) = SyncMessage::decode(&data) {
                                    if Some(m.peer_id) == own_id {
                                        continue;
                                    }
                                }
                                ws_sender.send(Message::Binary(data.to_vec().into())).await?;
                            }
                            Err(RecvError::Lagged(n)) => {
                                log::warn!("Peer {own_id:?} lagged by {n} messages, resending state");
                                if let Some(s) = &session {
                                    let state = SyncMessage::sync_step2(Uuid::nil(), s.world_id, s.room.replica.encode_state());
                                    ws_sender.send(Message::Binary(state.encode()?.into())).await?;
                                }
                            }
                            Err(RecvError::Closed) => break,
                        }
                    }

                    _ = heartbeat.tick() => {
                        ws_sender.send(Message::Ping(Vec::new().into())).await?;
                    }
                }
            }
            Ok::<(), BoxError>(())
        }
        .await;

        if let Some(s) = &session {
            self.leave(s).await;
        }
        {
            let mut s = self.stats.write().await;
            s.active_connections = s.active_connections.saturating_sub(1);
        }
        result
    }

    /// Check, apply, persist and fan out one delta. Returns the reply for
    /// the sender: `Ack`, or `Rejected` with a reason.
    async fn accept_delta(&self, session: &Session, msg: &SyncMessage) -> SyncMessage {
        let world_id = session.world_id;
        let refuse = |reason: &str| SyncMessage::rejected(Uuid::nil(), world_id, msg.op_id, reason);

        if !session.role.can_edit() {
            log::warn!(
                "Rejected delta {} from {} ({}) in world {world_id}",
                msg.op_id,
                session.info.user_id,
                session.role
            );
            self.stats.write().await.rejected_deltas += 1;
            return refuse("spectators cannot edit this world");
        }
        if let Err(e) = session.room.replica.apply_remote(&msg.payload) {
            log::warn!("Rejected unreadable delta {} in world {world_id}: {e}", msg.op_id);
            self.stats.write().await.rejected_deltas += 1;
            return refuse(&e.to_string());
        }

        if let Some(store) = &self.store {
            match store.append_delta(world_id, &msg.payload) {
                Ok(_) => self.stats.write().await.persisted_deltas += 1,
                Err(e) => log::error!("Failed to persist delta for world {world_id}: {e}"),
            }
        }

        let _ = session.room.broadcast.broadcast(msg);
        self.hub.publish(world_id, &session.info.user_id);
        log::trace!("Accepted delta {} in world {world_id}", msg.op_id);
        SyncMessage::ack(Uuid::nil(), world_id, msg.op_id)
    }
}
