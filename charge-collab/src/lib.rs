//! # charge-collab: Collaborative room storage for Charge worlds
//!
//! Typed collections over a CRDT replica, kept in sync through a WebSocket
//! server that owns the authoritative copy of every world.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────┐                     ┌──────────────────┐
//! │ WorldCollections │                     │ UpdateHub (SSE)  │
//! │ Map/ListCollection                     └────────▲─────────┘
//! └────────┬─────────┘                              │
//!          ▼                                        │
//! ┌──────────────────┐     WebSocket       ┌────────┴─────────┐
//! │ Replica + pending│ ◄─────────────────► │ SyncServer       │
//! │ log (RoomClient) │     Binary Proto    │ Replica per world│
//! └──────────────────┘                     └────────┬─────────┘
//!                                                   │
//!                                   ┌───────────────┼──────────────┐
//!                                   ▼               ▼              ▼
//!                            BroadcastGroup  MembershipRegistry  RoomStore
//! ```
//!
//! ## Modules
//!
//! - [`room`]: storage port and the yrs-backed [`Replica`]
//! - [`collection`]: validated map and list collections
//! - [`world`]: the named slots of one world
//! - [`optimistic`]: log of local edits awaiting confirmation
//! - [`protocol`]: binary wire protocol (bincode-encoded SyncMessage)
//! - [`broadcast`]: per-world fan-out
//! - [`server`] / [`client`]: WebSocket sync endpoints
//! - [`session`]: one open room on the client side
//! - [`notify`]: "world changed" events for SSE listeners
//! - [`membership`]: owner / player / spectator roles
//! - [`storage`]: RocksDB persistence

pub mod broadcast;
pub mod client;
pub mod collection;
pub mod membership;
pub mod notify;
pub mod optimistic;
pub mod protocol;
pub mod room;
pub mod server;
pub mod session;
pub mod storage;
pub mod world;

pub use broadcast::{BroadcastGroup, BroadcastStats};
pub use client::{ConnectionState, RoomClient, SyncEvent};
pub use collection::{CollectionError, Diagnostics, ListCollection, MapCollection, Validator};
pub use membership::{MembershipError, MembershipRegistry};
pub use notify::{UpdateEvent, UpdateHub, UpdateSubscription};
pub use optimistic::{PendingLog, PendingOp};
pub use protocol::{MessageType, PeerInfo, ProtocolError, SyncMessage};
pub use room::{Replica, RoomError, SlotKind, SlotRead, StoragePort, StorageTxn};
pub use server::{ServerConfig, ServerStats, SyncServer};
pub use session::{RoomSession, SessionConfig};
pub use storage::{RoomStore, StoreConfig, StoreError, WorldMetadata};
pub use world::{DiceLog, WorldCollections};
