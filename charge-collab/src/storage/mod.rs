//! Persistent storage for rooms.
//!
//! ```text
//! ┌─────────────┐  accepted deltas  ┌──────────────┐
//! │ SyncServer  │ ────────────────► │ RoomStore    │
//! │ (replicas)  │  snapshot on idle │ (RocksDB)    │
//! └──────┬──────┘                   └──────┬───────┘
//!        │ on startup                      │
//!        ▼                                 ▼
//!   snapshot + deltas since        snapshots / deltas /
//!   snapshot_version               metadata / memberships
//! ```

pub mod rocks;

pub use rocks::{RoomStore, StoreConfig, StoreError, WorldMetadata};
