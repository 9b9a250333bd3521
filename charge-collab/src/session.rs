//! One open room: replica, transport, typed collections and signals.

use std::sync::Arc;

use charge_core::card::BlockRegistry;
use charge_core::signal::RoomSignals;
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use crate::client::{ConnectionState, RoomClient, SyncEvent};
use crate::optimistic::DEFAULT_PENDING_CAPACITY;
use crate::protocol::{PeerInfo, ProtocolError};
use crate::room::{Replica, StoragePort};
use crate::world::WorldCollections;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub server_url: String,
    pub user_id: String,
    pub display_name: String,
    /// Local edits kept for resend before the oldest is dropped
    pub pending_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:9090".to_string(),
            user_id: String::new(),
            display_name: String::new(),
            pending_capacity: DEFAULT_PENDING_CAPACITY,
        }
    }
}

impl SessionConfig {
    pub fn new(server_url: impl Into<String>, user_id: impl Into<String>) -> Self {
        let user_id = user_id.into();
        Self {
            server_url: server_url.into(),
            display_name: user_id.clone(),
            user_id,
            ..Self::default()
        }
    }
}

pub struct RoomSession {
    replica: Arc<Replica>,
    client: Option<RoomClient>,
    collections: WorldCollections,
    signals: RoomSignals,
    loaded: watch::Receiver<bool>,
}

impl RoomSession {
    /// Connect to the sync server and join `world_id`.
    ///
    /// Returns once the join is sent; use [`RoomSession::wait_loaded`] to
    /// wait for the first server snapshot.
    pub async fn open(world_id: Uuid, config: SessionConfig) -> Result<Self, ProtocolError> {
        Self::open_with_blocks(world_id, config, BlockRegistry::default()).await
    }

    pub async fn open_with_blocks(
        world_id: Uuid,
        config: SessionConfig,
        blocks: BlockRegistry,
    ) -> Result<Self, ProtocolError> {
        let replica = Arc::new(Replica::with_pending_capacity(world_id, config.pending_capacity));
        let signals = RoomSignals::new();
        let peer = PeerInfo::new(config.user_id, config.display_name);
        let mut client = RoomClient::new(peer, replica.clone(), config.server_url)
            .with_notices(signals.notices.clone());
        let loaded = client.loaded();
        client.connect().await?;

        let port: Arc<dyn StoragePort> = replica.clone();
        Ok(Self {
            collections: WorldCollections::with_blocks(port, &signals, blocks),
            replica,
            client: Some(client),
            signals,
            loaded,
        })
    }

    /// A session with no server. It counts as loaded from the start.
    pub fn offline(world_id: Uuid) -> Self {
        let replica = Arc::new(Replica::new(world_id));
        // No transport: edits only live in the pending log.
        drop(replica.take_outbox());
        let signals = RoomSignals::new();
        let port: Arc<dyn StoragePort> = replica.clone();
        let (_, loaded) = watch::channel(true);
        Self {
            collections: WorldCollections::new(port, &signals),
            replica,
            client: None,
            signals,
            loaded,
        }
    }

    pub fn world_id(&self) -> Uuid {
        self.replica.world_id()
    }

    pub fn collections(&self) -> &WorldCollections {
        &self.collections
    }

    pub fn signals(&self) -> &RoomSignals {
        &self.signals
    }

    pub fn replica(&self) -> &Arc<Replica> {
        &self.replica
    }

    pub fn client(&self) -> Option<&RoomClient> {
        self.client.as_ref()
    }

    pub fn take_events(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.client.as_mut().and_then(RoomClient::take_event_rx)
    }

    pub fn is_loaded(&self) -> bool {
        *self.loaded.borrow()
    }

    /// Wait for the first full snapshot of room storage.
    pub async fn wait_loaded(&self) -> Result<(), ProtocolError> {
        let mut loaded = self.loaded.clone();
        loaded
            .wait_for(|ready| *ready)
            .await
            .map(|_| ())
            .map_err(|_| ProtocolError::ConnectionClosed)
    }

    pub async fn connection_state(&self) -> ConnectionState {
        match &self.client {
            Some(client) => client.connection_state().await,
            None => ConnectionState::Disconnected,
        }
    }

    /// Drop the server link. Edits keep working locally and stay pending.
    pub async fn disconnect(&mut self) {
        if let Some(client) = self.client.as_mut() {
            client.disconnect().await;
        }
    }

    /// Reconnect after a dropped connection. Pending edits are resent.
    pub async fn reconnect(&mut self) -> Result<(), ProtocolError> {
        match self.client.as_mut() {
            Some(client) => client.connect().await,
            None => Ok(()),
        }
    }

    /// Leave the room and release every signal listener.
    pub async fn close(mut self) {
        if let Some(mut client) = self.client.take() {
            client.disconnect().await;
        }
        self.signals.close();
        log::debug!("Closed room session for world {}", self.replica.world_id());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use charge_core::clock::ClockInput;

    #[tokio::test]
    async fn test_offline_session_is_loaded_and_editable() {
        let session = RoomSession::offline(Uuid::new_v4());
        assert!(session.is_loaded());
        session.wait_loaded().await.unwrap();
        assert_eq!(session.connection_state().await, ConnectionState::Disconnected);

        let clock = session
            .collections()
            .clocks
            .append(ClockInput {
                name: Some("Doom".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(clock.max_progress, 4);
        assert_eq!(session.replica().pending_len(), 1);
        session.close().await;
    }

    #[tokio::test]
    async fn test_open_fails_without_server() {
        let config = SessionConfig::new("ws://127.0.0.1:1", "alice");
        assert!(RoomSession::open(Uuid::new_v4(), config).await.is_err());
    }

    #[tokio::test]
    async fn test_close_releases_listeners() {
        let session = RoomSession::offline(Uuid::new_v4());
        let signals = session.signals().clone();
        session.signals().notices.subscribe(|_| {}).detach();
        assert_eq!(signals.notices.listener_count(), 1);
        session.close().await;
        assert_eq!(signals.notices.listener_count(), 0);
    }
}
