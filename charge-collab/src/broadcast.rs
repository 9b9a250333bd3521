//! Fan-out of encoded messages to the peers of one world.
//!
//! Every peer gets an independent receiver buffering up to `capacity`
//! messages; a peer that falls further behind sees `Lagged` and resyncs.
//! Receivers get every message, including their own: skipping echoes is
//! the connection's job.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::protocol::{PeerInfo, ProtocolError, SyncMessage};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub active_peers: usize,
}

/// A broadcast group for a single world.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Arc<Vec<u8>>>,
    peers: RwLock<HashMap<Uuid, PeerInfo>>,
    capacity: usize,
    messages_sent: AtomicU64,
}

impl BroadcastGroup {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            peers: RwLock::new(HashMap::new()),
            capacity,
            messages_sent: AtomicU64::new(0),
        }
    }

    /// Add a peer unless the group already holds `max_peers`.
    pub async fn add_peer(
        &self,
        info: PeerInfo,
        max_peers: usize,
    ) -> Option<broadcast::Receiver<Arc<Vec<u8>>>> {
        let mut peers = self.peers.write().await;
        if peers.len() >= max_peers && !peers.contains_key(&info.peer_id) {
            return None;
        }
        peers.insert(info.peer_id, info);
        Some(self.sender.subscribe())
    }

    pub async fn remove_peer(&self, peer_id: &Uuid) -> Option<PeerInfo> {
        self.peers.write().await.remove(peer_id)
    }

    /// Encode and send to every receiver. Returns how many received it.
    pub fn broadcast(&self, msg: &SyncMessage) -> Result<usize, ProtocolError> {
        Ok(self.broadcast_raw(Arc::new(msg.encode()?)))
    }

    /// Send pre-encoded bytes.
    pub fn broadcast_raw(&self, encoded: Arc<Vec<u8>>) -> usize {
        let count = self.sender.send(encoded).unwrap_or(0);
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn peers(&self) -> Vec<PeerInfo> {
        self.peers.read().await.values().cloned().collect()
    }

    pub async fn has_peer(&self, peer_id: &Uuid) -> bool {
        self.peers.read().await.contains_key(peer_id)
    }

    pub async fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            active_peers: self.peers.read().await.len(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_add_remove_peer() {
        let group = BroadcastGroup::new(16);
        let peer = PeerInfo::new("u1", "Alice");
        let peer_id = peer.peer_id;

        let _rx = group.add_peer(peer, 10).await.unwrap();
        assert_eq!(group.peer_count().await, 1);
        assert!(group.has_peer(&peer_id).await);

        assert!(group.remove_peer(&peer_id).await.is_some());
        assert_eq!(group.peer_count().await, 0);
    }

    #[tokio::test]
    async fn test_peer_limit() {
        let group = BroadcastGroup::new(16);
        let _a = group.add_peer(PeerInfo::new("u1", "A"), 2).await.unwrap();
        let _b = group.add_peer(PeerInfo::new("u2", "B"), 2).await.unwrap();
        assert!(group.add_peer(PeerInfo::new("u3", "C"), 2).await.is_none());
        assert_eq!(group.peer_count().await, 2);
    }

    #[tokio::test]
    async fn test_fan_out_reaches_everyone() {
        let group = BroadcastGroup::new(16);
        let alice = PeerInfo::new("u1", "Alice");
        let mut rx1 = group.add_peer(alice.clone(), 10).await.unwrap();
        let mut rx2 = group.add_peer(PeerInfo::new("u2", "Bob"), 10).await.unwrap();

        let msg = SyncMessage::delta(alice.peer_id, Uuid::new_v4(), Uuid::new_v4(), 1, vec![1, 2, 3]);
        assert_eq!(group.broadcast(&msg).unwrap(), 2);

        let got = SyncMessage::decode(&rx1.recv().await.unwrap()).unwrap();
        assert_eq!(got, msg);
        assert_eq!(*rx2.recv().await.unwrap(), msg.encode().unwrap());

        let stats = group.stats().await;
        assert_eq!(stats.messages_sent, 1);
        assert_eq!(stats.active_peers, 2);
    }

    #[tokio::test]
    async fn test_lagging_receiver() {
        let group = BroadcastGroup::new(2);
        let mut rx = group.add_peer(PeerInfo::new("u1", "A"), 10).await.unwrap();
        for n in 0..5u8 {
            group.broadcast_raw(Arc::new(vec![n]));
        }
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Lagged(_))
        ));
    }
}
