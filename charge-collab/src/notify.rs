//! Per-world "something changed" notifications.
//!
//! For clients that do not hold a live replica: any accepted mutation
//! publishes an [`UpdateEvent`] tagged with the user who made it, and every
//! subscriber except that user receives it. Events carry no data; they only
//! tell a client to refetch. Delivery is at-least-once: a subscriber that
//! falls behind gets one synthetic update instead of the missed ones.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use futures_util::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::{self, error::RecvError};
use uuid::Uuid;

const DEFAULT_HUB_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum UpdateEvent {
    Update {
        #[serde(rename = "sourceUserId")]
        source_user_id: String,
    },
}

impl UpdateEvent {
    pub fn update(source_user_id: impl Into<String>) -> Self {
        UpdateEvent::Update {
            source_user_id: source_user_id.into(),
        }
    }

    pub fn source_user_id(&self) -> &str {
        match self {
            UpdateEvent::Update { source_user_id } => source_user_id,
        }
    }
}

/// Process-wide fan-out of update events, one channel per world.
pub struct UpdateHub {
    channels: Mutex<HashMap<Uuid, broadcast::Sender<UpdateEvent>>>,
    capacity: usize,
}

impl UpdateHub {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_HUB_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Announce a change to `world_id` made by `user_id`.
    ///
    /// Returns the number of subscribers reached (including the source's own).
    pub fn publish(&self, world_id: Uuid, user_id: &str) -> usize {
        let mut channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(sender) = channels.get(&world_id) else {
            return 0;
        };
        match sender.send(UpdateEvent::update(user_id)) {
            Ok(count) => count,
            Err(_) => {
                channels.remove(&world_id);
                log::trace!("Dropped idle update channel for world {world_id}");
                0
            }
        }
    }

    /// Listen for changes to `world_id` made by anyone but `user_id`.
    pub fn subscribe(&self, world_id: Uuid, user_id: impl Into<String>) -> UpdateSubscription {
        let mut channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
        let receiver = channels
            .entry(world_id)
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe();
        UpdateSubscription {
            world_id,
            user_id: user_id.into(),
            receiver,
        }
    }

    pub fn subscriber_count(&self, world_id: Uuid) -> usize {
        self.channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&world_id)
            .map_or(0, |sender| sender.receiver_count())
    }
}

impl Default for UpdateHub {
    fn default() -> Self {
        Self::new()
    }
}

/// One listener's view of a world's update events.
pub struct UpdateSubscription {
    world_id: Uuid,
    user_id: String,
    receiver: broadcast::Receiver<UpdateEvent>,
}

impl UpdateSubscription {
    /// Next event from another user. `None` once the hub is gone.
    pub async fn recv(&mut self) -> Option<UpdateEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) if event.source_user_id() == self.user_id => continue,
                Ok(event) => return Some(event),
                Err(RecvError::Lagged(missed)) => {
                    log::warn!(
                        "Update listener for world {} lagged by {missed} events",
                        self.world_id
                    );
                    return Some(UpdateEvent::update(""));
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    pub fn into_stream(self) -> impl Stream<Item = UpdateEvent> + Send {
        stream::unfold(self, |mut sub| async move {
            let event = sub.recv().await?;
            Some((event, sub))
        })
    }
}
