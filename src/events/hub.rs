//! Per-entity broadcast channels
//!
//! One `broadcast` channel per entity id, created on first subscribe. A
//! publish with no subscriber is dropped. Slow receivers lag rather than
//! block the writer.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

use crate::store::EntityProjection;

pub const DEFAULT_CHANNEL_CAPACITY: usize = 64;

/// Message pushed to every subscriber of an entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EntityEvent {
    /// Full projection after a change (fields, relations or edit context)
    Updated { entity: EntityProjection },
    /// The entity is gone; subscribers should close
    Deleted { id: String },
}

impl EntityEvent {
    pub fn entity_id(&self) -> &str {
        match self {
            EntityEvent::Updated { entity } => &entity.id,
            EntityEvent::Deleted { id } => id,
        }
    }
}

/// Hub for broadcasting entity updates to subscribed views
pub struct EventHub {
    channels: DashMap<String, broadcast::Sender<EntityEvent>>,
    capacity: usize,
}

impl EventHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    /// Subscribe to updates of one entity
    pub fn subscribe(&self, entity_id: &str) -> broadcast::Receiver<EntityEvent> {
        self.channels
            .entry(entity_id.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// Broadcast to the entity's subscribers; returns how many received it
    pub fn publish(&self, entity_id: &str, event: EntityEvent) -> usize {
        let Some(sender) = self.channels.get(entity_id).map(|s| s.clone()) else {
            return 0;
        };
        // Ignore send errors (no subscribers)
        sender.send(event).unwrap_or(0)
    }

    pub fn subscriber_count(&self, entity_id: &str) -> usize {
        self.channels
            .get(entity_id)
            .map(|s| s.receiver_count())
            .unwrap_or(0)
    }

    /// Drop channels nobody listens to any more
    pub fn prune(&self) -> usize {
        let before = self.channels.len();
        self.channels.retain(|_, sender| sender.receiver_count() > 0);
        let removed = before - self.channels.len();
        if removed > 0 {
            debug!("Pruned {} idle entity channels", removed);
        }
        removed
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }
}
