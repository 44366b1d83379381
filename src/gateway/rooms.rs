//! Room registry: one broadcast channel and one broker forwarder per room.

use std::collections::HashMap;
use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::{RwLock, broadcast};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::broker::{BrokerBridge, Topic};
use crate::jobs::event::Event;

const ROOM_CAPACITY: usize = 256;

struct RoomEntry {
    tx: broadcast::Sender<Event>,
    members: usize,
    forwarder: JoinHandle<()>,
}

pub struct RoomRegistry {
    broker: Arc<BrokerBridge>,
    rooms: RwLock<HashMap<Topic, RoomEntry>>,
    capacity: usize,
}

impl RoomRegistry {
    pub fn new(broker: Arc<BrokerBridge>) -> Self {
        Self::with_capacity(broker, ROOM_CAPACITY)
    }

    pub fn with_capacity(broker: Arc<BrokerBridge>, capacity: usize) -> Self {
        Self {
            broker,
            rooms: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Join a room, creating it (and its broker subscription) if needed.
    ///
    /// The broker subscription exists before this returns, so every event
    /// published afterwards reaches the returned receiver.
    pub async fn join(&self, topic: &Topic) -> broadcast::Receiver<Event> {
        if let Some(entry) = self.rooms.write().await.get_mut(topic) {
            entry.members += 1;
            return entry.tx.subscribe();
        }

        // Subscribe outside the lock; the transport may need a round trip.
        let mut stream = self.broker.subscribe(topic.clone()).await;

        let mut rooms = self.rooms.write().await;
        if let Some(entry) = rooms.get_mut(topic) {
            // Lost the race; the other joiner's forwarder serves the room.
            entry.members += 1;
            return entry.tx.subscribe();
        }

        let (tx, rx) = broadcast::channel(self.capacity);
        let forward_tx = tx.clone();
        let room = topic.to_string();
        let forwarder = tokio::spawn(async move {
            while let Some(event) = stream.next().await {
                // No receivers is fine: members may be between leave and removal.
                let _ = forward_tx.send(event);
            }
            debug!(room = %room, "Room forwarder ended");
        });

        rooms.insert(
            topic.clone(),
            RoomEntry {
                tx,
                members: 1,
                forwarder,
            },
        );
        info!(room = %topic, "Room opened");
        rx
    }

    /// Leave a room; the last member out stops its forwarder.
    pub async fn leave(&self, topic: &Topic) {
        let mut rooms = self.rooms.write().await;
        let empty = match rooms.get_mut(topic) {
            Some(entry) => {
                entry.members = entry.members.saturating_sub(1);
                entry.members == 0
            }
            None => false,
        };
        if !empty {
            return;
        }
        if let Some(entry) = rooms.remove(topic) {
            entry.forwarder.abort();
            info!(room = %topic, "Room closed");
        }
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn member_count(&self, topic: &Topic) -> usize {
        self.rooms
            .read()
            .await
            .get(topic)
            .map(|entry| entry.members)
            .unwrap_or(0)
    }
}
