//! Per-connection subscription state: rooms, replay cursors, dedup.
//!
//! Ordering contract for a job: a connection joins the room before reading
//! the backlog, so nothing published after the read can be missed. Live
//! events at or below the last delivered sequence are dropped; a live event
//! that skips ahead is preceded by the missing range read from the store.

use std::collections::HashMap;
use std::sync::Arc;

use tokio_stream::StreamExt;
use tokio_stream::StreamMap;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tracing::{debug, warn};
use uuid::Uuid;

use super::protocol::{Room, ServerMessage};
use super::rooms::RoomRegistry;
use crate::error::{GatewayError, JobError};
use crate::jobs::event::Event;
use crate::store::Database;

/// One item from a joined room.
pub type LiveItem = (Room, Result<Event, BroadcastStreamRecvError>);

pub struct Session {
    connection_id: Uuid,
    owner_id: String,
    store: Arc<dyn Database>,
    registry: Arc<RoomRegistry>,
    max_rooms: usize,
    backlog_cap: usize,
    live: StreamMap<Room, BroadcastStream<Event>>,
    last_delivered: HashMap<Uuid, u64>,
}

impl Session {
    pub fn new(
        owner_id: impl Into<String>,
        store: Arc<dyn Database>,
        registry: Arc<RoomRegistry>,
        max_rooms: usize,
        backlog_cap: usize,
    ) -> Self {
        Self {
            connection_id: Uuid::new_v4(),
            owner_id: owner_id.into(),
            store,
            registry,
            max_rooms,
            backlog_cap: backlog_cap.max(1),
            live: StreamMap::new(),
            last_delivered: HashMap::new(),
        }
    }

    pub fn connection_id(&self) -> Uuid {
        self.connection_id
    }

    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    pub fn room_count(&self) -> usize {
        self.live.len()
    }

    pub fn last_delivered(&self, job_id: Uuid) -> Option<u64> {
        self.last_delivered.get(&job_id).copied()
    }

    /// Next live item from any joined room. Returns `None` immediately when
    /// no rooms are joined.
    pub async fn next_live(&mut self) -> Option<LiveItem> {
        self.live.next().await
    }

    /// Join a room and replay its backlog.
    ///
    /// Returns `subscribed` followed by the replayed `event` frames.
    pub async fn subscribe(
        &mut self,
        room: Room,
        last_seen_sequence: Option<u64>,
        cursors: HashMap<Uuid, u64>,
    ) -> Result<Vec<ServerMessage>, GatewayError> {
        self.authorize(&room).await?;

        let replay_from: Vec<(Uuid, u64)> = match &room {
            Room::Job(id) => vec![(*id, last_seen_sequence.unwrap_or(0))],
            Room::Owner(_) => {
                for job_id in cursors.keys() {
                    self.authorize_job(*job_id).await?;
                }
                let mut pairs: Vec<(Uuid, u64)> = cursors.into_iter().collect();
                pairs.sort();
                pairs
            }
        };

        if !self.live.contains_key(&room) {
            if self.live.len() >= self.max_rooms {
                return Err(GatewayError::Overload {
                    limit: "rooms_per_connection",
                    max: self.max_rooms,
                });
            }
            let rx = self.registry.join(&room.topic()).await;
            self.live.insert(room.clone(), BroadcastStream::new(rx));
        }

        let mut replayed = Vec::new();
        let mut truncated = false;
        for (job_id, after) in replay_from {
            let (events, cut) = self.replay(job_id, after).await?;
            truncated |= cut;
            replayed.extend(events);
        }

        debug!(
            connection_id = %self.connection_id,
            room = %room,
            replayed = replayed.len(),
            truncated,
            "Subscribed"
        );

        let mut out = Vec::with_capacity(replayed.len() + 1);
        out.push(ServerMessage::Subscribed {
            room: room.clone(),
            replayed: replayed.len(),
            truncated,
        });
        out.extend(replayed.into_iter().map(|event| ServerMessage::Event {
            room: room.clone(),
            event,
        }));
        Ok(out)
    }

    pub async fn unsubscribe(&mut self, room: Room) -> ServerMessage {
        if self.live.remove(&room).is_some() {
            self.registry.leave(&room.topic()).await;
            debug!(connection_id = %self.connection_id, room = %room, "Unsubscribed");
        }
        ServerMessage::Unsubscribed { room }
    }

    /// Turn one live item into the frames to send.
    pub async fn on_live(&mut self, item: LiveItem) -> Result<Vec<ServerMessage>, GatewayError> {
        let (room, result) = item;
        match result {
            Ok(event) => self.deliver(room, event).await,
            Err(BroadcastStreamRecvError::Lagged(missed)) => {
                warn!(connection_id = %self.connection_id, room = %room, missed, "Room receiver lagged, re-syncing from store");
                self.resync(room).await
            }
        }
    }

    /// Leave every joined room.
    pub async fn close(&mut self) {
        let rooms: Vec<Room> = self.live.keys().cloned().collect();
        for room in rooms {
            self.live.remove(&room);
            self.registry.leave(&room.topic()).await;
        }
    }

    async fn authorize(&self, room: &Room) -> Result<(), GatewayError> {
        match room {
            Room::Owner(owner) if *owner == self.owner_id => Ok(()),
            Room::Owner(_) => Err(GatewayError::Forbidden {
                room: room.to_string(),
            }),
            Room::Job(id) => self.authorize_job(*id).await,
        }
    }

    async fn authorize_job(&self, id: Uuid) -> Result<(), GatewayError> {
        let job = self
            .store
            .get_job(id)
            .await
            .map_err(JobError::from)?
            .ok_or(JobError::NotFound { id })?;
        if job.owner_id != self.owner_id {
            return Err(GatewayError::Forbidden {
                room: Room::Job(id).to_string(),
            });
        }
        Ok(())
    }

    /// Read events after `after`, capped to the most recent `backlog_cap`.
    async fn replay(&mut self, job_id: Uuid, after: u64) -> Result<(Vec<Event>, bool), GatewayError> {
        let last = self
            .store
            .last_sequence(job_id)
            .await
            .map_err(JobError::from)?;
        let floor = last.saturating_sub(self.backlog_cap as u64);
        let start = after.max(floor);
        let truncated = start > after;

        let events = if start < last {
            self.store
                .read_events(job_id, start, self.backlog_cap)
                .await
                .map_err(JobError::from)?
        } else {
            Vec::new()
        };

        let delivered = events.last().map(|e| e.sequence).unwrap_or(start);
        self.last_delivered.insert(job_id, delivered.max(start));
        Ok((events, truncated))
    }

    async fn deliver(&mut self, room: Room, event: Event) -> Result<Vec<ServerMessage>, GatewayError> {
        let job_id = event.job_id;
        let Some(last) = self.last_delivered(job_id) else {
            // First sight of this job on an owner room; no baseline to fill from.
            self.last_delivered.insert(job_id, event.sequence);
            return Ok(vec![ServerMessage::Event { room, event }]);
        };

        if event.sequence <= last {
            return Ok(Vec::new());
        }

        let mut batch = Vec::new();
        if event.sequence > last + 1 {
            let from = last.max(event.sequence.saturating_sub(self.backlog_cap as u64 + 1));
            debug!(job_id = %job_id, last, next = event.sequence, "Sequence gap, filling from store");
            let missing = self
                .store
                .read_events(job_id, from, (event.sequence - from - 1) as usize)
                .await
                .map_err(JobError::from)?;
            batch.extend(missing.into_iter().filter(|e| e.sequence < event.sequence));
        }
        batch.push(event);

        Ok(self.frames(room, batch))
    }

    async fn resync(&mut self, room: Room) -> Result<Vec<ServerMessage>, GatewayError> {
        let jobs: Vec<(Uuid, u64)> = match &room {
            Room::Job(id) => self
                .last_delivered(*id)
                .map(|last| vec![(*id, last)])
                .unwrap_or_default(),
            // Every tracked job belongs to this connection's owner.
            Room::Owner(_) => self.last_delivered.iter().map(|(id, last)| (*id, *last)).collect(),
        };

        let mut batch = Vec::new();
        for (job_id, last) in jobs {
            let events = self
                .store
                .read_events(job_id, last, self.backlog_cap)
                .await
                .map_err(JobError::from)?;
            batch.extend(events);
        }
        Ok(self.frames(room, batch))
    }

    /// Record delivery and wrap events as frames.
    fn frames(&mut self, room: Room, events: Vec<Event>) -> Vec<ServerMessage> {
        events
            .into_iter()
            .filter_map(|event| {
                let last = self.last_delivered.entry(event.job_id).or_insert(0);
                if event.sequence <= *last {
                    return None;
                }
                *last = event.sequence;
                Some(ServerMessage::Event {
                    room: room.clone(),
                    event,
                })
            })
            .collect()
    }
}
