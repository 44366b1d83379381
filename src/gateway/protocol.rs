//! Realtime wire protocol: JSON text frames tagged by `type`.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::broker::Topic;
use crate::error::GatewayError;
use crate::jobs::event::Event;

/// A subscription room. Serializes as `{"job": "<uuid>"}` or `{"owner": "<id>"}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Room {
    Job(Uuid),
    Owner(String),
}

impl Room {
    pub fn topic(&self) -> Topic {
        match self {
            Self::Job(id) => Topic::Job(*id),
            Self::Owner(owner) => Topic::User(owner.clone()),
        }
    }
}

impl std::fmt::Display for Room {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.topic().fmt(f)
    }
}

/// Frames sent by clients.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Auth {
        token: String,
    },
    Subscribe {
        room: Room,
        /// Replay events after this sequence (job rooms).
        #[serde(default)]
        last_seen_sequence: Option<u64>,
        /// Per-job replay cursors (owner rooms).
        #[serde(default)]
        cursors: HashMap<Uuid, u64>,
    },
    Unsubscribe {
        room: Room,
    },
    Ping,
}

/// Frames sent by the gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    AuthOk {
        owner_id: String,
        connection_id: Uuid,
    },
    /// Sent before the replayed events of a subscription.
    Subscribed {
        room: Room,
        replayed: usize,
        /// The backlog cap cut the replay short; older events are only
        /// available through the audit API.
        truncated: bool,
    },
    Event {
        room: Room,
        event: Event,
    },
    Unsubscribed {
        room: Room,
    },
    Pong,
    Error {
        code: String,
        message: String,
        retryable: bool,
    },
}

impl From<&GatewayError> for ServerMessage {
    fn from(err: &GatewayError) -> Self {
        Self::Error {
            code: err.code().to_string(),
            message: err.to_string(),
            retryable: err.is_retryable(),
        }
    }
}
