//! Message broker bridge: moves persisted events from the job manager to
//! gateway instances over a pluggable publish/subscribe transport.
//!
//! Every event is published to two subjects: `job:<job_id>` and
//! `user:<owner_id>`. Live delivery is at-least-once and best-effort; the
//! event store remains the source of truth for anything missed.

pub mod backoff;
pub mod bridge;
pub mod memory;
#[cfg(feature = "nats")]
pub mod nats;

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use uuid::Uuid;

use crate::error::BrokerError;

pub use backoff::{Backoff, BackoffPolicy};
pub use bridge::{BrokerBridge, EventStream};
pub use memory::MemoryTransport;
#[cfg(feature = "nats")]
pub use nats::NatsTransport;

/// Raw message stream returned by a transport subscription. Ends when the
/// underlying subscription is lost.
pub type MessageStream = Pin<Box<dyn Stream<Item = Vec<u8>> + Send>>;

/// A broker topic.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Topic {
    /// Every event of one job.
    Job(Uuid),
    /// Every event of every job owned by one user.
    User(String),
}

impl Topic {
    pub fn subject(&self) -> String {
        self.to_string()
    }
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Job(id) => write!(f, "job:{id}"),
            Self::User(owner) => write!(f, "user:{owner}"),
        }
    }
}

/// A publish/subscribe transport.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &str;

    /// Establish (or re-establish) the connection.
    async fn connect(&self) -> Result<(), BrokerError>;

    /// Publish one message to a subject.
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<(), BrokerError>;

    /// Subscribe to a subject.
    async fn subscribe(&self, subject: &str) -> Result<MessageStream, BrokerError>;
}
