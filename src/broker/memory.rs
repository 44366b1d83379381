//! In-process transport: one broadcast channel per subject.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::debug;

use super::{MessageStream, Transport};
use crate::error::BrokerError;

const DEFAULT_CAPACITY: usize = 1024;

/// Single-process transport. Used by default and in tests.
///
/// `set_available(false)` simulates a broker outage: publishes and new
/// subscriptions fail, and every open subscription stream ends.
pub struct MemoryTransport {
    subjects: DashMap<String, broadcast::Sender<Vec<u8>>>,
    available: AtomicBool,
    capacity: usize,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            subjects: DashMap::new(),
            available: AtomicBool::new(true),
            capacity: capacity.max(1),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
        if !available {
            // Dropping the senders closes every receiver.
            self.subjects.clear();
        }
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    /// Number of live subscribers on a subject.
    pub fn subscriber_count(&self, subject: &str) -> usize {
        self.subjects
            .get(subject)
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }

    fn unavailable(&self) -> BrokerError {
        BrokerError::Unavailable {
            transport: self.name().to_string(),
            reason: "transport is offline".to_string(),
        }
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn name(&self) -> &str {
        "memory"
    }

    async fn connect(&self) -> Result<(), BrokerError> {
        if self.is_available() {
            Ok(())
        } else {
            Err(self.unavailable())
        }
    }

    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<(), BrokerError> {
        if !self.is_available() {
            return Err(self.unavailable());
        }

        let abandoned = match self.subjects.get(subject) {
            Some(tx) if tx.receiver_count() > 0 => {
                // Receivers may drop between the check and the send; that is not an error.
                let _ = tx.send(payload);
                false
            }
            Some(_) => true,
            None => false,
        };

        if abandoned {
            self.subjects
                .remove_if(subject, |_, tx| tx.receiver_count() == 0);
            debug!(subject, "Pruned subject with no subscribers");
        }
        Ok(())
    }

    async fn subscribe(&self, subject: &str) -> Result<MessageStream, BrokerError> {
        if !self.is_available() {
            return Err(self.unavailable());
        }

        let rx = self
            .subjects
            .entry(subject.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe();

        // Lagged receivers skip ahead; consumers recover missed events from the store.
        let stream = BroadcastStream::new(rx).filter_map(|msg| async move { msg.ok() });
        Ok(stream.boxed())
    }
}
