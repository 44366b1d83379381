//! Bridge between the job manager, the transport and its subscribers.

use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::{Stream, StreamExt};
use tracing::{debug, info, warn};

use super::backoff::{Backoff, BackoffPolicy};
use super::{MessageStream, Topic, Transport};
use crate::error::BrokerError;
use crate::jobs::event::Event;

/// Decoded event stream for one topic. Never ends on its own; transport
/// drops are healed by resubscribing.
pub type EventStream = Pin<Box<dyn Stream<Item = Event> + Send>>;

/// Fire-and-forget publisher plus self-healing subscriptions.
pub struct BrokerBridge {
    transport: Arc<dyn Transport>,
    policy: BackoffPolicy,
    connected: Arc<AtomicBool>,
    reconnecting: Arc<AtomicBool>,
}

impl BrokerBridge {
    pub fn new(transport: Arc<dyn Transport>, policy: BackoffPolicy) -> Self {
        Self {
            transport,
            policy,
            connected: Arc::new(AtomicBool::new(false)),
            reconnecting: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Connect once; on failure keep retrying in the background.
    pub async fn start(&self) {
        match self.transport.connect().await {
            Ok(()) => {
                self.connected.store(true, Ordering::SeqCst);
                info!(transport = self.transport.name(), "Broker connected");
            }
            Err(e) => {
                warn!(transport = self.transport.name(), error = %e, "Broker connect failed, retrying in background");
                self.schedule_reconnect();
            }
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn transport_name(&self) -> &str {
        self.transport.name()
    }

    /// Publish an event to its job topic and its owner's topic.
    ///
    /// Never fails: errors are logged and trigger a background reconnect.
    pub async fn publish(&self, event: &Event, owner_id: &str) {
        if !self.is_connected() {
            debug!(job_id = %event.job_id, sequence = event.sequence, "Broker offline, skipping live publish");
            return;
        }

        let payload = match encode(event) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(job_id = %event.job_id, error = %e, "Failed to encode event for broker");
                return;
            }
        };

        for topic in [Topic::Job(event.job_id), Topic::User(owner_id.to_string())] {
            if let Err(e) = self
                .transport
                .publish(&topic.subject(), payload.clone())
                .await
            {
                warn!(
                    transport = self.transport.name(),
                    topic = %topic,
                    sequence = event.sequence,
                    error = %e,
                    "Broker publish failed"
                );
                self.connected.store(false, Ordering::SeqCst);
                self.schedule_reconnect();
                return;
            }
        }
    }

    /// Subscribe to a topic. The first transport subscription is made before
    /// returning; afterwards the stream resubscribes with backoff whenever
    /// the transport drops it.
    pub async fn subscribe(&self, topic: Topic) -> EventStream {
        let subject = topic.subject();
        let inner = match self.transport.subscribe(&subject).await {
            Ok(stream) => Some(stream),
            Err(e) => {
                warn!(subject = %subject, error = %e, "Initial broker subscribe failed, will retry");
                None
            }
        };
        let state = Subscription {
            transport: Arc::clone(&self.transport),
            subject,
            backoff: self.policy.start(),
            inner,
        };

        futures::stream::unfold(state, |mut sub| async move {
            loop {
                if sub.inner.is_none() {
                    match sub.transport.subscribe(&sub.subject).await {
                        Ok(stream) => {
                            if sub.backoff.attempts() > 0 {
                                info!(subject = %sub.subject, "Broker subscription restored");
                            }
                            sub.backoff.reset();
                            sub.inner = Some(stream);
                        }
                        Err(e) => {
                            let delay = sub.backoff.next_delay();
                            debug!(subject = %sub.subject, error = %e, ?delay, "Subscribe failed, backing off");
                            tokio::time::sleep(delay).await;
                            continue;
                        }
                    }
                }

                let next = match sub.inner.as_mut() {
                    Some(stream) => stream.next().await,
                    None => continue,
                };

                match next {
                    Some(bytes) => match serde_json::from_slice::<Event>(&bytes) {
                        Ok(event) => return Some((event, sub)),
                        Err(e) => {
                            warn!(subject = %sub.subject, error = %e, "Dropping undecodable broker message");
                        }
                    },
                    None => {
                        warn!(subject = %sub.subject, "Broker subscription lost, resubscribing");
                        sub.inner = None;
                        let delay = sub.backoff.next_delay();
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        })
        .boxed()
    }

    /// Spawn the single reconnect loop unless one is already running.
    fn schedule_reconnect(&self) {
        if self.reconnecting.swap(true, Ordering::SeqCst) {
            return;
        }

        let transport = Arc::clone(&self.transport);
        let connected = Arc::clone(&self.connected);
        let reconnecting = Arc::clone(&self.reconnecting);
        let mut backoff = self.policy.start();

        tokio::spawn(async move {
            loop {
                tokio::time::sleep(backoff.next_delay()).await;
                match transport.connect().await {
                    Ok(()) => {
                        connected.store(true, Ordering::SeqCst);
                        info!(
                            transport = transport.name(),
                            attempts = backoff.attempts(),
                            "Broker reconnected"
                        );
                        break;
                    }
                    Err(e) => {
                        debug!(transport = transport.name(), error = %e, "Broker reconnect attempt failed");
                    }
                }
            }
            reconnecting.store(false, Ordering::SeqCst);
        });
    }
}

fn encode(event: &Event) -> Result<Vec<u8>, BrokerError> {
    Ok(serde_json::to_vec(event)?)
}

struct Subscription {
    transport: Arc<dyn Transport>,
    subject: String,
    backoff: Backoff,
    inner: Option<MessageStream>,
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::Utc;
    use serde_json::json;
    use tokio::time::timeout;
    use uuid::Uuid;

    use super::*;
    use crate::broker::MemoryTransport;
    use crate::jobs::event::EventKind;

    fn fast_policy() -> BackoffPolicy {
        BackoffPolicy::new(Duration::from_millis(5), Duration::from_millis(20))
    }

    fn event(job_id: Uuid, sequence: u64) -> Event {
        Event {
            job_id,
            sequence,
            kind: EventKind::Progress,
            payload: json!({"progress": sequence}),
            timestamp: Utc::now(),
        }
    }

    async fn started(transport: Arc<MemoryTransport>) -> BrokerBridge {
        let bridge = BrokerBridge::new(transport, fast_policy());
        bridge.start().await;
        bridge
    }

    #[tokio::test]
    async fn publish_reaches_job_and_user_topics() {
        let transport = Arc::new(MemoryTransport::new());
        let bridge = started(Arc::clone(&transport)).await;
        let job_id = Uuid::new_v4();

        let mut job_stream = bridge.subscribe(Topic::Job(job_id)).await;
        let mut user_stream = bridge.subscribe(Topic::User("alice".into())).await;
        assert_eq!(transport.subscriber_count("user:alice"), 1);

        bridge.publish(&event(job_id, 1), "alice").await;

        let a = timeout(Duration::from_secs(1), job_stream.next()).await.unwrap().unwrap();
        let b = timeout(Duration::from_secs(1), user_stream.next()).await.unwrap().unwrap();
        assert_eq!(a.sequence, 1);
        assert_eq!(b.job_id, job_id);
    }

    #[tokio::test]
    async fn publish_failure_is_swallowed_and_reconnects() {
        let transport = Arc::new(MemoryTransport::new());
        let bridge = started(Arc::clone(&transport)).await;
        assert!(bridge.is_connected());

        transport.set_available(false);
        bridge.publish(&event(Uuid::new_v4(), 1), "alice").await;
        assert!(!bridge.is_connected());

        transport.set_available(true);
        timeout(Duration::from_secs(2), async {
            while !bridge.is_connected() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn subscription_heals_after_outage() {
        let transport = Arc::new(MemoryTransport::new());
        let bridge = started(Arc::clone(&transport)).await;
        let job_id = Uuid::new_v4();
        let mut stream = bridge.subscribe(Topic::Job(job_id)).await;

        let subject = Topic::Job(job_id).subject();
        assert_eq!(transport.subscriber_count(&subject), 1);
        let reader = tokio::spawn(async move { stream.next().await });

        transport.set_available(false);
        tokio::time::sleep(Duration::from_millis(30)).await;
        transport.set_available(true);

        timeout(Duration::from_secs(2), async {
            while transport.subscriber_count(&subject) == 0 {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .unwrap();

        transport
            .publish(&subject, serde_json::to_vec(&event(job_id, 7)).unwrap())
            .await
            .unwrap();
        let got = timeout(Duration::from_secs(1), reader).await.unwrap().unwrap().unwrap();
        assert_eq!(got.sequence, 7);
    }

    #[tokio::test]
    async fn publish_while_offline_does_not_block() {
        let transport = Arc::new(MemoryTransport::new());
        transport.set_available(false);
        let bridge = started(Arc::clone(&transport)).await;
        assert!(!bridge.is_connected());
        timeout(
            Duration::from_millis(100),
            bridge.publish(&event(Uuid::new_v4(), 1), "alice"),
        )
        .await
        .unwrap();
    }
}
