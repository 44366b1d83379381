//! NATS transport (core pub/sub, at-most-once per subscriber).

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::RwLock;
use tracing::info;

use super::{MessageStream, Transport};
use crate::error::BrokerError;

/// Subjects are namespaced so several deployments can share a server.
const SUBJECT_PREFIX: &str = "job-relay.";

pub struct NatsTransport {
    url: String,
    client: RwLock<Option<async_nats::Client>>,
}

impl NatsTransport {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            client: RwLock::new(None),
        }
    }

    async fn client(&self) -> Result<async_nats::Client, BrokerError> {
        self.client
            .read()
            .await
            .clone()
            .ok_or_else(|| BrokerError::Unavailable {
                transport: self.name().to_string(),
                reason: "not connected".to_string(),
            })
    }

    fn subject(subject: &str) -> String {
        format!("{SUBJECT_PREFIX}{subject}")
    }
}

#[async_trait]
impl Transport for NatsTransport {
    fn name(&self) -> &str {
        "nats"
    }

    async fn connect(&self) -> Result<(), BrokerError> {
        let client = async_nats::connect(&self.url)
            .await
            .map_err(|e| BrokerError::Unavailable {
                transport: self.name().to_string(),
                reason: e.to_string(),
            })?;
        *self.client.write().await = Some(client);
        info!(url = %self.url, "NATS connected");
        Ok(())
    }

    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<(), BrokerError> {
        let client = self.client().await?;
        client
            .publish(Self::subject(subject), payload.into())
            .await
            .map_err(|e| BrokerError::Transport(format!("publish {subject}: {e}")))
    }

    async fn subscribe(&self, subject: &str) -> Result<MessageStream, BrokerError> {
        let client = self.client().await?;
        let subscriber = client
            .subscribe(Self::subject(subject))
            .await
            .map_err(|e| BrokerError::Transport(format!("subscribe {subject}: {e}")))?;
        Ok(subscriber.map(|msg| msg.payload.to_vec()).boxed())
    }
}
