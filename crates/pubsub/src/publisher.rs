//! Batch publishing façade
//!
//! Thin wrapper over [`PubSubClient::publish`] that enforces the ordering-key
//! invariant before anything reaches the wire.

use std::sync::Arc;

use crate::client::PubSubClient;
use crate::error::{Error, Result};
use crate::types::{Message, Topic};

/// Publishes batches of messages to a topic.
pub struct Publisher {
    client: Arc<dyn PubSubClient>,
}

impl Publisher {
    pub fn new(client: Arc<dyn PubSubClient>) -> Self {
        Self { client }
    }

    /// Publish a batch of messages.
    ///
    /// When the topic has ordering enabled, every message must carry a
    /// non-empty ordering key; otherwise the whole batch is rejected and
    /// nothing is published.
    pub async fn publish(&self, topic: &Topic, messages: Vec<Message>) -> Result<()> {
        tracing::debug!(topic = %topic.name, count = messages.len(), "publishing messages");

        if topic.enable_ordering && messages.iter().any(|m| m.ordering_key.is_empty()) {
            return Err(Error::publish(
                "message ordering key is required when message ordering is enabled",
            ));
        }

        let count = messages.len();
        let ids = self.client.publish(topic, messages).await.map_err(|err| {
            tracing::error!(topic = %topic.name, error = %err, "unable to publish messages");
            Error::Client(err)
        })?;

        tracing::debug!(
            topic = %topic.name,
            published = ids.len(),
            requested = count,
            "successfully published messages"
        );
        Ok(())
    }
}
