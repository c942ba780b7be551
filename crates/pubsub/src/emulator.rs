//! In-process Pub/Sub emulator
//!
//! A [`PubSubClient`] implementation backed by in-memory state, useful for
//! unit and integration tests: no network, no external emulator binary.
//! Delivery is sequential per subscription and nacked messages are requeued
//! at the front of the backlog for prompt redelivery.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::client::{AckReply, ClientError, MessageCallback, PubSubClient, ReceivedMessage};
use crate::types::{Message, ReceiveSettings, SubscriptionSpec, Topic};

const POLL_INTERVAL: Duration = Duration::from_millis(5);

#[derive(Clone)]
struct QueuedMessage {
    id: String,
    ordering_key: String,
    payload: Vec<u8>,
}

#[derive(Default)]
struct State {
    topics: HashMap<String, Topic>,
    subscriptions: HashMap<String, SubscriptionSpec>,
    backlogs: HashMap<String, VecDeque<QueuedMessage>>,
}

/// In-memory Pub/Sub server state plus test knobs.
#[derive(Default)]
pub struct Emulator {
    state: Mutex<State>,
    deny_topic_creates: AtomicBool,
    receive_failure: Mutex<Option<ClientError>>,
}

impl Emulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent topic creations report an empty topic, mimicking a
    /// backend on which the topic can neither be fetched nor created.
    pub fn deny_topic_creates(&self) {
        self.deny_topic_creates.store(true, Ordering::Relaxed);
    }

    /// Inject a terminal transport error for the next `receive` call.
    pub async fn fail_next_receive(&self, err: ClientError) {
        *self.receive_failure.lock().await = Some(err);
    }

    /// Look up a stored topic, for test assertions.
    pub async fn topic(&self, name: &str) -> Option<Topic> {
        self.state.lock().await.topics.get(name).cloned()
    }

    /// Look up a stored subscription, for test assertions.
    pub async fn subscription(&self, name: &str) -> Option<SubscriptionSpec> {
        self.state.lock().await.subscriptions.get(name).cloned()
    }

    /// Undelivered messages currently queued for a subscription.
    pub async fn backlog_len(&self, subscription: &str) -> usize {
        self.state
            .lock()
            .await
            .backlogs
            .get(subscription)
            .map(VecDeque::len)
            .unwrap_or(0)
    }
}

#[async_trait]
impl PubSubClient for Emulator {
    /// Missing topics are reported as a zero-value success, mirroring
    /// clients that return an empty resource instead of a not-found error.
    async fn get_topic(&self, name: &str) -> Result<Topic, ClientError> {
        Ok(self
            .state
            .lock()
            .await
            .topics
            .get(name)
            .cloned()
            .unwrap_or_default())
    }

    async fn create_topic(&self, topic: &Topic) -> Result<Topic, ClientError> {
        if self.deny_topic_creates.load(Ordering::Relaxed) {
            return Ok(Topic::default());
        }
        let mut state = self.state.lock().await;
        if state.topics.contains_key(&topic.name) {
            return Err(ClientError::already_exists(format!(
                "topic {} already exists",
                topic.name
            )));
        }
        state.topics.insert(topic.name.clone(), topic.clone());
        Ok(topic.clone())
    }

    async fn create_subscription(
        &self,
        spec: &SubscriptionSpec,
    ) -> Result<SubscriptionSpec, ClientError> {
        let mut state = self.state.lock().await;
        if !state.topics.contains_key(&spec.topic) {
            return Err(ClientError::not_found(format!("topic {} not found", spec.topic)));
        }
        if state.subscriptions.contains_key(&spec.name) {
            return Err(ClientError::already_exists(format!(
                "subscription {} already exists",
                spec.name
            )));
        }
        state.subscriptions.insert(spec.name.clone(), spec.clone());
        state.backlogs.insert(spec.name.clone(), VecDeque::new());
        Ok(spec.clone())
    }

    async fn update_subscription(
        &self,
        spec: &SubscriptionSpec,
    ) -> Result<SubscriptionSpec, ClientError> {
        let mut state = self.state.lock().await;
        if !state.subscriptions.contains_key(&spec.name) {
            return Err(ClientError::not_found(format!(
                "subscription {} not found",
                spec.name
            )));
        }
        state.subscriptions.insert(spec.name.clone(), spec.clone());
        Ok(spec.clone())
    }

    async fn publish(
        &self,
        topic: &Topic,
        messages: Vec<Message>,
    ) -> Result<Vec<String>, ClientError> {
        let mut state = self.state.lock().await;
        if !state.topics.contains_key(&topic.name) {
            return Err(ClientError::not_found(format!("topic {} not found", topic.name)));
        }

        let queued: Vec<QueuedMessage> = messages
            .into_iter()
            .map(|m| QueuedMessage {
                id: Uuid::new_v4().to_string(),
                ordering_key: m.ordering_key,
                payload: m.payload,
            })
            .collect();
        let ids: Vec<String> = queued.iter().map(|m| m.id.clone()).collect();

        let feeds: Vec<String> = state
            .subscriptions
            .values()
            .filter(|s| s.topic == topic.name)
            .map(|s| s.name.clone())
            .collect();
        for name in feeds {
            if let Some(backlog) = state.backlogs.get_mut(&name) {
                backlog.extend(queued.iter().cloned());
            }
        }
        Ok(ids)
    }

    async fn receive(
        &self,
        cancel: CancellationToken,
        subscription: &str,
        _settings: ReceiveSettings,
        callback: MessageCallback,
    ) -> Result<(), ClientError> {
        if let Some(err) = self.receive_failure.lock().await.take() {
            return Err(err);
        }
        if !self.state.lock().await.subscriptions.contains_key(subscription) {
            return Err(ClientError::not_found(format!(
                "subscription {subscription} not found"
            )));
        }

        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }

            let next = self
                .state
                .lock()
                .await
                .backlogs
                .get_mut(subscription)
                .and_then(VecDeque::pop_front);

            let queued = match next {
                Some(queued) => queued,
                None => {
                    tokio::select! {
                        _ = cancel.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(POLL_INTERVAL) => {}
                    }
                    continue;
                }
            };

            let (msg, reply_rx) = ReceivedMessage::new(
                queued.id.clone(),
                queued.ordering_key.clone(),
                queued.payload.clone(),
            );
            callback(msg).await;

            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                reply = reply_rx => match reply {
                    Ok(AckReply::Ack) => {}
                    // A dropped message counts as a nack: requeue for
                    // prompt redelivery.
                    Ok(AckReply::Nack) | Err(_) => {
                        if let Some(backlog) =
                            self.state.lock().await.backlogs.get_mut(subscription)
                        {
                            backlog.push_front(queued);
                        }
                    }
                }
            }
        }
    }
}
