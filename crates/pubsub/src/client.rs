//! Remote Pub/Sub client boundary
//!
//! Provides a trait-based abstraction over the remote client to enable
//! testing. The trait mirrors the admin RPCs plus the push-style streaming
//! pull primitive; the wire protocol itself belongs to the implementation.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::types::{Message, ReceiveSettings, SubscriptionSpec, Topic};

/// Structured classification of a remote failure.
///
/// The reconciler branches on this enum, never on error message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The resource being created already exists
    AlreadyExists,
    /// A referenced resource does not exist
    NotFound,
    /// Anything else: transport faults, permission failures, quota, ...
    Other,
}

/// Error returned by remote client calls
#[derive(Debug, Error)]
#[error("{message}")]
pub struct ClientError {
    kind: ErrorKind,
    message: String,
}

impl ClientError {
    pub fn already_exists(msg: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::AlreadyExists,
            message: msg.into(),
        }
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::NotFound,
            message: msg.into(),
        }
    }

    pub fn other(msg: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Other,
            message: msg.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }
}

/// Acknowledgment verdict sent back to the delivering client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckReply {
    Ack,
    Nack,
}

/// An inbound message handed to the receive callback.
///
/// Acknowledgment is consumed by value: a message can be acked or nacked
/// exactly once, and dropping it unacknowledged counts as a nack.
pub struct ReceivedMessage {
    /// Server-assigned id, used only for logging.
    pub id: String,
    /// Ordering key the message was published with, if any.
    pub ordering_key: String,
    /// Opaque payload bytes.
    pub payload: Vec<u8>,
    reply: oneshot::Sender<AckReply>,
}

impl ReceivedMessage {
    /// Build a message and the reply receiver the delivering client waits on.
    pub fn new(
        id: impl Into<String>,
        ordering_key: impl Into<String>,
        payload: Vec<u8>,
    ) -> (Self, oneshot::Receiver<AckReply>) {
        let (reply, reply_rx) = oneshot::channel();
        (
            Self {
                id: id.into(),
                ordering_key: ordering_key.into(),
                payload,
                reply,
            },
            reply_rx,
        )
    }

    /// Positively acknowledge: the message is processed and will not be
    /// redelivered.
    pub fn ack(self) {
        let _ = self.reply.send(AckReply::Ack);
    }

    /// Negatively acknowledge: request prompt redelivery instead of waiting
    /// out the ack deadline.
    pub fn nack(self) {
        let _ = self.reply.send(AckReply::Nack);
    }
}

impl fmt::Debug for ReceivedMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReceivedMessage")
            .field("id", &self.id)
            .field("ordering_key", &self.ordering_key)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

/// Per-message callback invoked by [`PubSubClient::receive`].
pub type MessageCallback = Arc<dyn Fn(ReceivedMessage) -> BoxFuture<'static, ()> + Send + Sync>;

/// Abstract remote Pub/Sub client interface for testability
#[async_trait]
pub trait PubSubClient: Send + Sync {
    /// Fetch a topic by fully-qualified name.
    ///
    /// Implementations may report a missing topic either as
    /// [`ErrorKind::NotFound`] or as a zero-value [`Topic`] success; callers
    /// handle both shapes.
    async fn get_topic(&self, name: &str) -> Result<Topic, ClientError>;

    /// Create a topic.
    async fn create_topic(&self, topic: &Topic) -> Result<Topic, ClientError>;

    /// Create a subscription matching `spec`.
    async fn create_subscription(
        &self,
        spec: &SubscriptionSpec,
    ) -> Result<SubscriptionSpec, ClientError>;

    /// Apply `spec`'s fields to an existing subscription.
    async fn update_subscription(
        &self,
        spec: &SubscriptionSpec,
    ) -> Result<SubscriptionSpec, ClientError>;

    /// Publish a batch of messages, returning server-assigned message ids.
    async fn publish(&self, topic: &Topic, messages: Vec<Message>)
        -> Result<Vec<String>, ClientError>;

    /// Streaming pull: invoke `callback` once per delivered message until
    /// `cancel` is triggered (clean return) or a terminal transport error
    /// occurs.
    async fn receive(
        &self,
        cancel: CancellationToken,
        subscription: &str,
        settings: ReceiveSettings,
        callback: MessageCallback,
    ) -> Result<(), ClientError>;
}
