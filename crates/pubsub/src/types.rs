//! Core data model for topics, subscriptions and messages
//!
//! These types mirror the Pub/Sub resource shapes the remote client
//! understands. They carry no behavior beyond defaults; all remote
//! interaction happens through the [`crate::client::PubSubClient`] trait.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Minimum redelivery backoff injected when a subscription spec carries no
/// retry policy.
///
/// ref: <https://cloud.google.com/pubsub/docs/reference/rest/v1/projects.subscriptions#retrypolicy>
pub const MINIMUM_BACKOFF: Duration = Duration::from_millis(200);

/// Maximum redelivery backoff injected when a subscription spec carries no
/// retry policy.
pub const MAXIMUM_BACKOFF: Duration = Duration::from_secs(600);

/// Ack deadline used by [`crate::Subscriber::with_defaults`].
pub const DEFAULT_ACK_DEADLINE: Duration = Duration::from_secs(10);

/// A named message destination.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Topic {
    /// Fully-qualified topic name, unique within a project namespace.
    pub name: String,
    /// When true, every published message must carry a non-empty ordering key.
    pub enable_ordering: bool,
    /// Optional publish batching knobs, passed opaquely to the client.
    pub publish_settings: Option<PublishSettings>,
}

impl Topic {
    /// Create a topic descriptor with ordering disabled and default
    /// publish settings.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Whether this is the zero-value topic.
    ///
    /// Some client implementations report a missing topic as an empty
    /// success instead of a not-found error; callers treat a zero topic
    /// as "does not exist".
    pub fn is_zero(&self) -> bool {
        self.name.is_empty()
    }
}

/// Publish batching thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishSettings {
    /// Flush once this many bytes are buffered.
    pub byte_threshold: usize,
    /// Flush once this many messages are buffered.
    pub count_threshold: usize,
    /// Flush after this long even if thresholds are not met.
    pub delay_threshold: Duration,
}

impl Default for PublishSettings {
    fn default() -> Self {
        Self {
            byte_threshold: 1_000_000,
            count_threshold: 100,
            delay_threshold: Duration::from_millis(10),
        }
    }
}

/// Redelivery backoff bounds applied after a nack or ack-deadline expiry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub minimum_backoff: Duration,
    pub maximum_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            minimum_backoff: MINIMUM_BACKOFF,
            maximum_backoff: MAXIMUM_BACKOFF,
        }
    }
}

/// Dead-letter routing for messages that exhaust their delivery attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterPolicy {
    pub dead_letter_topic: String,
    pub max_delivery_attempts: i32,
}

/// Desired-state descriptor for a subscription.
///
/// `name` and `topic` must be non-empty and `topic` must reference an
/// existing topic. A `None` retry policy is replaced with
/// [`RetryPolicy::default`] during reconciliation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionSpec {
    /// Fully-qualified subscription name.
    pub name: String,
    /// Fully-qualified name of the topic this subscription feeds from.
    pub topic: String,
    /// How long the service waits for an ack before redelivering.
    pub ack_deadline: Duration,
    pub retry_policy: Option<RetryPolicy>,
    /// Push delivery endpoint; pull delivery when `None`.
    pub push_endpoint: Option<String>,
    /// BigQuery export table; regular delivery when `None`.
    pub bigquery_table: Option<String>,
    pub dead_letter: Option<DeadLetterPolicy>,
    pub labels: HashMap<String, String>,
    /// Deliver messages sharing an ordering key in FIFO order.
    pub enable_ordering: bool,
    /// Retain acknowledged messages for `retention`.
    pub retain_acked: bool,
    /// How long unacknowledged (and, optionally, acknowledged) messages
    /// are retained.
    pub retention: Option<Duration>,
    /// Idle expiration; `Some(Duration::ZERO)` means never expire.
    pub expiration: Option<Duration>,
}

impl SubscriptionSpec {
    pub fn new(name: impl Into<String>, topic: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            topic: topic.into(),
            ..Default::default()
        }
    }
}

/// Tuning knobs for the underlying streaming pull.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReceiveSettings {
    /// Maximum unacknowledged messages held by the client at once.
    pub max_outstanding_messages: usize,
    /// Maximum unacknowledged bytes held by the client at once.
    pub max_outstanding_bytes: usize,
    /// Upper bound on automatic ack-deadline extension.
    pub max_extension: Duration,
    /// Lower bound on automatic ack-deadline extension.
    pub min_extension: Duration,
    /// Worker tasks the client uses for pulling.
    pub num_workers: usize,
}

impl Default for ReceiveSettings {
    fn default() -> Self {
        Self {
            max_outstanding_messages: 1_000,
            max_outstanding_bytes: 1_000_000_000,
            max_extension: Duration::from_secs(60 * 60),
            min_extension: Duration::ZERO,
            num_workers: 10,
        }
    }
}

/// An outbound message. What is persisted is the payload, not the envelope.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Ordering key, required when the topic has ordering enabled.
    pub ordering_key: String,
    /// Opaque payload bytes.
    pub payload: Vec<u8>,
}

impl Message {
    pub fn new(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            ordering_key: String::new(),
            payload: payload.into(),
        }
    }

    pub fn with_ordering_key(mut self, key: impl Into<String>) -> Self {
        self.ordering_key = key.into();
        self
    }
}
