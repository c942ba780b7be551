//! GCP Pub/Sub subscription toolkit
//!
//! This crate provides the subscription side of a Pub/Sub integration:
//! - Idempotent reconciliation of a desired subscription spec against remote
//!   state (ensure the topic exists, create-or-update the subscription,
//!   inject default retry-policy bounds)
//! - A bounded, cancellable consume loop that bridges the client's
//!   push-style delivery into a strictly sequential per-message handler,
//!   with ack/nack semantics, handler panic containment and clean shutdown
//! - A batch publishing façade enforcing the ordering-key invariant
//! - A trait-based remote client boundary plus an in-process emulator for
//!   tests
//!
//! Construction errors surface through [`Result`]; consume-loop errors
//! surface through the error channel passed to [`Subscriber::consume`],
//! which the caller drains until it closes.

pub mod client;
pub mod config;
pub mod emulator;
pub mod error;
pub mod publisher;
pub mod subscriber;
pub mod types;

// Re-export commonly used types
pub use client::{AckReply, ClientError, ErrorKind, MessageCallback, PubSubClient, ReceivedMessage};
pub use config::SubscriberConfig;
pub use emulator::Emulator;
pub use error::{Error, Result};
pub use publisher::Publisher;
pub use subscriber::Subscriber;
pub use types::{
    DeadLetterPolicy, Message, PublishSettings, ReceiveSettings, RetryPolicy, SubscriptionSpec,
    Topic, DEFAULT_ACK_DEADLINE, MAXIMUM_BACKOFF, MINIMUM_BACKOFF,
};

/// Initialize tracing subscriber for structured logging
pub fn init_tracing() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "gcp_pubsub=debug,info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
