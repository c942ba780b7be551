//! Error types for the library
//!
//! Construction-time failures surface through [`Result`]; runtime failures
//! inside a consume loop surface through the error channel passed to
//! [`crate::Subscriber::consume`].

use thiserror::Error;

use crate::client::ClientError;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Library error types
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid subscriber configuration, detected before any remote call
    #[error("Configuration error: {0}")]
    Config(String),

    /// The referenced topic does not exist and could not be created
    #[error("topic {0} does not exist")]
    TopicNotFound(String),

    /// Remote admin call failure (topic fetch/create, subscription
    /// create/update)
    #[error("Pub/Sub client error: {0}")]
    Client(#[from] ClientError),

    /// The streaming pull terminated with a transport failure
    #[error("receive transport error: {0}")]
    Transport(ClientError),

    /// The caller-supplied handler rejected a message
    #[error("subscription handler error: {0}")]
    Handler(anyhow::Error),

    /// The caller-supplied handler panicked; the panic was contained and
    /// converted into this error
    #[error("panic in subscription handler: {0}")]
    HandlerPanic(String),

    /// A publish request was rejected before reaching the client
    #[error("publish error: {0}")]
    Publish(String),
}

impl Error {
    /// Create a Config error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a Publish error
    pub fn publish(msg: impl Into<String>) -> Self {
        Self::Publish(msg.into())
    }
}
