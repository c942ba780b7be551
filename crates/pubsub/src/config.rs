//! Subscriber configuration and fail-fast validation

use crate::error::{Error, Result};
use crate::types::{ReceiveSettings, SubscriptionSpec};

/// Subscriber settings: the desired subscription state plus optional pull
/// tuning. Missing receive settings fall back to [`ReceiveSettings::default`].
#[derive(Debug, Clone, Default)]
pub struct SubscriberConfig {
    pub subscription: SubscriptionSpec,
    pub receive_settings: Option<ReceiveSettings>,
}

impl SubscriberConfig {
    pub fn new(subscription: SubscriptionSpec) -> Self {
        Self {
            subscription,
            receive_settings: None,
        }
    }

    pub fn with_receive_settings(mut self, settings: ReceiveSettings) -> Self {
        self.receive_settings = Some(settings);
        self
    }

    /// Validate the config in fail-fast mode, returning the first violated
    /// assertion. Runs before any remote call and never mutates state.
    pub fn validate(&self) -> Result<()> {
        if self.subscription.topic.is_empty() {
            return Err(Error::config("subscription topic is not set"));
        }
        if self.subscription.name.is_empty() {
            return Err(Error::config("subscription id is not set"));
        }
        Ok(())
    }
}
