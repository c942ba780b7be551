//! Subscription reconciliation and the message-consumption engine
//!
//! [`Subscriber::new`] idempotently reconciles a desired subscription spec
//! against remote state (ensure topic, create-or-update subscription), then
//! [`Subscriber::consume`] bridges the client's push-style delivery into a
//! strictly sequential handler loop with ack/nack semantics, panic
//! containment and cancellation-driven shutdown.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::FutureExt;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::client::{ClientError, ErrorKind, MessageCallback, PubSubClient, ReceivedMessage};
use crate::config::SubscriberConfig;
use crate::error::{Error, Result};
use crate::types::{
    ReceiveSettings, RetryPolicy, SubscriptionSpec, Topic, DEFAULT_ACK_DEADLINE,
};

/// What the receive task hands to the sequential loop.
///
/// Funneling transport errors through the same capacity-1 channel as
/// messages keeps the error channel single-writer: only the loop that owns
/// the consume lock ever sends on it.
enum Delivery {
    Message(ReceivedMessage),
    TransportError(ClientError),
}

/// Runtime handle bound to one reconciled subscription.
///
/// At most one [`Subscriber::consume`] call runs at a time per instance;
/// a second concurrent call blocks until the first returns.
pub struct Subscriber {
    client: Arc<dyn PubSubClient>,
    subscription: SubscriptionSpec,
    receive_settings: ReceiveSettings,
    consume_lock: Mutex<()>,
    // diagnostic counters, useful to hook in metrics
    messages_received_count: AtomicU64,
    messages_processed_count: AtomicU64,
}

impl std::fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscriber")
            .field("subscription", &self.subscription)
            .field("receive_settings", &self.receive_settings)
            .field(
                "messages_received_count",
                &self.messages_received_count.load(Ordering::Relaxed),
            )
            .field(
                "messages_processed_count",
                &self.messages_processed_count.load(Ordering::Relaxed),
            )
            .finish_non_exhaustive()
    }
}

impl Subscriber {
    /// Create a subscriber: validate the config, ensure the topic exists,
    /// reconcile the subscription to match the spec, and bind receive
    /// settings. Counters start at zero.
    pub async fn new(client: Arc<dyn PubSubClient>, config: &SubscriberConfig) -> Result<Self> {
        config.validate()?;

        ensure_topic(client.as_ref(), &config.subscription.topic).await?;
        let subscription = ensure_subscription(client.as_ref(), config.subscription.clone()).await?;
        let receive_settings = config.receive_settings.clone().unwrap_or_default();

        Ok(Self {
            client,
            subscription,
            receive_settings,
            consume_lock: Mutex::new(()),
            messages_received_count: AtomicU64::new(0),
            messages_processed_count: AtomicU64::new(0),
        })
    }

    /// Create a subscriber with default settings: 10s ack deadline, message
    /// ordering enabled, no idle expiration.
    pub async fn with_defaults(
        client: Arc<dyn PubSubClient>,
        subscription_id: &str,
        topic_name: &str,
    ) -> Result<Self> {
        let spec = SubscriptionSpec {
            ack_deadline: DEFAULT_ACK_DEADLINE,
            enable_ordering: true,
            expiration: Some(std::time::Duration::ZERO),
            ..SubscriptionSpec::new(subscription_id, topic_name)
        };
        Self::new(client, &SubscriberConfig::new(spec)).await
    }

    /// The reconciled subscription this instance consumes from.
    pub fn subscription(&self) -> &SubscriptionSpec {
        &self.subscription
    }

    /// Messages handed to the handler so far, across all consume calls.
    pub fn messages_received_count(&self) -> u64 {
        self.messages_received_count.load(Ordering::Relaxed)
    }

    /// Messages acknowledged after successful handling, across all
    /// consume calls.
    pub fn messages_processed_count(&self) -> u64 {
        self.messages_processed_count.load(Ordering::Relaxed)
    }

    /// Receive messages and pass each payload to `handler`, one at a time.
    ///
    /// Terminal conditions are reported through `err_tx`:
    /// - a handler error or contained panic is sent once, the message is
    ///   nacked for prompt redelivery, and the call returns;
    /// - a terminal transport failure of the streaming pull is sent once and
    ///   the call returns;
    /// - cancellation of `cancel` is silent: the call returns with no error
    ///   sent.
    ///
    /// On every exit path all senders drop, so the caller observes
    /// termination by receiving on the paired receiver until it yields
    /// `None`. `err_tx` must be the only sender for that channel. Calling
    /// `consume` again after it returns is legal; the prior receive task is
    /// fully unwound before the exclusive lock is released.
    pub async fn consume<H, Fut>(
        &self,
        cancel: CancellationToken,
        mut handler: H,
        err_tx: mpsc::Sender<Error>,
    ) where
        H: FnMut(Vec<u8>) -> Fut,
        Fut: Future<Output = anyhow::Result<()>>,
    {
        let _guard = self.consume_lock.lock().await;
        tracing::debug!(subscription = %self.subscription.name, "start consuming messages");

        // Capacity 1 is the backpressure contract: the client is throttled
        // to one outstanding, unprocessed message. Do not widen it.
        let (delivery_tx, mut delivery_rx) = mpsc::channel::<Delivery>(1);
        let receive_cancel = cancel.child_token();

        let receive_task = {
            let client = Arc::clone(&self.client);
            let subscription = self.subscription.name.clone();
            let settings = self.receive_settings.clone();
            let token = receive_cancel.clone();
            tokio::spawn(async move {
                let callback_tx = delivery_tx.clone();
                let callback_token = token.clone();
                let callback: MessageCallback = Arc::new(move |msg| {
                    let tx = callback_tx.clone();
                    let token = callback_token.clone();
                    async move {
                        tokio::select! {
                            _ = token.cancelled() => {}
                            _ = tx.send(Delivery::Message(msg)) => {}
                        }
                    }
                    .boxed()
                });
                if let Err(err) =
                    client.receive(token.clone(), &subscription, settings, callback).await
                {
                    // A cancellation-triggered unwind is expected shutdown,
                    // not a transport failure. The send must also stay
                    // abortable: the bridge slot can be occupied by a message
                    // the loop will never dequeue.
                    if !token.is_cancelled() {
                        tokio::select! {
                            _ = token.cancelled() => {}
                            _ = delivery_tx.send(Delivery::TransportError(err)) => {}
                        }
                    }
                }
            })
        };

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!(
                        subscription = %self.subscription.name,
                        received = self.messages_received_count(),
                        "consume loop cancelled"
                    );
                    break;
                }
                delivery = delivery_rx.recv() => match delivery {
                    Some(Delivery::Message(msg)) => {
                        tracing::debug!(message_id = %msg.id, "received message");
                        self.messages_received_count.fetch_add(1, Ordering::Relaxed);

                        let payload = msg.payload.clone();
                        let outcome =
                            AssertUnwindSafe(async { handler(payload).await }).catch_unwind().await;
                        match outcome {
                            Ok(Ok(())) => {
                                self.messages_processed_count.fetch_add(1, Ordering::Relaxed);
                                msg.ack();
                            }
                            Ok(Err(err)) => {
                                tracing::error!(
                                    message_id = %msg.id,
                                    error = %err,
                                    "handler rejected message"
                                );
                                let _ = err_tx.send(Error::Handler(err)).await;
                                // Nack for prompt redelivery rather than
                                // awaiting the ack-deadline expiry.
                                msg.nack();
                                break;
                            }
                            Err(panic) => {
                                let reason = panic_message(panic);
                                tracing::error!(
                                    message_id = %msg.id,
                                    reason = %reason,
                                    "handler panicked"
                                );
                                let _ = err_tx.send(Error::HandlerPanic(reason)).await;
                                msg.nack();
                                break;
                            }
                        }
                    }
                    Some(Delivery::TransportError(err)) => {
                        tracing::error!(
                            subscription = %self.subscription.name,
                            error = %err,
                            "streaming pull terminated"
                        );
                        let _ = err_tx.send(Error::Transport(err)).await;
                        break;
                    }
                    // Receive task ended without reporting an error.
                    None => break,
                }
            }
        }

        // Unwind the receive task before releasing the lock so nothing is
        // still delivering when the next consume call starts.
        receive_cancel.cancel();
        let _ = receive_task.await;
    }
}

/// Guarantee `topic_name` exists.
///
/// Fetch errors are propagated verbatim. A fetch that succeeds but returns
/// the zero-value topic is treated as not-found: creation is attempted, and
/// only if creation also yields an empty topic does this fail definitively.
pub(crate) async fn ensure_topic(client: &dyn PubSubClient, topic_name: &str) -> Result<()> {
    let topic = client.get_topic(topic_name).await?;
    if !topic.is_zero() {
        return Ok(());
    }

    // Some implementations return an empty success rather than an error for
    // missing resources.
    let created = client.create_topic(&Topic::new(topic_name)).await?;
    if created.is_zero() {
        return Err(Error::TopicNotFound(topic_name.to_string()));
    }

    tracing::debug!(topic = %topic_name, "created missing topic");
    Ok(())
}

/// Create or update a subscription so the remote state matches `spec`.
///
/// Defaults are applied first: a spec without a retry policy gets the
/// package backoff bounds, so every reconciled subscription carries an
/// explicit, bounded retry policy.
pub(crate) async fn ensure_subscription(
    client: &dyn PubSubClient,
    mut spec: SubscriptionSpec,
) -> Result<SubscriptionSpec> {
    if spec.retry_policy.is_none() {
        spec.retry_policy = Some(RetryPolicy::default());
    }

    match client.create_subscription(&spec).await {
        Ok(created) => Ok(created),
        Err(err) => match err.kind() {
            ErrorKind::AlreadyExists => {
                tracing::debug!(subscription = %spec.name, "subscription exists, updating");
                Ok(client.update_subscription(&spec).await?)
            }
            ErrorKind::NotFound => Err(Error::TopicNotFound(spec.topic.clone())),
            ErrorKind::Other => Err(err.into()),
        },
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
