//! Integration tests for subscription reconciliation and the consume loop,
//! driven by the in-process emulator.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use gcp_pubsub::{
    ClientError, Emulator, Error, Message, PubSubClient, Publisher, RetryPolicy, Subscriber,
    SubscriberConfig, SubscriptionSpec, Topic, MAXIMUM_BACKOFF, MINIMUM_BACKOFF,
};

const TOPIC: &str = "test-topic";
const SUBSCRIPTION: &str = "some-subscriber";

async fn emulator_with_topic() -> Arc<Emulator> {
    let emulator = Arc::new(Emulator::new());
    emulator.create_topic(&Topic::new(TOPIC)).await.unwrap();
    emulator
}

/// Drain the error channel until it closes, with a hang guard.
async fn drain_errors(mut err_rx: mpsc::Receiver<Error>) -> Vec<Error> {
    timeout(Duration::from_secs(5), async move {
        let mut errors = Vec::new();
        while let Some(err) = err_rx.recv().await {
            errors.push(err);
        }
        errors
    })
    .await
    .expect("error channel did not close")
}

#[tokio::test]
async fn reconciliation_is_idempotent_and_applies_the_latest_spec() {
    let emulator = emulator_with_topic().await;
    let client: Arc<dyn PubSubClient> = emulator.clone();

    let first = SubscriptionSpec {
        ack_deadline: Duration::from_secs(10),
        ..SubscriptionSpec::new(SUBSCRIPTION, TOPIC)
    };
    Subscriber::new(client.clone(), &SubscriberConfig::new(first))
        .await
        .unwrap();

    // Same subscription again: the create-then-update path must succeed and
    // the stored state must reflect the newer fields.
    let policy = RetryPolicy {
        minimum_backoff: Duration::from_secs(100),
        maximum_backoff: Duration::from_secs(1_000),
    };
    let second = SubscriptionSpec {
        ack_deadline: Duration::from_secs(30),
        retry_policy: Some(policy.clone()),
        ..SubscriptionSpec::new(SUBSCRIPTION, TOPIC)
    };
    Subscriber::new(client, &SubscriberConfig::new(second))
        .await
        .unwrap();

    let stored = emulator.subscription(SUBSCRIPTION).await.unwrap();
    assert_eq!(stored.ack_deadline, Duration::from_secs(30));
    assert_eq!(stored.retry_policy, Some(policy));
}

#[tokio::test]
async fn missing_uncreatable_topic_fails_by_name_and_leaves_no_subscription() {
    let emulator = Arc::new(Emulator::new());
    emulator.deny_topic_creates();
    let client: Arc<dyn PubSubClient> = emulator.clone();

    let err = Subscriber::with_defaults(client, SUBSCRIPTION, "ghost-topic")
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "topic ghost-topic does not exist");
    assert!(emulator.subscription(SUBSCRIPTION).await.is_none());
}

#[tokio::test]
async fn default_retry_policy_is_injected_into_the_reconciled_subscription() {
    let emulator = emulator_with_topic().await;
    let client: Arc<dyn PubSubClient> = emulator.clone();

    let spec = SubscriptionSpec::new(SUBSCRIPTION, TOPIC);
    assert!(spec.retry_policy.is_none());
    Subscriber::new(client, &SubscriberConfig::new(spec))
        .await
        .unwrap();

    let stored = emulator.subscription(SUBSCRIPTION).await.unwrap();
    let policy = stored.retry_policy.expect("retry policy must be set");
    assert_eq!(policy.minimum_backoff, MINIMUM_BACKOFF);
    assert_eq!(policy.maximum_backoff, MAXIMUM_BACKOFF);
}

#[tokio::test]
async fn messages_are_handled_sequentially_in_delivery_order() {
    let emulator = emulator_with_topic().await;
    let client: Arc<dyn PubSubClient> = emulator.clone();

    let subscriber = Arc::new(
        Subscriber::new(
            client.clone(),
            &SubscriberConfig::new(SubscriptionSpec::new(SUBSCRIPTION, TOPIC)),
        )
        .await
        .unwrap(),
    );

    let messages: Vec<Message> = (0..5).map(|i| Message::new(vec![i as u8])).collect();
    Publisher::new(client)
        .publish(&Topic::new(TOPIC), messages)
        .await
        .unwrap();

    let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
    let in_flight = Arc::new(AtomicBool::new(false));
    let cancel = CancellationToken::new();
    let (err_tx, err_rx) = mpsc::channel(1);

    let handle = tokio::spawn({
        let subscriber = Arc::clone(&subscriber);
        let seen = Arc::clone(&seen);
        let in_flight = Arc::clone(&in_flight);
        let cancel = cancel.clone();
        let handler_cancel = cancel.clone();
        async move {
            subscriber
                .consume(
                    cancel,
                    move |payload: Vec<u8>| {
                        let seen = Arc::clone(&seen);
                        let in_flight = Arc::clone(&in_flight);
                        let cancel = handler_cancel.clone();
                        async move {
                            assert!(
                                !in_flight.swap(true, Ordering::SeqCst),
                                "handler invocations overlapped"
                            );
                            tokio::time::sleep(Duration::from_millis(5)).await;
                            let done = {
                                let mut seen = seen.lock().unwrap();
                                seen.push(payload[0]);
                                seen.len() == 5
                            };
                            in_flight.store(false, Ordering::SeqCst);
                            if done {
                                cancel.cancel();
                            }
                            Ok(())
                        }
                    },
                    err_tx,
                )
                .await;
        }
    });

    let errors = drain_errors(err_rx).await;
    handle.await.unwrap();

    assert!(errors.is_empty());
    assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    assert_eq!(subscriber.messages_received_count(), 5);
    assert_eq!(subscriber.messages_processed_count(), 5);
}

#[tokio::test]
async fn handler_error_nacks_and_stops_after_exactly_one_reported_error() {
    let emulator = emulator_with_topic().await;
    let client: Arc<dyn PubSubClient> = emulator.clone();

    let subscriber = Arc::new(
        Subscriber::new(
            client.clone(),
            &SubscriberConfig::new(SubscriptionSpec::new(SUBSCRIPTION, TOPIC)),
        )
        .await
        .unwrap(),
    );

    let messages: Vec<Message> = (0..3).map(|i| Message::new(vec![i as u8])).collect();
    Publisher::new(client)
        .publish(&Topic::new(TOPIC), messages)
        .await
        .unwrap();

    let invocations = Arc::new(AtomicUsize::new(0));
    let (err_tx, err_rx) = mpsc::channel(1);

    let handle = tokio::spawn({
        let subscriber = Arc::clone(&subscriber);
        let invocations = Arc::clone(&invocations);
        async move {
            subscriber
                .consume(
                    CancellationToken::new(),
                    move |payload: Vec<u8>| {
                        let invocations = Arc::clone(&invocations);
                        async move {
                            invocations.fetch_add(1, Ordering::SeqCst);
                            if payload[0] == 1 {
                                anyhow::bail!("cannot process message 1");
                            }
                            Ok(())
                        }
                    },
                    err_tx,
                )
                .await;
        }
    });

    let errors = drain_errors(err_rx).await;
    handle.await.unwrap();

    assert_eq!(errors.len(), 1);
    assert!(matches!(errors[0], Error::Handler(_)));
    // The loop terminated on the second message; the third was never handled.
    assert_eq!(invocations.load(Ordering::SeqCst), 2);
    assert_eq!(subscriber.messages_processed_count(), 1);
}

#[tokio::test]
async fn handler_panic_is_contained_and_reported_once() {
    let emulator = emulator_with_topic().await;
    let client: Arc<dyn PubSubClient> = emulator.clone();

    let subscriber = Arc::new(
        Subscriber::new(
            client.clone(),
            &SubscriberConfig::new(SubscriptionSpec::new(SUBSCRIPTION, TOPIC)),
        )
        .await
        .unwrap(),
    );

    Publisher::new(client)
        .publish(&Topic::new(TOPIC), vec![Message::new(b"poison".to_vec())])
        .await
        .unwrap();

    let (err_tx, err_rx) = mpsc::channel(1);
    let handle = tokio::spawn({
        let subscriber = Arc::clone(&subscriber);
        async move {
            subscriber
                .consume(
                    CancellationToken::new(),
                    |_payload: Vec<u8>| async move {
                        if true {
                            panic!("handler exploded");
                        }
                        Ok(())
                    },
                    err_tx,
                )
                .await;
        }
    });

    let errors = drain_errors(err_rx).await;
    handle.await.unwrap();

    assert_eq!(errors.len(), 1);
    let rendered = errors[0].to_string();
    assert!(rendered.contains("panic in subscription handler"), "{rendered}");
    assert!(rendered.contains("handler exploded"), "{rendered}");
    assert_eq!(subscriber.messages_processed_count(), 0);
}

#[tokio::test]
async fn cancellation_is_silent() {
    let emulator = emulator_with_topic().await;
    let client: Arc<dyn PubSubClient> = emulator.clone();

    let subscriber = Arc::new(
        Subscriber::with_defaults(client, SUBSCRIPTION, TOPIC)
            .await
            .unwrap(),
    );

    let cancel = CancellationToken::new();
    let (err_tx, err_rx) = mpsc::channel(1);
    let handle = tokio::spawn({
        let subscriber = Arc::clone(&subscriber);
        let cancel = cancel.clone();
        async move {
            subscriber
                .consume(cancel, |_payload: Vec<u8>| async move { Ok(()) }, err_tx)
                .await;
        }
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    cancel.cancel();

    let errors = drain_errors(err_rx).await;
    handle.await.unwrap();
    assert!(errors.is_empty());
}

#[tokio::test]
async fn receive_transport_failure_is_reported_once() {
    let emulator = emulator_with_topic().await;
    let client: Arc<dyn PubSubClient> = emulator.clone();

    let subscriber = Arc::new(
        Subscriber::with_defaults(client, SUBSCRIPTION, TOPIC)
            .await
            .unwrap(),
    );
    emulator
        .fail_next_receive(ClientError::other("stream broken"))
        .await;

    let (err_tx, err_rx) = mpsc::channel(1);
    let handle = tokio::spawn({
        let subscriber = Arc::clone(&subscriber);
        async move {
            subscriber
                .consume(
                    CancellationToken::new(),
                    |_payload: Vec<u8>| async move { Ok(()) },
                    err_tx,
                )
                .await;
        }
    });

    let errors = drain_errors(err_rx).await;
    handle.await.unwrap();

    assert_eq!(errors.len(), 1);
    assert!(matches!(errors[0], Error::Transport(_)));
}

/// Client whose stream hands over two messages and then dies, regardless of
/// acknowledgment progress.
struct BrokenStreamClient;

#[async_trait::async_trait]
impl PubSubClient for BrokenStreamClient {
    async fn get_topic(&self, name: &str) -> Result<Topic, ClientError> {
        Ok(Topic::new(name))
    }

    async fn create_topic(&self, topic: &Topic) -> Result<Topic, ClientError> {
        Ok(topic.clone())
    }

    async fn create_subscription(
        &self,
        spec: &SubscriptionSpec,
    ) -> Result<SubscriptionSpec, ClientError> {
        Ok(spec.clone())
    }

    async fn update_subscription(
        &self,
        spec: &SubscriptionSpec,
    ) -> Result<SubscriptionSpec, ClientError> {
        Ok(spec.clone())
    }

    async fn publish(
        &self,
        _topic: &Topic,
        _messages: Vec<gcp_pubsub::Message>,
    ) -> Result<Vec<String>, ClientError> {
        Ok(Vec::new())
    }

    async fn receive(
        &self,
        _cancel: CancellationToken,
        _subscription: &str,
        _settings: gcp_pubsub::ReceiveSettings,
        callback: gcp_pubsub::MessageCallback,
    ) -> Result<(), ClientError> {
        for id in ["m1", "m2"] {
            let (msg, _reply_rx) = gcp_pubsub::ReceivedMessage::new(id, "", b"x".to_vec());
            callback(msg).await;
        }
        Err(ClientError::other("stream broken"))
    }
}

#[tokio::test]
async fn transport_error_with_a_full_bridge_does_not_wedge_shutdown() {
    // The second message fills the bridge slot while the handler is still
    // busy with the first; the stream then errors and the loop breaks
    // without ever dequeuing the slot. Consume must still return.
    let client: Arc<dyn PubSubClient> = Arc::new(BrokenStreamClient);
    let subscriber = Arc::new(
        Subscriber::with_defaults(client, SUBSCRIPTION, TOPIC)
            .await
            .unwrap(),
    );

    let (err_tx, err_rx) = mpsc::channel(1);
    let handle = tokio::spawn({
        let subscriber = Arc::clone(&subscriber);
        async move {
            subscriber
                .consume(
                    CancellationToken::new(),
                    |_payload: Vec<u8>| async move {
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        anyhow::bail!("cannot process message")
                    },
                    err_tx,
                )
                .await;
        }
    });

    let errors = drain_errors(err_rx).await;
    timeout(Duration::from_secs(3), handle)
        .await
        .expect("consume did not return after the handler error")
        .unwrap();

    assert_eq!(errors.len(), 1);
    assert!(matches!(errors[0], Error::Handler(_)));
    assert_eq!(subscriber.messages_received_count(), 1);
}

#[tokio::test]
async fn second_consume_call_blocks_until_the_first_returns() {
    let emulator = emulator_with_topic().await;
    let client: Arc<dyn PubSubClient> = emulator.clone();

    let subscriber = Arc::new(
        Subscriber::with_defaults(client, SUBSCRIPTION, TOPIC)
            .await
            .unwrap(),
    );

    let cancel_a = CancellationToken::new();
    let (err_tx_a, err_rx_a) = mpsc::channel(1);
    let handle_a = tokio::spawn({
        let subscriber = Arc::clone(&subscriber);
        let cancel = cancel_a.clone();
        async move {
            subscriber
                .consume(cancel, |_payload: Vec<u8>| async move { Ok(()) }, err_tx_a)
                .await;
        }
    });

    tokio::time::sleep(Duration::from_millis(50)).await;

    // B's token is already cancelled, so it would return immediately if it
    // could acquire the lock.
    let cancel_b = CancellationToken::new();
    cancel_b.cancel();
    let (err_tx_b, err_rx_b) = mpsc::channel(1);
    let handle_b = tokio::spawn({
        let subscriber = Arc::clone(&subscriber);
        async move {
            subscriber
                .consume(cancel_b, |_payload: Vec<u8>| async move { Ok(()) }, err_tx_b)
                .await;
        }
    });

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!handle_b.is_finished(), "second consume ran while the first held the lock");

    cancel_a.cancel();
    let errors_a = drain_errors(err_rx_a).await;
    let errors_b = drain_errors(err_rx_b).await;
    handle_a.await.unwrap();
    handle_b.await.unwrap();
    assert!(errors_a.is_empty());
    assert!(errors_b.is_empty());
}

#[derive(Debug, Deserialize)]
struct Account {
    #[serde(rename = "AccountID")]
    account_id: String,
    #[serde(rename = "AccountName")]
    account_name: String,
}

#[tokio::test]
async fn json_payloads_are_consumed_end_to_end() {
    let emulator = Arc::new(Emulator::new());
    let client: Arc<dyn PubSubClient> = emulator.clone();
    let topic = Topic {
        enable_ordering: true,
        ..Topic::new(TOPIC)
    };
    emulator.create_topic(&topic).await.unwrap();

    let subscriber = Arc::new(
        Subscriber::with_defaults(client.clone(), SUBSCRIPTION, TOPIC)
            .await
            .unwrap(),
    );

    let payload = br#"{"AccountID":"test-account-id","AccountName":"test-account-name"}"#.to_vec();
    let messages: Vec<Message> = (0..3)
        .map(|_| Message::new(payload.clone()).with_ordering_key("test-account-id"))
        .collect();
    Publisher::new(client).publish(&topic, messages).await.unwrap();

    let decoded = Arc::new(AtomicUsize::new(0));
    let cancel = CancellationToken::new();
    let (err_tx, err_rx) = mpsc::channel(1);
    let handle = tokio::spawn({
        let subscriber = Arc::clone(&subscriber);
        let decoded = Arc::clone(&decoded);
        let cancel_clone = cancel.clone();
        let handler_cancel = cancel.clone();
        async move {
            subscriber
                .consume(
                    cancel_clone,
                    move |payload: Vec<u8>| {
                        let decoded = Arc::clone(&decoded);
                        let cancel = handler_cancel.clone();
                        async move {
                            let account: Account = serde_json::from_slice(&payload)?;
                            assert_eq!(account.account_id, "test-account-id");
                            assert_eq!(account.account_name, "test-account-name");
                            if decoded.fetch_add(1, Ordering::SeqCst) + 1 == 3 {
                                cancel.cancel();
                            }
                            Ok(())
                        }
                    },
                    err_tx,
                )
                .await;
        }
    });

    let errors = drain_errors(err_rx).await;
    handle.await.unwrap();

    assert!(errors.is_empty());
    assert_eq!(decoded.load(Ordering::SeqCst), 3);
    assert_eq!(subscriber.messages_processed_count(), 3);
}
