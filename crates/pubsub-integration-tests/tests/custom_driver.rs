//! A third-party provider plugged in through a private URL multiplexer.
//!
//! The `inbox` provider delivers at most once: it has no acknowledgement
//! round trip, so it installs an ack override instead.

mod common;

use async_trait::async_trait;
use bytes::Bytes;
use common::{body_text, init_tracing, receive_within};
use pubsub_runtime::{
    AckId, AckOverride, DriverError, DriverMessage, ErrorCode, Message, Subscription,
    SubscriptionDriver, SubscriptionUrlOpener, Topic, TopicDriver, TopicUrlOpener, UrlMux,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use url::Url;

#[derive(Default)]
struct Inbox {
    messages: Mutex<VecDeque<DriverMessage>>,
    acks: AtomicUsize,
    ack_batches: AtomicUsize,
}

struct InboxTopic(Arc<Inbox>);

#[async_trait]
impl TopicDriver for InboxTopic {
    async fn send_batch(
        &self,
        _cancel: &CancellationToken,
        messages: Vec<DriverMessage>,
    ) -> Result<(), DriverError> {
        self.0.messages.lock().unwrap().extend(messages);
        Ok(())
    }

    fn is_retryable(&self, _err: &DriverError) -> bool {
        false
    }

    fn error_code(&self, _err: &DriverError) -> ErrorCode {
        ErrorCode::Unknown
    }

    fn provider_name(&self) -> &'static str {
        "inbox"
    }
}

struct InboxSubscription(Arc<Inbox>);

#[async_trait]
impl SubscriptionDriver for InboxSubscription {
    async fn receive_batch(
        &self,
        cancel: &CancellationToken,
        max_messages: usize,
    ) -> Result<Vec<DriverMessage>, DriverError> {
        loop {
            let batch: Vec<DriverMessage> = {
                let mut messages = self.0.messages.lock().unwrap();
                let count = max_messages.min(messages.len());
                messages.drain(..count).collect()
            };
            if !batch.is_empty() {
                return Ok(batch);
            }
            tokio::select! {
                _ = cancel.cancelled() => return Ok(Vec::new()),
                _ = tokio::time::sleep(Duration::from_millis(10)) => {}
            }
        }
    }

    async fn send_acks(
        &self,
        _cancel: &CancellationToken,
        _ack_ids: Vec<AckId>,
    ) -> Result<(), DriverError> {
        self.0.ack_batches.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn ack_override(&self) -> Option<AckOverride> {
        let inbox = Arc::clone(&self.0);
        Some(Arc::new(move || {
            inbox.acks.fetch_add(1, Ordering::SeqCst);
        }))
    }

    fn is_retryable(&self, _err: &DriverError) -> bool {
        false
    }

    fn error_code(&self, _err: &DriverError) -> ErrorCode {
        ErrorCode::Unknown
    }

    fn provider_name(&self) -> &'static str {
        "inbox"
    }
}

/// Opens every `inbox://` URL onto one shared inbox.
#[derive(Default)]
struct InboxOpener {
    inbox: Arc<Inbox>,
}

#[async_trait]
impl TopicUrlOpener for InboxOpener {
    async fn open_topic_url(&self, _url: &Url) -> Result<Topic, pubsub_runtime::PubSubError> {
        Ok(Topic::new(Arc::new(InboxTopic(Arc::clone(&self.inbox)))))
    }
}

#[async_trait]
impl SubscriptionUrlOpener for InboxOpener {
    async fn open_subscription_url(
        &self,
        _url: &Url,
    ) -> Result<Subscription, pubsub_runtime::PubSubError> {
        Ok(Subscription::new(Arc::new(InboxSubscription(Arc::clone(
            &self.inbox,
        )))))
    }
}

fn inbox_mux() -> (UrlMux, Arc<InboxOpener>) {
    let mux = UrlMux::new();
    let opener = Arc::new(InboxOpener::default());
    mux.register_topic("inbox", opener.clone());
    mux.register_subscription("inbox", opener.clone());
    (mux, opener)
}

/// Verify that a custom scheme round-trips messages and that acknowledging
/// goes through the override instead of the ack batcher.
#[tokio::test]
async fn test_custom_provider_uses_ack_override() {
    init_tracing();
    let (mux, opener) = inbox_mux();
    let cancel = CancellationToken::new();

    let topic = mux.open_topic("inbox://alerts").await.unwrap();
    let subscription = mux.open_subscription("inbox://alerts").await.unwrap();

    topic
        .send(&cancel, Message::new(Bytes::from_static(b"disk full")))
        .await
        .unwrap();
    let message = receive_within(&subscription, Duration::from_secs(2)).await;
    assert_eq!(body_text(&message), "disk full");

    message.ack();
    assert!(message.is_acked());
    subscription.shutdown(&cancel).await.unwrap();

    assert_eq!(opener.inbox.acks.load(Ordering::SeqCst), 1);
    assert_eq!(opener.inbox.ack_batches.load(Ordering::SeqCst), 0);
}

/// Verify that a private multiplexer knows only what was registered on it.
#[tokio::test]
async fn test_private_mux_is_isolated_from_default() {
    let (mux, _) = inbox_mux();

    assert_eq!(mux.topic_schemes(), vec!["inbox".to_string()]);
    assert!(mux.open_topic("mem://anything").await.is_err());
    assert!(pubsub_runtime::open_topic("inbox://alerts").await.is_err());
}
