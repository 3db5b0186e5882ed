//! Tests for the publisher handle.

use super::*;
use crate::error::{DriverError, ErrorCode};
use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
#[error("broker unavailable (status {status})")]
struct BrokerError {
    status: u16,
}

/// Driver that fails its first `failures` sends, then records every batch.
#[derive(Default)]
struct TestTopicDriver {
    failures: u32,
    retryable: bool,
    calls: AtomicU32,
    batches: std::sync::Mutex<Vec<Vec<DriverMessage>>>,
}

impl TestTopicDriver {
    fn succeeding() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn failing(failures: u32, retryable: bool) -> Arc<Self> {
        Arc::new(Self {
            failures,
            retryable,
            ..Self::default()
        })
    }

    fn sent_bodies(&self) -> Vec<String> {
        self.batches
            .lock()
            .unwrap()
            .iter()
            .flatten()
            .map(|m| String::from_utf8_lossy(&m.body).into_owned())
            .collect()
    }
}

#[async_trait]
impl TopicDriver for TestTopicDriver {
    async fn send_batch(
        &self,
        _cancel: &CancellationToken,
        messages: Vec<DriverMessage>,
    ) -> Result<(), DriverError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= self.failures {
            return Err(Box::new(BrokerError { status: 503 }));
        }
        self.batches.lock().unwrap().push(messages);
        Ok(())
    }

    fn is_retryable(&self, _err: &DriverError) -> bool {
        self.retryable
    }

    fn error_code(&self, _err: &DriverError) -> ErrorCode {
        ErrorCode::ResourceExhausted
    }

    fn provider_name(&self) -> &'static str {
        "test"
    }

    fn as_any(&self) -> Option<&(dyn Any + Send + Sync)> {
        Some(&self.calls)
    }
}

/// Driver whose sends block until the topic's token fires.
struct HangingTopicDriver;

#[async_trait]
impl TopicDriver for HangingTopicDriver {
    async fn send_batch(
        &self,
        cancel: &CancellationToken,
        _messages: Vec<DriverMessage>,
    ) -> Result<(), DriverError> {
        cancel.cancelled().await;
        Err(Box::new(PubSubError::Canceled))
    }

    fn is_retryable(&self, _err: &DriverError) -> bool {
        true
    }

    fn error_code(&self, _err: &DriverError) -> ErrorCode {
        ErrorCode::Unknown
    }

    fn provider_name(&self) -> &'static str {
        "hanging"
    }
}

/// Driver that signals when a send starts, then panics once released.
#[derive(Default)]
struct PanickingTopicDriver {
    started: tokio::sync::Notify,
    release: tokio::sync::Notify,
}

#[async_trait]
impl TopicDriver for PanickingTopicDriver {
    async fn send_batch(
        &self,
        _cancel: &CancellationToken,
        _messages: Vec<DriverMessage>,
    ) -> Result<(), DriverError> {
        self.started.notify_one();
        self.release.notified().await;
        panic!("driver crashed mid-send");
    }

    fn is_retryable(&self, _err: &DriverError) -> bool {
        false
    }

    fn error_code(&self, _err: &DriverError) -> ErrorCode {
        ErrorCode::Unknown
    }

    fn provider_name(&self) -> &'static str {
        "panicking"
    }
}

fn fast_options() -> TopicOptions {
    TopicOptions {
        retry: RetryPolicy::new(None, Duration::from_millis(1), Duration::from_millis(5), 2.0)
            .without_jitter(),
        ..TopicOptions::default()
    }
}

// ============================================================================
// Send Tests
// ============================================================================

mod send {
    use super::*;

    #[tokio::test]
    async fn test_send_delivers_to_driver() {
        let driver = TestTopicDriver::succeeding();
        let topic = Topic::new(driver.clone());

        topic
            .send(&CancellationToken::new(), Message::new("hello").with_metadata("k", "v"))
            .await
            .unwrap();

        assert_eq!(driver.sent_bodies(), vec!["hello"]);
        let batches = driver.batches.lock().unwrap();
        assert_eq!(batches[0][0].metadata.get("k").map(String::as_str), Some("v"));
        assert!(batches[0][0].ack_id.is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_sends_all_arrive() {
        let driver = TestTopicDriver::succeeding();
        let topic = Arc::new(Topic::new(driver.clone()));

        let mut tasks = Vec::new();
        for i in 0..20 {
            let topic = Arc::clone(&topic);
            tasks.push(tokio::spawn(async move {
                topic
                    .send(&CancellationToken::new(), Message::new(format!("m{}", i)))
                    .await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let mut bodies = driver.sent_bodies();
        bodies.sort();
        assert_eq!(bodies.len(), 20);
        assert!(driver.calls.load(Ordering::SeqCst) <= 20);
    }

    #[tokio::test]
    async fn test_invalid_metadata_is_rejected_before_driver() {
        let driver = TestTopicDriver::succeeding();
        let topic = Topic::new(driver.clone());

        let err = topic
            .send(&CancellationToken::new(), Message::new("x").with_metadata("", "v"))
            .await
            .unwrap_err();

        assert!(matches!(err, PubSubError::InvalidMetadata { .. }));
        assert_eq!(driver.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_send_with_cancelled_token_fails_fast() {
        let driver = TestTopicDriver::succeeding();
        let topic = Topic::new(driver.clone());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = topic.send(&cancel, Message::new("x")).await.unwrap_err();

        assert!(err.is_canceled());
        assert_eq!(driver.calls.load(Ordering::SeqCst), 0);
    }
}

// ============================================================================
// Retry and Error Tests
// ============================================================================

mod errors {
    use super::*;

    #[tokio::test]
    async fn test_retryable_failures_are_retried() {
        let driver = TestTopicDriver::failing(2, true);
        let topic = Topic::with_options(driver.clone(), fast_options());

        topic
            .send(&CancellationToken::new(), Message::new("eventually"))
            .await
            .unwrap();

        assert_eq!(driver.calls.load(Ordering::SeqCst), 3);
        assert_eq!(driver.sent_bodies(), vec!["eventually"]);
    }

    #[tokio::test]
    async fn test_permanent_failure_is_wrapped() {
        let driver = TestTopicDriver::failing(1, false);
        let topic = Topic::with_options(driver.clone(), fast_options());

        let err = topic
            .send(&CancellationToken::new(), Message::new("x"))
            .await
            .unwrap_err();

        assert_eq!(driver.calls.load(Ordering::SeqCst), 1);
        assert_eq!(err.code(), ErrorCode::ResourceExhausted);
        assert!(err.to_string().contains("test"));

        let native = topic.error_as::<BrokerError>(&err).expect("native error exposed");
        assert_eq!(native.status, 503);
        assert!(topic.error_as::<std::io::Error>(&err).is_none());
    }

    #[tokio::test]
    async fn test_failure_does_not_close_topic() {
        let driver = TestTopicDriver::failing(1, false);
        let topic = Topic::with_options(driver.clone(), fast_options());
        let cancel = CancellationToken::new();

        assert!(topic.send(&cancel, Message::new("first")).await.is_err());
        topic.send(&cancel, Message::new("second")).await.unwrap();

        assert_eq!(driver.sent_bodies(), vec!["second"]);
    }

    #[tokio::test]
    async fn test_as_native_exposes_driver_handle() {
        let topic = Topic::new(TestTopicDriver::succeeding());

        assert!(topic.as_native::<AtomicU32>().is_some());
        assert!(topic.as_native::<String>().is_none());
    }
}

// ============================================================================
// Shutdown Tests
// ============================================================================

mod shutdown {
    use super::*;

    #[tokio::test]
    async fn test_send_after_shutdown_reports_closed() {
        let topic = Topic::new(TestTopicDriver::succeeding());
        let cancel = CancellationToken::new();

        topic.shutdown(&cancel).await.unwrap();

        let err = topic.send(&cancel, Message::new("late")).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::FailedPrecondition);
        assert!(err.to_string().contains("Topic closed"));

        // Repeated shutdown observes the same state.
        topic.shutdown(&cancel).await.unwrap();
        let again = topic.send(&cancel, Message::new("later")).await.unwrap_err();
        assert_eq!(again.to_string(), err.to_string());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cancelled_shutdown_does_not_wait_for_hanging_send() {
        let topic = Arc::new(Topic::new(Arc::new(HangingTopicDriver)));

        let sender = {
            let topic = Arc::clone(&topic);
            tokio::spawn(async move {
                topic
                    .send(&CancellationToken::new(), Message::new("stuck"))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = tokio::time::timeout(Duration::from_secs(1), topic.shutdown(&cancel))
            .await
            .expect("shutdown should return promptly");
        assert!(matches!(result, Err(PubSubError::Canceled)));

        // The topic token fired, so the hanging provider call unwinds too.
        let sent = tokio::time::timeout(Duration::from_secs(1), sender)
            .await
            .expect("send should unblock after shutdown")
            .unwrap();
        assert!(sent.unwrap_err().is_canceled());
    }

    #[tokio::test]
    async fn test_shutdown_flushes_pending_sends() {
        let driver = TestTopicDriver::succeeding();
        let topic = Arc::new(Topic::new(driver.clone()));

        let sender = {
            let topic = Arc::clone(&topic);
            tokio::spawn(async move {
                topic
                    .send(&CancellationToken::new(), Message::new("pending"))
                    .await
            })
        };
        tokio::task::yield_now().await;
        topic.shutdown(&CancellationToken::new()).await.unwrap();

        // Either the send made it in before shutdown and was flushed, or it
        // observed the closed state; it never hangs or gets lost silently.
        match sender.await.unwrap() {
            Ok(()) => assert_eq!(driver.sent_bodies(), vec!["pending"]),
            Err(err) => assert_eq!(err.code(), ErrorCode::FailedPrecondition),
        }
    }

    #[tokio::test]
    async fn test_batch_failure_during_shutdown_keeps_its_cause() {
        // Arrange
        let driver = Arc::new(PanickingTopicDriver::default());
        let topic = Arc::new(Topic::new(driver.clone()));
        let sender = {
            let topic = Arc::clone(&topic);
            tokio::spawn(async move {
                topic
                    .send(&CancellationToken::new(), Message::new("doomed"))
                    .await
            })
        };
        driver.started.notified().await;

        // Act
        let cancel = CancellationToken::new();
        let (shutdown, _) = tokio::join!(topic.shutdown(&cancel), async {
            while !topic.batcher.is_shut_down() {
                tokio::task::yield_now().await;
            }
            driver.release.notify_one();
        });
        let err = sender.await.unwrap().unwrap_err();

        // Assert
        assert!(shutdown.is_ok());
        assert_eq!(err.code(), ErrorCode::Internal);
        assert!(err.to_string().contains("panicked"));
    }
}
