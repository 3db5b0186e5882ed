//! Publisher handle.
//!
//! [`Topic::send`] enqueues a message into a [`Batcher`] whose single handler
//! forwards each batch to the provider driver through [`retry::call`].
//! [`Topic::shutdown`] moves the topic into a permanent closed state and
//! drains outstanding batches.

use crate::batcher::{BatchResult, Batcher, BatcherOptions};
use crate::driver::TopicDriver;
use crate::error::{ErrorCode, PubSubError};
use crate::message::{validate_metadata, DriverMessage, Message};
use crate::retry::{self, RetryPolicy};
use std::any::Any;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Runtime options for a [`Topic`].
#[derive(Debug, Clone, Default)]
pub struct TopicOptions {
    /// Backoff applied around each provider send.
    pub retry: RetryPolicy,
    /// Batch limits. `max_handlers` is always forced to 1.
    pub batching: BatcherOptions,
}

/// Publishes messages to all subscribers of a channel.
///
/// Safe to share between tasks; wrap in an `Arc` to send concurrently.
pub struct Topic {
    driver: Arc<dyn TopicDriver>,
    batcher: Batcher<Message>,
    err: Mutex<Option<PubSubError>>,
    cancel: CancellationToken,
}

impl Topic {
    /// Create a topic over a provider driver with default options.
    ///
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime.
    pub fn new(driver: Arc<dyn TopicDriver>) -> Self {
        Self::with_options(driver, TopicOptions::default())
    }

    /// Create a topic over a provider driver.
    ///
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime.
    pub fn with_options(driver: Arc<dyn TopicDriver>, options: TopicOptions) -> Self {
        let cancel = CancellationToken::new();
        let batching = BatcherOptions {
            max_handlers: 1,
            ..options.batching
        };

        let handler = {
            let driver = Arc::clone(&driver);
            let cancel = cancel.clone();
            let policy = options.retry;
            move |messages: Vec<Message>| {
                let driver = Arc::clone(&driver);
                let cancel = cancel.clone();
                let policy = policy.clone();
                async move { send_batch(driver.as_ref(), &cancel, &policy, messages).await }
            }
        };

        Self {
            driver,
            batcher: Batcher::new(batching, handler),
            err: Mutex::new(None),
            cancel,
        }
    }

    /// Publish a message.
    ///
    /// Returns once the batch containing the message has been sent or has
    /// failed. Fails immediately when the topic is closed, the token has
    /// already fired, or the metadata is not legal text.
    #[instrument(skip(self, cancel, message), fields(provider = self.driver.provider_name()))]
    pub async fn send(&self, cancel: &CancellationToken, message: Message) -> Result<(), PubSubError> {
        if cancel.is_cancelled() {
            return Err(PubSubError::Canceled);
        }
        if let Some(err) = self.current_error() {
            return Err(err);
        }
        validate_metadata(&message.metadata)?;

        match self.batcher.add(cancel, message).await {
            // Lost the race with shutdown: report the topic's own closed error.
            Err(err)
                if err.code() == ErrorCode::FailedPrecondition && self.batcher.is_shut_down() =>
            {
                Err(self.current_error().unwrap_or(err))
            }
            other => other,
        }
    }

    /// Flush pending sends and close the topic.
    ///
    /// The topic is marked closed before draining, so concurrent sends fail
    /// at once. If `cancel` fires before the drain completes, in-flight
    /// provider calls are cancelled and [`PubSubError::Canceled`] is returned.
    #[instrument(skip(self, cancel), fields(provider = self.driver.provider_name()))]
    pub async fn shutdown(&self, cancel: &CancellationToken) -> Result<(), PubSubError> {
        self.set_error(PubSubError::closed("Topic"));

        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = self.batcher.shutdown() => {}
        }
        self.cancel.cancel();

        if cancel.is_cancelled() {
            warn!("Topic shutdown cancelled before pending sends drained");
            return Err(PubSubError::Canceled);
        }
        info!("Topic shut down");
        Ok(())
    }

    /// Access the provider-native handle behind this topic.
    pub fn as_native<T: Any>(&self) -> Option<&T> {
        self.driver.as_any()?.downcast_ref::<T>()
    }

    /// Access the provider-native error wrapped inside `err`.
    pub fn error_as<'a, E>(&self, err: &'a PubSubError) -> Option<&'a E>
    where
        E: std::error::Error + 'static,
    {
        let cause = err.provider_cause()?;
        cause
            .downcast_ref::<E>()
            .or_else(|| self.driver.error_as(cause)?.downcast_ref::<E>())
    }

    fn current_error(&self) -> Option<PubSubError> {
        self.err.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn set_error(&self, err: PubSubError) {
        *self.err.lock().unwrap_or_else(PoisonError::into_inner) = Some(err);
    }
}

impl fmt::Debug for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Topic")
            .field("provider", &self.driver.provider_name())
            .finish_non_exhaustive()
    }
}

impl Drop for Topic {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Batch handler: strip bookkeeping, send with retries, wrap failures.
async fn send_batch(
    driver: &dyn TopicDriver,
    cancel: &CancellationToken,
    policy: &RetryPolicy,
    messages: Vec<Message>,
) -> BatchResult {
    let batch: Vec<DriverMessage> = messages
        .into_iter()
        .map(Message::into_driver_message)
        .collect();
    debug!(
        provider = driver.provider_name(),
        batch_size = batch.len(),
        "Sending message batch"
    );

    retry::call(
        cancel,
        policy,
        |err| driver.is_retryable(err),
        || driver.send_batch(cancel, batch.clone()),
    )
    .await
    .map_err(|err| {
        let code = driver.error_code(&err);
        PubSubError::wrap(code, driver.provider_name(), err)
    })
}

#[cfg(test)]
#[path = "topic_tests.rs"]
mod tests;
