//! Provider driver interfaces.
//!
//! A driver is the provider-specific half of a [`Topic`] or [`Subscription`].
//! The portable types own batching, retries, flow control and lifecycle; a
//! driver only performs the provider round trips and classifies provider
//! errors.
//!
//! [`Topic`]: crate::Topic
//! [`Subscription`]: crate::Subscription

use crate::error::{DriverError, ErrorCode};
use crate::message::{AckId, DriverMessage};
use async_trait::async_trait;
use std::any::Any;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Function used instead of batched acknowledgement by at-most-once providers.
pub type AckOverride = Arc<dyn Fn() + Send + Sync>;

/// Interface implemented by provider topics.
#[async_trait]
pub trait TopicDriver: Send + Sync + 'static {
    /// Publish a batch of messages.
    ///
    /// Called with at most one batch in flight per topic. Implementations
    /// should abort promptly once `cancel` fires.
    async fn send_batch(
        &self,
        cancel: &CancellationToken,
        messages: Vec<DriverMessage>,
    ) -> Result<(), DriverError>;

    /// Whether `send_batch` should be retried after this error.
    fn is_retryable(&self, err: &DriverError) -> bool;

    /// Map a provider error onto the canonical taxonomy.
    fn error_code(&self, err: &DriverError) -> ErrorCode;

    /// Short provider name used in errors and logs.
    fn provider_name(&self) -> &'static str;

    /// Provider-native handle backing this topic.
    fn as_any(&self) -> Option<&(dyn Any + Send + Sync)> {
        None
    }

    /// Expose a provider-native value hidden inside `err`.
    fn error_as<'a>(
        &self,
        _err: &'a (dyn std::error::Error + Send + Sync + 'static),
    ) -> Option<&'a (dyn Any + Send + Sync)> {
        None
    }
}

/// Interface implemented by provider subscriptions.
#[async_trait]
pub trait SubscriptionDriver: Send + Sync + 'static {
    /// Fetch up to `max_messages` messages.
    ///
    /// At most one call is in flight per subscription. Implementations should
    /// wait briefly for messages instead of returning an empty batch
    /// immediately, and abort promptly once `cancel` fires.
    async fn receive_batch(
        &self,
        cancel: &CancellationToken,
        max_messages: usize,
    ) -> Result<Vec<DriverMessage>, DriverError>;

    /// Acknowledge a batch of delivered messages.
    async fn send_acks(
        &self,
        cancel: &CancellationToken,
        ack_ids: Vec<AckId>,
    ) -> Result<(), DriverError>;

    /// Replacement for batched acknowledgement, for providers without an
    /// explicit acknowledgement step.
    fn ack_override(&self) -> Option<AckOverride> {
        None
    }

    /// Whether a receive or ack call should be retried after this error.
    fn is_retryable(&self, err: &DriverError) -> bool;

    /// Map a provider error onto the canonical taxonomy.
    fn error_code(&self, err: &DriverError) -> ErrorCode;

    /// Short provider name used in errors and logs.
    fn provider_name(&self) -> &'static str;

    /// Provider-native handle backing this subscription.
    fn as_any(&self) -> Option<&(dyn Any + Send + Sync)> {
        None
    }

    /// Expose a provider-native value hidden inside `err`.
    fn error_as<'a>(
        &self,
        _err: &'a (dyn std::error::Error + Send + Sync + 'static),
    ) -> Option<&'a (dyn Any + Send + Sync)> {
        None
    }
}
