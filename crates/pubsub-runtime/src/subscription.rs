//! Subscriber handle.
//!
//! A [`Subscription`] serves [`Subscription::receive`] from a local FIFO
//! queue. When the queue runs dry, exactly one caller becomes the fetch owner
//! and asks the driver for a batch sized by [`FlowControl`]; every other
//! caller waits on that round's completion signal and then re-checks the
//! queue. Acknowledgements are coalesced through a second [`Batcher`].

use crate::batcher::{BatchResult, Batcher, BatcherOptions};
use crate::driver::{AckOverride, SubscriptionDriver};
use crate::error::PubSubError;
use crate::flow_control::{FlowControl, FlowControlConfig};
use crate::message::{AckFn, AckId, DriverMessage, Message};
use crate::retry::{self, RetryPolicy};
use std::any::Any;
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Runtime options for a [`Subscription`].
#[derive(Debug, Clone, Default)]
pub struct SubscriptionOptions {
    /// Backoff applied around provider receive and ack calls.
    pub retry: RetryPolicy,
    /// Ack batch limits. `max_handlers` is always forced to 1.
    pub ack_batching: BatcherOptions,
    /// Adaptive fetch sizing.
    pub flow_control: FlowControlConfig,
}

// ============================================================================
// Shared State
// ============================================================================

struct SubscriptionState {
    queue: VecDeque<Message>,
    err: Option<PubSubError>,
    /// Completion signal of the fetch round in flight, if any.
    fetch: Option<watch::Receiver<bool>>,
    flow: FlowControl,
}

type SharedState = Arc<Mutex<SubscriptionState>>;

fn lock(state: &Mutex<SubscriptionState>) -> MutexGuard<'_, SubscriptionState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Fetch ownership for one round. Dropping it releases ownership and wakes
/// waiters, including when the owner's future is dropped mid-fetch.
struct FetchRound {
    state: SharedState,
    done: watch::Sender<bool>,
}

impl Drop for FetchRound {
    fn drop(&mut self) {
        lock(&self.state).fetch = None;
        self.done.send_replace(true);
    }
}

enum Step {
    Wait(watch::Receiver<bool>),
    Fetch(FetchRound, usize),
}

// ============================================================================
// Subscription
// ============================================================================

/// Receives messages published to a channel.
///
/// Safe to share between tasks; wrap in an `Arc` to receive concurrently.
pub struct Subscription {
    driver: Arc<dyn SubscriptionDriver>,
    ack_batcher: Batcher<AckId>,
    ack_override: Option<AckOverride>,
    retry: RetryPolicy,
    state: SharedState,
    cancel: CancellationToken,
}

impl Subscription {
    /// Create a subscription over a provider driver with default options.
    ///
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime.
    pub fn new(driver: Arc<dyn SubscriptionDriver>) -> Self {
        Self::with_options(driver, SubscriptionOptions::default())
    }

    /// Create a subscription over a provider driver.
    ///
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime.
    pub fn with_options(driver: Arc<dyn SubscriptionDriver>, options: SubscriptionOptions) -> Self {
        let cancel = CancellationToken::new();
        let state = Arc::new(Mutex::new(SubscriptionState {
            queue: VecDeque::new(),
            err: None,
            fetch: None,
            flow: FlowControl::new(options.flow_control),
        }));
        let batching = BatcherOptions {
            max_handlers: 1,
            ..options.ack_batching
        };

        let handler = {
            let driver = Arc::clone(&driver);
            let cancel = cancel.clone();
            let policy = options.retry.clone();
            let state = Arc::downgrade(&state);
            move |ack_ids: Vec<AckId>| {
                let driver = Arc::clone(&driver);
                let cancel = cancel.clone();
                let policy = policy.clone();
                let state = state.clone();
                async move { send_acks(driver.as_ref(), &cancel, &policy, &state, ack_ids).await }
            }
        };

        Self {
            ack_override: driver.ack_override(),
            driver,
            ack_batcher: Batcher::new(batching, handler),
            retry: options.retry,
            state,
            cancel,
        }
    }

    /// Receive the next message.
    ///
    /// Returns the subscription's permanent error once one is recorded, for
    /// example after [`Subscription::shutdown`] or a failed acknowledgement.
    /// A failed fetch is returned to the caller that performed it without
    /// poisoning the subscription.
    #[instrument(skip(self, cancel), fields(provider = self.driver.provider_name()))]
    pub async fn receive(&self, cancel: &CancellationToken) -> Result<Message, PubSubError> {
        loop {
            let step = {
                let mut state = lock(&self.state);
                if let Some(err) = &state.err {
                    return Err(err.clone());
                }
                if let Some(mut message) = state.queue.pop_front() {
                    message.mark_processing_started();
                    return Ok(message);
                }
                match &state.fetch {
                    Some(fetch) => Step::Wait(fetch.clone()),
                    None if cancel.is_cancelled() => return Err(PubSubError::Canceled),
                    None => {
                        let (done, fetch) = watch::channel(false);
                        state.fetch = Some(fetch);
                        let round = FetchRound {
                            state: Arc::clone(&self.state),
                            done,
                        };
                        Step::Fetch(round, state.flow.desired_fetch_size())
                    }
                }
            };

            match step {
                Step::Wait(mut fetch) => {
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(PubSubError::Canceled),
                        _ = fetch.changed() => {}
                    }
                }
                Step::Fetch(round, max_messages) => {
                    let batch = self.fetch_batch(cancel, max_messages).await?;
                    let messages: Vec<Message> = batch
                        .into_iter()
                        .map(|message| {
                            let ack = self.ack_fn(message.ack_id.clone());
                            Message::delivered(message, ack)
                        })
                        .collect();
                    lock(&self.state).queue.extend(messages);
                    drop(round);
                }
            }
        }
    }

    /// Stop the subscription and flush pending acknowledgements.
    ///
    /// The subscription is marked closed before draining, so concurrent
    /// receives fail at once. If `cancel` fires before the drain completes,
    /// in-flight ack calls are cancelled and [`PubSubError::Canceled`] is
    /// returned.
    #[instrument(skip(self, cancel), fields(provider = self.driver.provider_name()))]
    pub async fn shutdown(&self, cancel: &CancellationToken) -> Result<(), PubSubError> {
        lock(&self.state).err = Some(PubSubError::closed("Subscription"));

        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = self.ack_batcher.shutdown() => {}
        }
        self.cancel.cancel();

        if cancel.is_cancelled() {
            warn!("Subscription shutdown cancelled before pending acks drained");
            return Err(PubSubError::Canceled);
        }
        info!("Subscription shut down");
        Ok(())
    }

    /// Access the provider-native handle behind this subscription.
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

    async fn fetch_batch(
        &self,
        cancel: &CancellationToken,
        max_messages: usize,
    ) -> Result<Vec<DriverMessage>, PubSubError> {
        let driver = self.driver.as_ref();
        debug!(
            provider = driver.provider_name(),
            max_messages, "Fetching message batch"
        );

        retry::call(
            cancel,
            &self.retry,
            |err| driver.is_retryable(err),
            || driver.receive_batch(cancel, max_messages),
        )
        .await
        .map_err(|err| {
            let code = driver.error_code(&err);
            PubSubError::wrap(code, driver.provider_name(), err)
        })
    }

    /// Build the acknowledgement closure for one delivered message.
    fn ack_fn(&self, ack_id: Option<AckId>) -> AckFn {
        let state = Arc::downgrade(&self.state);
        let ack_override = self.ack_override.clone();
        let ack_batcher = self.ack_batcher.clone();
        Box::new(move |elapsed| {
            if let Some(state) = state.upgrade() {
                lock(&state).flow.record(elapsed);
            }
            match (ack_override, ack_id) {
                (Some(ack_override), _) => ack_override(),
                // Failures surface on the next receive.
                (None, Some(ack_id)) => drop(ack_batcher.add_no_wait(ack_id)),
                (None, None) => warn!("Acknowledged a message without an ack ID"),
            }
        })
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("provider", &self.driver.provider_name())
            .finish_non_exhaustive()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Ack batch handler: send with retries; a failure becomes the
/// subscription's permanent error.
async fn send_acks(
    driver: &dyn SubscriptionDriver,
    cancel: &CancellationToken,
    policy: &RetryPolicy,
    state: &Weak<Mutex<SubscriptionState>>,
    ack_ids: Vec<AckId>,
) -> BatchResult {
    debug!(
        provider = driver.provider_name(),
        batch_size = ack_ids.len(),
        "Sending acknowledgement batch"
    );

    let err = match retry::call(
        cancel,
        policy,
        |err| driver.is_retryable(err),
        || driver.send_acks(cancel, ack_ids.clone()),
    )
    .await
    {
        Ok(()) => return Ok(()),
        Err(err) => {
            let code = driver.error_code(&err);
            PubSubError::wrap(code, driver.provider_name(), err)
        }
    };

    if let Some(state) = state.upgrade() {
        let mut state = lock(&state);
        if state.err.is_none() {
            error!(
                provider = driver.provider_name(),
                error = %err,
                "Acknowledgement failed, subscription is no longer usable"
            );
            state.err = Some(err.clone());
        }
    }
    Err(err)
}

#[cfg(test)]
#[path = "subscription_tests.rs"]
mod tests;
