//! In-memory publish/subscribe provider for testing and development.
//!
//! A [`MemoryBroker`] holds named topics. Every message published to a topic
//! is copied to each subscription that exists at publish time; messages
//! published to a topic without subscriptions are dropped. Delivered messages
//! stay in flight until acknowledged and are redelivered once their ack
//! deadline passes, giving at-least-once delivery.
//!
//! # URLs
//!
//! [`MemoryUrlOpener`] serves the `mem` scheme:
//!
//! - `mem://orders` opens topic `orders`, creating it if needed.
//! - `mem://orders?ackdeadline=5000` opens a new subscription to the existing
//!   topic `orders` with a 5 second ack deadline.

use crate::driver::{SubscriptionDriver, TopicDriver};
use crate::error::{DriverError, ErrorCode, PubSubError};
use crate::message::{AckId, DriverMessage, Metadata};
use crate::subscription::{Subscription, SubscriptionOptions};
use crate::topic::{Topic, TopicOptions};
use crate::url_mux::{SubscriptionUrlOpener, TopicUrlOpener, UrlMux};
use async_trait::async_trait;
use bytes::Bytes;
use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

/// URL scheme served by [`MemoryUrlOpener`].
pub const SCHEME: &str = "mem";

/// Ack deadline used when none is given.
pub const DEFAULT_ACK_DEADLINE: Duration = Duration::from_secs(60);

/// Longest time a receive call waits for messages before returning empty.
const RECEIVE_WAIT: Duration = Duration::from_millis(100);

const PROVIDER: &str = "mem";

/// Errors raised by the in-memory broker.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MemoryError {
    /// The topic was never created or has been deleted.
    #[error("topic {0:?} does not exist")]
    TopicNotFound(String),
}

// ============================================================================
// Internal Storage Structures
// ============================================================================

/// A published message as stored per subscription.
#[derive(Clone)]
struct StoredMessage {
    body: Bytes,
    metadata: Metadata,
    delivery_count: u32,
}

struct InFlightMessage {
    message: StoredMessage,
    deadline: Instant,
}

/// Per-subscription message store.
struct SubscriptionQueue {
    ack_deadline: Duration,
    ready: VecDeque<StoredMessage>,
    in_flight: HashMap<u64, InFlightMessage>,
    next_ack_id: u64,
}

impl SubscriptionQueue {
    fn new(ack_deadline: Duration) -> Self {
        Self {
            ack_deadline,
            ready: VecDeque::new(),
            in_flight: HashMap::new(),
            next_ack_id: 0,
        }
    }

    /// Move in-flight messages whose deadline passed back to the ready queue.
    fn requeue_expired(&mut self, now: Instant) {
        let mut expired: Vec<u64> = self
            .in_flight
            .iter()
            .filter(|(_, m)| m.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        expired.sort_unstable();
        for id in expired {
            if let Some(m) = self.in_flight.remove(&id) {
                self.ready.push_back(m.message);
            }
        }
    }

    fn take(&mut self, max_messages: usize) -> Vec<DriverMessage> {
        let now = Instant::now();
        self.requeue_expired(now);

        let count = max_messages.min(self.ready.len());
        let mut batch = Vec::with_capacity(count);
        for mut message in self.ready.drain(..count).collect::<Vec<_>>() {
            message.delivery_count += 1;
            let ack_id = self.next_ack_id;
            self.next_ack_id += 1;

            batch.push(
                DriverMessage::new(message.body.clone(), message.metadata.clone())
                    .with_ack_id(AckId::new(ack_id))
                    .with_native(Arc::new(MemoryDelivery {
                        ack_id,
                        delivery_count: message.delivery_count,
                    })),
            );
            self.in_flight.insert(
                ack_id,
                InFlightMessage {
                    message,
                    deadline: now + self.ack_deadline,
                },
            );
        }
        batch
    }
}

struct SubscriptionShared {
    queue: Mutex<SubscriptionQueue>,
    available: Notify,
}

impl SubscriptionShared {
    fn lock(&self) -> MutexGuard<'_, SubscriptionQueue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Provider-native view of one delivery, exposed through
/// [`Message::as_native`](crate::Message::as_native).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryDelivery {
    /// Broker-assigned acknowledgement ID.
    pub ack_id: u64,
    /// How many times this message has been delivered, starting at 1.
    pub delivery_count: u32,
}

// ============================================================================
// MemoryBroker
// ============================================================================

/// Process-local broker holding named topics.
///
/// Cheap to clone; clones share the same topics.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    topics: Arc<RwLock<HashMap<String, Vec<Weak<SubscriptionShared>>>>>,
}

impl MemoryBroker {
    /// Create a broker with no topics.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create `name` if it does not exist yet. Returns whether it was created.
    pub fn create_topic(&self, name: &str) -> bool {
        let mut topics = self.topics.write().unwrap_or_else(PoisonError::into_inner);
        if topics.contains_key(name) {
            return false;
        }
        debug!(topic = name, "Created in-memory topic");
        topics.insert(name.to_string(), Vec::new());
        true
    }

    /// Delete `name` and detach its subscriptions. Returns whether it existed.
    pub fn delete_topic(&self, name: &str) -> bool {
        self.topics
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)
            .is_some()
    }

    /// Whether `name` exists.
    pub fn has_topic(&self, name: &str) -> bool {
        self.topics
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(name)
    }

    /// Open a publisher for `name`, creating the topic if needed.
    ///
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime.
    pub fn open_topic(&self, name: &str, options: TopicOptions) -> Topic {
        self.create_topic(name);
        Topic::with_options(
            Arc::new(MemoryTopicDriver {
                broker: self.clone(),
                topic: name.to_string(),
            }),
            options,
        )
    }

    /// Attach a new subscription to the existing topic `name`.
    ///
    /// # Errors
    ///
    /// Returns a `NotFound` error when the topic does not exist.
    ///
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime.
    pub fn open_subscription(
        &self,
        name: &str,
        ack_deadline: Duration,
        options: SubscriptionOptions,
    ) -> Result<Subscription, PubSubError> {
        let shared = Arc::new(SubscriptionShared {
            queue: Mutex::new(SubscriptionQueue::new(ack_deadline)),
            available: Notify::new(),
        });
        {
            let mut topics = self.topics.write().unwrap_or_else(PoisonError::into_inner);
            let subscriptions = topics.get_mut(name).ok_or_else(|| {
                PubSubError::wrap(
                    ErrorCode::NotFound,
                    PROVIDER,
                    Box::new(MemoryError::TopicNotFound(name.to_string())),
                )
            })?;
            subscriptions.push(Arc::downgrade(&shared));
        }
        debug!(
            topic = name,
            ack_deadline_ms = u64::try_from(ack_deadline.as_millis()).unwrap_or(u64::MAX),
            "Attached in-memory subscription"
        );

        Ok(Subscription::with_options(
            Arc::new(MemorySubscriptionDriver {
                broker: self.clone(),
                topic: name.to_string(),
                shared,
            }),
            options,
        ))
    }

    /// Copy `messages` to every live subscription of `name`.
    fn publish(&self, name: &str, messages: &[DriverMessage]) -> Result<(), MemoryError> {
        let subscriptions: Vec<Arc<SubscriptionShared>> = {
            let mut topics = self.topics.write().unwrap_or_else(PoisonError::into_inner);
            let subscriptions = topics
                .get_mut(name)
                .ok_or_else(|| MemoryError::TopicNotFound(name.to_string()))?;
            subscriptions.retain(|s| s.strong_count() > 0);
            subscriptions.iter().filter_map(Weak::upgrade).collect()
        };

        for subscription in subscriptions {
            subscription.lock().ready.extend(messages.iter().map(|m| StoredMessage {
                body: m.body.clone(),
                metadata: m.metadata.clone(),
                delivery_count: 0,
            }));
            subscription.available.notify_one();
        }
        Ok(())
    }
}

fn memory_error_code(err: &DriverError) -> ErrorCode {
    match err.downcast_ref::<MemoryError>() {
        Some(MemoryError::TopicNotFound(_)) => ErrorCode::NotFound,
        None => ErrorCode::Unknown,
    }
}

// ============================================================================
// Drivers
// ============================================================================

/// Topic driver publishing into a [`MemoryBroker`].
pub struct MemoryTopicDriver {
    broker: MemoryBroker,
    topic: String,
}

#[async_trait]
impl TopicDriver for MemoryTopicDriver {
    async fn send_batch(
        &self,
        cancel: &CancellationToken,
        messages: Vec<DriverMessage>,
    ) -> Result<(), DriverError> {
        if cancel.is_cancelled() {
            return Err(Box::new(PubSubError::Canceled));
        }
        self.broker.publish(&self.topic, &messages)?;
        Ok(())
    }

    fn is_retryable(&self, _err: &DriverError) -> bool {
        false
    }

    fn error_code(&self, err: &DriverError) -> ErrorCode {
        memory_error_code(err)
    }

    fn provider_name(&self) -> &'static str {
        PROVIDER
    }

    fn as_any(&self) -> Option<&(dyn Any + Send + Sync)> {
        Some(&self.broker)
    }
}

/// Subscription driver reading from one [`MemoryBroker`] subscription.
pub struct MemorySubscriptionDriver {
    broker: MemoryBroker,
    topic: String,
    shared: Arc<SubscriptionShared>,
}

#[async_trait]
impl SubscriptionDriver for MemorySubscriptionDriver {
    async fn receive_batch(
        &self,
        cancel: &CancellationToken,
        max_messages: usize,
    ) -> Result<Vec<DriverMessage>, DriverError> {
        let give_up = tokio::time::sleep(RECEIVE_WAIT);
        tokio::pin!(give_up);

        loop {
            let batch = self.shared.lock().take(max_messages);
            if !batch.is_empty() {
                debug!(topic = %self.topic, count = batch.len(), "Delivering in-memory messages");
                return Ok(batch);
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(Box::new(PubSubError::Canceled)),
                _ = self.shared.available.notified() => {}
                _ = &mut give_up => return Ok(Vec::new()),
            }
        }
    }

    async fn send_acks(
        &self,
        _cancel: &CancellationToken,
        ack_ids: Vec<AckId>,
    ) -> Result<(), DriverError> {
        let mut queue = self.shared.lock();
        for ack_id in ack_ids {
            // Unknown IDs were already redelivered under a new ID.
            if let Some(id) = ack_id.downcast_ref::<u64>() {
                queue.in_flight.remove(id);
            }
        }
        Ok(())
    }

    fn is_retryable(&self, _err: &DriverError) -> bool {
        false
    }

    fn error_code(&self, err: &DriverError) -> ErrorCode {
        memory_error_code(err)
    }

    fn provider_name(&self) -> &'static str {
        PROVIDER
    }

    fn as_any(&self) -> Option<&(dyn Any + Send + Sync)> {
        Some(&self.broker)
    }
}

// ============================================================================
// URL Opener
// ============================================================================

/// Opens in-memory topics and subscriptions from `mem://` URLs.
#[derive(Clone, Default)]
pub struct MemoryUrlOpener {
    /// Broker the opened handles connect to.
    pub broker: MemoryBroker,
    /// Options applied to every opened topic.
    pub topic_options: TopicOptions,
    /// Options applied to every opened subscription.
    pub subscription_options: SubscriptionOptions,
}

impl MemoryUrlOpener {
    /// Create an opener over an existing broker.
    pub fn new(broker: MemoryBroker) -> Self {
        Self {
            broker,
            ..Self::default()
        }
    }
}

/// Topic name is the URL host joined with its path.
fn topic_name(kind: &'static str, url: &Url) -> Result<String, PubSubError> {
    let name = format!("{}{}", url.host_str().unwrap_or_default(), url.path());
    if name.is_empty() {
        return Err(PubSubError::Open {
            kind,
            url: url.to_string(),
            message: "missing topic name".to_string(),
        });
    }
    Ok(name)
}

fn unknown_parameter(kind: &'static str, url: &Url, key: &str) -> PubSubError {
    PubSubError::Open {
        kind,
        url: url.to_string(),
        message: format!("unknown query parameter {:?}", key),
    }
}

#[async_trait]
impl TopicUrlOpener for MemoryUrlOpener {
    async fn open_topic_url(&self, url: &Url) -> Result<Topic, PubSubError> {
        if let Some((key, _)) = url.query_pairs().next() {
            return Err(unknown_parameter("Topic", url, &key));
        }
        let name = topic_name("Topic", url)?;
        Ok(self.broker.open_topic(&name, self.topic_options.clone()))
    }
}

#[async_trait]
impl SubscriptionUrlOpener for MemoryUrlOpener {
    async fn open_subscription_url(&self, url: &Url) -> Result<Subscription, PubSubError> {
        let mut ack_deadline = DEFAULT_ACK_DEADLINE;
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "ackdeadline" => {
                    let millis: u64 = value.parse().map_err(|_| PubSubError::Open {
                        kind: "Subscription",
                        url: url.to_string(),
                        message: format!("invalid ackdeadline {:?}, expected milliseconds", value),
                    })?;
                    ack_deadline = Duration::from_millis(millis);
                }
                other => return Err(unknown_parameter("Subscription", url, other)),
            }
        }
        let name = topic_name("Subscription", url)?;
        self.broker
            .open_subscription(&name, ack_deadline, self.subscription_options.clone())
    }
}

/// Register a fresh [`MemoryUrlOpener`] for the `mem` scheme on `mux`.
pub fn register(mux: &UrlMux) {
    let opener = Arc::new(MemoryUrlOpener::default());
    mux.register_topic(SCHEME, opener.clone());
    mux.register_subscription(SCHEME, opener);
}

#[cfg(test)]
#[path = "memory_tests.rs"]
mod tests;
