//! Message types exchanged between applications, the runtime and drivers.

use crate::error::PubSubError;
use bytes::Bytes;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

/// String-keyed message metadata.
pub type Metadata = HashMap<String, String>;

/// Provider-native value exposed through the `as_native` escape hatches.
pub type NativeHandle = Arc<dyn Any + Send + Sync>;

/// Closure run when a delivered message is acknowledged. Receives the time
/// the application spent processing the message.
pub(crate) type AckFn = Box<dyn FnOnce(Duration) + Send>;

// ============================================================================
// AckId
// ============================================================================

/// Opaque provider token naming one delivered, unacknowledged message.
///
/// Only the driver that produced an `AckId` knows what it contains; it
/// recovers its own representation with [`AckId::downcast_ref`].
#[derive(Clone)]
pub struct AckId(Arc<dyn Any + Send + Sync>);

impl AckId {
    /// Wrap a provider-specific token.
    pub fn new<T: Any + Send + Sync>(token: T) -> Self {
        Self(Arc::new(token))
    }

    /// Recover the provider-specific token.
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref::<T>()
    }
}

impl fmt::Debug for AckId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AckId(..)")
    }
}

// ============================================================================
// DriverMessage
// ============================================================================

/// The wire shape of a message as seen by provider drivers.
///
/// Only payload and metadata cross the boundary on the send path; drivers
/// fill in `ack_id` and `native` on the receive path.
#[derive(Clone)]
pub struct DriverMessage {
    pub body: Bytes,
    pub metadata: Metadata,
    pub ack_id: Option<AckId>,
    pub native: Option<NativeHandle>,
}

impl DriverMessage {
    /// Create a driver message with body and metadata.
    pub fn new(body: Bytes, metadata: Metadata) -> Self {
        Self {
            body,
            metadata,
            ack_id: None,
            native: None,
        }
    }

    /// Attach the acknowledgement token for a received message.
    pub fn with_ack_id(mut self, ack_id: AckId) -> Self {
        self.ack_id = Some(ack_id);
        self
    }

    /// Attach the provider-native representation of a received message.
    pub fn with_native(mut self, native: NativeHandle) -> Self {
        self.native = Some(native);
        self
    }
}

impl fmt::Debug for DriverMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriverMessage")
            .field("body_len", &self.body.len())
            .field("metadata", &self.metadata)
            .field("ack_id", &self.ack_id)
            .field("has_native", &self.native.is_some())
            .finish()
    }
}

// ============================================================================
// Message
// ============================================================================

struct AckState {
    ack: Option<AckFn>,
    acked: bool,
}

/// A message to publish, or one delivered by [`Subscription::receive`].
///
/// [`Subscription::receive`]: crate::Subscription::receive
pub struct Message {
    /// Message payload.
    pub body: Bytes,
    /// Key/value metadata. Keys and values must be legal text.
    pub metadata: Metadata,
    native: Option<NativeHandle>,
    processing_started: Option<Instant>,
    ack: Mutex<AckState>,
}

impl Message {
    /// Create new message with body
    pub fn new(body: impl Into<Bytes>) -> Self {
        Self {
            body: body.into(),
            metadata: Metadata::new(),
            native: None,
            processing_started: None,
            ack: Mutex::new(AckState {
                ack: None,
                acked: false,
            }),
        }
    }

    /// Add a metadata entry
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Acknowledge the message.
    ///
    /// Returns immediately; the acknowledgement is sent in the background and
    /// failures surface on a later [`Subscription::receive`].
    ///
    /// # Panics
    ///
    /// Panics when called twice on the same message, or on a message that was
    /// not obtained from [`Subscription::receive`].
    ///
    /// [`Subscription::receive`]: crate::Subscription::receive
    pub fn ack(&self) {
        let mut state = self.ack.lock().unwrap_or_else(PoisonError::into_inner);
        if state.acked {
            panic!("ack called twice on message: {:?}", self);
        }
        let ack = match state.ack.take() {
            Some(ack) => ack,
            None => panic!("ack called on a message that was not obtained from receive"),
        };
        let elapsed = self
            .processing_started
            .map(|started| started.elapsed())
            .unwrap_or_default();
        ack(elapsed);
        state.acked = true;
    }

    /// Whether [`Message::ack`] has already been called.
    pub fn is_acked(&self) -> bool {
        self.ack.lock().unwrap_or_else(PoisonError::into_inner).acked
    }

    /// Access the provider-native representation of a received message.
    ///
    /// Returns `None` for messages built by the application and for
    /// providers that do not expose type `T`.
    pub fn as_native<T: Any>(&self) -> Option<&T> {
        self.native.as_ref()?.downcast_ref::<T>()
    }

    /// Build a delivered message from its driver representation.
    pub(crate) fn delivered(message: DriverMessage, ack: AckFn) -> Self {
        Self {
            body: message.body,
            metadata: message.metadata,
            native: message.native,
            processing_started: None,
            ack: Mutex::new(AckState {
                ack: Some(ack),
                acked: false,
            }),
        }
    }

    /// Stamp the moment the message is handed to the application.
    pub(crate) fn mark_processing_started(&mut self) {
        self.processing_started = Some(Instant::now());
    }

    /// Strip bookkeeping and produce the send-path wire shape.
    pub(crate) fn into_driver_message(self) -> DriverMessage {
        DriverMessage::new(self.body, self.metadata)
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("body_len", &self.body.len())
            .field("metadata", &self.metadata)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Metadata Validation
// ============================================================================

/// Check that every metadata key and value is legal text.
///
/// `String` already guarantees UTF-8, so what remains to reject is text no
/// broker can carry: empty keys and embedded NUL characters.
pub fn validate_metadata(metadata: &Metadata) -> Result<(), PubSubError> {
    for (key, value) in metadata {
        if key.is_empty() {
            return Err(PubSubError::InvalidMetadata {
                key: key.clone(),
                reason: "keys must not be empty",
            });
        }
        if key.contains('\0') {
            return Err(PubSubError::InvalidMetadata {
                key: key.clone(),
                reason: "keys must not contain NUL characters",
            });
        }
        if value.contains('\0') {
            return Err(PubSubError::InvalidMetadata {
                key: key.clone(),
                reason: "values must not contain NUL characters",
            });
        }
    }
    Ok(())
}

#[cfg(test)]
#[path = "message_tests.rs"]
mod tests;
