//! # PubSub Runtime
//!
//! Provider-agnostic publish/subscribe client layer. Applications send
//! through a [`Topic`] and receive through a [`Subscription`] without
//! depending on any one broker's wire protocol or SDK.
//!
//! This library provides:
//! - Send-side batching with non-overlapping provider calls
//! - Adaptive receive batch sizing driven by observed processing time
//! - Batched, non-blocking acknowledgements
//! - Retries with exponential backoff around every provider call
//! - URL-based driver discovery through [`UrlMux`]
//!
//! ## Module Organization
//!
//! - [`error`] - Canonical error taxonomy
//! - [`message`] - Messages, metadata and acknowledgement IDs
//! - [`driver`] - Traits implemented by provider back ends
//! - [`batcher`] - Generic batching engine
//! - [`retry`] - Retry with exponential backoff
//! - [`flow_control`] - Adaptive fetch sizing
//! - [`topic`] / [`subscription`] - The portable handles
//! - [`url_mux`] - Scheme-to-opener registry
//! - [`config`] - Layered configuration
//! - [`providers`] - Bundled provider drivers
//!
//! ## Example
//!
//! ```rust
//! use pubsub_runtime::{open_subscription, open_topic, Message};
//! use tokio_util::sync::CancellationToken;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), pubsub_runtime::PubSubError> {
//! let cancel = CancellationToken::new();
//! let topic = open_topic("mem://greetings").await?;
//! let subscription = open_subscription("mem://greetings").await?;
//!
//! topic.send(&cancel, Message::new("hello")).await?;
//! let message = subscription.receive(&cancel).await?;
//! assert_eq!(&message.body[..], b"hello");
//! message.ack();
//!
//! topic.shutdown(&cancel).await?;
//! subscription.shutdown(&cancel).await?;
//! # Ok(())
//! # }
//! ```

pub mod batcher;
pub mod config;
pub mod driver;
pub mod error;
pub mod flow_control;
pub mod message;
pub mod providers;
pub mod retry;
pub mod subscription;
pub mod topic;
pub mod url_mux;

// Re-export commonly used types at crate root for convenience
pub use batcher::{BatchResult, Batcher, BatcherOptions};
pub use config::PubSubConfig;
pub use driver::{AckOverride, SubscriptionDriver, TopicDriver};
pub use error::{DriverError, ErrorCode, PubSubError};
pub use flow_control::FlowControlConfig;
pub use message::{AckId, DriverMessage, Message, Metadata};
pub use retry::RetryPolicy;
pub use subscription::{Subscription, SubscriptionOptions};
pub use topic::{Topic, TopicOptions};
pub use url_mux::{
    default_url_mux, open_subscription, open_topic, SubscriptionUrlOpener, TopicUrlOpener,
    UrlMux,
};

#[cfg(test)]
#[path = "lib_tests.rs"]
mod tests;
