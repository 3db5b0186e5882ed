//! Common test utilities for pubsub-runtime integration tests
//!
//! This module provides:
//! - One-time tracing initialisation driven by `RUST_LOG`
//! - Unique topic URLs so tests sharing the default multiplexer never collide
//! - A receive helper with a bounded wait

use pubsub_runtime::{Message, Subscription};
use std::sync::Once;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing_subscriber::EnvFilter;

static TRACING: Once = Once::new();

/// Install a fmt subscriber once per test binary.
#[allow(dead_code)]
pub fn init_tracing() {
    TRACING.call_once(|| {
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("pubsub_runtime=warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

/// A `mem://` URL naming a topic no other test uses.
#[allow(dead_code)]
pub fn unique_topic_url(prefix: &str) -> String {
    let url = format!("mem://{}-{}", prefix, uuid::Uuid::new_v4());
    debug!(url = %url, "Allocated test topic");
    url
}

/// Receive one message or fail the test after `timeout`.
#[allow(dead_code)]
pub async fn receive_within(subscription: &Subscription, timeout: Duration) -> Message {
    let message = tokio::time::timeout(timeout, subscription.receive(&CancellationToken::new()))
        .await
        .expect("timed out waiting for a message")
        .expect("receive failed");
    debug!(body_len = message.body.len(), "Received test message");
    message
}

/// Message body as UTF-8 text.
#[allow(dead_code)]
pub fn body_text(message: &Message) -> String {
    String::from_utf8_lossy(&message.body).into_owned()
}
