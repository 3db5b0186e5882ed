//! Layered configuration for topics and subscriptions.
//!
//! Every field carries a serde default, so an absent file and an empty
//! environment produce a valid configuration. Sources are applied in order,
//! later sources overriding earlier ones:
//!
//! 1. Built-in defaults.
//! 2. An optional YAML, TOML or JSON file (format taken from the extension).
//! 3. Environment variables prefixed `PUBSUB__`, with `__` separating nested
//!    keys, e.g. `PUBSUB__RETRY__MAX_DELAY_MS=5000` sets `retry.max_delay_ms`.

use crate::batcher::BatcherOptions;
use crate::error::PubSubError;
use crate::flow_control::FlowControlConfig;
use crate::retry::RetryPolicy;
use crate::subscription::SubscriptionOptions;
use crate::topic::TopicOptions;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

/// Prefix of environment variables read by [`PubSubConfig::load`].
pub const ENV_PREFIX: &str = "PUBSUB";

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PubSubConfig {
    /// Backoff around provider calls.
    pub retry: RetryConfig,

    /// Send and ack batching limits.
    pub batching: BatchingConfig,

    /// Adaptive receive sizing.
    pub flow_control: FlowControlSettings,
}

/// Retry backoff settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Delay before the first retry in milliseconds
    pub initial_delay_ms: u64,

    /// Upper bound on any single delay in milliseconds
    pub max_delay_ms: u64,

    /// Growth factor between consecutive delays
    pub multiplier: f64,

    /// Random variation as a fraction of the delay; 0 disables jitter
    pub jitter_percent: f64,

    /// Retries after the first attempt; unset retries indefinitely
    pub max_attempts: Option<u32>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1000,
            max_delay_ms: 30_000,
            multiplier: 2.0,
            jitter_percent: 0.25,
            max_attempts: None,
        }
    }
}

/// Batching limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchingConfig {
    /// Items per batch; 0 means unbounded
    pub max_batch_size: usize,
}

impl Default for BatchingConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 100,
        }
    }
}

/// Adaptive fetch sizing settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowControlSettings {
    /// Target buffering time of the local receive queue in milliseconds
    pub desired_queue_duration_ms: u64,

    /// Weight of the newest processing-time sample
    pub decay: f64,

    /// Ceiling on a single fetch request
    pub max_fetch_size: usize,
}

impl Default for FlowControlSettings {
    fn default() -> Self {
        Self {
            desired_queue_duration_ms: 2000,
            decay: 0.05,
            max_fetch_size: 1000,
        }
    }
}

impl PubSubConfig {
    /// Load configuration from defaults, an optional file, and `PUBSUB__`
    /// environment variables, then validate it.
    ///
    /// # Errors
    ///
    /// Returns [`PubSubError::Configuration`] when the file cannot be read
    /// or parsed, a value has the wrong type, or validation fails.
    pub fn load(path: Option<&Path>) -> Result<Self, PubSubError> {
        Self::load_from(
            path,
            config::Environment::with_prefix(ENV_PREFIX).separator("__"),
        )
    }

    pub(crate) fn load_from(
        path: Option<&Path>,
        environment: config::Environment,
    ) -> Result<Self, PubSubError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            debug!(path = %path.display(), "Loading pubsub configuration file");
            builder = builder.add_source(config::File::from(path).required(true));
        }

        let settings: PubSubConfig = builder
            .add_source(environment)
            .build()
            .and_then(|config| config.try_deserialize())
            .map_err(|e| PubSubError::Configuration {
                message: e.to_string(),
            })?;

        settings.validate()?;
        Ok(settings)
    }

    /// Reject values that cannot produce a working topic or subscription.
    pub fn validate(&self) -> Result<(), PubSubError> {
        let retry = &self.retry;
        if retry.multiplier < 1.0 {
            return Err(invalid(format!(
                "retry.multiplier must be at least 1.0, got {}",
                retry.multiplier
            )));
        }
        if !(0.0..=1.0).contains(&retry.jitter_percent) {
            return Err(invalid(format!(
                "retry.jitter_percent must be within [0, 1], got {}",
                retry.jitter_percent
            )));
        }
        if retry.max_delay_ms < retry.initial_delay_ms {
            return Err(invalid(format!(
                "retry.max_delay_ms ({}) is below retry.initial_delay_ms ({})",
                retry.max_delay_ms, retry.initial_delay_ms
            )));
        }

        let flow = &self.flow_control;
        if !(flow.decay > 0.0 && flow.decay <= 1.0) {
            return Err(invalid(format!(
                "flow_control.decay must be within (0, 1], got {}",
                flow.decay
            )));
        }
        if flow.max_fetch_size == 0 {
            return Err(invalid("flow_control.max_fetch_size must be at least 1".to_string()));
        }
        if flow.desired_queue_duration_ms == 0 {
            return Err(invalid(
                "flow_control.desired_queue_duration_ms must be positive".to_string(),
            ));
        }

        Ok(())
    }
}

fn invalid(message: String) -> PubSubError {
    PubSubError::Configuration { message }
}

// ============================================================================
// Conversions
// ============================================================================

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        let policy = RetryPolicy::new(
            config.max_attempts,
            Duration::from_millis(config.initial_delay_ms),
            Duration::from_millis(config.max_delay_ms),
            config.multiplier,
        )
        .with_jitter_percent(config.jitter_percent);

        if config.jitter_percent == 0.0 {
            policy.without_jitter()
        } else {
            policy
        }
    }
}

impl From<&BatchingConfig> for BatcherOptions {
    fn from(config: &BatchingConfig) -> Self {
        // Provider calls on the publish and ack paths never overlap.
        BatcherOptions {
            max_handlers: 1,
            max_batch_size: config.max_batch_size,
        }
    }
}

impl From<&FlowControlSettings> for FlowControlConfig {
    fn from(config: &FlowControlSettings) -> Self {
        FlowControlConfig {
            desired_queue_duration: Duration::from_millis(config.desired_queue_duration_ms),
            decay: config.decay,
            max_fetch_size: config.max_fetch_size,
        }
    }
}

impl From<&PubSubConfig> for TopicOptions {
    fn from(config: &PubSubConfig) -> Self {
        TopicOptions {
            retry: RetryPolicy::from(&config.retry),
            batching: BatcherOptions::from(&config.batching),
        }
    }
}

impl From<&PubSubConfig> for SubscriptionOptions {
    fn from(config: &PubSubConfig) -> Self {
        SubscriptionOptions {
            retry: RetryPolicy::from(&config.retry),
            ack_batching: BatcherOptions::from(&config.batching),
            flow_control: FlowControlConfig::from(&config.flow_control),
        }
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
