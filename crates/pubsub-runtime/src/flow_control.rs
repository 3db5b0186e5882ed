//! Adaptive receive batch sizing.
//!
//! A subscription keeps an exponentially weighted moving average of how long
//! the application takes to process one message, and sizes each fetch so
//! that the local queue holds roughly [`FlowControlConfig::desired_queue_duration`]
//! worth of work. Too short a buffer starves fast consumers; too long a buffer
//! lets messages sit in memory past their provider ack deadline.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tuning knobs for adaptive fetch sizing.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FlowControlConfig {
    /// How long the buffered queue should last at the current processing rate.
    pub desired_queue_duration: Duration,
    /// Weight of the newest sample in the moving average.
    pub decay: f64,
    /// Upper bound on a single fetch request.
    pub max_fetch_size: usize,
}

impl Default for FlowControlConfig {
    fn default() -> Self {
        Self {
            desired_queue_duration: Duration::from_secs(2),
            decay: 0.05,
            max_fetch_size: 1000,
        }
    }
}

/// Moving average of per-message processing time.
#[derive(Debug, Clone)]
pub struct FlowControl {
    config: FlowControlConfig,
    /// Average processing time in seconds; `None` until the first sample.
    avg_process_secs: Option<f64>,
}

impl FlowControl {
    /// Create flow control with no observations yet.
    pub fn new(config: FlowControlConfig) -> Self {
        Self {
            config,
            avg_process_secs: None,
        }
    }

    /// Fold one processing-time sample into the moving average.
    ///
    /// Zero samples are raised to one nanosecond; coarse clocks report zero
    /// for very fast processing.
    pub fn record(&mut self, elapsed: Duration) {
        let elapsed = if elapsed.is_zero() {
            Duration::from_nanos(1)
        } else {
            elapsed
        };
        let sample = elapsed.as_secs_f64();
        let decay = self.config.decay;
        self.avg_process_secs = Some(match self.avg_process_secs {
            None => sample,
            Some(avg) => avg * (1.0 - decay) + sample * decay,
        });
    }

    /// Current average processing time, if any sample has been recorded.
    pub fn average(&self) -> Option<Duration> {
        self.avg_process_secs.map(Duration::from_secs_f64)
    }

    /// Number of messages the next fetch should request.
    ///
    /// One before any observation; afterwards `ceil(desired / avg)` clamped to
    /// `[1, max_fetch_size]`.
    pub fn desired_fetch_size(&self) -> usize {
        let ceiling = self.config.max_fetch_size.max(1);
        match self.avg_process_secs {
            None => 1,
            Some(avg) => {
                let wanted = (self.config.desired_queue_duration.as_secs_f64() / avg).ceil();
                if wanted >= ceiling as f64 {
                    ceiling
                } else {
                    (wanted as usize).max(1)
                }
            }
        }
    }
}

impl Default for FlowControl {
    fn default() -> Self {
        Self::new(FlowControlConfig::default())
    }
}

#[cfg(test)]
#[path = "flow_control_tests.rs"]
mod tests;
