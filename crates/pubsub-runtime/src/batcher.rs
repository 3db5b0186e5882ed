//! Generic concurrent batching engine.
//!
//! A [`Batcher`] accepts individually submitted items from any number of
//! concurrent callers, coalesces items that arrive while a handler call is in
//! flight into one batch, and hands each batch to a single handler call. The
//! number of concurrent handler calls is bounded by
//! [`BatcherOptions::max_handlers`]; the publish and ack paths use exactly one
//! so provider calls never overlap.

use crate::error::{ErrorCode, PubSubError};
use futures::future::{BoxFuture, FutureExt};
use std::collections::VecDeque;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::runtime::Handle;
use tokio::sync::{oneshot, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// Outcome delivered to every caller whose item was part of a batch.
pub type BatchResult = Result<(), PubSubError>;

type Handler<T> = Box<dyn Fn(Vec<T>) -> BoxFuture<'static, BatchResult> + Send + Sync>;

/// Batching limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatcherOptions {
    /// Maximum number of handler calls in flight at once.
    pub max_handlers: usize,
    /// Maximum number of items in one batch; 0 means unbounded.
    pub max_batch_size: usize,
}

impl Default for BatcherOptions {
    fn default() -> Self {
        Self {
            max_handlers: 1,
            max_batch_size: 100,
        }
    }
}

// ============================================================================
// Internal State
// ============================================================================

struct Pending<T> {
    item: T,
    done: oneshot::Sender<BatchResult>,
}

struct State<T> {
    pending: VecDeque<Pending<T>>,
    active_handlers: usize,
    shut_down: bool,
}

struct Inner<T> {
    options: BatcherOptions,
    handler: Handler<T>,
    runtime: Handle,
    state: Mutex<State<T>>,
    idle: Notify,
}

impl<T> Inner<T> {
    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Remove the next batch from the pending queue.
    fn take_batch(state: &mut State<T>, max_batch_size: usize) -> Vec<Pending<T>> {
        let count = if max_batch_size == 0 {
            state.pending.len()
        } else {
            state.pending.len().min(max_batch_size)
        };
        state.pending.drain(..count).collect()
    }
}

// ============================================================================
// Batcher
// ============================================================================

/// Accumulates submitted items into batches and runs a handler per batch.
///
/// Must be created inside a Tokio runtime; handler calls run as tasks on
/// that runtime.
pub struct Batcher<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Batcher<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Send + 'static> Batcher<T> {
    /// Create a batcher that passes each batch to `handler`.
    ///
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime.
    pub fn new<F, Fut>(options: BatcherOptions, handler: F) -> Self
    where
        F: Fn(Vec<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = BatchResult> + Send + 'static,
    {
        let options = BatcherOptions {
            max_handlers: options.max_handlers.max(1),
            ..options
        };
        Self {
            inner: Arc::new(Inner {
                options,
                handler: Box::new(move |items| handler(items).boxed()),
                runtime: Handle::current(),
                state: Mutex::new(State {
                    pending: VecDeque::new(),
                    active_handlers: 0,
                    shut_down: false,
                }),
                idle: Notify::new(),
            }),
        }
    }

    /// Submit `item` and wait until the batch containing it has been handled.
    ///
    /// Returns [`PubSubError::Canceled`] if `cancel` fires first; the item
    /// stays in its batch.
    pub async fn add(&self, cancel: &CancellationToken, item: T) -> BatchResult {
        let done = self.add_no_wait(item);
        tokio::select! {
            _ = cancel.cancelled() => Err(PubSubError::Canceled),
            result = done => result.unwrap_or_else(|_| {
                Err(PubSubError::canonical(
                    ErrorCode::Internal,
                    "batcher: handler dropped without reporting a result",
                ))
            }),
        }
    }

    /// Submit `item` without waiting.
    ///
    /// The returned receiver yields the batch outcome and may be dropped.
    pub fn add_no_wait(&self, item: T) -> oneshot::Receiver<BatchResult> {
        let (done, result) = oneshot::channel();
        let mut state = self.inner.lock();
        if state.shut_down {
            let _ = done.send(Err(PubSubError::canonical(
                ErrorCode::FailedPrecondition,
                "batcher: shut down",
            )));
            return result;
        }

        state.pending.push_back(Pending { item, done });
        if state.active_handlers < self.inner.options.max_handlers {
            state.active_handlers += 1;
            drop(state);
            let inner = Arc::clone(&self.inner);
            self.inner.runtime.spawn(run_handler(inner));
        }
        result
    }

    /// Stop accepting items and wait for pending batches to be handled.
    ///
    /// In-flight handler calls are not interrupted; callers that need an
    /// early exit race this future against their own cancellation.
    pub async fn shutdown(&self) {
        loop {
            let idle = self.inner.idle.notified();
            {
                let mut state = self.inner.lock();
                state.shut_down = true;
                if state.active_handlers == 0 && state.pending.is_empty() {
                    return;
                }
            }
            idle.await;
        }
    }

    /// Whether [`Batcher::shutdown`] has been called.
    pub fn is_shut_down(&self) -> bool {
        self.inner.lock().shut_down
    }
}

/// Handler loop: keeps taking batches until nothing is pending.
async fn run_handler<T: Send + 'static>(inner: Arc<Inner<T>>) {
    loop {
        let batch = {
            let mut state = inner.lock();
            if state.pending.is_empty() {
                state.active_handlers -= 1;
                if state.active_handlers == 0 {
                    inner.idle.notify_waiters();
                }
                return;
            }
            Inner::take_batch(&mut state, inner.options.max_batch_size)
        };

        let (items, waiters): (Vec<T>, Vec<oneshot::Sender<BatchResult>>) =
            batch.into_iter().map(|p| (p.item, p.done)).unzip();
        debug!(batch_size = items.len(), "Dispatching batch to handler");

        let result = match AssertUnwindSafe((inner.handler)(items)).catch_unwind().await {
            Ok(result) => result,
            Err(_) => {
                error!("Batch handler panicked");
                Err(PubSubError::canonical(
                    ErrorCode::Internal,
                    "batcher: batch handler panicked",
                ))
            }
        };

        for waiter in waiters {
            let _ = waiter.send(result.clone());
        }
    }
}

#[cfg(test)]
#[path = "batcher_tests.rs"]
mod tests;
