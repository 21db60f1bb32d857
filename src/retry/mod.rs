//! Retry Logic and Error Handling
//!
//! Wraps a fallible async operation with retry, backoff, offline pause and
//! cooperative cancellation.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Notify;

use crate::focus::{focus_manager, is_visible_and_online, online_manager};

/// Query error types.
///
/// Errors are part of observable query state, so they are cheap to clone,
/// comparable, and serializable across the dehydration boundary.
#[derive(Clone, Debug, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum QueryError {
    /// The user-supplied fetch or mutate function failed
    #[error("query function failed: {0}")]
    Fetch(String),

    /// The operation was cancelled before it settled
    #[error("query was cancelled")]
    Cancelled { revert: bool, silent: bool },

    /// An operation required a query function but none was configured
    #[error("no query function was provided")]
    MissingQueryFn,

    #[error("serialization failed: {0}")]
    Serialization(String),

    #[error("deserialization failed: {0}")]
    Deserialization(String),
}

impl QueryError {
    /// Create a fetch error with context
    pub fn fetch(message: impl Into<String>) -> Self {
        Self::Fetch(message.into())
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    pub(crate) fn cancelled(options: CancelOptions) -> Self {
        Self::Cancelled {
            revert: options.revert,
            silent: options.silent,
        }
    }
}

/// Controls how a cancellation settles.
#[derive(Clone, Copy, Debug)]
pub struct CancelOptions {
    /// Restore the state snapshot taken before the fetch began
    pub revert: bool,
    /// Suppress observer notifications for the cancellation
    pub silent: bool,
}

impl Default for CancelOptions {
    fn default() -> Self {
        Self {
            revert: true,
            silent: false,
        }
    }
}

/// Whether a failed attempt should be retried.
#[derive(Clone)]
pub enum RetryPolicy {
    /// Never retry
    Never,
    /// Retry until cancelled
    Infinite,
    /// Retry up to this many times
    Count(u32),
    /// Consult a predicate with `(failure_count, error)`
    Predicate(Arc<dyn Fn(u32, &QueryError) -> bool + Send + Sync>),
}

impl RetryPolicy {
    pub fn should_retry(&self, failure_count: u32, error: &QueryError) -> bool {
        match self {
            Self::Never => false,
            Self::Infinite => true,
            Self::Count(max) => failure_count <= *max,
            Self::Predicate(predicate) => predicate(failure_count, error),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::Count(3)
    }
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Never => write!(f, "Never"),
            Self::Infinite => write!(f, "Infinite"),
            Self::Count(max) => write!(f, "Count({max})"),
            Self::Predicate(_) => write!(f, "Predicate(..)"),
        }
    }
}

/// Retry delay strategies
#[derive(Clone)]
pub enum RetryDelay {
    /// Fixed delay between retries
    Fixed(Duration),
    /// Linear increase: initial + (increment * attempt)
    Linear { initial: Duration, increment: Duration },
    /// Exponential backoff: initial * (multiplier ^ attempt), capped at max
    Exponential {
        initial: Duration,
        multiplier: f64,
        max: Duration,
    },
    /// Consult a function with the zero-based attempt index
    Custom(Arc<dyn Fn(u32) -> Duration + Send + Sync>),
}

impl RetryDelay {
    pub fn calculate(&self, attempt: u32) -> Duration {
        match self {
            Self::Fixed(duration) => *duration,
            Self::Linear { initial, increment } => *initial + (*increment * attempt),
            Self::Exponential {
                initial,
                multiplier,
                max,
            } => {
                let delay = initial.as_millis() as f64 * multiplier.powi(attempt as i32);
                Duration::from_millis(delay.min(max.as_millis() as f64) as u64)
            }
            Self::Custom(f) => f(attempt),
        }
    }
}

impl Default for RetryDelay {
    fn default() -> Self {
        Self::Exponential {
            initial: Duration::from_millis(1000),
            multiplier: 2.0,
            max: Duration::from_secs(30),
        }
    }
}

impl std::fmt::Debug for RetryDelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Fixed(d) => f.debug_tuple("Fixed").field(d).finish(),
            Self::Linear { initial, increment } => f
                .debug_struct("Linear")
                .field("initial", initial)
                .field("increment", increment)
                .finish(),
            Self::Exponential {
                initial,
                multiplier,
                max,
            } => f
                .debug_struct("Exponential")
                .field("initial", initial)
                .field("multiplier", multiplier)
                .field("max", max)
                .finish(),
            Self::Custom(_) => write!(f, "Custom(..)"),
        }
    }
}

/// Lifecycle hooks observed while a retryer runs.
#[derive(Default)]
pub(crate) struct RetryerCallbacks {
    /// A single attempt failed; receives the consecutive failure count
    pub on_fail: Option<Box<dyn Fn(u32, &QueryError) + Send + Sync>>,
    /// The retryer parked because the process is hidden or offline
    pub on_pause: Option<Box<dyn Fn() + Send + Sync>>,
    /// A paused retryer resumed
    pub on_continue: Option<Box<dyn Fn() + Send + Sync>>,
}

/// Runs a fallible async operation under a retry/backoff/cancel policy.
///
/// Each run settles exactly once: with the operation's value, with the final
/// error once the policy is exhausted, or with a cancellation marker. While
/// the focus/online bus reports hidden-or-offline, pending work parks and
/// resumes on the next bus transition or an explicit
/// [`continue_execution`](Self::continue_execution).
pub(crate) struct Retryer {
    failure_count: AtomicU32,
    paused: AtomicBool,
    resolved: AtomicBool,
    cancelled: Mutex<Option<CancelOptions>>,
    cancel_notify: Notify,
    continue_notify: Notify,
}

impl Retryer {
    pub fn new() -> Self {
        Self {
            failure_count: AtomicU32::new(0),
            paused: AtomicBool::new(false),
            resolved: AtomicBool::new(false),
            cancelled: Mutex::new(None),
            cancel_notify: Notify::new(),
            continue_notify: Notify::new(),
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn is_resolved(&self) -> bool {
        self.resolved.load(Ordering::SeqCst)
    }

    /// Abort the current delay and in-flight attempt.
    pub fn cancel(&self, options: CancelOptions) {
        if self.resolved.load(Ordering::SeqCst) {
            return;
        }
        *self.cancelled.lock() = Some(options);
        self.cancel_notify.notify_waiters();
    }

    /// Wake a paused retryer without waiting for a bus transition.
    pub fn continue_execution(&self) {
        self.continue_notify.notify_waiters();
    }

    async fn wait_cancelled(&self) -> CancelOptions {
        loop {
            let notified = self.cancel_notify.notified();
            if let Some(options) = *self.cancelled.lock() {
                return options;
            }
            notified.await;
        }
    }

    /// Park until the process is visible and online again, an explicit
    /// continue arrives, or the run is cancelled.
    async fn pause(&self, callbacks: &RetryerCallbacks) -> Result<(), QueryError> {
        self.paused.store(true, Ordering::SeqCst);
        if let Some(on_pause) = &callbacks.on_pause {
            on_pause();
        }
        tracing::debug!("retryer paused while hidden or offline");

        let mut focus_rx = focus_manager().watch();
        let mut online_rx = online_manager().watch();
        let result = loop {
            if *focus_rx.borrow() && *online_rx.borrow() {
                break Ok(());
            }
            tokio::select! {
                _ = focus_rx.changed() => {}
                _ = online_rx.changed() => {}
                _ = self.continue_notify.notified() => break Ok(()),
                options = self.wait_cancelled() => break Err(QueryError::cancelled(options)),
            }
        };

        self.paused.store(false, Ordering::SeqCst);
        if result.is_ok() {
            if let Some(on_continue) = &callbacks.on_continue {
                on_continue();
            }
            tracing::debug!("retryer resumed");
        }
        result
    }

    /// Sleep out the retry delay; a hidden/offline transition observed after
    /// the delay restarts the pause loop before the next attempt.
    async fn retry_wait(&self, delay: Duration) -> Result<(), QueryError> {
        tokio::select! {
            _ = tokio::time::sleep(delay) => Ok(()),
            options = self.wait_cancelled() => Err(QueryError::cancelled(options)),
        }
    }

    pub async fn run<F>(
        &self,
        mut attempt: F,
        retry: &RetryPolicy,
        retry_delay: &RetryDelay,
        callbacks: &RetryerCallbacks,
    ) -> Result<Value, QueryError>
    where
        F: FnMut() -> BoxFuture<'static, Result<Value, QueryError>>,
    {
        let result = self.run_inner(&mut attempt, retry, retry_delay, callbacks).await;
        self.resolved.store(true, Ordering::SeqCst);
        result
    }

    async fn run_inner<F>(
        &self,
        attempt: &mut F,
        retry: &RetryPolicy,
        retry_delay: &RetryDelay,
        callbacks: &RetryerCallbacks,
    ) -> Result<Value, QueryError>
    where
        F: FnMut() -> BoxFuture<'static, Result<Value, QueryError>>,
    {
        loop {
            if !is_visible_and_online() {
                self.pause(callbacks).await?;
            }

            let outcome = tokio::select! {
                result = attempt() => result,
                options = self.wait_cancelled() => return Err(QueryError::cancelled(options)),
            };

            let error = match outcome {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };

            let failure_count = self.failure_count.fetch_add(1, Ordering::SeqCst) + 1;
            if let Some(on_fail) = &callbacks.on_fail {
                on_fail(failure_count, &error);
            }

            if !retry.should_retry(failure_count, &error) {
                return Err(error);
            }

            let delay = retry_delay.calculate(failure_count - 1);
            tracing::debug!(failure_count, ?delay, "retrying failed attempt");
            self.retry_wait(delay).await?;
        }
    }
}
