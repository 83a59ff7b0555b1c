//! Retry, backoff and circuit breaking around a [`Summarizer`].
//!
//! [`ResilientSummarizer::execute`] is the only way the pipeline talks to the
//! service. It knows nothing about batching: it takes one unit, retries it
//! according to the [`RetryPolicy`], and classifies the outcome.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use rand::Rng;
use tracing::{debug, warn};

use crate::config::IndexerConfig;
use crate::summarize::batching::Batch;
use crate::summarize::client::{BatchResponse, FatalKind, ServiceError, SummaryItem, Summarizer};

const SLEEP_SLICE: Duration = Duration::from_millis(50);

/// Outcome of a unit that did not produce summaries.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ClassifiedError {
    #[error("reply truncated on every attempt")]
    Truncated,

    #[error("malformed reply: {0}")]
    Malformed(String),

    #[error("transient failures exhausted the retry limit: {0}")]
    TransientExhausted(String),

    #[error("request rejected with status {status}: {message}")]
    Rejected { status: u16, message: String },

    #[error("fatal service failure: {0}")]
    Fatal(FatalKind),

    #[error("circuit breaker is open")]
    CircuitOpen,

    #[error("interrupted")]
    Interrupted,
}

// ---------------------------------------------------------------------------
// Circuit breaker
// ---------------------------------------------------------------------------

/// Trips once and stays open for the rest of the run.
#[derive(Debug, Default)]
pub struct CircuitBreaker {
    tripped: OnceLock<FatalKind>,
}

impl CircuitBreaker {
    /// Open the breaker. Only the first trip's kind is kept.
    pub fn trip(&self, kind: FatalKind) {
        if self.tripped.set(kind).is_ok() {
            warn!("circuit breaker opened: {kind}");
        }
    }

    pub fn is_open(&self) -> bool {
        self.tripped.get().is_some()
    }

    pub fn tripped_kind(&self) -> Option<FatalKind> {
        self.tripped.get().copied()
    }
}

// ---------------------------------------------------------------------------
// Retry policy
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    /// Attempts after the first one.
    pub retry_limit: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Add up to 30% of `base_delay` of random delay.
    pub jitter: bool,
}

impl RetryPolicy {
    pub fn from_config(config: &IndexerConfig) -> Self {
        Self {
            retry_limit: config.retry_limit,
            base_delay: Duration::from_millis(config.backoff_base_ms),
            max_delay: Duration::from_millis(config.backoff_max_ms),
            jitter: true,
        }
    }

    pub fn max_attempts(&self) -> usize {
        self.retry_limit + 1
    }

    /// Delay before the retry that follows failed attempt `attempt` (1-based).
    pub fn delay_for(&self, attempt: usize) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16) as u32;
        let mut delay = self.base_delay.saturating_mul(2u32.pow(exponent));
        if delay > self.max_delay {
            delay = self.max_delay;
        }
        let jitter_ceiling = self.base_delay.as_millis() as u64 * 3 / 10;
        if self.jitter && jitter_ceiling > 0 {
            let mut rng = rand::thread_rng();
            delay += Duration::from_millis(rng.gen_range(0..=jitter_ceiling));
        }
        delay
    }
}

// ---------------------------------------------------------------------------
// Resilient summarizer
// ---------------------------------------------------------------------------

pub struct ResilientSummarizer<S> {
    inner: S,
    policy: RetryPolicy,
    breaker: CircuitBreaker,
    cancel: Arc<AtomicBool>,
    requests: AtomicUsize,
}

impl<S: Summarizer> ResilientSummarizer<S> {
    pub fn new(inner: S, policy: RetryPolicy, cancel: Arc<AtomicBool>) -> Self {
        Self {
            inner,
            policy,
            breaker: CircuitBreaker::default(),
            cancel,
            requests: AtomicUsize::new(0),
        }
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    /// Requests issued to the service so far, retries included.
    pub fn request_count(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    pub fn model_name(&self) -> &str {
        self.inner.model_name()
    }

    /// Run one unit to completion. On success the items are in request
    /// order and cover every request id exactly once.
    pub fn execute(&self, batch: &Batch) -> Result<Vec<SummaryItem>, ClassifiedError> {
        let max_attempts = self.policy.max_attempts();
        let mut attempt = 0;

        loop {
            attempt += 1;
            if self.breaker.is_open() {
                return Err(ClassifiedError::CircuitOpen);
            }
            if self.is_cancelled() {
                return Err(ClassifiedError::Interrupted);
            }

            self.requests.fetch_add(1, Ordering::SeqCst);
            match self.inner.summarize(&batch.requests) {
                Ok(BatchResponse::Complete(items)) => return check_items(batch, items),
                Ok(BatchResponse::Truncated) => {
                    if attempt >= max_attempts {
                        return Err(ClassifiedError::Truncated);
                    }
                    debug!(
                        "truncated reply for {} symbols, attempt {attempt}/{max_attempts}",
                        batch.len()
                    );
                }
                Err(ServiceError::Transient(message)) => {
                    if attempt >= max_attempts {
                        return Err(ClassifiedError::TransientExhausted(message));
                    }
                    let delay = self.policy.delay_for(attempt);
                    warn!(
                        "transient failure ({message}), retrying in {delay:?} \
                         (attempt {attempt}/{max_attempts})"
                    );
                    if !self.sleep(delay) {
                        return Err(ClassifiedError::Interrupted);
                    }
                }
                Err(ServiceError::Fatal { kind, message }) => {
                    warn!("fatal service failure: {message}");
                    self.breaker.trip(kind);
                    return Err(ClassifiedError::Fatal(kind));
                }
                Err(ServiceError::Malformed(message)) => {
                    return Err(ClassifiedError::Malformed(message));
                }
                Err(ServiceError::Rejected { status, message }) => {
                    return Err(ClassifiedError::Rejected { status, message });
                }
            }
        }
    }

    /// Sleep in short slices. Returns `false` if the run was interrupted or
    /// the breaker opened meanwhile.
    fn sleep(&self, delay: Duration) -> bool {
        let deadline = Instant::now() + delay;
        loop {
            if self.is_cancelled() || self.breaker.is_open() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            std::thread::sleep(SLEEP_SLICE.min(deadline - now));
        }
    }
}

/// The reply must answer every request exactly once.
fn check_items(
    batch: &Batch,
    mut items: Vec<SummaryItem>,
) -> Result<Vec<SummaryItem>, ClassifiedError> {
    let expected: BTreeSet<usize> = batch.requests.iter().map(|r| r.id).collect();
    let returned: BTreeSet<usize> = items.iter().map(|i| i.id).collect();
    if items.len() != batch.len() || returned != expected {
        return Err(ClassifiedError::Malformed(format!(
            "expected ids {expected:?}, got {:?}",
            items.iter().map(|i| i.id).collect::<Vec<_>>()
        )));
    }
    items.sort_by_key(|i| i.id);
    Ok(items)
}
