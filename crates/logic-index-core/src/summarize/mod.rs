//! Symbol classification and dispatch of generation work.
//!
//! Every symbol of a dirty file goes through [`classify`]. Documented and
//! trivial symbols are answered locally; the rest become
//! [`SummaryRequest`]s, are packed into [`Batch`]es and handed to
//! [`dispatch`], which drains them on a bounded worker pool.

pub mod batching;
pub mod client;
pub mod resilience;

use std::collections::VecDeque;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::config::IndexerConfig;
use crate::models::Symbol;

pub use batching::{build_batches, Batch};
pub use client::{
    BatchResponse, FatalKind, GeminiSummarizer, ServiceError, SummaryItem, SummaryRequest,
    Summarizer,
};
pub use resilience::{CircuitBreaker, ClassifiedError, ResilientSummarizer, RetryPolicy};

pub const DOC_PREFIX: &str = "[Doc] ";
pub const SMALL_PLACEHOLDER: &str = "Small utility function.";

const DOC_SUMMARY_LINES: usize = 3;

// ---------------------------------------------------------------------------
// Classification
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Classification {
    /// Summary taken from the symbol's own documentation.
    DocExtracted(String),
    /// Short and unremarkable; gets [`SMALL_PLACEHOLDER`].
    Skipped,
    QueuedForGeneration,
}

/// `"[Doc] "` followed by the first non-empty documentation lines.
pub fn doc_summary(docstring: &str) -> Option<String> {
    let lines: Vec<&str> = docstring
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .take(DOC_SUMMARY_LINES)
        .collect();
    if lines.is_empty() {
        return None;
    }
    Some(format!("{DOC_PREFIX}{}", lines.join(" ")))
}

pub fn classify(symbol: &Symbol, config: &IndexerConfig) -> Classification {
    if let Some(summary) = symbol.docstring.as_deref().and_then(doc_summary) {
        return Classification::DocExtracted(summary);
    }
    if config.filter_small
        && symbol.line_count < config.small_line_threshold
        && symbol.markers.is_empty()
    {
        return Classification::Skipped;
    }
    Classification::QueuedForGeneration
}

pub fn request_for(symbol: &Symbol) -> SummaryRequest {
    SummaryRequest {
        id: 0,
        file_path: symbol.file_path.clone(),
        qualified_name: symbol.qualified_name.clone(),
        kind: symbol.kind,
        signature: symbol.signature(),
        source: symbol.source.clone(),
        hint: symbol.complexity_hint(),
        markers: symbol.markers,
    }
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UnitOutcome {
    Summarized(SummaryItem),
    Failed(ClassifiedError),
}

/// Final outcome for one symbol. Work abandoned because of an interrupt or
/// an open breaker produces no completion.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Completion {
    pub request: SummaryRequest,
    pub outcome: UnitOutcome,
}

fn should_stop<S: Summarizer>(summarizer: &ResilientSummarizer<S>) -> bool {
    summarizer.breaker().is_open() || summarizer.is_cancelled()
}

/// Resubmit every request of a failed batch on its own.
fn run_individually<S, F>(batch: &Batch, summarizer: &ResilientSummarizer<S>, sink: &F)
where
    S: Summarizer,
    F: Fn(Vec<Completion>) + Sync,
{
    for request in &batch.requests {
        if should_stop(summarizer) {
            return;
        }
        let outcome = match summarizer.execute(&Batch::single(request)) {
            Ok(items) => match items.into_iter().next() {
                Some(item) => UnitOutcome::Summarized(item),
                None => UnitOutcome::Failed(ClassifiedError::Malformed("empty reply".into())),
            },
            Err(ClassifiedError::CircuitOpen | ClassifiedError::Interrupted) => return,
            Err(e) => {
                warn!("failed to summarize {}::{}: {e}", request.file_path, request.qualified_name);
                UnitOutcome::Failed(e)
            }
        };
        sink(vec![Completion {
            request: request.clone(),
            outcome,
        }]);
    }
}

fn run_batch<S, F>(batch: Batch, summarizer: &ResilientSummarizer<S>, sink: &F)
where
    S: Summarizer,
    F: Fn(Vec<Completion>) + Sync,
{
    match summarizer.execute(&batch) {
        Ok(items) => {
            let completions = batch
                .requests
                .into_iter()
                .zip(items)
                .map(|(request, item)| Completion {
                    request,
                    outcome: UnitOutcome::Summarized(item),
                })
                .collect();
            sink(completions);
        }
        Err(e @ (ClassifiedError::Malformed(_) | ClassifiedError::Truncated)) if batch.len() > 1 => {
            warn!(
                "batch of {} symbols unusable ({e}), falling back to individual requests",
                batch.len()
            );
            run_individually(&batch, summarizer, sink);
        }
        Err(ClassifiedError::CircuitOpen | ClassifiedError::Interrupted) => {
            debug!("abandoning batch of {} symbols", batch.len());
        }
        Err(e) => {
            warn!("batch of {} symbols failed: {e}", batch.len());
            let completions = batch
                .requests
                .into_iter()
                .map(|request| Completion {
                    request,
                    outcome: UnitOutcome::Failed(e.clone()),
                })
                .collect();
            sink(completions);
        }
    }
}

fn worker_loop<S, F>(queue: &Mutex<VecDeque<Batch>>, summarizer: &ResilientSummarizer<S>, sink: &F)
where
    S: Summarizer,
    F: Fn(Vec<Completion>) + Sync,
{
    loop {
        if should_stop(summarizer) {
            return;
        }
        let Some(batch) = queue.lock().pop_front() else {
            return;
        };
        run_batch(batch, summarizer, sink);
    }
}

/// Drain `batches` with up to `workers` threads. `sink` receives every
/// completion as soon as its unit finishes. New dispatch stops once the
/// breaker opens or the run is interrupted; in-flight units finish.
pub fn dispatch<S, F>(
    batches: Vec<Batch>,
    summarizer: &ResilientSummarizer<S>,
    workers: usize,
    sink: F,
) where
    S: Summarizer,
    F: Fn(Vec<Completion>) + Sync,
{
    if batches.is_empty() {
        return;
    }
    let workers = workers.max(1).min(batches.len());
    let queue = Mutex::new(VecDeque::from(batches));

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(workers)
        .thread_name(|i| format!("logic-index-summarize-{i}"))
        .build();

    match pool {
        Ok(pool) => pool.scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|_| worker_loop(&queue, summarizer, &sink));
            }
        }),
        Err(e) => {
            warn!("failed to build worker pool ({e}), summarizing sequentially");
            worker_loop(&queue, summarizer, &sink);
        }
    }

    let abandoned = queue.lock().len();
    if abandoned > 0 {
        debug!("{abandoned} batches left undispatched");
    }
}
