//! Run orchestration: extraction, hashing, work selection, summarization
//! and persistence.
//!
//! Everything up to the work plan happens on the calling thread. Only the
//! generation requests are handed to the worker pool; their results are
//! applied to the shared store under one mutex as each unit finishes.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::IndexerConfig;
use crate::errors::{IndexError, IndexResult};
use crate::indexer::filesystem::{collect_sources, compute_content_hash, SourceFile};
use crate::indexer::graph::DependencyGraph;
use crate::indexer::imports::resolve_references;
use crate::indexer::invalidation::{plan_work, FilePlan};
use crate::indexer::symbols::{extract_file, ExtractedFile};
use crate::models::{FileRecord, FileStatus, Provenance, Reference, RunReport, SymbolSummary};
use crate::render::render_logic_tree;
use crate::store::database::Database;
use crate::store::index::{IndexStore, StoreCheckpoint};
use crate::summarize::{
    build_batches, classify, dispatch, request_for, Classification, Completion,
    ResilientSummarizer, RetryPolicy, SummaryRequest, Summarizer, UnitOutcome,
    SMALL_PLACEHOLDER,
};

// ---------------------------------------------------------------------------
// Progress tracking
// ---------------------------------------------------------------------------

struct PendingFile {
    outstanding: usize,
    failed: bool,
    dependency_hash: String,
}

/// Bookkeeping for queued symbols while the pool drains.
struct Progress {
    /// Summary skeletons (fingerprints filled in) keyed by (path, name).
    templates: HashMap<(String, String), SymbolSummary>,
    files: HashMap<String, PendingFile>,
    summarized: usize,
    failed: usize,
    since_checkpoint: usize,
}

impl Progress {
    /// Apply one completion. Returns `true` when a checkpoint is due.
    fn apply(&mut self, completion: Completion, store: &mut IndexStore, every: usize) -> bool {
        let Completion { request, outcome } = completion;
        let key = (request.file_path, request.qualified_name);
        let Some(mut summary) = self.templates.remove(&key) else {
            return false;
        };
        let (path, name) = key;
        let Some(file) = self.files.get_mut(&path) else {
            return false;
        };
        let Some(record) = store.record_mut(&path) else {
            return false;
        };

        match outcome {
            UnitOutcome::Summarized(item) => {
                summary.summary = item.summary;
                summary.source_tag = item.source;
                summary.sink_tag = item.sink;
                record.summaries.insert(name, summary);
                self.summarized += 1;
            }
            UnitOutcome::Failed(e) => {
                debug!("{path}::{name} left without a new summary: {e}");
                file.failed = true;
                self.failed += 1;
            }
        }

        file.outstanding = file.outstanding.saturating_sub(1);
        if file.outstanding == 0 && !file.failed {
            record.mark_fresh(file.dependency_hash.clone(), Utc::now());
            debug!("{path} is fresh");
        }

        self.since_checkpoint += 1;
        if self.since_checkpoint >= every.max(1) {
            self.since_checkpoint = 0;
            return true;
        }
        false
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct IndexEngine<S> {
    config: IndexerConfig,
    summarizer: S,
    db: Database,
    cancel: Arc<AtomicBool>,
}

impl<S: Summarizer> IndexEngine<S> {
    /// Open (or create) the store at `config.store_path`.
    pub fn new(config: IndexerConfig, summarizer: S) -> IndexResult<Self> {
        let db = Database::open(&config.store_path)?;
        Ok(Self::with_database(config, summarizer, db))
    }

    pub fn with_database(config: IndexerConfig, summarizer: S, db: Database) -> Self {
        Self {
            config,
            summarizer,
            db,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn config(&self) -> &IndexerConfig {
        &self.config
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Flag that interrupts the current run when set. Queued work is
    /// abandoned, backoff sleeps end early and in-flight requests finish.
    /// The flag is cleared when a run starts.
    pub fn interrupt_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    pub fn load_store(&self) -> IndexResult<IndexStore> {
        IndexStore::load(&self.db)
    }

    /// Markdown listing of the persisted index.
    pub fn render(&self) -> IndexResult<String> {
        Ok(render_logic_tree(&self.load_store()?, Utc::now()))
    }

    /// Index every accepted Python file under `root`.
    pub fn run_repo<F>(&self, root: &Path, accept: F) -> IndexResult<RunReport>
    where
        F: Fn(&str) -> bool,
    {
        let sources = collect_sources(root, accept);
        self.run(&sources)
    }

    /// Bring the index up to date with `sources`. Stored files missing from
    /// `sources` are removed.
    pub fn run(&self, sources: &[SourceFile]) -> IndexResult<RunReport> {
        self.cancel.store(false, Ordering::SeqCst);
        let store = Mutex::new(IndexStore::load(&self.db)?);
        let guard = StoreCheckpoint::new(&store, &self.db);
        let mut report = RunReport {
            files_scanned: sources.len(),
            ..RunReport::default()
        };

        // -- Extraction ------------------------------------------------------
        let input_paths: BTreeSet<String> = sources.iter().map(|s| s.path.clone()).collect();
        let files = self.extract_all(sources, &store, &mut report);

        // -- References and dependency hashes --------------------------------
        let references: BTreeMap<String, Vec<Reference>> = files
            .iter()
            .map(|f| (f.path.clone(), resolve_references(f, &input_paths)))
            .collect();
        let mut graph =
            DependencyGraph::new(files.iter().map(|f| (f.path.as_str(), f.content_hash.as_str())));
        for file_refs in references.values() {
            graph.add_references(file_refs);
        }
        let resolution = graph.resolve_hashes(self.config.iteration_cap(graph.node_count()));
        debug!(
            "dependency graph: {} files, {} edges, {} passes",
            graph.node_count(),
            graph.edge_count(),
            resolution.iterations
        );

        // -- Work selection --------------------------------------------------
        let plan = {
            let store = store.lock();
            plan_work(&files, &references, &resolution, &store, &input_paths)
        };
        {
            let mut store = store.lock();
            for path in &plan.removed {
                store.remove(path);
                debug!("removed {path} from the index");
            }
        }
        report.files_removed = plan.removed.len();
        report.files_dirty = plan.dirty.len();
        info!(
            "{} files scanned, {} dirty, {} clean, {} removed",
            report.files_scanned,
            report.files_dirty,
            plan.clean.len(),
            report.files_removed
        );

        let mut dirty = plan.dirty;
        dirty.sort_by(|a, b| a.path.cmp(&b.path));
        let (queued, progress) = {
            let mut store = store.lock();
            self.prepare_dirty(dirty, &mut store, &mut report)
        };

        // -- Generation ------------------------------------------------------
        let resilient = ResilientSummarizer::new(
            &self.summarizer,
            RetryPolicy::from_config(&self.config),
            Arc::clone(&self.cancel),
        );
        let batches = build_batches(
            queued,
            self.config.batch_token_budget,
            self.config.max_batch_symbols,
        );
        if !batches.is_empty() {
            info!(
                "summarizing {} symbols in {} batches with {} workers",
                progress.templates.len(),
                batches.len(),
                self.config.max_concurrency
            );
        }

        let progress = Mutex::new(progress);
        let checkpoint_every = self.config.checkpoint_every;
        dispatch(batches, &resilient, self.config.max_concurrency, |completions| {
            let due = {
                let mut progress = progress.lock();
                let mut store = store.lock();
                let mut due = false;
                for completion in completions {
                    due |= progress.apply(completion, &mut store, checkpoint_every);
                }
                due
            };
            if due {
                if let Err(e) = guard.checkpoint() {
                    warn!("checkpoint failed: {e}");
                }
            }
        });

        // -- Wrap-up ---------------------------------------------------------
        let progress = progress.into_inner();
        report.summarized = progress.summarized;
        report.failed = progress.failed;
        report.requests = resilient.request_count();
        report.interrupted = self.cancel.load(Ordering::SeqCst);
        report.left_stale = store
            .lock()
            .entries()
            .filter(|(_, r)| r.status == FileStatus::Stale)
            .count();

        if let Some(kind) = resilient.breaker().tripped_kind() {
            guard.commit()?;
            warn!(
                "run halted: {kind}; {} files left stale",
                report.left_stale
            );
            return Err(IndexError::FatalService {
                kind,
                report: Box::new(report),
            });
        }

        guard.commit()?;
        self.db.set_repo_meta("last_updated", &Utc::now().to_rfc3339())?;
        self.db.set_repo_meta("model", resilient.model_name())?;
        if report.interrupted {
            warn!("run interrupted; {} files left stale", report.left_stale);
        }
        info!(
            "summarized {}, doc {}, skipped {}, reused {}, failed {}, stale {}, requests {}",
            report.summarized,
            report.doc_extracted,
            report.skipped_trivial,
            report.reused,
            report.failed,
            report.left_stale,
            report.requests
        );
        Ok(report)
    }

    /// Extract every source. Files that fail to parse are marked stale and
    /// keep their previous summaries.
    fn extract_all(
        &self,
        sources: &[SourceFile],
        store: &Mutex<IndexStore>,
        report: &mut RunReport,
    ) -> Vec<ExtractedFile> {
        let mut files = Vec::with_capacity(sources.len());
        for source in sources {
            match extract_file(source) {
                Ok(file) => files.push(file),
                Err(failure) => {
                    warn!("skipping unparseable file {failure}");
                    report.parse_failures += 1;
                    let content_hash = compute_content_hash(&source.text);
                    let mut store = store.lock();
                    match store.record_mut(&source.path) {
                        Some(record) => {
                            record.content_hash = content_hash;
                            record.mark_stale();
                        }
                        None => store.upsert(FileRecord::new(&source.path, content_hash)),
                    }
                }
            }
        }
        files
    }

    /// Classify the symbols of dirty files. Local results are written
    /// straight into the store; the rest become requests.
    fn prepare_dirty(
        &self,
        dirty: Vec<FilePlan>,
        store: &mut IndexStore,
        report: &mut RunReport,
    ) -> (Vec<SummaryRequest>, Progress) {
        let mut queued = Vec::new();
        let mut progress = Progress {
            templates: HashMap::new(),
            files: HashMap::new(),
            summarized: 0,
            failed: 0,
            since_checkpoint: 0,
        };

        for file in dirty {
            debug!("{} is dirty ({})", file.path, file.reason.as_str());
            if store.get(&file.path).is_none() {
                store.upsert(FileRecord::new(&file.path, &file.content_hash));
            }
            let Some(record) = store.record_mut(&file.path) else {
                continue;
            };
            record.content_hash = file.content_hash.clone();
            record.mark_stale();
            let live: BTreeSet<&str> = file
                .symbols
                .iter()
                .map(|p| p.symbol.qualified_name.as_str())
                .collect();
            record.summaries.retain(|name, _| live.contains(name.as_str()));

            let mut outstanding = 0;
            for plan in &file.symbols {
                let symbol = &plan.symbol;
                let mut summary = SymbolSummary {
                    qualified_name: symbol.qualified_name.clone(),
                    kind: symbol.kind,
                    start_line: symbol.start_line,
                    signature: symbol.signature(),
                    summary: String::new(),
                    provenance: Provenance::Generated,
                    source_tag: None,
                    sink_tag: None,
                    slice_hash: plan.slice_hash.clone(),
                    upstream_hash: plan.upstream_hash.clone(),
                };

                match classify(symbol, &self.config) {
                    Classification::DocExtracted(text) => {
                        summary.summary = text;
                        summary.provenance = Provenance::LiteralDoc;
                        record.summaries.insert(symbol.qualified_name.clone(), summary);
                        report.doc_extracted += 1;
                    }
                    Classification::Skipped => {
                        summary.summary = SMALL_PLACEHOLDER.to_string();
                        summary.provenance = Provenance::TrivialSkip;
                        record.summaries.insert(symbol.qualified_name.clone(), summary);
                        report.skipped_trivial += 1;
                    }
                    Classification::QueuedForGeneration => {
                        let existing = record
                            .summaries
                            .get_mut(&symbol.qualified_name)
                            .filter(|s| plan.reusable && s.provenance == Provenance::Generated);
                        if let Some(existing) = existing {
                            existing.kind = symbol.kind;
                            existing.start_line = symbol.start_line;
                            existing.signature = summary.signature;
                            report.reused += 1;
                            continue;
                        }
                        queued.push(request_for(symbol));
                        progress
                            .templates
                            .insert((file.path.clone(), symbol.qualified_name.clone()), summary);
                        outstanding += 1;
                    }
                }
            }

            if outstanding == 0 {
                record.mark_fresh(file.dependency_hash, Utc::now());
            } else {
                progress.files.insert(
                    file.path,
                    PendingFile {
                        outstanding,
                        failed: false,
                        dependency_hash: file.dependency_hash,
                    },
                );
            }
        }
        (queued, progress)
    }
}
