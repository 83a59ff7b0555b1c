//! End-to-end runs against a scripted summarizer and a temporary store.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;

use logic_index_core::store::database::Database;
use logic_index_core::{
    BatchResponse, FatalKind, FileStatus, IndexEngine, IndexError, IndexerConfig, Provenance,
    ServiceError, SourceFile, SummaryItem, SummaryRequest, Summarizer,
};

// ---------------------------------------------------------------------------
// Scripted summarizer
// ---------------------------------------------------------------------------

#[derive(Clone, Copy)]
enum Behavior {
    Echo,
    /// Multi-symbol requests get an unparseable reply.
    MalformedBatches,
    FailAuth,
}

struct Scripted {
    behavior: Behavior,
    calls: Mutex<Vec<Vec<String>>>,
    /// Raise the flag once this many calls have been made.
    interrupt_after: OnceLock<(Arc<AtomicBool>, usize)>,
}

impl Scripted {
    fn new(behavior: Behavior) -> Self {
        Self {
            behavior,
            calls: Mutex::new(Vec::new()),
            interrupt_after: OnceLock::new(),
        }
    }

    fn interrupt_after(&self, flag: Arc<AtomicBool>, calls: usize) {
        let _ = self.interrupt_after.set((flag, calls));
    }

    fn calls(&self) -> Vec<Vec<String>> {
        self.calls.lock().clone()
    }

    fn requested(&self) -> Vec<String> {
        let mut names: Vec<String> = self.calls().into_iter().flatten().collect();
        names.sort();
        names
    }
}

impl Summarizer for Scripted {
    fn summarize(&self, batch: &[SummaryRequest]) -> Result<BatchResponse, ServiceError> {
        let made = {
            let mut calls = self.calls.lock();
            calls.push(batch.iter().map(|r| r.qualified_name.clone()).collect());
            calls.len()
        };
        if let Some((flag, after)) = self.interrupt_after.get() {
            if made >= *after {
                flag.store(true, Ordering::SeqCst);
            }
        }

        match self.behavior {
            Behavior::FailAuth => Err(ServiceError::Fatal {
                kind: FatalKind::Authentication,
                message: "API key not valid".into(),
            }),
            Behavior::MalformedBatches if batch.len() > 1 => {
                Err(ServiceError::Malformed("not JSON".into()))
            }
            _ => Ok(BatchResponse::Complete(
                batch
                    .iter()
                    .map(|r| SummaryItem {
                        id: r.id,
                        summary: format!("Summary of {}.", r.qualified_name),
                        source: Some("args".into()),
                        sink: None,
                    })
                    .collect(),
            )),
        }
    }

    fn model_name(&self) -> &str {
        "scripted"
    }
}

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

fn config() -> IndexerConfig {
    IndexerConfig {
        max_concurrency: 1,
        backoff_base_ms: 0,
        backoff_max_ms: 0,
        ..IndexerConfig::default()
    }
}

fn open_db(dir: &tempfile::TempDir) -> Database {
    Database::open(dir.path().join("index.db")).unwrap()
}

/// A three-line function body, so it is never filtered as small.
fn function(name: &str, body: &str) -> String {
    format!("def {name}(value):\n    result = {body}\n    return result\n\n\n")
}

fn upstream(y_factor: u32, x_factor: u32) -> SourceFile {
    let text = format!(
        "{}{}",
        function("x", &format!("value * {x_factor}")),
        function("y", &format!("value * {y_factor}"))
    );
    SourceFile::new("a.py", text)
}

fn downstream() -> SourceFile {
    let text = format!(
        "from a import x\n\n\n{}{}",
        function("use_x", "x(value)"),
        function("other", "value + 10")
    );
    SourceFile::new("b.py", text)
}

fn many_functions(path: &str, count: usize) -> SourceFile {
    let text: String = (0..count)
        .map(|i| function(&format!("f{i}"), &format!("value + {i}")))
        .collect();
    SourceFile::new(path, text)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[test]
fn second_run_without_changes_makes_no_requests() {
    let dir = tempfile::tempdir().unwrap();
    let fake = Scripted::new(Behavior::Echo);
    let engine = IndexEngine::with_database(config(), &fake, open_db(&dir));
    let sources = vec![upstream(2, 3), downstream()];

    let first = engine.run(&sources).unwrap();
    assert_eq!(first.summarized, 4);
    assert_eq!(first.requests, 1);
    assert_eq!(first.left_stale, 0);

    let second = engine.run(&sources).unwrap();
    assert_eq!(second.files_dirty, 0);
    assert_eq!(second.requests, 0);
    assert_eq!(second.summarized, 0);
    assert_eq!(fake.calls().len(), 1);

    let store = engine.load_store().unwrap();
    let b = store.get("b.py").unwrap();
    assert_eq!(b.status, FileStatus::Fresh);
    assert_eq!(b.summaries["use_x"].summary, "Summary of use_x.");
    assert_eq!(b.summaries["use_x"].source_tag.as_deref(), Some("args"));
    assert_eq!(
        engine.database().get_repo_meta("model").unwrap().as_deref(),
        Some("scripted")
    );
}

#[test]
fn unrelated_upstream_change_regenerates_nothing_downstream() {
    let dir = tempfile::tempdir().unwrap();
    let db = open_db(&dir);

    let seed = Scripted::new(Behavior::Echo);
    IndexEngine::with_database(config(), &seed, db.clone())
        .run(&[upstream(2, 3), downstream()])
        .unwrap();

    // y changes; b only uses x.
    let fake = Scripted::new(Behavior::Echo);
    let report = IndexEngine::with_database(config(), &fake, db.clone())
        .run(&[upstream(5, 3), downstream()])
        .unwrap();
    assert_eq!(report.files_dirty, 2);
    assert_eq!(fake.requested(), vec!["y"]);
    assert_eq!(report.reused, 3);

    // x changes; use_x follows it, other does not.
    let fake = Scripted::new(Behavior::Echo);
    IndexEngine::with_database(config(), &fake, db)
        .run(&[upstream(5, 7), downstream()])
        .unwrap();
    assert_eq!(fake.requested(), vec!["use_x", "x"]);
}

#[test]
fn upstream_change_reaches_indirect_consumers() {
    let dir = tempfile::tempdir().unwrap();
    let db = open_db(&dir);
    let base = |factor: u32| SourceFile::new("c.py", function("z", &format!("value * {factor}")));
    let middle = SourceFile::new(
        "a.py",
        format!("from c import z\n\n\n{}", function("x", "z(value)")),
    );
    let top = SourceFile::new(
        "b.py",
        format!("from a import x\n\n\n{}", function("use_x", "x(value)")),
    );

    let seed = Scripted::new(Behavior::Echo);
    IndexEngine::with_database(config(), &seed, db.clone())
        .run(&[base(1), middle.clone(), top.clone()])
        .unwrap();

    let fake = Scripted::new(Behavior::Echo);
    let report = IndexEngine::with_database(config(), &fake, db)
        .run(&[base(2), middle, top])
        .unwrap();
    assert_eq!(report.files_dirty, 3);
    assert_eq!(fake.requested(), vec!["use_x", "x", "z"]);
    assert_eq!(report.reused, 0);
}

#[test]
fn property_getter_and_setter_are_indexed_separately() {
    let dir = tempfile::tempdir().unwrap();
    let db = open_db(&dir);
    let cfg = IndexerConfig {
        filter_small: false,
        ..config()
    };
    let cell = |getter: &str| {
        SourceFile::new(
            "cell.py",
            format!(
                "class Cell:\n    @property\n    def value(self):\n        return {getter}\n\n    \
                 @value.setter\n    def value(self, new):\n        self._value = new\n"
            ),
        )
    };

    let first = Scripted::new(Behavior::Echo);
    let engine = IndexEngine::with_database(cfg.clone(), &first, db.clone());
    let report = engine.run(&[cell("self._value")]).unwrap();
    assert_eq!(report.summarized, 3);
    assert_eq!(report.failed, 0);
    assert_eq!(report.left_stale, 0);

    let store = engine.load_store().unwrap();
    let record = store.get("cell.py").unwrap();
    assert_eq!(record.status, FileStatus::Fresh);
    assert_eq!(record.summaries["Cell.value"].summary, "Summary of Cell.value.");
    assert_eq!(
        record.summaries["Cell.value#2"].summary,
        "Summary of Cell.value#2."
    );

    // Only the getter (and the class around it) changed.
    let second = Scripted::new(Behavior::Echo);
    let report = IndexEngine::with_database(cfg, &second, db)
        .run(&[cell("self._value * 2")])
        .unwrap();
    assert_eq!(second.requested(), vec!["Cell", "Cell.value"]);
    assert_eq!(report.reused, 1);
    assert_eq!(report.left_stale, 0);
}

#[test]
fn malformed_batch_falls_back_to_single_requests() {
    let dir = tempfile::tempdir().unwrap();
    let fake = Scripted::new(Behavior::MalformedBatches);
    let engine = IndexEngine::with_database(config(), &fake, open_db(&dir));

    let report = engine.run(&[many_functions("m.py", 5)]).unwrap();
    let calls = fake.calls();
    assert_eq!(calls.len(), 6);
    assert_eq!(calls[0].len(), 5);
    assert!(calls[1..].iter().all(|c| c.len() == 1));
    assert_eq!(report.summarized, 5);
    assert_eq!(report.failed, 0);

    let store = engine.load_store().unwrap();
    let record = store.get("m.py").unwrap();
    assert_eq!(record.status, FileStatus::Fresh);
    assert_eq!(record.summaries.len(), 5);
    assert!(record
        .summaries
        .values()
        .all(|s| s.provenance == Provenance::Generated));
}

#[test]
fn documented_and_small_symbols_never_reach_the_summarizer() {
    let dir = tempfile::tempdir().unwrap();
    let fake = Scripted::new(Behavior::Echo);
    let engine = IndexEngine::with_database(config(), &fake, open_db(&dir));
    let text = "\"\"\"Helpers for parsing.\"\"\"\n\n\
                def parse(text):\n    \"\"\"Parse the text.\n\n    Returns tokens.\n    \"\"\"\n    \
                tokens = text.split()\n    cleaned = [t.strip() for t in tokens]\n    return cleaned\n\n\n\
                def ident(v):\n    return v\n";

    let report = engine.run(&[SourceFile::new("p.py", text)]).unwrap();
    assert!(fake.calls().is_empty());
    assert_eq!(report.requests, 0);
    assert_eq!(report.doc_extracted, 2);
    assert_eq!(report.skipped_trivial, 1);

    let store = engine.load_store().unwrap();
    let record = store.get("p.py").unwrap();
    assert_eq!(record.status, FileStatus::Fresh);
    assert_eq!(
        record.summaries["parse"].summary,
        "[Doc] Parse the text. Returns tokens."
    );
    assert_eq!(record.summaries["parse"].provenance, Provenance::LiteralDoc);
    assert_eq!(
        record.summaries["<module>"].summary,
        "[Doc] Helpers for parsing."
    );
    assert_eq!(record.summaries["ident"].summary, "Small utility function.");
    assert_eq!(record.summaries["ident"].provenance, Provenance::TrivialSkip);
}

#[test]
fn mutually_importing_files_converge() {
    let dir = tempfile::tempdir().unwrap();
    let fake = Scripted::new(Behavior::Echo);
    let engine = IndexEngine::with_database(config(), &fake, open_db(&dir));
    let p = SourceFile::new(
        "p.py",
        format!("from q import qf\n\n\n{}", function("pf", "qf(value)")),
    );
    let q = SourceFile::new(
        "q.py",
        format!("from p import pf\n\n\n{}", function("qf", "pf(value)")),
    );

    let first = engine.run(&[p.clone(), q.clone()]).unwrap();
    assert_eq!(first.left_stale, 0);
    assert_eq!(first.summarized, 2);

    let second = engine.run(&[p, q]).unwrap();
    assert_eq!(second.files_dirty, 0);
    assert_eq!(second.requests, 0);

    let store = engine.load_store().unwrap();
    assert_eq!(
        store.get("p.py").unwrap().dependency_hash,
        store.get("q.py").unwrap().dependency_hash
    );
}

#[test]
fn interrupted_run_resumes_with_remaining_symbols() {
    let dir = tempfile::tempdir().unwrap();
    let db = open_db(&dir);
    let cfg = IndexerConfig {
        max_batch_symbols: 1,
        ..config()
    };
    let sources = [many_functions("m.py", 5)];

    let first = Scripted::new(Behavior::Echo);
    let engine = IndexEngine::with_database(cfg.clone(), &first, db.clone());
    first.interrupt_after(engine.interrupt_handle(), 2);
    let report = engine.run(&sources).unwrap();
    assert!(report.interrupted);
    assert_eq!(report.requests, 2);
    assert_eq!(report.summarized, 2);
    assert_eq!(report.left_stale, 1);

    let store = engine.load_store().unwrap();
    let record = store.get("m.py").unwrap();
    assert_eq!(record.status, FileStatus::Stale);
    assert_eq!(record.summaries.len(), 2);

    let second = Scripted::new(Behavior::Echo);
    let report = IndexEngine::with_database(cfg, &second, db)
        .run(&sources)
        .unwrap();
    assert!(!report.interrupted);
    assert_eq!(report.requests, 3);
    assert_eq!(report.reused, 2);
    assert_eq!(second.requested(), vec!["f2", "f3", "f4"]);
    assert_eq!(report.left_stale, 0);
}

#[test]
fn auth_failure_stops_after_first_request() {
    let dir = tempfile::tempdir().unwrap();
    let fake = Scripted::new(Behavior::FailAuth);
    let cfg = IndexerConfig {
        max_batch_symbols: 1,
        ..config()
    };
    let engine = IndexEngine::with_database(cfg, &fake, open_db(&dir));

    let err = engine.run(&[many_functions("m.py", 3)]).unwrap_err();
    match err {
        IndexError::FatalService { kind, report } => {
            assert_eq!(kind, FatalKind::Authentication);
            assert_eq!(report.requests, 1);
            assert_eq!(report.left_stale, 1);
        }
        other => panic!("expected FatalService, got {other}"),
    }
    assert_eq!(fake.calls().len(), 1);

    // The partial state was flushed before returning.
    let store = engine.load_store().unwrap();
    assert_eq!(store.get("m.py").unwrap().status, FileStatus::Stale);
}

#[test]
fn parse_failure_keeps_previous_summaries() {
    let dir = tempfile::tempdir().unwrap();
    let fake = Scripted::new(Behavior::Echo);
    let engine = IndexEngine::with_database(config(), &fake, open_db(&dir));
    engine.run(&[many_functions("m.py", 1)]).unwrap();

    let broken = SourceFile::new("m.py", "def f0(value:\n    return value\n");
    let other = many_functions("n.py", 1);
    let report = engine.run(&[broken, other]).unwrap();
    assert_eq!(report.parse_failures, 1);
    assert_eq!(report.summarized, 1);

    let store = engine.load_store().unwrap();
    let record = store.get("m.py").unwrap();
    assert_eq!(record.status, FileStatus::Stale);
    assert_eq!(record.summaries["f0"].summary, "Summary of f0.");
    assert_eq!(store.get("n.py").unwrap().status, FileStatus::Fresh);
}

#[test]
fn files_missing_from_input_are_removed() {
    let dir = tempfile::tempdir().unwrap();
    let fake = Scripted::new(Behavior::Echo);
    let engine = IndexEngine::with_database(config(), &fake, open_db(&dir));
    engine.run(&[upstream(2, 3), downstream()]).unwrap();

    let report = engine.run(&[upstream(2, 3)]).unwrap();
    assert_eq!(report.files_removed, 1);
    assert_eq!(report.requests, 0);

    let store = engine.load_store().unwrap();
    assert!(store.get("b.py").is_none());
    assert_eq!(store.len(), 1);
}

#[test]
fn repository_walk_and_listing() {
    let repo = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(repo.path().join("pkg")).unwrap();
    std::fs::create_dir_all(repo.path().join("build")).unwrap();
    std::fs::write(repo.path().join("pkg/a.py"), upstream(2, 3).text).unwrap();
    std::fs::write(repo.path().join("build/gen.py"), many_functions("g", 2).text).unwrap();

    let store_dir = tempfile::tempdir().unwrap();
    let fake = Scripted::new(Behavior::Echo);
    let engine = IndexEngine::with_database(config(), &fake, open_db(&store_dir));
    let report = engine
        .run_repo(repo.path(), |path| !path.starts_with("build/"))
        .unwrap();
    assert_eq!(report.files_scanned, 1);

    let listing = engine.render().unwrap();
    assert!(listing.starts_with("# 🧠 逻辑索引 (Logic Index)\n> Last Updated: "));
    assert!(listing.contains("## 📄 `pkg/a.py`"));
    assert!(listing.contains("- **[f]** `x(value)`: Summary of x. (source: args)"));
    assert!(!listing.contains("gen.py"));
}
