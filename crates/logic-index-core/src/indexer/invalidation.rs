//! Work selection: which files and symbols need new summaries.
//!
//! A file is dirty when its stored dependency hash differs from the fresh
//! one (or was never committed). Inside a dirty file a symbol keeps its
//! summary when both its own slice hash and its upstream fingerprint are
//! unchanged. The upstream fingerprint covers the imported symbols the
//! symbol itself mentions and, transitively, what those symbols use, so
//! edits to unrelated parts of an upstream file leave it alone.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use crate::indexer::filesystem::{hash_entries, slice_hash};
use crate::indexer::graph::HashResolution;
use crate::indexer::symbols::ExtractedFile;
use crate::models::{FileRecord, Reference, Symbol, MODULE_SYMBOL, WILDCARD_SYMBOL};
use crate::store::index::IndexStore;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DirtyReason {
    /// No stored record.
    New,
    /// A previous run did not finish every symbol of the file.
    Incomplete,
    /// The file or something it uses changed.
    DependencyChanged,
    /// Part of a cluster whose hashes did not settle within the cap.
    Unresolved,
}

impl DirtyReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DirtyReason::New => "new",
            DirtyReason::Incomplete => "incomplete",
            DirtyReason::DependencyChanged => "dependency-changed",
            DirtyReason::Unresolved => "unresolved",
        }
    }
}

/// A symbol of a dirty file with its current fingerprints.
#[derive(Clone, Debug)]
pub struct SymbolPlan {
    pub symbol: Symbol,
    pub slice_hash: String,
    pub upstream_hash: String,
    /// Stored summary matches both fingerprints.
    pub reusable: bool,
}

#[derive(Clone, Debug)]
pub struct FilePlan {
    pub path: String,
    pub content_hash: String,
    pub dependency_hash: String,
    pub reason: DirtyReason,
    pub symbols: Vec<SymbolPlan>,
}

#[derive(Clone, Debug, Default)]
pub struct WorkPlan {
    pub dirty: Vec<FilePlan>,
    pub clean: Vec<String>,
    /// Stored paths that are no longer part of the input.
    pub removed: Vec<String>,
}

/// Decide whether a file needs re-summarization. `None` means clean.
pub fn file_decision(
    record: Option<&FileRecord>,
    fresh_dependency_hash: &str,
    unresolved: bool,
) -> Option<DirtyReason> {
    let Some(record) = record else {
        return Some(DirtyReason::New);
    };
    if unresolved {
        return Some(DirtyReason::Unresolved);
    }
    match &record.dependency_hash {
        None => Some(DirtyReason::Incomplete),
        Some(stored) if stored != fresh_dependency_hash => Some(DirtyReason::DependencyChanged),
        Some(_) => None,
    }
}

/// Something a symbol depends on outside its own file.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
enum Upstream<'a> {
    /// A named symbol of another file.
    Symbol(&'a str, &'a str),
    /// A whole module, a wildcard, or a name that is not a symbol of its
    /// module (re-exports, plain variables). `label` is the imported name.
    Module { path: &'a str, label: &'a str },
}

/// Everything needed to fingerprint symbols across files.
pub struct Fingerprints<'a> {
    slices: HashMap<(&'a str, &'a str), String>,
    /// Direct upstream of every symbol, keyed by (path, qualified name).
    direct: HashMap<(&'a str, &'a str), Vec<Upstream<'a>>>,
    dependency_hashes: &'a BTreeMap<String, String>,
}

impl<'a> Fingerprints<'a> {
    pub fn new(
        files: &'a [ExtractedFile],
        references: &'a BTreeMap<String, Vec<Reference>>,
        resolution: &'a HashResolution,
    ) -> Self {
        let slices: HashMap<(&str, &str), String> = files
            .iter()
            .flat_map(|f| {
                f.symbols.iter().map(move |s| {
                    (
                        (f.path.as_str(), s.qualified_name.as_str()),
                        slice_hash(&s.source),
                    )
                })
            })
            .collect();

        let mut direct = HashMap::new();
        for file in files {
            let Some(file_refs) = references.get(&file.path) else {
                continue;
            };
            for symbol in &file.symbols {
                let mut upstream = Vec::new();
                for reference in file_refs {
                    let Some(source) = reference.target.internal_path() else {
                        continue;
                    };
                    if !reference.used_by(&symbol.usages) {
                        continue;
                    }
                    let name = reference.symbol.as_str();
                    let named = name != MODULE_SYMBOL && name != WILDCARD_SYMBOL;
                    if named && slices.contains_key(&(source, name)) {
                        upstream.push(Upstream::Symbol(source, name));
                    } else {
                        upstream.push(Upstream::Module {
                            path: source,
                            label: name,
                        });
                    }
                }
                if !upstream.is_empty() {
                    direct.insert((file.path.as_str(), symbol.qualified_name.as_str()), upstream);
                }
            }
        }

        Self {
            slices,
            direct,
            dependency_hashes: &resolution.hashes,
        }
    }

    pub fn slice_hash(&self, symbol: &Symbol) -> String {
        self.slices
            .get(&(symbol.file_path.as_str(), symbol.qualified_name.as_str()))
            .cloned()
            .unwrap_or_else(|| slice_hash(&symbol.source))
    }

    /// Hash of everything upstream of `symbol`, followed transitively.
    ///
    /// Every named symbol reachable through used imports contributes its
    /// slice hash, so an edit two hops away still moves the fingerprint.
    /// Module-level references contribute the module's dependency hash,
    /// which already covers that module's own upstream. Each symbol is
    /// visited once, so import cycles terminate.
    pub fn upstream_hash(&self, symbol: &Symbol) -> String {
        let own = (symbol.file_path.as_str(), symbol.qualified_name.as_str());
        let mut entries: BTreeMap<String, String> = BTreeMap::new();
        let mut visited: HashSet<Upstream<'_>> = HashSet::new();
        let mut pending: Vec<Upstream<'_>> = self.direct.get(&own).cloned().unwrap_or_default();

        while let Some(next) = pending.pop() {
            if !visited.insert(next) {
                continue;
            }
            match next {
                Upstream::Symbol(path, name) => {
                    if (path, name) == own {
                        continue;
                    }
                    let value = self.slices.get(&(path, name)).cloned().unwrap_or_default();
                    entries.insert(format!("{path}::{name}"), value);
                    if let Some(more) = self.direct.get(&(path, name)) {
                        pending.extend(more.iter().copied());
                    }
                }
                Upstream::Module { path, label } => {
                    let value = self.dependency_hashes.get(path).cloned().unwrap_or_default();
                    entries.insert(format!("{path}::{label}"), value);
                }
            }
        }
        hash_entries(entries.iter().map(|(k, v)| (k.as_str(), v.as_str())))
    }
}

/// Select the work for this run.
///
/// `input_paths` covers every input file, including those that failed to
/// parse; only stored paths outside it are reported as removed.
pub fn plan_work(
    files: &[ExtractedFile],
    references: &BTreeMap<String, Vec<Reference>>,
    resolution: &HashResolution,
    store: &IndexStore,
    input_paths: &BTreeSet<String>,
) -> WorkPlan {
    let fingerprints = Fingerprints::new(files, references, resolution);
    let mut plan = WorkPlan::default();

    for file in files {
        let dependency_hash = resolution
            .hashes
            .get(&file.path)
            .cloned()
            .unwrap_or_else(|| file.content_hash.clone());
        let record = store.get(&file.path);
        let unresolved = resolution.unresolved.contains(&file.path);

        let Some(reason) = file_decision(record, &dependency_hash, unresolved) else {
            plan.clean.push(file.path.clone());
            continue;
        };

        let symbols = file
            .symbols
            .iter()
            .map(|symbol| {
                let slice_hash = fingerprints.slice_hash(symbol);
                let upstream_hash = fingerprints.upstream_hash(symbol);
                let reusable = record
                    .and_then(|r| r.summaries.get(&symbol.qualified_name))
                    .map(|s| s.slice_hash == slice_hash && s.upstream_hash == upstream_hash)
                    .unwrap_or(false);
                SymbolPlan {
                    symbol: symbol.clone(),
                    slice_hash,
                    upstream_hash,
                    reusable,
                }
            })
            .collect();

        plan.dirty.push(FilePlan {
            path: file.path.clone(),
            content_hash: file.content_hash.clone(),
            dependency_hash,
            reason,
            symbols,
        });
    }

    plan.removed = store
        .paths()
        .filter(|p| !input_paths.contains(*p))
        .map(str::to_string)
        .collect();
    plan
}
