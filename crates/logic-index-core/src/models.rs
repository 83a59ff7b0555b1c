//! Shared typed models used across extraction, invalidation, summarization,
//! and storage.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Qualified name of the synthetic symbol covering module-level code.
pub const MODULE_SYMBOL: &str = "<module>";

/// Reference symbol used for `from m import *`.
pub const WILDCARD_SYMBOL: &str = "*";

/// Symbols longer than this are always summarized with extra reasoning budget.
pub const LARGE_SYMBOL_LINES: usize = 100;

// ---------------------------------------------------------------------------
// Symbols
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SymbolKind {
    Module,
    Type,
    Callable,
}

impl SymbolKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SymbolKind::Module => "module",
            SymbolKind::Type => "type",
            SymbolKind::Callable => "callable",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "module" => Some(SymbolKind::Module),
            "type" => Some(SymbolKind::Type),
            "callable" => Some(SymbolKind::Callable),
            _ => None,
        }
    }

    /// Single-letter tag used in the rendered listing.
    pub fn icon(&self) -> &'static str {
        match self {
            SymbolKind::Module => "M",
            SymbolKind::Type => "C",
            SymbolKind::Callable => "f",
        }
    }
}

/// Closed set of constructs that make a symbol hard to summarize from its
/// text alone.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComplexityMarkers {
    /// Generators, coroutines, lambdas.
    pub deferred: bool,
    /// `getattr`-family calls and metaclass hooks.
    pub reflective: bool,
    /// `eval`, `exec`, `compile`, direct `ast` manipulation.
    pub dynamic_eval: bool,
    /// Bare `except:` or `except Exception`.
    pub catch_all: bool,
}

impl ComplexityMarkers {
    pub fn is_empty(&self) -> bool {
        !(self.deferred || self.reflective || self.dynamic_eval || self.catch_all)
    }

    pub fn labels(&self) -> Vec<&'static str> {
        let mut labels = Vec::new();
        if self.deferred {
            labels.push("deferred-execution");
        }
        if self.reflective {
            labels.push("reflective-access");
        }
        if self.dynamic_eval {
            labels.push("dynamic-evaluation");
        }
        if self.catch_all {
            labels.push("catch-all-errors");
        }
        labels
    }
}

/// How much reasoning budget a generation request should ask for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComplexityHint {
    Minimal,
    Elevated,
}

impl ComplexityHint {
    pub fn for_symbol(line_count: usize, markers: &ComplexityMarkers) -> Self {
        if line_count > LARGE_SYMBOL_LINES || !markers.is_empty() {
            ComplexityHint::Elevated
        } else {
            ComplexityHint::Minimal
        }
    }
}

/// Names and dotted attribute chains that appear in a piece of code, outside
/// of import statements. Only maximal chains are stored: `os.path.join(x)`
/// records `os.path.join` and `x`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Usages(BTreeSet<String>);

impl Usages {
    pub fn insert(&mut self, chain: impl Into<String>) {
        self.0.insert(chain.into());
    }

    /// `name` appears on its own or as the head of a longer chain.
    pub fn mentions(&self, name: &str) -> bool {
        self.0
            .range(name.to_string()..)
            .take_while(|chain| chain.starts_with(name))
            .any(|chain| chain.len() == name.len() || chain[name.len()..].starts_with('.'))
    }

    /// `name` appears on its own, not followed by an attribute access.
    pub fn bare(&self, name: &str) -> bool {
        self.0.contains(name)
    }

    /// Attribute names accessed directly on `binding` (`m.f`, `m.g.h` give
    /// `f` and `g`).
    pub fn members_of(&self, binding: &str) -> BTreeSet<String> {
        let prefix = format!("{binding}.");
        self.0
            .range(prefix.clone()..)
            .take_while(|chain| chain.starts_with(&prefix))
            .filter_map(|chain| chain[prefix.len()..].split('.').next())
            .filter(|member| !member.is_empty())
            .map(str::to_string)
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<S: Into<String>> FromIterator<S> for Usages {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Usages(iter.into_iter().map(Into::into).collect())
    }
}

/// A structural unit extracted from one source file. Rebuilt every run.
#[derive(Clone, Debug)]
pub struct Symbol {
    pub file_path: String,
    /// Dotted path inside the file (`Outer.Inner.method`).
    pub qualified_name: String,
    pub name: String,
    pub kind: SymbolKind,
    /// 1-based, inclusive.
    pub start_line: usize,
    pub end_line: usize,
    /// Parameter list as written, whitespace-collapsed (`(self, x=1)`).
    pub args: Option<String>,
    pub docstring: Option<String>,
    pub line_count: usize,
    pub markers: ComplexityMarkers,
    /// Exact source text covered by the symbol.
    pub source: String,
    pub usages: Usages,
}

impl Symbol {
    /// Display form used in listings and prompts.
    pub fn signature(&self) -> String {
        match &self.args {
            Some(args) => format!("{}{}", self.qualified_name, args),
            None => self.qualified_name.clone(),
        }
    }

    pub fn complexity_hint(&self) -> ComplexityHint {
        ComplexityHint::for_symbol(self.line_count, &self.markers)
    }
}

// ---------------------------------------------------------------------------
// References
// ---------------------------------------------------------------------------

/// Where an imported name comes from.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ReferenceTarget {
    /// A file inside the indexed set.
    Internal(String),
    /// A module outside the indexed set (stdlib, third-party).
    External(String),
}

impl ReferenceTarget {
    pub fn internal_path(&self) -> Option<&str> {
        match self {
            ReferenceTarget::Internal(path) => Some(path),
            ReferenceTarget::External(_) => None,
        }
    }
}

/// The text a consumer must contain for a reference to count as used.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum UsageKey {
    /// The name or any attribute chain rooted at it.
    Name(String),
    /// The name on its own.
    Bare(String),
    /// Wildcard imports cannot be traced to a name.
    Always,
}

/// One imported symbol as seen from one consuming file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Reference {
    pub consumer: String,
    /// Name of the symbol inside the source module, [`MODULE_SYMBOL`] for a
    /// whole-module dependency, or [`WILDCARD_SYMBOL`].
    pub symbol: String,
    pub target: ReferenceTarget,
    /// Local alias from `as`, if any.
    pub alias: Option<String>,
    pub usage_key: UsageKey,
    pub used: bool,
    pub line: usize,
}

impl Reference {
    pub fn used_by(&self, usages: &Usages) -> bool {
        match &self.usage_key {
            UsageKey::Name(name) => usages.mentions(name),
            UsageKey::Bare(name) => usages.bare(name),
            UsageKey::Always => true,
        }
    }
}

// ---------------------------------------------------------------------------
// Persisted records
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    Fresh,
    Stale,
}

impl FileStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileStatus::Fresh => "fresh",
            FileStatus::Stale => "stale",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "fresh" => Some(FileStatus::Fresh),
            "stale" => Some(FileStatus::Stale),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    LiteralDoc,
    TrivialSkip,
    Generated,
}

impl Provenance {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provenance::LiteralDoc => "literal_doc",
            Provenance::TrivialSkip => "trivial_skip",
            Provenance::Generated => "generated",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "literal_doc" => Some(Provenance::LiteralDoc),
            "trivial_skip" => Some(Provenance::TrivialSkip),
            "generated" => Some(Provenance::Generated),
            _ => None,
        }
    }
}

/// Derived description of one symbol plus the fingerprints it was built from.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymbolSummary {
    pub qualified_name: String,
    pub kind: SymbolKind,
    pub start_line: usize,
    pub signature: String,
    pub summary: String,
    pub provenance: Provenance,
    /// Where the symbol's data comes from (e.g. "file", "http").
    pub source_tag: Option<String>,
    /// Where the symbol's data goes.
    pub sink_tag: Option<String>,
    pub slice_hash: String,
    pub upstream_hash: String,
}

/// Persisted state of one source file.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub path: String,
    pub content_hash: String,
    /// Committed only once every symbol of the file has a current summary.
    pub dependency_hash: Option<String>,
    pub status: FileStatus,
    pub last_processed: Option<DateTime<Utc>>,
    pub summaries: BTreeMap<String, SymbolSummary>,
}

impl FileRecord {
    pub fn new(path: impl Into<String>, content_hash: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            content_hash: content_hash.into(),
            dependency_hash: None,
            status: FileStatus::Stale,
            last_processed: None,
            summaries: BTreeMap::new(),
        }
    }

    /// Summaries ordered by their position in the file.
    pub fn summaries_in_order(&self) -> Vec<&SymbolSummary> {
        let mut ordered: Vec<&SymbolSummary> = self.summaries.values().collect();
        ordered.sort_by(|a, b| {
            a.start_line
                .cmp(&b.start_line)
                .then_with(|| a.qualified_name.cmp(&b.qualified_name))
        });
        ordered
    }

    pub fn mark_stale(&mut self) {
        self.dependency_hash = None;
        self.status = FileStatus::Stale;
    }

    pub fn mark_fresh(&mut self, dependency_hash: String, at: DateTime<Utc>) {
        self.dependency_hash = Some(dependency_hash);
        self.status = FileStatus::Fresh;
        self.last_processed = Some(at);
    }
}

// ---------------------------------------------------------------------------
// Run report
// ---------------------------------------------------------------------------

/// Counters for one run.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunReport {
    pub files_scanned: usize,
    pub files_dirty: usize,
    pub files_removed: usize,
    pub parse_failures: usize,
    pub summarized: usize,
    pub doc_extracted: usize,
    pub skipped_trivial: usize,
    pub reused: usize,
    pub failed: usize,
    pub left_stale: usize,
    pub requests: usize,
    pub interrupted: bool,
}
