//! Logic index core: an incremental semantic index for Python source trees.
//!
//! A run extracts structural symbols with tree-sitter, resolves imports into
//! a file dependency graph, and uses content and dependency hashes to decide
//! which symbols need a fresh natural-language summary. Summaries come from
//! the symbol's own documentation, a fixed placeholder for trivial code, or a
//! remote [`Summarizer`]; all of them are persisted in SQLite so later runs
//! only pay for what changed.

pub mod config;
pub mod engine;
pub mod errors;
pub mod indexer;
pub mod models;
pub mod render;
pub mod store;
pub mod summarize;

pub use config::IndexerConfig;
pub use engine::IndexEngine;
pub use errors::{IndexError, IndexResult};
pub use indexer::filesystem::{collect_sources, SourceFile};
pub use models::{FileRecord, FileStatus, Provenance, RunReport, SymbolKind, SymbolSummary};
pub use render::render_logic_tree;
pub use store::index::IndexStore;
pub use summarize::{
    BatchResponse, FatalKind, GeminiSummarizer, ServiceError, SummaryItem, SummaryRequest,
    Summarizer,
};
