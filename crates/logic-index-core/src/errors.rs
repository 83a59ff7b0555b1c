//! Error types for the logic index engine.

use crate::models::RunReport;
use crate::summarize::client::FatalKind;

/// Top-level error enum for the logic index engine.
///
/// Only store failures and fatal service conditions escape a run; per-file
/// parse failures and per-unit summarization failures are contained and
/// reported through [`RunReport`].
#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("Store error: {0}")]
    Store(String),

    /// The summarization service refused the run (bad credentials or quota).
    /// The store has already been flushed when this is returned.
    #[error("Summarization halted by fatal service error: {kind}")]
    FatalService {
        kind: FatalKind,
        report: Box<RunReport>,
    },

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type IndexResult<T> = Result<T, IndexError>;
