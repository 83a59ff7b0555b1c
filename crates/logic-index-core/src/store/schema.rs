//! SQLite schema for the summary index.

use rusqlite::{Connection, OptionalExtension};

use crate::errors::{IndexError, IndexResult};

/// Layout version stamped into `repo_meta`. A store carrying any other
/// version is refused rather than read with the wrong column meanings.
pub const SCHEMA_VERSION: i32 = 1;

/// DDL statements: 3 CREATE TABLE + 2 CREATE INDEX.
///
/// Executed with `CREATE … IF NOT EXISTS` so they are safe to replay on an
/// already-initialised database.
pub const SCHEMA_STATEMENTS: &[&str] = &[
    // ── tables (3) ──────────────────────────────────────────────────────
    "CREATE TABLE IF NOT EXISTS repo_meta (
        key TEXT PRIMARY KEY,
        value TEXT
    );",
    "CREATE TABLE IF NOT EXISTS files (
        path TEXT PRIMARY KEY,
        content_hash TEXT NOT NULL,
        dependency_hash TEXT,
        status TEXT NOT NULL DEFAULT 'stale',
        last_processed_at TEXT
    );",
    "CREATE TABLE IF NOT EXISTS symbol_summaries (
        file_path TEXT NOT NULL REFERENCES files(path) ON DELETE CASCADE,
        qualified_name TEXT NOT NULL,
        kind TEXT NOT NULL,
        start_line INTEGER NOT NULL,
        signature TEXT NOT NULL,
        summary TEXT NOT NULL,
        provenance TEXT NOT NULL,
        source_tag TEXT,
        sink_tag TEXT,
        slice_hash TEXT NOT NULL,
        upstream_hash TEXT NOT NULL,
        PRIMARY KEY(file_path, qualified_name)
    );",
    // ── indexes (2) ─────────────────────────────────────────────────────
    "CREATE INDEX IF NOT EXISTS idx_files_status ON files(status);",
    "CREATE INDEX IF NOT EXISTS idx_summaries_provenance ON symbol_summaries(provenance);",
];

/// Create the tables and stamp [`SCHEMA_VERSION`] on a new store, or check
/// the stamp on an existing one. Runs in a single transaction.
pub fn initialize(conn: &Connection) -> IndexResult<()> {
    let tx = conn.unchecked_transaction()?;
    for stmt in SCHEMA_STATEMENTS {
        tx.execute_batch(stmt)?;
    }
    match stored_version(&tx)? {
        None => {
            tx.execute(
                "INSERT INTO repo_meta(key, value) VALUES('schema_version', ?1);",
                rusqlite::params![SCHEMA_VERSION.to_string()],
            )?;
        }
        Some(SCHEMA_VERSION) => {}
        Some(other) => {
            return Err(IndexError::Store(format!(
                "index store has schema version {other}, expected {SCHEMA_VERSION}; \
                 delete it to rebuild"
            )));
        }
    }
    tx.commit()?;
    Ok(())
}

/// The version stamped in `repo_meta`, if any.
pub fn stored_version(conn: &Connection) -> IndexResult<Option<i32>> {
    let value: Option<String> = conn
        .query_row(
            "SELECT value FROM repo_meta WHERE key = 'schema_version';",
            [],
            |row| row.get(0),
        )
        .optional()?;
    value
        .map(|v| {
            v.parse::<i32>()
                .map_err(|_| IndexError::Store(format!("unreadable schema version {v:?}")))
        })
        .transpose()
}
