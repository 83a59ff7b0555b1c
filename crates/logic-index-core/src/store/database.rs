//! SQLite storage layer for the index.
//!
//! Each public method opens its own connection so that callers never have
//! to manage connection lifetime. The engine is the only writer.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};

use crate::errors::{IndexError, IndexResult};
use crate::models::{FileRecord, FileStatus, Provenance, SymbolKind, SymbolSummary};
use crate::store::schema;

// ---------------------------------------------------------------------------
// Helper: tilde expansion
// ---------------------------------------------------------------------------

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let text = path.to_string_lossy();
    if text == "~" || text.starts_with("~/") {
        if let Some(home) = std::env::var_os("HOME") {
            let mut expanded = PathBuf::from(home);
            if text.len() > 2 {
                expanded.push(&text[2..]);
            }
            return expanded;
        }
    }
    path.to_path_buf()
}

// ---------------------------------------------------------------------------
// Database
// ---------------------------------------------------------------------------

#[derive(Clone, Debug)]
pub struct Database {
    db_path: PathBuf,
}

impl Database {
    /// Resolve `db_path`, create parent directories, and initialise the
    /// schema.
    pub fn open(db_path: impl AsRef<Path>) -> IndexResult<Self> {
        let expanded = expand_tilde(db_path.as_ref());
        let resolved = if expanded.is_absolute() {
            expanded
        } else {
            std::env::current_dir()?.join(&expanded)
        };
        if let Some(parent) = resolved.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Self { db_path: resolved };
        db.init_schema()?;
        Ok(db)
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    /// Open a new SQLite connection with foreign keys enabled.
    fn connect(&self) -> IndexResult<Connection> {
        let conn = Connection::open(&self.db_path)?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Ok(conn)
    }

    /// Set WAL mode, then create or check the schema.
    pub fn init_schema(&self) -> IndexResult<()> {
        let conn = self.connect()?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        schema::initialize(&conn)
    }

    // -----------------------------------------------------------------------
    // Meta
    // -----------------------------------------------------------------------

    fn upsert_repo_meta(conn: &Connection, key: &str, value: &str) -> IndexResult<()> {
        conn.execute(
            "INSERT INTO repo_meta(key, value) VALUES(?1, ?2) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value;",
            params![key, value],
        )?;
        Ok(())
    }

    /// Get a single repo_meta value by key, or `None`.
    pub fn get_repo_meta(&self, key: &str) -> IndexResult<Option<String>> {
        let conn = self.connect()?;
        let result: Result<String, _> = conn.query_row(
            "SELECT value FROM repo_meta WHERE key = ?1 LIMIT 1;",
            params![key],
            |row| row.get(0),
        );
        match result {
            Ok(v) => Ok(Some(v)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn set_repo_meta(&self, key: &str, value: &str) -> IndexResult<()> {
        let conn = self.connect()?;
        Self::upsert_repo_meta(&conn, key, value)
    }

    // -----------------------------------------------------------------------
    // Records
    // -----------------------------------------------------------------------

    /// Load every file record with its summaries.
    pub fn load_records(&self) -> IndexResult<BTreeMap<String, FileRecord>> {
        let conn = self.connect()?;
        let mut records = BTreeMap::new();

        let mut file_stmt = conn.prepare(
            "SELECT path, content_hash, dependency_hash, status, last_processed_at \
             FROM files ORDER BY path;",
        )?;
        let rows = file_stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<String>>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, Option<String>>(4)?,
            ))
        })?;
        for row in rows {
            let (path, content_hash, dependency_hash, status, last_processed) = row?;
            let status = FileStatus::parse(&status).ok_or_else(|| {
                IndexError::Store(format!("unknown status {status:?} for {path}"))
            })?;
            let last_processed = last_processed
                .as_deref()
                .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
                .map(|d| d.with_timezone(&Utc));
            records.insert(
                path.clone(),
                FileRecord {
                    path,
                    content_hash,
                    dependency_hash,
                    status,
                    last_processed,
                    summaries: BTreeMap::new(),
                },
            );
        }

        let mut summary_stmt = conn.prepare(
            "SELECT file_path, qualified_name, kind, start_line, signature, summary, \
                    provenance, source_tag, sink_tag, slice_hash, upstream_hash \
             FROM symbol_summaries;",
        )?;
        let rows = summary_stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, String>(6)?,
                row.get::<_, Option<String>>(7)?,
                row.get::<_, Option<String>>(8)?,
                row.get::<_, String>(9)?,
                row.get::<_, String>(10)?,
            ))
        })?;
        for row in rows {
            let (
                file_path,
                qualified_name,
                kind,
                start_line,
                signature,
                summary,
                provenance,
                source_tag,
                sink_tag,
                slice_hash,
                upstream_hash,
            ) = row?;
            let kind = SymbolKind::parse(&kind).ok_or_else(|| {
                IndexError::Store(format!("unknown kind {kind:?} for {file_path}::{qualified_name}"))
            })?;
            let provenance = Provenance::parse(&provenance).ok_or_else(|| {
                IndexError::Store(format!(
                    "unknown provenance {provenance:?} for {file_path}::{qualified_name}"
                ))
            })?;
            if let Some(record) = records.get_mut(&file_path) {
                record.summaries.insert(
                    qualified_name.clone(),
                    SymbolSummary {
                        qualified_name,
                        kind,
                        start_line: start_line.max(0) as usize,
                        signature,
                        summary,
                        provenance,
                        source_tag,
                        sink_tag,
                        slice_hash,
                        upstream_hash,
                    },
                );
            }
        }

        Ok(records)
    }

    /// Write changed records and delete removed ones in one transaction, so
    /// an interrupted write leaves the previous state intact.
    pub fn write_changes(&self, upserts: &[&FileRecord], removed: &[String]) -> IndexResult<()> {
        if upserts.is_empty() && removed.is_empty() {
            return Ok(());
        }
        let mut conn = self.connect()?;
        let tx = conn.transaction()?;
        {
            let mut delete_summaries =
                tx.prepare("DELETE FROM symbol_summaries WHERE file_path = ?1;")?;
            let mut delete_file = tx.prepare("DELETE FROM files WHERE path = ?1;")?;
            for path in removed {
                delete_summaries.execute(params![path])?;
                delete_file.execute(params![path])?;
            }

            let mut upsert_file = tx.prepare(
                "INSERT INTO files (path, content_hash, dependency_hash, status, last_processed_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5) \
                 ON CONFLICT(path) DO UPDATE SET \
                     content_hash = excluded.content_hash, \
                     dependency_hash = excluded.dependency_hash, \
                     status = excluded.status, \
                     last_processed_at = excluded.last_processed_at;",
            )?;
            let mut insert_summary = tx.prepare(
                "INSERT INTO symbol_summaries ( \
                     file_path, qualified_name, kind, start_line, signature, summary, \
                     provenance, source_tag, sink_tag, slice_hash, upstream_hash \
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11);",
            )?;
            for record in upserts {
                upsert_file.execute(params![
                    record.path,
                    record.content_hash,
                    record.dependency_hash,
                    record.status.as_str(),
                    record.last_processed.map(|t| t.to_rfc3339()),
                ])?;
                delete_summaries.execute(params![record.path])?;
                for summary in record.summaries.values() {
                    insert_summary.execute(params![
                        record.path,
                        summary.qualified_name,
                        summary.kind.as_str(),
                        summary.start_line as i64,
                        summary.signature,
                        summary.summary,
                        summary.provenance.as_str(),
                        summary.source_tag,
                        summary.sink_tag,
                        summary.slice_hash,
                        summary.upstream_hash,
                    ])?;
                }
            }
        }
        tx.commit()?;
        Ok(())
    }
}
