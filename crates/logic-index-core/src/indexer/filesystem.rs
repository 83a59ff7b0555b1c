//! Source discovery and content hashing.

use std::path::Path;

use sha2::{Digest, Sha256};
use tracing::{debug, warn};
use walkdir::{DirEntry, WalkDir};

const SOURCE_EXTENSION: &str = "py";

const IMPLICIT_IGNORED_DIRS: &[&str] = &[
    ".git",
    "__pycache__",
    ".venv",
    "venv",
    "node_modules",
    ".logic_index",
];

/// One input file: a root-relative `/`-separated path and its text.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SourceFile {
    pub path: String,
    pub text: String,
}

impl SourceFile {
    pub fn new(path: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            path: normalize_path(&path.into()),
            text: text.into(),
        }
    }
}

fn normalize_path(path: &str) -> String {
    let normalized = path.replace('\\', "/");
    normalized
        .strip_prefix("./")
        .unwrap_or(&normalized)
        .to_string()
}

fn is_ignored_dir(entry: &DirEntry) -> bool {
    entry.depth() > 0
        && entry.file_type().is_dir()
        && entry
            .file_name()
            .to_str()
            .map(|name| IMPLICIT_IGNORED_DIRS.contains(&name))
            .unwrap_or(false)
}

/// Walk `root` and read every Python file that `accept` admits.
///
/// `accept` receives the root-relative path and decides exclusion; the rule
/// language behind it belongs to the caller. Results are sorted by path.
/// Files that cannot be read as UTF-8 are logged and skipped.
pub fn collect_sources<F>(root: &Path, accept: F) -> Vec<SourceFile>
where
    F: Fn(&str) -> bool,
{
    let mut sources = Vec::new();
    let walker = WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| !is_ignored_dir(e));

    for entry in walker {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                warn!("skipping unreadable entry under {}: {e}", root.display());
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some(SOURCE_EXTENSION) {
            continue;
        }
        let rel = match path.strip_prefix(root) {
            Ok(rel) => rel.to_string_lossy().replace('\\', "/"),
            Err(_) => continue,
        };
        if !accept(&rel) {
            debug!("excluded {rel}");
            continue;
        }
        match std::fs::read_to_string(path) {
            Ok(text) => sources.push(SourceFile::new(rel, text)),
            Err(e) => warn!("failed to read {rel}: {e}"),
        }
    }

    sources.sort_by(|a, b| a.path.cmp(&b.path));
    sources
}

/// SHA-256 of the raw file text.
pub fn compute_content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// SHA-256 of a source slice with all whitespace removed, so reformatting
/// alone does not invalidate a summary.
pub fn slice_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    for chunk in text.split_whitespace() {
        hasher.update(chunk.as_bytes());
    }
    format!("{:x}", hasher.finalize())
}

/// SHA-256 over `key\0value\n` lines. Callers pass entries in a stable order.
pub fn hash_entries<'a, I>(entries: I) -> String
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let mut hasher = Sha256::new();
    for (key, value) in entries {
        hasher.update(key.as_bytes());
        hasher.update([0u8]);
        hasher.update(value.as_bytes());
        hasher.update(b"\n");
    }
    format!("{:x}", hasher.finalize())
}
