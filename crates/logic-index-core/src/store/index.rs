//! In-memory index with change tracking and guaranteed flush.
//!
//! The engine loads the whole store at the start of a run, mutates it under
//! a single mutex while work completes, and writes only the changed records
//! back. [`StoreCheckpoint`] flushes on every way out of a run, including
//! early returns and panics.

use std::collections::{BTreeMap, BTreeSet};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::errors::IndexResult;
use crate::models::FileRecord;
use crate::store::database::Database;

#[derive(Debug, Default)]
pub struct IndexStore {
    records: BTreeMap<String, FileRecord>,
    dirty: BTreeSet<String>,
    removed: BTreeSet<String>,
}

impl IndexStore {
    pub fn load(db: &Database) -> IndexResult<Self> {
        let records = db.load_records()?;
        debug!("loaded {} file records from {}", records.len(), db.path().display());
        Ok(Self {
            records,
            dirty: BTreeSet::new(),
            removed: BTreeSet::new(),
        })
    }

    pub fn get(&self, path: &str) -> Option<&FileRecord> {
        self.records.get(path)
    }

    pub fn upsert(&mut self, record: FileRecord) {
        self.removed.remove(&record.path);
        self.dirty.insert(record.path.clone());
        self.records.insert(record.path.clone(), record);
    }

    /// Mutable access; the record is written on the next flush.
    pub fn record_mut(&mut self, path: &str) -> Option<&mut FileRecord> {
        let record = self.records.get_mut(path)?;
        self.dirty.insert(path.to_string());
        Some(record)
    }

    pub fn remove(&mut self, path: &str) -> Option<FileRecord> {
        let record = self.records.remove(path)?;
        self.dirty.remove(path);
        self.removed.insert(path.to_string());
        Some(record)
    }

    pub fn entries(&self) -> impl Iterator<Item = (&str, &FileRecord)> {
        self.records.iter().map(|(p, r)| (p.as_str(), r))
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.records.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn has_pending_changes(&self) -> bool {
        !self.dirty.is_empty() || !self.removed.is_empty()
    }

    /// Write pending changes. Tracking is cleared only after the write
    /// commits, so a failed flush is retried by the next one.
    pub fn flush(&mut self, db: &Database) -> IndexResult<usize> {
        if !self.has_pending_changes() {
            return Ok(0);
        }
        let upserts: Vec<&FileRecord> = self
            .dirty
            .iter()
            .filter_map(|p| self.records.get(p))
            .collect();
        let removed: Vec<String> = self.removed.iter().cloned().collect();
        db.write_changes(&upserts, &removed)?;

        let written = upserts.len() + removed.len();
        self.dirty.clear();
        self.removed.clear();
        debug!("flushed {written} record changes");
        Ok(written)
    }
}

// ---------------------------------------------------------------------------
// Checkpoint guard
// ---------------------------------------------------------------------------

/// Flushes the shared store when dropped unless [`commit`] already did.
///
/// [`commit`]: StoreCheckpoint::commit
pub struct StoreCheckpoint<'a> {
    store: &'a Mutex<IndexStore>,
    db: &'a Database,
    armed: bool,
}

impl<'a> StoreCheckpoint<'a> {
    pub fn new(store: &'a Mutex<IndexStore>, db: &'a Database) -> Self {
        Self {
            store,
            db,
            armed: true,
        }
    }

    /// Intermediate flush; the guard stays armed.
    pub fn checkpoint(&self) -> IndexResult<usize> {
        self.store.lock().flush(self.db)
    }

    /// Final flush with error propagation.
    pub fn commit(mut self) -> IndexResult<usize> {
        self.armed = false;
        self.store.lock().flush(self.db)
    }
}

impl Drop for StoreCheckpoint<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if std::thread::panicking() {
            warn!("flushing index store while unwinding");
        }
        if let Err(e) = self.store.lock().flush(self.db) {
            warn!("failed to flush index store on exit: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_db(dir: &tempfile::TempDir) -> Database {
        Database::open(dir.path().join("index.db")).unwrap()
    }

    #[test]
    fn flush_writes_only_changes() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_db(&dir);
        let mut store = IndexStore::load(&db).unwrap();
        assert!(store.is_empty());

        store.upsert(FileRecord::new("a.py", "1"));
        store.upsert(FileRecord::new("b.py", "2"));
        assert_eq!(store.flush(&db).unwrap(), 2);
        assert_eq!(store.flush(&db).unwrap(), 0);

        store.record_mut("a.py").unwrap().content_hash = "1b".into();
        store.remove("b.py");
        assert_eq!(store.flush(&db).unwrap(), 2);

        let reloaded = IndexStore::load(&db).unwrap();
        assert_eq!(reloaded.len(), 1);
        assert_eq!(reloaded.get("a.py").unwrap().content_hash, "1b");
    }

    #[test]
    fn checkpoint_flushes_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_db(&dir);
        let store = Mutex::new(IndexStore::default());
        {
            let _guard = StoreCheckpoint::new(&store, &db);
            store.lock().upsert(FileRecord::new("a.py", "1"));
        }
        assert!(IndexStore::load(&db).unwrap().get("a.py").is_some());
    }

    #[test]
    fn checkpoint_flushes_during_panic() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_db(&dir);
        let store = Mutex::new(IndexStore::default());
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _guard = StoreCheckpoint::new(&store, &db);
            store.lock().upsert(FileRecord::new("a.py", "1"));
            panic!("worker blew up");
        }));
        assert!(result.is_err());
        assert!(IndexStore::load(&db).unwrap().get("a.py").is_some());
    }

    #[test]
    fn commit_disarms_guard() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_db(&dir);
        let store = Mutex::new(IndexStore::default());
        let guard = StoreCheckpoint::new(&store, &db);
        store.lock().upsert(FileRecord::new("a.py", "1"));
        assert_eq!(guard.commit().unwrap(), 1);
        assert!(!store.lock().has_pending_changes());
    }
}
