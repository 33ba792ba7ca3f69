//! Record store contract and an in-memory implementation
//!
//! Watches detect change by comparing record versions: every commit must
//! give the record a version greater than any the store handed out before.

use std::sync::atomic::{AtomicU64, Ordering};

use indexmap::IndexMap;
use parking_lot::RwLock;

use crate::{Dict, HaystackError, Ref, Result};

/// A record as read from a store
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub tags: Dict,
    /// Modification stamp, strictly increasing across commits
    pub version: u64,
}

/// Resolves record ids to their current state
pub trait RecordStore: Send + Sync {
    fn read_by_id(&self, id: &Ref) -> Option<Record>;

    /// Resolve many ids at once, in order. Stores with a cheaper batch
    /// lookup should override this.
    fn read_by_ids(&self, ids: &[Ref]) -> Vec<Option<Record>> {
        ids.iter().map(|id| self.read_by_id(id)).collect()
    }
}

/// Records held in memory, keyed by id in insertion order
pub struct MemoryStore {
    records: RwLock<IndexMap<Ref, Record>>,
    version: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            records: RwLock::new(IndexMap::new()),
            version: AtomicU64::new(0),
        }
    }

    /// Insert or replace a record. The dict must carry an `id` ref.
    ///
    /// Returns the version assigned to the commit.
    pub fn commit(&self, tags: Dict) -> Result<u64> {
        let id = tags
            .id()
            .cloned()
            .ok_or_else(|| HaystackError::InvalidArgument("record has no id tag".into()))?;
        let mut records = self.records.write();
        let version = self.next_version();
        log::debug!("commit {} at version {}", id, version);
        records.insert(id, Record { tags, version });
        Ok(version)
    }

    /// Apply `f` to an existing record's tags and commit the result
    pub fn update<F>(&self, id: &Ref, f: F) -> Result<u64>
    where
        F: FnOnce(&mut Dict),
    {
        let mut records = self.records.write();
        let record = records
            .get_mut(id)
            .ok_or_else(|| HaystackError::UnknownRecord(id.clone()))?;
        f(&mut record.tags);
        record.version = self.next_version();
        Ok(record.version)
    }

    pub fn remove(&self, id: &Ref) -> Option<Record> {
        let removed = self.records.write().shift_remove(id);
        if removed.is_some() {
            self.next_version();
            log::debug!("removed {}", id);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    pub fn ids(&self) -> Vec<Ref> {
        self.records.read().keys().cloned().collect()
    }

    fn next_version(&self) -> u64 {
        self.version.fetch_add(1, Ordering::SeqCst) + 1
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordStore for MemoryStore {
    fn read_by_id(&self, id: &Ref) -> Option<Record> {
        self.records.read().get(id).cloned()
    }

    fn read_by_ids(&self, ids: &[Ref]) -> Vec<Option<Record>> {
        let records = self.records.read();
        ids.iter().map(|id| records.get(id).cloned()).collect()
    }
}
