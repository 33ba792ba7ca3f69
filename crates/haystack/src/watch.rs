//! Watches: server-held subscriptions to a set of records
//!
//! A watch is open from construction until [`Watch::close`]; once closed
//! it never reopens and every operation other than `close` and the
//! accessors fails with [`HaystackError::WatchClosed`].
//!
//! All operations on one watch are serialized by a lock scoped to that
//! watch, held across the store lookup, so `close` cannot interleave with
//! a half-built poll result. The id and open flag are written under that
//! lock but read without it, so looking a watch up never waits on a poll.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use indexmap::IndexMap;
use parking_lot::{Mutex, MutexGuard};

use crate::store::{Record, RecordStore};
use crate::{Dict, Grid, HaystackError, Num, Ref, Result, Val};

/// A subscription to a list of records
pub trait Watch: Send + Sync {
    /// Session-unique id, assigned on the first successful `sub`
    fn id(&self) -> Option<String>;

    /// Debug display string given at open
    fn dis(&self) -> &str;

    /// Expected lifetime without renewal
    fn lease(&self) -> Option<Num>;

    /// Add records to the watch and return their current state.
    ///
    /// The grid meta carries `watchId` and `lease`. When `checked`, the
    /// first id that does not resolve fails the whole call with
    /// [`HaystackError::UnknownRecord`] and nothing is added. Otherwise
    /// unresolved ids are still subscribed and come back as rows with
    /// every cell absent.
    fn sub(&self, ids: &[Ref], checked: bool) -> Result<Grid>;

    /// Remove records from the watch; ids not subscribed are ignored
    fn unsub(&self, ids: &[Ref]) -> Result<()>;

    /// Subscribed records that changed since they were last reported
    fn poll_changes(&self) -> Result<Grid>;

    /// Every subscribed record, changed or not
    fn poll_refresh(&self) -> Result<Grid>;

    /// Release the watch. Closing twice is a no-op.
    fn close(&self);

    fn is_open(&self) -> bool;

    /// Currently subscribed ids, in subscription order
    fn subscribed(&self) -> Vec<Ref>;
}

impl std::fmt::Debug for dyn Watch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Watch")
            .field("id", &self.id())
            .field("dis", &self.dis())
            .finish()
    }
}

/// Allocates session-unique watch ids (`w-1`, `w-2`, ...)
#[derive(Debug, Default)]
pub struct WatchIds {
    next: AtomicU64,
}

impl WatchIds {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&self) -> String {
        let n = self.next.fetch_add(1, Ordering::SeqCst) + 1;
        format!("w-{n}")
    }
}

struct WatchState {
    /// Subscribed ids -> version last reported (None while unresolved)
    subscribed: IndexMap<Ref, Option<u64>>,
}

/// Watch over a [`RecordStore`], detecting change by record version
pub struct StoreWatch {
    dis: String,
    lease: Num,
    store: Arc<dyn RecordStore>,
    ids: Arc<WatchIds>,
    id: OnceLock<String>,
    open: AtomicBool,
    state: Mutex<WatchState>,
}

impl StoreWatch {
    /// Open a watch. `lease` should already be a validated duration.
    pub fn open(
        dis: impl Into<String>,
        lease: Num,
        store: Arc<dyn RecordStore>,
        ids: Arc<WatchIds>,
    ) -> Self {
        Self {
            dis: dis.into(),
            lease,
            store,
            ids,
            id: OnceLock::new(),
            open: AtomicBool::new(true),
            state: Mutex::new(WatchState {
                subscribed: IndexMap::new(),
            }),
        }
    }

    fn lock_open(&self) -> Result<MutexGuard<'_, WatchState>> {
        let state = self.state.lock();
        if self.open.load(Ordering::Acquire) {
            Ok(state)
        } else {
            Err(HaystackError::WatchClosed)
        }
    }

    fn meta(&self) -> Dict {
        let mut meta = Dict::new();
        if let Some(id) = self.id.get() {
            meta.set("watchId", id.as_str());
        }
        meta.set("lease", self.lease.clone());
        meta
    }
}

/// Row reported for a record that disappeared from the store
fn removed_row(id: &Ref) -> Dict {
    let mut row = Dict::new();
    row.set("id", id.clone()).set("removed", Val::Marker);
    row
}

impl Watch for StoreWatch {
    fn id(&self) -> Option<String> {
        self.id.get().cloned()
    }

    fn dis(&self) -> &str {
        &self.dis
    }

    fn lease(&self) -> Option<Num> {
        Some(self.lease.clone())
    }

    fn sub(&self, ids: &[Ref], checked: bool) -> Result<Grid> {
        let mut state = self.lock_open()?;
        let records = self.store.read_by_ids(ids);

        if checked {
            if let Some(pos) = records.iter().position(Option::is_none) {
                return Err(HaystackError::UnknownRecord(ids[pos].clone()));
            }
        }

        self.id.get_or_init(|| {
            let id = self.ids.next_id();
            log::debug!("watch '{}' assigned id {}", self.dis, id);
            id
        });

        let mut rows = Vec::with_capacity(ids.len());
        for (id, record) in ids.iter().zip(records) {
            state
                .subscribed
                .insert(id.clone(), record.as_ref().map(|r| r.version));
            rows.push(record.map(|r| r.tags));
        }
        log::debug!(
            "watch {:?} subscribed {} ids ({} total)",
            self.id.get(),
            ids.len(),
            state.subscribed.len()
        );

        Ok(Grid::from_dicts(self.meta(), &rows))
    }

    fn unsub(&self, ids: &[Ref]) -> Result<()> {
        let mut state = self.lock_open()?;
        for id in ids {
            state.subscribed.shift_remove(id);
        }
        Ok(())
    }

    fn poll_changes(&self) -> Result<Grid> {
        let mut state = self.lock_open()?;
        let ids: Vec<Ref> = state.subscribed.keys().cloned().collect();
        let records = self.store.read_by_ids(&ids);

        let mut rows = Vec::new();
        for ((id, seen), record) in state.subscribed.iter_mut().zip(records) {
            let current = record.as_ref().map(|r| r.version);
            if *seen == current {
                continue;
            }
            *seen = current;
            rows.push(Some(match record {
                Some(Record { tags, .. }) => tags,
                None => removed_row(id),
            }));
        }

        Ok(Grid::from_dicts(self.meta(), &rows))
    }

    fn poll_refresh(&self) -> Result<Grid> {
        let mut state = self.lock_open()?;
        let ids: Vec<Ref> = state.subscribed.keys().cloned().collect();
        let records = self.store.read_by_ids(&ids);

        let mut rows = Vec::with_capacity(records.len());
        for (seen, record) in state.subscribed.values_mut().zip(records) {
            *seen = record.as_ref().map(|r| r.version);
            rows.push(record.map(|r| r.tags));
        }

        Ok(Grid::from_dicts(self.meta(), &rows))
    }

    fn close(&self) {
        let mut state = self.state.lock();
        if self.open.swap(false, Ordering::AcqRel) {
            state.subscribed.clear();
            log::debug!("watch {:?} '{}' closed", self.id.get(), self.dis);
        }
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    fn subscribed(&self) -> Vec<Ref> {
        self.state.lock().subscribed.keys().cloned().collect()
    }
}
