//! Server dispatcher and the extension points a deployment provides
//!
//! [`Dispatcher`] owns the session's watches and answers `about`; every
//! storage-specific operation is forwarded to a [`Backend`]. Backend
//! methods default to [`HaystackError::NotImplemented`] so a deployment
//! only overrides what it supports.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};

use crate::store::RecordStore;
use crate::watch::{StoreWatch, Watch, WatchIds};
use crate::{Dict, Grid, HaystackError, Num, Ref, Result, Val};

/// Timestamped history sample
#[derive(Debug, Clone, PartialEq)]
pub struct HisItem {
    pub ts: DateTime<Utc>,
    pub val: Val,
}

/// Half-open time range `[start, end)` for history reads
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HisRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl HisRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self> {
        if start > end {
            return Err(HaystackError::InvalidArgument(format!(
                "range start {start} is after end {end}"
            )));
        }
        Ok(Self { start, end })
    }

    pub fn contains(&self, ts: &DateTime<Utc>) -> bool {
        *ts >= self.start && *ts < self.end
    }
}

/// Storage-specific operations behind the dispatcher.
///
/// Record resolution is required (it backs watches and `read`); the rest
/// is optional.
pub trait Backend: RecordStore {
    /// Operations this deployment supports
    fn ops(&self) -> Result<Grid> {
        Err(HaystackError::NotImplemented("ops"))
    }

    /// Supported MIME types
    fn formats(&self) -> Result<Grid> {
        Err(HaystackError::NotImplemented("formats"))
    }

    /// History samples for a point within `range`
    fn his_read(&self, _id: &Ref, _range: &HisRange) -> Result<Grid> {
        Err(HaystackError::NotImplemented("hisRead"))
    }

    fn his_write(&self, _id: &Ref, _items: &[HisItem]) -> Result<()> {
        Err(HaystackError::NotImplemented("hisWrite"))
    }

    /// Set (`val` present) or release (`val` absent) one priority level of
    /// a writable point and return its write array.
    fn point_write(
        &self,
        _id: &Ref,
        _level: u8,
        _who: &str,
        _val: Option<Val>,
        _dur: Option<Num>,
    ) -> Result<Grid> {
        Err(HaystackError::NotImplemented("pointWrite"))
    }

    fn point_write_array(&self, _id: &Ref) -> Result<Grid> {
        Err(HaystackError::NotImplemented("pointWriteArray"))
    }

    fn invoke_action(
        &self,
        _id: &Ref,
        _action: &str,
        _args: &Dict,
        _mime_type: Option<&str>,
    ) -> Result<Grid> {
        Err(HaystackError::NotImplemented("invokeAction"))
    }
}

/// Dispatcher settings
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub haystack_version: String,
    /// Time zone name reported by `about`
    pub tz: String,
    /// Lease for watches opened without one
    pub default_lease: Num,
    /// Longer requested leases are clamped to this
    pub max_lease: Num,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            haystack_version: "3.0".into(),
            tz: "UTC".into(),
            default_lease: Num::from_duration(Duration::from_secs(60)),
            max_lease: Num::from_duration(Duration::from_secs(3600)),
        }
    }
}

struct WatchEntry {
    watch: Arc<StoreWatch>,
    lease: Duration,
    renewed: Mutex<Instant>,
}

impl WatchEntry {
    fn renew(&self) {
        *self.renewed.lock() = Instant::now();
    }

    fn expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(*self.renewed.lock()) >= self.lease
    }
}

/// Entry point for protocol operations within one server session
pub struct Dispatcher<B> {
    backend: Arc<B>,
    config: DispatcherConfig,
    boot_time: DateTime<Utc>,
    ids: Arc<WatchIds>,
    watches: RwLock<Vec<WatchEntry>>,
}

impl<B: Backend + 'static> Dispatcher<B> {
    pub fn new(backend: B) -> Self {
        Self::with_config(Arc::new(backend), DispatcherConfig::default())
    }

    pub fn with_config(backend: Arc<B>, config: DispatcherConfig) -> Self {
        Self {
            backend,
            config,
            boot_time: Utc::now(),
            ids: Arc::new(WatchIds::new()),
            watches: RwLock::new(Vec::new()),
        }
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Server metadata
    pub fn about(&self) -> Dict {
        let mut about = Dict::new();
        about
            .set("haystackVersion", self.config.haystack_version.as_str())
            .set("serverTime", Utc::now())
            .set("serverBootTime", self.boot_time)
            .set("tz", self.config.tz.as_str())
            .set("productName", env!("CARGO_PKG_NAME"))
            .set("productVersion", env!("CARGO_PKG_VERSION"));
        about
    }

    pub fn ops(&self) -> Result<Grid> {
        self.backend.ops()
    }

    pub fn formats(&self) -> Result<Grid> {
        self.backend.formats()
    }

    /// Current state of the given records.
    ///
    /// When `checked`, the first unresolved id fails the call; otherwise it
    /// yields a row with every cell absent.
    pub fn read(&self, ids: &[Ref], checked: bool) -> Result<Grid> {
        let records = self.backend.read_by_ids(ids);
        if checked {
            if let Some(pos) = records.iter().position(Option::is_none) {
                return Err(HaystackError::UnknownRecord(ids[pos].clone()));
            }
        }
        let rows: Vec<Option<Dict>> = records.into_iter().map(|r| r.map(|r| r.tags)).collect();
        Ok(Grid::from_dicts(Dict::new(), &rows))
    }

    /// Open a new watch. Its id is assigned on the first `sub`.
    ///
    /// A lease that is not a duration fails with
    /// [`HaystackError::NotDuration`]; one above `max_lease` is clamped.
    pub fn watch_open(&self, dis: &str, lease: Option<Num>) -> Result<Arc<dyn Watch>> {
        let requested = lease.unwrap_or_else(|| self.config.default_lease.clone());
        let max = self.config.max_lease.as_duration()?;
        let (lease, duration) = match requested.as_duration()? {
            d if d > max => (self.config.max_lease.clone(), max),
            d => (requested, d),
        };

        let store: Arc<dyn RecordStore> = self.backend.clone();
        let watch = Arc::new(StoreWatch::open(dis, lease, store, self.ids.clone()));
        self.watches.write().push(WatchEntry {
            watch: watch.clone(),
            lease: duration,
            renewed: Mutex::new(Instant::now()),
        });
        log::info!("watch '{}' opened with lease {:?}", dis, duration);
        Ok(watch)
    }

    /// Look up an open watch by id, renewing its lease.
    ///
    /// When not found, `checked` fails with [`HaystackError::UnknownWatch`]
    /// and unchecked returns `None`.
    pub fn watch(&self, id: &str, checked: bool) -> Result<Option<Arc<dyn Watch>>> {
        let watches = self.watches.read();
        let found = watches
            .iter()
            .find(|e| e.watch.is_open() && e.watch.id().as_deref() == Some(id));
        match found {
            Some(entry) => {
                entry.renew();
                Ok(Some(entry.watch.clone() as Arc<dyn Watch>))
            }
            None if checked => Err(HaystackError::UnknownWatch(id.to_string())),
            None => Ok(None),
        }
    }

    /// All open watches of this session
    pub fn watches(&self) -> Vec<Arc<dyn Watch>> {
        let mut watches = self.watches.write();
        watches.retain(|e| e.watch.is_open());
        watches
            .iter()
            .map(|e| e.watch.clone() as Arc<dyn Watch>)
            .collect()
    }

    /// Unsubscribe ids from a watch, or close it when `close` is set
    pub fn watch_unsub(&self, id: &str, ids: &[Ref], close: bool) -> Result<()> {
        let Some(watch) = self.watch(id, true)? else {
            return Err(HaystackError::UnknownWatch(id.to_string()));
        };
        if close {
            watch.close();
            log::info!("watch {} closed by client", id);
            Ok(())
        } else {
            watch.unsub(ids)
        }
    }

    /// Poll a watch for changes, or for everything when `refresh` is set
    pub fn watch_poll(&self, id: &str, refresh: bool) -> Result<Grid> {
        let Some(watch) = self.watch(id, true)? else {
            return Err(HaystackError::UnknownWatch(id.to_string()));
        };
        if refresh {
            watch.poll_refresh()
        } else {
            watch.poll_changes()
        }
    }

    /// Close and drop every watch whose lease elapsed without renewal.
    ///
    /// Returns how many expired.
    pub fn expire_watches(&self, now: Instant) -> usize {
        let mut expired = Vec::new();
        self.watches.write().retain(|entry| {
            if !entry.watch.is_open() {
                return false;
            }
            if entry.expired(now) {
                expired.push(entry.watch.clone());
                return false;
            }
            true
        });

        // close blocks on an in-flight poll; registry lock already released
        for watch in &expired {
            log::warn!("watch {:?} '{}' lease expired", watch.id(), watch.dis());
            watch.close();
        }
        expired.len()
    }

    // ============ Backend delegation ============

    pub fn his_read(&self, id: &Ref, range: &HisRange) -> Result<Grid> {
        log::debug!("hisRead {} [{}, {})", id, range.start, range.end);
        self.backend.his_read(id, range)
    }

    pub fn his_write(&self, id: &Ref, items: &[HisItem]) -> Result<()> {
        log::debug!("hisWrite {} ({} items)", id, items.len());
        self.backend.his_write(id, items)
    }

    pub fn point_write(
        &self,
        id: &Ref,
        level: u8,
        who: &str,
        val: Option<Val>,
        dur: Option<Num>,
    ) -> Result<Grid> {
        log::debug!("pointWrite {} level {} by '{}'", id, level, who);
        self.backend.point_write(id, level, who, val, dur)
    }

    pub fn point_write_array(&self, id: &Ref) -> Result<Grid> {
        self.backend.point_write_array(id)
    }

    pub fn invoke_action(
        &self,
        id: &Ref,
        action: &str,
        args: &Dict,
        mime_type: Option<&str>,
    ) -> Result<Grid> {
        log::debug!("invokeAction {} '{}'", id, action);
        self.backend.invoke_action(id, action, args, mime_type)
    }
}
