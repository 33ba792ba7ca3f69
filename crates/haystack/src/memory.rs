//! In-memory backend with history and priority-array point writes

use std::collections::HashMap;

use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::RwLock;

use crate::server::{Backend, HisItem, HisRange};
use crate::store::{MemoryStore, Record, RecordStore};
use crate::{Dict, Grid, HaystackError, Num, Ref, Result, Val};

/// Number of levels in a writable point's priority array
pub const WRITE_LEVELS: u8 = 17;

const OPS: &[(&str, &str)] = &[
    ("about", "Summary information for server"),
    ("ops", "Operations supported by this server"),
    ("formats", "Grid data formats supported by this server"),
    ("read", "Read records by id"),
    ("watchSub", "Watch subscription"),
    ("watchUnsub", "Watch unsubscription"),
    ("watchPoll", "Watch poll cov or refresh"),
    ("hisRead", "Read time series from historian"),
    ("hisWrite", "Write time series data to historian"),
    ("pointWrite", "Read/write writable point priority array"),
    ("invokeAction", "Invoke action on target entity"),
];

#[derive(Debug, Clone)]
struct WriteEntry {
    val: Val,
    who: String,
    expires: Option<DateTime<Utc>>,
}

impl WriteEntry {
    fn active(&self, now: DateTime<Utc>) -> bool {
        self.expires.is_none_or(|at| at > now)
    }
}

type WriteArray = [Option<WriteEntry>; WRITE_LEVELS as usize];

/// Clear entries whose timed write has lapsed; true when any were cleared
fn drop_expired(array: &mut WriteArray, now: DateTime<Utc>) -> bool {
    let mut dropped = false;
    for slot in array.iter_mut() {
        if slot.as_ref().is_some_and(|e| !e.active(now)) {
            *slot = None;
            dropped = true;
        }
    }
    dropped
}

fn level_dis(level: u8) -> String {
    match level {
        1 => "emergency".into(),
        8 => "manual".into(),
        16 => "default".into(),
        n => n.to_string(),
    }
}

/// Records, history and write arrays held in process memory.
///
/// Locks are taken in the order `his`, `writes`, then the record store.
#[derive(Default)]
pub struct MemoryBackend {
    store: MemoryStore,
    his: RwLock<HashMap<Ref, Vec<HisItem>>>,
    writes: RwLock<HashMap<Ref, WriteArray>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a record; the dict must carry an `id` ref
    pub fn commit(&self, tags: Dict) -> Result<u64> {
        self.store.commit(tags)
    }

    /// Commit a batch of records, all or none.
    ///
    /// Every dict is checked for an `id` ref before any is stored.
    pub fn commit_all(&self, records: Vec<Dict>) -> Result<Vec<u64>> {
        if let Some(pos) = records.iter().position(|tags| tags.id().is_none()) {
            return Err(HaystackError::InvalidArgument(format!(
                "record {pos} of the batch has no id ref"
            )));
        }
        records.into_iter().map(|tags| self.store.commit(tags)).collect()
    }

    /// Delete a record along with its history and write array
    pub fn remove(&self, id: &Ref) -> Option<Record> {
        let mut his = self.his.write();
        let mut writes = self.writes.write();
        let removed = self.store.remove(id)?;
        his.remove(id);
        writes.remove(id);
        Some(removed)
    }

    /// Release every timed write that lapsed by `now`, committing the
    /// new winning level of each affected point.
    ///
    /// Returns how many points changed.
    pub fn expire_writes(&self, now: DateTime<Utc>) -> usize {
        let mut writes = self.writes.write();
        let mut released = 0;
        for (id, array) in writes.iter_mut() {
            if !drop_expired(array, now) {
                continue;
            }
            match self.commit_winner(id, array, now) {
                Ok(_) => released += 1,
                Err(e) => log::warn!("releasing lapsed writes on {}: {}", id, e),
            }
        }
        writes.retain(|_, array| array.iter().any(Option::is_some));
        if released > 0 {
            log::info!("released lapsed writes on {} points", released);
        }
        released
    }

    pub fn store(&self) -> &MemoryStore {
        &self.store
    }

    fn require(&self, id: &Ref) -> Result<()> {
        if self.store.read_by_id(id).is_some() {
            Ok(())
        } else {
            Err(HaystackError::UnknownRecord(id.clone()))
        }
    }

    /// Set `writeVal`/`writeLevel` on the record from the highest active
    /// level, or remove both when no level is set
    fn commit_winner(&self, id: &Ref, array: &WriteArray, now: DateTime<Utc>) -> Result<u64> {
        let winner = array
            .iter()
            .enumerate()
            .find_map(|(i, e)| e.as_ref().filter(|e| e.active(now)).map(|e| (i + 1, e)));
        self.store.update(id, |tags| match winner {
            Some((level, entry)) => {
                tags.set("writeVal", entry.val.clone())
                    .set("writeLevel", Num::from(level as i32));
            }
            None => {
                tags.remove("writeVal");
                tags.remove("writeLevel");
            }
        })
    }

    fn write_array_grid(id: &Ref, array: Option<&WriteArray>, now: DateTime<Utc>) -> Grid {
        let rows = (1..=WRITE_LEVELS)
            .map(|level| {
                let mut row = Dict::new();
                row.set("level", Num::from(level as i32))
                    .set("levelDis", level_dis(level));
                let entry = array
                    .and_then(|a| a[(level - 1) as usize].as_ref())
                    .filter(|e| e.active(now));
                if let Some(entry) = entry {
                    row.set("val", entry.val.clone())
                        .set("who", entry.who.as_str());
                    if let Some(expires) = entry.expires {
                        row.set("expires", expires);
                    }
                }
                row
            })
            .collect();
        let mut meta = Dict::new();
        meta.set("id", id.clone());
        Grid::from_rows(meta, rows)
    }
}

impl RecordStore for MemoryBackend {
    fn read_by_id(&self, id: &Ref) -> Option<Record> {
        self.store.read_by_id(id)
    }

    fn read_by_ids(&self, ids: &[Ref]) -> Vec<Option<Record>> {
        self.store.read_by_ids(ids)
    }
}

impl Backend for MemoryBackend {
    fn ops(&self) -> Result<Grid> {
        let rows = OPS
            .iter()
            .map(|(name, summary)| {
                let mut row = Dict::new();
                row.set("name", *name).set("summary", *summary);
                row
            })
            .collect();
        Ok(Grid::from_rows(Dict::new(), rows))
    }

    fn formats(&self) -> Result<Grid> {
        let mut json = Dict::new();
        json.set("mime", "application/json")
            .set("receive", Val::Marker)
            .set("send", Val::Marker);
        Ok(Grid::from_rows(Dict::new(), vec![json]))
    }

    fn his_read(&self, id: &Ref, range: &HisRange) -> Result<Grid> {
        self.require(id)?;
        let his = self.his.read();
        let rows = his
            .get(id)
            .into_iter()
            .flatten()
            .filter(|item| range.contains(&item.ts))
            .map(|item| {
                let mut row = Dict::new();
                row.set("ts", item.ts).set("val", item.val.clone());
                row
            })
            .collect();

        let mut meta = Dict::new();
        meta.set("id", id.clone())
            .set("hisStart", range.start)
            .set("hisEnd", range.end);
        Ok(Grid::from_rows(meta, rows))
    }

    fn his_write(&self, id: &Ref, items: &[HisItem]) -> Result<()> {
        let mut his = self.his.write();
        self.require(id)?;
        let series = his.entry(id.clone()).or_default();
        for item in items {
            match series.binary_search_by(|held| held.ts.cmp(&item.ts)) {
                Ok(pos) => series[pos] = item.clone(),
                Err(pos) => series.insert(pos, item.clone()),
            }
        }
        log::debug!("{} history samples for {}", series.len(), id);
        Ok(())
    }

    fn point_write(
        &self,
        id: &Ref,
        level: u8,
        who: &str,
        val: Option<Val>,
        dur: Option<Num>,
    ) -> Result<Grid> {
        if !(1..=WRITE_LEVELS).contains(&level) {
            return Err(HaystackError::InvalidArgument(format!(
                "write level {level} outside 1-{WRITE_LEVELS}"
            )));
        }
        let now = Utc::now();
        let expires = match dur {
            Some(dur) => {
                let delta = TimeDelta::from_std(dur.as_duration()?)
                    .map_err(|e| HaystackError::InvalidArgument(e.to_string()))?;
                let at = now.checked_add_signed(delta).ok_or_else(|| {
                    HaystackError::InvalidArgument(format!("write duration {dur} out of range"))
                })?;
                Some(at)
            }
            None => None,
        };

        let mut writes = self.writes.write();
        self.require(id)?;
        let mut array = writes.get(id).cloned().unwrap_or_default();
        drop_expired(&mut array, now);
        array[(level - 1) as usize] = val.map(|val| WriteEntry {
            val,
            who: who.to_string(),
            expires,
        });

        // the array is only kept once the record accepted its new winner
        self.commit_winner(id, &array, now)?;
        let grid = Self::write_array_grid(id, Some(&array), now);
        if array.iter().any(Option::is_some) {
            writes.insert(id.clone(), array);
        } else {
            writes.remove(id);
        }
        Ok(grid)
    }

    fn point_write_array(&self, id: &Ref) -> Result<Grid> {
        let now = Utc::now();
        let mut writes = self.writes.write();
        self.require(id)?;
        if let Some(array) = writes.get_mut(id) {
            if drop_expired(array, now) {
                self.commit_winner(id, array, now)?;
            }
        }
        Ok(Self::write_array_grid(id, writes.get(id), now))
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::{ErrorKind, dict};

    fn r(id: &str) -> Ref {
        Ref::new(id).unwrap()
    }

    fn ts(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, hour, 0, 0).unwrap()
    }

    fn backend() -> MemoryBackend {
        let backend = MemoryBackend::new();
        backend
            .commit(dict! { "id" => r("p"), "point" => Val::Marker, "writable" => Val::Marker })
            .unwrap();
        backend
    }

    #[test]
    fn his_write_merges_by_timestamp() {
        let backend = backend();
        backend
            .his_write(
                &r("p"),
                &[
                    HisItem { ts: ts(3), val: Val::from(3.0) },
                    HisItem { ts: ts(1), val: Val::from(1.0) },
                ],
            )
            .unwrap();
        backend
            .his_write(
                &r("p"),
                &[
                    HisItem { ts: ts(2), val: Val::from(2.0) },
                    HisItem { ts: ts(3), val: Val::from(30.0) },
                ],
            )
            .unwrap();

        let grid = backend
            .his_read(&r("p"), &HisRange::new(ts(0), ts(4)).unwrap())
            .unwrap();
        let vals: Vec<_> = grid.rows().map(|row| row.get("val").cloned()).collect();
        assert_eq!(
            vals,
            vec![
                Some(Val::from(1.0)),
                Some(Val::from(2.0)),
                Some(Val::from(30.0))
            ]
        );
        assert_eq!(grid.meta().get("id"), Some(&Val::from(r("p"))));
        assert_eq!(grid.meta().get("hisStart"), Some(&Val::from(ts(0))));
    }

    #[test]
    fn his_read_range_is_half_open() {
        let backend = backend();
        let items: Vec<_> = (1..=4)
            .map(|h| HisItem { ts: ts(h), val: Val::from(h as f64) })
            .collect();
        backend.his_write(&r("p"), &items).unwrap();

        let grid = backend
            .his_read(&r("p"), &HisRange::new(ts(2), ts(4)).unwrap())
            .unwrap();
        assert_eq!(grid.len(), 2);
        assert_eq!(grid.row(0).unwrap().get("ts"), Some(&Val::from(ts(2))));
    }

    #[test]
    fn history_requires_known_point() {
        let backend = backend();
        let err = backend.his_write(&r("nope"), &[]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnknownRecord);
        let range = HisRange::new(ts(0), ts(1)).unwrap();
        assert_eq!(
            backend.his_read(&r("nope"), &range).unwrap_err().kind(),
            ErrorKind::UnknownRecord
        );
    }

    #[test]
    fn highest_priority_level_wins() {
        let backend = backend();
        backend
            .point_write(&r("p"), 16, "default", Some(Val::from(70.0)), None)
            .unwrap();
        let grid = backend
            .point_write(&r("p"), 8, "operator", Some(Val::from(65.0)), None)
            .unwrap();
        assert_eq!(grid.len(), WRITE_LEVELS as usize);

        let manual = grid.row(7).unwrap();
        assert_eq!(manual.get("levelDis"), Some(&Val::from("manual")));
        assert_eq!(manual.get("who"), Some(&Val::from("operator")));
        assert!(grid.row(0).unwrap().get("val").is_none());

        let tags = backend.read_by_id(&r("p")).unwrap().tags;
        assert_eq!(tags.get("writeVal"), Some(&Val::from(65.0)));
        assert_eq!(tags.get("writeLevel"), Some(&Val::from(8.0)));

        // releasing level 8 falls back to 16, releasing 16 clears
        backend.point_write(&r("p"), 8, "operator", None, None).unwrap();
        let tags = backend.read_by_id(&r("p")).unwrap().tags;
        assert_eq!(tags.get("writeLevel"), Some(&Val::from(16.0)));

        backend.point_write(&r("p"), 16, "default", None, None).unwrap();
        let tags = backend.read_by_id(&r("p")).unwrap().tags;
        assert!(!tags.has("writeVal"));
        assert!(!tags.has("writeLevel"));
    }

    #[test]
    fn point_write_bumps_record_version() {
        let backend = backend();
        let before = backend.read_by_id(&r("p")).unwrap().version;
        backend
            .point_write(&r("p"), 10, "me", Some(Val::from(1.0)), None)
            .unwrap();
        assert!(backend.read_by_id(&r("p")).unwrap().version > before);
    }

    #[test]
    fn point_write_validates_level_and_duration() {
        let backend = backend();
        for level in [0, 18] {
            let err = backend
                .point_write(&r("p"), level, "me", Some(Val::from(1.0)), None)
                .unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        }

        let err = backend
            .point_write(
                &r("p"),
                8,
                "me",
                Some(Val::from(1.0)),
                Some(Num::with_unit(5.0, "kW").unwrap()),
            )
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidOperation);
        assert!(!backend.read_by_id(&r("p")).unwrap().tags.has("writeVal"));
    }

    #[test]
    fn timed_write_reports_expiry() {
        let backend = backend();
        let grid = backend
            .point_write(
                &r("p"),
                8,
                "me",
                Some(Val::from(1.0)),
                Some(Num::with_unit(5.0, "min").unwrap()),
            )
            .unwrap();
        assert!(matches!(
            grid.row(7).unwrap().get("expires"),
            Some(Val::DateTime(_))
        ));

        let array = backend.point_write_array(&r("p")).unwrap();
        assert_eq!(array.row(7).unwrap().get("val"), Some(&Val::from(1.0)));
    }

    #[test]
    fn write_duration_beyond_calendar_range_is_rejected() {
        let backend = backend();
        let err = backend
            .point_write(
                &r("p"),
                8,
                "me",
                Some(Val::from(1.0)),
                Some(Num::with_unit(1e12, "hr").unwrap()),
            )
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        assert!(!backend.read_by_id(&r("p")).unwrap().tags.has("writeVal"));
    }

    #[test]
    fn lapsed_writes_release_the_record() {
        let backend = backend();
        backend
            .point_write(&r("p"), 16, "default", Some(Val::from(70.0)), None)
            .unwrap();
        backend
            .point_write(
                &r("p"),
                8,
                "me",
                Some(Val::from(1.0)),
                Some(Num::with_unit(10.0, "ms").unwrap()),
            )
            .unwrap();
        let before = backend.read_by_id(&r("p")).unwrap();
        assert_eq!(before.tags.get("writeLevel"), Some(&Val::from(8.0)));

        assert_eq!(backend.expire_writes(Utc::now()), 0);
        let later = Utc::now() + TimeDelta::milliseconds(50);
        assert_eq!(backend.expire_writes(later), 1);
        assert_eq!(backend.expire_writes(later), 0);

        let after = backend.read_by_id(&r("p")).unwrap();
        assert!(after.version > before.version);
        assert_eq!(after.tags.get("writeVal"), Some(&Val::from(70.0)));
        assert_eq!(after.tags.get("writeLevel"), Some(&Val::from(16.0)));
    }

    #[test]
    fn write_array_read_releases_lapsed_level() {
        let backend = backend();
        backend
            .point_write(
                &r("p"),
                8,
                "me",
                Some(Val::from(1.0)),
                Some(Num::with_unit(10.0, "ms").unwrap()),
            )
            .unwrap();
        std::thread::sleep(std::time::Duration::from_millis(50));

        let array = backend.point_write_array(&r("p")).unwrap();
        assert!(array.row(7).unwrap().get("val").is_none());
        let tags = backend.read_by_id(&r("p")).unwrap().tags;
        assert!(!tags.has("writeVal"));
        assert!(!tags.has("writeLevel"));
    }

    #[test]
    fn write_to_removed_point_leaves_no_array() {
        let backend = backend();
        backend.remove(&r("p")).unwrap();
        let err = backend
            .point_write(&r("p"), 8, "me", Some(Val::from(1.0)), None)
            .unwrap_err();
        assert_eq!(err, HaystackError::UnknownRecord(r("p")));
        assert!(backend.writes.read().get(&r("p")).is_none());

        backend.commit(dict! { "id" => r("p") }).unwrap();
        let array = backend.point_write_array(&r("p")).unwrap();
        assert!(array.rows().all(|row| row.get("val").is_none()));
    }

    #[test]
    fn remove_races_with_writes_without_orphans() {
        let backend = std::sync::Arc::new(backend());
        let writer = {
            let backend = backend.clone();
            std::thread::spawn(move || {
                for i in 0..200 {
                    let _ = backend.point_write(&r("p"), 8, "me", Some(Val::from(i as f64)), None);
                    let _ = backend.his_write(&r("p"), &[HisItem { ts: ts(1), val: Val::from(1.0) }]);
                }
            })
        };
        for _ in 0..200 {
            backend.remove(&r("p"));
            backend
                .commit(dict! { "id" => r("p"), "writable" => Val::Marker })
                .unwrap();
        }
        backend.remove(&r("p"));
        writer.join().unwrap();

        // writes that lost the race to the final remove left nothing behind
        assert!(backend.read_by_id(&r("p")).is_none());
        assert!(backend.writes.read().is_empty());
        assert!(backend.his.read().is_empty());
    }

    #[test]
    fn commit_all_is_all_or_nothing() {
        let backend = MemoryBackend::new();
        let err = backend
            .commit_all(vec![
                dict! { "id" => r("a") },
                dict! { "dis" => "no id" },
            ])
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        assert!(backend.store().is_empty());

        let versions = backend
            .commit_all(vec![dict! { "id" => r("a") }, dict! { "id" => r("b") }])
            .unwrap();
        assert_eq!(versions.len(), 2);
        assert!(versions[0] < versions[1]);
    }

    #[test]
    fn remove_drops_history_and_writes() {
        let backend = backend();
        backend
            .his_write(&r("p"), &[HisItem { ts: ts(1), val: Val::from(1.0) }])
            .unwrap();
        assert!(backend.remove(&r("p")).is_some());
        assert!(backend.remove(&r("p")).is_none());

        backend.commit(dict! { "id" => r("p") }).unwrap();
        let grid = backend
            .his_read(&r("p"), &HisRange::new(ts(0), ts(5)).unwrap())
            .unwrap();
        assert!(grid.is_empty());
    }

    #[test]
    fn ops_and_formats() {
        let backend = MemoryBackend::new();
        let ops = backend.ops().unwrap();
        assert!(ops.rows().any(|row| row.get("name") == Some(&Val::from("watchSub"))));
        let formats = backend.formats().unwrap();
        assert_eq!(
            formats.row(0).unwrap().get("mime"),
            Some(&Val::from("application/json"))
        );
        assert_eq!(
            backend
                .invoke_action(&r("p"), "reset", &Dict::new(), None)
                .unwrap_err(),
            HaystackError::NotImplemented("invokeAction")
        );
    }
}
