//! Age- and size-driven purge of the readings table.
//!
//! A purge cycle snapshots the rowid range present when it starts, locates
//! the highest eligible rowid with a binary search, then deletes upward in
//! adaptively sized blocks, yielding to writers between blocks. Row
//! ordinals and ids are co-monotonic, which is what lets the locator
//! binary-search rowids against a timestamp predicate.

use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use rusqlite::types::Value as SqlValue;
use tracing::{debug, info};

use foglamp_types::PurgeResult;

use crate::error::Result;
use crate::gate::RECALC_PURGE_BLOCK_SIZE_NUM_BLOCKS;
use crate::store::ReadingsStore;

/// Purge flag bit 0: retain rows the north-bound sender has not
/// acknowledged (`id > sent`).
pub const FLAG_RETAIN_UNSENT: u32 = 0x01;

/// A delete block slower than this triggers a yield nap.
const BLOCK_SLOW_THRESHOLD: Duration = Duration::from_millis(150);

impl ReadingsStore {
    /// Purge readings older than `age` hours.
    ///
    /// `age == 0` derives the age from the oldest row, in 360-second
    /// units. Flag bit 0 retains unsent rows: nothing above `sent` is
    /// deleted. Returns the cycle's counters.
    pub fn purge_readings_by_age(&self, age: u64, flags: u32, sent: u64) -> Result<PurgeResult> {
        let Some((min_rowid, max_rowid)) = self.snapshot_rowid_range()? else {
            return Ok(PurgeResult::default());
        };

        let mut age = age;
        if age == 0 {
            // Remove the oldest data: derive the age from the data we
            // have and continue.
            let derived = self.query_scalar(
                "purge - phase 1",
                "SELECT (strftime('%s','now','utc') - strftime('%s', MIN(user_ts)))/360 \
                 FROM readings WHERE rowid <= ?1",
                &[SqlValue::Integer(max_rowid as i64)],
            )?;
            age = derived.unwrap_or(0).max(0) as u64;
        }

        let interval = format!("-{age} hours");
        self.purge_cycle(flags, sent, min_rowid, max_rowid, |store, rowid| {
            store.query_scalar(
                "purge - phase 1, fetching midRowId",
                "SELECT id FROM readings WHERE rowid = ?1 AND user_ts < datetime('now', ?2)",
                &[SqlValue::Integer(rowid as i64), SqlValue::Text(interval.clone())],
            )
        })
    }

    /// Purge the oldest readings until at most `max_rows` remain (subject
    /// to the retain-unsent flag).
    pub fn purge_readings_by_rows(
        &self,
        max_rows: u64,
        flags: u32,
        sent: u64,
    ) -> Result<PurgeResult> {
        let Some((min_rowid, max_rowid)) = self.snapshot_rowid_range()? else {
            return Ok(PurgeResult::default());
        };

        let count = self
            .query_scalar("purge - phase 0, counting rows", "SELECT count(rowid) FROM readings", &[])?
            .unwrap_or(0) as u64;
        if count <= max_rows {
            info!("No data to purge: {count} rows at or below the {max_rows} row target");
            return Ok(PurgeResult {
                readings_remaining: count,
                ..PurgeResult::default()
            });
        }

        self.purge_cycle(flags, sent, min_rowid, max_rowid, |store, rowid| {
            // Eligible while deleting through this rowid still leaves more
            // rows than the target.
            let remaining = store
                .query_scalar(
                    "purge - phase 1, counting remainder",
                    "SELECT count(rowid) FROM readings WHERE rowid > ?1",
                    &[SqlValue::Integer(rowid as i64)],
                )?
                .unwrap_or(0) as u64;
            Ok((remaining > max_rows).then_some(rowid as i64))
        })
    }

    /// Snapshot the rowid range the cycle is allowed to touch, so rows
    /// appended after the cycle starts can never be deleted by it and a
    /// fast producer cannot keep the purge running forever.
    fn snapshot_rowid_range(&self) -> Result<Option<(u64, u64)>> {
        info!("Purge starting...");
        let max_rowid = self.query_scalar(
            "purge - phase 0, fetching rowid limit",
            "SELECT max(rowid) FROM readings",
            &[],
        )?;
        let min_rowid = self.query_scalar(
            "purge - phase 0, fetching minrowid limit",
            "SELECT min(rowid) FROM readings",
            &[],
        )?;
        match (min_rowid, max_rowid) {
            (Some(min), Some(max)) => Ok(Some((min as u64, max as u64))),
            _ => {
                info!("No data to purge: readings table is empty");
                Ok(None)
            }
        }
    }

    /// The shared purge skeleton: locate the highest eligible rowid with a
    /// binary search over `eligible`, account for unsent rows, run the
    /// delete loop and assemble the counters.
    fn purge_cycle(
        &self,
        flags: u32,
        sent: u64,
        min_rowid: u64,
        max_rowid: u64,
        eligible: impl Fn(&Self, u64) -> Result<Option<i64>>,
    ) -> Result<PurgeResult> {
        let started = Instant::now();
        let retain_unsent = flags & FLAG_RETAIN_UNSENT != 0;

        let mut l = min_rowid;
        let mut r = if retain_unsent && sent != 0 {
            sent.min(max_rowid)
        } else {
            max_rowid
        };
        r = r.max(l);
        if l == r {
            info!("No data to purge: min_id == max_id == {min_rowid}");
            return Ok(PurgeResult::default());
        }

        // Binary search for the largest rowid satisfying the predicate.
        // Terminates as soon as the midpoint stops moving.
        let mut m = l;
        while l <= r {
            let prev_m = m;
            m = l + (r - l) / 2;
            if prev_m == m {
                break;
            }
            if eligible(self, m)?.is_none() {
                // Mid row doesn't satisfy the condition: look in the
                // earlier half.
                r = m - 1;
            } else {
                l = m + 1;
            }
        }
        let rowid_limit = m;

        if rowid_limit == min_rowid {
            info!("No data to purge");
            return Ok(PurgeResult::default());
        }

        let mut unsent_purged: u64 = 0;
        if !retain_unsent && sent != 0 {
            let last_purged_id = self.query_scalar(
                "purge - phase 2, fetching last purged id",
                "SELECT id FROM readings WHERE rowid = ?1",
                &[SqlValue::Integer(rowid_limit as i64)],
            )?;
            if last_purged_id.is_some_and(|id| id as u64 > sent) {
                // Unsent readings are about to be purged
                unsent_purged = rowid_limit - sent;
            }
        }

        self.gate.spin_until_drained();

        info!("Purge about to delete readings # {min_rowid} to {rowid_limit}");
        let (deleted, blocks) = self.delete_in_blocks(min_rowid, rowid_limit)?;

        let unsent_retained = max_rowid - rowid_limit;
        let readings_remaining = (max_rowid - min_rowid).saturating_sub(deleted);
        if sent == 0 {
            // No north process in play: everything purged was unsent.
            unsent_purged = deleted;
        }

        info!(
            "Purge process complete in {blocks} blocks in {}uS",
            started.elapsed().as_micros()
        );
        Ok(PurgeResult {
            removed: deleted,
            unsent_purged,
            unsent_retained,
            readings_remaining,
        })
    }

    /// Delete `rowid <= cursor` in adaptively sized blocks up to `limit`,
    /// yielding to writers before each block and napping after slow ones.
    fn delete_in_blocks(&self, min_rowid: u64, limit: u64) -> Result<(u64, u32)> {
        let mut cursor = min_rowid;
        let mut deleted: u64 = 0;
        let mut blocks: u32 = 0;
        let mut block_size = self.last_block_size.load(Ordering::Relaxed);

        while cursor < limit {
            blocks += 1;
            cursor = (cursor + block_size).min(limit);

            let sql = format!("DELETE FROM readings WHERE rowid <= {cursor};");
            debug!(operation = "ReadingsPurge", %sql, "executing");

            // Let any in-flight append finish before taking the database.
            self.gate.wait_writers_drained();
            let elapsed;
            let affected;
            {
                let conn = self.writer.lock().unwrap();
                let block_start = Instant::now();
                affected = crate::store::retry_on_busy("purge - phase 3", || {
                    conn.execute(&sql, [])
                })?;
                elapsed = block_start.elapsed();
            }
            if elapsed > BLOCK_SLOW_THRESHOLD {
                // Yield the database to other threads for a while.
                std::thread::sleep(Duration::from_millis(
                    100 + elapsed.as_micros() as u64 / 10_000,
                ));
            }

            deleted += affected as u64;
            debug!("Purge delete block #{blocks} with {affected} readings");

            block_size = self.sizer.lock().unwrap().next_size(elapsed);
            if blocks % RECALC_PURGE_BLOCK_SIZE_NUM_BLOCKS == 0 {
                std::thread::sleep(Duration::from_millis(100));
            }
        }

        self.last_block_size.store(block_size, Ordering::Relaxed);
        Ok((deleted, blocks))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use time::format_description::BorrowedFormatItem;
    use time::macros::format_description;
    use time::OffsetDateTime;

    const USER_TS: &[BorrowedFormatItem<'_>] = format_description!(
        "[year]-[month]-[day] [hour]:[minute]:[second].[subsecond digits:6]+00:00"
    );

    fn ts_hours_ago(hours: f64) -> String {
        let dt = OffsetDateTime::now_utc() - time::Duration::seconds_f64(hours * 3600.0);
        dt.format(&USER_TS).unwrap()
    }

    fn append_at(store: &ReadingsStore, asset: &str, user_ts: &str) {
        let payload = json!({
            "readings": [{ "asset_code": asset, "user_ts": user_ts, "reading": {} }]
        });
        assert_eq!(store.append_readings(&payload.to_string()).unwrap(), 1);
    }

    fn count(store: &ReadingsStore) -> i64 {
        store.retrieve_readings("{}").unwrap()["count"]
            .as_i64()
            .unwrap()
    }

    #[test]
    fn test_purge_empty_table_is_idempotent() {
        let store = ReadingsStore::open_in_memory().unwrap();
        assert_eq!(
            store.purge_readings_by_age(0, 0, 0).unwrap(),
            PurgeResult::default()
        );
        assert_eq!(
            store.purge_readings_by_age(0, 0, 0).unwrap(),
            PurgeResult::default()
        );
    }

    #[test]
    fn test_purge_by_age_removes_old_half() {
        let store = ReadingsStore::open_in_memory().unwrap();
        // Oldest first, spanning 48 hours, so rowids and ages line up.
        for i in 0..100 {
            append_at(&store, "a", &ts_hours_ago(48.0 - 48.0 * f64::from(i) / 100.0));
        }

        let result = store.purge_readings_by_age(24, 0, 0).unwrap();
        assert!((45..=55).contains(&result.removed), "removed {}", result.removed);
        assert_eq!(result.unsent_purged, result.removed);
        assert_eq!(result.readings_remaining, 99 - result.removed);
        assert_eq!(count(&store) as u64, 100 - result.removed);

        // Everything left is newer than the cutoff
        let set = store
            .retrieve_readings(
                r#"{"where":{"column":"user_ts","condition":"older","value":86400}}"#,
            )
            .unwrap();
        assert_eq!(set["count"], 0);
    }

    #[test]
    fn test_purge_never_touches_rows_above_snapshot() {
        let store = ReadingsStore::open_in_memory().unwrap();
        for _ in 0..10 {
            append_at(&store, "a", &ts_hours_ago(30.0));
        }
        let max_before = 10;
        store.purge_readings_by_age(1, 0, 0).unwrap();

        append_at(&store, "late", &ts_hours_ago(0.0));
        let set = store.fetch_readings(1, 100).unwrap();
        let ids: Vec<i64> = set["rows"]
            .as_array()
            .unwrap()
            .iter()
            .map(|r| r["id"].as_i64().unwrap())
            .collect();
        assert!(ids.iter().all(|&id| id > max_before));
    }

    #[test]
    fn test_purge_retains_unsent_rows() {
        let store = ReadingsStore::open_in_memory().unwrap();
        for i in 0..10 {
            append_at(&store, &format!("a{i}"), &ts_hours_ago(20.0));
        }

        let result = store
            .purge_readings_by_age(1, FLAG_RETAIN_UNSENT, 5)
            .unwrap();
        assert!(result.removed <= 5);
        assert_eq!(result.unsent_purged, 0);
        assert_eq!(result.unsent_retained, 5);

        // Rows 6..10 are still fetchable
        let set = store.fetch_readings(6, 100).unwrap();
        assert_eq!(set["count"], 5);
    }

    #[test]
    fn test_purge_counts_unsent_overshoot() {
        let store = ReadingsStore::open_in_memory().unwrap();
        for _ in 0..10 {
            append_at(&store, "a", &ts_hours_ago(20.0));
        }

        // Not retaining: rows beyond sent=4 get purged and counted
        let result = store.purge_readings_by_age(1, 0, 4).unwrap();
        assert_eq!(result.removed, 10);
        assert_eq!(result.unsent_purged, 10 - 4);
    }

    #[test]
    fn test_purge_by_rows_caps_table_size() {
        let store = ReadingsStore::open_in_memory().unwrap();
        for _ in 0..50 {
            append_at(&store, "a", &ts_hours_ago(1.0));
        }

        let result = store.purge_readings_by_rows(10, 0, 0).unwrap();
        // The locator lands on the boundary or one row before it
        let remaining = count(&store) as u64;
        assert!((10..=11).contains(&remaining), "{remaining} rows left");
        assert_eq!(result.removed, 50 - remaining);
    }

    #[test]
    fn test_purge_by_rows_noop_under_target() {
        let store = ReadingsStore::open_in_memory().unwrap();
        for _ in 0..5 {
            append_at(&store, "a", &ts_hours_ago(1.0));
        }
        let result = store.purge_readings_by_rows(10, 0, 0).unwrap();
        assert_eq!(result.removed, 0);
        assert_eq!(result.readings_remaining, 5);
        assert_eq!(count(&store), 5);
    }

    #[test]
    fn test_purge_age_zero_derivation_is_conservative() {
        let store = ReadingsStore::open_in_memory().unwrap();
        for _ in 0..5 {
            append_at(&store, "a", &ts_hours_ago(2.0));
        }
        // Age 0 derives six-minute units from the oldest row; the derived
        // cutoff lands far before the data, so nothing qualifies.
        let result = store.purge_readings_by_age(0, 0, 0).unwrap();
        assert_eq!(result.removed, 0);
        assert_eq!(count(&store), 5);
    }

    #[test]
    fn test_purge_runs_alongside_appends() {
        use std::sync::Arc;

        let store = Arc::new(ReadingsStore::open_in_memory().unwrap());
        for _ in 0..200 {
            append_at(&store, "old", &ts_hours_ago(30.0));
        }

        let appender = {
            let store = Arc::clone(&store);
            std::thread::spawn(move || {
                for _ in 0..50 {
                    append_at(&store, "new", &ts_hours_ago(0.0));
                }
            })
        };
        let result = store.purge_readings_by_age(1, 0, 0).unwrap();
        appender.join().unwrap();

        // Every old row is gone. The locator may overshoot the eligibility
        // boundary by a single row, so at most one new row went with them.
        assert!(result.removed >= 200, "removed {}", result.removed);
        let set = store
            .retrieve_readings(
                r#"{"aggregate":{"operation":"count","column":"*"},
                    "where":{"column":"asset_code","condition":"=","value":"new"}}"#,
            )
            .unwrap();
        assert!(set["rows"][0]["count_*"].as_i64().unwrap() >= 49);
    }

    #[test]
    fn test_purge_respects_synthetic_block_sizer() {
        use crate::gate::BlockSizer;

        struct FixedSizer(u64);
        impl BlockSizer for FixedSizer {
            fn next_size(&mut self, _last: Duration) -> u64 {
                self.0
            }
        }

        let store = ReadingsStore::open_in_memory()
            .unwrap()
            .with_block_sizer(Box::new(FixedSizer(7)));
        for _ in 0..40 {
            append_at(&store, "a", &ts_hours_ago(20.0));
        }
        let result = store.purge_readings_by_age(1, 0, 0).unwrap();
        assert_eq!(result.removed, 40);
    }
}
