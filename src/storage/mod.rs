//! 検出記録ストア（SQLite）
//!
//! 1サイクル1行の追記のみ。タイムスタンプはローカル時刻 `YYYY-MM-DD HH:MM:SS`。

use crate::error::{Result, StudyBuddyError};
use chrono::{Duration, NaiveDate, NaiveDateTime};
use rusqlite::{params, Connection, Row};
use serde::Serialize;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use study_buddy_common::{AnalysisResult, DetectionRecord, NewDetectionRecord};
use tracing::{debug, info};

pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
pub const MAX_RECENT_LIMIT: usize = 200;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StorageStats {
    pub total: u64,
    pub today: u64,
    pub today_valid: u64,
    pub today_notified: u64,
}

#[derive(Clone)]
pub struct DetectionStore {
    conn: Arc<Mutex<Connection>>,
}

impl std::fmt::Debug for DetectionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DetectionStore").finish_non_exhaustive()
    }
}

impl DetectionStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.migrate()?;
        Ok(store)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| StudyBuddyError::Config("sqlite mutex poisoned".to_string()))
    }

    pub fn migrate(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS detection_records (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                image_path TEXT NOT NULL,
                is_valid INTEGER NOT NULL,
                failed_keys TEXT NOT NULL,
                should_notify INTEGER NOT NULL,
                analysis_json TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_detection_records_timestamp
            ON detection_records(timestamp);
            "#,
        )?;
        Ok(())
    }

    /// 追記して id を返す
    pub fn save(&self, record: &NewDetectionRecord) -> Result<i64> {
        let failed_keys = serde_json::to_string(&record.failed_keys)?;
        let analysis = serde_json::to_string(&record.analysis)?;
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO detection_records
                (timestamp, image_path, is_valid, failed_keys, should_notify, analysis_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                record.timestamp.format(TIMESTAMP_FORMAT).to_string(),
                record.image_path,
                record.is_valid,
                failed_keys,
                record.should_notify,
                analysis,
            ],
        )?;
        let id = conn.last_insert_rowid();
        debug!(id, is_valid = record.is_valid, "検出記録を保存");
        Ok(id)
    }

    /// 指定日の記録（新しい順）
    pub fn get_today(&self, date: NaiveDate) -> Result<Vec<DetectionRecord>> {
        let (start, end) = day_bounds(date);
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, timestamp, image_path, is_valid, failed_keys, should_notify, analysis_json
             FROM detection_records
             WHERE timestamp >= ?1 AND timestamp < ?2
             ORDER BY timestamp DESC, id DESC",
        )?;
        let rows = stmt.query_map(params![start, end], record_from_row)?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    /// 直近 limit 件（新しい順、上限 MAX_RECENT_LIMIT）
    pub fn get_recent(&self, limit: usize) -> Result<Vec<DetectionRecord>> {
        let limit = limit.min(MAX_RECENT_LIMIT) as i64;
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, timestamp, image_path, is_valid, failed_keys, should_notify, analysis_json
             FROM detection_records
             ORDER BY timestamp DESC, id DESC
             LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit], record_from_row)?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    pub fn stats(&self, date: NaiveDate) -> Result<StorageStats> {
        let (start, end) = day_bounds(date);
        let conn = self.lock()?;
        let total: i64 = conn.query_row("SELECT COUNT(*) FROM detection_records", [], |row| row.get(0))?;
        let (today, today_valid, today_notified): (i64, i64, i64) = conn.query_row(
            "SELECT COUNT(*),
                    COALESCE(SUM(is_valid), 0),
                    COALESCE(SUM(should_notify), 0)
             FROM detection_records
             WHERE timestamp >= ?1 AND timestamp < ?2",
            params![start, end],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;
        Ok(StorageStats {
            total: total as u64,
            today: today as u64,
            today_valid: today_valid as u64,
            today_notified: today_notified as u64,
        })
    }

    /// 全削除（CLI の明示操作のみ）
    pub fn reset(&self) -> Result<usize> {
        let conn = self.lock()?;
        let deleted = conn.execute("DELETE FROM detection_records", [])?;
        info!(deleted, "検出記録を全削除");
        Ok(deleted)
    }
}

fn day_bounds(date: NaiveDate) -> (String, String) {
    let start = date.format("%Y-%m-%d 00:00:00").to_string();
    let end = (date + Duration::days(1)).format("%Y-%m-%d 00:00:00").to_string();
    (start, end)
}

fn conversion_error(index: usize, e: impl std::error::Error + Send + Sync + 'static) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(index, rusqlite::types::Type::Text, Box::new(e))
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<DetectionRecord> {
    let timestamp: String = row.get(1)?;
    let failed_keys: String = row.get(4)?;
    let analysis: String = row.get(6)?;

    Ok(DetectionRecord {
        id: row.get(0)?,
        timestamp: NaiveDateTime::parse_from_str(&timestamp, TIMESTAMP_FORMAT)
            .map_err(|e| conversion_error(1, e))?,
        image_path: row.get(2)?,
        is_valid: row.get(3)?,
        failed_keys: serde_json::from_str(&failed_keys).map_err(|e| conversion_error(4, e))?,
        should_notify: row.get(5)?,
        analysis: serde_json::from_str::<AnalysisResult>(&analysis).map_err(|e| conversion_error(6, e))?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn at(day: u32, h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 3, day).unwrap().and_hms_opt(h, m, 0).unwrap()
    }

    fn record(timestamp: NaiveDateTime, is_valid: bool) -> NewDetectionRecord {
        let analysis: AnalysisResult =
            serde_json::from_value(json!({"at_desk": true, "posture": if is_valid { "端正" } else { "歪坐" }}))
                .unwrap();
        NewDetectionRecord {
            timestamp,
            image_path: format!("/captures/{}.jpg", timestamp.format("%Y%m%d_%H%M%S")),
            is_valid,
            failed_keys: if is_valid { vec![] } else { vec!["posture".into()] },
            should_notify: !is_valid,
            analysis,
        }
    }

    #[test]
    fn test_save_and_read_back() {
        let store = DetectionStore::open_in_memory().unwrap();
        let id = store.save(&record(at(2, 9, 0), false)).unwrap();
        assert!(id > 0);

        let records = store.get_recent(10).unwrap();
        assert_eq!(records.len(), 1);
        let r = &records[0];
        assert_eq!(r.id, id);
        assert_eq!(r.timestamp, at(2, 9, 0));
        assert!(!r.is_valid);
        assert_eq!(r.failed_keys, vec!["posture"]);
        assert_eq!(r.analysis.value_str("posture").as_deref(), Some("歪坐"));
        let keys: Vec<&String> = r.analysis.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["at_desk", "posture"]);
    }

    #[test]
    fn test_recent_is_descending_and_limited() {
        let store = DetectionStore::open_in_memory().unwrap();
        store.save(&record(at(2, 9, 0), true)).unwrap();
        store.save(&record(at(2, 11, 0), true)).unwrap();
        store.save(&record(at(2, 10, 0), false)).unwrap();

        let recent = store.get_recent(2).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].timestamp, at(2, 11, 0));
        assert_eq!(recent[1].timestamp, at(2, 10, 0));
    }

    #[test]
    fn test_same_timestamp_orders_by_id() {
        let store = DetectionStore::open_in_memory().unwrap();
        let first = store.save(&record(at(2, 9, 0), true)).unwrap();
        let second = store.save(&record(at(2, 9, 0), false)).unwrap();
        let recent = store.get_recent(10).unwrap();
        assert_eq!(recent[0].id, second);
        assert_eq!(recent[1].id, first);
    }

    #[test]
    fn test_get_today_filters_by_date() {
        let store = DetectionStore::open_in_memory().unwrap();
        store.save(&record(at(1, 23, 59), true)).unwrap();
        store.save(&record(at(2, 0, 0), true)).unwrap();
        store.save(&record(at(2, 18, 30), false)).unwrap();
        store.save(&record(at(3, 0, 0), true)).unwrap();

        let today = store.get_today(NaiveDate::from_ymd_opt(2026, 3, 2).unwrap()).unwrap();
        assert_eq!(today.len(), 2);
        assert_eq!(today[0].timestamp, at(2, 18, 30));
        assert_eq!(today[1].timestamp, at(2, 0, 0));
    }

    #[test]
    fn test_stats() {
        let store = DetectionStore::open_in_memory().unwrap();
        store.save(&record(at(1, 9, 0), true)).unwrap();
        store.save(&record(at(2, 9, 0), true)).unwrap();
        store.save(&record(at(2, 9, 5), false)).unwrap();

        let stats = store.stats(NaiveDate::from_ymd_opt(2026, 3, 2).unwrap()).unwrap();
        assert_eq!(
            stats,
            StorageStats {
                total: 3,
                today: 2,
                today_valid: 1,
                today_notified: 1,
            }
        );
    }

    #[test]
    fn test_reset_and_persistence() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data").join("detection_records.db");
        {
            let store = DetectionStore::open(&path).unwrap();
            store.save(&record(at(2, 9, 0), true)).unwrap();
        }
        let store = DetectionStore::open(&path).unwrap();
        assert_eq!(store.get_recent(10).unwrap().len(), 1);
        assert_eq!(store.reset().unwrap(), 1);
        assert!(store.get_recent(10).unwrap().is_empty());
    }

    #[test]
    fn test_recent_limit_is_capped() {
        let store = DetectionStore::open_in_memory().unwrap();
        for i in 0..5 {
            store.save(&record(at(2, 9, i), true)).unwrap();
        }
        assert_eq!(store.get_recent(10_000).unwrap().len(), 5);
        assert!(store.get_recent(0).unwrap().is_empty());
    }
}
