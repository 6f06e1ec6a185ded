//! SQLite-backed store
//!
//! One table, one row per (service, uid, feature). Features are stored as
//! the bit pattern of the u64 in an INTEGER column.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::debug;

use super::{parse_answer, parse_timestamp, Store, Verdict};
use crate::error::StoreError;
use crate::request::Answer;

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Create or open the database at `path`
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Unreachable(format!("{}: {}", parent.display(), e)))?;
        }

        let conn = Connection::open(path)?;
        debug!("Opened trust store {}", path.display());

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<(), StoreError> {
        self.conn().execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS verdicts (
                service TEXT NOT NULL,
                uid INTEGER NOT NULL,
                feature INTEGER NOT NULL,
                answer TEXT NOT NULL,
                decided_at TEXT NOT NULL,
                PRIMARY KEY (service, uid, feature)
            );

            CREATE INDEX IF NOT EXISTS idx_verdicts_decided_at ON verdicts(service, decided_at);
            "#,
        )?;
        Ok(())
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Store for SqliteStore {
    fn lookup(&self, service: &str, uid: u32, feature: u64) -> Result<Option<Answer>, StoreError> {
        let token: Option<String> = self
            .conn()
            .query_row(
                "SELECT answer FROM verdicts WHERE service = ?1 AND uid = ?2 AND feature = ?3",
                params![service, uid, feature as i64],
                |row| row.get(0),
            )
            .optional()?;

        token.as_deref().map(parse_answer).transpose()
    }

    fn record(&self, service: &str, uid: u32, feature: u64, answer: Answer) -> Result<(), StoreError> {
        self.conn().execute(
            "INSERT INTO verdicts (service, uid, feature, answer, decided_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT (service, uid, feature)
             DO UPDATE SET answer = excluded.answer, decided_at = excluded.decided_at",
            params![service, uid, feature as i64, answer.as_str(), Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    fn records(&self, service: &str) -> Result<Vec<Verdict>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT uid, feature, answer, decided_at FROM verdicts
             WHERE service = ?1 ORDER BY decided_at, uid, feature",
        )?;

        let rows = stmt.query_map(params![service], |row| {
            Ok((
                row.get::<_, u32>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;

        let mut records = Vec::new();
        for row in rows {
            let (uid, feature, answer, decided_at) = row?;
            records.push(Verdict {
                uid,
                feature: feature as u64,
                answer: parse_answer(&answer)?,
                decided_at: parse_timestamp(&decided_at)?,
            });
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_record_and_lookup() {
        let dir = tempdir().unwrap();
        let store = SqliteStore::open(&dir.path().join("stores/camera.db")).unwrap();

        assert_eq!(store.lookup("camera", 1000, 5).unwrap(), None);
        store.record("camera", 1000, 5, Answer::Denied).unwrap();
        assert_eq!(store.lookup("camera", 1000, 5).unwrap(), Some(Answer::Denied));

        store.record("camera", 1000, 5, Answer::Granted).unwrap();
        assert_eq!(store.lookup("camera", 1000, 5).unwrap(), Some(Answer::Granted));
        assert_eq!(store.records("camera").unwrap().len(), 1);
    }

    #[test]
    fn test_full_range_features() {
        let dir = tempdir().unwrap();
        let store = SqliteStore::open(&dir.path().join("t.db")).unwrap();

        store.record("camera", u32::MAX, u64::MAX, Answer::Granted).unwrap();
        assert_eq!(store.lookup("camera", u32::MAX, u64::MAX).unwrap(), Some(Answer::Granted));

        let records = store.records("camera").unwrap();
        assert_eq!(records[0].uid, u32::MAX);
        assert_eq!(records[0].feature, u64::MAX);
    }

    #[test]
    fn test_verdicts_survive_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.db");

        {
            let store = SqliteStore::open(&path).unwrap();
            for feature in 0..5 {
                store.record("camera", 1000, feature, Answer::Denied).unwrap();
            }
        }

        let store = SqliteStore::open(&path).unwrap();
        let records = store.records("camera").unwrap();
        assert_eq!(records.len(), 5);
        assert!(records.iter().all(|r| r.answer == Answer::Denied));
    }

    #[test]
    fn test_corrupt_answer_is_reported() {
        let dir = tempdir().unwrap();
        let store = SqliteStore::open(&dir.path().join("t.db")).unwrap();
        store
            .conn()
            .execute(
                "INSERT INTO verdicts VALUES ('camera', 1000, 1, 'perhaps', '2026-01-01T00:00:00+00:00')",
                [],
            )
            .unwrap();

        assert!(matches!(store.lookup("camera", 1000, 1), Err(StoreError::Corrupt(_))));
    }
}
