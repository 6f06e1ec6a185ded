//! Volatile store, gone with the daemon

use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::{Store, Verdict};
use crate::error::StoreError;
use crate::request::Answer;

#[derive(Debug, Default)]
pub struct MemoryStore {
    verdicts: Mutex<HashMap<String, HashMap<(u32, u64), Verdict>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn verdicts(&self) -> MutexGuard<'_, HashMap<String, HashMap<(u32, u64), Verdict>>> {
        self.verdicts.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Store for MemoryStore {
    fn lookup(&self, service: &str, uid: u32, feature: u64) -> Result<Option<Answer>, StoreError> {
        Ok(self
            .verdicts()
            .get(service)
            .and_then(|verdicts| verdicts.get(&(uid, feature)))
            .map(|verdict| verdict.answer))
    }

    fn record(&self, service: &str, uid: u32, feature: u64, answer: Answer) -> Result<(), StoreError> {
        self.verdicts().entry(service.to_string()).or_default().insert(
            (uid, feature),
            Verdict {
                uid,
                feature,
                answer,
                decided_at: Utc::now(),
            },
        );
        Ok(())
    }

    fn records(&self, service: &str) -> Result<Vec<Verdict>, StoreError> {
        let mut records: Vec<Verdict> = self
            .verdicts()
            .get(service)
            .map(|verdicts| verdicts.values().cloned().collect())
            .unwrap_or_default();
        records.sort_by_key(|v| (v.decided_at, v.uid, v.feature));
        Ok(records)
    }
}
