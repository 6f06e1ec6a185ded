//! Trust store: verdicts keyed by (service, uid, feature)
//!
//! A record is overwritten as a whole when a feature is decided again.

pub mod bus;
pub mod memory;
pub mod sqlite;

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;

use crate::error::StoreError;
use crate::request::Answer;

pub use self::bus::{expose, StoreClient};
pub use self::memory::MemoryStore;
pub use self::sqlite::SqliteStore;

/// One stored verdict of a service
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Verdict {
    pub uid: u32,
    pub feature: u64,
    pub answer: Answer,
    pub decided_at: DateTime<Utc>,
}

/// Persistence of decisions
pub trait Store: Send + Sync {
    fn lookup(&self, service: &str, uid: u32, feature: u64) -> Result<Option<Answer>, StoreError>;

    fn record(&self, service: &str, uid: u32, feature: u64, answer: Answer) -> Result<(), StoreError>;

    /// Every verdict of a service, oldest first
    fn records(&self, service: &str) -> Result<Vec<Verdict>, StoreError>;
}

pub(crate) fn parse_answer(token: &str) -> Result<Answer, StoreError> {
    token
        .parse()
        .map_err(|_| StoreError::Corrupt(format!("unknown answer {:?}", token)))
}

pub(crate) fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|_| StoreError::Corrupt(format!("bad timestamp {:?}", value)))
}

/// Open a database-backed store, or a memory store when `path` is `None`
pub fn open(path: Option<&Path>) -> Result<Arc<dyn Store>, StoreError> {
    Ok(match path {
        Some(path) => Arc::new(SqliteStore::open(path)?),
        None => Arc::new(MemoryStore::new()),
    })
}
