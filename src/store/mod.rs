//! Durable feed-position store.
//!
//! One record per crawler process holds both cursors plus auxiliary
//! fields. Two interchangeable backends: a document store (MongoDB) and
//! a relational one (PostgreSQL). Backend errors are always transient
//! here; operations retry until they succeed so a slow store blocks the
//! crawler instead of dropping its position.

pub mod mongo;
pub mod postgres;

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::CrawlerConfig;
use crate::position::PositionPatch;

pub use mongo::MongoStore;
pub use postgres::PgStore;

pub const FORWARD_OFFSET_KEY: &str = "forward_offset";
pub const BACKWARD_OFFSET_KEY: &str = "backward_offset";
pub const LATEST_DATE_MODIFIED_KEY: &str = "latest_date_modified";
pub const EARLIEST_DATE_MODIFIED_KEY: &str = "earliest_date_modified";
pub const SERVER_ID_KEY: &str = "server_id";
pub const LOCK_DATE_MODIFIED_KEY: &str = "lock_date_modified";

/// Persisted feed position. Every field is optional; the crawlers only
/// resume when both offsets are present.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeedPosition {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub forward_offset: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backward_offset: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latest_date_modified: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub earliest_date_modified: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lock_date_modified: Option<bool>,
}

impl FeedPosition {
    /// The resume precondition: a checkpoint needs BOTH cursors.
    pub fn both_offsets(&self) -> Option<(String, String)> {
        match (&self.forward_offset, &self.backward_offset) {
            (Some(f), Some(b)) => Some((f.clone(), b.clone())),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("lock/unlock of date-modified is not supported by the relational backend")]
    NotSupported,
}

/// Tagged-variant position store, chosen once at startup.
pub enum Store {
    Document(MongoStore),
    Relational(PgStore),
    #[cfg(test)]
    Memory(memory::MemoryStore),
}

impl Store {
    /// Pick and connect a backend. Document store wins when both are
    /// configured; no backend at all refuses to start.
    pub async fn from_config(config: &CrawlerConfig) -> Result<Self> {
        if let Some(mongo) = &config.mongo {
            let store = MongoStore::connect(mongo, config.retry.db_error).await?;
            return Ok(Store::Document(store));
        }
        if let Some(postgres) = &config.postgres {
            if config.date_modified_lock.enabled {
                bail!(
                    "DATE_MODIFIED_LOCK_ENABLED requires the document-store backend \
                     (the relational backend cannot persist the latch)"
                );
            }
            let store = PgStore::connect(postgres.clone(), config.retry.db_error).await;
            return Ok(Store::Relational(store));
        }
        bail!("either MONGODB_URL or POSTGRES_HOST is required to store the crawler position")
    }

    /// Load the position record, or `None` when no checkpoint exists.
    pub async fn get(&self) -> Option<FeedPosition> {
        match self {
            Store::Document(s) => s.get().await,
            Store::Relational(s) => s.get().await,
            #[cfg(test)]
            Store::Memory(s) => s.get(),
        }
    }

    /// Upsert the fields present in `patch`, preserving the rest.
    pub async fn save(&self, patch: &PositionPatch) {
        match self {
            Store::Document(s) => s.save(patch).await,
            Store::Relational(s) => s.save(patch).await,
            #[cfg(test)]
            Store::Memory(s) => s.save(patch),
        }
    }

    /// Clear the cursor/session fields so the next bootstrap re-probes
    /// the feed head. Date-modified fields survive on the document
    /// backend; the relational backend deletes the whole row.
    pub async fn drop_position(&self) {
        match self {
            Store::Document(s) => s.drop_position().await,
            Store::Relational(s) => s.drop_position().await,
            #[cfg(test)]
            Store::Memory(s) => s.drop_position(),
        }
    }

    /// Engage the persisted `lock_date_modified` latch.
    pub async fn lock_date_modified(&self) -> Result<(), StoreError> {
        match self {
            Store::Document(s) => {
                s.set_lock_date_modified(true).await;
                Ok(())
            }
            Store::Relational(_) => Err(StoreError::NotSupported),
            #[cfg(test)]
            Store::Memory(s) => {
                s.set_lock_date_modified(true);
                Ok(())
            }
        }
    }

    /// Clear the persisted `lock_date_modified` latch.
    pub async fn unlock_date_modified(&self) -> Result<(), StoreError> {
        match self {
            Store::Document(s) => {
                s.set_lock_date_modified(false).await;
                Ok(())
            }
            Store::Relational(_) => Err(StoreError::NotSupported),
            #[cfg(test)]
            Store::Memory(s) => {
                s.set_lock_date_modified(false);
                Ok(())
            }
        }
    }

    /// Tear down backend connections.
    pub async fn close(&self) {
        match self {
            Store::Document(s) => s.close().await,
            Store::Relational(s) => s.close().await,
            #[cfg(test)]
            Store::Memory(_) => {}
        }
    }
}

#[cfg(test)]
pub mod memory {
    //! In-memory store double used by crawler and supervisor tests. It
    //! mirrors the document backend's semantics (field-merge saves,
    //! field-preserving drop) and records every mutation.

    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use super::{FeedPosition, PositionPatch};

    #[derive(Default)]
    pub struct MemoryStore {
        position: Mutex<Option<FeedPosition>>,
        pub saves: Mutex<Vec<PositionPatch>>,
        pub drops: AtomicUsize,
        pub locks: AtomicUsize,
        pub unlocks: AtomicUsize,
    }

    impl MemoryStore {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_position(position: FeedPosition) -> Self {
            let store = Self::new();
            *store.position.lock().unwrap() = Some(position);
            store
        }

        pub fn get(&self) -> Option<FeedPosition> {
            self.position.lock().unwrap().clone()
        }

        pub fn save(&self, patch: &PositionPatch) {
            self.saves.lock().unwrap().push(patch.clone());
            let mut guard = self.position.lock().unwrap();
            let record = guard.get_or_insert_with(FeedPosition::default);
            if let Some(v) = &patch.forward_offset {
                record.forward_offset = Some(v.clone());
            }
            if let Some(v) = &patch.backward_offset {
                record.backward_offset = Some(v.clone());
            }
            if let Some(v) = &patch.latest_date_modified {
                record.latest_date_modified = Some(v.clone());
            }
            if let Some(v) = &patch.earliest_date_modified {
                record.earliest_date_modified = Some(v.clone());
            }
            if let Some(v) = &patch.server_id {
                record.server_id = Some(v.clone());
            }
        }

        pub fn drop_position(&self) {
            self.drops.fetch_add(1, Ordering::Relaxed);
            if let Some(record) = self.position.lock().unwrap().as_mut() {
                record.forward_offset = None;
                record.backward_offset = None;
                record.server_id = None;
            }
        }

        pub fn set_lock_date_modified(&self, value: bool) {
            if value {
                self.locks.fetch_add(1, Ordering::Relaxed);
            } else {
                self.unlocks.fetch_add(1, Ordering::Relaxed);
            }
            let mut guard = self.position.lock().unwrap();
            let record = guard.get_or_insert_with(FeedPosition::default);
            record.lock_date_modified = Some(value);
        }

        pub fn save_count(&self) -> usize {
            self.saves.lock().unwrap().len()
        }

        pub fn drop_count(&self) -> usize {
            self.drops.load(Ordering::Relaxed)
        }
    }
}
