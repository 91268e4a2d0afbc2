//! Distributed single-writer lock.
//!
//! One TTL record per process name in the document store. The holder
//! refreshes `expireAt` on a fixed cadence; a crashed holder is reaped
//! by the store's TTL index. Losing the record to another instance is
//! unrecoverable: the only safe reaction is to vacate the process.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::{bail, Context, Result};
use mongodb::bson::{doc, DateTime, Document};
use mongodb::error::{ErrorKind, WriteFailure};
use mongodb::options::IndexOptions;
use mongodb::{Client, Collection, IndexModel};

use crate::config::{CrawlerConfig, LockConfig, MongoConfig};
use crate::run_flag::RunFlag;

/// Outcome of one lock-record write.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum LockWriteError {
    /// Another instance owns the record.
    DuplicateKey,
    Backend(String),
}

enum LockBackend {
    Mongo(Collection<Document>),
    #[cfg(test)]
    Memory(Arc<memory::MemoryLockBackend>),
}

impl Clone for LockBackend {
    fn clone(&self) -> Self {
        match self {
            LockBackend::Mongo(c) => LockBackend::Mongo(c.clone()),
            #[cfg(test)]
            LockBackend::Memory(m) => LockBackend::Memory(m.clone()),
        }
    }
}

impl LockBackend {
    async fn create_ttl_index(&self) -> Result<(), LockWriteError> {
        match self {
            LockBackend::Mongo(collection) => {
                let index = IndexModel::builder()
                    .keys(doc! {"expireAt": 1})
                    .options(
                        IndexOptions::builder()
                            .expire_after(Duration::from_secs(0))
                            .build(),
                    )
                    .build();
                collection
                    .create_index(index)
                    .await
                    .map(|_| ())
                    .map_err(map_error)
            }
            #[cfg(test)]
            LockBackend::Memory(_) => Ok(()),
        }
    }

    async fn try_insert(
        &self,
        process_name: &str,
        instance_id: &str,
        expire_at: DateTime,
    ) -> Result<(), LockWriteError> {
        match self {
            LockBackend::Mongo(collection) => collection
                .insert_one(doc! {
                    "_id": process_name,
                    "lockId": instance_id,
                    "expireAt": expire_at,
                })
                .await
                .map(|_| ())
                .map_err(map_error),
            #[cfg(test)]
            LockBackend::Memory(m) => m.pop_insert(),
        }
    }

    async fn refresh(
        &self,
        process_name: &str,
        instance_id: &str,
        expire_at: DateTime,
    ) -> Result<(), LockWriteError> {
        match self {
            LockBackend::Mongo(collection) => collection
                .update_one(
                    doc! {"_id": process_name, "lockId": instance_id},
                    doc! {"$set": {"expireAt": expire_at}},
                )
                .upsert(true)
                .await
                .map(|_| ())
                .map_err(map_error),
            #[cfg(test)]
            LockBackend::Memory(m) => m.pop_refresh(),
        }
    }

    async fn delete(&self, process_name: &str, instance_id: &str) -> Result<(), LockWriteError> {
        match self {
            LockBackend::Mongo(collection) => collection
                .delete_one(doc! {"_id": process_name, "lockId": instance_id})
                .await
                .map(|_| ())
                .map_err(map_error),
            #[cfg(test)]
            LockBackend::Memory(m) => m.record_delete(),
        }
    }
}

fn map_error(e: mongodb::error::Error) -> LockWriteError {
    if is_duplicate_key(&e) {
        LockWriteError::DuplicateKey
    } else {
        LockWriteError::Backend(e.to_string())
    }
}

fn is_duplicate_key(e: &mongodb::error::Error) -> bool {
    match e.kind.as_ref() {
        ErrorKind::Write(WriteFailure::WriteError(we)) => we.code == 11000,
        _ => false,
    }
}

/// The process-wide lock. Cloning shares the same instance id, so the
/// heartbeat task and the release path talk about the same record.
#[derive(Clone)]
pub struct ProcessLock {
    instance_id: String,
    backend: LockBackend,
    config: LockConfig,
    db_error_interval: Duration,
    terminate: Arc<dyn Fn() + Send + Sync>,
}

impl ProcessLock {
    pub async fn connect(
        mongo: &MongoConfig,
        config: &LockConfig,
        db_error_interval: Duration,
    ) -> Result<Self> {
        let client = Client::with_uri_str(&mongo.url)
            .await
            .context("connecting to the lock store")?;
        let collection = client
            .database(&mongo.database)
            .collection::<Document>(&config.collection);
        Ok(Self::with_backend(
            LockBackend::Mongo(collection),
            config.clone(),
            db_error_interval,
        ))
    }

    fn with_backend(backend: LockBackend, config: LockConfig, db_error_interval: Duration) -> Self {
        let instance_id = uuid::Uuid::new_v4().simple().to_string();
        tracing::info!("Lock initialized: {}", instance_id);
        Self {
            instance_id,
            backend,
            config,
            db_error_interval,
            terminate: Arc::new(sigterm_self),
        }
    }

    #[cfg(test)]
    fn for_tests(
        backend: Arc<memory::MemoryLockBackend>,
        config: LockConfig,
        db_error_interval: Duration,
        terminate: Arc<dyn Fn() + Send + Sync>,
    ) -> Self {
        Self {
            instance_id: "test-instance".to_string(),
            backend: LockBackend::Memory(backend),
            config,
            db_error_interval,
            terminate,
        }
    }

    /// TTL index so abandoned locks expire on their own.
    pub async fn init_index(&self) {
        if let Err(e) = self.backend.create_ttl_index().await {
            tracing::error!(
                message_id = "MONGODB_INDEX_CREATION_ERROR",
                "Lock index creation failed: {:?}",
                e
            );
        }
    }

    /// Insert the lock record, waiting out the current holder. Returns
    /// false when the stop flag fired before the lock was ours.
    pub async fn acquire(&self, flag: &RunFlag) -> bool {
        while flag.should_run() {
            match self
                .backend
                .try_insert(&self.config.process_name, &self.instance_id, self.expire_at())
                .await
            {
                Ok(()) => {
                    tracing::info!(
                        "Lock {} #{} acquired",
                        self.config.process_name,
                        self.instance_id
                    );
                    return true;
                }
                Err(e) => {
                    tracing::debug!("Lock not acquired: {:?}", e);
                    tokio::time::sleep(self.config.acquire_interval).await;
                }
            }
        }
        false
    }

    /// Heartbeat loop. A duplicate-key on the conditional upsert means
    /// our `expireAt` lapsed and another process took over; mutual
    /// exclusion is gone, so the whole process gets SIGTERM, once.
    pub async fn update(&self, flag: &RunFlag) {
        tokio::time::sleep(self.config.update_time).await;
        while flag.should_run() {
            match self
                .backend
                .refresh(&self.config.process_name, &self.instance_id, self.expire_at())
                .await
            {
                Ok(()) => {
                    tracing::info!(
                        "Updated lock {} #{}",
                        self.config.process_name,
                        self.instance_id
                    );
                    tokio::time::sleep(self.config.update_time).await;
                }
                Err(LockWriteError::DuplicateKey) => {
                    tracing::error!(
                        "Another process acquired lock {}; heartbeat lagged past LOCK_EXPIRE_TIME, terminating",
                        self.config.process_name
                    );
                    (self.terminate)();
                    return;
                }
                Err(LockWriteError::Backend(msg)) => {
                    tracing::warn!("Lock update failed: {}", msg);
                    tokio::time::sleep(self.db_error_interval).await;
                }
            }
        }
    }

    /// Delete the record, but only while it is still ours.
    pub async fn release(&self) {
        match self
            .backend
            .delete(&self.config.process_name, &self.instance_id)
            .await
        {
            Ok(()) => {
                tracing::info!(
                    "Deleted lock {} #{}",
                    self.config.process_name,
                    self.instance_id
                );
            }
            Err(e) => tracing::error!("Lock release failed: {:?}", e),
        }
    }

    fn expire_at(&self) -> DateTime {
        DateTime::from_system_time(SystemTime::now() + self.config.expire_time)
    }
}

/// Hold the process lock around `get_app`. With the lock disabled the
/// app just runs.
pub async fn run_locked<F, Fut>(config: &CrawlerConfig, flag: &RunFlag, get_app: F) -> Result<()>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<()>>,
{
    if !config.lock.enabled {
        return get_app().await;
    }
    let Some(mongo) = &config.mongo else {
        bail!("LOCK_ENABLED requires MONGODB_URL; the lock record lives in the document store");
    };

    let lock = ProcessLock::connect(mongo, &config.lock, config.retry.db_error).await?;
    lock.init_index().await;
    if !lock.acquire(flag).await {
        return Ok(());
    }

    let heartbeat = tokio::spawn({
        let lock = lock.clone();
        let flag = flag.clone();
        async move { lock.update(&flag).await }
    });

    let result = get_app().await;

    heartbeat.abort();
    lock.release().await;
    result
}

fn sigterm_self() {
    unsafe {
        libc::kill(libc::getpid(), libc::SIGTERM);
    }
}

#[cfg(test)]
mod memory {
    //! Scripted lock backend for tests. Each queue entry answers one
    //! call; an empty queue answers Ok.

    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use super::LockWriteError;

    #[derive(Default)]
    pub struct MemoryLockBackend {
        pub insert_results: Mutex<VecDeque<Result<(), LockWriteError>>>,
        pub refresh_results: Mutex<VecDeque<Result<(), LockWriteError>>>,
        pub deletes: AtomicUsize,
    }

    impl MemoryLockBackend {
        pub fn pop_insert(&self) -> Result<(), LockWriteError> {
            self.insert_results
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Ok(()))
        }

        pub fn pop_refresh(&self) -> Result<(), LockWriteError> {
            self.refresh_results
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Ok(()))
        }

        pub fn record_delete(&self) -> Result<(), LockWriteError> {
            self.deletes.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
    }
}
