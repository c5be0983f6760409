// src/store/counter_store.rs

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::OnceCell;
use tracing::{debug, error, info, warn};

use super::{CounterStoreBuilder, RateLimitInfo, RateLimitStore};
use crate::config::check_expire_time;
use crate::error::{CounterStoreError, Result};
use crate::storage::{CounterCollection, CounterRecord, ExpiryWrite};

/// Observer called with every error an operation is about to return
pub type ErrorHandler = Arc<dyn Fn(&CounterStoreError) + Send + Sync>;

/// Where the store gets its collection from on first use
pub(crate) enum CollectionSource<C: CounterCollection> {
    Ready(Arc<C>),
    Connect(C::Config),
}

/// Per-key hit counters with a fixed or rolling expiry window.
///
/// Every mutation is one atomic upsert on the backing collection; the store
/// itself keeps no per-key state and takes no locks. The collection is
/// acquired on first use, at most once, and the expiry mechanism is
/// provisioned at the same time when `create_ttl_index` is set.
///
/// Records whose expiry has passed are returned as-is until the backing
/// store deletes them.
pub struct CounterStore<C: CounterCollection> {
    source: CollectionSource<C>,
    collection: OnceCell<Arc<C>>,
    expire_time_ms: AtomicU64,
    reset_expire_date_on_change: bool,
    prefix: String,
    create_ttl_index: bool,
    error_handler: Option<ErrorHandler>,
}

impl<C: CounterCollection> fmt::Debug for CounterStore<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CounterStore")
            .field("collection", &self.collection.get())
            .field("expire_time", &self.expire_time())
            .field("reset_expire_date_on_change", &self.reset_expire_date_on_change)
            .field("prefix", &self.prefix)
            .field("create_ttl_index", &self.create_ttl_index)
            .field("error_handler", &self.error_handler.is_some())
            .finish()
    }
}

impl From<CounterRecord> for RateLimitInfo {
    fn from(record: CounterRecord) -> Self {
        Self {
            total_hits: record.counter,
            reset_time: record.expiration_date,
        }
    }
}

fn duration_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

impl<C: CounterCollection> CounterStore<C> {
    pub fn builder() -> CounterStoreBuilder<C> {
        CounterStoreBuilder::new()
    }

    pub(crate) fn from_parts(
        source: CollectionSource<C>,
        expire_time: Duration,
        reset_expire_date_on_change: bool,
        prefix: String,
        create_ttl_index: bool,
        error_handler: Option<ErrorHandler>,
    ) -> Self {
        Self {
            source,
            collection: OnceCell::new(),
            expire_time_ms: AtomicU64::new(duration_millis(expire_time)),
            reset_expire_date_on_change,
            prefix,
            create_ttl_index,
            error_handler,
        }
    }

    /// Current window length
    pub fn expire_time(&self) -> Duration {
        Duration::from_millis(self.expire_time_ms.load(Ordering::Relaxed))
    }

    /// Whether the backing collection has been acquired yet
    pub fn is_connected(&self) -> bool {
        self.collection.initialized()
    }

    /// Overrides the window length for all later mutations. A zero window, or
    /// one longer than [`MAX_EXPIRE_TIME`](crate::config::MAX_EXPIRE_TIME), is
    /// ignored.
    pub fn init(&self, window: Duration) {
        if let Err(err) = check_expire_time(window) {
            warn!(error = %err, "Ignoring window length");
            return;
        }
        self.expire_time_ms
            .store(duration_millis(window), Ordering::Relaxed);
        debug!(window_ms = duration_millis(window), "Window length set");
    }

    pub fn prefix_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    /// Current hits and reset time for `key`. An unknown key reads as zero
    /// hits resetting now; nothing is written.
    pub async fn get(&self, key: &str) -> Result<RateLimitInfo> {
        let started = Instant::now();
        let result = self.try_get(key).await;
        self.report("get", key, started, result)
    }

    /// Adds one hit to `key`, creating its record on the first hit.
    ///
    /// A duplicate-key failure means another caller created the record
    /// between our lookup and insert; the whole operation is then retried
    /// until it succeeds or fails differently.
    pub async fn increment(&self, key: &str) -> Result<RateLimitInfo> {
        let started = Instant::now();
        let result = self.try_increment(key).await;
        self.report("increment", key, started, result)
    }

    /// Removes one hit from `key`. Counters may go below zero.
    pub async fn decrement(&self, key: &str) -> Result<()> {
        let started = Instant::now();
        let result = self.try_decrement(key).await;
        self.report("decrement", key, started, result)
    }

    /// Deletes the record of `key`. Deleting an unknown key is not an error.
    pub async fn reset_key(&self, key: &str) -> Result<()> {
        let started = Instant::now();
        let result = self.try_reset_key(key).await;
        self.report("reset_key", key, started, result)
    }

    /// Deletes every record in the collection
    pub async fn reset_all(&self) -> Result<()> {
        let started = Instant::now();
        let result = self.try_reset_all().await;
        self.report("reset_all", "*", started, result)
    }

    async fn collection(&self) -> Result<Arc<C>> {
        let collection = self
            .collection
            .get_or_try_init(|| async {
                let collection = match &self.source {
                    CollectionSource::Ready(collection) => Arc::clone(collection),
                    CollectionSource::Connect(config) => {
                        info!("Connecting to backing collection");
                        Arc::new(C::connect(config.clone()).await?)
                    }
                };

                if self.create_ttl_index {
                    collection.provision_expiry().await?;
                }

                Ok::<_, CounterStoreError>(collection)
            })
            .await?;

        Ok(Arc::clone(collection))
    }

    fn expiration_from(&self, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
        let window = self.expire_time_ms.load(Ordering::Relaxed);

        i64::try_from(window)
            .ok()
            .and_then(TimeDelta::try_milliseconds)
            .and_then(|delta| now.checked_add_signed(delta))
            .ok_or_else(|| {
                CounterStoreError::Config(format!("window of {}ms is out of range", window))
            })
    }

    fn expiry_write(&self) -> ExpiryWrite {
        if self.reset_expire_date_on_change {
            ExpiryWrite::Always
        } else {
            ExpiryWrite::OnInsert
        }
    }

    async fn try_get(&self, key: &str) -> Result<RateLimitInfo> {
        let collection = self.collection().await?;

        Ok(match collection.find(key).await? {
            Some(record) => record.into(),
            None => RateLimitInfo {
                total_hits: 0,
                reset_time: Utc::now(),
            },
        })
    }

    async fn try_increment(&self, key: &str) -> Result<RateLimitInfo> {
        let mut attempt: u64 = 0;

        loop {
            attempt += 1;

            let collection = self.collection().await?;
            // read the clock once, before the upsert is issued
            let expiration = self.expiration_from(Utc::now())?;

            match collection
                .upsert(key, 1, expiration, self.expiry_write())
                .await
            {
                Ok(record) => return Ok(record.into()),
                Err(err) if err.is_duplicate_key() => {
                    debug!(key, attempt, "Duplicate key on insert, retrying increment");
                    tokio::task::yield_now().await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn try_decrement(&self, key: &str) -> Result<()> {
        let collection = self.collection().await?;
        let expiration = self.expiration_from(Utc::now())?;

        collection
            .upsert(key, -1, expiration, self.expiry_write())
            .await?;
        Ok(())
    }

    async fn try_reset_key(&self, key: &str) -> Result<()> {
        let collection = self.collection().await?;
        let existed = collection.delete(key).await?;

        debug!(key, existed, "Key reset");
        Ok(())
    }

    async fn try_reset_all(&self) -> Result<()> {
        let collection = self.collection().await?;
        let removed = collection.delete_all().await?;

        info!(removed, "All keys reset");
        Ok(())
    }

    // Every failing operation is logged and handed to the error handler
    // exactly once before it is returned.
    fn report<T>(
        &self,
        operation: &'static str,
        key: &str,
        started: Instant,
        result: Result<T>,
    ) -> Result<T> {
        crate::storage_op!(operation, key, result, started.elapsed().as_millis() as u64);

        if let Err(err) = &result {
            error!(operation, key, error = %err, "Counter store operation failed");
            if let Some(handler) = &self.error_handler {
                handler(err);
            }
        }

        result
    }
}

#[async_trait]
impl<C: CounterCollection> RateLimitStore for CounterStore<C> {
    fn init(&self, window: Duration) {
        CounterStore::init(self, window)
    }

    fn prefix_key(&self, key: &str) -> String {
        CounterStore::prefix_key(self, key)
    }

    async fn get(&self, key: &str) -> Result<RateLimitInfo> {
        CounterStore::get(self, key).await
    }

    async fn increment(&self, key: &str) -> Result<RateLimitInfo> {
        CounterStore::increment(self, key).await
    }

    async fn decrement(&self, key: &str) -> Result<()> {
        CounterStore::decrement(self, key).await
    }

    async fn reset_key(&self, key: &str) -> Result<()> {
        CounterStore::reset_key(self, key).await
    }

    async fn reset_all(&self) -> Result<()> {
        CounterStore::reset_all(self).await
    }
}
