// src/storage/memory.rs

// In-process collection, for tests and single-instance deployments.
// Atomicity comes from the map's write lock; expiry comes from a periodic
// sweep task started by `provision_expiry`, like a store-side TTL monitor.
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::debug;

use crate::config::InMemoryConfig;
use crate::error::{CounterStoreError, Result, StorageError};
use crate::storage::{CounterCollection, CounterRecord, ExpiryWrite};

type Records = RwLock<HashMap<String, CounterRecord>>;

/// In-memory collection implementation
#[derive(Debug)]
pub struct MemoryCollection {
    data: Arc<Records>,
    config: InMemoryConfig,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl MemoryCollection {
    /// Creates an empty collection. No sweep runs until `provision_expiry`.
    pub fn new(config: InMemoryConfig) -> Self {
        let data = Arc::new(RwLock::new(HashMap::with_capacity(
            config.max_entries.min(10_000),
        )));

        Self {
            data,
            config,
            sweeper: Mutex::new(None),
        }
    }

    /// Number of records currently held, expired or not
    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Runs one expiry sweep immediately and returns how many records it deleted
    pub fn sweep_now(&self) -> usize {
        Self::sweep_expired(&self.data, Utc::now())
    }

    /// Whether the background sweep task is running
    pub fn is_sweeping(&self) -> bool {
        self.sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    fn sweep_expired(data: &Records, now: DateTime<Utc>) -> usize {
        let mut data = data.write().unwrap_or_else(PoisonError::into_inner);
        let before = data.len();
        data.retain(|_, record| record.expiration_date > now);
        before - data.len()
    }

    fn spawn_sweeper(data: Weak<Records>, interval: std::time::Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = time::interval(interval);
            // the first tick completes immediately
            ticker.tick().await;

            loop {
                ticker.tick().await;

                // collection dropped
                let Some(data) = data.upgrade() else {
                    break;
                };

                let removed = Self::sweep_expired(&data, Utc::now());
                if removed > 0 {
                    debug!(removed, "Expired records swept");
                }
            }
        })
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, CounterRecord>> {
        self.data.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, CounterRecord>> {
        self.data.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for MemoryCollection {
    fn drop(&mut self) {
        let sweeper = self
            .sweeper
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(handle) = sweeper.take() {
            handle.abort();
        }
    }
}

#[async_trait]
impl CounterCollection for MemoryCollection {
    type Config = InMemoryConfig;

    fn validate_config(config: &Self::Config) -> Result<()> {
        config.validate()
    }

    async fn connect(config: Self::Config) -> Result<Self> {
        config.validate()?;
        Ok(Self::new(config))
    }

    async fn find(&self, key: &str) -> Result<Option<CounterRecord>> {
        Ok(self.read().get(key).cloned())
    }

    async fn upsert(
        &self,
        key: &str,
        delta: i64,
        expiration: DateTime<Utc>,
        expiry: ExpiryWrite,
    ) -> Result<CounterRecord> {
        let mut data = self.write();

        if let Some(record) = data.get_mut(key) {
            record.counter = record.counter.checked_add(delta).ok_or_else(|| {
                CounterStoreError::Internal(format!("counter overflow for key: {}", key))
            })?;
            if expiry == ExpiryWrite::Always {
                record.expiration_date = expiration;
            }
            return Ok(record.clone());
        }

        // Apply max entries limit
        if data.len() >= self.config.max_entries {
            return Err(CounterStoreError::Storage(StorageError::CapacityExceeded(
                format!("maximum of {} records reached", self.config.max_entries),
            )));
        }

        let record = CounterRecord {
            key: key.to_string(),
            counter: delta,
            expiration_date: expiration,
        };
        data.insert(key.to_string(), record.clone());

        Ok(record)
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        Ok(self.write().remove(key).is_some())
    }

    async fn delete_all(&self) -> Result<u64> {
        let mut data = self.write();
        let removed = data.len() as u64;
        data.clear();
        Ok(removed)
    }

    async fn provision_expiry(&self) -> Result<()> {
        let mut sweeper = self.sweeper.lock().unwrap_or_else(PoisonError::into_inner);

        let running = sweeper
            .as_ref()
            .is_some_and(|handle| !handle.is_finished());
        if !running {
            debug!(
                interval_ms = self.config.sweep_interval.as_millis() as u64,
                "Starting expiry sweep"
            );
            *sweeper = Some(Self::spawn_sweeper(
                Arc::downgrade(&self.data),
                self.config.sweep_interval,
            ));
        }

        Ok(())
    }
}
