// src/test_utils.rs

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::error::{CounterStoreError, Result, StorageError};
use super::storage::{CounterCollection, CounterRecord, ExpiryWrite};
use super::store::CounterStore;

/// Connection settings of the mock. Connect attempts are counted in
/// `connects`, so a test can see how often lazy initialization ran.
#[derive(Debug, Clone, Default)]
pub struct MockConfig {
    pub connects: Arc<AtomicUsize>,
    pub connect_delay: Duration,
    pub fail_connect: bool,
}

/// In-memory collection whose next calls can be made to fail.
///
/// Failures are queued per operation and consumed one per call; once the
/// queue is empty the operation behaves normally again.
#[derive(Debug, Default)]
pub struct MockCollection {
    records: Mutex<HashMap<String, CounterRecord>>,
    find_failures: Mutex<VecDeque<CounterStoreError>>,
    upsert_failures: Mutex<VecDeque<CounterStoreError>>,
    delete_failures: Mutex<VecDeque<CounterStoreError>>,
    provision_failures: Mutex<VecDeque<CounterStoreError>>,
    pub find_calls: AtomicUsize,
    pub upsert_calls: AtomicUsize,
    pub delete_calls: AtomicUsize,
    pub provision_calls: AtomicUsize,
    last_upsert: Mutex<Option<(String, i64, DateTime<Utc>, ExpiryWrite)>>,
}

impl MockCollection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next_find(&self, err: CounterStoreError) {
        self.find_failures.lock().unwrap().push_back(err);
    }

    pub fn fail_next_upsert(&self, err: CounterStoreError) {
        self.upsert_failures.lock().unwrap().push_back(err);
    }

    pub fn fail_next_delete(&self, err: CounterStoreError) {
        self.delete_failures.lock().unwrap().push_back(err);
    }

    pub fn fail_next_provision(&self, err: CounterStoreError) {
        self.provision_failures.lock().unwrap().push_back(err);
    }

    /// Arguments of the most recent upsert, including failed ones
    pub fn last_upsert(&self) -> Option<(String, i64, DateTime<Utc>, ExpiryWrite)> {
        self.last_upsert.lock().unwrap().clone()
    }

    /// Stored record, bypassing failure injection and call counting
    pub fn record(&self, key: &str) -> Option<CounterRecord> {
        self.records.lock().unwrap().get(key).cloned()
    }

    pub fn calls(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }

    fn take_failure(queue: &Mutex<VecDeque<CounterStoreError>>) -> Result<()> {
        match queue.lock().unwrap().pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl CounterCollection for MockCollection {
    type Config = MockConfig;

    async fn connect(config: Self::Config) -> Result<Self> {
        config.connects.fetch_add(1, Ordering::SeqCst);
        if !config.connect_delay.is_zero() {
            tokio::time::sleep(config.connect_delay).await;
        }
        if config.fail_connect {
            return Err(CounterStoreError::Storage(StorageError::RedisConnection(
                "mock connection refused".to_string(),
            )));
        }
        Ok(Self::new())
    }

    async fn find(&self, key: &str) -> Result<Option<CounterRecord>> {
        self.find_calls.fetch_add(1, Ordering::SeqCst);
        Self::take_failure(&self.find_failures)?;

        Ok(self.records.lock().unwrap().get(key).cloned())
    }

    async fn upsert(
        &self,
        key: &str,
        delta: i64,
        expiration: DateTime<Utc>,
        expiry: ExpiryWrite,
    ) -> Result<CounterRecord> {
        self.upsert_calls.fetch_add(1, Ordering::SeqCst);
        *self.last_upsert.lock().unwrap() = Some((key.to_string(), delta, expiration, expiry));
        Self::take_failure(&self.upsert_failures)?;

        let mut records = self.records.lock().unwrap();
        let record = records
            .entry(key.to_string())
            .and_modify(|record| {
                record.counter += delta;
                if expiry == ExpiryWrite::Always {
                    record.expiration_date = expiration;
                }
            })
            .or_insert_with(|| CounterRecord {
                key: key.to_string(),
                counter: delta,
                expiration_date: expiration,
            });

        Ok(record.clone())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        Self::take_failure(&self.delete_failures)?;

        Ok(self.records.lock().unwrap().remove(key).is_some())
    }

    async fn delete_all(&self) -> Result<u64> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        Self::take_failure(&self.delete_failures)?;

        let mut records = self.records.lock().unwrap();
        let removed = records.len() as u64;
        records.clear();
        Ok(removed)
    }

    async fn provision_expiry(&self) -> Result<()> {
        self.provision_calls.fetch_add(1, Ordering::SeqCst);
        Self::take_failure(&self.provision_failures)
    }
}

pub fn duplicate_key_error(key: &str) -> CounterStoreError {
    CounterStoreError::Storage(StorageError::DuplicateKey(format!(
        "E11000 duplicate key error, key: {}",
        key
    )))
}

pub fn command_error(message: &str) -> CounterStoreError {
    CounterStoreError::Storage(StorageError::RedisCommand(message.to_string()))
}

/// Error handler that remembers the message of every error it was given
#[derive(Debug, Clone, Default)]
pub struct ErrorRecorder {
    seen: Arc<Mutex<Vec<String>>>,
}

impl ErrorRecorder {
    pub fn handler(&self) -> impl Fn(&CounterStoreError) + Send + Sync + 'static {
        let seen = Arc::clone(&self.seen);
        move |err| seen.lock().unwrap().push(err.to_string())
    }

    pub fn count(&self) -> usize {
        self.seen.lock().unwrap().len()
    }

    pub fn messages(&self) -> Vec<String> {
        self.seen.lock().unwrap().clone()
    }
}

/// Store over a shared mock collection with the given window settings
pub fn create_test_store(
    collection: Arc<MockCollection>,
    expire_time: Duration,
    rolling: bool,
    recorder: &ErrorRecorder,
) -> CounterStore<MockCollection> {
    CounterStore::builder()
        .collection(collection)
        .expire_time(expire_time)
        .reset_expire_date_on_change(rolling)
        .error_handler(recorder.handler())
        .build()
        .expect("test store config should be valid")
}
