// src/storage/mod.rs

pub mod memory;
pub mod redis;

#[cfg(test)]
mod tests;

pub use memory::MemoryCollection;
pub use redis::RedisCollection;

use super::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Debug;

/// One tracked key. At most one record exists per key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CounterRecord {
    pub key: String,
    /// Signed hit count. Decrements are not floored at zero.
    pub counter: i64,
    /// After this instant the backing store may delete the record
    pub expiration_date: DateTime<Utc>,
}

/// How an upsert treats the record's expiry timestamp
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpiryWrite {
    /// Overwrite on every upsert (rolling window)
    Always,
    /// Write only when the upsert creates the record (fixed window)
    OnInsert,
}

/// The key-value collection a counter store runs on.
///
/// Implementations must make `upsert` a single atomic read-modify-write per
/// key; the store never reads before writing and holds no lock of its own.
#[async_trait]
pub trait CounterCollection: Send + Sync + Debug {
    // The type of configuration this collection is connected with
    type Config: Clone + Send + Sync + Debug;

    // Checks connection settings without connecting
    fn validate_config(_config: &Self::Config) -> Result<()> {
        Ok(())
    }

    // Establishes the backing handle
    async fn connect(config: Self::Config) -> Result<Self>
    where
        Self: Sized;

    // Point lookup
    async fn find(&self, key: &str) -> Result<Option<CounterRecord>>;

    /// Atomically adds `delta` to the counter of `key`, creating the record
    /// with `counter = delta` when absent, writes `expiration` according to
    /// `expiry`, and returns the record as it is after the write.
    async fn upsert(
        &self,
        key: &str,
        delta: i64,
        expiration: DateTime<Utc>,
        expiry: ExpiryWrite,
    ) -> Result<CounterRecord>;

    // Deletes a record. Returns false if there was none.
    async fn delete(&self, key: &str) -> Result<bool>;

    // Deletes every record of this collection, returning how many went
    async fn delete_all(&self) -> Result<u64>;

    /// Declares `expiration_date` as the basis for backend-driven deletion
    /// with no grace period. Safe to call any number of times.
    async fn provision_expiry(&self) -> Result<()>;
}
