// src/store/mod.rs

mod builder;
mod counter_store;

pub use builder::CounterStoreBuilder;
pub use counter_store::{CounterStore, ErrorHandler};

use super::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::time::Duration;

/// Hit count of one client and when its window resets
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitInfo {
    /// Hits recorded in the current window
    pub total_hits: i64,

    /// When the window resets
    pub reset_time: DateTime<Utc>,
}

/// What rate-limiting middleware needs from a hit store.
///
/// Keys passed to the operations are expected to be prefixed already, see
/// [`RateLimitStore::prefix_key`]. Whether a failed call lets the request
/// through or rejects it is up to the caller.
#[async_trait]
pub trait RateLimitStore: Send + Sync + Debug {
    /// Overrides the window length for all later mutations
    fn init(&self, window: Duration);

    /// Prepends the configured prefix to `key`
    fn prefix_key(&self, key: &str) -> String;

    /// Current hits for `key`, without recording one
    async fn get(&self, key: &str) -> Result<RateLimitInfo>;

    /// Records a hit and returns the updated state
    async fn increment(&self, key: &str) -> Result<RateLimitInfo>;

    /// Takes back a hit recorded earlier
    async fn decrement(&self, key: &str) -> Result<()>;

    /// Forgets everything about `key`
    async fn reset_key(&self, key: &str) -> Result<()>;

    /// Forgets every key
    async fn reset_all(&self) -> Result<()>;
}
