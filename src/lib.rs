// library entry
pub mod config;
pub mod error;
pub mod logging;
pub mod storage;
pub mod store;

#[cfg(test)]
mod test_utils;
#[cfg(test)]
mod tests;

// Re-export key components for convenience
pub use config::{InMemoryConfig, RedisConfig, StoreConfig};
pub use error::{CounterStoreError, Result, StorageError};
pub use logging::init as init_logging;
pub use storage::{CounterCollection, CounterRecord, ExpiryWrite, MemoryCollection, RedisCollection};
pub use store::{CounterStore, CounterStoreBuilder, ErrorHandler, RateLimitInfo, RateLimitStore};
