// for error definitions
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CounterStoreError {
    /// Errors raised by the backing collection
    #[error("Storage error: {0}")]
    Storage(StorageError),

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Unexpected or internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Storage-specific errors
#[derive(Error, Debug)]
pub enum StorageError {
    /// Redis connection errors
    #[error("Redis connection error: {0}")]
    RedisConnection(String),

    // Redis authentication errors
    #[error("Redis authentication error: {0}")]
    RedisAuth(String),

    /// Redis command errors
    #[error("Redis command error: {0}")]
    RedisCommand(String),

    /// A backend call did not answer in time
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// A concurrent insert already created the record for this key
    #[error("Duplicate key: {0}")]
    DuplicateKey(String),

    /// In-memory collection is full
    #[error("Capacity exceeded: {0}")]
    CapacityExceeded(String),

    /// Data serialization/deserialization errors
    #[error("Data serialization error: {0}")]
    Serialization(String),

    /// Setting up the expiry mechanism failed
    #[error("Expiry provisioning error: {0}")]
    Provisioning(String),
}

impl CounterStoreError {
    /// True when the failure is a lost race between two first inserts of the
    /// same key. Such failures are transient: retrying the upsert will find
    /// the record the winner created.
    pub fn is_duplicate_key(&self) -> bool {
        matches!(self, CounterStoreError::Storage(StorageError::DuplicateKey(_)))
    }
}

// Implement conversions from redis::RedisError to StorageError
impl From<redis::RedisError> for CounterStoreError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_timeout() {
            return CounterStoreError::Storage(StorageError::Timeout(err.to_string()));
        }

        match err.kind() {
            redis::ErrorKind::AuthenticationFailed => {
                CounterStoreError::Storage(StorageError::RedisAuth(err.to_string()))
            }
            redis::ErrorKind::IoError | redis::ErrorKind::ClientError => {
                CounterStoreError::Storage(StorageError::RedisConnection(err.to_string()))
            }
            redis::ErrorKind::TypeError => {
                CounterStoreError::Storage(StorageError::Serialization(err.to_string()))
            }
            _ => CounterStoreError::Storage(StorageError::RedisCommand(err.to_string())),
        }
    }
}

// implement conversions from serde_json::Error to CounterStoreError
impl From<serde_json::Error> for CounterStoreError {
    fn from(err: serde_json::Error) -> Self {
        CounterStoreError::Storage(StorageError::Serialization(err.to_string()))
    }
}

// define a Result type alias for convenience
pub type Result<T> = std::result::Result<T, CounterStoreError>;
