// src/storage/redis.rs

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::{aio::ConnectionManager, AsyncCommands, Client, IntoConnectionInfo, Script};
use std::fmt;
use std::future::Future;
use tokio::time;
use tracing::debug;

use crate::config::RedisConfig;
use crate::error::{CounterStoreError, Result, StorageError};
use crate::storage::{CounterCollection, CounterRecord, ExpiryWrite};

const COUNTER_FIELD: &str = "counter";
const EXPIRATION_FIELD: &str = "expirationDate";

// KEYS[1] record hash, KEYS[2] expiry marker
// ARGV[1] delta, ARGV[2] expiration (unix ms), ARGV[3] "1" to always write the expiration,
// ARGV[4] current time (unix ms)
const UPSERT_SCRIPT: &str = r#"
local counter = redis.call("HINCRBY", KEYS[1], "counter", ARGV[1])

if ARGV[3] == "1" then
    redis.call("HSET", KEYS[1], "expirationDate", ARGV[2])
else
    redis.call("HSETNX", KEYS[1], "expirationDate", ARGV[2])
end

local expiration = tonumber(redis.call("HGET", KEYS[1], "expirationDate"))

if redis.call("EXISTS", KEYS[2]) == 1 then
    -- written before expiry was provisioned and already past due
    if expiration <= tonumber(ARGV[4]) then
        redis.call("HSET", KEYS[1], "counter", ARGV[1], "expirationDate", ARGV[2])
        counter = tonumber(ARGV[1])
        expiration = tonumber(ARGV[2])
    end
    redis.call("PEXPIREAT", KEYS[1], expiration)
end

return {counter, expiration}
"#;

/// Counter records stored as Redis hashes.
///
/// Every record lives under `<collection_name>:<key>` as a hash with the
/// fields `counter` and `expirationDate` (unix milliseconds). Upserts run as a
/// single Lua script, so concurrent increments of one key never interleave.
///
/// Expiry is opt-in per collection: `provision_expiry` writes the marker key
/// `<collection_name>#expiry`, and while it exists every upsert arms Redis'
/// own key expiry at the record's `expirationDate`. The marker is shared by
/// every process using the same collection name. A record whose
/// `expirationDate` passed before the marker was set starts a new window on
/// its next upsert instead of being counted on.
#[derive(Clone)]
pub struct RedisCollection {
    connection: ConnectionManager,
    config: RedisConfig,
    upsert_script: Script,
}

// Manually implement Debug, the connection has nothing useful to show
impl fmt::Debug for RedisCollection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisCollection")
            .field("url", &self.config.url)
            .field("collection_name", &self.config.collection_name)
            .finish()
    }
}

impl RedisCollection {
    /// Connects to Redis with the given configuration
    pub async fn new(config: RedisConfig) -> Result<Self> {
        config.validate()?;

        let mut info = config
            .url
            .as_str()
            .into_connection_info()
            .map_err(|e| CounterStoreError::Config(format!("invalid redis url: {}", e)))?;

        // explicit credentials win over the ones embedded in the URL
        if let Some(username) = &config.username {
            info.redis.username = Some(username.clone());
        }
        if let Some(password) = &config.password {
            info.redis.password = Some(password.clone());
        }
        if let Some(database) = config.database {
            info.redis.db = database;
        }

        // Open the client - this doesn't actually connect to Redis yet
        let client = Client::open(info)
            .map_err(|e| CounterStoreError::Storage(StorageError::RedisConnection(e.to_string())))?;

        let connection =
            match time::timeout(config.connection_timeout, ConnectionManager::new(client)).await {
                Ok(result) => result?,
                Err(_) => {
                    return Err(CounterStoreError::Storage(StorageError::RedisConnection(
                        format!(
                            "Connection to Redis at {} timed out after {:?}",
                            config.url, config.connection_timeout
                        ),
                    )));
                }
            };

        debug!(collection = %config.collection_name, "Connected to Redis");

        Ok(Self {
            connection,
            config,
            upsert_script: Script::new(UPSERT_SCRIPT),
        })
    }

    /// Ping Redis to check health
    pub async fn ping(&self) -> Result<()> {
        let mut conn = self.connection.clone();
        let result: String = self.run("PING", conn.ping()).await?;

        if result == "PONG" {
            Ok(())
        } else {
            Err(CounterStoreError::Storage(StorageError::RedisCommand(
                format!("Unexpected response from Redis PING: {}", result),
            )))
        }
    }

    /// Redis key holding the record for `key`
    pub fn record_key(&self, key: &str) -> String {
        format!("{}:{}", self.config.collection_name, key)
    }

    fn expiry_marker_key(&self) -> String {
        format!("{}#expiry", self.config.collection_name)
    }

    async fn run<T, F>(&self, operation: &str, fut: F) -> Result<T>
    where
        F: Future<Output = redis::RedisResult<T>>,
    {
        match time::timeout(self.config.command_timeout, fut).await {
            Ok(result) => result.map_err(CounterStoreError::from),
            Err(_) => Err(CounterStoreError::Storage(StorageError::Timeout(format!(
                "Redis {} timed out after {:?}",
                operation, self.config.command_timeout
            )))),
        }
    }
}

fn timestamp_from_millis(key: &str, millis: i64) -> Result<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(millis).ok_or_else(|| {
        CounterStoreError::Storage(StorageError::Serialization(format!(
            "expiration {} of key {} is out of range",
            millis, key
        )))
    })
}

// SCAN treats these as glob syntax
fn escape_glob(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

#[async_trait]
impl CounterCollection for RedisCollection {
    type Config = RedisConfig;

    fn validate_config(config: &Self::Config) -> Result<()> {
        config.validate()
    }

    async fn connect(config: Self::Config) -> Result<Self> {
        Self::new(config).await
    }

    async fn find(&self, key: &str) -> Result<Option<CounterRecord>> {
        let mut conn = self.connection.clone();
        let (counter, expiration): (Option<i64>, Option<i64>) = self
            .run(
                "HMGET",
                conn.hget(self.record_key(key), &[COUNTER_FIELD, EXPIRATION_FIELD]),
            )
            .await?;

        match (counter, expiration) {
            (Some(counter), Some(expiration)) => Ok(Some(CounterRecord {
                key: key.to_string(),
                counter,
                expiration_date: timestamp_from_millis(key, expiration)?,
            })),
            (None, None) => Ok(None),
            _ => Err(CounterStoreError::Storage(StorageError::Serialization(
                format!("record for key {} is missing a field", key),
            ))),
        }
    }

    async fn upsert(
        &self,
        key: &str,
        delta: i64,
        expiration: DateTime<Utc>,
        expiry: ExpiryWrite,
    ) -> Result<CounterRecord> {
        let mut conn = self.connection.clone();
        let always = match expiry {
            ExpiryWrite::Always => "1",
            ExpiryWrite::OnInsert => "0",
        };

        let (counter, stored_expiration): (i64, i64) = self
            .run(
                "upsert script",
                self.upsert_script
                    .key(self.record_key(key))
                    .key(self.expiry_marker_key())
                    .arg(delta)
                    .arg(expiration.timestamp_millis())
                    .arg(always)
                    .arg(Utc::now().timestamp_millis())
                    .invoke_async(&mut conn),
            )
            .await?;

        Ok(CounterRecord {
            key: key.to_string(),
            counter,
            expiration_date: timestamp_from_millis(key, stored_expiration)?,
        })
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut conn = self.connection.clone();
        let removed: i64 = self.run("DEL", conn.del(self.record_key(key))).await?;

        Ok(removed > 0)
    }

    async fn delete_all(&self) -> Result<u64> {
        let mut conn = self.connection.clone();
        let pattern = format!("{}:*", escape_glob(&self.config.collection_name));
        let mut cursor: u64 = 0;
        let mut removed: u64 = 0;

        loop {
            let (next, keys): (u64, Vec<String>) = self
                .run(
                    "SCAN",
                    redis::cmd("SCAN")
                        .arg(cursor)
                        .arg("MATCH")
                        .arg(&pattern)
                        .arg("COUNT")
                        .arg(500)
                        .query_async(&mut conn),
                )
                .await?;

            if !keys.is_empty() {
                let count: u64 = self.run("DEL", conn.del(&keys)).await?;
                removed += count;
            }

            if next == 0 {
                break;
            }
            cursor = next;
        }

        Ok(removed)
    }

    async fn provision_expiry(&self) -> Result<()> {
        let mut conn = self.connection.clone();
        let _: () = self
            .run("SET", conn.set(self.expiry_marker_key(), EXPIRATION_FIELD))
            .await
            .map_err(|e| CounterStoreError::Storage(StorageError::Provisioning(e.to_string())))?;

        debug!(collection = %self.config.collection_name, "Expiry provisioned");
        Ok(())
    }
}
