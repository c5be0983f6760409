// src/config/mod.rs

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{CounterStoreError, Result};

/// Prefix shared by every environment variable this crate reads
pub const ENV_PREFIX: &str = "COUNTER_STORE_";

/// Longest accepted window, 100 years. Expiry timestamps are computed as
/// `now + window` and must stay representable.
pub const MAX_EXPIRE_TIME: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// Checks that `window` can be used as a counting window
pub fn check_expire_time(window: Duration) -> Result<()> {
    if window.is_zero() {
        return Err(CounterStoreError::Config(
            "expire_time must be greater than zero".to_string(),
        ));
    }
    if window > MAX_EXPIRE_TIME {
        return Err(CounterStoreError::Config(format!(
            "expire_time of {}ms exceeds the maximum of {}ms",
            window.as_millis(),
            MAX_EXPIRE_TIME.as_millis()
        )));
    }
    Ok(())
}

/// Window and key policy of a counter store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Length of the counting window. A record becomes eligible for expiry
    /// this long after its expiry timestamp was last written.
    #[serde(default = "default_expire_time", with = "duration_serde")]
    pub expire_time: Duration,

    /// Refresh the expiry timestamp on every mutation (rolling window)
    /// instead of only when the record is created (fixed window).
    #[serde(default)]
    pub reset_expire_date_on_change: bool,

    /// Prepended to every key by `prefix_key`
    #[serde(default)]
    pub prefix: String,

    /// Provision the backing store's expiry mechanism on first use
    #[serde(default = "default_create_ttl_index")]
    pub create_ttl_index: bool,
}

fn default_expire_time() -> Duration {
    Duration::from_millis(60_000)
}

fn default_create_ttl_index() -> bool {
    true
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            expire_time: default_expire_time(),
            reset_expire_date_on_change: false,
            prefix: String::new(),
            create_ttl_index: default_create_ttl_index(),
        }
    }
}

impl StoreConfig {
    pub fn validate(&self) -> Result<()> {
        check_expire_time(self.expire_time)
    }

    /// Loads the config from `COUNTER_STORE_*` environment variables, falling
    /// back to defaults for anything unset.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub(crate) fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let env = EnvReader::new(&lookup);

        if let Some(ms) = env.parse::<u64>("EXPIRE_TIME_MS")? {
            config.expire_time = Duration::from_millis(ms);
        }
        if let Some(flag) = env.flag("RESET_EXPIRE_DATE_ON_CHANGE")? {
            config.reset_expire_date_on_change = flag;
        }
        if let Some(prefix) = env.string("PREFIX") {
            config.prefix = prefix;
        }
        if let Some(flag) = env.flag("CREATE_TTL_INDEX")? {
            config.create_ttl_index = flag;
        }

        config.validate()?;
        Ok(config)
    }
}

/// Configuration for the Redis backing collection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Redis connection URL
    pub url: String,

    /// Namespace for all records of one store inside the Redis keyspace
    #[serde(default = "default_collection_name")]
    pub collection_name: String,

    /// ACL user, overrides any user in the URL
    #[serde(default)]
    pub username: Option<String>,

    /// Password, overrides any password in the URL
    #[serde(default)]
    pub password: Option<String>,

    /// Logical database to select after authenticating, overrides the URL path
    #[serde(default)]
    pub database: Option<i64>,

    /// Connection timeout
    #[serde(default = "default_conn_timeout", with = "duration_serde")]
    pub connection_timeout: Duration,

    /// Upper bound for a single command round trip
    #[serde(default = "default_command_timeout", with = "duration_serde")]
    pub command_timeout: Duration,
}

fn default_collection_name() -> String {
    "rate_limit_records".to_string()
}

fn default_conn_timeout() -> Duration {
    Duration::from_secs(2)
}

fn default_command_timeout() -> Duration {
    Duration::from_secs(5)
}

impl RedisConfig {
    /// Config for `url` with every other setting at its default
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            collection_name: default_collection_name(),
            username: None,
            password: None,
            database: None,
            connection_timeout: default_conn_timeout(),
            command_timeout: default_command_timeout(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.url.trim().is_empty() {
            return Err(CounterStoreError::Config(
                "redis url must be set".to_string(),
            ));
        }
        if self.collection_name.is_empty() {
            return Err(CounterStoreError::Config(
                "collection_name must not be empty".to_string(),
            ));
        }
        // records live under `<collection_name>:<key>`, so a colon would nest
        // one collection inside another
        if self.collection_name.contains(':') {
            return Err(CounterStoreError::Config(format!(
                "collection_name '{}' must not contain ':'",
                self.collection_name
            )));
        }
        if self.username.is_some() && self.password.is_none() {
            return Err(CounterStoreError::Config(
                "username requires a password".to_string(),
            ));
        }
        if self.connection_timeout.is_zero() || self.command_timeout.is_zero() {
            return Err(CounterStoreError::Config(
                "timeouts must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Loads the config from `COUNTER_STORE_REDIS_*` environment variables.
    /// `COUNTER_STORE_REDIS_URL` is required.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Like [`from_env`](RedisConfig::from_env), but uses `default_url` when
    /// `COUNTER_STORE_REDIS_URL` is unset. Every other variable is still read
    /// and checked.
    pub fn from_env_or(default_url: &str) -> Result<Self> {
        Self::from_lookup_or(|name| std::env::var(name).ok(), Some(default_url))
    }

    pub(crate) fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        Self::from_lookup_or(lookup, None)
    }

    pub(crate) fn from_lookup_or<F>(lookup: F, default_url: Option<&str>) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = EnvReader::new(&lookup);

        let url = env
            .string("REDIS_URL")
            .or_else(|| default_url.map(str::to_string))
            .ok_or_else(|| {
                CounterStoreError::Config(format!("{}REDIS_URL is not set", ENV_PREFIX))
            })?;

        let mut config = Self::new(url);
        if let Some(name) = env.string("REDIS_COLLECTION") {
            config.collection_name = name;
        }
        config.username = env.string("REDIS_USERNAME");
        config.password = env.string("REDIS_PASSWORD");
        config.database = env.parse::<i64>("REDIS_DATABASE")?;
        if let Some(ms) = env.parse::<u64>("REDIS_CONNECTION_TIMEOUT_MS")? {
            config.connection_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = env.parse::<u64>("REDIS_COMMAND_TIMEOUT_MS")? {
            config.command_timeout = Duration::from_millis(ms);
        }

        config.validate()?;
        Ok(config)
    }
}

/// Configuration for the in-memory backing collection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InMemoryConfig {
    /// Maximum number of records to hold
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,

    /// How often the expiry sweep runs once provisioned
    #[serde(default = "default_sweep_interval", with = "duration_serde")]
    pub sweep_interval: Duration,
}

fn default_max_entries() -> usize {
    10_000
}

fn default_sweep_interval() -> Duration {
    Duration::from_secs(60)
}

impl Default for InMemoryConfig {
    fn default() -> Self {
        Self {
            max_entries: default_max_entries(),
            sweep_interval: default_sweep_interval(),
        }
    }
}

impl InMemoryConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_entries == 0 {
            return Err(CounterStoreError::Config(
                "max_entries must be greater than zero".to_string(),
            ));
        }
        if self.sweep_interval.is_zero() {
            return Err(CounterStoreError::Config(
                "sweep_interval must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

struct EnvReader<'a, F> {
    lookup: &'a F,
}

impl<'a, F> EnvReader<'a, F>
where
    F: Fn(&str) -> Option<String>,
{
    fn new(lookup: &'a F) -> Self {
        Self { lookup }
    }

    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(&format!("{}{}", ENV_PREFIX, name)).filter(|v| !v.is_empty())
    }

    fn parse<T>(&self, name: &str) -> Result<Option<T>>
    where
        T: std::str::FromStr,
        T::Err: std::fmt::Display,
    {
        self.string(name)
            .map(|raw| {
                raw.trim().parse::<T>().map_err(|e| {
                    CounterStoreError::Config(format!("{}{}: {}", ENV_PREFIX, name, e))
                })
            })
            .transpose()
    }

    fn flag(&self, name: &str) -> Result<Option<bool>> {
        self.string(name)
            .map(|raw| match raw.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => Ok(true),
                "0" | "false" | "no" | "off" => Ok(false),
                other => Err(CounterStoreError::Config(format!(
                    "{}{}: expected a boolean, got '{}'",
                    ENV_PREFIX, name, other
                ))),
            })
            .transpose()
    }
}

// Helper module to serialize/deserialize Duration with serde
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
