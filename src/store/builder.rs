// src/store/builder.rs

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use super::counter_store::{CollectionSource, CounterStore, ErrorHandler};
use crate::config::StoreConfig;
use crate::error::{CounterStoreError, Result};
use crate::storage::CounterCollection;

/// Collects the settings of a [`CounterStore`] and checks them once in
/// [`build`](CounterStoreBuilder::build).
///
/// Either a ready collection or the settings to connect one lazily must be
/// given. When both are, the ready collection is used.
pub struct CounterStoreBuilder<C: CounterCollection> {
    config: StoreConfig,
    collection: Option<Arc<C>>,
    connection: Option<C::Config>,
    error_handler: Option<ErrorHandler>,
}

impl<C: CounterCollection> fmt::Debug for CounterStoreBuilder<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CounterStoreBuilder")
            .field("config", &self.config)
            .field("collection", &self.collection)
            .field("connection", &self.connection)
            .field("error_handler", &self.error_handler.is_some())
            .finish()
    }
}

impl<C: CounterCollection> Default for CounterStoreBuilder<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: CounterCollection> CounterStoreBuilder<C> {
    pub fn new() -> Self {
        Self {
            config: StoreConfig::default(),
            collection: None,
            connection: None,
            error_handler: None,
        }
    }

    /// Replaces all window and key settings at once
    pub fn config(mut self, config: StoreConfig) -> Self {
        self.config = config;
        self
    }

    pub fn expire_time(mut self, expire_time: Duration) -> Self {
        self.config.expire_time = expire_time;
        self
    }

    pub fn reset_expire_date_on_change(mut self, reset: bool) -> Self {
        self.config.reset_expire_date_on_change = reset;
        self
    }

    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.prefix = prefix.into();
        self
    }

    pub fn create_ttl_index(mut self, create: bool) -> Self {
        self.config.create_ttl_index = create;
        self
    }

    /// Observer for failed operations, e.g. to count them
    pub fn error_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&CounterStoreError) + Send + Sync + 'static,
    {
        self.error_handler = Some(Arc::new(handler));
        self
    }

    /// Use an already established collection
    pub fn collection(mut self, collection: Arc<C>) -> Self {
        self.collection = Some(collection);
        self
    }

    /// Connect a collection with these settings on first use
    pub fn connection(mut self, config: C::Config) -> Self {
        self.connection = Some(config);
        self
    }

    pub fn build(self) -> Result<CounterStore<C>> {
        self.config.validate()?;

        let source = match (self.collection, self.connection) {
            (Some(collection), _) => CollectionSource::Ready(collection),
            (None, Some(connection)) => {
                C::validate_config(&connection)?;
                CollectionSource::Connect(connection)
            }
            (None, None) => {
                return Err(CounterStoreError::Config(
                    "a collection or connection settings must be set".to_string(),
                ));
            }
        };

        Ok(CounterStore::from_parts(
            source,
            self.config.expire_time,
            self.config.reset_expire_date_on_change,
            self.config.prefix,
            self.config.create_ttl_index,
            self.error_handler,
        ))
    }
}
