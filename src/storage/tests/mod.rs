// src/storage/tests/mod.rs

mod memory_tests;

// Common checks that every collection must pass
pub(crate) mod common {
    use chrono::{TimeDelta, Utc};
    use std::sync::Arc;

    use crate::error::Result;
    use crate::storage::{CounterCollection, ExpiryWrite};

    // Upsert creates, increments and returns the post-image
    pub async fn test_upsert_counts<C: CounterCollection>(collection: &C, key: &str) -> Result<()> {
        let expiration = Utc::now() + TimeDelta::seconds(60);

        assert!(collection.find(key).await?.is_none());

        let created = collection
            .upsert(key, 1, expiration, ExpiryWrite::OnInsert)
            .await?;
        assert_eq!(created.key, key);
        assert_eq!(created.counter, 1);

        let second = collection
            .upsert(key, 1, expiration, ExpiryWrite::OnInsert)
            .await?;
        assert_eq!(second.counter, 2);

        let found = collection.find(key).await?.expect("record should exist");
        assert_eq!(found.counter, 2);
        assert_eq!(found.expiration_date, second.expiration_date);

        // negative deltas are applied as-is
        let lowered = collection
            .upsert(key, -3, expiration, ExpiryWrite::OnInsert)
            .await?;
        assert_eq!(lowered.counter, -1);

        collection.delete(key).await?;
        Ok(())
    }

    // OnInsert keeps the first expiry, Always replaces it
    pub async fn test_expiry_write_policy<C: CounterCollection>(
        collection: &C,
        key: &str,
    ) -> Result<()> {
        let first = Utc::now() + TimeDelta::seconds(60);
        let later = first + TimeDelta::seconds(30);

        let created = collection
            .upsert(key, 1, first, ExpiryWrite::OnInsert)
            .await?;
        assert_eq!(
            created.expiration_date.timestamp_millis(),
            first.timestamp_millis()
        );

        let kept = collection
            .upsert(key, 1, later, ExpiryWrite::OnInsert)
            .await?;
        assert_eq!(
            kept.expiration_date.timestamp_millis(),
            first.timestamp_millis(),
            "OnInsert must not move an existing expiry"
        );

        let moved = collection.upsert(key, 1, later, ExpiryWrite::Always).await?;
        assert_eq!(
            moved.expiration_date.timestamp_millis(),
            later.timestamp_millis()
        );
        assert_eq!(moved.counter, 3);

        collection.delete(key).await?;
        Ok(())
    }

    // Delete is idempotent and a deleted key starts over at one
    pub async fn test_delete<C: CounterCollection>(collection: &C, key: &str) -> Result<()> {
        let expiration = Utc::now() + TimeDelta::seconds(60);

        assert!(!collection.delete(key).await?, "nothing to delete yet");

        collection
            .upsert(key, 1, expiration, ExpiryWrite::OnInsert)
            .await?;
        collection
            .upsert(key, 1, expiration, ExpiryWrite::OnInsert)
            .await?;

        assert!(collection.delete(key).await?);
        assert!(collection.find(key).await?.is_none());
        assert!(!collection.delete(key).await?);

        let recreated = collection
            .upsert(key, 1, expiration, ExpiryWrite::OnInsert)
            .await?;
        assert_eq!(recreated.counter, 1);

        collection.delete(key).await?;
        Ok(())
    }

    // Concurrent upserts on one key must each apply exactly once
    pub async fn test_concurrent_upserts<C: CounterCollection + 'static>(
        collection: Arc<C>,
        key: &str,
        tasks: usize,
        per_task: usize,
    ) -> Result<()> {
        let expiration = Utc::now() + TimeDelta::seconds(60);

        let handles: Vec<_> = (0..tasks)
            .map(|_| {
                let collection = Arc::clone(&collection);
                let key = key.to_string();
                tokio::spawn(async move {
                    for _ in 0..per_task {
                        collection
                            .upsert(&key, 1, expiration, ExpiryWrite::OnInsert)
                            .await?;
                    }
                    Result::Ok(())
                })
            })
            .collect();

        for result in futures::future::join_all(handles).await {
            result.expect("upsert task panicked")?;
        }

        let record = collection.find(key).await?.expect("record should exist");
        assert_eq!(record.counter, (tasks * per_task) as i64);

        collection.delete(key).await?;
        Ok(())
    }
}
