//! Redis implementation of IdempotencyStore.

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use std::time::Duration;

use crate::domain::IdempotencyRecord;
use crate::ports::{IdempotencyStore, StoreError};

const IDEMPOTENCY_PREFIX: &str = "idempotency:";

/// Records live under `idempotency:<key>` as JSON, expired by Redis itself.
#[derive(Clone)]
pub struct RedisIdempotencyStore {
    connection: MultiplexedConnection,
}

impl RedisIdempotencyStore {
    pub async fn connect(redis_url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(redis_url)?;
        let connection = client.get_multiplexed_async_connection().await?;
        Ok(Self { connection })
    }

    fn redis_key(key: &str) -> String {
        format!("{}{}", IDEMPOTENCY_PREFIX, key)
    }
}

#[async_trait]
impl IdempotencyStore for RedisIdempotencyStore {
    async fn get(&self, key: &str) -> Result<Option<IdempotencyRecord>, StoreError> {
        let mut conn = self.connection.clone();
        let existing: Option<String> = conn.get(Self::redis_key(key)).await?;

        existing
            .map(|raw| {
                serde_json::from_str(&raw).map_err(|e| StoreError::Corrupt(format!("{key}: {e}")))
            })
            .transpose()
    }

    async fn set(
        &self,
        key: &str,
        record: &IdempotencyRecord,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let serialized =
            serde_json::to_string(record).map_err(|e| StoreError::Corrupt(e.to_string()))?;
        let mut conn = self.connection.clone();
        // SET EX rejects zero; sub-second TTLs round up.
        let seconds = ttl.as_secs().max(1);
        let _: () = conn.set_ex(Self::redis_key(key), serialized, seconds).await?;
        Ok(())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.connection.clone();
        redis::cmd("PING").query_async::<_, String>(&mut conn).await?;
        Ok(())
    }
}
