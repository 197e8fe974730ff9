// Redis-backed lock store shared by every scheduler process

use super::LockStore;
use crate::config::RedisConfig;
use crate::errors::{LockError, StorageError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use tracing::{debug, info, instrument};

/// Redis connection pool wrapper
#[derive(Clone)]
pub struct RedisPool {
    manager: ConnectionManager,
}

impl RedisPool {
    /// Create a new Redis connection pool
    #[instrument(skip(config), fields(redis_url = %config.url))]
    pub async fn new(config: &RedisConfig) -> Result<Self, StorageError> {
        info!("Initializing Redis connection pool");

        let client = Client::open(config.url.as_str()).map_err(|e| {
            StorageError::ConnectionFailed(format!("Failed to create Redis client: {}", e))
        })?;

        let manager = ConnectionManager::new(client).await.map_err(|e| {
            StorageError::ConnectionFailed(format!("Failed to create connection manager: {}", e))
        })?;

        info!("Redis connection pool initialized successfully");

        Ok(Self { manager })
    }

    /// Get a connection from the pool
    pub fn get_connection(&self) -> ConnectionManager {
        self.manager.clone()
    }

    /// Health check - verify Redis connection is working
    #[instrument(skip(self))]
    pub async fn health_check(&self) -> Result<(), StorageError> {
        let mut conn = self.get_connection();

        let response: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| StorageError::RedisError(format!("Health check failed: {}", e)))?;

        if response != "PONG" {
            return Err(StorageError::RedisError(format!(
                "Unexpected PING response: {}",
                response
            )));
        }

        Ok(())
    }
}

/// Lock store on Redis. The record value is the expiry in epoch
/// milliseconds and the key carries a matching PX TTL, so Redis itself
/// drops expired records and `SET NX` is the atomic check-and-set.
#[derive(Clone)]
pub struct RedisLockStore {
    pool: RedisPool,
}

impl RedisLockStore {
    pub fn new(pool: RedisPool) -> Self {
        Self { pool }
    }
}

fn unavailable(context: &str, e: redis::RedisError) -> LockError {
    LockError::LockStoreUnavailable(format!("{}: {}", context, e))
}

#[async_trait]
impl LockStore for RedisLockStore {
    async fn get(&self, key: &str) -> Result<Option<DateTime<Utc>>, LockError> {
        let mut conn = self.pool.get_connection();
        let value: Option<i64> = conn
            .get(key)
            .await
            .map_err(|e| unavailable("Failed to read lock", e))?;
        Ok(value.and_then(DateTime::<Utc>::from_timestamp_millis))
    }

    #[instrument(skip(self), fields(key = %key))]
    async fn set_if_absent_or_expired(
        &self,
        key: &str,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, LockError> {
        let mut conn = self.pool.get_connection();
        let ttl_millis = (expires_at - now).num_milliseconds().max(1);

        let result: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(expires_at.timestamp_millis())
            .arg("NX") // Only set if not exists
            .arg("PX") // Expire in milliseconds
            .arg(ttl_millis)
            .query_async(&mut conn)
            .await
            .map_err(|e| unavailable("Failed to acquire lock", e))?;

        debug!(acquired = result.is_some(), ttl_millis, "Lock SET NX issued");
        Ok(result.is_some())
    }

    async fn delete(&self, key: &str) -> Result<(), LockError> {
        let mut conn = self.pool.get_connection();
        let _: i64 = conn
            .del(key)
            .await
            .map_err(|e| unavailable("Failed to release lock", e))?;
        Ok(())
    }
}
