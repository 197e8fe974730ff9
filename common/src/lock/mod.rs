// Overlap-prevention locking
//
// A task marked `without_overlapping` claims a lock record keyed by its name
// before it runs. The record carries an expiry so a crashed holder cannot
// block the task forever. The store must perform the check-and-set
// atomically because several scheduler processes may share it.

pub mod memory;
pub mod redis;

pub use memory::InMemoryLockStore;
pub use self::redis::{RedisLockStore, RedisPool};

use crate::errors::LockError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

pub const DEFAULT_KEY_PREFIX: &str = "schedule:mutex";

/// Shared key-value store holding lock records (key -> expiry)
#[async_trait]
pub trait LockStore: Send + Sync {
    /// Stored expiry for `key`, if any
    async fn get(&self, key: &str) -> Result<Option<DateTime<Utc>>, LockError>;

    /// Atomically create or overwrite the record when it is absent or its
    /// expiry is at or before `now`. Returns whether the record was written.
    async fn set_if_absent_or_expired(
        &self,
        key: &str,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, LockError>;

    async fn delete(&self, key: &str) -> Result<(), LockError>;
}

/// Lock manager guaranteeing at most one in-flight run per task name
#[derive(Clone)]
pub struct OverlapLock {
    store: Arc<dyn LockStore>,
    key_prefix: String,
}

impl OverlapLock {
    pub fn new(store: Arc<dyn LockStore>) -> Self {
        Self::with_prefix(store, DEFAULT_KEY_PREFIX)
    }

    pub fn with_prefix(store: Arc<dyn LockStore>, key_prefix: impl Into<String>) -> Self {
        Self {
            store,
            key_prefix: key_prefix.into(),
        }
    }

    pub fn key_for(&self, task_name: &str) -> String {
        format!("{}:{}", self.key_prefix, task_name)
    }

    /// Claim the lock for `task_name` until `now + max_runtime`.
    ///
    /// Returns `Ok(false)` when an unexpired record already exists.
    #[instrument(skip(self), fields(task = %task_name, max_runtime_seconds = max_runtime.as_secs()))]
    pub async fn try_acquire(
        &self,
        task_name: &str,
        max_runtime: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool, LockError> {
        let expires_at = expiry_after(now, max_runtime);
        let acquired = self
            .store
            .set_if_absent_or_expired(&self.key_for(task_name), now, expires_at)
            .await?;

        if acquired {
            debug!(expires_at = %expires_at, "Overlap lock acquired");
        } else {
            debug!("Overlap lock held by a previous run");
        }
        Ok(acquired)
    }

    /// Delete the lock record unconditionally
    #[instrument(skip(self), fields(task = %task_name))]
    pub async fn release(&self, task_name: &str) -> Result<(), LockError> {
        self.store.delete(&self.key_for(task_name)).await?;
        debug!("Overlap lock released");
        Ok(())
    }

    /// Like [`try_acquire`](Self::try_acquire) but returns a guard that
    /// releases the record on every exit path.
    pub async fn acquire_guard(
        &self,
        task_name: &str,
        max_runtime: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<LockGuard>, LockError> {
        if !self.try_acquire(task_name, max_runtime, now).await? {
            return Ok(None);
        }
        Ok(Some(LockGuard {
            store: self.store.clone(),
            key: self.key_for(task_name),
            task_name: task_name.to_string(),
            released: false,
        }))
    }

    /// Whether an unexpired record exists for `task_name` at `now`
    pub async fn is_held(&self, task_name: &str, now: DateTime<Utc>) -> Result<bool, LockError> {
        Ok(self
            .store
            .get(&self.key_for(task_name))
            .await?
            .map_or(false, |expires_at| expires_at > now))
    }
}

fn expiry_after(now: DateTime<Utc>, max_runtime: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(max_runtime)
        .ok()
        .and_then(|ttl| now.checked_add_signed(ttl))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Lock guard that releases the record when dropped
pub struct LockGuard {
    store: Arc<dyn LockStore>,
    key: String,
    task_name: String,
    released: bool,
}

impl LockGuard {
    pub fn task_name(&self) -> &str {
        &self.task_name
    }

    /// Release now and report the outcome
    pub async fn release(mut self) -> Result<(), LockError> {
        self.released = true;
        let result = self.store.delete(&self.key).await;
        match &result {
            Ok(()) => debug!(task = %self.task_name, "Overlap lock released"),
            Err(e) => warn!(task = %self.task_name, error = %e, "Failed to release overlap lock"),
        }
        result
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }

        let store = self.store.clone();
        let key = std::mem::take(&mut self.key);
        let task_name = std::mem::take(&mut self.task_name);

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = store.delete(&key).await {
                        warn!(task = %task_name, error = %e, "Failed to release lock on drop");
                    } else {
                        info!(task = %task_name, "Overlap lock released on drop");
                    }
                });
            }
            Err(_) => {
                warn!(task = %task_name, "No runtime available, lock left to expire");
            }
        }
    }
}
