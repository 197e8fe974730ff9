// Process-local lock store

use super::LockStore;
use crate::errors::LockError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;

/// In-memory lock store for single-process deployments.
///
/// The check-and-set runs under one mutex, so it is atomic for every
/// scheduler sharing this instance.
#[derive(Debug, Default)]
pub struct InMemoryLockStore {
    records: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl InMemoryLockStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().map(|records| records.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn poisoned<T>(_: T) -> LockError {
    LockError::LockStoreUnavailable("in-memory lock store mutex poisoned".to_string())
}

#[async_trait]
impl LockStore for InMemoryLockStore {
    async fn get(&self, key: &str) -> Result<Option<DateTime<Utc>>, LockError> {
        let records = self.records.lock().map_err(poisoned)?;
        Ok(records.get(key).copied())
    }

    async fn set_if_absent_or_expired(
        &self,
        key: &str,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, LockError> {
        let mut records = self.records.lock().map_err(poisoned)?;
        match records.get(key) {
            Some(existing) if *existing > now => Ok(false),
            _ => {
                records.insert(key.to_string(), expires_at);
                Ok(true)
            }
        }
    }

    async fn delete(&self, key: &str) -> Result<(), LockError> {
        let mut records = self.records.lock().map_err(poisoned)?;
        records.remove(key);
        Ok(())
    }
}
