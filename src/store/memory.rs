use std::{
    collections::{BTreeMap, HashMap},
    sync::{Mutex, MutexGuard},
};

use super::{
    StoreError,
    backend::{Guarded, KvBackend},
};

/// Process-local backend for dry runs and tests. Nothing survives a restart.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    records: Mutex<BTreeMap<String, Vec<u8>>>,
    counters: Mutex<HashMap<String, i64>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn counters(&self) -> Result<MutexGuard<'_, HashMap<String, i64>>, StoreError> {
        self.counters
            .lock()
            .map_err(|_| StoreError::Unavailable("counter table lock poisoned".into()))
    }

    fn records(&self) -> Result<MutexGuard<'_, BTreeMap<String, Vec<u8>>>, StoreError> {
        self.records
            .lock()
            .map_err(|_| StoreError::Unavailable("record table lock poisoned".into()))
    }
}

impl KvBackend for MemoryBackend {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.records()?.get(key).cloned())
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        self.records()?.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn incr_by(&self, key: &str, delta: i64) -> Result<i64, StoreError> {
        let mut counters = self.counters()?;
        let entry = counters.entry(key.to_string()).or_insert(0);
        *entry = entry
            .checked_add(delta)
            .ok_or_else(|| StoreError::Overflow(key.to_string()))?;
        Ok(*entry)
    }

    fn counter(&self, key: &str) -> Result<Option<i64>, StoreError> {
        Ok(self.counters()?.get(key).copied())
    }

    fn init_counter(&self, key: &str, value: i64) -> Result<bool, StoreError> {
        let mut counters = self.counters()?;
        if counters.contains_key(key) {
            return Ok(false);
        }
        counters.insert(key.to_string(), value);
        Ok(true)
    }

    fn decrement_if(&self, key: &str, expected: i64) -> Result<Guarded, StoreError> {
        let mut counters = self.counters()?;
        let current = counters.get(key).copied().unwrap_or(0);
        if current != expected {
            return Ok(Guarded::Skipped { current });
        }
        counters.insert(key.to_string(), current - 1);
        Ok(Guarded::Applied)
    }

    fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        Ok(self
            .records()?
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, _)| key.clone())
            .collect())
    }
}
