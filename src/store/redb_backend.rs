use std::path::Path;

use redb::{Database, ReadableTable, TableDefinition};
use tracing::info;

use super::{
    StoreError,
    backend::{Guarded, KvBackend},
};

const RECORDS: TableDefinition<&str, &[u8]> = TableDefinition::new("records");
const COUNTERS: TableDefinition<&str, i64> = TableDefinition::new("counters");

fn unavailable<E: Into<redb::Error>>(err: E) -> StoreError {
    StoreError::Unavailable(err.into().to_string())
}

/// Durable single-file backend. Every mutation is its own committed write
/// transaction; redb serialises writers, which makes each one atomic.
pub struct RedbBackend {
    db: Database,
}

impl RedbBackend {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::Unavailable(e.to_string()))?;
        }
        info!(path = %path.display(), "Opening account store");

        let db = Database::create(path).map_err(unavailable)?;

        let write_txn = db.begin_write().map_err(unavailable)?;
        {
            let _ = write_txn.open_table(RECORDS).map_err(unavailable)?;
            let _ = write_txn.open_table(COUNTERS).map_err(unavailable)?;
        }
        write_txn.commit().map_err(unavailable)?;

        Ok(Self { db })
    }

    /// Read-modify-write on one counter inside a single write transaction.
    fn update_counter<T>(
        &self,
        key: &str,
        f: impl FnOnce(Option<i64>) -> Result<(Option<i64>, T), StoreError>,
    ) -> Result<T, StoreError> {
        let write_txn = self.db.begin_write().map_err(unavailable)?;
        let result = {
            let mut table = write_txn.open_table(COUNTERS).map_err(unavailable)?;
            let current = table.get(key).map_err(unavailable)?.map(|v| v.value());
            let (next, result) = f(current)?;
            if let Some(next) = next {
                table.insert(key, next).map_err(unavailable)?;
            }
            result
        };
        write_txn.commit().map_err(unavailable)?;
        Ok(result)
    }
}

impl KvBackend for RedbBackend {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let read_txn = self.db.begin_read().map_err(unavailable)?;
        let table = read_txn.open_table(RECORDS).map_err(unavailable)?;
        Ok(table
            .get(key)
            .map_err(unavailable)?
            .map(|v| v.value().to_vec()))
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        let write_txn = self.db.begin_write().map_err(unavailable)?;
        {
            let mut table = write_txn.open_table(RECORDS).map_err(unavailable)?;
            table.insert(key, value).map_err(unavailable)?;
        }
        write_txn.commit().map_err(unavailable)
    }

    fn incr_by(&self, key: &str, delta: i64) -> Result<i64, StoreError> {
        self.update_counter(key, |current| {
            let next = current
                .unwrap_or(0)
                .checked_add(delta)
                .ok_or_else(|| StoreError::Overflow(key.to_string()))?;
            Ok((Some(next), next))
        })
    }

    fn counter(&self, key: &str) -> Result<Option<i64>, StoreError> {
        let read_txn = self.db.begin_read().map_err(unavailable)?;
        let table = read_txn.open_table(COUNTERS).map_err(unavailable)?;
        Ok(table.get(key).map_err(unavailable)?.map(|v| v.value()))
    }

    fn init_counter(&self, key: &str, value: i64) -> Result<bool, StoreError> {
        self.update_counter(key, |current| match current {
            Some(_) => Ok((None, false)),
            None => Ok((Some(value), true)),
        })
    }

    fn decrement_if(&self, key: &str, expected: i64) -> Result<Guarded, StoreError> {
        self.update_counter(key, |current| {
            let current = current.unwrap_or(0);
            if current == expected {
                Ok((Some(current - 1), Guarded::Applied))
            } else {
                Ok((None, Guarded::Skipped { current }))
            }
        })
    }

    fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let read_txn = self.db.begin_read().map_err(unavailable)?;
        let table = read_txn.open_table(RECORDS).map_err(unavailable)?;

        let mut keys = Vec::new();
        for entry in table.range(prefix..).map_err(unavailable)? {
            let (key, _) = entry.map_err(unavailable)?;
            let key = key.value();
            if !key.starts_with(prefix) {
                break;
            }
            keys.push(key.to_string());
        }
        Ok(keys)
    }
}
