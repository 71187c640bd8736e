//! Durable account state.
//!
//! The store is the single authority for nonces during a run. All mutations
//! go through atomic single-key primitives of the [`KvBackend`]:
//!
//! - `account:{id}`          JSON record (address, credential, status)
//! - `nonce:{layer}:{id}`    next nonce to hand out on that layer
//! - `balance:{layer}:{id}`  cached balance in gwei
//! - `outcome:{intent}`      audit record of a finished intent

mod backend;
mod memory;
mod redb_backend;
mod redis_backend;

use std::{path::Path, sync::Arc};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

pub use backend::{Guarded, KvBackend};
pub use memory::MemoryBackend;
pub use redb_backend::RedbBackend;
pub use redis_backend::RedisBackend;

use crate::{
    account::{Account, AccountSpec, AccountStatus, CredentialRef, Layer, LayerState},
    metrics::TransactionOutcome,
};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("account {0} not found")]
    NotFound(String),
    #[error("account store unavailable: {0}")]
    Unavailable(String),
    #[error("corrupt record {key}: {reason}")]
    Corrupt { key: String, reason: String },
    #[error("counter {0} overflowed")]
    Overflow(String),
}

/// Result of [`AccountStore::rollback_nonce`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rollback {
    RolledBack,
    /// A later reservation already moved the counter; nothing was changed.
    Skipped { current: u64 },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct AccountRecord {
    id: String,
    address: alloy_primitives::Address,
    credential: CredentialRef,
    status: AccountStatus,
}

#[derive(Clone)]
pub struct AccountStore {
    backend: Arc<dyn KvBackend>,
}

impl std::fmt::Debug for AccountStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccountStore").finish_non_exhaustive()
    }
}

fn account_key(id: &str) -> String {
    format!("account:{id}")
}

fn nonce_key(id: &str, layer: Layer) -> String {
    format!("nonce:{layer}:{id}")
}

fn balance_key(id: &str, layer: Layer) -> String {
    format!("balance:{layer}:{id}")
}

fn outcome_key(intent_id: &str) -> String {
    format!("outcome:{intent_id}")
}

impl AccountStore {
    pub fn new(backend: Arc<dyn KvBackend>) -> Self {
        Self { backend }
    }

    pub fn open_redb(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Ok(Self::new(Arc::new(RedbBackend::open(path)?)))
    }

    pub fn open_redis(redis_url: &str, namespace: &str) -> Result<Self, StoreError> {
        Ok(Self::new(Arc::new(RedisBackend::new(redis_url, namespace)?)))
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryBackend::new()))
    }

    /// Run `op` on the blocking thread pool.
    ///
    /// Backend calls may fsync or wait on the network, so async callers on
    /// the hot path go through here instead of blocking a runtime worker.
    pub async fn run_blocking<T, F>(&self, op: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&AccountStore) -> Result<T, StoreError> + Send + 'static,
    {
        let store = self.clone();
        tokio::task::spawn_blocking(move || op(&store))
            .await
            .map_err(|e| StoreError::Unavailable(format!("store task failed: {e}")))?
    }

    /// Register an account unless it already exists.
    ///
    /// Counters of an existing account are left alone so a crashed run picks
    /// up where it stopped; `initial_nonces` (L1, L2) only seed new accounts.
    pub fn provision(
        &self,
        spec: &AccountSpec,
        initial_nonces: [u64; 2],
        status: AccountStatus,
    ) -> Result<Account, StoreError> {
        let key = account_key(&spec.id);
        if self.backend.get(&key)?.is_none() {
            let record = AccountRecord {
                id: spec.id.clone(),
                address: spec.address,
                credential: spec.credential.clone(),
                status,
            };
            self.write_record(&record)?;
            debug!(id = %spec.id, address = %spec.address, "Registered account");
        }

        for (layer, nonce) in Layer::ALL.into_iter().zip(initial_nonces) {
            self.backend
                .init_counter(&nonce_key(&spec.id, layer), to_counter(nonce))?;
            self.backend.init_counter(&balance_key(&spec.id, layer), 0)?;
        }

        self.get(&spec.id)
    }

    pub fn get(&self, id: &str) -> Result<Account, StoreError> {
        let record = self.read_record(id)?;

        let mut layers = [LayerState::default(); 2];
        for (state, layer) in layers.iter_mut().zip(Layer::ALL) {
            state.nonce = self
                .backend
                .counter(&nonce_key(id, layer))?
                .map(from_counter)
                .unwrap_or(0);
            state.balance_gwei = self.backend.counter(&balance_key(id, layer))?.unwrap_or(0);
        }
        let [l1, l2] = layers;

        Ok(Account {
            id: record.id,
            address: record.address,
            credential: record.credential,
            status: record.status,
            l1,
            l2,
        })
    }

    pub fn exists(&self, id: &str) -> Result<bool, StoreError> {
        Ok(self.backend.get(&account_key(id))?.is_some())
    }

    /// All registered accounts, ordered by id.
    pub fn list(&self) -> Result<Vec<Account>, StoreError> {
        self.backend
            .scan_prefix("account:")?
            .iter()
            .filter_map(|key| key.strip_prefix("account:"))
            .map(|id| self.get(id))
            .collect()
    }

    /// Hand out the next nonce for `(id, layer)`.
    ///
    /// The read and the increment are one backend operation, so concurrent
    /// callers always receive distinct, gapless values.
    pub fn reserve_nonce(&self, id: &str, layer: Layer) -> Result<u64, StoreError> {
        let key = nonce_key(id, layer);
        if self.backend.counter(&key)?.is_none() {
            return Err(StoreError::NotFound(id.to_string()));
        }
        let next = self.backend.incr_by(&key, 1)?;
        Ok(from_counter(next - 1))
    }

    /// Give back `nonce` when its transaction can not have reached the chain.
    ///
    /// Only applies while the stored counter is still `nonce + 1`.
    pub fn rollback_nonce(&self, id: &str, layer: Layer, nonce: u64) -> Result<Rollback, StoreError> {
        let expected = to_counter(nonce) + 1;
        match self.backend.decrement_if(&nonce_key(id, layer), expected)? {
            Guarded::Applied => {
                debug!(id, %layer, nonce, "Rolled back nonce");
                Ok(Rollback::RolledBack)
            }
            Guarded::Skipped { current } => {
                warn!(
                    id,
                    %layer,
                    nonce,
                    current,
                    "Nonce rollback skipped, a later reservation already consumed it"
                );
                Ok(Rollback::Skipped {
                    current: from_counter(current),
                })
            }
        }
    }

    /// Atomically add `delta_gwei` to the cached balance and return the new value.
    pub fn apply_balance_delta(&self, id: &str, layer: Layer, delta_gwei: i64) -> Result<i64, StoreError> {
        let key = balance_key(id, layer);
        if self.backend.counter(&key)?.is_none() {
            return Err(StoreError::NotFound(id.to_string()));
        }
        self.backend.incr_by(&key, delta_gwei)
    }

    pub fn set_status(&self, id: &str, status: AccountStatus) -> Result<(), StoreError> {
        let mut record = self.read_record(id)?;
        if record.status != status {
            record.status = status;
            self.write_record(&record)?;
        }
        Ok(())
    }

    pub fn record_outcome(&self, outcome: &TransactionOutcome) -> Result<(), StoreError> {
        let key = outcome_key(&outcome.intent_id);
        let bytes = serde_json::to_vec(outcome).map_err(|e| StoreError::Corrupt {
            key: key.clone(),
            reason: e.to_string(),
        })?;
        self.backend.set(&key, &bytes)
    }

    pub fn outcome(&self, intent_id: &str) -> Result<Option<TransactionOutcome>, StoreError> {
        let key = outcome_key(intent_id);
        self.backend
            .get(&key)?
            .map(|bytes| {
                serde_json::from_slice(&bytes).map_err(|e| StoreError::Corrupt {
                    key: key.clone(),
                    reason: e.to_string(),
                })
            })
            .transpose()
    }

    fn read_record(&self, id: &str) -> Result<AccountRecord, StoreError> {
        let key = account_key(id);
        let bytes = self
            .backend
            .get(&key)?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        serde_json::from_slice(&bytes).map_err(|e| StoreError::Corrupt {
            key,
            reason: e.to_string(),
        })
    }

    fn write_record(&self, record: &AccountRecord) -> Result<(), StoreError> {
        let key = account_key(&record.id);
        let bytes = serde_json::to_vec(record).map_err(|e| StoreError::Corrupt {
            key: key.clone(),
            reason: e.to_string(),
        })?;
        self.backend.set(&key, &bytes)
    }
}

fn to_counter(nonce: u64) -> i64 {
    i64::try_from(nonce).unwrap_or(i64::MAX)
}

fn from_counter(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}
