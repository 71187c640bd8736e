use super::StoreError;

/// Result of a guarded decrement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Guarded {
    Applied,
    /// The counter did not hold the expected value and was left untouched.
    Skipped { current: i64 },
}

/// Keyed persistence with atomic single-key primitives.
///
/// Records are opaque byte blobs; counters are signed 64-bit integers kept in
/// their own keyspace. No operation spans more than one key.
pub trait KvBackend: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    fn set(&self, key: &str, value: &[u8]) -> Result<(), StoreError>;

    /// Add `delta` to the counter (absent counts as zero) and return the new value.
    fn incr_by(&self, key: &str, delta: i64) -> Result<i64, StoreError>;

    fn counter(&self, key: &str) -> Result<Option<i64>, StoreError>;

    /// Create the counter with `value` unless it already exists. Returns whether it was written.
    fn init_counter(&self, key: &str, value: i64) -> Result<bool, StoreError>;

    /// Decrement the counter by one only if it currently equals `expected`.
    fn decrement_if(&self, key: &str, expected: i64) -> Result<Guarded, StoreError>;

    /// Record keys starting with `prefix`, sorted.
    fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError>;
}
