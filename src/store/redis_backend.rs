use redis::{Client, Commands, RedisError, Script};

use super::{
    StoreError,
    backend::{Guarded, KvBackend},
};

const DECREMENT_IF: &str = r#"
local current = tonumber(redis.call('GET', KEYS[1]) or '0')
if current == tonumber(ARGV[1]) then
    redis.call('DECR', KEYS[1])
    return {1, current}
end
return {0, current}
"#;

impl From<RedisError> for StoreError {
    fn from(err: RedisError) -> Self {
        StoreError::Unavailable(err.to_string())
    }
}

/// Shared backend in an external Redis. Records are plain string keys under a
/// namespace; counters use `INCRBY`, which Redis applies atomically.
pub struct RedisBackend {
    client: Client,
    namespace: String,
    decrement_if: Script,
}

impl RedisBackend {
    pub fn new(redis_url: &str, namespace: &str) -> Result<Self, StoreError> {
        let client = Client::open(redis_url)?;
        Ok(Self {
            client,
            namespace: namespace.to_string(),
            decrement_if: Script::new(DECREMENT_IF),
        })
    }

    fn record_key(&self, key: &str) -> String {
        format!("{}:record:{key}", self.namespace)
    }

    fn counter_key(&self, key: &str) -> String {
        format!("{}:counter:{key}", self.namespace)
    }

    /// `KEYS` pattern matching every record key under `prefix`.
    fn scan_pattern(&self, prefix: &str) -> String {
        format!("{}*", glob_escape(&self.record_key(prefix)))
    }

    fn strip_record_key<'a>(&self, key: &'a str) -> Option<&'a str> {
        key.strip_prefix(&self.namespace)?.strip_prefix(":record:")
    }
}

/// Escape the characters Redis treats as glob syntax.
fn glob_escape(s: &str) -> String {
    let mut escaped = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

impl KvBackend for RedisBackend {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let mut conn = self.client.get_connection()?;
        Ok(conn.get(self.record_key(key))?)
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        let mut conn = self.client.get_connection()?;
        conn.set::<_, _, ()>(self.record_key(key), value)?;
        Ok(())
    }

    fn incr_by(&self, key: &str, delta: i64) -> Result<i64, StoreError> {
        let mut conn = self.client.get_connection()?;
        Ok(conn.incr(self.counter_key(key), delta)?)
    }

    fn counter(&self, key: &str) -> Result<Option<i64>, StoreError> {
        let mut conn = self.client.get_connection()?;
        Ok(conn.get(self.counter_key(key))?)
    }

    fn init_counter(&self, key: &str, value: i64) -> Result<bool, StoreError> {
        let mut conn = self.client.get_connection()?;
        Ok(conn.set_nx(self.counter_key(key), value)?)
    }

    fn decrement_if(&self, key: &str, expected: i64) -> Result<Guarded, StoreError> {
        let mut conn = self.client.get_connection()?;
        let (applied, current): (i64, i64) = self
            .decrement_if
            .key(self.counter_key(key))
            .arg(expected)
            .invoke(&mut conn)?;
        Ok(if applied == 1 {
            Guarded::Applied
        } else {
            Guarded::Skipped { current }
        })
    }

    fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.client.get_connection()?;
        let keys: Vec<String> = conn.keys(self.scan_pattern(prefix))?;
        let mut keys: Vec<String> = keys
            .iter()
            .filter_map(|k| self.strip_record_key(k))
            .map(str::to_string)
            .collect();
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend(namespace: &str) -> RedisBackend {
        // opening a client only parses the url
        RedisBackend::new("redis://127.0.0.1/", namespace).unwrap()
    }

    #[test]
    fn records_and_counters_live_in_separate_namespaced_keyspaces() {
        let backend = backend("run7");
        assert_eq!(backend.record_key("account:a"), "run7:record:account:a");
        assert_eq!(backend.counter_key("nonce:l1:a"), "run7:counter:nonce:l1:a");
    }

    #[test]
    fn scan_pattern_escapes_glob_syntax() {
        let backend = backend("test[1]");
        assert_eq!(backend.scan_pattern("account:"), "test\\[1\\]:record:account:*");
        assert_eq!(backend.scan_pattern("a*?"), "test\\[1\\]:record:a\\*\\?*");
        assert_eq!(glob_escape("plain:key"), "plain:key");
    }

    #[test]
    fn strip_keeps_only_record_keys_of_this_namespace() {
        let backend = backend("ns");
        assert_eq!(backend.strip_record_key("ns:record:account:a"), Some("account:a"));
        assert_eq!(backend.strip_record_key("ns:counter:nonce:l1:a"), None);
        assert_eq!(backend.strip_record_key("other:record:account:a"), None);
    }

    /// Runs the Lua guard against a live server named by `TESTNET_STRESS_REDIS_URL`.
    #[test]
    #[ignore = "requires a running redis"]
    fn guarded_decrement_against_redis() {
        let url = std::env::var("TESTNET_STRESS_REDIS_URL")
            .unwrap_or_else(|_| "redis://127.0.0.1/".to_string());
        let namespace = format!("testnet-stress-{}", rand::random::<u32>());
        let backend = RedisBackend::new(&url, &namespace).unwrap();

        assert!(backend.init_counter("nonce:l1:a", 4).unwrap());
        assert!(!backend.init_counter("nonce:l1:a", 0).unwrap());
        assert_eq!(backend.incr_by("nonce:l1:a", 1).unwrap(), 5);
        assert_eq!(backend.decrement_if("nonce:l1:a", 4).unwrap(), Guarded::Skipped { current: 5 });
        assert_eq!(backend.decrement_if("nonce:l1:a", 5).unwrap(), Guarded::Applied);
        assert_eq!(backend.counter("nonce:l1:a").unwrap(), Some(4));

        backend.set("account:b", b"{}").unwrap();
        backend.set("account:a", b"{}").unwrap();
        assert_eq!(backend.scan_prefix("account:").unwrap(), ["account:a", "account:b"]);
    }
}
