use super::error::{Result, TallyError};
use super::types::{KVConfig, KVStats, StoredValue};
use parking_lot::RwLock;
use radix_trie::{Trie, TrieCommon};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// In-memory counter store with per-key expiry, backed by a radix trie.
///
/// Every mutation holds the trie write lock for its whole read-modify-write,
/// so `incr` is atomic across clones sharing the same store.
#[derive(Clone)]
pub struct KVStore {
    data: Arc<RwLock<Trie<String, StoredValue>>>,
    stats: Arc<RwLock<KVStats>>,
    config: KVConfig,
}

impl KVStore {
    /// Create a new KV store with the given configuration
    pub fn new(config: KVConfig) -> Self {
        info!(
            "Initializing KV store with ttl_cleanup_interval={}ms",
            config.ttl_cleanup_interval_ms
        );

        Self {
            data: Arc::new(RwLock::new(Trie::new())),
            stats: Arc::new(RwLock::new(KVStats::default())),
            config,
        }
    }

    /// Start background TTL cleanup task
    pub fn start_ttl_cleanup(&self) -> tokio::task::JoinHandle<()> {
        let interval_ms = self.config.ttl_cleanup_interval_ms;
        info!("Starting TTL cleanup task (interval={}ms)", interval_ms);

        let store = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(interval_ms));

            loop {
                interval.tick().await;
                store.cleanup_expired().await;
            }
        })
    }

    /// Get the integer stored at `key`, `None` when absent or expired
    pub async fn get(&self, key: &str) -> Result<Option<i64>> {
        debug!("GET key={}", key);

        let mut data = self.data.write();
        let mut stats = self.stats.write();
        stats.gets += 1;

        let expired = match data.get(key) {
            Some(value) => value.is_expired(),
            None => return Ok(None),
        };

        if expired {
            debug!("Key expired: {}", key);
            data.remove(key);
            stats.expired += 1;
            stats.total_keys = stats.total_keys.saturating_sub(1);
            return Ok(None);
        }

        match data.get(key) {
            Some(value) => parse_integer(key, &value.data).map(Some),
            None => Ok(None),
        }
    }

    /// Delete a key
    pub async fn delete(&self, key: &str) -> Result<bool> {
        debug!("DELETE key={}", key);

        let mut data = self.data.write();
        let removed = data.remove(key);

        if let Some(value) = removed {
            let mut stats = self.stats.write();
            stats.dels += 1;
            stats.total_keys = stats.total_keys.saturating_sub(1);
            Ok(!value.is_expired())
        } else {
            Ok(false)
        }
    }

    /// Check if a key exists
    pub async fn exists(&self, key: &str) -> Result<bool> {
        let data = self.data.read();
        if let Some(value) = data.get(key) {
            Ok(!value.is_expired())
        } else {
            Ok(false)
        }
    }

    /// Get statistics
    pub async fn stats(&self) -> KVStats {
        self.stats.read().clone()
    }

    /// Get remaining TTL for a key, `None` if the key never expires
    pub async fn ttl(&self, key: &str) -> Result<Option<u64>> {
        let data = self.data.read();
        match data.get(key) {
            Some(value) if !value.is_expired() => Ok(value.remaining_ttl_secs()),
            _ => Err(TallyError::Cache(format!("key not found: {}", key))),
        }
    }

    /// Atomic increment.
    ///
    /// A missing or expired key starts from zero. An existing expiry is kept.
    pub async fn incr(&self, key: &str, amount: i64) -> Result<i64> {
        debug!("INCR key={}, amount={}", key, amount);

        let mut data = self.data.write();

        let (current_value, ttl) = match data.get(key) {
            Some(value) if !value.is_expired() => {
                (parse_integer(key, &value.data)?, value.ttl)
            }
            _ => (0, None),
        };

        let new_value = current_value.checked_add(amount).ok_or_else(|| {
            TallyError::InvalidValue(format!("increment would overflow at {}", key))
        })?;

        let mut stored = StoredValue::new(new_value.to_string().into_bytes());
        stored.ttl = ttl;
        let is_new = data.insert(key.to_string(), stored).is_none();

        let mut stats = self.stats.write();
        stats.incrs += 1;
        if is_new {
            stats.total_keys += 1;
        }

        Ok(new_value)
    }

    /// Set or refresh the expiry of an existing key.
    ///
    /// Returns `false` when the key does not exist. A `ttl` too large to be
    /// represented is [`TallyError::InvalidValue`].
    pub async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        debug!("EXPIRE key={}, ttl={:?}", key, ttl);

        let mut data = self.data.write();
        match data.get_mut(key) {
            Some(value) if !value.is_expired() => {
                value.expire_in(ttl)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Keys starting with `prefix`
    pub async fn scan(&self, prefix: &str) -> Vec<String> {
        let data = self.data.read();
        data.get_raw_descendant(prefix)
            .map(|subtrie| {
                subtrie
                    .iter()
                    .filter(|(k, v)| k.starts_with(prefix) && !v.is_expired())
                    .map(|(k, _)| k.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Clean up expired keys
    async fn cleanup_expired(&self) {
        let mut data = self.data.write();
        let mut stats = self.stats.write();

        let expired_keys: Vec<String> = data
            .iter()
            .filter(|(_, v)| v.is_expired())
            .map(|(k, _)| k.clone())
            .collect();

        let count = expired_keys.len();
        if count > 0 {
            debug!("Cleaning up {} expired keys", count);
            for key in expired_keys {
                data.remove(&key);
            }
            stats.total_keys = stats.total_keys.saturating_sub(count);
            stats.expired += count as u64;
        }
    }
}

fn parse_integer(key: &str, data: &[u8]) -> Result<i64> {
    std::str::from_utf8(data)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or_else(|| TallyError::InvalidValue(format!("value at {} is not an integer", key)))
}
