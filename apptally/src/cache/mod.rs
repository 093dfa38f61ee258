//! Counter cache adapter
//!
//! The consolidator only talks to the fast counter store through
//! [`CounterCache`]. Each method maps to a single atomic primitive of the
//! backing store, so concurrent writers and flushers need no client-side
//! locking.

use crate::core::KVStore;
use crate::core::error::Result;
use async_trait::async_trait;
use std::time::Duration;

/// Atomic integer counters with per-key expiry
#[async_trait]
pub trait CounterCache: Send + Sync {
    /// Atomically add `amount` (possibly negative) to the counter at `key`,
    /// creating it at zero first, and return the new value.
    async fn increment_by(&self, key: &str, amount: i64) -> Result<i64>;

    /// Set or refresh the time-to-live of `key`
    async fn set_expiry(&self, key: &str, ttl: Duration) -> Result<()>;

    /// Current value, `0` when the key is absent
    async fn get(&self, key: &str) -> Result<i64>;

    /// Remove the key. Returns whether it existed.
    async fn delete(&self, key: &str) -> Result<bool>;

    async fn increment(&self, key: &str) -> Result<i64> {
        self.increment_by(key, 1).await
    }

    /// Atomically subtract `amount`. The result may be negative.
    async fn decrement_by(&self, key: &str, amount: i64) -> Result<i64> {
        self.increment_by(key, -amount).await
    }
}

#[async_trait]
impl CounterCache for KVStore {
    async fn increment_by(&self, key: &str, amount: i64) -> Result<i64> {
        self.incr(key, amount).await
    }

    async fn set_expiry(&self, key: &str, ttl: Duration) -> Result<()> {
        self.expire(key, ttl).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<i64> {
        Ok(KVStore::get(self, key).await?.unwrap_or(0))
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        KVStore::delete(self, key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::KVConfig;
    use std::sync::Arc;

    fn cache() -> Arc<dyn CounterCache> {
        Arc::new(KVStore::new(KVConfig::default()))
    }

    #[tokio::test]
    async fn test_missing_key_reads_zero() {
        let cache = cache();
        assert_eq!(cache.get("app_req_anon20240101").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_increment_and_decrement() {
        let cache = cache();

        assert_eq!(cache.increment("k").await.unwrap(), 1);
        assert_eq!(cache.increment("k").await.unwrap(), 2);
        assert_eq!(cache.decrement_by("k", 5).await.unwrap(), -3);
        assert_eq!(cache.increment_by("k", 3).await.unwrap(), 0);
        assert_eq!(cache.get("k").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_set_expiry_is_idempotent() {
        let store = KVStore::new(KVConfig::default());
        store.increment("k").await.unwrap();

        store.set_expiry("k", Duration::from_secs(60)).await.unwrap();
        store.set_expiry("k", Duration::from_secs(60)).await.unwrap();
        assert!(store.ttl("k").await.unwrap().is_some());

        // Missing keys are not an error
        store.set_expiry("gone", Duration::from_secs(60)).await.unwrap();
    }

    #[tokio::test]
    async fn test_delete() {
        let cache = cache();
        cache.increment_by("k", 42).await.unwrap();

        assert!(cache.delete("k").await.unwrap());
        assert!(!cache.delete("k").await.unwrap());
        assert_eq!(cache.get("k").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_overflow_is_rejected() {
        let store = KVStore::new(KVConfig::default());
        store.increment_by("k", i64::MAX).await.unwrap();
        assert!(store.increment("k").await.is_err());
    }
}
