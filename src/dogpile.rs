//! Dogpile (stampede) prevention
//!
//! Each value is written with a companion freshness token. The token lives
//! for the requested TTL while the value lives `expiration_factor` times
//! longer. When a reader finds the value but not the token, it re-arms the
//! token and reports a miss to that one caller, who is then responsible for
//! the refresh. Everyone reading after the token is re-armed keeps getting
//! the cached value until the refresh lands.
//!
//! The check and the re-arm are two store operations, so several readers
//! racing on the same expired token may all be told to refresh.
//!
//! Token keys go through the region's key encoding like every other
//! physical key, so they obey the same length limit.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::CacheError;
use crate::config::RegionConfig;
use crate::key_codec::KeyCodec;
use crate::kv::{KvClient, KvValue};

const DOGPILE_TOKEN: KvValue = KvValue::Counter(0);

/// [`KvClient`] wrapper applying dogpile prevention to `get`, `get_multi`,
/// `set` and `add`. Other operations pass through.
pub struct DogpileGuard<C: KvClient> {
    inner: Arc<C>,
    enabled: bool,
    expiration_factor: f64,
    /// TTL used when a reader re-arms an expired token
    token_ttl: Duration,
    token_prefix: String,
    codec: KeyCodec,
}

impl<C: KvClient> Clone for DogpileGuard<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            enabled: self.enabled,
            expiration_factor: self.expiration_factor,
            token_ttl: self.token_ttl,
            token_prefix: self.token_prefix.clone(),
            codec: self.codec.clone(),
        }
    }
}

impl<C: KvClient> DogpileGuard<C> {
    pub fn new(inner: Arc<C>, config: &RegionConfig) -> Self {
        Self {
            inner,
            enabled: config.dogpile_enabled,
            expiration_factor: config.dogpile_expiration_factor,
            token_ttl: config.cache_ttl,
            token_prefix: config.dogpile_token_prefix.clone(),
            codec: KeyCodec::new(config),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// The wrapped client.
    pub fn inner(&self) -> &Arc<C> {
        &self.inner
    }

    /// Encoded token key of the physical value key `key`.
    pub fn token_key(&self, key: &str) -> Result<String, CacheError> {
        self.codec.encode(&self.codec.join(&[key, &self.token_prefix]))
    }

    fn value_ttl(&self, ttl: Duration) -> Duration {
        ttl.mul_f64(self.expiration_factor.max(0.0))
    }

    async fn arm_token(&self, token_key: &str, ttl: Duration) {
        if let Err(e) = self.inner.set(token_key, ttl, DOGPILE_TOKEN).await {
            warn!("Failed to set dogpile token {}: {}", token_key, e);
        }
    }

    async fn get_multi_guarded(
        &self,
        keys: &[String],
    ) -> Result<HashMap<String, KvValue>, CacheError> {
        let token_keys = keys
            .iter()
            .map(|k| self.token_key(k))
            .collect::<Result<Vec<_>, _>>()?;
        let mut all_keys = Vec::with_capacity(keys.len() * 2);
        all_keys.extend_from_slice(keys);
        all_keys.extend_from_slice(&token_keys);
        debug!("Checking dogpile keys: {:?}", token_keys);

        let mut multi = self.inner.get_multi(&all_keys).await?;
        for (key, token_key) in keys.iter().zip(&token_keys) {
            if multi.remove(token_key).is_none() && multi.contains_key(key) {
                debug!(
                    "Dogpile token ({}) not found, re-arming token and reporting a miss",
                    token_key
                );
                self.arm_token(token_key, self.token_ttl).await;
                multi.remove(key);
            }
        }
        Ok(multi)
    }
}

#[async_trait]
impl<C: KvClient> KvClient for DogpileGuard<C> {
    async fn get(&self, key: &str) -> Result<Option<KvValue>, CacheError> {
        if !self.enabled {
            return self.inner.get(key).await;
        }
        let mut multi = self.get_multi_guarded(&[key.to_owned()]).await?;
        Ok(multi.remove(key))
    }

    async fn get_multi(&self, keys: &[String]) -> Result<HashMap<String, KvValue>, CacheError> {
        if !self.enabled {
            return self.inner.get_multi(keys).await;
        }
        self.get_multi_guarded(keys).await
    }

    async fn set(&self, key: &str, ttl: Duration, value: KvValue) -> Result<bool, CacheError> {
        if !self.enabled {
            return self.inner.set(key, ttl, value).await;
        }
        let token_key = self.token_key(key)?;
        debug!("Dogpile prevention enabled, setting token and adjusting cache time for {}", key);
        self.arm_token(&token_key, ttl).await;
        self.inner.set(key, self.value_ttl(ttl), value).await
    }

    async fn add(&self, key: &str, ttl: Duration, value: KvValue) -> Result<bool, CacheError> {
        if !self.enabled {
            return self.inner.add(key, ttl, value).await;
        }
        let token_key = self.token_key(key)?;
        // only a value this caller actually stored gets a fresh token
        let added = self.inner.add(key, self.value_ttl(ttl), value).await?;
        if added {
            self.arm_token(&token_key, ttl).await;
        }
        Ok(added)
    }

    async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        if self.enabled {
            match self.token_key(key) {
                Ok(token_key) => {
                    if let Err(e) = self.inner.delete(&token_key).await {
                        warn!("Failed to delete dogpile token {}: {}", token_key, e);
                    }
                }
                // no token can have been stored under an unencodable key
                Err(e) => debug!("No dogpile token to delete for {}: {}", key, e),
            }
        }
        self.inner.delete(key).await
    }

    async fn incr(&self, key: &str, by: u64, initial: u64) -> Result<u64, CacheError> {
        self.inner.incr(key, by, initial).await
    }

    async fn decr(&self, key: &str, by: u64, initial: u64) -> Result<u64, CacheError> {
        self.inner.decr(key, by, initial).await
    }

    async fn shutdown(&self) -> Result<(), CacheError> {
        self.inner.shutdown().await
    }
}

#[cfg(test)]
mod tests {
    use tokio::time::advance;

    use super::*;
    use crate::memory::InMemoryKv;

    fn guard(enabled: bool) -> (Arc<InMemoryKv>, DogpileGuard<InMemoryKv>) {
        let config = RegionConfig {
            dogpile_enabled: enabled,
            dogpile_expiration_factor: 3.0,
            cache_ttl: Duration::from_secs(10),
            ..RegionConfig::new("products")
        };
        let kv = Arc::new(InMemoryKv::new());
        (Arc::clone(&kv), DogpileGuard::new(kv, &config))
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_reader_after_token_expiry_refreshes() {
        let (_, guard) = guard(true);
        let ttl = Duration::from_secs(10);
        guard.set("k", ttl, "v".into()).await.unwrap();

        advance(Duration::from_secs(5)).await;
        assert_eq!(guard.get("k").await.unwrap(), Some(KvValue::from("v")));

        // token gone, value still there: only this caller is told to refresh
        advance(Duration::from_secs(6)).await;
        assert_eq!(guard.get("k").await.unwrap(), None);
        assert_eq!(guard.get("k").await.unwrap(), Some(KvValue::from("v")));
        assert_eq!(guard.get("k").await.unwrap(), Some(KvValue::from("v")));

        // past ttl * factor the value itself is gone
        advance(Duration::from_secs(20)).await;
        assert_eq!(guard.get("k").await.unwrap(), None);
        assert_eq!(guard.get("k").await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_value_outlives_token() {
        let (kv, guard) = guard(true);
        guard.set("k", Duration::from_secs(10), "v".into()).await.unwrap();

        advance(Duration::from_secs(29)).await;
        assert_eq!(kv.get("k").await.unwrap(), Some(KvValue::from("v")));
        assert_eq!(kv.get(&guard.token_key("k").unwrap()).await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_multi_only_misses_expired_tokens() {
        let (_, guard) = guard(true);
        guard.set("old", Duration::from_secs(10), "a".into()).await.unwrap();
        advance(Duration::from_secs(8)).await;
        guard.set("new", Duration::from_secs(10), "b".into()).await.unwrap();
        advance(Duration::from_secs(4)).await;

        let keys = vec!["old".to_owned(), "new".to_owned(), "none".to_owned()];
        let first = guard.get_multi(&keys).await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first.get("new"), Some(&KvValue::from("b")));

        let second = guard.get_multi(&keys).await.unwrap();
        assert_eq!(second.len(), 2);
        assert!(second.contains_key("old") && second.contains_key("new"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_passes_through() {
        let (kv, guard) = guard(false);
        guard.set("k", Duration::from_secs(10), "v".into()).await.unwrap();
        assert_eq!(kv.len().await, 1);

        advance(Duration::from_secs(11)).await;
        assert_eq!(guard.get("k").await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_add_arms_token_only_when_stored() {
        let (kv, guard) = guard(true);
        assert!(guard.add("k", Duration::from_secs(10), "v".into()).await.unwrap());
        assert!(kv.get(&guard.token_key("k").unwrap()).await.unwrap().is_some());

        advance(Duration::from_secs(11)).await;
        assert!(!guard.add("k", Duration::from_secs(10), "w".into()).await.unwrap());
        assert!(kv.get(&guard.token_key("k").unwrap()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_removes_token() {
        let (kv, guard) = guard(true);
        guard.set("k", Duration::from_secs(10), "v".into()).await.unwrap();
        assert!(guard.delete("k").await.unwrap());
        assert!(kv.is_empty().await);
    }

    #[tokio::test]
    async fn test_token_keys_are_encoded_within_the_length_limit() {
        let config = RegionConfig {
            dogpile_enabled: true,
            key_encoding: "valid".parse().unwrap(),
            max_key_length: 250,
            ..RegionConfig::new("products")
        };
        let kv = Arc::new(InMemoryKv::new());
        let guard = DogpileGuard::new(Arc::clone(&kv), &config);

        let short = guard.token_key("products:0:p1").unwrap();
        assert_eq!(short, "products:0:p1:dogpile_token");

        // the value key fits, its token would not
        let long_key = format!("products:0:{}", "k".repeat(235));
        assert_eq!(long_key.len(), 246);
        assert!(matches!(
            guard.token_key(&long_key),
            Err(CacheError::InvalidKey { max_len: 250, .. })
        ));
        assert!(matches!(
            guard.set(&long_key, Duration::from_secs(10), "v".into()).await,
            Err(CacheError::InvalidKey { .. })
        ));
        assert!(kv.is_empty().await);
    }

    #[tokio::test]
    async fn test_digest_token_keys_have_fixed_length() {
        let config = RegionConfig {
            dogpile_enabled: true,
            ..RegionConfig::new("products")
        };
        let guard = DogpileGuard::new(Arc::new(InMemoryKv::new()), &config);
        let token = guard.token_key(&"x".repeat(1000)).unwrap();
        assert_eq!(token.len(), 40);
    }
}
