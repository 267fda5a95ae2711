//! Region-scoped cache facade
//!
//! Callers address a [`Region`] with logical keys. Physical key
//! construction, the clear generation lookup, dogpile prevention and the
//! lock key layout all stay behind this facade.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::{debug, warn};

use crate::CacheError;
use crate::clear::ClearStrategy;
use crate::config::RegionConfig;
use crate::dogpile::DogpileGuard;
use crate::key_codec::KeyCodec;
use crate::key_lock::{LockKeys, ReadWriteKeyLock, key_lock_for};
use crate::kv::{KvClient, KvValue};

/// Physical keys for one logical key, resolved against a single generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedKey {
    pub generation: u64,
    pub value: String,
    pub locks: LockKeys,
}

pub struct Region<C: KvClient> {
    config: Arc<RegionConfig>,
    codec: KeyCodec,
    clear: ClearStrategy<C>,
    client: DogpileGuard<C>,
    lock: Arc<dyn ReadWriteKeyLock>,
    read_lock_namespace: String,
    write_lock_namespace: String,
}

impl<C: KvClient> Clone for Region<C> {
    fn clone(&self) -> Self {
        Self {
            config: Arc::clone(&self.config),
            codec: self.codec.clone(),
            clear: self.clear.clone(),
            client: self.client.clone(),
            lock: Arc::clone(&self.lock),
            read_lock_namespace: self.read_lock_namespace.clone(),
            write_lock_namespace: self.write_lock_namespace.clone(),
        }
    }
}

impl<C: KvClient> Region<C> {
    /// Create a region over a shared KV client.
    pub fn new(client: Arc<C>, config: RegionConfig) -> Result<Self, CacheError> {
        let codec = KeyCodec::new(&config);
        let clear = ClearStrategy::new(Arc::clone(&client), &config, &codec)?;
        let lock: Arc<dyn ReadWriteKeyLock> = Arc::from(key_lock_for(Arc::clone(&client), &config));
        let read_lock_namespace = codec.join(&[&config.read_lock_prefix, &config.name]);
        let write_lock_namespace = codec.join(&[&config.write_lock_prefix, &config.name]);

        if config.dogpile_enabled && config.dogpile_expiration_factor <= 1.0 {
            warn!(
                "Region {}: dogpile expiration factor {} leaves values expiring with their tokens",
                config.name, config.dogpile_expiration_factor
            );
        }

        Ok(Self {
            client: DogpileGuard::new(client, &config),
            config: Arc::new(config),
            codec,
            clear,
            lock,
            read_lock_namespace,
            write_lock_namespace,
        })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &RegionConfig {
        &self.config
    }

    /// Default TTL of cached values and of soft locks.
    pub fn timeout(&self) -> Duration {
        self.config.cache_ttl
    }

    /// Milliseconds since the Unix epoch, the clock of soft-lock timestamps.
    pub fn next_timestamp(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_millis() as u64)
    }

    /// Resolve the physical value and lock keys of `key` for the current generation.
    pub async fn resolve(&self, key: &str) -> Result<ResolvedKey, CacheError> {
        let generation = self.clear.current_generation().await?;
        let value = self.codec.to_physical_key(&self.config.name, generation, key)?;
        let locks = LockKeys {
            read: self.codec.to_physical_key(&self.read_lock_namespace, generation, &value)?,
            write: self.codec.to_physical_key(&self.write_lock_namespace, generation, &value)?,
        };
        Ok(ResolvedKey {
            generation,
            value,
            locks,
        })
    }

    pub async fn physical_key(&self, key: &str) -> Result<String, CacheError> {
        let generation = self.clear.current_generation().await?;
        self.codec.to_physical_key(&self.config.name, generation, key)
    }

    pub async fn get(&self, key: &str) -> Result<Option<KvValue>, CacheError> {
        let physical = self.physical_key(key).await?;
        self.get_physical(&physical).await
    }

    /// Fetch several logical keys; the result is keyed by logical key.
    pub async fn get_multi(&self, keys: &[&str]) -> Result<HashMap<String, KvValue>, CacheError> {
        let generation = self.clear.current_generation().await?;
        let mut logical_by_physical = HashMap::with_capacity(keys.len());
        for key in keys {
            let physical = self.codec.to_physical_key(&self.config.name, generation, key)?;
            logical_by_physical.insert(physical, (*key).to_owned());
        }
        let physical_keys: Vec<String> = logical_by_physical.keys().cloned().collect();
        debug!("Region {} get_multi({:?})", self.config.name, physical_keys);

        let found = self.client.get_multi(&physical_keys).await?;
        Ok(found
            .into_iter()
            .filter_map(|(physical, value)| {
                logical_by_physical
                    .remove(&physical)
                    .map(|logical| (logical, value))
            })
            .collect())
    }

    pub async fn set(&self, key: &str, ttl: Duration, value: KvValue) -> Result<bool, CacheError> {
        let physical = self.physical_key(key).await?;
        self.set_physical(&physical, ttl, value).await
    }

    /// `set` with the region TTL.
    pub async fn set_default(&self, key: &str, value: KvValue) -> Result<bool, CacheError> {
        self.set(key, self.config.cache_ttl, value).await
    }

    pub async fn add(&self, key: &str, ttl: Duration, value: KvValue) -> Result<bool, CacheError> {
        let physical = self.physical_key(key).await?;
        debug!("Region {} add({})", self.config.name, physical);
        let added = self.client.add(&physical, ttl, value).await;
        success_or_false("add", &physical, added)
    }

    /// `add` with the region TTL.
    pub async fn add_default(&self, key: &str, value: KvValue) -> Result<bool, CacheError> {
        self.add(key, self.config.cache_ttl, value).await
    }

    pub async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        let physical = self.physical_key(key).await?;
        Ok(self.delete_physical(&physical).await)
    }

    pub async fn incr(&self, key: &str, by: u64, initial: u64) -> Result<u64, CacheError> {
        let physical = self.physical_key(key).await?;
        self.client.incr(&physical, by, initial).await
    }

    pub async fn decr(&self, key: &str, by: u64, initial: u64) -> Result<u64, CacheError> {
        let physical = self.physical_key(key).await?;
        self.client.decr(&physical, by, initial).await
    }

    pub async fn contains(&self, key: &str) -> Result<bool, CacheError> {
        Ok(self.get(key).await?.is_some())
    }

    /// Invalidate every key of the region. `false` if clearing is disabled or failed.
    pub async fn clear(&self) -> bool {
        self.clear.clear().await
    }

    pub fn is_clear_supported(&self) -> bool {
        self.clear.is_enabled()
    }

    pub async fn acquire_read_lock(&self, key: &str) -> Result<bool, CacheError> {
        let resolved = self.resolve(key).await?;
        self.lock.acquire_read(&resolved.locks).await
    }

    pub async fn release_read_lock(&self, key: &str) -> Result<bool, CacheError> {
        let resolved = self.resolve(key).await?;
        self.lock.release_read(&resolved.locks).await
    }

    pub async fn acquire_write_lock(&self, key: &str) -> Result<bool, CacheError> {
        let resolved = self.resolve(key).await?;
        self.lock.acquire_write(&resolved.locks).await
    }

    pub async fn release_write_lock(&self, key: &str) -> Result<bool, CacheError> {
        let resolved = self.resolve(key).await?;
        self.lock.release_write(&resolved.locks).await
    }

    pub async fn shutdown(&self) -> Result<(), CacheError> {
        debug!("Shutting down region {}", self.config.name);
        self.client.shutdown().await
    }

    // Operations on already resolved keys, used by the access strategies so a
    // whole locked section works against one generation.

    pub(crate) fn key_lock(&self) -> &dyn ReadWriteKeyLock {
        self.lock.as_ref()
    }

    pub(crate) async fn get_physical(&self, physical: &str) -> Result<Option<KvValue>, CacheError> {
        debug!("Region {} get({})", self.config.name, physical);
        self.client.get(physical).await
    }

    pub(crate) async fn set_physical(
        &self,
        physical: &str,
        ttl: Duration,
        value: KvValue,
    ) -> Result<bool, CacheError> {
        debug!("Region {} set({})", self.config.name, physical);
        let stored = self.client.set(physical, ttl, value).await;
        success_or_false("set", physical, stored)
    }

    pub(crate) async fn delete_physical(&self, physical: &str) -> bool {
        match self.client.delete(physical).await {
            Ok(deleted) => deleted,
            Err(e) => {
                warn!("delete({}) failed: {}", physical, e);
                false
            }
        }
    }
}

/// Transport failures of boolean operations become `false`; invalid keys
/// still surface.
fn success_or_false(
    op: &str,
    physical: &str,
    result: Result<bool, CacheError>,
) -> Result<bool, CacheError> {
    match result {
        Ok(done) => Ok(done),
        Err(e @ CacheError::InvalidKey { .. }) => Err(e),
        Err(e) => {
            warn!("{}({}) failed: {}", op, physical, e);
            Ok(false)
        }
    }
}
