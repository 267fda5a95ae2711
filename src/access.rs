//! Access strategies over a region
//!
//! [`ReadWriteAccess`] keeps reads consistent with in-flight writes by
//! storing versioned soft locks and serialising every step on the key's
//! distributed lock. [`NonStrictReadWriteAccess`] and [`ReadOnlyAccess`]
//! store plain values and never lock.
//!
//! Values are stored as JSON text.

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use serde::{Serialize, de::DeserializeOwned};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::CacheError;
use crate::kv::{KvClient, KvValue};
use crate::region::{Region, ResolvedKey};
use crate::soft_lock::{
    Item, Lock, Lockable, NaturalVersionOrder, SoftLockHandle, Version, VersionComparator,
    next_lock_id, process_owner_id,
};

/// Trait for types that can be cached
pub trait Cacheable: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}
impl<T> Cacheable for T where T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

fn encode_value<V: Serialize>(value: &V) -> Result<KvValue, CacheError> {
    Ok(KvValue::Text(serde_json::to_string(value)?))
}

fn decode_value<V: DeserializeOwned>(key: &str, raw: KvValue) -> Option<V> {
    let decoded: Result<V, String> = match raw.as_bytes() {
        Some(bytes) => serde_json::from_slice(bytes).map_err(|e| e.to_string()),
        None => Err("counter value".to_owned()),
    };
    match decoded {
        Ok(value) => Some(value),
        Err(e) => {
            warn!("Failed to deserialize cached value for key {}: {}. Treating as a miss.", key, e);
            None
        }
    }
}

/// Soft-locking read/write access.
pub struct ReadWriteAccess<C: KvClient, V: Cacheable> {
    region: Region<C>,
    comparator: Arc<dyn VersionComparator>,
    owner: Uuid,
    _value: PhantomData<fn() -> V>,
}

impl<C: KvClient, V: Cacheable> Clone for ReadWriteAccess<C, V> {
    fn clone(&self) -> Self {
        Self {
            region: self.region.clone(),
            comparator: Arc::clone(&self.comparator),
            owner: self.owner,
            _value: PhantomData,
        }
    }
}

impl<C: KvClient, V: Cacheable> ReadWriteAccess<C, V> {
    /// Access with [`NaturalVersionOrder`] as the version comparator.
    pub fn new(region: Region<C>) -> Self {
        Self::with_comparator(region, Arc::new(NaturalVersionOrder))
    }

    pub fn with_comparator(region: Region<C>, comparator: Arc<dyn VersionComparator>) -> Self {
        Self {
            region,
            comparator,
            owner: process_owner_id(),
            _value: PhantomData,
        }
    }

    pub fn region(&self) -> &Region<C> {
        &self.region
    }

    fn ttl(&self) -> Duration {
        self.region.timeout()
    }

    async fn load(&self, physical: &str) -> Result<Option<Lockable<V>>, CacheError> {
        let Some(raw) = self.region.get_physical(physical).await? else {
            return Ok(None);
        };
        match Lockable::decode(&raw) {
            Ok(entry) => Ok(Some(entry)),
            Err(e) => {
                warn!("Unreadable soft-lock entry at {}: {}. Treating as absent.", physical, e);
                Ok(None)
            }
        }
    }

    async fn store(&self, physical: &str, entry: &Lockable<V>) -> Result<bool, CacheError> {
        self.region
            .set_physical(physical, self.ttl(), entry.encode()?)
            .await
    }

    /// The soft lock this caller held is gone. Leave a lock that has already
    /// timed out so readers miss until the next load.
    async fn handle_lock_expiry(
        &self,
        physical: &str,
        found: Option<&Lockable<V>>,
        now: u64,
    ) -> Result<bool, CacheError> {
        warn!(
            "Region {} key {} entry {:?}: a soft-locked cache entry was expired by the store. \
             If this happens regularly, consider raising the cache timeout or the store capacity.",
            self.region.name(),
            physical,
            found.map(|e| match e {
                Lockable::Item(_) => "item",
                Lockable::Lock(_) => "foreign lock",
            })
        );
        let expired = Lock::expired(now, self.owner, next_lock_id());
        self.store(physical, &Lockable::Lock(expired)).await
    }

    async fn write_locked(&self, resolved: &ResolvedKey) -> Result<bool, CacheError> {
        let acquired = self.region.key_lock().acquire_write(&resolved.locks).await?;
        if !acquired {
            info!("Fail to acquire write lock for {}", resolved.value);
        }
        Ok(acquired)
    }

    async fn release_write(&self, resolved: &ResolvedKey) -> Result<(), CacheError> {
        self.region.key_lock().release_write(&resolved.locks).await?;
        Ok(())
    }

    /// Read `key` for a transaction started at `tx_timestamp`.
    ///
    /// Locked entries, and items created at or after the transaction start,
    /// are misses.
    pub async fn get(&self, key: &str, tx_timestamp: u64) -> Result<Option<V>, CacheError> {
        let resolved = self.region.resolve(key).await?;
        let lock = self.region.key_lock();
        if !lock.acquire_read(&resolved.locks).await? {
            info!("Fail to acquire read lock for {}", resolved.value);
            return Ok(None);
        }

        let result = self.load(&resolved.value).await.map(|entry| {
            entry
                .filter(|e| e.is_readable(tx_timestamp))
                .and_then(Lockable::into_value)
        });
        lock.release_read(&resolved.locks).await?;

        if matches!(result, Ok(None)) {
            debug!("Could not get item for key {}", resolved.value);
        }
        result
    }

    /// Soft-lock `key` ahead of a write. The handle is needed to unlock.
    pub async fn lock_item(
        &self,
        key: &str,
        version: Option<Version>,
    ) -> Result<Option<SoftLockHandle>, CacheError> {
        let resolved = self.region.resolve(key).await?;
        if !self.write_locked(&resolved).await? {
            return Ok(None);
        }

        let result = async {
            let timeout_at = self.region.next_timestamp() + self.ttl().as_millis() as u64;
            let lock = match self.load(&resolved.value).await? {
                None => Lock::new(timeout_at, self.owner, next_lock_id(), version),
                Some(entry) => entry.lock(timeout_at, self.owner, next_lock_id()),
            };
            let handle = lock.handle();
            let stored = self.store(&resolved.value, &Lockable::Lock(lock)).await?;
            Ok::<_, CacheError>(stored.then_some(handle))
        }
        .await;
        self.release_write(&resolved).await?;

        if matches!(result, Ok(None)) {
            info!("Could not lockItem for key {}", resolved.value);
        }
        result
    }

    /// Cache a value loaded from the source of truth.
    ///
    /// Returns `false` without writing when the stored entry is not writeable
    /// for this timestamp and version, or when `minimal_put_override` is set
    /// and an item is already cached.
    pub async fn put_from_load(
        &self,
        key: &str,
        value: V,
        tx_timestamp: u64,
        version: Option<Version>,
        minimal_put_override: bool,
    ) -> Result<bool, CacheError> {
        let resolved = self.region.resolve(key).await?;
        if minimal_put_override
            && let Some(Lockable::Item(_)) = self.load(&resolved.value).await?
        {
            debug!("Item already cached for key {}, skipping put", resolved.value);
            return Ok(false);
        }
        if !self.write_locked(&resolved).await? {
            return Ok(false);
        }

        let result = async {
            let writeable = match self.load(&resolved.value).await? {
                None => true,
                Some(entry) => {
                    entry.is_writeable(tx_timestamp, version.as_ref(), self.comparator.as_ref())
                }
            };
            if !writeable {
                return Ok(false);
            }
            let item = Item::new(value, version, self.region.next_timestamp());
            self.store(&resolved.value, &Lockable::Item(item)).await
        }
        .await;
        self.release_write(&resolved).await?;

        if matches!(result, Ok(false)) {
            warn!("Could not putFromLoad item for key {}", resolved.value);
        }
        result
    }

    /// [`put_from_load`](Self::put_from_load) with the region's minimal-puts setting.
    pub async fn put_from_load_default(
        &self,
        key: &str,
        value: V,
        tx_timestamp: u64,
        version: Option<Version>,
    ) -> Result<bool, CacheError> {
        let minimal = self.region.config().minimal_puts;
        self.put_from_load(key, value, tx_timestamp, version, minimal)
            .await
    }

    /// Release a soft lock taken by [`lock_item`](Self::lock_item).
    ///
    /// If the lock is no longer in the store, a lock that has already timed
    /// out is written in its place so concurrent readers miss instead of
    /// seeing stale data. Returns whether the store was updated.
    pub async fn unlock_item(
        &self,
        key: &str,
        handle: &SoftLockHandle,
    ) -> Result<bool, CacheError> {
        let resolved = self.region.resolve(key).await?;
        if !self.write_locked(&resolved).await? {
            return Ok(false);
        }

        let result = async {
            let now = self.region.next_timestamp();
            match self.load(&resolved.value).await? {
                Some(Lockable::Lock(mut lock)) if lock.is_unlockable(handle) => {
                    if !lock.unlock(now) {
                        debug!("Soft lock at {} has no holders left", resolved.value);
                        return Ok(false);
                    }
                    self.store(&resolved.value, &Lockable::Lock(lock)).await
                }
                other => self.handle_lock_expiry(&resolved.value, other.as_ref(), now).await,
            }
        }
        .await;
        self.release_write(&resolved).await?;

        if matches!(result, Ok(false)) {
            debug!("Could not unlockItem for key {}", resolved.value);
        }
        result
    }

    /// Writes go to the cache only once the transaction completes.
    pub async fn insert(
        &self,
        _key: &str,
        _value: &V,
        _version: Option<Version>,
    ) -> Result<bool, CacheError> {
        Ok(false)
    }

    /// Cache a newly inserted value, unless the key already has an entry.
    pub async fn after_insert(
        &self,
        key: &str,
        value: &V,
        version: Option<Version>,
    ) -> Result<bool, CacheError> {
        let resolved = self.region.resolve(key).await?;
        if !self.write_locked(&resolved).await? {
            return Ok(false);
        }

        let result = async {
            if self.load(&resolved.value).await?.is_some() {
                return Ok(false);
            }
            let item = Item::new(value.clone(), version, self.region.next_timestamp());
            self.store(&resolved.value, &Lockable::Item(item)).await
        }
        .await;
        self.release_write(&resolved).await?;

        if matches!(result, Ok(false)) {
            warn!("Could not afterInsert item for key {}", resolved.value);
        }
        result
    }

    /// See [`insert`](Self::insert).
    pub async fn update(
        &self,
        _key: &str,
        _value: &V,
        _current_version: Option<Version>,
        _previous_version: Option<Version>,
    ) -> Result<bool, CacheError> {
        Ok(false)
    }

    /// Publish an updated value and release the soft lock taken for it.
    ///
    /// If other writers joined the lock, this writer only drops its hold and
    /// the value is not cached; the entry stays locked until they finish and
    /// the next load repopulates it.
    pub async fn after_update(
        &self,
        key: &str,
        value: &V,
        current_version: Option<Version>,
        _previous_version: Option<Version>,
        handle: &SoftLockHandle,
    ) -> Result<bool, CacheError> {
        let resolved = self.region.resolve(key).await?;
        if !self.write_locked(&resolved).await? {
            return Ok(false);
        }

        let result = async {
            let now = self.region.next_timestamp();
            match self.load(&resolved.value).await? {
                Some(Lockable::Lock(mut lock)) if lock.is_unlockable(handle) => {
                    if lock.was_concurrent {
                        if !lock.unlock(now) {
                            return Ok(false);
                        }
                        self.store(&resolved.value, &Lockable::Lock(lock)).await
                    } else {
                        let item = Item::new(value.clone(), current_version, now);
                        self.store(&resolved.value, &Lockable::Item(item)).await
                    }
                }
                other => self.handle_lock_expiry(&resolved.value, other.as_ref(), now).await,
            }
        }
        .await;
        self.release_write(&resolved).await?;

        if matches!(result, Ok(false)) {
            warn!("Could not afterUpdate item for key {}", resolved.value);
        }
        result
    }

    /// Delete the entry under the key's write lock.
    pub async fn remove(&self, key: &str) -> Result<bool, CacheError> {
        let resolved = self.region.resolve(key).await?;
        if !self.write_locked(&resolved).await? {
            return Ok(false);
        }
        let removed = self.region.delete_physical(&resolved.value).await;
        self.release_write(&resolved).await?;

        if !removed {
            warn!("Could not remove item for key {}", resolved.value);
        }
        Ok(removed)
    }

    /// Delete the entry without locking.
    pub async fn evict(&self, key: &str) -> Result<bool, CacheError> {
        self.region.delete(key).await
    }

    /// Invalidate the whole region.
    pub async fn remove_all(&self) -> Result<(), CacheError> {
        remove_all(&self.region).await
    }
}

async fn remove_all<C: KvClient>(region: &Region<C>) -> Result<(), CacheError> {
    if region.clear().await {
        Ok(())
    } else {
        Err(CacheError::ClearUnsupported(region.name().to_owned()))
    }
}

/// Plain-value access without soft locks. Concurrent writers may leave a
/// stale value cached until it expires.
pub struct NonStrictReadWriteAccess<C: KvClient, V: Cacheable> {
    region: Region<C>,
    _value: PhantomData<fn() -> V>,
}

impl<C: KvClient, V: Cacheable> Clone for NonStrictReadWriteAccess<C, V> {
    fn clone(&self) -> Self {
        Self {
            region: self.region.clone(),
            _value: PhantomData,
        }
    }
}

impl<C: KvClient, V: Cacheable> NonStrictReadWriteAccess<C, V> {
    pub fn new(region: Region<C>) -> Self {
        Self {
            region,
            _value: PhantomData,
        }
    }

    pub fn region(&self) -> &Region<C> {
        &self.region
    }

    pub async fn get(&self, key: &str, _tx_timestamp: u64) -> Result<Option<V>, CacheError> {
        Ok(self
            .region
            .get(key)
            .await?
            .and_then(|raw| decode_value(key, raw)))
    }

    pub async fn put_from_load(
        &self,
        key: &str,
        value: V,
        _tx_timestamp: u64,
        _version: Option<Version>,
        minimal_put_override: bool,
    ) -> Result<bool, CacheError> {
        if minimal_put_override && self.region.contains(key).await? {
            debug!("Value already cached for key {}, skipping put", key);
            return Ok(false);
        }
        self.region.set_default(key, encode_value(&value)?).await
    }

    pub async fn put_from_load_default(
        &self,
        key: &str,
        value: V,
        tx_timestamp: u64,
        version: Option<Version>,
    ) -> Result<bool, CacheError> {
        let minimal = self.region.config().minimal_puts;
        self.put_from_load(key, value, tx_timestamp, version, minimal)
            .await
    }

    /// No soft locks are taken.
    pub async fn lock_item(
        &self,
        _key: &str,
        _version: Option<Version>,
    ) -> Result<Option<SoftLockHandle>, CacheError> {
        Ok(None)
    }

    pub async fn unlock_item(
        &self,
        _key: &str,
        _handle: Option<&SoftLockHandle>,
    ) -> Result<bool, CacheError> {
        Ok(true)
    }

    pub async fn insert(
        &self,
        _key: &str,
        _value: &V,
        _version: Option<Version>,
    ) -> Result<bool, CacheError> {
        Ok(false)
    }

    pub async fn after_insert(
        &self,
        key: &str,
        value: &V,
        _version: Option<Version>,
    ) -> Result<bool, CacheError> {
        self.region.set_default(key, encode_value(value)?).await
    }

    pub async fn update(&self, _key: &str, _value: &V) -> Result<bool, CacheError> {
        Ok(false)
    }

    pub async fn after_update(&self, key: &str, value: &V) -> Result<bool, CacheError> {
        self.region.set_default(key, encode_value(value)?).await
    }

    pub async fn remove(&self, key: &str) -> Result<bool, CacheError> {
        self.evict(key).await
    }

    pub async fn evict(&self, key: &str) -> Result<bool, CacheError> {
        self.region.delete(key).await
    }

    pub async fn remove_all(&self) -> Result<(), CacheError> {
        remove_all(&self.region).await
    }
}

/// Access for immutable data: loads are cached, writes are refused.
pub struct ReadOnlyAccess<C: KvClient, V: Cacheable> {
    inner: NonStrictReadWriteAccess<C, V>,
}

impl<C: KvClient, V: Cacheable> Clone for ReadOnlyAccess<C, V> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<C: KvClient, V: Cacheable> ReadOnlyAccess<C, V> {
    pub fn new(region: Region<C>) -> Self {
        Self {
            inner: NonStrictReadWriteAccess::new(region),
        }
    }

    pub fn region(&self) -> &Region<C> {
        self.inner.region()
    }

    pub async fn get(&self, key: &str, tx_timestamp: u64) -> Result<Option<V>, CacheError> {
        self.inner.get(key, tx_timestamp).await
    }

    pub async fn put_from_load(
        &self,
        key: &str,
        value: V,
        tx_timestamp: u64,
        version: Option<Version>,
        minimal_put_override: bool,
    ) -> Result<bool, CacheError> {
        self.inner
            .put_from_load(key, value, tx_timestamp, version, minimal_put_override)
            .await
    }

    pub async fn put_from_load_default(
        &self,
        key: &str,
        value: V,
        tx_timestamp: u64,
        version: Option<Version>,
    ) -> Result<bool, CacheError> {
        self.inner
            .put_from_load_default(key, value, tx_timestamp, version)
            .await
    }

    pub async fn insert(
        &self,
        _key: &str,
        _value: &V,
        _version: Option<Version>,
    ) -> Result<bool, CacheError> {
        Ok(false)
    }

    pub async fn after_insert(
        &self,
        _key: &str,
        _value: &V,
        _version: Option<Version>,
    ) -> Result<bool, CacheError> {
        Ok(false)
    }

    pub async fn update(&self, _key: &str, _value: &V) -> Result<bool, CacheError> {
        Ok(false)
    }

    pub async fn after_update(&self, _key: &str, _value: &V) -> Result<bool, CacheError> {
        Ok(false)
    }

    pub async fn remove(&self, key: &str) -> Result<bool, CacheError> {
        self.inner.remove(key).await
    }

    pub async fn evict(&self, key: &str) -> Result<bool, CacheError> {
        self.inner.evict(key).await
    }

    pub async fn remove_all(&self) -> Result<(), CacheError> {
        self.inner.remove_all().await
    }
}
