//! Versioned soft locks
//!
//! A read-write region does not store bare values. It stores a [`Lockable`]:
//! either an [`Item`] (a value with its version and creation timestamp) or a
//! [`Lock`] recording that a writer is in flight. Readers and loaders consult
//! the stored state to decide whether a value may be served or replaced.
//!
//! Timestamps are milliseconds since the Unix epoch.

use std::cmp::Ordering;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use uuid::Uuid;

use crate::CacheError;
use crate::kv::KvValue;

/// Entity version as supplied by the caller.
pub type Version = serde_json::Value;

static OWNER_ID: OnceLock<Uuid> = OnceLock::new();
static NEXT_LOCK_ID: AtomicU64 = AtomicU64::new(0);

/// Random identifier of this process, fixed for its lifetime.
pub fn process_owner_id() -> Uuid {
    *OWNER_ID.get_or_init(Uuid::new_v4)
}

/// Next lock id of this process; never repeats within the process.
pub fn next_lock_id() -> u64 {
    NEXT_LOCK_ID.fetch_add(1, AtomicOrdering::Relaxed)
}

/// Orders entity versions. `None` means the two cannot be compared.
pub trait VersionComparator: Send + Sync {
    fn compare(&self, current: &Version, candidate: &Version) -> Option<Ordering>;
}

/// Numbers compare numerically and strings lexicographically; anything else
/// is incomparable.
#[derive(Debug, Clone, Copy, Default)]
pub struct NaturalVersionOrder;

impl VersionComparator for NaturalVersionOrder {
    fn compare(&self, current: &Version, candidate: &Version) -> Option<Ordering> {
        match (current, candidate) {
            (Version::Number(a), Version::Number(b)) => {
                if let (Some(a), Some(b)) = (a.as_i64(), b.as_i64()) {
                    Some(a.cmp(&b))
                } else if let (Some(a), Some(b)) = (a.as_u64(), b.as_u64()) {
                    Some(a.cmp(&b))
                } else {
                    a.as_f64()?.partial_cmp(&b.as_f64()?)
                }
            }
            (Version::String(a), Version::String(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }
}

fn is_newer(current: &Version, candidate: Option<&Version>, cmp: &dyn VersionComparator) -> bool {
    candidate.is_some_and(|candidate| cmp.compare(current, candidate) == Some(Ordering::Less))
}

/// Identity of one soft-lock acquisition, needed to unlock it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SoftLockHandle {
    pub owner: Uuid,
    pub lock_id: u64,
}

/// An unlocked, versioned value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item<V> {
    pub value: V,
    pub version: Option<Version>,
    pub created_at: u64,
}

impl<V> Item<V> {
    pub fn new(value: V, version: Option<Version>, created_at: u64) -> Self {
        Self {
            value,
            version,
            created_at,
        }
    }

    /// Visible to transactions that started after the item was created.
    pub fn is_readable(&self, tx_timestamp: u64) -> bool {
        tx_timestamp > self.created_at
    }

    /// Replaceable by an unversioned item, or by a strictly newer version.
    pub fn is_writeable(
        &self,
        new_version: Option<&Version>,
        cmp: &dyn VersionComparator,
    ) -> bool {
        match &self.version {
            None => true,
            Some(current) => is_newer(current, new_version, cmp),
        }
    }

    /// Lock this item, carrying its version into the lock.
    pub fn lock(&self, timeout_at: u64, owner: Uuid, lock_id: u64) -> Lock {
        Lock::new(timeout_at, owner, lock_id, self.version.clone())
    }
}

/// A soft lock held by one or more writers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lock {
    pub owner: Uuid,
    pub lock_id: u64,
    pub multiplicity: u32,
    pub timeout_at: u64,
    pub unlocked_at: u64,
    pub version: Option<Version>,
    pub was_concurrent: bool,
}

impl Lock {
    pub fn new(timeout_at: u64, owner: Uuid, lock_id: u64, version: Option<Version>) -> Self {
        Self {
            owner,
            lock_id,
            multiplicity: 1,
            timeout_at,
            unlocked_at: 0,
            version,
            was_concurrent: false,
        }
    }

    /// A lock with no holders that has already timed out at `now`.
    pub fn expired(now: u64, owner: Uuid, lock_id: u64) -> Self {
        Self {
            multiplicity: 0,
            unlocked_at: now,
            ..Self::new(now, owner, lock_id, None)
        }
    }

    pub fn handle(&self) -> SoftLockHandle {
        SoftLockHandle {
            owner: self.owner,
            lock_id: self.lock_id,
        }
    }

    pub fn is_unlockable(&self, handle: &SoftLockHandle) -> bool {
        self.owner == handle.owner && self.lock_id == handle.lock_id
    }

    pub fn is_writeable(
        &self,
        tx_timestamp: u64,
        new_version: Option<&Version>,
        cmp: &dyn VersionComparator,
    ) -> bool {
        if tx_timestamp > self.timeout_at {
            // abandoned lock
            return true;
        }
        if self.multiplicity > 0 {
            return false;
        }
        match &self.version {
            None => tx_timestamp > self.unlocked_at,
            Some(current) => is_newer(current, new_version, cmp),
        }
    }

    /// Another writer joins this lock.
    pub fn relock(&mut self, timeout_at: u64) {
        self.was_concurrent = true;
        self.multiplicity += 1;
        self.timeout_at = timeout_at;
    }

    /// Release one holder. Returns `false` if no holder was left to release.
    pub fn unlock(&mut self, timestamp: u64) -> bool {
        if self.multiplicity == 0 {
            return false;
        }
        self.multiplicity -= 1;
        if self.multiplicity == 0 {
            self.unlocked_at = timestamp;
        }
        true
    }
}

/// Stored state of a soft-locked entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum Lockable<V> {
    Item(Item<V>),
    Lock(Lock),
}

impl<V> Lockable<V> {
    pub fn is_readable(&self, tx_timestamp: u64) -> bool {
        match self {
            Lockable::Item(item) => item.is_readable(tx_timestamp),
            Lockable::Lock(_) => false,
        }
    }

    pub fn is_writeable(
        &self,
        tx_timestamp: u64,
        new_version: Option<&Version>,
        cmp: &dyn VersionComparator,
    ) -> bool {
        match self {
            Lockable::Item(item) => item.is_writeable(new_version, cmp),
            Lockable::Lock(lock) => lock.is_writeable(tx_timestamp, new_version, cmp),
        }
    }

    pub fn is_unlockable(&self, handle: &SoftLockHandle) -> bool {
        match self {
            Lockable::Item(_) => false,
            Lockable::Lock(lock) => lock.is_unlockable(handle),
        }
    }

    /// Lock the entry: items become a fresh lock, locks gain a holder.
    pub fn lock(self, timeout_at: u64, owner: Uuid, lock_id: u64) -> Lock {
        match self {
            Lockable::Item(item) => item.lock(timeout_at, owner, lock_id),
            Lockable::Lock(mut lock) => {
                lock.relock(timeout_at);
                lock
            }
        }
    }

    pub fn into_value(self) -> Option<V> {
        match self {
            Lockable::Item(item) => Some(item.value),
            Lockable::Lock(_) => None,
        }
    }
}

impl<V: Serialize> Lockable<V> {
    pub fn encode(&self) -> Result<KvValue, CacheError> {
        Ok(KvValue::Text(serde_json::to_string(self)?))
    }
}

impl<V: DeserializeOwned> Lockable<V> {
    pub fn decode(value: &KvValue) -> Result<Self, CacheError> {
        let bytes = value.as_bytes().ok_or_else(|| {
            CacheError::Serialization(serde::de::Error::custom(
                "counter value where a soft-lock entry was expected",
            ))
        })?;
        Ok(serde_json::from_slice(bytes)?)
    }
}
