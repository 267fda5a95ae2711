//! regioncache - Region-scoped cache coordination over a key-value store
//!
//! A [`Region`] is a named, independently configured slice of a shared
//! store (Redis, or [`InMemoryKv`] for a single process). On top of plain
//! get/set/add/delete/incr/decr it provides:
//! - Generational clear: bumping a per-region counter orphans every key
//! - Dogpile prevention: one caller refreshes an expiring value while the rest keep reading it
//! - Distributed read/write locks per key, built from `add`, `incr`, `decr` and `delete`
//! - Versioned soft locks for read-write access strategies
//!
//! The store is the only shared state. Nothing is cached client-side.

pub mod access;
pub mod clear;
mod config;
pub mod dogpile;
mod error;
pub mod key_codec;
pub mod key_lock;
pub mod kv;
pub mod memory;
#[cfg(feature = "redis")]
pub mod redis_kv;
pub mod region;
pub mod soft_lock;

pub use access::{Cacheable, NonStrictReadWriteAccess, ReadOnlyAccess, ReadWriteAccess};
pub use clear::ClearStrategy;
pub use config::{LockRetry, LockVariant, RegionConfig, RegionProperties};
pub use dogpile::DogpileGuard;
pub use error::CacheError;
pub use key_codec::{EncodingChain, KeyCodec, KeyEncoder};
pub use key_lock::{
    ConcurrentReadBlockingWriteLock, LockKeys, ReadWriteKeyLock, UnblockedReadBlockingWriteLock,
    key_lock_for,
};
pub use kv::{KvClient, KvValue};
pub use memory::InMemoryKv;
#[cfg(feature = "redis")]
pub use redis_kv::RedisKv;
pub use region::{Region, ResolvedKey};
pub use soft_lock::{
    Item, Lock, Lockable, NaturalVersionOrder, SoftLockHandle, Version, VersionComparator,
};

// Re-export async_trait for convenience
pub use async_trait::async_trait;
