//! Key-value client capability
//!
//! The coordination layer only needs the primitives every memcached-style
//! store offers. Everything else (generations, dogpile tokens, locks, soft
//! locks) is built on top of this trait.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

use crate::CacheError;

/// A value as stored in the KV store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KvValue {
    Bytes(Vec<u8>),
    Text(String),
    /// Numeric counter maintained by `incr`/`decr`
    Counter(u64),
}

impl KvValue {
    /// Decode a raw payload read from a byte-oriented store.
    pub fn from_wire(bytes: Vec<u8>) -> Self {
        match String::from_utf8(bytes) {
            Ok(text) => KvValue::Text(text),
            Err(e) => KvValue::Bytes(e.into_bytes()),
        }
    }

    /// Encode for a byte-oriented store. Counters become decimal text.
    pub fn to_wire(&self) -> Vec<u8> {
        match self {
            KvValue::Bytes(b) => b.clone(),
            KvValue::Text(s) => s.as_bytes().to_vec(),
            KvValue::Counter(n) => n.to_string().into_bytes(),
        }
    }

    /// The payload as bytes, for values written as `Bytes` or `Text`.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            KvValue::Bytes(b) => Some(b),
            KvValue::Text(s) => Some(s.as_bytes()),
            KvValue::Counter(_) => None,
        }
    }

    /// Numeric view used for counters; decimal text is accepted.
    pub fn as_counter(&self) -> Option<u64> {
        match self {
            KvValue::Counter(n) => Some(*n),
            KvValue::Text(s) => s.trim().parse().ok(),
            KvValue::Bytes(_) => None,
        }
    }
}

impl From<String> for KvValue {
    fn from(s: String) -> Self {
        KvValue::Text(s)
    }
}

impl From<&str> for KvValue {
    fn from(s: &str) -> Self {
        KvValue::Text(s.to_owned())
    }
}

impl From<Vec<u8>> for KvValue {
    fn from(b: Vec<u8>) -> Self {
        KvValue::Bytes(b)
    }
}

impl From<u64> for KvValue {
    fn from(n: u64) -> Self {
        KvValue::Counter(n)
    }
}

/// Primitive operations of the shared store.
///
/// Each call is assumed atomic at the store; nothing here is atomic across
/// calls. A zero TTL means the entry never expires.
#[async_trait]
pub trait KvClient: Send + Sync + 'static {
    async fn get(&self, key: &str) -> Result<Option<KvValue>, CacheError>;

    /// Fetch several keys in one round trip. Missing keys are absent from the map.
    async fn get_multi(&self, keys: &[String]) -> Result<HashMap<String, KvValue>, CacheError>;

    async fn set(&self, key: &str, ttl: Duration, value: KvValue) -> Result<bool, CacheError>;

    /// Store only if the key is absent. Returns whether the value was stored.
    async fn add(&self, key: &str, ttl: Duration, value: KvValue) -> Result<bool, CacheError>;

    async fn delete(&self, key: &str) -> Result<bool, CacheError>;

    /// Add `by` to a counter, or store `initial` if the key is absent.
    async fn incr(&self, key: &str, by: u64, initial: u64) -> Result<u64, CacheError>;

    /// Subtract `by` from a counter without going below zero, or store
    /// `initial` if the key is absent.
    async fn decr(&self, key: &str, by: u64, initial: u64) -> Result<u64, CacheError>;

    async fn shutdown(&self) -> Result<(), CacheError>;
}
