//! Process-local KV store
//!
//! Entries expire on the tokio clock, so tests running with paused time can
//! step through TTLs with `tokio::time::advance`. Expired entries are dropped
//! when their key is touched, and writes sweep the whole table at most once
//! per [`SWEEP_INTERVAL`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::CacheError;
use crate::kv::{KvClient, KvValue};

/// Minimum time between two sweeps of expired entries.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug)]
struct Entry {
    value: KvValue,
    expires_at: Option<Instant>,
}

impl Entry {
    fn new(value: KvValue, ttl: Duration) -> Self {
        Self {
            value,
            expires_at: (!ttl.is_zero()).then(|| Instant::now() + ttl),
        }
    }

    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| now < at)
    }
}

#[derive(Debug, Default)]
struct Table {
    entries: HashMap<String, Entry>,
    last_sweep: Option<Instant>,
}

impl Table {
    fn live(&mut self, key: &str) -> Option<&mut Entry> {
        let now = Instant::now();
        if self.entries.get(key).is_some_and(|e| !e.is_live(now)) {
            self.entries.remove(key);
        }
        self.entries.get_mut(key)
    }

    /// Drop every expired entry, unless a sweep ran within [`SWEEP_INTERVAL`].
    fn sweep(&mut self) {
        let now = Instant::now();
        if self
            .last_sweep
            .is_some_and(|at| now.duration_since(at) < SWEEP_INTERVAL)
        {
            return;
        }
        self.last_sweep = Some(now);
        let before = self.entries.len();
        self.entries.retain(|_, e| e.is_live(now));
        let swept = before - self.entries.len();
        if swept > 0 {
            debug!("InMemoryKv swept {} expired entries", swept);
        }
    }

    fn insert(&mut self, key: &str, entry: Entry) {
        self.sweep();
        self.entries.insert(key.to_owned(), entry);
    }
}

/// In-memory [`KvClient`] shared by clones.
#[derive(Debug, Clone, Default)]
pub struct InMemoryKv {
    table: Arc<Mutex<Table>>,
}

impl InMemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live entries.
    pub async fn len(&self) -> usize {
        let now = Instant::now();
        self.table
            .lock()
            .await
            .entries
            .values()
            .filter(|e| e.is_live(now))
            .count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    fn counter(key: &str, entry: &Entry) -> Result<u64, CacheError> {
        entry.value.as_counter().ok_or_else(|| {
            CacheError::backend(format!(
                "cannot increment or decrement non-numeric value at {key}"
            ))
        })
    }
}

#[async_trait]
impl KvClient for InMemoryKv {
    async fn get(&self, key: &str) -> Result<Option<KvValue>, CacheError> {
        let mut table = self.table.lock().await;
        Ok(table.live(key).map(|e| e.value.clone()))
    }

    async fn get_multi(&self, keys: &[String]) -> Result<HashMap<String, KvValue>, CacheError> {
        let mut table = self.table.lock().await;
        let mut found = HashMap::with_capacity(keys.len());
        for key in keys {
            if let Some(entry) = table.live(key) {
                found.insert(key.clone(), entry.value.clone());
            }
        }
        Ok(found)
    }

    async fn set(&self, key: &str, ttl: Duration, value: KvValue) -> Result<bool, CacheError> {
        debug!("InMemoryKv.set({}, {:?})", key, ttl);
        self.table.lock().await.insert(key, Entry::new(value, ttl));
        Ok(true)
    }

    async fn add(&self, key: &str, ttl: Duration, value: KvValue) -> Result<bool, CacheError> {
        let mut table = self.table.lock().await;
        if table.live(key).is_some() {
            return Ok(false);
        }
        table.insert(key, Entry::new(value, ttl));
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        let mut table = self.table.lock().await;
        let existed = table.live(key).is_some();
        table.entries.remove(key);
        Ok(existed)
    }

    async fn incr(&self, key: &str, by: u64, initial: u64) -> Result<u64, CacheError> {
        let mut table = self.table.lock().await;
        match table.live(key) {
            Some(entry) => {
                let next = Self::counter(key, entry)?.wrapping_add(by);
                entry.value = KvValue::Counter(next);
                Ok(next)
            }
            None => {
                table.insert(key, Entry::new(KvValue::Counter(initial), Duration::ZERO));
                Ok(initial)
            }
        }
    }

    async fn decr(&self, key: &str, by: u64, initial: u64) -> Result<u64, CacheError> {
        let mut table = self.table.lock().await;
        match table.live(key) {
            Some(entry) => {
                let next = Self::counter(key, entry)?.saturating_sub(by);
                entry.value = KvValue::Counter(next);
                Ok(next)
            }
            None => {
                table.insert(key, Entry::new(KvValue::Counter(initial), Duration::ZERO));
                Ok(initial)
            }
        }
    }

    async fn shutdown(&self) -> Result<(), CacheError> {
        self.table.lock().await.entries.clear();
        Ok(())
    }
}
