//! Distributed read/write key locks
//!
//! Locks are emulated with `add` (test-and-set), `incr`/`decr` and `delete`
//! against the shared store. Every lock key carries a TTL so a holder that
//! dies mid-section releases the lock through expiry; a holder that stalls
//! past the TTL and then resumes is no longer exclusive.
//!
//! The concurrent-read variant uses the write key as a short gate while a
//! reader registers itself. A steady stream of readers can therefore keep a
//! writer from ever winning the gate; there is no fairness policy.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::CacheError;
use crate::config::{LockRetry, LockVariant, RegionConfig};
use crate::kv::{KvClient, KvValue};
use crate::soft_lock::process_owner_id;

/// Store keys guarding one cache key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockKeys {
    /// Counter of registered readers
    pub read: String,
    /// Present while a writer (or a registering reader) holds the gate
    pub write: String,
}

/// Per-key read/write lock shared across processes through the store.
///
/// Acquisition resolves once the lock is held, retrying with capped
/// exponential backoff. It fails only with [`CacheError::AcquireTimeout`]
/// when the region sets an acquire timeout.
#[async_trait]
pub trait ReadWriteKeyLock: Send + Sync {
    async fn acquire_read(&self, keys: &LockKeys) -> Result<bool, CacheError>;

    async fn release_read(&self, keys: &LockKeys) -> Result<bool, CacheError>;

    async fn acquire_write(&self, keys: &LockKeys) -> Result<bool, CacheError>;

    async fn release_write(&self, keys: &LockKeys) -> Result<bool, CacheError>;
}

/// Build the lock protocol selected by the region configuration.
pub fn key_lock_for<C: KvClient>(
    client: Arc<C>,
    config: &RegionConfig,
) -> Box<dyn ReadWriteKeyLock> {
    let gate = LockGate::new(client, config);
    match config.lock_variant {
        LockVariant::ConcurrentReadBlockingWrite => {
            Box::new(ConcurrentReadBlockingWriteLock { gate })
        }
        LockVariant::UnblockedReadBlockingWrite => {
            Box::new(UnblockedReadBlockingWriteLock { gate })
        }
    }
}

/// The `add`-based mutex on a write key, shared by both protocols.
struct LockGate<C: KvClient> {
    client: Arc<C>,
    ttl: Duration,
    retry: LockRetry,
    acquire_timeout: Option<Duration>,
}

impl<C: KvClient> LockGate<C> {
    fn new(client: Arc<C>, config: &RegionConfig) -> Self {
        Self {
            client,
            ttl: config.lock_ttl,
            retry: config.lock_retry,
            acquire_timeout: config.acquire_timeout,
        }
    }

    fn deadline(&self) -> Option<Instant> {
        self.acquire_timeout.map(|t| Instant::now() + t)
    }

    fn pause(&self, attempt: u32) -> Duration {
        let jitter_ms = self.retry.jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=jitter_ms)
        };
        self.retry.backoff(attempt) + Duration::from_millis(jitter)
    }

    async fn within<F: Future>(
        &self,
        deadline: Option<Instant>,
        key: &str,
        kind: &'static str,
        fut: F,
    ) -> Result<F::Output, CacheError> {
        let Some(deadline) = deadline else {
            return Ok(fut.await);
        };
        tokio::time::timeout_at(deadline, fut)
            .await
            .map_err(|_| CacheError::AcquireTimeout {
                key: key.to_owned(),
                kind,
                waited: self.acquire_timeout.unwrap_or_default(),
            })
    }

    fn sentinel() -> KvValue {
        KvValue::Text(process_owner_id().to_string())
    }

    /// Loop on `add(write_key)` until it succeeds.
    async fn take(&self, write_key: &str, kind: &'static str) {
        let sentinel = Self::sentinel();
        let mut attempt = 0u32;
        loop {
            match self.client.add(write_key, self.ttl, sentinel.clone()).await {
                Ok(true) => return,
                Ok(false) => debug!("could not acquire {} lock for key {}", kind, write_key),
                Err(e) => warn!("add({}) failed while acquiring {} lock: {}", write_key, kind, e),
            }
            tokio::time::sleep(self.pause(attempt)).await;
            attempt = attempt.saturating_add(1);
        }
    }

    async fn drop_gate(&self, write_key: &str) -> bool {
        match self.client.delete(write_key).await {
            Ok(deleted) => deleted,
            Err(e) => {
                warn!("could not delete lock key {}: {}", write_key, e);
                false
            }
        }
    }

    async fn readers(&self, read_key: &str) -> Result<u64, CacheError> {
        Ok(self
            .client
            .get(read_key)
            .await?
            .and_then(|v| v.as_counter())
            .unwrap_or(0))
    }

    /// Restart the TTL of a gate this process holds.
    async fn refresh(&self, write_key: &str) {
        if let Err(e) = self.client.set(write_key, self.ttl, Self::sentinel()).await {
            warn!("could not refresh lock key {}: {}", write_key, e);
        }
    }

    /// Drop a reader count nobody deregistered from. Only called with the gate held.
    async fn forget_readers(&self, read_key: &str) {
        if let Err(e) = self.client.delete(read_key).await {
            warn!("could not reset reader count at {}: {}", read_key, e);
        }
    }

    /// Wait until no reader is registered. Readers that never deregister stop
    /// counting after half the lock TTL, so the caller's gate is still live
    /// when the wait ends.
    async fn wait_for_readers(&self, read_key: &str) -> ReaderWait {
        let give_up_at = Instant::now() + self.ttl / 2;
        let mut attempt = 0u32;
        loop {
            match self.readers(read_key).await {
                Ok(0) if attempt == 0 => return ReaderWait::Immediate,
                Ok(0) => return ReaderWait::Drained,
                Ok(n) => debug!("waiting for {} reads to finish on {}", n, read_key),
                Err(e) => warn!("could not read reader count at {}: {}", read_key, e),
            }
            if Instant::now() >= give_up_at {
                warn!(
                    "readers still registered at {} after {:?}; assuming they are gone",
                    read_key,
                    self.ttl / 2
                );
                return ReaderWait::Abandoned;
            }
            tokio::time::sleep(self.pause(attempt)).await;
            attempt = attempt.saturating_add(1);
        }
    }
}

/// How a writer's wait on registered readers ended.
enum ReaderWait {
    Immediate,
    Drained,
    Abandoned,
}

/// Readers register in a counter; writers wait for registered readers.
pub struct ConcurrentReadBlockingWriteLock<C: KvClient> {
    gate: LockGate<C>,
}

impl<C: KvClient> ConcurrentReadBlockingWriteLock<C> {
    pub fn new(client: Arc<C>, config: &RegionConfig) -> Self {
        Self {
            gate: LockGate::new(client, config),
        }
    }
}

#[async_trait]
impl<C: KvClient> ReadWriteKeyLock for ConcurrentReadBlockingWriteLock<C> {
    async fn acquire_read(&self, keys: &LockKeys) -> Result<bool, CacheError> {
        let gate = &self.gate;
        gate.within(gate.deadline(), &keys.write, "read", gate.take(&keys.write, "read"))
            .await?;

        let registered = match gate.client.incr(&keys.read, 1, 1).await {
            Ok(_) => true,
            Err(e) => {
                warn!("could not register reader at {}: {}", keys.read, e);
                false
            }
        };
        gate.drop_gate(&keys.write).await;

        trace!("got read lock for key {}", keys.read);
        Ok(registered)
    }

    async fn release_read(&self, keys: &LockKeys) -> Result<bool, CacheError> {
        match self.gate.client.decr(&keys.read, 1, 0).await {
            Ok(_) => {
                trace!("released read lock for key {}", keys.read);
                Ok(true)
            }
            Err(e) => {
                warn!("could not release read lock at {}: {}", keys.read, e);
                Ok(false)
            }
        }
    }

    async fn acquire_write(&self, keys: &LockKeys) -> Result<bool, CacheError> {
        let gate = &self.gate;
        let deadline = gate.deadline();
        gate.within(deadline, &keys.write, "write", gate.take(&keys.write, "write"))
            .await?;
        trace!("acquired write lock for key {}", keys.write);

        let waited = gate
            .within(deadline, &keys.write, "write", gate.wait_for_readers(&keys.read))
            .await;
        match waited {
            Err(e) => {
                gate.drop_gate(&keys.write).await;
                return Err(e);
            }
            Ok(ReaderWait::Immediate) => {}
            Ok(ReaderWait::Drained) => gate.refresh(&keys.write).await,
            Ok(ReaderWait::Abandoned) => {
                gate.forget_readers(&keys.read).await;
                gate.refresh(&keys.write).await;
            }
        }
        Ok(true)
    }

    async fn release_write(&self, keys: &LockKeys) -> Result<bool, CacheError> {
        let released = self.gate.drop_gate(&keys.write).await;
        trace!("released write lock for key {}", keys.write);
        Ok(released)
    }
}

/// Reads are never blocked nor tracked; only writers contend.
pub struct UnblockedReadBlockingWriteLock<C: KvClient> {
    gate: LockGate<C>,
}

impl<C: KvClient> UnblockedReadBlockingWriteLock<C> {
    pub fn new(client: Arc<C>, config: &RegionConfig) -> Self {
        Self {
            gate: LockGate::new(client, config),
        }
    }
}

#[async_trait]
impl<C: KvClient> ReadWriteKeyLock for UnblockedReadBlockingWriteLock<C> {
    async fn acquire_read(&self, _keys: &LockKeys) -> Result<bool, CacheError> {
        Ok(true)
    }

    async fn release_read(&self, _keys: &LockKeys) -> Result<bool, CacheError> {
        Ok(true)
    }

    async fn acquire_write(&self, keys: &LockKeys) -> Result<bool, CacheError> {
        let gate = &self.gate;
        gate.within(gate.deadline(), &keys.write, "write", gate.take(&keys.write, "write"))
            .await?;
        trace!("acquired write lock for key {}", keys.write);
        Ok(true)
    }

    async fn release_write(&self, keys: &LockKeys) -> Result<bool, CacheError> {
        let released = self.gate.drop_gate(&keys.write).await;
        if !released {
            warn!("could not release write lock for key {}", keys.write);
        }
        Ok(released)
    }
}
