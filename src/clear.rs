//! Generational region clear
//!
//! Every key of a clear-enabled region embeds the region's current
//! generation. Bumping the generation makes the whole previous key space
//! unreachable without enumerating it; the old entries age out on their TTL.
//! The generation is re-read from the store on every key construction.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::CacheError;
use crate::config::RegionConfig;
use crate::key_codec::KeyCodec;
use crate::kv::{KvClient, KvValue};

pub struct ClearStrategy<C: KvClient> {
    client: Arc<C>,
    enabled: bool,
    generation_key: String,
}

impl<C: KvClient> Clone for ClearStrategy<C> {
    fn clone(&self) -> Self {
        Self {
            client: Arc::clone(&self.client),
            enabled: self.enabled,
            generation_key: self.generation_key.clone(),
        }
    }
}

impl<C: KvClient> ClearStrategy<C> {
    pub fn new(
        client: Arc<C>,
        config: &RegionConfig,
        codec: &KeyCodec,
    ) -> Result<Self, CacheError> {
        let raw = codec.join(&[&config.clear_index_prefix, &config.name]);
        Ok(Self {
            client,
            enabled: config.clear_enabled,
            generation_key: codec.encode(&raw)?,
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Key holding the generation counter.
    pub fn generation_key(&self) -> &str {
        &self.generation_key
    }

    /// Move the region to a new generation.
    ///
    /// Returns `false` when clearing is disabled or the increment failed.
    pub async fn clear(&self) -> bool {
        if !self.enabled {
            return false;
        }
        match self.client.incr(&self.generation_key, 1, 1).await {
            Ok(generation) => {
                debug!(
                    "Cleared region; generation at {} is now {}",
                    self.generation_key, generation
                );
                true
            }
            Err(e) => {
                warn!("Failed to increment clear generation at {}: {}", self.generation_key, e);
                false
            }
        }
    }

    /// Current generation, `0` when clearing is disabled or nothing was cleared yet.
    pub async fn current_generation(&self) -> Result<u64, CacheError> {
        if !self.enabled {
            return Ok(0);
        }
        match self.client.get(&self.generation_key).await? {
            None => Ok(0),
            Some(KvValue::Counter(n)) => Ok(n),
            Some(KvValue::Text(s)) => s.trim().parse().map_err(|_| CacheError::CorruptGeneration {
                key: self.generation_key.clone(),
                found: format!("text {s:?}"),
            }),
            Some(KvValue::Bytes(b)) => Err(CacheError::CorruptGeneration {
                key: self.generation_key.clone(),
                found: format!("{} raw bytes", b.len()),
            }),
        }
    }
}
