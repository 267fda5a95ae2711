//! Redis-backed KV client
//!
//! `add` maps to `SET NX EX`. Counters with an initial value and the
//! saturating decrement run as Lua scripts so each stays one atomic command
//! at the server.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use tracing::debug;

use crate::CacheError;
use crate::kv::{KvClient, KvValue};

const INCR_SCRIPT: &str = r"
if redis.call('EXISTS', KEYS[1]) == 1 then
    return redis.call('INCRBY', KEYS[1], ARGV[1])
end
redis.call('SET', KEYS[1], ARGV[2])
return tonumber(ARGV[2])
";

const DECR_SCRIPT: &str = r"
local current = redis.call('GET', KEYS[1])
if not current then
    redis.call('SET', KEYS[1], ARGV[2])
    return tonumber(ARGV[2])
end
local next = tonumber(current) - tonumber(ARGV[1])
if next < 0 then
    next = 0
end
redis.call('SET', KEYS[1], next, 'KEEPTTL')
return next
";

/// [`KvClient`] over a shared Redis connection manager.
#[derive(Clone)]
pub struct RedisKv {
    conn: redis::aio::ConnectionManager,
    incr: redis::Script,
    decr: redis::Script,
}

impl RedisKv {
    pub async fn new(redis_client: redis::Client) -> Result<Self, redis::RedisError> {
        let conn = redis::aio::ConnectionManager::new(redis_client).await?;
        Ok(Self {
            conn,
            incr: redis::Script::new(INCR_SCRIPT),
            decr: redis::Script::new(DECR_SCRIPT),
        })
    }

    /// Redis expiries are whole seconds; round sub-second TTLs up so they still expire.
    fn ttl_secs(ttl: Duration) -> u64 {
        let secs = ttl.as_secs();
        if ttl.subsec_nanos() > 0 { secs + 1 } else { secs }
    }
}

#[async_trait]
impl KvClient for RedisKv {
    async fn get(&self, key: &str) -> Result<Option<KvValue>, CacheError> {
        let mut conn = self.conn.clone();
        let raw: Option<Vec<u8>> = conn.get(key).await?;
        Ok(raw.map(KvValue::from_wire))
    }

    async fn get_multi(&self, keys: &[String]) -> Result<HashMap<String, KvValue>, CacheError> {
        if keys.is_empty() {
            return Ok(HashMap::new());
        }
        let mut conn = self.conn.clone();
        let raw: Vec<Option<Vec<u8>>> = redis::cmd("MGET").arg(keys).query_async(&mut conn).await?;
        Ok(keys
            .iter()
            .zip(raw)
            .filter_map(|(k, v)| v.map(|v| (k.clone(), KvValue::from_wire(v))))
            .collect())
    }

    async fn set(&self, key: &str, ttl: Duration, value: KvValue) -> Result<bool, CacheError> {
        debug!("Redis SET {} ({:?})", key, ttl);
        let mut conn = self.conn.clone();
        let secs = Self::ttl_secs(ttl);
        if secs == 0 {
            conn.set::<_, _, ()>(key, value.to_wire()).await?;
        } else {
            conn.set_ex::<_, _, ()>(key, value.to_wire(), secs).await?;
        }
        Ok(true)
    }

    async fn add(&self, key: &str, ttl: Duration, value: KvValue) -> Result<bool, CacheError> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value.to_wire()).arg("NX");
        let secs = Self::ttl_secs(ttl);
        if secs > 0 {
            cmd.arg("EX").arg(secs);
        }
        let reply: Option<String> = cmd.query_async(&mut conn).await?;
        Ok(reply.is_some())
    }

    async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        let mut conn = self.conn.clone();
        let removed: u64 = conn.del(key).await?;
        Ok(removed > 0)
    }

    async fn incr(&self, key: &str, by: u64, initial: u64) -> Result<u64, CacheError> {
        let mut conn = self.conn.clone();
        let value: u64 = self
            .incr
            .key(key)
            .arg(by)
            .arg(initial)
            .invoke_async(&mut conn)
            .await?;
        Ok(value)
    }

    async fn decr(&self, key: &str, by: u64, initial: u64) -> Result<u64, CacheError> {
        let mut conn = self.conn.clone();
        let value: u64 = self
            .decr
            .key(key)
            .arg(by)
            .arg(initial)
            .invoke_async(&mut conn)
            .await?;
        Ok(value)
    }

    async fn shutdown(&self) -> Result<(), CacheError> {
        debug!("RedisKv shutdown; connection manager closes when the last clone drops");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ttl_rounds_up() {
        assert_eq!(RedisKv::ttl_secs(Duration::ZERO), 0);
        assert_eq!(RedisKv::ttl_secs(Duration::from_millis(200)), 1);
        assert_eq!(RedisKv::ttl_secs(Duration::from_secs(60)), 60);
    }
}
