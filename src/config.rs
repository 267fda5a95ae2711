//! Region configuration
//!
//! A [`RegionConfig`] is built once per region and shared read-only by every
//! component of that region. [`RegionProperties`] builds it from a flat
//! string map where each setting may be given globally and overridden per
//! region.

use std::collections::HashMap;
use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

use crate::CacheError;
use crate::key_codec::EncodingChain;

/// Which distributed key lock protocol a region uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LockVariant {
    /// Readers register in a shared counter; writers wait for in-flight readers.
    #[default]
    ConcurrentReadBlockingWrite,
    /// Reads never block and are never tracked; only writers contend.
    UnblockedReadBlockingWrite,
}

impl FromStr for LockVariant {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "concurrent-read" | "concurrentreadblockingwrite" => {
                Ok(LockVariant::ConcurrentReadBlockingWrite)
            }
            "unblocked-read" | "unblockedreadblockedwrite" | "unblockedreadblockingwrite" => {
                Ok(LockVariant::UnblockedReadBlockingWrite)
            }
            other => Err(CacheError::InvalidArgument(format!(
                "unknown lock strategy: {other}"
            ))),
        }
    }
}

/// Backoff applied between lock acquisition attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockRetry {
    /// Delay after the first failed attempt
    pub initial: Duration,
    /// Upper bound for the exponential delay
    pub max: Duration,
    /// Maximum random delay added on top of each step
    pub jitter: Duration,
}

impl Default for LockRetry {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(25),
            max: Duration::from_secs(1),
            jitter: Duration::from_millis(25),
        }
    }
}

impl LockRetry {
    /// Delay before retry number `attempt` (zero based), without jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(16)).unwrap_or(u32::MAX);
        self.initial.saturating_mul(factor).min(self.max)
    }
}

/// Configuration for one cache region
#[derive(Debug, Clone)]
pub struct RegionConfig {
    /// Region name, the first component of every value key
    pub name: String,
    /// Separator joining key components
    pub namespace_separator: String,
    pub read_lock_prefix: String,
    pub write_lock_prefix: String,
    pub clear_index_prefix: String,
    /// Appended (after the separator) to a value key to form its freshness token key
    pub dogpile_token_prefix: String,
    /// Default time-to-live for cached values; also the soft-lock timeout
    pub cache_ttl: Duration,
    pub clear_enabled: bool,
    pub dogpile_enabled: bool,
    /// Multiplier applied to the value TTL when dogpile prevention is on. Must
    /// exceed 1.0 for the freshness token to expire first.
    pub dogpile_expiration_factor: f64,
    pub key_encoding: EncodingChain,
    /// Longest key the store accepts, enforced by the `valid` encoder
    pub max_key_length: usize,
    /// Expiry of lock keys, releasing locks held by crashed holders
    pub lock_ttl: Duration,
    pub lock_variant: LockVariant,
    pub lock_retry: LockRetry,
    /// Give up acquiring a key lock after this long. `None` retries until acquired.
    pub acquire_timeout: Option<Duration>,
    /// Skip `put_from_load` writes when a value is already cached
    pub minimal_puts: bool,
}

impl Default for RegionConfig {
    fn default() -> Self {
        Self {
            name: "default".to_owned(),
            namespace_separator: ":".to_owned(),
            read_lock_prefix: "read_lock".to_owned(),
            write_lock_prefix: "write_lock".to_owned(),
            clear_index_prefix: "index_key".to_owned(),
            dogpile_token_prefix: "dogpile_token".to_owned(),
            cache_ttl: Duration::from_secs(300), // 5 minutes
            clear_enabled: false,
            dogpile_enabled: false,
            dogpile_expiration_factor: 2.0,
            key_encoding: EncodingChain::default(),
            max_key_length: 250,
            lock_ttl: Duration::from_secs(60),
            lock_variant: LockVariant::default(),
            lock_retry: LockRetry::default(),
            acquire_timeout: None,
            minimal_puts: false,
        }
    }
}

impl RegionConfig {
    /// Defaults for a region with the given name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// TTL of a value written with `ttl` once the dogpile factor is applied.
    pub fn value_ttl(&self, ttl: Duration) -> Duration {
        if self.dogpile_enabled {
            ttl.mul_f64(self.dogpile_expiration_factor.max(0.0))
        } else {
            ttl
        }
    }
}

/// Flat string properties resolved per region.
///
/// Every setting is looked up as `regioncache.<region>.<name>` first, then
/// `regioncache.<name>`, then falls back to the [`RegionConfig`] default.
#[derive(Debug, Clone, Default)]
pub struct RegionProperties {
    props: HashMap<String, String>,
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for RegionProperties {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            props: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

impl RegionProperties {
    pub const PREFIX: &'static str = "regioncache.";

    pub const READ_LOCK_KEY_PREFIX: &'static str = "readLockPrefix";
    pub const WRITE_LOCK_KEY_PREFIX: &'static str = "writeLockPrefix";
    pub const CLEAR_INDEX_KEY_PREFIX: &'static str = "clearIndexKeyPrefix";
    pub const DOGPILE_TOKEN_KEY_PREFIX: &'static str = "dogpileTokenKeyPrefix";
    pub const NAME_SPACE_SEPARATOR: &'static str = "nameSpaceSeparator";
    pub const CACHE_TIME_SECONDS: &'static str = "cacheTimeSeconds";
    pub const CLEAR_SUPPORTED: &'static str = "clearSupported";
    pub const DOGPILE_PREVENTION: &'static str = "dogpilePrevention";
    pub const DOGPILE_EXPIRATION_FACTOR: &'static str = "dogpilePrevention.expirationFactor";
    pub const KEY_ENCODING_STRATEGY: &'static str = "keyEncodingStrategy";
    pub const MAX_KEY_LENGTH: &'static str = "maxKeyLength";
    pub const LOCK_TIME_SECONDS: &'static str = "lockTimeSeconds";
    pub const LOCK_STRATEGY: &'static str = "lockStrategy";
    pub const LOCK_ACQUIRE_TIMEOUT_MILLIS: &'static str = "lockAcquireTimeoutMillis";
    pub const MINIMAL_PUTS: &'static str = "minimalPuts";

    pub fn new(props: HashMap<String, String>) -> Self {
        Self { props }
    }

    /// Resolve the configuration for `region`.
    pub fn region_config(&self, region: &str) -> Result<RegionConfig, CacheError> {
        let defaults = RegionConfig::new(region);

        let cache_secs: u64 = self
            .parsed(region, Self::CACHE_TIME_SECONDS)?
            .unwrap_or(defaults.cache_ttl.as_secs());
        let lock_secs: u64 = self
            .parsed(region, Self::LOCK_TIME_SECONDS)?
            .unwrap_or(defaults.lock_ttl.as_secs());
        let acquire_ms: Option<u64> = self.parsed(region, Self::LOCK_ACQUIRE_TIMEOUT_MILLIS)?;

        Ok(RegionConfig {
            namespace_separator: self.string(
                region,
                Self::NAME_SPACE_SEPARATOR,
                &defaults.namespace_separator,
            ),
            read_lock_prefix: self.string(
                region,
                Self::READ_LOCK_KEY_PREFIX,
                &defaults.read_lock_prefix,
            ),
            write_lock_prefix: self.string(
                region,
                Self::WRITE_LOCK_KEY_PREFIX,
                &defaults.write_lock_prefix,
            ),
            clear_index_prefix: self.string(
                region,
                Self::CLEAR_INDEX_KEY_PREFIX,
                &defaults.clear_index_prefix,
            ),
            dogpile_token_prefix: self.string(
                region,
                Self::DOGPILE_TOKEN_KEY_PREFIX,
                &defaults.dogpile_token_prefix,
            ),
            cache_ttl: Duration::from_secs(cache_secs),
            clear_enabled: self
                .flag(region, Self::CLEAR_SUPPORTED)?
                .unwrap_or(defaults.clear_enabled),
            dogpile_enabled: self
                .flag(region, Self::DOGPILE_PREVENTION)?
                .unwrap_or(defaults.dogpile_enabled),
            dogpile_expiration_factor: self
                .parsed(region, Self::DOGPILE_EXPIRATION_FACTOR)?
                .unwrap_or(defaults.dogpile_expiration_factor),
            key_encoding: self.parsed(region, Self::KEY_ENCODING_STRATEGY)?.unwrap_or_default(),
            max_key_length: self
                .parsed(region, Self::MAX_KEY_LENGTH)?
                .unwrap_or(defaults.max_key_length),
            lock_ttl: Duration::from_secs(lock_secs),
            lock_variant: self.parsed(region, Self::LOCK_STRATEGY)?.unwrap_or_default(),
            acquire_timeout: acquire_ms.map(Duration::from_millis),
            minimal_puts: self.flag(region, Self::MINIMAL_PUTS)?.unwrap_or(defaults.minimal_puts),
            ..defaults
        })
    }

    fn lookup(&self, region: &str, name: &str) -> Option<&str> {
        let regional = format!("{}{}.{}", Self::PREFIX, region, name);
        let global = format!("{}{}", Self::PREFIX, name);
        self.props
            .get(&regional)
            .or_else(|| self.props.get(&global))
            .map(|v| v.trim())
    }

    fn string(&self, region: &str, name: &str, default: &str) -> String {
        self.lookup(region, name).unwrap_or(default).to_owned()
    }

    fn flag(&self, region: &str, name: &str) -> Result<Option<bool>, CacheError> {
        match self.lookup(region, name) {
            None => Ok(None),
            Some(v) if v.eq_ignore_ascii_case("true") => Ok(Some(true)),
            Some(v) if v.eq_ignore_ascii_case("false") => Ok(Some(false)),
            Some(v) => Err(CacheError::InvalidArgument(format!(
                "property {name} for region {region} must be true or false, got {v}"
            ))),
        }
    }

    fn parsed<T>(&self, region: &str, name: &str) -> Result<Option<T>, CacheError>
    where
        T: FromStr,
        T::Err: Display,
    {
        self.lookup(region, name)
            .map(|v| {
                v.parse::<T>().map_err(|e| {
                    CacheError::InvalidArgument(format!(
                        "property {name} for region {region} is invalid ({v}): {e}"
                    ))
                })
            })
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key_codec::KeyEncoder;

    #[test]
    fn test_defaults() {
        let config = RegionConfig::new("products");
        assert_eq!(config.name, "products");
        assert_eq!(config.namespace_separator, ":");
        assert_eq!(config.cache_ttl, Duration::from_secs(300));
        assert_eq!(config.lock_ttl, Duration::from_secs(60));
        assert!(!config.clear_enabled);
        assert!(!config.dogpile_enabled);
        assert_eq!(config.key_encoding.encoders(), &[KeyEncoder::Sha1]);
    }

    #[test]
    fn test_region_overrides_global() {
        let props: RegionProperties = [
            ("regioncache.cacheTimeSeconds", "10"),
            ("regioncache.products.cacheTimeSeconds", "5"),
            ("regioncache.clearSupported", "true"),
            ("regioncache.orders.clearSupported", "false"),
            ("regioncache.keyEncodingStrategy", "valid, md5"),
        ]
        .into_iter()
        .collect();

        let products = props.region_config("products").unwrap();
        assert_eq!(products.cache_ttl, Duration::from_secs(5));
        assert!(products.clear_enabled);
        assert_eq!(
            products.key_encoding.encoders(),
            &[KeyEncoder::Valid, KeyEncoder::Md5]
        );

        let orders = props.region_config("orders").unwrap();
        assert_eq!(orders.cache_ttl, Duration::from_secs(10));
        assert!(!orders.clear_enabled);
    }

    #[test]
    fn test_dogpile_and_lock_properties() {
        let props: RegionProperties = [
            ("regioncache.dogpilePrevention", "TRUE"),
            ("regioncache.dogpilePrevention.expirationFactor", "3"),
            ("regioncache.lockStrategy", "unblocked-read"),
            ("regioncache.lockAcquireTimeoutMillis", "1500"),
        ]
        .into_iter()
        .collect();

        let config = props.region_config("r").unwrap();
        assert!(config.dogpile_enabled);
        assert_eq!(config.dogpile_expiration_factor, 3.0);
        assert_eq!(config.lock_variant, LockVariant::UnblockedReadBlockingWrite);
        assert_eq!(config.acquire_timeout, Some(Duration::from_millis(1500)));
        assert_eq!(config.value_ttl(Duration::from_secs(10)), Duration::from_secs(30));
    }

    #[test]
    fn test_malformed_values_rejected() {
        let props: RegionProperties = [("regioncache.clearSupported", "yes")].into_iter().collect();
        assert!(matches!(
            props.region_config("r"),
            Err(CacheError::InvalidArgument(_))
        ));

        let props: RegionProperties = [("regioncache.cacheTimeSeconds", "soon")]
            .into_iter()
            .collect();
        assert!(matches!(
            props.region_config("r"),
            Err(CacheError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_backoff_is_capped() {
        let retry = LockRetry {
            initial: Duration::from_millis(10),
            max: Duration::from_millis(100),
            jitter: Duration::ZERO,
        };
        assert_eq!(retry.backoff(0), Duration::from_millis(10));
        assert_eq!(retry.backoff(1), Duration::from_millis(20));
        assert_eq!(retry.backoff(3), Duration::from_millis(80));
        assert_eq!(retry.backoff(4), Duration::from_millis(100));
        assert_eq!(retry.backoff(40), Duration::from_millis(100));
    }
}
