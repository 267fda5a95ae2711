//! Physical key construction
//!
//! A physical key is `join(separator, namespace, generation, logical_key)`
//! passed through an ordered [`EncodingChain`]. The namespace is the region
//! name for values, or a lock/token prefix joined with the region name for
//! the coordination keys that live next to them.

use std::fmt;
use std::str::FromStr;

use md5::Md5;
use sha1::{Digest, Sha1};
use sha2::Sha256;
use tracing::debug;

use crate::CacheError;
use crate::config::RegionConfig;

/// A single key transformation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyEncoder {
    /// Leaves the key untouched. Nothing checks that the store accepts it.
    Identity,
    /// Lowercase hex SHA-1: fixed 40 characters, not reversible.
    Sha1,
    /// Lowercase hex MD5: fixed 32 characters, not reversible.
    Md5,
    /// Lowercase hex SHA-256: fixed 64 characters, not reversible.
    Sha256,
    /// Decimal 32-bit polynomial string hash. Short, but collisions are
    /// likely once a region holds more than a few thousand keys.
    HashCode,
    /// Strips whitespace and control characters, then rejects keys longer
    /// than the store maximum instead of truncating them.
    Valid,
}

impl KeyEncoder {
    pub fn encode(&self, key: &str, max_key_length: usize) -> Result<String, CacheError> {
        let encoded = match self {
            KeyEncoder::Identity => return Ok(key.to_owned()),
            KeyEncoder::Sha1 => hex::encode(Sha1::digest(key.as_bytes())),
            KeyEncoder::Md5 => hex::encode(Md5::digest(key.as_bytes())),
            KeyEncoder::Sha256 => hex::encode(Sha256::digest(key.as_bytes())),
            KeyEncoder::HashCode => string_hash(key).to_string(),
            KeyEncoder::Valid => {
                let cleaned: String = key
                    .chars()
                    .filter(|c| !c.is_whitespace() && !c.is_control())
                    .collect();
                if cleaned.len() > max_key_length {
                    return Err(CacheError::InvalidKey {
                        key: cleaned,
                        max_len: max_key_length,
                    });
                }
                cleaned
            }
        };
        debug!("encode({}) -> {}", key, encoded);
        Ok(encoded)
    }

    fn name(&self) -> &'static str {
        match self {
            KeyEncoder::Identity => "identity",
            KeyEncoder::Sha1 => "sha1",
            KeyEncoder::Md5 => "md5",
            KeyEncoder::Sha256 => "sha256",
            KeyEncoder::HashCode => "hashcode",
            KeyEncoder::Valid => "valid",
        }
    }
}

impl FromStr for KeyEncoder {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "identity" | "none" => Ok(KeyEncoder::Identity),
            "sha1" => Ok(KeyEncoder::Sha1),
            "md5" => Ok(KeyEncoder::Md5),
            "sha256" => Ok(KeyEncoder::Sha256),
            "hashcode" => Ok(KeyEncoder::HashCode),
            "valid" | "sanitize" => Ok(KeyEncoder::Valid),
            other => Err(CacheError::InvalidArgument(format!(
                "unknown key encoding: {other}"
            ))),
        }
    }
}

/// `h = 31 * h + unit` over the UTF-16 code units of `key`, wrapping at 32 bits.
fn string_hash(key: &str) -> i32 {
    key.encode_utf16()
        .fold(0i32, |h, unit| h.wrapping_mul(31).wrapping_add(i32::from(unit)))
}

/// Ordered list of encoders applied left to right.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodingChain(Vec<KeyEncoder>);

impl Default for EncodingChain {
    fn default() -> Self {
        Self(vec![KeyEncoder::Sha1])
    }
}

impl EncodingChain {
    pub fn new(encoders: Vec<KeyEncoder>) -> Self {
        Self(encoders)
    }

    pub fn encoders(&self) -> &[KeyEncoder] {
        &self.0
    }

    pub fn encode(&self, key: &str, max_key_length: usize) -> Result<String, CacheError> {
        let mut result = key.to_owned();
        for encoder in &self.0 {
            result = encoder.encode(&result, max_key_length)?;
        }
        Ok(result)
    }
}

impl FromStr for EncodingChain {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let encoders = s
            .split(',')
            .filter(|part| !part.trim().is_empty())
            .map(str::parse)
            .collect::<Result<Vec<KeyEncoder>, _>>()?;
        Ok(Self(encoders))
    }
}

impl fmt::Display for EncodingChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.0.iter().map(KeyEncoder::name).collect();
        f.write_str(&names.join(","))
    }
}

/// Builds physical keys for one region.
#[derive(Debug, Clone)]
pub struct KeyCodec {
    separator: String,
    chain: EncodingChain,
    max_key_length: usize,
}

impl KeyCodec {
    pub fn new(config: &RegionConfig) -> Self {
        Self {
            separator: config.namespace_separator.clone(),
            chain: config.key_encoding.clone(),
            max_key_length: config.max_key_length,
        }
    }

    /// Join components with the namespace separator.
    pub fn join(&self, parts: &[&str]) -> String {
        parts.join(&self.separator)
    }

    /// Build and encode the key for `logical_key` under `namespace` and `generation`.
    pub fn to_physical_key(
        &self,
        namespace: &str,
        generation: u64,
        logical_key: &str,
    ) -> Result<String, CacheError> {
        if logical_key.is_empty() {
            return Err(CacheError::InvalidArgument(
                "an empty key cannot be turned into a cache key".to_owned(),
            ));
        }
        let generation = generation.to_string();
        let joined = self.join(&[namespace, &generation, logical_key]);
        self.chain.encode(&joined, self.max_key_length)
    }

    /// Encode a key that is not generation scoped (the clear index itself).
    pub fn encode(&self, key: &str) -> Result<String, CacheError> {
        self.chain.encode(key, self.max_key_length)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codec(chain: &str) -> KeyCodec {
        let config = RegionConfig {
            key_encoding: chain.parse().unwrap(),
            max_key_length: 16,
            ..RegionConfig::new("products")
        };
        KeyCodec::new(&config)
    }

    #[test]
    fn test_identity_joins_components() {
        let codec = codec("identity");
        assert_eq!(
            codec.to_physical_key("products", 0, "p1").unwrap(),
            "products:0:p1"
        );
        assert_eq!(
            codec.to_physical_key("products", 7, "p1").unwrap(),
            "products:7:p1"
        );
    }

    #[test]
    fn test_digest_vectors() {
        assert_eq!(
            KeyEncoder::Sha1.encode("abc", 250).unwrap(),
            "a9993e364706816aba3e25717850c26c9cd0d89d"
        );
        assert_eq!(
            KeyEncoder::Md5.encode("abc", 250).unwrap(),
            "900150983cd24fb0d6963f7d28e17f72"
        );
        assert_eq!(KeyEncoder::Sha256.encode("abc", 250).unwrap().len(), 64);
    }

    #[test]
    fn test_hash_code() {
        assert_eq!(KeyEncoder::HashCode.encode("abc", 250).unwrap(), "96354");
        assert_eq!(KeyEncoder::HashCode.encode("", 250).unwrap(), "0");
    }

    #[test]
    fn test_distinct_logical_keys_stay_distinct() {
        let codec = codec("sha1");
        let mut seen = std::collections::HashSet::new();
        for i in 0..1000 {
            let key = codec.to_physical_key("products", 3, &format!("p{i}")).unwrap();
            assert_eq!(key.len(), 40);
            assert!(seen.insert(key));
        }
    }

    #[test]
    fn test_valid_strips_and_rejects() {
        assert_eq!(KeyEncoder::Valid.encode("a b\tc\u{7}d", 16).unwrap(), "abcd");

        let err = codec("valid")
            .to_physical_key("products", 0, "a-very-long-logical-key")
            .unwrap_err();
        assert!(matches!(err, CacheError::InvalidKey { max_len: 16, .. }));
    }

    #[test]
    fn test_chain_applies_in_order() {
        let codec = |chain: &str| {
            KeyCodec::new(&RegionConfig {
                key_encoding: chain.parse().unwrap(),
                max_key_length: 40,
                ..RegionConfig::new("products")
            })
        };
        let logical = "a very long logical key that keeps going";

        // hashing first keeps the sanitizer under the limit
        let key = codec("md5,valid").to_physical_key("products", 0, logical).unwrap();
        assert_eq!(key.len(), 32);

        assert!(codec("valid,md5").to_physical_key("products", 0, logical).is_err());
    }

    #[test]
    fn test_empty_key_rejected() {
        assert!(matches!(
            codec("sha1").to_physical_key("products", 0, ""),
            Err(CacheError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_chain_parse_and_display() {
        let chain: EncodingChain = "valid, sha1".parse().unwrap();
        assert_eq!(chain.to_string(), "valid,sha1");
        assert!("sha1,rot13".parse::<EncodingChain>().is_err());
    }
}
