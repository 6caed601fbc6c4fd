//! On-disk record format and key-to-file-name mapping.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Extension shared by every record file. Anything else in the directory is
/// not a record.
pub(crate) const RECORD_EXTENSION: &str = "json";

/// One cache entry as persisted: `{"key", "value", "expiresAt"}`.
///
/// `value` is base64 so arbitrary response bodies survive JSON; `expiresAt`
/// is epoch milliseconds.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct CacheRecord {
    pub key: String,
    #[serde(with = "base64_bytes")]
    pub value: Bytes,
    pub expires_at: i64,
}

impl CacheRecord {
    /// Builds a record that stays valid for `ttl` from `now`.
    pub fn new(key: &str, value: Bytes, now: DateTime<Utc>, ttl: std::time::Duration) -> Self {
        let expires_at = TimeDelta::from_std(ttl)
            .ok()
            .and_then(|ttl| now.checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        Self {
            key: key.to_owned(),
            value,
            expires_at: expires_at.timestamp_millis(),
        }
    }

    /// A record is live strictly before its expiry instant.
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        now.timestamp_millis() < self.expires_at
    }
}

/// File stem for `key`: the lowercase hex SHA-256 of its UTF-8 bytes.
///
/// Keys carry `/`, `:` and `?` from URLs, so they never touch the
/// filesystem directly.
pub(crate) fn storage_name(key: &str) -> String {
    hex::encode(Sha256::digest(key.as_bytes()))
}

mod base64_bytes {
    use super::*;
    use serde::{Deserializer, Serializer, de};

    pub fn serialize<S: Serializer>(value: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map(Bytes::from)
            .map_err(de::Error::custom)
    }
}
