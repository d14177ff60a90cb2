//! Durable record codec
//!
//! The on-disk format of a cache entry:
//!
//! ```text
//! {"v":1,"stored_at":1700000000000,"expires_at":1700000300000,"value":<payload>}
//! ```
//!
//! Timestamps are epoch milliseconds. The payload is whatever JSON the
//! caller's value serializes to; the cache never interprets it.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::clock::Timestamp;
use crate::error::{Error, Result};

/// Current envelope version
pub const RECORD_VERSION: u32 = 1;

/// Envelope around a stored value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRecord<T> {
    /// Envelope version
    #[serde(rename = "v")]
    pub version: u32,
    /// When the value was stored
    pub stored_at: Timestamp,
    /// When the value stops being valid
    pub expires_at: Timestamp,
    /// The payload
    pub value: T,
}

impl<T> StoredRecord<T> {
    /// Whether the record is logically absent at `now`
    #[inline]
    pub fn is_expired_at(&self, now: Timestamp) -> bool {
        now >= self.expires_at
    }
}

impl StoredRecord<serde_json::Value> {
    /// Decode the envelope only, leaving the payload untyped
    ///
    /// Any failure here means the record is corrupt.
    pub fn decode(key: &str, data: &[u8]) -> Result<Self> {
        let record: Self = serde_json::from_slice(data).map_err(|e| Error::corrupt(key, e))?;

        if record.version != RECORD_VERSION {
            return Err(Error::corrupt(
                key,
                format!("unsupported record version {}", record.version),
            ));
        }
        if record.expires_at <= record.stored_at {
            return Err(Error::corrupt(key, "expiry not after store time"));
        }
        Ok(record)
    }

    /// Convert the payload into the caller's type
    pub fn into_typed<V: DeserializeOwned>(self) -> Result<StoredRecord<V>> {
        Ok(StoredRecord {
            version: self.version,
            stored_at: self.stored_at,
            expires_at: self.expires_at,
            value: serde_json::from_value(self.value)?,
        })
    }
}

/// Encode a value with its timestamps into record bytes
pub fn encode<V: Serialize>(stored_at: Timestamp, expires_at: Timestamp, value: &V) -> Result<Bytes> {
    let record = StoredRecord {
        version: RECORD_VERSION,
        stored_at,
        expires_at,
        value,
    };
    Ok(Bytes::from(serde_json::to_vec(&record)?))
}
