//! Error types for Larder

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the caching and coalescing layer
///
/// Most of these never reach a cache caller: the tiered cache and the
/// location service absorb environmental failures and log them. They are
/// surfaced by the lower-level APIs (`DurableStore`, `LocationSource`) and by
/// programmer errors such as an unserializable memoizer argument.
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // =========================================================================
    // Storage Errors
    // =========================================================================
    /// Durable tier unreachable, quota exceeded or write rejected
    #[error("Storage failure for key {key}: {reason}")]
    Storage { key: String, reason: String },

    /// Durable record failed to parse
    #[error("Corrupt record for key {key}: {reason}")]
    CorruptRecord { key: String, reason: String },

    /// Background durable writer is no longer running
    #[error("Durable writer stopped")]
    WriterStopped,

    // =========================================================================
    // Memoization Errors
    // =========================================================================
    /// Fingerprint could not be computed for the arguments
    #[error("Fingerprint failed: {0}")]
    Fingerprint(String),

    // =========================================================================
    // Coalescer Errors
    // =========================================================================
    /// Batch dispatcher task is no longer running
    #[error("Batch dispatcher stopped")]
    DispatcherStopped,

    /// Batch handler rejected a batch
    #[error("Batch of {size} items failed: {reason}")]
    Batch { size: usize, reason: String },

    // =========================================================================
    // Location Errors
    // =========================================================================
    /// Geolocation sensor refused or failed the reading
    #[error("Location sensor unavailable: {0}")]
    SensorUnavailable(String),

    /// Geolocation sensor did not answer in time
    #[error("Location sensor timed out after {0:?}")]
    SensorTimeout(std::time::Duration),

    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Create a storage failure for a key
    pub fn storage(key: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Error::Storage {
            key: key.into(),
            reason: reason.to_string(),
        }
    }

    /// Create a corrupt-record error for a key
    pub fn corrupt(key: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Error::CorruptRecord {
            key: key.into(),
            reason: reason.to_string(),
        }
    }

    /// Whether this is an environmental failure that callers recover from locally
    pub fn is_environmental(&self) -> bool {
        matches!(
            self,
            Error::Io(_)
                | Error::Storage { .. }
                | Error::CorruptRecord { .. }
                | Error::WriterStopped
                | Error::DispatcherStopped
                | Error::Batch { .. }
                | Error::SensorUnavailable(_)
                | Error::SensorTimeout(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::storage("larder:vendor:1", "quota exceeded");
        assert_eq!(
            err.to_string(),
            "Storage failure for key larder:vendor:1: quota exceeded"
        );

        let err = Error::SensorTimeout(std::time::Duration::from_secs(5));
        assert_eq!(err.to_string(), "Location sensor timed out after 5s");
    }

    #[test]
    fn test_environmental_classification() {
        assert!(Error::corrupt("k", "bad json").is_environmental());
        assert!(Error::SensorUnavailable("denied".into()).is_environmental());
        assert!(!Error::Fingerprint("NaN key".into()).is_environmental());
        assert!(!Error::Config("bad ttl".into()).is_environmental());
    }
}
