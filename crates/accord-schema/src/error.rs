//! Schema catalog errors

use crate::fingerprint::SchemaFingerprint;
use crate::types::RecordTypeFamily;
use thiserror::Error;

/// Errors raised by the schema catalog, its registries and codecs
#[derive(Debug, Error)]
pub enum SchemaError {
    /// Two different fingerprints claimed the same record type family
    #[error("Schema conflict for {family}: {winner} is registered, {loser} was rejected")]
    Conflict {
        family: RecordTypeFamily,
        winner: SchemaFingerprint,
        loser: SchemaFingerprint,
    },

    #[error("Schema not registered: {0}")]
    NotRegistered(String),

    #[error("Duplicate annotation type: {0}")]
    DuplicateAnnotation(RecordTypeFamily),

    #[error("Invalid schema: {0}")]
    InvalidSchema(String),

    #[error("Invalid wire format: {0}")]
    InvalidWireFormat(String),

    #[error("Avro error: {0}")]
    Avro(String),

    /// A stored schema does not hash to the fingerprint it was stored under
    #[error("Corrupt registry entry: {0}")]
    Corrupt(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Illegal state: {0}")]
    IllegalState(String),

    #[error("Registry is not running")]
    NotRunning,

    #[error("Shutting down")]
    ShuttingDown,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SchemaError {
    /// Build a conflict error for `loser` losing `family` to `winner`
    pub fn conflict(
        family: RecordTypeFamily,
        winner: SchemaFingerprint,
        loser: SchemaFingerprint,
    ) -> Self {
        SchemaError::Conflict {
            family,
            winner,
            loser,
        }
    }

    /// Whether this error is a schema conflict (retrying the same schema is pointless)
    pub fn is_conflict(&self) -> bool {
        matches!(self, SchemaError::Conflict { .. })
    }

    /// Whether the failed operation may succeed if retried later
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            SchemaError::Storage(_) | SchemaError::Transport(_) | SchemaError::Io(_)
        )
    }
}

/// Result type for schema operations
pub type SchemaResult<T> = Result<T, SchemaError>;

impl From<apache_avro::Error> for SchemaError {
    fn from(e: apache_avro::Error) -> Self {
        SchemaError::Avro(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conflict_classification() {
        let err = SchemaError::conflict(
            RecordTypeFamily::new("com.example.Order"),
            SchemaFingerprint(1),
            SchemaFingerprint(2),
        );
        assert!(err.is_conflict());
        assert!(!err.is_retriable());
        assert!(err.to_string().contains("com.example.Order"));
    }

    #[test]
    fn test_transport_errors_are_retriable() {
        assert!(SchemaError::Storage("throttled".into()).is_retriable());
        assert!(SchemaError::Transport("connection reset".into()).is_retriable());
        assert!(!SchemaError::ShuttingDown.is_retriable());
        assert!(!SchemaError::Corrupt("bad".into()).is_retriable());
    }
}
