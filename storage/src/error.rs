//! Error type definitions for the storage module.

use thiserror::Error;

use harbor_p2p::peers::PeersError;

/// Storage errors raised while persisting or rehydrating the address book
#[derive(Debug, Error)]
pub enum StorageError {
    /// The underlying database failed
    #[error("database failure: {0}")]
    Database(#[from] rusqlite::Error),
    /// A stored record could not be encoded or decoded
    #[error("record encoding failure: {0}")]
    Encoding(#[from] serde_json::Error),
    /// A required metadata key is missing from the snapshot
    #[error("snapshot metadata is missing key `{key}`")]
    MissingMetadata {
        /// The absent key
        key: &'static str,
    },
    /// A metadata value could not be parsed
    #[error("snapshot metadata key `{key}` holds an unusable value")]
    InvalidMetadata {
        /// The offending key
        key: &'static str,
    },
    /// The stored snapshot violates the address book invariants
    #[error("snapshot rejected: {0}")]
    Integrity(#[from] PeersError),
}
