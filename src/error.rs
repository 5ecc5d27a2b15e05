//! Error types for the StrataStor engine

use thiserror::Error;

use crate::model::ids::ChunkId;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the StrataStor engine
#[derive(Error, Debug)]
#[allow(clippy::enum_variant_names)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Duration parse error
    #[error("Failed to parse duration: {0}")]
    DurationParse(String),

    /// Entity lookup failed
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    // =========================================================================
    // Coding Errors
    // =========================================================================
    /// Coding configuration rejected at construction time
    #[error("Invalid coding configuration: {0}")]
    InvalidCodingConfig(String),

    /// Fragment production failed
    #[error("Fragment encoding failed: {0}")]
    EncodingFailure(String),

    /// Not enough fragments survive to decode a chunk
    #[error("Insufficient fragments for reconstruction: have {available}, need {required}")]
    InsufficientShards { available: usize, required: usize },

    /// Content did not match its recorded digest
    #[error("Digest mismatch for {what}")]
    DigestMismatch { what: String },

    /// Compression failed
    #[error("Compression with {algorithm} failed: {reason}")]
    CompressionFailed { algorithm: String, reason: String },

    /// Decompression failed
    #[error("Decompression with {algorithm} failed: {reason}")]
    DecompressionFailed { algorithm: String, reason: String },

    /// Encryption or authentication failure
    #[error("Cipher {cipher} failed: {reason}")]
    Cipher { cipher: String, reason: String },

    // =========================================================================
    // Dedup / Placement Errors
    // =========================================================================
    /// Another writer inserted a chunk with the same dedup key first
    #[error("Dedup race lost to chunk {existing}")]
    DedupRaceLost { existing: ChunkId },

    /// No tier in the tiering can host the requested blocks
    #[error("Insufficient pool capacity: {0}")]
    InsufficientPoolCapacity(String),

    /// Writing a block to its node failed
    #[error("Block write failed for block {block_id}: {reason}")]
    BlockWrite { block_id: String, reason: String },

    /// Reading a block from its node failed
    #[error("Block read failed for block {block_id}: {reason}")]
    BlockRead { block_id: String, reason: String },

    // =========================================================================
    // Schema Errors
    // =========================================================================
    /// Wire or persisted representation does not have the expected shape
    #[error("Schema validation failed for {entity}: {reason}")]
    SchemaValidation { entity: &'static str, reason: String },
}

impl Error {
    /// Shorthand for a schema validation failure
    pub fn schema(entity: &'static str, reason: impl Into<String>) -> Self {
        Error::SchemaValidation {
            entity,
            reason: reason.into(),
        }
    }

    /// Shorthand for a missing entity
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        Error::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    /// Whether a rebuild that hit this error should be retried later
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::InsufficientPoolCapacity(_) | Error::BlockWrite { .. } | Error::BlockRead { .. }
        )
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Error::Config(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::schema("json", e.to_string())
    }
}
