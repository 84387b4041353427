//! Error types for rln-feed

use thiserror::Error;

/// Result type alias using our Error
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types
#[derive(Debug, Error)]
pub enum Error {
    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] postcard::Error),

    /// Hash mismatch (computed != transmitted)
    #[error("hash mismatch: computed {computed} != transmitted {transmitted}")]
    HashMismatch { computed: String, transmitted: String },

    /// Float normalization error (NaN, Inf)
    #[error("float normalization error: {0}")]
    FloatNormalization(String),

    /// Field element is not a canonical decimal integer
    #[error("invalid field element in {field}: {value:?}")]
    InvalidFieldElement { field: &'static str, value: String },

    /// Missing required field
    #[error("missing required field: {0}")]
    MissingField(&'static str),
}
