//! Error types for ratecard-core

use thiserror::Error;

/// Result type alias using [`Error`]
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while building snapshots from persisted records
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// Key is not a valid identifier (`[A-Za-z_][A-Za-z0-9_]*`)
    #[error("Invalid {kind} key '{key}': keys must start with a letter or '_' and contain only letters, digits or '_'")]
    InvalidKey { kind: &'static str, key: String },

    /// The same key appears twice in one snapshot
    #[error("Duplicate {kind} key '{key}'")]
    DuplicateKey { kind: &'static str, key: String },
}

impl Error {
    /// Create an invalid-key error for a record of the given kind
    pub fn invalid_key(kind: &'static str, key: impl Into<String>) -> Self {
        Error::InvalidKey {
            kind,
            key: key.into(),
        }
    }

    /// Create a duplicate-key error for a record of the given kind
    pub fn duplicate_key(kind: &'static str, key: impl Into<String>) -> Self {
        Error::DuplicateKey {
            kind,
            key: key.into(),
        }
    }
}
