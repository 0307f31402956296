//! Query cache error types.

use thiserror::Error;

/// Errors raised by the query cache itself.
///
/// Failures of the cached operations are never reported here; they settle the
/// operation's [`Deferred`](crate::Deferred) with a [`Rejection`](crate::Rejection).
#[derive(Error, Debug)]
pub enum CacheError {
    /// A key, value or restore record could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Cache configuration could not be parsed.
    #[error("Configuration error: {0}")]
    Config(#[from] toml::de::Error),

    /// An entry exists for this id but was created with different types.
    #[error("Entry {id} was created with a different operation type (expected {expected})")]
    TypeMismatch {
        /// Normalized id of the conflicting entry.
        id: String,
        /// Type name of the requested entry.
        expected: &'static str,
    },

    /// A cache-backed operation was requested outside of a registry scope.
    #[error("No query cache is available in the current scope")]
    MissingRegistry,
}
