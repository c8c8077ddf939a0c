/// Error types for meshdb operations.
///
/// This module provides the error hierarchy covering all failure modes in
/// the replication engine and its adapters. All errors are well-typed and
/// can be pattern-matched for precise handling.
///
/// The engine never panics on peer-induced input: malformed messages are
/// coerced or dropped, resolver failures fall back to a safe strategy, and
/// transport failures are recovered by anti-entropy. Only configuration
/// errors at construction are fatal.
use thiserror::Error;

/// The main error type for meshdb operations.
///
/// All fallible operations return `Result<T, MeshError>`.
#[derive(Error, Debug)]
pub enum MeshError {
    /// The supplied path failed normalization.
    #[error("Invalid path '{path}': {reason}")]
    InvalidPath {
        /// The path as supplied by the caller
        path: String,
        /// Why normalization rejected it
        reason: String,
    },

    /// The supplied value cannot be stored.
    #[error("Invalid value: {reason}")]
    InvalidValue {
        /// Why the value was rejected
        reason: String,
    },

    /// Configuration was rejected at construction.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A store adapter operation failed.
    #[error("Store error: {0}")]
    Store(String),

    /// A transport adapter operation failed.
    #[error("Transport error: {0}")]
    Transport(String),

    /// The addressed peer is not currently connected.
    #[error("Peer '{0}' is not connected")]
    PeerUnreachable(String),

    /// Serialization error when encoding or decoding messages.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A custom conflict resolver reported a failure.
    #[error("Resolver error: {0}")]
    Resolver(String),

    /// The engine is draining and refuses new registrations.
    #[error("Engine is shutting down")]
    Draining,
}

/// Result type alias for meshdb operations.
pub type MeshResult<T> = Result<T, MeshError>;
