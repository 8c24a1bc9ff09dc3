//! Error types for the Transfile core.

use std::io;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Fatal errors raised while building a catalog.
///
/// Any of these stops server startup; no partial catalog is ever returned.
#[derive(Debug, Error)]
pub enum CatalogError {
    /// Catalog root is missing, not a directory, or cannot be listed
    #[error("cannot read catalog directory {path}: {source}")]
    Directory {
        /// Directory that failed
        path: PathBuf,
        /// Underlying I/O error
        source: io::Error,
    },

    /// A catalog file could not be opened or read
    #[error("cannot read catalog file {path}: {source}")]
    Read {
        /// File that failed
        path: PathBuf,
        /// Underlying I/O error
        source: io::Error,
    },

    /// A catalog file yielded fewer bytes than its reported length
    #[error("short read on {path}: expected {expected} bytes, got {actual}")]
    ShortRead {
        /// File that was truncated
        path: PathBuf,
        /// Length reported by metadata
        expected: usize,
        /// Bytes actually read
        actual: usize,
    },

    /// Registering a buffer for zero-copy delivery failed
    #[error("cannot register buffer for key {key}: {source}")]
    Registration {
        /// Key of the record whose buffer failed to register
        key: String,
        /// Registrar error
        source: RegistrationError,
    },

    /// Two records share the same key
    #[error("duplicate catalog key: {0}")]
    DuplicateKey(String),
}

/// Memory registration errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegistrationError {
    /// Registration budget would be exceeded
    #[error("registration budget exhausted: {requested} bytes requested, {available} available")]
    Exhausted {
        /// Size of the region being registered
        requested: usize,
        /// Bytes still available under the budget
        available: usize,
    },

    /// Registrar ran out of registration keys
    #[error("no registration keys left")]
    KeysExhausted,
}

/// Transport-level failure observed by the client for a single call.
///
/// A missing key is *not* a `CallError`; it arrives as a normal `"Fail"`
/// response.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CallError {
    /// Could not establish a connection to the server
    #[error("connect failed: {0}")]
    Connect(String),

    /// I/O failure on an established connection
    #[error("I/O error: {0}")]
    Io(String),

    /// Per-channel deadline expired before a response arrived
    #[error("call timed out after {0:?}")]
    Timeout(Duration),

    /// Connection closed before the response arrived
    #[error("connection closed")]
    Closed,

    /// Peer sent something that is not a valid frame or envelope
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Server rejected the call
    #[error("remote error {code}: {message}")]
    Remote {
        /// Server-side error code
        code: u16,
        /// Server-side description
        message: String,
    },
}

impl From<io::Error> for CallError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::BrokenPipe => CallError::Closed,
            _ => CallError::Io(err.to_string()),
        }
    }
}

/// Errors from [`PendingCall::wait`](crate::client::PendingCall::wait)
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum WaitError {
    /// The call did not reach a terminal state within the wait bound.
    /// The call itself keeps running.
    #[error("call still pending after {0:?}")]
    TimedOut(Duration),

    /// The call task ended without publishing an outcome
    #[error("call task ended without an outcome")]
    Abandoned,
}
