//! Transport error types.

use std::io;
use thiserror::Error;
use transfile_core::CallError;

/// Frame codec errors
#[derive(Debug, Error)]
pub enum FrameError {
    /// Frame did not start with the protocol magic
    #[error("bad frame magic: {0:02x?}")]
    BadMagic([u8; 4]),

    /// Envelope larger than the protocol allows
    #[error("envelope too large: {0} bytes")]
    MetaTooLarge(usize),

    /// Attachment larger than the protocol allows
    #[error("attachment too large: {0} bytes")]
    AttachmentTooLarge(u64),

    /// Envelope could not be encoded
    #[error("cannot encode envelope: {0}")]
    Encode(String),

    /// Envelope could not be decoded
    #[error("cannot decode envelope: {0}")]
    Decode(String),

    /// Underlying stream failed
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl From<FrameError> for CallError {
    fn from(err: FrameError) -> Self {
        match err {
            FrameError::Io(err) => err.into(),
            other => CallError::Protocol(other.to_string()),
        }
    }
}

/// Server and channel setup errors
#[derive(Debug, Error)]
pub enum TransportError {
    /// Listener could not be created or bound
    #[error("failed to bind {addr}: {source}")]
    BindFailed {
        /// Requested bind address
        addr: std::net::SocketAddr,
        /// Underlying I/O error
        source: io::Error,
    },

    /// Options were rejected
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// I/O error while serving
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Result type for transport setup
pub type TransportResult<T> = Result<T, TransportError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_error_to_call_error() {
        let err: CallError = FrameError::BadMagic(*b"HTTP").into();
        assert!(matches!(err, CallError::Protocol(_)));

        let err: CallError = FrameError::Io(io::ErrorKind::UnexpectedEof.into()).into();
        assert_eq!(err, CallError::Closed);
    }
}
