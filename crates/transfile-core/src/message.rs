//! Request and response types.
//!
//! `FileRequest` / `FileResponse` are the wire messages of the
//! `TransferFile` method. `TransferRequest` / `TransferResult` are their
//! in-process counterparts used by the responder.

use crate::catalog::FileView;
use serde::{Deserialize, Serialize};

/// Response message for a found file
pub const MESSAGE_SUCC: &str = "Succ";

/// Response message for a missing file
pub const MESSAGE_FAIL: &str = "Fail";

/// `TransferFile` request as sent on the wire
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileRequest {
    /// Catalog key, conventionally a date such as `20230323`
    pub datetime_key: String,
}

/// `TransferFile` response as sent on the wire.
///
/// The file bytes travel as the frame attachment, not in this struct.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileResponse {
    /// `"Succ"` or `"Fail"`
    pub message: String,
}

impl FileResponse {
    /// Response for a found file
    #[must_use]
    pub fn succeeded() -> Self {
        Self {
            message: MESSAGE_SUCC.to_string(),
        }
    }

    /// Response for a missing file
    #[must_use]
    pub fn not_found() -> Self {
        Self {
            message: MESSAGE_FAIL.to_string(),
        }
    }

    /// Whether the server found the file
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.message == MESSAGE_SUCC
    }
}

/// A lookup request handled by the responder
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    /// Key to look up
    pub key: String,
}

impl TransferRequest {
    /// Request for `key`
    pub fn new(key: impl Into<String>) -> Self {
        Self { key: key.into() }
    }
}

impl From<FileRequest> for TransferRequest {
    fn from(request: FileRequest) -> Self {
        Self {
            key: request.datetime_key,
        }
    }
}

impl From<TransferRequest> for FileRequest {
    fn from(request: TransferRequest) -> Self {
        Self {
            datetime_key: request.key,
        }
    }
}

/// Outcome of a lookup: a found file always carries its bytes, a missing
/// one never does.
#[derive(Debug, Clone)]
pub enum TransferResult {
    /// Key found; the view references the catalog buffer
    Succeeded(FileView),
    /// Key absent from the catalog
    NotFound,
}

impl TransferResult {
    /// Whether the key was found
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded(_))
    }

    /// Attached view, if any
    #[must_use]
    pub fn payload(&self) -> Option<&FileView> {
        match self {
            Self::Succeeded(view) => Some(view),
            Self::NotFound => None,
        }
    }

    /// Split into the wire response and its attachment
    #[must_use]
    pub fn into_wire(self) -> (FileResponse, Option<FileView>) {
        match self {
            Self::Succeeded(view) => (FileResponse::succeeded(), Some(view)),
            Self::NotFound => (FileResponse::not_found(), None),
        }
    }
}

/// A response received by the client together with its attachment bytes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    /// Structured response
    pub response: FileResponse,
    /// Attachment bytes; empty unless the response is `"Succ"`
    pub attachment: Vec<u8>,
}
