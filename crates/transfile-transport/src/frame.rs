//! Frame codec for the Transfile RPC protocol.
//!
//! Every message is one frame. All multi-byte header fields are big-endian.
//!
//! ```text
//! ┌────────────┬──────────────┬────────────────────┬──────────┬────────────┐
//! │ magic (4)  │ meta_len u32 │ attachment_len u64 │ envelope │ attachment │
//! │   "TFR1"   │              │                    │ (bincode)│  (raw)     │
//! └────────────┴──────────────┴────────────────────┴──────────┴────────────┘
//! ```
//!
//! The attachment is a separate byte stream after the envelope. When the
//! attached [`FileView`] is registered for zero-copy delivery it is written
//! straight from the catalog buffer; otherwise it is copied into the frame
//! buffer together with the header.

use crate::error::FrameError;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use transfile_core::{FileRequest, FileResponse, FileView};

/// Protocol magic and version
pub const MAGIC: [u8; 4] = *b"TFR1";

/// Fixed header size in bytes
pub const HEADER_SIZE: usize = 16;

/// Maximum encoded envelope size
pub const MAX_META_SIZE: usize = 64 * 1024;

/// Maximum attachment size
pub const MAX_ATTACHMENT_SIZE: u64 = 4 * 1024 * 1024 * 1024;

/// Error code: method not served
pub const ERROR_UNKNOWN_METHOD: u16 = 404;

/// Error code: frame was not a request
pub const ERROR_BAD_REQUEST: u16 = 400;

/// Message body
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum Body {
    /// Client call
    Request {
        /// Method name
        method: String,
        /// Call arguments
        request: FileRequest,
    },
    /// Successful call; a `"Succ"` response carries the file as attachment
    Response {
        /// Call result
        response: FileResponse,
    },
    /// Call rejected by the server
    Error {
        /// Error code
        code: u16,
        /// Description
        message: String,
    },
}

/// Envelope correlating a body with its call
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Envelope {
    /// Call identifier, echoed in the response
    pub call_id: u64,
    /// Message body
    pub body: Body,
}

impl Envelope {
    /// Serialize to bytes
    ///
    /// # Errors
    ///
    /// Returns `FrameError::Encode` on serialization failure.
    pub fn to_bytes(&self) -> Result<Vec<u8>, FrameError> {
        bincode::serialize(self).map_err(|e| FrameError::Encode(e.to_string()))
    }

    /// Deserialize from bytes
    ///
    /// # Errors
    ///
    /// Returns `FrameError::Decode` on malformed input.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, FrameError> {
        bincode::deserialize(bytes).map_err(|e| FrameError::Decode(e.to_string()))
    }
}

/// Decoded frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Envelope length
    pub meta_len: u32,
    /// Attachment length
    pub attachment_len: u64,
}

impl FrameHeader {
    /// Encode to wire bytes
    #[must_use]
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(&MAGIC);
        buf[4..8].copy_from_slice(&self.meta_len.to_be_bytes());
        buf[8..16].copy_from_slice(&self.attachment_len.to_be_bytes());
        buf
    }

    /// Decode and validate wire bytes
    ///
    /// # Errors
    ///
    /// Returns `FrameError` on bad magic or out-of-range lengths.
    pub fn decode(buf: &[u8; HEADER_SIZE]) -> Result<Self, FrameError> {
        let mut magic = [0u8; 4];
        magic.copy_from_slice(&buf[0..4]);
        if magic != MAGIC {
            return Err(FrameError::BadMagic(magic));
        }

        let mut meta_len = [0u8; 4];
        meta_len.copy_from_slice(&buf[4..8]);
        let meta_len = u32::from_be_bytes(meta_len);

        let mut attachment_len = [0u8; 8];
        attachment_len.copy_from_slice(&buf[8..16]);
        let attachment_len = u64::from_be_bytes(attachment_len);

        if meta_len as usize > MAX_META_SIZE {
            return Err(FrameError::MetaTooLarge(meta_len as usize));
        }
        if attachment_len > MAX_ATTACHMENT_SIZE {
            return Err(FrameError::AttachmentTooLarge(attachment_len));
        }

        Ok(Self {
            meta_len,
            attachment_len,
        })
    }
}

/// A decoded frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Envelope
    pub envelope: Envelope,
    /// Attachment bytes (empty when none was sent)
    pub attachment: Vec<u8>,
}

/// Write one frame, returning the number of bytes written.
///
/// # Errors
///
/// Returns `FrameError` if the envelope or attachment is too large or the
/// stream fails.
pub async fn write_frame<W>(
    writer: &mut W,
    envelope: &Envelope,
    attachment: Option<&FileView>,
) -> Result<usize, FrameError>
where
    W: AsyncWrite + Unpin,
{
    let meta = envelope.to_bytes()?;
    if meta.len() > MAX_META_SIZE {
        return Err(FrameError::MetaTooLarge(meta.len()));
    }

    let attachment_bytes = attachment.map_or(&[][..], FileView::bytes);
    let attachment_len = attachment_bytes.len() as u64;
    if attachment_len > MAX_ATTACHMENT_SIZE {
        return Err(FrameError::AttachmentTooLarge(attachment_len));
    }

    let header = FrameHeader {
        meta_len: meta.len() as u32,
        attachment_len,
    };
    let in_place = attachment.is_some_and(FileView::zero_copy);

    let mut head = Vec::with_capacity(
        HEADER_SIZE + meta.len() + if in_place { 0 } else { attachment_bytes.len() },
    );
    head.extend_from_slice(&header.encode());
    head.extend_from_slice(&meta);

    if in_place {
        writer.write_all(&head).await?;
        writer.write_all(attachment_bytes).await?;
    } else {
        head.extend_from_slice(attachment_bytes);
        writer.write_all(&head).await?;
    }
    writer.flush().await?;

    Ok(HEADER_SIZE + meta.len() + attachment_bytes.len())
}

/// Read one frame, accepting attachments up to [`MAX_ATTACHMENT_SIZE`].
///
/// Returns `Ok(None)` if the stream ends cleanly before a new frame starts.
///
/// # Errors
///
/// Returns `FrameError` on malformed frames or if the stream ends mid-frame.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Frame>, FrameError>
where
    R: AsyncRead + Unpin,
{
    read_frame_limited(reader, MAX_ATTACHMENT_SIZE).await
}

/// Read one frame whose attachment may not exceed `max_attachment` bytes.
///
/// The limit is checked against the header before anything is allocated.
///
/// # Errors
///
/// Returns `FrameError::AttachmentTooLarge` if the header announces a larger
/// attachment, otherwise as [`read_frame`].
pub async fn read_frame_limited<R>(
    reader: &mut R,
    max_attachment: u64,
) -> Result<Option<Frame>, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_SIZE];
    let first = reader.read(&mut header).await?;
    if first == 0 {
        return Ok(None);
    }
    reader.read_exact(&mut header[first..]).await?;
    let header = FrameHeader::decode(&header)?;

    if header.attachment_len > max_attachment {
        return Err(FrameError::AttachmentTooLarge(header.attachment_len));
    }

    let mut meta = vec![0u8; header.meta_len as usize];
    reader.read_exact(&mut meta).await?;
    let envelope = Envelope::from_bytes(&meta)?;

    let attachment_len = usize::try_from(header.attachment_len)
        .map_err(|_| FrameError::AttachmentTooLarge(header.attachment_len))?;
    let mut attachment = vec![0u8; attachment_len];
    reader.read_exact(&mut attachment).await?;

    Ok(Some(Frame {
        envelope,
        attachment,
    }))
}
