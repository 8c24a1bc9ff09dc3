//! Client-side asynchronous request lifecycle.
//!
//! [`AsyncRequestClient::issue`] returns immediately with a [`PendingCall`].
//! The call runs in its own task, which owns the request and response and
//! drops both on every exit path. When the response (or a transport
//! failure) arrives the task runs the completion step exactly once and
//! publishes a terminal [`CallState`].
//!
//! Callers observe the outcome through the state or through the bounded
//! [`PendingCall::wait`]; there is no implicit wait and no retry.

use crate::error::{CallError, WaitError};
use crate::message::{FileRequest, Reply, TransferRequest};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Transport seam for the `TransferFile` method.
///
/// Implementations enforce their own per-call deadline and surface its
/// expiry as [`CallError::Timeout`]. They must not retry.
#[async_trait]
pub trait RpcChannel: Send + Sync + 'static {
    /// Perform one `TransferFile` call
    ///
    /// # Errors
    ///
    /// Returns `CallError` for transport-level failures only; a missing key
    /// is a successful call with a `"Fail"` response.
    async fn transfer_file(&self, request: FileRequest) -> Result<Reply, CallError>;
}

/// Terminal result of a call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallOutcome {
    /// Attachment written to `path`
    Succeeded {
        /// Destination written
        path: PathBuf,
        /// Bytes written
        bytes: u64,
    },
    /// Server answered that the key is not in its catalog
    NotFound,
    /// The call failed in the transport; nothing was written
    TransportFailure(CallError),
    /// The server found the file but writing it locally failed
    WriteFailed {
        /// Destination that could not be written
        path: PathBuf,
        /// I/O error description
        reason: String,
    },
}

impl CallOutcome {
    /// Whether the file was received and written
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded { .. })
    }
}

/// Per-call state machine: `Created -> Sent -> Completed`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallState {
    /// Call object exists, request not yet submitted
    Created,
    /// Request submitted, awaiting the response
    Sent,
    /// Final state
    Completed(CallOutcome),
}

impl CallState {
    /// Whether the state is final
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed(_))
    }

    /// Outcome of a completed call
    #[must_use]
    pub fn outcome(&self) -> Option<&CallOutcome> {
        match self {
            Self::Completed(outcome) => Some(outcome),
            _ => None,
        }
    }
}

/// Handle to one in-flight call.
///
/// Dropping the handle does not cancel the call.
#[derive(Debug)]
pub struct PendingCall {
    key: String,
    state: watch::Receiver<CallState>,
}

impl PendingCall {
    /// Key requested by this call
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Current state, without waiting
    #[must_use]
    pub fn state(&self) -> CallState {
        self.state.borrow().clone()
    }

    /// Wait up to `timeout` for the call to complete.
    ///
    /// # Errors
    ///
    /// Returns `WaitError::TimedOut` if the call is still pending when the
    /// bound expires (the call keeps running), or `WaitError::Abandoned` if
    /// the call task ended without an outcome.
    pub async fn wait(&mut self, timeout: Duration) -> Result<CallOutcome, WaitError> {
        let completed = self.state.wait_for(CallState::is_terminal);

        match tokio::time::timeout(timeout, completed).await {
            Ok(Ok(state)) => state.outcome().cloned().ok_or(WaitError::Abandoned),
            Ok(Err(_)) => Err(WaitError::Abandoned),
            Err(_) => Err(WaitError::TimedOut(timeout)),
        }
    }
}

/// Issues `TransferFile` calls and persists successful attachments.
pub struct AsyncRequestClient<C: RpcChannel> {
    channel: Arc<C>,
    destination: PathBuf,
}

impl<C: RpcChannel> AsyncRequestClient<C> {
    /// Client writing received files to `destination`
    pub fn new(channel: Arc<C>, destination: impl Into<PathBuf>) -> Self {
        Self {
            channel,
            destination: destination.into(),
        }
    }

    /// Default destination path
    #[must_use]
    pub fn destination(&self) -> &Path {
        &self.destination
    }

    /// Issue a call for `key`, writing a successful attachment to the
    /// default destination.
    ///
    /// Must be called from within a tokio runtime. Returns immediately.
    pub fn issue(&self, key: impl Into<String>) -> PendingCall {
        self.issue_to(key, self.destination.clone())
    }

    /// Issue a call for `key`, writing a successful attachment to
    /// `destination`.
    ///
    /// Must be called from within a tokio runtime. Returns immediately.
    pub fn issue_to(&self, key: impl Into<String>, destination: impl Into<PathBuf>) -> PendingCall {
        let request = TransferRequest::new(key);
        let key = request.key.clone();
        let destination = destination.into();
        let channel = Arc::clone(&self.channel);
        let (state_tx, state_rx) = watch::channel(CallState::Created);

        tokio::spawn(async move {
            let key = request.key.clone();
            state_tx.send_replace(CallState::Sent);
            debug!(%key, "transfer request sent");

            let reply = channel.transfer_file(FileRequest::from(request)).await;
            let outcome = complete(&key, reply, &destination).await;

            state_tx.send_replace(CallState::Completed(outcome));
        });

        PendingCall {
            key,
            state: state_rx,
        }
    }
}

/// Completion step for one call. Consumes the reply.
///
/// Transport failures and `"Fail"` responses are logged and write nothing;
/// a `"Succ"` attachment is written verbatim to `destination`, replacing any
/// existing file.
pub async fn complete(
    key: &str,
    reply: Result<Reply, CallError>,
    destination: &Path,
) -> CallOutcome {
    let reply = match reply {
        Ok(reply) => reply,
        Err(err) => {
            warn!(key, error = %err, "transfer call failed");
            return CallOutcome::TransportFailure(err);
        }
    };

    if !reply.response.is_success() {
        info!(key, "server could not find the file");
        return CallOutcome::NotFound;
    }

    let size = reply.attachment.len();
    info!(key, size, "received attachment");

    match tokio::fs::write(destination, &reply.attachment).await {
        Ok(()) => {
            info!(key, path = %destination.display(), "wrote attachment");
            CallOutcome::Succeeded {
                path: destination.to_path_buf(),
                bytes: size as u64,
            }
        }
        Err(err) => {
            error!(key, path = %destination.display(), error = %err, "cannot write attachment");
            CallOutcome::WriteFailed {
                path: destination.to_path_buf(),
                reason: err.to_string(),
            }
        }
    }
}
