//! # Transfile Core
//!
//! File catalog and request lifecycle for the Transfile service.
//!
//! This crate provides:
//! - An in-memory catalog of files, each buffer registered for zero-copy delivery
//! - Lower-bound binary-search lookup by key
//! - The server-side responder answering `TransferFile` calls
//! - The client-side asynchronous request issuer and its completion handling
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     AsyncRequestClient                          │
//! │   (issues calls, owns in-flight state, persists attachments)    │
//! ├──────────────────────────── RpcChannel ─────────────────────────┤
//! │                     TransferResponder                           │
//! │   (lookup + zero-copy attachment of the matching buffer)        │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                         Catalog                                 │
//! │   (sorted, immutable, registered file buffers)                  │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The transport itself lives in `transfile-transport`; this crate only
//! defines the [`RpcChannel`] seam the client is written against.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod catalog;
pub mod client;
pub mod error;
pub mod message;
pub mod registry;
pub mod responder;

pub use catalog::{Catalog, FileRecord, FileView, TeardownReport};
pub use client::{AsyncRequestClient, CallOutcome, CallState, PendingCall, RpcChannel};
pub use error::{CallError, CatalogError, RegistrationError, WaitError};
pub use message::{FileRequest, FileResponse, Reply, TransferRequest, TransferResult};
pub use registry::{LocalRegistrar, MemoryRegistrar, PassthroughRegistrar, RegistrationKey};
pub use responder::{ResponderStats, TransferResponder};

/// File extension recognised when building a catalog from a directory
pub const DEFAULT_EXTENSION: &str = "npcbuf";

/// Name of the single RPC method exposed by the service
pub const TRANSFER_METHOD: &str = "TransferFile";
