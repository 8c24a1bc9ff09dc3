//! # Transfile Transport
//!
//! Framed TCP RPC transport for Transfile.
//!
//! - [`frame`]: wire codec; header, bincode envelope and raw attachment
//! - [`server`]: accept loop dispatching `TransferFile` calls to a
//!   [`TransferResponder`](transfile_core::TransferResponder)
//! - [`channel`]: client side, implementing
//!   [`RpcChannel`](transfile_core::RpcChannel) with single, pooled or short
//!   connections

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod channel;
pub mod error;
pub mod frame;
pub mod options;
pub mod server;

#[cfg(test)]
mod testing;

pub use channel::Channel;
pub use error::{FrameError, TransportError, TransportResult};
pub use frame::{Body, Envelope, Frame};
pub use options::{ChannelOptions, ConnectionType, PROTOCOL_NAME, ServerOptions};
pub use server::{Server, ServerReport};
