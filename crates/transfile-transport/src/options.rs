//! Channel and server options.

use crate::error::TransportError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// The only wire protocol this transport speaks
pub const PROTOCOL_NAME: &str = "tfrpc";

/// How a channel maps calls onto TCP connections
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionType {
    /// One connection shared by all calls, multiplexed by call id
    #[default]
    Single,
    /// A connection per concurrent call, reused across calls
    Pooled,
    /// A fresh connection per call, closed afterwards
    Short,
}

impl FromStr for ConnectionType {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "single" => Ok(Self::Single),
            "pooled" => Ok(Self::Pooled),
            "short" => Ok(Self::Short),
            other => Err(TransportError::InvalidConfig(format!(
                "unknown connection type: {other} (expected single, pooled or short)"
            ))),
        }
    }
}

impl fmt::Display for ConnectionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Single => "single",
            Self::Pooled => "pooled",
            Self::Short => "short",
        })
    }
}

/// Client channel options
#[derive(Debug, Clone)]
pub struct ChannelOptions {
    /// Per-call deadline covering connect, send and receive
    pub timeout: Duration,
    /// Connection strategy
    pub connection_type: ConnectionType,
    /// Protocol name; must be [`PROTOCOL_NAME`]
    pub protocol: String,
    /// Idle connections kept by a pooled channel
    pub max_idle: usize,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(2000),
            connection_type: ConnectionType::Single,
            protocol: PROTOCOL_NAME.to_string(),
            max_idle: 16,
        }
    }
}

impl ChannelOptions {
    /// Validate the options
    ///
    /// # Errors
    ///
    /// Returns `TransportError::InvalidConfig` for an unknown protocol or a
    /// zero timeout.
    pub fn validate(&self) -> Result<(), TransportError> {
        if self.protocol != PROTOCOL_NAME {
            return Err(TransportError::InvalidConfig(format!(
                "unsupported protocol: {} (expected {PROTOCOL_NAME})",
                self.protocol
            )));
        }
        if self.timeout.is_zero() {
            return Err(TransportError::InvalidConfig(
                "call timeout must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Server options
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Listen backlog
    pub backlog: i32,
    /// Maximum concurrently served connections
    pub max_connections: usize,
    /// How long shutdown waits for open connections to finish
    pub shutdown_grace: Duration,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            backlog: 1024,
            max_connections: 1024,
            shutdown_grace: Duration::from_secs(5),
        }
    }
}
