//! Configuration system for the Transfile CLI.

use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use transfile_core::DEFAULT_EXTENSION;
use transfile_transport::{ChannelOptions, ConnectionType, PROTOCOL_NAME, ServerOptions};

/// Transfile configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Server configuration
    pub server: ServerConfig,
    /// Client configuration
    pub client: ClientConfig,
    /// RPC configuration shared by server and client
    pub rpc: RpcConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Directory holding the catalog files
    #[serde(default = "default_catalog_root")]
    pub catalog_root: PathBuf,
    /// Catalog file extension, without the dot
    #[serde(default = "default_extension")]
    pub extension: String,
    /// Worker threads (defaults to the number of CPUs)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workers: Option<usize>,
    /// Maximum concurrently served connections
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Grace period for open connections at shutdown, in milliseconds
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
}

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Server address (`host:port`)
    #[serde(default = "default_server_addr")]
    pub server_addr: String,
    /// Key requested by `fetch`
    #[serde(default = "default_key")]
    pub key: String,
    /// Where a received file is written
    #[serde(default = "default_output")]
    pub output: PathBuf,
    /// How long `fetch` waits for the call to complete, in milliseconds
    #[serde(default = "default_wait_ms")]
    pub wait_ms: u64,
}

/// RPC configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcConfig {
    /// Serve attachments from registered buffers
    #[serde(default = "default_true")]
    pub zero_copy: bool,
    /// Per-call timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Connection strategy: single, pooled or short
    #[serde(default)]
    pub connection_type: ConnectionType,
    /// Wire protocol name
    #[serde(default = "default_protocol")]
    pub protocol: String,
    /// Idle connections kept by a pooled channel
    #[serde(default = "default_max_idle")]
    pub max_idle: usize,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default values

fn default_listen_addr() -> String {
    "0.0.0.0:8002".to_string()
}

fn default_catalog_root() -> PathBuf {
    PathBuf::from("../npcbuf/s5m/index")
}

fn default_extension() -> String {
    DEFAULT_EXTENSION.to_string()
}

fn default_max_connections() -> usize {
    1024
}

fn default_shutdown_grace_ms() -> u64 {
    5000
}

fn default_server_addr() -> String {
    "127.0.0.1:8002".to_string()
}

fn default_key() -> String {
    "20230323".to_string()
}

fn default_output() -> PathBuf {
    PathBuf::from("20230323-recv.npcbuf")
}

fn default_wait_ms() -> u64 {
    5000
}

fn default_true() -> bool {
    true
}

fn default_timeout_ms() -> u64 {
    2000
}

fn default_protocol() -> String {
    PROTOCOL_NAME.to_string()
}

fn default_max_idle() -> usize {
    16
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            catalog_root: default_catalog_root(),
            extension: default_extension(),
            workers: None,
            max_connections: default_max_connections(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_addr: default_server_addr(),
            key: default_key(),
            output: default_output(),
            wait_ms: default_wait_ms(),
        }
    }
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            zero_copy: true,
            timeout_ms: default_timeout_ms(),
            connection_type: ConnectionType::default(),
            protocol: default_protocol(),
            max_idle: default_max_idle(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self)?;

        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }

        fs::write(path, contents)?;
        Ok(())
    }

    /// Get default config path
    #[must_use]
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join("transfile/config.toml")
    }

    /// Load config from the default path, or use the defaults if there is
    /// no file there
    ///
    /// # Errors
    ///
    /// Returns an error if an existing file cannot be read or parsed.
    pub fn load_or_default() -> anyhow::Result<Self> {
        let path = Self::default_path();

        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Parse listen address as `SocketAddr`
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be parsed.
    pub fn parse_listen_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.server.listen_addr.parse()?)
    }

    /// Worker threads for the runtime
    #[must_use]
    pub fn workers(&self) -> usize {
        self.server.workers.unwrap_or_else(num_cpus::get)
    }

    /// Channel options for the client
    #[must_use]
    pub fn channel_options(&self) -> ChannelOptions {
        ChannelOptions {
            timeout: Duration::from_millis(self.rpc.timeout_ms),
            connection_type: self.rpc.connection_type,
            protocol: self.rpc.protocol.clone(),
            max_idle: self.rpc.max_idle,
        }
    }

    /// Server options
    #[must_use]
    pub fn server_options(&self) -> ServerOptions {
        ServerOptions {
            max_connections: self.server.max_connections,
            shutdown_grace: Duration::from_millis(self.server.shutdown_grace_ms),
            ..ServerOptions::default()
        }
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns an error if configuration is invalid.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.parse_listen_addr()?;
        validate_host_port(&self.client.server_addr, "Server address")?;

        if self.server.extension.is_empty() || self.server.extension.contains('.') {
            anyhow::bail!(
                "Invalid catalog extension: '{}' (expected a name without dots)",
                self.server.extension
            );
        }

        if let Some(workers) = self.server.workers {
            if workers == 0 || workers > 1024 {
                anyhow::bail!("Worker threads must be between 1 and 1024");
            }
        }

        if self.server.max_connections == 0 {
            anyhow::bail!("Max connections must be at least 1");
        }

        if self.client.key.is_empty() {
            anyhow::bail!("Client key must not be empty");
        }

        if self.client.wait_ms == 0 {
            anyhow::bail!("Client wait must be non-zero");
        }

        self.channel_options().validate()?;

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            anyhow::bail!(
                "Invalid log level: {}. Must be one of: {}",
                self.logging.level,
                valid_log_levels.join(", ")
            );
        }

        Ok(())
    }
}

/// Validate host:port format
fn validate_host_port(addr: &str, name: &str) -> anyhow::Result<()> {
    let Some((host, port)) = addr.rsplit_once(':') else {
        anyhow::bail!("{name} '{addr}' missing port (expected format: host:port)");
    };

    let port: u16 = port
        .parse()
        .map_err(|_| anyhow::anyhow!("{name} '{addr}' has invalid port: {port}"))?;
    if port == 0 {
        anyhow::bail!("{name} '{addr}' has invalid port: 0");
    }

    if host.is_empty() {
        anyhow::bail!("{name} '{addr}' has empty hostname");
    }

    Ok(())
}
