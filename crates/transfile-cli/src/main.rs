//! Transfile CLI
//!
//! `transfile serve` loads a catalog directory and serves it;
//! `transfile fetch` requests one file and writes it locally;
//! `transfile init` writes the default configuration file.

mod config;

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use transfile_core::{
    AsyncRequestClient, CallOutcome, Catalog, LocalRegistrar, MemoryRegistrar,
    PassthroughRegistrar, TransferResponder,
};
use transfile_transport::{Channel, ConnectionType, Server, ServerReport};

use config::Config;

/// Transfile - serve preloaded files over a zero-copy RPC channel
#[derive(Parser)]
#[command(name = "transfile")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file path (defaults to the user config directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load the catalog and serve it until interrupted
    Serve {
        /// Listen address
        #[arg(short, long)]
        bind: Option<String>,

        /// Catalog directory
        #[arg(short, long)]
        root: Option<PathBuf>,

        /// Catalog file extension
        #[arg(long)]
        extension: Option<String>,

        /// Copy attachments instead of serving registered buffers
        #[arg(long)]
        no_zero_copy: bool,

        /// Worker threads
        #[arg(short, long)]
        workers: Option<usize>,
    },

    /// Fetch one file from a server
    Fetch {
        /// Key to request
        key: Option<String>,

        /// Server address
        #[arg(short, long)]
        server: Option<String>,

        /// Output file
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Per-call timeout in milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,

        /// Connection type: single, pooled or short
        #[arg(long)]
        connection_type: Option<String>,
    },

    /// Write a configuration file with the default settings
    Init {
        /// Replace an existing file
        #[arg(long)]
        force: bool,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if let Commands::Init { force } = cli.command {
        let path = cli.config.unwrap_or_else(Config::default_path);
        init_config(&path, force)?;
        println!("Wrote default configuration to {}", path.display());
        return Ok(());
    }

    let mut config = match &cli.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("cannot load config {}", path.display()))?,
        None => Config::load_or_default()?,
    };

    match &cli.command {
        Commands::Serve {
            bind,
            root,
            extension,
            no_zero_copy,
            workers,
        } => {
            if let Some(bind) = bind {
                config.server.listen_addr = bind.clone();
            }
            if let Some(root) = root {
                config.server.catalog_root = root.clone();
            }
            if let Some(extension) = extension {
                config.server.extension = extension.clone();
            }
            if *no_zero_copy {
                config.rpc.zero_copy = false;
            }
            if workers.is_some() {
                config.server.workers = *workers;
            }
        }
        Commands::Fetch {
            key,
            server,
            output,
            timeout_ms,
            connection_type,
        } => {
            if let Some(key) = key {
                config.client.key = key.clone();
            }
            if let Some(server) = server {
                config.client.server_addr = server.clone();
            }
            if let Some(output) = output {
                config.client.output = output.clone();
            }
            if let Some(timeout_ms) = timeout_ms {
                config.rpc.timeout_ms = *timeout_ms;
            }
            if let Some(connection_type) = connection_type {
                config.rpc.connection_type = connection_type.parse::<ConnectionType>()?;
            }
        }
        Commands::Init { .. } => {}
    }

    init_logging(cli.verbose, &config);
    config.validate()?;

    match cli.command {
        Commands::Serve { .. } => serve(&config),
        Commands::Fetch { .. } => fetch(&config),
        Commands::Init { .. } => Ok(()),
    }
}

/// Write the default configuration to `path`
fn init_config(path: &Path, force: bool) -> anyhow::Result<()> {
    if path.exists() && !force {
        anyhow::bail!(
            "{} already exists; pass --force to replace it",
            path.display()
        );
    }
    Config::default()
        .save(path)
        .with_context(|| format!("cannot write config {}", path.display()))
}

fn init_logging(verbose: bool, config: &Config) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(config.logging.level.to_lowercase()))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn build_runtime(workers: usize) -> anyhow::Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(workers)
        .thread_name("transfile-worker")
        .enable_all()
        .build()
        .context("cannot start runtime")
}

/// Run the server until Ctrl+C
fn serve(config: &Config) -> anyhow::Result<()> {
    let addr = config.parse_listen_addr()?;
    let registrar: Arc<dyn MemoryRegistrar> = if config.rpc.zero_copy {
        Arc::new(LocalRegistrar::new())
    } else {
        Arc::new(PassthroughRegistrar)
    };

    let catalog = Catalog::build_with_extension(
        &config.server.catalog_root,
        &config.server.extension,
        registrar,
    )
    .with_context(|| {
        format!(
            "cannot build catalog from {}",
            config.server.catalog_root.display()
        )
    })?;
    println!(
        "Catalog: {} files, {} bytes",
        catalog.len(),
        catalog.total_bytes()
    );

    let catalog = Arc::new(catalog);
    let responder = Arc::new(TransferResponder::new(Arc::clone(&catalog)));
    let runtime = build_runtime(config.workers())?;

    let report = runtime.block_on(run_server(addr, Arc::clone(&responder), config))?;

    // Stray request tasks hold the responder until the runtime is gone
    runtime.shutdown_timeout(Duration::from_secs(1));

    let stats = responder.stats();
    println!(
        "Served {} connections: {} hits, {} misses",
        report.connections, stats.hits, stats.misses
    );
    drop(responder);

    match Arc::try_unwrap(catalog) {
        Ok(catalog) => {
            let teardown = catalog.teardown();
            tracing::info!(
                released = teardown.released,
                deferred = teardown.deferred,
                "shutdown complete"
            );
        }
        Err(_) => tracing::warn!("catalog still shared at exit; skipping teardown"),
    }

    Ok(())
}

async fn run_server(
    addr: SocketAddr,
    responder: Arc<TransferResponder>,
    config: &Config,
) -> anyhow::Result<ServerReport> {
    let server = Server::bind(addr, responder, config.server_options()).await?;
    println!("Listening on: {}", server.local_addr());
    println!("Zero-copy: {}", config.rpc.zero_copy);
    println!("Press Ctrl+C to stop");

    Ok(server.run_until(shutdown_signal()).await?)
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "cannot listen for Ctrl+C; stopping");
    }
    println!("\nShutting down...");
}

/// Fetch one file; any outcome other than success is an error
fn fetch(config: &Config) -> anyhow::Result<()> {
    let runtime = build_runtime(config.workers())?;
    runtime.block_on(fetch_file(config))
}

async fn fetch_file(config: &Config) -> anyhow::Result<()> {
    let addr = resolve(&config.client.server_addr).await?;
    let channel = Channel::new(addr, config.channel_options())?;
    let client = AsyncRequestClient::new(Arc::new(channel), config.client.output.clone());

    let mut call = client.issue(config.client.key.clone());
    let outcome = call
        .wait(Duration::from_millis(config.client.wait_ms))
        .await
        .with_context(|| format!("no outcome for key {}", call.key()))?;

    let bytes = outcome_result(outcome, &config.client.key, addr)?;
    println!("Received {bytes} bytes into {}", config.client.output.display());
    Ok(())
}

/// Bytes written on success; every other outcome is an error
fn outcome_result(outcome: CallOutcome, key: &str, addr: SocketAddr) -> anyhow::Result<u64> {
    match outcome {
        CallOutcome::Succeeded { bytes, .. } => Ok(bytes),
        CallOutcome::NotFound => anyhow::bail!("key {key} not found on {addr}"),
        CallOutcome::TransportFailure(err) => {
            Err(anyhow::Error::new(err).context(format!("transfer from {addr} failed")))
        }
        CallOutcome::WriteFailed { path, reason } => {
            anyhow::bail!("cannot write {}: {reason}", path.display())
        }
    }
}

async fn resolve(server_addr: &str) -> anyhow::Result<SocketAddr> {
    tokio::net::lookup_host(server_addr)
        .await
        .with_context(|| format!("cannot resolve {server_addr}"))?
        .next()
        .with_context(|| format!("no address for {server_addr}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use transfile_core::CallError;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_fetch_arguments() {
        let cli = Cli::try_parse_from([
            "transfile",
            "-v",
            "fetch",
            "20230101",
            "--server",
            "10.0.0.1:8002",
            "--connection-type",
            "short",
        ])
        .unwrap();

        assert!(cli.verbose);
        match cli.command {
            Commands::Fetch {
                key,
                server,
                connection_type,
                ..
            } => {
                assert_eq!(key.as_deref(), Some("20230101"));
                assert_eq!(server.as_deref(), Some("10.0.0.1:8002"));
                assert_eq!(connection_type.as_deref(), Some("short"));
            }
            _ => panic!("expected fetch"),
        }
    }

    #[test]
    fn test_serve_arguments() {
        let cli =
            Cli::try_parse_from(["transfile", "serve", "--root", "/data", "--no-zero-copy"])
                .unwrap();

        match cli.command {
            Commands::Serve {
                root, no_zero_copy, ..
            } => {
                assert_eq!(root, Some(PathBuf::from("/data")));
                assert!(no_zero_copy);
            }
            _ => panic!("expected serve"),
        }
    }

    #[test]
    fn test_init_arguments() {
        let cli =
            Cli::try_parse_from(["transfile", "--config", "/tmp/t.toml", "init", "--force"])
                .unwrap();

        assert_eq!(cli.config, Some(PathBuf::from("/tmp/t.toml")));
        assert!(matches!(cli.command, Commands::Init { force: true }));
    }

    #[test]
    fn test_init_writes_loadable_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/config.toml");

        init_config(&path, false).unwrap();
        let config = Config::load(&path).unwrap();
        config.validate().unwrap();
        assert_eq!(config.client.key, Config::default().client.key);

        // An existing file is kept unless forced
        std::fs::write(&path, "[client]\nkey = \"20230301\"\n").unwrap();
        assert!(init_config(&path, false).is_err());
        assert_eq!(Config::load(&path).unwrap().client.key, "20230301");

        init_config(&path, true).unwrap();
        assert_eq!(
            Config::load(&path).unwrap().client.key,
            Config::default().client.key
        );
    }

    #[test]
    fn test_only_success_maps_to_ok() {
        let addr: SocketAddr = "127.0.0.1:8002".parse().unwrap();

        let written = outcome_result(
            CallOutcome::Succeeded {
                path: PathBuf::from("out.npcbuf"),
                bytes: 3,
            },
            "20230101",
            addr,
        );
        assert_eq!(written.unwrap(), 3);

        let not_found = outcome_result(CallOutcome::NotFound, "20230201", addr).unwrap_err();
        assert!(not_found.to_string().contains("20230201"));

        let transport = outcome_result(
            CallOutcome::TransportFailure(CallError::Timeout(Duration::from_millis(2000))),
            "20230101",
            addr,
        )
        .unwrap_err();
        assert_eq!(
            transport.downcast_ref::<CallError>(),
            Some(&CallError::Timeout(Duration::from_millis(2000)))
        );

        let write_failed = outcome_result(
            CallOutcome::WriteFailed {
                path: PathBuf::from("/readonly/out"),
                reason: "permission denied".to_string(),
            },
            "20230101",
            addr,
        )
        .unwrap_err();
        assert!(write_failed.to_string().contains("permission denied"));
    }
}
