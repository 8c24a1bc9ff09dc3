//! Catalog server fixture for integration testing
//!
//! Writes a set of files into a temporary catalog directory, builds the
//! catalog from it and serves it on an ephemeral localhost port.
//!
//! # Example
//!
//! ```no_run
//! use transfile_integration_tests::fixtures::CatalogServerFixture;
//! use transfile_transport::ConnectionType;
//!
//! #[tokio::test]
//! async fn test_fetch() {
//!     let fixture = CatalogServerFixture::new(&[("20230101", b"AAA")]).await.unwrap();
//!     let channel = fixture.channel(ConnectionType::Single);
//!     // ... issue calls ...
//!     fixture.shutdown().await.unwrap();
//! }
//! ```

use anyhow::Context;
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use transfile_core::{
    Catalog, DEFAULT_EXTENSION, LocalRegistrar, MemoryRegistrar, PassthroughRegistrar,
    ResponderStats, TeardownReport, TransferResponder,
};
use transfile_transport::{
    Channel, ChannelOptions, ConnectionType, Server, ServerOptions, ServerReport,
    TransportResult,
};

/// A running server over a temporary catalog directory
pub struct CatalogServerFixture {
    /// Directory holding the catalog files
    pub dir: TempDir,
    /// Address the server listens on
    pub addr: SocketAddr,
    catalog: Arc<Catalog>,
    responder: Arc<TransferResponder>,
    stop: oneshot::Sender<()>,
    server: JoinHandle<TransportResult<ServerReport>>,
}

impl CatalogServerFixture {
    /// Serve `files` with zero-copy registration
    ///
    /// # Errors
    ///
    /// Returns an error if the directory, catalog or listener cannot be
    /// set up.
    pub async fn new(files: &[(&str, &[u8])]) -> anyhow::Result<Self> {
        Self::with_registrar(files, Arc::new(LocalRegistrar::new())).await
    }

    /// Serve `files`, copying attachments into each frame
    ///
    /// # Errors
    ///
    /// See [`CatalogServerFixture::new`].
    pub async fn copying(files: &[(&str, &[u8])]) -> anyhow::Result<Self> {
        Self::with_registrar(files, Arc::new(PassthroughRegistrar)).await
    }

    /// Serve `files` through `registrar`
    ///
    /// # Errors
    ///
    /// See [`CatalogServerFixture::new`].
    pub async fn with_registrar(
        files: &[(&str, &[u8])],
        registrar: Arc<dyn MemoryRegistrar>,
    ) -> anyhow::Result<Self> {
        let dir = tempfile::tempdir()?;
        for (key, contents) in files {
            write_catalog_file(dir.path(), key, contents)?;
        }

        let catalog = Arc::new(Catalog::build(dir.path(), registrar)?);
        let responder = Arc::new(TransferResponder::new(Arc::clone(&catalog)));

        let options = ServerOptions {
            shutdown_grace: Duration::from_secs(2),
            ..ServerOptions::default()
        };
        let server = Server::bind(
            "127.0.0.1:0".parse()?,
            Arc::clone(&responder),
            options,
        )
        .await?;
        let addr = server.local_addr();

        let (stop, stopped) = oneshot::channel();
        let server = tokio::spawn(server.run_until(async {
            let _ = stopped.await;
        }));

        Ok(Self {
            dir,
            addr,
            catalog,
            responder,
            stop,
            server,
        })
    }

    /// The served catalog
    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    /// Responder hit/miss counters
    pub fn stats(&self) -> ResponderStats {
        self.responder.stats()
    }

    /// Channel to the server with default options
    pub fn channel(&self, connection_type: ConnectionType) -> Channel {
        self.channel_with(ChannelOptions {
            connection_type,
            ..ChannelOptions::default()
        })
    }

    /// Channel to the server with custom options
    pub fn channel_with(&self, options: ChannelOptions) -> Channel {
        Channel::new(self.addr, options).expect("valid channel options")
    }

    /// Stop the server, then tear the catalog down
    ///
    /// # Errors
    ///
    /// Returns an error if the server task failed or the catalog is still
    /// shared elsewhere.
    pub async fn shutdown(self) -> anyhow::Result<(ServerReport, TeardownReport)> {
        let _ = self.stop.send(());
        let report = self.server.await??;

        drop(self.responder);
        let catalog = Arc::try_unwrap(self.catalog)
            .ok()
            .context("catalog still shared after shutdown")?;

        Ok((report, catalog.teardown()))
    }
}

/// Write `<dir>/<key>.npcbuf`
///
/// # Errors
///
/// Returns an error if the file cannot be written.
pub fn write_catalog_file(dir: &Path, key: &str, contents: &[u8]) -> std::io::Result<()> {
    fs::write(dir.join(format!("{key}.{DEFAULT_EXTENSION}")), contents)
}
