use crate::error::TransportResult;
use crate::options::ServerOptions;
use crate::server::{Server, ServerReport};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use transfile_core::{Catalog, LocalRegistrar, TransferResponder};

/// Responder over two files: `20230101` -> "AAA", `20230301` -> "BBB"
pub(crate) fn example_responder() -> Arc<TransferResponder> {
    let catalog = Catalog::from_parts(
        [("20230101", "AAA"), ("20230301", "BBB")],
        Arc::new(LocalRegistrar::new()),
    )
    .unwrap();
    Arc::new(TransferResponder::new(Arc::new(catalog)))
}

pub(crate) async fn spawn_server(
    responder: Arc<TransferResponder>,
) -> (
    SocketAddr,
    oneshot::Sender<()>,
    JoinHandle<TransportResult<ServerReport>>,
) {
    let options = ServerOptions {
        shutdown_grace: Duration::from_secs(2),
        ..ServerOptions::default()
    };
    let server = Server::bind("127.0.0.1:0".parse().unwrap(), responder, options)
        .await
        .unwrap();
    let addr = server.local_addr();

    let (tx, rx) = oneshot::channel();
    let handle = tokio::spawn(server.run_until(async {
        let _ = rx.await;
    }));
    (addr, tx, handle)
}
