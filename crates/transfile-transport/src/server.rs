//! TCP server dispatching `TransferFile` calls to a [`TransferResponder`].
//!
//! One task per connection reads frames; every request is handled in its
//! own task so calls multiplexed on one connection are served concurrently
//! on the runtime's worker pool. Responses go through a per-connection
//! writer task, attachments written straight from the catalog buffer.
//!
//! At most `MAX_IN_FLIGHT` requests per connection are being handled at
//! once. A client that stops reading responses stalls its own reader
//! instead of piling up handler tasks. Requests never carry an attachment;
//! a frame announcing one drops the connection before anything is
//! allocated for it.
//!
//! Shutdown stops accepting, tells every connection to stop reading, then
//! waits (bounded by `shutdown_grace`) for in-flight responses to be
//! written. Only after [`Server::run_until`] returns may the catalog be torn
//! down.

use crate::error::{TransportError, TransportResult};
use crate::frame::{
    Body, ERROR_BAD_REQUEST, ERROR_UNKNOWN_METHOD, Envelope, read_frame_limited, write_frame,
};
use crate::options::ServerOptions;
use socket2::{Domain, Protocol, Socket, Type};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Semaphore, mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use transfile_core::{FileView, TRANSFER_METHOD, TransferResponder};

/// Responses queued per connection before handlers wait on the writer
const RESPONSE_QUEUE_DEPTH: usize = 64;

/// Requests handled concurrently per connection before the reader waits
const MAX_IN_FLIGHT: usize = 64;

/// Largest attachment accepted on an incoming request
const MAX_REQUEST_ATTACHMENT: u64 = 0;

/// Summary returned when the server stops
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServerReport {
    /// Connections accepted over the server's lifetime
    pub connections: u64,
    /// Connections still open when the grace period expired
    pub aborted: usize,
}

/// A response waiting for the connection writer
struct Outgoing {
    envelope: Envelope,
    attachment: Option<FileView>,
}

/// Transfile RPC server
pub struct Server {
    listener: TcpListener,
    local_addr: SocketAddr,
    responder: Arc<TransferResponder>,
    options: ServerOptions,
}

impl Server {
    /// Bind a listener on `addr`.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::BindFailed` if the socket cannot be created,
    /// bound or put into listening mode.
    pub async fn bind(
        addr: SocketAddr,
        responder: Arc<TransferResponder>,
        options: ServerOptions,
    ) -> TransportResult<Self> {
        let bind_failed = |source| TransportError::BindFailed { addr, source };

        let domain = if addr.is_ipv4() {
            Domain::IPV4
        } else {
            Domain::IPV6
        };
        let socket =
            Socket::new(domain, Type::STREAM, Some(Protocol::TCP)).map_err(bind_failed)?;
        socket.set_reuse_address(true).map_err(bind_failed)?;
        socket.bind(&addr.into()).map_err(bind_failed)?;
        socket.listen(options.backlog).map_err(bind_failed)?;
        socket.set_nonblocking(true).map_err(bind_failed)?;

        let std_listener: std::net::TcpListener = socket.into();
        let listener = TcpListener::from_std(std_listener).map_err(bind_failed)?;
        let local_addr = listener.local_addr()?;

        Ok(Self {
            listener,
            local_addr,
            responder,
            options,
        })
    }

    /// Address the listener is bound to
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Serve until `shutdown` resolves, then drain open connections.
    ///
    /// # Errors
    ///
    /// Currently infallible once bound; accept errors are logged and the
    /// loop continues.
    pub async fn run_until<F>(self, shutdown: F) -> TransportResult<ServerReport>
    where
        F: Future<Output = ()>,
    {
        let (stop_tx, stop_rx) = watch::channel(false);
        let limit = Arc::new(Semaphore::new(self.options.max_connections));
        let mut connections = JoinSet::new();
        let mut report = ServerReport::default();
        tokio::pin!(shutdown);

        info!(addr = %self.local_addr, "server listening");

        loop {
            let permit = tokio::select! {
                () = &mut shutdown => break,
                permit = Arc::clone(&limit).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let (stream, peer) = tokio::select! {
                () = &mut shutdown => break,
                accepted = self.listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        warn!(error = %err, "accept failed");
                        continue;
                    }
                },
            };

            while connections.try_join_next().is_some() {}

            report.connections += 1;
            debug!(%peer, "connection accepted");

            let responder = Arc::clone(&self.responder);
            let stop = stop_rx.clone();
            connections.spawn(async move {
                let _permit = permit;
                serve_connection(stream, peer, responder, stop).await;
            });
        }

        drop(self.listener);
        stop_tx.send_replace(true);
        info!(open = connections.len(), "server stopping");

        let drain = async { while connections.join_next().await.is_some() {} };
        if tokio::time::timeout(self.options.shutdown_grace, drain)
            .await
            .is_err()
        {
            report.aborted = connections.len();
            warn!(
                aborted = report.aborted,
                "grace period expired with connections open"
            );
            connections.shutdown().await;
        }

        let stats = self.responder.stats();
        info!(
            connections = report.connections,
            hits = stats.hits,
            misses = stats.misses,
            "server stopped"
        );
        Ok(report)
    }
}

/// Read requests from one connection until it closes or the server stops
async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    responder: Arc<TransferResponder>,
    mut stop: watch::Receiver<bool>,
) {
    if let Err(err) = stream.set_nodelay(true) {
        debug!(%peer, error = %err, "cannot set TCP_NODELAY");
    }
    let (mut reader, mut writer) = stream.into_split();
    let (tx, mut rx) = mpsc::channel::<Outgoing>(RESPONSE_QUEUE_DEPTH);
    let in_flight = Arc::new(Semaphore::new(MAX_IN_FLIGHT));

    let writer_task = tokio::spawn(async move {
        while let Some(outgoing) = rx.recv().await {
            if let Err(err) =
                write_frame(&mut writer, &outgoing.envelope, outgoing.attachment.as_ref()).await
            {
                warn!(%peer, error = %err, "cannot write response");
                break;
            }
        }
    });

    loop {
        let permit = tokio::select! {
            () = stopped(&mut stop) => break,
            permit = Arc::clone(&in_flight).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let frame = tokio::select! {
            () = stopped(&mut stop) => break,
            frame = read_frame_limited(&mut reader, MAX_REQUEST_ATTACHMENT) => frame,
        };

        match frame {
            Ok(Some(frame)) => {
                let responder = Arc::clone(&responder);
                let tx = tx.clone();
                tokio::spawn(async move {
                    let outgoing = dispatch(&responder, frame.envelope);
                    // Fails only when the writer is gone, i.e. the connection is closing
                    let _ = tx.send(outgoing).await;
                    drop(permit);
                });
            }
            Ok(None) => {
                debug!(%peer, "connection closed by peer");
                break;
            }
            Err(err) => {
                warn!(%peer, error = %err, "dropping connection after bad frame");
                break;
            }
        }
    }

    // The writer finishes once every handler has queued its response
    drop(tx);
    let _ = writer_task.await;
}

async fn stopped(stop: &mut watch::Receiver<bool>) {
    let _ = stop.wait_for(|stopped| *stopped).await;
}

/// Route one envelope to the responder
fn dispatch(responder: &TransferResponder, envelope: Envelope) -> Outgoing {
    let call_id = envelope.call_id;

    match envelope.body {
        Body::Request { method, request } if method == TRANSFER_METHOD => {
            let (response, attachment) = responder.handle_wire(request);
            Outgoing {
                envelope: Envelope {
                    call_id,
                    body: Body::Response { response },
                },
                attachment,
            }
        }
        Body::Request { method, .. } => {
            warn!(call_id, %method, "unknown method");
            rejection(call_id, ERROR_UNKNOWN_METHOD, format!("unknown method: {method}"))
        }
        Body::Response { .. } | Body::Error { .. } => {
            rejection(call_id, ERROR_BAD_REQUEST, "expected a request".to_string())
        }
    }
}

fn rejection(call_id: u64, code: u16, message: String) -> Outgoing {
    Outgoing {
        envelope: Envelope {
            call_id,
            body: Body::Error { code, message },
        },
        attachment: None,
    }
}
