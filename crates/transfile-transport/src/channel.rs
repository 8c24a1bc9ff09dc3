//! Client channel implementing [`RpcChannel`] over TCP.
//!
//! The connection strategy follows [`ConnectionType`]:
//!
//! - `Single`: one lazily opened connection shared by every call. Requests
//!   are tagged with a call id and a background reader routes each response
//!   to the waiting call. A closed connection is replaced on the next call,
//!   as is one a timed-out call abandoned in the middle of a request.
//! - `Pooled`: a connection per concurrent call, returned to an idle list
//!   afterwards.
//! - `Short`: a fresh connection per call.
//!
//! Every call is bounded by [`ChannelOptions::timeout`], which covers
//! connecting, sending and receiving. Calls are never retried.

use crate::error::TransportResult;
use crate::frame::{Body, Envelope, Frame, read_frame, write_frame};
use crate::options::{ChannelOptions, ConnectionType};
use async_trait::async_trait;
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Mutex, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};
use transfile_core::{CallError, FileRequest, Reply, RpcChannel, TRANSFER_METHOD};

type PendingMap = DashMap<u64, oneshot::Sender<Result<Frame, CallError>>>;

/// TCP client channel to one server
pub struct Channel {
    addr: SocketAddr,
    options: ChannelOptions,
    next_call_id: AtomicU64,
    single: Mutex<Option<Arc<Multiplexed>>>,
    idle: Mutex<Vec<TcpStream>>,
}

impl Channel {
    /// Create a channel. No connection is opened until the first call.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::InvalidConfig` if the options are rejected.
    pub fn new(addr: SocketAddr, options: ChannelOptions) -> TransportResult<Self> {
        options.validate()?;
        Ok(Self {
            addr,
            options,
            next_call_id: AtomicU64::new(1),
            single: Mutex::new(None),
            idle: Mutex::new(Vec::new()),
        })
    }

    /// Server address
    #[must_use]
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Channel options
    #[must_use]
    pub fn options(&self) -> &ChannelOptions {
        &self.options
    }

    async fn call(&self, envelope: Envelope) -> Result<Frame, CallError> {
        match self.options.connection_type {
            ConnectionType::Single => self.call_single(envelope).await,
            ConnectionType::Pooled => self.call_pooled(envelope).await,
            ConnectionType::Short => {
                let mut stream = self.connect().await?;
                exchange(&mut stream, &envelope).await
            }
        }
    }

    async fn call_single(&self, envelope: Envelope) -> Result<Frame, CallError> {
        let call_id = envelope.call_id;

        loop {
            let conn = self.multiplexed().await?;

            let (tx, rx) = oneshot::channel();
            conn.pending.insert(call_id, tx);
            let _guard = PendingGuard {
                pending: Arc::clone(&conn.pending),
                call_id,
            };

            let mut writer = conn.writer.lock().await;
            // The reader marks the connection closed before failing pending
            // calls, so a call registered before this check is always
            // answered. Nothing has been sent yet, so a closed connection is
            // simply replaced.
            if conn.is_closed() {
                continue;
            }

            let unfinished = CloseUnlessFinished::new(&conn.closed);
            let written = write_frame(&mut *writer, &envelope, None).await;
            unfinished.finish();
            drop(writer);

            if let Err(err) = written {
                conn.closed.store(true, Ordering::Release);
                return Err(err.into());
            }
            trace!(call_id, "request sent");

            return rx.await.unwrap_or(Err(CallError::Closed));
        }
    }

    async fn multiplexed(&self) -> Result<Arc<Multiplexed>, CallError> {
        let mut slot = self.single.lock().await;
        if let Some(conn) = slot.as_ref().filter(|conn| !conn.is_closed()) {
            return Ok(Arc::clone(conn));
        }

        let stream = self.connect().await?;
        let conn = Arc::new(Multiplexed::start(stream, self.addr));
        *slot = Some(Arc::clone(&conn));
        Ok(conn)
    }

    async fn call_pooled(&self, envelope: Envelope) -> Result<Frame, CallError> {
        let reused = self.idle.lock().await.pop();
        let mut stream = match reused {
            Some(stream) => stream,
            None => self.connect().await?,
        };

        let frame = exchange(&mut stream, &envelope).await?;

        let mut idle = self.idle.lock().await;
        if idle.len() < self.options.max_idle {
            idle.push(stream);
        }
        Ok(frame)
    }

    async fn connect(&self) -> Result<TcpStream, CallError> {
        let stream = TcpStream::connect(self.addr)
            .await
            .map_err(|e| CallError::Connect(format!("{}: {e}", self.addr)))?;
        stream.set_nodelay(true)?;
        debug!(addr = %self.addr, "connected");
        Ok(stream)
    }
}

#[async_trait]
impl RpcChannel for Channel {
    async fn transfer_file(&self, request: FileRequest) -> Result<Reply, CallError> {
        let call_id = self.next_call_id.fetch_add(1, Ordering::Relaxed);
        let envelope = Envelope {
            call_id,
            body: Body::Request {
                method: TRANSFER_METHOD.to_string(),
                request,
            },
        };

        let timeout = self.options.timeout;
        let frame = tokio::time::timeout(timeout, self.call(envelope))
            .await
            .map_err(|_| CallError::Timeout(timeout))??;

        into_reply(frame)
    }
}

/// Shared connection with responses routed by call id
struct Multiplexed {
    writer: Mutex<OwnedWriteHalf>,
    pending: Arc<PendingMap>,
    closed: Arc<AtomicBool>,
    reader: JoinHandle<()>,
}

impl Multiplexed {
    fn start(stream: TcpStream, addr: SocketAddr) -> Self {
        let (reader, writer) = stream.into_split();
        let pending = Arc::new(PendingMap::new());
        let closed = Arc::new(AtomicBool::new(false));

        let reader = tokio::spawn(read_responses(
            reader,
            addr,
            Arc::clone(&pending),
            Arc::clone(&closed),
        ));

        Self {
            writer: Mutex::new(writer),
            pending,
            closed,
            reader,
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Drop for Multiplexed {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn read_responses(
    mut reader: OwnedReadHalf,
    addr: SocketAddr,
    pending: Arc<PendingMap>,
    closed: Arc<AtomicBool>,
) {
    let failure = loop {
        match read_frame(&mut reader).await {
            Ok(Some(frame)) => {
                let call_id = frame.envelope.call_id;
                match pending.remove(&call_id) {
                    Some((_, tx)) => {
                        let _ = tx.send(Ok(frame));
                    }
                    // The call gave up (timed out) before its response arrived
                    None => debug!(call_id, "response for abandoned call"),
                }
            }
            Ok(None) => break CallError::Closed,
            Err(err) => {
                warn!(%addr, error = %err, "connection failed");
                break CallError::from(err);
            }
        }
    };

    closed.store(true, Ordering::Release);

    let call_ids: Vec<u64> = pending.iter().map(|entry| *entry.key()).collect();
    for call_id in call_ids {
        if let Some((_, tx)) = pending.remove(&call_id) {
            let _ = tx.send(Err(failure.clone()));
        }
    }
    debug!(%addr, "connection closed");
}

/// Removes a call's pending entry however the call ends
struct PendingGuard {
    pending: Arc<PendingMap>,
    call_id: u64,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.pending.remove(&self.call_id);
    }
}

/// Marks a shared connection closed if a write is abandoned part way.
///
/// A cancelled call may leave half a frame on the stream; later calls must
/// not write after it.
struct CloseUnlessFinished<'a> {
    closed: &'a AtomicBool,
    armed: bool,
}

impl<'a> CloseUnlessFinished<'a> {
    fn new(closed: &'a AtomicBool) -> Self {
        Self {
            closed,
            armed: true,
        }
    }

    fn finish(mut self) {
        self.armed = false;
    }
}

impl Drop for CloseUnlessFinished<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.closed.store(true, Ordering::Release);
        }
    }
}

/// One request/response round trip on a dedicated connection
async fn exchange(stream: &mut TcpStream, envelope: &Envelope) -> Result<Frame, CallError> {
    write_frame(stream, envelope, None).await?;
    let frame = read_frame(stream).await?.ok_or(CallError::Closed)?;

    if frame.envelope.call_id != envelope.call_id {
        return Err(CallError::Protocol(format!(
            "response for call {} on call {}",
            frame.envelope.call_id, envelope.call_id
        )));
    }
    Ok(frame)
}

fn into_reply(frame: Frame) -> Result<Reply, CallError> {
    match frame.envelope.body {
        Body::Response { response } => Ok(Reply {
            response,
            attachment: frame.attachment,
        }),
        Body::Error { code, message } => Err(CallError::Remote { code, message }),
        Body::Request { .. } => Err(CallError::Protocol(
            "server sent a request".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{example_responder, spawn_server};
    use std::time::Duration;
    use transfile_core::FileResponse;

    fn options(connection_type: ConnectionType) -> ChannelOptions {
        ChannelOptions {
            connection_type,
            ..ChannelOptions::default()
        }
    }

    fn request(key: &str) -> FileRequest {
        FileRequest {
            datetime_key: key.to_string(),
        }
    }

    async fn hit_and_miss(connection_type: ConnectionType) {
        let (addr, shutdown, server) = spawn_server(example_responder()).await;
        let channel = Channel::new(addr, options(connection_type)).unwrap();

        let hit = channel.transfer_file(request("20230301")).await.unwrap();
        assert_eq!(hit.response, FileResponse::succeeded());
        assert_eq!(hit.attachment, b"BBB");

        let miss = channel.transfer_file(request("20230201")).await.unwrap();
        assert_eq!(miss.response, FileResponse::not_found());
        assert!(miss.attachment.is_empty());

        drop(channel);
        shutdown.send(()).unwrap();
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_single_connection() {
        hit_and_miss(ConnectionType::Single).await;
    }

    #[tokio::test]
    async fn test_pooled_connection() {
        hit_and_miss(ConnectionType::Pooled).await;
    }

    #[tokio::test]
    async fn test_short_connection() {
        hit_and_miss(ConnectionType::Short).await;
    }

    #[tokio::test]
    async fn test_single_connection_is_shared() {
        let (addr, shutdown, server) = spawn_server(example_responder()).await;
        let channel = Arc::new(Channel::new(addr, options(ConnectionType::Single)).unwrap());

        let mut calls = Vec::new();
        for i in 0..32 {
            let channel = Arc::clone(&channel);
            let key = if i % 2 == 0 { "20230101" } else { "20230301" };
            calls.push(tokio::spawn(async move {
                (key, channel.transfer_file(request(key)).await)
            }));
        }
        for call in calls {
            let (key, reply) = call.await.unwrap();
            let expected: &[u8] = if key == "20230101" { b"AAA" } else { b"BBB" };
            assert_eq!(reply.unwrap().attachment, expected);
        }

        drop(channel);
        shutdown.send(()).unwrap();
        let report = server.await.unwrap().unwrap();
        assert_eq!(report.connections, 1);
    }

    #[tokio::test]
    async fn test_timeout_when_server_never_answers() {
        // Accepted by the kernel backlog but never read
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let channel = Channel::new(
            addr,
            ChannelOptions {
                timeout: Duration::from_millis(100),
                ..ChannelOptions::default()
            },
        )
        .unwrap();

        let err = channel.transfer_file(request("20230101")).await.unwrap_err();
        assert_eq!(err, CallError::Timeout(Duration::from_millis(100)));
        drop(listener);
    }

    #[tokio::test]
    async fn test_abandoned_write_retires_single_connection() {
        // Never read, so the socket buffers fill and writes stall mid-frame
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let timeout = Duration::from_millis(200);

        let channel = Arc::new(
            Channel::new(
                addr,
                ChannelOptions {
                    timeout,
                    ..ChannelOptions::default()
                },
            )
            .unwrap(),
        );
        let first = channel.multiplexed().await.unwrap();

        let key = "9".repeat(60_000);
        let mut calls = tokio::task::JoinSet::new();
        for _ in 0..400 {
            let channel = Arc::clone(&channel);
            let key = key.clone();
            calls.spawn(async move { channel.transfer_file(request(&key)).await });
        }
        while let Some(result) = calls.join_next().await {
            assert_eq!(result.unwrap().unwrap_err(), CallError::Timeout(timeout));
        }

        // The call cut off while writing left a partial frame behind
        assert!(first.is_closed());
        let next = channel.multiplexed().await.unwrap();
        assert!(!Arc::ptr_eq(&first, &next));
        drop(listener);
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let addr = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap()
        };
        let channel = Channel::new(addr, options(ConnectionType::Short)).unwrap();

        let err = channel.transfer_file(request("20230101")).await.unwrap_err();
        assert!(matches!(err, CallError::Connect(_)), "{err:?}");
    }

    #[tokio::test]
    async fn test_single_connection_reports_server_close() {
        let (addr, shutdown, server) = spawn_server(example_responder()).await;
        let channel = Channel::new(addr, options(ConnectionType::Single)).unwrap();
        channel.transfer_file(request("20230101")).await.unwrap();

        shutdown.send(()).unwrap();
        server.await.unwrap().unwrap();

        // The old connection is gone and nothing listens any more
        let err = channel.transfer_file(request("20230101")).await.unwrap_err();
        assert!(
            matches!(err, CallError::Closed | CallError::Connect(_)),
            "{err:?}"
        );
    }

    #[test]
    fn test_rejects_unknown_protocol() {
        let result = Channel::new(
            "127.0.0.1:8002".parse().unwrap(),
            ChannelOptions {
                protocol: "baidu_std".to_string(),
                ..ChannelOptions::default()
            },
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_remote_error_reply() {
        let frame = Frame {
            envelope: Envelope {
                call_id: 1,
                body: Body::Error {
                    code: 404,
                    message: "unknown method".to_string(),
                },
            },
            attachment: Vec::new(),
        };
        assert_eq!(
            into_reply(frame),
            Err(CallError::Remote {
                code: 404,
                message: "unknown method".to_string()
            })
        );
    }
}
