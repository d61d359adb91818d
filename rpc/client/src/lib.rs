//! RPC client.
//!
//! A [`Client`] owns one connection. Calls are identified by strictly
//! increasing sequence numbers; a background receive task routes each
//! response to the pending call that issued it, so any number of calls can
//! be in flight concurrently on one connection.
//!
//! # Example
//!
//! ```no_run
//! use protocol_wire::Handshake;
//! use rpc_client::Client;
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize, Deserialize)]
//! struct Args { num1: i32, num2: i32 }
//!
//! # async fn example() -> Result<(), rpc_client::ClientError> {
//! let client = Client::dial("127.0.0.1:9999", &Handshake::default()).await?;
//! let sum: i32 = client.call("Arith.Sum", &Args { num1: 3, num2: 4 }).await?;
//! assert_eq!(sum, 7);
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use protocol_wire::{ContentType, Handshake, Header, WireReader, WireWriter};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, WriteHalf};
use tokio::net::{TcpStream, UnixStream};
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tracing::{debug, warn};

/// Errors surfaced by client calls.
///
/// Cloneable because a single transport failure fans out to every pending
/// call.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ClientError {
    #[error("connection is shut down")]
    Shutdown,
    #[error("connect timeout: expect within {0:?}")]
    ConnectTimeout(Duration),
    #[error("wrong address format {0:?}, expect protocol@addr")]
    InvalidAddress(String),
    #[error("unsupported protocol {0:?}")]
    UnsupportedProtocol(String),
    #[error("unexpected HTTP response: {0}")]
    UnexpectedHttpResponse(String),
    #[error("io error: {0}")]
    Io(Arc<std::io::Error>),
    #[error("{0}")]
    Remote(String),
    #[error("encode error: {0}")]
    Encode(String),
    #[error("reading body: {0}")]
    Decode(String),
    #[error("call dropped before completion")]
    Dropped,
}

impl From<std::io::Error> for ClientError {
    fn from(err: std::io::Error) -> Self {
        ClientError::Io(Arc::new(err))
    }
}

impl From<protocol_wire::WireError> for ClientError {
    fn from(err: protocol_wire::WireError) -> Self {
        match err {
            protocol_wire::WireError::Io(err) => ClientError::Io(Arc::new(err)),
            other => ClientError::Remote(other.to_string()),
        }
    }
}

type PendingResult = Result<Bytes, ClientError>;

struct ClientState {
    /// Next sequence number to assign. Starts at 1; 0 never identifies a
    /// live call.
    seq: u64,
    pending: HashMap<u64, oneshot::Sender<PendingResult>>,
    /// Set by [`Client::close`].
    closing: bool,
    /// Set when the receive task dies.
    shutdown: bool,
}

struct ClientInner {
    state: Mutex<ClientState>,
    /// The sending lock: requests and the final shutdown are serialized
    /// through it so a frame is never torn.
    writer: tokio::sync::Mutex<WireWriter<WriteHalf<Box<dyn Stream>>>>,
    content_type: ContentType,
    recv_abort: OnceLock<AbortHandle>,
}

/// Object-safe alias for the transports a client can run over.
trait Stream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<S: AsyncRead + AsyncWrite + Send + Unpin> Stream for S {}

/// An RPC client over one connection.
///
/// Clones share the connection; the client is safe for concurrent callers.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client").finish_non_exhaustive()
    }
}

impl Client {
    /// Build a client over an established stream: write the handshake, then
    /// start the receive task.
    pub async fn with_stream<S>(stream: S, opts: &Handshake) -> Result<Self, ClientError>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let boxed: Box<dyn Stream> = Box::new(stream);
        let (read_half, mut write_half) = tokio::io::split(boxed);
        opts.write_to(&mut write_half).await?;

        let inner = Arc::new(ClientInner {
            state: Mutex::new(ClientState {
                seq: 1,
                pending: HashMap::new(),
                closing: false,
                shutdown: false,
            }),
            writer: tokio::sync::Mutex::new(WireWriter::new(write_half, opts.content_type)),
            content_type: opts.content_type,
            recv_abort: OnceLock::new(),
        });

        let reader = WireReader::new(read_half, opts.content_type);
        let recv_inner = Arc::clone(&inner);
        let handle = tokio::spawn(receive_loop(recv_inner, reader));
        let _ = inner.recv_abort.set(handle.abort_handle());

        Ok(Self { inner })
    }

    /// Dial a TCP server. The handshake's connect timeout bounds both the
    /// dial and the handshake write; zero disables the bound.
    pub async fn dial(addr: &str, opts: &Handshake) -> Result<Self, ClientError> {
        let connect = async {
            let stream = TcpStream::connect(addr).await?;
            Self::with_stream(stream, opts).await
        };
        bound_by_connect_timeout(opts, connect).await
    }

    /// Dial an RPC server reached through an HTTP CONNECT upgrade.
    pub async fn dial_http(addr: &str, opts: &Handshake) -> Result<Self, ClientError> {
        let connect = async {
            let mut stream = TcpStream::connect(addr).await?;
            http_connect(&mut stream).await?;
            Self::with_stream(stream, opts).await
        };
        bound_by_connect_timeout(opts, connect).await
    }

    /// Dial a `protocol@addr` style address.
    ///
    /// `http` tunnels through HTTP CONNECT; `tcp` and `unix` dial directly.
    pub async fn xdial(rpc_addr: &str, opts: &Handshake) -> Result<Self, ClientError> {
        let Some((protocol, addr)) = rpc_addr.split_once('@') else {
            return Err(ClientError::InvalidAddress(rpc_addr.to_string()));
        };
        match protocol {
            "http" => Self::dial_http(addr, opts).await,
            "tcp" => Self::dial(addr, opts).await,
            "unix" => {
                let connect = async {
                    let stream = UnixStream::connect(addr).await?;
                    Self::with_stream(stream, opts).await
                };
                bound_by_connect_timeout(opts, connect).await
            }
            other => Err(ClientError::UnsupportedProtocol(other.to_string())),
        }
    }

    /// Whether the client can still issue calls.
    pub fn is_available(&self) -> bool {
        let state = self.inner.state.lock();
        !state.closing && !state.shutdown
    }

    /// Start a call without waiting for its result.
    ///
    /// The sequence number is assigned here, so call order matches sequence
    /// order. The framed send happens on a background task; a send failure
    /// resolves the returned [`Call`] with the error.
    pub fn go<A: Serialize>(&self, service_method: &str, args: &A) -> Call {
        match self.inner.content_type.encode(args) {
            Ok(body) => self.go_raw(service_method, Bytes::from(body)),
            Err(err) => Call::failed(
                service_method,
                self.inner.content_type,
                ClientError::Encode(err.to_string()),
            ),
        }
    }

    /// Call a remote method and decode its reply.
    ///
    /// Resolves when the response arrives or the connection dies. Callers
    /// with a deadline wrap this in `tokio::time::timeout`; cancelling the
    /// future removes the pending entry, and a response arriving later is
    /// discarded.
    pub async fn call<A, R>(&self, service_method: &str, args: &A) -> Result<R, ClientError>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        self.go(service_method, args).recv().await
    }

    /// Call a remote method with a pre-encoded argument body, returning the
    /// raw reply body.
    pub async fn call_raw(
        &self,
        service_method: &str,
        body: Bytes,
    ) -> Result<Bytes, ClientError> {
        self.go_raw(service_method, body).recv_raw().await
    }

    /// [`Client::go`] with a pre-encoded argument body.
    pub fn go_raw(&self, service_method: &str, body: Bytes) -> Call {
        let (tx, rx) = oneshot::channel();
        let seq = {
            let mut state = self.inner.state.lock();
            if state.closing || state.shutdown {
                return Call::failed(
                    service_method,
                    self.inner.content_type,
                    ClientError::Shutdown,
                );
            }
            let seq = state.seq;
            state.seq += 1;
            state.pending.insert(seq, tx);
            seq
        };
        let header = Header {
            service_method: service_method.to_string(),
            seq,
            error: String::new(),
        };
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let mut writer = inner.writer.lock().await;
            if let Err(err) = writer.write(&header, &body).await {
                drop(writer);
                // The receive task may already have resolved this seq from a
                // partial write; only signal if it is still pending.
                if let Some(tx) = inner.state.lock().pending.remove(&seq) {
                    let _ = tx.send(Err(err.into()));
                }
            }
        });
        Call {
            seq,
            service_method: service_method.to_string(),
            content_type: self.inner.content_type,
            rx: Some(rx),
            pending: Some(Arc::clone(&self.inner)),
        }
    }

    /// Close the connection.
    ///
    /// A second close reports [`ClientError::Shutdown`]. Pending calls are
    /// failed with the same error.
    pub async fn close(&self) -> Result<(), ClientError> {
        {
            let mut state = self.inner.state.lock();
            if state.closing {
                return Err(ClientError::Shutdown);
            }
            state.closing = true;
        }
        if let Some(abort) = self.inner.recv_abort.get() {
            abort.abort();
        }
        let mut writer = self.inner.writer.lock().await;
        let _ = writer.shutdown().await;
        drop(writer);
        fail_pending(&self.inner, ClientError::Shutdown);
        Ok(())
    }
}

/// Resolve every pending call with `err`.
fn fail_pending(inner: &ClientInner, err: ClientError) {
    let pending = {
        let mut state = inner.state.lock();
        state.shutdown = true;
        std::mem::take(&mut state.pending)
    };
    for (_seq, tx) in pending {
        let _ = tx.send(Err(err.clone()));
    }
}

/// Background task routing responses to pending calls.
async fn receive_loop(
    inner: Arc<ClientInner>,
    mut reader: WireReader<tokio::io::ReadHalf<Box<dyn Stream>>>,
) {
    let err = loop {
        let header = match reader.read_header().await {
            Ok(Some(header)) => header,
            Ok(None) => break ClientError::Shutdown,
            Err(err) => break err.into(),
        };
        // Drain the body frame no matter how the header is routed.
        let body = match reader.read_body().await {
            Ok(body) => body,
            Err(err) => break err.into(),
        };

        let sender = inner.state.lock().pending.remove(&header.seq);
        match sender {
            // Usually a partial send: the entry was already removed, the
            // server answered anyway. Drop the body.
            None => debug!(seq = header.seq, "response for unknown call"),
            Some(tx) if !header.error.is_empty() => {
                let _ = tx.send(Err(ClientError::Remote(header.error)));
            }
            Some(tx) => {
                let _ = tx.send(Ok(body));
            }
        }
    };

    // Hold the sending lock so a concurrent `go` cannot register against a
    // connection we are tearing down.
    let _sending = inner.writer.lock().await;
    if !matches!(err, ClientError::Shutdown) {
        warn!(%err, "receive loop terminated");
    }
    fail_pending(&inner, err);
}

/// An in-flight call started by [`Client::go`].
///
/// Dropping a `Call` before it completes removes its pending entry; a
/// response that arrives afterwards is discarded by the receive task.
pub struct Call {
    seq: u64,
    service_method: String,
    content_type: ContentType,
    rx: Option<oneshot::Receiver<PendingResult>>,
    pending: Option<Arc<ClientInner>>,
}

impl Call {
    /// A call that failed before it was ever registered.
    fn failed(service_method: &str, content_type: ContentType, err: ClientError) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(Err(err));
        Self {
            seq: 0,
            service_method: service_method.to_string(),
            content_type,
            rx: Some(rx),
            pending: None,
        }
    }

    /// The sequence number assigned to this call (0 if it failed before
    /// registration).
    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn service_method(&self) -> &str {
        &self.service_method
    }

    /// Await the response body and decode it.
    pub async fn recv<R: DeserializeOwned>(self) -> Result<R, ClientError> {
        let content_type = self.content_type;
        let body = self.recv_raw().await?;
        content_type
            .decode(&body)
            .map_err(|err| ClientError::Decode(err.to_string()))
    }

    /// Await the raw response body.
    pub async fn recv_raw(mut self) -> Result<Bytes, ClientError> {
        let rx = self.rx.take().expect("call awaited twice");
        let result = match rx.await {
            Ok(result) => result,
            // The sender vanished without a value.
            Err(_) => Err(ClientError::Dropped),
        };
        // Completion already removed the entry; disarm the drop cleanup.
        self.pending = None;
        result
    }
}

impl Drop for Call {
    fn drop(&mut self) {
        if let Some(inner) = self.pending.take() {
            inner.state.lock().pending.remove(&self.seq);
        }
    }
}

/// Issue the CONNECT request and verify the fixed success line.
async fn http_connect(stream: &mut TcpStream) -> Result<(), ClientError> {
    stream
        .write_all(
            format!("CONNECT {} HTTP/1.0\r\n\r\n", protocol_wire::DEFAULT_RPC_PATH).as_bytes(),
        )
        .await?;

    // Read the response up to its terminating blank line, byte by byte so
    // no framed bytes are consumed.
    let mut response = Vec::new();
    let mut byte = [0u8; 1];
    while !response.ends_with(b"\n\n") && !response.ends_with(b"\r\n\r\n") {
        if response.len() >= 1024 {
            return Err(ClientError::UnexpectedHttpResponse(
                String::from_utf8_lossy(&response).into_owned(),
            ));
        }
        stream.read_exact(&mut byte).await?;
        response.push(byte[0]);
    }
    let text = String::from_utf8_lossy(&response);
    let status_line = text.lines().next().unwrap_or_default();
    if status_line.trim() == format!("HTTP/1.0 {}", protocol_wire::CONNECTED_STATUS) {
        Ok(())
    } else {
        Err(ClientError::UnexpectedHttpResponse(
            status_line.to_string(),
        ))
    }
}

async fn bound_by_connect_timeout<F>(opts: &Handshake, connect: F) -> Result<Client, ClientError>
where
    F: Future<Output = Result<Client, ClientError>>,
{
    if opts.connect_timeout_ms == 0 {
        return connect.await;
    }
    let limit = Duration::from_millis(opts.connect_timeout_ms);
    match tokio::time::timeout(limit, connect).await {
        Ok(result) => result,
        Err(_elapsed) => Err(ClientError::ConnectTimeout(limit)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol_wire::Handshake;

    /// A hand-rolled peer that echoes whatever body arrives, under the
    /// client's own wire protocol.
    async fn echo_peer(listener: tokio::net::TcpListener) {
        let (stream, _) = listener.accept().await.unwrap();
        let (mut read_half, write_half) = stream.into_split();
        let handshake = Handshake::read_from(&mut read_half).await.unwrap();
        let mut reader = WireReader::new(read_half, handshake.content_type);
        let mut writer = WireWriter::new(write_half, handshake.content_type);
        while let Ok(Some(header)) = reader.read_header().await {
            let body = reader.read_body().await.unwrap();
            let response = Header {
                service_method: header.service_method,
                seq: header.seq,
                error: String::new(),
            };
            writer.write(&response, &body).await.unwrap();
        }
    }

    async fn start_echo_peer() -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(echo_peer(listener));
        addr
    }

    #[tokio::test]
    async fn sequence_numbers_start_at_one_and_increase() {
        let addr = start_echo_peer().await;
        let client = Client::dial(&addr, &Handshake::default()).await.unwrap();

        let calls: Vec<Call> = (0..5)
            .map(|i| client.go("Echo.Echo", &format!("m{i}")))
            .collect();
        let seqs: Vec<u64> = calls.iter().map(Call::seq).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4, 5]);

        for (i, call) in calls.into_iter().enumerate() {
            let reply: String = call.recv().await.unwrap();
            assert_eq!(reply, format!("m{i}"));
        }
    }

    #[tokio::test]
    async fn responses_route_to_their_calls() {
        let addr = start_echo_peer().await;
        let client = Client::dial(&addr, &Handshake::default()).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..16 {
            let client = client.clone();
            handles.push(tokio::spawn(async move {
                let reply: String = client.call("Echo.Echo", &format!("msg-{i}")).await?;
                Ok::<_, ClientError>((i, reply))
            }));
        }
        for handle in handles {
            let (i, reply) = handle.await.unwrap().unwrap();
            assert_eq!(reply, format!("msg-{i}"));
        }
    }

    #[tokio::test]
    async fn close_is_idempotent_only_in_failure() {
        let addr = start_echo_peer().await;
        let client = Client::dial(&addr, &Handshake::default()).await.unwrap();
        assert!(client.is_available());
        client.close().await.unwrap();
        assert!(!client.is_available());
        assert!(matches!(
            client.close().await.unwrap_err(),
            ClientError::Shutdown
        ));
    }

    #[tokio::test]
    async fn calls_after_close_fail_fast() {
        let addr = start_echo_peer().await;
        let client = Client::dial(&addr, &Handshake::default()).await.unwrap();
        client.close().await.unwrap();
        let err = client
            .call::<_, String>("Echo.Echo", &"hello".to_string())
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Shutdown));
    }

    #[tokio::test]
    async fn server_side_errors_reach_the_caller() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (mut read_half, write_half) = stream.into_split();
            let handshake = Handshake::read_from(&mut read_half).await.unwrap();
            let mut reader = WireReader::new(read_half, handshake.content_type);
            let mut writer = WireWriter::new(write_half, handshake.content_type);
            let header = reader.read_header().await.unwrap().unwrap();
            let _body = reader.read_body().await.unwrap();
            let response = Header {
                service_method: header.service_method,
                seq: header.seq,
                error: "rpc server: can't find service Nope".to_string(),
            };
            writer.write(&response, &[]).await.unwrap();
        });

        let client = Client::dial(&addr, &Handshake::default()).await.unwrap();
        let err = client
            .call::<_, String>("Nope.Nope", &"x".to_string())
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Remote(ref m) if m.contains("can't find service")));
    }

    #[tokio::test]
    async fn dropped_call_discards_its_late_response() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (mut read_half, write_half) = stream.into_split();
            let handshake = Handshake::read_from(&mut read_half).await.unwrap();
            let mut reader = WireReader::new(read_half, handshake.content_type);
            let mut writer = WireWriter::new(write_half, handshake.content_type);
            while let Ok(Some(header)) = reader.read_header().await {
                let body = reader.read_body().await.unwrap();
                // Delay beyond the caller's patience.
                tokio::time::sleep(Duration::from_millis(300)).await;
                let response = Header {
                    service_method: header.service_method,
                    seq: header.seq,
                    error: String::new(),
                };
                writer.write(&response, &body).await.unwrap();
            }
        });

        let client = Client::dial(&addr, &Handshake::default()).await.unwrap();
        let first = "first".to_string();
        let slow = client.call::<_, String>("Echo.Echo", &first);
        let result = tokio::time::timeout(Duration::from_millis(50), slow).await;
        assert!(result.is_err(), "call should have timed out");

        // The connection survives the discarded response and serves the
        // next call normally.
        let reply: String = client.call("Echo.Echo", &"second".to_string()).await.unwrap();
        assert_eq!(reply, "second");
    }

    #[tokio::test]
    async fn xdial_rejects_malformed_addresses() {
        let err = Client::xdial("no-at-sign", &Handshake::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::InvalidAddress(_)));

        let err = Client::xdial("carrier-pigeon@coop:1", &Handshake::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::UnsupportedProtocol(_)));
    }

    #[tokio::test]
    async fn connect_timeout_bounds_a_dead_dial() {
        let opts = Handshake {
            connect_timeout_ms: 50,
            ..Handshake::default()
        };
        // RFC 5737 TEST-NET address: connection attempts hang.
        let err = Client::dial("192.0.2.1:9", &opts).await.unwrap_err();
        assert!(matches!(
            err,
            ClientError::ConnectTimeout(_) | ClientError::Io(_)
        ));
    }
}
