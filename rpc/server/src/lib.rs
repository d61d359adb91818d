//! RPC server.
//!
//! Serves framed RPC over raw TCP ([`Server::serve`]) or tunneled through an
//! HTTP CONNECT upgrade ([`Server::serve_http`]). Each connection performs
//! one handshake, then carries any number of concurrent calls; responses
//! are written whole, so frames from different calls never interleave.
//!
//! # Example
//!
//! ```no_run
//! use rpc_server::{Server, Service};
//! use serde::{Deserialize, Serialize};
//! use std::sync::Arc;
//!
//! #[derive(Serialize, Deserialize)]
//! struct Args { num1: i32, num2: i32 }
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let server = Arc::new(Server::new());
//! server.register(
//!     Service::builder("Arith")
//!         .method("Sum", |args: Args| async move { Ok(args.num1 + args.num2) })
//!         .build(),
//! )?;
//!
//! let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
//! server.serve(listener).await;
//! # Ok(())
//! # }
//! ```

mod http;
mod metrics;
mod service;

pub use http::{CONNECTED_STATUS, DEFAULT_DEBUG_PATH, DEFAULT_RPC_PATH};
pub use service::{BoxError, MethodError, Service, ServiceBuilder};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::RwLock;
use protocol_wire::{ContentType, Handshake, Header, WireReader, WireWriter};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::service::ErasedMethod;

/// Handle timeout applied when the handshake leaves it unset.
pub const DEFAULT_HANDLE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("service already defined: {0}")]
    DuplicateService(String),
    #[error("service/method request ill-formed: {0}")]
    IllFormedMethod(String),
    #[error("can't find service {0}")]
    UnknownService(String),
    #[error("can't find method {0}")]
    UnknownMethod(String),
}

/// An RPC server hosting a set of registered services.
///
/// Cheap to share: wrap it in an `Arc` and hand clones to every listener
/// task. All entry points are safe for concurrent callers.
pub struct Server {
    services: RwLock<HashMap<String, Arc<Service>>>,
}

impl Default for Server {
    fn default() -> Self {
        Self::new()
    }
}

impl Server {
    pub fn new() -> Self {
        Self {
            services: RwLock::new(HashMap::new()),
        }
    }

    /// Register a service. Duplicate names are a hard error.
    pub fn register(&self, service: Service) -> Result<(), ServerError> {
        let mut services = self.services.write();
        let name = service.name().to_string();
        if services.contains_key(&name) {
            return Err(ServerError::DuplicateService(name));
        }
        services.insert(name, Arc::new(service));
        Ok(())
    }

    /// Snapshot of registered services, sorted by name.
    pub fn services(&self) -> Vec<Arc<Service>> {
        let mut services: Vec<_> = self.services.read().values().cloned().collect();
        services.sort_by(|a, b| a.name().cmp(b.name()));
        services
    }

    /// Resolve a `Service.Method` string.
    fn find(
        &self,
        service_method: &str,
    ) -> Result<(Arc<Service>, Arc<dyn ErasedMethod>), ServerError> {
        let Some((service_name, method_name)) = service_method.rsplit_once('.') else {
            return Err(ServerError::IllFormedMethod(service_method.to_string()));
        };
        let service = self
            .services
            .read()
            .get(service_name)
            .cloned()
            .ok_or_else(|| ServerError::UnknownService(service_name.to_string()))?;
        let method = service
            .method(method_name)
            .cloned()
            .ok_or_else(|| ServerError::UnknownMethod(method_name.to_string()))?;
        Ok((service, method))
    }

    /// Accept connections on `listener` and serve each in its own task.
    ///
    /// Runs until the listener fails.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) {
        match listener.local_addr() {
            Ok(addr) => info!(%addr, "rpc server listening"),
            Err(_) => info!("rpc server listening"),
        }
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    metrics::CONNECTIONS_ACCEPTED.increment();
                    let server = Arc::clone(&self);
                    tokio::spawn(async move {
                        metrics::CONNECTIONS_ACTIVE.increment();
                        server.serve_conn(stream).await;
                        metrics::CONNECTIONS_ACTIVE.decrement();
                        debug!(%peer, "connection closed");
                    });
                }
                Err(err) => {
                    error!(%err, "accept error");
                    return;
                }
            }
        }
    }

    /// Serve one already-established stream: handshake, then the call loop.
    ///
    /// Handshake failures (bad magic, undecodable frame) are fatal to the
    /// connection and produce no response.
    pub async fn serve_conn<S>(self: Arc<Self>, stream: S)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (mut read_half, write_half) = tokio::io::split(stream);
        let handshake = match Handshake::read_from(&mut read_half).await {
            Ok(handshake) => handshake,
            Err(err) => {
                warn!(%err, "handshake rejected");
                return;
            }
        };
        let content_type = handshake.content_type;
        let handle_timeout = match handshake.handle_timeout_ms {
            0 => DEFAULT_HANDLE_TIMEOUT,
            ms => Duration::from_millis(ms),
        };

        let mut reader = WireReader::new(read_half, content_type);
        let writer = Arc::new(tokio::sync::Mutex::new(WireWriter::new(
            write_half,
            content_type,
        )));
        let mut inflight = JoinSet::new();

        loop {
            let header = match reader.read_header().await {
                Ok(Some(header)) => header,
                Ok(None) => break,
                Err(err) => {
                    warn!(%err, "read header error");
                    break;
                }
            };
            // The body frame always follows the header; read it even when
            // the method lookup fails so the stream stays aligned.
            let argv = match reader.read_body().await {
                Ok(argv) => argv,
                Err(err) => {
                    warn!(%err, seq = header.seq, "read body error");
                    let response = Header {
                        service_method: header.service_method,
                        seq: header.seq,
                        error: format!("reading body: {err}"),
                    };
                    send_response(&writer, &response, &[]).await;
                    break;
                }
            };

            metrics::REQUESTS.increment();
            let method = match self.find(&header.service_method) {
                Ok((_service, method)) => method,
                Err(err) => {
                    metrics::REQUEST_ERRORS.increment();
                    let response = Header {
                        service_method: header.service_method,
                        seq: header.seq,
                        error: format!("rpc server: {err}"),
                    };
                    send_response(&writer, &response, &[]).await;
                    continue;
                }
            };

            let writer = Arc::clone(&writer);
            inflight.spawn(async move {
                handle_request(method, content_type, header, argv, handle_timeout, writer).await;
            });
        }

        // Let in-flight dispatches finish before the connection drops.
        while inflight.join_next().await.is_some() {}
        let _ = writer.lock().await.shutdown().await;
    }
}

/// Run one dispatch, racing it against the handle timeout.
async fn handle_request<W>(
    method: Arc<dyn ErasedMethod>,
    content_type: ContentType,
    header: Header,
    argv: Bytes,
    handle_timeout: Duration,
    writer: Arc<tokio::sync::Mutex<WireWriter<W>>>,
) where
    W: AsyncWrite + Send + Unpin,
{
    let call = method.call(content_type, argv);
    match tokio::time::timeout(handle_timeout, call).await {
        Ok(Ok(reply)) => {
            let response = Header {
                service_method: header.service_method,
                seq: header.seq,
                error: String::new(),
            };
            send_response(&writer, &response, &reply).await;
        }
        Ok(Err(err)) => {
            metrics::REQUEST_ERRORS.increment();
            let response = Header {
                service_method: header.service_method,
                seq: header.seq,
                error: format!("rpc server: {err}"),
            };
            send_response(&writer, &response, &[]).await;
        }
        // Timeout: the dispatch future is dropped and its result discarded.
        Err(_elapsed) => {
            metrics::REQUEST_TIMEOUTS.increment();
            let response = Header {
                service_method: header.service_method,
                seq: header.seq,
                error: format!(
                    "rpc server: request handle timeout: expect within {handle_timeout:?}"
                ),
            };
            send_response(&writer, &response, &[]).await;
        }
    }
}

/// Write one response under the sending lock so frames never interleave.
async fn send_response<W>(
    writer: &Arc<tokio::sync::Mutex<WireWriter<W>>>,
    header: &Header,
    body: &[u8],
) where
    W: AsyncWrite + Send + Unpin,
{
    let mut writer = writer.lock().await;
    if let Err(err) = writer.write(header, body).await {
        warn!(%err, seq = header.seq, "write response error");
    }
}
