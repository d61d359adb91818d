//! Load-balanced RPC client.
//!
//! An [`XClient`] sits on top of a [`Discovery`] backend: every call picks a
//! live server by the configured [`SelectMode`], reuses a pooled connection
//! to it (dialing one on demand), and delegates. [`XClient::broadcast`]
//! fans a call out to every known server, cancelling the stragglers as soon
//! as one of them fails.

mod discovery;

pub use discovery::{
    DEFAULT_UPDATE_TIMEOUT, Discovery, DiscoveryError, RegistryDiscovery, SelectMode,
    StaticDiscovery,
};

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use protocol_wire::Handshake;
use rpc_client::{Client, ClientError};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug, Clone, thiserror::Error)]
pub enum XClientError {
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),
    #[error(transparent)]
    Client(#[from] ClientError),
    #[error("broadcast cancelled after another server failed")]
    Cancelled,
}

struct XClientInner {
    discovery: Arc<dyn Discovery>,
    mode: SelectMode,
    opts: Handshake,
    clients: tokio::sync::Mutex<HashMap<String, Client>>,
}

/// A client that spreads calls over the servers a [`Discovery`] reports.
///
/// Clones share the connection pool.
#[derive(Clone)]
pub struct XClient {
    inner: Arc<XClientInner>,
}

impl XClient {
    pub fn new(discovery: Arc<dyn Discovery>, mode: SelectMode, opts: Handshake) -> Self {
        Self {
            inner: Arc::new(XClientInner {
                discovery,
                mode,
                opts,
                clients: tokio::sync::Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Close and drop every pooled connection.
    pub async fn close(&self) {
        let mut clients = self.inner.clients.lock().await;
        for (addr, client) in clients.drain() {
            debug!(addr, "closing pooled client");
            let _ = client.close().await;
        }
    }

    /// Fetch a pooled client for `rpc_addr`, dialing if the cached one is
    /// gone or no longer usable.
    async fn dial(&self, rpc_addr: &str) -> Result<Client, XClientError> {
        let mut clients = self.inner.clients.lock().await;
        if let Some(client) = clients.get(rpc_addr) {
            if client.is_available() {
                return Ok(client.clone());
            }
            let stale = clients.remove(rpc_addr).expect("checked above");
            let _ = stale.close().await;
        }
        let client = Client::xdial(rpc_addr, &self.inner.opts).await?;
        clients.insert(rpc_addr.to_string(), client.clone());
        Ok(client)
    }

    async fn call_addr(
        &self,
        rpc_addr: &str,
        service_method: &str,
        body: Bytes,
    ) -> Result<Bytes, XClientError> {
        let client = self.dial(rpc_addr).await?;
        Ok(client.call_raw(service_method, body).await?)
    }

    /// Call `service_method` on one discovered server.
    pub async fn call<A, R>(&self, service_method: &str, args: &A) -> Result<R, XClientError>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        let rpc_addr = self.inner.discovery.get(self.inner.mode).await?;
        let body = self
            .inner
            .opts
            .content_type
            .encode(args)
            .map_err(|e| ClientError::Encode(e.to_string()))?;
        let reply = self
            .call_addr(&rpc_addr, service_method, Bytes::from(body))
            .await?;
        Ok(self
            .inner
            .opts
            .content_type
            .decode(&reply)
            .map_err(|e| ClientError::Decode(e.to_string()))?)
    }

    /// Call `service_method` on every discovered server.
    ///
    /// The first failure cancels all still-running calls and becomes the
    /// result. Otherwise the reply of whichever server answered first is
    /// returned; with several successes the choice is non-deterministic.
    pub async fn broadcast<A, R>(&self, service_method: &str, args: &A) -> Result<R, XClientError>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        let servers = self.inner.discovery.get_all().await?;
        if servers.is_empty() {
            return Err(DiscoveryError::NoServers.into());
        }
        let body = Bytes::from(
            self.inner
                .opts
                .content_type
                .encode(args)
                .map_err(|e| ClientError::Encode(e.to_string()))?,
        );

        let cancel = CancellationToken::new();
        let mut tasks = JoinSet::new();
        for rpc_addr in servers {
            let this = self.clone();
            let service_method = service_method.to_string();
            let body = body.clone();
            let cancel = cancel.clone();
            tasks.spawn(async move {
                tokio::select! {
                    _ = cancel.cancelled() => Err(XClientError::Cancelled),
                    result = this.call_addr(&rpc_addr, &service_method, body) => result,
                }
            });
        }

        // First error wins and stops the rest; otherwise keep the first
        // successful reply. Every task is awaited before returning.
        let mut first_error: Option<XClientError> = None;
        let mut first_reply: Option<Bytes> = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(reply)) => {
                    if first_reply.is_none() {
                        first_reply = Some(reply);
                    }
                }
                Ok(Err(XClientError::Cancelled)) => {}
                Ok(Err(err)) => {
                    if first_error.is_none() {
                        first_error = Some(err);
                        cancel.cancel();
                    }
                }
                Err(join_err) => {
                    if first_error.is_none() {
                        first_error = Some(
                            ClientError::Remote(format!("broadcast task failed: {join_err}"))
                                .into(),
                        );
                        cancel.cancel();
                    }
                }
            }
        }

        if let Some(err) = first_error {
            return Err(err);
        }
        let reply = first_reply.ok_or(XClientError::Cancelled)?;
        Ok(self
            .inner
            .opts
            .content_type
            .decode(&reply)
            .map_err(|e| ClientError::Decode(e.to_string()))?)
    }
}
