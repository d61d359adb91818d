//! HTTP transport between cache peers.
//!
//! An [`HttpPool`] plays both sides of the peer protocol. As a server it
//! exposes every group in a [`GroupRegistry`] under
//! `GET {base_path}{group}/{key}`, returning the raw value bytes. As a
//! [`PeerPicker`] it routes keys through a consistent-hash ring and hands
//! back an HTTP getter for the owning peer, or `None` when the key belongs
//! to the local node.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use axum::Router;
use axum::extract::{Path, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, info};

use cache_core::{CacheError, GroupRegistry, PeerGetter, PeerPicker};
use cache_ring::HashRing;

/// URL prefix peers serve their groups under.
pub const DEFAULT_BASE_PATH: &str = "/_embercache/";

/// Virtual nodes per peer on the ring.
pub const DEFAULT_REPLICAS: usize = 50;

/// An HTTP pool of cache peers.
///
/// `self_addr` is this node's own base URL (e.g. `http://10.0.0.2:8008`)
/// and must match the address other peers were configured with, otherwise
/// the ring cannot recognize local ownership.
pub struct HttpPool {
    self_addr: String,
    base_path: String,
    groups: Arc<GroupRegistry>,
    http: reqwest::Client,
    state: Mutex<PoolState>,
}

struct PoolState {
    ring: HashRing,
    getters: HashMap<String, Arc<HttpGetter>>,
}

impl HttpPool {
    pub fn new(self_addr: impl Into<String>, groups: Arc<GroupRegistry>) -> Self {
        Self {
            self_addr: self_addr.into(),
            base_path: DEFAULT_BASE_PATH.to_string(),
            groups,
            http: reqwest::Client::new(),
            state: Mutex::new(PoolState {
                ring: HashRing::new(DEFAULT_REPLICAS),
                getters: HashMap::new(),
            }),
        }
    }

    /// Replace the peer set.
    ///
    /// Rebuilds the ring and allocates one HTTP getter per peer, keyed by
    /// the peer's base URL.
    pub fn set_peers<I, S>(&self, peers: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut state = self.state.lock();
        state.ring = HashRing::new(DEFAULT_REPLICAS);
        state.getters.clear();
        for peer in peers {
            let peer = peer.as_ref();
            state.ring.add([peer]);
            state.getters.insert(
                peer.to_string(),
                Arc::new(HttpGetter {
                    base_url: format!("{}{}", peer, self.base_path),
                    http: self.http.clone(),
                }),
            );
        }
        info!(peers = state.getters.len(), "peer set updated");
    }

    /// Build the axum router serving this pool's groups.
    ///
    /// Anything under the base path that does not match the
    /// `{group}/{key}` shape falls through to a 400.
    pub fn router(self: &Arc<Self>) -> Router {
        Router::new()
            .route(
                &format!("{}{{group}}/{{key}}", self.base_path),
                get(serve_value),
            )
            .fallback(|| async { (StatusCode::BAD_REQUEST, "bad request") })
            .with_state(Arc::clone(self))
    }

    /// Serve the pool on `listener` until the task is dropped.
    pub async fn serve(self: Arc<Self>, listener: tokio::net::TcpListener) -> std::io::Result<()> {
        info!(addr = %listener.local_addr()?, self_addr = %self.self_addr, "cache pool listening");
        axum::serve(listener, self.router()).await
    }
}

impl PeerPicker for HttpPool {
    fn pick_peer(&self, key: &str) -> Option<Arc<dyn PeerGetter>> {
        let state = self.state.lock();
        let peer = state.ring.get(key)?;
        if peer == self.self_addr {
            return None;
        }
        debug!(peer, key, "picked remote peer");
        state
            .getters
            .get(peer)
            .map(|getter| Arc::clone(getter) as Arc<dyn PeerGetter>)
    }
}

async fn serve_value(
    State(pool): State<Arc<HttpPool>>,
    Path((group, key)): Path<(String, String)>,
) -> Response {
    let Some(group) = pool.groups.get(&group) else {
        return (StatusCode::NOT_FOUND, format!("no such group: {group}")).into_response();
    };
    match group.get(&key).await {
        Ok(view) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/octet-stream")],
            view.to_vec(),
        )
            .into_response(),
        Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response(),
    }
}

/// HTTP client for a single remote peer.
pub struct HttpGetter {
    base_url: String,
    http: reqwest::Client,
}

#[async_trait]
impl PeerGetter for HttpGetter {
    async fn get(&self, group: &str, key: &str) -> Result<Bytes, CacheError> {
        let mut url = reqwest::Url::parse(&self.base_url)
            .map_err(|e| CacheError::Peer(format!("bad peer url {}: {e}", self.base_url)))?;
        url.path_segments_mut()
            .map_err(|_| CacheError::Peer(format!("bad peer url {}", self.base_url)))?
            .pop_if_empty()
            .push(group)
            .push(key);

        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| CacheError::Peer(e.to_string()))?;
        if !response.status().is_success() {
            return Err(CacheError::Peer(format!(
                "peer returned {}",
                response.status()
            )));
        }
        response
            .bytes()
            .await
            .map_err(|e| CacheError::Peer(format!("reading peer response: {e}")))
    }
}
