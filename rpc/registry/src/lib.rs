//! Server registry with heartbeat-based liveness.
//!
//! A [`Registry`] tracks the RPC servers of a deployment in memory. Servers
//! announce themselves with a POST carrying the [`SERVER_HEADER`] and keep
//! their entry alive by repeating it; clients GET the current live set from
//! the [`SERVERS_HEADER`] response header. Entries whose last beat is older
//! than the TTL are pruned the next time the set is read.
//!
//! [`heartbeat`] is the server-side counterpart: it announces an address
//! immediately and keeps beating on a fixed period until the registry
//! becomes unreachable.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::Router;
use axum::extract::State;
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

/// Path the registry serves under.
pub const DEFAULT_REGISTRY_PATH: &str = "/_ember_/registry";

/// Entries older than this are dead (unless the registry's TTL is zero).
pub const DEFAULT_TTL: Duration = Duration::from_secs(5 * 60);

/// Response header carrying the comma-joined live server list.
pub const SERVERS_HEADER: &str = "x-ember-servers";

/// Request header carrying the announcing server's address.
pub const SERVER_HEADER: &str = "x-ember-server";

/// In-memory set of live servers.
pub struct Registry {
    ttl: Duration,
    servers: Mutex<HashMap<String, Instant>>,
}

impl Registry {
    /// Create a registry. A zero `ttl` means entries never expire.
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            servers: Mutex::new(HashMap::new()),
        }
    }

    /// Insert or refresh a server entry.
    pub fn put_server(&self, addr: &str) {
        let mut servers = self.servers.lock();
        servers.insert(addr.to_string(), Instant::now());
        debug!(addr, "server announced");
    }

    /// The live servers, sorted. Expired entries are removed.
    pub fn alive_servers(&self) -> Vec<String> {
        let mut servers = self.servers.lock();
        let now = Instant::now();
        if !self.ttl.is_zero() {
            servers.retain(|_, last_beat| *last_beat + self.ttl > now);
        }
        let mut alive: Vec<String> = servers.keys().cloned().collect();
        alive.sort();
        alive
    }

    /// Build the axum router serving this registry at
    /// [`DEFAULT_REGISTRY_PATH`].
    pub fn router(self: &Arc<Self>) -> Router {
        Router::new()
            .route(DEFAULT_REGISTRY_PATH, any(handle))
            .with_state(Arc::clone(self))
    }

    /// Serve the registry on `listener` until the task is dropped.
    pub async fn serve(self: Arc<Self>, listener: tokio::net::TcpListener) -> std::io::Result<()> {
        info!(
            addr = %listener.local_addr()?,
            path = DEFAULT_REGISTRY_PATH,
            "registry listening"
        );
        axum::serve(listener, self.router()).await
    }
}

async fn handle(State(registry): State<Arc<Registry>>, method: Method, headers: HeaderMap) -> Response {
    match method {
        Method::GET => {
            let list = registry.alive_servers().join(",");
            ([(SERVERS_HEADER, list)], StatusCode::OK).into_response()
        }
        Method::POST => {
            let Some(addr) = headers.get(SERVER_HEADER).and_then(|v| v.to_str().ok()) else {
                return StatusCode::INTERNAL_SERVER_ERROR.into_response();
            };
            registry.put_server(addr);
            StatusCode::OK.into_response()
        }
        _ => StatusCode::METHOD_NOT_ALLOWED.into_response(),
    }
}

/// Announce `addr` to the registry at `registry_url` and keep it alive.
///
/// Sends one heartbeat immediately, then spawns a task repeating it every
/// `period` (default: one minute less than [`DEFAULT_TTL`]; the period must
/// stay below the registry's TTL). The task stops on the first transport
/// error. The immediate beat's error is returned so a misconfigured
/// registry address fails loudly at startup.
pub async fn heartbeat(
    registry_url: &str,
    addr: &str,
    period: Option<Duration>,
) -> Result<(), HeartbeatError> {
    let period = period.unwrap_or(DEFAULT_TTL - Duration::from_secs(60));
    send_heartbeat(registry_url, addr).await?;

    let registry_url = registry_url.to_string();
    let addr = addr.to_string();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        // The immediate beat already happened.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if let Err(err) = send_heartbeat(&registry_url, &addr).await {
                warn!(%err, addr, "heartbeat stopped");
                return;
            }
        }
    });
    Ok(())
}

#[derive(Debug, thiserror::Error)]
pub enum HeartbeatError {
    #[error("heartbeat to {url} failed: {source}")]
    Send {
        url: String,
        #[source]
        source: reqwest::Error,
    },
}

async fn send_heartbeat(registry_url: &str, addr: &str) -> Result<(), HeartbeatError> {
    debug!(addr, registry_url, "sending heartbeat");
    reqwest::Client::new()
        .post(registry_url)
        .header(SERVER_HEADER, addr)
        .send()
        .await
        .map_err(|source| HeartbeatError::Send {
            url: registry_url.to_string(),
            source,
        })?;
    Ok(())
}
