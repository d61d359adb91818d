//! Server discovery and selection policies.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::RwLock;
use rand::Rng;
use tracing::{debug, warn};

/// How [`Discovery::get`] picks one of several equivalent servers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectMode {
    /// Uniformly random.
    Random,
    /// Cursor walk over the list, wrapping modulo its length.
    RoundRobin,
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum DiscoveryError {
    #[error("no available servers")]
    NoServers,
    #[error("registry refresh failed: {0}")]
    Refresh(String),
}

/// Source of the live server list.
#[async_trait]
pub trait Discovery: Send + Sync {
    /// Re-fetch the list from its upstream, if it has one.
    async fn refresh(&self) -> Result<(), DiscoveryError>;
    /// Replace the list.
    async fn update(&self, servers: Vec<String>) -> Result<(), DiscoveryError>;
    /// Pick one server according to `mode`.
    async fn get(&self, mode: SelectMode) -> Result<String, DiscoveryError>;
    /// A copy of the whole list.
    async fn get_all(&self) -> Result<Vec<String>, DiscoveryError>;
}

struct ServerList {
    servers: Vec<String>,
    /// Round-robin cursor. Starts at a random offset so a fleet of fresh
    /// clients does not hammer the first server in the list.
    index: usize,
}

/// A fixed server list provided by the caller.
///
/// [`refresh`](Discovery::refresh) has no upstream to ask and is a no-op.
pub struct StaticDiscovery {
    state: RwLock<ServerList>,
}

impl StaticDiscovery {
    pub fn new(servers: Vec<String>) -> Self {
        Self {
            state: RwLock::new(ServerList {
                servers,
                index: rand::rng().random_range(0..usize::MAX / 2),
            }),
        }
    }

    fn pick(&self, mode: SelectMode) -> Result<String, DiscoveryError> {
        let mut state = self.state.write();
        let n = state.servers.len();
        if n == 0 {
            return Err(DiscoveryError::NoServers);
        }
        match mode {
            SelectMode::Random => {
                Ok(state.servers[rand::rng().random_range(0..n)].clone())
            }
            SelectMode::RoundRobin => {
                let server = state.servers[state.index % n].clone();
                state.index = (state.index + 1) % n;
                Ok(server)
            }
        }
    }

    fn replace(&self, servers: Vec<String>) {
        self.state.write().servers = servers;
    }

    fn snapshot(&self) -> Vec<String> {
        self.state.read().servers.clone()
    }
}

#[async_trait]
impl Discovery for StaticDiscovery {
    async fn refresh(&self) -> Result<(), DiscoveryError> {
        Ok(())
    }

    async fn update(&self, servers: Vec<String>) -> Result<(), DiscoveryError> {
        self.replace(servers);
        Ok(())
    }

    async fn get(&self, mode: SelectMode) -> Result<String, DiscoveryError> {
        self.pick(mode)
    }

    async fn get_all(&self) -> Result<Vec<String>, DiscoveryError> {
        Ok(self.snapshot())
    }
}

/// How long a fetched server list stays fresh.
pub const DEFAULT_UPDATE_TIMEOUT: Duration = Duration::from_secs(10);

/// Discovery backed by an `rpc-registry` instance.
///
/// Keeps the static core as its cache and re-fetches from the registry
/// whenever the cache is older than the update timeout.
pub struct RegistryDiscovery {
    servers: StaticDiscovery,
    registry_url: String,
    timeout: Duration,
    last_update: parking_lot::Mutex<Option<Instant>>,
    http: reqwest::Client,
}

impl RegistryDiscovery {
    /// `timeout` of `None` uses [`DEFAULT_UPDATE_TIMEOUT`].
    pub fn new(registry_url: impl Into<String>, timeout: Option<Duration>) -> Self {
        Self {
            servers: StaticDiscovery::new(Vec::new()),
            registry_url: registry_url.into(),
            timeout: timeout.unwrap_or(DEFAULT_UPDATE_TIMEOUT),
            last_update: parking_lot::Mutex::new(None),
            http: reqwest::Client::new(),
        }
    }

    fn is_fresh(&self) -> bool {
        self.last_update
            .lock()
            .is_some_and(|at| at + self.timeout > Instant::now())
    }

    async fn refresh_from_registry(&self) -> Result<(), DiscoveryError> {
        if self.is_fresh() {
            return Ok(());
        }
        debug!(registry = %self.registry_url, "refreshing server list");
        let response = self
            .http
            .get(&self.registry_url)
            .send()
            .await
            .map_err(|e| DiscoveryError::Refresh(e.to_string()))?;
        let header = response
            .headers()
            .get(rpc_registry::SERVERS_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        let servers: Vec<String> = header
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        if servers.is_empty() {
            warn!(registry = %self.registry_url, "registry returned no servers");
        }
        self.servers.replace(servers);
        *self.last_update.lock() = Some(Instant::now());
        Ok(())
    }
}

#[async_trait]
impl Discovery for RegistryDiscovery {
    async fn refresh(&self) -> Result<(), DiscoveryError> {
        self.refresh_from_registry().await
    }

    async fn update(&self, servers: Vec<String>) -> Result<(), DiscoveryError> {
        self.servers.replace(servers);
        *self.last_update.lock() = Some(Instant::now());
        Ok(())
    }

    async fn get(&self, mode: SelectMode) -> Result<String, DiscoveryError> {
        self.refresh_from_registry().await?;
        self.servers.pick(mode)
    }

    async fn get_all(&self) -> Result<Vec<String>, DiscoveryError> {
        self.refresh_from_registry().await?;
        Ok(self.servers.snapshot())
    }
}
