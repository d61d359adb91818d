//! Cache groups: namespaced lookup orchestration.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::byteview::ByteView;
use crate::cache::ConcurrentCache;
use crate::metrics;
use crate::peers::{PeerGetter, PeerPicker};
use crate::CacheError;

/// Loads a value from the origin when the cache and peers cannot serve it.
#[async_trait]
pub trait Loader: Send + Sync {
    async fn load(&self, key: &str) -> Result<Vec<u8>, CacheError>;
}

/// Adapter turning an async closure into a [`Loader`].
pub struct LoaderFn<F>(F);

/// Wrap an async closure as a [`Loader`].
///
/// The closure receives the key by value so it can be moved into the
/// returned future.
pub fn loader_fn<F, Fut>(f: F) -> LoaderFn<F>
where
    F: Fn(String) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Vec<u8>, CacheError>> + Send,
{
    LoaderFn(f)
}

#[async_trait]
impl<F, Fut> Loader for LoaderFn<F>
where
    F: Fn(String) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Vec<u8>, CacheError>> + Send,
{
    async fn load(&self, key: &str) -> Result<Vec<u8>, CacheError> {
        (self.0)(key.to_string()).await
    }
}

/// A namespaced cache with an origin loader and optional peers.
///
/// Lookup order: local cache, then the owning peer (when registered and not
/// self), then the origin loader. The whole miss path runs under a
/// per-key single-flight, so at most one load is in flight per key in this
/// process. Loader results are installed in the local cache; peer results
/// are not, because the authoritative copy lives on the owner.
pub struct Group {
    name: String,
    loader: Arc<dyn Loader>,
    cache: ConcurrentCache,
    peers: OnceLock<Arc<dyn PeerPicker>>,
    flight: singleflight::Group<Result<ByteView, CacheError>>,
}

impl Group {
    fn new(name: &str, cache_bytes: usize, loader: Arc<dyn Loader>) -> Self {
        Self {
            name: name.to_string(),
            loader,
            cache: ConcurrentCache::new(cache_bytes),
            peers: OnceLock::new(),
            flight: singleflight::Group::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register the peer picker. May be called at most once per group.
    pub fn register_peers(&self, peers: Arc<dyn PeerPicker>) -> Result<(), CacheError> {
        self.peers
            .set(peers)
            .map_err(|_| CacheError::PeersAlreadyRegistered)
    }

    /// Look up `key`, loading it on a miss.
    pub async fn get(&self, key: &str) -> Result<ByteView, CacheError> {
        if key.is_empty() {
            return Err(CacheError::EmptyKey);
        }
        if let Some(view) = self.cache.get(key) {
            metrics::HITS.increment();
            debug!(group = %self.name, key, "cache hit");
            return Ok(view);
        }
        metrics::MISSES.increment();
        self.load(key).await
    }

    /// Miss path: peer fetch with origin fallback, coalesced per key.
    async fn load(&self, key: &str) -> Result<ByteView, CacheError> {
        self.flight
            .run(key, || async {
                if let Some(picker) = self.peers.get()
                    && let Some(peer) = picker.pick_peer(key)
                {
                    match self.get_from_peer(&*peer, key).await {
                        Ok(view) => {
                            metrics::PEER_LOADS.increment();
                            return Ok(view);
                        }
                        Err(err) => {
                            metrics::PEER_ERRORS.increment();
                            warn!(group = %self.name, key, %err, "peer fetch failed");
                        }
                    }
                }
                self.get_locally(key).await
            })
            .await
    }

    async fn get_from_peer(
        &self,
        peer: &dyn PeerGetter,
        key: &str,
    ) -> Result<ByteView, CacheError> {
        let bytes = peer.get(&self.name, key).await?;
        Ok(ByteView::from(bytes))
    }

    async fn get_locally(&self, key: &str) -> Result<ByteView, CacheError> {
        let bytes = self.loader.load(key).await?;
        metrics::ORIGIN_LOADS.increment();
        let view = ByteView::from(bytes);
        self.cache.insert(key, view.clone());
        Ok(view)
    }
}

impl std::fmt::Debug for Group {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Group")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Process-scoped set of named groups.
///
/// Shared explicitly (usually as `Arc<GroupRegistry>`) by whoever serves the
/// groups over the network; there is no implicit global instance.
#[derive(Default)]
pub struct GroupRegistry {
    groups: RwLock<HashMap<String, Arc<Group>>>,
}

impl GroupRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create and register a group.
    ///
    /// Group names are unique within a registry; reusing one is an error.
    pub fn new_group(
        &self,
        name: &str,
        cache_bytes: usize,
        loader: impl Loader + 'static,
    ) -> Result<Arc<Group>, CacheError> {
        let mut groups = self.groups.write();
        if groups.contains_key(name) {
            return Err(CacheError::DuplicateGroup(name.to_string()));
        }
        let group = Arc::new(Group::new(name, cache_bytes, Arc::new(loader)));
        groups.insert(name.to_string(), Arc::clone(&group));
        Ok(group)
    }

    pub fn get(&self, name: &str) -> Option<Arc<Group>> {
        self.groups.read().get(name).cloned()
    }
}
