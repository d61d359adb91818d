//! Namespaced in-memory cache with peer-aware loading.
//!
//! A [`Group`] is a cache namespace: lookups hit the local byte-budgeted LRU
//! first, then the peer that owns the key (when a peer picker is
//! registered), and finally the group's origin [`Loader`]. Concurrent
//! lookups for the same key are coalesced so the origin is asked at most
//! once per key at a time.
//!
//! # Example
//!
//! ```
//! use cache_core::{GroupRegistry, loader_fn};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), cache_core::CacheError> {
//! let registry = Arc::new(GroupRegistry::new());
//! let scores = registry.new_group(
//!     "scores",
//!     2 << 10,
//!     loader_fn(|key: String| async move {
//!         Ok(format!("value for {key}").into_bytes())
//!     }),
//! )?;
//!
//! let view = scores.get("Tom").await?;
//! assert_eq!(view.as_slice(), b"value for Tom");
//! # Ok(())
//! # }
//! ```

mod byteview;
mod cache;
mod group;
mod lru;
mod metrics;
mod peers;

pub use byteview::ByteView;
pub use group::{Group, GroupRegistry, Loader, LoaderFn, loader_fn};
pub use lru::{LruCache, Weighted};
pub use peers::{PeerGetter, PeerPicker};

/// Errors surfaced by group lookups and configuration.
///
/// Cloneable so a single load failure can fan out to every coalesced caller.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("key is required")]
    EmptyKey,
    #[error("group {0:?} already exists")]
    DuplicateGroup(String),
    #[error("peers already registered")]
    PeersAlreadyRegistered,
    #[error("peer fetch failed: {0}")]
    Peer(String),
    #[error("load failed: {0}")]
    Load(String),
}
