//! Peer abstractions for distributed lookups.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::CacheError;

/// Chooses the peer that owns a key.
pub trait PeerPicker: Send + Sync {
    /// Returns the getter for the owning peer, or `None` when the key
    /// belongs to the local node or no peers are configured.
    fn pick_peer(&self, key: &str) -> Option<Arc<dyn PeerGetter>>;
}

/// Fetches one value from a single remote peer.
#[async_trait]
pub trait PeerGetter: Send + Sync {
    async fn get(&self, group: &str, key: &str) -> Result<Bytes, CacheError>;
}
