//! Cache metrics.

use metriken::{Counter, metric};

#[metric(name = "cache_hits", description = "Lookups served from the local cache")]
pub static HITS: Counter = Counter::new();

#[metric(name = "cache_misses", description = "Lookups that missed the local cache")]
pub static MISSES: Counter = Counter::new();

#[metric(
    name = "cache_peer_loads",
    description = "Values fetched from the owning peer"
)]
pub static PEER_LOADS: Counter = Counter::new();

#[metric(
    name = "cache_peer_errors",
    description = "Peer fetches that failed and fell back to the origin"
)]
pub static PEER_ERRORS: Counter = Counter::new();

#[metric(
    name = "cache_origin_loads",
    description = "Values loaded from the origin loader"
)]
pub static ORIGIN_LOADS: Counter = Counter::new();
