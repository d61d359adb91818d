//! RPC server metrics.

use metriken::{Counter, Gauge, metric};

#[metric(
    name = "rpc_connections_accepted",
    description = "Total connections accepted"
)]
pub static CONNECTIONS_ACCEPTED: Counter = Counter::new();

#[metric(
    name = "rpc_connections_active",
    description = "Currently active connections"
)]
pub static CONNECTIONS_ACTIVE: Gauge = Gauge::new();

#[metric(name = "rpc_requests", description = "Total requests dispatched")]
pub static REQUESTS: Counter = Counter::new();

#[metric(
    name = "rpc_request_errors",
    description = "Requests answered with a call-scoped error"
)]
pub static REQUEST_ERRORS: Counter = Counter::new();

#[metric(
    name = "rpc_request_timeouts",
    description = "Requests that hit the handle timeout"
)]
pub static REQUEST_TIMEOUTS: Counter = Counter::new();
