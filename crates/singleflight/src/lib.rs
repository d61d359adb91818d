//! Per-key duplicate call suppression.
//!
//! A [`Group`] coalesces concurrent calls for the same key: the first caller
//! (the leader) runs the supplied future, every concurrent caller for that
//! key waits for the leader and receives a clone of its result. Once the
//! leader finishes, the key is forgotten, so a later call runs fresh.
//!
//! # Example
//!
//! ```
//! use singleflight::Group;
//!
//! # async fn example() {
//! let group: Group<String> = Group::new();
//!
//! // Ten concurrent callers, one execution.
//! let value = group
//!     .run("config", || async { load_config().await })
//!     .await;
//! # }
//! # async fn load_config() -> String { String::new() }
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use tokio::sync::watch;

/// A namespace of in-flight calls keyed by string.
///
/// `T` is the shared result type. Callers typically instantiate it with a
/// `Result<V, E>` where both sides are cheap to clone.
pub struct Group<T> {
    inflight: Arc<Mutex<HashMap<String, watch::Receiver<Option<T>>>>>,
}

impl<T> Default for Group<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Group<T> {
    pub fn new() -> Self {
        Self {
            inflight: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

/// Removes the leader's map entry when the leader finishes or is cancelled.
///
/// Without this, a cancelled leader would strand followers on a channel that
/// never publishes.
struct FlightGuard<T> {
    inflight: Arc<Mutex<HashMap<String, watch::Receiver<Option<T>>>>>,
    key: String,
}

impl<T> Drop for FlightGuard<T> {
    fn drop(&mut self) {
        self.inflight.lock().unwrap().remove(&self.key);
    }
}

impl<T: Clone + Send + Sync + 'static> Group<T> {
    /// Run `f` for `key`, suppressing duplicates.
    ///
    /// At most one future executes per key at a time. Concurrent callers for
    /// the same key receive a clone of the leader's result. After the leader
    /// completes the entry is removed, so the next call re-runs `f`.
    ///
    /// If the leader is cancelled mid-flight, one of the waiting callers
    /// takes over as the new leader.
    pub async fn run<F, Fut>(&self, key: &str, f: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let mut f = Some(f);
        loop {
            let role = {
                let mut inflight = self.inflight.lock().unwrap();
                match inflight.get(key) {
                    Some(rx) => Role::Follower(rx.clone()),
                    None => {
                        let (tx, rx) = watch::channel(None);
                        inflight.insert(key.to_string(), rx);
                        Role::Leader(tx)
                    }
                }
            };

            match role {
                Role::Leader(tx) => {
                    let _guard = FlightGuard {
                        inflight: Arc::clone(&self.inflight),
                        key: key.to_string(),
                    };
                    // The leader branch returns, so the closure is taken at
                    // most once even across retries.
                    let work = f.take().expect("leader ran twice");
                    let value = work().await;
                    // Publish before the guard removes the entry; followers
                    // hold their own receiver clones.
                    let _ = tx.send(Some(value.clone()));
                    return value;
                }
                Role::Follower(mut rx) => {
                    match rx.wait_for(|v| v.is_some()).await {
                        Ok(value) => {
                            return value
                                .clone()
                                .expect("watch published without a value");
                        }
                        // Leader cancelled without publishing. Retry: the
                        // guard has removed the entry, so one waiter becomes
                        // the new leader.
                        Err(_) => continue,
                    }
                }
            }
        }
    }
}

enum Role<T> {
    Leader(watch::Sender<Option<T>>),
    Follower(watch::Receiver<Option<T>>),
}
