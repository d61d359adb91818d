//! End-to-end tests driving two cache nodes over real HTTP.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use cache_core::{CacheError, GroupRegistry, PeerPicker, loader_fn};
use cache_http::HttpPool;

async fn start_node(
    loader_calls: Arc<AtomicUsize>,
    db: HashMap<&'static str, &'static str>,
) -> (Arc<HttpPool>, String) {
    let registry = Arc::new(GroupRegistry::new());
    registry
        .new_group(
            "scores",
            2 << 10,
            loader_fn(move |key: String| {
                let calls = Arc::clone(&loader_calls);
                let db = db.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    match db.get(key.as_str()) {
                        Some(v) => Ok(v.as_bytes().to_vec()),
                        None => Err(CacheError::Load(format!("{key} not exist"))),
                    }
                }
            }),
        )
        .unwrap();

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = format!("http://{}", listener.local_addr().unwrap());
    let pool = Arc::new(HttpPool::new(addr.clone(), registry));
    tokio::spawn(Arc::clone(&pool).serve(listener));
    (pool, addr)
}

fn scores() -> HashMap<&'static str, &'static str> {
    HashMap::from([("Tom", "630"), ("Jack", "589"), ("Sam", "567")])
}

#[tokio::test]
async fn remote_peer_serves_its_keys() {
    let local_calls = Arc::new(AtomicUsize::new(0));
    let remote_calls = Arc::new(AtomicUsize::new(0));

    let (_local_pool, _local_addr) = start_node(Arc::clone(&local_calls), scores()).await;
    // The remote node's group has no peer picker; it loads from its origin.
    let (_remote_pool, remote_addr) = start_node(Arc::clone(&remote_calls), scores()).await;

    // A fresh front node whose only configured peer is the remote node, so
    // every key routes there.
    let front_registry = Arc::new(GroupRegistry::new());
    let front_group = front_registry
        .new_group(
            "scores",
            2 << 10,
            loader_fn(|key: String| async move {
                Err::<Vec<u8>, _>(CacheError::Load(format!("front should not load {key}")))
            }),
        )
        .unwrap();
    let front_pool = Arc::new(HttpPool::new(
        "http://front.invalid",
        Arc::clone(&front_registry),
    ));
    front_pool.set_peers([remote_addr.as_str()]);
    front_group
        .register_peers(Arc::clone(&front_pool) as Arc<dyn PeerPicker>)
        .unwrap();
    let view = front_group.get("Tom").await.unwrap();
    assert_eq!(view.as_slice(), b"630");
    assert_eq!(remote_calls.load(Ordering::SeqCst), 1);
    assert_eq!(local_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn http_surface_maps_errors_to_status_codes() {
    let calls = Arc::new(AtomicUsize::new(0));
    let (_pool, addr) = start_node(calls, scores()).await;
    let http = reqwest::Client::new();

    // Happy path: raw bytes with the octet-stream content type.
    let ok = http
        .get(format!("{addr}/_embercache/scores/Tom"))
        .send()
        .await
        .unwrap();
    assert_eq!(ok.status(), 200);
    assert_eq!(
        ok.headers()[reqwest::header::CONTENT_TYPE],
        "application/octet-stream"
    );
    assert_eq!(ok.bytes().await.unwrap().as_ref(), b"630");

    // Unknown group.
    let missing_group = http
        .get(format!("{addr}/_embercache/nope/Tom"))
        .send()
        .await
        .unwrap();
    assert_eq!(missing_group.status(), 404);

    // Loader failure.
    let missing_key = http
        .get(format!("{addr}/_embercache/scores/Nobody"))
        .send()
        .await
        .unwrap();
    assert_eq!(missing_key.status(), 500);

    // Path that does not match the {group}/{key} shape.
    let bad_shape = http
        .get(format!("{addr}/_embercache/justonething"))
        .send()
        .await
        .unwrap();
    assert_eq!(bad_shape.status(), 400);
}
