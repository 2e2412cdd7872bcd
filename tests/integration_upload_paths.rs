mod common;

use common::helpers::*;
use common::{MockOrigin, MockStore, OriginBehavior};
use http::StatusCode;
use proxxy::{CacheKey, KeyStyle, cache_key};

const BODY: &str = "0123456789abcdefghijklmnopqrstuvwxyz";

fn key(path: &str) -> CacheKey {
    CacheKey::new(
        "use1",
        "mozilla-releng-proxxy-use1",
        cache_key::object_key(TEST_HOST, path, KeyStyle::Hash),
    )
}

async fn populate(behavior: OriginBehavior) -> (MockStore, MockOrigin) {
    let origin = MockOrigin::start(behavior).await;
    let store = MockStore::new();
    let proxy = create_test_proxy(&test_config(&origin.url(), &[]), &store);

    let response = proxy
        .clone()
        .handle(build_get_request(TEST_HOST, "/archive.zip"))
        .await;
    assert_eq!(response.status(), StatusCode::FOUND);

    (store, origin)
}

/// Test that a body with a known length is streamed into the store
#[tokio::test]
async fn known_length_streams() {
    let (store, _origin) = populate(OriginBehavior::ok(BODY)).await;

    let stored = store.object(&key("/archive.zip")).await.unwrap();
    assert!(stored.streamed);
    assert_eq!(stored.declared_length, BODY.len() as u64);
    assert_eq!(stored.body.as_ref(), BODY.as_bytes());
}

/// Test that a chunked body is buffered and uploaded with its real length
#[tokio::test]
async fn chunked_body_is_buffered() {
    let (store, _origin) = populate(OriginBehavior::ok(BODY).chunked()).await;

    let stored = store.object(&key("/archive.zip")).await.unwrap();
    assert!(!stored.streamed);
    assert_eq!(stored.declared_length, BODY.len() as u64);
    assert_eq!(stored.body.as_ref(), BODY.as_bytes());
}

/// Test that both upload paths store identical objects
#[tokio::test]
async fn streaming_and_buffered_store_identical_bytes() {
    let (streamed, _a) = populate(OriginBehavior::ok(BODY)).await;
    let (buffered, _b) = populate(OriginBehavior::ok(BODY).chunked()).await;

    let streamed = streamed.object(&key("/archive.zip")).await.unwrap();
    let buffered = buffered.object(&key("/archive.zip")).await.unwrap();

    assert_ne!(streamed.streamed, buffered.streamed);
    assert_eq!(streamed.body, buffered.body);
    assert_eq!(streamed.content_type, buffered.content_type);
}

/// Test that an empty 200 is stored as an empty object
#[tokio::test]
async fn empty_body_is_stored() {
    let (store, _origin) = populate(OriginBehavior::ok("")).await;

    let stored = store.object(&key("/archive.zip")).await.unwrap();
    assert!(stored.body.is_empty());
    assert_eq!(stored.declared_length, 0);
}
