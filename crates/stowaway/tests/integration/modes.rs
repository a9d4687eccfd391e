use std::time::Duration;

use bytes::Bytes;
use stowaway::{CacheMode, Error};
use stowaway_store::{LoadMode, Method, Priority, StoredRecord, StoredVerdict, STREAM_RESPONSE_BODY};
use stowaway_test::ScriptedResponse;

use crate::{fetch, get, ok_response, read_body, response_head, setup_engine};

const URL: &str = "http://origin.io/resource";

#[tokio::test]
async fn test_disabled_mode_is_pure_passthrough() {
    let (coordinator, store, network, _policy) = setup_engine(|config| {
        config.mode = CacheMode::Disabled;
    });
    network.script(URL, ok_response("direct"));
    let request = get(URL);
    let key = coordinator.generate_cache_key(&request).unwrap();
    store.seed(&key, &StoredRecord::complete(response_head(200)), b"stored");

    let (from_cache, body) = fetch(&coordinator, &request).await;
    assert!(!from_cache);
    assert_eq!(body, Bytes::from_static(b"direct"));
    assert_eq!(store.build_count(), 0);
    assert_eq!(store.open_count(), 0);
}

#[tokio::test]
async fn test_disabled_mode_skips_invalidation() {
    let (coordinator, store, network, _policy) = setup_engine(|config| {
        config.mode = CacheMode::Disabled;
    });
    let request = get(URL);
    let key = coordinator.generate_cache_key(&request).unwrap();
    store.seed(&key, &StoredRecord::complete(response_head(200)), b"stored");

    let mut delete = get(URL);
    delete.method = Method::Delete;
    network.script(URL, ScriptedResponse::new(response_head(204), ""));
    fetch(&coordinator, &delete).await;

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(store.has_entry(&key));
    assert_eq!(store.doom_count(), 0);
}

#[tokio::test]
async fn test_unsafe_method_invalidates_the_stored_variant() {
    let (coordinator, store, network, _policy) = setup_engine(|_| ());
    let request = get(URL);
    let key = coordinator.generate_cache_key(&request).unwrap();
    store.seed(&key, &StoredRecord::complete(response_head(200)), b"stored");

    let mut delete = get(URL);
    delete.method = Method::Delete;
    network.script(URL, ScriptedResponse::new(response_head(204), ""));
    let (from_cache, body) = fetch(&coordinator, &delete).await;
    assert!(!from_cache);
    assert!(body.is_empty());

    // The doom runs detached from the transaction; give it a beat.
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(!store.has_entry(&key));
    assert_eq!(network.fetch_count(), 1);
}

#[tokio::test]
async fn test_failed_unsafe_method_keeps_the_entry() {
    let (coordinator, store, network, _policy) = setup_engine(|_| ());
    let request = get(URL);
    let key = coordinator.generate_cache_key(&request).unwrap();
    store.seed(&key, &StoredRecord::complete(response_head(200)), b"stored");

    let mut delete = get(URL);
    delete.method = Method::Delete;
    network.script(URL, ScriptedResponse::new(response_head(500), ""));
    fetch(&coordinator, &delete).await;

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(store.has_entry(&key));
    assert_eq!(store.doom_count(), 0);
}

#[tokio::test]
async fn test_cache_only_never_touches_the_network() {
    let (coordinator, store, network, policy) = setup_engine(|_| ());
    let mut request = get(URL);
    request.load_mode = LoadMode::CacheOnly;
    let key = coordinator.generate_cache_key(&request).unwrap();
    store.seed(&key, &StoredRecord::complete(response_head(200)), b"stored");

    let (from_cache, body) = fetch(&coordinator, &request).await;
    assert!(from_cache);
    assert_eq!(body, Bytes::from_static(b"stored"));

    // A record the policy wants revalidated cannot be served either.
    policy.push_stored_verdict(StoredVerdict::Revalidate { extra_headers: Vec::new() });
    let mut stale = coordinator.create_transaction(Priority::Medium);
    let error = stale.start(&request).await.unwrap_err();
    assert!(matches!(error, Error::NotFoundInCache));

    let mut missing = get("http://origin.io/absent");
    missing.load_mode = LoadMode::CacheOnly;
    let mut txn = coordinator.create_transaction(Priority::Medium);
    let error = txn.start(&missing).await.unwrap_err();
    assert!(matches!(error, Error::NotFoundInCache));

    assert_eq!(network.fetch_count(), 0);
}

#[tokio::test]
async fn test_bypass_dooms_and_refills_the_entry() {
    let (coordinator, store, network, _policy) = setup_engine(|_| ());
    let mut request = get(URL);
    request.load_mode = LoadMode::BypassCache;
    let key = coordinator.generate_cache_key(&request).unwrap();
    store.seed(&key, &StoredRecord::complete(response_head(200)), b"old");
    network.script(URL, ok_response("new"));

    let mut txn = coordinator.create_transaction(Priority::Medium);
    txn.start(&request).await.unwrap();
    assert!(!txn.is_from_cache());
    assert_eq!(read_body(&mut txn).await, Bytes::from_static(b"new"));

    assert_eq!(store.doom_count(), 1);
    assert_eq!(store.create_count(), 1);
    assert_eq!(
        store.entry_bytes(&key, STREAM_RESPONSE_BODY).unwrap(),
        Bytes::from_static(b"new"),
    );
}
