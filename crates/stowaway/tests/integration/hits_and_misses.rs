use bytes::Bytes;
use stowaway::Error;
use stowaway_store::{Method, NetworkError, Priority, StoreError, StoredRecord, STREAM_RESPONSE_BODY};
use stowaway_test::ScriptedResponse;

use crate::{fetch, get, ok_response, read_body, response_head, setup_engine};

const URL: &str = "http://origin.io/asset";

#[tokio::test]
async fn test_miss_fetches_and_stores() {
    let (coordinator, store, network, _policy) = setup_engine(|_| ());
    network.script(URL, ok_response("hello world"));
    let request = get(URL);

    let mut txn = coordinator.create_transaction(Priority::Medium);
    txn.start(&request).await.unwrap();
    assert!(!txn.is_from_cache());
    assert_eq!(txn.response_head().unwrap().status, 200);
    let body = read_body(&mut txn).await;
    assert_eq!(body, Bytes::from_static(b"hello world"));

    let key = coordinator.generate_cache_key(&request).unwrap();
    let record = store.entry_record(&key).unwrap();
    assert!(!record.truncated);
    assert_eq!(
        store.entry_bytes(&key, STREAM_RESPONSE_BODY).unwrap(),
        Bytes::from_static(b"hello world"),
    );
    assert_eq!(network.fetch_count(), 1);
    assert_eq!(coordinator.active_entry_count(), 0);
}

#[tokio::test]
async fn test_repeat_request_hits_the_store() {
    let (coordinator, store, network, _policy) = setup_engine(|_| ());
    network.script(URL, ok_response("cached payload"));
    let request = get(URL);

    let (from_cache, body) = fetch(&coordinator, &request).await;
    assert!(!from_cache);
    assert_eq!(body, Bytes::from_static(b"cached payload"));

    let (from_cache, body) = fetch(&coordinator, &request).await;
    assert!(from_cache);
    assert_eq!(body, Bytes::from_static(b"cached payload"));

    assert_eq!(network.fetch_count(), 1);
    assert_eq!(store.create_count(), 1);
    assert_eq!(store.open_count(), 1);
}

#[tokio::test]
async fn test_head_is_served_from_the_stored_record() {
    let (coordinator, store, network, _policy) = setup_engine(|_| ());
    let request = get(URL);
    let key = coordinator.generate_cache_key(&request).unwrap();
    store.seed(&key, &StoredRecord::complete(response_head(200)), b"body");

    let mut head_request = get(URL);
    head_request.method = Method::Head;
    let mut txn = coordinator.create_transaction(Priority::Medium);
    txn.start(&head_request).await.unwrap();
    assert!(txn.is_from_cache());
    assert_eq!(txn.response_head().unwrap().status, 200);
    assert!(read_body(&mut txn).await.is_empty());
    assert_eq!(network.fetch_count(), 0);
}

#[tokio::test]
async fn test_no_store_response_is_remembered() {
    let (coordinator, store, network, _policy) = setup_engine(|_| ());
    let mut head = response_head(200);
    head.no_store = true;
    network.script(URL, ScriptedResponse::new(head.clone(), "opaque"));
    network.script(URL, ScriptedResponse::new(head, "opaque"));
    let request = get(URL);
    let key = coordinator.generate_cache_key(&request).unwrap();

    let (from_cache, body) = fetch(&coordinator, &request).await;
    assert!(!from_cache);
    assert_eq!(body, Bytes::from_static(b"opaque"));
    assert!(!store.has_entry(&key));
    assert_eq!(store.create_count(), 1);

    // The verdict sticks; the next load does not even create an entry.
    let (from_cache, _body) = fetch(&coordinator, &request).await;
    assert!(!from_cache);
    assert_eq!(store.create_count(), 1);
    assert_eq!(network.fetch_count(), 2);
}

#[tokio::test]
async fn test_backend_build_failure_degrades_to_network() {
    let (coordinator, store, network, _policy) = setup_engine(|_| ());
    store.fail_backend_build(StoreError::Failure("index unreadable".into()));
    network.script(URL, ok_response("served anyway"));
    network.script(URL, ok_response("served anyway"));
    let request = get(URL);

    let (from_cache, body) = fetch(&coordinator, &request).await;
    assert!(!from_cache);
    assert_eq!(body, Bytes::from_static(b"served anyway"));

    // The failure is permanent; no rebuild is attempted.
    fetch(&coordinator, &request).await;
    assert_eq!(store.build_count(), 1);
    assert_eq!(network.fetch_count(), 2);
}

#[tokio::test]
async fn test_network_start_failure_leaves_a_recoverable_entry() {
    let (coordinator, store, network, _policy) = setup_engine(|_| ());
    network.script(URL, ScriptedResponse::failing(NetworkError::Timeout));
    network.script(URL, ok_response("recovered"));
    let request = get(URL);

    let mut txn = coordinator.create_transaction(Priority::Medium);
    let error = txn.start(&request).await.unwrap_err();
    assert!(matches!(error, Error::Network(NetworkError::Timeout)));

    // The entry created for the miss survives with an empty envelope; the
    // next load treats it as a miss and fills it.
    let key = coordinator.generate_cache_key(&request).unwrap();
    assert!(store.has_entry(&key));
    let (from_cache, body) = fetch(&coordinator, &request).await;
    assert!(!from_cache);
    assert_eq!(body, Bytes::from_static(b"recovered"));
    assert_eq!(store.create_count(), 1);
    assert_eq!(store.open_count(), 1);
}

#[tokio::test]
async fn test_connection_reset_mid_body_fails_the_stream() {
    let (coordinator, store, network, _policy) = setup_engine(|_| ());
    network.script(
        URL,
        ok_response("partial").interrupted(NetworkError::ConnectionReset),
    );
    let request = get(URL);

    let mut txn = coordinator.create_transaction(Priority::Medium);
    txn.start(&request).await.unwrap();
    assert_eq!(txn.read(1024).await.unwrap(), Bytes::from_static(b"partial"));
    let error = txn.read(1024).await.unwrap_err();
    assert!(matches!(error, Error::Network(NetworkError::ConnectionReset)));

    // A poisoned download never leaves a half-written body behind.
    let key = coordinator.generate_cache_key(&request).unwrap();
    assert!(!store.has_entry(&key));
}
