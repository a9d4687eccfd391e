use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use stowaway::Error;
use stowaway_store::{Method, Priority, StoreError, STREAM_RESPONSE_BODY};
use tokio::sync::Notify;

use crate::{get, ok_response, read_body, setup_engine};

const URL: &str = "http://origin.io/shared";

#[tokio::test]
async fn test_concurrent_requests_share_one_fetch() {
    let (coordinator, store, network, _policy) = setup_engine(|_| ());
    network.script(URL, ok_response("one body, many readers"));
    let request = get(URL);

    let mut txns = Vec::new();
    for _ in 0..5 {
        let mut txn = coordinator.create_transaction(Priority::Medium);
        txn.start(&request).await.unwrap();
        txns.push(txn);
    }
    assert!(!txns[0].is_from_cache());
    for txn in &txns[1..] {
        assert!(txn.is_from_cache());
    }

    let key = coordinator.generate_cache_key(&request).unwrap();
    let snapshot = coordinator.entry_snapshot(&key).unwrap();
    assert_eq!(snapshot.writer_members, 5);
    assert!(!snapshot.writer_exclusive);

    for mut txn in txns {
        let body = read_body(&mut txn).await;
        assert_eq!(body, Bytes::from_static(b"one body, many readers"));
    }

    assert_eq!(network.fetch_count(), 1);
    assert_eq!(store.create_count(), 1);
    assert_eq!(store.open_count(), 0);
    assert_eq!(
        store.entry_bytes(&key, STREAM_RESPONSE_BODY).unwrap(),
        Bytes::from_static(b"one body, many readers"),
    );
    assert_eq!(coordinator.active_entry_count(), 0);
}

#[tokio::test]
async fn test_members_with_different_read_sizes_see_identical_bytes() {
    let (coordinator, _store, network, _policy) = setup_engine(|_| ());
    network.script(URL, ok_response("abcdefghijklmnopqrstuvwxyz"));
    let request = get(URL);

    let mut writer = coordinator.create_transaction(Priority::Medium);
    writer.start(&request).await.unwrap();
    let mut rider = coordinator.create_transaction(Priority::Medium);
    rider.start(&request).await.unwrap();

    // The member driving the fetch drains it three bytes at a time.
    let mut trickle = BytesMut::new();
    loop {
        let chunk = writer.read(3).await.unwrap();
        if chunk.is_empty() {
            break;
        }
        assert!(chunk.len() <= 3);
        trickle.extend_from_slice(&chunk);
    }

    // The member with the big buffer sees the same bytes anyway.
    let body = read_body(&mut rider).await;
    assert_eq!(trickle.freeze(), body);
    assert_eq!(body, Bytes::from_static(b"abcdefghijklmnopqrstuvwxyz"));
    assert_eq!(network.fetch_count(), 1);
}

#[tokio::test]
async fn test_store_failure_keeps_the_writer_streaming() {
    let (coordinator, store, network, _policy) = setup_engine(|_| ());
    network.script(URL, ok_response("payload"));
    let request = get(URL);

    let mut writer = coordinator.create_transaction(Priority::Medium);
    writer.start(&request).await.unwrap();
    let mut rider = coordinator.create_transaction(Priority::Medium);
    rider.start(&request).await.unwrap();

    let key = coordinator.generate_cache_key(&request).unwrap();
    store.fail_body_writes(&key, StoreError::Failure("disk full".into()));

    // The transaction driving the network keeps its bytes even though they
    // no longer persist.
    let body = read_body(&mut writer).await;
    assert_eq!(body, Bytes::from_static(b"payload"));

    // The other member sat at an offset whose bytes exist nowhere now.
    let error = rider.read(1024).await.unwrap_err();
    assert!(matches!(error, Error::Store(StoreError::Failure(_))));
    assert!(!store.has_entry(&key));
}

#[tokio::test]
async fn test_stalled_negotiation_deserts_to_network_after_timeout() {
    let (coordinator, _store, network, _policy) = setup_engine(|config| {
        config.lock_timeout = Duration::from_millis(50);
    });
    let gate = Arc::new(Notify::new());
    network.script(URL, ok_response("slow").held_by(gate.clone()));
    network.script(URL, ok_response("impatient"));
    let request = get(URL);

    // The first transaction parks inside its fetch while holding the
    // negotiator slot.
    let first = {
        let coordinator = coordinator.clone();
        let request = request.clone();
        tokio::spawn(async move {
            let mut txn = coordinator.create_transaction(Priority::Medium);
            txn.start(&request).await.unwrap();
            read_body(&mut txn).await
        })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(network.fetch_count(), 1);

    // The second gives up on the queue and fetches for itself.
    let mut second = coordinator.create_transaction(Priority::Medium);
    second.start(&request).await.unwrap();
    assert!(!second.is_from_cache());
    assert_eq!(read_body(&mut second).await, Bytes::from_static(b"impatient"));

    gate.notify_one();
    assert_eq!(first.await.unwrap(), Bytes::from_static(b"slow"));
    assert_eq!(network.fetch_count(), 2);
}

#[tokio::test]
async fn test_post_does_not_join_a_writer_group() {
    let (coordinator, _store, network, _policy) = setup_engine(|_| ());
    network.script(URL, ok_response("first"));
    network.script(URL, ok_response("second"));
    let mut request = get(URL);
    request.method = Method::Post;
    request.upload_id = Some(7);

    let mut p1 = coordinator.create_transaction(Priority::Medium);
    p1.start(&request).await.unwrap();
    assert!(!p1.is_from_cache());

    // The stored head matches, but only GET transactions may ride a writer
    // group; the second POST fetches privately.
    let mut p2 = coordinator.create_transaction(Priority::Medium);
    p2.start(&request).await.unwrap();
    assert!(!p2.is_from_cache());

    assert_eq!(read_body(&mut p1).await, Bytes::from_static(b"first"));
    assert_eq!(read_body(&mut p2).await, Bytes::from_static(b"second"));
    assert_eq!(network.fetch_count(), 2);
}
