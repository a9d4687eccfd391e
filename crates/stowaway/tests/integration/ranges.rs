use bytes::Bytes;
use stowaway_store::{ByteRange, Priority, StoredRecord, STREAM_RESPONSE_BODY};
use stowaway_test::ScriptedResponse;

use crate::{fetch, get, ok_response, ranged_get, read_body, response_head, setup_engine};

const URL: &str = "http://origin.io/large";

fn sparse_record(ranges: &[(u64, u64)]) -> StoredRecord {
    StoredRecord {
        truncated: true,
        ranges: ranges.iter().map(|&(start, end)| ByteRange::new(start, end)).collect(),
        head: response_head(200),
    }
}

#[tokio::test]
async fn test_range_served_entirely_from_the_store() {
    let (coordinator, store, network, _policy) = setup_engine(|_| ());
    let request = ranged_get(URL, 5, 15);
    let key = coordinator.generate_cache_key(&request).unwrap();
    store.seed(&key, &sparse_record(&[(0, 30)]), b"aaaaaaaaaabbbbbbbbbbcccccccccc");

    let mut txn = coordinator.create_transaction(Priority::Medium);
    txn.start(&request).await.unwrap();
    assert!(txn.is_from_cache());
    assert_eq!(read_body(&mut txn).await, Bytes::from_static(b"aaaaabbbbb"));
    assert_eq!(network.fetch_count(), 0);
}

#[tokio::test]
async fn test_range_over_a_complete_body_stays_local() {
    let (coordinator, store, network, _policy) = setup_engine(|_| ());
    let request = ranged_get(URL, 3, 9);
    let key = coordinator.generate_cache_key(&request).unwrap();
    store.seed(&key, &StoredRecord::complete(response_head(200)), b"abcdefghijkl");

    let (from_cache, body) = fetch(&coordinator, &request).await;
    assert!(from_cache);
    assert_eq!(body, Bytes::from_static(b"defghi"));
    assert_eq!(network.fetch_count(), 0);
}

#[tokio::test]
async fn test_range_gap_is_fetched_and_merged() {
    let (coordinator, store, network, _policy) = setup_engine(|_| ());
    let request = ranged_get(URL, 0, 20);
    let key = coordinator.generate_cache_key(&request).unwrap();
    store.seed(&key, &sparse_record(&[(0, 10)]), b"0123456789");
    network.script(URL, ScriptedResponse::new(response_head(206), "ABCDEFGHIJ"));

    let mut txn = coordinator.create_transaction(Priority::Medium);
    txn.start(&request).await.unwrap();
    assert!(!txn.is_from_cache());
    assert_eq!(
        read_body(&mut txn).await,
        Bytes::from_static(b"0123456789ABCDEFGHIJ"),
    );

    // Only the gap was fetched, and the entry now covers the union.
    let sent = network.requests();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].range, Some(ByteRange::new(10, 20)));
    let record = store.entry_record(&key).unwrap();
    assert!(record.truncated);
    assert_eq!(record.ranges, vec![ByteRange::new(0, 20)]);
    assert_eq!(
        store.entry_bytes(&key, STREAM_RESPONSE_BODY).unwrap(),
        Bytes::from_static(b"0123456789ABCDEFGHIJ"),
    );
}

#[tokio::test]
async fn test_range_miss_creates_a_sparse_entry() {
    let (coordinator, store, network, _policy) = setup_engine(|_| ());
    let request = ranged_get(URL, 5, 15);
    let key = coordinator.generate_cache_key(&request).unwrap();
    network.script(URL, ScriptedResponse::new(response_head(206), "EEEEEFFFFF"));

    let mut txn = coordinator.create_transaction(Priority::Medium);
    txn.start(&request).await.unwrap();
    assert!(!txn.is_from_cache());
    assert_eq!(read_body(&mut txn).await, Bytes::from_static(b"EEEEEFFFFF"));

    let record = store.entry_record(&key).unwrap();
    assert!(record.truncated);
    assert_eq!(record.ranges, vec![ByteRange::new(5, 15)]);
    // The body stream is sparse: zero-filled up to the written interval.
    let body = store.entry_bytes(&key, STREAM_RESPONSE_BODY).unwrap();
    assert_eq!(body.len(), 15);
    assert_eq!(&body[..5], &[0u8; 5][..]);
    assert_eq!(&body[5..], b"EEEEEFFFFF");
}

#[tokio::test]
async fn test_full_request_replaces_a_truncated_entry() {
    let (coordinator, store, network, _policy) = setup_engine(|_| ());
    let request = get(URL);
    let key = coordinator.generate_cache_key(&request).unwrap();
    store.seed(&key, &sparse_record(&[(0, 10)]), b"0123456789");
    network.script(URL, ok_response("complete body"));

    let (from_cache, body) = fetch(&coordinator, &request).await;
    assert!(!from_cache);
    assert_eq!(body, Bytes::from_static(b"complete body"));

    // The sole user overwrites the sparse entry in place.
    assert_eq!(store.create_count(), 0);
    assert_eq!(store.doom_count(), 0);
    let record = store.entry_record(&key).unwrap();
    assert!(!record.truncated);
    assert_eq!(
        store.entry_bytes(&key, STREAM_RESPONSE_BODY).unwrap(),
        Bytes::from_static(b"complete body"),
    );
}

#[tokio::test]
async fn test_second_range_request_is_rejected_to_the_network() {
    let (coordinator, store, network, _policy) = setup_engine(|_| ());
    let key = coordinator.generate_cache_key(&get(URL)).unwrap();
    store.seed(&key, &sparse_record(&[(0, 10)]), b"0123456789");

    // The first range transaction takes the exclusive slot for its gap and
    // sits on it without reading yet.
    let first_request = ranged_get(URL, 0, 20);
    let mut first = coordinator.create_transaction(Priority::Medium);
    first.start(&first_request).await.unwrap();
    assert!(!first.is_from_cache());
    let snapshot = coordinator.entry_snapshot(&key).unwrap();
    assert!(snapshot.writer_exclusive);

    // A second range request cannot wait for the slot; it fetches privately
    // even though its bytes are all stored.
    network.script(URL, ScriptedResponse::new(response_head(206), "0123456789"));
    let second_request = ranged_get(URL, 0, 10);
    let mut second = coordinator.create_transaction(Priority::Medium);
    second.start(&second_request).await.unwrap();
    assert!(!second.is_from_cache());
    assert_eq!(read_body(&mut second).await, Bytes::from_static(b"0123456789"));

    network.script(URL, ScriptedResponse::new(response_head(206), "ABCDEFGHIJ"));
    assert_eq!(
        read_body(&mut first).await,
        Bytes::from_static(b"0123456789ABCDEFGHIJ"),
    );
    assert_eq!(network.fetch_count(), 2);
    let record = store.entry_record(&key).unwrap();
    assert_eq!(record.ranges, vec![ByteRange::new(0, 20)]);
}
