use bytes::Bytes;
use stowaway_store::{Priority, ResponseVerdict, StoredRecord, StoredVerdict, STREAM_RESPONSE_BODY};
use stowaway_test::ScriptedResponse;

use crate::{fetch, get, ok_response, read_body, response_head, setup_engine, test_time};

const URL: &str = "http://origin.io/versioned";

#[tokio::test]
async fn test_not_modified_refreshes_the_stored_head() {
    let (coordinator, store, network, policy) = setup_engine(|_| ());
    let request = get(URL);
    let key = coordinator.generate_cache_key(&request).unwrap();
    store.seed(&key, &StoredRecord::complete(response_head(200)), b"still good");

    policy.push_stored_verdict(StoredVerdict::Revalidate {
        extra_headers: vec![("if-none-match".into(), "\"v1\"".into())],
    });
    let refreshed_at = test_time() + chrono::Duration::hours(1);
    let mut not_modified = response_head(304);
    not_modified.response_time = refreshed_at;
    network.script(URL, ScriptedResponse::new(not_modified, ""));

    let (from_cache, body) = fetch(&coordinator, &request).await;
    assert!(from_cache);
    assert_eq!(body, Bytes::from_static(b"still good"));

    // The conditional headers reached the origin, and the refreshed head
    // was persisted in place.
    let sent = network.requests();
    assert_eq!(sent.len(), 1);
    assert_eq!(
        sent[0].extra_headers,
        vec![("if-none-match".to_string(), "\"v1\"".to_string())],
    );
    let record = store.entry_record(&key).unwrap();
    assert!(!record.truncated);
    assert_eq!(record.head.response_time, refreshed_at);
    assert_eq!(
        store.entry_bytes(&key, STREAM_RESPONSE_BODY).unwrap(),
        Bytes::from_static(b"still good"),
    );
}

#[tokio::test]
async fn test_changed_resource_replaces_the_entry() {
    let (coordinator, store, network, policy) = setup_engine(|_| ());
    let request = get(URL);
    let key = coordinator.generate_cache_key(&request).unwrap();
    store.seed(&key, &StoredRecord::complete(response_head(200)), b"version one");

    policy.push_stored_verdict(StoredVerdict::Revalidate { extra_headers: Vec::new() });
    network.script(URL, ok_response("version two"));

    let (from_cache, body) = fetch(&coordinator, &request).await;
    assert!(!from_cache);
    assert_eq!(body, Bytes::from_static(b"version two"));

    // A changed resource dooms the stored entry and fills a fresh one.
    assert_eq!(store.doom_count(), 1);
    assert_eq!(store.create_count(), 1);
    let record = store.entry_record(&key).unwrap();
    assert!(!record.truncated);
    assert_eq!(
        store.entry_bytes(&key, STREAM_RESPONSE_BODY).unwrap(),
        Bytes::from_static(b"version two"),
    );
}

#[tokio::test]
async fn test_replacement_does_not_disturb_an_attached_reader() {
    let (coordinator, store, network, policy) = setup_engine(|_| ());
    let request = get(URL);
    let key = coordinator.generate_cache_key(&request).unwrap();
    store.seed(&key, &StoredRecord::complete(response_head(200)), b"old body");

    let mut reader = coordinator.create_transaction(Priority::Medium);
    reader.start(&request).await.unwrap();
    assert!(reader.is_from_cache());
    assert_eq!(reader.read(3).await.unwrap(), Bytes::from_static(b"old"));

    policy.push_stored_verdict(StoredVerdict::Revalidate { extra_headers: Vec::new() });
    network.script(URL, ok_response("new body"));
    let (from_cache, body) = fetch(&coordinator, &request).await;
    assert!(!from_cache);
    assert_eq!(body, Bytes::from_static(b"new body"));

    // The reader keeps its doomed handle on the old bytes.
    assert_eq!(read_body(&mut reader).await, Bytes::from_static(b" body"));
    reader.finish();

    assert_eq!(
        store.entry_bytes(&key, STREAM_RESPONSE_BODY).unwrap(),
        Bytes::from_static(b"new body"),
    );
    assert_eq!(store.create_count(), 1);
    assert_eq!(store.doom_count(), 1);
    assert_eq!(coordinator.active_entry_count(), 0);
    assert_eq!(coordinator.doomed_entry_count(), 0);
}

#[tokio::test]
async fn test_uncacheable_replacement_is_served_over_the_network() {
    let (coordinator, store, network, policy) = setup_engine(|_| ());
    let request = get(URL);
    let key = coordinator.generate_cache_key(&request).unwrap();
    store.seed(&key, &StoredRecord::complete(response_head(200)), b"old");

    policy.push_stored_verdict(StoredVerdict::Revalidate { extra_headers: Vec::new() });
    policy.push_response_verdict(ResponseVerdict::Replaces { cacheable: false });
    network.script(URL, ok_response("fresh paint"));

    let (from_cache, body) = fetch(&coordinator, &request).await;
    assert!(!from_cache);
    assert_eq!(body, Bytes::from_static(b"fresh paint"));

    // The entry is gone and nothing replaced it.
    assert!(!store.has_entry(&key));
    assert_eq!(store.create_count(), 0);
    assert_eq!(store.doom_count(), 1);
}

#[tokio::test]
async fn test_unusable_stored_record_is_overwritten_in_place() {
    let (coordinator, store, network, policy) = setup_engine(|_| ());
    let request = get(URL);
    let key = coordinator.generate_cache_key(&request).unwrap();
    store.seed(&key, &StoredRecord::complete(response_head(200)), b"stale");

    policy.push_stored_verdict(StoredVerdict::Refetch);
    network.script(URL, ok_response("fresh"));

    let (from_cache, body) = fetch(&coordinator, &request).await;
    assert!(!from_cache);
    assert_eq!(body, Bytes::from_static(b"fresh"));

    // The sole user of the entry reuses it rather than doom it.
    assert_eq!(store.create_count(), 0);
    assert_eq!(store.doom_count(), 0);
    assert_eq!(
        store.entry_bytes(&key, STREAM_RESPONSE_BODY).unwrap(),
        Bytes::from_static(b"fresh"),
    );
}

#[tokio::test]
async fn test_corrupt_envelope_is_discarded_and_refetched() {
    let (coordinator, store, network, _policy) = setup_engine(|_| ());
    let request = get(URL);
    let key = coordinator.generate_cache_key(&request).unwrap();
    store.seed(&key, &StoredRecord::complete(response_head(200)), b"stale");
    store.corrupt_envelope(&key);
    network.script(URL, ok_response("fresh"));

    let (from_cache, body) = fetch(&coordinator, &request).await;
    assert!(!from_cache);
    assert_eq!(body, Bytes::from_static(b"fresh"));

    assert_eq!(store.doom_count(), 1);
    assert_eq!(store.open_count(), 1);
    assert_eq!(store.create_count(), 1);
    let record = store.entry_record(&key).unwrap();
    assert!(!record.truncated);
}
