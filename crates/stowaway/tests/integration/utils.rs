use bytes::{Bytes, BytesMut};
use stowaway::{CacheCoordinator, CacheTransaction, Config};
use stowaway_store::RequestInfo;
use stowaway_test::{self as test, TestNetwork, TestPolicy, TestStore};

pub use test::{get, ok_response, ranged_get, response_head, test_time};

/// Setup tests and create a coordinator wired to scriptable collaborators.
///
/// This function returns the coordinator together with the store, network,
/// and policy doubles backing it. Keep them around to script responses and
/// inspect operation counters after the fact.
///
/// The `update_config` closure can modify any default configuration if needed
/// before the coordinator is built.
pub fn setup_engine(
    update_config: impl FnOnce(&mut Config),
) -> (CacheCoordinator, TestStore, TestNetwork, TestPolicy) {
    test::setup();

    let mut config = Config::default();
    update_config(&mut config);

    let store = TestStore::new();
    let network = TestNetwork::new();
    let policy = TestPolicy::new();
    let coordinator = CacheCoordinator::new(
        config,
        Box::new(store.clone()),
        Box::new(network.clone()),
        Box::new(policy.clone()),
    );
    (coordinator, store, network, policy)
}

/// Drains the rest of a started transaction's body.
pub async fn read_body(txn: &mut CacheTransaction) -> Bytes {
    let mut body = BytesMut::new();
    loop {
        let chunk = txn.read(1024).await.unwrap();
        if chunk.is_empty() {
            return body.freeze();
        }
        body.extend_from_slice(&chunk);
    }
}

/// Runs `request` to completion, returning whether the response came from
/// the cache and the full body.
pub async fn fetch(coordinator: &CacheCoordinator, request: &RequestInfo) -> (bool, Bytes) {
    let mut txn = coordinator.create_transaction(request.priority);
    txn.start(request).await.unwrap();
    let from_cache = txn.is_from_cache();
    let body = read_body(&mut txn).await;
    txn.finish();
    (from_cache, body)
}
