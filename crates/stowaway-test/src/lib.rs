//! Test doubles for the stowaway coordination engine.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all
//!    console output is captured by the test runner.
//!
//!  - All doubles are cheap clones around shared state, so a test can keep a
//!    handle for assertions after moving a clone into the coordinator.
//!
//!  - [`TestNetwork`] serves scripted responses strictly in the order they
//!    were added per URL. A request for a URL with no remaining script fails
//!    the transaction, which makes an unexpected extra fetch show up as a
//!    test failure rather than as silently shared state.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;
use url::Url;

use stowaway_store::{
    ByteRange, CacheKey, CacheStore, CreateCacheStore, CreateNetworkTransaction, HttpPolicy,
    Method, NetworkError, NetworkTransaction, Priority, RangeSegment, RequestInfo, ResponseHead,
    ResponseVerdict, STREAM_RESPONSE_BODY, STREAM_RESPONSE_HEAD, StoreEntry, StoreError,
    StoredRecord, StoredVerdict,
};

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the `stowaway`
///    crates and mutes everything else.
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("stowaway=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// A fixed timestamp so stored records compare stably.
pub fn test_time() -> DateTime<Utc> {
    DateTime::from_timestamp(1_700_000_000, 0).unwrap()
}

/// A plain `GET` request for `url`.
pub fn get(url: &str) -> RequestInfo {
    RequestInfo::new(Method::Get, Url::parse(url).unwrap())
}

/// A `GET` for the byte interval `[start, end)` of `url`.
pub fn ranged_get(url: &str, start: u64, end: u64) -> RequestInfo {
    let mut request = get(url);
    request.range = Some(ByteRange::new(start, end));
    request
}

/// A response head with permissive defaults: success, strong validators,
/// range support, storable.
pub fn response_head(status: u16) -> ResponseHead {
    ResponseHead {
        status,
        headers: vec![("date".into(), "Tue, 14 Nov 2023 22:13:20 GMT".into())],
        request_time: test_time(),
        response_time: test_time(),
        content_length: None,
        has_strong_validators: true,
        accepts_byte_ranges: true,
        no_store: false,
    }
}

/// A `200` scripted response carrying `body`, with the content length set.
pub fn ok_response(body: impl Into<Bytes>) -> ScriptedResponse {
    let body = body.into();
    let mut head = response_head(200);
    head.content_length = Some(body.len() as u64);
    ScriptedResponse::new(head, body)
}

// ----- in-memory backend ----------------------------------------------------

struct EntrySlot {
    key: CacheKey,
    streams: Mutex<HashMap<u32, Vec<u8>>>,
}

#[derive(Default)]
struct StoreState {
    entries: HashMap<CacheKey, Arc<EntrySlot>>,
    /// Keys whose body writes fail, whether or not the entry exists yet.
    failing_writes: HashMap<CacheKey, StoreError>,
    build_hold: Option<Arc<Notify>>,
    build_error: Option<StoreError>,
    max_file_size: u64,
}

#[derive(Default)]
struct StoreStats {
    builds: AtomicUsize,
    opens: AtomicUsize,
    creates: AtomicUsize,
    dooms: AtomicUsize,
}

struct StoreInner {
    state: Mutex<StoreState>,
    stats: StoreStats,
}

/// An in-memory cache backend with operation counters and failure injection.
///
/// Implements both [`CreateCacheStore`] and [`CacheStore`]; hand a clone to
/// the coordinator and keep one for assertions.
#[derive(Clone)]
pub struct TestStore {
    inner: Arc<StoreInner>,
}

impl Default for TestStore {
    fn default() -> Self {
        Self::new()
    }
}

impl TestStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(StoreInner {
                state: Mutex::new(StoreState {
                    max_file_size: u64::MAX,
                    ..StoreState::default()
                }),
                stats: StoreStats::default(),
            }),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, StoreState> {
        self.inner.state.lock().unwrap()
    }

    /// Caps the size the backend reports for shared writes.
    pub fn set_max_file_size(&self, size: u64) {
        self.state().max_file_size = size;
    }

    /// Makes backend construction fail with `error`.
    pub fn fail_backend_build(&self, error: StoreError) {
        self.state().build_error = Some(error);
    }

    /// Parks backend construction until the returned gate is notified.
    pub fn hold_backend_build(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.state().build_hold = Some(gate.clone());
        gate
    }

    /// Makes body writes under `key` fail with `error` from now on.
    pub fn fail_body_writes(&self, key: &CacheKey, error: StoreError) {
        self.state().failing_writes.insert(key.clone(), error);
    }

    /// Lets body writes under `key` succeed again.
    pub fn heal_body_writes(&self, key: &CacheKey) {
        self.state().failing_writes.remove(key);
    }

    /// Seeds a complete entry: `record` in the head stream, `body` in the
    /// body stream.
    pub fn seed(&self, key: &CacheKey, record: &StoredRecord, body: &[u8]) {
        let slot = Arc::new(EntrySlot {
            key: key.clone(),
            streams: Mutex::new(HashMap::new()),
        });
        {
            let mut streams = slot.streams.lock().unwrap();
            streams.insert(STREAM_RESPONSE_HEAD, record.encode().unwrap().to_vec());
            streams.insert(STREAM_RESPONSE_BODY, body.to_vec());
        }
        self.state().entries.insert(key.clone(), slot);
    }

    /// Overwrites the stored envelope under `key` with undecodable bytes.
    pub fn corrupt_envelope(&self, key: &CacheKey) {
        let state = self.state();
        if let Some(slot) = state.entries.get(key) {
            let mut streams = slot.streams.lock().unwrap();
            streams.insert(STREAM_RESPONSE_HEAD, b"not an envelope".to_vec());
        }
    }

    /// Whether an entry is live (created and not doomed) under `key`.
    pub fn has_entry(&self, key: &CacheKey) -> bool {
        self.state().entries.contains_key(key)
    }

    /// The bytes of `stream` in the live entry under `key`.
    pub fn entry_bytes(&self, key: &CacheKey, stream: u32) -> Option<Bytes> {
        let state = self.state();
        let slot = state.entries.get(key)?;
        let streams = slot.streams.lock().unwrap();
        Some(Bytes::from(streams.get(&stream).cloned().unwrap_or_default()))
    }

    /// The decoded envelope of the live entry under `key`.
    pub fn entry_record(&self, key: &CacheKey) -> Option<StoredRecord> {
        let bytes = self.entry_bytes(key, STREAM_RESPONSE_HEAD)?;
        if bytes.is_empty() {
            return None;
        }
        Some(StoredRecord::decode(&bytes).unwrap())
    }

    /// How many times the backend was constructed.
    pub fn build_count(&self) -> usize {
        self.inner.stats.builds.load(Ordering::Relaxed)
    }

    /// How many entry opens were attempted, including failed ones.
    pub fn open_count(&self) -> usize {
        self.inner.stats.opens.load(Ordering::Relaxed)
    }

    /// How many entries were created.
    pub fn create_count(&self) -> usize {
        self.inner.stats.creates.load(Ordering::Relaxed)
    }

    /// How many dooms were issued, through handles or by key.
    pub fn doom_count(&self) -> usize {
        self.inner.stats.dooms.load(Ordering::Relaxed)
    }

    fn make_handle(&self, slot: Arc<EntrySlot>) -> Arc<dyn StoreEntry> {
        Arc::new(TestEntry {
            slot,
            inner: self.inner.clone(),
        })
    }
}

#[async_trait]
impl CreateCacheStore for TestStore {
    async fn create_store(&self) -> Result<Arc<dyn CacheStore>, StoreError> {
        let (hold, error) = {
            let mut state = self.state();
            (state.build_hold.take(), state.build_error.clone())
        };
        if let Some(hold) = hold {
            hold.notified().await;
        }
        self.inner.stats.builds.fetch_add(1, Ordering::Relaxed);
        if let Some(error) = error {
            return Err(error);
        }
        Ok(Arc::new(self.clone()))
    }
}

#[async_trait]
impl CacheStore for TestStore {
    async fn open(&self, key: &CacheKey) -> Result<Arc<dyn StoreEntry>, StoreError> {
        self.inner.stats.opens.fetch_add(1, Ordering::Relaxed);
        let slot = self
            .state()
            .entries
            .get(key)
            .cloned()
            .ok_or(StoreError::NotFound)?;
        Ok(self.make_handle(slot))
    }

    async fn create(&self, key: &CacheKey) -> Result<Arc<dyn StoreEntry>, StoreError> {
        self.inner.stats.creates.fetch_add(1, Ordering::Relaxed);
        let mut state = self.state();
        if state.entries.contains_key(key) {
            return Err(StoreError::AlreadyExists);
        }
        let slot = Arc::new(EntrySlot {
            key: key.clone(),
            streams: Mutex::new(HashMap::new()),
        });
        state.entries.insert(key.clone(), slot.clone());
        drop(state);
        Ok(self.make_handle(slot))
    }

    async fn open_or_create(
        &self,
        key: &CacheKey,
    ) -> Result<(Arc<dyn StoreEntry>, bool), StoreError> {
        if let Some(slot) = self.state().entries.get(key).cloned() {
            self.inner.stats.opens.fetch_add(1, Ordering::Relaxed);
            return Ok((self.make_handle(slot), true));
        }
        Ok((self.create(key).await?, false))
    }

    async fn doom(&self, key: &CacheKey) -> Result<(), StoreError> {
        self.inner.stats.dooms.fetch_add(1, Ordering::Relaxed);
        self.state().entries.remove(key);
        Ok(())
    }

    fn max_file_size(&self) -> u64 {
        self.state().max_file_size
    }
}

struct TestEntry {
    slot: Arc<EntrySlot>,
    inner: Arc<StoreInner>,
}

#[async_trait]
impl StoreEntry for TestEntry {
    fn key(&self) -> &CacheKey {
        &self.slot.key
    }

    async fn read(&self, stream: u32, offset: u64, max_len: usize) -> Result<Bytes, StoreError> {
        let streams = self.slot.streams.lock().unwrap();
        let data = match streams.get(&stream) {
            Some(data) => data,
            None => return Ok(Bytes::new()),
        };
        let start = usize::try_from(offset).unwrap_or(usize::MAX);
        if start >= data.len() {
            return Ok(Bytes::new());
        }
        let end = start.saturating_add(max_len).min(data.len());
        Ok(Bytes::copy_from_slice(&data[start..end]))
    }

    async fn write(
        &self,
        stream: u32,
        offset: u64,
        data: Bytes,
        truncate: bool,
    ) -> Result<usize, StoreError> {
        if stream == STREAM_RESPONSE_BODY {
            let state = self.inner.state.lock().unwrap();
            if let Some(error) = state.failing_writes.get(&self.slot.key) {
                return Err(error.clone());
            }
        }
        let mut streams = self.slot.streams.lock().unwrap();
        let buffer = streams.entry(stream).or_default();
        let start = usize::try_from(offset).unwrap_or(usize::MAX);
        if buffer.len() < start {
            buffer.resize(start, 0);
        }
        let end = start + data.len();
        if buffer.len() < end {
            buffer.resize(end, 0);
        }
        buffer[start..end].copy_from_slice(&data);
        if truncate {
            buffer.truncate(end);
        }
        Ok(data.len())
    }

    async fn stream_len(&self, stream: u32) -> Result<u64, StoreError> {
        let streams = self.slot.streams.lock().unwrap();
        Ok(streams.get(&stream).map_or(0, |data| data.len() as u64))
    }

    fn doom(&self) {
        self.inner.stats.dooms.fetch_add(1, Ordering::Relaxed);
        let mut state = self.inner.state.lock().unwrap();
        if let Some(slot) = state.entries.get(&self.slot.key) {
            if Arc::ptr_eq(slot, &self.slot) {
                state.entries.remove(&self.slot.key);
            }
        }
    }
}

// ----- scripted network -----------------------------------------------------

/// One response served by [`TestNetwork`].
pub struct ScriptedResponse {
    head: ResponseHead,
    body: Bytes,
    chunk_limit: usize,
    trailing_error: Option<NetworkError>,
    start_error: Option<NetworkError>,
    hold: Option<Arc<Notify>>,
}

impl ScriptedResponse {
    /// A response with the given head and body.
    pub fn new(head: ResponseHead, body: impl Into<Bytes>) -> Self {
        Self {
            head,
            body: body.into(),
            chunk_limit: usize::MAX,
            trailing_error: None,
            start_error: None,
            hold: None,
        }
    }

    /// A response whose `start` fails outright.
    pub fn failing(error: NetworkError) -> Self {
        let mut scripted = Self::new(response_head(200), Bytes::new());
        scripted.start_error = Some(error);
        scripted
    }

    /// Serves at most `limit` bytes per read.
    pub fn chunked(mut self, limit: usize) -> Self {
        self.chunk_limit = limit.max(1);
        self
    }

    /// Delivers `error` after the body instead of the end-of-body marker.
    pub fn interrupted(mut self, error: NetworkError) -> Self {
        self.trailing_error = Some(error);
        self
    }

    /// Parks `start` until `gate` is notified.
    pub fn held_by(mut self, gate: Arc<Notify>) -> Self {
        self.hold = Some(gate);
        self
    }
}

#[derive(Default)]
struct NetworkState {
    scripts: HashMap<String, VecDeque<ScriptedResponse>>,
    requests: Vec<RequestInfo>,
}

#[derive(Default)]
struct NetworkInner {
    state: Mutex<NetworkState>,
    fetches: AtomicUsize,
}

/// A network layer serving scripted responses and counting fetches.
#[derive(Clone, Default)]
pub struct TestNetwork {
    inner: Arc<NetworkInner>,
}

impl TestNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues `response` for the next fetch of `url`.
    pub fn script(&self, url: &str, response: ScriptedResponse) {
        let mut state = self.inner.state.lock().unwrap();
        state
            .scripts
            .entry(url.to_string())
            .or_default()
            .push_back(response);
    }

    /// How many fetches consumed a script, successful or not.
    pub fn fetch_count(&self) -> usize {
        self.inner.fetches.load(Ordering::Relaxed)
    }

    /// Every request that reached the network, in start order.
    pub fn requests(&self) -> Vec<RequestInfo> {
        self.inner.state.lock().unwrap().requests.clone()
    }
}

impl CreateNetworkTransaction for TestNetwork {
    fn create_transaction(&self, priority: Priority) -> Box<dyn NetworkTransaction> {
        Box::new(TestTransaction {
            inner: self.inner.clone(),
            priority,
            active: None,
        })
    }
}

struct ActiveResponse {
    head: ResponseHead,
    body: Bytes,
    offset: usize,
    chunk_limit: usize,
    trailing_error: Option<NetworkError>,
}

struct TestTransaction {
    inner: Arc<NetworkInner>,
    #[allow(dead_code)]
    priority: Priority,
    active: Option<ActiveResponse>,
}

#[async_trait]
impl NetworkTransaction for TestTransaction {
    async fn start(&mut self, request: &RequestInfo) -> Result<(), NetworkError> {
        let scripted = {
            let mut state = self.inner.state.lock().unwrap();
            state.requests.push(request.clone());
            state
                .scripts
                .get_mut(request.url.as_str())
                .and_then(VecDeque::pop_front)
        };
        let Some(scripted) = scripted else {
            return Err(NetworkError::Failed(format!(
                "no scripted response for {}",
                request.url
            )));
        };
        self.inner.fetches.fetch_add(1, Ordering::Relaxed);
        if let Some(hold) = scripted.hold {
            hold.notified().await;
        }
        if let Some(error) = scripted.start_error {
            return Err(error);
        }
        self.active = Some(ActiveResponse {
            head: scripted.head,
            body: scripted.body,
            offset: 0,
            chunk_limit: scripted.chunk_limit,
            trailing_error: scripted.trailing_error,
        });
        Ok(())
    }

    fn response_head(&self) -> Option<&ResponseHead> {
        self.active.as_ref().map(|active| &active.head)
    }

    async fn read(&mut self, max_len: usize) -> Result<Bytes, NetworkError> {
        let Some(active) = self.active.as_mut() else {
            return Err(NetworkError::Failed("read before start".into()));
        };
        if active.offset >= active.body.len() {
            return match active.trailing_error.take() {
                Some(error) => Err(error),
                None => Ok(Bytes::new()),
            };
        }
        let want = max_len.min(active.chunk_limit);
        let end = active.offset.saturating_add(want).min(active.body.len());
        let chunk = active.body.slice(active.offset..end);
        active.offset = end;
        Ok(chunk)
    }

    fn set_priority(&mut self, priority: Priority) {
        self.priority = priority;
    }
}

// ----- scripted policy ------------------------------------------------------

#[derive(Default)]
struct PolicyState {
    stored: VecDeque<StoredVerdict>,
    responses: VecDeque<ResponseVerdict>,
}

/// An HTTP policy with scripted verdicts.
///
/// Unscripted calls fall back to permissive defaults: stored records are
/// fresh, successful storable responses replace, `304` against a stored head
/// validates. Range plans are computed for real from the recorded intervals,
/// since that is the part of policy behavior the engine's range handling
/// depends on.
#[derive(Clone, Default)]
pub struct TestPolicy {
    state: Arc<Mutex<PolicyState>>,
}

impl TestPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a verdict for the next `evaluate_stored` call.
    pub fn push_stored_verdict(&self, verdict: StoredVerdict) {
        self.state.lock().unwrap().stored.push_back(verdict);
    }

    /// Queues a verdict for the next `classify_response` call.
    pub fn push_response_verdict(&self, verdict: ResponseVerdict) {
        self.state.lock().unwrap().responses.push_back(verdict);
    }
}

impl HttpPolicy for TestPolicy {
    fn evaluate_stored(&self, _request: &RequestInfo, _record: &StoredRecord) -> StoredVerdict {
        self.state
            .lock()
            .unwrap()
            .stored
            .pop_front()
            .unwrap_or(StoredVerdict::Fresh)
    }

    fn classify_response(
        &self,
        _request: &RequestInfo,
        stored: Option<&ResponseHead>,
        response: &ResponseHead,
    ) -> ResponseVerdict {
        if let Some(verdict) = self.state.lock().unwrap().responses.pop_front() {
            return verdict;
        }
        match stored {
            Some(stored) if response.status == 304 => {
                let mut updated = stored.clone();
                updated.response_time = response.response_time;
                ResponseVerdict::NotModified { updated }
            }
            _ => ResponseVerdict::Replaces {
                cacheable: response.is_success() && !response.no_store,
            },
        }
    }

    fn plan_range(&self, request: &RequestInfo, record: &StoredRecord) -> Vec<RangeSegment> {
        let Some(want) = request.range.filter(|range| !range.is_empty()) else {
            return Vec::new();
        };
        let mut stored: Vec<ByteRange> = if record.truncated {
            record
                .ranges
                .iter()
                .copied()
                .filter(|range| !range.is_empty())
                .collect()
        } else {
            // A complete body covers everything up to its length.
            vec![ByteRange::new(
                0,
                record.head.content_length.unwrap_or(u64::MAX),
            )]
        };
        stored.sort_by_key(|range| range.start);

        let mut segments = Vec::new();
        let mut pos = want.start;
        for range in stored {
            if range.end <= pos {
                continue;
            }
            if range.start >= want.end {
                break;
            }
            if range.start > pos {
                segments.push(RangeSegment::Network(ByteRange::new(pos, range.start)));
                pos = range.start;
            }
            let end = range.end.min(want.end);
            if end > pos {
                segments.push(RangeSegment::Store(ByteRange::new(pos, end)));
                pos = end;
            }
            if pos >= want.end {
                break;
            }
        }
        if pos < want.end {
            segments.push(RangeSegment::Network(ByteRange::new(pos, want.end)));
        }
        segments
    }
}
