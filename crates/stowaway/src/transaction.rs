//! The per-request driver.
//!
//! A [`CacheTransaction`] runs one request against the coordination engine:
//! classify the request, resolve an entry, take a turn as headers negotiator
//! when the entry needs one, then stream the body from wherever it lives (the
//! store, a shared writer group, or a private network fetch). The driver owns
//! no shared state; every decision that concerns other transactions goes
//! through the coordinator, and the driver keeps only what its current phase
//! needs.
//!
//! Recovery is one-directional. When anything cache-side goes wrong during
//! setup the driver falls back to a private network fetch instead of
//! surfacing the problem; a single `CacheRace` earns one re-resolution
//! against the current state of the key, a second one goes to the network.
//! Callers only see an error when the network itself fails, when a store
//! breaks under an active stream, or when a cache-only load misses.

use std::collections::VecDeque;
use std::sync::Arc;

use bytes::Bytes;

use stowaway_store::{
    ByteRange, CacheKey, LoadMode, Method, NetworkError, NetworkTransaction, Priority,
    RangeSegment, RequestInfo, ResponseHead, ResponseVerdict, STREAM_RESPONSE_BODY, StoreEntry,
    StoreError, StoredRecord, StoredVerdict,
};

use crate::config::CacheMode;
use crate::coordination::{
    CacheInner, DoomStep, HeadersOutcome, PendingKind, PendingOutcome, QueueResolution, ReadStep,
    TransactionMode, TxnId, WaitReceiver,
};
use crate::error::{CoordinationError, Error};

/// How a cache-side failure is handled during transaction setup.
enum Halt {
    /// Surface the error to the caller.
    Deliver(Error),
    /// Give up on the cache and serve this request over the network.
    Network,
    /// Re-resolve the key; the entry changed underneath us.
    Retry,
}

fn halt_from(error: CoordinationError) -> Halt {
    if error.is_retryable() {
        Halt::Retry
    } else {
        Halt::Network
    }
}

/// Collapses residual coordination errors that escape into a body stream.
fn public_error(error: CoordinationError) -> Error {
    match error {
        CoordinationError::ReadFailure(error) => Error::Network(error),
        CoordinationError::WriteFailure(error) => Error::Store(error),
        other => Error::Store(StoreError::Failure(other.to_string())),
    }
}

/// Where the body bytes of a started transaction come from.
enum Phase {
    /// `start` has not been called.
    Created,
    /// Streaming from a private network transaction.
    Network(Box<dyn NetworkTransaction>),
    /// Reading a complete body out of the store.
    Reader(StoreReader),
    /// Member of a shared writer group; bytes come through the coordinator.
    SharedWriter,
    /// Executing a range plan of store reads and private range fetches.
    Segmented(SegmentFlow),
    /// The body has been fully delivered.
    Done,
    /// Terminal failure, repeated on every later read.
    Failed(Error),
}

struct StoreReader {
    store: Arc<dyn StoreEntry>,
    offset: u64,
    /// Whether this reader still holds a place in the entry's reader set.
    member: bool,
}

/// State of a transaction serving a byte-range plan.
struct SegmentFlow {
    request: RequestInfo,
    store: Arc<dyn StoreEntry>,
    plan: VecDeque<RangeSegment>,
    active: Option<ActiveSegment>,
    /// The envelope as it was when the plan was made.
    record: StoredRecord,
    /// Network intervals fully persisted by this transaction.
    written: Vec<ByteRange>,
    /// Cleared after a body write fails; bytes keep flowing unpersisted and
    /// the entry is doomed on detach.
    persist: bool,
    /// Whether this transaction holds the exclusive writer slot, as opposed
    /// to serving a fully stored plan from the reader set.
    writer: bool,
}

enum ActiveSegment {
    Store {
        offset: u64,
        end: u64,
    },
    Network {
        network: Box<dyn NetworkTransaction>,
        start: u64,
        offset: u64,
        end: u64,
    },
}

/// One request run against the cache.
///
/// Created by [`CacheCoordinator::create_transaction`], then driven by the
/// caller: [`start`](CacheTransaction::start) until the response head is
/// available, [`read`](CacheTransaction::read) until an empty buffer signals
/// the end of the body. Dropping the transaction at any point detaches it
/// from the coordination machinery without disturbing other transactions on
/// the same entry.
///
/// [`CacheCoordinator::create_transaction`]: crate::CacheCoordinator::create_transaction
pub struct CacheTransaction {
    inner: Arc<CacheInner>,
    priority: Priority,
    txn: Option<TxnId>,
    key: Option<CacheKey>,
    head: Option<ResponseHead>,
    from_cache: bool,
    restarted: bool,
    body_complete: bool,
    phase: Phase,
}

impl CacheTransaction {
    pub(crate) fn new(inner: Arc<CacheInner>, priority: Priority) -> Self {
        Self {
            inner,
            priority,
            txn: None,
            key: None,
            head: None,
            from_cache: false,
            restarted: false,
            body_complete: false,
            phase: Phase::Created,
        }
    }

    /// Runs the request up to the point where response headers are available.
    ///
    /// On return the transaction is placed: as a store reader, a writer-group
    /// member, a range plan, or a plain network fetch. `Err` means the caller
    /// gets no response at all; cache-internal trouble is not an error here,
    /// it degrades to the network instead.
    pub async fn start(&mut self, request: &RequestInfo) -> Result<(), Error> {
        if !matches!(self.phase, Phase::Created) {
            return Err(Error::Store(StoreError::Failure(
                "transaction already started".into(),
            )));
        }
        self.priority = self.priority.max(request.priority);
        let cache_only = request.load_mode == LoadMode::CacheOnly;

        if self.inner.mode() == CacheMode::Disabled {
            if cache_only {
                return self.cache_miss();
            }
            // Pure passthrough: a disabled cache performs no invalidation
            // either.
            return self.start_network(request, false).await;
        }

        let mode = transaction_mode(request);
        if mode == TransactionMode::None {
            if cache_only {
                return self.cache_miss();
            }
            return self.start_network(request, true).await;
        }

        let Ok(key) = self.inner.keys.generate(request) else {
            if cache_only {
                return self.cache_miss();
            }
            return self.start_network(request, true).await;
        };
        tracing::trace!(key = %key, method = request.method.as_str(), "transaction keyed");
        self.key = Some(key.clone());

        if self.inner.ensure_backend().await.is_err() {
            if cache_only {
                return self.cache_miss();
            }
            return self.start_network(request, true).await;
        }

        loop {
            match self.run_cached(request, mode, &key).await {
                Ok(()) => return Ok(()),
                Err(Halt::Deliver(error)) => {
                    self.detach(false);
                    self.phase = Phase::Failed(error.clone());
                    return Err(error);
                }
                Err(Halt::Network) => {
                    self.detach(false);
                    break;
                }
                Err(Halt::Retry) => {
                    self.detach(false);
                    if self.restarted {
                        tracing::debug!(key = %key, "second cache race, going to network");
                        break;
                    }
                    self.restarted = true;
                }
            }
        }
        if cache_only {
            return self.cache_miss();
        }
        self.start_network(request, true).await
    }

    /// The response head, once [`start`](CacheTransaction::start) succeeded.
    pub fn response_head(&self) -> Option<&ResponseHead> {
        self.head.as_ref()
    }

    /// Whether the response head was served from the store rather than
    /// fetched for this transaction.
    pub fn is_from_cache(&self) -> bool {
        self.from_cache
    }

    /// The cache key this transaction resolved, when it was keyable.
    pub fn cache_key(&self) -> Option<&CacheKey> {
        self.key.as_ref()
    }

    /// Reads up to `max_len` body bytes. An empty buffer means the body is
    /// complete; reading past that stays empty.
    pub async fn read(&mut self, max_len: usize) -> Result<Bytes, Error> {
        if max_len == 0 {
            return Ok(Bytes::new());
        }
        loop {
            match &mut self.phase {
                Phase::Created => {
                    return Err(Error::Store(StoreError::Failure(
                        "transaction not started".into(),
                    )));
                }
                Phase::Done => return Ok(Bytes::new()),
                Phase::Failed(error) => return Err(error.clone()),
                Phase::Network(network) => {
                    let result = network.read(max_len).await;
                    return match result {
                        Ok(chunk) if chunk.is_empty() => {
                            self.body_complete = true;
                            self.phase = Phase::Done;
                            Ok(Bytes::new())
                        }
                        Ok(chunk) => Ok(chunk),
                        Err(error) => Err(self.fail_with(Error::Network(error))),
                    };
                }
                Phase::Reader(reader) => {
                    let store = reader.store.clone();
                    let offset = reader.offset;
                    let member = reader.member;
                    let result = store.read(STREAM_RESPONSE_BODY, offset, max_len).await;
                    return match result {
                        Ok(chunk) if chunk.is_empty() => {
                            self.body_complete = true;
                            if member {
                                self.detach(true);
                            }
                            self.phase = Phase::Done;
                            Ok(Bytes::new())
                        }
                        Ok(chunk) => {
                            if let Phase::Reader(reader) = &mut self.phase {
                                reader.offset += chunk.len() as u64;
                            }
                            Ok(chunk)
                        }
                        Err(error) => Err(self.fail_with(Error::Store(error))),
                    };
                }
                Phase::SharedWriter => match self.read_shared(max_len).await? {
                    Some(chunk) => return Ok(chunk),
                    // Dissolved into a reader; go around for a store read.
                    None => continue,
                },
                Phase::Segmented(_) => return self.read_segmented(max_len).await,
            }
        }
    }

    /// Detaches from the cache. Equivalent to dropping the transaction:
    /// whether the entry keeps what was written is decided by how far the
    /// body got, not by this call.
    pub fn finish(self) {}

    // ----- classification and entry resolution ----------------------------

    async fn run_cached(
        &mut self,
        request: &RequestInfo,
        mode: TransactionMode,
        key: &CacheKey,
    ) -> Result<(), Halt> {
        let kind = match mode {
            TransactionMode::Write => {
                // Bypass loads replace whatever is stored under the key.
                match self.inner.doom_key(key) {
                    DoomStep::Done => {}
                    DoomStep::Wait(rx) => {
                        let _ = rx.await;
                    }
                }
                PendingKind::Create
            }
            TransactionMode::Read => PendingKind::Open,
            TransactionMode::ReadWrite => {
                if !request.is_range() && self.inner.known_no_store(key) {
                    // The last response for this key said no-store; don't
                    // create an entry that will only be doomed again.
                    PendingKind::Open
                } else {
                    PendingKind::OpenOrCreate
                }
            }
            TransactionMode::None => return Err(Halt::Network),
        };

        let rx = self.inner.submit_backend_op(key, kind);
        let outcome = rx.await.map_err(|_| Halt::Retry)?;
        let entry_id = match outcome {
            Ok(PendingOutcome::Entry(id)) => id,
            Ok(PendingOutcome::Doomed) => return Err(Halt::Retry),
            Err(CoordinationError::OpenFailure(StoreError::NotFound)) => {
                // Nothing stored. Read-only loads miss, the no-store
                // shortcut goes straight to the network.
                return Err(Halt::Network);
            }
            Err(error) => return Err(halt_from(error)),
        };

        let txn = self.register(mode, request);
        let (wait, short_wait) = self
            .inner
            .add_transaction(txn, entry_id)
            .map_err(halt_from)?;
        let resolution = self.bounded_wait(wait, short_wait).await?;
        if resolution != QueueResolution::Negotiate {
            return Err(Halt::Retry);
        }
        self.negotiate(request, mode, key, txn).await
    }

    fn register(&mut self, mode: TransactionMode, request: &RequestInfo) -> TxnId {
        match self.txn {
            Some(txn) => txn,
            None => {
                let txn = self.inner.register_transaction(
                    mode,
                    request.method,
                    request.is_range(),
                    self.priority,
                );
                self.txn = Some(txn);
                txn
            }
        }
    }

    /// Waits for a queue resolution, bounded by the configured lock budget.
    /// Timing out deserts the queue entirely and falls back to the network.
    async fn bounded_wait(
        &mut self,
        wait: WaitReceiver,
        short: bool,
    ) -> Result<QueueResolution, Halt> {
        let limit = if short {
            self.inner.config.range_lock_timeout
        } else {
            self.inner.config.lock_timeout
        };
        match tokio::time::timeout(limit, wait).await {
            Ok(Ok(Ok(resolution))) => Ok(resolution),
            Ok(Ok(Err(error))) => Err(halt_from(error)),
            Ok(Err(_)) => Err(Halt::Retry),
            Err(_) => {
                tracing::debug!("timed out waiting for the cache entry, going to network");
                Err(halt_from(CoordinationError::LockTimeout))
            }
        }
    }

    // ----- header negotiation ----------------------------------------------

    async fn negotiate(
        &mut self,
        request: &RequestInfo,
        mode: TransactionMode,
        key: &CacheKey,
        txn: TxnId,
    ) -> Result<(), Halt> {
        let (store, _opened) = self.inner.negotiation_view(txn).map_err(halt_from)?;

        let record = if mode.can_read() {
            self.read_envelope(txn, &store).await?
        } else {
            None
        };
        let Some(record) = record else {
            return self.handle_miss(request, mode, key, txn, &store).await;
        };

        if record.truncated {
            // The body stream is incomplete; `ranges` lists what is there.
            // Range plans can use those intervals, full requests replace the
            // entry outright.
            if request.is_range() {
                return self.range_flow(request, mode, txn, &store, record).await;
            }
            if request.load_mode == LoadMode::CacheOnly {
                return Err(Halt::Deliver(Error::NotFoundInCache));
            }
            if !mode.can_write() {
                return Err(Halt::Network);
            }
            return self.refetch(request, key, txn, &store).await;
        }

        match self.inner.policy.evaluate_stored(request, &record) {
            StoredVerdict::Fresh => {
                if request.is_range() {
                    self.range_flow(request, mode, txn, &store, record).await
                } else {
                    self.serve_hit(request, txn, record).await
                }
            }
            StoredVerdict::Revalidate { extra_headers } => {
                if request.load_mode == LoadMode::CacheOnly {
                    return Err(Halt::Deliver(Error::NotFoundInCache));
                }
                self.validate(request, mode, key, txn, &store, record, extra_headers)
                    .await
            }
            StoredVerdict::Refetch => {
                if request.load_mode == LoadMode::CacheOnly {
                    return Err(Halt::Deliver(Error::NotFoundInCache));
                }
                if request.is_range() || !mode.can_write() {
                    // Nothing useful can be done with the entry from here;
                    // leave replacing it to a writing transaction.
                    return Err(Halt::Network);
                }
                self.refetch(request, key, txn, &store).await
            }
        }
    }

    /// Reads and parses the stored envelope. An empty head stream is a miss;
    /// an unreadable one dooms the entry so the next resolution starts clean.
    async fn read_envelope(
        &mut self,
        txn: TxnId,
        store: &Arc<dyn StoreEntry>,
    ) -> Result<Option<StoredRecord>, Halt> {
        match crate::coordination::read_stored_record(store).await {
            Ok(record) => Ok(record),
            Err(error) => {
                tracing::warn!(key = %store.key(), error = %error, "unusable stored envelope, dooming entry");
                self.inner.fail_transaction_entry(txn);
                Err(Halt::Retry)
            }
        }
    }

    async fn handle_miss(
        &mut self,
        request: &RequestInfo,
        mode: TransactionMode,
        key: &CacheKey,
        txn: TxnId,
        store: &Arc<dyn StoreEntry>,
    ) -> Result<(), Halt> {
        if request.load_mode == LoadMode::CacheOnly {
            return Err(Halt::Deliver(Error::NotFoundInCache));
        }
        tracing::debug!(key = %key, "cache miss, fetching");
        let mut network = self.inner.create_network.create_transaction(self.priority);
        network
            .start(request)
            .await
            .map_err(|error| Halt::Deliver(Error::Network(error)))?;
        let head = take_head(&*network)?;
        self.maybe_invalidate(request, &head);

        if request.is_range() {
            return self
                .begin_range_write(request, mode, key, txn, store, network, head)
                .await;
        }

        let cacheable = matches!(
            self.inner.policy.classify_response(request, None, &head),
            ResponseVerdict::Replaces { cacheable: true }
        );
        if cacheable && mode.can_write() {
            self.begin_full_write(request, key, txn, store, network, head)
                .await
        } else {
            // Uncacheable, or this transaction may not write. The entry is
            // useless to everyone queued behind it.
            if head.no_store {
                self.inner.remember_no_store(key);
            }
            if mode.can_write() {
                self.inner.fail_transaction_entry(txn);
            }
            self.detach(false);
            self.serve_network(network, head);
            Ok(())
        }
    }

    /// Serves a fresh full-body hit: the stored head, then the body via the
    /// reader set or the live writer group.
    async fn serve_hit(
        &mut self,
        request: &RequestInfo,
        txn: TxnId,
        record: StoredRecord,
    ) -> Result<(), Halt> {
        tracing::debug!(txn = txn.0, "serving stored response");
        if request.method == Method::Head {
            // Head requests take the stored head and are done; they never
            // hold a place in the body machinery.
            self.head = Some(record.head);
            self.from_cache = true;
            self.body_complete = true;
            self.detach(true);
            self.phase = Phase::Done;
            return Ok(());
        }
        self.place_after_headers(txn, record.head, true).await
    }

    /// Queues for placement behind the negotiated headers and resolves into
    /// a store reader or a writer-group member.
    async fn place_after_headers(
        &mut self,
        txn: TxnId,
        head: ResponseHead,
        from_cache: bool,
    ) -> Result<(), Halt> {
        let outcome = self
            .inner
            .done_with_response_headers(txn, &head, false, &mut None)
            .map_err(halt_from)?;
        let HeadersOutcome::Queued(wait) = outcome else {
            return Err(Halt::Retry);
        };
        match self.bounded_wait(wait, false).await? {
            QueueResolution::Reader => {
                let store = self.inner.entry_store(txn).map_err(halt_from)?;
                self.phase = Phase::Reader(StoreReader {
                    store,
                    offset: 0,
                    member: true,
                });
            }
            QueueResolution::Writer => {
                self.phase = Phase::SharedWriter;
            }
            QueueResolution::NetworkOnly(pattern) => {
                tracing::trace!(txn = txn.0, ?pattern, "not placed with the entry");
                return Err(Halt::Network);
            }
            QueueResolution::Negotiate | QueueResolution::ExclusiveWriter => {
                return Err(Halt::Retry);
            }
        }
        self.head = Some(head);
        self.from_cache = from_cache;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn validate(
        &mut self,
        request: &RequestInfo,
        mode: TransactionMode,
        key: &CacheKey,
        txn: TxnId,
        store: &Arc<dyn StoreEntry>,
        record: StoredRecord,
        extra_headers: Vec<(String, String)>,
    ) -> Result<(), Halt> {
        tracing::debug!(key = %key, "revalidating stored response");
        let mut conditional = request.clone();
        conditional.extra_headers.extend(extra_headers);
        let mut network = self.inner.create_network.create_transaction(self.priority);
        network
            .start(&conditional)
            .await
            .map_err(|error| Halt::Deliver(Error::Network(error)))?;
        let head = take_head(&*network)?;
        self.maybe_invalidate(request, &head);

        match self
            .inner
            .policy
            .classify_response(request, Some(&record.head), &head)
        {
            ResponseVerdict::NotModified { updated } => {
                self.inner.forget_no_store(key);
                if mode.can_write() && self.inner.can_overwrite_entry(txn) {
                    let refreshed = StoredRecord {
                        truncated: record.truncated,
                        ranges: record.ranges.clone(),
                        head: updated.clone(),
                    };
                    if let Err(error) =
                        crate::coordination::write_stored_record(store, &refreshed).await
                    {
                        // The stored body is intact; serve it directly and
                        // let the entry go.
                        tracing::warn!(key = %key, error = %error, "failed to refresh stored head");
                        self.inner.fail_transaction_entry(txn);
                        self.detach(false);
                        self.head = Some(updated);
                        self.from_cache = true;
                        self.phase = Phase::Reader(StoreReader {
                            store: store.clone(),
                            offset: 0,
                            member: false,
                        });
                        return Ok(());
                    }
                }
                self.place_after_headers(txn, updated, true).await
            }
            ResponseVerdict::Replaces { cacheable } => {
                tracing::debug!(key = %key, cacheable, "validation produced a replacement");
                if !mode.can_write() {
                    // Read-only validators leave the entry alone.
                    self.detach(false);
                    self.serve_network(network, head);
                    return Ok(());
                }
                if cacheable {
                    self.replace_entry(request, key, network, head).await
                } else {
                    if head.no_store {
                        self.inner.remember_no_store(key);
                    }
                    self.inner.doom_entry_validation_no_match(txn);
                    self.detach(false);
                    self.serve_network(network, head);
                    Ok(())
                }
            }
        }
    }

    /// Replaces a stored response that cannot be validated: fetch anew and
    /// overwrite in place when this transaction is the entry's only user,
    /// otherwise doom and recreate.
    async fn refetch(
        &mut self,
        request: &RequestInfo,
        key: &CacheKey,
        txn: TxnId,
        store: &Arc<dyn StoreEntry>,
    ) -> Result<(), Halt> {
        tracing::debug!(key = %key, "replacing stored response");
        let mut network = self.inner.create_network.create_transaction(self.priority);
        network
            .start(request)
            .await
            .map_err(|error| Halt::Deliver(Error::Network(error)))?;
        let head = take_head(&*network)?;
        self.maybe_invalidate(request, &head);

        let cacheable = matches!(
            self.inner.policy.classify_response(request, None, &head),
            ResponseVerdict::Replaces { cacheable: true }
        );
        if !cacheable {
            if head.no_store {
                self.inner.remember_no_store(key);
            }
            self.inner.fail_transaction_entry(txn);
            self.detach(false);
            self.serve_network(network, head);
            return Ok(());
        }
        if self.inner.can_overwrite_entry(txn) {
            self.begin_full_write(request, key, txn, store, network, head)
                .await
        } else {
            self.replace_entry(request, key, network, head).await
        }
    }

    // ----- becoming a writer ----------------------------------------------

    /// Persists `head` into the entry and takes the shared writer slot,
    /// handing `network` to the writer group. Failures degrade to serving
    /// the in-hand response over the network.
    async fn begin_full_write(
        &mut self,
        request: &RequestInfo,
        key: &CacheKey,
        txn: TxnId,
        store: &Arc<dyn StoreEntry>,
        network: Box<dyn NetworkTransaction>,
        head: ResponseHead,
    ) -> Result<(), Halt> {
        if let Err(error) = reset_entry_with_head(store, &head).await {
            tracing::warn!(key = %key, error = %error, "failed to persist response head");
            self.inner.fail_transaction_entry(txn);
            self.detach(false);
            self.serve_network(network, head);
            return Ok(());
        }
        self.inner.forget_no_store(key);

        let mut slot = Some(network);
        match self
            .inner
            .done_with_response_headers(txn, &head, true, &mut slot)
        {
            Ok(HeadersOutcome::Writer) => {
                self.head = Some(head);
                self.from_cache = false;
                self.phase = Phase::SharedWriter;
                Ok(())
            }
            Ok(HeadersOutcome::MustReplace) => match slot.take() {
                Some(network) => self.replace_entry(request, key, network, head).await,
                None => Err(Halt::Retry),
            },
            Ok(HeadersOutcome::Queued(_)) => Err(Halt::Retry),
            Err(error) => match slot.take() {
                // The fetch was not consumed; the response can still be
                // served directly.
                Some(network) => {
                    self.detach(false);
                    self.serve_network(network, head);
                    Ok(())
                }
                None => Err(halt_from(error)),
            },
        }
    }

    /// Dooms the current entry (restarting its admission queue), creates a
    /// fresh one and writes the in-hand response into it. Any trouble along
    /// the way serves the response network-only instead.
    async fn replace_entry(
        &mut self,
        request: &RequestInfo,
        key: &CacheKey,
        network: Box<dyn NetworkTransaction>,
        head: ResponseHead,
    ) -> Result<(), Halt> {
        if let Some(txn) = self.txn {
            self.inner.doom_entry_validation_no_match(txn);
        }
        self.detach(false);

        let rx = self.inner.submit_backend_op(key, PendingKind::Create);
        let entry_id = match rx.await {
            Ok(Ok(PendingOutcome::Entry(id))) => id,
            _ => {
                self.serve_network(network, head);
                return Ok(());
            }
        };
        let txn = self.register(TransactionMode::ReadWrite, request);
        let placed = match self.inner.add_transaction(txn, entry_id) {
            Ok((wait, short)) => matches!(
                self.bounded_wait(wait, short).await,
                Ok(QueueResolution::Negotiate)
            ),
            Err(_) => false,
        };
        if !placed {
            self.detach(false);
            self.serve_network(network, head);
            return Ok(());
        }
        let store = match self.inner.negotiation_view(txn) {
            Ok((store, _)) => store,
            Err(_) => {
                self.detach(false);
                self.serve_network(network, head);
                return Ok(());
            }
        };
        if let Err(error) = reset_entry_with_head(&store, &head).await {
            tracing::warn!(key = %key, error = %error, "failed to persist replacement head");
            self.inner.fail_transaction_entry(txn);
            self.detach(false);
            self.serve_network(network, head);
            return Ok(());
        }
        self.inner.forget_no_store(key);

        let mut slot = Some(network);
        match self
            .inner
            .done_with_response_headers(txn, &head, true, &mut slot)
        {
            Ok(HeadersOutcome::Writer) => {
                self.head = Some(head);
                self.from_cache = false;
                self.phase = Phase::SharedWriter;
                Ok(())
            }
            _ => match slot.take() {
                Some(network) => {
                    self.detach(false);
                    self.serve_network(network, head);
                    Ok(())
                }
                None => Err(Halt::Retry),
            },
        }
    }

    // ----- range plans -----------------------------------------------------

    /// Serves a range request against an existing record: stored intervals
    /// come from the body stream, missing ones from private range fetches
    /// persisted under the exclusive writer slot.
    async fn range_flow(
        &mut self,
        request: &RequestInfo,
        mode: TransactionMode,
        txn: TxnId,
        store: &Arc<dyn StoreEntry>,
        record: StoredRecord,
    ) -> Result<(), Halt> {
        let plan: VecDeque<RangeSegment> = self
            .inner
            .policy
            .plan_range(request, &record)
            .into_iter()
            .filter(|segment| !segment.range().is_empty())
            .collect();
        if plan.is_empty() {
            return Err(Halt::Network);
        }
        let needs_network = plan
            .iter()
            .any(|segment| matches!(segment, RangeSegment::Network(_)));
        if needs_network {
            if request.load_mode == LoadMode::CacheOnly {
                return Err(Halt::Deliver(Error::NotFoundInCache));
            }
            if !mode.can_write() {
                // The exclusive slot requires write privilege; fetch the
                // whole range privately instead.
                return Err(Halt::Network);
            }
        }

        let head = record.head.clone();
        let outcome = self
            .inner
            .done_with_response_headers(txn, &head, needs_network, &mut None)
            .map_err(halt_from)?;
        let HeadersOutcome::Queued(wait) = outcome else {
            return Err(Halt::Retry);
        };
        match self.bounded_wait(wait, false).await? {
            QueueResolution::Reader if !needs_network => {}
            QueueResolution::ExclusiveWriter if needs_network => {}
            QueueResolution::NetworkOnly(pattern) => {
                tracing::trace!(txn = txn.0, ?pattern, "range not placed with the entry");
                return Err(Halt::Network);
            }
            _ => return Err(Halt::Retry),
        }
        tracing::debug!(
            txn = txn.0,
            segments = plan.len(),
            fetches = needs_network,
            "serving range plan"
        );
        self.head = Some(head);
        self.from_cache = !needs_network;
        self.phase = Phase::Segmented(SegmentFlow {
            request: request.clone(),
            store: store.clone(),
            plan,
            active: None,
            record,
            written: Vec::new(),
            persist: true,
            writer: needs_network,
        });
        Ok(())
    }

    /// A range miss: the response for the requested interval is already in
    /// hand; persist its head, take the exclusive slot and stream the body
    /// into the entry at the right offsets.
    #[allow(clippy::too_many_arguments)]
    async fn begin_range_write(
        &mut self,
        request: &RequestInfo,
        mode: TransactionMode,
        key: &CacheKey,
        txn: TxnId,
        store: &Arc<dyn StoreEntry>,
        network: Box<dyn NetworkTransaction>,
        head: ResponseHead,
    ) -> Result<(), Halt> {
        let cacheable = matches!(
            self.inner.policy.classify_response(request, None, &head),
            ResponseVerdict::Replaces { cacheable: true }
        );
        if !cacheable || !mode.can_write() {
            if head.no_store {
                self.inner.remember_no_store(key);
            }
            if mode.can_write() {
                self.inner.fail_transaction_entry(txn);
            }
            self.detach(false);
            self.serve_network(network, head);
            return Ok(());
        }

        // Mark the body stream incomplete before any byte lands, so a
        // concurrent negotiator cannot mistake it for a full body.
        let initial = StoredRecord {
            truncated: true,
            ranges: Vec::new(),
            head: head.clone(),
        };
        if let Err(error) = crate::coordination::write_stored_record(store, &initial).await {
            tracing::warn!(key = %key, error = %error, "failed to persist range head");
            self.inner.fail_transaction_entry(txn);
            self.detach(false);
            self.serve_network(network, head);
            return Ok(());
        }
        self.inner.forget_no_store(key);

        let outcome = self
            .inner
            .done_with_response_headers(txn, &head, true, &mut None);
        let placed = match outcome {
            Ok(HeadersOutcome::Queued(wait)) => matches!(
                self.bounded_wait(wait, false).await,
                Ok(QueueResolution::ExclusiveWriter)
            ),
            _ => false,
        };
        if !placed {
            self.detach(false);
            self.serve_network(network, head);
            return Ok(());
        }
        let Some(range) = request.range else {
            self.detach(false);
            self.serve_network(network, head);
            return Ok(());
        };
        self.head = Some(head.clone());
        self.from_cache = false;
        self.phase = Phase::Segmented(SegmentFlow {
            request: request.clone(),
            store: store.clone(),
            plan: VecDeque::new(),
            active: Some(ActiveSegment::Network {
                network,
                start: range.start,
                offset: range.start,
                end: range.end,
            }),
            record: initial,
            written: Vec::new(),
            persist: true,
            writer: true,
        });
        Ok(())
    }

    // ----- body streaming --------------------------------------------------

    /// One read as a writer-group member. `Ok(None)` means the group
    /// dissolved and the phase switched to a store reader.
    async fn read_shared(&mut self, max_len: usize) -> Result<Option<Bytes>, Error> {
        let Some(txn) = self.txn else {
            return Err(self.fail_with(Error::Store(StoreError::Failure(
                "writer detached from its group".into(),
            ))));
        };
        match self.inner.writer_read(txn, max_len) {
            ReadStep::Store { store, offset, len } => {
                let want = len.min(max_len);
                match store.read(STREAM_RESPONSE_BODY, offset, want).await {
                    Ok(chunk) if chunk.is_empty() => Err(self.fail_with(Error::Store(
                        StoreError::Failure("body stream ends before the flushed frontier".into()),
                    ))),
                    Ok(chunk) => {
                        self.inner.writer_consumed(txn, chunk.len());
                        Ok(Some(chunk))
                    }
                    Err(error) => Err(self.fail_with(Error::Store(error))),
                }
            }
            ReadStep::Wait(wait) => match wait.await {
                Ok(Ok(chunk)) if chunk.is_empty() => {
                    self.body_complete = true;
                    self.detach(true);
                    self.phase = Phase::Done;
                    Ok(Some(Bytes::new()))
                }
                Ok(Ok(chunk)) => Ok(Some(chunk)),
                Ok(Err(error)) => Err(self.fail_with(public_error(error))),
                Err(_) => Err(self.fail_with(Error::Store(StoreError::Failure(
                    "writer group torn down mid-read".into(),
                )))),
            },
            ReadStep::BecameReader { pos } => match self.inner.entry_store(txn) {
                Ok(store) => {
                    self.phase = Phase::Reader(StoreReader {
                        store,
                        offset: pos,
                        member: true,
                    });
                    Ok(None)
                }
                Err(error) => Err(self.fail_with(public_error(error))),
            },
            ReadStep::Failed(error) => Err(self.fail_with(public_error(error))),
        }
    }

    /// One read against the active range plan.
    async fn read_segmented(&mut self, max_len: usize) -> Result<Bytes, Error> {
        let Phase::Segmented(mut flow) = std::mem::replace(&mut self.phase, Phase::Done) else {
            return Ok(Bytes::new());
        };
        loop {
            let Some(segment) = flow.active.as_mut() else {
                match flow.plan.pop_front() {
                    None => return self.finish_segments(flow).await,
                    Some(RangeSegment::Store(range)) => {
                        flow.active = Some(ActiveSegment::Store {
                            offset: range.start,
                            end: range.end,
                        });
                    }
                    Some(RangeSegment::Network(range)) => {
                        let mut sub = flow.request.clone();
                        sub.range = Some(range);
                        let mut network =
                            self.inner.create_network.create_transaction(self.priority);
                        if let Err(error) = network.start(&sub).await {
                            return Err(self.fail_with(Error::Network(error)));
                        }
                        // The head of a sub-range fetch is consumed by the
                        // plan; the caller already has the entry's head.
                        flow.active = Some(ActiveSegment::Network {
                            network,
                            start: range.start,
                            offset: range.start,
                            end: range.end,
                        });
                    }
                }
                continue;
            };
            match segment {
                ActiveSegment::Store { offset, end } => {
                    if *offset >= *end {
                        flow.active = None;
                        continue;
                    }
                    let want = max_len.min(usize::try_from(*end - *offset).unwrap_or(usize::MAX));
                    match flow.store.read(STREAM_RESPONSE_BODY, *offset, want).await {
                        Ok(chunk) if chunk.is_empty() => {
                            return Err(self.fail_with(Error::Store(StoreError::Failure(
                                "recorded range missing from the body stream".into(),
                            ))));
                        }
                        Ok(chunk) => {
                            *offset += chunk.len() as u64;
                            if *offset >= *end {
                                flow.active = None;
                            }
                            self.phase = Phase::Segmented(flow);
                            return Ok(chunk);
                        }
                        Err(error) => return Err(self.fail_with(Error::Store(error))),
                    }
                }
                ActiveSegment::Network {
                    network,
                    start,
                    offset,
                    end,
                } => {
                    if *offset >= *end {
                        if flow.persist {
                            flow.written.push(ByteRange::new(*start, *end));
                        }
                        flow.active = None;
                        continue;
                    }
                    let want = max_len.min(usize::try_from(*end - *offset).unwrap_or(usize::MAX));
                    match network.read(want).await {
                        Ok(chunk) if chunk.is_empty() => {
                            // The origin ended before the promised interval.
                            return Err(self.fail_with(Error::Network(
                                NetworkError::ConnectionReset,
                            )));
                        }
                        Ok(chunk) => {
                            if flow.writer && flow.persist {
                                let write = flow
                                    .store
                                    .write(STREAM_RESPONSE_BODY, *offset, chunk.clone(), false)
                                    .await;
                                match write {
                                    Ok(written) if written == chunk.len() => {}
                                    _ => {
                                        tracing::warn!(
                                            key = %flow.store.key(),
                                            "range body write failed, continuing unpersisted"
                                        );
                                        flow.persist = false;
                                    }
                                }
                            }
                            *offset += chunk.len() as u64;
                            if *offset >= *end {
                                if flow.persist {
                                    flow.written.push(ByteRange::new(*start, *end));
                                }
                                flow.active = None;
                            }
                            self.phase = Phase::Segmented(flow);
                            return Ok(chunk);
                        }
                        Err(error) => return Err(self.fail_with(Error::Network(error))),
                    }
                }
            }
        }
    }

    /// The range plan is exhausted: record the freshly written intervals in
    /// the envelope and detach.
    async fn finish_segments(&mut self, mut flow: SegmentFlow) -> Result<Bytes, Error> {
        let mut success = !flow.writer || flow.persist;
        if flow.writer && flow.persist && !flow.written.is_empty() {
            flow.record.truncated = true;
            flow.record.ranges = merge_ranges(&flow.record.ranges, &flow.written);
            if let Err(error) =
                crate::coordination::write_stored_record(&flow.store, &flow.record).await
            {
                tracing::warn!(key = %flow.store.key(), error = %error, "failed to record fetched ranges");
                success = false;
            }
        }
        self.body_complete = true;
        self.detach(success);
        self.phase = Phase::Done;
        Ok(Bytes::new())
    }

    // ----- network passthrough and shared plumbing -------------------------

    /// Serves the request over a private network transaction, with the
    /// unsafe-method invalidation hook unless the cache is disabled.
    async fn start_network(&mut self, request: &RequestInfo, invalidate: bool) -> Result<(), Error> {
        tracing::trace!(method = request.method.as_str(), "serving over the network");
        let mut network = self.inner.create_network.create_transaction(self.priority);
        if let Err(error) = network.start(request).await {
            let error = Error::Network(error);
            self.phase = Phase::Failed(error.clone());
            return Err(error);
        }
        let head = match cloned_head(&*network) {
            Ok(head) => head,
            Err(error) => {
                self.phase = Phase::Failed(error.clone());
                return Err(error);
            }
        };
        if invalidate {
            self.maybe_invalidate(request, &head);
        }
        self.serve_network(network, head);
        Ok(())
    }

    fn serve_network(&mut self, network: Box<dyn NetworkTransaction>, head: ResponseHead) {
        self.head = Some(head);
        self.from_cache = false;
        self.phase = Phase::Network(network);
    }

    /// A successful response to an unsafe method invalidates the stored
    /// `GET` variant of the URL.
    fn maybe_invalidate(&self, request: &RequestInfo, head: &ResponseHead) {
        if request.method.invalidates_on_success() && head.is_success() {
            self.inner.doom_url_variant(request);
        }
    }

    fn cache_miss(&mut self) -> Result<(), Error> {
        self.phase = Phase::Failed(Error::NotFoundInCache);
        Err(Error::NotFoundInCache)
    }

    fn fail_with(&mut self, error: Error) -> Error {
        self.detach(false);
        self.phase = Phase::Failed(error.clone());
        error
    }

    fn detach(&mut self, success: bool) {
        if let Some(txn) = self.txn.take() {
            self.inner.done_with_transaction(txn, success);
        }
    }
}

impl Drop for CacheTransaction {
    fn drop(&mut self) {
        self.detach(self.body_complete);
    }
}

/// How much cache involvement the request's method and load mode allow.
fn transaction_mode(request: &RequestInfo) -> TransactionMode {
    // Unsafe methods never touch stored entries except to invalidate them;
    // POST is the exception when the caller supplies an upload id.
    if request.method.invalidates_on_success()
        && !(request.method == Method::Post && request.upload_id.is_some())
    {
        return TransactionMode::None;
    }
    let mode = match request.load_mode {
        LoadMode::Normal => TransactionMode::ReadWrite,
        LoadMode::CacheOnly => TransactionMode::Read,
        LoadMode::BypassCache => TransactionMode::Write,
    };
    if request.method == Method::Head {
        mode.without_write()
    } else {
        mode
    }
}

/// Truncates both entry streams and persists `head` as a complete record.
async fn reset_entry_with_head(
    store: &Arc<dyn StoreEntry>,
    head: &ResponseHead,
) -> Result<(), StoreError> {
    store
        .write(STREAM_RESPONSE_BODY, 0, Bytes::new(), true)
        .await?;
    crate::coordination::write_stored_record(store, &StoredRecord::complete(head.clone())).await
}

fn cloned_head(network: &dyn NetworkTransaction) -> Result<ResponseHead, Error> {
    network.response_head().cloned().ok_or_else(|| {
        Error::Network(NetworkError::Failed(
            "transport produced no response head".into(),
        ))
    })
}

fn take_head(network: &dyn NetworkTransaction) -> Result<ResponseHead, Halt> {
    cloned_head(network).map_err(Halt::Deliver)
}

/// Coalesces the recorded intervals with freshly written ones into a sorted,
/// non-overlapping list.
fn merge_ranges(existing: &[ByteRange], added: &[ByteRange]) -> Vec<ByteRange> {
    let mut all: Vec<ByteRange> = existing
        .iter()
        .chain(added)
        .copied()
        .filter(|range| !range.is_empty())
        .collect();
    all.sort_by_key(|range| range.start);
    let mut merged: Vec<ByteRange> = Vec::with_capacity(all.len());
    for range in all {
        match merged.last_mut() {
            Some(last) if range.start <= last.end => last.end = last.end.max(range.end),
            _ => merged.push(range),
        }
    }
    merged
}
