//! The coordination core.
//!
//! This module owns every piece of shared state in the engine and the rules
//! that move transactions between queues. The model:
//!
//! * All bookkeeping lives in one [`CacheState`] behind a [`Mutex`]. The
//!   lock is only ever held for pure bookkeeping; no IO and no `await`
//!   happens under it.
//! * Transactions that must wait (for the negotiator slot, for placement
//!   after headers, for bytes at the write frontier, for a backend call)
//!   park on a oneshot channel. Mutating operations collect the channels to
//!   signal into a [`Wakeups`] batch and fire it after the lock is dropped,
//!   so a woken task never contends with the operation that woke it.
//! * Work that needs IO (backend calls, shared network reads, truncation
//!   markers) is described as a [`Task`] and spawned after unlock. Spawned
//!   tasks re-lock to settle their results, which keeps them alive across
//!   caller cancellation: a transaction that vanishes mid-read cannot tear
//!   down a fetch other members are drawing from.
//!
//! Entries are arena slots addressed by [`EntryId`] and torn down by an
//! explicit emptiness check after each mutation; nothing here is reference
//! counted and there are no cycles to break.

pub(crate) mod entry;
pub(crate) mod pending;
pub(crate) mod writers;


use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use sha2::{Digest, Sha256};
use tokio::sync::oneshot;

use stowaway_store::{
    ByteRange, CacheKey, CacheStore, CreateCacheStore, CreateNetworkTransaction, HttpPolicy,
    Method, NetworkTransaction, Priority, RequestInfo, ResponseHead, STREAM_RESPONSE_BODY,
    STREAM_RESPONSE_HEAD, StoreEntry, StoreError, StoredRecord,
};

use crate::config::{CacheMode, Config};
use crate::error::CoordinationError;
use crate::keys::KeyGenerator;
use crate::transaction::CacheTransaction;

pub use self::entry::EntrySnapshot;
pub(crate) use self::entry::{
    ActiveEntry, EntryId, QueueResolution, TransactionMode, TxnId, TxnPhase, TxnRecord,
    WaitReceiver, WaitSender, WriterOutcome,
};
pub(crate) use self::pending::{PendingKind, PendingOutcome, PendingReceiver, PendingSender};
pub(crate) use self::writers::{ChunkReceiver, ChunkSender, HeadTraits, WriterGroup, WritingPattern};

use self::pending::{PendingOps, QueuedVerdict, queued_verdict};

/// The facade handed to applications.
///
/// A coordinator is cheap to clone; all clones share one state. Dropping the
/// last clone while transactions are still running is fine, because every
/// transaction holds its own reference to the shared state.
#[derive(Clone)]
pub struct CacheCoordinator {
    inner: Arc<CacheInner>,
}

impl CacheCoordinator {
    /// Creates a coordinator around the injected collaborators.
    ///
    /// The backend is not built here; construction is deferred to the first
    /// transaction that needs it, and a construction failure is remembered
    /// as permanent.
    pub fn new(
        config: Config,
        create_store: Box<dyn CreateCacheStore>,
        create_network: Box<dyn CreateNetworkTransaction>,
        policy: Box<dyn HttpPolicy>,
    ) -> Self {
        let keys = KeyGenerator::new(config.split_cache.clone());
        let no_store_keys = moka::sync::Cache::new(config.no_store_memory_capacity);
        let mode = config.mode;
        Self {
            inner: Arc::new(CacheInner {
                config,
                keys,
                create_store,
                create_network,
                policy,
                no_store_keys,
                state: Mutex::new(CacheState {
                    mode,
                    backend: BackendState::NotBuilt,
                    max_file_size: u64::MAX,
                    entries: HashMap::new(),
                    resident: HashMap::new(),
                    doomed: HashSet::new(),
                    pending: PendingOps::default(),
                    transactions: HashMap::new(),
                    next_entry_id: 0,
                    next_txn_id: 0,
                }),
            }),
        }
    }

    /// Creates a transaction. It does nothing until started.
    pub fn create_transaction(&self, priority: Priority) -> CacheTransaction {
        CacheTransaction::new(self.inner.clone(), priority)
    }

    /// The key `request` would be cached under, if it can be keyed at all.
    pub fn generate_cache_key(&self, request: &RequestInfo) -> Option<CacheKey> {
        self.inner.keys.generate(request).ok()
    }

    /// Switches between normal operation and pure passthrough. Affects only
    /// transactions started after the call.
    pub fn set_mode(&self, mode: CacheMode) {
        self.inner.lock_state().mode = mode;
    }

    /// The current cache mode.
    pub fn mode(&self) -> CacheMode {
        self.inner.lock_state().mode
    }

    /// Occupancy of the active entry for `key`, if one is resident.
    pub fn entry_snapshot(&self, key: &CacheKey) -> Option<EntrySnapshot> {
        let state = self.inner.lock_state();
        let id = *state.resident.get(key)?;
        state.entries.get(&id).map(ActiveEntry::snapshot)
    }

    /// Number of active entries, resident and doomed.
    pub fn active_entry_count(&self) -> usize {
        self.inner.lock_state().entries.len()
    }

    /// Number of doomed entries still serving transactions.
    pub fn doomed_entry_count(&self) -> usize {
        self.inner.lock_state().doomed.len()
    }

    /// Number of keys with a backend call in flight.
    pub fn pending_op_count(&self) -> usize {
        self.inner.lock_state().pending.len()
    }
}

pub(crate) struct CacheInner {
    pub config: Config,
    pub keys: KeyGenerator,
    create_store: Box<dyn CreateCacheStore>,
    pub create_network: Box<dyn CreateNetworkTransaction>,
    pub policy: Box<dyn HttpPolicy>,
    /// Digests of keys whose last response said no-store. Bounded; evicting
    /// an entry merely costs one pointless entry creation later.
    no_store_keys: moka::sync::Cache<[u8; 32], ()>,
    state: Mutex<CacheState>,
}

struct CacheState {
    mode: CacheMode,
    backend: BackendState,
    /// Largest storable body, taken from the backend once it is ready.
    max_file_size: u64,
    entries: HashMap<EntryId, ActiveEntry>,
    /// Key to arena slot, for entries that are still the live instance of
    /// their key. Doomed entries are only reachable through transactions.
    resident: HashMap<CacheKey, EntryId>,
    doomed: HashSet<EntryId>,
    pending: PendingOps,
    transactions: HashMap<TxnId, TxnRecord>,
    next_entry_id: u64,
    next_txn_id: u64,
}

enum BackendState {
    NotBuilt,
    /// Construction in flight; everyone who asked is parked here.
    Building(Vec<GateSender>),
    Ready(Arc<dyn CacheStore>),
    /// Construction failed. The failure is permanent: every later
    /// transaction passes straight through to the network.
    Failed,
}

type GateSender = oneshot::Sender<Result<(), CoordinationError>>;
type GateReceiver = oneshot::Receiver<Result<(), CoordinationError>>;

/// Notifications and follow-up work collected under the lock and fired
/// after it is released.
#[derive(Default)]
struct Wakeups {
    waits: Vec<(WaitSender, Result<QueueResolution, CoordinationError>)>,
    pendings: Vec<(PendingSender, Result<PendingOutcome, CoordinationError>)>,
    chunks: Vec<(ChunkSender, Result<Bytes, CoordinationError>)>,
    gates: Vec<(GateSender, Result<(), CoordinationError>)>,
    tasks: Vec<Task>,
}

impl Wakeups {
    fn wake(&mut self, record: &mut TxnRecord, result: Result<QueueResolution, CoordinationError>) {
        if let Some(tx) = record.waiter.take() {
            self.waits.push((tx, result));
        }
    }
}

/// Deferred IO, spawned once the state lock is released.
enum Task {
    BuildBackend,
    Backend {
        key: CacheKey,
        kind: PendingKind,
    },
    Round {
        entry: EntryId,
    },
    /// Rewrite the envelope of an interrupted download as a resumable
    /// prefix.
    Truncate {
        store: Arc<dyn StoreEntry>,
        flushed: u64,
    },
}

/// What the coordinator told a negotiator that finished its headers.
pub(crate) enum HeadersOutcome {
    /// The transaction now writes the body through a writer group it
    /// created (or, for ranges revisiting their entry, already belongs to).
    Writer,
    /// Parked in the post-headers queue; the wait resolves to a placement.
    Queued(WaitReceiver),
    /// The transaction has a replacement response but the entry is shared;
    /// it must doom the entry and recreate it to write.
    MustReplace,
}

/// One step of a writer-group read, as instructed by the coordinator.
pub(crate) enum ReadStep {
    /// Read from the store at `offset`, at most `len` bytes, then report
    /// the consumed amount.
    Store {
        store: Arc<dyn StoreEntry>,
        offset: u64,
        len: usize,
    },
    /// Park for the next frontier chunk.
    Wait(ChunkReceiver),
    /// The group dissolved; continue as a reader from `pos`.
    BecameReader {
        pos: u64,
    },
    Failed(CoordinationError),
}

/// Outcome of asking for an entry to be doomed.
pub(crate) enum DoomStep {
    /// Doomed synchronously (the key was active) or nothing to doom.
    Done,
    /// A backend doom is in flight.
    Wait(PendingReceiver),
}

impl CacheInner {
    fn lock_state(&self) -> MutexGuard<'_, CacheState> {
        // A poisoned lock means a panic mid-bookkeeping; the state is still
        // structurally sound, and refusing to run drop handlers would turn
        // one panic into an abort.
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn fire(self: &Arc<Self>, wakeups: Wakeups) {
        for (tx, result) in wakeups.waits {
            let _ = tx.send(result);
        }
        for (tx, result) in wakeups.pendings {
            let _ = tx.send(result);
        }
        for (tx, result) in wakeups.chunks {
            let _ = tx.send(result);
        }
        for (tx, result) in wakeups.gates {
            let _ = tx.send(result);
        }
        if wakeups.tasks.is_empty() {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            // Firing from a drop outside the runtime. No IO can run here; a
            // prefix that cannot be marked truncated must not survive as a
            // seemingly complete entry.
            for task in wakeups.tasks {
                if let Task::Truncate { store, .. } = task {
                    store.doom();
                }
            }
            return;
        };
        for task in wakeups.tasks {
            let inner = self.clone();
            match task {
                Task::BuildBackend => {
                    handle.spawn(build_backend(inner));
                }
                Task::Backend { key, kind } => {
                    handle.spawn(run_backend_op(inner, key, kind));
                }
                Task::Round { entry } => {
                    handle.spawn(run_read_round(inner, entry));
                }
                Task::Truncate { store, flushed } => {
                    handle.spawn(write_truncation_marker(store, flushed));
                }
            }
        }
    }

    pub fn mode(&self) -> CacheMode {
        self.lock_state().mode
    }

    // ----- transaction registry ------------------------------------------

    pub fn register_transaction(
        &self,
        mode: TransactionMode,
        method: Method,
        is_partial: bool,
        priority: Priority,
    ) -> TxnId {
        let mut state = self.lock_state();
        let id = TxnId(state.next_txn_id);
        state.next_txn_id += 1;
        state
            .transactions
            .insert(id, TxnRecord::new(mode, method, is_partial, priority));
        id
    }

    // ----- backend gate ---------------------------------------------------

    /// Waits until the backend is usable. The first caller triggers
    /// construction; a recorded failure is returned immediately forever
    /// after.
    pub async fn ensure_backend(self: &Arc<Self>) -> Result<(), CoordinationError> {
        let rx = {
            let mut wakeups = Wakeups::default();
            let mut state = self.lock_state();
            let rx = match &mut state.backend {
                BackendState::Ready(_) => None,
                BackendState::Failed => return Err(CoordinationError::BackendUnavailable),
                BackendState::NotBuilt => {
                    let (tx, rx) = oneshot::channel();
                    state.backend = BackendState::Building(vec![tx]);
                    wakeups.tasks.push(Task::BuildBackend);
                    Some(rx)
                }
                BackendState::Building(waiters) => {
                    let (tx, rx) = oneshot::channel();
                    waiters.push(tx);
                    Some(rx)
                }
            };
            drop(state);
            self.fire(wakeups);
            rx
        };
        match rx {
            None => Ok(()),
            Some(rx) => rx
                .await
                .unwrap_or(Err(CoordinationError::BackendUnavailable)),
        }
    }

    fn ready_store(&self) -> Option<Arc<dyn CacheStore>> {
        match &self.lock_state().backend {
            BackendState::Ready(store) => Some(store.clone()),
            _ => None,
        }
    }

    // ----- key resolution -------------------------------------------------

    /// The resident entry for `key`, if any.
    pub fn lookup_active(&self, key: &CacheKey) -> Option<EntryId> {
        self.lock_state().resident.get(key).copied()
    }

    /// Queues a backend call for `key`, coalescing with any call already in
    /// flight. If the key is active the call is settled immediately against
    /// the live entry instead of going to the backend.
    pub fn submit_backend_op(self: &Arc<Self>, key: &CacheKey, kind: PendingKind) -> PendingReceiver {
        let (tx, rx) = oneshot::channel();
        let mut wakeups = Wakeups::default();
        {
            let mut state = self.lock_state();
            if let Some(&id) = state.resident.get(key) {
                match kind {
                    PendingKind::Open | PendingKind::OpenOrCreate => {
                        wakeups.pendings.push((tx, Ok(PendingOutcome::Entry(id))));
                    }
                    // The key is live, so a create has lost its race.
                    PendingKind::Create => {
                        wakeups.pendings.push((tx, Err(CoordinationError::CacheRace)));
                    }
                    PendingKind::Doom => {
                        doom_active_entry(&mut state, id);
                        wakeups.pendings.push((tx, Ok(PendingOutcome::Doomed)));
                    }
                }
            } else if state.pending.submit(key, kind, tx) {
                wakeups.tasks.push(Task::Backend {
                    key: key.clone(),
                    kind,
                });
            }
            drain_scheduled(&mut state, &mut wakeups);
        }
        self.fire(wakeups);
        rx
    }

    /// Dooms whatever is stored under `key`.
    pub fn doom_key(self: &Arc<Self>, key: &CacheKey) -> DoomStep {
        let mut wakeups = Wakeups::default();
        let step = {
            let mut state = self.lock_state();
            if let Some(&id) = state.resident.get(key) {
                doom_active_entry(&mut state, id);
                DoomStep::Done
            } else if matches!(state.backend, BackendState::Ready(_)) {
                let (tx, rx) = oneshot::channel();
                if state.pending.submit(key, PendingKind::Doom, tx) {
                    wakeups.tasks.push(Task::Backend {
                        key: key.clone(),
                        kind: PendingKind::Doom,
                    });
                }
                DoomStep::Wait(rx)
            } else {
                // Nothing stored anywhere reachable.
                DoomStep::Done
            }
        };
        self.fire(wakeups);
        step
    }

    /// Invalidates the `GET` variant of `request`'s URL, used after a
    /// successful unsafe-method response. Fire and forget.
    pub fn doom_url_variant(self: &Arc<Self>, request: &RequestInfo) {
        let mut variant = request.clone();
        variant.method = Method::Get;
        variant.upload_id = None;
        variant.range = None;
        let Ok(key) = self.keys.generate(&variant) else {
            return;
        };
        tracing::debug!(key = %key, "invalidating cached variant");
        match self.doom_key(&key) {
            DoomStep::Done => {}
            DoomStep::Wait(rx) => {
                // Completion bookkeeping happens in the pending table; the
                // result itself is of no interest to anybody.
                drop(rx);
            }
        }
    }

    // ----- no-store key memory -------------------------------------------

    pub fn remember_no_store(&self, key: &CacheKey) {
        self.no_store_keys.insert(no_store_digest(key), ());
    }

    pub fn forget_no_store(&self, key: &CacheKey) {
        self.no_store_keys.invalidate(&no_store_digest(key));
    }

    pub fn known_no_store(&self, key: &CacheKey) -> bool {
        self.no_store_keys.get(&no_store_digest(key)).is_some()
    }

    // ----- admission ------------------------------------------------------

    /// Attaches `txn` to an entry's admission queue.
    ///
    /// Returns the wait plus whether the short range-writer timeout applies
    /// to it. Fails with a race when the entry disappeared between
    /// resolution and attachment.
    pub fn add_transaction(
        self: &Arc<Self>,
        txn: TxnId,
        entry_id: EntryId,
    ) -> Result<(WaitReceiver, bool), CoordinationError> {
        let mut wakeups = Wakeups::default();
        let result = {
            let mut state = self.lock_state();
            if !state.entries.contains_key(&entry_id) {
                return Err(CoordinationError::CacheRace);
            }
            let (tx, rx) = oneshot::channel();
            let is_partial = match state.transactions.get_mut(&txn) {
                Some(record) => {
                    record.entry = Some(entry_id);
                    record.phase = TxnPhase::Queued;
                    record.waiter = Some(tx);
                    record.is_partial
                }
                None => return Err(CoordinationError::CacheRace),
            };
            let entry = match state.entries.get_mut(&entry_id) {
                Some(entry) => entry,
                None => return Err(CoordinationError::CacheRace),
            };
            entry.admission_queue.push_back(txn);
            let short_wait = is_partial
                && entry
                    .writer_group
                    .as_ref()
                    .is_some_and(WriterGroup::is_exclusive);
            schedule_processing(entry);
            drain_scheduled(&mut state, &mut wakeups);
            Ok((rx, short_wait))
        };
        self.fire(wakeups);
        result
    }

    // ----- negotiation ----------------------------------------------------

    /// The store handle and open state a negotiator works against.
    pub fn negotiation_view(
        &self,
        txn: TxnId,
    ) -> Result<(Arc<dyn StoreEntry>, bool), CoordinationError> {
        let mut state = self.lock_state();
        let state = &mut *state;
        let Some(record) = state.transactions.get_mut(&txn) else {
            return Err(CoordinationError::CacheRace);
        };
        if let Some(error) = record.restart.take() {
            return Err(error);
        }
        let entry = record
            .entry
            .and_then(|id| state.entries.get(&id))
            .ok_or(CoordinationError::CacheRace)?;
        Ok((entry.store.clone(), entry.opened))
    }

    /// Whether `txn`, as negotiator, may overwrite the stored response in
    /// place. Requires sole ownership: no writers, no readers, nobody
    /// already placed after headers.
    pub fn can_overwrite_entry(&self, txn: TxnId) -> bool {
        let state = self.lock_state();
        let Some(record) = state.transactions.get(&txn) else {
            return false;
        };
        let Some(entry) = record.entry.and_then(|id| state.entries.get(&id)) else {
            return false;
        };
        entry.headers_negotiator == Some(txn)
            && entry.writer_group.is_none()
            && entry.readers.is_empty()
            && entry.post_headers_queue.is_empty()
    }

    /// Settles a negotiator that has its final response head.
    ///
    /// With `will_write_body` the transaction wants to stream a new body
    /// into the entry: it either becomes the writer group on the spot
    /// (taking `network` as the group's fetch), is queued for an exclusive
    /// range-writer slot, or learns that the entry is shared and must be
    /// replaced. Without it the transaction is placed via the post-headers
    /// queue.
    pub fn done_with_response_headers(
        self: &Arc<Self>,
        txn: TxnId,
        head: &ResponseHead,
        will_write_body: bool,
        network: &mut Option<Box<dyn NetworkTransaction>>,
    ) -> Result<HeadersOutcome, CoordinationError> {
        let mut wakeups = Wakeups::default();
        let result = {
            let mut state = self.lock_state();
            let state = &mut *state;
            let Some(record) = state.transactions.get_mut(&txn) else {
                return Err(CoordinationError::CacheRace);
            };
            if let Some(error) = record.restart.take() {
                return Err(error);
            }
            let Some(entry_id) = record.entry else {
                return Err(CoordinationError::CacheRace);
            };
            let Some(entry) = state.entries.get_mut(&entry_id) else {
                return Err(CoordinationError::CacheRace);
            };

            // Range transactions revisit headers for every segment; if the
            // entry is already theirs there is nothing to place.
            if entry
                .writer_group
                .as_ref()
                .is_some_and(|group| group.is_member(txn))
            {
                Ok(HeadersOutcome::Writer)
            } else if entry.headers_negotiator != Some(txn) {
                Err(CoordinationError::CacheRace)
            } else if will_write_body && !record.is_partial {
                let sole_owner = entry.writer_group.is_none()
                    && entry.readers.is_empty()
                    && entry.post_headers_queue.is_empty();
                if !sole_owner {
                    // Keep the negotiator slot; the caller dooms the entry
                    // next and detaches through the usual path.
                    Ok(HeadersOutcome::MustReplace)
                } else if let Some(network) = network.take() {
                    entry.headers_negotiator = None;
                    entry.writer_group = Some(WriterGroup::new_shared(
                        network,
                        HeadTraits::of(head),
                        txn,
                        record.priority,
                    ));
                    record.phase = TxnPhase::Writer;
                    tracing::trace!(txn = txn.0, key = %entry.key, "transaction created writer group");
                    schedule_processing(entry);
                    Ok(HeadersOutcome::Writer)
                } else {
                    tracing::error!(txn = txn.0, "writer has no network transaction to share");
                    Err(CoordinationError::CacheRace)
                }
            } else {
                // Placement decisions interleave with the state of the
                // writer group, so both body writers for ranges and plain
                // consumers go through the post-headers queue.
                entry.headers_negotiator = None;
                let (tx, rx) = oneshot::channel();
                record.phase = TxnPhase::PostHeaders;
                record.waiter = Some(tx);
                record.head_traits = Some(HeadTraits::of(head));
                entry.post_headers_queue.push_back(txn);
                schedule_processing(entry);
                Ok(HeadersOutcome::Queued(rx))
            }
        };
        let result = result.inspect(|_| {
            let mut state = self.lock_state();
            drain_scheduled(&mut state, &mut wakeups);
        });
        self.fire(wakeups);
        result
    }

    /// Dooms the entry because validation produced a different resource,
    /// and restarts everything still waiting for admission so it re-resolves
    /// against a fresh entry. The negotiator itself stays attached; it
    /// detaches through the normal path once it has re-planned.
    pub fn doom_entry_validation_no_match(self: &Arc<Self>, txn: TxnId) {
        let mut wakeups = Wakeups::default();
        {
            let mut state = self.lock_state();
            let state_ref = &mut *state;
            let Some(record) = state_ref.transactions.get(&txn) else {
                return;
            };
            let Some(entry_id) = record.entry else {
                return;
            };
            doom_active_entry(state_ref, entry_id);
            let Some(entry) = state_ref.entries.get_mut(&entry_id) else {
                return;
            };
            let waiting: Vec<TxnId> = entry.admission_queue.drain(..).collect();
            for waiting_txn in waiting {
                if let Some(waiting_record) = state_ref.transactions.get_mut(&waiting_txn) {
                    waiting_record.phase = TxnPhase::Idle;
                    waiting_record.entry = None;
                    wakeups.wake(waiting_record, Err(CoordinationError::CacheRace));
                }
            }
            if let Some(entry) = state_ref.entries.get_mut(&entry_id) {
                schedule_processing(entry);
            }
            drain_scheduled(&mut state, &mut wakeups);
        }
        self.fire(wakeups);
    }

    /// Dooms `txn`'s entry and restarts everything queued on it, used when
    /// the stored record turned out to be unusable (corrupt envelope,
    /// uncacheable replacement) and nobody should keep waiting for it.
    pub fn fail_transaction_entry(self: &Arc<Self>, txn: TxnId) {
        let mut wakeups = Wakeups::default();
        {
            let mut state = self.lock_state();
            let state_ref = &mut *state;
            let Some(record) = state_ref.transactions.get(&txn) else {
                return;
            };
            let Some(entry_id) = record.entry else {
                return;
            };
            fail_entry(state_ref, entry_id, &mut wakeups);
            drain_scheduled(&mut state, &mut wakeups);
        }
        self.fire(wakeups);
    }

    // ----- writer-group reads --------------------------------------------

    /// Plans the next read for a writer-group member.
    pub fn writer_read(self: &Arc<Self>, txn: TxnId, max_len: usize) -> ReadStep {
        let mut wakeups = Wakeups::default();
        let step = {
            let mut state = self.lock_state();
            let state = &mut *state;
            let Some(record) = state.transactions.get_mut(&txn) else {
                return ReadStep::Failed(CoordinationError::CacheRace);
            };
            if let Some(outcome) = record.writer_outcome.take() {
                match outcome {
                    WriterOutcome::BecameReader { pos } => return ReadStep::BecameReader { pos },
                    WriterOutcome::Failed(error) => return ReadStep::Failed(error),
                }
            }
            let Some(entry_id) = record.entry else {
                return ReadStep::Failed(CoordinationError::CacheRace);
            };
            let Some(entry) = state.entries.get_mut(&entry_id) else {
                return ReadStep::Failed(CoordinationError::CacheRace);
            };
            let store = entry.store.clone();
            let Some(group) = entry.writer_group.as_mut() else {
                return ReadStep::Failed(CoordinationError::CacheRace);
            };
            if let Some(error) = group.failure() {
                return ReadStep::Failed(error.clone());
            }
            let Some(pos) = group.member_pos(txn) else {
                return ReadStep::Failed(CoordinationError::CacheRace);
            };
            if pos < group.flushed_pos {
                // Lagging member: the bytes are durable, read them directly.
                let len = usize::try_from(group.flushed_pos - pos)
                    .unwrap_or(usize::MAX)
                    .min(max_len);
                ReadStep::Store {
                    store,
                    offset: pos,
                    len,
                }
            } else if pos < group.network_pos {
                // Bytes consumed from the network but never persisted; only
                // possible after a write failure.
                let error = group
                    .write_failure()
                    .cloned()
                    .unwrap_or(StoreError::Failure("cache writes disabled".into()));
                ReadStep::Failed(CoordinationError::WriteFailure(error))
            } else {
                let (tx, rx) = oneshot::channel();
                group.queue_waiter(txn, max_len, tx);
                if group.can_start_round() {
                    wakeups.tasks.push(Task::Round { entry: entry_id });
                }
                ReadStep::Wait(rx)
            }
        };
        self.fire(wakeups);
        step
    }

    /// Reports how many catch-up bytes a member actually consumed.
    pub fn writer_consumed(&self, txn: TxnId, read: usize) {
        let mut state = self.lock_state();
        let state = &mut *state;
        let Some(record) = state.transactions.get(&txn) else {
            return;
        };
        if let Some(group) = record
            .entry
            .and_then(|id| state.entries.get_mut(&id))
            .and_then(|entry| entry.writer_group.as_mut())
        {
            group.advance_member(txn, read);
        }
    }

    /// The store handle a reader or range writer streams through.
    pub fn entry_store(&self, txn: TxnId) -> Result<Arc<dyn StoreEntry>, CoordinationError> {
        let state = self.lock_state();
        let Some(record) = state.transactions.get(&txn) else {
            return Err(CoordinationError::CacheRace);
        };
        record
            .entry
            .and_then(|id| state.entries.get(&id))
            .map(|entry| entry.store.clone())
            .ok_or(CoordinationError::CacheRace)
    }

    // ----- transaction completion ----------------------------------------

    /// Detaches `txn` from its entry and the registry. `success` reports
    /// whether the transaction finished its job; it matters only for writer
    /// members, where an early exit decides between keeping a resumable
    /// prefix and dooming the entry.
    pub fn done_with_transaction(self: &Arc<Self>, txn: TxnId, success: bool) {
        let mut wakeups = Wakeups::default();
        {
            let mut state = self.lock_state();
            let state_ref = &mut *state;
            let Some(record) = state_ref.transactions.remove(&txn) else {
                return;
            };
            let Some(entry_id) = record.entry else {
                drain_scheduled(&mut state, &mut wakeups);
                drop(state);
                self.fire(wakeups);
                return;
            };
            if let Some(entry) = state_ref.entries.get_mut(&entry_id) {
                match record.phase {
                    TxnPhase::Idle => {}
                    TxnPhase::Queued | TxnPhase::PostHeaders => {
                        entry.remove_queued(txn);
                        schedule_processing(entry);
                    }
                    TxnPhase::Negotiating => {
                        if entry.headers_negotiator == Some(txn) {
                            entry.headers_negotiator = None;
                        }
                        schedule_processing(entry);
                    }
                    TxnPhase::Reader => {
                        entry.readers.remove(&txn);
                        schedule_processing(entry);
                    }
                    TxnPhase::Writer => {
                        finish_writer_member(state_ref, entry_id, txn, success, &mut wakeups);
                    }
                }
            }
            drain_scheduled(&mut state, &mut wakeups);
        }
        self.fire(wakeups);
    }
}

// ----- helpers operating on the locked state ------------------------------

fn no_store_digest(key: &CacheKey) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(key.as_str().as_bytes());
    hasher.finalize().into()
}

fn activate_entry(
    state: &mut CacheState,
    key: &CacheKey,
    store: Arc<dyn StoreEntry>,
    opened: bool,
) -> EntryId {
    let id = EntryId(state.next_entry_id);
    state.next_entry_id += 1;
    state
        .entries
        .insert(id, ActiveEntry::new(key.clone(), store, opened));
    state.resident.insert(key.clone(), id);
    tracing::trace!(key = %key, entry = id.0, opened, "entry activated");
    id
}

fn doom_active_entry(state: &mut CacheState, id: EntryId) {
    let Some(entry) = state.entries.get_mut(&id) else {
        return;
    };
    if entry.doomed {
        return;
    }
    entry.doomed = true;
    entry.store.doom();
    if state.resident.get(&entry.key) == Some(&id) {
        state.resident.remove(&entry.key);
    }
    state.doomed.insert(id);
    tracing::debug!(key = %entry.key, entry = id.0, "entry doomed");
}

fn deactivate_entry(state: &mut CacheState, id: EntryId) {
    if let Some(entry) = state.entries.remove(&id) {
        if state.resident.get(&entry.key) == Some(&id) {
            state.resident.remove(&entry.key);
        }
        state.doomed.remove(&id);
        tracing::trace!(key = %entry.key, entry = id.0, "entry deactivated");
    }
}

fn schedule_processing(entry: &mut ActiveEntry) {
    entry.process_scheduled = true;
}

/// Dooms the entry and restarts everything that was not yet placed:
/// admission and post-headers waiters are raced so they re-resolve, and a
/// negotiator mid-flight finds the race at its next engine call. Writer
/// members and readers are left alone; they continue against the doomed
/// entry.
fn fail_entry(state: &mut CacheState, id: EntryId, wakeups: &mut Wakeups) {
    doom_active_entry(state, id);
    let Some(entry) = state.entries.get_mut(&id) else {
        return;
    };
    let waiting: Vec<TxnId> = entry
        .admission_queue
        .drain(..)
        .chain(entry.post_headers_queue.drain(..))
        .collect();
    let negotiator = entry.headers_negotiator;
    schedule_processing(entry);
    for txn in waiting {
        if let Some(record) = state.transactions.get_mut(&txn) {
            record.phase = TxnPhase::Idle;
            record.entry = None;
            wakeups.wake(record, Err(CoordinationError::CacheRace));
        }
    }
    if let Some(txn) = negotiator {
        if let Some(record) = state.transactions.get_mut(&txn) {
            record.restart = Some(CoordinationError::CacheRace);
        }
    }
}

/// Converts writer-group members into readers once the network body ended.
///
/// When the group stopped persisting, members behind the network frontier
/// can never be completed: the bytes between the durable frontier and the
/// network frontier exist nowhere. Those members fail instead of becoming
/// readers of a stream that would end short.
fn dissolve_group_into_readers(state: &mut CacheState, id: EntryId, _wakeups: &mut Wakeups) {
    let Some(entry) = state.entries.get_mut(&id) else {
        return;
    };
    let Some(group) = entry.writer_group.take() else {
        return;
    };
    let key = entry.key.clone();
    schedule_processing(entry);

    let read_only = group.is_network_read_only();
    let mut readers = Vec::new();
    for txn in group.member_ids() {
        let pos = group.member_pos(txn).unwrap_or(0);
        let Some(record) = state.transactions.get_mut(&txn) else {
            continue;
        };
        if read_only && pos < group.network_pos {
            let error = group
                .write_failure()
                .cloned()
                .unwrap_or(StoreError::Failure("cache writes disabled".into()));
            record.phase = TxnPhase::Idle;
            record.writer_outcome =
                Some(WriterOutcome::Failed(CoordinationError::WriteFailure(error)));
        } else {
            record.phase = TxnPhase::Reader;
            record.writer_outcome = Some(WriterOutcome::BecameReader { pos });
            readers.push(txn);
        }
    }
    if let Some(entry) = state.entries.get_mut(&id) {
        entry.readers.extend(readers.iter().copied());
    }
    tracing::trace!(key = %key, entry = id.0, readers = readers.len(), "writer group dissolved");
}

/// Handles a writer-group member detaching before the body completed.
fn finish_writer_member(
    state: &mut CacheState,
    entry_id: EntryId,
    txn: TxnId,
    success: bool,
    wakeups: &mut Wakeups,
) {
    let Some(entry) = state.entries.get_mut(&entry_id) else {
        return;
    };
    let Some(group) = entry.writer_group.as_mut() else {
        return;
    };
    group.remove_member(txn);
    if !group.is_empty() {
        return;
    }

    // Last member gone with the network body incomplete.
    let exclusive = group.is_exclusive();
    let failed = group.failure().is_some() || group.is_network_read_only();
    let traits = group.traits();
    let flushed = group.flushed_pos;
    let store = entry.store.clone();
    entry.writer_group = None;
    schedule_processing(entry);

    let keep = if exclusive {
        // Range writers commit their intervals themselves; an unsuccessful
        // one leaves the entry inconsistent.
        success
    } else {
        !failed && flushed > 0 && traits.supports_resumption()
    };

    if keep {
        if !exclusive {
            tracing::debug!(entry = entry_id.0, flushed, "keeping interrupted download as resumable prefix");
            wakeups.tasks.push(Task::Truncate { store, flushed });
            // Whoever is still queued must re-resolve: the body they were
            // promised will not complete.
            restart_waiters_only(state, entry_id, wakeups);
        }
    } else {
        fail_entry(state, entry_id, wakeups);
    }
}

/// Races queued waiters without dooming the entry, used when the entry
/// remains valid (as a truncated prefix) but cannot serve them.
fn restart_waiters_only(state: &mut CacheState, id: EntryId, wakeups: &mut Wakeups) {
    let Some(entry) = state.entries.get_mut(&id) else {
        return;
    };
    let waiting: Vec<TxnId> = entry
        .admission_queue
        .drain(..)
        .chain(entry.post_headers_queue.drain(..))
        .collect();
    let negotiator = entry.headers_negotiator;
    for txn in waiting {
        if let Some(record) = state.transactions.get_mut(&txn) {
            record.phase = TxnPhase::Idle;
            record.entry = None;
            wakeups.wake(record, Err(CoordinationError::CacheRace));
        }
    }
    if let Some(txn) = negotiator {
        if let Some(record) = state.transactions.get_mut(&txn) {
            record.restart = Some(CoordinationError::CacheRace);
        }
    }
}

/// What queue processing decided to do with an entry in one step.
enum QueueAction {
    Deactivate,
    PlaceReader(TxnId),
    PlaceJoiner(TxnId),
    PlaceExclusive(TxnId),
    RejectWriter(TxnId, WritingPattern),
    Promote(TxnId),
    Blocked,
}

/// Runs queue processing for every entry flagged since the last drain.
/// Always called right before the state lock is released.
fn drain_scheduled(state: &mut CacheState, wakeups: &mut Wakeups) {
    loop {
        let Some(id) = state
            .entries
            .iter()
            .find(|(_, entry)| entry.process_scheduled)
            .map(|(id, _)| *id)
        else {
            return;
        };
        if let Some(entry) = state.entries.get_mut(&id) {
            entry.process_scheduled = false;
        }
        process_entry_queues(state, id, wakeups);
    }
}

fn process_entry_queues(state: &mut CacheState, id: EntryId, wakeups: &mut Wakeups) {
    loop {
        let action = decide_queue_action(state, id);
        match action {
            QueueAction::Deactivate => {
                deactivate_entry(state, id);
                return;
            }
            QueueAction::Blocked => return,
            QueueAction::PlaceReader(txn) => {
                let Some(entry) = state.entries.get_mut(&id) else {
                    return;
                };
                entry.post_headers_queue.pop_front();
                entry.readers.insert(txn);
                if let Some(record) = state.transactions.get_mut(&txn) {
                    record.phase = TxnPhase::Reader;
                    wakeups.wake(record, Ok(QueueResolution::Reader));
                }
            }
            QueueAction::PlaceJoiner(txn) => {
                let Some(entry) = state.entries.get_mut(&id) else {
                    return;
                };
                entry.post_headers_queue.pop_front();
                let priority = state
                    .transactions
                    .get(&txn)
                    .map(|record| record.priority)
                    .unwrap_or_default();
                if let Some(group) = entry.writer_group.as_mut() {
                    group.add_member(txn, WritingPattern::Joined, priority);
                }
                if let Some(record) = state.transactions.get_mut(&txn) {
                    record.phase = TxnPhase::Writer;
                    wakeups.wake(record, Ok(QueueResolution::Writer));
                }
                tracing::trace!(txn = txn.0, entry = id.0, "transaction joined writer group");
            }
            QueueAction::PlaceExclusive(txn) => {
                let Some(entry) = state.entries.get_mut(&id) else {
                    return;
                };
                entry.post_headers_queue.pop_front();
                let (traits, priority) = match state.transactions.get(&txn) {
                    Some(record) => (
                        record.head_traits.unwrap_or(HeadTraits {
                            has_strong_validators: false,
                            accepts_byte_ranges: false,
                            no_store: false,
                            content_length: None,
                        }),
                        record.priority,
                    ),
                    None => continue,
                };
                entry.writer_group = Some(WriterGroup::new_exclusive(traits, txn, priority));
                if let Some(record) = state.transactions.get_mut(&txn) {
                    record.phase = TxnPhase::Writer;
                    wakeups.wake(record, Ok(QueueResolution::ExclusiveWriter));
                }
                tracing::trace!(txn = txn.0, entry = id.0, "exclusive range writer placed");
            }
            QueueAction::RejectWriter(txn, pattern) => {
                let Some(entry) = state.entries.get_mut(&id) else {
                    return;
                };
                entry.post_headers_queue.pop_front();
                if let Some(record) = state.transactions.get_mut(&txn) {
                    record.phase = TxnPhase::Idle;
                    record.entry = None;
                    wakeups.wake(record, Ok(QueueResolution::NetworkOnly(pattern)));
                }
                tracing::trace!(txn = txn.0, entry = id.0, ?pattern, "writer candidate rejected");
            }
            QueueAction::Promote(txn) => {
                let Some(entry) = state.entries.get_mut(&id) else {
                    return;
                };
                entry.admission_queue.pop_front();
                entry.headers_negotiator = Some(txn);
                if let Some(record) = state.transactions.get_mut(&txn) {
                    record.phase = TxnPhase::Negotiating;
                    wakeups.wake(record, Ok(QueueResolution::Negotiate));
                }
                tracing::trace!(txn = txn.0, entry = id.0, "transaction promoted to negotiator");
            }
        }
    }
}

fn decide_queue_action(state: &CacheState, id: EntryId) -> QueueAction {
    let Some(entry) = state.entries.get(&id) else {
        return QueueAction::Blocked;
    };
    if !entry.has_transactions() {
        return QueueAction::Deactivate;
    }

    // Post-headers placements run before admissions so completed
    // negotiations settle in arrival order.
    if let Some(&head) = entry.post_headers_queue.front() {
        if let Some(record) = state.transactions.get(&head) {
            match entry.writer_group.as_ref() {
                Some(group) if !group.is_empty() => {
                    let pattern = group.can_join(
                        record.method,
                        record.is_partial,
                        record.mode.can_write(),
                        state.max_file_size,
                    );
                    if pattern == WritingPattern::Joined {
                        return QueueAction::PlaceJoiner(head);
                    }
                    // Rejected writer candidates finish over the network on
                    // their own instead of stalling behind the group.
                    return QueueAction::RejectWriter(head, pattern);
                }
                _ => {
                    if record.mode.can_write() && record.is_partial {
                        if entry.readers.is_empty() {
                            return QueueAction::PlaceExclusive(head);
                        }
                        // Wait for readers to drain.
                    } else {
                        return QueueAction::PlaceReader(head);
                    }
                }
            }
        }
    }

    if entry.headers_negotiator.is_none() {
        if let Some(&front) = entry.admission_queue.front() {
            return QueueAction::Promote(front);
        }
    }

    QueueAction::Blocked
}

// ----- spawned tasks ------------------------------------------------------

async fn build_backend(inner: Arc<CacheInner>) {
    let result = inner.create_store.create_store().await;
    let mut wakeups = Wakeups::default();
    {
        let mut state = inner.lock_state();
        let waiters = match std::mem::replace(&mut state.backend, BackendState::NotBuilt) {
            BackendState::Building(waiters) => waiters,
            other => {
                state.backend = other;
                return;
            }
        };
        match result {
            Ok(store) => {
                state.max_file_size = store.max_file_size();
                state.backend = BackendState::Ready(store);
                tracing::debug!("cache backend ready");
                for tx in waiters {
                    wakeups.gates.push((tx, Ok(())));
                }
            }
            Err(error) => {
                state.backend = BackendState::Failed;
                tracing::error!(error = %error, "cache backend construction failed");
                for tx in waiters {
                    wakeups.gates.push((tx, Err(CoordinationError::BackendUnavailable)));
                }
            }
        }
    }
    inner.fire(wakeups);
}

enum BackendResource {
    Entry { store: Arc<dyn StoreEntry>, opened: bool },
    Doomed,
}

async fn run_backend_op(inner: Arc<CacheInner>, key: CacheKey, kind: PendingKind) {
    let outcome = match inner.ready_store() {
        Some(store) => match kind {
            PendingKind::Open => store.open(&key).await.map(|store| BackendResource::Entry {
                store,
                opened: true,
            }),
            PendingKind::Create => store.create(&key).await.map(|store| BackendResource::Entry {
                store,
                opened: false,
            }),
            PendingKind::OpenOrCreate => {
                store
                    .open_or_create(&key)
                    .await
                    .map(|(store, opened)| BackendResource::Entry { store, opened })
            }
            PendingKind::Doom => store.doom(&key).await.map(|()| BackendResource::Doomed),
        },
        None => Err(StoreError::Failure("backend not ready".into())),
    };
    complete_backend_op(&inner, &key, kind, outcome);
}

fn map_store_failure(kind: PendingKind, error: StoreError) -> CoordinationError {
    match kind {
        PendingKind::Open => CoordinationError::OpenFailure(error),
        PendingKind::Create => CoordinationError::CreateFailure(error),
        PendingKind::OpenOrCreate => CoordinationError::OpenOrCreateFailure(error),
        PendingKind::Doom => CoordinationError::DoomFailure(error),
    }
}

/// Settles the whole waiter queue of a completed backend call.
fn complete_backend_op(
    inner: &Arc<CacheInner>,
    key: &CacheKey,
    kind: PendingKind,
    outcome: Result<BackendResource, StoreError>,
) {
    let mut wakeups = Wakeups::default();
    {
        let mut state = inner.lock_state();
        let Some(op) = state.pending.take(key) else {
            return;
        };
        let first_succeeded = outcome.is_ok();
        let failure = outcome.as_ref().err().cloned();
        let mut waiters = op.waiters.into_iter();

        // The initiator gets the raw result; everyone queued is settled
        // relative to it.
        let mut shared_entry = None;
        let mut initiator_detached = false;
        if let Some(initiator) = waiters.next() {
            if initiator.tx.is_closed() {
                initiator_detached = true;
                if let Ok(BackendResource::Entry { store, opened }) = &outcome {
                    // Nobody owns the handle; fresh entries are useless and
                    // must not shadow the key.
                    if !opened {
                        store.doom();
                    }
                }
            } else {
                match &outcome {
                    Ok(BackendResource::Entry { store, opened }) => {
                        let id = activate_entry(&mut state, key, store.clone(), *opened);
                        shared_entry = Some(id);
                        wakeups
                            .pendings
                            .push((initiator.tx, Ok(PendingOutcome::Entry(id))));
                    }
                    Ok(BackendResource::Doomed) => {
                        wakeups.pendings.push((initiator.tx, Ok(PendingOutcome::Doomed)));
                    }
                    Err(error) => {
                        wakeups
                            .pendings
                            .push((initiator.tx, Err(map_store_failure(kind, error.clone()))));
                    }
                }
            }
        }

        let mut poisoned = initiator_detached;
        for waiter in waiters {
            if waiter.tx.is_closed() {
                continue;
            }
            let verdict = queued_verdict(kind, first_succeeded, poisoned, waiter.kind);
            if waiter.kind == PendingKind::Doom {
                poisoned = true;
            }
            let result = match verdict {
                QueuedVerdict::Share => match shared_entry {
                    Some(id) => Ok(PendingOutcome::Entry(id)),
                    None => Err(CoordinationError::CacheRace),
                },
                QueuedVerdict::CreateCollision => Err(CoordinationError::CreateFailure(
                    StoreError::AlreadyExists,
                )),
                QueuedVerdict::SameFailure => {
                    let error = failure.clone().unwrap_or(StoreError::NotFound);
                    Err(map_store_failure(waiter.kind, error))
                }
                QueuedVerdict::Race => Err(CoordinationError::CacheRace),
            };
            wakeups.pendings.push((waiter.tx, result));
        }
        drain_scheduled(&mut state, &mut wakeups);
    }
    inner.fire(wakeups);
}

/// One shared read round: pull a chunk from the group's network
/// transaction, persist it, advance the frontier and serve every member
/// waiting there.
async fn run_read_round(inner: Arc<CacheInner>, entry_id: EntryId) {
    // Check out the network transaction and capture the round plan.
    let (mut network, store, offset, want, persist, size_limit) = {
        let mut state = inner.lock_state();
        let limit = state.max_file_size;
        let Some(entry) = state.entries.get_mut(&entry_id) else {
            return;
        };
        let store = entry.store.clone();
        let Some(group) = entry.writer_group.as_mut() else {
            return;
        };
        if !group.has_waiters() {
            return;
        }
        let want = group.round_want();
        let persist = !group.is_network_read_only();
        let Some(network) = group.begin_round() else {
            return;
        };
        (network, store, group.network_pos, want, persist, limit)
    };

    let read_result = network.read(want).await;
    let mut write_error = None;
    let mut ceiling_hit = false;
    if let Ok(chunk) = &read_result {
        if !chunk.is_empty() && persist {
            if offset + chunk.len() as u64 > size_limit {
                // The body outgrew what the backend will store. Members keep
                // the bytes; persistence stops here.
                ceiling_hit = true;
            } else {
                match store
                    .write(STREAM_RESPONSE_BODY, offset, chunk.clone(), false)
                    .await
                {
                    Ok(written) if written == chunk.len() => {}
                    Ok(written) => {
                        write_error = Some(StoreError::Failure(format!(
                            "short write: {written} of {} bytes",
                            chunk.len()
                        )));
                    }
                    Err(error) => write_error = Some(error),
                }
            }
        }
    }

    // Settle the round against whatever the group looks like now.
    let mut wakeups = Wakeups::default();
    {
        let mut state = inner.lock_state();
        let state_ref = &mut *state;
        let Some(entry) = state_ref.entries.get_mut(&entry_id) else {
            // Everyone left and the entry is gone; the fetch dies with us.
            return;
        };
        let Some(group) = entry.writer_group.as_mut() else {
            return;
        };
        group.end_round(network);

        match read_result {
            Err(network_error) => {
                let error = CoordinationError::ReadFailure(network_error);
                tracing::warn!(entry = entry_id.0, error = %error, "shared network read failed");
                group.set_failure(error.clone());
                group.abandon_network();
                for waiter in group.drain_waiters() {
                    wakeups.chunks.push((waiter.tx, Err(error.clone())));
                }
                fail_entry(state_ref, entry_id, &mut wakeups);
            }
            Ok(chunk) if chunk.is_empty() => {
                for waiter in group.drain_waiters() {
                    wakeups.chunks.push((waiter.tx, Ok(Bytes::new())));
                }
                dissolve_group_into_readers(state_ref, entry_id, &mut wakeups);
            }
            Ok(chunk) => {
                if let Some(error) = write_error {
                    tracing::warn!(entry = entry_id.0, error = %error, "body write failed, entry degraded");
                    group.degrade(error.clone());
                    group.network_pos += chunk.len() as u64;
                    let mut waiters = group.drain_waiters().into_iter();
                    // The member that pulled the chunk rides on; its copy of
                    // the bytes is unaffected by the store failure.
                    if let Some(first) = waiters.next() {
                        group.advance_member(first.txn, chunk.len());
                        wakeups.chunks.push((first.tx, Ok(chunk.clone())));
                    }
                    for waiter in waiters {
                        wakeups.chunks.push((
                            waiter.tx,
                            Err(CoordinationError::WriteFailure(error.clone())),
                        ));
                    }
                    fail_entry(state_ref, entry_id, &mut wakeups);
                } else {
                    if ceiling_hit {
                        tracing::debug!(
                            entry = entry_id.0,
                            "body exceeds the backend size ceiling, cache writes stopped"
                        );
                        group.stop_persisting();
                    }
                    group.network_pos += chunk.len() as u64;
                    if persist && !ceiling_hit {
                        group.flushed_pos = group.network_pos;
                    }
                    for waiter in group.drain_waiters() {
                        let take = waiter.max_len.min(chunk.len());
                        group.advance_member(waiter.txn, take);
                        wakeups.chunks.push((waiter.tx, Ok(chunk.slice(..take))));
                    }
                    if ceiling_hit {
                        // The stored prefix can never become a complete body.
                        doom_active_entry(state_ref, entry_id);
                    }
                }
            }
        }
        drain_scheduled(&mut state, &mut wakeups);
    }
    inner.fire(wakeups);
}

/// Reads and decodes the stored envelope. `None` means the head stream was
/// never written, which is how a freshly created entry looks.
pub(crate) async fn read_stored_record(
    store: &Arc<dyn StoreEntry>,
) -> Result<Option<StoredRecord>, StoreError> {
    let len = store.stream_len(STREAM_RESPONSE_HEAD).await?;
    if len == 0 {
        return Ok(None);
    }
    let data = store
        .read(STREAM_RESPONSE_HEAD, 0, usize::try_from(len).unwrap_or(usize::MAX))
        .await?;
    let record = StoredRecord::decode(&data)
        .map_err(|error| StoreError::Failure(format!("corrupt envelope: {error}")))?;
    Ok(Some(record))
}

/// Encodes `record` and replaces the head stream with it.
pub(crate) async fn write_stored_record(
    store: &Arc<dyn StoreEntry>,
    record: &StoredRecord,
) -> Result<(), StoreError> {
    let encoded = record
        .encode()
        .map_err(|error| StoreError::Failure(error.to_string()))?;
    store
        .write(STREAM_RESPONSE_HEAD, 0, encoded, true)
        .await
        .map(|_| ())
}

/// Rewrites the envelope of an interrupted download so the prefix can be
/// resumed later.
async fn write_truncation_marker(store: Arc<dyn StoreEntry>, flushed: u64) {
    let result = async {
        let Some(mut record) = read_stored_record(&store).await? else {
            return Ok(());
        };
        record.truncated = true;
        record.ranges = vec![ByteRange::new(0, flushed)];
        write_stored_record(&store, &record).await
    }
    .await;
    if let Err(error) = result {
        tracing::warn!(key = %store.key(), error = %error, "failed to mark truncated entry, dooming");
        store.doom();
    }
}
