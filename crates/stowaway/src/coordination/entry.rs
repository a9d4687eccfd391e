//! Per-key entry state.
//!
//! An [`ActiveEntry`] is the in-memory controller for one cache key: it owns
//! the backend handle and tracks every transaction attached to the key,
//! sorted into the admission queue, the headers negotiator slot, the
//! post-headers queue, the reader set and the writer group. Entries live in
//! the coordinator's arena and are addressed by [`EntryId`]; nothing outside
//! the coordinator holds a reference to one, so teardown is an explicit
//! emptiness check instead of reference counting.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use tokio::sync::oneshot;

use stowaway_store::{CacheKey, Method, Priority, StoreEntry};

use super::writers::{HeadTraits, WriterGroup, WritingPattern};
use crate::error::CoordinationError;

/// Arena index of an active entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct EntryId(pub u64);

/// Identifier of a transaction for the lifetime of its coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct TxnId(pub u64);

/// How much cache involvement a transaction's classification allows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TransactionMode {
    /// Pure network passthrough.
    None,
    /// May serve from the cache, never writes.
    Read,
    /// Replaces the entry without reading it first.
    Write,
    /// The usual read-validate-write cycle.
    ReadWrite,
}

impl TransactionMode {
    pub fn can_read(self) -> bool {
        matches!(self, TransactionMode::Read | TransactionMode::ReadWrite)
    }

    pub fn can_write(self) -> bool {
        matches!(self, TransactionMode::Write | TransactionMode::ReadWrite)
    }

    /// Drops the write half, used for `HEAD` requests which may be served
    /// from an entry but must never take part in writing one.
    pub fn without_write(self) -> TransactionMode {
        match self {
            TransactionMode::ReadWrite => TransactionMode::Read,
            TransactionMode::Write => TransactionMode::None,
            other => other,
        }
    }
}

/// Where a transaction currently sits within its entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TxnPhase {
    /// Registered but not attached to an entry.
    Idle,
    /// Waiting in the admission queue.
    Queued,
    /// Holding the headers negotiator slot.
    Negotiating,
    /// Waiting in the post-headers queue.
    PostHeaders,
    /// Member of the writer group.
    Writer,
    /// Reading the completed body.
    Reader,
}

/// What a queued transaction was admitted as when its wait resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum QueueResolution {
    /// Promoted from the admission queue into the negotiator slot.
    Negotiate,
    /// Placed with the readers.
    Reader,
    /// Joined the writer group.
    Writer,
    /// Became the sole member of a new exclusive writer group.
    ExclusiveWriter,
    /// Rejected at writer consideration; the transaction is detached from the
    /// entry and finishes over the network on its own.
    NetworkOnly(WritingPattern),
}

pub(crate) type WaitSender = oneshot::Sender<Result<QueueResolution, CoordinationError>>;
pub(crate) type WaitReceiver = oneshot::Receiver<Result<QueueResolution, CoordinationError>>;

/// Terminal writer-group outcome recorded for a member whose group dissolved
/// or failed while it was not looking.
#[derive(Debug, Clone)]
pub(crate) enum WriterOutcome {
    /// The network body completed; continue reading from the store at `pos`.
    BecameReader { pos: u64 },
    /// The group failed underneath the member.
    Failed(CoordinationError),
}

/// Coordinator-side record of one transaction.
pub(crate) struct TxnRecord {
    pub mode: TransactionMode,
    pub method: Method,
    pub is_partial: bool,
    pub priority: Priority,
    pub entry: Option<EntryId>,
    pub phase: TxnPhase,
    /// Wakes the driver when its queue wait resolves.
    pub waiter: Option<WaitSender>,
    /// Set when the entry failed while this transaction held the negotiator
    /// slot; observed at its next engine call.
    pub restart: Option<CoordinationError>,
    /// Set when the writer group settled this member's fate.
    pub writer_outcome: Option<WriterOutcome>,
    /// Traits of the response head this transaction negotiated, recorded so a
    /// queued range writer can seed its exclusive group after the wait.
    pub head_traits: Option<HeadTraits>,
}

impl TxnRecord {
    pub fn new(mode: TransactionMode, method: Method, is_partial: bool, priority: Priority) -> Self {
        Self {
            mode,
            method,
            is_partial,
            priority,
            entry: None,
            phase: TxnPhase::Idle,
            waiter: None,
            restart: None,
            writer_outcome: None,
            head_traits: None,
        }
    }
}

/// The in-memory state of one cache key.
pub(crate) struct ActiveEntry {
    pub key: CacheKey,
    /// Backend handle, exclusively owned by this entry. Transactions only
    /// ever receive clones for reads and body writes sanctioned by the
    /// coordinator.
    pub store: Arc<dyn StoreEntry>,
    /// Whether the backend had the entry before we touched it. Freshly
    /// created entries have no stored record to read.
    pub opened: bool,
    pub admission_queue: VecDeque<TxnId>,
    pub headers_negotiator: Option<TxnId>,
    pub post_headers_queue: VecDeque<TxnId>,
    pub readers: HashSet<TxnId>,
    pub writer_group: Option<WriterGroup>,
    /// Doomed entries serve their current members but are no longer resident
    /// under their key.
    pub doomed: bool,
    /// Queue processing is already scheduled for this entry.
    pub process_scheduled: bool,
}

impl ActiveEntry {
    pub fn new(key: CacheKey, store: Arc<dyn StoreEntry>, opened: bool) -> Self {
        Self {
            key,
            store,
            opened,
            admission_queue: VecDeque::new(),
            headers_negotiator: None,
            post_headers_queue: VecDeque::new(),
            readers: HashSet::new(),
            writer_group: None,
            doomed: false,
            process_scheduled: false,
        }
    }

    /// Whether any transaction is still attached to this entry.
    pub fn has_transactions(&self) -> bool {
        self.headers_negotiator.is_some()
            || !self.admission_queue.is_empty()
            || !self.post_headers_queue.is_empty()
            || !self.readers.is_empty()
            || self
                .writer_group
                .as_ref()
                .is_some_and(|group| !group.is_empty())
    }

    /// Removes `txn` from whichever wait queue holds it.
    pub fn remove_queued(&mut self, txn: TxnId) {
        self.admission_queue.retain(|queued| *queued != txn);
        self.post_headers_queue.retain(|queued| *queued != txn);
    }

    pub fn snapshot(&self) -> EntrySnapshot {
        EntrySnapshot {
            opened: self.opened,
            doomed: self.doomed,
            has_negotiator: self.headers_negotiator.is_some(),
            admission_queued: self.admission_queue.len(),
            post_headers_queued: self.post_headers_queue.len(),
            readers: self.readers.len(),
            writer_members: self
                .writer_group
                .as_ref()
                .map_or(0, |group| group.member_count()),
            writer_exclusive: self
                .writer_group
                .as_ref()
                .is_some_and(|group| group.is_exclusive()),
            writer_degraded: self
                .writer_group
                .as_ref()
                .is_some_and(|group| group.is_network_read_only()),
        }
    }
}

/// Point-in-time view of an entry's occupancy, for diagnostics and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntrySnapshot {
    /// Whether the entry existed in the backend when activated.
    pub opened: bool,
    /// Whether the entry has been doomed.
    pub doomed: bool,
    /// Whether a transaction holds the headers negotiator slot.
    pub has_negotiator: bool,
    /// Transactions waiting for the negotiator slot.
    pub admission_queued: usize,
    /// Transactions waiting to be placed after negotiating.
    pub post_headers_queued: usize,
    /// Transactions reading the completed body.
    pub readers: usize,
    /// Members of the writer group.
    pub writer_members: usize,
    /// Whether the writer group is exclusive to a single range writer.
    pub writer_exclusive: bool,
    /// Whether the writer group stopped persisting after a write failure.
    pub writer_degraded: bool,
}
