//! Shared-write bookkeeping.
//!
//! A [`WriterGroup`] owns the single network transaction that feeds an entry
//! and fans its body out to every member. Bytes are pulled on demand: the
//! first member to ask for data past the flushed frontier starts a read
//! round, everyone waiting at the frontier is served from the round's chunk,
//! and members that fall behind catch up straight from the store without
//! holding anyone else back.
//!
//! The group only keeps positions and waiters; the actual round (network
//! read, store write, delivery) is driven by the coordinator so that no lock
//! is held across IO.

use std::collections::HashMap;

use bytes::Bytes;
use tokio::sync::oneshot;

use stowaway_store::{Method, NetworkTransaction, Priority, ResponseHead, StoreError};

use super::entry::TxnId;
use crate::error::CoordinationError;

/// How a transaction related to an entry's writer group, recorded for
/// diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WritingPattern {
    /// Started the group for a full-body fetch.
    Created,
    /// Started an exclusive group for a range fetch.
    CreatedExclusive,
    /// Joined an existing group at offset zero.
    Joined,
    /// Only `GET` responses are shared.
    NotJoinedMethodNotGet,
    /// Range transactions never share a body stream.
    NotJoinedRange,
    /// The transaction has no write privilege.
    NotJoinedReadOnly,
    /// The declared body exceeds what the backend will store.
    NotJoinedTooBig,
    /// The group belongs to a single range writer.
    NotJoinedExclusive,
    /// The group stopped persisting after a write failure.
    NotJoinedDegraded,
}

/// The facts about the stored head that outlive the member which wrote it.
#[derive(Debug, Clone, Copy)]
pub(crate) struct HeadTraits {
    pub has_strong_validators: bool,
    pub accepts_byte_ranges: bool,
    pub no_store: bool,
    pub content_length: Option<u64>,
}

impl HeadTraits {
    pub fn of(head: &ResponseHead) -> Self {
        Self {
            has_strong_validators: head.has_strong_validators,
            accepts_byte_ranges: head.accepts_byte_ranges,
            no_store: head.no_store,
            content_length: head.content_length,
        }
    }

    /// Whether an interrupted download of this response is worth keeping as
    /// a resumable prefix.
    pub fn supports_resumption(&self) -> bool {
        self.has_strong_validators && self.accepts_byte_ranges && !self.no_store
    }
}

pub(crate) struct WriterMember {
    /// Next body offset this member will consume.
    pub pos: u64,
    pub pattern: WritingPattern,
}

pub(crate) type ChunkSender = oneshot::Sender<Result<Bytes, CoordinationError>>;
pub(crate) type ChunkReceiver = oneshot::Receiver<Result<Bytes, CoordinationError>>;

pub(crate) struct RoundWaiter {
    pub txn: TxnId,
    pub max_len: usize,
    pub tx: ChunkSender,
}

pub(crate) struct WriterGroup {
    members: HashMap<TxnId, WriterMember>,
    /// The network transaction feeding this entry. `None` while a read round
    /// has it checked out, and always `None` for exclusive groups, whose
    /// sole member drives its own fetches.
    network: Option<Box<dyn NetworkTransaction>>,
    /// Frontier: how much body has been taken from the network.
    pub network_pos: u64,
    /// How much of the body is durably in the store. Trails `network_pos`
    /// only after a write failure.
    pub flushed_pos: u64,
    /// Members waiting for bytes at the frontier.
    waiters: Vec<RoundWaiter>,
    round_in_flight: bool,
    exclusive: bool,
    network_read_only: bool,
    /// The store error that degraded the group, delivered once to every
    /// member caught behind the failure point.
    write_failed: Option<StoreError>,
    failed: Option<CoordinationError>,
    traits: HeadTraits,
    priority: Priority,
}

impl WriterGroup {
    /// Creates a group around `network`, with the creator as first member.
    pub fn new_shared(
        network: Box<dyn NetworkTransaction>,
        traits: HeadTraits,
        creator: TxnId,
        priority: Priority,
    ) -> Self {
        let mut members = HashMap::new();
        members.insert(
            creator,
            WriterMember {
                pos: 0,
                pattern: WritingPattern::Created,
            },
        );
        Self {
            members,
            network: Some(network),
            network_pos: 0,
            flushed_pos: 0,
            waiters: Vec::new(),
            round_in_flight: false,
            exclusive: false,
            network_read_only: false,
            write_failed: None,
            failed: None,
            traits,
            priority,
        }
    }

    /// Creates an exclusive group for a range writer. The member keeps its
    /// own network transaction; the group exists to hold the entry against
    /// concurrent writers.
    pub fn new_exclusive(traits: HeadTraits, creator: TxnId, priority: Priority) -> Self {
        let mut members = HashMap::new();
        members.insert(
            creator,
            WriterMember {
                pos: 0,
                pattern: WritingPattern::CreatedExclusive,
            },
        );
        Self {
            members,
            network: None,
            network_pos: 0,
            flushed_pos: 0,
            waiters: Vec::new(),
            round_in_flight: false,
            exclusive: true,
            network_read_only: false,
            write_failed: None,
            failed: None,
            traits,
            priority,
        }
    }

    /// Classifies a prospective member.
    ///
    /// The checks are ordered so the reported reason is stable: properties
    /// of the transaction (method, range, privilege, size) are judged before
    /// the state of the group (exclusive, degraded).
    pub fn can_join(
        &self,
        method: Method,
        is_partial: bool,
        can_write: bool,
        max_file_size: u64,
    ) -> WritingPattern {
        if method != Method::Get {
            return WritingPattern::NotJoinedMethodNotGet;
        }
        if is_partial {
            return WritingPattern::NotJoinedRange;
        }
        if !can_write {
            return WritingPattern::NotJoinedReadOnly;
        }
        if self
            .traits
            .content_length
            .is_some_and(|length| length > max_file_size)
        {
            return WritingPattern::NotJoinedTooBig;
        }
        if self.exclusive {
            return WritingPattern::NotJoinedExclusive;
        }
        if self.network_read_only || self.failed.is_some() {
            return WritingPattern::NotJoinedDegraded;
        }
        WritingPattern::Joined
    }

    pub fn add_member(&mut self, txn: TxnId, pattern: WritingPattern, priority: Priority) {
        self.members.insert(txn, WriterMember { pos: 0, pattern });
        if priority > self.priority {
            self.priority = priority;
            if let Some(network) = self.network.as_mut() {
                network.set_priority(priority);
            }
        }
    }

    /// Removes a member and any frontier wait it has queued.
    pub fn remove_member(&mut self, txn: TxnId) -> Option<WriterMember> {
        self.waiters.retain(|waiter| waiter.txn != txn);
        self.members.remove(&txn)
    }

    pub fn is_member(&self, txn: TxnId) -> bool {
        self.members.contains_key(&txn)
    }

    pub fn member_pos(&self, txn: TxnId) -> Option<u64> {
        self.members.get(&txn).map(|member| member.pos)
    }

    pub fn advance_member(&mut self, txn: TxnId, read: usize) {
        if let Some(member) = self.members.get_mut(&txn) {
            member.pos += read as u64;
        }
    }

    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn is_exclusive(&self) -> bool {
        self.exclusive
    }

    pub fn is_network_read_only(&self) -> bool {
        self.network_read_only
    }

    /// Stops persisting network bytes after a store write failure. Existing
    /// frontier members keep streaming; the entry itself is already doomed
    /// by the caller.
    pub fn degrade(&mut self, error: StoreError) {
        self.network_read_only = true;
        self.write_failed = Some(error);
    }

    /// Stops persisting without an error, used when the body outgrew the
    /// backend's entry-size ceiling.
    pub fn stop_persisting(&mut self) {
        self.network_read_only = true;
    }

    pub fn write_failure(&self) -> Option<&StoreError> {
        self.write_failed.as_ref()
    }

    pub fn failure(&self) -> Option<&CoordinationError> {
        self.failed.as_ref()
    }

    pub fn set_failure(&mut self, error: CoordinationError) {
        self.failed = Some(error);
    }

    pub fn traits(&self) -> HeadTraits {
        self.traits
    }

    /// Queues a frontier wait for `txn`. Only valid for members positioned
    /// exactly at the frontier.
    pub fn queue_waiter(&mut self, txn: TxnId, max_len: usize, tx: ChunkSender) {
        self.waiters.push(RoundWaiter { txn, max_len, tx });
    }

    pub fn has_waiters(&self) -> bool {
        !self.waiters.is_empty()
    }

    pub fn drain_waiters(&mut self) -> Vec<RoundWaiter> {
        std::mem::take(&mut self.waiters)
    }

    /// The read size for the next round: the smallest cap among current
    /// waiters, so nobody is handed more than they asked for.
    pub fn round_want(&self) -> usize {
        self.waiters
            .iter()
            .map(|waiter| waiter.max_len)
            .min()
            .unwrap_or(0)
            .max(1)
    }

    /// Whether a new read round may start: none in flight and the network
    /// transaction is still held by the group.
    pub fn can_start_round(&self) -> bool {
        !self.round_in_flight && self.network.is_some()
    }

    pub fn begin_round(&mut self) -> Option<Box<dyn NetworkTransaction>> {
        let network = self.network.take()?;
        self.round_in_flight = true;
        Some(network)
    }

    pub fn end_round(&mut self, network: Box<dyn NetworkTransaction>) {
        self.network = Some(network);
        self.round_in_flight = false;
    }

    /// Drops the network transaction on teardown paths where nothing will
    /// read from it again.
    pub fn abandon_network(&mut self) {
        self.network = None;
        self.round_in_flight = false;
    }

    /// Member ids, for dissolution.
    pub fn member_ids(&self) -> Vec<TxnId> {
        self.members.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn traits() -> HeadTraits {
        HeadTraits {
            has_strong_validators: true,
            accepts_byte_ranges: true,
            no_store: false,
            content_length: Some(1024),
        }
    }

    fn exclusive_group() -> WriterGroup {
        WriterGroup::new_exclusive(traits(), TxnId(1), Priority::Medium)
    }

    #[test]
    fn test_join_classification_order() {
        let mut group = exclusive_group();
        group.network_read_only = true;

        // Transaction properties are reported before group state.
        assert_eq!(
            group.can_join(Method::Head, false, true, u64::MAX),
            WritingPattern::NotJoinedMethodNotGet
        );
        assert_eq!(
            group.can_join(Method::Get, true, true, u64::MAX),
            WritingPattern::NotJoinedRange
        );
        assert_eq!(
            group.can_join(Method::Get, false, false, u64::MAX),
            WritingPattern::NotJoinedReadOnly
        );
        assert_eq!(
            group.can_join(Method::Get, false, true, 512),
            WritingPattern::NotJoinedTooBig
        );
        assert_eq!(
            group.can_join(Method::Get, false, true, u64::MAX),
            WritingPattern::NotJoinedExclusive
        );

        group.exclusive = false;
        assert_eq!(
            group.can_join(Method::Get, false, true, u64::MAX),
            WritingPattern::NotJoinedDegraded
        );

        group.network_read_only = false;
        assert_eq!(
            group.can_join(Method::Get, false, true, u64::MAX),
            WritingPattern::Joined
        );
    }

    #[test]
    fn test_member_bookkeeping() {
        let mut group = exclusive_group();
        group.add_member(TxnId(2), WritingPattern::Joined, Priority::High);
        assert_eq!(group.member_count(), 2);
        assert!(group.is_member(TxnId(2)));

        group.advance_member(TxnId(2), 100);
        assert_eq!(group.member_pos(TxnId(2)), Some(100));

        let removed = group.remove_member(TxnId(1)).unwrap();
        assert_eq!(removed.pattern, WritingPattern::CreatedExclusive);
        assert!(!group.is_empty());
        group.remove_member(TxnId(2));
        assert!(group.is_empty());
    }

    #[test]
    fn test_round_want_is_smallest_cap() {
        let mut group = exclusive_group();
        let (tx_a, _rx_a) = oneshot::channel();
        let (tx_b, _rx_b) = oneshot::channel();
        group.queue_waiter(TxnId(1), 4096, tx_a);
        group.queue_waiter(TxnId(2), 512, tx_b);
        assert_eq!(group.round_want(), 512);
    }
}
