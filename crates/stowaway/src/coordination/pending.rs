//! Serialization of backend calls per key.
//!
//! The backend accepts one outstanding open, create or doom per key from
//! this engine. Every transaction that needs a backend call while one is
//! already in flight for the same key queues behind it, and the completion
//! of the first call settles the whole queue at once: compatible waiters
//! share the result, incompatible ones are raced so they re-resolve against
//! the now-active entry.

use std::collections::HashMap;

use tokio::sync::oneshot;

use stowaway_store::CacheKey;

use super::entry::EntryId;
use crate::error::CoordinationError;

/// The backend call a waiter asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PendingKind {
    Open,
    Create,
    OpenOrCreate,
    Doom,
}

/// Success payload delivered to pending waiters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PendingOutcome {
    /// The key is now active under this entry.
    Entry(EntryId),
    /// The doom completed.
    Doomed,
}

pub(crate) type PendingSender = oneshot::Sender<Result<PendingOutcome, CoordinationError>>;
pub(crate) type PendingReceiver = oneshot::Receiver<Result<PendingOutcome, CoordinationError>>;

pub(crate) struct PendingWaiter {
    pub kind: PendingKind,
    pub tx: PendingSender,
}

/// One in-flight backend call plus everything queued behind it.
pub(crate) struct PendingOp {
    /// Kind of the call actually sent to the backend, which is always the
    /// kind the first waiter asked for.
    pub kind: PendingKind,
    /// All waiters in arrival order; the initiator is first.
    pub waiters: Vec<PendingWaiter>,
}

/// The per-key table of in-flight backend calls.
#[derive(Default)]
pub(crate) struct PendingOps {
    ops: HashMap<CacheKey, PendingOp>,
}

impl PendingOps {
    /// Queues a waiter under `key`. Returns `true` when this waiter is the
    /// initiator and the caller must issue the backend call.
    pub fn submit(&mut self, key: &CacheKey, kind: PendingKind, tx: PendingSender) -> bool {
        match self.ops.get_mut(key) {
            Some(op) => {
                op.waiters.push(PendingWaiter { kind, tx });
                false
            }
            None => {
                self.ops.insert(
                    key.clone(),
                    PendingOp {
                        kind,
                        waiters: vec![PendingWaiter { kind, tx }],
                    },
                );
                true
            }
        }
    }

    /// Removes the operation for `key` so notifications cannot observe it as
    /// still pending. Called exactly once per backend completion.
    pub fn take(&mut self, key: &CacheKey) -> Option<PendingOp> {
        self.ops.remove(key)
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }
}

/// How a queued (non-initiating) waiter is settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum QueuedVerdict {
    /// Hand over the entry the initiator produced.
    Share,
    /// A create queued behind a successful call: the key exists now, so the
    /// create has definitively failed.
    CreateCollision,
    /// The waiter asked for the same call that just failed; give it the same
    /// failure instead of a pointless retry.
    SameFailure,
    /// State changed underneath the waiter; it must re-resolve the key.
    Race,
}

/// Settles one queued waiter against the completed call.
///
/// `poisoned` is set once an earlier waiter in the same queue was a doom;
/// everything after a doom re-resolves because the entry it queued for is
/// gone.
pub(crate) fn queued_verdict(
    first: PendingKind,
    first_succeeded: bool,
    poisoned: bool,
    queued: PendingKind,
) -> QueuedVerdict {
    if poisoned || first == PendingKind::Doom || queued == PendingKind::Doom {
        return QueuedVerdict::Race;
    }
    if first_succeeded {
        if queued == PendingKind::Create {
            QueuedVerdict::CreateCollision
        } else {
            QueuedVerdict::Share
        }
    } else if queued == first {
        QueuedVerdict::SameFailure
    } else {
        QueuedVerdict::Race
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sender() -> PendingSender {
        oneshot::channel().0
    }

    #[test]
    fn test_first_submit_initiates() {
        let mut ops = PendingOps::default();
        let key = CacheKey::new("1/0/https://example.com/");
        assert!(ops.submit(&key, PendingKind::Create, sender()));
        assert!(!ops.submit(&key, PendingKind::Open, sender()));
        assert_eq!(ops.len(), 1);

        let op = ops.take(&key).unwrap();
        assert_eq!(op.kind, PendingKind::Create);
        assert_eq!(op.waiters.len(), 2);
        assert_eq!(ops.len(), 0);
    }

    #[test]
    fn test_queued_sharing() {
        use PendingKind::*;
        use QueuedVerdict::*;

        // A successful call satisfies opens, but a queued create has lost.
        assert_eq!(queued_verdict(Create, true, false, Open), Share);
        assert_eq!(queued_verdict(Create, true, false, OpenOrCreate), Share);
        assert_eq!(queued_verdict(OpenOrCreate, true, false, Open), Share);
        assert_eq!(queued_verdict(Open, true, false, Create), CreateCollision);
    }

    #[test]
    fn test_queued_after_failure() {
        use PendingKind::*;
        use QueuedVerdict::*;

        // Identical operations share the failure, everything else re-resolves.
        assert_eq!(queued_verdict(Open, false, false, Open), SameFailure);
        assert_eq!(queued_verdict(Create, false, false, Create), SameFailure);
        assert_eq!(queued_verdict(Create, false, false, Open), Race);
        assert_eq!(queued_verdict(Open, false, false, OpenOrCreate), Race);
    }

    #[test]
    fn test_dooms_race_everything() {
        use PendingKind::*;
        use QueuedVerdict::*;

        assert_eq!(queued_verdict(Doom, true, false, Open), Race);
        assert_eq!(queued_verdict(Doom, false, false, Create), Race);
        assert_eq!(queued_verdict(Open, true, false, Doom), Race);
        // Waiters behind a queued doom are poisoned even on success.
        assert_eq!(queued_verdict(Open, true, true, Open), Race);
    }
}
