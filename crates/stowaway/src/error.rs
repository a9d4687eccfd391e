use stowaway_store::{NetworkError, StoreError};

/// Failures internal to the coordination layer.
///
/// These circulate between the coordinator, its queues and the transaction
/// driver. The driver almost always reacts by retrying against a fresh entry
/// or by falling back to the network; only cache-only requests surface them
/// to callers, collapsed into [`Error::NotFoundInCache`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CoordinationError {
    /// The request cannot be mapped to a cache key.
    #[error("request cannot be cached")]
    Unkeyable,
    /// Backend construction failed; the failure is permanent for the lifetime
    /// of the coordinator.
    #[error("cache backend unavailable")]
    BackendUnavailable,
    /// The backend failed to open an entry.
    #[error("failed to open cache entry: {0}")]
    OpenFailure(StoreError),
    /// The backend failed to create an entry.
    #[error("failed to create cache entry: {0}")]
    CreateFailure(StoreError),
    /// The backend failed a combined open-or-create.
    #[error("failed to open or create cache entry: {0}")]
    OpenOrCreateFailure(StoreError),
    /// The backend failed to doom an entry.
    #[error("failed to doom cache entry: {0}")]
    DoomFailure(StoreError),
    /// The entry changed underneath a queued operation; retry against the
    /// current state of the key.
    #[error("lost a race on the cache entry")]
    CacheRace,
    /// Gave up waiting for the entry lock.
    #[error("timed out waiting for the cache entry")]
    LockTimeout,
    /// A body write failed while the entry was being streamed to.
    #[error("cache write failed: {0}")]
    WriteFailure(StoreError),
    /// The shared network fetch of a writer group failed.
    #[error("shared network read failed: {0}")]
    ReadFailure(NetworkError),
}

/// Errors surfaced to users of a cache transaction.
///
/// Cache-internal trouble never reaches this enum directly: a transaction
/// that loses its entry retries or degrades to a plain network fetch, so the
/// caller only ever sees a miss (for cache-only loads), a network error, or
/// a store error from an entry it was actively reading.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// A cache-only load found no usable entry.
    #[error("not found in cache")]
    NotFoundInCache,
    /// The network fetch backing this transaction failed.
    #[error(transparent)]
    Network(#[from] NetworkError),
    /// Reading or writing the entry failed mid-stream.
    #[error("cache store failure: {0}")]
    Store(#[from] StoreError),
}

impl CoordinationError {
    /// Whether the transaction should re-resolve its entry and try again.
    pub(crate) fn is_retryable(&self) -> bool {
        matches!(self, CoordinationError::CacheRace)
    }
}
