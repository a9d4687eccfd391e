use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::CacheKey;

/// Failures reported by a cache backend.
///
/// Errors are cheap to clone because a single backend completion may have to
/// be delivered to every operation queued behind it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// The entry does not exist.
    #[error("entry not found")]
    NotFound,
    /// An entry with the same key already exists.
    #[error("entry already exists")]
    AlreadyExists,
    /// Any other backend failure.
    #[error("backend failure: {0}")]
    Failure(String),
}

/// An open handle to one entry in a backend.
///
/// The engine hands exactly one handle per key to its active-entry arena and
/// shares it between the transactions it admits; backends never see
/// concurrent handles for the same key coming from one engine.
#[async_trait]
pub trait StoreEntry: Send + Sync {
    /// The key this handle was opened or created under.
    fn key(&self) -> &CacheKey;

    /// Reads up to `max_len` bytes from `stream` starting at `offset`.
    ///
    /// A read past the end of the stream returns an empty buffer.
    async fn read(&self, stream: u32, offset: u64, max_len: usize) -> Result<Bytes, StoreError>;

    /// Writes `data` into `stream` at `offset`, returning the number of bytes
    /// accepted. With `truncate` set the stream is cut to end at the last
    /// written byte.
    async fn write(
        &self,
        stream: u32,
        offset: u64,
        data: Bytes,
        truncate: bool,
    ) -> Result<usize, StoreError>;

    /// The current length of `stream` in bytes.
    async fn stream_len(&self, stream: u32) -> Result<u64, StoreError>;

    /// Marks the entry for deletion. The handle stays readable until dropped;
    /// the key becomes available for re-creation immediately.
    fn doom(&self);
}

/// A cache backend: a keyed collection of multi-stream entries.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Opens an existing entry.
    async fn open(&self, key: &CacheKey) -> Result<Arc<dyn StoreEntry>, StoreError>;

    /// Creates a new entry, failing if the key already exists.
    async fn create(&self, key: &CacheKey) -> Result<Arc<dyn StoreEntry>, StoreError>;

    /// Opens the entry if it exists, otherwise creates it. The flag reports
    /// whether an existing entry was opened.
    async fn open_or_create(&self, key: &CacheKey)
    -> Result<(Arc<dyn StoreEntry>, bool), StoreError>;

    /// Dooms the entry stored under `key`, if any.
    async fn doom(&self, key: &CacheKey) -> Result<(), StoreError>;

    /// The largest body this backend is willing to store, used to keep
    /// oversized responses from joining shared writes.
    fn max_file_size(&self) -> u64;
}

/// Constructs the backend on first use.
///
/// Backend construction can be slow (index load, directory scan) and can
/// fail permanently; the engine builds it lazily behind a one-shot gate and
/// remembers the outcome.
#[async_trait]
pub trait CreateCacheStore: Send + Sync {
    /// Builds the backend.
    async fn create_store(&self) -> Result<Arc<dyn CacheStore>, StoreError>;
}

impl fmt::Debug for dyn StoreEntry {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "StoreEntry({})", self.key())
    }
}
