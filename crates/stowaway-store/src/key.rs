use std::fmt;
use std::sync::Arc;

/// The canonical identity of a cache entry.
///
/// Keys are produced by the engine's key generator from a request description
/// and are treated as opaque strings by every backend. Two requests that map
/// to the same `CacheKey` contend for the same entry; everything the engine
/// does (queueing, writer sharing, dooming) is scoped to one key.
///
/// The key is reference counted so it can be cloned freely into queues,
/// pending-operation tables and log events without reallocating.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CacheKey {
    key: Arc<str>,
}

impl CacheKey {
    /// Creates a key from an already generated key string.
    pub fn new(key: impl Into<Arc<str>>) -> Self {
        Self { key: key.into() }
    }

    /// The full key string.
    pub fn as_str(&self) -> &str {
        &self.key
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.key)
    }
}

impl fmt::Debug for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "CacheKey({})", self.key)
    }
}
