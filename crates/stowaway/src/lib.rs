//! Coordination engine for an HTTP response cache.
//!
//! Stowaway multiplexes concurrent HTTP requests over shared cache entries.
//! It owns none of the IO: storage backends, network transports and HTTP
//! policy are injected through the trait seams in [`stowaway_store`], and
//! this crate decides who may touch which entry when. Per entry, at most one
//! transaction negotiates the response headers at a time; whoever fetches a
//! cacheable response becomes the writer, and every transaction that arrives
//! while the fetch is in flight attaches to the same writer group and reads
//! the same bytes, so a burst of identical requests costs one backend entry
//! and one network fetch. Byte-range requests run under an exclusive slot
//! with plans that mix stored intervals and private range fetches.
//!
//! The entry point is [`CacheCoordinator`]; each request is driven through a
//! [`CacheTransaction`] obtained from it. Contention never blocks forever:
//! waits are bounded by the configured lock timeouts and fall back to a
//! private network fetch.

#![warn(missing_docs)]

mod config;
mod coordination;
mod error;
mod keys;
mod transaction;

pub use self::config::{CacheMode, Config, SplitCacheConfig, SplitCacheScheme};
pub use self::coordination::{CacheCoordinator, EntrySnapshot};
pub use self::error::Error;
pub use self::keys::KeyGenerator;
pub use self::transaction::CacheTransaction;
