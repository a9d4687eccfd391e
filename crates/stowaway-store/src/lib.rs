//! Shared vocabulary for the stowaway HTTP cache engine.
//!
//! This crate defines the types that cross the engine boundary: request and
//! response descriptions, the stored record layout, and the trait seams the
//! engine coordinates between. The engine itself never talks to disk or to
//! the network; it drives implementations of [`CacheStore`] and
//! [`NetworkTransaction`] that are injected at construction time, and defers
//! every freshness or validation judgement to an [`HttpPolicy`].
//!
//! Keeping these definitions in a leaf crate lets test doubles implement the
//! seams without depending on the engine crate.

#![warn(missing_docs)]

mod key;
mod network;
mod policy;
mod request;
mod response;
mod store;

pub use key::*;
pub use network::*;
pub use policy::*;
pub use request::*;
pub use response::*;
pub use store::*;
