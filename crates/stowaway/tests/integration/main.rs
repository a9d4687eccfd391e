// See <https://matklad.github.io/2021/02/27/delete-cargo-integration-tests.html>

pub mod hits_and_misses;
pub mod modes;
pub mod ranges;
pub mod sharing;
pub mod utils;
pub mod validation;

pub use utils::*;
