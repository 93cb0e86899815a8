//! Keeps a bulk-published dataset queryable while it is refreshed.
//!
//! Each table is reloaded into a shadow copy, indexed, and swapped in with a
//! single transactional rename, so readers always see one complete
//! generation.

pub mod config;
pub mod db;
pub mod error;
pub mod metadata;
pub mod observability;
pub mod refresh;
pub mod schema;

pub use error::{RefreshError, Result};
