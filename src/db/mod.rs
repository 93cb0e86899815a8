//! Database module: the storage traits and their implementations
//!
//! `PgStore` drives PostgreSQL through sqlx; `MemoryStore` keeps tables in
//! process and is used by tests and dry runs.

pub mod connection;
pub mod memory;
pub mod metadata_repo;
pub mod postgres;
pub mod store;

pub use connection::{init_pool, DbPool};
pub use memory::MemoryStore;
pub use postgres::PgStore;
pub use store::{ChunkReceiver, MetadataStore, TableStore, TableSwap};
