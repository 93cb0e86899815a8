//! Storage collaborator traits.
//!
//! The refresh pipeline only talks to the relational store through these two
//! traits. `PgStore` is the production implementation, `MemoryStore` the
//! in-process one.

use crate::error::Result;
use crate::metadata::RefreshMetadata;
use crate::schema::{IndexDefinition, PrimaryKey};
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Stream of raw, already-decompressed TSV bytes fed to a bulk load.
///
/// Chunks are not line aligned. An `Err` item aborts the load.
pub type ChunkReceiver = mpsc::Receiver<std::io::Result<Vec<u8>>>;

#[async_trait]
pub trait TableStore: Send + Sync {
    async fn table_exists(&self, table: &str) -> Result<bool>;

    /// Secondary indexes of `table`, excluding the primary key.
    async fn secondary_indexes(&self, table: &str) -> Result<Vec<IndexDefinition>>;

    async fn primary_key(&self, table: &str) -> Result<Option<PrimaryKey>>;

    /// Create `shadow` with the columns of `table` and, when given, the
    /// primary key `shadow_key`. No secondary indexes are created.
    async fn create_table_like(
        &self,
        table: &str,
        shadow: &str,
        shadow_key: Option<&PrimaryKey>,
    ) -> Result<()>;

    /// Stream tab-delimited rows into `table`, returning the number of rows
    /// inserted. An empty `columns` means every column in table order.
    async fn bulk_load(
        &self,
        table: &str,
        columns: &[String],
        chunks: ChunkReceiver,
    ) -> Result<u64>;

    async fn create_index(&self, table: &str, index: &IndexDefinition) -> Result<()>;

    /// Refresh planner statistics so row estimates are current.
    async fn analyze(&self, table: &str) -> Result<()>;

    /// In one atomic step: `table` becomes `retiring`, `shadow` becomes
    /// `table`, and every listed index (and key) follows its table's rename.
    async fn swap_tables(&self, swap: &TableSwap) -> Result<()>;

    async fn drop_table_if_exists(&self, table: &str) -> Result<()>;

    /// Whether `table` holds at least one row. Does not scan.
    async fn has_rows(&self, table: &str) -> Result<bool>;

    /// Row count from storage statistics.
    async fn estimate_rows(&self, table: &str) -> Result<u64>;
}

#[async_trait]
pub trait MetadataStore: Send + Sync {
    async fn load_metadata(&self) -> Result<Option<RefreshMetadata>>;

    async fn save_metadata(&self, metadata: &RefreshMetadata) -> Result<()>;
}

/// Every rename performed by one promotion.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TableSwap {
    pub table: String,
    pub shadow: String,
    pub retiring: String,
    /// `(from, to)` index renames applied after the production table moved
    /// to its retiring name.
    pub retire_indexes: Vec<(String, String)>,
    /// `(from, to)` index renames applied after the shadow took the
    /// production name.
    pub promote_indexes: Vec<(String, String)>,
    /// `(from, to)` primary-key constraint renames, retiring side first.
    pub retire_key: Option<(String, String)>,
    pub promote_key: Option<(String, String)>,
}
