//! In-process table store.
//!
//! Mirrors the PostgreSQL semantics the pipeline depends on: one namespace for
//! tables, keys and indexes, an enforced primary key during bulk loads, and a
//! swap that happens under a single lock so readers see either generation.

use crate::db::store::{ChunkReceiver, MetadataStore, TableStore, TableSwap};
use crate::error::{RefreshError, Result};
use crate::metadata::RefreshMetadata;
use crate::schema::{IndexDefinition, PrimaryKey};
use async_trait::async_trait;
use csv::ReaderBuilder;
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

/// Null marker in the TSV text format.
const NULL_MARKER: &str = "\\N";

type Row = Vec<Option<String>>;

#[derive(Clone, Debug, PartialEq)]
pub struct MemoryTable {
    pub columns: Vec<String>,
    pub primary_key: Option<PrimaryKey>,
    pub indexes: Vec<IndexDefinition>,
    pub rows: Vec<Row>,
}

impl MemoryTable {
    fn positions(&self, columns: &[String]) -> Option<Vec<usize>> {
        columns
            .iter()
            .map(|c| self.columns.iter().position(|own| own == c))
            .collect()
    }

    fn key_of(&self, row: &Row, positions: &[usize]) -> Row {
        positions.iter().map(|p| row[*p].clone()).collect()
    }
}

#[derive(Default)]
struct MemoryState {
    tables: HashMap<String, MemoryTable>,
    metadata: Option<RefreshMetadata>,
    operations: Vec<String>,
    failing_drops: bool,
}

impl MemoryState {
    fn table(&self, name: &str) -> Result<&MemoryTable> {
        self.tables
            .get(name)
            .ok_or_else(|| RefreshError::Store(format!("table {} does not exist", name)))
    }

    fn table_mut(&mut self, name: &str) -> Result<&mut MemoryTable> {
        self.tables
            .get_mut(name)
            .ok_or_else(|| RefreshError::Store(format!("table {} does not exist", name)))
    }

    /// Tables, keys and indexes share one namespace.
    fn name_in_use(&self, name: &str) -> bool {
        self.tables.iter().any(|(table_name, table)| {
            table_name == name
                || table.primary_key.as_ref().is_some_and(|k| k.name == name)
                || table.indexes.iter().any(|i| i.name == name)
        })
    }

    fn claim_name(&self, name: &str) -> Result<()> {
        if self.name_in_use(name) {
            return Err(RefreshError::Store(format!("relation {} already exists", name)));
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn record(&self, operation: String) {
        self.state().operations.push(operation);
    }

    /// Create a production table directly, as schema setup would.
    pub fn create_table(
        &self,
        name: &str,
        columns: &[&str],
        primary_key: Option<PrimaryKey>,
        indexes: Vec<IndexDefinition>,
    ) -> Result<()> {
        let mut state = self.state();
        state.claim_name(name)?;
        state.tables.insert(
            name.to_string(),
            MemoryTable {
                columns: columns.iter().map(|c| c.to_string()).collect(),
                primary_key,
                indexes,
                rows: Vec::new(),
            },
        );
        Ok(())
    }

    pub fn insert_rows(&self, name: &str, rows: &[&[&str]]) -> Result<()> {
        let mut state = self.state();
        let table = state.table_mut(name)?;
        for row in rows {
            if row.len() != table.columns.len() {
                return Err(RefreshError::Store(format!(
                    "expected {} values for {}, got {}",
                    table.columns.len(),
                    name,
                    row.len()
                )));
            }
            table.rows.push(row.iter().map(|v| Some(v.to_string())).collect());
        }
        Ok(())
    }

    pub fn row_count(&self, name: &str) -> Option<usize> {
        self.state().tables.get(name).map(|t| t.rows.len())
    }

    pub fn table(&self, name: &str) -> Option<MemoryTable> {
        self.state().tables.get(name).cloned()
    }

    pub fn table_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state().tables.keys().cloned().collect();
        names.sort();
        names
    }

    /// Journal of every mutating call, in order.
    pub fn operations(&self) -> Vec<String> {
        self.state().operations.clone()
    }

    /// Make `drop_table_if_exists` fail for existing tables, as a lingering
    /// reader's lock would.
    pub fn set_failing_drops(&self, failing: bool) {
        self.state().failing_drops = failing;
    }

    fn insert_tsv(&self, table_name: &str, positions: &[usize], data: &[u8]) -> Result<u64> {
        let mut state = self.state();
        let table = state.table_mut(table_name)?;
        let key_positions = match &table.primary_key {
            Some(key) => table.positions(&key.columns).ok_or_else(|| {
                RefreshError::Store(format!("primary key of {} names unknown columns", table_name))
            })?,
            None => Vec::new(),
        };
        let mut seen: HashSet<Row> = if key_positions.is_empty() {
            HashSet::new()
        } else {
            table.rows.iter().map(|r| table.key_of(r, &key_positions)).collect()
        };

        let mut reader = ReaderBuilder::new()
            .delimiter(b'\t')
            .has_headers(false)
            .quoting(false)
            .flexible(true)
            .from_reader(data);

        let mut inserted = 0u64;
        for (line, record) in reader.records().enumerate() {
            let record = record.map_err(|e| {
                RefreshError::Store(format!("invalid row in {}: {}", table_name, e))
            })?;
            if record.len() != positions.len() {
                return Err(RefreshError::Store(format!(
                    "row {} of {}: expected {} fields, found {}",
                    line + 1,
                    table_name,
                    positions.len(),
                    record.len()
                )));
            }
            let mut row: Row = vec![None; table.columns.len()];
            for (value, position) in record.iter().zip(positions) {
                row[*position] = (value != NULL_MARKER).then(|| value.to_string());
            }
            if !key_positions.is_empty() && !seen.insert(table.key_of(&row, &key_positions)) {
                return Err(RefreshError::Store(format!(
                    "duplicate key value violates primary key of {}",
                    table_name
                )));
            }
            table.rows.push(row);
            inserted += 1;
        }
        Ok(inserted)
    }
}

#[async_trait]
impl TableStore for MemoryStore {
    async fn table_exists(&self, table: &str) -> Result<bool> {
        Ok(self.state().tables.contains_key(table))
    }

    async fn secondary_indexes(&self, table: &str) -> Result<Vec<IndexDefinition>> {
        let state = self.state();
        let mut indexes = state.table(table)?.indexes.clone();
        indexes.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(indexes)
    }

    async fn primary_key(&self, table: &str) -> Result<Option<PrimaryKey>> {
        Ok(self.state().table(table)?.primary_key.clone())
    }

    async fn create_table_like(
        &self,
        table: &str,
        shadow: &str,
        shadow_key: Option<&PrimaryKey>,
    ) -> Result<()> {
        {
            let mut state = self.state();
            let columns = state.table(table)?.columns.clone();
            state.claim_name(shadow)?;
            if let Some(key) = shadow_key {
                state.claim_name(&key.name)?;
            }
            state.tables.insert(
                shadow.to_string(),
                MemoryTable {
                    columns,
                    primary_key: shadow_key.cloned(),
                    indexes: Vec::new(),
                    rows: Vec::new(),
                },
            );
        }
        self.record(format!("create_table_like {} {}", table, shadow));
        Ok(())
    }

    async fn bulk_load(
        &self,
        table: &str,
        columns: &[String],
        mut chunks: ChunkReceiver,
    ) -> Result<u64> {
        let positions = {
            let state = self.state();
            let target = state.table(table)?;
            if columns.is_empty() {
                (0..target.columns.len()).collect()
            } else {
                target.positions(columns).ok_or_else(|| {
                    RefreshError::Store(format!(
                        "column list {:?} does not match {}",
                        columns, table
                    ))
                })?
            }
        };

        let mut pending: Vec<u8> = Vec::new();
        let mut loaded = 0u64;
        while let Some(chunk) = chunks.recv().await {
            pending.extend_from_slice(&chunk?);
            if let Some(last_newline) = pending.iter().rposition(|b| *b == b'\n') {
                let complete: Vec<u8> = pending.drain(..=last_newline).collect();
                loaded += self.insert_tsv(table, &positions, &complete)?;
            }
            tokio::task::yield_now().await;
        }
        if !pending.is_empty() {
            loaded += self.insert_tsv(table, &positions, &pending)?;
        }

        self.record(format!("bulk_load {} {}", table, loaded));
        Ok(loaded)
    }

    async fn create_index(&self, table: &str, index: &IndexDefinition) -> Result<()> {
        {
            let mut state = self.state();
            state.claim_name(&index.name)?;
            let target = state.table_mut(table)?;
            let positions = target.positions(&index.columns).ok_or_else(|| {
                RefreshError::Store(format!(
                    "index {} names unknown columns of {}",
                    index.name, table
                ))
            })?;
            if index.unique {
                let mut seen = HashSet::new();
                if !target.rows.iter().all(|r| seen.insert(target.key_of(r, &positions))) {
                    return Err(RefreshError::Store(format!(
                        "could not create unique index {}: duplicate keys",
                        index.name
                    )));
                }
            }
            target.indexes.push(index.clone());
        }
        self.record(format!("create_index {} {}", table, index.name));
        Ok(())
    }

    async fn analyze(&self, table: &str) -> Result<()> {
        self.state().table(table)?;
        self.record(format!("analyze {}", table));
        Ok(())
    }

    async fn swap_tables(&self, swap: &TableSwap) -> Result<()> {
        let mut state = self.state();
        state.table(&swap.table)?;
        state.table(&swap.shadow)?;
        if state.tables.contains_key(&swap.retiring) {
            return Err(RefreshError::Store(format!("relation {} already exists", swap.retiring)));
        }

        let mut old = state.tables.remove(&swap.table).ok_or_else(|| {
            RefreshError::Store(format!("table {} does not exist", swap.table))
        })?;
        let mut new = state.tables.remove(&swap.shadow).ok_or_else(|| {
            RefreshError::Store(format!("table {} does not exist", swap.shadow))
        })?;

        let renamed = rename_relations(&mut old, &swap.retire_key, &swap.retire_indexes)
            .and_then(|_| rename_relations(&mut new, &swap.promote_key, &swap.promote_indexes));
        if let Err(e) = renamed {
            // Roll back: nothing was visible in between.
            state.tables.insert(swap.table.clone(), old);
            state.tables.insert(swap.shadow.clone(), new);
            return Err(e);
        }

        state.tables.insert(swap.retiring.clone(), old);
        state.tables.insert(swap.table.clone(), new);
        state.operations.push(format!("swap {} {}", swap.table, swap.shadow));
        Ok(())
    }

    async fn drop_table_if_exists(&self, table: &str) -> Result<()> {
        let mut state = self.state();
        if !state.tables.contains_key(table) {
            return Ok(());
        }
        if state.failing_drops {
            return Err(RefreshError::Store(format!(
                "could not obtain lock on relation {}",
                table
            )));
        }
        state.tables.remove(table);
        state.operations.push(format!("drop {}", table));
        Ok(())
    }

    async fn has_rows(&self, table: &str) -> Result<bool> {
        Ok(!self.state().table(table)?.rows.is_empty())
    }

    async fn estimate_rows(&self, table: &str) -> Result<u64> {
        Ok(self.state().table(table)?.rows.len() as u64)
    }
}

fn rename_relations(
    table: &mut MemoryTable,
    key: &Option<(String, String)>,
    indexes: &[(String, String)],
) -> Result<()> {
    if let Some((from, to)) = key {
        match table.primary_key.as_mut() {
            Some(pk) if &pk.name == from => pk.name = to.clone(),
            _ => return Err(RefreshError::Store(format!("constraint {} does not exist", from))),
        }
    }
    for (from, to) in indexes {
        let index = table
            .indexes
            .iter_mut()
            .find(|i| &i.name == from)
            .ok_or_else(|| RefreshError::Store(format!("index {} does not exist", from)))?;
        index.name = to.clone();
    }
    Ok(())
}

#[async_trait]
impl MetadataStore for MemoryStore {
    async fn load_metadata(&self) -> Result<Option<RefreshMetadata>> {
        Ok(self.state().metadata.clone())
    }

    async fn save_metadata(&self, metadata: &RefreshMetadata) -> Result<()> {
        self.state().metadata = Some(metadata.clone());
        Ok(())
    }
}
