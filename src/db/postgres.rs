//! PostgreSQL implementation of the table store.

use crate::db::store::{ChunkReceiver, TableStore, TableSwap};
use crate::error::{RefreshError, Result};
use crate::schema::{quote_ident, IndexDefinition, IndexKind, PrimaryKey};
use async_trait::async_trait;
use regex::Regex;
use sqlx::postgres::{PgConnection, PgPool};
use sqlx::{Connection, Row};
use std::sync::OnceLock;
use tracing::{debug, info, warn};

/// Schema for the default dataset catalog (embedded).
pub const IMDB_SCHEMA: &str = include_str!("imdb_schema.sql");

/// Text search configuration used by full-text indexes.
const FULL_TEXT_CONFIG: &str = "simple";

/// How long the promotion transaction waits for readers' locks.
const SWAP_LOCK_TIMEOUT: &str = "60s";

/// Split an SQL script into individual statements, skipping comment-only
/// fragments.
pub fn schema_statements(schema: &str) -> Vec<&str> {
    schema
        .split(';')
        .filter_map(|statement| {
            let trimmed = statement.trim();
            if trimmed.is_empty() {
                return None;
            }
            let has_sql = trimmed.lines().any(|line| {
                let line = line.trim();
                !line.is_empty() && !line.starts_with("--")
            });
            has_sql.then_some(trimmed)
        })
        .collect()
}

/// `CREATE INDEX` statement reproducing `index` on `table`.
///
/// Full-text indexes are GIN indexes over the concatenated, null-safe text of
/// their columns, which is also the shape `secondary_indexes` recognises.
pub fn create_index_sql(table: &str, index: &IndexDefinition) -> String {
    match index.kind {
        IndexKind::Ordinary => {
            let columns: Vec<String> = index.columns.iter().map(|c| quote_ident(c)).collect();
            format!(
                "CREATE {}INDEX {} ON {} ({})",
                if index.unique { "UNIQUE " } else { "" },
                quote_ident(&index.name),
                quote_ident(table),
                columns.join(", ")
            )
        }
        IndexKind::FullText => {
            let document: Vec<String> = index
                .columns
                .iter()
                .map(|c| format!("coalesce({}::text, '')", quote_ident(c)))
                .collect();
            format!(
                "CREATE INDEX {} ON {} USING gin (to_tsvector('{}', {}))",
                quote_ident(&index.name),
                quote_ident(table),
                FULL_TEXT_CONFIG,
                document.join(" || ' ' || ")
            )
        }
    }
}

/// DDL statements for one promotion, in execution order.
pub fn swap_statements(swap: &TableSwap) -> Vec<String> {
    let mut statements = vec![format!(
        "ALTER TABLE {} RENAME TO {}",
        quote_ident(&swap.table),
        quote_ident(&swap.retiring)
    )];
    if let Some((from, to)) = &swap.retire_key {
        statements.push(format!(
            "ALTER TABLE {} RENAME CONSTRAINT {} TO {}",
            quote_ident(&swap.retiring),
            quote_ident(from),
            quote_ident(to)
        ));
    }
    for (from, to) in &swap.retire_indexes {
        statements.push(format!("ALTER INDEX {} RENAME TO {}", quote_ident(from), quote_ident(to)));
    }
    statements.push(format!(
        "ALTER TABLE {} RENAME TO {}",
        quote_ident(&swap.shadow),
        quote_ident(&swap.table)
    ));
    if let Some((from, to)) = &swap.promote_key {
        statements.push(format!(
            "ALTER TABLE {} RENAME CONSTRAINT {} TO {}",
            quote_ident(&swap.table),
            quote_ident(from),
            quote_ident(to)
        ));
    }
    for (from, to) in &swap.promote_indexes {
        statements.push(format!("ALTER INDEX {} RENAME TO {}", quote_ident(from), quote_ident(to)));
    }
    statements
}

fn full_text_columns(definition: &str) -> Vec<String> {
    static COALESCED: OnceLock<Regex> = OnceLock::new();
    let re = COALESCED.get_or_init(|| {
        Regex::new(r#"(?i)coalesce\(\(*"?([A-Za-z_][A-Za-z0-9_$]*)"?"#).expect("valid regex")
    });
    re.captures_iter(definition)
        .map(|caps| caps[1].to_string())
        .collect()
}

/// Whether `create_index_sql` reproduces this full-text definition: the same
/// text search configuration and exactly the literals it emits (one empty
/// string per column, one space between columns).
fn is_rebuildable_full_text(definition: &str, column_count: usize) -> bool {
    static LITERAL: OnceLock<Regex> = OnceLock::new();
    let re = LITERAL.get_or_init(|| Regex::new(r"'(?:[^']|'')*'").expect("valid regex"));
    let literals: Vec<&str> = re.find_iter(definition).map(|m| m.as_str()).collect();

    let Some((config, rest)) = literals.split_first() else {
        return false;
    };
    let empties = rest.iter().filter(|l| **l == "''").count();
    let separators = rest.iter().filter(|l| **l == "' '").count();
    config.trim_matches('\'') == FULL_TEXT_CONFIG
        && empties == column_count
        && separators + 1 == column_count
        && rest.len() == empties + separators
}

/// Turn one catalog row into an [`IndexDefinition`].
#[allow(clippy::too_many_arguments)]
fn index_from_catalog(
    table: &str,
    name: String,
    unique: bool,
    method: &str,
    definition: &str,
    columns: Vec<String>,
    has_expressions: bool,
    is_partial: bool,
) -> Result<IndexDefinition> {
    let unsupported = |reason: &str| RefreshError::Schema {
        table: table.to_string(),
        message: format!("index {} cannot be recreated: {}", name, reason),
    };

    if is_partial {
        return Err(unsupported("partial indexes are not supported"));
    }
    match method {
        "btree" if !has_expressions => Ok(IndexDefinition {
            name,
            unique,
            kind: IndexKind::Ordinary,
            columns,
        }),
        "btree" => Err(unsupported("expression indexes are not supported")),
        "gin" if definition.contains("to_tsvector") => {
            let columns = full_text_columns(definition);
            if columns.is_empty() {
                return Err(unsupported("no columns found in full-text expression"));
            }
            if !is_rebuildable_full_text(definition, columns.len()) {
                return Err(unsupported(&format!(
                    "full-text expression differs from to_tsvector('{}', …) \
                     over space-joined columns",
                    FULL_TEXT_CONFIG
                )));
            }
            Ok(IndexDefinition {
                name,
                unique: false,
                kind: IndexKind::FullText,
                columns,
            })
        }
        other => Err(unsupported(&format!("access method {}", other))),
    }
}

pub struct PgStore {
    pool: PgPool,
    suspend_triggers: bool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            suspend_triggers: true,
        }
    }

    /// Whether bulk loads try `session_replication_role = replica`, which
    /// skips trigger-based (foreign key) checks but needs superuser rights.
    pub fn with_trigger_suspension(mut self, enabled: bool) -> Self {
        self.suspend_triggers = enabled;
        self
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the metadata table if it does not exist yet.
    pub async fn migrate(&self) -> Result<()> {
        for statement in schema_statements(crate::db::metadata_repo::METADATA_SCHEMA) {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    /// Execute every statement of an SQL script, returning how many ran.
    pub async fn apply_schema(&self, schema: &str) -> Result<usize> {
        let statements = schema_statements(schema);
        let mut tx = self.pool.begin().await?;
        for statement in &statements {
            debug!(statement = %statement, "applying schema statement");
            sqlx::query(statement).execute(&mut *tx).await?;
        }
        tx.commit().await?;
        Ok(statements.len())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn execute(&self, sql: &str) -> Result<()> {
        debug!(sql = %sql, "executing");
        sqlx::query(sql).execute(&self.pool).await?;
        Ok(())
    }
}

fn copy_statement(table: &str, columns: &[String]) -> String {
    if columns.is_empty() {
        return format!("COPY {} FROM STDIN WITH (FORMAT text)", quote_ident(table));
    }
    let column_list: Vec<String> = columns.iter().map(|c| quote_ident(c)).collect();
    format!(
        "COPY {} ({}) FROM STDIN WITH (FORMAT text)",
        quote_ident(table),
        column_list.join(", ")
    )
}

async fn copy_chunks(
    conn: &mut PgConnection,
    statement: &str,
    mut chunks: ChunkReceiver,
) -> Result<u64> {
    let mut copy = conn.copy_in_raw(statement).await?;
    while let Some(chunk) = chunks.recv().await {
        match chunk {
            Ok(bytes) => {
                copy.send(bytes).await?;
            }
            Err(e) => {
                if let Err(abort_err) = copy.abort(format!("source stream failed: {}", e)).await {
                    debug!(error = %abort_err, "COPY abort acknowledged with error");
                }
                return Err(RefreshError::Io(e));
            }
        }
    }
    Ok(copy.finish().await?)
}

#[async_trait]
impl TableStore for PgStore {
    async fn table_exists(&self, table: &str) -> Result<bool> {
        let exists = sqlx::query_scalar::<_, bool>("SELECT to_regclass($1) IS NOT NULL")
            .bind(quote_ident(table))
            .fetch_one(&self.pool)
            .await?;
        Ok(exists)
    }

    async fn secondary_indexes(&self, table: &str) -> Result<Vec<IndexDefinition>> {
        let rows = sqlx::query(
            r#"
            SELECT i.relname::text AS index_name,
                   ix.indisunique AS is_unique,
                   am.amname::text AS method,
                   pg_get_indexdef(ix.indexrelid) AS definition,
                   ix.indexprs IS NOT NULL AS has_expressions,
                   ix.indpred IS NOT NULL AS is_partial,
                   ARRAY(
                       SELECT a.attname::text
                       FROM unnest(ix.indkey::int2[]) WITH ORDINALITY AS k(attnum, ord)
                       JOIN pg_attribute a ON a.attrelid = ix.indrelid AND a.attnum = k.attnum
                       ORDER BY k.ord
                   ) AS columns
            FROM pg_index ix
            JOIN pg_class i ON i.oid = ix.indexrelid
            JOIN pg_am am ON am.oid = i.relam
            WHERE ix.indrelid = to_regclass($1)
              AND NOT ix.indisprimary
            ORDER BY i.relname
            "#,
        )
        .bind(quote_ident(table))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                let method: String = row.try_get("method")?;
                let definition: String = row.try_get("definition")?;
                index_from_catalog(
                    table,
                    row.try_get("index_name")?,
                    row.try_get("is_unique")?,
                    &method,
                    &definition,
                    row.try_get("columns")?,
                    row.try_get("has_expressions")?,
                    row.try_get("is_partial")?,
                )
            })
            .collect()
    }

    async fn primary_key(&self, table: &str) -> Result<Option<PrimaryKey>> {
        let row = sqlx::query(
            r#"
            SELECT c.conname::text AS name,
                   ARRAY(
                       SELECT a.attname::text
                       FROM unnest(c.conkey) WITH ORDINALITY AS k(attnum, ord)
                       JOIN pg_attribute a ON a.attrelid = c.conrelid AND a.attnum = k.attnum
                       ORDER BY k.ord
                   ) AS columns
            FROM pg_constraint c
            WHERE c.conrelid = to_regclass($1) AND c.contype = 'p'
            "#,
        )
        .bind(quote_ident(table))
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Some(PrimaryKey {
                name: row.try_get("name")?,
                columns: row.try_get("columns")?,
            })),
            None => Ok(None),
        }
    }

    async fn create_table_like(
        &self,
        table: &str,
        shadow: &str,
        shadow_key: Option<&PrimaryKey>,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(&format!(
            "CREATE TABLE {} (LIKE {} INCLUDING DEFAULTS INCLUDING CONSTRAINTS \
             INCLUDING IDENTITY INCLUDING GENERATED INCLUDING STORAGE)",
            quote_ident(shadow),
            quote_ident(table)
        ))
        .execute(&mut *tx)
        .await?;
        if let Some(key) = shadow_key {
            let columns: Vec<String> = key.columns.iter().map(|c| quote_ident(c)).collect();
            sqlx::query(&format!(
                "ALTER TABLE {} ADD CONSTRAINT {} PRIMARY KEY ({})",
                quote_ident(shadow),
                quote_ident(&key.name),
                columns.join(", ")
            ))
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn bulk_load(
        &self,
        table: &str,
        columns: &[String],
        chunks: ChunkReceiver,
    ) -> Result<u64> {
        let mut conn = self.pool.acquire().await?;

        let suspended = if self.suspend_triggers {
            match sqlx::query("SET session_replication_role = replica")
                .execute(&mut *conn)
                .await
            {
                Ok(_) => true,
                Err(e) => {
                    warn!(
                        table = %table,
                        error = %e,
                        "cannot suspend trigger checks; loading with checks active"
                    );
                    false
                }
            }
        } else {
            false
        };

        let statement = copy_statement(table, columns);

        match copy_chunks(&mut conn, &statement, chunks).await {
            Ok(rows) => {
                if suspended {
                    sqlx::query("RESET session_replication_role")
                        .execute(&mut *conn)
                        .await?;
                }
                info!(table = %table, rows, "bulk load finished");
                Ok(rows)
            }
            Err(e) => {
                // The session may still carry the replication role or a broken
                // COPY; never hand it back to the pool.
                if let Err(close_err) = conn.detach().close().await {
                    debug!(error = %close_err, "closing failed load connection");
                }
                Err(e)
            }
        }
    }

    async fn create_index(&self, table: &str, index: &IndexDefinition) -> Result<()> {
        self.execute(&create_index_sql(table, index)).await
    }

    async fn analyze(&self, table: &str) -> Result<()> {
        self.execute(&format!("ANALYZE {}", quote_ident(table))).await
    }

    async fn swap_tables(&self, swap: &TableSwap) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(&format!("SET LOCAL lock_timeout = '{}'", SWAP_LOCK_TIMEOUT))
            .execute(&mut *tx)
            .await?;
        for statement in swap_statements(swap) {
            debug!(sql = %statement, "swap statement");
            sqlx::query(&statement).execute(&mut *tx).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn drop_table_if_exists(&self, table: &str) -> Result<()> {
        self.execute(&format!("DROP TABLE IF EXISTS {}", quote_ident(table))).await
    }

    async fn has_rows(&self, table: &str) -> Result<bool> {
        let exists = sqlx::query_scalar::<_, bool>(&format!(
            "SELECT EXISTS (SELECT 1 FROM {})",
            quote_ident(table)
        ))
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    async fn estimate_rows(&self, table: &str) -> Result<u64> {
        let estimate = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT GREATEST(c.reltuples::bigint, COALESCE(s.n_live_tup, 0), 0)
            FROM pg_class c
            LEFT JOIN pg_stat_user_tables s ON s.relid = c.oid
            WHERE c.oid = to_regclass($1)
            "#,
        )
        .bind(quote_ident(table))
        .fetch_optional(&self.pool)
        .await?;

        match estimate {
            Some(rows) => Ok(rows.max(0) as u64),
            None => Err(RefreshError::Store(format!("table {} does not exist", table))),
        }
    }
}
