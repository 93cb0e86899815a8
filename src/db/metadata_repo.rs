//! Refresh metadata persistence for PostgreSQL

use crate::db::postgres::PgStore;
use crate::db::store::MetadataStore;
use crate::error::Result;
use crate::metadata::{RefreshMetadata, RefreshStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Row;

/// Single-row table read by external monitors.
pub const METADATA_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS refresh_metadata (
    id SMALLINT PRIMARY KEY DEFAULT 1 CHECK (id = 1),
    last_refresh TIMESTAMPTZ,
    next_refresh TIMESTAMPTZ,
    status TEXT NOT NULL DEFAULT 'pending',
    total_rows BIGINT NOT NULL DEFAULT 0,
    updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
);
"#;

#[async_trait]
impl MetadataStore for PgStore {
    async fn load_metadata(&self) -> Result<Option<RefreshMetadata>> {
        let row = sqlx::query(
            r#"
            SELECT last_refresh, next_refresh, status, total_rows, updated_at
            FROM refresh_metadata
            WHERE id = 1
            "#,
        )
        .fetch_optional(self.pool())
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let status: String = row.try_get("status")?;
        let total_rows: i64 = row.try_get("total_rows")?;
        Ok(Some(RefreshMetadata {
            last_refresh: row.try_get::<Option<DateTime<Utc>>, _>("last_refresh")?,
            next_refresh: row.try_get::<Option<DateTime<Utc>>, _>("next_refresh")?,
            status: status.parse::<RefreshStatus>()?,
            total_rows: total_rows.max(0) as u64,
            updated_at: row.try_get("updated_at")?,
        }))
    }

    async fn save_metadata(&self, metadata: &RefreshMetadata) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO refresh_metadata
                (id, last_refresh, next_refresh, status, total_rows, updated_at)
            VALUES (1, $1, $2, $3, $4, $5)
            ON CONFLICT (id) DO UPDATE SET
                last_refresh = EXCLUDED.last_refresh,
                next_refresh = EXCLUDED.next_refresh,
                status = EXCLUDED.status,
                total_rows = EXCLUDED.total_rows,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(metadata.last_refresh)
        .bind(metadata.next_refresh)
        .bind(metadata.status.as_str())
        .bind(i64::try_from(metadata.total_rows).unwrap_or(i64::MAX))
        .bind(metadata.updated_at)
        .execute(self.pool())
        .await?;
        Ok(())
    }
}
