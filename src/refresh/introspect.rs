//! Schema introspection: what the production table looks like before a load.

use crate::db::TableStore;
use crate::error::{RefreshError, Result};
use crate::schema::{IndexDefinition, PrimaryKey};
use std::sync::Arc;
use tracing::debug;

/// Everything about a table the loader has to reproduce on its shadow.
#[derive(Clone, Debug, PartialEq)]
pub struct TableShape {
    pub primary_key: Option<PrimaryKey>,
    /// Secondary indexes sorted by name.
    pub indexes: Vec<IndexDefinition>,
}

pub struct SchemaIntrospector {
    store: Arc<dyn TableStore>,
}

impl SchemaIntrospector {
    pub fn new(store: Arc<dyn TableStore>) -> Self {
        Self { store }
    }

    /// Secondary indexes of `table`, without the primary key, sorted by name.
    pub async fn capture_indexes(&self, table: &str) -> Result<Vec<IndexDefinition>> {
        self.ensure_exists(table).await?;
        let mut indexes = self.store.secondary_indexes(table).await?;
        indexes.sort_by(|a, b| a.name.cmp(&b.name));

        for index in &indexes {
            if index.columns.is_empty() {
                return Err(RefreshError::Schema {
                    table: table.to_string(),
                    message: format!("index {} has no columns", index.name),
                });
            }
            debug!(
                table = %table,
                index = %index.name,
                unique = index.unique,
                kind = ?index.kind,
                columns = ?index.columns,
                "captured index"
            );
        }
        Ok(indexes)
    }

    pub async fn capture(&self, table: &str) -> Result<TableShape> {
        let indexes = self.capture_indexes(table).await?;
        let primary_key = self.store.primary_key(table).await?;
        Ok(TableShape {
            primary_key,
            indexes,
        })
    }

    async fn ensure_exists(&self, table: &str) -> Result<()> {
        if self.store.table_exists(table).await? {
            Ok(())
        } else {
            Err(RefreshError::Schema {
                table: table.to_string(),
                message: "production table does not exist; run `init` first".to_string(),
            })
        }
    }
}
