//! Swapper: promotes a loaded shadow to production in one transaction.

use crate::db::{TableStore, TableSwap};
use crate::error::{RefreshError, Result};
use crate::refresh::introspect::TableShape;
use crate::refresh::loader::ShadowState;
use crate::schema::{generation_name, Generation};
use std::sync::Arc;
use tracing::{info, warn};

/// Every rename needed to promote the shadow of `table`.
pub fn plan_swap(table: &str, shape: &TableShape) -> TableSwap {
    let rename = |name: &str, from: Generation, to: Generation| {
        (generation_name(name, from), generation_name(name, to))
    };
    TableSwap {
        table: table.to_string(),
        shadow: generation_name(table, Generation::Shadow),
        retiring: generation_name(table, Generation::Retiring),
        retire_indexes: shape
            .indexes
            .iter()
            .map(|i| rename(&i.name, Generation::Production, Generation::Retiring))
            .collect(),
        promote_indexes: shape
            .indexes
            .iter()
            .map(|i| rename(&i.name, Generation::Shadow, Generation::Production))
            .collect(),
        retire_key: shape
            .primary_key
            .as_ref()
            .map(|k| rename(&k.name, Generation::Production, Generation::Retiring)),
        promote_key: shape
            .primary_key
            .as_ref()
            .map(|k| rename(&k.name, Generation::Shadow, Generation::Production)),
    }
}

pub struct Swapper {
    store: Arc<dyn TableStore>,
}

impl Swapper {
    pub fn new(store: Arc<dyn TableStore>) -> Self {
        Self { store }
    }

    /// Swap the shadow of `table` in and drop the generation it replaced.
    ///
    /// Only the rename can fail the promotion. A retiring table that cannot
    /// be dropped is left for the next refresh of the same table.
    pub async fn promote(&self, table: &str, shape: &TableShape) -> Result<()> {
        let swap = plan_swap(table, shape);

        self.store
            .drop_table_if_exists(&swap.retiring)
            .await
            .map_err(|e| {
                RefreshError::swap(
                    table,
                    format!("stale {} cannot be dropped: {}", swap.retiring, e),
                )
            })?;

        self.store
            .swap_tables(&swap)
            .await
            .map_err(|e| RefreshError::swap(table, e))?;
        info!(
            table = %table,
            retiring = %swap.retiring,
            state = ?ShadowState::Swapped,
            "shadow promoted"
        );

        match self.store.drop_table_if_exists(&swap.retiring).await {
            Ok(()) => info!(
                table = %table,
                state = ?ShadowState::Retired,
                "retiring generation dropped"
            ),
            Err(e) => warn!(
                table = %table,
                retiring = %swap.retiring,
                error = %e,
                "cannot drop retiring generation; will retry on next refresh"
            ),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryStore;
    use crate::schema::{IndexDefinition, PrimaryKey};

    fn shape() -> TableShape {
        TableShape {
            primary_key: Some(PrimaryKey {
                name: "title_basics_pkey".into(),
                columns: vec!["tconst".into()],
            }),
            indexes: vec![
                IndexDefinition::full_text(
                    "title_basics_fts",
                    &["primary_title", "original_title"],
                ),
                IndexDefinition::ordinary("title_basics_type_idx", &["title_type", "start_year"]),
            ],
        }
    }

    fn store_with_generations(shape: &TableShape) -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        let columns = ["tconst", "title_type", "primary_title", "original_title", "start_year"];
        store
            .create_table(
                "title_basics",
                &columns,
                shape.primary_key.clone(),
                shape.indexes.clone(),
            )
            .unwrap();
        store
            .insert_rows("title_basics", &[&["tt1", "movie", "Old", "Old", "1990"]])
            .unwrap();
        let shadow_key = shape.primary_key.as_ref().map(|k| PrimaryKey {
            name: generation_name(&k.name, Generation::Shadow),
            columns: k.columns.clone(),
        });
        store
            .create_table(
                "title_basics__shadow",
                &columns,
                shadow_key,
                shape.indexes.iter().map(|i| i.renamed_for(Generation::Shadow)).collect(),
            )
            .unwrap();
        store
            .insert_rows(
                "title_basics__shadow",
                &[&["tt1", "movie", "New", "New", "1990"], &["tt2", "short", "B", "B", "1991"]],
            )
            .unwrap();
        store
    }

    #[test]
    fn test_plan_swap_names() {
        let swap = plan_swap("title_basics", &shape());
        assert_eq!(swap.shadow, "title_basics__shadow");
        assert_eq!(swap.retiring, "title_basics__retiring");
        assert_eq!(
            swap.retire_indexes[0],
            ("title_basics_fts".to_string(), "title_basics_fts__retiring".to_string())
        );
        assert_eq!(
            swap.promote_key,
            Some(("title_basics_pkey__shadow".to_string(), "title_basics_pkey".to_string()))
        );
    }

    #[tokio::test]
    async fn test_promote_keeps_index_set() {
        let shape = shape();
        let store = store_with_generations(&shape);

        Swapper::new(store.clone()).promote("title_basics", &shape).await.unwrap();

        let promoted = store.table("title_basics").unwrap();
        assert_eq!(promoted.rows.len(), 2);
        assert_eq!(promoted.indexes, shape.indexes);
        assert_eq!(promoted.primary_key, shape.primary_key);
        assert_eq!(store.table_names(), vec!["title_basics".to_string()]);
    }

    #[tokio::test]
    async fn test_failed_drop_does_not_undo_promotion() {
        let shape = shape();
        let store = store_with_generations(&shape);
        let swapper = Swapper::new(store.clone());

        // The stale-retiring drop is a no-op here; only the post-swap drop fails.
        store.set_failing_drops(true);
        swapper.promote("title_basics", &shape).await.unwrap();
        assert_eq!(store.row_count("title_basics"), Some(2));
        assert_eq!(store.row_count("title_basics__retiring"), Some(1));
    }

    #[tokio::test]
    async fn test_stale_retiring_is_cleared_first() {
        let shape = shape();
        let store = store_with_generations(&shape);
        store.create_table("title_basics__retiring", &["tconst"], None, vec![]).unwrap();

        Swapper::new(store.clone()).promote("title_basics", &shape).await.unwrap();
        assert!(store.table("title_basics__retiring").is_none());
        assert_eq!(store.row_count("title_basics"), Some(2));
    }

    #[tokio::test]
    async fn test_missing_shadow_is_a_swap_error() {
        let shape = shape();
        let store = Arc::new(MemoryStore::new());
        store
            .create_table("title_basics", &["tconst"], None, vec![])
            .unwrap();
        let err = Swapper::new(store.clone()).promote("title_basics", &shape).await.unwrap_err();
        assert!(matches!(err, RefreshError::Swap { .. }));
        assert!(store.table("title_basics").is_some());
    }
}
