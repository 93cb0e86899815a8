//! Shadow loader: bulk loads one table into its shadow generation.
//!
//! `Created → BulkInserted → IndexesRebuilt`; the swapper takes it from there.
//! Production is never touched here, so any failure leaves readers on the
//! previous generation and the shadow in place for inspection.

use crate::db::TableStore;
use crate::error::{LoadPhase, RefreshError, Result};
use crate::refresh::artifact::{open_tsv, SourceArtifact};
use crate::refresh::introspect::TableShape;
use crate::schema::{generation_name, Generation, PrimaryKey};
use std::io::{self, BufRead, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::info;

/// Decompressed bytes per chunk handed to the store.
const DEFAULT_CHUNK_SIZE: usize = 1 << 20;

/// Chunks buffered between the decoder thread and the store.
const CHANNEL_DEPTH: usize = 8;

/// Per-table life cycle of a refresh.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShadowState {
    Created,
    BulkInserted,
    IndexesRebuilt,
    Swapped,
    Retired,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LoadOutcome {
    pub shadow: String,
    pub rows: u64,
}

pub struct ShadowLoader {
    store: Arc<dyn TableStore>,
    chunk_size: usize,
}

impl ShadowLoader {
    pub fn new(store: Arc<dyn TableStore>) -> Self {
        Self {
            store,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Build a fully indexed shadow of `table` from `artifact`.
    pub async fn load(
        &self,
        table: &str,
        artifact: &SourceArtifact,
        has_header: bool,
        shape: &TableShape,
    ) -> Result<LoadOutcome> {
        let shadow = generation_name(table, Generation::Shadow);

        // A shadow left by a failed run is replaced wholesale.
        self.store
            .drop_table_if_exists(&shadow)
            .await
            .map_err(|e| RefreshError::load(table, LoadPhase::CreateShadow, e))?;
        let shadow_key = shape.primary_key.as_ref().map(|key| PrimaryKey {
            name: generation_name(&key.name, Generation::Shadow),
            columns: key.columns.clone(),
        });
        self.store
            .create_table_like(table, &shadow, shadow_key.as_ref())
            .await
            .map_err(|e| RefreshError::load(table, LoadPhase::CreateShadow, e))?;
        info!(
            table = %table,
            shadow = %shadow,
            state = ?ShadowState::Created,
            "shadow table created"
        );

        let columns = if has_header {
            read_header(&artifact.path)
                .await
                .map_err(|e| RefreshError::load(table, LoadPhase::Decompress, e))?
        } else {
            Vec::new()
        };

        let rows = self.bulk_insert(table, &shadow, artifact, has_header, &columns).await?;
        info!(table = %table, rows, state = ?ShadowState::BulkInserted, "shadow table populated");

        for index in &shape.indexes {
            let shadow_index = index.renamed_for(Generation::Shadow);
            self.store
                .create_index(&shadow, &shadow_index)
                .await
                .map_err(|e| RefreshError::load(table, LoadPhase::RebuildIndexes, e))?;
            info!(table = %table, index = %index.name, kind = ?index.kind, "index rebuilt");
        }
        self.store
            .analyze(&shadow)
            .await
            .map_err(|e| RefreshError::load(table, LoadPhase::Analyze, e))?;
        info!(
            table = %table,
            indexes = shape.indexes.len(),
            state = ?ShadowState::IndexesRebuilt,
            "shadow table ready for promotion"
        );

        Ok(LoadOutcome { shadow, rows })
    }

    async fn bulk_insert(
        &self,
        table: &str,
        shadow: &str,
        artifact: &SourceArtifact,
        has_header: bool,
        columns: &[String],
    ) -> Result<u64> {
        let (tx, rx) = mpsc::channel(CHANNEL_DEPTH);
        let path = artifact.path.clone();
        let chunk_size = self.chunk_size;
        let decoder =
            tokio::task::spawn_blocking(move || {
                stream_decompressed(&path, has_header, chunk_size, tx)
            });

        let loaded = self.store.bulk_load(shadow, columns, rx).await;

        // A decoding failure explains a failed load better than the store's
        // complaint about the aborted stream.
        match decoder.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(RefreshError::load(table, LoadPhase::Decompress, e)),
            Err(e) => return Err(RefreshError::load(table, LoadPhase::Decompress, e)),
        }
        loaded.map_err(|e| RefreshError::load(table, LoadPhase::BulkInsert, e))
    }
}

/// Column names from the artifact's header line, in snake_case.
async fn read_header(path: &Path) -> io::Result<Vec<String>> {
    let path: PathBuf = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let mut reader = open_tsv(&path)?;
        let mut line = String::new();
        reader.read_line(&mut line)?;
        let line = line.trim_end_matches(['\n', '\r']);
        if line.is_empty() {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "artifact has no header line"));
        }
        Ok(line.split('\t').map(to_snake_case).collect())
    })
    .await
    .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?
}

/// Runs on the blocking pool. Stream errors are forwarded to the consumer
/// and returned; a consumer that hung up ends the stream quietly.
fn stream_decompressed(
    path: &Path,
    skip_header: bool,
    chunk_size: usize,
    tx: mpsc::Sender<io::Result<Vec<u8>>>,
) -> io::Result<()> {
    let result = pump(path, skip_header, chunk_size, &tx);
    if let Err(e) = &result {
        let _ = tx.blocking_send(Err(io::Error::new(e.kind(), e.to_string())));
    }
    result
}

fn pump(
    path: &Path,
    skip_header: bool,
    chunk_size: usize,
    tx: &mpsc::Sender<io::Result<Vec<u8>>>,
) -> io::Result<()> {
    let mut reader = open_tsv(path)?;
    if skip_header {
        let mut header = Vec::new();
        reader.read_until(b'\n', &mut header)?;
    }
    loop {
        let mut buf = vec![0u8; chunk_size];
        let n = reader.read(&mut buf)?;
        if n == 0 {
            return Ok(());
        }
        buf.truncate(n);
        if tx.blocking_send(Ok(buf)).is_err() {
            return Ok(());
        }
    }
}

/// `titleType` → `title_type`, `URLPath` → `url_path`; snake_case input is
/// returned unchanged.
pub fn to_snake_case(name: &str) -> String {
    let chars: Vec<char> = name.trim().chars().collect();
    let mut out = String::with_capacity(chars.len() + 4);
    for (i, c) in chars.iter().enumerate() {
        if c.is_uppercase() {
            let prev = i.checked_sub(1).map(|p| chars[p]);
            let next = chars.get(i + 1);
            let boundary = match prev {
                Some(p) if p.is_lowercase() || p.is_ascii_digit() => true,
                Some(p) if p.is_uppercase() => next.is_some_and(|n| n.is_lowercase()),
                _ => false,
            };
            if boundary && !out.ends_with('_') {
                out.push('_');
            }
            out.extend(c.to_lowercase());
        } else {
            out.push(*c);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryStore;
    use crate::schema::IndexDefinition;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    fn gzip_file(dir: &Path, name: &str, data: &[u8]) -> SourceArtifact {
        let path = dir.join(name);
        let mut encoder = GzEncoder::new(Vec::new(), Compression::fast());
        encoder.write_all(data).unwrap();
        std::fs::write(&path, encoder.finish().unwrap()).unwrap();
        SourceArtifact::new(name, format!("https://x/{}", name), path)
    }

    fn ratings_store() -> (Arc<MemoryStore>, TableShape) {
        let store = Arc::new(MemoryStore::new());
        let key = PrimaryKey {
            name: "title_ratings_pkey".into(),
            columns: vec!["tconst".into()],
        };
        let indexes = vec![IndexDefinition::ordinary("title_ratings_votes_idx", &["num_votes"])];
        store
            .create_table(
                "title_ratings",
                &["tconst", "average_rating", "num_votes"],
                Some(key.clone()),
                indexes.clone(),
            )
            .unwrap();
        store
            .insert_rows("title_ratings", &[&["tt0", "1.0", "1"]])
            .unwrap();
        (
            store,
            TableShape {
                primary_key: Some(key),
                indexes,
            },
        )
    }

    #[test]
    fn test_to_snake_case() {
        assert_eq!(to_snake_case("tconst"), "tconst");
        assert_eq!(to_snake_case("titleType"), "title_type");
        assert_eq!(to_snake_case("isOriginalTitle"), "is_original_title");
        assert_eq!(to_snake_case("URLPath"), "url_path");
        assert_eq!(to_snake_case("num_votes"), "num_votes");
        assert_eq!(to_snake_case("season2Number"), "season2_number");
    }

    #[tokio::test]
    async fn test_load_builds_indexed_shadow_without_touching_production() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = gzip_file(
            dir.path(),
            "title.ratings.tsv.gz",
            b"tconst\taverageRating\tnumVotes\ntt1\t7.1\t100\ntt2\t\\N\t5\ntt3\t9.0\t12\n",
        );
        let (store, shape) = ratings_store();
        let loader = ShadowLoader::new(store.clone()).with_chunk_size(7);

        let outcome = loader.load("title_ratings", &artifact, true, &shape).await.unwrap();
        assert_eq!(outcome, LoadOutcome { shadow: "title_ratings__shadow".into(), rows: 3 });

        let shadow = store.table("title_ratings__shadow").unwrap();
        assert_eq!(shadow.primary_key.unwrap().name, "title_ratings_pkey__shadow");
        assert_eq!(shadow.indexes[0].name, "title_ratings_votes_idx__shadow");
        assert_eq!(shadow.rows[1][1], None);
        assert_eq!(store.row_count("title_ratings"), Some(1));
    }

    #[tokio::test]
    async fn test_malformed_row_fails_bulk_insert() {
        let dir = tempfile::tempdir().unwrap();
        let artifact =
            gzip_file(dir.path(), "r.tsv.gz", b"tconst\taverageRating\tnumVotes\ntt1\t7.1\n");
        let (store, shape) = ratings_store();

        let err = ShadowLoader::new(store.clone())
            .load("title_ratings", &artifact, true, &shape)
            .await
            .unwrap_err();
        assert!(matches!(err, RefreshError::Load { phase: LoadPhase::BulkInsert, .. }));
        assert!(store.table("title_ratings__shadow").is_some());
        assert_eq!(store.row_count("title_ratings"), Some(1));
    }

    #[tokio::test]
    async fn test_truncated_artifact_fails_decompress() {
        let dir = tempfile::tempdir().unwrap();
        let mut body = b"tconst\taverageRating\tnumVotes\n".to_vec();
        for i in 0..5000 {
            body.extend_from_slice(format!("tt{}\t5.0\t{}\n", i, i).as_bytes());
        }
        let artifact = gzip_file(dir.path(), "r.tsv.gz", &body);
        let bytes = std::fs::read(&artifact.path).unwrap();
        std::fs::write(&artifact.path, &bytes[..bytes.len() - 16]).unwrap();
        let (store, shape) = ratings_store();

        let err = ShadowLoader::new(store)
            .with_chunk_size(64)
            .load("title_ratings", &artifact, true, &shape)
            .await
            .unwrap_err();
        assert!(matches!(err, RefreshError::Load { phase: LoadPhase::Decompress, .. }));
    }

    #[tokio::test]
    async fn test_stale_shadow_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = gzip_file(dir.path(), "r.tsv.gz", b"tt1\t7.1\t100\n");
        let (store, shape) = ratings_store();
        let loader = ShadowLoader::new(store.clone());

        let failing = gzip_file(dir.path(), "bad.tsv.gz", b"tt1\t7.1\n");
        assert!(loader.load("title_ratings", &failing, false, &shape).await.is_err());
        let outcome = loader.load("title_ratings", &artifact, false, &shape).await.unwrap();
        assert_eq!(outcome.rows, 1);
    }
}
