//! Pipeline metadata: the singleton record external monitors read.

use crate::db::MetadataStore;
use crate::error::{RefreshError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::info;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshStatus {
    Pending,
    Downloading,
    DownloadFailed,
    Loading,
    Complete,
}

impl RefreshStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RefreshStatus::Pending => "pending",
            RefreshStatus::Downloading => "downloading",
            RefreshStatus::DownloadFailed => "download_failed",
            RefreshStatus::Loading => "loading",
            RefreshStatus::Complete => "complete",
        }
    }
}

impl fmt::Display for RefreshStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RefreshStatus {
    type Err = RefreshError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(RefreshStatus::Pending),
            "downloading" => Ok(RefreshStatus::Downloading),
            "download_failed" => Ok(RefreshStatus::DownloadFailed),
            "loading" => Ok(RefreshStatus::Loading),
            "complete" => Ok(RefreshStatus::Complete),
            other => Err(RefreshError::Store(format!("unknown refresh status '{}'", other))),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RefreshMetadata {
    pub last_refresh: Option<DateTime<Utc>>,
    pub next_refresh: Option<DateTime<Utc>>,
    pub status: RefreshStatus,
    pub total_rows: u64,
    pub updated_at: DateTime<Utc>,
}

impl RefreshMetadata {
    pub fn initial() -> Self {
        Self {
            last_refresh: None,
            next_refresh: None,
            status: RefreshStatus::Pending,
            total_rows: 0,
            updated_at: Utc::now(),
        }
    }
}

/// Write access to the metadata record.
///
/// The orchestrator owns the only handle; every mutation is persisted before
/// the call returns.
pub struct MetadataHandle {
    store: Arc<dyn MetadataStore>,
    current: RefreshMetadata,
}

impl MetadataHandle {
    /// Load the record, creating it on first use.
    pub async fn open(store: Arc<dyn MetadataStore>) -> Result<Self> {
        let current = match store.load_metadata().await? {
            Some(metadata) => metadata,
            None => {
                let metadata = RefreshMetadata::initial();
                store.save_metadata(&metadata).await?;
                info!("initialized refresh metadata");
                metadata
            }
        };
        Ok(Self { store, current })
    }

    /// Make sure the record exists without holding on to it, returning what
    /// is stored afterwards.
    pub async fn ensure(store: Arc<dyn MetadataStore>) -> Result<RefreshMetadata> {
        Ok(Self::open(store).await?.current)
    }

    pub fn current(&self) -> &RefreshMetadata {
        &self.current
    }

    pub async fn set_status(&mut self, status: RefreshStatus) -> Result<()> {
        if self.current.status != status {
            info!(from = %self.current.status, to = %status, "refresh status transition");
        }
        let mut next = self.current.clone();
        next.status = status;
        self.persist(next).await
    }

    pub async fn complete(
        &mut self,
        finished_at: DateTime<Utc>,
        next_refresh: DateTime<Utc>,
        total_rows: u64,
    ) -> Result<()> {
        let next = RefreshMetadata {
            last_refresh: Some(finished_at),
            next_refresh: Some(next_refresh),
            status: RefreshStatus::Complete,
            total_rows,
            updated_at: finished_at,
        };
        info!(total_rows, next_refresh = %next_refresh, "refresh complete");
        self.persist(next).await
    }

    async fn persist(&mut self, mut next: RefreshMetadata) -> Result<()> {
        next.updated_at = next.updated_at.max(Utc::now());
        self.store.save_metadata(&next).await?;
        self.current = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trips_through_text() {
        for status in [
            RefreshStatus::Pending,
            RefreshStatus::Downloading,
            RefreshStatus::DownloadFailed,
            RefreshStatus::Loading,
            RefreshStatus::Complete,
        ] {
            assert_eq!(status.as_str().parse::<RefreshStatus>().unwrap(), status);
        }
        assert!("finished".parse::<RefreshStatus>().is_err());
    }

    #[tokio::test]
    async fn test_handle_initializes_once_and_persists_every_change() {
        let store = Arc::new(crate::db::MemoryStore::new());
        let mut handle = MetadataHandle::open(store.clone()).await.unwrap();
        assert_eq!(handle.current().status, RefreshStatus::Pending);

        handle.set_status(RefreshStatus::Loading).await.unwrap();
        let reopened = MetadataHandle::open(store.clone()).await.unwrap();
        assert_eq!(reopened.current().status, RefreshStatus::Loading);

        let finished = Utc::now();
        let next = finished + chrono::Duration::days(7);
        handle.complete(finished, next, 42).await.unwrap();
        let saved = store.load_metadata().await.unwrap().unwrap();
        assert_eq!(saved.status, RefreshStatus::Complete);
        assert_eq!(saved.total_rows, 42);
        assert_eq!(saved.last_refresh, Some(finished));
        assert_eq!(saved.next_refresh, Some(next));
        assert!(saved.updated_at >= finished);
    }

    #[tokio::test]
    async fn test_ensure_creates_pending_record_and_keeps_existing_one() {
        let store = Arc::new(crate::db::MemoryStore::new());
        assert!(store.load_metadata().await.unwrap().is_none());

        let created = MetadataHandle::ensure(store.clone()).await.unwrap();
        assert_eq!(created.status, RefreshStatus::Pending);
        let saved = store.load_metadata().await.unwrap().unwrap();
        assert_eq!(saved.status, RefreshStatus::Pending);

        let mut handle = MetadataHandle::open(store.clone()).await.unwrap();
        handle.set_status(RefreshStatus::Complete).await.unwrap();
        let kept = MetadataHandle::ensure(store.clone()).await.unwrap();
        assert_eq!(kept.status, RefreshStatus::Complete);
    }

    #[test]
    fn test_status_serializes_snake_case() {
        let json = serde_json::to_string(&RefreshStatus::DownloadFailed).unwrap();
        assert_eq!(json, "\"download_failed\"");
    }
}
