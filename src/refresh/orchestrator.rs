//! Refresh orchestrator: one full cycle over the dataset catalog.
//!
//! Download is all-or-nothing for the cycle; loading is isolated per table.
//! Which tables to load is decided from the store itself (empty table means
//! "not loaded yet"), so a cycle interrupted at any point is resumed by the
//! next one without extra bookkeeping.

use crate::config::{DatasetSpec, PipelineConfig};
use crate::db::TableStore;
use crate::error::Result;
use crate::metadata::{MetadataHandle, RefreshMetadata, RefreshStatus};
use crate::refresh::artifact::SourceArtifact;
use crate::refresh::fetcher::{Fetcher, Transport};
use crate::refresh::freshness::FreshnessGate;
use crate::refresh::introspect::SchemaIntrospector;
use crate::refresh::loader::ShadowLoader;
use crate::refresh::swapper::Swapper;
use chrono::Utc;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

/// What one cycle did.
#[derive(Clone, Debug, Default)]
pub struct CycleReport {
    pub run_id: Uuid,
    pub downloaded: bool,
    /// `(table, rows)` for every table promoted this cycle.
    pub loaded: Vec<(String, u64)>,
    /// `(table, error)` for every table that needed loading and failed.
    pub failed: Vec<(String, String)>,
    /// Tables left as they were.
    pub skipped: Vec<String>,
    /// Row total written to metadata, when the cycle completed a refresh.
    pub total_rows: Option<u64>,
}

impl CycleReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    /// True when the cycle neither downloaded nor loaded anything.
    pub fn is_noop(&self) -> bool {
        !self.downloaded && self.loaded.is_empty() && self.failed.is_empty()
    }
}

pub struct RefreshOrchestrator {
    store: Arc<dyn TableStore>,
    metadata: MetadataHandle,
    gate: FreshnessGate,
    fetcher: Fetcher,
    introspector: SchemaIntrospector,
    loader: ShadowLoader,
    swapper: Swapper,
    datasets: Vec<DatasetSpec>,
    artifacts: Vec<SourceArtifact>,
    max_age_days: u32,
}

impl RefreshOrchestrator {
    pub fn new(
        config: &PipelineConfig,
        store: Arc<dyn TableStore>,
        metadata: MetadataHandle,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let artifacts = config
            .datasets
            .iter()
            .map(|d| SourceArtifact::for_dataset(d, &config.data_dir))
            .collect();
        Self {
            gate: FreshnessGate::new(config.max_age_days),
            fetcher: Fetcher::new(transport, config.fetch.clone()),
            introspector: SchemaIntrospector::new(store.clone()),
            loader: ShadowLoader::new(store.clone()),
            swapper: Swapper::new(store.clone()),
            store,
            metadata,
            datasets: config.datasets.clone(),
            artifacts,
            max_age_days: config.max_age_days,
        }
    }

    pub fn with_loader(mut self, loader: ShadowLoader) -> Self {
        self.loader = loader;
        self
    }

    pub fn metadata(&self) -> &RefreshMetadata {
        self.metadata.current()
    }

    pub fn artifacts(&self) -> &[SourceArtifact] {
        &self.artifacts
    }

    /// Run one cycle. `Err` only for a failed download phase or a metadata
    /// write; per-table failures are reported in [`CycleReport::failed`].
    pub async fn run_cycle(&mut self, force: bool) -> Result<CycleReport> {
        let run_id = Uuid::new_v4();
        let span = info_span!("refresh_cycle", run_id = %run_id, force);
        self.cycle(run_id, force).instrument(span).await
    }

    async fn cycle(&mut self, run_id: Uuid, force: bool) -> Result<CycleReport> {
        let started = Instant::now();
        let mut report = CycleReport {
            run_id,
            ..CycleReport::default()
        };
        info!(datasets = self.datasets.len(), "refresh cycle started");

        let freshness = self.gate.evaluate(&self.artifacts, force).await;
        if freshness.needs_download() {
            if freshness.all_missing() && !force {
                warn!(
                    data_dir = ?self.artifacts.first().and_then(|a| a.path.parent()),
                    "source artifacts are missing, use force to download them"
                );
            } else {
                self.download().await?;
                report.downloaded = true;
            }
        }

        let mut pending = Vec::new();
        for (i, dataset) in self.datasets.iter().enumerate() {
            if self.artifacts[i].modified().is_none() {
                warn!(
                    table = %dataset.table,
                    artifact = %self.artifacts[i].name,
                    "no local artifact; table left as is"
                );
                report.skipped.push(dataset.table.clone());
                continue;
            }
            if report.downloaded {
                pending.push(i);
                continue;
            }
            match self.store.has_rows(&dataset.table).await {
                Ok(true) => report.skipped.push(dataset.table.clone()),
                Ok(false) => {
                    info!(table = %dataset.table, "table is empty; scheduling load");
                    pending.push(i);
                }
                Err(e) => {
                    error!(table = %dataset.table, error = %e, "cannot inspect table");
                    report.failed.push((dataset.table.clone(), e.to_string()));
                }
            }
        }

        if pending.is_empty() {
            info!(
                skipped = report.skipped.len(),
                status = %self.metadata.current().status,
                "nothing to load; metadata left unchanged"
            );
            freshness.log_ages();
            return Ok(report);
        }

        for i in pending {
            let table = self.datasets[i].table.clone();
            self.metadata.set_status(RefreshStatus::Loading).await?;
            let table_started = Instant::now();
            match self.refresh_table(i).await {
                Ok(rows) => {
                    info!(
                        table = %table,
                        rows,
                        elapsed_secs = table_started.elapsed().as_secs(),
                        "table refreshed"
                    );
                    report.loaded.push((table, rows));
                }
                Err(e) => {
                    error!(
                        table = %table,
                        error = %e,
                        "table refresh failed; production left untouched"
                    );
                    report.failed.push((table, e.to_string()));
                }
            }
        }

        if report.loaded.is_empty() {
            warn!(failed = report.failed.len(), "no table could be loaded");
            self.metadata.set_status(RefreshStatus::Pending).await?;
        } else {
            let total_rows = self.total_rows(&report.loaded).await;
            let finished_at = Utc::now();
            let next_refresh = finished_at + chrono::Duration::days(i64::from(self.max_age_days));
            self.metadata.complete(finished_at, next_refresh, total_rows).await?;
            report.total_rows = Some(total_rows);
        }

        info!(
            loaded = report.loaded.len(),
            failed = report.failed.len(),
            skipped = report.skipped.len(),
            elapsed_secs = started.elapsed().as_secs(),
            "refresh cycle finished"
        );
        Ok(report)
    }

    async fn download(&mut self) -> Result<()> {
        self.metadata.set_status(RefreshStatus::Downloading).await?;
        match self.fetcher.fetch_all(&self.artifacts).await {
            Ok(()) => Ok(()),
            Err(e) => {
                error!(error = %e, "download phase failed; no table touched");
                self.metadata.set_status(RefreshStatus::DownloadFailed).await?;
                Err(e)
            }
        }
    }

    async fn refresh_table(&self, i: usize) -> Result<u64> {
        let dataset = &self.datasets[i];
        let shape = self.introspector.capture(&dataset.table).await?;
        let outcome = self
            .loader
            .load(&dataset.table, &self.artifacts[i], dataset.has_header, &shape)
            .await?;
        self.swapper.promote(&dataset.table, &shape).await?;
        Ok(outcome.rows)
    }

    /// Exact counts for tables loaded this cycle, statistics for the rest.
    async fn total_rows(&self, loaded: &[(String, u64)]) -> u64 {
        let mut total: u64 = loaded.iter().map(|(_, rows)| rows).sum();
        for dataset in &self.datasets {
            if loaded.iter().any(|(table, _)| table == &dataset.table) {
                continue;
            }
            match self.store.estimate_rows(&dataset.table).await {
                Ok(rows) => total += rows,
                Err(e) => {
                    warn!(table = %dataset.table, error = %e, "no row estimate; counted as zero")
                }
            }
        }
        total
    }
}

