//! Scheduler: drives the orchestrator until shutdown.

use crate::config::PipelineConfig;
use crate::refresh::orchestrator::RefreshOrchestrator;
use std::time::Duration;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

pub struct Scheduler {
    orchestrator: RefreshOrchestrator,
    startup_delay: Duration,
    interval: Duration,
    force_first: bool,
}

impl Scheduler {
    pub fn new(orchestrator: RefreshOrchestrator, config: &PipelineConfig) -> Self {
        Self {
            orchestrator,
            startup_delay: config.startup_delay,
            interval: config.check_interval,
            force_first: false,
        }
    }

    /// Force the download on the first cycle only.
    pub fn force_first_cycle(mut self, force: bool) -> Self {
        self.force_first = force;
        self
    }

    /// Run cycles until `cancel` fires, then hand the orchestrator back.
    ///
    /// A cancelled cycle is abandoned where it stands; the next start picks
    /// up empty tables and stale shadows on its own.
    pub async fn run(mut self, cancel: CancellationToken) -> RefreshOrchestrator {
        info!(
            startup_delay_secs = self.startup_delay.as_secs(),
            interval_secs = self.interval.as_secs(),
            "scheduler started"
        );

        tokio::select! {
            _ = cancel.cancelled() => {
                info!("scheduler cancelled before the first cycle");
                return self.orchestrator;
            }
            _ = time::sleep(self.startup_delay) => {}
        }

        let mut ticker = time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut force = self.force_first;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    warn!("shutdown requested during a refresh cycle; abandoning it");
                    break;
                }
                result = self.orchestrator.run_cycle(force) => match result {
                    Ok(report) if report.is_success() => {}
                    Ok(report) => {
                        warn!(failed = ?report.failed, "refresh cycle finished with failures")
                    }
                    Err(e) => error!(error = %e, "refresh cycle failed"),
                },
            }
            force = false;
        }

        info!("scheduler stopped");
        self.orchestrator
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DatasetSpec;
    use crate::db::MemoryStore;
    use crate::error::Result;
    use crate::metadata::{MetadataHandle, RefreshStatus};
    use crate::refresh::fetcher::Transport;
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingTransport(AtomicUsize);

    #[async_trait]
    impl Transport for CountingTransport {
        async fn download(&self, url: &str, _dest: &Path) -> Result<u64> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Err(crate::error::RefreshError::Fetch {
                artifact: url.to_string(),
                message: "offline".to_string(),
            })
        }
    }

    fn config(dir: &Path) -> PipelineConfig {
        let mut config = PipelineConfig::new(
            dir.to_path_buf(),
            vec![DatasetSpec {
                name: "title.ratings".into(),
                table: "title_ratings".into(),
                url: "https://x/title.ratings.tsv.gz".into(),
                has_header: true,
            }],
        );
        config.startup_delay = Duration::ZERO;
        config.check_interval = Duration::from_millis(20);
        config.fetch.attempts = 1;
        config.fetch.backoff_base = Duration::ZERO;
        config
    }

    #[tokio::test]
    async fn test_failures_do_not_stop_the_loop_and_only_first_cycle_forces() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        let store = Arc::new(MemoryStore::new());
        let metadata = MetadataHandle::open(store.clone()).await.unwrap();
        let transport = Arc::new(CountingTransport(AtomicUsize::new(0)));
        let orchestrator =
            RefreshOrchestrator::new(&config, store.clone(), metadata, transport.clone());

        let cancel = CancellationToken::new();
        let scheduler = Scheduler::new(orchestrator, &config).force_first_cycle(true);
        let handle = tokio::spawn(scheduler.run(cancel.clone()));

        time::sleep(Duration::from_millis(150)).await;
        cancel.cancel();
        let orchestrator = handle.await.unwrap();

        // The forced first cycle fails its download; later cycles see every
        // artifact missing and, unforced, do not download at all.
        assert_eq!(transport.0.load(Ordering::SeqCst), 1);
        assert_eq!(orchestrator.metadata().status, RefreshStatus::DownloadFailed);
    }

    #[tokio::test]
    async fn test_cancel_during_startup_delay() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path());
        config.startup_delay = Duration::from_secs(3600);
        let store = Arc::new(MemoryStore::new());
        let metadata = MetadataHandle::open(store.clone()).await.unwrap();
        let transport = Arc::new(CountingTransport(AtomicUsize::new(0)));
        let orchestrator = RefreshOrchestrator::new(&config, store, metadata, transport.clone());

        let cancel = CancellationToken::new();
        cancel.cancel();
        Scheduler::new(orchestrator, &config).run(cancel).await;
        assert_eq!(transport.0.load(Ordering::SeqCst), 0);
    }
}
