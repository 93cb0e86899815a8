//! Fetcher: downloads artifacts with bounded retries.
//!
//! Every attempt writes to `<artifact>.part`, is verified as a complete gzip
//! stream, and only then renamed over the artifact. A failed attempt leaves
//! the previous artifact exactly as it was.

use crate::config::FetchPolicy;
use crate::error::{RefreshError, Result};
use crate::refresh::artifact::{verify_gzip, SourceArtifact};
use async_trait::async_trait;
use reqwest::Client;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

/// Moves the bytes behind a URL into a local file.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Transfer `url` into `dest` (created or truncated), returning the number
    /// of bytes written.
    async fn download(&self, url: &str, dest: &Path) -> Result<u64>;
}

pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .tcp_keepalive(Duration::from_secs(60))
            .user_agent(concat!("shadow-refresh/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| RefreshError::Config(format!("cannot build HTTP client: {}", e)))?;
        Ok(Self { client })
    }
}

fn transfer_error(url: &str, err: impl std::fmt::Display) -> RefreshError {
    RefreshError::Fetch {
        artifact: url.to_string(),
        message: err.to_string(),
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn download(&self, url: &str, dest: &Path) -> Result<u64> {
        let mut response = self
            .client
            .get(url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| transfer_error(url, e))?;

        let mut file = tokio::fs::File::create(dest).await?;
        let mut written = 0u64;
        while let Some(chunk) = response.chunk().await.map_err(|e| transfer_error(url, e))? {
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;
        file.sync_all().await?;
        Ok(written)
    }
}

pub struct Fetcher {
    transport: Arc<dyn Transport>,
    policy: FetchPolicy,
}

impl Fetcher {
    pub fn new(transport: Arc<dyn Transport>, policy: FetchPolicy) -> Self {
        Self { transport, policy }
    }

    /// Download one artifact, retrying with linear backoff.
    pub async fn fetch(&self, artifact: &SourceArtifact) -> Result<u64> {
        let attempts = self.policy.attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            info!(
                artifact = %artifact.name,
                url = %artifact.url,
                attempt,
                attempts,
                "downloading artifact"
            );
            match self.attempt(artifact).await {
                Ok(bytes) => {
                    info!(artifact = %artifact.name, bytes, "artifact downloaded and verified");
                    return Ok(bytes);
                }
                Err(e) => {
                    warn!(
                        artifact = %artifact.name,
                        attempt,
                        attempts,
                        error = %e,
                        "download attempt failed"
                    );
                    last_error = e.to_string();
                }
            }
            if attempt < attempts {
                tokio::time::sleep(self.policy.backoff_base * attempt).await;
            }
        }

        Err(RefreshError::Fetch {
            artifact: artifact.name.clone(),
            message: format!("giving up after {} attempts: {}", attempts, last_error),
        })
    }

    /// Download every artifact in turn. Fails if any one of them failed.
    pub async fn fetch_all(&self, artifacts: &[SourceArtifact]) -> Result<()> {
        let mut failed = Vec::new();
        let mut messages = Vec::new();
        for artifact in artifacts {
            if let Err(e) = self.fetch(artifact).await {
                failed.push(artifact.name.clone());
                messages.push(e.to_string());
            }
        }
        if failed.is_empty() {
            Ok(())
        } else {
            Err(RefreshError::DownloadFailed { failed, messages })
        }
    }

    async fn attempt(&self, artifact: &SourceArtifact) -> Result<u64> {
        if let Some(parent) = artifact.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let partial = artifact.partial_path();

        let staged = async {
            let bytes = tokio::time::timeout(
                self.policy.attempt_timeout,
                self.transport.download(&artifact.url, &partial),
            )
            .await
            .map_err(|_| RefreshError::Fetch {
                artifact: artifact.name.clone(),
                message: format!("transfer exceeded {:?}", self.policy.attempt_timeout),
            })??;

            let check = partial.clone();
            tokio::task::spawn_blocking(move || verify_gzip(&check))
                .await
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?
                .map_err(|e| RefreshError::Fetch {
                    artifact: artifact.name.clone(),
                    message: format!("integrity check failed: {}", e),
                })?;
            Ok::<u64, RefreshError>(bytes)
        }
        .await;

        match staged {
            Ok(bytes) => {
                tokio::fs::rename(&partial, &artifact.path).await?;
                Ok(bytes)
            }
            Err(e) => {
                if let Err(cleanup) = tokio::fs::remove_file(&partial).await {
                    if cleanup.kind() != io::ErrorKind::NotFound {
                        warn!(
                            path = %partial.display(),
                            error = %cleanup,
                            "cannot remove partial download"
                        );
                    }
                }
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::collections::HashMap;
    use std::io::Write;
    use std::sync::Mutex;

    /// Serves a fixed script of payloads per URL; the last one repeats.
    struct ScriptedTransport {
        scripts: HashMap<String, Vec<Vec<u8>>>,
        calls: Mutex<HashMap<String, usize>>,
    }

    impl ScriptedTransport {
        fn new(scripts: Vec<(&str, Vec<Vec<u8>>)>) -> Self {
            Self {
                scripts: scripts.into_iter().map(|(u, p)| (u.to_string(), p)).collect(),
                calls: Mutex::new(HashMap::new()),
            }
        }

        fn calls(&self, url: &str) -> usize {
            self.calls.lock().unwrap().get(url).copied().unwrap_or(0)
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn download(&self, url: &str, dest: &Path) -> Result<u64> {
            let call = {
                let mut calls = self.calls.lock().unwrap();
                let n = calls.entry(url.to_string()).or_insert(0);
                *n += 1;
                *n
            };
            let script = self.scripts.get(url).ok_or_else(|| transfer_error(url, "404 Not Found"))?;
            let payload = &script[(call - 1).min(script.len() - 1)];
            std::fs::write(dest, payload)?;
            Ok(payload.len() as u64)
        }
    }

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::fast());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    fn policy() -> FetchPolicy {
        FetchPolicy {
            attempts: 3,
            backoff_base: Duration::ZERO,
            attempt_timeout: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn test_retry_recovers_from_corrupt_transfer() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = SourceArtifact::new("a", "https://x/a.tsv.gz", dir.path().join("a.tsv.gz"));
        let transport = Arc::new(ScriptedTransport::new(vec![(
            "https://x/a.tsv.gz",
            vec![b"truncated".to_vec(), gzip(b"id\n1\n")],
        )]));
        let fetcher = Fetcher::new(transport.clone(), policy());

        fetcher.fetch(&artifact).await.unwrap();
        assert_eq!(transport.calls("https://x/a.tsv.gz"), 2);
        assert!(artifact.verify().is_ok());
        assert!(!artifact.partial_path().exists());
    }

    #[tokio::test]
    async fn test_corrupt_after_all_attempts_keeps_prior_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = SourceArtifact::new("a", "https://x/a.tsv.gz", dir.path().join("a.tsv.gz"));
        let prior = gzip(b"id\nold\n");
        std::fs::write(&artifact.path, &prior).unwrap();

        let transport = Arc::new(ScriptedTransport::new(vec![(
            "https://x/a.tsv.gz",
            vec![b"junk".to_vec()],
        )]));
        let fetcher = Fetcher::new(transport.clone(), policy());

        let err = fetcher.fetch(&artifact).await.unwrap_err();
        assert!(matches!(err, RefreshError::Fetch { .. }));
        assert_eq!(transport.calls("https://x/a.tsv.gz"), 3);
        assert_eq!(std::fs::read(&artifact.path).unwrap(), prior);
        assert!(!artifact.partial_path().exists());
    }

    struct FailingTransport;

    #[async_trait]
    impl Transport for FailingTransport {
        async fn download(&self, url: &str, _dest: &Path) -> Result<u64> {
            Err(transfer_error(url, "connection reset by peer"))
        }
    }

    /// Writes a few bytes and then never finishes.
    struct StalledTransport;

    #[async_trait]
    impl Transport for StalledTransport {
        async fn download(&self, _url: &str, dest: &Path) -> Result<u64> {
            std::fs::write(dest, b"\x1f\x8b")?;
            std::future::pending::<Result<u64>>().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_grows_linearly_between_attempts() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = SourceArtifact::new("a", "https://x/a.tsv.gz", dir.path().join("a.tsv.gz"));
        let policy = FetchPolicy {
            attempts: 4,
            backoff_base: Duration::from_millis(100),
            attempt_timeout: Duration::from_secs(10),
        };
        let fetcher = Fetcher::new(Arc::new(FailingTransport), policy);

        let started = tokio::time::Instant::now();
        assert!(fetcher.fetch(&artifact).await.is_err());
        let elapsed = started.elapsed();

        // 100 + 200 + 300 ms; no wait after the last attempt.
        assert!(elapsed >= Duration::from_millis(600), "waited {:?}", elapsed);
        assert!(elapsed < Duration::from_millis(700), "waited {:?}", elapsed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_transfer_times_out_and_leaves_no_partial() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = SourceArtifact::new("a", "https://x/a.tsv.gz", dir.path().join("a.tsv.gz"));
        let policy = FetchPolicy {
            attempts: 1,
            backoff_base: Duration::ZERO,
            attempt_timeout: Duration::from_secs(30 * 60),
        };
        let fetcher = Fetcher::new(Arc::new(StalledTransport), policy);

        let err = fetcher.fetch(&artifact).await.unwrap_err();

        assert!(matches!(err, RefreshError::Fetch { .. }));
        assert!(err.to_string().contains("exceeded"), "{}", err);
        assert!(!artifact.partial_path().exists());
        assert!(!artifact.path.exists());
    }

    #[tokio::test]
    async fn test_fetch_all_reports_every_failure() {
        let dir = tempfile::tempdir().unwrap();
        let good =
            SourceArtifact::new("good", "https://x/good.tsv.gz", dir.path().join("good.tsv.gz"));
        let bad = SourceArtifact::new("bad", "https://x/bad.tsv.gz", dir.path().join("bad.tsv.gz"));
        let transport = Arc::new(ScriptedTransport::new(vec![(
            "https://x/good.tsv.gz",
            vec![gzip(b"id\n")],
        )]));
        let fetcher = Fetcher::new(transport, policy());

        match fetcher.fetch_all(&[good.clone(), bad]).await {
            Err(RefreshError::DownloadFailed { failed, .. }) => {
                assert_eq!(failed, vec!["bad".to_string()])
            }
            other => panic!("expected download failure, got {:?}", other),
        }
        assert!(good.verify().is_ok());
    }
}
