//! Freshness gate: decides whether the artifact set must be downloaded again.
//!
//! Age comes from the local file's modification time, never from the
//! database, so a crash between download and load does not trigger a second
//! download.

use crate::refresh::artifact::{age_in_days, SourceArtifact};
use std::time::SystemTime;
use tracing::{info, warn};

#[derive(Clone, Debug, PartialEq)]
pub enum ArtifactState {
    Fresh { age_days: f64 },
    Stale { age_days: f64 },
    Missing,
    Corrupt { reason: String },
}

impl ArtifactState {
    pub fn needs_download(&self) -> bool {
        !matches!(self, ArtifactState::Fresh { .. })
    }
}

#[derive(Clone, Debug)]
pub struct ArtifactFreshness {
    pub name: String,
    pub state: ArtifactState,
}

#[derive(Clone, Debug)]
pub struct FreshnessReport {
    pub forced: bool,
    pub artifacts: Vec<ArtifactFreshness>,
}

impl FreshnessReport {
    pub fn needs_download(&self) -> bool {
        self.forced || self.artifacts.iter().any(|a| a.state.needs_download())
    }

    /// True when there is nothing on disk at all (first run).
    pub fn all_missing(&self) -> bool {
        !self.artifacts.is_empty()
            && self.artifacts.iter().all(|a| a.state == ArtifactState::Missing)
    }

    pub fn log_ages(&self) {
        for artifact in &self.artifacts {
            match &artifact.state {
                ArtifactState::Fresh { age_days } => {
                    info!(
                        artifact = %artifact.name,
                        age_days = %format!("{:.2}", age_days),
                        "artifact is fresh"
                    )
                }
                ArtifactState::Stale { age_days } => {
                    info!(
                        artifact = %artifact.name,
                        age_days = %format!("{:.2}", age_days),
                        "artifact is stale"
                    )
                }
                ArtifactState::Missing => {
                    warn!(artifact = %artifact.name, "artifact is missing")
                }
                ArtifactState::Corrupt { reason } => {
                    warn!(
                        artifact = %artifact.name,
                        reason = %reason,
                        "artifact failed integrity check"
                    )
                }
            }
        }
    }
}

#[derive(Clone, Debug)]
pub struct FreshnessGate {
    max_age_days: u32,
}

impl FreshnessGate {
    pub fn new(max_age_days: u32) -> Self {
        Self { max_age_days }
    }

    pub fn max_age_days(&self) -> u32 {
        self.max_age_days
    }

    /// Inspect every artifact. Forced runs skip the integrity check since the
    /// answer is already known.
    pub async fn evaluate(&self, artifacts: &[SourceArtifact], force: bool) -> FreshnessReport {
        let now = SystemTime::now();
        let mut states = Vec::with_capacity(artifacts.len());
        for artifact in artifacts {
            states.push(ArtifactFreshness {
                name: artifact.name.clone(),
                state: self.inspect(artifact, now, !force).await,
            });
        }
        let report = FreshnessReport {
            forced: force,
            artifacts: states,
        };
        report.log_ages();
        report
    }

    pub async fn needs_download(&self, artifacts: &[SourceArtifact], force: bool) -> bool {
        if force {
            return true;
        }
        self.evaluate(artifacts, false).await.needs_download()
    }

    async fn inspect(
        &self,
        artifact: &SourceArtifact,
        now: SystemTime,
        verify: bool,
    ) -> ArtifactState {
        let Some(age) = artifact.age(now) else {
            return ArtifactState::Missing;
        };
        let age_days = age_in_days(age);
        if age_days >= f64::from(self.max_age_days) {
            return ArtifactState::Stale { age_days };
        }
        if verify {
            let candidate = artifact.clone();
            let checked = tokio::task::spawn_blocking(move || candidate.verify()).await;
            match checked {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => return ArtifactState::Corrupt { reason: e.to_string() },
                Err(e) => return ArtifactState::Corrupt { reason: e.to_string() },
            }
        }
        ArtifactState::Fresh { age_days }
    }
}

/// Whether the batch must be downloaded: forced, or any artifact is missing,
/// corrupt, or at least `max_age_days` old.
pub async fn needs_download(artifacts: &[SourceArtifact], max_age_days: u32, force: bool) -> bool {
    FreshnessGate::new(max_age_days).needs_download(artifacts, force).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::fs::File;
    use std::io::Write;
    use std::path::Path;
    use std::time::Duration;

    fn write_artifact(dir: &Path, name: &str, age: Duration) -> SourceArtifact {
        let path = dir.join(format!("{}.tsv.gz", name));
        let mut encoder = GzEncoder::new(Vec::new(), Compression::fast());
        encoder.write_all(b"id\n1\n").unwrap();
        std::fs::write(&path, encoder.finish().unwrap()).unwrap();
        File::options()
            .write(true)
            .open(&path)
            .unwrap()
            .set_modified(SystemTime::now() - age)
            .unwrap();
        SourceArtifact::new(name, format!("https://x/{}.tsv.gz", name), path)
    }

    const DAY: Duration = Duration::from_secs(86_400);

    #[tokio::test]
    async fn test_fresh_valid_artifacts_need_no_download() {
        let dir = tempfile::tempdir().unwrap();
        let artifacts = vec![
            write_artifact(dir.path(), "a", DAY),
            write_artifact(dir.path(), "b", DAY * 6),
        ];
        assert!(!needs_download(&artifacts, 7, false).await);
    }

    #[tokio::test]
    async fn test_force_always_downloads() {
        let dir = tempfile::tempdir().unwrap();
        let artifacts = vec![write_artifact(dir.path(), "a", Duration::ZERO)];
        assert!(needs_download(&artifacts, 7, true).await);
        assert!(needs_download(&[], 7, true).await);
    }

    #[tokio::test]
    async fn test_age_at_limit_is_stale() {
        let dir = tempfile::tempdir().unwrap();
        let artifacts = vec![
            write_artifact(dir.path(), "a", DAY),
            write_artifact(dir.path(), "b", DAY * 7),
        ];
        let report = FreshnessGate::new(7).evaluate(&artifacts, false).await;
        assert!(report.needs_download());
        assert!(matches!(report.artifacts[1].state, ArtifactState::Stale { .. }));
    }

    #[tokio::test]
    async fn test_missing_and_corrupt_trigger_download() {
        let dir = tempfile::tempdir().unwrap();
        let good = write_artifact(dir.path(), "good", DAY);
        let corrupt = write_artifact(dir.path(), "bad", DAY);
        std::fs::write(&corrupt.path, b"garbage").unwrap();
        let missing =
            SourceArtifact::new("gone", "https://x/gone.tsv.gz", dir.path().join("gone.tsv.gz"));

        let report = FreshnessGate::new(7)
            .evaluate(&[good, corrupt, missing], false)
            .await;
        assert!(report.needs_download());
        assert!(!report.all_missing());
        assert!(matches!(report.artifacts[1].state, ArtifactState::Corrupt { .. }));
        assert_eq!(report.artifacts[2].state, ArtifactState::Missing);
    }

    #[tokio::test]
    async fn test_all_missing() {
        let dir = tempfile::tempdir().unwrap();
        let artifacts: Vec<SourceArtifact> = ["a", "b"]
            .iter()
            .map(|n| SourceArtifact::new(*n, "https://x", dir.path().join(n)))
            .collect();
        let report = FreshnessGate::new(7).evaluate(&artifacts, false).await;
        assert!(report.all_missing());
        assert!(report.needs_download());
    }
}
