//! Source artifacts: gzip-compressed TSV files kept in the data directory.

use crate::config::DatasetSpec;
use flate2::read::MultiGzDecoder;
use std::fs::File;
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

const SECONDS_PER_DAY: f64 = 86_400.0;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SourceArtifact {
    pub name: String,
    pub url: String,
    pub path: PathBuf,
}

impl SourceArtifact {
    pub fn new(name: impl Into<String>, url: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            path: path.into(),
        }
    }

    pub fn for_dataset(spec: &DatasetSpec, data_dir: &Path) -> Self {
        Self::new(&spec.name, &spec.url, data_dir.join(spec.file_name()))
    }

    /// Modification time of the local file, `None` when it does not exist.
    pub fn modified(&self) -> Option<SystemTime> {
        std::fs::metadata(&self.path).and_then(|m| m.modified()).ok()
    }

    /// Age of the local file relative to `now`. Files dated in the future
    /// count as brand new.
    pub fn age(&self, now: SystemTime) -> Option<Duration> {
        self.modified()
            .map(|modified| now.duration_since(modified).unwrap_or(Duration::ZERO))
    }

    /// Where a transfer is staged before it replaces the artifact.
    pub fn partial_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".part");
        self.path.with_file_name(name)
    }

    /// Decompress the whole file, checking every member's CRC and length.
    pub fn verify(&self) -> io::Result<u64> {
        verify_gzip(&self.path)
    }
}

pub fn age_in_days(age: Duration) -> f64 {
    age.as_secs_f64() / SECONDS_PER_DAY
}

/// Full read of a gzip stream into a sink; returns the decompressed size.
pub fn verify_gzip(path: &Path) -> io::Result<u64> {
    let file = File::open(path)?;
    if file.metadata()?.len() == 0 {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "artifact is empty"));
    }
    let mut decoder = MultiGzDecoder::new(BufReader::new(file));
    io::copy(&mut decoder, &mut io::sink())
}

/// Buffered reader over the decompressed TSV text.
pub fn open_tsv(path: &Path) -> io::Result<BufReader<MultiGzDecoder<BufReader<File>>>> {
    let file = File::open(path)?;
    Ok(BufReader::new(MultiGzDecoder::new(BufReader::new(file))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    #[test]
    fn test_verify_accepts_valid_gzip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.tsv.gz");
        std::fs::write(&path, gzip(b"id\tname\n1\tx\n")).unwrap();
        assert_eq!(verify_gzip(&path).unwrap(), 12);
    }

    #[test]
    fn test_verify_rejects_truncated_and_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let data = gzip(&b"id\tname\n".repeat(1000));

        let truncated = dir.path().join("t.gz");
        std::fs::write(&truncated, &data[..data.len() / 2]).unwrap();
        assert!(verify_gzip(&truncated).is_err());

        let garbage = dir.path().join("g.gz");
        std::fs::write(&garbage, b"<html>not found</html>").unwrap();
        assert!(verify_gzip(&garbage).is_err());

        let empty = dir.path().join("e.gz");
        std::fs::write(&empty, b"").unwrap();
        assert!(verify_gzip(&empty).is_err());
    }

    #[test]
    fn test_partial_path_sits_next_to_artifact() {
        let artifact = SourceArtifact::new(
            "title.basics",
            "https://x/title.basics.tsv.gz",
            "/data/title.basics.tsv.gz",
        );
        assert_eq!(artifact.partial_path(), PathBuf::from("/data/title.basics.tsv.gz.part"));
    }

    #[test]
    fn test_missing_file_has_no_age() {
        let artifact = SourceArtifact::new("x", "https://x/x.gz", "/nonexistent/x.gz");
        assert!(artifact.age(SystemTime::now()).is_none());
    }
}
