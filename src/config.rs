//! Runtime configuration: store credentials, pipeline tuning and the dataset
//! catalog.

use crate::error::{RefreshError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Where the default catalog is published.
pub const DEFAULT_BASE_URL: &str = "https://datasets.imdbws.com";

/// Dataset names of the default catalog, in load order.
const DEFAULT_DATASETS: &[&str] = &[
    "name.basics",
    "title.akas",
    "title.basics",
    "title.crew",
    "title.episode",
    "title.principals",
    "title.ratings",
];

#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
    pub max_connections: u32,
}

impl DatabaseConfig {
    /// The password is required; a missing or empty one is fatal.
    pub fn new(
        host: String,
        port: u16,
        user: String,
        password: Option<String>,
        database: String,
    ) -> Result<Self> {
        let password = password
            .filter(|p| !p.is_empty())
            .ok_or_else(|| RefreshError::Config("DB_PASSWORD must be set".to_string()))?;
        Ok(Self {
            host,
            port,
            user,
            password,
            database,
            max_connections: 4,
        })
    }
}

/// Retry policy for downloads.
#[derive(Clone, Debug)]
pub struct FetchPolicy {
    pub attempts: u32,
    /// Delay after attempt `n` is `n * backoff_base`.
    pub backoff_base: Duration,
    /// Upper bound on a single transfer.
    pub attempt_timeout: Duration,
}

impl Default for FetchPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff_base: Duration::from_secs(5),
            attempt_timeout: Duration::from_secs(4 * 60 * 60),
        }
    }
}

#[derive(Clone, Debug)]
pub struct PipelineConfig {
    pub data_dir: PathBuf,
    pub max_age_days: u32,
    pub check_interval: Duration,
    pub startup_delay: Duration,
    pub fetch: FetchPolicy,
    pub datasets: Vec<DatasetSpec>,
}

impl PipelineConfig {
    pub fn new(data_dir: PathBuf, datasets: Vec<DatasetSpec>) -> Self {
        Self {
            data_dir,
            max_age_days: 7,
            check_interval: Duration::from_secs(3600),
            startup_delay: Duration::from_secs(10),
            fetch: FetchPolicy::default(),
            datasets,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_age_days == 0 {
            return Err(RefreshError::Config("max age must be at least one day".to_string()));
        }
        if self.check_interval.is_zero() {
            return Err(RefreshError::Config("check interval must be positive".to_string()));
        }
        if self.fetch.attempts == 0 {
            return Err(RefreshError::Config("at least one fetch attempt is required".to_string()));
        }
        validate_catalog(&self.datasets)
    }
}

/// One upstream artifact and the table it feeds.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetSpec {
    pub name: String,
    pub table: String,
    pub url: String,
    #[serde(default = "default_has_header")]
    pub has_header: bool,
}

fn default_has_header() -> bool {
    true
}

impl DatasetSpec {
    /// Local file name: the last path segment of the URL.
    pub fn file_name(&self) -> &str {
        self.url
            .rsplit('/')
            .next()
            .filter(|s| !s.is_empty())
            .unwrap_or(&self.name)
    }
}

/// The seven public IMDb datasets under `base_url`.
pub fn default_catalog(base_url: &str) -> Vec<DatasetSpec> {
    let base = base_url.trim_end_matches('/');
    DEFAULT_DATASETS
        .iter()
        .map(|name| DatasetSpec {
            name: name.to_string(),
            table: name.replace('.', "_"),
            url: format!("{}/{}.tsv.gz", base, name),
            has_header: true,
        })
        .collect()
}

/// Read a JSON array of [`DatasetSpec`]s.
pub fn load_catalog(path: &Path) -> Result<Vec<DatasetSpec>> {
    let text = std::fs::read_to_string(path)?;
    let datasets: Vec<DatasetSpec> = serde_json::from_str(&text)?;
    validate_catalog(&datasets)?;
    Ok(datasets)
}

fn validate_catalog(datasets: &[DatasetSpec]) -> Result<()> {
    if datasets.is_empty() {
        return Err(RefreshError::Config("dataset catalog is empty".to_string()));
    }
    let mut tables = HashSet::new();
    let mut files = HashSet::new();
    for dataset in datasets {
        let valid_table = dataset
            .table
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_lowercase() || c == '_')
            && dataset
                .table
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
        if !valid_table {
            return Err(RefreshError::Config(format!(
                "dataset {}: invalid table name '{}'",
                dataset.name, dataset.table
            )));
        }
        if !tables.insert(dataset.table.as_str()) {
            return Err(RefreshError::Config(format!(
                "table {} is fed by two datasets",
                dataset.table
            )));
        }
        if !files.insert(dataset.file_name()) {
            return Err(RefreshError::Config(format!(
                "dataset {}: file name {} is not unique",
                dataset.name,
                dataset.file_name()
            )));
        }
    }
    Ok(())
}
