use std::fmt;
use thiserror::Error;

/// Step of a table refresh that produced a [`RefreshError::Load`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadPhase {
    CreateShadow,
    Decompress,
    BulkInsert,
    RebuildIndexes,
    Analyze,
}

impl fmt::Display for LoadPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LoadPhase::CreateShadow => "create_shadow",
            LoadPhase::Decompress => "decompress",
            LoadPhase::BulkInsert => "bulk_insert",
            LoadPhase::RebuildIndexes => "rebuild_indexes",
            LoadPhase::Analyze => "analyze",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug)]
pub enum RefreshError {
    #[error("Fetch error for {artifact}: {message}")]
    Fetch { artifact: String, message: String },

    #[error("Download phase failed for {}: {}", failed.join(", "), messages.join("; "))]
    DownloadFailed {
        failed: Vec<String>,
        messages: Vec<String>,
    },

    #[error("Load error for {table} during {phase}: {message}")]
    Load {
        table: String,
        phase: LoadPhase,
        message: String,
    },

    #[error("Swap error for {table}: {message}")]
    Swap { table: String, message: String },

    #[error("Schema error for {table}: {message}")]
    Schema { table: String, message: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl RefreshError {
    pub fn load(table: &str, phase: LoadPhase, err: impl fmt::Display) -> Self {
        RefreshError::Load {
            table: table.to_string(),
            phase,
            message: err.to_string(),
        }
    }

    pub fn swap(table: &str, err: impl fmt::Display) -> Self {
        RefreshError::Swap {
            table: table.to_string(),
            message: err.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, RefreshError>;
