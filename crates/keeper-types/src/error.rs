use std::fmt;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, KeeperError>;

/// Pipeline stage a failure is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Validate,
    Acquire,
    Compress,
    Encrypt,
    Checksum,
    Persist,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Validate => "validate",
            Stage::Acquire => "acquire",
            Stage::Compress => "compress",
            Stage::Encrypt => "encrypt",
            Stage::Checksum => "checksum",
            Stage::Persist => "persist",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum KeeperError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("acquisition failed: {0}")]
    Acquisition(String),

    #[error("{stage} stage failed: {message}")]
    Stage { stage: Stage, message: String },

    #[error("replication to '{provider}' failed: {message}")]
    Replication { provider: String, message: String },

    #[error("retention failed for '{backup_id}': {message}")]
    Retention { backup_id: String, message: String },

    #[error("checksum mismatch: expected {expected}, got {actual}")]
    IntegrityMismatch { expected: String, actual: String },

    #[error("{}", format_structure(path, *line, message))]
    Structure {
        path: String,
        line: Option<usize>,
        message: String,
    },

    #[error("job timed out before {stage} stage after {elapsed_ms} ms")]
    Timeout { stage: Stage, elapsed_ms: u64 },

    #[error("backup not found: '{0}'")]
    BackupNotFound(String),

    #[error("storage provider not found or disabled: '{0}'")]
    ProviderNotFound(String),

    #[error("object already exists: '{0}'")]
    ObjectExists(String),

    #[error("unsafe storage key: {0}")]
    InvalidKey(String),

    #[error("decryption failed: wrong key or corrupted data")]
    DecryptionFailed,

    #[error("decompression error: {0}")]
    Decompression(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

fn format_structure(path: &str, line: Option<usize>, message: &str) -> String {
    match line {
        Some(line) => format!("malformed record in '{path}' at line {line}: {message}"),
        None => format!("malformed artifact '{path}': {message}"),
    }
}

impl KeeperError {
    /// Wrap any error as a failure of the given pipeline stage.
    pub fn stage(stage: Stage, err: impl fmt::Display) -> Self {
        KeeperError::Stage {
            stage,
            message: err.to_string(),
        }
    }

    /// Whether the error aborts the job that produced it.
    ///
    /// Replication and retention failures are attached to the record as
    /// warnings instead.
    pub fn is_fatal_for_job(&self) -> bool {
        !matches!(
            self,
            KeeperError::Replication { .. } | KeeperError::Retention { .. }
        )
    }

    /// Stage the failure belongs to, when one can be attributed.
    pub fn failed_stage(&self) -> Option<Stage> {
        match self {
            KeeperError::Stage { stage, .. } | KeeperError::Timeout { stage, .. } => Some(*stage),
            KeeperError::Acquisition(_) => Some(Stage::Acquire),
            KeeperError::Config(_) => Some(Stage::Validate),
            _ => None,
        }
    }
}
