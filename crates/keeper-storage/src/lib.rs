pub mod http_util;
pub mod local;
pub mod retry;
pub mod s3;

use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use keeper_types::{BackupId, BackupRecord, Result};

pub use local::LocalProvider;
pub use s3::{S3Provider, S3ProviderConfig};

/// Name of the per-backup metadata object written next to the artifact.
pub const METADATA_FILE: &str = "metadata.json";

/// Where a stored payload ended up and how large it is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub location: String,
    pub size: u64,
}

/// Object count and byte total held by one provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ProviderUsage {
    pub backups: usize,
    pub bytes: u64,
}

/// A backup whose metadata exists but could not be read or parsed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnreadableRecord {
    /// Directory or key prefix the metadata was found under.
    pub backup: String,
    pub error: String,
}

/// Everything a provider found while listing its backups.
#[derive(Debug, Default)]
pub struct RecordScan {
    /// Readable records, oldest first.
    pub records: Vec<BackupRecord>,
    pub unreadable: Vec<UnreadableRecord>,
}

/// Retry settings for remote providers.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
        }
    }
}

fn default_max_retries() -> usize {
    3
}

fn default_retry_delay_ms() -> u64 {
    1000
}

fn default_retry_max_delay_ms() -> u64 {
    60_000
}

/// A named backend that can hold backups.
///
/// Every backup is addressed by its id; providers are free to encode the id
/// into paths or object keys however they like. `store` must never replace
/// an existing object for the same id and artifact.
#[async_trait]
pub trait StorageProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Copy `payload` (a file or a directory tree) and write `record`
    /// alongside it.
    async fn store(&self, payload: &Path, record: &BackupRecord) -> Result<StoredObject>;

    /// Copy the artifact of backup `id` to `destination`. Returns bytes copied.
    async fn retrieve(&self, id: &BackupId, destination: &Path) -> Result<u64>;

    /// Overwrite the metadata of an already stored backup.
    async fn put_record(&self, record: &BackupRecord) -> Result<()>;

    async fn get_record(&self, id: &BackupId) -> Result<Option<BackupRecord>>;

    /// Every backup this provider holds, readable or not.
    async fn scan(&self) -> Result<RecordScan>;

    /// Readable backup records, oldest first.
    async fn list(&self) -> Result<Vec<BackupRecord>> {
        Ok(self.scan().await?.records)
    }

    /// Remove the artifact and metadata of backup `id`. Missing backups are not an error.
    async fn delete(&self, id: &BackupId) -> Result<()>;

    async fn usage(&self) -> Result<ProviderUsage>;

    /// Confirm the backend is reachable and writable.
    async fn probe(&self) -> Result<()>;

    /// Filesystem path of a stored artifact, for providers that have one.
    fn local_artifact_path(&self, _record: &BackupRecord) -> Option<std::path::PathBuf> {
        None
    }
}

/// Sort records oldest first, breaking ties by id.
pub fn sort_records(records: &mut [BackupRecord]) {
    records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
}
