//! Runs one backup job through the pipeline.
//!
//! ```text
//! validate -> acquire -> compress -> encrypt -> checksum -> persist (local)
//!          -> replicate (remotes, best effort) -> retention sweep
//! ```
//!
//! Stages up to and including persist are fatal. Replication and retention
//! failures become warnings on the record.

pub mod staging;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;

use keeper_types::{
    ArtifactKind, BackupJob, BackupKind, BackupRecord, Codec, StorageLocation,
};

use crate::app::Services;
use crate::archive;
use crate::config::KeeperConfig;
use crate::crypto::{self, EncryptionKey};
use crate::dump::{DumpRequest, DumpSource};
use crate::error::{KeeperError, Result, Stage};
use crate::integrity::IntegrityChecker;
use crate::retention::RetentionSweeper;
use crate::storage::StorageManager;

pub use self::staging::{list_failures, FailureRecord, Staging, FAILURE_FILE, STAGING_DIR};

/// Name of a directory artifact stored without packaging.
pub const DIRECTORY_ARTIFACT: &str = "dump";

/// Per-job time budget, checked between stages.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    started: Instant,
    limit: Duration,
}

impl Deadline {
    pub fn new(limit: Duration) -> Self {
        Self {
            started: Instant::now(),
            limit,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Fail with a timeout if the budget is spent before `next` begins.
    pub fn check(&self, next: Stage) -> Result<()> {
        let elapsed = self.elapsed();
        if elapsed > self.limit {
            return Err(KeeperError::Timeout {
                stage: next,
                elapsed_ms: elapsed.as_millis() as u64,
            });
        }
        Ok(())
    }
}

/// The working artifact as it moves through the stages.
#[derive(Debug)]
struct Artifact {
    path: PathBuf,
    name: String,
    kind: ArtifactKind,
}

pub struct BackupEngine {
    config: Arc<KeeperConfig>,
    storage: Arc<StorageManager>,
    integrity: IntegrityChecker,
    dump: Arc<dyn DumpSource>,
    retention: Arc<RetentionSweeper>,
    key: Option<Arc<EncryptionKey>>,
    timeout: Duration,
    staging_root: PathBuf,
}

impl BackupEngine {
    pub fn new(services: &Services) -> Result<Self> {
        let config = services.config.clone();
        Ok(Self {
            timeout: config.schedule.job_timeout_duration()?,
            staging_root: Staging::root(&config.storage.local.base_path()),
            storage: services.storage.clone(),
            integrity: services.integrity.clone(),
            dump: services.dump.clone(),
            retention: services.retention.clone(),
            key: services.key.clone(),
            config,
        })
    }

    pub fn staging_root(&self) -> &Path {
        &self.staging_root
    }

    /// Execute `job`. On failure the staging directory is left in place with
    /// a `failure.json` describing what went wrong.
    pub async fn run(&self, job: BackupJob) -> Result<BackupRecord> {
        let deadline = Deadline::new(self.timeout);
        tracing::info!(
            backup_id = %job.id,
            kind = job.kind.as_str(),
            format = ?job.format,
            trigger = ?job.trigger,
            "backup started"
        );

        let staging = Staging::create(&self.staging_root, &job.id)
            .map_err(|e| KeeperError::stage(Stage::Validate, e))?;

        match self.execute(&job, &staging, &deadline).await {
            Ok(record) => {
                if let Err(e) = staging.discard() {
                    tracing::warn!(backup_id = %job.id, error = %e, "failed to remove staging directory");
                }
                tracing::info!(
                    backup_id = %record.id,
                    raw_size = record.raw_size,
                    stored_size = record.stored_size,
                    duration_ms = record.duration_ms,
                    warnings = record.warnings.len(),
                    "backup completed"
                );
                Ok(record)
            }
            Err(e) => {
                let failure = FailureRecord {
                    job: job.clone(),
                    stage: e.failed_stage(),
                    error: e.to_string(),
                    failed_at: Utc::now(),
                    elapsed_ms: deadline.elapsed().as_millis() as u64,
                };
                if !keeps_partial_artifacts(failure.stage) {
                    if let Err(discard_err) = staging.discard_payload() {
                        tracing::warn!(backup_id = %job.id, error = %discard_err, "failed to clear staging directory");
                    }
                }
                match staging.record_failure(&failure) {
                    Ok(path) => tracing::error!(
                        backup_id = %job.id,
                        stage = ?failure.stage,
                        error = %e,
                        failure = %path.display(),
                        "backup failed"
                    ),
                    Err(write_err) => tracing::error!(
                        backup_id = %job.id,
                        stage = ?failure.stage,
                        error = %e,
                        write_error = %write_err,
                        "backup failed and the failure record could not be written"
                    ),
                }
                Err(e)
            }
        }
    }

    async fn execute(&self, job: &BackupJob, staging: &Staging, deadline: &Deadline) -> Result<BackupRecord> {
        self.validate().await?;

        deadline.check(Stage::Acquire)?;
        let since = self.since_for(job.kind).await?;
        let request = DumpRequest {
            kind: job.kind,
            format: job.format,
            since,
            options: job.options.clone(),
            output_dir: staging.dump_dir(),
        };
        let dump = self.dump.dump(&request).await.map_err(|e| match e {
            KeeperError::Acquisition(_) | KeeperError::Config(_) => e,
            other => KeeperError::Acquisition(other.to_string()),
        })?;
        tracing::info!(backup_id = %job.id, files = dump.files, bytes = dump.bytes, "payload acquired");

        let mut artifact = Artifact {
            path: dump.path,
            name: DIRECTORY_ARTIFACT.to_string(),
            kind: ArtifactKind::Directory,
        };

        deadline.check(Stage::Compress)?;
        let codec = self.config.compression.codec();
        if codec.is_some() || self.config.encryption.enabled {
            artifact = self
                .package(job, staging, &artifact, codec)
                .await
                .map_err(|e| KeeperError::stage(Stage::Compress, e))?;
        }

        deadline.check(Stage::Encrypt)?;
        if self.config.encryption.enabled {
            artifact = self
                .encrypt(staging, &artifact)
                .await
                .map_err(|e| KeeperError::stage(Stage::Encrypt, e))?;
        }

        deadline.check(Stage::Checksum)?;
        let checksum = if self.config.integrity.enabled {
            Some(
                self.integrity
                    .checksum(&artifact.path)
                    .await
                    .map_err(|e| KeeperError::stage(Stage::Checksum, e))?,
            )
        } else {
            None
        };

        deadline.check(Stage::Persist)?;
        let stored_size = {
            let path = artifact.path.clone();
            blocking(move || archive::tree_size(&path)).await
        }
        .map_err(|e| KeeperError::stage(Stage::Persist, e))?;

        let mut record = BackupRecord {
            id: job.id.clone(),
            created_at: job.requested_at,
            kind: job.kind,
            format: job.format,
            since,
            artifact: artifact.name.clone(),
            artifact_kind: artifact.kind,
            raw_size: dump.bytes,
            stored_size,
            compression: codec,
            encrypted: self.config.encryption.enabled,
            checksum,
            locations: Vec::new(),
            verified: false,
            verified_at: None,
            duration_ms: deadline.elapsed().as_millis() as u64,
            warnings: Vec::new(),
            error: None,
        };

        let local = self.storage.local_name().to_string();
        let stored = self
            .storage
            .store(&local, &artifact.path, &record)
            .await
            .map_err(|e| KeeperError::stage(Stage::Persist, e))?;
        record.locations.push(StorageLocation {
            provider: stored.provider,
            location: stored.location,
            size: stored.size,
        });
        self.storage
            .put_record(&record)
            .await
            .map_err(|e| KeeperError::stage(Stage::Persist, e))?;

        self.replicate(&mut record, &artifact.path).await;
        self.sweep(&mut record).await;

        record.duration_ms = deadline.elapsed().as_millis() as u64;
        self.storage
            .put_record(&record)
            .await
            .map_err(|e| KeeperError::stage(Stage::Persist, e))?;
        Ok(record)
    }

    async fn validate(&self) -> Result<()> {
        let local = self.storage.local();
        local.probe().await.map_err(|e| {
            KeeperError::Config(format!("local storage '{}' is not writable: {e}", local.name()))
        })?;
        if self.config.encryption.enabled && self.key.is_none() {
            return Err(KeeperError::Config(
                "encryption is enabled but no key is loaded".into(),
            ));
        }
        self.dump.ping().await
    }

    /// Lower bound for the dump: the latest backup of any kind for
    /// incremental jobs, the latest full backup for differential ones.
    async fn since_for(&self, kind: BackupKind) -> Result<Option<DateTime<Utc>>> {
        if kind == BackupKind::Full {
            return Ok(None);
        }
        let records = self
            .storage
            .list()
            .await
            .map_err(|e| KeeperError::stage(Stage::Acquire, e))?;
        let base = records
            .iter()
            .filter(|r| kind == BackupKind::Incremental || r.kind == BackupKind::Full)
            .map(|r| r.created_at)
            .max();
        if base.is_none() {
            tracing::warn!(kind = kind.as_str(), "no base backup found, dumping everything");
        }
        Ok(base)
    }

    async fn package(
        &self,
        job: &BackupJob,
        staging: &Staging,
        current: &Artifact,
        codec: Option<Codec>,
    ) -> Result<Artifact> {
        let name = match codec {
            Some(codec) => format!("{}.tar.{}", job.id, codec.extension()),
            None => format!("{}.tar", job.id),
        };
        let dest = staging.path(&name);
        let level = self.config.compression.effective_level();
        let src = current.path.clone();
        let out = dest.clone();
        let size = blocking(move || archive::pack_to_file(&src, &out, codec.map(|c| (c, level)))).await?;
        tracing::debug!(
            backup_id = %job.id,
            codec = codec.map(Codec::as_str).unwrap_or("none"),
            size,
            "payload packaged"
        );
        Ok(Artifact {
            path: dest,
            name,
            kind: ArtifactKind::File,
        })
    }

    async fn encrypt(&self, staging: &Staging, current: &Artifact) -> Result<Artifact> {
        let key = self
            .key
            .clone()
            .ok_or_else(|| KeeperError::Config("encryption key not loaded".into()))?;
        let name = format!("{}.enc", current.name);
        let dest = staging.path(&name);
        let src = current.path.clone();
        let out = dest.clone();
        blocking(move || {
            crypto::encrypt_file(&src, &out, &key)?;
            // The plaintext package is no longer needed.
            std::fs::remove_file(&src)?;
            Ok(())
        })
        .await?;
        Ok(Artifact {
            path: dest,
            name,
            kind: ArtifactKind::File,
        })
    }

    async fn replicate(&self, record: &mut BackupRecord, payload: &Path) {
        for remote in self.storage.remote_names() {
            match self.storage.store(&remote, payload, record).await {
                Ok(stored) => record.locations.push(StorageLocation {
                    provider: stored.provider,
                    location: stored.location,
                    size: stored.size,
                }),
                Err(e) => {
                    let err = KeeperError::Replication {
                        provider: remote.clone(),
                        message: e.to_string(),
                    };
                    tracing::warn!(backup_id = %record.id, provider = %remote, error = %e, "replication failed");
                    record.warnings.push(err.to_string());
                }
            }
        }
    }

    async fn sweep(&self, record: &mut BackupRecord) {
        let id = record.id.clone();
        match self.retention.sweep(&self.storage, Utc::now(), Some(&id)).await {
            Ok(outcome) => {
                record
                    .warnings
                    .extend(outcome.errors.iter().map(|e| e.to_string()));
                record.warnings.extend(outcome.warnings);
            }
            Err(e) => {
                tracing::warn!(backup_id = %record.id, error = %e, "retention sweep failed");
                record.warnings.push(format!("retention sweep failed: {e}"));
            }
        }
    }
}

/// Partial artifacts are kept for inspection only when packaging, encryption
/// or hashing failed. Other failures keep just `failure.json`.
fn keeps_partial_artifacts(stage: Option<Stage>) -> bool {
    matches!(
        stage,
        Some(Stage::Compress | Stage::Encrypt | Stage::Checksum)
    )
}

async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| KeeperError::Other(format!("engine task panicked: {e}")))?
}
