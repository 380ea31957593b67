//! Checksums, structural validation and integrity reports for stored backups.

mod checksum;
mod structure;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use keeper_types::{
    ArtifactKind, BackupFormat, BackupRecord, CheckOutcome, Checksum, ChecksumAlgorithm,
    IntegrityReport,
};

pub use self::checksum::{checksum_dir, checksum_file, checksum_path, checksum_reader};
pub use self::structure::{verify_structure, StructureSummary};

use crate::archive;
use crate::compress;
use crate::crypto::EncryptionKey;
use crate::error::{KeeperError, Result};

/// Outcome of comparing a recomputed digest with the recorded one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChecksumVerification {
    pub expected: String,
    pub actual: String,
}

impl ChecksumVerification {
    pub fn matches(&self) -> bool {
        self.expected.eq_ignore_ascii_case(&self.actual)
    }

    pub fn into_result(self) -> Result<()> {
        if self.matches() {
            Ok(())
        } else {
            Err(KeeperError::IntegrityMismatch {
                expected: self.expected,
                actual: self.actual,
            })
        }
    }
}

/// Aggregate over a set of integrity reports.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IntegrityStatistics {
    pub total: usize,
    pub valid: usize,
    pub invalid: usize,
    /// Backups whose report could not be produced at all.
    pub errors: usize,
    pub total_size: u64,
    pub average_size: u64,
    pub oldest: Option<DateTime<Utc>>,
    pub newest: Option<DateTime<Utc>>,
}

#[derive(Clone)]
pub struct IntegrityChecker {
    algorithm: ChecksumAlgorithm,
    key: Option<Arc<EncryptionKey>>,
    verify_restorability: bool,
}

impl IntegrityChecker {
    pub fn new(algorithm: ChecksumAlgorithm, key: Option<Arc<EncryptionKey>>) -> Self {
        Self {
            algorithm,
            key,
            verify_restorability: true,
        }
    }

    pub fn with_restorability(mut self, enabled: bool) -> Self {
        self.verify_restorability = enabled;
        self
    }

    pub fn algorithm(&self) -> ChecksumAlgorithm {
        self.algorithm
    }

    /// Digest of a file or directory with the configured algorithm.
    pub async fn checksum(&self, path: &Path) -> Result<Checksum> {
        let algorithm = self.algorithm;
        let hex = self.checksum_with(path, algorithm).await?;
        Ok(Checksum::new(algorithm, hex))
    }

    pub async fn checksum_with(&self, path: &Path, algorithm: ChecksumAlgorithm) -> Result<String> {
        let path = path.to_path_buf();
        blocking(move || checksum_path(&path, algorithm)).await
    }

    /// Recompute the digest of `path` and compare it with `expected`.
    pub async fn verify(&self, path: &Path, expected: &Checksum) -> Result<ChecksumVerification> {
        let actual = self.checksum_with(path, expected.algorithm).await?;
        let verification = ChecksumVerification {
            expected: expected.hex.clone(),
            actual,
        };
        if !verification.matches() {
            tracing::warn!(
                path = %path.display(),
                expected = %verification.expected,
                actual = %verification.actual,
                "checksum mismatch"
            );
        }
        Ok(verification)
    }

    pub async fn verify_structure(&self, path: &Path, format: BackupFormat) -> Result<StructureSummary> {
        let path = path.to_path_buf();
        blocking(move || verify_structure(&path, format)).await
    }

    /// Stream a stored artifact through decryption and decompression without
    /// keeping the output. Returns the decompressed byte count.
    pub async fn verify_compressed_artifact(&self, path: &Path, record: &BackupRecord) -> Result<u64> {
        let path = path.to_path_buf();
        let record = record.clone();
        let key = self.key.clone();
        blocking(move || drain_artifact(&path, &record, key.as_deref())).await
    }

    /// Run every applicable check against a stored artifact.
    ///
    /// Checks are isolated: a failure in one is recorded and the rest still run.
    pub async fn generate_report(&self, path: &Path, record: &BackupRecord) -> IntegrityReport {
        let this = self.clone();
        let path = path.to_path_buf();
        let record = record.clone();
        let id = record.id.clone();
        match tokio::task::spawn_blocking(move || this.report_blocking(&path, &record)).await {
            Ok(report) => report,
            Err(e) => {
                let mut report = IntegrityReport::new(id);
                report.errors.push(format!("integrity task panicked: {e}"));
                report.finalize();
                report
            }
        }
    }

    fn report_blocking(&self, path: &Path, record: &BackupRecord) -> IntegrityReport {
        let mut report = IntegrityReport::new(record.id.clone());

        if let Some(expected) = &record.checksum {
            report.checksum = match checksum_path(path, expected.algorithm) {
                Ok(actual) if expected.matches(&actual) => {
                    CheckOutcome::passed(format!("{} matches", expected.algorithm))
                }
                Ok(actual) => {
                    let err = KeeperError::IntegrityMismatch {
                        expected: expected.hex.clone(),
                        actual,
                    };
                    report.errors.push(format!("checksum: {err}"));
                    CheckOutcome::rejected(err.to_string())
                }
                Err(e) => {
                    report.errors.push(format!("checksum: {e}"));
                    CheckOutcome::failed(e.to_string())
                }
            };
        }

        let packaged = record.artifact_kind == ArtifactKind::File;

        if packaged && record.compression.is_some() {
            report.compression = match drain_artifact(path, record, self.key.as_deref()) {
                Ok(bytes) => CheckOutcome::passed(format!("{bytes} bytes decompressed")),
                Err(e) => {
                    report.errors.push(format!("compression: {e}"));
                    CheckOutcome::failed(e.to_string())
                }
            };
        }

        // Packaged artifacts are unpacked into scratch space for the
        // restorability and structure checks.
        let scratch = if packaged {
            Some(self.unpack_to_scratch(path, record))
        } else {
            None
        };

        if packaged && self.verify_restorability {
            report.restorability = match &scratch {
                Some(Ok((_, size))) if *size == record.raw_size => {
                    CheckOutcome::passed(format!("{size} bytes restored"))
                }
                Some(Ok((_, size))) => {
                    let msg = format!(
                        "restored {size} bytes but {} were recorded",
                        record.raw_size
                    );
                    report.errors.push(format!("restorability: {msg}"));
                    CheckOutcome::rejected(msg)
                }
                Some(Err(e)) => {
                    report.errors.push(format!("restorability: {e}"));
                    CheckOutcome::failed(e.to_string())
                }
                None => CheckOutcome::default(),
            };
        }

        let structure_root: std::result::Result<PathBuf, String> = match &scratch {
            Some(Ok((dir, _))) => Ok(dir.path().to_path_buf()),
            Some(Err(e)) => Err(format!("artifact could not be unpacked: {e}")),
            None => Ok(path.to_path_buf()),
        };
        report.structure = match structure_root {
            Ok(root) => match verify_structure(&root, record.format) {
                Ok(summary) => CheckOutcome::passed(format!(
                    "{} files, {} records",
                    summary.files, summary.records
                )),
                Err(e @ KeeperError::Structure { .. }) => {
                    report.errors.push(format!("structure: {e}"));
                    CheckOutcome::rejected(e.to_string())
                }
                Err(e) => {
                    report.errors.push(format!("structure: {e}"));
                    CheckOutcome::failed(e.to_string())
                }
            },
            Err(msg) => {
                report.errors.push(format!("structure: {msg}"));
                CheckOutcome::failed(msg)
            }
        };

        report.finalize();
        tracing::debug!(
            backup_id = %record.id,
            valid = report.valid,
            errors = report.errors.len(),
            "integrity report generated"
        );
        report
    }

    fn unpack_to_scratch(
        &self,
        path: &Path,
        record: &BackupRecord,
    ) -> Result<(tempfile::TempDir, u64)> {
        let scratch = tempfile::Builder::new().prefix("keeper-verify-").tempdir()?;
        let size = archive::restore_artifact(path, record, self.key.as_deref(), scratch.path())?;
        Ok((scratch, size))
    }

    /// Summarize reports for a set of records. `None` marks a record whose
    /// report could not be produced.
    pub fn statistics<'a>(
        entries: impl IntoIterator<Item = (&'a BackupRecord, Option<&'a IntegrityReport>)>,
    ) -> IntegrityStatistics {
        let mut stats = IntegrityStatistics::default();
        for (record, report) in entries {
            stats.total += 1;
            match report {
                Some(r) if r.valid => stats.valid += 1,
                Some(_) => stats.invalid += 1,
                None => stats.errors += 1,
            }
            stats.total_size += record.stored_size;
            stats.oldest = Some(stats.oldest.map_or(record.created_at, |o| o.min(record.created_at)));
            stats.newest = Some(stats.newest.map_or(record.created_at, |n| n.max(record.created_at)));
        }
        if stats.total > 0 {
            stats.average_size = stats.total_size / stats.total as u64;
        }
        stats
    }
}

fn drain_artifact(path: &Path, record: &BackupRecord, key: Option<&EncryptionKey>) -> Result<u64> {
    compress::drain(archive::open_artifact(path, record, key)?)
}

async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| KeeperError::Other(format!("integrity task panicked: {e}")))?
}
