//! Sweeps and one-off operations that don't touch scheduler state.

use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::Serialize;

use keeper_types::{BackupId, BackupRecord, IntegrityReport};

use crate::app::Services;
use crate::archive;
use crate::error::{KeeperError, Result};
use crate::integrity::{IntegrityChecker, IntegrityStatistics};
use crate::notify::{Event, EventKind};
use crate::retention::SweepOutcome;

/// Result of checking every stored backup.
#[derive(Debug, Clone, Default, Serialize)]
pub struct IntegritySweep {
    pub checked: usize,
    pub valid: usize,
    pub invalid: usize,
    /// Records that could not be checked at all, with the reason.
    pub errors: Vec<String>,
    pub statistics: IntegrityStatistics,
    pub reports: Vec<IntegrityReport>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RestoreOutcome {
    pub backup_id: BackupId,
    pub provider: String,
    pub destination: PathBuf,
    pub bytes: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckItem {
    pub name: String,
    pub ok: bool,
    pub detail: String,
}

/// Startup self-test results.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ConfigCheck {
    pub items: Vec<CheckItem>,
}

impl ConfigCheck {
    fn push(&mut self, name: impl Into<String>, outcome: std::result::Result<(), String>) {
        let (ok, detail) = match outcome {
            Ok(()) => (true, "ok".to_string()),
            Err(e) => (false, e),
        };
        self.items.push(CheckItem {
            name: name.into(),
            ok,
            detail,
        });
    }

    pub fn all_ok(&self) -> bool {
        self.items.iter().all(|i| i.ok)
    }
}

#[derive(Clone)]
pub struct Operations {
    services: Services,
}

impl Operations {
    pub fn new(services: Services) -> Self {
        Self { services }
    }

    pub fn services(&self) -> &Services {
        &self.services
    }

    pub async fn list_backups(&self) -> Result<Vec<BackupRecord>> {
        self.services.storage.list().await
    }

    /// Apply retention now. Per-record failures are reported, not raised.
    /// `busy` names a backup still being written, which is left alone.
    pub async fn cleanup(&self, busy: Option<&BackupId>) -> Result<SweepOutcome> {
        let outcome = self
            .services
            .retention
            .sweep(&self.services.storage, Utc::now(), busy)
            .await?;
        tracing::info!(
            deleted = outcome.deleted.len(),
            kept = outcome.kept,
            errors = outcome.errors.len(),
            "cleanup finished"
        );
        if !outcome.errors.is_empty() || !outcome.warnings.is_empty() {
            let errors: Vec<String> = outcome.errors.iter().map(|e| e.to_string()).collect();
            self.services
                .notifications
                .notify(Event::new(
                    EventKind::Warning,
                    None,
                    serde_json::json!({
                        "operation": "cleanup",
                        "errors": errors,
                        "warnings": outcome.warnings,
                    }),
                ))
                .await;
        }
        Ok(outcome)
    }

    /// Produce a report for one record and persist the outcome.
    ///
    /// Only the verification fields are written back, onto a fresh copy of
    /// the stored record, so fields updated while the check ran survive.
    /// `record` is replaced by what was written.
    pub async fn verify_record(&self, record: &mut BackupRecord) -> Result<IntegrityReport> {
        let path = self
            .services
            .storage
            .artifact_path(record)
            .ok_or_else(|| KeeperError::BackupNotFound(format!("{}: no local artifact", record.id)))?;
        let report = self.services.integrity.generate_report(&path, record).await;

        let algorithm = self.services.integrity.algorithm();
        let checked = record.checksum.clone();
        let valid = report.valid;
        let checked_at = report.checked_at;
        let reason = report.errors.join("; ");
        let id = record.id.clone();
        let updated = self
            .services
            .storage
            .update_record(&id, move |stored| {
                if stored.checksum != checked {
                    tracing::debug!(backup_id = %stored.id, "record changed during the check, result dropped");
                } else if !valid {
                    stored.mark_unverified(reason);
                } else if let Err(e) = stored.mark_verified(checked_at, algorithm) {
                    tracing::debug!(backup_id = %stored.id, error = %e, "left unverified");
                }
            })
            .await?;
        *record = updated;
        Ok(report)
    }

    pub async fn verify_one(&self, id: &BackupId) -> Result<IntegrityReport> {
        let mut record = self.services.storage.get_record(id).await?;
        self.verify_record(&mut record).await
    }

    /// Check every stored backup, one at a time. A record that can't be
    /// checked, or whose metadata can't be read, is counted and skipped.
    /// `busy` names a backup still being written, which is not checked.
    pub async fn integrity_sweep(&self, busy: Option<&BackupId>) -> Result<IntegritySweep> {
        let scan = self.services.storage.scan().await?;
        let mut sweep = IntegritySweep::default();
        for unreadable in &scan.unreadable {
            sweep.errors.push(format!(
                "{}: unreadable metadata: {}",
                unreadable.backup, unreadable.error
            ));
        }
        let mut outcomes: Vec<(BackupRecord, Option<IntegrityReport>)> =
            Vec::with_capacity(scan.records.len());

        for mut record in scan.records {
            if busy == Some(&record.id) {
                tracing::debug!(backup_id = %record.id, "backup still running, not checked");
                continue;
            }
            match self.verify_record(&mut record).await {
                Ok(report) => {
                    sweep.checked += 1;
                    if report.valid {
                        sweep.valid += 1;
                    } else {
                        sweep.invalid += 1;
                        tracing::warn!(backup_id = %record.id, errors = ?report.errors, "backup failed integrity check");
                    }
                    outcomes.push((record, Some(report)));
                }
                Err(e) => {
                    tracing::warn!(backup_id = %record.id, error = %e, "integrity check could not run");
                    sweep.errors.push(format!("{}: {e}", record.id));
                    outcomes.push((record, None));
                }
            }
        }

        sweep.statistics = IntegrityChecker::statistics(outcomes.iter().map(|(r, rep)| (r, rep.as_ref())));
        sweep.statistics.total += scan.unreadable.len();
        sweep.statistics.errors += scan.unreadable.len();
        sweep.reports = outcomes.into_iter().filter_map(|(_, rep)| rep).collect();
        tracing::info!(
            checked = sweep.checked,
            valid = sweep.valid,
            invalid = sweep.invalid,
            errors = sweep.errors.len(),
            "integrity sweep finished"
        );

        if sweep.invalid > 0 || !sweep.errors.is_empty() {
            let invalid: Vec<&str> = sweep
                .reports
                .iter()
                .filter(|r| !r.valid)
                .map(|r| r.backup_id.as_str())
                .collect();
            self.services
                .notifications
                .notify(Event::new(
                    EventKind::Warning,
                    None,
                    serde_json::json!({
                        "operation": "integrity",
                        "valid": sweep.valid,
                        "invalid": sweep.invalid,
                        "invalid_backups": invalid,
                        "errors": sweep.errors,
                    }),
                ))
                .await;
        }
        Ok(sweep)
    }

    /// Restore backup `id` into `destination`, which must be empty or absent.
    ///
    /// The local copy is used when present, otherwise the first remote that
    /// has the backup. The stored checksum is verified before unpacking.
    pub async fn restore(&self, id: &BackupId, destination: &Path) -> Result<RestoreOutcome> {
        ensure_empty_destination(destination)?;
        let storage = &self.services.storage;

        let local_record = storage.local().get_record(id).await?;
        let local_path = local_record
            .as_ref()
            .and_then(|r| storage.artifact_path(r))
            .filter(|p| p.exists());

        let scratch = tempfile::Builder::new().prefix("keeper-restore-").tempdir()?;
        let (record, provider, artifact) = match (local_record, local_path) {
            (Some(record), Some(path)) => (record, storage.local_name().to_string(), path),
            (local, _) => self.fetch_remote(id, local, scratch.path()).await?,
        };

        if let Some(expected) = &record.checksum {
            self.services
                .integrity
                .verify(&artifact, expected)
                .await?
                .into_result()?;
        }

        let key = self.services.key.clone();
        let dest = destination.to_path_buf();
        let rec = record.clone();
        let bytes = tokio::task::spawn_blocking(move || {
            archive::restore_artifact(&artifact, &rec, key.as_deref(), &dest)
        })
        .await
        .map_err(|e| KeeperError::Other(format!("restore task panicked: {e}")))??;

        tracing::info!(backup_id = %id, provider = %provider, bytes, destination = %destination.display(), "backup restored");
        Ok(RestoreOutcome {
            backup_id: id.clone(),
            provider,
            destination: destination.to_path_buf(),
            bytes,
        })
    }

    async fn fetch_remote(
        &self,
        id: &BackupId,
        local: Option<BackupRecord>,
        scratch: &Path,
    ) -> Result<(BackupRecord, String, PathBuf)> {
        let storage = &self.services.storage;
        for name in storage.remote_names() {
            let provider = storage.provider(&name)?;
            let record = match &local {
                Some(r) => r.clone(),
                None => match provider.get_record(id).await {
                    Ok(Some(r)) => r,
                    Ok(None) => continue,
                    Err(e) => {
                        tracing::warn!(provider = %name, error = %e, "remote lookup failed");
                        continue;
                    }
                },
            };
            let dest = scratch.join(&record.artifact);
            match storage.retrieve(&name, id, &dest).await {
                Ok(_) => return Ok((record, name, dest)),
                Err(e) => tracing::warn!(provider = %name, backup_id = %id, error = %e, "remote retrieve failed"),
            }
        }
        Err(KeeperError::BackupNotFound(id.to_string()))
    }

    /// Startup self-test. Only an unusable local path is fatal.
    pub async fn verify_configuration(&self) -> Result<ConfigCheck> {
        let mut check = ConfigCheck::default();
        let storage = &self.services.storage;

        for (name, outcome) in storage.probe_all().await {
            if name == storage.local_name() {
                if let Err(e) = outcome {
                    return Err(KeeperError::Config(format!(
                        "local storage '{name}' is not usable: {e}"
                    )));
                }
                check.push(format!("storage:{name}"), Ok(()));
            } else {
                check.push(format!("storage:{name}"), outcome.map_err(|e| e.to_string()));
            }
        }

        let encryption = &self.services.config.encryption;
        if encryption.enabled {
            let outcome = match &self.services.key {
                Some(_) => Ok(()),
                None => Err(format!("no key in '{}'", encryption.key_dir().display())),
            };
            check.push("encryption", outcome);
        }

        check.push("source", self.services.dump.ping().await.map_err(|e| e.to_string()));

        for (name, outcome) in self.services.notifications.probe().await {
            check.push(format!("notifier:{name}"), outcome);
        }

        for item in &check.items {
            if item.ok {
                tracing::info!(check = %item.name, "configuration check passed");
            } else {
                tracing::warn!(check = %item.name, detail = %item.detail, "configuration check failed");
            }
        }
        Ok(check)
    }
}

fn ensure_empty_destination(dest: &Path) -> Result<()> {
    match std::fs::read_dir(dest) {
        Ok(mut entries) => {
            if entries.next().is_some() {
                return Err(KeeperError::ObjectExists(format!(
                    "restore destination '{}' is not empty",
                    dest.display()
                )));
            }
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
