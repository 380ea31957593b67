use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;

use keeper_types::{BackupId, BackupKind, BackupRecord};

use crate::config::{RetentionConfig, RetentionPolicy};
use crate::error::{KeeperError, Result};
use crate::storage::StorageManager;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", content = "reason", rename_all = "lowercase")]
pub enum RetentionDecision {
    Keep(String),
    Delete(String),
}

impl RetentionDecision {
    pub fn is_delete(&self) -> bool {
        matches!(self, RetentionDecision::Delete(_))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RetentionEntry {
    pub id: BackupId,
    pub kind: BackupKind,
    pub created_at: DateTime<Utc>,
    pub decision: RetentionDecision,
}

/// What one sweep did.
#[derive(Debug, Default)]
pub struct SweepOutcome {
    pub deleted: Vec<BackupId>,
    pub kept: usize,
    /// Per-record failures. A failure never stops the sweep.
    pub errors: Vec<KeeperError>,
    /// Remote copies that could not be removed.
    pub warnings: Vec<String>,
}

/// Decide the fate of every record, grouped by kind and newest first.
///
/// The newest `min_count` records of a kind are always kept. Past that floor
/// a record is deleted when its position exceeds `max_count` or its age
/// exceeds `max_age_days`.
pub fn plan(records: &[BackupRecord], config: &RetentionConfig, now: DateTime<Utc>) -> Vec<RetentionEntry> {
    let mut by_kind: BTreeMap<&'static str, Vec<&BackupRecord>> = BTreeMap::new();
    for record in records {
        by_kind.entry(record.kind.as_str()).or_default().push(record);
    }

    let mut entries = Vec::with_capacity(records.len());
    for group in by_kind.values_mut() {
        group.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        let policy = config.for_kind(group[0].kind);
        for (index, record) in group.iter().enumerate() {
            entries.push(RetentionEntry {
                id: record.id.clone(),
                kind: record.kind,
                created_at: record.created_at,
                decision: decide(policy, index, record.age_days(now)),
            });
        }
    }
    entries
}

fn decide(policy: &RetentionPolicy, index: usize, age_days: i64) -> RetentionDecision {
    let floor = policy.min_count.unwrap_or(0);
    if index < floor {
        return RetentionDecision::Keep(format!("within newest {floor}"));
    }
    if let Some(max) = policy.max_count {
        if index >= max {
            return RetentionDecision::Delete(format!("beyond max count {max}"));
        }
    }
    if let Some(max_age) = policy.max_age_days {
        if age_days > i64::from(max_age) {
            return RetentionDecision::Delete(format!("{age_days} days old, max {max_age}"));
        }
    }
    RetentionDecision::Keep("within limits".into())
}

/// Applies retention against the provider of record.
///
/// Sweeps are serialized so a post-backup sweep and a timed cleanup never
/// race on the same records.
pub struct RetentionSweeper {
    config: RetentionConfig,
    lock: Mutex<()>,
}

impl RetentionSweeper {
    pub fn new(config: RetentionConfig) -> Self {
        Self {
            config,
            lock: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &RetentionConfig {
        &self.config
    }

    /// Delete what [`plan`] marks expired. `busy` names a backup still being
    /// written; it is always kept. Unreadable metadata is reported as an
    /// error and the backup left in place.
    pub async fn sweep(
        &self,
        storage: &StorageManager,
        now: DateTime<Utc>,
        busy: Option<&BackupId>,
    ) -> Result<SweepOutcome> {
        let _guard = self.lock.lock().await;
        let scan = storage.scan().await?;
        let records = scan.records;
        let entries = plan(&records, &self.config, now);
        let by_id: BTreeMap<&BackupId, &BackupRecord> = records.iter().map(|r| (&r.id, r)).collect();

        let mut outcome = SweepOutcome::default();
        for unreadable in scan.unreadable {
            outcome.errors.push(KeeperError::Retention {
                backup_id: unreadable.backup,
                message: format!("unreadable metadata: {}", unreadable.error),
            });
        }
        for entry in entries {
            let RetentionDecision::Delete(reason) = &entry.decision else {
                outcome.kept += 1;
                continue;
            };
            if busy == Some(&entry.id) {
                outcome.kept += 1;
                continue;
            }
            let Some(record) = by_id.get(&entry.id) else {
                continue;
            };
            match storage.delete(record).await {
                Ok(warnings) => {
                    tracing::info!(backup_id = %entry.id, kind = %entry.kind.as_str(), reason = %reason, "backup expired");
                    outcome.deleted.push(entry.id.clone());
                    outcome.warnings.extend(warnings);
                }
                Err(e) => {
                    tracing::warn!(backup_id = %entry.id, error = %e, "failed to delete expired backup");
                    outcome.errors.push(KeeperError::Retention {
                        backup_id: entry.id.to_string(),
                        message: e.to_string(),
                    });
                }
            }
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::record_aged;

    fn policy(max_age_days: Option<u32>, max_count: Option<usize>, min_count: Option<usize>) -> RetentionConfig {
        let p = RetentionPolicy {
            max_age_days,
            max_count,
            min_count,
        };
        RetentionConfig {
            full: p.clone(),
            incremental: p.clone(),
            differential: p,
        }
    }

    fn deleted_ages(entries: &[RetentionEntry], now: DateTime<Utc>) -> Vec<i64> {
        let mut ages: Vec<i64> = entries
            .iter()
            .filter(|e| e.decision.is_delete())
            .map(|e| (now - e.created_at).num_days())
            .collect();
        ages.sort();
        ages
    }

    #[test]
    fn age_limit_respects_floor() {
        let now = Utc::now();
        let records: Vec<_> = [40, 35, 20, 10, 1]
            .iter()
            .map(|d| record_aged(BackupKind::Full, now, *d))
            .collect();
        let entries = plan(&records, &policy(Some(30), None, Some(3)), now);
        assert_eq!(deleted_ages(&entries, now), vec![35, 40]);
    }

    #[test]
    fn floor_holds_when_everything_is_expired() {
        let now = Utc::now();
        let records: Vec<_> = [90, 80, 70, 60]
            .iter()
            .map(|d| record_aged(BackupKind::Full, now, *d))
            .collect();
        let entries = plan(&records, &policy(Some(1), Some(3), Some(3)), now);
        assert_eq!(deleted_ages(&entries, now), vec![90]);
        assert_eq!(entries.iter().filter(|e| !e.decision.is_delete()).count(), 3);
    }

    #[test]
    fn count_limit_drops_oldest() {
        let now = Utc::now();
        let records: Vec<_> = (0..5)
            .map(|d| record_aged(BackupKind::Incremental, now, d))
            .collect();
        let entries = plan(&records, &policy(None, Some(2), Some(1)), now);
        assert_eq!(deleted_ages(&entries, now), vec![2, 3, 4]);
    }

    #[test]
    fn kinds_are_independent() {
        let now = Utc::now();
        let records = vec![
            record_aged(BackupKind::Full, now, 50),
            record_aged(BackupKind::Incremental, now, 1),
            record_aged(BackupKind::Incremental, now, 2),
        ];
        let mut config = policy(Some(30), None, Some(1));
        config.incremental = RetentionPolicy::default();
        let entries = plan(&records, &config, now);
        // The only full backup is protected by its own floor.
        assert!(entries.iter().all(|e| !e.decision.is_delete()));
    }

    #[test]
    fn no_limits_keeps_everything() {
        let now = Utc::now();
        let records: Vec<_> = (0..4)
            .map(|d| record_aged(BackupKind::Full, now, d * 100))
            .collect();
        let entries = plan(&records, &policy(None, None, None), now);
        assert!(entries.iter().all(|e| !e.decision.is_delete()));
    }
}
