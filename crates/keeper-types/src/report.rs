use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::backup_id::BackupId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    /// Not executed, either not applicable or not reached.
    #[default]
    Pending,
    /// Ran to completion; see `passed` for the verdict.
    Completed,
    /// Could not run to completion.
    Failed,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckOutcome {
    pub status: CheckStatus,
    pub passed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl CheckOutcome {
    pub fn passed(detail: impl Into<String>) -> Self {
        Self {
            status: CheckStatus::Completed,
            passed: true,
            detail: Some(detail.into()),
        }
    }

    /// Check ran but the artifact did not satisfy it.
    pub fn rejected(detail: impl Into<String>) -> Self {
        Self {
            status: CheckStatus::Completed,
            passed: false,
            detail: Some(detail.into()),
        }
    }

    pub fn failed(detail: impl Into<String>) -> Self {
        Self {
            status: CheckStatus::Failed,
            passed: false,
            detail: Some(detail.into()),
        }
    }

    pub fn is_executed(&self) -> bool {
        self.status != CheckStatus::Pending
    }

    pub fn is_ok(&self) -> bool {
        self.status == CheckStatus::Completed && self.passed
    }
}

/// Result of one verification pass over a stored backup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrityReport {
    pub backup_id: BackupId,
    pub checked_at: DateTime<Utc>,
    pub checksum: CheckOutcome,
    pub structure: CheckOutcome,
    pub compression: CheckOutcome,
    pub restorability: CheckOutcome,
    pub valid: bool,
    #[serde(default)]
    pub errors: Vec<String>,
}

impl IntegrityReport {
    pub fn new(backup_id: BackupId) -> Self {
        Self {
            backup_id,
            checked_at: Utc::now(),
            checksum: CheckOutcome::default(),
            structure: CheckOutcome::default(),
            compression: CheckOutcome::default(),
            restorability: CheckOutcome::default(),
            valid: false,
            errors: Vec::new(),
        }
    }

    pub fn checks(&self) -> [(&'static str, &CheckOutcome); 4] {
        [
            ("checksum", &self.checksum),
            ("structure", &self.structure),
            ("compression", &self.compression),
            ("restorability", &self.restorability),
        ]
    }

    /// Compute the overall verdict.
    ///
    /// Valid only if at least one check executed and every executed check
    /// completed with a passing result.
    pub fn finalize(&mut self) {
        let executed: Vec<&CheckOutcome> = self
            .checks()
            .into_iter()
            .map(|(_, c)| c)
            .filter(|c| c.is_executed())
            .collect();
        let none_executed = executed.is_empty();
        let valid = !none_executed && executed.iter().all(|c| c.is_ok());
        self.valid = valid;
        if none_executed && self.errors.is_empty() {
            self.errors.push("no integrity checks were applicable".into());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report() -> IntegrityReport {
        IntegrityReport::new(BackupId::parse("backup-2024-01-01T00-00-00-000Z-00000000").unwrap())
    }

    #[test]
    fn all_completed_is_valid() {
        let mut r = report();
        r.checksum = CheckOutcome::passed("ok");
        r.structure = CheckOutcome::passed("3 files");
        r.compression = CheckOutcome::passed("ok");
        r.restorability = CheckOutcome::passed("ok");
        r.finalize();
        assert!(r.valid);
    }

    #[test]
    fn pending_checks_do_not_count() {
        let mut r = report();
        r.checksum = CheckOutcome::passed("ok");
        r.finalize();
        assert!(r.valid);
        assert_eq!(r.compression.status, CheckStatus::Pending);
    }

    #[test]
    fn any_failed_or_rejected_check_invalidates() {
        let mut r = report();
        r.checksum = CheckOutcome::passed("ok");
        r.structure = CheckOutcome::failed("line 42");
        r.finalize();
        assert!(!r.valid);

        let mut r = report();
        r.checksum = CheckOutcome::rejected("mismatch");
        r.finalize();
        assert!(!r.valid);
    }

    #[test]
    fn nothing_executed_is_invalid() {
        let mut r = report();
        r.finalize();
        assert!(!r.valid);
        assert_eq!(r.errors.len(), 1);
    }
}
