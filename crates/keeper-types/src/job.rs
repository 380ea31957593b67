use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::backup_id::BackupId;
use crate::record::{BackupFormat, BackupKind};

/// Filters passed through to the dump collaborator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobOptions {
    /// Restrict the dump to these collections. Empty means all.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub collections: Vec<String>,
    /// Query filter applied to structured exports.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    /// Field projection applied to structured exports.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobTrigger {
    Scheduled,
    Manual,
}

/// A request to produce one backup. Consumed exactly once by the engine.
///
/// The job id is the id of the backup it produces, so failure records and
/// staging directories can be traced back to the trigger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupJob {
    pub id: BackupId,
    pub kind: BackupKind,
    pub format: BackupFormat,
    pub options: JobOptions,
    pub trigger: JobTrigger,
    pub requested_at: DateTime<Utc>,
}

impl BackupJob {
    pub fn new(
        kind: BackupKind,
        format: BackupFormat,
        options: JobOptions,
        trigger: JobTrigger,
    ) -> Self {
        let requested_at = Utc::now();
        Self {
            id: BackupId::generate(requested_at),
            kind,
            format,
            options,
            trigger,
            requested_at,
        }
    }
}
