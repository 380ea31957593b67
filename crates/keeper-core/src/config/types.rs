use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use keeper_storage::RetryConfig;
use keeper_types::{BackupFormat, BackupKind, ChecksumAlgorithm, Codec};

use super::defaults::*;
use crate::error::{KeeperError, Result};

/// Fully parsed `keeper.yaml`.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KeeperConfig {
    pub storage: StorageConfig,
    #[serde(default)]
    pub source: SourceConfig,
    #[serde(default)]
    pub compression: CompressionConfig,
    #[serde(default)]
    pub encryption: EncryptionConfig,
    #[serde(default)]
    pub integrity: IntegrityConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub notifications: NotificationsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl KeeperConfig {
    /// Cross-field checks that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        self.storage.validate()?;
        self.compression.validate()?;
        for kind in BackupKind::ALL {
            self.retention
                .for_kind(kind)
                .validate()
                .map_err(|e| KeeperError::Config(format!("retention.{kind}: {e}")))?;
        }
        self.schedule.validate()?;
        self.source.timeout_duration()?;
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StorageConfig {
    pub local: LocalStorageConfig,
    #[serde(default)]
    pub remote: Vec<RemoteStorageConfig>,
}

impl StorageConfig {
    fn validate(&self) -> Result<()> {
        if self.local.base_path.trim().is_empty() {
            return Err(KeeperError::Config(
                "storage.local.base_path must not be empty".into(),
            ));
        }
        let mut names = std::collections::HashSet::new();
        names.insert(self.local.name.as_str());
        for remote in &self.remote {
            if !names.insert(remote.name.as_str()) {
                return Err(KeeperError::Config(format!(
                    "duplicate storage provider name '{}'",
                    remote.name
                )));
            }
            if remote.enabled {
                remote.validate()?;
            }
        }
        Ok(())
    }
}

/// The provider of record. Always enabled.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LocalStorageConfig {
    #[serde(default = "default_local_provider_name")]
    pub name: String,
    pub base_path: String,
}

impl LocalStorageConfig {
    pub fn base_path(&self) -> PathBuf {
        PathBuf::from(super::expand_tilde(&self.base_path))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RemoteKind {
    #[default]
    S3,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RemoteStorageConfig {
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub kind: RemoteKind,
    #[serde(default)]
    pub bucket: String,
    #[serde(default = "default_region")]
    pub region: String,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub prefix: String,
    #[serde(default)]
    pub access_key_id: Option<String>,
    #[serde(default)]
    pub secret_access_key: Option<String>,
    #[serde(default)]
    pub storage_class: Option<String>,
    #[serde(default)]
    pub retry: RetryConfig,
}

impl RemoteStorageConfig {
    fn validate(&self) -> Result<()> {
        let ctx = format!("storage.remote '{}'", self.name);
        if self.name.trim().is_empty() {
            return Err(KeeperError::Config("storage.remote entries need a name".into()));
        }
        if self.bucket.trim().is_empty() {
            return Err(KeeperError::Config(format!("{ctx}: bucket is required")));
        }
        if self.access_key_id.as_deref().unwrap_or("").is_empty()
            || self.secret_access_key.as_deref().unwrap_or("").is_empty()
        {
            return Err(KeeperError::Config(format!(
                "{ctx}: access_key_id and secret_access_key are required"
            )));
        }
        Ok(())
    }
}

/// How the dump collaborator is invoked.
///
/// Commands are shell templates; see [`crate::dump`] for the placeholders.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SourceConfig {
    /// Connection string or name of the database being backed up.
    #[serde(default)]
    pub target: String,
    #[serde(default = "default_format")]
    pub format: BackupFormat,
    #[serde(default)]
    pub ping_command: Option<String>,
    #[serde(default)]
    pub archive_command: Option<String>,
    #[serde(default)]
    pub export_command: Option<String>,
    #[serde(default)]
    pub list_collections_command: Option<String>,
    /// Collections to export when no job-level filter is given.
    #[serde(default)]
    pub collections: Vec<String>,
    #[serde(default)]
    pub include_system_collections: bool,
    #[serde(default = "default_dump_timeout")]
    pub timeout: String,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            target: String::new(),
            format: default_format(),
            ping_command: None,
            archive_command: None,
            export_command: None,
            list_collections_command: None,
            collections: Vec::new(),
            include_system_collections: false,
            timeout: default_dump_timeout(),
        }
    }
}

impl SourceConfig {
    pub fn timeout_duration(&self) -> Result<Duration> {
        parse_human_duration(&self.timeout)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CompressionConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_codec")]
    pub algorithm: Codec,
    /// Codec-specific level. gzip 0-9 (default 6), zstd 1-22 (default 3); ignored for lz4.
    #[serde(default)]
    pub level: Option<i32>,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            algorithm: default_codec(),
            level: None,
        }
    }
}

impl CompressionConfig {
    /// Active codec, or `None` when compression is off.
    pub fn codec(&self) -> Option<Codec> {
        self.enabled.then_some(self.algorithm)
    }

    pub fn effective_level(&self) -> i32 {
        match (self.algorithm, self.level) {
            (Codec::Gzip, Some(l)) => l.clamp(0, 9),
            (Codec::Gzip, None) => 6,
            (Codec::Zstd, Some(l)) => l.clamp(1, 22),
            (Codec::Zstd, None) => 3,
            (Codec::Lz4, _) => 0,
        }
    }

    fn validate(&self) -> Result<()> {
        match (self.algorithm, self.level) {
            (Codec::Gzip, Some(l)) if !(0..=9).contains(&l) => Err(KeeperError::Config(
                format!("compression.level {l} out of range for gzip (0-9)"),
            )),
            (Codec::Zstd, Some(l)) if !(1..=22).contains(&l) => Err(KeeperError::Config(
                format!("compression.level {l} out of range for zstd (1-22)"),
            )),
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EncryptionConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Directory holding `backup.key`.
    #[serde(default = "default_key_path")]
    pub key_path: String,
}

impl Default for EncryptionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            key_path: default_key_path(),
        }
    }
}

impl EncryptionConfig {
    pub fn key_dir(&self) -> PathBuf {
        PathBuf::from(super::expand_tilde(&self.key_path))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IntegrityConfig {
    /// Compute a checksum for every backup.
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_checksum_algorithm")]
    pub algorithm: ChecksumAlgorithm,
    /// Run a full integrity report right after each successful backup.
    #[serde(default = "default_true")]
    pub verify_after_backup: bool,
    /// Include the extract-to-scratch restorability check in reports.
    #[serde(default = "default_true")]
    pub verify_restorability: bool,
}

impl Default for IntegrityConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            algorithm: default_checksum_algorithm(),
            verify_after_backup: true,
            verify_restorability: true,
        }
    }
}

/// Retention rule for one backup kind.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(deny_unknown_fields)]
pub struct RetentionPolicy {
    #[serde(default)]
    pub max_age_days: Option<u32>,
    #[serde(default)]
    pub max_count: Option<usize>,
    /// Floor below which nothing is evicted, whatever the age or count.
    #[serde(default)]
    pub min_count: Option<usize>,
}

impl RetentionPolicy {
    pub fn validate(&self) -> Result<()> {
        if self.max_count == Some(0) {
            return Err(KeeperError::Config("max_count must be at least 1".into()));
        }
        if let (Some(min), Some(max)) = (self.min_count, self.max_count) {
            if min > max {
                return Err(KeeperError::Config(format!(
                    "min_count ({min}) must not exceed max_count ({max})"
                )));
            }
        }
        Ok(())
    }

    pub fn has_limits(&self) -> bool {
        self.max_age_days.is_some() || self.max_count.is_some()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetentionConfig {
    #[serde(default = "default_full_retention")]
    pub full: RetentionPolicy,
    #[serde(default = "default_incremental_retention")]
    pub incremental: RetentionPolicy,
    #[serde(default = "default_differential_retention")]
    pub differential: RetentionPolicy,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            full: default_full_retention(),
            incremental: default_incremental_retention(),
            differential: default_differential_retention(),
        }
    }
}

impl RetentionConfig {
    pub fn for_kind(&self, kind: BackupKind) -> &RetentionPolicy {
        match kind {
            BackupKind::Full => &self.full,
            BackupKind::Incremental => &self.incremental,
            BackupKind::Differential => &self.differential,
        }
    }
}

/// When a timed trigger fires. Exactly one of `every` / `daily_at` is set.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TriggerConfig {
    #[serde(default)]
    pub every: Option<String>,
    /// `HH:MM`, UTC.
    #[serde(default)]
    pub daily_at: Option<String>,
    #[serde(default)]
    pub jitter_seconds: u64,
    /// Fire once immediately when the daemon starts.
    #[serde(default)]
    pub run_on_start: bool,
}

impl TriggerConfig {
    pub fn every(interval: &str) -> Self {
        Self {
            every: Some(interval.to_string()),
            daily_at: None,
            jitter_seconds: 0,
            run_on_start: false,
        }
    }

    pub fn daily_at(at: &str) -> Self {
        Self {
            every: None,
            daily_at: Some(at.to_string()),
            jitter_seconds: 0,
            run_on_start: false,
        }
    }

    pub fn validate(&self, name: &str) -> Result<()> {
        match (&self.every, &self.daily_at) {
            (Some(every), None) => parse_human_duration(every).map(|_| ()),
            (None, Some(at)) => parse_daily_at(at).map(|_| ()),
            (Some(_), Some(_)) => Err(KeeperError::Config(format!(
                "schedule.{name}: set either 'every' or 'daily_at', not both"
            ))),
            (None, None) => Err(KeeperError::Config(format!(
                "schedule.{name}: one of 'every' or 'daily_at' is required"
            ))),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScheduleConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_full_trigger")]
    pub full: Option<TriggerConfig>,
    #[serde(default)]
    pub incremental: Option<TriggerConfig>,
    #[serde(default)]
    pub differential: Option<TriggerConfig>,
    #[serde(default = "default_cleanup_trigger")]
    pub cleanup: Option<TriggerConfig>,
    #[serde(default = "default_integrity_trigger")]
    pub integrity: Option<TriggerConfig>,
    #[serde(default = "default_summary_trigger")]
    pub summary: Option<TriggerConfig>,
    /// Upper bound on one backup job, enforced between pipeline stages.
    #[serde(default = "default_job_timeout")]
    pub job_timeout: String,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            full: default_full_trigger(),
            incremental: None,
            differential: None,
            cleanup: default_cleanup_trigger(),
            integrity: default_integrity_trigger(),
            summary: default_summary_trigger(),
            job_timeout: default_job_timeout(),
        }
    }
}

impl ScheduleConfig {
    pub fn backup_trigger(&self, kind: BackupKind) -> Option<&TriggerConfig> {
        match kind {
            BackupKind::Full => self.full.as_ref(),
            BackupKind::Incremental => self.incremental.as_ref(),
            BackupKind::Differential => self.differential.as_ref(),
        }
    }

    pub fn job_timeout_duration(&self) -> Result<Duration> {
        parse_human_duration(&self.job_timeout)
    }

    fn validate(&self) -> Result<()> {
        let named = [
            ("full", &self.full),
            ("incremental", &self.incremental),
            ("differential", &self.differential),
            ("cleanup", &self.cleanup),
            ("integrity", &self.integrity),
            ("summary", &self.summary),
        ];
        for (name, trigger) in named {
            if let Some(t) = trigger {
                t.validate(name)?;
            }
        }
        self.job_timeout_duration()?;
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NotificationsConfig {
    /// Emit every event through the log.
    #[serde(default = "default_true")]
    pub log: bool,
    /// POST events as JSON to this URL.
    #[serde(default)]
    pub webhook_url: Option<String>,
    #[serde(default = "default_true")]
    pub on_success: bool,
    #[serde(default = "default_true")]
    pub on_failure: bool,
    #[serde(default = "default_true")]
    pub on_warning: bool,
    #[serde(default = "default_true")]
    pub on_summary: bool,
}

impl Default for NotificationsConfig {
    fn default() -> Self {
        Self {
            log: true,
            webhook_url: None,
            on_success: true,
            on_failure: true,
            on_warning: true,
            on_summary: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}
