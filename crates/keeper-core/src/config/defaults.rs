use std::time::Duration;

use keeper_types::{BackupFormat, ChecksumAlgorithm, Codec};

use super::types::{LogFormat, RetentionPolicy, TriggerConfig};
use crate::error::{KeeperError, Result};

pub(super) fn default_true() -> bool {
    true
}

pub(super) fn default_local_provider_name() -> String {
    "local".to_string()
}

pub(super) fn default_region() -> String {
    "us-east-1".to_string()
}

pub(super) fn default_format() -> BackupFormat {
    BackupFormat::Archive
}

pub(super) fn default_dump_timeout() -> String {
    "1h".to_string()
}

pub(super) fn default_codec() -> Codec {
    Codec::Gzip
}

pub(super) fn default_key_path() -> String {
    "./keys".to_string()
}

pub(super) fn default_checksum_algorithm() -> ChecksumAlgorithm {
    ChecksumAlgorithm::Sha256
}

pub(super) fn default_full_retention() -> RetentionPolicy {
    RetentionPolicy {
        max_age_days: Some(30),
        max_count: Some(10),
        min_count: Some(3),
    }
}

pub(super) fn default_incremental_retention() -> RetentionPolicy {
    RetentionPolicy {
        max_age_days: Some(7),
        max_count: Some(48),
        min_count: Some(1),
    }
}

pub(super) fn default_differential_retention() -> RetentionPolicy {
    RetentionPolicy {
        max_age_days: Some(14),
        max_count: Some(14),
        min_count: Some(1),
    }
}

pub(super) fn default_full_trigger() -> Option<TriggerConfig> {
    Some(TriggerConfig::every("24h"))
}

pub(super) fn default_cleanup_trigger() -> Option<TriggerConfig> {
    Some(TriggerConfig::daily_at("02:00"))
}

pub(super) fn default_integrity_trigger() -> Option<TriggerConfig> {
    Some(TriggerConfig::every("7d"))
}

pub(super) fn default_summary_trigger() -> Option<TriggerConfig> {
    Some(TriggerConfig::daily_at("23:00"))
}

pub(super) fn default_job_timeout() -> String {
    "30m".to_string()
}

pub(super) fn default_log_level() -> String {
    "info".to_string()
}

pub(super) fn default_log_format() -> LogFormat {
    LogFormat::Pretty
}

/// Parse a simple duration string like "45s", "30m", "4h" or "2d".
/// A bare number is seconds.
pub fn parse_human_duration(raw: &str) -> Result<Duration> {
    let input = raw.trim();
    if input.is_empty() {
        return Err(KeeperError::Config("duration must not be empty".into()));
    }

    let (num_part, unit) = match input.chars().last() {
        Some(c) if c.is_ascii_alphabetic() => (&input[..input.len() - 1], Some(c)),
        _ => (input, None),
    };

    let value: u64 = num_part
        .trim()
        .parse()
        .map_err(|_| KeeperError::Config(format!("invalid duration value: '{raw}'")))?;

    let secs = match unit {
        None | Some('s') | Some('S') => value,
        Some('m') | Some('M') => value.saturating_mul(60),
        Some('h') | Some('H') => value.saturating_mul(60 * 60),
        Some('d') | Some('D') => value.saturating_mul(60 * 60 * 24),
        Some(other) => {
            return Err(KeeperError::Config(format!(
                "unsupported duration suffix '{other}' in '{raw}' (use s/m/h/d)"
            )));
        }
    };

    if secs == 0 {
        return Err(KeeperError::Config(
            "duration must be greater than zero".into(),
        ));
    }

    Ok(Duration::from_secs(secs))
}

/// Parse a `HH:MM` wall-clock time (UTC).
pub fn parse_daily_at(raw: &str) -> Result<(u32, u32)> {
    let bad = || KeeperError::Config(format!("invalid daily_at '{raw}': expected HH:MM"));
    let (h, m) = raw.trim().split_once(':').ok_or_else(bad)?;
    let hour: u32 = h.parse().map_err(|_| bad())?;
    let minute: u32 = m.parse().map_err(|_| bad())?;
    if hour > 23 || minute > 59 || m.len() != 2 {
        return Err(bad());
    }
    Ok((hour, minute))
}
