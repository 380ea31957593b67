use std::fmt;

use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::error::{KeeperError, Result};

const PREFIX: &str = "backup-";

/// Backup identifier: `backup-<timestamp>-<8 hex>`.
///
/// The timestamp is ISO 8601 UTC with `:` and `.` collapsed to `-`, so ids
/// sort lexically by creation time.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BackupId(String);

impl BackupId {
    /// Generate a fresh id for a backup created at `now`.
    pub fn generate(now: DateTime<Utc>) -> Self {
        let mut suffix = [0u8; 4];
        rand::thread_rng().fill_bytes(&mut suffix);
        BackupId(format!(
            "{PREFIX}{}-{}",
            now.format("%Y-%m-%dT%H-%M-%S-%3fZ"),
            hex::encode(suffix)
        ))
    }

    /// Parse and validate an id read from storage or user input.
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        let Some(rest) = raw.strip_prefix(PREFIX) else {
            return Err(KeeperError::InvalidKey(format!(
                "backup id '{raw}' must start with '{PREFIX}'"
            )));
        };
        if rest.is_empty() {
            return Err(KeeperError::InvalidKey(format!("backup id '{raw}' is empty")));
        }
        if !rest
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(KeeperError::InvalidKey(format!(
                "backup id '{raw}' contains invalid characters"
            )));
        }
        Ok(BackupId(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for BackupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BackupId({})", self.0)
    }
}

impl fmt::Display for BackupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for BackupId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
