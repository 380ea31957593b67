use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use keeper_types::{BackupId, BackupJob, Stage};

use crate::error::{KeeperError, Result};

/// Directory under the local base path that holds in-flight jobs. The
/// leading dot keeps it out of backup listings.
pub const STAGING_DIR: &str = ".staging";
pub const FAILURE_FILE: &str = "failure.json";

/// Written next to the partial artifacts of a failed job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureRecord {
    pub job: BackupJob,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<Stage>,
    pub error: String,
    pub failed_at: DateTime<Utc>,
    pub elapsed_ms: u64,
}

/// Scratch space for one job.
#[derive(Debug)]
pub struct Staging {
    dir: PathBuf,
}

impl Staging {
    pub fn root(base: &Path) -> PathBuf {
        base.join(STAGING_DIR)
    }

    pub fn create(root: &Path, id: &BackupId) -> Result<Self> {
        fs::create_dir_all(root)?;
        let dir = root.join(id.as_str());
        match fs::create_dir(&dir) {
            Ok(()) => Ok(Self { dir }),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                Err(KeeperError::ObjectExists(dir.display().to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Where the dump collaborator writes the raw payload.
    pub fn dump_dir(&self) -> PathBuf {
        self.dir.join("dump")
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    pub fn record_failure(&self, failure: &FailureRecord) -> Result<PathBuf> {
        let path = self.dir.join(FAILURE_FILE);
        fs::write(&path, serde_json::to_vec_pretty(failure)?)?;
        Ok(path)
    }

    /// Remove everything but the failure record.
    pub fn discard_payload(&self) -> Result<()> {
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            if entry.file_name() == FAILURE_FILE {
                continue;
            }
            if entry.file_type()?.is_dir() {
                fs::remove_dir_all(entry.path())?;
            } else {
                fs::remove_file(entry.path())?;
            }
        }
        Ok(())
    }

    pub fn discard(self) -> Result<()> {
        match fs::remove_dir_all(&self.dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Failure records left behind by earlier jobs, oldest first.
pub fn list_failures(root: &Path) -> Result<Vec<FailureRecord>> {
    let entries = match fs::read_dir(root) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut out = Vec::new();
    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let path = entry.path().join(FAILURE_FILE);
        match fs::read(&path) {
            Ok(data) => match serde_json::from_slice::<FailureRecord>(&data) {
                Ok(record) => out.push(record),
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "unreadable failure record"),
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }
    out.sort_by(|a, b| a.failed_at.cmp(&b.failed_at));
    Ok(out)
}
