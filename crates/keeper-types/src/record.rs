use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::backup_id::BackupId;
use crate::error::{KeeperError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupKind {
    Full,
    Incremental,
    Differential,
}

impl BackupKind {
    pub const ALL: [BackupKind; 3] = [
        BackupKind::Full,
        BackupKind::Incremental,
        BackupKind::Differential,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            BackupKind::Full => "full",
            BackupKind::Incremental => "incremental",
            BackupKind::Differential => "differential",
        }
    }
}

impl fmt::Display for BackupKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackupKind {
    type Err = KeeperError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "full" => Ok(BackupKind::Full),
            "incremental" => Ok(BackupKind::Incremental),
            "differential" => Ok(BackupKind::Differential),
            other => Err(KeeperError::Config(format!("unknown backup kind '{other}'"))),
        }
    }
}

/// Shape of the raw payload produced by the dump collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackupFormat {
    /// Native dump: a directory tree of binary unit files plus metadata.
    Archive,
    /// One line-delimited JSON file per collection.
    StructuredExport,
}

impl fmt::Display for BackupFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackupFormat::Archive => f.write_str("archive"),
            BackupFormat::StructuredExport => f.write_str("structured-export"),
        }
    }
}

impl FromStr for BackupFormat {
    type Err = KeeperError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "archive" => Ok(BackupFormat::Archive),
            "structured-export" | "structured_export" | "export" => {
                Ok(BackupFormat::StructuredExport)
            }
            other => Err(KeeperError::Config(format!(
                "unknown backup format '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumAlgorithm {
    Sha256,
    Sha512,
    Blake2b,
}

impl ChecksumAlgorithm {
    pub fn as_str(self) -> &'static str {
        match self {
            ChecksumAlgorithm::Sha256 => "sha256",
            ChecksumAlgorithm::Sha512 => "sha512",
            ChecksumAlgorithm::Blake2b => "blake2b",
        }
    }
}

impl fmt::Display for ChecksumAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChecksumAlgorithm {
    type Err = KeeperError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sha256" => Ok(ChecksumAlgorithm::Sha256),
            "sha512" => Ok(ChecksumAlgorithm::Sha512),
            "blake2b" | "blake2b512" => Ok(ChecksumAlgorithm::Blake2b),
            other => Err(KeeperError::Config(format!(
                "unsupported checksum algorithm '{other}' (use sha256, sha512 or blake2b)"
            ))),
        }
    }
}

/// Hex digest plus the algorithm that produced it. The hex is always lowercase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checksum {
    pub algorithm: ChecksumAlgorithm,
    pub hex: String,
}

impl Checksum {
    pub fn new(algorithm: ChecksumAlgorithm, hex: impl Into<String>) -> Self {
        Self {
            algorithm,
            hex: hex.into().to_ascii_lowercase(),
        }
    }

    /// Case-insensitive comparison against a hex digest.
    pub fn matches(&self, other_hex: &str) -> bool {
        self.hex.eq_ignore_ascii_case(other_hex.trim())
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.hex)
    }
}

/// Compression codec applied to an artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Codec {
    Gzip,
    Zstd,
    Lz4,
}

impl Codec {
    pub fn as_str(self) -> &'static str {
        match self {
            Codec::Gzip => "gzip",
            Codec::Zstd => "zstd",
            Codec::Lz4 => "lz4",
        }
    }

    /// File extension appended after `.tar`.
    pub fn extension(self) -> &'static str {
        match self {
            Codec::Gzip => "gz",
            Codec::Zstd => "zst",
            Codec::Lz4 => "lz4",
        }
    }
}

impl fmt::Display for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactKind {
    File,
    Directory,
}

/// Where a provider put its copy of a backup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageLocation {
    pub provider: String,
    pub location: String,
    pub size: u64,
}

/// Durable metadata describing one backup execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupRecord {
    pub id: BackupId,
    pub created_at: DateTime<Utc>,
    pub kind: BackupKind,
    pub format: BackupFormat,
    /// Lower bound passed to the dump for incremental and differential jobs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since: Option<DateTime<Utc>>,
    /// File or directory name of the payload inside the backup directory.
    pub artifact: String,
    pub artifact_kind: ArtifactKind,
    /// Size of the payload as produced by the dump.
    pub raw_size: u64,
    /// Size of the artifact as stored, after compression and encryption.
    pub stored_size: u64,
    #[serde(default)]
    pub compression: Option<Codec>,
    pub encrypted: bool,
    #[serde(default)]
    pub checksum: Option<Checksum>,
    #[serde(default)]
    pub locations: Vec<StorageLocation>,
    #[serde(default)]
    pub verified: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verified_at: Option<DateTime<Utc>>,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl BackupRecord {
    /// Mark the record verified. Refused, and any earlier verification
    /// dropped, unless the recorded checksum was computed with `algorithm`.
    pub fn mark_verified(&mut self, at: DateTime<Utc>, algorithm: ChecksumAlgorithm) -> Result<()> {
        let refusal = match &self.checksum {
            None => Some("has no checksum".to_string()),
            Some(c) if c.algorithm != algorithm => Some(format!(
                "has a {} checksum but {algorithm} is configured",
                c.algorithm
            )),
            Some(_) => None,
        };
        if let Some(reason) = refusal {
            self.verified = false;
            self.verified_at = None;
            return Err(KeeperError::Other(format!(
                "backup '{}' {reason} and cannot be marked verified",
                self.id
            )));
        }
        self.verified = true;
        self.verified_at = Some(at);
        self.error = None;
        Ok(())
    }

    /// Flag the record unverified after a failed integrity check.
    pub fn mark_unverified(&mut self, reason: impl Into<String>) {
        self.verified = false;
        self.verified_at = None;
        self.error = Some(reason.into());
    }

    pub fn location(&self, provider: &str) -> Option<&StorageLocation> {
        self.locations.iter().find(|l| l.provider == provider)
    }

    pub fn age_days(&self, now: DateTime<Utc>) -> i64 {
        (now - self.created_at).num_days()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(checksum: Option<Checksum>) -> BackupRecord {
        let now = Utc::now();
        BackupRecord {
            id: BackupId::generate(now),
            created_at: now,
            kind: BackupKind::Full,
            format: BackupFormat::Archive,
            since: None,
            artifact: "payload.tar.gz".into(),
            artifact_kind: ArtifactKind::File,
            raw_size: 10,
            stored_size: 5,
            compression: Some(Codec::Gzip),
            encrypted: false,
            checksum,
            locations: Vec::new(),
            verified: false,
            verified_at: None,
            duration_ms: 1,
            warnings: Vec::new(),
            error: None,
        }
    }

    #[test]
    fn verified_requires_checksum() {
        let mut without = record(None);
        assert!(without.mark_verified(Utc::now(), ChecksumAlgorithm::Sha256).is_err());
        assert!(!without.verified);

        let mut with = record(Some(Checksum::new(ChecksumAlgorithm::Sha256, "AB")));
        with.mark_verified(Utc::now(), ChecksumAlgorithm::Sha256).unwrap();
        assert!(with.verified);
        assert!(with.verified_at.is_some());
    }

    #[test]
    fn verified_requires_configured_algorithm() {
        let mut r = record(Some(Checksum::new(ChecksumAlgorithm::Sha256, "AB")));
        r.mark_verified(Utc::now(), ChecksumAlgorithm::Sha256).unwrap();
        assert!(r.verified);

        let err = r
            .mark_verified(Utc::now(), ChecksumAlgorithm::Blake2b)
            .unwrap_err();
        assert!(err.to_string().contains("blake2b"), "{err}");
        assert!(!r.verified);
        assert!(r.verified_at.is_none());
    }

    #[test]
    fn checksum_hex_is_lowercase() {
        let c = Checksum::new(ChecksumAlgorithm::Sha512, "DEADBEEF");
        assert_eq!(c.hex, "deadbeef");
        assert!(c.matches("DeadBeef"));
        assert!(!c.matches("deadbeee"));
    }

    #[test]
    fn record_json_uses_stable_names() {
        let r = record(Some(Checksum::new(ChecksumAlgorithm::Blake2b, "00")));
        let json = serde_json::to_value(&r).unwrap();
        assert_eq!(json["kind"], "full");
        assert_eq!(json["format"], "archive");
        assert_eq!(json["compression"], "gzip");
        assert_eq!(json["checksum"]["algorithm"], "blake2b");
        let back: BackupRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back, r);
    }

    #[test]
    fn parse_names() {
        assert_eq!("Incremental".parse::<BackupKind>().unwrap(), BackupKind::Incremental);
        assert_eq!(
            "structured-export".parse::<BackupFormat>().unwrap(),
            BackupFormat::StructuredExport
        );
        assert!("md5".parse::<ChecksumAlgorithm>().is_err());
    }
}
