pub mod backup_id;
pub mod error;
pub mod job;
pub mod record;
pub mod report;

pub use backup_id::BackupId;
pub use error::{KeeperError, Result, Stage};
pub use job::{BackupJob, JobOptions, JobTrigger};
pub use record::{
    ArtifactKind, BackupFormat, BackupKind, BackupRecord, Checksum, ChecksumAlgorithm, Codec,
    StorageLocation,
};
pub use report::{CheckOutcome, CheckStatus, IntegrityReport};
