use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use keeper_storage::{LocalProvider, StorageProvider};
use keeper_types::{
    ArtifactKind, BackupFormat, BackupJob, BackupKind, Codec, JobOptions, JobTrigger, KeeperError,
    Stage,
};

use crate::app::Services;
use crate::config::{KeeperConfig, RetentionPolicy};
use crate::crypto::EncryptionKey;
use crate::engine::{list_failures, BackupEngine, DIRECTORY_ARTIFACT, FAILURE_FILE};
use crate::scheduler::Operations;
use crate::storage::StorageManager;
use crate::testutil::{make_test_config, test_services, FailingProvider, FakeDumpSource, MemoryProvider};

fn job(kind: BackupKind) -> BackupJob {
    BackupJob::new(kind, BackupFormat::Archive, JobOptions::default(), JobTrigger::Manual)
}

fn with_remotes(config: &KeeperConfig, remotes: Vec<Arc<dyn StorageProvider>>) -> StorageManager {
    let local = LocalProvider::new("local", config.storage.local.base_path()).unwrap();
    StorageManager::new(Arc::new(local), remotes)
}

fn setup(config: KeeperConfig, dump: FakeDumpSource) -> (Services, Arc<FakeDumpSource>) {
    let dump = Arc::new(dump);
    let (services, _) = test_services(config, dump.clone());
    (services, dump)
}

fn count_files(dir: &Path) -> usize {
    walkdir::WalkDir::new(dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .count()
}

#[tokio::test]
async fn full_backup_round_trip() {
    let tmp = tempfile::tempdir().unwrap();
    let (services, _) = setup(make_test_config(tmp.path()), FakeDumpSource::new());
    let engine = BackupEngine::new(&services).unwrap();

    let record = engine.run(job(BackupKind::Full)).await.unwrap();
    assert!(record.artifact.ends_with(".tar.gz"), "{}", record.artifact);
    assert!(record.artifact.starts_with(record.id.as_str()));
    assert_eq!(record.artifact_kind, ArtifactKind::File);
    assert_eq!(record.compression, Some(Codec::Gzip));
    assert!(!record.encrypted);
    assert!(record.checksum.is_some());
    assert_eq!(record.locations.len(), 1);
    assert_eq!(record.locations[0].provider, "local");
    assert!(record.warnings.is_empty(), "{:?}", record.warnings);

    // Staging is cleaned up after a successful run.
    assert!(!engine.staging_root().join(record.id.as_str()).exists());

    let listed = services.storage.list().await.unwrap();
    assert_eq!(listed, vec![record.clone()]);

    let ops = Operations::new(services.clone());
    let dest = tmp.path().join("restore");
    let restored = ops.restore(&record.id, &dest).await.unwrap();
    assert_eq!(restored.bytes, record.raw_size);
    assert_eq!(restored.provider, "local");
    assert_eq!(count_files(&dest), 3);
    assert!(dest.join("shop/coll0.bson").is_file());

    let mut stored = services.storage.get_record(&record.id).await.unwrap();
    let report = ops.verify_record(&mut stored).await.unwrap();
    assert!(report.valid, "{:?}", report.errors);
    assert!(services.storage.get_record(&record.id).await.unwrap().verified);
}

#[tokio::test]
async fn verification_only_touches_verification_fields() {
    let tmp = tempfile::tempdir().unwrap();
    let (services, _) = setup(make_test_config(tmp.path()), FakeDumpSource::new());
    let engine = BackupEngine::new(&services).unwrap();
    let record = engine.run(job(BackupKind::Full)).await.unwrap();

    // A sweep picks up this copy, then the engine finishes writing the record.
    let mut stale = services.storage.get_record(&record.id).await.unwrap();
    let mut current = record.clone();
    current.warnings.push("offsite: slow".into());
    current.locations.push(keeper_types::StorageLocation {
        provider: "offsite".into(),
        location: "s3://backups/x".into(),
        size: record.stored_size,
    });
    services.storage.put_record(&current).await.unwrap();

    let ops = Operations::new(services.clone());
    let report = ops.verify_record(&mut stale).await.unwrap();
    assert!(report.valid, "{:?}", report.errors);

    let stored = services.storage.get_record(&record.id).await.unwrap();
    assert!(stored.verified);
    assert_eq!(stored.warnings, current.warnings);
    assert_eq!(stored.locations.len(), 2);
    assert_eq!(stale, stored);

    // Once deleted, a late metadata update neither succeeds nor recreates the directory.
    services.storage.delete(&stored).await.unwrap();
    let err = services
        .storage
        .update_record(&record.id, |r| r.verified = false)
        .await
        .unwrap_err();
    assert!(matches!(err, KeeperError::BackupNotFound(_)), "{err:?}");
    assert!(!tmp.path().join("backups").join(record.id.as_str()).exists());
}

#[tokio::test]
async fn encrypted_backup_uses_generated_key() {
    let tmp = tempfile::tempdir().unwrap();
    let mut config = make_test_config(tmp.path());
    config.encryption.enabled = true;
    config.compression.algorithm = Codec::Zstd;
    let key_dir = config.encryption.key_dir();
    let (services, _) = setup(config, FakeDumpSource::new());
    assert!(EncryptionKey::key_file(&key_dir).is_file());

    let engine = BackupEngine::new(&services).unwrap();
    let record = engine.run(job(BackupKind::Full)).await.unwrap();
    assert!(record.artifact.ends_with(".tar.zst.enc"), "{}", record.artifact);
    assert!(record.encrypted);

    let ops = Operations::new(services.clone());
    let report = ops.verify_one(&record.id).await.unwrap();
    assert!(report.valid, "{:?}", report.errors);
    assert!(report.restorability.is_ok());

    // Only the encrypted artifact is kept next to the metadata.
    let dir = services.storage.artifact_path(&record).unwrap();
    let siblings: Vec<_> = std::fs::read_dir(dir.parent().unwrap())
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
        .collect();
    assert_eq!(siblings.len(), 2, "{siblings:?}");
}

#[tokio::test]
async fn plain_backup_is_stored_as_directory() {
    let tmp = tempfile::tempdir().unwrap();
    let mut config = make_test_config(tmp.path());
    config.compression.enabled = false;
    let (services, _) = setup(config, FakeDumpSource::new());
    let engine = BackupEngine::new(&services).unwrap();

    let record = engine.run(job(BackupKind::Full)).await.unwrap();
    assert_eq!(record.artifact, DIRECTORY_ARTIFACT);
    assert_eq!(record.artifact_kind, ArtifactKind::Directory);
    assert_eq!(record.stored_size, record.raw_size);

    let ops = Operations::new(services);
    let report = ops.verify_one(&record.id).await.unwrap();
    assert!(report.valid, "{:?}", report.errors);
    assert!(report.checksum.is_ok());
    assert!(report.structure.is_ok());
}

#[tokio::test]
async fn remote_failure_becomes_warning() {
    let tmp = tempfile::tempdir().unwrap();
    let config = make_test_config(tmp.path());
    let offsite: Arc<dyn StorageProvider> = Arc::new(FailingProvider::new("offsite"));
    let storage = with_remotes(&config, vec![offsite]);
    let (services, _) = setup(config, FakeDumpSource::new());
    let services = services.with_storage(storage);
    let engine = BackupEngine::new(&services).unwrap();

    let record = engine.run(job(BackupKind::Full)).await.unwrap();
    assert_eq!(record.locations.len(), 1);
    assert_eq!(record.warnings.len(), 1);
    assert!(record.warnings[0].contains("offsite"), "{:?}", record.warnings);

    // The persisted record carries the warning too.
    let stored = services.storage.get_record(&record.id).await.unwrap();
    assert_eq!(stored.warnings, record.warnings);
}

#[tokio::test]
async fn remote_replica_receives_copy() {
    let tmp = tempfile::tempdir().unwrap();
    let config = make_test_config(tmp.path());
    let mirror = Arc::new(MemoryProvider::new("mirror"));
    let remote: Arc<dyn StorageProvider> = mirror.clone();
    let storage = with_remotes(&config, vec![remote]);
    let (services, _) = setup(config, FakeDumpSource::new());
    let services = services.with_storage(storage);
    let engine = BackupEngine::new(&services).unwrap();

    let record = engine.run(job(BackupKind::Full)).await.unwrap();
    let providers: Vec<_> = record.locations.iter().map(|l| l.provider.as_str()).collect();
    assert_eq!(providers, vec!["local", "mirror"]);
    assert_eq!(mirror.stored_count(), 1);
    assert_eq!(record.location("mirror").unwrap().size, record.stored_size);
}

#[tokio::test]
async fn timeout_leaves_failure_record() {
    let tmp = tempfile::tempdir().unwrap();
    let mut config = make_test_config(tmp.path());
    config.schedule.job_timeout = "1s".into();
    let dump = FakeDumpSource::new().with_delay(Duration::from_millis(1500));
    let (services, _) = setup(config, dump);
    let engine = BackupEngine::new(&services).unwrap();

    let job = job(BackupKind::Full);
    let err = engine.run(job.clone()).await.unwrap_err();
    assert!(
        matches!(err, KeeperError::Timeout { stage: Stage::Compress, .. }),
        "{err:?}"
    );

    let staging = engine.staging_root().join(job.id.as_str());
    assert!(staging.join(FAILURE_FILE).is_file());
    let failures = list_failures(engine.staging_root()).unwrap();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].job.id, job.id);
    assert_eq!(failures[0].stage, Some(Stage::Compress));
    assert!(services.storage.list().await.unwrap().is_empty());
}

#[tokio::test]
async fn failed_dump_is_attributed_to_acquire() {
    let tmp = tempfile::tempdir().unwrap();
    let dump = FakeDumpSource::new().failing("mongodump exited with status 1");
    let (services, _) = setup(make_test_config(tmp.path()), dump);
    let engine = BackupEngine::new(&services).unwrap();

    let job = job(BackupKind::Full);
    let err = engine.run(job.clone()).await.unwrap_err();
    assert!(matches!(err, KeeperError::Acquisition(_)), "{err:?}");

    let failures = list_failures(engine.staging_root()).unwrap();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].stage, Some(Stage::Acquire));
    assert!(failures[0].error.contains("status 1"));

    // Nothing but the failure record is left behind.
    let staging = engine.staging_root().join(job.id.as_str());
    let left: Vec<_> = std::fs::read_dir(&staging)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
        .collect();
    assert_eq!(left, vec![FAILURE_FILE.to_string()]);
}

#[tokio::test]
async fn since_follows_backup_kind() {
    let tmp = tempfile::tempdir().unwrap();
    let (services, dump) = setup(make_test_config(tmp.path()), FakeDumpSource::new());
    let engine = BackupEngine::new(&services).unwrap();

    let full = engine.run(job(BackupKind::Full)).await.unwrap();
    let incr = engine.run(job(BackupKind::Incremental)).await.unwrap();
    let diff = engine.run(job(BackupKind::Differential)).await.unwrap();
    let incr2 = engine.run(job(BackupKind::Incremental)).await.unwrap();

    let requests = dump.requests();
    assert_eq!(requests.len(), 4);
    assert_eq!(requests[0].since, None);
    assert_eq!(requests[1].since, Some(full.created_at));
    // Differentials always reach back to the last full backup.
    assert_eq!(requests[2].since, Some(full.created_at));
    assert_eq!(requests[3].since, Some(diff.created_at));
    assert_eq!(incr.since, Some(full.created_at));
    assert_eq!(incr2.since, Some(diff.created_at));
}

#[tokio::test]
async fn retention_runs_after_each_backup() {
    let tmp = tempfile::tempdir().unwrap();
    let mut config = make_test_config(tmp.path());
    config.retention.full = RetentionPolicy {
        max_age_days: None,
        max_count: Some(1),
        min_count: Some(1),
    };
    let (services, _) = setup(config, FakeDumpSource::new());
    let engine = BackupEngine::new(&services).unwrap();

    let first = engine.run(job(BackupKind::Full)).await.unwrap();
    let second = engine.run(job(BackupKind::Full)).await.unwrap();

    let ids: Vec<_> = services
        .storage
        .list()
        .await
        .unwrap()
        .into_iter()
        .map(|r| r.id)
        .collect();
    assert_eq!(ids, vec![second.id]);
    assert!(services.storage.get_record(&first.id).await.is_err());
}
