//! End-to-end runs through the public API with shell dump commands.

use std::path::Path;

use keeper_core::app::Services;
use keeper_core::config::{parse_config, KeeperConfig};
use keeper_core::error::KeeperError;
use keeper_core::scheduler::Scheduler;
use keeper_types::{BackupFormat, BackupKind, JobOptions};

fn config(base: &Path, export_command: &str, extra: &str) -> KeeperConfig {
    let yaml = format!(
        r#"
storage:
  local:
    base_path: "{base}/backups"
source:
  target: "mongodb://localhost/shop"
  format: structured-export
  ping_command: "true"
  collections: [orders, users, system.profile]
  export_command: >-
    {export_command}
  timeout: 30s
encryption:
  key_path: "{base}/keys"
schedule:
  enabled: false
notifications:
  log: true
{extra}
"#,
        base = base.display(),
    );
    parse_config(&yaml, "test").unwrap()
}

const EXPORT: &str = r#"printf '{"_id":1,"from":"%s"}\n{"_id":2}\n' {collection} > {output}"#;

#[tokio::test]
async fn export_backup_check_and_restore() {
    let tmp = tempfile::tempdir().unwrap();
    let config = config(tmp.path(), EXPORT, "");
    let services = Services::from_config(config).unwrap();
    let scheduler = Scheduler::start(services, false).unwrap();
    let handle = scheduler.handle();

    let check = handle.verify_configuration().await.unwrap();
    assert!(check.all_ok(), "{:?}", check.items);

    let record = handle
        .run_manual_backup(BackupKind::Full, None, JobOptions::default())
        .await
        .unwrap();
    assert_eq!(record.format, BackupFormat::StructuredExport);
    assert!(record.verified);

    let report = handle.check_backup(&record.id).await.unwrap();
    assert!(report.valid, "{:?}", report.errors);

    let dest = tmp.path().join("restored");
    handle.restore(&record.id, &dest).await.unwrap();
    let orders = std::fs::read_to_string(dest.join("orders.jsonl")).unwrap();
    assert!(orders.contains("\"from\":\"orders\""), "{orders}");
    assert!(dest.join("users.jsonl").is_file());
    // System collections are skipped unless asked for.
    assert!(!dest.join("system.profile.jsonl").exists());

    scheduler.stop().await;
}

#[tokio::test]
async fn encrypted_export_with_collection_filter() {
    let tmp = tempfile::tempdir().unwrap();
    let mut config = config(tmp.path(), EXPORT, "");
    config.encryption.enabled = true;
    let services = Services::from_config(config).unwrap();
    let scheduler = Scheduler::start(services, false).unwrap();
    let handle = scheduler.handle();

    let options = JobOptions {
        collections: vec!["users".into()],
        ..JobOptions::default()
    };
    let record = handle
        .run_manual_backup(BackupKind::Full, None, options)
        .await
        .unwrap();
    assert!(record.encrypted);
    assert!(record.artifact.ends_with(".enc"));

    let dest = tmp.path().join("restored");
    handle.restore(&record.id, &dest).await.unwrap();
    assert!(dest.join("users.jsonl").is_file());
    assert!(!dest.join("orders.jsonl").exists());
    scheduler.stop().await;
}

#[tokio::test]
async fn failing_export_surfaces_stderr() {
    let tmp = tempfile::tempdir().unwrap();
    let config = config(tmp.path(), "echo 'auth failed' >&2; exit 3", "");
    let services = Services::from_config(config).unwrap();
    let scheduler = Scheduler::start(services, false).unwrap();
    let handle = scheduler.handle();

    let err = handle
        .run_manual_backup(BackupKind::Full, None, JobOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, KeeperError::Acquisition(_)), "{err:?}");
    assert!(err.to_string().contains("auth failed"), "{err}");
    assert!(handle.list_backups().await.unwrap().is_empty());

    let stats = handle.get_stats().await.unwrap();
    assert_eq!(stats.failed_backups, 1);
    scheduler.stop().await;
}

#[tokio::test]
async fn retention_is_applied_from_config() {
    let tmp = tempfile::tempdir().unwrap();
    let extra = "retention:\n  full:\n    max_count: 2\n    min_count: 1\n";
    let config = config(tmp.path(), EXPORT, extra);
    let services = Services::from_config(config).unwrap();
    let scheduler = Scheduler::start(services, false).unwrap();
    let handle = scheduler.handle();

    let mut ids = Vec::new();
    for _ in 0..3 {
        let record = handle
            .run_manual_backup(BackupKind::Full, None, JobOptions::default())
            .await
            .unwrap();
        ids.push(record.id);
    }

    let kept: Vec<_> = handle
        .list_backups()
        .await
        .unwrap()
        .into_iter()
        .map(|r| r.id)
        .collect();
    assert_eq!(kept, ids[1..].to_vec());
    scheduler.stop().await;
}
