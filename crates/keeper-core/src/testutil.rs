use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use keeper_storage::{ProviderUsage, RecordScan, StorageProvider, StoredObject};
use keeper_types::{
    ArtifactKind, BackupFormat, BackupId, BackupKind, BackupRecord, KeeperError, Result,
};

use crate::app::Services;
use crate::config::{
    CompressionConfig, EncryptionConfig, IntegrityConfig, KeeperConfig, LocalStorageConfig,
    LoggingConfig, NotificationsConfig, RetentionConfig, ScheduleConfig, SourceConfig,
    StorageConfig,
};
use crate::dump::{inspect_output, DumpOutput, DumpRequest, DumpSource};
use crate::notify::{Event, Notifications, Notifier};

/// Config rooted under `base`, with timed triggers switched off.
pub fn make_test_config(base: &Path) -> KeeperConfig {
    KeeperConfig {
        storage: StorageConfig {
            local: LocalStorageConfig {
                name: "local".into(),
                base_path: base.join("backups").to_string_lossy().to_string(),
            },
            remote: Vec::new(),
        },
        source: SourceConfig {
            target: "mongodb://localhost/shop".into(),
            ..SourceConfig::default()
        },
        compression: CompressionConfig::default(),
        encryption: EncryptionConfig {
            enabled: false,
            key_path: base.join("keys").to_string_lossy().to_string(),
        },
        integrity: IntegrityConfig::default(),
        retention: RetentionConfig::default(),
        schedule: ScheduleConfig {
            enabled: false,
            ..ScheduleConfig::default()
        },
        notifications: NotificationsConfig {
            log: false,
            ..NotificationsConfig::default()
        },
        logging: LoggingConfig::default(),
    }
}

/// Real services from `config` with the dump replaced and every event recorded.
pub fn test_services(
    config: KeeperConfig,
    dump: Arc<dyn DumpSource>,
) -> (Services, Arc<RecordingNotifier>) {
    let recorder = Arc::new(RecordingNotifier::default());
    let notifications = Notifications::new(vec![recorder.clone()], config.notifications.clone());
    let services = Services::from_config(config)
        .unwrap()
        .with_dump(dump)
        .with_notifications(notifications);
    (services, recorder)
}

/// A record created `days` before `now`, for retention planning.
pub fn record_aged(kind: BackupKind, now: DateTime<Utc>, days: i64) -> BackupRecord {
    let created_at = now - chrono::Duration::days(days);
    BackupRecord {
        id: BackupId::generate(created_at),
        created_at,
        kind,
        format: BackupFormat::Archive,
        since: None,
        artifact: "payload.tar.gz".into(),
        artifact_kind: ArtifactKind::File,
        raw_size: 100,
        stored_size: 40,
        compression: Some(keeper_types::Codec::Gzip),
        encrypted: false,
        checksum: None,
        locations: Vec::new(),
        verified: false,
        verified_at: None,
        duration_ms: 5,
        warnings: Vec::new(),
        error: None,
    }
}

/// One BSON document holding a single int32 field `n`.
pub fn bson_doc(n: i32) -> Vec<u8> {
    let mut body = vec![0x10, b'n', 0];
    body.extend_from_slice(&n.to_le_bytes());
    let len = (4 + body.len() + 1) as i32;
    let mut out = len.to_le_bytes().to_vec();
    out.extend_from_slice(&body);
    out.push(0);
    out
}

#[derive(Default)]
pub struct RecordingNotifier {
    events: Mutex<Vec<Event>>,
}

impl RecordingNotifier {
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    fn name(&self) -> &str {
        "recording"
    }

    async fn notify(&self, event: &Event) {
        self.events.lock().unwrap().push(event.clone());
    }
}

/// Dump double that writes a small, well-formed payload in the requested
/// format and remembers every request it served.
pub struct FakeDumpSource {
    files: usize,
    lines: usize,
    bad_line: Option<usize>,
    delay: Option<Duration>,
    failure: Option<String>,
    requests: Mutex<Vec<DumpRequest>>,
}

impl FakeDumpSource {
    pub fn new() -> Self {
        Self {
            files: 3,
            lines: 50,
            bad_line: None,
            delay: None,
            failure: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn with_files(mut self, files: usize) -> Self {
        self.files = files;
        self
    }

    /// Corrupt line `line` (1-based) of the first export file.
    pub fn with_bad_line(mut self, line: usize) -> Self {
        self.bad_line = Some(line);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn failing(mut self, message: &str) -> Self {
        self.failure = Some(message.to_string());
        self
    }

    pub fn requests(&self) -> Vec<DumpRequest> {
        self.requests.lock().unwrap().clone()
    }

    fn write_payload(&self, request: &DumpRequest) -> Result<()> {
        let out = &request.output_dir;
        match request.format {
            BackupFormat::Archive => {
                let db = out.join("shop");
                std::fs::create_dir_all(&db)?;
                for i in 0..self.files {
                    let mut data = Vec::new();
                    for n in 0..10 {
                        data.extend(bson_doc(n));
                    }
                    std::fs::write(db.join(format!("coll{i}.bson")), data)?;
                }
            }
            BackupFormat::StructuredExport => {
                std::fs::create_dir_all(out)?;
                for i in 0..self.files {
                    let mut body = String::new();
                    for line in 1..=self.lines {
                        if i == 0 && self.bad_line == Some(line) {
                            body.push_str("{\"_id\": \n");
                        } else {
                            body.push_str(&format!("{{\"_id\":{line},\"name\":\"item {line}\"}}\n"));
                        }
                    }
                    std::fs::write(out.join(format!("coll{i}.jsonl")), body)?;
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl DumpSource for FakeDumpSource {
    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn dump(&self, request: &DumpRequest) -> Result<DumpOutput> {
        self.requests.lock().unwrap().push(request.clone());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(message) = &self.failure {
            // Fail after writing, the way an interrupted dump leaves files behind.
            self.write_payload(request)?;
            return Err(KeeperError::Acquisition(message.clone()));
        }
        self.write_payload(request)?;
        inspect_output(&request.output_dir).await
    }
}

/// Remote double holding artifacts in memory.
pub struct MemoryProvider {
    name: String,
    objects: Mutex<BTreeMap<BackupId, (BackupRecord, Vec<(PathBuf, Vec<u8>)>)>>,
}

impl MemoryProvider {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            objects: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn stored_count(&self) -> usize {
        self.objects.lock().unwrap().len()
    }
}

fn read_payload(payload: &Path) -> Result<Vec<(PathBuf, Vec<u8>)>> {
    if payload.is_file() {
        return Ok(vec![(PathBuf::new(), std::fs::read(payload)?)]);
    }
    let mut files = Vec::new();
    for entry in walkdir::WalkDir::new(payload).sort_by_file_name() {
        let entry = entry.map_err(|e| KeeperError::Other(e.to_string()))?;
        if entry.file_type().is_file() {
            let rel = entry
                .path()
                .strip_prefix(payload)
                .map_err(|e| KeeperError::Other(e.to_string()))?
                .to_path_buf();
            files.push((rel, std::fs::read(entry.path())?));
        }
    }
    Ok(files)
}

#[async_trait]
impl StorageProvider for MemoryProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn store(&self, payload: &Path, record: &BackupRecord) -> Result<StoredObject> {
        let files = read_payload(payload)?;
        let size = files.iter().map(|(_, d)| d.len() as u64).sum();
        let mut objects = self.objects.lock().unwrap();
        if objects.contains_key(&record.id) {
            return Err(KeeperError::ObjectExists(record.id.to_string()));
        }
        objects.insert(record.id.clone(), (record.clone(), files));
        Ok(StoredObject {
            location: format!("mem://{}/{}", self.name, record.id),
            size,
        })
    }

    async fn retrieve(&self, id: &BackupId, destination: &Path) -> Result<u64> {
        let objects = self.objects.lock().unwrap();
        let (record, files) = objects
            .get(id)
            .ok_or_else(|| KeeperError::BackupNotFound(id.to_string()))?;
        let mut total = 0;
        for (rel, data) in files {
            let target = match record.artifact_kind {
                ArtifactKind::File => destination.to_path_buf(),
                ArtifactKind::Directory => destination.join(rel),
            };
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&target, data)?;
            total += data.len() as u64;
        }
        Ok(total)
    }

    async fn put_record(&self, record: &BackupRecord) -> Result<()> {
        let mut objects = self.objects.lock().unwrap();
        match objects.get_mut(&record.id) {
            Some(entry) => {
                entry.0 = record.clone();
                Ok(())
            }
            None => Err(KeeperError::BackupNotFound(record.id.to_string())),
        }
    }

    async fn get_record(&self, id: &BackupId) -> Result<Option<BackupRecord>> {
        Ok(self.objects.lock().unwrap().get(id).map(|(r, _)| r.clone()))
    }

    async fn scan(&self) -> Result<RecordScan> {
        let mut records: Vec<_> = self
            .objects
            .lock()
            .unwrap()
            .values()
            .map(|(r, _)| r.clone())
            .collect();
        keeper_storage::sort_records(&mut records);
        Ok(RecordScan {
            records,
            unreadable: Vec::new(),
        })
    }

    async fn delete(&self, id: &BackupId) -> Result<()> {
        self.objects.lock().unwrap().remove(id);
        Ok(())
    }

    async fn usage(&self) -> Result<ProviderUsage> {
        let objects = self.objects.lock().unwrap();
        Ok(ProviderUsage {
            backups: objects.len(),
            bytes: objects
                .values()
                .flat_map(|(_, files)| files.iter().map(|(_, d)| d.len() as u64))
                .sum(),
        })
    }

    async fn probe(&self) -> Result<()> {
        Ok(())
    }
}

/// Remote that is unreachable: every network call is refused.
pub struct FailingProvider {
    name: String,
}

impl FailingProvider {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
        }
    }

    fn refused(&self) -> KeeperError {
        KeeperError::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            format!("{}: connection refused", self.name),
        ))
    }
}

#[async_trait]
impl StorageProvider for FailingProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn store(&self, _payload: &Path, _record: &BackupRecord) -> Result<StoredObject> {
        Err(self.refused())
    }

    async fn retrieve(&self, _id: &BackupId, _destination: &Path) -> Result<u64> {
        Err(self.refused())
    }

    async fn put_record(&self, _record: &BackupRecord) -> Result<()> {
        Err(self.refused())
    }

    async fn get_record(&self, _id: &BackupId) -> Result<Option<BackupRecord>> {
        Err(self.refused())
    }

    async fn scan(&self) -> Result<RecordScan> {
        Err(self.refused())
    }

    async fn delete(&self, _id: &BackupId) -> Result<()> {
        Err(self.refused())
    }

    async fn usage(&self) -> Result<ProviderUsage> {
        Err(self.refused())
    }

    async fn probe(&self) -> Result<()> {
        Err(self.refused())
    }
}
