use std::fs;
use std::io::Write;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;

use keeper_types::{ArtifactKind, BackupId, BackupRecord, KeeperError, Result};

use crate::{
    sort_records, ProviderUsage, RecordScan, StorageProvider, StoredObject, UnreadableRecord,
    METADATA_FILE,
};

/// Directories under the root that never hold backups.
const RESERVED_PREFIX: char = '.';

/// Provider of record: one directory per backup under `root`.
///
/// ```text
/// <root>/<backup id>/<artifact>
/// <root>/<backup id>/metadata.json
/// ```
#[derive(Clone)]
pub struct LocalProvider {
    name: String,
    root: PathBuf,
}

impl LocalProvider {
    pub fn new(name: impl Into<String>, root: impl Into<PathBuf>) -> Result<Self> {
        let root_path: PathBuf = root.into();
        if root_path.as_os_str().is_empty() {
            return Err(KeeperError::Config("local base path must not be empty".into()));
        }
        // Canonicalize when possible so symlinked roots report stable locations.
        let root = if root_path.exists() {
            fs::canonicalize(&root_path)?
        } else {
            root_path
        };
        Ok(Self {
            name: name.into(),
            root,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Reject artifact names that could escape the backup directory.
    fn validate_component(name: &str) -> Result<()> {
        if name.is_empty() {
            return Err(KeeperError::InvalidKey("empty".into()));
        }
        if name.starts_with('/') || name.contains('\\') {
            return Err(KeeperError::InvalidKey(format!("absolute or backslash '{name}'")));
        }
        for component in Path::new(name).components() {
            if component == Component::ParentDir {
                return Err(KeeperError::InvalidKey(format!("parent traversal '{name}'")));
            }
        }
        Ok(())
    }

    fn backup_dir(&self, id: &BackupId) -> PathBuf {
        self.root.join(id.as_str())
    }

    fn artifact_path(&self, record: &BackupRecord) -> Result<PathBuf> {
        Self::validate_component(&record.artifact)?;
        Ok(self.backup_dir(&record.id).join(&record.artifact))
    }

    fn metadata_path(&self, id: &BackupId) -> PathBuf {
        self.backup_dir(id).join(METADATA_FILE)
    }

    fn read_record(path: &Path) -> Result<Option<BackupRecord>> {
        match fs::read(path) {
            Ok(data) => Ok(Some(serde_json::from_slice(&data)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn write_record(&self, record: &BackupRecord) -> Result<()> {
        let path = self.metadata_path(&record.id);
        let data = serde_json::to_vec_pretty(record)?;
        atomic_write(&path, &data)
    }

    fn store_blocking(&self, payload: &Path, record: &BackupRecord) -> Result<StoredObject> {
        let dest = self.artifact_path(record)?;
        let dir = self.backup_dir(&record.id);
        fs::create_dir_all(&dir)?;

        let size = match record.artifact_kind {
            ArtifactKind::File => copy_file_noclobber(payload, &dest)?,
            ArtifactKind::Directory => {
                if dest.exists() {
                    return Err(KeeperError::ObjectExists(dest.display().to_string()));
                }
                let staging = tempfile::Builder::new()
                    .prefix(".incoming-")
                    .tempdir_in(&dir)?;
                let size = copy_tree(payload, staging.path())?;
                fs::rename(staging.path(), &dest)?;
                size
            }
        };

        self.write_record(record)?;
        Ok(StoredObject {
            location: dest.display().to_string(),
            size,
        })
    }

    fn retrieve_blocking(&self, id: &BackupId, destination: &Path) -> Result<u64> {
        let record = Self::read_record(&self.metadata_path(id))?
            .ok_or_else(|| KeeperError::BackupNotFound(id.to_string()))?;
        let src = self.artifact_path(&record)?;
        if !src.exists() {
            return Err(KeeperError::BackupNotFound(format!(
                "{id}: artifact '{}' missing",
                src.display()
            )));
        }
        match record.artifact_kind {
            ArtifactKind::File => {
                if let Some(parent) = destination.parent() {
                    fs::create_dir_all(parent)?;
                }
                Ok(fs::copy(&src, destination)?)
            }
            ArtifactKind::Directory => {
                fs::create_dir_all(destination)?;
                copy_tree(&src, destination)
            }
        }
    }

    fn scan_blocking(&self) -> Result<RecordScan> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(RecordScan::default()),
            Err(e) => return Err(e.into()),
        };

        let mut scan = RecordScan::default();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with(RESERVED_PREFIX) {
                continue;
            }
            match Self::read_record(&entry.path().join(METADATA_FILE)) {
                Ok(Some(record)) => scan.records.push(record),
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(backup = %name, error = %e, "unreadable metadata");
                    scan.unreadable.push(UnreadableRecord {
                        backup: name.into_owned(),
                        error: e.to_string(),
                    });
                }
            }
        }
        sort_records(&mut scan.records);
        scan.unreadable.sort_by(|a, b| a.backup.cmp(&b.backup));
        Ok(scan)
    }

    fn delete_blocking(&self, id: &BackupId) -> Result<()> {
        match fs::remove_dir_all(self.backup_dir(id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn probe_blocking(&self) -> Result<()> {
        fs::create_dir_all(&self.root)?;
        let mut probe = tempfile::NamedTempFile::new_in(&self.root)?;
        probe.write_all(b"probe")?;
        Ok(())
    }
}

#[async_trait]
impl StorageProvider for LocalProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn store(&self, payload: &Path, record: &BackupRecord) -> Result<StoredObject> {
        let this = self.clone();
        let payload = payload.to_path_buf();
        let record = record.clone();
        blocking(move || this.store_blocking(&payload, &record)).await
    }

    async fn retrieve(&self, id: &BackupId, destination: &Path) -> Result<u64> {
        let this = self.clone();
        let id = id.clone();
        let destination = destination.to_path_buf();
        blocking(move || this.retrieve_blocking(&id, &destination)).await
    }

    async fn put_record(&self, record: &BackupRecord) -> Result<()> {
        if !self.backup_dir(&record.id).is_dir() {
            return Err(KeeperError::BackupNotFound(record.id.to_string()));
        }
        let this = self.clone();
        let record = record.clone();
        blocking(move || this.write_record(&record)).await
    }

    async fn get_record(&self, id: &BackupId) -> Result<Option<BackupRecord>> {
        let path = self.metadata_path(id);
        blocking(move || Self::read_record(&path)).await
    }

    async fn scan(&self) -> Result<RecordScan> {
        let this = self.clone();
        blocking(move || this.scan_blocking()).await
    }

    async fn delete(&self, id: &BackupId) -> Result<()> {
        let this = self.clone();
        let id = id.clone();
        blocking(move || this.delete_blocking(&id)).await
    }

    async fn usage(&self) -> Result<ProviderUsage> {
        let records = self.list().await?;
        Ok(ProviderUsage {
            backups: records.len(),
            bytes: records.iter().map(|r| r.stored_size).sum(),
        })
    }

    async fn probe(&self) -> Result<()> {
        let this = self.clone();
        blocking(move || this.probe_blocking()).await
    }

    fn local_artifact_path(&self, record: &BackupRecord) -> Option<PathBuf> {
        self.artifact_path(record).ok()
    }
}

async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| KeeperError::Other(format!("storage task panicked: {e}")))?
}

/// Write to a temp file in the same directory, then atomically rename into place.
fn atomic_write(path: &Path, data: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| KeeperError::InvalidKey(format!("no parent for '{}'", path.display())))?;
    fs::create_dir_all(dir)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(data)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Copy a file next to `dest` and link it into place, failing if `dest` exists.
fn copy_file_noclobber(src: &Path, dest: &Path) -> Result<u64> {
    let dir = dest
        .parent()
        .ok_or_else(|| KeeperError::InvalidKey(format!("no parent for '{}'", dest.display())))?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    let mut input = fs::File::open(src)?;
    let size = std::io::copy(&mut input, tmp.as_file_mut())?;
    tmp.as_file().sync_all()?;
    tmp.persist_noclobber(dest).map_err(|e| {
        if e.error.kind() == std::io::ErrorKind::AlreadyExists {
            KeeperError::ObjectExists(dest.display().to_string())
        } else {
            KeeperError::Io(e.error)
        }
    })?;
    Ok(size)
}

/// Recursively copy a directory tree. Returns total bytes copied.
pub(crate) fn copy_tree(src: &Path, dest: &Path) -> Result<u64> {
    let mut total = 0u64;
    for entry in walkdir::WalkDir::new(src).follow_links(false) {
        let entry = entry.map_err(|e| KeeperError::Other(format!("walk '{}': {e}", src.display())))?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| KeeperError::Other(e.to_string()))?;
        let target = dest.join(rel);
        let file_type = entry.file_type();
        if file_type.is_dir() {
            fs::create_dir_all(&target)?;
        } else if file_type.is_file() {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            total += fs::copy(entry.path(), &target)?;
        }
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use keeper_types::{BackupFormat, BackupKind};

    fn record(artifact: &str, kind: ArtifactKind) -> BackupRecord {
        let now = Utc::now();
        BackupRecord {
            id: BackupId::generate(now),
            created_at: now,
            kind: BackupKind::Full,
            format: BackupFormat::Archive,
            since: None,
            artifact: artifact.into(),
            artifact_kind: kind,
            raw_size: 0,
            stored_size: 0,
            compression: None,
            encrypted: false,
            checksum: None,
            locations: Vec::new(),
            verified: false,
            verified_at: None,
            duration_ms: 0,
            warnings: Vec::new(),
            error: None,
        }
    }

    #[tokio::test]
    async fn store_then_retrieve_file() {
        let tmp = tempfile::tempdir().unwrap();
        let provider = LocalProvider::new("local", tmp.path().join("store")).unwrap();
        let payload = tmp.path().join("payload.bin");
        fs::write(&payload, b"hello backup").unwrap();

        let rec = record("payload.bin", ArtifactKind::File);
        let stored = provider.store(&payload, &rec).await.unwrap();
        assert_eq!(stored.size, 12);

        let out = tmp.path().join("out").join("restored.bin");
        let size = provider.retrieve(&rec.id, &out).await.unwrap();
        assert_eq!(size, 12);
        assert_eq!(fs::read(&out).unwrap(), b"hello backup");
    }

    #[tokio::test]
    async fn store_directory_tree() {
        let tmp = tempfile::tempdir().unwrap();
        let provider = LocalProvider::new("local", tmp.path().join("store")).unwrap();
        let payload = tmp.path().join("dump");
        fs::create_dir_all(payload.join("shop")).unwrap();
        fs::write(payload.join("shop/orders.bson"), b"abc").unwrap();
        fs::write(payload.join("shop/users.bson"), b"defg").unwrap();

        let rec = record("dump", ArtifactKind::Directory);
        let stored = provider.store(&payload, &rec).await.unwrap();
        assert_eq!(stored.size, 7);

        let out = tmp.path().join("restored");
        provider.retrieve(&rec.id, &out).await.unwrap();
        assert_eq!(fs::read(out.join("shop/users.bson")).unwrap(), b"defg");
    }

    #[tokio::test]
    async fn store_collision_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let provider = LocalProvider::new("local", tmp.path().join("store")).unwrap();
        let payload = tmp.path().join("a.bin");
        fs::write(&payload, b"first").unwrap();
        let rec = record("a.bin", ArtifactKind::File);
        provider.store(&payload, &rec).await.unwrap();

        fs::write(&payload, b"second").unwrap();
        let err = provider.store(&payload, &rec).await.unwrap_err();
        assert!(matches!(err, KeeperError::ObjectExists(_)), "{err}");

        let out = tmp.path().join("check.bin");
        provider.retrieve(&rec.id, &out).await.unwrap();
        assert_eq!(fs::read(&out).unwrap(), b"first");
    }

    #[tokio::test]
    async fn list_skips_reserved_and_foreign_dirs() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("store");
        let provider = LocalProvider::new("local", &root).unwrap();
        let payload = tmp.path().join("a.bin");
        fs::write(&payload, b"x").unwrap();
        let rec = record("a.bin", ArtifactKind::File);
        provider.store(&payload, &rec).await.unwrap();

        fs::create_dir_all(root.join(".staging/whatever")).unwrap();
        fs::create_dir_all(root.join("random-dir")).unwrap();

        let listed = provider.list().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, rec.id);
    }

    #[tokio::test]
    async fn scan_reports_corrupt_metadata() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("store");
        let provider = LocalProvider::new("local", &root).unwrap();
        let payload = tmp.path().join("a.bin");
        fs::write(&payload, b"x").unwrap();
        let good = record("a.bin", ArtifactKind::File);
        provider.store(&payload, &good).await.unwrap();
        let mut bad = record("a.bin", ArtifactKind::File);
        bad.id = BackupId::generate(good.created_at + chrono::Duration::seconds(1));
        provider.store(&payload, &bad).await.unwrap();
        fs::write(root.join(bad.id.as_str()).join(METADATA_FILE), b"{ truncated").unwrap();

        let scan = provider.scan().await.unwrap();
        assert_eq!(scan.records.len(), 1);
        assert_eq!(scan.records[0].id, good.id);
        assert_eq!(scan.unreadable.len(), 1);
        assert_eq!(scan.unreadable[0].backup, bad.id.as_str());
        assert_eq!(provider.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let provider = LocalProvider::new("local", tmp.path().join("store")).unwrap();
        let payload = tmp.path().join("a.bin");
        fs::write(&payload, b"x").unwrap();
        let rec = record("a.bin", ArtifactKind::File);
        provider.store(&payload, &rec).await.unwrap();

        provider.delete(&rec.id).await.unwrap();
        provider.delete(&rec.id).await.unwrap();
        assert!(provider.list().await.unwrap().is_empty());
        assert!(provider.get_record(&rec.id).await.unwrap().is_none());
    }

    #[test]
    fn rejects_unsafe_artifact_names() {
        assert!(LocalProvider::validate_component("../escape").is_err());
        assert!(LocalProvider::validate_component("/abs").is_err());
        assert!(LocalProvider::validate_component("a\\b").is_err());
        assert!(LocalProvider::validate_component("").is_err());
        assert!(LocalProvider::validate_component("payload.tar.gz").is_ok());
    }

    #[test]
    fn empty_root_is_a_config_error() {
        assert!(matches!(
            LocalProvider::new("local", ""),
            Err(KeeperError::Config(_))
        ));
    }
}
