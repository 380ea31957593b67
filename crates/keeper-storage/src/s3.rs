use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rusty_s3::actions::{ListObjectsV2, S3Action};
use rusty_s3::{Bucket, Credentials, UrlStyle};

use keeper_types::{ArtifactKind, BackupId, BackupRecord, KeeperError, Result};

use crate::http_util::{content_length, read_body};
use crate::retry::{with_retry, HttpAttemptError};
use crate::{
    sort_records, ProviderUsage, RecordScan, RetryConfig, StorageProvider, StoredObject,
    UnreadableRecord, METADATA_FILE,
};

/// Duration for presigned URL validity.
const PRESIGN_DURATION: Duration = Duration::from_secs(3600);

const PROBE_KEY: &str = ".keeper-probe";

/// Connection settings for an S3-compatible bucket.
#[derive(Debug, Clone)]
pub struct S3ProviderConfig {
    pub name: String,
    pub bucket: String,
    pub region: String,
    /// Custom endpoint (MinIO, Wasabi, ...). Path-style addressing is used when set.
    pub endpoint: Option<String>,
    /// Key prefix under which backups are stored.
    pub prefix: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub storage_class: Option<String>,
    pub retry: RetryConfig,
}

/// Object-storage replica. Layout mirrors the local provider:
/// `<prefix>/<backup id>/<artifact>` plus `<prefix>/<backup id>/metadata.json`.
pub struct S3Provider {
    name: String,
    inner: Arc<S3Client>,
}

struct S3Client {
    label: String,
    bucket: Bucket,
    credentials: Credentials,
    agent: ureq::Agent,
    retry: RetryConfig,
    root: String,
    storage_class: Option<String>,
}

impl S3Provider {
    pub fn new(config: S3ProviderConfig) -> Result<Self> {
        if config.bucket.is_empty() {
            return Err(KeeperError::Config(format!(
                "remote provider '{}': bucket must not be empty",
                config.name
            )));
        }
        let (endpoint, url_style) = match config.endpoint.as_deref() {
            Some(ep) if !ep.is_empty() => (ep.to_string(), UrlStyle::Path),
            _ => (
                format!("https://s3.{}.amazonaws.com", config.region),
                UrlStyle::VirtualHost,
            ),
        };
        let base_url = endpoint.parse().map_err(|e| {
            KeeperError::Config(format!("invalid S3 endpoint URL '{endpoint}': {e}"))
        })?;
        let bucket = Bucket::new(
            base_url,
            url_style,
            config.bucket.clone(),
            config.region.clone(),
        )
        .map_err(|e| KeeperError::Config(format!("failed to create S3 bucket handle: {e}")))?;

        let credentials = Credentials::new(&config.access_key_id, &config.secret_access_key);

        let agent = ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_secs(30))
            .timeout_read(Duration::from_secs(300))
            .timeout_write(Duration::from_secs(300))
            .build();

        Ok(Self {
            name: config.name.clone(),
            inner: Arc::new(S3Client {
                label: config.name,
                bucket,
                credentials,
                agent,
                retry: config.retry,
                root: config.prefix.trim_matches('/').to_string(),
                storage_class: config.storage_class,
            }),
        })
    }

    async fn run<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&S3Client) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let client = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || f(&client))
            .await
            .map_err(|e| KeeperError::Other(format!("S3 task panicked: {e}")))?
    }
}

impl S3Client {
    fn full_key(&self, key: &str) -> String {
        if self.root.is_empty() {
            key.to_string()
        } else {
            format!("{}/{}", self.root, key)
        }
    }

    fn location(&self, key: &str) -> String {
        format!("s3://{}/{}", self.bucket.name(), self.full_key(key))
    }

    fn error(&self, op: &str, key: &str, e: impl std::fmt::Display) -> KeeperError {
        KeeperError::Other(format!("{} {op} {key}: {e}", self.label))
    }

    fn head(&self, key: &str) -> Result<Option<u64>> {
        let url = self
            .bucket
            .head_object(Some(&self.credentials), &self.full_key(key))
            .sign(PRESIGN_DURATION);
        let resp = with_retry(&self.retry, "HEAD", &self.label, || {
            match self.agent.head(url.as_str()).call() {
                Ok(resp) => Ok(Some(resp)),
                Err(ureq::Error::Status(404, _)) => Ok(None),
                Err(e) => Err(HttpAttemptError::http(e)),
            }
        })
        .map_err(|e| self.error("HEAD", key, e))?;
        match resp {
            Some(resp) => Ok(Some(content_length(&resp, &format!("HEAD {key}"))?)),
            None => Ok(None),
        }
    }

    fn put_bytes(&self, key: &str, data: &[u8]) -> Result<()> {
        let url = self
            .bucket
            .put_object(Some(&self.credentials), &self.full_key(key))
            .sign(PRESIGN_DURATION);
        with_retry(&self.retry, "PUT", &self.label, || {
            self.agent
                .put(url.as_str())
                .send_bytes(data)
                .map_err(HttpAttemptError::http)
        })
        .map_err(|e| self.error("PUT", key, e))?;
        Ok(())
    }

    fn put_file(&self, key: &str, path: &Path) -> Result<u64> {
        let full_key = self.full_key(key);
        let mut action = self
            .bucket
            .put_object(Some(&self.credentials), &full_key);
        if let Some(class) = &self.storage_class {
            action.headers_mut().insert("x-amz-storage-class", class);
        }
        let url = action.sign(PRESIGN_DURATION);

        with_retry(&self.retry, "PUT", &self.label, || {
            let file = fs::File::open(path)?;
            let len = file.metadata()?.len();
            let mut req = self
                .agent
                .put(url.as_str())
                .set("Content-Length", &len.to_string());
            if let Some(class) = &self.storage_class {
                req = req.set("x-amz-storage-class", class);
            }
            req.send(file).map_err(HttpAttemptError::http)?;
            Ok(len)
        })
        .map_err(|e| self.error("PUT", key, e))
    }

    fn get_bytes(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let url = self
            .bucket
            .get_object(Some(&self.credentials), &self.full_key(key))
            .sign(PRESIGN_DURATION);
        with_retry(&self.retry, "GET", &self.label, || {
            match self.agent.get(url.as_str()).call() {
                Ok(resp) => Ok(Some(read_body(resp)?)),
                Err(ureq::Error::Status(404, _)) => Ok(None),
                Err(e) => Err(HttpAttemptError::http(e)),
            }
        })
        .map_err(|e| self.error("GET", key, e))
    }

    fn get_to_file(&self, key: &str, dest: &Path) -> Result<u64> {
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        let url = self
            .bucket
            .get_object(Some(&self.credentials), &self.full_key(key))
            .sign(PRESIGN_DURATION);
        with_retry(&self.retry, "GET", &self.label, || {
            let resp = self
                .agent
                .get(url.as_str())
                .call()
                .map_err(HttpAttemptError::http)?;
            let mut out = fs::File::create(dest)?;
            Ok(io::copy(&mut resp.into_reader(), &mut out)?)
        })
        .map_err(|e| match e.status() {
            Some(404) => KeeperError::BackupNotFound(key.to_string()),
            _ => self.error("GET", key, e),
        })
    }

    fn delete_key(&self, key: &str) -> Result<()> {
        let url = self
            .bucket
            .delete_object(Some(&self.credentials), &self.full_key(key))
            .sign(PRESIGN_DURATION);
        with_retry(&self.retry, "DELETE", &self.label, || {
            match self.agent.delete(url.as_str()).call() {
                Ok(_) | Err(ureq::Error::Status(404, _)) => Ok(()),
                Err(e) => Err(HttpAttemptError::http(e)),
            }
        })
        .map_err(|e| self.error("DELETE", key, e))
    }

    /// Keys under `prefix`, relative to the provider root.
    fn list_keys(&self, prefix: &str) -> Result<Vec<String>> {
        let full_prefix = self.full_key(prefix);
        let strip = if self.root.is_empty() {
            0
        } else {
            self.root.len() + 1
        };

        let mut keys = Vec::new();
        let mut continuation: Option<String> = None;
        loop {
            let mut action = self.bucket.list_objects_v2(Some(&self.credentials));
            action.query_mut().insert("prefix", &full_prefix);
            if let Some(token) = &continuation {
                action.query_mut().insert("continuation-token", token);
            }
            let url = action.sign(PRESIGN_DURATION);

            let parsed = with_retry(&self.retry, "LIST", &self.label, || {
                let resp = self
                    .agent
                    .get(url.as_str())
                    .call()
                    .map_err(HttpAttemptError::http)?;
                let body = read_body(resp)?;
                ListObjectsV2::parse_response(&String::from_utf8_lossy(&body)).map_err(|e| {
                    HttpAttemptError::Permanent(format!("failed to parse listing: {e}"))
                })
            })
            .map_err(|e| self.error("LIST", prefix, e))?;

            for obj in &parsed.contents {
                if obj.key.ends_with('/') || obj.key.len() <= strip {
                    continue;
                }
                keys.push(obj.key[strip..].to_string());
            }

            match parsed.next_continuation_token {
                Some(token) => continuation = Some(token),
                None => break,
            }
        }
        Ok(keys)
    }

    fn read_record(&self, id: &BackupId) -> Result<Option<BackupRecord>> {
        match self.get_bytes(&format!("{id}/{METADATA_FILE}"))? {
            Some(data) => Ok(Some(serde_json::from_slice(&data)?)),
            None => Ok(None),
        }
    }

    fn write_record(&self, record: &BackupRecord) -> Result<()> {
        let data = serde_json::to_vec_pretty(record)?;
        self.put_bytes(&format!("{}/{METADATA_FILE}", record.id), &data)
    }

    fn store(&self, payload: &Path, record: &BackupRecord) -> Result<StoredObject> {
        let key = format!("{}/{}", record.id, record.artifact);
        let size = match record.artifact_kind {
            ArtifactKind::File => {
                if self.head(&key)?.is_some() {
                    return Err(KeeperError::ObjectExists(self.location(&key)));
                }
                self.put_file(&key, payload)?
            }
            ArtifactKind::Directory => {
                if !self.list_keys(&format!("{key}/"))?.is_empty() {
                    return Err(KeeperError::ObjectExists(self.location(&key)));
                }
                let mut total = 0;
                for (rel, path) in tree_files(payload)? {
                    total += self.put_file(&format!("{key}/{rel}"), &path)?;
                }
                total
            }
        };
        self.write_record(record)?;
        Ok(StoredObject {
            location: self.location(&key),
            size,
        })
    }

    fn retrieve(&self, id: &BackupId, destination: &Path) -> Result<u64> {
        let record = self
            .read_record(id)?
            .ok_or_else(|| KeeperError::BackupNotFound(id.to_string()))?;
        let key = format!("{id}/{}", record.artifact);
        match record.artifact_kind {
            ArtifactKind::File => self.get_to_file(&key, destination),
            ArtifactKind::Directory => {
                let prefix = format!("{key}/");
                let mut total = 0;
                for object_key in self.list_keys(&prefix)? {
                    let rel = &object_key[prefix.len()..];
                    if rel.split('/').any(|part| part == ".." || part.is_empty()) {
                        return Err(KeeperError::InvalidKey(object_key.clone()));
                    }
                    total += self.get_to_file(&object_key, &destination.join(rel))?;
                }
                Ok(total)
            }
        }
    }

    fn scan_records(&self) -> Result<RecordScan> {
        let suffix = format!("/{METADATA_FILE}");
        let mut scan = RecordScan::default();
        for key in self.list_keys("")? {
            let Some(id) = key.strip_suffix(&suffix) else {
                continue;
            };
            if id.contains('/') {
                continue;
            }
            let parsed = BackupId::parse(id).and_then(|id| self.read_record(&id));
            match parsed {
                Ok(Some(record)) => scan.records.push(record),
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(provider = %self.label, key = %key, error = %e, "unreadable metadata");
                    scan.unreadable.push(UnreadableRecord {
                        backup: id.to_string(),
                        error: e.to_string(),
                    });
                }
            }
        }
        sort_records(&mut scan.records);
        Ok(scan)
    }

    fn delete_backup(&self, id: &BackupId) -> Result<()> {
        for key in self.list_keys(&format!("{id}/"))? {
            self.delete_key(&key)?;
        }
        Ok(())
    }
}

/// Regular files under `root` as (`/`-separated relative key, path) pairs.
fn tree_files(root: &Path) -> Result<Vec<(String, PathBuf)>> {
    let mut files = Vec::new();
    for entry in walkdir::WalkDir::new(root).sort_by_file_name() {
        let entry =
            entry.map_err(|e| KeeperError::Other(format!("walk '{}': {e}", root.display())))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(root)
            .map_err(|e| KeeperError::Other(e.to_string()))?;
        let key = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        files.push((key, entry.path().to_path_buf()));
    }
    Ok(files)
}

#[async_trait]
impl StorageProvider for S3Provider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn store(&self, payload: &Path, record: &BackupRecord) -> Result<StoredObject> {
        let payload = payload.to_path_buf();
        let record = record.clone();
        self.run(move |c| c.store(&payload, &record)).await
    }

    async fn retrieve(&self, id: &BackupId, destination: &Path) -> Result<u64> {
        let id = id.clone();
        let destination = destination.to_path_buf();
        self.run(move |c| c.retrieve(&id, &destination)).await
    }

    async fn put_record(&self, record: &BackupRecord) -> Result<()> {
        let record = record.clone();
        self.run(move |c| c.write_record(&record)).await
    }

    async fn get_record(&self, id: &BackupId) -> Result<Option<BackupRecord>> {
        let id = id.clone();
        self.run(move |c| c.read_record(&id)).await
    }

    async fn scan(&self) -> Result<RecordScan> {
        self.run(|c| c.scan_records()).await
    }

    async fn delete(&self, id: &BackupId) -> Result<()> {
        let id = id.clone();
        self.run(move |c| c.delete_backup(&id)).await
    }

    async fn usage(&self) -> Result<ProviderUsage> {
        let records = self.list().await?;
        Ok(ProviderUsage {
            backups: records.len(),
            bytes: records.iter().map(|r| r.stored_size).sum(),
        })
    }

    async fn probe(&self) -> Result<()> {
        self.run(|c| {
            c.put_bytes(PROBE_KEY, b"probe")?;
            c.delete_key(PROBE_KEY)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(prefix: &str, endpoint: Option<&str>) -> S3ProviderConfig {
        S3ProviderConfig {
            name: "offsite".into(),
            bucket: "backups".into(),
            region: "us-east-1".into(),
            endpoint: endpoint.map(str::to_string),
            prefix: prefix.into(),
            access_key_id: "AKIA".into(),
            secret_access_key: "secret".into(),
            storage_class: None,
            retry: RetryConfig::default(),
        }
    }

    #[test]
    fn prefix_is_normalized() {
        let p = S3Provider::new(config("/db/prod/", Some("http://127.0.0.1:9000"))).unwrap();
        assert_eq!(p.inner.full_key("a/b"), "db/prod/a/b");
        assert_eq!(
            p.inner.location("backup-x/payload.tar.gz"),
            "s3://backups/db/prod/backup-x/payload.tar.gz"
        );
    }

    #[test]
    fn empty_prefix_uses_bare_keys() {
        let p = S3Provider::new(config("", None)).unwrap();
        assert_eq!(p.inner.full_key("k"), "k");
    }

    #[test]
    fn empty_bucket_is_rejected() {
        let mut cfg = config("", None);
        cfg.bucket.clear();
        assert!(matches!(S3Provider::new(cfg), Err(KeeperError::Config(_))));
    }

    #[test]
    fn invalid_endpoint_is_rejected() {
        assert!(S3Provider::new(config("", Some("not a url"))).is_err());
    }

    #[test]
    fn tree_files_uses_forward_slashes() {
        let tmp = tempfile::tempdir().unwrap();
        fs::create_dir_all(tmp.path().join("shop")).unwrap();
        fs::write(tmp.path().join("shop/orders.bson"), b"x").unwrap();
        fs::write(tmp.path().join("top.json"), b"{}").unwrap();
        let files = tree_files(tmp.path()).unwrap();
        let keys: Vec<&str> = files.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["shop/orders.bson", "top.json"]);
    }
}
