use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;

use keeper_storage::{
    LocalProvider, ProviderUsage, RecordScan, S3Provider, S3ProviderConfig, StorageProvider,
};
use keeper_types::{BackupId, BackupRecord};

use crate::config::{RemoteKind, RemoteStorageConfig, StorageConfig};
use crate::error::{KeeperError, Result};

/// Result of copying a payload to one provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreOutcome {
    pub provider: String,
    pub location: String,
    pub size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderRole {
    Local,
    Remote,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProviderStats {
    pub name: String,
    pub role: ProviderRole,
    #[serde(flatten)]
    pub usage: ProviderUsage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct StorageStats {
    pub providers: Vec<ProviderStats>,
    pub total_backups: usize,
    pub total_bytes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oldest: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub newest: Option<DateTime<Utc>>,
}

/// Every enabled provider behind one set of operations.
///
/// The local provider is the provider of record: listings and metadata come
/// from it. Remote providers are replicas. Disabled remotes are never built,
/// so they can't be called and never show up in statistics.
///
/// Metadata writes and local deletes are serialized, so a sweep and a running
/// backup never overwrite each other's view of the same record.
pub struct StorageManager {
    local: Arc<dyn StorageProvider>,
    remotes: Vec<Arc<dyn StorageProvider>>,
    metadata: Mutex<()>,
}

impl StorageManager {
    pub fn new(local: Arc<dyn StorageProvider>, remotes: Vec<Arc<dyn StorageProvider>>) -> Self {
        Self {
            local,
            remotes,
            metadata: Mutex::new(()),
        }
    }

    pub fn from_config(config: &StorageConfig) -> Result<Self> {
        let local = LocalProvider::new(config.local.name.clone(), config.local.base_path())?;
        let mut remotes: Vec<Arc<dyn StorageProvider>> = Vec::new();
        for remote in config.remote.iter().filter(|r| r.enabled) {
            remotes.push(build_remote(remote)?);
        }
        for remote in config.remote.iter().filter(|r| !r.enabled) {
            tracing::debug!(provider = %remote.name, "remote provider disabled");
        }
        Ok(Self::new(Arc::new(local), remotes))
    }

    pub fn local(&self) -> &Arc<dyn StorageProvider> {
        &self.local
    }

    pub fn local_name(&self) -> &str {
        self.local.name()
    }

    pub fn remote_names(&self) -> Vec<String> {
        self.remotes.iter().map(|p| p.name().to_string()).collect()
    }

    pub fn provider_names(&self) -> Vec<String> {
        std::iter::once(self.local.name().to_string())
            .chain(self.remote_names())
            .collect()
    }

    fn providers(&self) -> impl Iterator<Item = &Arc<dyn StorageProvider>> {
        std::iter::once(&self.local).chain(self.remotes.iter())
    }

    pub fn provider(&self, name: &str) -> Result<&Arc<dyn StorageProvider>> {
        self.providers()
            .find(|p| p.name() == name)
            .ok_or_else(|| KeeperError::ProviderNotFound(name.to_string()))
    }

    /// Copy `payload` to provider `name` together with its record.
    pub async fn store(&self, name: &str, payload: &Path, record: &BackupRecord) -> Result<StoreOutcome> {
        let provider = self.provider(name)?;
        let stored = provider.store(payload, record).await?;
        tracing::info!(
            provider = %name,
            backup_id = %record.id,
            location = %stored.location,
            size = stored.size,
            "payload stored"
        );
        Ok(StoreOutcome {
            provider: name.to_string(),
            location: stored.location,
            size: stored.size,
        })
    }

    pub async fn retrieve(&self, name: &str, id: &BackupId, destination: &Path) -> Result<u64> {
        self.provider(name)?.retrieve(id, destination).await
    }

    /// Records held by the provider of record, oldest first.
    pub async fn list(&self) -> Result<Vec<BackupRecord>> {
        self.local.list().await
    }

    /// Like [`StorageManager::list`], but also returns backups whose
    /// metadata could not be read.
    pub async fn scan(&self) -> Result<RecordScan> {
        self.local.scan().await
    }

    pub async fn get_record(&self, id: &BackupId) -> Result<BackupRecord> {
        self.local
            .get_record(id)
            .await?
            .ok_or_else(|| KeeperError::BackupNotFound(id.to_string()))
    }

    pub async fn put_record(&self, record: &BackupRecord) -> Result<()> {
        let _guard = self.metadata.lock().await;
        self.local.put_record(record).await
    }

    /// Re-read the stored record, apply `update` and write it back, all
    /// under the metadata lock. Returns the record as written.
    pub async fn update_record<F>(&self, id: &BackupId, update: F) -> Result<BackupRecord>
    where
        F: FnOnce(&mut BackupRecord) + Send,
    {
        let _guard = self.metadata.lock().await;
        let mut record = self
            .local
            .get_record(id)
            .await?
            .ok_or_else(|| KeeperError::BackupNotFound(id.to_string()))?;
        update(&mut record);
        self.local.put_record(&record).await?;
        Ok(record)
    }

    /// Filesystem path of a record's artifact in the provider of record.
    pub fn artifact_path(&self, record: &BackupRecord) -> Option<PathBuf> {
        self.local.local_artifact_path(record)
    }

    /// Delete a backup from every provider that holds a copy.
    ///
    /// A local failure is an error. Remote failures come back as warnings so
    /// the caller can decide whether they matter.
    pub async fn delete(&self, record: &BackupRecord) -> Result<Vec<String>> {
        {
            let _guard = self.metadata.lock().await;
            self.local.delete(&record.id).await?;
        }
        let mut warnings = Vec::new();
        for remote in &self.remotes {
            if record.location(remote.name()).is_none() {
                continue;
            }
            if let Err(e) = remote.delete(&record.id).await {
                tracing::warn!(provider = %remote.name(), backup_id = %record.id, error = %e, "remote delete failed");
                warnings.push(format!("{}: {e}", remote.name()));
            }
        }
        Ok(warnings)
    }

    /// Usage per enabled provider. A provider that can't be queried is
    /// reported with its error instead of failing the whole call.
    pub async fn stats(&self) -> StorageStats {
        let mut stats = StorageStats::default();
        for (i, provider) in self.providers().enumerate() {
            let role = if i == 0 { ProviderRole::Local } else { ProviderRole::Remote };
            let (usage, error) = match provider.usage().await {
                Ok(usage) => (usage, None),
                Err(e) => (ProviderUsage::default(), Some(e.to_string())),
            };
            if role == ProviderRole::Local {
                stats.total_backups = usage.backups;
            }
            stats.total_bytes += usage.bytes;
            stats.providers.push(ProviderStats {
                name: provider.name().to_string(),
                role,
                usage,
                error,
            });
        }
        if let Ok(records) = self.local.list().await {
            stats.oldest = records.first().map(|r| r.created_at);
            stats.newest = records.last().map(|r| r.created_at);
        }
        stats
    }

    /// Probe every enabled provider.
    pub async fn probe_all(&self) -> Vec<(String, Result<()>)> {
        let mut out = Vec::new();
        for provider in self.providers() {
            out.push((provider.name().to_string(), provider.probe().await));
        }
        out
    }
}

fn build_remote(config: &RemoteStorageConfig) -> Result<Arc<dyn StorageProvider>> {
    match config.kind {
        RemoteKind::S3 => Ok(Arc::new(S3Provider::new(s3_config(config))?)),
    }
}

/// Convert a remote section into provider settings.
pub fn s3_config(config: &RemoteStorageConfig) -> S3ProviderConfig {
    S3ProviderConfig {
        name: config.name.clone(),
        bucket: config.bucket.clone(),
        region: config.region.clone(),
        endpoint: config.endpoint.clone(),
        prefix: config.prefix.clone(),
        access_key_id: config.access_key_id.clone().unwrap_or_default(),
        secret_access_key: config.secret_access_key.clone().unwrap_or_default(),
        storage_class: config.storage_class.clone(),
        retry: config.retry.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LocalStorageConfig;

    fn config(base: &Path, remote_enabled: bool) -> StorageConfig {
        StorageConfig {
            local: LocalStorageConfig {
                name: "local".into(),
                base_path: base.display().to_string(),
            },
            remote: vec![RemoteStorageConfig {
                name: "offsite".into(),
                enabled: remote_enabled,
                kind: RemoteKind::S3,
                bucket: "backups".into(),
                region: "us-east-1".into(),
                endpoint: Some("http://127.0.0.1:9".into()),
                prefix: "keeper".into(),
                access_key_id: Some("AK".into()),
                secret_access_key: Some("SK".into()),
                storage_class: None,
                retry: Default::default(),
            }],
        }
    }

    #[test]
    fn disabled_remote_is_not_built() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = StorageManager::from_config(&config(tmp.path(), false)).unwrap();
        assert_eq!(manager.provider_names(), vec!["local"]);
        assert!(matches!(
            manager.provider("offsite"),
            Err(KeeperError::ProviderNotFound(_))
        ));

        let manager = StorageManager::from_config(&config(tmp.path(), true)).unwrap();
        assert_eq!(manager.provider_names(), vec!["local", "offsite"]);
        assert_eq!(manager.remote_names(), vec!["offsite"]);
    }

    #[tokio::test]
    async fn stats_only_list_enabled_providers() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = StorageManager::from_config(&config(tmp.path(), false)).unwrap();
        let stats = manager.stats().await;
        assert_eq!(stats.providers.len(), 1);
        assert_eq!(stats.providers[0].role, ProviderRole::Local);
        assert_eq!(stats.total_backups, 0);
    }
}
