use std::sync::Arc;

use crate::config::{self, ConfigSource, KeeperConfig};
use crate::crypto::EncryptionKey;
use crate::dump::{CommandDumpSource, DumpSource};
use crate::error::{KeeperError, Result};
use crate::integrity::IntegrityChecker;
use crate::notify::Notifications;
use crate::retention::RetentionSweeper;
use crate::storage::StorageManager;

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub source: ConfigSource,
    pub config: KeeperConfig,
}

pub fn load_runtime_config(config_path: Option<&str>) -> Result<RuntimeConfig> {
    let source = config::resolve_config_path(config_path).ok_or_else(|| {
        KeeperError::Config("no configuration file found in default search paths".into())
    })?;
    let config = config::load_config(source.path())?;
    Ok(RuntimeConfig { source, config })
}

/// Everything the engine and scheduler talk to, built once from config.
#[derive(Clone)]
pub struct Services {
    pub config: Arc<KeeperConfig>,
    pub storage: Arc<StorageManager>,
    pub integrity: IntegrityChecker,
    pub dump: Arc<dyn DumpSource>,
    pub retention: Arc<RetentionSweeper>,
    pub notifications: Notifications,
    pub key: Option<Arc<EncryptionKey>>,
}

impl Services {
    /// Build real collaborators. When encryption is enabled the key is
    /// loaded, or generated on first use.
    pub fn from_config(config: KeeperConfig) -> Result<Self> {
        let key = if config.encryption.enabled {
            Some(Arc::new(EncryptionKey::load_or_create(
                &config.encryption.key_dir(),
            )?))
        } else {
            // Existing encrypted backups stay readable after encryption is
            // switched off.
            EncryptionKey::load(&config.encryption.key_dir())?.map(Arc::new)
        };
        let storage = StorageManager::from_config(&config.storage)?;
        let dump = CommandDumpSource::new(config.source.clone())?;
        let integrity = IntegrityChecker::new(config.integrity.algorithm, key.clone())
            .with_restorability(config.integrity.verify_restorability);
        Ok(Self {
            storage: Arc::new(storage),
            integrity,
            dump: Arc::new(dump),
            retention: Arc::new(RetentionSweeper::new(config.retention.clone())),
            notifications: Notifications::from_config(&config.notifications),
            key,
            config: Arc::new(config),
        })
    }

    pub fn with_storage(mut self, storage: StorageManager) -> Self {
        self.storage = Arc::new(storage);
        self
    }

    pub fn with_dump(mut self, dump: Arc<dyn DumpSource>) -> Self {
        self.dump = dump;
        self
    }

    pub fn with_notifications(mut self, notifications: Notifications) -> Self {
        self.notifications = notifications;
        self
    }
}
