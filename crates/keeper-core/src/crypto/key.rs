use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use rand::RngCore;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::error::{KeeperError, Result};

pub const KEY_FILE_NAME: &str = "backup.key";

/// Symmetric key used for every encrypted backup.
///
/// Generated once and persisted next to the configuration; zeroized on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct EncryptionKey {
    bytes: [u8; 32],
}

impl EncryptionKey {
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self { bytes }
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.bytes
    }

    pub fn key_file(dir: &Path) -> PathBuf {
        dir.join(KEY_FILE_NAME)
    }

    /// Read the key from `dir`, or `None` if it was never created.
    pub fn load(dir: &Path) -> Result<Option<Self>> {
        let path = Self::key_file(dir);
        let data = match fs::read(&path) {
            Ok(data) => Zeroizing::new(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if data.len() != 32 {
            return Err(KeeperError::Config(format!(
                "encryption key '{}' must be 32 bytes, found {}",
                path.display(),
                data.len()
            )));
        }
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&data);
        Ok(Some(Self { bytes }))
    }

    /// Load the key, generating and persisting it on first use.
    ///
    /// The file is created exclusively with mode 0600, so a concurrent
    /// bootstrap cannot silently replace a key that is already in use.
    pub fn load_or_create(dir: &Path) -> Result<Self> {
        if let Some(key) = Self::load(dir)? {
            return Ok(key);
        }

        fs::create_dir_all(dir)?;
        let path = Self::key_file(dir);
        let key = Self::generate();

        let mut options = fs::OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        match options.open(&path) {
            Ok(mut file) => {
                file.write_all(&key.bytes)?;
                file.sync_all()?;
                tracing::info!(path = %path.display(), "generated new encryption key");
                Ok(key)
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Self::load(dir)?
                .ok_or_else(|| KeeperError::Config(format!("key '{}' vanished", path.display()))),
            Err(e) => Err(e.into()),
        }
    }
}

impl std::fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("EncryptionKey(..)")
    }
}
