//! Encrypted persistence for the device scheme's refresh token

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::crypto::{PassphraseCipher, RecordCipher, SealedEnvelope};
use crate::error::{Result, SessionError};
use crate::utils::write_private_file_atomically;

/// Default file name under the platform config directory
const STORE_DIR: &str = "bearer-session";
const STORE_FILE: &str = "refresh_token.json";

/// The single persisted refresh token
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshTokenRecord {
    /// Refresh token value
    pub refresh_token: String,
    /// Whether the server rotates this token on every use
    pub rotatable: bool,
    /// When this record was last written
    pub last_modified: DateTime<Utc>,
}

impl RefreshTokenRecord {
    /// Record stamped with the current time
    pub fn new(refresh_token: impl Into<String>, rotatable: bool) -> Self {
        Self {
            refresh_token: refresh_token.into(),
            rotatable,
            last_modified: Utc::now(),
        }
    }
}

impl std::fmt::Debug for RefreshTokenRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefreshTokenRecord")
            .field("refresh_token", &"[REDACTED]")
            .field("rotatable", &self.rotatable)
            .field("last_modified", &self.last_modified)
            .finish()
    }
}

/// Storage for one refresh-token record.
///
/// Writes are all-or-nothing: after `put` returns, readers see either the
/// previous record or the new one.
pub trait RefreshTokenStore: Send + Sync + std::fmt::Debug {
    /// Read the record; `Ok(None)` if none has been stored
    ///
    /// # Errors
    ///
    /// Returns `SessionError::RecordUnreadable` if a record exists but cannot
    /// be read or decrypted.
    fn get(&self) -> Result<Option<RefreshTokenRecord>>;

    /// Replace the record
    ///
    /// # Errors
    ///
    /// Returns `SessionError::TokenPersistence` if the record cannot be written.
    fn put(&self, record: &RefreshTokenRecord) -> Result<()>;

    /// Delete the record; succeeds if there is none
    ///
    /// # Errors
    ///
    /// Returns `SessionError::TokenPersistence` if an existing record cannot
    /// be removed.
    fn clear(&self) -> Result<()>;
}

/// File-backed store writing an encrypted envelope
#[derive(Debug, Clone)]
pub struct FileRefreshTokenStore {
    path: PathBuf,
    cipher: Arc<dyn RecordCipher>,
}

impl FileRefreshTokenStore {
    /// Store at `path` using `cipher`
    pub fn new(path: impl Into<PathBuf>, cipher: Arc<dyn RecordCipher>) -> Self {
        Self {
            path: path.into(),
            cipher,
        }
    }

    /// Store at `path` sealed with a passphrase
    pub fn with_passphrase(path: impl Into<PathBuf>, passphrase: impl Into<String>) -> Self {
        Self::new(path, Arc::new(PassphraseCipher::new(passphrase)))
    }

    /// Store at the default location, keyed to `client_id` and the local user
    ///
    /// # Errors
    ///
    /// Returns `SessionError::InvalidConfig` if the platform has no config
    /// directory.
    pub fn for_client(client_id: &str) -> Result<Self> {
        let path = default_store_path()
            .ok_or_else(|| SessionError::invalid_config("no config directory for the refresh token store"))?;
        Ok(Self::with_passphrase(path, default_passphrase(client_id)))
    }

    /// Path of the record
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn unreadable(&self, reason: impl std::fmt::Display) -> SessionError {
        SessionError::record_unreadable(&self.path, reason.to_string())
    }
}

impl RefreshTokenStore for FileRefreshTokenStore {
    fn get(&self) -> Result<Option<RefreshTokenRecord>> {
        let content = match std::fs::read(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(self.unreadable(e)),
        };

        let envelope: SealedEnvelope = serde_json::from_slice(&content).map_err(|e| self.unreadable(e))?;
        let plaintext = self.cipher.open(&envelope).map_err(|e| self.unreadable(e))?;
        let record = serde_json::from_slice(&plaintext).map_err(|e| self.unreadable(e))?;
        Ok(Some(record))
    }

    fn put(&self, record: &RefreshTokenRecord) -> Result<()> {
        let plaintext = serde_json::to_vec(record)?;
        let envelope = self.cipher.seal(&plaintext)?;
        let content = serde_json::to_vec_pretty(&envelope)?;

        write_private_file_atomically(&self.path, &content)
            .map_err(|e| SessionError::token_persistence(&self.path, e))?;
        tracing::debug!(path = %self.path.display(), "Refresh token record written");
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => {
                tracing::debug!(path = %self.path.display(), "Refresh token record removed");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(SessionError::token_persistence(&self.path, e)),
        }
    }
}

/// `<config dir>/bearer-session/refresh_token.json`
#[must_use]
pub fn default_store_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join(STORE_DIR).join(STORE_FILE))
}

/// Passphrase bound to the OAuth client id and the local account name
#[must_use]
pub fn default_passphrase(client_id: &str) -> String {
    let user = std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(b"bearer-session\0");
    hasher.update(client_id.as_bytes());
    hasher.update(b"\0");
    hasher.update(user.as_bytes());
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}
