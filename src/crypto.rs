//! At-rest encryption for locally persisted secrets
//!
//! [`RecordCipher`] is the seam: stores hand it plaintext and get back a
//! [`SealedEnvelope`] to write to disk. The default [`PassphraseCipher`]
//! derives an AES-256-GCM key from a passphrase with Argon2id, using a
//! fresh random salt and nonce for every seal.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use argon2::{Algorithm, Argon2, Params, Version};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SessionError};

const ALGORITHM: &str = "AES-256-GCM/Argon2id";
const ENVELOPE_VERSION: u32 = 1;
const KEY_LEN: usize = 32;
const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;

/// Encrypted payload as stored on disk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedEnvelope {
    /// Envelope format version
    pub version: u32,
    /// Cipher and key-derivation identifier
    pub algorithm: String,
    /// Base64 key-derivation salt
    pub salt: String,
    /// Base64 AEAD nonce
    pub nonce: String,
    /// Base64 ciphertext including the authentication tag
    pub ciphertext: String,
}

/// Symmetric encryption strategy for persisted records
pub trait RecordCipher: Send + Sync + std::fmt::Debug {
    /// Encrypt `plaintext`
    ///
    /// # Errors
    ///
    /// Returns `SessionError::KeyMaterial` if the key cannot be derived or
    /// encryption fails.
    fn seal(&self, plaintext: &[u8]) -> Result<SealedEnvelope>;

    /// Decrypt an envelope produced by [`RecordCipher::seal`]
    ///
    /// # Errors
    ///
    /// Returns `SessionError::KeyMaterial` for a wrong passphrase, a foreign
    /// algorithm, or tampered data.
    fn open(&self, envelope: &SealedEnvelope) -> Result<Vec<u8>>;
}

/// AES-256-GCM with an Argon2id key derived from a passphrase
pub struct PassphraseCipher {
    passphrase: String,
    params: Params,
}

impl std::fmt::Debug for PassphraseCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PassphraseCipher")
            .field("passphrase", &"[REDACTED]")
            .field("memory_kib", &self.params.m_cost())
            .field("iterations", &self.params.t_cost())
            .finish()
    }
}

impl PassphraseCipher {
    /// Cipher with Argon2's default cost parameters
    pub fn new(passphrase: impl Into<String>) -> Self {
        Self {
            passphrase: passphrase.into(),
            params: Params::default(),
        }
    }

    /// Cipher with explicit Argon2 cost parameters
    ///
    /// # Errors
    ///
    /// Returns `SessionError::InvalidConfig` if Argon2 rejects the parameters.
    pub fn with_cost(passphrase: impl Into<String>, memory_kib: u32, iterations: u32) -> Result<Self> {
        let params = Params::new(memory_kib, iterations, 1, Some(KEY_LEN))
            .map_err(|e| SessionError::invalid_config(format!("Invalid Argon2 parameters: {e}")))?;
        Ok(Self {
            passphrase: passphrase.into(),
            params,
        })
    }

    fn cipher_for(&self, salt: &[u8]) -> Result<Aes256Gcm> {
        let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, self.params.clone());
        let mut key = [0u8; KEY_LEN];
        argon2
            .hash_password_into(self.passphrase.as_bytes(), salt, &mut key)
            .map_err(|e| SessionError::key_material(format!("Key derivation failed: {e}")))?;
        Aes256Gcm::new_from_slice(&key)
            .map_err(|e| SessionError::key_material(format!("Failed to create cipher: {e}")))
    }
}

impl RecordCipher for PassphraseCipher {
    fn seal(&self, plaintext: &[u8]) -> Result<SealedEnvelope> {
        let mut salt = [0u8; SALT_LEN];
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut salt);
        OsRng.fill_bytes(&mut nonce);

        let ciphertext = self
            .cipher_for(&salt)?
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|e| SessionError::key_material(format!("Encryption failed: {e}")))?;

        Ok(SealedEnvelope {
            version: ENVELOPE_VERSION,
            algorithm: ALGORITHM.to_string(),
            salt: BASE64.encode(salt),
            nonce: BASE64.encode(nonce),
            ciphertext: BASE64.encode(ciphertext),
        })
    }

    fn open(&self, envelope: &SealedEnvelope) -> Result<Vec<u8>> {
        if envelope.algorithm != ALGORITHM {
            return Err(SessionError::key_material(format!(
                "Unsupported algorithm: {}",
                envelope.algorithm
            )));
        }

        let decode = |field: &str, value: &str| {
            BASE64
                .decode(value)
                .map_err(|e| SessionError::key_material(format!("Invalid {field} encoding: {e}")))
        };
        let salt = decode("salt", &envelope.salt)?;
        let nonce = decode("nonce", &envelope.nonce)?;
        let ciphertext = decode("ciphertext", &envelope.ciphertext)?;

        if nonce.len() != NONCE_LEN {
            return Err(SessionError::key_material("Invalid nonce length"));
        }

        self.cipher_for(&salt)?
            .decrypt(Nonce::from_slice(&nonce), ciphertext.as_slice())
            .map_err(|_| SessionError::key_material("Decryption failed: wrong passphrase or corrupted data"))
    }
}
