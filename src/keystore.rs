//! Client certificates and private keys for the certificate scheme
//!
//! Material can come from plain PEM files or from a [`KeyStore`]: a
//! password-protected file holding any number of aliased entries, each a
//! certificate plus its RSA private key. The keystore is sealed with the
//! same cipher used for the refresh-token record.

use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs8::der::pem::{self, LineEnding};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey};
use rsa::{RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::crypto::{PassphraseCipher, RecordCipher, SealedEnvelope};
use crate::error::{Result, SessionError};
use crate::utils::write_private_file_atomically;
use x509_cert::der::{Decode, Encode};

const CERTIFICATE_LABEL: &str = "CERTIFICATE";
const KEYSTORE_VERSION: u32 = 1;

/// X.509 certificate held as DER bytes
#[derive(Clone, PartialEq, Eq)]
pub struct Certificate {
    der: Vec<u8>,
}

impl std::fmt::Debug for Certificate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Certificate")
            .field("der_len", &self.der.len())
            .finish()
    }
}

impl Certificate {
    /// Parse a DER-encoded X.509 certificate
    ///
    /// # Errors
    ///
    /// Returns `SessionError::KeyMaterial` if the bytes are not a valid
    /// certificate.
    pub fn from_der(der: impl Into<Vec<u8>>) -> Result<Self> {
        let der = der.into();
        x509_cert::Certificate::from_der(&der)
            .map_err(|e| SessionError::key_material(format!("Invalid X.509 certificate: {e}")))?;
        Ok(Self { der })
    }

    /// RSA public key from the certificate's subject public key info
    ///
    /// # Errors
    ///
    /// Returns `SessionError::KeyMaterial` if the certificate does not carry
    /// an RSA key.
    pub fn public_key(&self) -> Result<RsaPublicKey> {
        let certificate = x509_cert::Certificate::from_der(&self.der)
            .map_err(|e| SessionError::key_material(format!("Invalid X.509 certificate: {e}")))?;
        let spki = certificate
            .tbs_certificate
            .subject_public_key_info
            .to_der()
            .map_err(|e| SessionError::key_material(format!("Invalid subject public key info: {e}")))?;
        RsaPublicKey::from_public_key_der(&spki)
            .map_err(|e| SessionError::key_material(format!("Certificate key is not RSA: {e}")))
    }

    /// Parse a PEM `CERTIFICATE` block
    ///
    /// # Errors
    ///
    /// Returns `SessionError::KeyMaterial` for malformed PEM or a block with
    /// a different label.
    pub fn from_pem(text: &str) -> Result<Self> {
        let (label, der) = pem::decode_vec(text.trim().as_bytes())
            .map_err(|e| SessionError::key_material(format!("Invalid certificate PEM: {e}")))?;
        if label != CERTIFICATE_LABEL {
            return Err(SessionError::key_material(format!(
                "Expected a {CERTIFICATE_LABEL} PEM block, found {label}"
            )));
        }
        Self::from_der(der)
    }

    /// Encode as PEM text
    ///
    /// # Errors
    ///
    /// Returns `SessionError::KeyMaterial` if encoding fails.
    pub fn to_pem(&self) -> Result<String> {
        pem::encode_string(CERTIFICATE_LABEL, LineEnding::LF, &self.der)
            .map_err(|e| SessionError::key_material(format!("Failed to encode certificate: {e}")))
    }

    /// DER bytes
    #[must_use]
    pub fn der(&self) -> &[u8] {
        &self.der
    }
}

/// A client certificate with its private key
#[derive(Clone)]
pub struct CertificateMaterial {
    certificate: Certificate,
    private_key: RsaPrivateKey,
}

impl std::fmt::Debug for CertificateMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateMaterial")
            .field("certificate", &self.certificate)
            .field("private_key", &"[REDACTED]")
            .finish()
    }
}

impl CertificateMaterial {
    /// Pair a certificate with its key
    ///
    /// # Errors
    ///
    /// Returns `SessionError::KeyMaterial` if the key does not belong to the
    /// certificate.
    pub fn new(certificate: Certificate, private_key: RsaPrivateKey) -> Result<Self> {
        if certificate.public_key()? != private_key.to_public_key() {
            return Err(SessionError::key_material(
                "Private key does not match the certificate's public key",
            ));
        }
        Ok(Self {
            certificate,
            private_key,
        })
    }

    /// Parse a certificate PEM and a PKCS#8 or PKCS#1 private key PEM
    ///
    /// # Errors
    ///
    /// Returns `SessionError::KeyMaterial` if either part cannot be parsed
    /// or they do not belong together.
    pub fn from_pem(certificate_pem: &str, private_key_pem: &str) -> Result<Self> {
        Self::new(
            Certificate::from_pem(certificate_pem)?,
            parse_private_key(private_key_pem)?,
        )
    }

    /// Read certificate and key from PEM files
    ///
    /// # Errors
    ///
    /// Returns `SessionError::KeyMaterial` if a file cannot be read or parsed.
    pub fn from_pem_files(certificate_path: &Path, private_key_path: &Path) -> Result<Self> {
        let read = |path: &Path| {
            std::fs::read_to_string(path).map_err(|e| {
                SessionError::key_material(format!("Cannot read {}: {e}", path.display()))
            })
        };
        Self::from_pem(&read(certificate_path)?, &read(private_key_path)?)
    }

    /// The client certificate
    #[must_use]
    pub fn certificate(&self) -> &Certificate {
        &self.certificate
    }

    /// The RSA private key
    #[must_use]
    pub fn private_key(&self) -> &RsaPrivateKey {
        &self.private_key
    }
}

fn parse_private_key(text: &str) -> Result<RsaPrivateKey> {
    let text = text.trim();
    RsaPrivateKey::from_pkcs8_pem(text)
        .or_else(|_| RsaPrivateKey::from_pkcs1_pem(text))
        .map_err(|e| SessionError::key_material(format!("Invalid RSA private key: {e}")))
}

#[derive(Clone, Serialize, Deserialize)]
struct StoredEntry {
    certificate_pem: String,
    private_key_pem: String,
}

#[derive(Serialize, Deserialize)]
struct KeyStoreDocument {
    version: u32,
    entries: BTreeMap<String, StoredEntry>,
}

/// Password-protected collection of aliased certificate entries
#[derive(Default)]
pub struct KeyStore {
    entries: BTreeMap<String, StoredEntry>,
}

impl std::fmt::Debug for KeyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyStore")
            .field("aliases", &self.entries.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl KeyStore {
    /// Empty keystore
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace the entry stored under `alias`
    ///
    /// # Errors
    ///
    /// Returns `SessionError::KeyMaterial` if the material cannot be encoded.
    pub fn insert(&mut self, alias: impl Into<String>, material: &CertificateMaterial) -> Result<()> {
        let private_key_pem = material
            .private_key()
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| SessionError::key_material(format!("Failed to encode private key: {e}")))?;
        let entry = StoredEntry {
            certificate_pem: material.certificate().to_pem()?,
            private_key_pem: private_key_pem.to_string(),
        };
        self.entries.insert(alias.into(), entry);
        Ok(())
    }

    /// Aliases present in the keystore, sorted
    pub fn aliases(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Load the material stored under `alias`
    ///
    /// # Errors
    ///
    /// Returns `SessionError::KeyMaterial` if the alias is missing or its
    /// content cannot be parsed.
    pub fn entry(&self, alias: &str) -> Result<CertificateMaterial> {
        let entry = self
            .entries
            .get(alias)
            .ok_or_else(|| SessionError::key_material(format!("No keystore entry for alias '{alias}'")))?;
        CertificateMaterial::from_pem(&entry.certificate_pem, &entry.private_key_pem)
    }

    /// Open a keystore file with its password
    ///
    /// # Errors
    ///
    /// Returns `SessionError::KeyMaterial` if the file is missing, corrupt,
    /// or the password is wrong.
    pub fn open(path: &Path, password: &str) -> Result<Self> {
        Self::open_with(path, &PassphraseCipher::new(password))
    }

    /// Open a keystore file with an explicit cipher
    ///
    /// # Errors
    ///
    /// See [`KeyStore::open`].
    pub fn open_with(path: &Path, cipher: &dyn RecordCipher) -> Result<Self> {
        let raw = std::fs::read(path).map_err(|e| {
            SessionError::key_material(format!("Cannot read keystore {}: {e}", path.display()))
        })?;
        let envelope: SealedEnvelope = serde_json::from_slice(&raw)
            .map_err(|e| SessionError::key_material(format!("Keystore is not readable: {e}")))?;
        let plaintext = cipher.open(&envelope)?;
        let document: KeyStoreDocument = serde_json::from_slice(&plaintext)
            .map_err(|e| SessionError::key_material(format!("Keystore content is corrupt: {e}")))?;
        if document.version != KEYSTORE_VERSION {
            return Err(SessionError::key_material(format!(
                "Unsupported keystore version {}",
                document.version
            )));
        }
        Ok(Self {
            entries: document.entries,
        })
    }

    /// Seal and write the keystore to `path`
    ///
    /// # Errors
    ///
    /// Returns an error if encryption or the atomic write fails.
    pub fn save(&self, path: &Path, password: &str) -> Result<()> {
        self.save_with(path, &PassphraseCipher::new(password))
    }

    /// Seal with an explicit cipher and write to `path`
    ///
    /// # Errors
    ///
    /// See [`KeyStore::save`].
    pub fn save_with(&self, path: &Path, cipher: &dyn RecordCipher) -> Result<()> {
        let document = KeyStoreDocument {
            version: KEYSTORE_VERSION,
            entries: self.entries.clone(),
        };
        let envelope = cipher.seal(&serde_json::to_vec(&document)?)?;
        write_private_file_atomically(path, &serde_json::to_vec_pretty(&envelope)?)?;
        Ok(())
    }
}
