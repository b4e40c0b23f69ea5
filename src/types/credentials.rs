//! Credential schemes
//!
//! A [`Credentials`] value is built once from configuration and handed to
//! [`crate::auth::Authenticator`], which picks the matching scheme.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::Result;
use crate::keystore::{CertificateMaterial, KeyStore};

/// Username/password credentials for Basic or NTLM login
#[derive(Clone, PartialEq, Eq)]
pub struct PasswordCredentials {
    /// Account name
    pub username: String,
    /// Password
    pub secret: String,
    /// NTLM domain; when set the NTLM handshake is used if an engine is plugged in
    pub domain: Option<String>,
    /// NTLM workstation name
    pub workstation: Option<String>,
}

impl std::fmt::Debug for PasswordCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PasswordCredentials")
            .field("username", &self.username)
            .field("secret", &"[REDACTED]")
            .field("domain", &self.domain)
            .field("workstation", &self.workstation)
            .finish()
    }
}

impl PasswordCredentials {
    /// `base64(username:secret)`, the Basic authorization digest
    #[must_use]
    pub fn basic_digest(&self) -> String {
        BASE64.encode(format!("{}:{}", self.username, self.secret))
    }
}

/// Whether the server replaces the refresh token on every use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshPolicy {
    /// Each refresh returns a new refresh token that must be persisted
    #[default]
    Rotatable,
    /// The same refresh token is reused across refreshes
    NonRotatable,
}

impl RefreshPolicy {
    /// True for [`RefreshPolicy::Rotatable`]
    #[must_use]
    pub fn is_rotatable(self) -> bool {
        matches!(self, Self::Rotatable)
    }
}

/// Device/OAuth client registration settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceCredentials {
    /// OAuth client id
    pub client_id: String,
    /// Refresh-token rotation behavior of the server
    pub refresh_policy: RefreshPolicy,
    /// Run the device-code ceremony even if a refresh token is stored
    pub force_register: bool,
}

/// One of the three supported credential schemes
#[derive(Debug, Clone)]
pub enum Credentials {
    /// Basic (or NTLM) username/password login
    Password(PasswordCredentials),
    /// Signed-challenge login with a client certificate
    Certificate(CertificateMaterial),
    /// OAuth device authorization with a persisted refresh token
    Device(DeviceCredentials),
}

impl Credentials {
    /// Basic username/password credentials
    pub fn password(username: impl Into<String>, secret: impl Into<String>) -> Self {
        Self::Password(PasswordCredentials {
            username: username.into(),
            secret: secret.into(),
            domain: None,
            workstation: None,
        })
    }

    /// NTLM credentials with domain and optional workstation
    pub fn ntlm(
        username: impl Into<String>,
        secret: impl Into<String>,
        domain: impl Into<String>,
        workstation: Option<String>,
    ) -> Self {
        Self::Password(PasswordCredentials {
            username: username.into(),
            secret: secret.into(),
            domain: Some(domain.into()),
            workstation,
        })
    }

    /// Certificate credentials from already-loaded material
    #[must_use]
    pub fn certificate(material: CertificateMaterial) -> Self {
        Self::Certificate(material)
    }

    /// Certificate credentials read from a keystore entry
    ///
    /// # Errors
    ///
    /// Returns `SessionError::KeyMaterial` if the keystore cannot be opened
    /// or has no entry under `alias`.
    pub fn from_keystore(path: &Path, password: &str, alias: &str) -> Result<Self> {
        Ok(Self::Certificate(KeyStore::open(path, password)?.entry(alias)?))
    }

    /// Device/OAuth credentials
    pub fn device(client_id: impl Into<String>, refresh_policy: RefreshPolicy, force_register: bool) -> Self {
        Self::Device(DeviceCredentials {
            client_id: client_id.into(),
            refresh_policy,
            force_register,
        })
    }

    /// Short scheme name for logs
    #[must_use]
    pub fn scheme_name(&self) -> &'static str {
        match self {
            Self::Password(p) if p.domain.is_some() => "ntlm",
            Self::Password(_) => "basic",
            Self::Certificate(_) => "certificate",
            Self::Device(_) => "device",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_digest() {
        let Credentials::Password(creds) = Credentials::password("alice", "s3cret") else {
            panic!("expected password credentials");
        };
        assert_eq!(creds.basic_digest(), "YWxpY2U6czNjcmV0");
    }

    #[test]
    fn test_password_debug_redacts_secret() {
        let debug = format!("{:?}", Credentials::password("alice", "s3cret"));
        assert!(debug.contains("alice"));
        assert!(!debug.contains("s3cret"));
    }

    #[test]
    fn test_scheme_names() {
        assert_eq!(Credentials::password("a", "b").scheme_name(), "basic");
        assert_eq!(Credentials::ntlm("a", "b", "CORP", None).scheme_name(), "ntlm");
        assert_eq!(
            Credentials::device("cid", RefreshPolicy::NonRotatable, false).scheme_name(),
            "device"
        );
    }

    #[test]
    fn test_refresh_policy_serde() {
        let policy: RefreshPolicy = serde_json::from_str("\"non_rotatable\"").unwrap();
        assert_eq!(policy, RefreshPolicy::NonRotatable);
        assert!(!policy.is_rotatable());
        assert!(RefreshPolicy::default().is_rotatable());
    }
}
