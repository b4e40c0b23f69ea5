//! Certificate scheme: sign a random challenge with the client key

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use rand::{Rng, RngCore};
use rand::rngs::OsRng;
use reqwest::Method;
use reqwest::header::AUTHORIZATION;
use rsa::RsaPrivateKey;
use rsa::pkcs1v15::SigningKey;
use rsa::signature::{SignatureEncoding, Signer};
use serde::{Deserialize, Serialize};
use sha2::Sha512;
use std::ops::RangeInclusive;
use tokio_util::sync::CancellationToken;

use super::AuthScheme;
use super::token::exchange;
use crate::error::{Result, SessionError};
use crate::keystore::{Certificate, CertificateMaterial};
use crate::transport::HttpTransport;
use crate::types::Session;
use crate::types::options::AUTHENTICATE_PATH;

/// `Authorization` scheme word carrying the certificate hash
pub const CERTIFICATE_AUTH_SCHEME: &str = "CACertificate";

/// JSON body of a certificate login
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChallengeBody {
    /// Base64 random challenge
    pub encoded_challenge: String,
    /// Base64 signature over the raw challenge bytes
    pub encoded_signature: String,
}

/// Base64 of the certificate's PEM text
///
/// # Errors
///
/// Returns `SessionError::KeyMaterial` if the certificate cannot be encoded.
pub fn generate_cert_hash(certificate: &Certificate) -> Result<String> {
    Ok(BASE64.encode(certificate.to_pem()?))
}

/// Inverse of [`generate_cert_hash`]
///
/// # Errors
///
/// Returns `SessionError::KeyMaterial` if the value is not base64 PEM of a
/// certificate.
pub fn decode_cert_hash(hash: &str) -> Result<Certificate> {
    let pem = BASE64
        .decode(hash)
        .map_err(|e| SessionError::key_material(format!("Certificate hash is not base64: {e}")))?;
    let text = String::from_utf8(pem)
        .map_err(|_| SessionError::key_material("Certificate hash is not PEM text"))?;
    Certificate::from_pem(&text)
}

/// Random bytes with a length drawn from `len`
#[must_use]
pub fn random_challenge(len: RangeInclusive<usize>) -> Vec<u8> {
    let size = rand::thread_rng().gen_range(len);
    let mut challenge = vec![0u8; size];
    OsRng.fill_bytes(&mut challenge);
    challenge
}

/// RSASSA-PKCS1-v1_5 signature with SHA-512
///
/// # Errors
///
/// Returns `SessionError::KeyMaterial` if the key cannot sign.
pub fn sign_challenge(key: &RsaPrivateKey, challenge: &[u8]) -> Result<Vec<u8>> {
    let signing_key = SigningKey::<Sha512>::new(key.clone());
    let signature = signing_key
        .try_sign(challenge)
        .map_err(|e| SessionError::key_material(format!("Failed to sign challenge: {e}")))?;
    Ok(signature.to_vec())
}

/// Signed challenge ready to send
///
/// # Errors
///
/// Returns `SessionError::KeyMaterial` if signing fails.
pub fn challenge_body(key: &RsaPrivateKey, len: RangeInclusive<usize>) -> Result<ChallengeBody> {
    let challenge = random_challenge(len);
    let signature = sign_challenge(key, &challenge)?;
    Ok(ChallengeBody {
        encoded_challenge: BASE64.encode(&challenge),
        encoded_signature: BASE64.encode(signature),
    })
}

/// Login with a client certificate and its private key
#[derive(Debug)]
pub struct CertificateScheme {
    material: CertificateMaterial,
}

impl CertificateScheme {
    /// Scheme for the given certificate and key
    #[must_use]
    pub fn new(material: CertificateMaterial) -> Self {
        Self { material }
    }
}

#[async_trait]
impl AuthScheme for CertificateScheme {
    fn name(&self) -> &'static str {
        "certificate"
    }

    async fn authenticate(&self, http: &HttpTransport, cancel: &CancellationToken) -> Result<Session> {
        let hash = generate_cert_hash(self.material.certificate())?;
        let body = challenge_body(self.material.private_key(), http.config().challenge_len.clone())?;
        tracing::debug!(
            certificate_bytes = self.material.certificate().der().len(),
            "Signed login challenge"
        );

        let request = http
            .request(Method::POST, http.config().auth_endpoint(AUTHENTICATE_PATH))
            .header(AUTHORIZATION, format!("{CERTIFICATE_AUTH_SCHEME} {hash}"))
            .json(&body);
        exchange(http, request, cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rsa::pkcs1v15::{Signature, VerifyingKey};
    use rsa::signature::Verifier;

    fn material() -> CertificateMaterial {
        CertificateMaterial::from_pem(
            include_str!("../../tests/fixtures/client_cert.pem"),
            include_str!("../../tests/fixtures/client_key.pem"),
        )
        .unwrap()
    }

    #[test]
    fn test_cert_hash_round_trip() {
        let material = material();
        let hash = generate_cert_hash(material.certificate()).unwrap();

        let pem = String::from_utf8(BASE64.decode(&hash).unwrap()).unwrap();
        assert!(pem.starts_with("-----BEGIN CERTIFICATE-----"));
        assert_eq!(&decode_cert_hash(&hash).unwrap(), material.certificate());
    }

    #[test]
    fn test_decode_cert_hash_rejects_garbage() {
        assert!(matches!(
            decode_cert_hash("!!!"),
            Err(SessionError::KeyMaterial(_))
        ));
        assert!(decode_cert_hash(&BASE64.encode("not pem")).is_err());
    }

    #[test]
    fn test_challenge_length_within_bounds() {
        for _ in 0..50 {
            let len = random_challenge(100..=200).len();
            assert!((100..=200).contains(&len));
        }
        assert_eq!(random_challenge(16..=16).len(), 16);
    }

    #[test]
    fn test_signature_verifies_with_public_key() {
        let material = material();
        let body = challenge_body(material.private_key(), 100..=200).unwrap();

        let challenge = BASE64.decode(&body.encoded_challenge).unwrap();
        let signature = Signature::try_from(BASE64.decode(&body.encoded_signature).unwrap().as_slice()).unwrap();
        let verifying_key = VerifyingKey::<Sha512>::new(material.private_key().to_public_key());
        assert!(verifying_key.verify(&challenge, &signature).is_ok());
    }

    #[test]
    fn test_challenge_body_field_names() {
        let body = challenge_body(material().private_key(), 100..=100).unwrap();
        let json = serde_json::to_value(&body).unwrap();
        assert!(json.get("encodedChallenge").is_some());
        assert!(json.get("encodedSignature").is_some());
    }
}
