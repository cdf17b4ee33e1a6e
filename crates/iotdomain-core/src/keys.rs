//! P-256 key pairs, PEM text encoding and ES256 signatures
//!
//! Keys travel inside JSON documents, so both halves of a key pair have a
//! text form: PKCS#8 PEM for private keys and SubjectPublicKeyInfo PEM for
//! public keys. Signatures are SHA-256/ECDSA over P-256 in the fixed 64-byte
//! `r || s` form, base64 encoded.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use p256::ecdsa::signature::{Signer, Verifier};
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use p256::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use sha2::{Digest, Sha256};

use crate::error::{PublisherError, PublisherResult};

pub use p256::{PublicKey, SecretKey};

/// Attempts before giving up on drawing a valid scalar.
/// A random 32-byte string is out of range with probability ~2^-32.
const MAX_KEYGEN_ATTEMPTS: usize = 8;

/// Generate a new P-256 key pair.
///
/// Fails only when the OS random source is unavailable.
pub fn generate_key_pair() -> PublisherResult<(SecretKey, PublicKey)> {
    let secret = random_secret_key()?;
    let public = secret.public_key();
    Ok((secret, public))
}

/// Draw a uniformly random secret scalar.
///
/// Uses getrandom directly to avoid rand_core version conflicts with p256.
pub(crate) fn random_secret_key() -> PublisherResult<SecretKey> {
    for _ in 0..MAX_KEYGEN_ATTEMPTS {
        let mut seed = [0u8; 32];
        getrandom::getrandom(&mut seed)
            .map_err(|e| PublisherError::KeyGeneration(format!("no OS randomness: {}", e)))?;
        if let Ok(secret) = SecretKey::from_slice(&seed) {
            return Ok(secret);
        }
    }
    Err(PublisherError::KeyGeneration(
        "could not draw a valid P-256 scalar".to_string(),
    ))
}

/// Encode a private key as PKCS#8 PEM
pub fn encode_private_key(key: &SecretKey) -> PublisherResult<String> {
    let pem = key
        .to_pkcs8_pem(LineEnding::LF)
        .map_err(|e| PublisherError::Crypto(format!("Failed to encode private key: {}", e)))?;
    Ok(pem.as_str().to_owned())
}

/// Decode a PKCS#8 PEM private key
pub fn decode_private_key(pem: &str) -> PublisherResult<SecretKey> {
    SecretKey::from_pkcs8_pem(pem.trim())
        .map_err(|e| PublisherError::Malformed(format!("Invalid private key: {}", e)))
}

/// Encode a public key as SubjectPublicKeyInfo PEM
pub fn encode_public_key(key: &PublicKey) -> PublisherResult<String> {
    key.to_public_key_pem(LineEnding::LF)
        .map_err(|e| PublisherError::Crypto(format!("Failed to encode public key: {}", e)))
}

/// Decode a SubjectPublicKeyInfo PEM public key
pub fn decode_public_key(pem: &str) -> PublisherResult<PublicKey> {
    PublicKey::from_public_key_pem(pem.trim())
        .map_err(|e| PublisherError::Malformed(format!("Invalid public key: {}", e)))
}

/// Sign a message and return the base64 signature.
///
/// A missing key produces an empty string, which receivers treat as unsigned.
pub fn sign(message: &[u8], key: Option<&SecretKey>) -> String {
    match key {
        Some(key) => STANDARD.encode(sign_bytes(message, key)),
        None => String::new(),
    }
}

/// Sign a message and return the raw 64-byte signature
pub fn sign_bytes(message: &[u8], key: &SecretKey) -> Vec<u8> {
    let signing_key = SigningKey::from(key);
    let signature: Signature = signing_key.sign(message);
    signature.to_bytes().to_vec()
}

/// Verify a base64 signature. Never panics; malformed input is `false`.
pub fn verify(message: &[u8], signature: &str, key: &PublicKey) -> bool {
    if signature.is_empty() {
        return false;
    }
    match STANDARD.decode(signature) {
        Ok(bytes) => verify_bytes(message, &bytes, key),
        Err(_) => false,
    }
}

/// Verify a raw 64-byte signature
pub fn verify_bytes(message: &[u8], signature: &[u8], key: &PublicKey) -> bool {
    let Ok(signature) = Signature::from_slice(signature) else {
        return false;
    };
    VerifyingKey::from(key).verify(message, &signature).is_ok()
}

/// Short, stable fingerprint of a public key for logs and display
pub fn fingerprint(key: &PublicKey) -> String {
    let digest = Sha256::digest(key.to_sec1_bytes());
    hex::encode(&digest[..8])
}

/// Whether a public key belongs to a private key
pub fn is_key_pair(secret: &SecretKey, public: &PublicKey) -> bool {
    &secret.public_key() == public
}
