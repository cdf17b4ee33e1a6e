//! Signed and encrypted message envelopes
//!
//! Both envelopes are compact, dot-separated, base64url text so they can be
//! published as plain string payloads.
//!
//! ## Wire Format
//!
//! ```text
//! signed:    b64u(header) . b64u(payload) . b64u(signature)
//!            header = {"alg":"ES256","typ":"JWS","iss":"<domain>/<publisherId>"}
//!            signature = ES256 over "b64u(header).b64u(payload)"
//!
//! encrypted: b64u(header) . b64u(nonce) . b64u(ciphertext + tag)
//!            header = {"alg":"ECDH-ES","enc":"C20P","typ":"JWE","epk":"<PEM>"}
//!            aad = b64u(header)
//! ```
//!
//! ## Security Model
//!
//! Messages are **signed, then encrypted**. The signature is over the
//! plaintext payload and sits inside the ciphertext, so an attacker holding
//! the ciphertext cannot strip the signature and substitute their own.
//! The issuer is carried in the signed header so a receiver can look up the
//! verification key before parsing the payload.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use serde::{Deserialize, Serialize};

use crate::crypto::{agree, ContentCipher, EphemeralAgreement, NONCE_SIZE};
use crate::error::{PublisherError, PublisherResult};
use crate::keys::{self, decode_public_key, encode_public_key, PublicKey, SecretKey};

/// Signature algorithm name in signed headers
pub const SIGNED_ALGORITHM: &str = "ES256";
/// Type tag of signed envelopes
pub const SIGNED_TYPE: &str = "JWS";
/// Key agreement name in encrypted headers
pub const ENCRYPTED_ALGORITHM: &str = "ECDH-ES";
/// Content encryption name in encrypted headers
pub const CONTENT_ENCRYPTION: &str = "C20P";
/// Type tag of encrypted envelopes
pub const ENCRYPTED_TYPE: &str = "JWE";

/// Which envelope a wire message is, judged from its header alone
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeKind {
    Signed,
    Encrypted,
}

impl EnvelopeKind {
    /// Detect an envelope. Anything that is not three base64url parts with a
    /// recognised header is `None` (for example raw JSON).
    pub fn detect(wire: &str) -> Option<Self> {
        let parts: Vec<&str> = wire.trim().split('.').collect();
        if parts.len() != 3 {
            return None;
        }
        let header = URL_SAFE_NO_PAD.decode(parts[0]).ok()?;
        let header: serde_json::Value = serde_json::from_slice(&header).ok()?;
        match header.get("typ")?.as_str()? {
            SIGNED_TYPE => Some(EnvelopeKind::Signed),
            ENCRYPTED_TYPE => Some(EnvelopeKind::Encrypted),
            _ => None,
        }
    }
}

/// Protected header of a signed envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignedHeader {
    pub alg: String,
    pub typ: String,
    /// Publisher address of the signer (`domain/publisherId`)
    pub iss: String,
}

/// A parsed signed envelope
#[derive(Debug, Clone)]
pub struct SignedEnvelope {
    header: SignedHeader,
    payload: Vec<u8>,
    signature: Vec<u8>,
    /// `b64u(header).b64u(payload)` exactly as received
    signing_input: String,
}

impl SignedEnvelope {
    /// Sign a payload on behalf of `issuer` and return the wire text.
    pub fn seal(payload: &[u8], issuer: &str, key: &SecretKey) -> PublisherResult<String> {
        let header = SignedHeader {
            alg: SIGNED_ALGORITHM.to_string(),
            typ: SIGNED_TYPE.to_string(),
            iss: issuer.to_string(),
        };
        let header_json = serde_json::to_vec(&header)?;
        let signing_input = format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(header_json),
            URL_SAFE_NO_PAD.encode(payload)
        );
        let signature = keys::sign_bytes(signing_input.as_bytes(), key);
        Ok(format!(
            "{}.{}",
            signing_input,
            URL_SAFE_NO_PAD.encode(signature)
        ))
    }

    /// Parse wire text without verifying it.
    pub fn parse(wire: &str) -> PublisherResult<Self> {
        let wire = wire.trim();
        let (signing_input, signature) = wire
            .rsplit_once('.')
            .ok_or_else(|| PublisherError::Malformed("signed envelope needs 3 parts".into()))?;
        let (header_b64, payload_b64) = signing_input
            .split_once('.')
            .ok_or_else(|| PublisherError::Malformed("signed envelope needs 3 parts".into()))?;

        let header: SignedHeader = serde_json::from_slice(&decode_part(header_b64, "header")?)?;
        if header.typ != SIGNED_TYPE || header.alg != SIGNED_ALGORITHM {
            return Err(PublisherError::Malformed(format!(
                "unsupported signed envelope {}/{}",
                header.typ, header.alg
            )));
        }
        if header.iss.is_empty() {
            return Err(PublisherError::MissingField("iss"));
        }

        Ok(Self {
            header,
            payload: decode_part(payload_b64, "payload")?,
            signature: decode_part(signature, "signature")?,
            signing_input: signing_input.to_string(),
        })
    }

    /// Verify the signature against a public key
    pub fn verify(&self, key: &PublicKey) -> bool {
        keys::verify_bytes(self.signing_input.as_bytes(), &self.signature, key)
    }

    /// Issuer address from the protected header
    pub fn issuer(&self) -> &str {
        &self.header.iss
    }

    /// Signed header
    pub fn header(&self) -> &SignedHeader {
        &self.header
    }

    /// Payload bytes. Only trust these after [`SignedEnvelope::verify`].
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }
}

/// Header of an encrypted envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncryptedHeader {
    pub alg: String,
    pub enc: String,
    pub typ: String,
    /// Ephemeral public key (PEM) for the key agreement
    pub epk: String,
}

/// A parsed encrypted envelope
#[derive(Debug, Clone)]
pub struct EncryptedEnvelope {
    header: EncryptedHeader,
    header_b64: String,
    nonce: [u8; NONCE_SIZE],
    ciphertext: Vec<u8>,
}

impl EncryptedEnvelope {
    /// Encrypt a plaintext for one recipient and return the wire text.
    pub fn seal(plaintext: &[u8], recipient: &PublicKey) -> PublisherResult<String> {
        let agreement = EphemeralAgreement::with_recipient(recipient)?;
        let header = EncryptedHeader {
            alg: ENCRYPTED_ALGORITHM.to_string(),
            enc: CONTENT_ENCRYPTION.to_string(),
            typ: ENCRYPTED_TYPE.to_string(),
            epk: encode_public_key(&agreement.ephemeral_public)?,
        };
        let header_b64 = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&header)?);

        let nonce = ContentCipher::generate_nonce();
        let ciphertext = ContentCipher::new(&agreement.content_key).encrypt(
            plaintext,
            &nonce,
            header_b64.as_bytes(),
        )?;

        Ok(format!(
            "{}.{}.{}",
            header_b64,
            URL_SAFE_NO_PAD.encode(nonce),
            URL_SAFE_NO_PAD.encode(ciphertext)
        ))
    }

    /// Parse wire text without decrypting it.
    pub fn parse(wire: &str) -> PublisherResult<Self> {
        let parts: Vec<&str> = wire.trim().split('.').collect();
        if parts.len() != 3 {
            return Err(PublisherError::Malformed(
                "encrypted envelope needs 3 parts".into(),
            ));
        }

        let header: EncryptedHeader = serde_json::from_slice(&decode_part(parts[0], "header")?)?;
        if header.typ != ENCRYPTED_TYPE
            || header.alg != ENCRYPTED_ALGORITHM
            || header.enc != CONTENT_ENCRYPTION
        {
            return Err(PublisherError::Malformed(format!(
                "unsupported encrypted envelope {}/{}/{}",
                header.typ, header.alg, header.enc
            )));
        }

        let nonce: [u8; NONCE_SIZE] = decode_part(parts[1], "nonce")?
            .try_into()
            .map_err(|_| PublisherError::Malformed("nonce must be 12 bytes".into()))?;

        Ok(Self {
            header,
            header_b64: parts[0].to_string(),
            nonce,
            ciphertext: decode_part(parts[2], "ciphertext")?,
        })
    }

    /// Decrypt with the recipient's private key
    pub fn open(&self, own_key: &SecretKey) -> PublisherResult<Vec<u8>> {
        let ephemeral = decode_public_key(&self.header.epk)
            .map_err(|e| PublisherError::DecryptionFailed(format!("bad ephemeral key: {}", e)))?;
        let content_key = agree(own_key, &ephemeral);
        ContentCipher::new(&content_key).decrypt(
            &self.ciphertext,
            &self.nonce,
            self.header_b64.as_bytes(),
        )
    }

    /// Encrypted header
    pub fn header(&self) -> &EncryptedHeader {
        &self.header
    }
}

fn decode_part(part: &str, name: &str) -> PublisherResult<Vec<u8>> {
    URL_SAFE_NO_PAD
        .decode(part)
        .map_err(|e| PublisherError::Malformed(format!("envelope {} is not base64url: {}", name, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::generate_key_pair;

    #[test]
    fn test_signed_seal_parse_verify() {
        let (secret, public) = generate_key_pair().unwrap();
        let wire = SignedEnvelope::seal(b"{\"a\":1}", "home/pub1", &secret).unwrap();

        assert_eq!(EnvelopeKind::detect(&wire), Some(EnvelopeKind::Signed));
        let envelope = SignedEnvelope::parse(&wire).unwrap();
        assert_eq!(envelope.issuer(), "home/pub1");
        assert_eq!(envelope.payload(), b"{\"a\":1}");
        assert!(envelope.verify(&public));
    }

    #[test]
    fn test_signed_wrong_key_fails() {
        let (secret, _) = generate_key_pair().unwrap();
        let (_, other) = generate_key_pair().unwrap();
        let wire = SignedEnvelope::seal(b"{}", "home/pub1", &secret).unwrap();
        assert!(!SignedEnvelope::parse(&wire).unwrap().verify(&other));
    }

    #[test]
    fn test_signed_tampered_payload_fails() {
        let (secret, public) = generate_key_pair().unwrap();
        let wire = SignedEnvelope::seal(b"{\"value\":\"off\"}", "home/pub1", &secret).unwrap();
        let parts: Vec<&str> = wire.split('.').collect();
        let forged = format!(
            "{}.{}.{}",
            parts[0],
            URL_SAFE_NO_PAD.encode(b"{\"value\":\"on\"}"),
            parts[2]
        );
        assert!(!SignedEnvelope::parse(&forged).unwrap().verify(&public));
    }

    #[test]
    fn test_signed_issuer_swap_fails() {
        let (secret, public) = generate_key_pair().unwrap();
        let wire = SignedEnvelope::seal(b"{}", "home/pub1", &secret).unwrap();
        let parts: Vec<&str> = wire.split('.').collect();
        let header = SignedHeader {
            alg: SIGNED_ALGORITHM.into(),
            typ: SIGNED_TYPE.into(),
            iss: "home/dss".into(),
        };
        let forged = format!(
            "{}.{}.{}",
            URL_SAFE_NO_PAD.encode(serde_json::to_vec(&header).unwrap()),
            parts[1],
            parts[2]
        );
        let envelope = SignedEnvelope::parse(&forged).unwrap();
        assert_eq!(envelope.issuer(), "home/dss");
        assert!(!envelope.verify(&public));
    }

    #[test]
    fn test_encrypted_seal_open() {
        let (secret, public) = generate_key_pair().unwrap();
        let wire = EncryptedEnvelope::seal(b"secret payload", &public).unwrap();

        assert_eq!(EnvelopeKind::detect(&wire), Some(EnvelopeKind::Encrypted));
        let envelope = EncryptedEnvelope::parse(&wire).unwrap();
        assert_eq!(envelope.open(&secret).unwrap(), b"secret payload");
    }

    #[test]
    fn test_encrypted_wrong_recipient_fails() {
        let (_, public) = generate_key_pair().unwrap();
        let (other_secret, _) = generate_key_pair().unwrap();
        let wire = EncryptedEnvelope::seal(b"secret payload", &public).unwrap();

        let result = EncryptedEnvelope::parse(&wire).unwrap().open(&other_secret);
        assert!(matches!(result, Err(PublisherError::DecryptionFailed(_))));
    }

    #[test]
    fn test_encrypted_header_is_authenticated() {
        let (secret, public) = generate_key_pair().unwrap();
        let wire = EncryptedEnvelope::seal(b"secret", &public).unwrap();
        let parts: Vec<&str> = wire.split('.').collect();

        let mut header = EncryptedEnvelope::parse(&wire).unwrap().header().clone();
        header.enc = CONTENT_ENCRYPTION.to_string();
        header.alg = ENCRYPTED_ALGORITHM.to_string();
        // same values, different serialization whitespace changes the aad
        let reencoded = URL_SAFE_NO_PAD.encode(serde_json::to_string_pretty(&header).unwrap());
        let forged = format!("{}.{}.{}", reencoded, parts[1], parts[2]);

        assert!(EncryptedEnvelope::parse(&forged).unwrap().open(&secret).is_err());
    }

    #[test]
    fn test_detect_raw_json_is_none() {
        assert_eq!(EnvelopeKind::detect("{\"value\":\"on\"}"), None);
        assert_eq!(EnvelopeKind::detect("a.b"), None);
        assert_eq!(EnvelopeKind::detect("a.b.c"), None);
    }

    #[test]
    fn test_parse_malformed() {
        assert!(SignedEnvelope::parse("nodots").is_err());
        assert!(SignedEnvelope::parse("!!!.???.###").is_err());
        assert!(EncryptedEnvelope::parse("a.b").is_err());
    }
}
