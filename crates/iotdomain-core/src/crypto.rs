//! Recipient encryption: P-256 ECDH-ES key agreement + ChaCha20-Poly1305 AEAD
//!
//! A sender that wants only one publisher to read a message generates an
//! ephemeral P-256 key, agrees a shared secret with the recipient's identity
//! key, derives a content key with HKDF-SHA256 and seals the message with
//! ChaCha20-Poly1305.
//!
//! ```text
//! shared      = ECDH(ephemeral_sk, recipient_pk)
//! content_key = HKDF-SHA256(shared, info = "iotdomain-ecdh-es-v1")
//! ciphertext  = ChaCha20-Poly1305(content_key, nonce, plaintext, aad)
//! ```

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Nonce,
};
use hkdf::Hkdf;
use p256::ecdh::diffie_hellman;
use rand::RngCore;
use sha2::Sha256;

use crate::error::{PublisherError, PublisherResult};
use crate::keys::{random_secret_key, PublicKey, SecretKey};

/// Nonce size for ChaCha20-Poly1305 (12 bytes)
pub const NONCE_SIZE: usize = 12;

/// Authentication tag size appended to every ciphertext
pub const TAG_SIZE: usize = 16;

/// Domain separation string for HKDF
const HKDF_INFO: &[u8] = b"iotdomain-ecdh-es-v1";

/// ChaCha20-Poly1305 cipher bound to one content key.
pub struct ContentCipher {
    cipher: ChaCha20Poly1305,
}

impl ContentCipher {
    /// Create a cipher with the given 32-byte key
    pub fn new(key: &[u8; 32]) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(key.into()),
        }
    }

    /// Generate a random 12-byte nonce
    pub fn generate_nonce() -> [u8; NONCE_SIZE] {
        let mut nonce = [0u8; NONCE_SIZE];
        rand::rng().fill_bytes(&mut nonce);
        nonce
    }

    /// Encrypt, authenticating `aad` alongside the ciphertext.
    ///
    /// Output is ciphertext + tag; the nonce is not prepended.
    pub fn encrypt(
        &self,
        plaintext: &[u8],
        nonce: &[u8; NONCE_SIZE],
        aad: &[u8],
    ) -> PublisherResult<Vec<u8>> {
        self.cipher
            .encrypt(Nonce::from_slice(nonce), Payload { msg: plaintext, aad })
            .map_err(|e| PublisherError::Crypto(format!("Encryption failed: {}", e)))
    }

    /// Decrypt and authenticate. Wrong key, nonce, aad or tampering all fail.
    pub fn decrypt(
        &self,
        ciphertext: &[u8],
        nonce: &[u8; NONCE_SIZE],
        aad: &[u8],
    ) -> PublisherResult<Vec<u8>> {
        if ciphertext.len() < TAG_SIZE {
            return Err(PublisherError::DecryptionFailed(
                "ciphertext shorter than authentication tag".to_string(),
            ));
        }
        self.cipher
            .decrypt(Nonce::from_slice(nonce), Payload { msg: ciphertext, aad })
            .map_err(|e| PublisherError::DecryptionFailed(format!("{}", e)))
    }
}

/// Sender side of ECDH-ES: a fresh ephemeral key and the derived content key.
pub struct EphemeralAgreement {
    /// Ephemeral public key to send along with the ciphertext
    pub ephemeral_public: PublicKey,
    /// Content key shared with the recipient
    pub content_key: [u8; 32],
}

impl EphemeralAgreement {
    /// Agree a content key with a recipient's public key
    pub fn with_recipient(recipient: &PublicKey) -> PublisherResult<Self> {
        let ephemeral = random_secret_key()?;
        let content_key = agree(&ephemeral, recipient);
        Ok(Self {
            ephemeral_public: ephemeral.public_key(),
            content_key,
        })
    }
}

/// Derive the content key from our secret and the peer's public key.
///
/// Symmetric: `agree(a, B) == agree(b, A)`.
pub fn agree(secret: &SecretKey, peer: &PublicKey) -> [u8; 32] {
    let shared = diffie_hellman(secret.to_nonzero_scalar(), peer.as_affine());
    derive_key(shared.raw_secret_bytes().as_slice())
}

/// Derive a 32-byte key from a shared secret using HKDF-SHA256.
fn derive_key(shared_secret: &[u8]) -> [u8; 32] {
    let hkdf = Hkdf::<Sha256>::new(None, shared_secret);
    let mut output = [0u8; 32];
    hkdf.expand(HKDF_INFO, &mut output)
        .expect("HKDF expand should never fail with 32-byte output");
    output
}
