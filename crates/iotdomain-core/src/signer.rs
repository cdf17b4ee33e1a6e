//! Encode/decode pipeline applied to every bus message
//!
//! Outbound: JSON → signed envelope → (optionally) encrypted envelope.
//! Inbound: decrypt if encrypted → verify if signed → JSON.
//!
//! Raw JSON is accepted as an unsigned message; it is up to the caller to
//! decide whether unsigned messages are acceptable (see
//! [`MessageSigner::decode_from_sender`]).

use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use crate::address::{base_address, publisher_address};
use crate::envelope::{EncryptedEnvelope, EnvelopeKind, SignedEnvelope};
use crate::error::{PublisherError, PublisherResult};
use crate::keys::{PublicKey, SecretKey};
use crate::transport::Transport;
use crate::types::SenderMessage;

/// Looks up the public key of the publisher owning an address
pub type KeyResolver = Arc<dyn Fn(&str) -> Option<PublicKey> + Send + Sync>;

/// Result of a successful decode
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decoded {
    /// Verified (or unsigned) JSON payload
    pub payload: Vec<u8>,
    pub is_signed: bool,
    pub is_encrypted: bool,
    /// Signer's publisher address, for signed messages
    pub issuer: Option<String>,
}

impl Decoded {
    /// Deserialize the payload
    pub fn parse<T: DeserializeOwned>(&self) -> PublisherResult<T> {
        Ok(serde_json::from_slice(&self.payload)?)
    }
}

/// Serialize, sign and optionally encrypt a payload.
///
/// Without a signing key the JSON is sent as is. The signed text, never the
/// raw payload, is what gets encrypted.
pub fn encode_message<T: Serialize + ?Sized>(
    payload: &T,
    signing_key: Option<&SecretKey>,
    issuer: &str,
    recipient: Option<&PublicKey>,
) -> PublisherResult<String> {
    let json = serde_json::to_string(payload)?;
    let message = match signing_key {
        Some(key) => SignedEnvelope::seal(json.as_bytes(), issuer, key)?,
        None => json,
    };
    match recipient {
        Some(recipient) => EncryptedEnvelope::seal(message.as_bytes(), recipient),
        None => Ok(message),
    }
}

/// Decrypt and verify a wire message.
///
/// `resolve` maps the issuer in a signed header to its public key. The
/// payload is only returned when every applicable check passed.
pub fn decode_message(
    wire: &str,
    own_key: Option<&SecretKey>,
    resolve: impl Fn(&str) -> Option<PublicKey>,
) -> PublisherResult<Decoded> {
    let mut is_encrypted = false;
    let mut text = wire.trim().to_string();

    if EnvelopeKind::detect(&text) == Some(EnvelopeKind::Encrypted) {
        let key = own_key.ok_or_else(|| {
            PublisherError::DecryptionFailed("no private key to decrypt with".to_string())
        })?;
        let plaintext = EncryptedEnvelope::parse(&text)?.open(key)?;
        text = String::from_utf8(plaintext)
            .map_err(|_| PublisherError::Malformed("decrypted payload is not UTF-8".to_string()))?;
        is_encrypted = true;
    }

    match EnvelopeKind::detect(&text) {
        Some(EnvelopeKind::Signed) => {
            let envelope = SignedEnvelope::parse(&text)?;
            let issuer = envelope.issuer().to_string();
            let key = resolve(&issuer).ok_or_else(|| PublisherError::UnknownIssuer(issuer.clone()))?;
            if !envelope.verify(&key) {
                return Err(PublisherError::SignatureInvalid(format!(
                    "signature does not match key of {}",
                    issuer
                )));
            }
            Ok(Decoded {
                payload: envelope.payload().to_vec(),
                is_signed: true,
                is_encrypted,
                issuer: Some(issuer),
            })
        }
        Some(EnvelopeKind::Encrypted) => Err(PublisherError::Malformed(
            "nested encrypted envelope".to_string(),
        )),
        None => {
            serde_json::from_str::<serde_json::Value>(&text)?;
            Ok(Decoded {
                payload: text.into_bytes(),
                is_signed: false,
                is_encrypted,
                issuer: None,
            })
        }
    }
}

/// Signs outbound and verifies inbound messages for one publisher.
///
/// The signing key doubles as the decryption key for messages addressed to
/// this publisher and is swapped when the identity rotates.
pub struct MessageSigner {
    transport: Arc<dyn Transport>,
    issuer: String,
    signing_key: RwLock<Option<SecretKey>>,
    resolver: KeyResolver,
}

impl MessageSigner {
    /// Create a signer for `issuer` (a `domain/publisherId` address)
    pub fn new(
        transport: Arc<dyn Transport>,
        issuer: impl Into<String>,
        signing_key: Option<SecretKey>,
        resolver: KeyResolver,
    ) -> Self {
        Self {
            transport,
            issuer: issuer.into(),
            signing_key: RwLock::new(signing_key),
            resolver,
        }
    }

    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    /// Replace the signing key after an identity rotation
    pub fn set_signing_key(&self, key: SecretKey) {
        *self.signing_key.write() = Some(key);
    }

    pub fn signing_key(&self) -> Option<SecretKey> {
        self.signing_key.read().clone()
    }

    /// Public key of the current signing key
    pub fn public_key(&self) -> Option<PublicKey> {
        self.signing_key.read().as_ref().map(|k| k.public_key())
    }

    /// Encode a payload, encrypting it for `recipient` when given
    pub fn encode<T: Serialize + ?Sized>(
        &self,
        payload: &T,
        recipient: Option<&PublicKey>,
    ) -> PublisherResult<String> {
        let key = self.signing_key();
        encode_message(payload, key.as_ref(), &self.issuer, recipient)
    }

    /// Decode a wire message using our own key and the key resolver
    pub fn decode(&self, wire: &str) -> PublisherResult<Decoded> {
        let key = self.signing_key();
        decode_message(wire, key.as_ref(), |issuer| (self.resolver)(issuer))
    }

    /// Decode and deserialize a wire message
    pub fn decode_object<T: DeserializeOwned>(&self, wire: &str) -> PublisherResult<(T, Decoded)> {
        let decoded = self.decode(wire)?;
        let object = decoded.parse()?;
        Ok((object, decoded))
    }

    /// Decode a command received on `address` and check who sent it.
    ///
    /// Rejects unsigned commands when `require_signed` is set, commands whose
    /// `address` names a different entity than the topic, and commands whose
    /// `sender` is not the publisher that signed them.
    pub fn decode_from_sender<T>(
        &self,
        address: &str,
        wire: &str,
        require_signed: bool,
    ) -> PublisherResult<T>
    where
        T: SenderMessage + DeserializeOwned,
    {
        let (message, decoded): (T, Decoded) = self.decode_object(wire)?;

        if require_signed && !decoded.is_signed {
            return Err(PublisherError::PolicyViolation(format!(
                "unsigned message on {}",
                address
            )));
        }

        let expected = base_address(address);
        let actual = base_address(message.address());
        if expected != actual {
            return Err(PublisherError::AddressMismatch { expected, actual });
        }

        if let Some(issuer) = &decoded.issuer {
            let sender = publisher_address(message.sender())
                .ok_or(PublisherError::MissingField("sender"))?;
            if publisher_address(issuer).as_deref() != Some(sender.as_str()) {
                return Err(PublisherError::PolicyViolation(format!(
                    "sender {} does not match signer {}",
                    sender, issuer
                )));
            }
        }

        Ok(message)
    }

    /// Sign and publish a payload
    pub fn publish_signed<T: Serialize + ?Sized>(
        &self,
        address: &str,
        retained: bool,
        payload: &T,
    ) -> PublisherResult<()> {
        let wire = self.encode(payload, None)?;
        debug!(address, retained, "Publishing signed message");
        self.transport.publish(address, retained, &wire)
    }

    /// Sign, encrypt for `recipient` and publish a payload
    pub fn publish_encrypted<T: Serialize + ?Sized>(
        &self,
        address: &str,
        retained: bool,
        payload: &T,
        recipient: &PublicKey,
    ) -> PublisherResult<()> {
        let wire = self.encode(payload, Some(recipient))?;
        debug!(address, retained, "Publishing encrypted message");
        self.transport.publish(address, retained, &wire)
    }

    /// Subscribe to a pattern and receive only messages that decode.
    ///
    /// Rejected messages are logged and dropped.
    pub fn subscribe<F>(self: &Arc<Self>, pattern: &str, handler: F)
    where
        F: Fn(&str, Decoded) + Send + Sync + 'static,
    {
        let signer: Weak<Self> = Arc::downgrade(self);
        self.transport.subscribe(
            pattern,
            Arc::new(move |address: &str, wire: &str| {
                let Some(signer) = signer.upgrade() else {
                    return;
                };
                match signer.decode(wire) {
                    Ok(decoded) => handler(address, decoded),
                    Err(e) => warn!(address, error = %e, kind = ?e.kind(), "Rejected message"),
                }
            }),
        );
    }
}
