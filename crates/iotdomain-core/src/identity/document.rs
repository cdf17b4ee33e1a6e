//! Identity documents and the trust-chain check
//!
//! An identity binds a public key to `domain/publisherId`. It is either
//! signed by its own key (self-signed) or by the domain's DSS. The signature
//! covers the canonical JSON of the identity with an empty
//! `identitySignature` field.

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::address::{make_address, Address, MessageType};
use crate::collection::Discoverable;
use crate::error::{PublisherError, PublisherResult};
use crate::keys::{
    self, decode_private_key, decode_public_key, encode_private_key, encode_public_key,
    generate_key_pair, PublicKey, SecretKey,
};

/// Publisher ID of the Domain Security Service in every domain
pub const DSS_PUBLISHER_ID: &str = "dss";

/// How long a newly issued identity is valid
pub const IDENTITY_VALIDITY_DAYS: i64 = 365;

/// Public identity of a publisher, as published on `domain/publisherId/$identity`
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PublisherIdentity {
    pub address: String,
    pub domain: String,
    pub publisher_id: String,
    pub issuer_id: String,
    /// SubjectPublicKeyInfo PEM
    pub public_key: String,
    pub organization: String,
    pub location: String,
    pub timestamp: DateTime<Utc>,
    pub valid_until: DateTime<Utc>,
    /// Base64 ES256 signature by the issuer
    pub identity_signature: String,
}

impl PublisherIdentity {
    /// Bytes covered by `identity_signature`
    pub fn signing_input(&self) -> PublisherResult<Vec<u8>> {
        let unsigned = PublisherIdentity {
            identity_signature: String::new(),
            ..self.clone()
        };
        Ok(serde_json::to_vec(&unsigned)?)
    }

    /// `domain/publisherId`
    pub fn publisher_address(&self) -> String {
        format!("{}/{}", self.domain, self.publisher_id)
    }

    /// Whether the identity names its own publisher as issuer
    pub fn is_self_signed(&self) -> bool {
        self.issuer_id == self.publisher_id
    }

    /// Decode the embedded public key
    pub fn key(&self) -> PublisherResult<PublicKey> {
        decode_public_key(&self.public_key)
    }
}

impl Discoverable for PublisherIdentity {
    const MESSAGE_TYPE: MessageType = MessageType::Identity;

    fn address(&self) -> &str {
        &self.address
    }
}

/// Identity plus its private key, held only by the owning publisher
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FullIdentity {
    #[serde(flatten)]
    pub identity: PublisherIdentity,
    /// PKCS#8 PEM
    #[serde(default)]
    pub private_key: String,
}

impl FullIdentity {
    /// Decode the private key and check that it matches the public key
    pub fn key_pair(&self) -> PublisherResult<(SecretKey, PublicKey)> {
        if self.private_key.is_empty() {
            return Err(PublisherError::MissingField("privateKey"));
        }
        let secret = decode_private_key(&self.private_key)?;
        let public = self.identity.key()?;
        if !keys::is_key_pair(&secret, &public) {
            return Err(PublisherError::KeyMismatch(format!(
                "private key does not belong to identity {}",
                self.identity.address
            )));
        }
        Ok((secret, public))
    }
}

impl fmt::Debug for FullIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FullIdentity")
            .field("identity", &self.identity)
            .field("private_key", &"<redacted>")
            .finish()
    }
}

/// Who signs a newly issued identity
#[derive(Clone, Copy)]
pub enum Issuer<'a> {
    /// The new identity's own key
    SelfSigned,
    /// The DSS private key
    Dss(&'a SecretKey),
}

/// Descriptive fields for a new identity
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdentityRequest {
    pub domain: String,
    pub publisher_id: String,
    pub organization: String,
    pub location: String,
}

impl IdentityRequest {
    pub fn new(domain: impl Into<String>, publisher_id: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            publisher_id: publisher_id.into(),
            ..Default::default()
        }
    }

    pub fn with_organization(mut self, organization: impl Into<String>) -> Self {
        self.organization = organization.into();
        self
    }

    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = location.into();
        self
    }
}

/// Mint a new identity with fresh keys.
///
/// Key generation failure is the only error a valid request can produce.
pub fn issue_identity(request: &IdentityRequest, issuer: Issuer<'_>) -> PublisherResult<FullIdentity> {
    let (secret, public) = generate_key_pair()?;
    let now = Utc::now();

    let issuer_id = match issuer {
        Issuer::SelfSigned => request.publisher_id.clone(),
        Issuer::Dss(_) => DSS_PUBLISHER_ID.to_string(),
    };
    let mut identity = PublisherIdentity {
        address: make_address(
            &request.domain,
            &request.publisher_id,
            "",
            "",
            "",
            Some(MessageType::Identity),
        ),
        domain: request.domain.clone(),
        publisher_id: request.publisher_id.clone(),
        issuer_id,
        public_key: encode_public_key(&public)?,
        organization: request.organization.clone(),
        location: request.location.clone(),
        timestamp: now,
        valid_until: now + Duration::days(IDENTITY_VALIDITY_DAYS),
        identity_signature: String::new(),
    };

    let signing_key = match issuer {
        Issuer::SelfSigned => &secret,
        Issuer::Dss(dss_key) => dss_key,
    };
    sign_identity(&mut identity, signing_key)?;

    Ok(FullIdentity {
        identity,
        private_key: encode_private_key(&secret)?,
    })
}

/// Create a self-signed identity valid for one year
pub fn create_self_signed(domain: &str, publisher_id: &str) -> PublisherResult<FullIdentity> {
    issue_identity(&IdentityRequest::new(domain, publisher_id), Issuer::SelfSigned)
}

/// (Re)compute `identity_signature` with the issuer's key
pub fn sign_identity(identity: &mut PublisherIdentity, issuer_key: &SecretKey) -> PublisherResult<()> {
    let input = identity.signing_input()?;
    identity.identity_signature = keys::sign(&input, Some(issuer_key));
    Ok(())
}

/// Check an identity against the expected publisher and the trust roots.
///
/// Checks run in a fixed order and the first failure is returned:
/// required fields, address, issuer, expiry, signature.
pub fn verify_identity(
    identity: &PublisherIdentity,
    expected_domain: &str,
    expected_publisher_id: &str,
    trusted_dss_key: Option<&PublicKey>,
) -> PublisherResult<()> {
    if identity.public_key.is_empty() {
        return Err(PublisherError::MissingField("publicKey"));
    }
    if identity.domain.is_empty() {
        return Err(PublisherError::MissingField("domain"));
    }
    if identity.issuer_id.is_empty() {
        return Err(PublisherError::MissingField("issuerId"));
    }
    if identity.identity_signature.is_empty() {
        return Err(PublisherError::MissingField("identitySignature"));
    }

    let expected = format!("{}/{}", expected_domain, expected_publisher_id);
    let address_matches = Address::parse(&identity.address).is_ok_and(|address| {
        address.domain == expected_domain
            && address.publisher_id == expected_publisher_id
            && address.node_id.is_none()
            && matches!(address.message_type, None | Some(MessageType::Identity))
    });
    if !address_matches
        || identity.domain != expected_domain
        || identity.publisher_id != expected_publisher_id
    {
        return Err(PublisherError::AddressMismatch {
            expected,
            actual: identity.address.clone(),
        });
    }

    if !identity.is_self_signed() && identity.issuer_id != DSS_PUBLISHER_ID {
        return Err(PublisherError::UnknownIssuer(identity.issuer_id.clone()));
    }

    if identity.valid_until < Utc::now() {
        return Err(PublisherError::Expired(identity.valid_until));
    }

    // the DSS's own identity is self-signed, so the self check comes first
    let verifying_key = if identity.is_self_signed() {
        identity.key()?
    } else {
        *trusted_dss_key.ok_or_else(|| {
            PublisherError::UntrustedIssuer(format!(
                "no trusted DSS key for {}",
                identity.domain
            ))
        })?
    };

    let input = identity.signing_input()?;
    if !keys::verify(&input, &identity.identity_signature, &verifying_key) {
        return Err(PublisherError::SignatureInvalid(format!(
            "identity of {} not signed by {}",
            expected, identity.issuer_id
        )));
    }
    Ok(())
}
