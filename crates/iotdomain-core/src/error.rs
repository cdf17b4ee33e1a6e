//! Error types for the iotdomain publisher core

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Main error type for publisher, identity and message operations
#[derive(Error, Debug)]
pub enum PublisherError {
    /// Input could not be parsed (bad JSON, bad envelope, bad address)
    #[error("Malformed input: {0}")]
    Malformed(String),

    /// A required field was empty or absent
    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    /// Error during serialization/deserialization
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Address does not belong to the expected domain/publisher
    #[error("Address mismatch: expected {expected}, got {actual}")]
    AddressMismatch { expected: String, actual: String },

    /// Issuer is neither the publisher itself nor the DSS
    #[error("Unknown issuer: {0}")]
    UnknownIssuer(String),

    /// Issuer is valid in principle but no key is trusted for it yet
    #[error("Untrusted issuer: {0}")]
    UntrustedIssuer(String),

    /// Signature did not verify against the resolved key
    #[error("Signature invalid: {0}")]
    SignatureInvalid(String),

    /// Decryption failed (wrong key, tampered data, or no key available)
    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),

    /// Public key does not belong to the private key it is paired with
    #[error("Key mismatch: {0}")]
    KeyMismatch(String),

    /// Identity validity ended before now
    #[error("Identity expired at {0}")]
    Expired(DateTime<Utc>),

    /// An update is older than the one already accepted
    #[error("Stale update for {address}: {received} is older than {current}")]
    Stale {
        address: String,
        received: DateTime<Utc>,
        current: DateTime<Utc>,
    },

    /// Message claims a sender or issuer inconsistent with its signer
    #[error("Policy violation: {0}")]
    PolicyViolation(String),

    /// Cryptographic operation failed
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// No randomness available to generate keys
    #[error("Key generation failed: {0}")]
    KeyGeneration(String),

    /// Transport rejected a publish
    #[error("Transport error: {0}")]
    Transport(String),

    /// General I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid operation for current state
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
}

/// Coarse classification used when logging rejected messages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Malformed,
    Trust,
    Temporal,
    Policy,
    Fatal,
    Other,
}

impl PublisherError {
    /// Classify the error for the message rejection log
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Malformed(_) | Self::MissingField(_) | Self::Serialization(_) => {
                ErrorKind::Malformed
            }
            Self::UnknownIssuer(_)
            | Self::UntrustedIssuer(_)
            | Self::SignatureInvalid(_)
            | Self::DecryptionFailed(_)
            | Self::KeyMismatch(_) => ErrorKind::Trust,
            Self::Expired(_) | Self::Stale { .. } => ErrorKind::Temporal,
            Self::PolicyViolation(_) | Self::AddressMismatch { .. } => ErrorKind::Policy,
            Self::KeyGeneration(_) => ErrorKind::Fatal,
            Self::Crypto(_) | Self::Transport(_) | Self::Io(_) | Self::InvalidOperation(_) => {
                ErrorKind::Other
            }
        }
    }

    /// True for errors that mean the message was rejected, not that we failed
    pub fn is_rejection(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Malformed | ErrorKind::Trust | ErrorKind::Temporal | ErrorKind::Policy
        )
    }
}

impl From<serde_json::Error> for PublisherError {
    fn from(e: serde_json::Error) -> Self {
        PublisherError::Serialization(e.to_string())
    }
}

/// Result type alias using PublisherError
pub type PublisherResult<T> = Result<T, PublisherError>;
