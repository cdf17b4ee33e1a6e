//! IoT domain publisher core
//!
//! Publishers announce themselves on a shared message bus with a signed
//! identity, publish signed discovery messages for their nodes, inputs and
//! outputs, and accept signed (optionally encrypted) commands from other
//! publishers in the same domain.
//!
//! ## Trust
//!
//! Every publisher starts with a self-signed identity. The domain security
//! service (DSS, publisher id `dss`) can replace it with a DSS-issued one,
//! delivered encrypted to the publisher's identity address. Remote identities
//! are only cached after verification, and the cache is the sole source of
//! keys used to check signatures.
//!
//! ## Modules
//!
//! - [`address`]: address grammar, wildcard matching
//! - [`keys`]: P-256 key pairs, PEM codec, ES256 signatures
//! - [`envelope`]: compact signed and encrypted envelopes
//! - [`signer`]: sign/encrypt on publish, decrypt/verify on receive
//! - [`collection`]: address-keyed stores with a trust cache
//! - [`identity`]: identity documents, verification, persistence, manager
//! - [`publisher`]: the publisher runtime loop

pub mod address;
pub mod collection;
pub mod config;
pub mod crypto;
pub mod envelope;
pub mod error;
pub mod identity;
pub mod keys;
pub mod logging;
pub mod publisher;
pub mod signer;
pub mod transport;
pub mod types;

pub use address::{base_address, make_address, matches, publisher_address, Address, MessageType};
pub use collection::{Discoverable, DomainCollection};
pub use config::PublisherConfig;
pub use error::{ErrorKind, PublisherError, PublisherResult};
pub use identity::{
    create_self_signed, issue_identity, verify_identity, FullIdentity, IdentityManager,
    IdentityRequest, IdentityState, Issuer, PublisherIdentity, DSS_PUBLISHER_ID,
};
pub use keys::{generate_key_pair, PublicKey, SecretKey};
pub use publisher::Publisher;
pub use signer::{decode_message, encode_message, Decoded, KeyResolver, MessageSigner};
pub use transport::{MemoryBus, Transport};
pub use types::{
    DiscoveryObject, InputDiscovery, NodeAliasMessage, NodeConfigureMessage, NodeDiscovery,
    OutputDiscovery, SetInputMessage,
};
