//! Own identity lifecycle and the cache of other publishers' identities

use std::path::Path;

use chrono::{Duration, Utc};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::document::{
    issue_identity, verify_identity, FullIdentity, IdentityRequest, Issuer, PublisherIdentity,
    DSS_PUBLISHER_ID,
};
use super::store;
use crate::address::{publisher_address, Address, MessageType};
use crate::collection::DomainCollection;
use crate::envelope::SignedEnvelope;
use crate::error::{PublisherError, PublisherResult};
use crate::keys::{fingerprint, PublicKey, SecretKey};

/// How far an announced identity may be dated ahead of the local clock
pub const MAX_CLOCK_SKEW_SECS: i64 = 300;

/// Trust level of the publisher's own identity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityState {
    Unloaded,
    SelfSigned,
    DssIssued,
}

struct OwnIdentity {
    full: Option<FullIdentity>,
    signing_key: Option<SecretKey>,
    dirty: bool,
}

/// Holds this publisher's identity and every identity discovered in the domain.
///
/// The identity collection doubles as the trust cache: its key extractor
/// decodes the public key of each accepted identity.
pub struct IdentityManager {
    domain: String,
    publisher_id: String,
    own: Mutex<OwnIdentity>,
    identities: DomainCollection<PublisherIdentity>,
}

impl IdentityManager {
    pub fn new(domain: impl Into<String>, publisher_id: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            publisher_id: publisher_id.into(),
            own: Mutex::new(OwnIdentity {
                full: None,
                signing_key: None,
                dirty: false,
            }),
            identities: DomainCollection::with_key_extractor(|identity: &PublisherIdentity| {
                identity.key().ok()
            }),
        }
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn publisher_id(&self) -> &str {
        &self.publisher_id
    }

    /// `domain/publisherId` of this publisher
    pub fn publisher_address(&self) -> String {
        format!("{}/{}", self.domain, self.publisher_id)
    }

    /// Address this publisher's identity is published on
    pub fn identity_address(&self) -> String {
        Address::publisher(&self.domain, &self.publisher_id)
            .with_message_type(MessageType::Identity)
            .to_string()
    }

    /// Load the persisted identity, or create and persist a self-signed one.
    ///
    /// A file that is missing, unreadable or fails verification is replaced.
    /// A DSS-issued identity that only lacks a trusted DSS key is kept; its
    /// signature is checked when the DSS identity is discovered.
    pub fn setup(
        &self,
        path: impl AsRef<Path>,
        organization: &str,
        location: &str,
    ) -> PublisherResult<FullIdentity> {
        let path = path.as_ref();
        let dss_key = self.dss_key();

        let full = match store::load(path, &self.domain, &self.publisher_id, dss_key.as_ref()) {
            Ok(full) => full,
            Err(PublisherError::UntrustedIssuer(reason)) => {
                info!(
                    path = %path.display(),
                    reason = %reason,
                    "Keeping DSS-issued identity until the DSS is discovered"
                );
                store::read(path)?
            }
            Err(e) => {
                info!(
                    path = %path.display(),
                    reason = %e,
                    "No valid identity on disk, creating a self-signed one"
                );
                let request = IdentityRequest::new(&self.domain, &self.publisher_id)
                    .with_organization(organization)
                    .with_location(location);
                let full = issue_identity(&request, Issuer::SelfSigned)?;
                store::save(path, &full)?;
                full
            }
        };

        self.install(full.clone())?;
        Ok(full)
    }

    /// Use a fresh self-signed identity without touching disk
    pub fn create_ephemeral(&self, organization: &str, location: &str) -> PublisherResult<FullIdentity> {
        let request = IdentityRequest::new(&self.domain, &self.publisher_id)
            .with_organization(organization)
            .with_location(location);
        let full = issue_identity(&request, Issuer::SelfSigned)?;
        self.install(full.clone())?;
        Ok(full)
    }

    /// Make `full` the current identity and mark it for publication
    fn install(&self, full: FullIdentity) -> PublisherResult<()> {
        let (secret, public) = full.key_pair()?;
        let identity = full.identity.clone();
        {
            let mut own = self.own.lock();
            own.full = Some(full);
            own.signing_key = Some(secret);
            own.dirty = true;
        }
        info!(
            address = %identity.address,
            issuer = %identity.issuer_id,
            key = %fingerprint(&public),
            "Identity installed"
        );
        let address = identity.address.clone();
        self.identities.put(&address, identity);
        Ok(())
    }

    pub fn full_identity(&self) -> Option<FullIdentity> {
        self.own.lock().full.clone()
    }

    pub fn public_identity(&self) -> Option<PublisherIdentity> {
        self.own.lock().full.as_ref().map(|f| f.identity.clone())
    }

    pub fn signing_key(&self) -> Option<SecretKey> {
        self.own.lock().signing_key.clone()
    }

    pub fn state(&self) -> IdentityState {
        match &self.own.lock().full {
            None => IdentityState::Unloaded,
            Some(full) if full.identity.is_self_signed() => IdentityState::SelfSigned,
            Some(_) => IdentityState::DssIssued,
        }
    }

    /// Replace the own identity with one issued remotely.
    ///
    /// The new identity must be DSS-issued, carry a matching key pair and
    /// verify against `trusted_dss_key`. On failure the current identity is
    /// kept unchanged.
    pub fn update_from_remote(
        &self,
        full: FullIdentity,
        trusted_dss_key: Option<&PublicKey>,
    ) -> PublisherResult<()> {
        let result = self.check_rotation(&full, trusted_dss_key);
        if let Err(e) = result {
            warn!(
                address = %full.identity.address,
                error = %e,
                "Rejected identity update, keeping current identity"
            );
            return Err(e);
        }
        self.install(full)
    }

    fn check_rotation(
        &self,
        full: &FullIdentity,
        trusted_dss_key: Option<&PublicKey>,
    ) -> PublisherResult<()> {
        if full.identity.issuer_id != DSS_PUBLISHER_ID {
            return Err(PublisherError::PolicyViolation(format!(
                "identity update issued by {}, not the DSS",
                full.identity.issuer_id
            )));
        }
        full.key_pair()?;
        verify_identity(
            &full.identity,
            &self.domain,
            &self.publisher_id,
            trusted_dss_key,
        )
    }

    /// Return the identity if it changed since the last call
    pub fn take_dirty(&self) -> Option<FullIdentity> {
        let mut own = self.own.lock();
        if !own.dirty {
            return None;
        }
        own.dirty = false;
        own.full.clone()
    }

    /// Public key of the publisher owning any address, from the trust cache
    pub fn get_publisher_key(&self, address: &str) -> Option<PublicKey> {
        let publisher = publisher_address(address)?;
        self.identities.get_public_key(&publisher)
    }

    /// Key of this domain's DSS, once its identity has been accepted
    pub fn dss_key(&self) -> Option<PublicKey> {
        self.get_publisher_key(&format!("{}/{}", self.domain, DSS_PUBLISHER_ID))
    }

    /// Check a DSS-issued own identity against the DSS key just learned.
    ///
    /// The identity stays installed either way; a mismatch is only reported.
    fn confirm_own_identity(&self, dss_key: &PublicKey) -> bool {
        let Some(identity) = self.public_identity() else {
            return false;
        };
        if identity.is_self_signed() {
            return true;
        }
        match verify_identity(&identity, &self.domain, &self.publisher_id, Some(dss_key)) {
            Ok(()) => {
                debug!(address = %identity.address, "Own identity confirmed by DSS");
                true
            }
            Err(e) => {
                warn!(
                    address = %identity.address,
                    error = %e,
                    "Own identity was not issued by the discovered DSS"
                );
                false
            }
        }
    }

    /// Accept a remote identity published on `address`.
    ///
    /// The message must be signed by the key the identity itself carries, the
    /// identity must verify for the publisher named by the address, and it
    /// must not be older than the identity already cached for that address.
    /// Identities dated more than [`MAX_CLOCK_SKEW_SECS`] ahead of now are
    /// refused. A DSS-issued identity replaces a cached self-signed one
    /// whatever its timestamp, and once a publisher is known with a DSS-issued
    /// identity, self-signed announcements for it are refused.
    pub fn handle_identity_message(
        &self,
        address: &str,
        wire: &str,
    ) -> PublisherResult<PublisherIdentity> {
        let topic = Address::parse(address)?;
        if topic.domain != self.domain {
            return Err(PublisherError::AddressMismatch {
                expected: self.domain.clone(),
                actual: topic.domain,
            });
        }
        if topic.publisher_id == self.publisher_id {
            return Err(PublisherError::PolicyViolation(format!(
                "remote identity published for own address {}",
                address
            )));
        }

        let envelope = SignedEnvelope::parse(wire)?;
        let identity: PublisherIdentity = serde_json::from_slice(envelope.payload())?;

        verify_identity(
            &identity,
            &topic.domain,
            &topic.publisher_id,
            self.dss_key().as_ref(),
        )?;

        let latest = Utc::now() + Duration::seconds(MAX_CLOCK_SKEW_SECS);
        if identity.timestamp > latest || identity.timestamp > identity.valid_until {
            return Err(PublisherError::PolicyViolation(format!(
                "identity of {} dated {} is ahead of the clock or its validity",
                topic.publisher_address(),
                identity.timestamp
            )));
        }

        if publisher_address(envelope.issuer()) != Some(topic.publisher_address()) {
            return Err(PublisherError::PolicyViolation(format!(
                "identity of {} published by {}",
                topic.publisher_address(),
                envelope.issuer()
            )));
        }
        if !envelope.verify(&identity.key()?) {
            return Err(PublisherError::SignatureInvalid(format!(
                "identity message for {} not signed by its key",
                address
            )));
        }

        self.identities
            .put_if(address, identity.clone(), |current, new| match current {
                Some(current) if current.is_self_signed() && !new.is_self_signed() => Ok(()),
                Some(current) if new.timestamp < current.timestamp => Err(PublisherError::Stale {
                    address: address.to_string(),
                    received: new.timestamp,
                    current: current.timestamp,
                }),
                // a DSS-issued identity is never replaced by a self-signed one
                Some(current) if !current.is_self_signed() && new.is_self_signed() => {
                    Err(PublisherError::PolicyViolation(format!(
                        "self-signed identity cannot replace DSS-issued identity of {}",
                        new.publisher_address()
                    )))
                }
                _ => Ok(()),
            })?;

        debug!(
            address,
            issuer = %identity.issuer_id,
            valid_until = %identity.valid_until,
            "Accepted remote identity"
        );
        if topic.publisher_id == DSS_PUBLISHER_ID {
            self.confirm_own_identity(&identity.key()?);
        }
        Ok(identity)
    }

    /// Every identity in the trust cache, including our own
    pub fn identities(&self) -> &DomainCollection<PublisherIdentity> {
        &self.identities
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::document::{create_self_signed, sign_identity};
    use crate::keys::{decode_private_key, generate_key_pair};
    use chrono::{Duration, Utc};
    use tempfile::TempDir;

    fn identity_wire(full: &FullIdentity) -> String {
        let secret = decode_private_key(&full.private_key).unwrap();
        SignedEnvelope::seal(
            &serde_json::to_vec(&full.identity).unwrap(),
            &full.identity.publisher_address(),
            &secret,
        )
        .unwrap()
    }

    #[test]
    fn test_setup_creates_then_loads() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("pub1.json");

        let manager = IdentityManager::new("home", "pub1");
        assert_eq!(manager.state(), IdentityState::Unloaded);
        let created = manager.setup(&path, "Acme", "Lab").unwrap();
        assert_eq!(manager.state(), IdentityState::SelfSigned);
        assert_eq!(created.identity.organization, "Acme");
        assert!(path.exists());

        let reloaded = IdentityManager::new("home", "pub1");
        let loaded = reloaded.setup(&path, "ignored", "ignored").unwrap();
        assert_eq!(loaded, created);
    }

    #[test]
    fn test_setup_replaces_identity_of_other_publisher() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("identity.json");
        store::save(&path, &create_self_signed("home", "pub1").unwrap()).unwrap();

        let manager = IdentityManager::new("home", "pub2");
        let full = manager.setup(&path, "", "").unwrap();
        assert_eq!(full.identity.publisher_id, "pub2");
    }

    #[test]
    fn test_setup_keeps_dss_issued_identity() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("pub1.json");
        let dss = create_self_signed("home", "dss").unwrap();
        let (dss_secret, _) = dss.key_pair().unwrap();
        let issued = issue_identity(&IdentityRequest::new("home", "pub1"), Issuer::Dss(&dss_secret))
            .unwrap();
        store::save(&path, &issued).unwrap();

        // nothing is trusted yet, but the file is not replaced
        let manager = IdentityManager::new("home", "pub1");
        let loaded = manager.setup(&path, "", "").unwrap();
        assert_eq!(loaded, issued);
        assert_eq!(manager.state(), IdentityState::DssIssued);
        assert_eq!(store::read(&path).unwrap(), issued);

        manager
            .handle_identity_message("home/dss/$identity", &identity_wire(&dss))
            .unwrap();
        assert!(manager.confirm_own_identity(&dss.identity.key().unwrap()));

        let impostor = create_self_signed("home", "dss").unwrap();
        assert!(!manager.confirm_own_identity(&impostor.identity.key().unwrap()));
        assert_eq!(manager.state(), IdentityState::DssIssued);
    }

    #[test]
    fn test_own_key_is_resolvable() {
        let manager = IdentityManager::new("home", "pub1");
        let full = manager.create_ephemeral("", "").unwrap();

        let key = manager.get_publisher_key("home/pub1/node1/switch/0/$set");
        assert_eq!(key, Some(full.identity.key().unwrap()));
        assert!(manager.get_publisher_key("home/pub2").is_none());
    }

    #[test]
    fn test_take_dirty_once() {
        let manager = IdentityManager::new("home", "pub1");
        manager.create_ephemeral("", "").unwrap();
        assert!(manager.take_dirty().is_some());
        assert!(manager.take_dirty().is_none());
    }

    #[test]
    fn test_handle_remote_identity() {
        let manager = IdentityManager::new("home", "pub1");
        let remote = create_self_signed("home", "pub2").unwrap();

        let accepted = manager
            .handle_identity_message("home/pub2/$identity", &identity_wire(&remote))
            .unwrap();
        assert_eq!(accepted, remote.identity);
        assert_eq!(
            manager.get_publisher_key("home/pub2/node1"),
            Some(remote.identity.key().unwrap())
        );
    }

    #[test]
    fn test_remote_identity_on_wrong_address_rejected() {
        let manager = IdentityManager::new("home", "pub1");
        let remote = create_self_signed("home", "pub2").unwrap();

        let result = manager.handle_identity_message("home/pub3/$identity", &identity_wire(&remote));
        assert!(result.is_err());
        assert!(manager.get_publisher_key("home/pub3").is_none());
    }

    #[test]
    fn test_older_remote_identity_is_stale() {
        let manager = IdentityManager::new("home", "pub1");
        let older = create_self_signed("home", "pub2").unwrap();
        let newer = create_self_signed("home", "pub2").unwrap();

        // backdate the older one and re-sign it
        let mut backdated = older.clone();
        backdated.identity.timestamp = Utc::now() - Duration::hours(1);
        sign_identity(
            &mut backdated.identity,
            &decode_private_key(&older.private_key).unwrap(),
        )
        .unwrap();

        manager
            .handle_identity_message("home/pub2/$identity", &identity_wire(&newer))
            .unwrap();
        let result = manager.handle_identity_message("home/pub2/$identity", &identity_wire(&backdated));
        assert!(matches!(result, Err(PublisherError::Stale { .. })));
        assert_eq!(
            manager.get_publisher_key("home/pub2"),
            Some(newer.identity.key().unwrap())
        );
    }

    #[test]
    fn test_future_dated_identity_rejected() {
        let manager = IdentityManager::new("home", "pub1");
        let current = create_self_signed("home", "pub2").unwrap();
        manager
            .handle_identity_message("home/pub2/$identity", &identity_wire(&current))
            .unwrap();

        let mut forged = create_self_signed("home", "pub2").unwrap();
        forged.identity.timestamp = Utc::now() + Duration::days(365 * 50);
        forged.identity.valid_until = forged.identity.timestamp + Duration::days(1);
        sign_identity(
            &mut forged.identity,
            &decode_private_key(&forged.private_key).unwrap(),
        )
        .unwrap();

        let result = manager.handle_identity_message("home/pub2/$identity", &identity_wire(&forged));
        assert!(matches!(result, Err(PublisherError::PolicyViolation(_))));
        assert_eq!(
            manager.get_publisher_key("home/pub2"),
            Some(current.identity.key().unwrap())
        );
    }

    #[test]
    fn test_update_from_remote_requires_dss() {
        let manager = IdentityManager::new("home", "pub1");
        let original = manager.create_ephemeral("", "").unwrap();
        manager.take_dirty();

        // self-signed replacement is not a rotation
        let self_signed = create_self_signed("home", "pub1").unwrap();
        assert!(manager.update_from_remote(self_signed, None).is_err());

        // DSS-issued, but the DSS key is not trusted yet
        let (dss_secret, dss_public) = generate_key_pair().unwrap();
        let request = IdentityRequest::new("home", "pub1");
        let rotated = issue_identity(&request, Issuer::Dss(&dss_secret)).unwrap();
        assert!(manager.update_from_remote(rotated.clone(), None).is_err());
        assert_eq!(manager.full_identity(), Some(original));
        assert!(manager.take_dirty().is_none());

        manager.update_from_remote(rotated.clone(), Some(&dss_public)).unwrap();
        assert_eq!(manager.state(), IdentityState::DssIssued);
        assert_eq!(manager.take_dirty(), Some(rotated.clone()));
        assert_eq!(
            manager.signing_key().unwrap().public_key(),
            rotated.identity.key().unwrap()
        );
    }
}
