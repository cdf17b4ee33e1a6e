//! Identity file persistence

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;

use tracing::debug;

use super::document::{verify_identity, FullIdentity};
use crate::error::PublisherResult;
use crate::keys::PublicKey;

/// Load and validate a persisted identity.
///
/// Fails when the file is unreadable or malformed, when the private key does
/// not belong to the public key, or when the identity does not verify for
/// `domain/publisher_id`.
pub fn load(
    path: impl AsRef<Path>,
    domain: &str,
    publisher_id: &str,
    trusted_dss_key: Option<&PublicKey>,
) -> PublisherResult<FullIdentity> {
    let path = path.as_ref();
    let full = read(path)?;
    verify_identity(&full.identity, domain, publisher_id, trusted_dss_key)?;

    debug!(path = %path.display(), issuer = %full.identity.issuer_id, "Loaded identity");
    Ok(full)
}

/// Read an identity file and check only that its key pair belongs together
pub fn read(path: impl AsRef<Path>) -> PublisherResult<FullIdentity> {
    let json = fs::read_to_string(path)?;
    let full: FullIdentity = serde_json::from_str(&json)?;
    full.key_pair()?;
    Ok(full)
}

/// Write an identity file readable only by the owner.
///
/// The old file is removed first so a read-only leftover never blocks the
/// write.
pub fn save(path: impl AsRef<Path>, identity: &FullIdentity) -> PublisherResult<()> {
    let path = path.as_ref();
    let json = serde_json::to_string_pretty(identity)?;

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }

    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    file.write_all(json.as_bytes())?;
    file.sync_all()?;

    debug!(path = %path.display(), "Saved identity");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PublisherError;
    use crate::identity::document::create_self_signed;
    use tempfile::TempDir;

    #[test]
    fn test_save_and_load() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("keys").join("pub1.json");
        let full = create_self_signed("home", "pub1").unwrap();

        save(&path, &full).unwrap();
        let loaded = load(&path, "home", "pub1", None).unwrap();
        assert_eq!(loaded, full);
    }

    #[cfg(unix)]
    #[test]
    fn test_owner_only_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let temp = TempDir::new().unwrap();
        let path = temp.path().join("pub1.json");
        save(&path, &create_self_signed("home", "pub1").unwrap()).unwrap();

        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_save_replaces_read_only_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("pub1.json");
        save(&path, &create_self_signed("home", "pub1").unwrap()).unwrap();

        let mut permissions = fs::metadata(&path).unwrap().permissions();
        permissions.set_readonly(true);
        fs::set_permissions(&path, permissions).unwrap();

        let second = create_self_signed("home", "pub1").unwrap();
        save(&path, &second).unwrap();
        assert_eq!(load(&path, "home", "pub1", None).unwrap(), second);
    }

    #[test]
    fn test_load_rejects_other_publisher() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("pub1.json");
        save(&path, &create_self_signed("home", "pub1").unwrap()).unwrap();

        let result = load(&path, "home", "pub2", None);
        assert!(matches!(result, Err(PublisherError::AddressMismatch { .. })));
    }

    #[test]
    fn test_load_rejects_swapped_private_key() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("pub1.json");
        let mut full = create_self_signed("home", "pub1").unwrap();
        full.private_key = create_self_signed("home", "pub1").unwrap().private_key;
        save(&path, &full).unwrap();

        let result = load(&path, "home", "pub1", None);
        assert!(matches!(result, Err(PublisherError::KeyMismatch(_))));
    }

    #[test]
    fn test_read_skips_issuer_check() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("pub1.json");
        let (dss_secret, _) = crate::keys::generate_key_pair().unwrap();
        let issued = crate::identity::issue_identity(
            &crate::identity::IdentityRequest::new("home", "pub1"),
            crate::identity::Issuer::Dss(&dss_secret),
        )
        .unwrap();
        save(&path, &issued).unwrap();

        assert!(matches!(
            load(&path, "home", "pub1", None),
            Err(PublisherError::UntrustedIssuer(_))
        ));
        assert_eq!(read(&path).unwrap(), issued);
    }

    #[test]
    fn test_load_missing_and_garbage() {
        let temp = TempDir::new().unwrap();
        assert!(matches!(
            load(temp.path().join("none.json"), "home", "pub1", None),
            Err(PublisherError::Io(_))
        ));

        let path = temp.path().join("garbage.json");
        fs::write(&path, "{ not json").unwrap();
        assert!(load(&path, "home", "pub1", None).is_err());
    }
}
