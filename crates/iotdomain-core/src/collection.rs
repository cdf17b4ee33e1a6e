//! Address-keyed store of discovered objects
//!
//! A [`DomainCollection`] holds the last known version of every identity,
//! node, input or output seen on the bus, keyed by base address. When given a
//! key extractor it also maintains the `address → public key` trust cache for
//! the objects it stores.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::address::{base_address, MessageType};
use crate::error::PublisherResult;
use crate::keys::PublicKey;

/// An object that lives on the bus at an address of its own
pub trait Discoverable: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {
    /// Message type this object is published with
    const MESSAGE_TYPE: MessageType;

    /// Full address the object is published on
    fn address(&self) -> &str;
}

/// Pulls the trusted public key out of a stored object
pub type KeyExtractor<T> = Box<dyn Fn(&T) -> Option<PublicKey> + Send + Sync>;

struct CollectionInner<T> {
    objects: BTreeMap<String, T>,
    keys: HashMap<String, PublicKey>,
    updated: BTreeSet<String>,
}

/// Thread-safe, last-write-wins store keyed by base address.
///
/// Every operation takes the collection lock once and only for the map
/// access; key extraction happens before the lock is taken.
pub struct DomainCollection<T: Discoverable> {
    inner: Mutex<CollectionInner<T>>,
    key_extractor: Option<KeyExtractor<T>>,
}

impl<T: Discoverable> Default for DomainCollection<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Discoverable> DomainCollection<T> {
    /// Create an empty collection without a trust cache
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(CollectionInner {
                objects: BTreeMap::new(),
                keys: HashMap::new(),
                updated: BTreeSet::new(),
            }),
            key_extractor: None,
        }
    }

    /// Create an empty collection that keeps a trust cache entry per object
    pub fn with_key_extractor(
        extractor: impl Fn(&T) -> Option<PublicKey> + Send + Sync + 'static,
    ) -> Self {
        Self {
            key_extractor: Some(Box::new(extractor)),
            ..Self::new()
        }
    }

    /// Store an object under the base of `address`, replacing any previous one.
    pub fn put(&self, address: &str, object: T) {
        let key = self.extract_key(&object);
        let base = base_address(address);
        let mut inner = self.inner.lock();
        Self::store(&mut inner, base, object, key);
    }

    /// Store an object only if `accept` approves it given the current entry.
    ///
    /// The check and the write happen under one lock acquisition.
    pub fn put_if<F>(&self, address: &str, object: T, accept: F) -> PublisherResult<()>
    where
        F: FnOnce(Option<&T>, &T) -> PublisherResult<()>,
    {
        let key = self.extract_key(&object);
        let base = base_address(address);
        let mut inner = self.inner.lock();
        accept(inner.objects.get(&base), &object)?;
        Self::store(&mut inner, base, object, key);
        Ok(())
    }

    /// Store an object at its own address and mark it for publication
    pub fn update(&self, object: T) {
        let key = self.extract_key(&object);
        let base = base_address(object.address());
        let mut inner = self.inner.lock();
        inner.updated.insert(base.clone());
        Self::store(&mut inner, base, object, key);
    }

    /// Look up an object by address (any message type suffix is ignored)
    pub fn get(&self, address: &str) -> Option<T> {
        self.inner.lock().objects.get(&base_address(address)).cloned()
    }

    /// All objects whose base address starts with the base of `prefix`
    pub fn get_all_by_prefix(&self, prefix: &str) -> Vec<T> {
        let prefix = base_address(prefix);
        self.inner
            .lock()
            .objects
            .range(prefix.clone()..)
            .take_while(|(address, _)| address.starts_with(&prefix))
            .map(|(_, object)| object.clone())
            .collect()
    }

    /// All objects, ordered by base address
    pub fn get_all(&self) -> Vec<T> {
        self.inner.lock().objects.values().cloned().collect()
    }

    /// Remove an object and its trust cache entry
    pub fn remove(&self, address: &str) -> Option<T> {
        let base = base_address(address);
        let mut inner = self.inner.lock();
        inner.keys.remove(&base);
        inner.updated.remove(&base);
        inner.objects.remove(&base)
    }

    /// Trusted public key of the object stored at `address`
    pub fn get_public_key(&self, address: &str) -> Option<PublicKey> {
        self.inner.lock().keys.get(&base_address(address)).copied()
    }

    /// Decode a wire message and store the result.
    ///
    /// Nothing is stored when `decode` fails.
    pub fn ingest_signed<F>(&self, address: &str, wire: &str, decode: F) -> PublisherResult<()>
    where
        F: FnOnce(&str) -> PublisherResult<T>,
    {
        let object = decode(wire)?;
        self.put(address, object);
        Ok(())
    }

    /// Drain the objects marked by [`DomainCollection::update`]
    pub fn take_updated(&self) -> Vec<T> {
        let mut inner = self.inner.lock();
        let updated = std::mem::take(&mut inner.updated);
        updated
            .iter()
            .filter_map(|address| inner.objects.get(address).cloned())
            .collect()
    }

    /// Mark every stored object for publication again
    pub fn mark_all_updated(&self) {
        let mut inner = self.inner.lock();
        let all: BTreeSet<String> = inner.objects.keys().cloned().collect();
        inner.updated = all;
    }

    pub fn len(&self) -> usize {
        self.inner.lock().objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().objects.is_empty()
    }

    /// Write all objects to a JSON array file
    pub fn save_to_file(&self, path: impl AsRef<Path>) -> PublisherResult<()> {
        let path = path.as_ref();
        let json = serde_json::to_string_pretty(&self.get_all())?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, json)?;
        debug!(path = %path.display(), "Saved collection");
        Ok(())
    }

    /// Load objects from a JSON array file, storing each at its own address.
    ///
    /// A missing file loads nothing. Returns the number of objects loaded.
    pub fn load_from_file(&self, path: impl AsRef<Path>) -> PublisherResult<usize> {
        let path = path.as_ref();
        let json = match std::fs::read_to_string(path) {
            Ok(json) => json,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "No collection file to load");
                return Ok(0);
            }
            Err(e) => return Err(e.into()),
        };

        let objects: Vec<T> = serde_json::from_str(&json)?;
        let count = objects.len();
        for object in objects {
            let address = object.address().to_string();
            self.put(&address, object);
        }
        debug!(path = %path.display(), count, "Loaded collection");
        Ok(count)
    }

    fn extract_key(&self, object: &T) -> Option<PublicKey> {
        self.key_extractor
            .as_ref()
            .and_then(|extract| extract(object))
    }

    fn store(inner: &mut CollectionInner<T>, base: String, object: T, key: Option<PublicKey>) {
        match key {
            Some(key) => {
                inner.keys.insert(base.clone(), key);
            }
            None => {
                inner.keys.remove(&base);
            }
        }
        inner.objects.insert(base, object);
    }
}
