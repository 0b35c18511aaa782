// Copyright 2024 The dedupv1d Authors.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The keyed-store contract the core consumes (§6). Concrete B-tree
//! backends are out of core scope (§1); this module defines the trait plus
//! an in-memory reference implementation used by tests and available as a
//! development backend.

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::Serialize;
use sync::Mutex;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LookupStatus {
    Found,
    NotFound,
}

#[derive(thiserror::Error, Debug)]
pub enum IndexError {
    #[error("persistence backend error: {0}")]
    Backend(String),
    #[error("key already present")]
    AlreadyPresent,
    #[error("(de)serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// A persistent index keyed by a serializable key type, holding
/// serializable values (§6). Keys used by the core: 32-bit volume/target
/// ids, user/group names (`String`), and the two well-known info-store
/// string keys (`volume.<id>.ch.error`, `volume-fastcopy`).
pub trait PersistentIndex<K, V>: Send + Sync
where
    K: Ord + Clone,
{
    fn start(&self) -> Result<(), IndexError>;
    fn lookup(&self, key: &K) -> Result<Option<V>, IndexError>;
    fn put(&self, key: K, value: &V) -> Result<(), IndexError>;
    fn put_if_absent(&self, key: K, value: &V) -> Result<(), IndexError>;
    fn delete(&self, key: &K) -> Result<(), IndexError>;
    /// Full in-order snapshot, standing in for the cursor contract's
    /// `First`/`Next`/`Get` traversal (§6) in a form callers can iterate
    /// without holding a cursor object across calls.
    fn iter_all(&self) -> Result<Vec<(K, V)>, IndexError>;
}

/// In-memory reference implementation, serializing through `serde_json` so
/// round-trip bugs in `SerializeTo`/`ParseFrom` style code are still
/// exercised even without a real on-disk backend.
pub struct InMemoryIndex<K, V> {
    map: Mutex<BTreeMap<K, Vec<u8>>>,
    _marker: std::marker::PhantomData<V>,
}

impl<K, V> Default for InMemoryIndex<K, V>
where
    K: Ord + Clone,
{
    fn default() -> Self {
        InMemoryIndex {
            map: Mutex::new(BTreeMap::new()),
            _marker: std::marker::PhantomData,
        }
    }
}

impl<K, V> InMemoryIndex<K, V>
where
    K: Ord + Clone,
{
    pub fn new() -> Self {
        Self::default()
    }
}

impl<K, V> PersistentIndex<K, V> for InMemoryIndex<K, V>
where
    K: Ord + Clone + Send + Sync,
    V: Serialize + DeserializeOwned + Send + Sync,
{
    fn start(&self) -> Result<(), IndexError> {
        Ok(())
    }

    fn lookup(&self, key: &K) -> Result<Option<V>, IndexError> {
        let map = self.map.lock();
        match map.get(key) {
            Some(bytes) => Ok(Some(serde_json::from_slice(bytes)?)),
            None => Ok(None),
        }
    }

    fn put(&self, key: K, value: &V) -> Result<(), IndexError> {
        let bytes = serde_json::to_vec(value)?;
        self.map.lock().insert(key, bytes);
        Ok(())
    }

    fn put_if_absent(&self, key: K, value: &V) -> Result<(), IndexError> {
        let bytes = serde_json::to_vec(value)?;
        let mut map = self.map.lock();
        if map.contains_key(&key) {
            return Err(IndexError::AlreadyPresent);
        }
        map.insert(key, bytes);
        Ok(())
    }

    fn delete(&self, key: &K) -> Result<(), IndexError> {
        self.map.lock().remove(key);
        Ok(())
    }

    fn iter_all(&self) -> Result<Vec<(K, V)>, IndexError> {
        let map = self.map.lock();
        map.iter()
            .map(|(k, bytes)| Ok((k.clone(), serde_json::from_slice(bytes)?)))
            .collect()
    }
}

/// The scalar info-store key/value interface used for the per-volume error
/// report ring and the fast-copy snapshot (§6): a flat `String -> bytes`
/// map, distinct from the per-entity `PersistentIndex`es above.
pub trait InfoStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, IndexError>;
    fn put(&self, key: &str, value: Vec<u8>) -> Result<(), IndexError>;
}

#[derive(Default)]
pub struct InMemoryInfoStore {
    map: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl InMemoryInfoStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl InfoStore for InMemoryInfoStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, IndexError> {
        Ok(self.map.lock().get(key).cloned())
    }

    fn put(&self, key: &str, value: Vec<u8>) -> Result<(), IndexError> {
        self.map.lock().insert(key.to_string(), value);
        Ok(())
    }
}
