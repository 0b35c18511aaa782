// Copyright 2024 The dedupv1d Authors.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! User directory (§3, §4.8): `{name, secret_hash, targets, preconfigured}`,
//! a started-once persistent directory keyed by user name.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Deserialize;
use serde::Serialize;
use sync::Mutex;

use crate::error::DedupError;
use crate::error::DedupResult;
use crate::persistence::PersistentIndex;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UserRecord {
    pub name: String,
    pub secret_hash: String,
    pub targets: Vec<String>,
    pub preconfigured: bool,
}

struct Registry {
    users: HashMap<String, UserRecord>,
}

pub struct UserInfo {
    registry: Mutex<Registry>,
    index: Arc<dyn PersistentIndex<String, UserRecord>>,
}

impl UserInfo {
    pub fn new(index: Arc<dyn PersistentIndex<String, UserRecord>>) -> Arc<UserInfo> {
        Arc::new(UserInfo {
            registry: Mutex::new(Registry { users: HashMap::new() }),
            index,
        })
    }

    pub fn start(&self, preconfigured: Vec<UserRecord>) -> DedupResult<()> {
        self.index.start().map_err(DedupError::Index)?;
        let mut registry = self.registry.lock();
        for mut record in preconfigured {
            record.preconfigured = true;
            registry.users.insert(record.name.clone(), record);
        }
        for (name, record) in self.index.iter_all().map_err(DedupError::Index)? {
            registry.users.insert(name, record);
        }
        Ok(())
    }

    pub fn exists(&self, name: &str) -> bool {
        self.registry.lock().users.contains_key(name)
    }

    pub fn create_user(&self, name: &str, secret_hash: String) -> DedupResult<()> {
        let mut registry = self.registry.lock();
        if registry.users.contains_key(name) {
            return Ok(());
        }
        let record = UserRecord {
            name: name.to_string(),
            secret_hash,
            targets: Vec::new(),
            preconfigured: false,
        };
        registry.users.insert(name.to_string(), record.clone());
        drop(registry);
        self.index.put(name.to_string(), &record).map_err(DedupError::Index)
    }

    /// §4.8 RemoveUser: rejected when preconfigured or still bound to a
    /// target.
    pub fn remove_user(&self, name: &str) -> DedupResult<()> {
        let mut registry = self.registry.lock();
        match registry.users.get(name) {
            None => return Err(DedupError::InvalidName(name.to_string(), "no such user")),
            Some(record) if record.preconfigured => return Err(DedupError::Preconfigured),
            Some(record) if !record.targets.is_empty() => {
                return Err(DedupError::TargetStillReferenced(name.to_string()))
            }
            _ => {}
        }
        registry.users.remove(name);
        drop(registry);
        self.index.delete(&name.to_string()).map_err(DedupError::Index)
    }

    pub fn bind_to_target(&self, name: &str, target: &str) -> DedupResult<()> {
        let mut registry = self.registry.lock();
        let record = registry
            .users
            .get_mut(name)
            .ok_or_else(|| DedupError::InvalidName(name.to_string(), "no such user"))?;
        if !record.targets.iter().any(|t| t == target) {
            record.targets.push(target.to_string());
        }
        let record = record.clone();
        drop(registry);
        self.index.put(name.to_string(), &record).map_err(DedupError::Index)
    }

    pub fn get_users_in_target(&self, target: &str) -> Vec<String> {
        self.registry
            .lock()
            .users
            .values()
            .filter(|u| u.targets.iter().any(|t| t == target))
            .map(|u| u.name.clone())
            .collect()
    }

    /// Called by TargetInfo's `ChangeTargetParams` rename path (§4.8): each
    /// user bound to `old` is rebound to `new`.
    pub fn rebind_target(&self, old: &str, new: &str) -> DedupResult<()> {
        let names = self.get_users_in_target(old);
        for name in names {
            let mut registry = self.registry.lock();
            if let Some(record) = registry.users.get_mut(&name) {
                record.targets.retain(|t| t != old);
                record.targets.push(new.to_string());
                let record = record.clone();
                drop(registry);
                self.index.put(name, &record).map_err(DedupError::Index)?;
            }
        }
        Ok(())
    }
}
