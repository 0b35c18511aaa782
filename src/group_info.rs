// Copyright 2024 The dedupv1d Authors.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Group directory (§3, §4.8): identity-only namespace for `(group, lun)
//! -> volume` assignments. A started-once persistent directory keyed by
//! name, with preconfigured and dynamic entries.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Deserialize;
use serde::Serialize;
use sync::Mutex;

use crate::error::DedupError;
use crate::error::DedupResult;
use crate::persistence::PersistentIndex;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GroupRecord {
    pub preconfigured: bool,
}

struct Registry {
    groups: HashMap<String, GroupRecord>,
}

pub struct GroupInfo {
    registry: Mutex<Registry>,
    index: Arc<dyn PersistentIndex<String, GroupRecord>>,
}

impl GroupInfo {
    pub fn new(index: Arc<dyn PersistentIndex<String, GroupRecord>>) -> Arc<GroupInfo> {
        Arc::new(GroupInfo {
            registry: Mutex::new(Registry { groups: HashMap::new() }),
            index,
        })
    }

    pub fn start(&self, preconfigured: &[String]) -> DedupResult<()> {
        self.index.start().map_err(DedupError::Index)?;
        let mut registry = self.registry.lock();
        for name in preconfigured {
            registry.groups.insert(name.clone(), GroupRecord { preconfigured: true });
        }
        for (name, record) in self.index.iter_all().map_err(DedupError::Index)? {
            registry.groups.insert(name, record);
        }
        Ok(())
    }

    pub fn exists(&self, name: &str) -> bool {
        self.registry.lock().groups.contains_key(name)
    }

    pub fn create_group(&self, name: &str) -> DedupResult<()> {
        let mut registry = self.registry.lock();
        if registry.groups.contains_key(name) {
            return Ok(());
        }
        registry.groups.insert(name.to_string(), GroupRecord { preconfigured: false });
        drop(registry);
        self.index
            .put(name.to_string(), &GroupRecord { preconfigured: false })
            .map_err(DedupError::Index)
    }

    pub fn remove_group(&self, name: &str) -> DedupResult<()> {
        let mut registry = self.registry.lock();
        match registry.groups.get(name) {
            None => return Err(DedupError::GroupNotFound(name.to_string())),
            Some(record) if record.preconfigured => return Err(DedupError::Preconfigured),
            _ => {}
        }
        registry.groups.remove(name);
        drop(registry);
        self.index.delete(&name.to_string()).map_err(DedupError::Index)
    }
}
