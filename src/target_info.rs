// Copyright 2024 The dedupv1d Authors.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Target directory (§3, §4.8): `{tid, name, params, auth_username,
//! auth_secret_hash, preconfigured}`, plus the cross-referential rename
//! logic `ChangeTargetParams` needs against the volume and user
//! directories.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Deserialize;
use serde::Serialize;
use sync::Mutex;

use crate::error::DedupError;
use crate::error::DedupResult;
use crate::persistence::PersistentIndex;
use crate::user_info::UserInfo;

/// The subset of `VolumeInfo` target renaming needs, injected rather than
/// depended on directly so `target_info` and `volume_info` don't form a
/// compile-time cycle (mirrors `fastcopy::VolumeLookup`).
pub trait VolumeDirectory: Send + Sync {
    fn find_volumes_in_target(&self, target: &str) -> Vec<u32>;
    fn rebind_target(&self, volume_id: u32, old: &str, new: &str, lun: u32) -> DedupResult<()>;
}

fn valid_target_name(name: &str) -> bool {
    (1..=223).contains(&name.len())
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '.' | '-' | ':'))
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TargetRecord {
    pub tid: u32,
    pub name: String,
    pub params: Vec<(String, String)>,
    pub auth_username: Option<String>,
    pub auth_secret_hash: Option<String>,
    pub preconfigured: bool,
}

struct Registry {
    by_tid: HashMap<u32, TargetRecord>,
    by_name: HashMap<String, u32>,
}

pub struct TargetInfo {
    registry: Mutex<Registry>,
    index: Arc<dyn PersistentIndex<u32, TargetRecord>>,
    user_info: Arc<UserInfo>,
    volumes: Mutex<Option<Arc<dyn VolumeDirectory>>>,
}

impl TargetInfo {
    pub fn new(index: Arc<dyn PersistentIndex<u32, TargetRecord>>, user_info: Arc<UserInfo>) -> Arc<TargetInfo> {
        Arc::new(TargetInfo {
            registry: Mutex::new(Registry {
                by_tid: HashMap::new(),
                by_name: HashMap::new(),
            }),
            index,
            user_info,
            volumes: Mutex::new(None),
        })
    }

    /// Late-bound to break the `VolumeInfo <-> TargetInfo` cycle; called
    /// once during system wiring before `start`.
    pub fn set_volume_directory(&self, volumes: Arc<dyn VolumeDirectory>) {
        *self.volumes.lock() = Some(volumes);
    }

    pub fn start(&self, preconfigured: Vec<TargetRecord>) -> DedupResult<()> {
        self.index.start().map_err(DedupError::Index)?;
        let mut registry = self.registry.lock();
        for mut record in preconfigured {
            record.preconfigured = true;
            registry.by_name.insert(record.name.clone(), record.tid);
            registry.by_tid.insert(record.tid, record);
        }
        for (tid, record) in self.index.iter_all().map_err(DedupError::Index)? {
            registry.by_name.insert(record.name.clone(), tid);
            registry.by_tid.insert(tid, record);
        }
        Ok(())
    }

    pub fn exists(&self, name: &str) -> bool {
        self.registry.lock().by_name.contains_key(name)
    }

    pub fn find_by_name(&self, name: &str) -> Option<TargetRecord> {
        let registry = self.registry.lock();
        registry.by_name.get(name).and_then(|tid| registry.by_tid.get(tid)).cloned()
    }

    pub fn create_target(
        &self,
        tid: u32,
        name: String,
        params: Vec<(String, String)>,
    ) -> DedupResult<()> {
        if tid == 0 {
            return Err(DedupError::TidZero);
        }
        if !valid_target_name(&name) {
            return Err(DedupError::InvalidName(name, "must be 1-223 chars of [a-z0-9.:-]"));
        }
        let mut registry = self.registry.lock();
        if registry.by_tid.contains_key(&tid) || registry.by_name.contains_key(&name) {
            return Err(DedupError::InvalidName(name, "tid or name already in use"));
        }
        let record = TargetRecord {
            tid,
            name: name.clone(),
            params,
            auth_username: None,
            auth_secret_hash: None,
            preconfigured: false,
        };
        registry.by_name.insert(name, tid);
        registry.by_tid.insert(tid, record.clone());
        drop(registry);
        self.index.put(tid, &record).map_err(DedupError::Index)
    }

    /// §4.8 RemoveTarget: rejected when preconfigured or still referenced
    /// by a volume.
    pub fn remove_target(&self, name: &str) -> DedupResult<()> {
        let tid = {
            let registry = self.registry.lock();
            let tid = *registry
                .by_name
                .get(name)
                .ok_or_else(|| DedupError::InvalidName(name.to_string(), "no such target"))?;
            let record = &registry.by_tid[&tid];
            if record.preconfigured {
                return Err(DedupError::Preconfigured);
            }
            tid
        };
        let still_referenced = self
            .volumes
            .lock()
            .as_ref()
            .map(|v| !v.find_volumes_in_target(name).is_empty())
            .unwrap_or(false);
        if still_referenced {
            return Err(DedupError::TargetStillReferenced(name.to_string()));
        }

        let mut registry = self.registry.lock();
        registry.by_tid.remove(&tid);
        registry.by_name.remove(name);
        drop(registry);
        self.index.delete(&tid).map_err(DedupError::Index)
    }

    /// §4.8 ChangeTargetParams: when `new_name` differs from the current
    /// name, re-attaches every volume referencing it and re-binds every
    /// user authorized against it before the rename itself, aborting
    /// without renaming on any failure.
    pub fn change_target_params(
        &self,
        name: &str,
        new_name: Option<String>,
        params: Option<Vec<(String, String)>>,
    ) -> DedupResult<()> {
        let (tid, mut record) = {
            let registry = self.registry.lock();
            let tid = *registry
                .by_name
                .get(name)
                .ok_or_else(|| DedupError::InvalidName(name.to_string(), "no such target"))?;
            let record = registry.by_tid[&tid].clone();
            if record.preconfigured {
                return Err(DedupError::Preconfigured);
            }
            (tid, record)
        };

        if let Some(params) = params {
            record.params = params;
        }

        if let Some(new_name) = new_name.filter(|n| n != name) {
            if !valid_target_name(&new_name) {
                return Err(DedupError::InvalidName(new_name, "must be 1-223 chars of [a-z0-9.:-]"));
            }
            if self.exists(&new_name) {
                return Err(DedupError::InvalidName(new_name, "name already in use"));
            }

            if let Some(volumes) = self.volumes.lock().clone() {
                for volume_id in volumes.find_volumes_in_target(name) {
                    // lun is not tracked here; VolumeDirectory looks it up itself.
                    volumes.rebind_target(volume_id, name, &new_name, 0)?;
                }
            }
            self.user_info.rebind_target(name, &new_name)?;

            let mut registry = self.registry.lock();
            registry.by_name.remove(name);
            record.name = new_name.clone();
            registry.by_name.insert(new_name, tid);
            registry.by_tid.insert(tid, record.clone());
        } else {
            let mut registry = self.registry.lock();
            registry.by_tid.insert(tid, record.clone());
        }

        self.index.put(tid, &record).map_err(DedupError::Index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::InMemoryIndex;
    use std::sync::Mutex as StdMutex;

    struct FakeVolumes {
        bindings: StdMutex<Vec<(u32, String)>>,
    }

    impl VolumeDirectory for FakeVolumes {
        fn find_volumes_in_target(&self, target: &str) -> Vec<u32> {
            self.bindings
                .lock()
                .unwrap()
                .iter()
                .filter(|(_, t)| t == target)
                .map(|(id, _)| *id)
                .collect()
        }
        fn rebind_target(&self, volume_id: u32, old: &str, new: &str, _lun: u32) -> DedupResult<()> {
            let mut bindings = self.bindings.lock().unwrap();
            for entry in bindings.iter_mut() {
                if entry.0 == volume_id && entry.1 == old {
                    entry.1 = new.to_string();
                }
            }
            Ok(())
        }
    }

    fn make() -> (Arc<TargetInfo>, Arc<FakeVolumes>) {
        let users = UserInfo::new(Arc::new(InMemoryIndex::new()));
        users.start(Vec::new()).unwrap();
        let targets = TargetInfo::new(Arc::new(InMemoryIndex::new()), users);
        let volumes = Arc::new(FakeVolumes {
            bindings: StdMutex::new(Vec::new()),
        });
        targets.set_volume_directory(volumes.clone());
        targets.start(Vec::new()).unwrap();
        (targets, volumes)
    }

    #[test]
    fn create_and_find() {
        let (targets, _) = make();
        targets.create_target(1, "iqn.2026-01.com.example:t0".to_string(), vec![]).unwrap();
        assert!(targets.exists("iqn.2026-01.com.example:t0"));
    }

    #[test]
    fn tid_zero_rejected() {
        let (targets, _) = make();
        assert!(matches!(
            targets.create_target(0, "iqn.2026-01.com.example:t0".to_string(), vec![]).unwrap_err(),
            DedupError::TidZero
        ));
    }

    #[test]
    fn remove_blocked_while_referenced() {
        let (targets, volumes) = make();
        targets.create_target(1, "iqn.2026-01.com.example:t0".to_string(), vec![]).unwrap();
        volumes.bindings.lock().unwrap().push((7, "iqn.2026-01.com.example:t0".to_string()));
        assert!(matches!(
            targets.remove_target("iqn.2026-01.com.example:t0").unwrap_err(),
            DedupError::TargetStillReferenced(_)
        ));
    }

    #[test]
    fn rename_rebinds_volumes_and_users() {
        let (targets, volumes) = make();
        targets.create_target(1, "iqn.2026-01.com.example:old".to_string(), vec![]).unwrap();
        volumes.bindings.lock().unwrap().push((7, "iqn.2026-01.com.example:old".to_string()));
        targets
            .change_target_params(
                "iqn.2026-01.com.example:old",
                Some("iqn.2026-01.com.example:new".to_string()),
                None,
            )
            .unwrap();
        assert!(targets.exists("iqn.2026-01.com.example:new"));
        assert!(!targets.exists("iqn.2026-01.com.example:old"));
        assert_eq!(
            volumes.bindings.lock().unwrap()[0].1,
            "iqn.2026-01.com.example:new"
        );
    }
}
