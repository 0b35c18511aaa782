// Copyright 2024 The dedupv1d Authors.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The volume registry (§4.5): persistent catalogue of volumes, the
//! group/target/LUN multimaps, and attach/detach/change-* coordination
//! with the underlying dedup engine, detacher, and fast-copy engine.

use std::collections::HashMap;
use std::sync::Arc;

use base::info;
use sync::Mutex;

use crate::dedup_engine::DedupSystem;
use crate::dedup_engine::DedupVolume;
use crate::dedup_engine::LogEvent;
use crate::dedup_engine::StartContext;
use crate::detacher::VolumeDetacher;
use crate::error::DedupError;
use crate::error::DedupResult;
use crate::fastcopy::FastCopyEngine;
use crate::fastcopy::JobData;
use crate::fastcopy::VolumeLookup;
use crate::group_info::GroupInfo;
use crate::kernel_bridge::KernelScsiBridge;
use crate::persistence::InfoStore;
use crate::persistence::PersistentIndex;
use crate::target_info::TargetInfo;
use crate::volume::session::Session;
use crate::volume::Volume;
use crate::volume::VolumeCreateOptions;
use crate::volume::VolumeRecord;

/// Per-volume collaborators a freshly attached `Volume` needs; constructing
/// these is the dedup engine's/kernel bridge's job, out of core scope
/// (§1) — `VolumeInfo` is handed factories rather than constructing them
/// itself.
pub type DedupVolumeFactory = Arc<dyn Fn(u32) -> Arc<dyn DedupVolume> + Send + Sync>;
pub type KernelBridgeFactory = Arc<dyn Fn(u32) -> Arc<dyn KernelScsiBridge> + Send + Sync>;

struct Registry {
    ordered_ids: Vec<u32>,
    by_id: HashMap<u32, Arc<Volume>>,
    by_name: HashMap<String, u32>,
    by_group: HashMap<String, Vec<(u32, u32)>>,
    by_target: HashMap<String, Vec<(u32, u32)>>,
    running: bool,
}

impl Registry {
    fn new() -> Self {
        Registry {
            ordered_ids: Vec::new(),
            by_id: HashMap::new(),
            by_name: HashMap::new(),
            by_group: HashMap::new(),
            by_target: HashMap::new(),
            running: false,
        }
    }
}

pub struct VolumeInfo {
    registry: Mutex<Registry>,
    index: Arc<dyn PersistentIndex<u32, VolumeRecord>>,
    dedup_system: Arc<dyn DedupSystem>,
    dedup_volume_factory: DedupVolumeFactory,
    kernel_bridge_factory: KernelBridgeFactory,
    error_store: Arc<dyn InfoStore>,
    detacher: Arc<VolumeDetacher>,
    fast_copy: Arc<FastCopyEngine>,
    group_info: Mutex<Option<Arc<GroupInfo>>>,
    target_info: Mutex<Option<Arc<TargetInfo>>>,
}

impl crate::target_info::VolumeDirectory for VolumeInfo {
    fn find_volumes_in_target(&self, target: &str) -> Vec<u32> {
        self.registry
            .lock()
            .by_target
            .get(target)
            .map(|entries| entries.iter().map(|(_, id)| *id).collect())
            .unwrap_or_default()
    }

    fn rebind_target(&self, volume_id: u32, old: &str, new: &str, lun: u32) -> DedupResult<()> {
        let volume = self.find_volume(volume_id).ok_or(DedupError::VolumeNotFound(volume_id))?;
        let lun = volume
            .targets()
            .into_iter()
            .find(|(t, _)| t == old)
            .map(|(_, l)| l)
            .unwrap_or(lun);
        self.remove_from_target(volume_id, old)?;
        self.add_to_target_unchecked(volume_id, new, lun)
    }
}

impl VolumeLookup for VolumeInfo {
    fn dedup_volume(&self, volume_id: u32) -> Option<Arc<dyn DedupVolume>> {
        self.registry
            .lock()
            .by_id
            .get(&volume_id)
            .map(|v| v.dedup_volume_handle())
    }
}

impl VolumeInfo {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        index: Arc<dyn PersistentIndex<u32, VolumeRecord>>,
        dedup_system: Arc<dyn DedupSystem>,
        dedup_volume_factory: DedupVolumeFactory,
        kernel_bridge_factory: KernelBridgeFactory,
        error_store: Arc<dyn InfoStore>,
        detacher: Arc<VolumeDetacher>,
        fast_copy: Arc<FastCopyEngine>,
    ) -> Arc<VolumeInfo> {
        Arc::new(VolumeInfo {
            registry: Mutex::new(Registry::new()),
            index,
            dedup_system,
            dedup_volume_factory,
            kernel_bridge_factory,
            error_store,
            detacher,
            fast_copy,
            group_info: Mutex::new(None),
            target_info: Mutex::new(None),
        })
    }

    /// §4.5: `GroupInfo`/`TargetInfo` must already be started; registers
    /// preconfigured volumes (non-persistent), then restores dynamic
    /// volumes from the persistent index.
    pub fn start(
        self: &Arc<Self>,
        group_info: Arc<GroupInfo>,
        target_info: Arc<TargetInfo>,
        preconfigured: Vec<VolumeCreateOptions>,
        restart_ctx: StartContext,
    ) -> DedupResult<()> {
        *self.group_info.lock() = Some(group_info);
        *self.target_info.lock() = Some(target_info);
        self.index.start().map_err(DedupError::Index)?;

        for options in preconfigured {
            self.register_new(options, true, StartContext { create: true, dirty: false })?;
        }

        for (id, record) in self.index.iter_all().map_err(DedupError::Index)? {
            let dedup_volume = (self.dedup_volume_factory)(id);
            let kernel_bridge = (self.kernel_bridge_factory)(id);
            let volume = Arc::new(Volume::parse_from(
                record,
                false,
                dedup_volume,
                kernel_bridge,
                self.error_store.clone(),
            )?);
            volume.start(restart_ctx)?;
            self.insert_registry(volume)?;
        }
        Ok(())
    }

    fn insert_registry(&self, volume: Arc<Volume>) -> DedupResult<()> {
        let mut registry = self.registry.lock();
        let id = volume.id;
        let name = volume.device_name();
        if registry.by_name.contains_key(&name) {
            return Err(DedupError::DeviceNameInUse(name));
        }
        registry.ordered_ids.push(id);
        registry.by_name.insert(name, id);
        let running = registry.running;
        registry.by_id.insert(id, volume.clone());
        drop(registry);
        if running {
            volume.run()?;
        }
        Ok(())
    }

    /// §4.5 `AttachVolume(options)`.
    pub fn attach_volume(self: &Arc<Self>, options: VolumeCreateOptions) -> DedupResult<Arc<Volume>> {
        self.register_new(options, false, StartContext { create: true, dirty: false })
    }

    fn register_new(
        self: &Arc<Self>,
        options: VolumeCreateOptions,
        preconfigured: bool,
        start_ctx: StartContext,
    ) -> DedupResult<Arc<Volume>> {
        let id = options.id;
        if self.detacher.is_detaching(id) {
            return Err(DedupError::VolumeDetaching(id));
        }
        {
            let registry = self.registry.lock();
            if registry.by_id.contains_key(&id) {
                return Err(DedupError::DeviceNameInUse(format!("volume id {} already attached", id)));
            }
        }

        let dedup_volume = (self.dedup_volume_factory)(id);
        let kernel_bridge = (self.kernel_bridge_factory)(id);
        let volume = Arc::new(Volume::new(
            VolumeCreateOptions {
                preconfigured,
                ..options
            },
            dedup_volume.clone(),
            kernel_bridge,
            self.error_store.clone(),
        )?);
        volume.start(start_ctx)?;

        self.dedup_system
            .register_volume(id, dedup_volume.clone())
            .map_err(DedupError::Engine)?;
        dedup_volume
            .commit_event(LogEvent::VolumeAttach { volume_id: id })
            .map_err(DedupError::Engine)?;
        if !preconfigured {
            self.persist(&volume)?;
        }
        self.insert_registry(volume.clone())?;
        info!("volume {} attached (device_name={})", id, volume.device_name());
        Ok(volume)
    }

    fn persist(&self, volume: &Volume) -> DedupResult<()> {
        self.index
            .put(volume.id, &volume.serialize_to())
            .map_err(DedupError::Index)
    }

    /// §4.5 `DetachVolume(id)`.
    pub fn detach_volume(&self, id: u32) -> DedupResult<()> {
        let volume = {
            let registry = self.registry.lock();
            registry.by_id.get(&id).cloned().ok_or(DedupError::VolumeNotFound(id))?
        };
        if volume.is_preconfigured() {
            return Err(DedupError::Preconfigured);
        }
        if !volume.groups().is_empty() {
            return Err(DedupError::InGroup(id));
        }
        if !volume.targets().is_empty() {
            return Err(DedupError::InTarget(id));
        }
        if volume.session_count() > 0 {
            return Err(DedupError::VolumeHasSessions(id, volume.session_count()));
        }
        if self.fast_copy.is_fast_copy_source(id) || self.fast_copy.is_fast_copy_target(id) {
            return Err(DedupError::InFastCopy(id));
        }

        volume.stop()?;
        self.dedup_system.unregister_volume(id).map_err(DedupError::Engine)?;
        let _ = volume
            .dedup_volume_handle()
            .commit_event(LogEvent::VolumeDetach { volume_id: id });

        let mut registry = self.registry.lock();
        registry.ordered_ids.retain(|&v| v != id);
        registry.by_id.remove(&id);
        registry.by_name.remove(&volume.device_name());
        drop(registry);

        self.index.delete(&id).map_err(DedupError::Index)?;
        self.detacher
            .detach_volume(
                id,
                volume.device_name(),
                volume.logical_size(),
                (0, volume.block_count()),
            )
            .map_err(DedupError::Index)?;
        info!("volume {} detached", id);
        Ok(())
    }

    pub fn find_volume(&self, id: u32) -> Option<Arc<Volume>> {
        self.registry.lock().by_id.get(&id).cloned()
    }

    pub fn find_volume_by_name(&self, name: &str) -> Option<Arc<Volume>> {
        let registry = self.registry.lock();
        registry.by_name.get(name).and_then(|id| registry.by_id.get(id).cloned())
    }

    pub fn find_volumes_in_target(&self, target: &str) -> Vec<Arc<Volume>> {
        let registry = self.registry.lock();
        registry
            .by_target
            .get(target)
            .map(|entries| entries.iter().filter_map(|(vid, _)| registry.by_id.get(vid).cloned()).collect())
            .unwrap_or_default()
    }

    pub fn add_to_group(&self, id: u32, group: &str, lun: u32) -> DedupResult<()> {
        let volume = self.find_volume(id).ok_or(DedupError::VolumeNotFound(id))?;
        if volume.is_preconfigured() {
            return Err(DedupError::Preconfigured);
        }
        if !self.group_info.lock().as_ref().is_some_and(|g| g.exists(group)) {
            return Err(DedupError::GroupNotFound(group.to_string()));
        }
        let mut registry = self.registry.lock();
        let entries = registry.by_group.entry(group.to_string()).or_default();
        if entries.iter().any(|(other_lun, _)| *other_lun == lun) {
            return Err(DedupError::GroupLunCollision {
                group: group.to_string(),
                lun,
            });
        }
        entries.push((lun, id));
        drop(registry);
        volume.add_to_group(group.to_string(), lun);
        self.persist(&volume)
    }

    pub fn remove_from_group(&self, id: u32, group: &str) -> DedupResult<()> {
        let volume = self.find_volume(id).ok_or(DedupError::VolumeNotFound(id))?;
        if volume.is_preconfigured() {
            return Err(DedupError::Preconfigured);
        }
        let mut registry = self.registry.lock();
        if let Some(entries) = registry.by_group.get_mut(group) {
            entries.retain(|(_, vid)| *vid != id);
        }
        drop(registry);
        volume.remove_from_group(group);
        self.persist(&volume)
    }

    pub fn add_to_target(&self, id: u32, target: &str, lun: u32) -> DedupResult<()> {
        if !self.target_info.lock().as_ref().is_some_and(|t| t.exists(target)) {
            return Err(DedupError::InvalidName(target.to_string(), "target does not exist"));
        }
        self.add_to_target_unchecked(id, target, lun)
    }

    /// Shared by `add_to_target` and the `VolumeDirectory::rebind_target`
    /// rename path, which runs before `TargetInfo` commits the new name and
    /// so cannot pass the existence check yet.
    fn add_to_target_unchecked(&self, id: u32, target: &str, lun: u32) -> DedupResult<()> {
        let volume = self.find_volume(id).ok_or(DedupError::VolumeNotFound(id))?;
        if volume.is_preconfigured() {
            return Err(DedupError::Preconfigured);
        }
        let mut registry = self.registry.lock();
        let entries = registry.by_target.entry(target.to_string()).or_default();
        if entries.iter().any(|(other_lun, _)| *other_lun == lun) {
            return Err(DedupError::TargetLunCollision {
                target: target.to_string(),
                lun,
            });
        }
        entries.push((lun, id));
        drop(registry);
        volume.add_to_target(target.to_string(), lun);
        self.persist(&volume)
    }

    pub fn remove_from_target(&self, id: u32, target: &str) -> DedupResult<()> {
        let volume = self.find_volume(id).ok_or(DedupError::VolumeNotFound(id))?;
        if volume.is_preconfigured() {
            return Err(DedupError::Preconfigured);
        }
        let mut registry = self.registry.lock();
        if let Some(entries) = registry.by_target.get_mut(target) {
            entries.retain(|(_, vid)| *vid != id);
        }
        drop(registry);
        volume.remove_from_target(target);
        self.persist(&volume)
    }

    pub fn change_maintenance_mode(&self, id: u32, flag: bool) -> DedupResult<()> {
        let volume = self.find_volume(id).ok_or(DedupError::VolumeNotFound(id))?;
        if volume.is_preconfigured() {
            return Err(DedupError::Preconfigured);
        }
        volume.change_maintenance_mode(flag)?;
        self.persist(&volume)
    }

    pub fn change_logical_size(&self, id: u32, new_size: u64) -> DedupResult<()> {
        let volume = self.find_volume(id).ok_or(DedupError::VolumeNotFound(id))?;
        if volume.is_preconfigured() {
            return Err(DedupError::Preconfigured);
        }
        volume.change_logical_size(new_size)?;
        self.persist(&volume)
    }

    pub fn change_options(&self, id: u32, changes: &[(String, String)]) -> DedupResult<()> {
        let volume = self.find_volume(id).ok_or(DedupError::VolumeNotFound(id))?;
        if volume.is_preconfigured() {
            return Err(DedupError::Preconfigured);
        }
        volume.change_options(changes)?;
        self.persist(&volume)
    }

    /// §4.5 `FastCopy(src, tgt, src_off, tgt_off, size)`.
    pub fn fast_copy(&self, src: u32, tgt: u32, src_off: u64, tgt_off: u64, size: u64) -> DedupResult<()> {
        if src == tgt {
            return Err(DedupError::FastCopySameVolume);
        }
        let source = self.find_volume(src).ok_or(DedupError::VolumeNotFound(src))?;
        let target = self.find_volume(tgt).ok_or(DedupError::VolumeNotFound(tgt))?;
        if !source.is_maintenance() || !target.is_maintenance() {
            return Err(DedupError::InvalidVolumeState(tgt, "both endpoints must be in maintenance"));
        }
        if src_off + size > source.logical_size() || tgt_off + size > target.logical_size() {
            return Err(DedupError::FastCopyRangeOutOfBounds);
        }
        self.fast_copy
            .start_new_job(JobData {
                source_id: src,
                target_id: tgt,
                src_start: src_off,
                tgt_start: tgt_off,
                size,
                current_offset: 0,
                job_failed: false,
            })
            .map_err(|_| DedupError::FastCopyTargetBusy(tgt))
    }

    pub fn add_session(&self, id: u32, session: Session) -> DedupResult<()> {
        let volume = self.find_volume(id).ok_or(DedupError::VolumeNotFound(id))?;
        volume.add_session(session);
        Ok(())
    }

    pub fn remove_session(&self, id: u32, session_id: u64) -> DedupResult<()> {
        let volume = self.find_volume(id).ok_or(DedupError::VolumeNotFound(id))?;
        volume.remove_session(session_id);
        Ok(())
    }

    pub fn run_all(&self) -> DedupResult<()> {
        let volumes: Vec<_> = {
            let mut registry = self.registry.lock();
            registry.running = true;
            registry.by_id.values().cloned().collect()
        };
        for volume in volumes {
            volume.run()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dedup_engine::EngineError;
    use crate::dedup_engine::ErrorContext;
    use crate::dedup_engine::RequestType;
    use crate::fastcopy::FastCopyEngine;
    use crate::kernel_bridge::BridgeError;
    use crate::kernel_bridge::BridgeEvent;
    use crate::kernel_bridge::BridgeReply;
    use crate::kernel_bridge::RegisterOptions;
    use crate::persistence::InMemoryIndex;
    use crate::persistence::InMemoryInfoStore;
    use crate::scsi::sense::Sense;

    struct NullDedupVolume;
    impl DedupVolume for NullDedupVolume {
        fn start(&self, _ctx: StartContext) -> Result<(), EngineError> {
            Ok(())
        }
        fn run(&self) -> Result<(), EngineError> {
            Ok(())
        }
        fn stop(&self) -> Result<(), EngineError> {
            Ok(())
        }
        fn close(&self) -> Result<(), EngineError> {
            Ok(())
        }
        fn make_request(
            &self,
            _request_type: RequestType,
            _offset: u64,
            _size: usize,
            _buffer: &mut [u8],
            _error_ctx: &mut ErrorContext,
        ) -> Sense {
            Sense::good()
        }
        fn sync_cache(&self) -> Sense {
            Sense::good()
        }
        fn fast_copy_to(
            &self,
            _target: &dyn DedupVolume,
            _src_offset: u64,
            _tgt_offset: u64,
            _size: u64,
            _error_ctx: &mut ErrorContext,
        ) -> Result<(), EngineError> {
            Ok(())
        }
        fn throttle(&self) -> bool {
            false
        }
        fn change_logical_size(&self, _new_size: u64) -> Result<(), EngineError> {
            Ok(())
        }
        fn change_maintenance_mode(&self, _maintenance: bool) -> Result<(), EngineError> {
            Ok(())
        }
        fn change_options(&self, _options: &[(String, String)]) -> Result<(), EngineError> {
            Ok(())
        }
        fn commit_event(&self, _event: LogEvent) -> Result<(), EngineError> {
            Ok(())
        }
    }

    struct NullBridge;
    impl KernelScsiBridge for NullBridge {
        fn start(&self, _block_size: u32) -> Result<(), BridgeError> {
            Ok(())
        }
        fn restart(&self, _block_size: u32) -> Result<(), BridgeError> {
            Ok(())
        }
        fn stop(&self) -> Result<(), BridgeError> {
            Ok(())
        }
        fn register(&self, _device_name: &str, _options: RegisterOptions) -> Result<(), BridgeError> {
            Ok(())
        }
        fn handle_process_command(
            &self,
            _handler: &mut dyn FnMut(BridgeEvent) -> BridgeReply,
        ) -> Result<bool, BridgeError> {
            std::thread::sleep(std::time::Duration::from_millis(5));
            Ok(false)
        }
        fn notify_device_capacity_changed(&self) -> Result<(), BridgeError> {
            Ok(())
        }
    }

    struct NullDedupSystem;
    impl DedupSystem for NullDedupSystem {
        fn register_volume(&self, _volume_id: u32, _dedup_volume: Arc<dyn DedupVolume>) -> Result<(), EngineError> {
            Ok(())
        }
        fn unregister_volume(&self, _volume_id: u32) -> Result<(), EngineError> {
            Ok(())
        }
        fn flush_chunk_store(&self) -> Result<(), EngineError> {
            Ok(())
        }
        fn delete_block_info(&self, _volume_id: u32, _block_id: u64) -> Result<(), EngineError> {
            Ok(())
        }
    }

    struct NoVolumes;
    impl VolumeLookup for NoVolumes {
        fn dedup_volume(&self, _volume_id: u32) -> Option<Arc<dyn DedupVolume>> {
            None
        }
    }

    fn make_info() -> Arc<VolumeInfo> {
        let index: Arc<dyn PersistentIndex<u32, VolumeRecord>> = Arc::new(InMemoryIndex::new());
        let dedup_system: Arc<dyn DedupSystem> = Arc::new(NullDedupSystem);
        let error_store: Arc<dyn InfoStore> = Arc::new(InMemoryInfoStore::new());
        let detaching_index = Arc::new(InMemoryIndex::new());
        let detacher = VolumeDetacher::new(detaching_index, dedup_system.clone(), Arc::new(crate::detacher::AlwaysIdle));
        let info_store: Arc<dyn InfoStore> = Arc::new(InMemoryInfoStore::new());
        let info = VolumeInfo::new(
            index,
            dedup_system,
            Arc::new(|_id| Arc::new(NullDedupVolume) as Arc<dyn DedupVolume>),
            Arc::new(|_id| Arc::new(NullBridge) as Arc<dyn KernelScsiBridge>),
            error_store,
            detacher,
            FastCopyEngine::new(info_store, Arc::new(NoVolumes)),
        );
        let groups = GroupInfo::new(Arc::new(InMemoryIndex::new()));
        groups.start(&["g0".to_string()]).unwrap();
        let users = crate::user_info::UserInfo::new(Arc::new(InMemoryIndex::new()));
        users.start(Vec::new()).unwrap();
        let targets = TargetInfo::new(Arc::new(InMemoryIndex::new()), users);
        targets.set_volume_directory(info.clone());
        targets.start(Vec::new()).unwrap();
        info.start(groups, targets, Vec::new(), StartContext::default()).unwrap();
        info
    }

    fn opts(id: u32) -> VolumeCreateOptions {
        VolumeCreateOptions {
            id,
            device_name: None,
            logical_size: 1024 * 1024,
            sector_size: Some(512),
            command_thread_count: Some(2),
            preconfigured: false,
        }
    }

    #[test]
    fn attach_then_detach() {
        let info = make_info();
        info.attach_volume(opts(1)).unwrap();
        assert!(info.find_volume(1).is_some());
        info.detach_volume(1).unwrap();
        assert!(info.find_volume(1).is_none());
        assert!(info.detacher.is_detaching(1));
    }

    #[test]
    fn attach_duplicate_id_rejected() {
        let info = make_info();
        info.attach_volume(opts(1)).unwrap();
        assert!(info.attach_volume(opts(1)).is_err());
    }

    #[test]
    fn group_lun_collision_rejected() {
        let info = make_info();
        info.attach_volume(opts(1)).unwrap();
        info.attach_volume(opts(2)).unwrap();
        info.add_to_group(1, "g0", 0).unwrap();
        let err = info.add_to_group(2, "g0", 0).unwrap_err();
        assert!(matches!(err, DedupError::GroupLunCollision { .. }));
    }

    #[test]
    fn detach_blocked_while_in_group() {
        let info = make_info();
        info.attach_volume(opts(1)).unwrap();
        info.add_to_group(1, "g0", 0).unwrap();
        let err = info.detach_volume(1).unwrap_err();
        assert!(matches!(err, DedupError::InGroup(1)));
    }
}
