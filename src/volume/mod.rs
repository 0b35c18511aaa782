// Copyright 2024 The dedupv1d Authors.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The `Volume` entity (§3, §4.4): identity, geometry, state machine,
//! session table, and the worker threads driving the kernel SCSI bridge.

pub mod options;
pub mod session;
pub mod state;
pub mod throttle;

use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use base::error;
use base::info;
use base::WorkerThread;
use serde::Deserialize;
use serde::Serialize;
use sync::Mutex;
use sync::RwLock;

use crate::command_handler::CommandHandler;
use crate::command_handler::VolumeIdentity;
use crate::dedup_engine::DedupVolume;
use crate::dedup_engine::StartContext;
use crate::error::DedupError;
use crate::error::DedupResult;
use crate::kernel_bridge::BridgeEvent;
use crate::kernel_bridge::BridgeReply;
use crate::kernel_bridge::KernelScsiBridge;
use crate::kernel_bridge::RegisterOptions;
use crate::persistence::InfoStore;
use crate::scsi::constants::ASC_OPERATING_CONDITIONS_CHANGED;
use crate::scsi::constants::UNIT_ATTENTION;
use crate::scsi::constants::VALID_SECTOR_SIZES;
use crate::scsi::sense::Sense;
use options::VolumeOptions;
use session::Session;
use session::SessionMap;
use state::VolumeState;
use throttle::Throttle;

fn default_device_name(id: u32) -> String {
    format!("dedupv1-{}", id)
}

fn valid_device_name(name: &str) -> bool {
    (1..=48).contains(&name.len())
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}

fn unique_serial_number(device_name: &str) -> u64 {
    use std::hash::Hash;
    use std::hash::Hasher;
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    device_name.hash(&mut hasher);
    hasher.finish()
}

/// Parameters accepted by `AttachVolume`/`Volume::new` (§4.5 AttachVolume).
#[derive(Clone, Debug, Default)]
pub struct VolumeCreateOptions {
    pub id: u32,
    pub device_name: Option<String>,
    pub logical_size: u64,
    pub sector_size: Option<u32>,
    pub command_thread_count: Option<u32>,
    pub preconfigured: bool,
}

/// `{id, device_name?, logical_size, command_thread_count, sector_size?,
/// groups, targets, filter_chain_options, chunking_options, state}`
/// round-tripped by `SerializeTo`/`ParseFrom` (§4.4).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VolumeRecord {
    pub id: u32,
    pub device_name: Option<String>,
    pub logical_size: u64,
    pub command_thread_count: u32,
    pub sector_size: Option<u32>,
    pub groups: Vec<(String, u32)>,
    pub targets: Vec<(String, u32)>,
    pub filter_chain_options: Vec<(String, String)>,
    pub chunking_options: Vec<(String, String)>,
    /// Persisted state is either RUNNING or MAINTENANCE (§4.4); transient
    /// states (CREATED/STARTED/STOPPED/FAILED) are never serialized.
    pub maintenance: bool,
}

pub struct Volume {
    pub id: u32,
    device_name: Mutex<String>,
    logical_size: AtomicU64,
    sector_size: u32,
    unique_serial_number: u64,
    command_thread_count: u32,
    preconfigured: bool,

    state: RwLock<VolumeState>,
    maintenance: Arc<AtomicBool>,
    block_count: Arc<AtomicU64>,
    registered_with_bridge: AtomicBool,

    groups: Mutex<Vec<(String, u32)>>,
    targets: Mutex<Vec<(String, u32)>>,
    options: Mutex<VolumeOptions>,
    sessions: SessionMap,
    throttle: Throttle,

    command_handler: Arc<CommandHandler>,
    dedup_volume: Arc<dyn DedupVolume>,
    kernel_bridge: Arc<dyn KernelScsiBridge>,
    error_store: Arc<dyn InfoStore>,

    workers: Mutex<Vec<WorkerThread<()>>>,
}

impl Volume {
    /// `CREATED` state. Validates id/name/size/sector per §3; does not
    /// touch the dedup engine or kernel bridge yet (that is `start`).
    pub fn new(
        options: VolumeCreateOptions,
        dedup_volume: Arc<dyn DedupVolume>,
        kernel_bridge: Arc<dyn KernelScsiBridge>,
        error_store: Arc<dyn InfoStore>,
    ) -> DedupResult<Volume> {
        let sector_size = options.sector_size.unwrap_or(crate::scsi::constants::DEFAULT_SECTOR_SIZE);
        if !VALID_SECTOR_SIZES.contains(&sector_size) {
            return Err(DedupError::InvalidSectorSize(sector_size));
        }
        if options.logical_size % sector_size as u64 != 0 {
            return Err(DedupError::InvalidLogicalSize(format!(
                "{} is not a multiple of sector size {}",
                options.logical_size, sector_size
            )));
        }
        let device_name = match options.device_name {
            Some(name) => {
                if !valid_device_name(&name) {
                    return Err(DedupError::InvalidName(
                        name,
                        "must be 1-48 chars of [a-zA-Z0-9._-]",
                    ));
                }
                name
            }
            None => default_device_name(options.id),
        };
        let command_thread_count = options
            .command_thread_count
            .unwrap_or(crate::scsi::constants::DEFAULT_COMMAND_THREAD_COUNT);

        let maintenance = Arc::new(AtomicBool::new(false));
        let block_count = Arc::new(AtomicU64::new(options.logical_size / sector_size as u64));
        let serial = unique_serial_number(&device_name);

        let command_handler = Arc::new(CommandHandler::new(
            options.id,
            VolumeIdentity {
                device_name: device_name.clone(),
                unique_serial_number: serial,
                sector_size,
            },
            dedup_volume.clone(),
            maintenance.clone(),
            block_count.clone(),
        ));

        Ok(Volume {
            id: options.id,
            device_name: Mutex::new(device_name),
            logical_size: AtomicU64::new(options.logical_size),
            sector_size,
            unique_serial_number: serial,
            command_thread_count,
            preconfigured: options.preconfigured,
            state: RwLock::new(VolumeState::Created),
            maintenance,
            block_count,
            registered_with_bridge: AtomicBool::new(false),
            groups: Mutex::new(Vec::new()),
            targets: Mutex::new(Vec::new()),
            options: Mutex::new(VolumeOptions::default()),
            sessions: SessionMap::new(),
            throttle: Throttle::new(),
            command_handler,
            dedup_volume,
            kernel_bridge,
            error_store,
            workers: Mutex::new(Vec::new()),
        })
    }

    pub fn device_name(&self) -> String {
        self.device_name.lock().clone()
    }

    pub fn logical_size(&self) -> u64 {
        self.logical_size.load(Ordering::Acquire)
    }

    pub fn sector_size(&self) -> u32 {
        self.sector_size
    }

    pub fn block_count(&self) -> u64 {
        self.block_count.load(Ordering::Acquire)
    }

    pub fn is_preconfigured(&self) -> bool {
        self.preconfigured
    }

    pub fn is_maintenance(&self) -> bool {
        self.maintenance.load(Ordering::Acquire)
    }

    pub fn state(&self) -> VolumeState {
        *self.state.read()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn command_handler(&self) -> &Arc<CommandHandler> {
        &self.command_handler
    }

    /// The underlying dedup-engine handle, for collaborators (fast-copy,
    /// the volume registry's commit-log calls) that need it without going
    /// through a `Volume` method for every dedup-engine operation.
    pub fn dedup_volume_handle(&self) -> Arc<dyn DedupVolume> {
        self.dedup_volume.clone()
    }

    /// `CREATED → STARTED` (§4.4): wires the underlying dedup volume and
    /// brings up the command handler. Does not yet spawn workers.
    pub fn start(&self, ctx: StartContext) -> DedupResult<()> {
        let mut state = self.state.write();
        if !state.can_transition_to(VolumeState::Started) {
            return Err(DedupError::InvalidVolumeState(self.id, "not in CREATED"));
        }
        self.dedup_volume
            .start(ctx)
            .map_err(DedupError::Engine)?;
        *state = VolumeState::Started;
        info!("volume {} started (device_name={})", self.id, self.device_name());
        Ok(())
    }

    /// `STARTED/STOPPED → RUNNING` (§4.4): registers with the kernel SCSI
    /// bridge (first time) or restarts it (subsequent times), spawns
    /// `command_thread_count` worker threads.
    pub fn run(self: &Arc<Self>) -> DedupResult<()> {
        {
            let state = self.state.read();
            if !state.can_transition_to(VolumeState::Running) {
                return Err(DedupError::InvalidVolumeState(self.id, "not STARTED or STOPPED"));
            }
        }
        self.dedup_volume.run().map_err(DedupError::Engine)?;

        let block_size = self.sector_size;
        if self.registered_with_bridge.swap(true, Ordering::AcqRel) {
            self.kernel_bridge.restart(block_size).map_err(DedupError::KernelBridge)?;
        } else {
            self.kernel_bridge.start(block_size).map_err(DedupError::KernelBridge)?;
            self.kernel_bridge
                .register(&self.device_name(), RegisterOptions { block_size })
                .map_err(DedupError::KernelBridge)?;
        }

        *self.state.write() = VolumeState::Running;

        let mut workers = self.workers.lock();
        workers.clear();
        for idx in 0..self.command_thread_count {
            let volume = self.clone();
            let name = format!("dedupv1-vol{}-worker{}", self.id, idx);
            workers.push(WorkerThread::start(name, move |kill_evt| {
                volume.worker_loop(idx, kill_evt);
            }));
        }
        info!("volume {} running with {} workers", self.id, self.command_thread_count);
        Ok(())
    }

    fn worker_loop(&self, thread_idx: u32, kill_evt: base::Event) {
        let session_id = thread_idx as u64;
        let _session = self.command_handler.attach_session(session_id);
        loop {
            if self.state() != VolumeState::Running {
                break;
            }
            let local_sleep = self
                .throttle
                .decide(self.command_handler.average_response_time_ms(), self.command_thread_count);
            if let Some(sleep) = local_sleep {
                self.throttle.enter();
                if kill_evt.wait_timeout(sleep) {
                    self.throttle.exit(std::time::Duration::from_secs(0));
                    break;
                }
                self.throttle.exit(sleep);
            }
            // Always delegate to the dedup volume's own throttle, even when the
            // local response-time check already decided not to sleep.
            let engine_throttled = self.dedup_volume.throttle();
            if local_sleep.is_none() && !engine_throttled {
                let handler = &self.command_handler;
                let error_store = self.error_store.as_ref();
                let maintenance = &self.maintenance;
                let result = self.kernel_bridge.handle_process_command(&mut |event| {
                    Self::dispatch_bridge_event(handler, error_store, maintenance, session_id, event)
                });
                match result {
                    Ok(_processed) => {}
                    Err(e) => {
                        error!("volume {} worker {} bridge error: {}", self.id, thread_idx, e);
                        *self.state.write() = VolumeState::Failed;
                        break;
                    }
                }
            }
            if kill_evt.is_signaled() {
                break;
            }
        }
        self.command_handler.detach_session(session_id);
    }

    fn dispatch_bridge_event(
        handler: &CommandHandler,
        error_store: &dyn InfoStore,
        maintenance: &AtomicBool,
        worker_session_id: u64,
        event: BridgeEvent,
    ) -> BridgeReply {
        match event {
            BridgeEvent::AttachSession { session_id } => {
                handler.attach_session(session_id);
                BridgeReply::Ok
            }
            BridgeEvent::DetachSession { session_id } => {
                handler.detach_session(session_id);
                BridgeReply::Ok
            }
            BridgeEvent::TaskManagementReceived { function, .. } => {
                handler.task_mgmt(function);
                BridgeReply::TaskManagementDone
            }
            BridgeEvent::Execute {
                session_id,
                command_id,
                cdb,
                data_out,
                alloc_len,
            } => {
                let _ = maintenance;
                let session_id = if session_id == 0 { worker_session_id } else { session_id };
                let (sense, data) = handler.execute(session_id, command_id, &cdb, &data_out, alloc_len, error_store);
                BridgeReply::Command { sense, data }
            }
        }
    }

    /// `RUNNING → STOPPED` (§4.4): flips state first so workers exit at
    /// their next check, joins them, unregisters from the kernel bridge.
    pub fn stop(&self) -> DedupResult<()> {
        {
            let mut state = self.state.write();
            if !state.can_transition_to(VolumeState::Stopped) {
                return Err(DedupError::InvalidVolumeState(self.id, "not RUNNING"));
            }
            *state = VolumeState::Stopped;
        }
        let workers: Vec<_> = self.workers.lock().drain(..).collect();
        for worker in workers {
            worker.stop();
        }
        self.kernel_bridge.stop().map_err(DedupError::KernelBridge)?;
        self.dedup_volume.stop().map_err(DedupError::Engine)?;
        info!("volume {} stopped", self.id);
        Ok(())
    }

    /// §4.4 ChangeMaintenanceMode: no-op if already in that mode; forbidden
    /// from FAILED; flips the flag, notifies the dedup volume, and injects
    /// an OPERATING CONDITIONS CHANGED unit-attention into every session.
    pub fn change_maintenance_mode(&self, flag: bool) -> DedupResult<()> {
        let _state = self.state.write();
        if *_state == VolumeState::Failed {
            return Err(DedupError::InvalidVolumeState(self.id, "volume is FAILED"));
        }
        if self.maintenance.swap(flag, Ordering::AcqRel) == flag {
            return Ok(());
        }
        self.dedup_volume
            .change_maintenance_mode(flag)
            .map_err(DedupError::Engine)?;
        self.command_handler.push_unit_attention_all(Sense::check_condition(
            UNIT_ATTENTION,
            ASC_OPERATING_CONDITIONS_CHANGED,
        ));
        Ok(())
    }

    /// §4.4 ChangeLogicalSize: requires monotonic growth; recomputes block
    /// count; notifies the bridge of the capacity change if registered.
    pub fn change_logical_size(&self, new_size: u64) -> DedupResult<()> {
        let _state = self.state.write();
        let current = self.logical_size();
        if new_size < current {
            return Err(DedupError::InvalidLogicalSize(
                "logical size may not shrink".to_string(),
            ));
        }
        if new_size % self.sector_size as u64 != 0 {
            return Err(DedupError::InvalidLogicalSize(format!(
                "{} is not a multiple of sector size {}",
                new_size, self.sector_size
            )));
        }
        self.dedup_volume
            .change_logical_size(new_size)
            .map_err(DedupError::Engine)?;
        self.logical_size.store(new_size, Ordering::Release);
        self.block_count.store(new_size / self.sector_size as u64, Ordering::Release);
        if self.registered_with_bridge.load(Ordering::Acquire) {
            let _ = self.kernel_bridge.notify_device_capacity_changed();
        }
        Ok(())
    }

    /// §4.4 ChangeOptions: only while in maintenance; reverts to the
    /// previously saved option sets on failure.
    pub fn change_options(&self, changes: &[(String, String)]) -> DedupResult<()> {
        if !self.is_maintenance() {
            return Err(DedupError::NotInMaintenance);
        }
        let proposed = VolumeOptions::partition(changes);
        let mut saved = self.options.lock();
        let previous = saved.clone();
        match self.dedup_volume.change_options(&proposed.as_flat_list()) {
            Ok(()) => {
                *saved = proposed;
                Ok(())
            }
            Err(e) => {
                *saved = previous;
                Err(DedupError::Engine(e))
            }
        }
    }

    pub fn add_session(&self, session: Session) {
        self.sessions.add(session);
    }

    pub fn remove_session(&self, session_id: u64) {
        self.sessions.remove(session_id);
    }

    pub fn find_session(&self, session_id: u64) -> Option<Session> {
        self.sessions.find(session_id)
    }

    pub fn groups(&self) -> Vec<(String, u32)> {
        self.groups.lock().clone()
    }

    pub fn targets(&self) -> Vec<(String, u32)> {
        self.targets.lock().clone()
    }

    pub fn add_to_group(&self, group: String, lun: u32) {
        self.groups.lock().push((group, lun));
    }

    pub fn remove_from_group(&self, group: &str) {
        self.groups.lock().retain(|(g, _)| g != group);
    }

    pub fn add_to_target(&self, target: String, lun: u32) {
        self.targets.lock().push((target, lun));
    }

    pub fn remove_from_target(&self, target: &str) {
        self.targets.lock().retain(|(t, _)| t != target);
    }

    /// §4.4 SerializeTo. An unset `device_name` round-trips as "use the
    /// default-from-id"; here we only omit it when it equals that default.
    pub fn serialize_to(&self) -> VolumeRecord {
        let name = self.device_name();
        let options = self.options.lock();
        VolumeRecord {
            id: self.id,
            device_name: if name == default_device_name(self.id) {
                None
            } else {
                Some(name)
            },
            logical_size: self.logical_size(),
            command_thread_count: self.command_thread_count,
            sector_size: Some(self.sector_size),
            groups: self.groups(),
            targets: self.targets(),
            filter_chain_options: options.filter_options.clone(),
            chunking_options: options.chunking_options.clone(),
            maintenance: self.is_maintenance(),
        }
    }

    pub fn parse_from(
        record: VolumeRecord,
        preconfigured: bool,
        dedup_volume: Arc<dyn DedupVolume>,
        kernel_bridge: Arc<dyn KernelScsiBridge>,
        error_store: Arc<dyn InfoStore>,
    ) -> DedupResult<Volume> {
        let volume = Volume::new(
            VolumeCreateOptions {
                id: record.id,
                device_name: record.device_name,
                logical_size: record.logical_size,
                sector_size: record.sector_size,
                command_thread_count: Some(record.command_thread_count),
                preconfigured,
            },
            dedup_volume,
            kernel_bridge,
            error_store,
        )?;
        *volume.groups.lock() = record.groups;
        *volume.targets.lock() = record.targets;
        *volume.options.lock() = VolumeOptions {
            filter_options: record.filter_chain_options,
            chunking_options: record.chunking_options,
        };
        volume.maintenance.store(record.maintenance, Ordering::Release);
        Ok(volume)
    }
}
