// Copyright 2024 The dedupv1d Authors.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Per-volume SCSI execution state and the `ExecuteSCSICommand` pipeline
//! (§4.3). One `CommandHandler` per `Volume`; one logical session per
//! worker thread, created by the handler and held by the worker.

use std::collections::VecDeque;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use dashmap::DashMap;
use log::debug;
use log::info;

use crate::dedup_engine::DedupVolume;
use crate::dedup_engine::ErrorContext;
use crate::dedup_engine::RequestType;
use crate::error_report::ErrorReport;
use crate::error_report::ErrorReportLog;
use crate::kernel_bridge::TaskManagementFunction;
use crate::persistence::InfoStore;
use crate::scsi::command::Command;
use crate::scsi::command::ModeSenseParams;
use crate::scsi::constants::*;
use crate::scsi::mode_sense;
use crate::scsi::sense::Sense;
use crate::scsi::sense::TaskManagementResult;
use crate::scsi::{capacity, inquiry};
use crate::stats::CommandCounters;
use crate::stats::RollingAverage;
use crate::stats::ThroughputMeter;

const SLOW_COMMAND_THRESHOLD: Duration = Duration::from_millis(100);
const PAGE_SIZE: usize = 4096;

/// Best-effort per-worker trace (§3 CommandHandlerThreadState), keyed by
/// the session currently driving the worker.
#[derive(Copy, Clone, Debug)]
pub struct CommandHandlerThreadState {
    pub session_id: u64,
    pub command_id: u64,
    pub opcode: u8,
}

/// Identity the handler needs for INQUIRY/capacity replies; mirrors the
/// subset of `Volume` fields the command path reads without taking the
/// volume lock (§4.4: "workers hold [the lock] in read mode only during
/// the cheap state check").
#[derive(Clone, Debug)]
pub struct VolumeIdentity {
    pub device_name: String,
    pub unique_serial_number: u64,
    pub sector_size: u32,
}

/// One worker's session handle into the handler: created by
/// `CommandHandler::attach_session`, held by the worker thread for the
/// lifetime of its loop, released via `detach_session` (§4.3).
pub struct CommandHandlerSession {
    pub session_id: u64,
}

/// Per-volume SCSI execution state (§4.3): rolling averages, throughput
/// meters, counters, and the last-K error report ring.
pub struct CommandHandler {
    identity: VolumeIdentity,
    dedup_volume: Arc<dyn DedupVolume>,
    maintenance: Arc<AtomicBool>,
    block_count: Arc<std::sync::atomic::AtomicU64>,

    sessions: DashMap<u64, ()>,
    unit_attention: DashMap<u64, sync::Mutex<VecDeque<Sense>>>,
    trace: DashMap<u64, CommandHandlerThreadState>,

    response_time: RollingAverage,
    write_response_time: RollingAverage,
    read_throughput: ThroughputMeter,
    write_throughput: ThroughputMeter,
    counters: CommandCounters,
    error_log: ErrorReportLog,
}

impl CommandHandler {
    pub fn new(
        volume_id: u32,
        identity: VolumeIdentity,
        dedup_volume: Arc<dyn DedupVolume>,
        maintenance: Arc<AtomicBool>,
        block_count: Arc<std::sync::atomic::AtomicU64>,
    ) -> Self {
        CommandHandler {
            identity,
            dedup_volume,
            maintenance,
            block_count,
            sessions: DashMap::new(),
            unit_attention: DashMap::new(),
            trace: DashMap::new(),
            response_time: RollingAverage::new(RESPONSE_TIME_WINDOW),
            write_response_time: RollingAverage::new(RESPONSE_TIME_WINDOW),
            read_throughput: ThroughputMeter::new(Duration::from_secs(THROUGHPUT_WINDOW_SECONDS)),
            write_throughput: ThroughputMeter::new(Duration::from_secs(THROUGHPUT_WINDOW_SECONDS)),
            counters: CommandCounters::new(),
            error_log: ErrorReportLog::new(volume_id),
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn average_response_time_ms(&self) -> f64 {
        self.response_time.average()
    }

    pub fn counters(&self) -> &CommandCounters {
        &self.counters
    }

    /// §4.3 AttachSession: inserts a Session, starts its unit-attention
    /// FIFO, emits an INFO log.
    pub fn attach_session(&self, session_id: u64) -> CommandHandlerSession {
        self.sessions.insert(session_id, ());
        self.unit_attention
            .insert(session_id, sync::Mutex::new(VecDeque::new()));
        info!("session {} attached", session_id);
        CommandHandlerSession { session_id }
    }

    /// §4.3 DetachSession: removes the Session and its unit-attention FIFO.
    pub fn detach_session(&self, session_id: u64) {
        self.sessions.remove(&session_id);
        self.unit_attention.remove(&session_id);
        self.trace.remove(&session_id);
    }

    /// §4.3 TaskMgmt: counts the function code and returns SUCCESS; richer
    /// semantics are not required by the core.
    pub fn task_mgmt(&self, function: TaskManagementFunction) -> TaskManagementResult {
        self.counters.record_task_mgmt(task_mgmt_name(function));
        TaskManagementResult::Success
    }

    /// Pushes a unit-attention condition onto every currently attached
    /// session's FIFO (§4.3 Failure semantics, §4.4 ChangeMaintenanceMode).
    pub fn push_unit_attention_all(&self, sense: Sense) {
        for entry in self.unit_attention.iter() {
            entry.value().lock().push_back(sense);
        }
    }

    fn pop_unit_attention(&self, session_id: u64) -> Option<Sense> {
        self.unit_attention
            .get(&session_id)
            .and_then(|fifo| fifo.lock().pop_front())
    }

    /// `ExecuteSCSICommand` (§4.3 steps 1-7). Returns the reply sense plus
    /// any data produced for the initiator's buffer.
    pub fn execute(
        &self,
        session_id: u64,
        command_id: u64,
        cdb: &[u8],
        data_out: &[u8],
        alloc_len: usize,
        error_store: &dyn InfoStore,
    ) -> (Sense, Vec<u8>) {
        let start = Instant::now();
        let opcode = cdb.first().copied().unwrap_or(0);

        // Step 1: trace + default reply.
        self.trace.insert(
            session_id,
            CommandHandlerThreadState {
                session_id,
                command_id,
                opcode,
            },
        );

        // Step 2: page-aligned reply buffer, fallibly (mirrors the
        // reference's memalloc failure path, §4.3 step 2 / §7).
        let mut reply = Vec::new();
        if alloc_len > 0 {
            let pages = alloc_len.div_ceil(PAGE_SIZE) * PAGE_SIZE;
            if reply.try_reserve(pages).is_err() {
                self.trace.remove(&session_id);
                return (
                    Sense::check_condition(VENDOR_SPECIFIC, ASC_VENDOR_SPECIFIC_MEMALLOC_FAILURE),
                    Vec::new(),
                );
            }
            self.counters.record_alloc();
            reply.resize(alloc_len, 0);
        }

        // Step 3: short-circuit on pending unit attention.
        if let Some(sense) = self.pop_unit_attention(session_id) {
            self.counters.record_command(opcode);
            self.trace.remove(&session_id);
            return (sense, reply);
        }

        self.counters.record_command(opcode);

        // Step 4: decode and dispatch.
        let decoded = Command::decode(cdb, alloc_len as u32);
        let sense = match decoded {
            Ok(command) => self.dispatch(command, data_out, &mut reply),
            Err(_) => Sense::check_condition(ILLEGAL_REQUEST, ASC_INVALID_COMMAND_OPERATION_CODE),
        };

        // Step 5: update counters / rolling averages.
        let elapsed = start.elapsed();
        self.response_time.add(elapsed.as_secs_f64() * 1000.0);
        if matches!(decoded, Ok(Command::Write(_))) {
            self.write_response_time.add(elapsed.as_secs_f64() * 1000.0);
        }
        if sense.counts_as_error() {
            self.counters.record_opcode_error(opcode);
        }
        if sense.is_recovered() {
            self.counters.record_retry();
        }
        if elapsed > SLOW_COMMAND_THRESHOLD {
            debug!(
                "slow scsi command: opcode={:#04x} session={} elapsed={:?}",
                opcode, session_id, elapsed
            );
        }

        // Step 6: write sense + error report on failure.
        if !sense.is_ok() {
            let sense_bytes = sense.to_fixed_bytes();
            if reply.len() < sense_bytes.len() {
                reply.resize(sense_bytes.len(), 0);
            }
            reply[..sense_bytes.len()].copy_from_slice(&sense_bytes);
            self.error_log.record(
                ErrorReport {
                    opcode,
                    sense_key: sense.key,
                    asc: sense.asc,
                    ascq: sense.ascq,
                    message: format!("command {} failed", command_id),
                },
                error_store,
                Instant::now(),
            );
        }

        // Step 7: clear the trace.
        self.trace.remove(&session_id);

        (sense, reply)
    }

    fn dispatch(&self, command: Command, data_out: &[u8], reply: &mut Vec<u8>) -> Sense {
        let maintenance = self.maintenance.load(Ordering::Acquire);
        match command {
            Command::TestUnitReady => {
                if maintenance {
                    Sense::check_condition(NOT_READY, ASC_LOGICAL_UNIT_NOT_READY_MANUAL_INTERVENTION)
                } else {
                    Sense::good()
                }
            }
            Command::Inquiry { evpd, page_code } => self.inquiry(evpd, page_code, reply),
            Command::ReadCapacity10 | Command::ReadCapacity16 => {
                self.read_capacity(matches!(command, Command::ReadCapacity16), reply)
            }
            Command::ModeSense6(params) => self.mode_sense(params, reply),
            Command::Read(params) => {
                if maintenance {
                    return Sense::check_condition(
                        NOT_READY,
                        ASC_LOGICAL_UNIT_NOT_READY_MANUAL_INTERVENTION,
                    );
                }
                let offset = (params.lba) << self.identity.sector_size.trailing_zeros();
                let size = params.transfer_length as usize;
                reply.resize(size.max(reply.len()), 0);
                let mut ctx = ErrorContext::new();
                let sense = self.dedup_volume.make_request(
                    RequestType::Read,
                    offset,
                    size,
                    &mut reply[..size],
                    &mut ctx,
                );
                if sense.is_ok() {
                    self.counters
                        .record_sectors_read(size as u64 / self.identity.sector_size as u64);
                    self.read_throughput.record(size as u64, Instant::now());
                }
                sense
            }
            Command::Write(params) => {
                if maintenance {
                    return Sense::check_condition(
                        NOT_READY,
                        ASC_LOGICAL_UNIT_NOT_READY_MANUAL_INTERVENTION,
                    );
                }
                let offset = (params.lba) << self.identity.sector_size.trailing_zeros();
                let size = params.transfer_length as usize;
                let mut scratch = vec![0u8; size];
                let have = size.min(data_out.len());
                scratch[..have].copy_from_slice(&data_out[..have]);
                let mut ctx = ErrorContext::new();
                let sense = self
                    .dedup_volume
                    .make_request(RequestType::Write, offset, size, &mut scratch, &mut ctx);
                if sense.is_ok() {
                    self.counters
                        .record_sectors_written(size as u64 / self.identity.sector_size as u64);
                    self.write_throughput.record(size as u64, Instant::now());
                } else if ctx.is_full() {
                    self.maintenance.store(true, Ordering::Release);
                    self.push_unit_attention_all(Sense::check_condition(
                        UNIT_ATTENTION,
                        ASC_OPERATING_CONDITIONS_CHANGED,
                    ));
                }
                sense
            }
            Command::Verify { params, bytchk } => {
                if maintenance {
                    return Sense::check_condition(
                        NOT_READY,
                        ASC_LOGICAL_UNIT_NOT_READY_MANUAL_INTERVENTION,
                    );
                }
                let offset = params.lba << self.identity.sector_size.trailing_zeros();
                let size = params.transfer_length as usize;
                let mut scratch = vec![0u8; size];
                let mut ctx = ErrorContext::new();
                let sense =
                    self.dedup_volume
                        .make_request(RequestType::Read, offset, size, &mut scratch, &mut ctx);
                if !sense.is_ok() {
                    return sense;
                }
                if bytchk && data_out.len() >= size && scratch != data_out[..size] {
                    return Sense::check_condition(MISCOMPARE, ASC_MISCOMPARE_DURING_VERIFY);
                }
                Sense::good()
            }
            Command::SyncCache(params) => {
                if maintenance {
                    return Sense::check_condition(
                        NOT_READY,
                        ASC_LOGICAL_UNIT_NOT_READY_MANUAL_INTERVENTION,
                    );
                }
                if params.immed {
                    return Sense::check_condition(ILLEGAL_REQUEST, ASC_INVALID_FIELD_IN_CDB);
                }
                self.dedup_volume.sync_cache()
            }
        }
    }

    fn inquiry(&self, evpd: bool, page_code: u8, reply: &mut Vec<u8>) -> Sense {
        let maintenance = self.maintenance.load(Ordering::Acquire);
        if !evpd {
            if page_code != 0 {
                return Sense::check_condition(ILLEGAL_REQUEST, ASC_INVALID_FIELD_IN_CDB);
            }
            let buf = inquiry::standard_inquiry(maintenance);
            reply.clear();
            reply.extend_from_slice(&buf);
            return Sense::good();
        }
        let buf = match page_code {
            0x00 => inquiry::vpd_supported_pages(),
            0x80 => inquiry::vpd_unit_serial_number(self.identity.unique_serial_number),
            0x83 => inquiry::vpd_device_identification(&self.identity.device_name),
            _ => return Sense::check_condition(ILLEGAL_REQUEST, ASC_INVALID_FIELD_IN_CDB),
        };
        reply.clear();
        reply.extend_from_slice(&buf);
        Sense::good()
    }

    fn read_capacity(&self, is16: bool, reply: &mut Vec<u8>) -> Sense {
        let block_count = self.block_count.load(Ordering::Acquire);
        reply.clear();
        if is16 {
            reply.extend_from_slice(&capacity::read_capacity_16(block_count, self.identity.sector_size));
        } else {
            reply.extend_from_slice(&capacity::read_capacity_10(block_count, self.identity.sector_size));
        }
        Sense::good()
    }

    fn mode_sense(&self, params: ModeSenseParams, reply: &mut Vec<u8>) -> Sense {
        let block_count = self.block_count.load(Ordering::Acquire);
        match mode_sense::mode_sense_6(
            params.pc,
            params.page_code,
            params.dbd,
            block_count,
            self.identity.sector_size,
        ) {
            Ok(bytes) => {
                reply.clear();
                reply.extend_from_slice(&bytes);
                Sense::good()
            }
            Err(sense) => sense,
        }
    }
}

fn task_mgmt_name(function: TaskManagementFunction) -> &'static str {
    match function {
        TaskManagementFunction::AbortTask => "ABORT_TASK",
        TaskManagementFunction::AbortTaskSet => "ABORT_TASK_SET",
        TaskManagementFunction::ClearAca => "CLEAR_ACA",
        TaskManagementFunction::ClearTaskSet => "CLEAR_TASK_SET",
        TaskManagementFunction::LunReset => "LUN_RESET",
        TaskManagementFunction::TargetReset => "TARGET_RESET",
        TaskManagementFunction::NexusLoss => "NEXUS_LOSS",
        TaskManagementFunction::NexusLossSess => "NEXUS_LOSS_SESS",
        TaskManagementFunction::AbortAllTasks => "ABORT_ALL_TASKS",
        TaskManagementFunction::AbortAllTasksSess => "ABORT_ALL_TASKS_SESS",
        TaskManagementFunction::UnregSessTm => "UNREG_SESS_TM",
        TaskManagementFunction::PrAbortAll => "PR_ABORT_ALL",
    }
}
