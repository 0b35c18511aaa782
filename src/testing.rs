// Copyright 2024 The dedupv1d Authors.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Shared test fakes for `DedupVolume`, `KernelScsiBridge`, and
//! `DedupSystem`, used by both the per-module unit tests and the
//! scenario-level integration suite under `tests/`.

#![cfg(any(test, feature = "testing"))]

use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use sync::Mutex;

use crate::dedup_engine::DedupSystem;
use crate::dedup_engine::DedupVolume;
use crate::dedup_engine::EngineError;
use crate::dedup_engine::ErrorContext;
use crate::dedup_engine::LogEvent;
use crate::dedup_engine::RequestType;
use crate::dedup_engine::StartContext;
use crate::kernel_bridge::BridgeError;
use crate::kernel_bridge::BridgeEvent;
use crate::kernel_bridge::BridgeReply;
use crate::kernel_bridge::KernelScsiBridge;
use crate::kernel_bridge::RegisterOptions;
use crate::scsi::constants::ILLEGAL_REQUEST;
use crate::scsi::constants::MEDIUM_ERROR;
use crate::scsi::constants::ASC_LOGICAL_BLOCK_ADDRESS_OUT_OF_RANGE;
use crate::scsi::Sense;

/// An in-memory `DedupVolume` backed by a plain byte buffer, so read/write
/// scenario tests can assert on actual content rather than "it didn't
/// error".
pub struct MemoryDedupVolume {
    data: Mutex<Vec<u8>>,
    maintenance: AtomicBool,
    events: Mutex<Vec<LogEvent>>,
    fail_next: AtomicBool,
}

impl MemoryDedupVolume {
    pub fn new(size: usize) -> Arc<MemoryDedupVolume> {
        Arc::new(MemoryDedupVolume {
            data: Mutex::new(vec![0u8; size]),
            maintenance: AtomicBool::new(false),
            events: Mutex::new(Vec::new()),
            fail_next: AtomicBool::new(false),
        })
    }

    pub fn fail_next_request(&self) {
        self.fail_next.store(true, Ordering::Release);
    }

    pub fn committed_events(&self) -> Vec<LogEvent> {
        self.events.lock().clone()
    }
}

impl DedupVolume for MemoryDedupVolume {
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
        request_type: RequestType,
        offset: u64,
        size: usize,
        buffer: &mut [u8],
        error_ctx: &mut ErrorContext,
    ) -> Sense {
        if self.fail_next.swap(false, Ordering::AcqRel) {
            error_ctx.set_full();
            return Sense::check_condition(MEDIUM_ERROR, (0x0c, 0x02));
        }
        let mut data = self.data.lock();
        let start = offset as usize;
        let end = start + size;
        if end > data.len() {
            return Sense::check_condition(ILLEGAL_REQUEST, ASC_LOGICAL_BLOCK_ADDRESS_OUT_OF_RANGE);
        }
        match request_type {
            RequestType::Read => buffer[..size].copy_from_slice(&data[start..end]),
            RequestType::Write => data[start..end].copy_from_slice(&buffer[..size]),
        }
        Sense::good()
    }

    fn sync_cache(&self) -> Sense {
        Sense::good()
    }

    fn fast_copy_to(
        &self,
        target: &dyn DedupVolume,
        src_offset: u64,
        tgt_offset: u64,
        size: u64,
        error_ctx: &mut ErrorContext,
    ) -> Result<(), EngineError> {
        let mut buf = vec![0u8; size as usize];
        self.make_request(RequestType::Read, src_offset, size as usize, &mut buf, error_ctx);
        let sense = target.make_request(RequestType::Write, tgt_offset, size as usize, &mut buf, error_ctx);
        if !sense.is_ok() {
            return Err(EngineError::Rejected("fast copy step failed".to_string()));
        }
        Ok(())
    }

    fn throttle(&self) -> bool {
        false
    }

    fn change_logical_size(&self, new_size: u64) -> Result<(), EngineError> {
        let mut data = self.data.lock();
        data.resize(new_size as usize, 0);
        Ok(())
    }

    fn change_maintenance_mode(&self, maintenance: bool) -> Result<(), EngineError> {
        self.maintenance.store(maintenance, Ordering::Release);
        Ok(())
    }

    fn change_options(&self, _options: &[(String, String)]) -> Result<(), EngineError> {
        Ok(())
    }

    fn commit_event(&self, event: LogEvent) -> Result<(), EngineError> {
        self.events.lock().push(event);
        Ok(())
    }
}

/// A `KernelScsiBridge` fake that replays a fixed script of events, one per
/// `handle_process_command` call, then reports itself exhausted.
pub struct ScriptedBridge {
    events: Mutex<Vec<BridgeEvent>>,
}

impl ScriptedBridge {
    pub fn new(events: Vec<BridgeEvent>) -> Arc<ScriptedBridge> {
        Arc::new(ScriptedBridge {
            events: Mutex::new(events),
        })
    }

    pub fn empty() -> Arc<ScriptedBridge> {
        ScriptedBridge::new(Vec::new())
    }
}

impl KernelScsiBridge for ScriptedBridge {
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
        handler: &mut dyn FnMut(BridgeEvent) -> BridgeReply,
    ) -> Result<bool, BridgeError> {
        let event = self.events.lock().pop();
        match event {
            Some(event) => {
                handler(event);
                Ok(true)
            }
            None => {
                std::thread::sleep(std::time::Duration::from_millis(10));
                Ok(false)
            }
        }
    }

    fn notify_device_capacity_changed(&self) -> Result<(), BridgeError> {
        Ok(())
    }
}

/// A `DedupSystem` that counts register/unregister/flush/delete calls, for
/// assertions like "exactly one VOLUME_DETACH-triggered flush happened".
#[derive(Default)]
pub struct CountingDedupSystem {
    pub registers: AtomicU64,
    pub unregisters: AtomicU64,
    pub flushes: AtomicU64,
    pub deletes: AtomicU64,
}

impl CountingDedupSystem {
    pub fn new() -> Arc<CountingDedupSystem> {
        Arc::new(CountingDedupSystem::default())
    }
}

impl DedupSystem for CountingDedupSystem {
    fn register_volume(&self, _volume_id: u32, _dedup_volume: Arc<dyn DedupVolume>) -> Result<(), EngineError> {
        self.registers.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn unregister_volume(&self, _volume_id: u32) -> Result<(), EngineError> {
        self.unregisters.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn flush_chunk_store(&self) -> Result<(), EngineError> {
        self.flushes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn delete_block_info(&self, _volume_id: u32, _block_id: u64) -> Result<(), EngineError> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
