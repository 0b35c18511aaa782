// Copyright 2024 The dedupv1d Authors.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Placeholder `DedupSystem`/`DedupVolume`/`KernelScsiBridge` wiring for
//! the `dedupv1d` binary. The real chunker/fingerprinter/container-store
//! engine and the real kernel SCSI bridge are explicitly out of core scope
//! (§1) and are expected to be linked in by whatever embeds this crate in
//! production; these no-op implementations let `main.rs` start, accept
//! admin-path requests, and run the background subsystems end to end
//! without them.

use std::sync::Arc;

use crate::dedup_engine::DedupSystem;
use crate::dedup_engine::DedupVolume;
use crate::dedup_engine::EngineError;
use crate::dedup_engine::ErrorContext;
use crate::dedup_engine::LogEvent;
use crate::dedup_engine::RequestType;
use crate::dedup_engine::StartContext;
use crate::kernel_bridge::BridgeError;
use crate::kernel_bridge::BridgeEvent;
use crate::kernel_bridge::KernelScsiBridge;
use crate::kernel_bridge::RegisterOptions;
use crate::scsi::constants::ILLEGAL_REQUEST;
use crate::scsi::Sense;

const ASC_LOGICAL_COMMAND_NOT_SUPPORTED_FALLBACK: (u8, u8) = (0x20, 0x00);

/// Rejects every I/O request; accepts admin-path lifecycle calls so a
/// `Volume` can attach/detach/change state against it.
pub struct NullDedupVolume;

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
        Sense::check_condition(ILLEGAL_REQUEST, ASC_LOGICAL_COMMAND_NOT_SUPPORTED_FALLBACK)
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
        Err(EngineError::InvalidState)
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

pub struct NullDedupSystem;

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

/// Never produces inbound commands; `handle_process_command` simply
/// idles, letting a worker thread poll for shutdown instead of seeing
/// real SCSI traffic.
pub struct NullKernelBridge;

impl KernelScsiBridge for NullKernelBridge {
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
        _handler: &mut dyn FnMut(BridgeEvent) -> crate::kernel_bridge::BridgeReply,
    ) -> Result<bool, BridgeError> {
        std::thread::sleep(std::time::Duration::from_millis(
            crate::scsi::constants::BRIDGE_POLL_TIMEOUT_MS,
        ));
        Ok(false)
    }

    fn notify_device_capacity_changed(&self) -> Result<(), BridgeError> {
        Ok(())
    }
}
