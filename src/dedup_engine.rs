// Copyright 2024 The dedupv1d Authors.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The contracts the volume subsystem invokes on the deduplication core
//! (§6). The chunker, fingerprinter, chunk index, container store, block
//! index, garbage collector, and log replay are explicitly out of core
//! scope (§1); only the interface the volume subsystem drives is modeled
//! here.

use crate::scsi::Sense;

/// `{type, offset, size}` as consumed by `MakeRequest` (§6).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RequestType {
    Read,
    Write,
}

/// Populated by a failed `MakeRequest`; `is_full` forces the owning volume
/// into maintenance (§4.3 Failure semantics).
#[derive(Copy, Clone, Debug, Default)]
pub struct ErrorContext {
    is_full: bool,
}

impl ErrorContext {
    pub fn new() -> Self {
        ErrorContext::default()
    }

    pub fn set_full(&mut self) {
        self.is_full = true;
    }

    pub fn is_full(&self) -> bool {
        self.is_full
    }
}

/// Startup recovery context (ADDED, §8 scenario 2 / GLOSSARY "Dirty
/// start"): whether this process start is creating fresh state or
/// attaching to existing (possibly unclean) on-disk state.
#[derive(Copy, Clone, Debug, Default)]
pub struct StartContext {
    pub create: bool,
    pub dirty: bool,
}

/// Per-volume handle into the dedup engine (§6). One instance per `Volume`;
/// `Volume` never touches chunking/fingerprinting/container storage
/// directly, only through this trait.
pub trait DedupVolume: Send + Sync {
    fn start(&self, ctx: StartContext) -> Result<(), EngineError>;
    fn run(&self) -> Result<(), EngineError>;
    fn stop(&self) -> Result<(), EngineError>;
    fn close(&self) -> Result<(), EngineError>;

    /// Executes a read or write at `offset`/`size` into/from `buffer`.
    /// `error_ctx` is populated on failure per §4.3.
    fn make_request(
        &self,
        request_type: RequestType,
        offset: u64,
        size: usize,
        buffer: &mut [u8],
        error_ctx: &mut ErrorContext,
    ) -> Sense;

    fn sync_cache(&self) -> Sense;

    /// Copies `size` bytes from `self` at `src_offset` to `target` at
    /// `tgt_offset` (§4.7).
    fn fast_copy_to(
        &self,
        target: &dyn DedupVolume,
        src_offset: u64,
        tgt_offset: u64,
        size: u64,
        error_ctx: &mut ErrorContext,
    ) -> Result<(), EngineError>;

    /// Applies response-time-based backpressure; returns whether the
    /// caller should additionally sleep (§4.4 `Throttle`).
    fn throttle(&self) -> bool;

    fn change_logical_size(&self, new_size: u64) -> Result<(), EngineError>;
    fn change_maintenance_mode(&self, maintenance: bool) -> Result<(), EngineError>;
    fn change_options(&self, options: &[(String, String)]) -> Result<(), EngineError>;

    fn commit_event(&self, event: LogEvent) -> Result<(), EngineError>;
}

/// `Log.CommitEvent(VOLUME_ATTACH | VOLUME_DETACH, ...)` (§6).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LogEvent {
    VolumeAttach { volume_id: u32 },
    VolumeDetach { volume_id: u32 },
}

#[derive(thiserror::Error, Debug)]
pub enum EngineError {
    #[error("dedup engine rejected the operation: {0}")]
    Rejected(String),
    #[error("dedup engine is not in a state that permits this operation")]
    InvalidState,
}

/// The dedup engine's own volume registry, which `VolumeInfo` coordinates
/// attach/detach against (§4.5 AttachVolume/DetachVolume).
pub trait DedupSystem: Send + Sync {
    fn register_volume(
        &self,
        volume_id: u32,
        dedup_volume: std::sync::Arc<dyn DedupVolume>,
    ) -> Result<(), EngineError>;
    fn unregister_volume(&self, volume_id: u32) -> Result<(), EngineError>;
    fn flush_chunk_store(&self) -> Result<(), EngineError>;

    /// Deletes block metadata for one block; used by the detacher (§4.6).
    fn delete_block_info(&self, volume_id: u32, block_id: u64) -> Result<(), EngineError>;
}
