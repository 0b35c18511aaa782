// Copyright 2024 The dedupv1d Authors.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The kernel SCSI bridge interface (§6): observed, never defined, by the
//! core. The wire format and the kernel-side target implementation are out
//! of scope (§1); this module is the contract a `Volume`'s worker threads
//! drive.

use crate::scsi::Sense;

/// One inbound unit of work dequeued from `HandleProcessCommand` (§6).
#[derive(Clone, Debug)]
pub enum BridgeEvent {
    AttachSession { session_id: u64 },
    DetachSession { session_id: u64 },
    TaskManagementReceived { session_id: u64, function: TaskManagementFunction },
    Execute {
        session_id: u64,
        command_id: u64,
        cdb: Vec<u8>,
        /// Initiator-supplied data for WRITE/VERIFY(BYTCHK); empty for
        /// data-in commands.
        data_out: Vec<u8>,
        alloc_len: usize,
    },
}

/// Task management function codes (§4.3 TaskMgmt).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum TaskManagementFunction {
    AbortTask,
    AbortTaskSet,
    ClearAca,
    ClearTaskSet,
    LunReset,
    TargetReset,
    NexusLoss,
    NexusLossSess,
    AbortAllTasks,
    AbortAllTasksSess,
    UnregSessTm,
    PrAbortAll,
}

/// What a `Volume` worker reports back after handling one `BridgeEvent`.
#[derive(Clone, Debug)]
pub enum BridgeReply {
    Ok,
    Command { sense: Sense, data: Vec<u8> },
    TaskManagementDone,
}

#[derive(thiserror::Error, Debug)]
pub enum BridgeError {
    #[error("kernel scsi bridge is not registered")]
    NotRegistered,
    #[error("kernel scsi bridge command acquisition failed: {0}")]
    Acquisition(String),
}

/// Parameters passed to `Register` (§6): fixed for the volume's geometry,
/// not configurable per call site.
#[derive(Copy, Clone, Debug)]
pub struct RegisterOptions {
    pub block_size: u32,
}

/// A blocking command-acquisition channel (§1 "described abstractly"). One
/// instance is shared by every worker thread of a single `Volume`; workers
/// call `handle_process_command` in a loop, each call blocking up to
/// `BRIDGE_POLL_TIMEOUT_MS` (§5).
pub trait KernelScsiBridge: Send + Sync {
    fn start(&self, block_size: u32) -> Result<(), BridgeError>;
    fn restart(&self, block_size: u32) -> Result<(), BridgeError>;
    fn stop(&self) -> Result<(), BridgeError>;
    fn register(&self, device_name: &str, options: RegisterOptions) -> Result<(), BridgeError>;

    /// Polls for the next command with a fixed timeout; `None` on timeout
    /// (the caller should re-check cancellation and retry).
    fn handle_process_command(
        &self,
        handler: &mut dyn FnMut(BridgeEvent) -> BridgeReply,
    ) -> Result<bool, BridgeError>;

    fn notify_device_capacity_changed(&self) -> Result<(), BridgeError>;
}
