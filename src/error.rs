// Copyright 2024 The dedupv1d Authors.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Admin-path errors (§7): structured failures returned from registry
//! operations, distinct from the SCSI-path `Sense` values the command
//! handler converts I/O errors into.

use remain::sorted;
use thiserror::Error;

use crate::dedup_engine::EngineError;
use crate::kernel_bridge::BridgeError;
use crate::persistence::IndexError;

#[sorted]
#[derive(Error, Debug)]
pub enum DedupError {
    #[error("device name {0:?} is already in use")]
    DeviceNameInUse(String),
    #[error("dedup engine error: {0}")]
    Engine(#[from] EngineError),
    #[error("fast-copy range exceeds the volume's logical size")]
    FastCopyRangeOutOfBounds,
    #[error("fast-copy source and target volume must differ")]
    FastCopySameVolume,
    #[error("a fast-copy job already targets volume {0}")]
    FastCopyTargetBusy(u32),
    #[error("(group {group:?}, lun {lun}) is already assigned to another volume")]
    GroupLunCollision { group: String, lun: u32 },
    #[error("group {0:?} does not exist")]
    GroupNotFound(String),
    #[error("volume {0} is still a fast-copy endpoint")]
    InFastCopy(u32),
    #[error("volume {0} is still assigned to a group")]
    InGroup(u32),
    #[error("volume {0} is still assigned to a target")]
    InTarget(u32),
    #[error("persistence error: {0}")]
    Index(#[from] IndexError),
    #[error("invalid logical size: {0}")]
    InvalidLogicalSize(String),
    #[error("invalid volume name {0:?}: {1}")]
    InvalidName(String, &'static str),
    #[error("invalid sector size {0}")]
    InvalidSectorSize(u32),
    #[error("volume {0} is in a state that forbids this operation: {1}")]
    InvalidVolumeState(u32, &'static str),
    #[error("kernel scsi bridge error: {0}")]
    KernelBridge(#[from] BridgeError),
    #[error("options may only be changed while the volume is in maintenance")]
    NotInMaintenance,
    #[error("operation not permitted on a preconfigured entity")]
    Preconfigured,
    #[error("(target {target:?}, lun {lun}) is already assigned to another volume")]
    TargetLunCollision { target: String, lun: u32 },
    #[error("target {0:?} is still referenced")]
    TargetStillReferenced(String),
    #[error("tid must be nonzero")]
    TidZero,
    #[error("volume id {0} is currently detaching")]
    VolumeDetaching(u32),
    #[error("volume {0} has {1} active session(s)")]
    VolumeHasSessions(u32, usize),
    #[error("volume {0} not found")]
    VolumeNotFound(u32),
}

pub type DedupResult<T> = Result<T, DedupError>;
