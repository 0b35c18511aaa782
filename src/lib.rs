// Copyright 2024 The dedupv1d Authors.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! A userspace iSCSI/SCSI target daemon providing deduplicated block
//! volumes on top of an out-of-scope dedup engine (§1). This crate models
//! the admin-path entities (volumes, groups, targets, users), the
//! background subsystems that keep them consistent (scheduler, detacher,
//! fast-copy), and the SCSI command path that drives them; the
//! fingerprinting/chunking/container-storage core and the concrete kernel
//! bridge wire format are observed through traits, not implemented here
//! (§1 Non-goals).

pub mod backends;
pub mod command_handler;
pub mod config;
pub mod dedup_engine;
pub mod detacher;
pub mod error;
pub mod error_report;
pub mod fastcopy;
pub mod group_info;
pub mod kernel_bridge;
pub mod persistence;
pub mod scheduler;
pub mod scsi;
pub mod stats;
pub mod target_info;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod user_info;
pub mod volume;
pub mod volume_info;
