// Copyright 2024 The dedupv1d Authors.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Values specified in the SCSI standards (§4.2).
//! SPC-3: <https://www.t10.org/cgi-bin/ac.pl?t=f&f=spc3r23.pdf>
//! SBC-2: <https://www.t10.org/cgi-bin/ac.pl?t=f&f=sbc2r16.pdf>

// Opcodes.
pub const TEST_UNIT_READY: u8 = 0x00;
pub const INQUIRY: u8 = 0x12;
pub const MODE_SENSE_6: u8 = 0x1a;
pub const READ_CAPACITY_10: u8 = 0x25;
pub const READ_6: u8 = 0x08;
pub const READ_10: u8 = 0x28;
pub const WRITE_6: u8 = 0x0a;
pub const WRITE_10: u8 = 0x2a;
pub const VERIFY_10: u8 = 0x2f;
pub const SYNC_CACHE_10: u8 = 0x35;
pub const READ_16: u8 = 0x88;
pub const WRITE_16: u8 = 0x8a;
pub const VERIFY_16: u8 = 0x8f;
pub const SYNC_CACHE_16: u8 = 0x91;
pub const SERVICE_ACTION_IN_16: u8 = 0x9e;
pub const READ_CAPACITY_16_SERVICE_ACTION: u8 = 0x10;

// SAM status codes.
pub const GOOD: u8 = 0x00;
pub const CHECK_CONDITION: u8 = 0x02;

// Sense keys.
pub const NO_SENSE: u8 = 0x00;
pub const RECOVERED_ERROR: u8 = 0x01;
pub const NOT_READY: u8 = 0x02;
pub const MEDIUM_ERROR: u8 = 0x03;
pub const ILLEGAL_REQUEST: u8 = 0x05;
pub const UNIT_ATTENTION: u8 = 0x06;
pub const MISCOMPARE: u8 = 0x0e;
pub const VENDOR_SPECIFIC: u8 = 0x09;

// Additional sense code / qualifier pairs named by §4.2/§7.
pub const ASC_INVALID_COMMAND_OPERATION_CODE: (u8, u8) = (0x20, 0x00);
pub const ASC_INVALID_FIELD_IN_CDB: (u8, u8) = (0x24, 0x00);
pub const ASC_SAVING_PARAMETERS_NOT_SUPPORTED: (u8, u8) = (0x39, 0x00);
pub const ASC_LOGICAL_UNIT_NOT_READY_MANUAL_INTERVENTION: (u8, u8) = (0x04, 0x03);
pub const ASC_OPERATING_CONDITIONS_CHANGED: (u8, u8) = (0x3f, 0x0e);
pub const ASC_MISCOMPARE_DURING_VERIFY: (u8, u8) = (0x1d, 0x00);
pub const ASC_LOGICAL_BLOCK_ADDRESS_OUT_OF_RANGE: (u8, u8) = (0x21, 0x00);
pub const ASC_VENDOR_SPECIFIC_MEMALLOC_FAILURE: (u8, u8) = (0x80, 0x00);

/// Sector sizes a volume may be created with (§3).
pub const VALID_SECTOR_SIZES: [u32; 4] = [512, 1024, 2048, 4096];

/// Default `sector_size` for a newly created volume (§3).
pub const DEFAULT_SECTOR_SIZE: u32 = 512;

/// Default `command_thread_count` for a newly created volume (§3).
pub const DEFAULT_COMMAND_THREAD_COUNT: u32 = 16;

/// Default bounded size of the per-volume error report ring (§3).
pub const DEFAULT_ERROR_REPORT_RING_SIZE: usize = 5;

/// Window (in samples) over which the command handler's rolling response
/// time averages are computed (§4.3).
pub const RESPONSE_TIME_WINDOW: usize = 256;

/// Window over which read/write throughput is averaged (§4.3).
pub const THROUGHPUT_WINDOW_SECONDS: u64 = 5;

/// Step size of one fast-copy iteration (§4.7).
pub const FAST_COPY_STEP_BYTES: u64 = 64 * 1024 * 1024;

/// Batch size / inter-delete sleep used by the detacher when the system is
/// idle vs. busy (§4.6).
pub const DETACHER_IDLE_BATCH_SIZE: u64 = 256;
pub const DETACHER_IDLE_SLEEP_MS: u64 = 20;
pub const DETACHER_BUSY_BATCH_SIZE: u64 = 4;
pub const DETACHER_BUSY_SLEEP_MS: u64 = 1000;

/// Timeout the kernel SCSI bridge's blocking command-acquisition call is
/// polled with, to guarantee timely shutdown (§5).
pub const BRIDGE_POLL_TIMEOUT_MS: u64 = 2000;
