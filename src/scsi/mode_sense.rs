// Copyright 2024 The dedupv1d Authors.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! MODE SENSE(6) page encoding (§4.2).

use super::command::ModeSensePageControl;
use super::sense::Sense;

pub const PAGE_READ_WRITE_ERROR_RECOVERY: u8 = 0x01;
pub const PAGE_DISCONNECT_RECONNECT: u8 = 0x02;
pub const PAGE_CACHING: u8 = 0x08;
pub const PAGE_CONTROL: u8 = 0x0a;
pub const PAGE_INFORMATIONAL_EXCEPTIONS: u8 = 0x1c;
pub const PAGE_ALL: u8 = 0x3f;

fn page_recovery() -> Vec<u8> {
    vec![PAGE_READ_WRITE_ERROR_RECOVERY, 0x0a, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0]
}

fn page_disconnect_reconnect() -> Vec<u8> {
    vec![PAGE_DISCONNECT_RECONNECT, 0x0e, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0]
}

fn page_caching() -> Vec<u8> {
    // Write cache on (bit 2 of byte 2), read cache off (RCD bit 0 set),
    // arbitrary reorder allowed -> no restrictions in bytes we don't set.
    let mut page = vec![0u8; 20];
    page[0] = PAGE_CACHING;
    page[1] = 18;
    page[2] = 0x01 | 0x04; // RCD=1 (read cache disabled), WCE=1 (write cache enabled)
    page
}

fn page_control() -> Vec<u8> {
    let mut page = vec![0u8; 12];
    page[0] = PAGE_CONTROL;
    page[1] = 10;
    page[3] = 0x00; // unrestricted queuing (QAM/QERR left at 0)
    page
}

fn page_informational_exceptions() -> Vec<u8> {
    let mut page = vec![0u8; 12];
    page[0] = PAGE_INFORMATIONAL_EXCEPTIONS;
    page[1] = 10;
    page[2] = 0x00; // disabled (DEXCPT not set meaningfully enabled)
    page
}

fn page_bytes(page_code: u8) -> Option<Vec<u8>> {
    match page_code {
        PAGE_READ_WRITE_ERROR_RECOVERY => Some(page_recovery()),
        PAGE_DISCONNECT_RECONNECT => Some(page_disconnect_reconnect()),
        PAGE_CACHING => Some(page_caching()),
        PAGE_CONTROL => Some(page_control()),
        PAGE_INFORMATIONAL_EXCEPTIONS => Some(page_informational_exceptions()),
        PAGE_ALL => {
            let mut all = Vec::new();
            all.extend(page_recovery());
            all.extend(page_disconnect_reconnect());
            all.extend(page_caching());
            all.extend(page_control());
            all.extend(page_informational_exceptions());
            Some(all)
        }
        _ => None,
    }
}

/// 8-byte block descriptor: density code 0, 24-bit block count (clamped on
/// overflow) then 32-bit block size.
fn block_descriptor(block_count: u64, block_size: u32) -> [u8; 8] {
    let last_lba = block_count.saturating_sub(1);
    let mut buf = [0u8; 8];
    buf[0] = 0; // density code
    if last_lba > 0x00ff_ffff {
        buf[1..4].copy_from_slice(&[0xff, 0xff, 0xff]);
    } else {
        let bytes = (last_lba as u32).to_be_bytes();
        buf[1..4].copy_from_slice(&bytes[1..4]);
    }
    buf[4..8].copy_from_slice(&block_size.to_be_bytes());
    buf
}

/// Builds a MODE SENSE(6) reply, or a sense error if `pc` is "saved" (not
/// supported) or the page code is unknown. When `dbd` is set, an 8-byte
/// block descriptor is emitted before the page data.
pub fn mode_sense_6(
    pc: ModeSensePageControl,
    page_code: u8,
    dbd: bool,
    block_count: u64,
    block_size: u32,
) -> Result<Vec<u8>, Sense> {
    use super::constants::*;

    if pc == ModeSensePageControl::Saved {
        return Err(Sense::check_condition(
            ILLEGAL_REQUEST,
            ASC_SAVING_PARAMETERS_NOT_SUPPORTED,
        ));
    }
    let page = page_bytes(page_code)
        .ok_or_else(|| Sense::check_condition(ILLEGAL_REQUEST, ASC_INVALID_FIELD_IN_CDB))?;

    let mut reply = Vec::with_capacity(12 + page.len());
    reply.push(0); // mode data length, filled below
    reply.push(0); // medium type
    reply.push(0); // device-specific parameter
    if dbd {
        reply.push(8); // block descriptor length
        reply.extend(block_descriptor(block_count, block_size));
    } else {
        reply.push(0); // no block descriptor
    }
    reply.extend(page);
    reply[0] = (reply.len() - 1) as u8;
    Ok(reply)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn saved_pc_rejected() {
        let err =
            mode_sense_6(ModeSensePageControl::Saved, PAGE_CACHING, false, 2048, 512).unwrap_err();
        assert_eq!(err.asc, 0x39);
    }

    #[test]
    fn unknown_page_rejected() {
        let err =
            mode_sense_6(ModeSensePageControl::Current, 0x77, false, 2048, 512).unwrap_err();
        assert_eq!(err.asc, 0x24);
    }

    #[test]
    fn caching_page_len_prefix() {
        let reply = mode_sense_6(ModeSensePageControl::Current, PAGE_CACHING, false, 2048, 512).unwrap();
        assert_eq!(reply[0] as usize, reply.len() - 1);
    }

    #[test]
    fn all_pages_concatenates() {
        let all = mode_sense_6(ModeSensePageControl::Current, PAGE_ALL, false, 2048, 512).unwrap();
        let caching = mode_sense_6(ModeSensePageControl::Current, PAGE_CACHING, false, 2048, 512).unwrap();
        assert!(all.len() > caching.len());
    }

    #[test]
    fn dbd_emits_block_descriptor() {
        let without = mode_sense_6(ModeSensePageControl::Current, PAGE_CACHING, false, 2048, 512).unwrap();
        let with = mode_sense_6(ModeSensePageControl::Current, PAGE_CACHING, true, 2048, 512).unwrap();
        assert_eq!(with.len(), without.len() + 8);
        assert_eq!(with[3], 8);
        assert_eq!(without[3], 0);
        // density code 0, block count - 1 = 2047, block size 512.
        assert_eq!(&with[4..8], &[0x00, 0x00, 0x07, 0xff]);
        assert_eq!(&with[8..12], &512u32.to_be_bytes());
        // page data starts right after the descriptor.
        assert_eq!(with[12], PAGE_CACHING);
        assert_eq!(without[4], PAGE_CACHING);
    }
}
