// Copyright 2024 The dedupv1d Authors.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! READ CAPACITY(10/16) encoding (§4.2).

/// 8-byte READ CAPACITY(10) reply: `(block_count - 1)` clamped to
/// `0xFFFFFFFF` on overflow, then 32-bit block size.
pub fn read_capacity_10(block_count: u64, block_size: u32) -> [u8; 8] {
    let last_lba = block_count.saturating_sub(1);
    let clamped = if last_lba > u32::MAX as u64 {
        u32::MAX
    } else {
        last_lba as u32
    };
    let mut buf = [0u8; 8];
    buf[0..4].copy_from_slice(&clamped.to_be_bytes());
    buf[4..8].copy_from_slice(&block_size.to_be_bytes());
    buf
}

/// 32-byte READ CAPACITY(16) reply: full 64-bit `(block_count - 1)`, 32-bit
/// block size, remaining bytes reserved/zero.
pub fn read_capacity_16(block_count: u64, block_size: u32) -> [u8; 32] {
    let last_lba = block_count.saturating_sub(1);
    let mut buf = [0u8; 32];
    buf[0..8].copy_from_slice(&last_lba.to_be_bytes());
    buf[8..12].copy_from_slice(&block_size.to_be_bytes());
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_10_clamps_on_overflow() {
        // 4 TiB / 512 byte sectors overflows a 32-bit last-LBA.
        let block_count = (4u64 * 1024 * 1024 * 1024 * 1024) / 512;
        let buf = read_capacity_10(block_count, 512);
        assert_eq!(&buf[0..4], &[0xff, 0xff, 0xff, 0xff]);
    }

    #[test]
    fn capacity_16_full_width() {
        let block_count = (4u64 * 1024 * 1024 * 1024 * 1024) / 512;
        let buf = read_capacity_16(block_count, 512);
        let last_lba = u64::from_be_bytes(buf[0..8].try_into().unwrap());
        assert_eq!(last_lba, block_count - 1);
    }

    #[test]
    fn small_volume_roundtrip() {
        let block_count = 2_097_152u64; // 1 GiB / 512
        let buf10 = read_capacity_10(block_count, 512);
        let lba10 = u32::from_be_bytes(buf10[0..4].try_into().unwrap());
        assert_eq!(lba10 as u64, block_count - 1);
    }
}
