// Copyright 2024 The dedupv1d Authors.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Pure CDB decoding (§4.2). No I/O: given a raw CDB (and, where the
//! opcode needs it, the transfer-buffer length reported out of band by the
//! kernel SCSI bridge), produce a tagged `Command`.
//!
//! Modeled on `devices::virtio::scsi::device::Command` (crosvm): one
//! variant per opcode family, decoding done with plain `from_be_bytes`
//! slicing exactly like that module's `is_lun0`/`has_lun` helpers do.

use remain::sorted;
use thiserror::Error;

use super::constants::*;

/// A decoded READ/WRITE/VERIFY request. `transfer_length` is the request
/// size in bytes, taken from the command buffer the kernel bridge reports
/// out of band (`alloc_len` for data-in, the write/verify payload length
/// for data-out) rather than decoded from the CDB.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ReadWriteParams {
    pub lba: u64,
    pub transfer_length: u32,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SyncCacheParams {
    pub lba: u64,
    pub length: u32,
    pub immed: bool,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ModeSensePageControl {
    Current,
    Changeable,
    Default,
    Saved,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ModeSenseParams {
    pub dbd: bool,
    pub pc: ModeSensePageControl,
    pub page_code: u8,
}

/// Tagged variant of the command the CDB decodes to (§9: "model the
/// command as a tagged variant, one variant per opcode family").
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Command {
    TestUnitReady,
    Inquiry { evpd: bool, page_code: u8 },
    ReadCapacity10,
    ReadCapacity16,
    Read(ReadWriteParams),
    Write(ReadWriteParams),
    Verify { params: ReadWriteParams, bytchk: bool },
    SyncCache(SyncCacheParams),
    ModeSense6(ModeSenseParams),
}

#[sorted]
#[derive(Error, Debug, Copy, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("cdb too short for opcode {opcode:#04x}: need {need} bytes, have {have}")]
    CdbTooShort { opcode: u8, need: usize, have: usize },
    #[error("unsupported scsi opcode {0:#04x}")]
    Unsupported(u8),
}

fn be21(cdb: &[u8]) -> u32 {
    // READ(6)/WRITE(6): 21-bit LBA, high 5 bits of cdb[1].
    ((cdb[1] as u32 & 0x1f) << 16) | ((cdb[2] as u32) << 8) | (cdb[3] as u32)
}

fn be32(b: &[u8]) -> u32 {
    u32::from_be_bytes([b[0], b[1], b[2], b[3]])
}

fn be64(b: &[u8]) -> u64 {
    u64::from_be_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]])
}

fn be16(b: &[u8]) -> u16 {
    u16::from_be_bytes([b[0], b[1]])
}

impl Command {
    /// Decodes `cdb` (at least 6 bytes; family-dependent beyond that).
    /// `transfer_length` is the length implied by the command buffer; none
    /// of the READ/WRITE/VERIFY families (6/10/16-byte) carry their own
    /// length field in the CDB, so all three take it from here instead.
    /// Only SYNC_CACHE(10)/SYNC_CACHE(16) decode a length field from the CDB.
    pub fn decode(cdb: &[u8], transfer_length: u32) -> Result<Command, DecodeError> {
        if cdb.is_empty() {
            return Err(DecodeError::CdbTooShort {
                opcode: 0,
                need: 1,
                have: 0,
            });
        }
        let opcode = cdb[0];
        let need = |n: usize| -> Result<(), DecodeError> {
            if cdb.len() < n {
                Err(DecodeError::CdbTooShort {
                    opcode,
                    need: n,
                    have: cdb.len(),
                })
            } else {
                Ok(())
            }
        };
        match opcode {
            TEST_UNIT_READY => Ok(Command::TestUnitReady),
            INQUIRY => {
                need(5)?;
                Ok(Command::Inquiry {
                    evpd: cdb[1] & 0x01 != 0,
                    page_code: cdb[2],
                })
            }
            READ_CAPACITY_10 => {
                need(10)?;
                Ok(Command::ReadCapacity10)
            }
            SERVICE_ACTION_IN_16 => {
                need(16)?;
                if cdb[1] & 0x1f == READ_CAPACITY_16_SERVICE_ACTION {
                    Ok(Command::ReadCapacity16)
                } else {
                    Err(DecodeError::Unsupported(opcode))
                }
            }
            READ_6 => {
                need(6)?;
                Ok(Command::Read(ReadWriteParams {
                    lba: be21(cdb) as u64,
                    transfer_length,
                }))
            }
            WRITE_6 => {
                need(6)?;
                Ok(Command::Write(ReadWriteParams {
                    lba: be21(cdb) as u64,
                    transfer_length,
                }))
            }
            READ_10 => {
                need(10)?;
                Ok(Command::Read(ReadWriteParams {
                    lba: be32(&cdb[2..6]) as u64,
                    transfer_length,
                }))
            }
            WRITE_10 => {
                need(10)?;
                Ok(Command::Write(ReadWriteParams {
                    lba: be32(&cdb[2..6]) as u64,
                    transfer_length,
                }))
            }
            VERIFY_10 => {
                need(10)?;
                Ok(Command::Verify {
                    params: ReadWriteParams {
                        lba: be32(&cdb[2..6]) as u64,
                        transfer_length,
                    },
                    bytchk: cdb[1] & 0x02 != 0,
                })
            }
            READ_16 => {
                need(16)?;
                Ok(Command::Read(ReadWriteParams {
                    lba: be64(&cdb[2..10]),
                    transfer_length,
                }))
            }
            WRITE_16 => {
                need(16)?;
                Ok(Command::Write(ReadWriteParams {
                    lba: be64(&cdb[2..10]),
                    transfer_length,
                }))
            }
            VERIFY_16 => {
                need(16)?;
                Ok(Command::Verify {
                    params: ReadWriteParams {
                        lba: be64(&cdb[2..10]),
                        transfer_length,
                    },
                    bytchk: cdb[1] & 0x02 != 0,
                })
            }
            SYNC_CACHE_10 => {
                need(10)?;
                Ok(Command::SyncCache(SyncCacheParams {
                    lba: be32(&cdb[2..6]) as u64,
                    length: be16(&cdb[7..9]) as u32,
                    immed: cdb[1] & 0x02 != 0,
                }))
            }
            SYNC_CACHE_16 => {
                need(16)?;
                Ok(Command::SyncCache(SyncCacheParams {
                    lba: be64(&cdb[2..10]),
                    length: be32(&cdb[10..14]),
                    immed: cdb[1] & 0x02 != 0,
                }))
            }
            MODE_SENSE_6 => {
                need(6)?;
                let pc = match (cdb[2] & 0xc0) >> 6 {
                    0 => ModeSensePageControl::Current,
                    1 => ModeSensePageControl::Changeable,
                    2 => ModeSensePageControl::Default,
                    _ => ModeSensePageControl::Saved,
                };
                Ok(Command::ModeSense6(ModeSenseParams {
                    dbd: cdb[1] & 0x08 != 0,
                    pc,
                    page_code: cdb[2] & 0x3f,
                }))
            }
            _ => Err(DecodeError::Unsupported(opcode)),
        }
    }

    pub fn offset(&self, sector_size: u32) -> Option<u64> {
        match self {
            Command::Read(p) | Command::Write(p) => Some(p.lba << sector_size.trailing_zeros()),
            Command::Verify { params, .. } => Some(params.lba << sector_size.trailing_zeros()),
            Command::SyncCache(p) => Some(p.lba << sector_size.trailing_zeros()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_read10() {
        let mut cdb = [0u8; 10];
        cdb[0] = READ_10;
        cdb[2..6].copy_from_slice(&100u32.to_be_bytes());
        // Length is not decoded from the CDB for READ(10); it comes from
        // the command buffer length passed in, same as READ(6).
        let cmd = Command::decode(&cdb, 4096).unwrap();
        assert_eq!(
            cmd,
            Command::Read(ReadWriteParams {
                lba: 100,
                transfer_length: 4096
            })
        );
    }

    #[test]
    fn decode_read16_offset() {
        let mut cdb = [0u8; 16];
        cdb[0] = READ_16;
        cdb[2..10].copy_from_slice(&1u64.to_be_bytes());
        cdb[10..14].copy_from_slice(&1u32.to_be_bytes());
        let cmd = Command::decode(&cdb, 0).unwrap();
        assert_eq!(cmd.offset(512), Some(512));
    }

    #[test]
    fn decode_read6_uses_low5_bits() {
        let mut cdb = [0u8; 6];
        cdb[0] = READ_6;
        cdb[1] = 0b000_00011; // high 5 bits of LBA = 3
        cdb[2] = 0xff;
        cdb[3] = 0xff;
        let cmd = Command::decode(&cdb, 4096).unwrap();
        let expected_lba = (3u32 << 16) | 0xffff;
        assert_eq!(
            cmd,
            Command::Read(ReadWriteParams {
                lba: expected_lba as u64,
                transfer_length: 4096
            })
        );
    }

    #[test]
    fn unsupported_opcode() {
        let cdb = [0xffu8; 6];
        assert_eq!(
            Command::decode(&cdb, 0),
            Err(DecodeError::Unsupported(0xff))
        );
    }

    #[test]
    fn sync_cache_immed() {
        let mut cdb = [0u8; 10];
        cdb[0] = SYNC_CACHE_10;
        cdb[1] = 0x02;
        let cmd = Command::decode(&cdb, 0).unwrap();
        match cmd {
            Command::SyncCache(p) => assert!(p.immed),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn mode_sense_saved_pc() {
        let mut cdb = [0u8; 6];
        cdb[0] = MODE_SENSE_6;
        cdb[2] = 0xc0 | 0x08; // pc=3 (saved), page 8
        let cmd = Command::decode(&cdb, 0).unwrap();
        match cmd {
            Command::ModeSense6(p) => {
                assert_eq!(p.pc, ModeSensePageControl::Saved);
                assert_eq!(p.page_code, 0x08);
            }
            _ => panic!("wrong variant"),
        }
    }
}
