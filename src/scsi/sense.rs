// Copyright 2024 The dedupv1d Authors.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! SCSI sense data: the fixed-format 18-byte variant named by §6.

use super::constants::*;

/// `{status, sense key, ASC, ASCQ}` (GLOSSARY).
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Sense {
    pub status: u8,
    pub key: u8,
    pub asc: u8,
    pub ascq: u8,
}

impl Sense {
    pub const fn good() -> Self {
        Sense {
            status: GOOD,
            key: NO_SENSE,
            asc: 0,
            ascq: 0,
        }
    }

    pub const fn check_condition(key: u8, asc_ascq: (u8, u8)) -> Self {
        Sense {
            status: CHECK_CONDITION,
            key,
            asc: asc_ascq.0,
            ascq: asc_ascq.1,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == GOOD
    }

    /// §4.3 step 5: "on result with sense key other than ILLEGAL_REQUEST
    /// increment per-opcode error; on RECOVERED increment retry counter".
    pub fn is_recovered(&self) -> bool {
        self.key == RECOVERED_ERROR
    }

    pub fn counts_as_error(&self) -> bool {
        !self.is_ok() && self.key != ILLEGAL_REQUEST
    }

    /// Fixed-format (18 byte) sense data, per SPC-3 table 28.
    pub fn to_fixed_bytes(&self) -> [u8; 18] {
        let mut buf = [0u8; 18];
        buf[0] = 0x70; // current error, fixed format
        buf[2] = self.key;
        buf[7] = 10; // additional sense length
        buf[12] = self.asc;
        buf[13] = self.ascq;
        buf
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum TaskManagementResult {
    #[default]
    Success,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn good_sense_is_ok() {
        assert!(Sense::good().is_ok());
    }

    #[test]
    fn check_condition_not_ok() {
        let s = Sense::check_condition(ILLEGAL_REQUEST, ASC_INVALID_FIELD_IN_CDB);
        assert!(!s.is_ok());
        assert!(!s.counts_as_error());
    }

    #[test]
    fn medium_error_counts() {
        let s = Sense::check_condition(MEDIUM_ERROR, (0x11, 0x00));
        assert!(s.counts_as_error());
    }

    #[test]
    fn fixed_bytes_layout() {
        let s = Sense::check_condition(NOT_READY, ASC_LOGICAL_UNIT_NOT_READY_MANUAL_INTERVENTION);
        let bytes = s.to_fixed_bytes();
        assert_eq!(bytes[0], 0x70);
        assert_eq!(bytes[2], NOT_READY);
        assert_eq!(bytes[12], 0x04);
        assert_eq!(bytes[13], 0x03);
    }
}
