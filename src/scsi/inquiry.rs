// Copyright 2024 The dedupv1d Authors.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! INQUIRY standard page and VPD page encoding (§4.2).

/// Peripheral qualifier byte 0 when the volume answers normally.
const PQ_CONNECTED: u8 = 0x00;
/// Peripheral qualifier reported while the volume is in maintenance: "not
/// connected" (qualifier 3) in the high 3 bits, device type 0 (disk).
const PQ_NOT_CONNECTED: u8 = 0x60;

const VENDOR: &[u8; 8] = b"DEDUPV1 ";
const PRODUCT: &[u8; 16] = b"DEDUPV1         ";
const REVISION: &[u8; 4] = b" 001";

/// 66-byte standard INQUIRY reply (EVPD=0, CMDDT=0, page=0).
pub fn standard_inquiry(maintenance: bool) -> [u8; 66] {
    let mut buf = [0u8; 66];
    buf[0] = if maintenance {
        PQ_NOT_CONNECTED
    } else {
        PQ_CONNECTED
    };
    buf[2] = 0x02 | 0x10; // response data format 2, HiSup
    buf[3] = 0x02;
    buf[4] = 64 - 1; // additional length
    buf[8..16].copy_from_slice(VENDOR);
    buf[16..32].copy_from_slice(PRODUCT);
    buf[32..36].copy_from_slice(REVISION);
    // Version descriptors: SAM-3, SBC-2, SPC-2, iSCSI (arbitrary stable
    // placeholder values; initiators only use these for compatibility
    // heuristics).
    let descriptors: [u16; 4] = [0x0076, 0x0320, 0x0300, 0x0960];
    for (i, d) in descriptors.iter().enumerate() {
        let off = 58 + i * 2;
        buf[off..off + 2].copy_from_slice(&d.to_be_bytes());
    }
    buf
}

/// VPD page 0x00: list of supported VPD pages.
pub fn vpd_supported_pages() -> Vec<u8> {
    let pages = [0x00u8, 0x80, 0x83];
    let mut buf = vec![0u8; 4 + pages.len()];
    buf[1] = 0x00;
    buf[3] = pages.len() as u8;
    buf[4..].copy_from_slice(&pages);
    buf
}

/// VPD page 0x80: unit serial number, hex of `unique_serial_number`.
pub fn vpd_unit_serial_number(unique_serial_number: u64) -> Vec<u8> {
    let serial = format!("{:016X}", unique_serial_number);
    let mut buf = vec![0u8; 4 + serial.len()];
    buf[1] = 0x80;
    buf[3] = serial.len() as u8;
    buf[4..].copy_from_slice(serial.as_bytes());
    buf
}

/// VPD page 0x83: device identification, ASCII device name plus a
/// "CHRISTMA" vendor id, per §4.2.
pub fn vpd_device_identification(device_name: &str) -> Vec<u8> {
    let vendor_id = b"CHRISTMA";
    let name_bytes = device_name.as_bytes();
    let desc_len = 4 + vendor_id.len() + name_bytes.len();
    let mut buf = vec![0u8; 4 + desc_len];
    buf[1] = 0x83;
    buf[2..4].copy_from_slice(&(desc_len as u16).to_be_bytes());
    buf[4] = 0x02; // code set: ASCII
    buf[5] = 0x01; // association: logical unit, identifier type: T10 vendor id
    buf[6] = 0x00;
    buf[7] = (vendor_id.len() + name_bytes.len()) as u8;
    let mut off = 8;
    buf[off..off + vendor_id.len()].copy_from_slice(vendor_id);
    off += vendor_id.len();
    buf[off..off + name_bytes.len()].copy_from_slice(name_bytes);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maintenance_sets_not_connected_qualifier() {
        let buf = standard_inquiry(true);
        assert_eq!(buf[0] & 0xe0, 0x60);
    }

    #[test]
    fn normal_sets_connected_qualifier() {
        let buf = standard_inquiry(false);
        assert_eq!(buf[0], 0x00);
    }

    #[test]
    fn vendor_and_product_fields() {
        let buf = standard_inquiry(false);
        assert_eq!(&buf[8..16], VENDOR);
        assert_eq!(&buf[16..32], PRODUCT);
    }

    #[test]
    fn serial_number_is_hex() {
        let buf = vpd_unit_serial_number(0xdead_beef);
        assert_eq!(&buf[4..20], b"000000000DEADBEEF");
    }

    #[test]
    fn device_identification_contains_name() {
        let buf = vpd_device_identification("dedupv1-3");
        assert!(buf.windows(b"CHRISTMA".len()).any(|w| w == b"CHRISTMA"));
        assert!(buf
            .windows(b"dedupv1-3".len())
            .any(|w| w == b"dedupv1-3"));
    }
}
