//! Checksums used on the wire.
//!
//! - CRC-16/MCRF4XX ("X.25" in MAVLink terms), seeded with `0xFFFF`
//! - CRC-8/DVB-S2 for MSP v2
//! - XOR checksum for MSP v1
//! - CRC-32 as used by the DfuSe file suffix

/// Seed for the MAVLink X.25 accumulator.
pub const X25_INIT: u16 = 0xFFFF;

/// Incremental X.25 CRC accumulator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct X25Crc(u16);

impl Default for X25Crc {
    fn default() -> Self {
        Self::new()
    }
}

impl X25Crc {
    /// Start a fresh accumulator.
    pub const fn new() -> Self {
        Self(X25_INIT)
    }

    /// Fold one byte into the running CRC.
    #[allow(clippy::cast_possible_truncation)]
    pub fn accumulate(&mut self, byte: u8) {
        let mut tmp = byte ^ (self.0 & 0xFF) as u8;
        tmp ^= tmp << 4;
        let tmp = u16::from(tmp);
        self.0 = (self.0 >> 8) ^ (tmp << 8) ^ (tmp << 3) ^ (tmp >> 4);
    }

    /// Fold a byte slice into the running CRC.
    pub fn accumulate_slice(&mut self, data: &[u8]) {
        for &b in data {
            self.accumulate(b);
        }
    }

    /// Fold the UTF-8 bytes of a string into the running CRC.
    pub fn accumulate_str(&mut self, s: &str) {
        self.accumulate_slice(s.as_bytes());
    }

    /// Current CRC value.
    pub const fn value(self) -> u16 {
        self.0
    }
}

/// X.25 CRC over `bytes[1..length]`.
///
/// Byte 0 is the frame start marker and never takes part in the CRC.
/// `length` is clamped to the slice length.
pub fn crc16_x25(bytes: &[u8], length: usize) -> u16 {
    let end = length.min(bytes.len());
    let mut crc = X25Crc::new();
    if end > 1 {
        crc.accumulate_slice(&bytes[1..end]);
    }
    crc.value()
}

/// X.25 CRC over `bytes[1..length]` followed by the message's `crc_extra`.
///
/// This is the value carried little-endian in the frame's CRC field.
pub fn crc_with_extra(bytes: &[u8], length: usize, crc_extra: u8) -> u16 {
    let end = length.min(bytes.len());
    let mut crc = X25Crc::new();
    if end > 1 {
        crc.accumulate_slice(&bytes[1..end]);
    }
    crc.accumulate(crc_extra);
    crc.value()
}

/// Fold one byte into a CRC-8/DVB-S2 value (polynomial 0xD5).
pub fn crc8_dvb_s2_update(crc: u8, byte: u8) -> u8 {
    let mut c = crc ^ byte;
    for _ in 0..8 {
        c = if c & 0x80 != 0 { (c << 1) ^ 0xD5 } else { c << 1 };
    }
    c
}

/// CRC-8/DVB-S2 over a slice, seeded with zero.
pub fn crc8_dvb_s2(data: &[u8]) -> u8 {
    data.iter()
        .fold(0, |crc, &b| crc8_dvb_s2_update(crc, b))
}

/// MSP v1 checksum: XOR of every byte.
pub fn msp_v1_checksum(data: &[u8]) -> u8 {
    data.iter().fold(0, |acc, &b| acc ^ b)
}

/// Standard CRC-32 (IEEE, reflected, final XOR).
pub fn crc32(data: &[u8]) -> u32 {
    !dfu_crc32(data)
}

/// CRC-32 as stored in a DfuSe suffix: reflected IEEE polynomial, seeded
/// with `0xFFFFFFFF`, without the final inversion.
pub fn dfu_crc32(data: &[u8]) -> u32 {
    let mut crc = 0xFFFF_FFFFu32;
    for &b in data {
        crc ^= u32::from(b);
        for _ in 0..8 {
            crc = if crc & 1 != 0 {
                (crc >> 1) ^ 0xEDB8_8320
            } else {
                crc >> 1
            };
        }
    }
    crc
}

#[cfg(test)]
mod tests {
    use super::*;

    const CHECK: &[u8] = b"123456789";

    #[test]
    fn test_x25_check_value() {
        let mut crc = X25Crc::new();
        crc.accumulate_slice(CHECK);
        assert_eq!(crc.value(), 0x6F91);
    }

    #[test]
    fn test_crc16_x25_skips_start_marker() {
        let mut framed = vec![0xFD];
        framed.extend_from_slice(CHECK);
        assert_eq!(crc16_x25(&framed, framed.len()), 0x6F91);

        // A different start marker must not change the result.
        framed[0] = 0xFE;
        assert_eq!(crc16_x25(&framed, framed.len()), 0x6F91);
    }

    #[test]
    fn test_crc16_x25_clamps_length() {
        assert_eq!(crc16_x25(&[0xFD], 10), X25_INIT);
        assert_eq!(crc16_x25(&[], 0), X25_INIT);
    }

    #[test]
    fn test_crc_with_extra_equals_manual_fold() {
        let framed = [0xFD, 0x01, 0x02, 0x03];
        let mut crc = X25Crc::new();
        crc.accumulate_slice(&framed[1..]);
        crc.accumulate(50);
        assert_eq!(crc_with_extra(&framed, framed.len(), 50), crc.value());
    }

    #[test]
    fn test_crc8_dvb_s2_check_value() {
        assert_eq!(crc8_dvb_s2(CHECK), 0xBC);
        assert_eq!(crc8_dvb_s2(&[]), 0);
    }

    #[test]
    fn test_msp_v1_checksum() {
        assert_eq!(msp_v1_checksum(&[0x00, 108]), 108);
        assert_eq!(msp_v1_checksum(&[0xFF, 0xFF]), 0);
    }

    #[test]
    fn test_crc32_check_value() {
        assert_eq!(crc32(CHECK), 0xCBF4_3926);
        assert_eq!(dfu_crc32(CHECK), !0xCBF4_3926);
    }
}
