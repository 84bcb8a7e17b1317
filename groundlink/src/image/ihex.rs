//! Intel HEX parser.
//!
//! ```text
//! :LL AAAA TT DD.. CC
//!  |   |    |  |   +- two's complement of the byte sum
//!  |   |    |  +----- LL data bytes
//!  |   |    +-------- record type 00..05
//!  |   +------------- 16-bit offset
//!  +----------------- data length
//! ```

use log::trace;

use crate::error::{Error, Result};
use crate::image::Segment;

/// Data record.
pub const RECORD_DATA: u8 = 0x00;
/// End of file.
pub const RECORD_EOF: u8 = 0x01;
/// Extended segment address (base = value << 4).
pub const RECORD_EXTENDED_SEGMENT: u8 = 0x02;
/// Start segment address (CS:IP).
pub const RECORD_START_SEGMENT: u8 = 0x03;
/// Extended linear address (base = value << 16).
pub const RECORD_EXTENDED_LINEAR: u8 = 0x04;
/// Start linear address (EIP).
pub const RECORD_START_LINEAR: u8 = 0x05;

/// Result of parsing a HEX file.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HexImage {
    /// Contiguous runs, in file order.
    pub segments: Vec<Segment>,
    /// Start address from a type 03 or 05 record.
    pub entry_point: Option<u32>,
}

/// Parse Intel HEX text. The EOF record is required; anything after it is
/// ignored.
pub fn parse(text: &str) -> Result<HexImage> {
    let mut image = HexImage::default();
    let mut current: Option<Segment> = None;
    let mut base: u32 = 0;
    let mut saw_eof = false;

    for (index, raw) in text.lines().enumerate() {
        let line_no = index + 1;
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }
        let bad = |msg: &str| Error::InvalidImage(format!("HEX line {line_no}: {msg}"));

        let body = line.strip_prefix(':').ok_or_else(|| bad("missing ':'"))?;
        let bytes = hex::decode(body).map_err(|_| bad("invalid hex digits"))?;
        if bytes.len() < 5 {
            return Err(bad("record too short"));
        }
        let len = usize::from(bytes[0]);
        if bytes.len() != len + 5 {
            return Err(bad("length byte does not match record"));
        }
        if bytes.iter().fold(0u8, |acc, &b| acc.wrapping_add(b)) != 0 {
            return Err(bad("checksum mismatch"));
        }

        let offset = u16::from_be_bytes([bytes[1], bytes[2]]);
        let kind = bytes[3];
        let data = &bytes[4..4 + len];

        match kind {
            RECORD_DATA => {
                let address = base.wrapping_add(u32::from(offset));
                trace!("HEX data {address:#010x} +{len}");
                if let Some(seg) = current.as_mut().filter(|s| s.end() == u64::from(address)) {
                    seg.data.extend_from_slice(data);
                } else if let Some(done) = current.replace(Segment::new(address, data.to_vec())) {
                    image.segments.push(done);
                }
            },
            RECORD_EOF => {
                saw_eof = true;
                break;
            },
            RECORD_EXTENDED_SEGMENT => {
                let [hi, lo] = two_bytes(data).ok_or_else(|| bad("type 02 needs 2 data bytes"))?;
                base = u32::from(u16::from_be_bytes([hi, lo])) << 4;
            },
            RECORD_START_SEGMENT => {
                if data.len() != 4 {
                    return Err(bad("type 03 needs 4 data bytes"));
                }
                let cs = u32::from(u16::from_be_bytes([data[0], data[1]]));
                let ip = u32::from(u16::from_be_bytes([data[2], data[3]]));
                image.entry_point = Some((cs << 4) + ip);
            },
            RECORD_EXTENDED_LINEAR => {
                let [hi, lo] = two_bytes(data).ok_or_else(|| bad("type 04 needs 2 data bytes"))?;
                base = u32::from(u16::from_be_bytes([hi, lo])) << 16;
            },
            RECORD_START_LINEAR => {
                if data.len() != 4 {
                    return Err(bad("type 05 needs 4 data bytes"));
                }
                image.entry_point = Some(u32::from_be_bytes([data[0], data[1], data[2], data[3]]));
            },
            other => return Err(bad(&format!("unknown record type {other:02X}"))),
        }
    }

    if !saw_eof {
        return Err(Error::InvalidImage("HEX file has no end-of-file record".into()));
    }
    if let Some(done) = current {
        image.segments.push(done);
    }
    Ok(image)
}

fn two_bytes(data: &[u8]) -> Option<[u8; 2]> {
    data.try_into().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_linear_records() {
        let text = "\
:020000040800F2
:10000000000002201D0100081F0100082101000856
:04001000AABBCCDDDE
:0400000508000101ED
:00000001FF
";
        let image = parse(text).unwrap();
        assert_eq!(image.segments.len(), 1);
        let seg = &image.segments[0];
        assert_eq!(seg.address, 0x0800_0000);
        assert_eq!(seg.data.len(), 20);
        assert_eq!(&seg.data[16..], &[0xAA, 0xBB, 0xCC, 0xDD]);
        assert_eq!(image.entry_point, Some(0x0800_0101));
    }

    #[test]
    fn test_gap_splits_segments() {
        let text = "\
:020000001122CB
:02010000334486
:00000001FF
";
        let image = parse(text).unwrap();
        assert_eq!(image.segments.len(), 2);
        assert_eq!(image.segments[1].address, 0x0100);
        assert_eq!(image.segments[1].data, vec![0x33, 0x44]);
    }

    #[test]
    fn test_extended_segment_and_start_segment() {
        let text = "\
:020000021000EC
:0100000042BD
:0400000310000010D9
:00000001FF
";
        let image = parse(text).unwrap();
        assert_eq!(image.segments[0].address, 0x1_0000);
        assert_eq!(image.entry_point, Some(0x1_0010));
    }

    #[test]
    fn test_rejects_bad_checksum() {
        let err = parse(":0100000042BE\n:00000001FF\n").unwrap_err();
        assert!(err.to_string().contains("line 1"));
        assert!(err.to_string().contains("checksum"));
    }

    #[test]
    fn test_rejects_malformed_lines() {
        assert!(parse("0100000042BD\n:00000001FF\n").is_err());
        assert!(parse(":01000000ZZBD\n:00000001FF\n").is_err());
        assert!(parse(":0200000042BC\n:00000001FF\n").is_err());
        assert!(parse(":00000006FA\n:00000001FF\n").is_err());
        assert!(parse(":0100000042BD\n").is_err());
    }

    #[test]
    fn test_data_after_eof_is_ignored() {
        let image = parse(":0100000042BD\n:00000001FF\ngarbage\n").unwrap();
        assert_eq!(image.segments[0].data, vec![0x42]);
    }
}
