//! MultiWii Serial Protocol (MSP) v1/v2 codec.
//!
//! ## Frame Format
//!
//! ```text
//! v1:
//! +-----+-----+-----+-----+-----+-----------+----------+
//! | '$' | 'M' | DIR | LEN | CMD |  PAYLOAD  | CHECKSUM |
//! +-----+-----+-----+-----+-----+-----------+----------+
//! |  1  |  1  |  1  |  1  |  1  |    LEN    |  1 XOR   |
//! +-----+-----+-----+-----+-----+-----------+----------+
//!
//! v2:
//! +-----+-----+-----+------+-------+-------+-----------+-------+
//! | '$' | 'X' | DIR | FLAG |  CMD  |  LEN  |  PAYLOAD  | CRC8  |
//! +-----+-----+-----+------+-------+-------+-----------+-------+
//! |  1  |  1  |  1  |  1   |  2 LE |  2 LE |    LEN    |   1   |
//! +-----+-----+-----+------+-------+-------+-----------+-------+
//! ```
//!
//! DIR is `<` toward the flight controller, `>` for replies and `!` for
//! error replies. The v1 checksum covers LEN, CMD and PAYLOAD; the v2 CRC-8
//! (DVB-S2) covers FLAG through PAYLOAD.

use byteorder::{LittleEndian, WriteBytesExt};
use log::{debug, trace};

use crate::error::{Error, Result};
use crate::protocol::crc::{crc8_dvb_s2, msp_v1_checksum};

/// Frame preamble.
pub const PREAMBLE: u8 = b'$';

/// v1 version byte.
pub const MARKER_V1: u8 = b'M';

/// v2 version byte.
pub const MARKER_V2: u8 = b'X';

/// Largest v1 payload.
pub const MAX_PAYLOAD_V1: usize = 255;

/// Largest v2 payload.
pub const MAX_PAYLOAD_V2: usize = 65_535;

/// Command identifiers.
pub mod commands {
    /// `MSP_API_VERSION`
    pub const MSP_API_VERSION: u16 = 1;
    /// `MSP_FC_VARIANT`
    pub const MSP_FC_VARIANT: u16 = 2;
    /// `MSP_FC_VERSION`
    pub const MSP_FC_VERSION: u16 = 3;
    /// `MSP_BOARD_INFO`
    pub const MSP_BOARD_INFO: u16 = 4;
    /// `MSP_BUILD_INFO`
    pub const MSP_BUILD_INFO: u16 = 5;
    /// `MSP_NAME`
    pub const MSP_NAME: u16 = 10;
    /// `MSP_REBOOT`
    pub const MSP_REBOOT: u16 = 68;
    /// `MSP_STATUS`
    pub const MSP_STATUS: u16 = 101;
    /// `MSP_RAW_IMU`
    pub const MSP_RAW_IMU: u16 = 102;
    /// `MSP_SERVO`
    pub const MSP_SERVO: u16 = 103;
    /// `MSP_MOTOR`
    pub const MSP_MOTOR: u16 = 104;
    /// `MSP_RC`
    pub const MSP_RC: u16 = 105;
    /// `MSP_RAW_GPS`
    pub const MSP_RAW_GPS: u16 = 106;
    /// `MSP_COMP_GPS`
    pub const MSP_COMP_GPS: u16 = 107;
    /// `MSP_ATTITUDE`
    pub const MSP_ATTITUDE: u16 = 108;
    /// `MSP_ALTITUDE`
    pub const MSP_ALTITUDE: u16 = 109;
    /// `MSP_ANALOG`
    pub const MSP_ANALOG: u16 = 110;
    /// `MSP_RC_TUNING`
    pub const MSP_RC_TUNING: u16 = 111;
    /// `MSP_PID`
    pub const MSP_PID: u16 = 112;
    /// `MSP_BOXNAMES`
    pub const MSP_BOXNAMES: u16 = 116;
    /// `MSP_BATTERY_STATE`
    pub const MSP_BATTERY_STATE: u16 = 130;
    /// `MSP_STATUS_EX`
    pub const MSP_STATUS_EX: u16 = 150;
    /// `MSP_UID`
    pub const MSP_UID: u16 = 160;
    /// `MSP_SET_RAW_RC`
    pub const MSP_SET_RAW_RC: u16 = 200;
    /// `MSP_SET_MOTOR`
    pub const MSP_SET_MOTOR: u16 = 214;
    /// `MSP_EEPROM_WRITE`
    pub const MSP_EEPROM_WRITE: u16 = 250;
    /// `MSP2_COMMON_SETTING`
    pub const MSP2_COMMON_SETTING: u16 = 0x1003;
    /// `MSP2_COMMON_SET_SETTING`
    pub const MSP2_COMMON_SET_SETTING: u16 = 0x1004;
    /// `MSP2_INAV_STATUS`
    pub const MSP2_INAV_STATUS: u16 = 0x2000;
    /// `MSP2_INAV_ANALOG`
    pub const MSP2_INAV_ANALOG: u16 = 0x2002;
    /// `MSP2_INAV_MISC`
    pub const MSP2_INAV_MISC: u16 = 0x2003;

    /// Name for a known command id.
    pub fn name(command: u16) -> Option<&'static str> {
        Some(match command {
            MSP_API_VERSION => "MSP_API_VERSION",
            MSP_FC_VARIANT => "MSP_FC_VARIANT",
            MSP_FC_VERSION => "MSP_FC_VERSION",
            MSP_BOARD_INFO => "MSP_BOARD_INFO",
            MSP_BUILD_INFO => "MSP_BUILD_INFO",
            MSP_NAME => "MSP_NAME",
            MSP_REBOOT => "MSP_REBOOT",
            MSP_STATUS => "MSP_STATUS",
            MSP_RAW_IMU => "MSP_RAW_IMU",
            MSP_SERVO => "MSP_SERVO",
            MSP_MOTOR => "MSP_MOTOR",
            MSP_RC => "MSP_RC",
            MSP_RAW_GPS => "MSP_RAW_GPS",
            MSP_COMP_GPS => "MSP_COMP_GPS",
            MSP_ATTITUDE => "MSP_ATTITUDE",
            MSP_ALTITUDE => "MSP_ALTITUDE",
            MSP_ANALOG => "MSP_ANALOG",
            MSP_RC_TUNING => "MSP_RC_TUNING",
            MSP_PID => "MSP_PID",
            MSP_BOXNAMES => "MSP_BOXNAMES",
            MSP_BATTERY_STATE => "MSP_BATTERY_STATE",
            MSP_STATUS_EX => "MSP_STATUS_EX",
            MSP_UID => "MSP_UID",
            MSP_SET_RAW_RC => "MSP_SET_RAW_RC",
            MSP_SET_MOTOR => "MSP_SET_MOTOR",
            MSP_EEPROM_WRITE => "MSP_EEPROM_WRITE",
            MSP2_COMMON_SETTING => "MSP2_COMMON_SETTING",
            MSP2_COMMON_SET_SETTING => "MSP2_COMMON_SET_SETTING",
            MSP2_INAV_STATUS => "MSP2_INAV_STATUS",
            MSP2_INAV_ANALOG => "MSP2_INAV_ANALOG",
            MSP2_INAV_MISC => "MSP2_INAV_MISC",
            _ => return None,
        })
    }
}

/// Protocol version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum MspVersion {
    /// `$M`
    V1,
    /// `$X`
    V2,
}

/// Frame direction byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum MspDirection {
    /// `<`: host to flight controller.
    Request,
    /// `>`: reply.
    Response,
    /// `!`: the flight controller rejected the command.
    Error,
}

impl MspDirection {
    /// Direction for a wire byte.
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            b'<' => Some(Self::Request),
            b'>' => Some(Self::Response),
            b'!' => Some(Self::Error),
            _ => None,
        }
    }

    /// Wire byte for this direction.
    pub fn as_byte(self) -> u8 {
        match self {
            Self::Request => b'<',
            Self::Response => b'>',
            Self::Error => b'!',
        }
    }
}

/// A decoded MSP frame with a verified checksum.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MspFrame {
    /// Protocol version.
    pub version: MspVersion,
    /// Direction byte.
    pub direction: MspDirection,
    /// v2 flag byte (zero for v1).
    pub flag: u8,
    /// Command id.
    pub command: u16,
    /// Payload bytes.
    pub payload: Vec<u8>,
}

impl MspFrame {
    /// Whether the flight controller answered with an error frame.
    pub fn is_error(&self) -> bool {
        self.direction == MspDirection::Error
    }

    /// Encode back to wire bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        match self.version {
            MspVersion::V1 => {
                let cmd = u8::try_from(self.command).map_err(|_| {
                    Error::Protocol(format!("command {} does not fit MSP v1", self.command))
                })?;
                encode_v1(self.direction, cmd, &self.payload)
            },
            MspVersion::V2 => encode_v2(self.direction, self.flag, self.command, &self.payload),
        }
    }
}

#[allow(clippy::cast_possible_truncation)]
fn encode_v1(direction: MspDirection, cmd: u8, payload: &[u8]) -> Result<Vec<u8>> {
    if payload.len() > MAX_PAYLOAD_V1 {
        return Err(Error::PayloadTooLarge {
            max: MAX_PAYLOAD_V1,
            actual: payload.len(),
        });
    }
    let mut buf = Vec::with_capacity(6 + payload.len());
    buf.extend_from_slice(&[PREAMBLE, MARKER_V1, direction.as_byte()]);
    // Safe cast: bounded by MAX_PAYLOAD_V1
    buf.push(payload.len() as u8);
    buf.push(cmd);
    buf.extend_from_slice(payload);
    buf.push(msp_v1_checksum(&buf[3..]));
    Ok(buf)
}

#[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
#[allow(clippy::cast_possible_truncation)]
fn encode_v2(direction: MspDirection, flag: u8, cmd: u16, payload: &[u8]) -> Result<Vec<u8>> {
    if payload.len() > MAX_PAYLOAD_V2 {
        return Err(Error::PayloadTooLarge {
            max: MAX_PAYLOAD_V2,
            actual: payload.len(),
        });
    }
    let mut buf = Vec::with_capacity(9 + payload.len());
    buf.extend_from_slice(&[PREAMBLE, MARKER_V2, direction.as_byte()]);
    buf.push(flag);
    buf.write_u16::<LittleEndian>(cmd).unwrap();
    // Safe cast: bounded by MAX_PAYLOAD_V2
    buf.write_u16::<LittleEndian>(payload.len() as u16).unwrap();
    buf.extend_from_slice(payload);
    buf.push(crc8_dvb_s2(&buf[3..]));
    Ok(buf)
}

/// Build a v1 request (`$M<`).
pub fn build_msp_v1_request(cmd: u8, payload: &[u8]) -> Result<Vec<u8>> {
    encode_v1(MspDirection::Request, cmd, payload)
}

/// Build a v2 request (`$X<`).
pub fn build_msp_v2_request(cmd: u16, payload: &[u8], flag: u8) -> Result<Vec<u8>> {
    encode_v2(MspDirection::Request, flag, cmd, payload)
}

/// Version a request would use.
pub fn select_version(cmd: u16, payload_len: usize, force_v2: bool) -> MspVersion {
    if force_v2 || cmd > 255 || payload_len > MAX_PAYLOAD_V1 {
        MspVersion::V2
    } else {
        MspVersion::V1
    }
}

/// Build a request, choosing v2 when the command or payload needs it.
pub fn build_msp_request(cmd: u16, payload: &[u8], force_v2: bool) -> Result<Vec<u8>> {
    match (select_version(cmd, payload.len(), force_v2), u8::try_from(cmd)) {
        (MspVersion::V1, Ok(cmd)) => build_msp_v1_request(cmd, payload),
        _ => build_msp_v2_request(cmd, payload, 0),
    }
}

/// Total length of the frame at the start of `buf`, if enough header is there.
fn frame_length(buf: &[u8]) -> Option<usize> {
    match buf.get(1)? {
        &MARKER_V1 => buf.get(3).map(|&len| 6 + usize::from(len)),
        &MARKER_V2 => {
            let len = u16::from_le_bytes([*buf.get(6)?, *buf.get(7)?]);
            Some(9 + usize::from(len))
        },
        _ => None,
    }
}

/// Decode one complete frame from the start of `buf`, verifying its checksum.
pub fn parse_msp_frame(buf: &[u8]) -> Result<MspFrame> {
    if buf.len() < 3 || buf[0] != PREAMBLE {
        return Err(Error::MalformedFrame("missing MSP preamble".into()));
    }
    let direction = MspDirection::from_byte(buf[2])
        .ok_or_else(|| Error::MalformedFrame(format!("bad MSP direction 0x{:02X}", buf[2])))?;
    let total = frame_length(buf)
        .ok_or_else(|| Error::MalformedFrame("truncated or unknown MSP header".into()))?;
    if buf.len() < total {
        return Err(Error::MalformedFrame(format!(
            "truncated MSP frame: {} of {total} bytes",
            buf.len()
        )));
    }

    let checked = &buf[3..total - 1];
    let actual = buf[total - 1];
    if buf[1] == MARKER_V1 {
        let expected = msp_v1_checksum(checked);
        if expected != actual {
            return Err(Error::CrcMismatch {
                expected: u16::from(expected),
                actual: u16::from(actual),
            });
        }
        Ok(MspFrame {
            version: MspVersion::V1,
            direction,
            flag: 0,
            command: u16::from(buf[4]),
            payload: buf[5..total - 1].to_vec(),
        })
    } else {
        let expected = crc8_dvb_s2(checked);
        if expected != actual {
            return Err(Error::CrcMismatch {
                expected: u16::from(expected),
                actual: u16::from(actual),
            });
        }
        Ok(MspFrame {
            version: MspVersion::V2,
            direction,
            flag: buf[3],
            command: u16::from_le_bytes([buf[4], buf[5]]),
            payload: buf[8..total - 1].to_vec(),
        })
    }
}

/// Counters kept by an [`MspDecoder`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MspStats {
    /// Frames with a valid checksum.
    pub frames_received: u64,
    /// Frames dropped on checksum mismatch.
    pub bad_checksum: u64,
    /// Bytes handed to [`MspDecoder::push`].
    pub bytes_received: u64,
}

/// Incremental MSP frame decoder.
#[derive(Debug, Default)]
pub struct MspDecoder {
    buffer: Vec<u8>,
    stats: MspStats,
}

impl MspDecoder {
    /// New decoder with an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and collect every complete frame.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<MspFrame> {
        self.stats.bytes_received += chunk.len() as u64;
        self.buffer.extend_from_slice(chunk);

        let mut frames = Vec::new();
        loop {
            let Some(start) = self.buffer.iter().position(|&b| b == PREAMBLE) else {
                self.buffer.clear();
                break;
            };
            if start > 0 {
                self.buffer.drain(..start);
            }
            if self.buffer.len() < 3 {
                break;
            }

            let valid_header = matches!(self.buffer[1], MARKER_V1 | MARKER_V2)
                && MspDirection::from_byte(self.buffer[2]).is_some();
            if !valid_header {
                trace!("Dropping stray '$'");
                self.buffer.drain(..1);
                continue;
            }

            let Some(total) = frame_length(&self.buffer) else {
                break;
            };
            if self.buffer.len() < total {
                break;
            }

            let frame: Vec<u8> = self.buffer.drain(..total).collect();
            match parse_msp_frame(&frame) {
                Ok(decoded) => {
                    trace!(
                        "MSP {:?} {:?} cmd={} len={}",
                        decoded.version,
                        decoded.direction,
                        decoded.command,
                        decoded.payload.len()
                    );
                    self.stats.frames_received += 1;
                    frames.push(decoded);
                },
                Err(e) => {
                    debug!("Dropping MSP frame: {e}");
                    self.stats.bad_checksum += 1;
                },
            }
        }
        frames
    }

    /// Counters since construction or the last reset.
    pub fn stats(&self) -> MspStats {
        self.stats
    }

    /// Drop buffered bytes and zero the counters.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.stats = MspStats::default();
    }
}

#[cfg(test)]
mod tests {
    use super::commands::*;
    use super::*;

    #[test]
    fn test_v1_attitude_request_bytes() {
        let frame = build_msp_v1_request(108, &[]).unwrap();
        assert_eq!(frame, [0x24, 0x4D, 0x3C, 0x00, 0x6C, 0x6C]);
        assert_eq!(
            build_msp_request(MSP_ATTITUDE, &[], false).unwrap(),
            frame
        );
    }

    #[test]
    fn test_v1_checksum_covers_len_cmd_payload() {
        for len in [0usize, 1, 17, 255] {
            let payload: Vec<u8> = (0..len).map(|i| (i * 7) as u8).collect();
            let frame = build_msp_v1_request(200, &payload).unwrap();
            let last = *frame.last().unwrap();
            assert_eq!(msp_v1_checksum(&frame[3..frame.len() - 1]), last);
            assert_eq!(frame[3] as usize, len);
        }
    }

    #[test]
    fn test_v2_crc_covers_flag_through_payload() {
        let payload = [1, 2, 3, 4, 5];
        let frame = build_msp_v2_request(MSP2_INAV_STATUS, &payload, 0).unwrap();
        assert_eq!(&frame[..3], b"$X<");
        assert_eq!(&frame[4..6], &[0x00, 0x20]);
        assert_eq!(&frame[6..8], &[5, 0]);
        let last = *frame.last().unwrap();
        assert_eq!(crc8_dvb_s2(&frame[3..frame.len() - 1]), last);
    }

    #[test]
    fn test_version_selection() {
        assert_eq!(select_version(108, 0, false), MspVersion::V1);
        assert_eq!(select_version(108, 0, true), MspVersion::V2);
        assert_eq!(select_version(256, 0, false), MspVersion::V2);
        assert_eq!(select_version(1, 256, false), MspVersion::V2);

        let frame = build_msp_request(1, &[0u8; 300], false).unwrap();
        assert_eq!(frame[1], MARKER_V2);
    }

    #[test]
    fn test_payload_limits() {
        assert!(matches!(
            build_msp_v1_request(1, &[0u8; 256]),
            Err(Error::PayloadTooLarge { max: 255, .. })
        ));
        assert!(build_msp_v2_request(1, &vec![0u8; MAX_PAYLOAD_V2 + 1], 0).is_err());
    }

    #[test]
    fn test_parse_v1_response() {
        let frame = MspFrame {
            version: MspVersion::V1,
            direction: MspDirection::Response,
            flag: 0,
            command: MSP_API_VERSION,
            payload: vec![0, 2, 5],
        };
        let bytes = frame.to_bytes().unwrap();
        assert_eq!(&bytes[..3], b"$M>");
        assert_eq!(parse_msp_frame(&bytes).unwrap(), frame);
    }

    #[test]
    fn test_parse_rejects_bad_checksum() {
        let mut bytes = build_msp_v2_request(MSP2_INAV_STATUS, &[9, 9], 0).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;
        assert!(matches!(
            parse_msp_frame(&bytes),
            Err(Error::CrcMismatch { .. })
        ));
    }

    #[test]
    fn test_decoder_across_chunks() {
        let reply = MspFrame {
            version: MspVersion::V2,
            direction: MspDirection::Response,
            flag: 0,
            command: MSP2_INAV_ANALOG,
            payload: vec![0x10; 24],
        };
        let error = MspFrame {
            version: MspVersion::V1,
            direction: MspDirection::Error,
            flag: 0,
            command: MSP_SET_MOTOR,
            payload: vec![],
        };

        let mut stream = b"noise$".to_vec();
        stream.extend(reply.to_bytes().unwrap());
        stream.extend(error.to_bytes().unwrap());

        let mut decoder = MspDecoder::new();
        let mut frames = Vec::new();
        for chunk in stream.chunks(3) {
            frames.extend(decoder.push(chunk));
        }
        assert_eq!(frames, vec![reply, error.clone()]);
        assert!(frames[1].is_error());
        assert_eq!(decoder.stats().frames_received, 2);
        assert_eq!(decoder.stats().bytes_received, stream.len() as u64);
    }

    #[test]
    fn test_decoder_counts_bad_checksum() {
        let mut bytes = build_msp_v1_request(MSP_STATUS as u8, &[1, 2]).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        bytes.extend(build_msp_v1_request(MSP_STATUS as u8, &[]).unwrap());

        let mut decoder = MspDecoder::new();
        let frames = decoder.push(&bytes);
        assert_eq!(frames.len(), 1);
        assert_eq!(decoder.stats().bad_checksum, 1);

        decoder.reset();
        assert_eq!(decoder.stats(), MspStats::default());
    }

    #[test]
    fn test_command_names() {
        assert_eq!(name(108), Some("MSP_ATTITUDE"));
        assert_eq!(name(102), Some("MSP_RAW_IMU"));
        assert_eq!(name(0xBEEF), None);
    }
}
