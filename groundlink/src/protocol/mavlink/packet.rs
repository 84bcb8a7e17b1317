//! MAVLink v1/v2 frame codec.
//!
//! ## Frame Format
//!
//! ```text
//! v1:
//! +-----+-----+-----+-------+--------+-------+-----------+-------+
//! | STX | LEN | SEQ | SYSID | COMPID | MSGID |  PAYLOAD  | CRC16 |
//! +-----+-----+-----+-------+--------+-------+-----------+-------+
//! | FE  |  1  |  1  |   1   |   1    |   1   |    LEN    |  2 LE |
//! +-----+-----+-----+-------+--------+-------+-----------+-------+
//!
//! v2:
//! +-----+-----+----------+--------+-----+-------+--------+----------+---------+-------+-----------+
//! | STX | LEN | INCOMPAT | COMPAT | SEQ | SYSID | COMPID | MSGID    | PAYLOAD | CRC16 | SIGNATURE |
//! +-----+-----+----------+--------+-----+-------+--------+----------+---------+-------+-----------+
//! | FD  |  1  |    1     |   1    |  1  |   1   |   1    | 3 LE     |   LEN   |  2 LE | 13 if     |
//! |     |     |          |        |     |       |        |          |         |       | signed    |
//! +-----+-----+----------+--------+-----+-------+--------+----------+---------+-------+-----------+
//! ```

use std::borrow::Cow;

use log::trace;

use crate::error::{Error, Result};
use crate::protocol::crc::crc_with_extra;
use crate::protocol::mavlink::signing::{SIGNATURE_LEN, Signer};

/// MAVLink 1 start marker.
pub const STX_V1: u8 = 0xFE;

/// MAVLink 2 start marker.
pub const STX_V2: u8 = 0xFD;

/// MAVLink 1 header length (including the start marker).
pub const HEADER_LEN_V1: usize = 6;

/// MAVLink 2 header length (including the start marker).
pub const HEADER_LEN_V2: usize = 10;

/// CRC field length.
pub const CHECKSUM_LEN: usize = 2;

/// Incompatibility flag marking a signed MAVLink 2 frame.
pub const IFLAG_SIGNED: u8 = 0x01;

/// Largest payload a single frame can carry.
pub const MAX_PAYLOAD_LEN: usize = 255;

/// Largest msgid representable in a MAVLink 2 header.
pub const MAX_MSGID_V2: u32 = 0x00FF_FFFF;

/// Protocol version, selected by the start marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum MavlinkVersion {
    /// MAVLink 1 (`0xFE`).
    V1,
    /// MAVLink 2 (`0xFD`).
    V2,
}

impl MavlinkVersion {
    /// Version implied by a start marker, if it is one.
    pub fn from_marker(marker: u8) -> Option<Self> {
        match marker {
            STX_V1 => Some(Self::V1),
            STX_V2 => Some(Self::V2),
            _ => None,
        }
    }

    /// Start marker for this version.
    pub fn marker(self) -> u8 {
        match self {
            Self::V1 => STX_V1,
            Self::V2 => STX_V2,
        }
    }

    /// Header length for this version.
    pub fn header_len(self) -> usize {
        match self {
            Self::V1 => HEADER_LEN_V1,
            Self::V2 => HEADER_LEN_V2,
        }
    }
}

/// Total number of bytes a frame occupies on the wire.
///
/// `header` is the start marker. Anything that is not a v2 marker is sized
/// as v1; callers are expected to have checked the marker already.
/// `incompat_flags` is ignored for v1.
pub fn calculate_packet_length(header: u8, payload_length: u8, incompat_flags: u8) -> usize {
    let payload = usize::from(payload_length);
    if header == STX_V2 {
        let signature = if incompat_flags & IFLAG_SIGNED != 0 {
            SIGNATURE_LEN
        } else {
            0
        };
        HEADER_LEN_V2 + payload + CHECKSUM_LEN + signature
    } else {
        HEADER_LEN_V1 + payload + CHECKSUM_LEN
    }
}

/// One complete MAVLink frame, payload not yet decoded into a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MavlinkPacket {
    header: u8,
    payload_length: u8,
    incompat_flags: u8,
    compat_flags: u8,
    seq: u8,
    sysid: u8,
    compid: u8,
    msgid: u32,
    payload: Vec<u8>,
    crc16: u16,
    signature: Option<[u8; SIGNATURE_LEN]>,
}

impl MavlinkPacket {
    /// Start marker (`0xFD` or `0xFE`).
    pub fn header(&self) -> u8 {
        self.header
    }

    /// Declared payload length. Always equals `payload().len()`.
    pub fn payload_length(&self) -> u8 {
        self.payload_length
    }

    /// Incompatibility flags (always zero for v1).
    pub fn incompat_flags(&self) -> u8 {
        self.incompat_flags
    }

    /// Compatibility flags (always zero for v1).
    pub fn compat_flags(&self) -> u8 {
        self.compat_flags
    }

    /// Sequence number.
    pub fn seq(&self) -> u8 {
        self.seq
    }

    /// Sender system id.
    pub fn sysid(&self) -> u8 {
        self.sysid
    }

    /// Sender component id.
    pub fn compid(&self) -> u8 {
        self.compid
    }

    /// Message id (24-bit for v2, 8-bit for v1).
    pub fn msgid(&self) -> u32 {
        self.msgid
    }

    /// Raw payload bytes.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// CRC carried in the frame.
    pub fn crc16(&self) -> u16 {
        self.crc16
    }

    /// 13-byte signature block, for signed v2 frames.
    pub fn signature(&self) -> Option<&[u8; SIGNATURE_LEN]> {
        self.signature.as_ref()
    }

    /// Whether this is a MAVLink 2 frame.
    pub fn is_mavlink2(&self) -> bool {
        self.header == STX_V2
    }

    /// Whether this frame carries a signature.
    pub fn is_signed(&self) -> bool {
        self.signature.is_some()
    }

    /// Protocol version.
    pub fn version(&self) -> MavlinkVersion {
        if self.is_mavlink2() {
            MavlinkVersion::V2
        } else {
            MavlinkVersion::V1
        }
    }

    /// Offset of the CRC field within the frame.
    pub fn crc_offset(&self) -> usize {
        self.version().header_len() + self.payload.len()
    }

    /// Frame length on the wire.
    pub fn packet_length(&self) -> usize {
        calculate_packet_length(self.header, self.payload_length, self.incompat_flags)
    }

    /// CRC this frame should carry for a message with the given `crc_extra`.
    pub fn expected_crc(&self, crc_extra: u8) -> u16 {
        let bytes = self.to_bytes();
        crc_with_extra(&bytes, self.crc_offset(), crc_extra)
    }

    /// Whether the carried CRC matches the given `crc_extra`.
    pub fn has_valid_crc(&self, crc_extra: u8) -> bool {
        self.expected_crc(crc_extra) == self.crc16
    }

    /// Payload zero-extended to `len` bytes.
    ///
    /// MAVLink 2 senders strip trailing zero bytes, so message decoders read
    /// through this rather than `payload()`.
    pub fn padded_payload(&self, len: usize) -> Cow<'_, [u8]> {
        if self.payload.len() >= len {
            Cow::Borrowed(&self.payload)
        } else {
            let mut padded = self.payload.clone();
            padded.resize(len, 0);
            Cow::Owned(padded)
        }
    }

    /// Header, payload and CRC: the bytes a signature covers.
    pub fn signed_region(&self) -> Vec<u8> {
        let mut bytes = self.to_bytes();
        bytes.truncate(self.crc_offset() + CHECKSUM_LEN);
        bytes
    }

    /// Serialize the frame back to its exact wire bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.packet_length());
        buf.push(self.header);
        buf.push(self.payload_length);
        if self.is_mavlink2() {
            buf.push(self.incompat_flags);
            buf.push(self.compat_flags);
            buf.push(self.seq);
            buf.push(self.sysid);
            buf.push(self.compid);
            buf.extend_from_slice(&self.msgid.to_le_bytes()[..3]);
        } else {
            buf.push(self.seq);
            buf.push(self.sysid);
            buf.push(self.compid);
            buf.push(self.msgid.to_le_bytes()[0]);
        }
        buf.extend_from_slice(&self.payload);
        buf.extend_from_slice(&self.crc16.to_le_bytes());
        if let Some(sig) = &self.signature {
            buf.extend_from_slice(sig);
        }
        buf
    }
}

/// Decode one frame from the start of `buffer`.
///
/// The buffer must begin with a start marker and hold at least the whole
/// frame; trailing bytes are ignored. No CRC validation happens here since
/// that needs the message's `crc_extra` (see [`MavlinkPacket::has_valid_crc`]).
pub fn parse_packet(buffer: &[u8]) -> Result<MavlinkPacket> {
    let Some(&marker) = buffer.first() else {
        return Err(Error::MalformedFrame("empty buffer".into()));
    };
    let version = MavlinkVersion::from_marker(marker)
        .ok_or_else(|| Error::MalformedFrame(format!("bad start byte 0x{marker:02X}")))?;

    let header_len = version.header_len();
    if buffer.len() < header_len {
        return Err(Error::MalformedFrame(format!(
            "truncated header: {} of {header_len} bytes",
            buffer.len()
        )));
    }

    let payload_length = buffer[1];
    let (incompat_flags, compat_flags, seq, sysid, compid, msgid) = match version {
        MavlinkVersion::V2 => (
            buffer[2],
            buffer[3],
            buffer[4],
            buffer[5],
            buffer[6],
            u32::from_le_bytes([buffer[7], buffer[8], buffer[9], 0]),
        ),
        MavlinkVersion::V1 => (0, 0, buffer[2], buffer[3], buffer[4], u32::from(buffer[5])),
    };

    let total = calculate_packet_length(marker, payload_length, incompat_flags);
    if buffer.len() < total {
        return Err(Error::MalformedFrame(format!(
            "truncated frame: {} of {total} bytes",
            buffer.len()
        )));
    }

    let payload_end = header_len + usize::from(payload_length);
    let payload = buffer[header_len..payload_end].to_vec();
    let crc16 = u16::from_le_bytes([buffer[payload_end], buffer[payload_end + 1]]);

    let signature = if version == MavlinkVersion::V2 && incompat_flags & IFLAG_SIGNED != 0 {
        let start = payload_end + CHECKSUM_LEN;
        let mut sig = [0u8; SIGNATURE_LEN];
        sig.copy_from_slice(&buffer[start..start + SIGNATURE_LEN]);
        Some(sig)
    } else {
        None
    };

    Ok(MavlinkPacket {
        header: marker,
        payload_length,
        incompat_flags,
        compat_flags,
        seq,
        sysid,
        compid,
        msgid,
        payload,
        crc16,
        signature,
    })
}

/// Serializer for outgoing frames.
#[derive(Debug, Clone)]
pub struct FrameBuilder {
    version: MavlinkVersion,
    sysid: u8,
    compid: u8,
    seq: u8,
    compat_flags: u8,
    truncate: bool,
}

impl FrameBuilder {
    /// Builder for MAVLink 2 frames.
    pub fn v2(sysid: u8, compid: u8) -> Self {
        Self {
            version: MavlinkVersion::V2,
            sysid,
            compid,
            seq: 0,
            compat_flags: 0,
            truncate: false,
        }
    }

    /// Builder for MAVLink 1 frames.
    pub fn v1(sysid: u8, compid: u8) -> Self {
        Self {
            version: MavlinkVersion::V1,
            ..Self::v2(sysid, compid)
        }
    }

    /// Set the sequence number for the next frame.
    #[must_use]
    pub fn with_sequence(mut self, seq: u8) -> Self {
        self.seq = seq;
        self
    }

    /// Strip trailing zero payload bytes (MAVLink 2 only).
    #[must_use]
    pub fn with_truncation(mut self, truncate: bool) -> Self {
        self.truncate = truncate;
        self
    }

    /// Set the compatibility flags (MAVLink 2 only).
    #[must_use]
    pub fn with_compat_flags(mut self, flags: u8) -> Self {
        self.compat_flags = flags;
        self
    }

    /// Protocol version this builder emits.
    pub fn version(&self) -> MavlinkVersion {
        self.version
    }

    /// Sequence number the next frame will carry.
    pub fn sequence(&self) -> u8 {
        self.seq
    }

    /// Set the sequence number in place.
    pub fn set_sequence(&mut self, seq: u8) {
        self.seq = seq;
    }

    /// Build an unsigned frame.
    pub fn build(&self, msgid: u32, payload: &[u8], crc_extra: u8) -> Result<Vec<u8>> {
        self.encode(msgid, payload, crc_extra, None)
    }

    /// Build a signed MAVLink 2 frame.
    pub fn build_signed(
        &self,
        msgid: u32,
        payload: &[u8],
        crc_extra: u8,
        signer: &mut Signer,
    ) -> Result<Vec<u8>> {
        if self.version == MavlinkVersion::V1 {
            return Err(Error::Unsupported("MAVLink 1 frames cannot be signed".into()));
        }
        self.encode(msgid, payload, crc_extra, Some(signer))
    }

    #[allow(clippy::cast_possible_truncation)]
    fn encode(
        &self,
        msgid: u32,
        payload: &[u8],
        crc_extra: u8,
        signer: Option<&mut Signer>,
    ) -> Result<Vec<u8>> {
        if payload.len() > MAX_PAYLOAD_LEN {
            return Err(Error::PayloadTooLarge {
                max: MAX_PAYLOAD_LEN,
                actual: payload.len(),
            });
        }

        let payload = if self.truncate && self.version == MavlinkVersion::V2 {
            truncate_trailing_zeros(payload)
        } else {
            payload
        };

        let mut buf = Vec::with_capacity(HEADER_LEN_V2 + payload.len() + CHECKSUM_LEN + SIGNATURE_LEN);
        buf.push(self.version.marker());
        // Safe cast: checked against MAX_PAYLOAD_LEN above
        buf.push(payload.len() as u8);

        match self.version {
            MavlinkVersion::V2 => {
                if msgid > MAX_MSGID_V2 {
                    return Err(Error::Protocol(format!(
                        "msgid {msgid} does not fit in 24 bits"
                    )));
                }
                let incompat = if signer.is_some() { IFLAG_SIGNED } else { 0 };
                buf.push(incompat);
                buf.push(self.compat_flags);
                buf.push(self.seq);
                buf.push(self.sysid);
                buf.push(self.compid);
                buf.extend_from_slice(&msgid.to_le_bytes()[..3]);
            },
            MavlinkVersion::V1 => {
                let id = u8::try_from(msgid).map_err(|_| {
                    Error::Protocol(format!("msgid {msgid} does not fit in a MAVLink 1 frame"))
                })?;
                buf.push(self.seq);
                buf.push(self.sysid);
                buf.push(self.compid);
                buf.push(id);
            },
        }

        buf.extend_from_slice(payload);
        let crc = crc_with_extra(&buf, buf.len(), crc_extra);
        buf.extend_from_slice(&crc.to_le_bytes());

        if let Some(signer) = signer {
            let signature = signer.sign(&buf)?;
            buf.extend_from_slice(&signature);
        }

        trace!(
            "Built {:?} frame msgid={msgid} seq={} ({} bytes)",
            self.version,
            self.seq,
            buf.len()
        );
        Ok(buf)
    }
}

/// Strip trailing zeros, keeping at least the first payload byte.
fn truncate_trailing_zeros(payload: &[u8]) -> &[u8] {
    let keep = payload
        .iter()
        .rposition(|&b| b != 0)
        .map_or(1, |last| last + 1);
    &payload[..keep.min(payload.len())]
}
