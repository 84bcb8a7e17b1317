//! Incremental MAVLink stream parser.
//!
//! Bytes arrive in arbitrary chunks and the parser keeps partial-frame state
//! between calls. Validation failures are counted, never returned.

use log::{debug, trace};

use crate::protocol::mavlink::packet::{
    MavlinkPacket, MavlinkVersion, STX_V1, STX_V2, calculate_packet_length, parse_packet,
};
use crate::protocol::mavlink::registry::{MessageInfo, MessageRegistry};
use crate::protocol::mavlink::signing::{SECRET_KEY_LEN, SignatureVerifyOptions, verify_signature};

/// Counters kept by a [`MavlinkParser`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ParserStats {
    /// Frames that passed every check.
    pub packets_received: u64,
    /// Frames dropped on CRC mismatch.
    pub bad_crc: u64,
    /// Frames dropped because the payload length is out of range.
    pub bad_length: u64,
    /// Frames with an unregistered msgid (still emitted).
    pub unknown_message: u64,
    /// Frames dropped on signature failure.
    pub bad_signature: u64,
    /// Bytes handed to [`MavlinkParser::parse`].
    pub bytes_received: u64,
}

/// How payload lengths are checked against the registry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum LengthPolicy {
    /// Length must lie in `[min_length, max_length]`.
    #[default]
    Strict,
    /// Like `Strict`, but MAVLink 2 frames may be shorter than `min_length`
    /// (trailing-zero truncation).
    AllowV2Truncation,
}

/// Signature checking for incoming frames.
#[derive(Clone)]
pub struct SigningVerification {
    key: [u8; SECRET_KEY_LEN],
    /// Freshness policy.
    pub options: SignatureVerifyOptions,
    /// Accept frames that carry no signature at all.
    pub allow_unsigned: bool,
}

impl std::fmt::Debug for SigningVerification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningVerification")
            .field("options", &self.options)
            .field("allow_unsigned", &self.allow_unsigned)
            .finish_non_exhaustive()
    }
}

impl SigningVerification {
    /// Verify signed frames with `key`; unsigned frames pass.
    pub fn new(key: &[u8]) -> crate::Result<Self> {
        let key: [u8; SECRET_KEY_LEN] = key.try_into().map_err(|_| {
            crate::Error::InvalidSigningInput(format!(
                "secret key must be {SECRET_KEY_LEN} bytes, got {}",
                key.len()
            ))
        })?;
        Ok(Self {
            key,
            options: SignatureVerifyOptions::default(),
            allow_unsigned: true,
        })
    }

    /// Set the freshness policy.
    #[must_use]
    pub fn with_options(mut self, options: SignatureVerifyOptions) -> Self {
        self.options = options;
        self
    }

    /// Whether unsigned frames are accepted.
    #[must_use]
    pub fn with_allow_unsigned(mut self, allow: bool) -> Self {
        self.allow_unsigned = allow;
        self
    }
}

/// Parser behavior knobs.
#[derive(Debug, Clone, Default)]
pub struct ParserOptions {
    /// Payload length policy.
    pub length_policy: LengthPolicy,
    /// Signature checking, off when `None`.
    pub signing: Option<SigningVerification>,
}

impl ParserOptions {
    /// Set the payload length policy.
    #[must_use]
    pub fn with_length_policy(mut self, policy: LengthPolicy) -> Self {
        self.length_policy = policy;
        self
    }

    /// Enable signature checking.
    #[must_use]
    pub fn with_signing(mut self, signing: SigningVerification) -> Self {
        self.signing = Some(signing);
        self
    }
}

/// Where the parser stands after the last call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseState {
    /// Looking for a start marker.
    SeekingStart,
    /// Start marker seen, header incomplete.
    AccumulatingHeader {
        /// Header length for the detected version.
        header_len: usize,
    },
    /// Header parsed, waiting for the rest of the frame.
    AccumulatingFrame {
        /// Total frame length.
        packet_len: usize,
    },
}

/// Stateful MAVLink stream parser.
///
/// One parser per byte stream. Not for concurrent use.
#[derive(Debug)]
pub struct MavlinkParser {
    registry: MessageRegistry,
    options: ParserOptions,
    buffer: Vec<u8>,
    state: ParseState,
    stats: ParserStats,
}

impl MavlinkParser {
    /// Parser with default options.
    pub fn new(registry: MessageRegistry) -> Self {
        Self::with_options(registry, ParserOptions::default())
    }

    /// Parser with explicit options.
    pub fn with_options(registry: MessageRegistry, options: ParserOptions) -> Self {
        Self {
            registry,
            options,
            buffer: Vec::new(),
            state: ParseState::SeekingStart,
            stats: ParserStats::default(),
        }
    }

    /// Feed a chunk and collect every frame it completes.
    pub fn parse(&mut self, chunk: &[u8]) -> Vec<MavlinkPacket> {
        self.stats.bytes_received += chunk.len() as u64;
        self.buffer.extend_from_slice(chunk);

        let mut packets = Vec::new();
        loop {
            let Some(start) = self
                .buffer
                .iter()
                .position(|&b| b == STX_V1 || b == STX_V2)
            else {
                if !self.buffer.is_empty() {
                    trace!("Discarding {} bytes of noise", self.buffer.len());
                }
                self.buffer.clear();
                self.state = ParseState::SeekingStart;
                break;
            };

            if start > 0 {
                trace!("Skipping {start} bytes before start marker");
                self.buffer.drain(..start);
            }

            let marker = self.buffer[0];
            let header_len = if marker == STX_V2 {
                MavlinkVersion::V2.header_len()
            } else {
                MavlinkVersion::V1.header_len()
            };
            if self.buffer.len() < header_len {
                self.state = ParseState::AccumulatingHeader { header_len };
                break;
            }

            let incompat = if marker == STX_V2 { self.buffer[2] } else { 0 };
            let packet_len = calculate_packet_length(marker, self.buffer[1], incompat);
            if self.buffer.len() < packet_len {
                self.state = ParseState::AccumulatingFrame { packet_len };
                break;
            }

            let frame: Vec<u8> = self.buffer.drain(..packet_len).collect();
            self.state = ParseState::SeekingStart;
            if let Some(packet) = self.decode(&frame) {
                packets.push(packet);
            }
        }
        packets
    }

    fn decode(&mut self, frame: &[u8]) -> Option<MavlinkPacket> {
        let packet = match parse_packet(frame) {
            Ok(packet) => packet,
            Err(e) => {
                // Only reachable if framing and codec disagree.
                debug!("Codec rejected a complete frame: {e}");
                return None;
            },
        };

        let Some(info) = self.registry.get(packet.msgid()) else {
            if !self.signature_ok(&packet) {
                return None;
            }
            trace!(
                "Unknown msgid {} from {}:{}",
                packet.msgid(),
                packet.sysid(),
                packet.compid()
            );
            self.stats.unknown_message += 1;
            return Some(packet);
        };

        if !self.length_ok(info, &packet) {
            debug!(
                "Dropping {} with length {} (expected {}..={})",
                info.name,
                packet.payload_length(),
                info.min_length,
                info.max_length
            );
            self.stats.bad_length += 1;
            return None;
        }

        let expected = packet.expected_crc(info.crc_extra);
        if expected != packet.crc16() {
            debug!(
                "Dropping {} seq {}: CRC {:#06x}, expected {expected:#06x}",
                info.name,
                packet.seq(),
                packet.crc16()
            );
            self.stats.bad_crc += 1;
            return None;
        }

        if !self.signature_ok(&packet) {
            return None;
        }

        self.stats.packets_received += 1;
        Some(packet)
    }

    fn length_ok(&self, info: &MessageInfo, packet: &MavlinkPacket) -> bool {
        let len = packet.payload_length();
        match self.options.length_policy {
            LengthPolicy::Strict => info.accepts_length(len),
            LengthPolicy::AllowV2Truncation => {
                if packet.is_mavlink2() {
                    len <= info.max_length
                } else {
                    info.accepts_length(len)
                }
            },
        }
    }

    fn signature_ok(&mut self, packet: &MavlinkPacket) -> bool {
        let Some(signing) = &self.options.signing else {
            return true;
        };

        let ok = match packet.signature() {
            None => signing.allow_unsigned,
            Some(sig) => {
                let data = packet.signed_region();
                verify_signature(&signing.key, &data, sig, &signing.options).unwrap_or(false)
            },
        };

        if !ok {
            debug!(
                "Dropping msgid {} from {}:{}: signature rejected",
                packet.msgid(),
                packet.sysid(),
                packet.compid()
            );
            self.stats.bad_signature += 1;
        }
        ok
    }

    /// Counters since construction or the last [`reset`](Self::reset).
    pub fn stats(&self) -> ParserStats {
        self.stats
    }

    /// Current framing state.
    pub fn state(&self) -> ParseState {
        self.state
    }

    /// Bytes held for an incomplete frame.
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// Registry used for validation.
    pub fn registry(&self) -> &MessageRegistry {
        &self.registry
    }

    /// Drop buffered bytes and zero the counters.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.state = ParseState::SeekingStart;
        self.stats = ParserStats::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::mavlink::packet::FrameBuilder;
    use crate::protocol::mavlink::registry::ids;
    use crate::protocol::mavlink::signing::Signer;

    const KEY: [u8; 32] = [0x11; 32];

    fn heartbeat_payload(custom_mode: u32) -> Vec<u8> {
        let mut p = custom_mode.to_le_bytes().to_vec();
        p.extend_from_slice(&[2, 3, 0x51, 4, 3]);
        p
    }

    fn attitude_payload() -> Vec<u8> {
        let mut p = 1234u32.to_le_bytes().to_vec();
        for v in [0.1f32, -0.2, 1.5, 0.0, 0.0, 0.01] {
            p.extend_from_slice(&v.to_le_bytes());
        }
        p
    }

    fn stream() -> Vec<u8> {
        let mut out = Vec::new();
        for seq in 0..3u8 {
            let b = FrameBuilder::v2(1, 1).with_sequence(seq);
            out.extend(b.build(ids::HEARTBEAT, &heartbeat_payload(u32::from(seq)), 50).unwrap());
            out.extend(b.build(ids::ATTITUDE, &attitude_payload(), 39).unwrap());
        }
        out.extend(
            FrameBuilder::v1(2, 1)
                .build(ids::HEARTBEAT, &heartbeat_payload(9), 50)
                .unwrap(),
        );
        out
    }

    #[test]
    fn test_whole_stream() {
        let mut parser = MavlinkParser::new(MessageRegistry::common());
        let packets = parser.parse(&stream());
        assert_eq!(packets.len(), 7);
        assert_eq!(packets[1].msgid(), ids::ATTITUDE);
        assert!(!packets[6].is_mavlink2());
        assert_eq!(parser.stats().packets_received, 7);
        assert_eq!(parser.stats().bytes_received, stream().len() as u64);
        assert_eq!(parser.buffered_len(), 0);
    }

    #[test]
    fn test_chunk_boundary_invariance() {
        let data = stream();
        let mut whole = MavlinkParser::new(MessageRegistry::common());
        let expected = whole.parse(&data);

        for chunk_size in [1, 2, 3, 5, 7, 11, 13, 64] {
            let mut parser = MavlinkParser::new(MessageRegistry::common());
            let mut got = Vec::new();
            for chunk in data.chunks(chunk_size) {
                got.extend(parser.parse(chunk));
            }
            assert_eq!(got, expected, "chunk size {chunk_size}");
            assert_eq!(parser.stats(), whole.stats());
        }
    }

    #[test]
    fn test_partial_frame_state() {
        let frame = FrameBuilder::v2(1, 1)
            .build(ids::HEARTBEAT, &heartbeat_payload(0), 50)
            .unwrap();
        let mut parser = MavlinkParser::new(MessageRegistry::common());

        assert!(parser.parse(&frame[..4]).is_empty());
        assert_eq!(
            parser.state(),
            ParseState::AccumulatingHeader { header_len: 10 }
        );
        assert!(parser.parse(&frame[4..12]).is_empty());
        assert_eq!(
            parser.state(),
            ParseState::AccumulatingFrame {
                packet_len: frame.len()
            }
        );
        assert_eq!(parser.parse(&frame[12..]).len(), 1);
        assert_eq!(parser.state(), ParseState::SeekingStart);
    }

    #[test]
    fn test_noise_rejection() {
        let noise: Vec<u8> = (0..=255u8).filter(|&b| b != STX_V1 && b != STX_V2).collect();
        let mut parser = MavlinkParser::new(MessageRegistry::common());
        assert!(parser.parse(&noise).is_empty());
        assert_eq!(parser.buffered_len(), 0);

        let stats = parser.stats();
        assert_eq!(stats.packets_received, 0);
        assert_eq!(stats.bad_crc, 0);
        assert_eq!(stats.bad_length, 0);
        assert_eq!(stats.unknown_message, 0);
    }

    #[test]
    fn test_leading_garbage_is_skipped() {
        let mut data = vec![0x00, 0x13, 0x37];
        data.extend(stream());
        let mut parser = MavlinkParser::new(MessageRegistry::common());
        assert_eq!(parser.parse(&data).len(), 7);
    }

    #[test]
    fn test_single_bit_flip_drops_frame() {
        let frame = FrameBuilder::v2(1, 1)
            .build(ids::ATTITUDE, &attitude_payload(), 39)
            .unwrap();
        let payload_range = 10..10 + attitude_payload().len();

        for byte in payload_range {
            for bit in 0..8 {
                let mut corrupted = frame.clone();
                corrupted[byte] ^= 1 << bit;
                let mut parser = MavlinkParser::new(MessageRegistry::common());
                assert!(parser.parse(&corrupted).is_empty());
                assert_eq!(parser.stats().bad_crc, 1);
            }
        }
    }

    #[test]
    fn test_idempotent_stats_after_reset() {
        let mut data = stream();
        data[12] ^= 0xFF;
        let mut parser = MavlinkParser::new(MessageRegistry::common());
        parser.parse(&data);
        let first = parser.stats();

        parser.reset();
        assert_eq!(parser.stats(), ParserStats::default());
        parser.parse(&data);
        assert_eq!(parser.stats(), first);
    }

    #[test]
    fn test_unknown_message_is_emitted() {
        let frame = FrameBuilder::v2(3, 4).build(60_000, &[1, 2, 3], 0).unwrap();
        let mut parser = MavlinkParser::new(MessageRegistry::common());
        let packets = parser.parse(&frame);
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].msgid(), 60_000);
        assert_eq!(parser.stats().unknown_message, 1);
        assert_eq!(parser.stats().packets_received, 0);
    }

    #[test]
    fn test_bad_length_dropped() {
        // HEARTBEAT with a 4-byte payload
        let frame = FrameBuilder::v1(1, 1).build(ids::HEARTBEAT, &[0; 4], 50).unwrap();
        let mut parser = MavlinkParser::new(MessageRegistry::common());
        assert!(parser.parse(&frame).is_empty());
        assert_eq!(parser.stats().bad_length, 1);
    }

    #[test]
    fn test_truncated_v2_needs_policy() {
        let payload = [5, 0, 0, 0, 2, 3, 0, 0, 0];
        let frame = FrameBuilder::v2(1, 1)
            .with_truncation(true)
            .build(ids::HEARTBEAT, &payload, 50)
            .unwrap();
        assert_eq!(frame[1], 6);

        let mut strict = MavlinkParser::new(MessageRegistry::common());
        assert!(strict.parse(&frame).is_empty());
        assert_eq!(strict.stats().bad_length, 1);

        let options = ParserOptions::default().with_length_policy(LengthPolicy::AllowV2Truncation);
        let mut lenient = MavlinkParser::with_options(MessageRegistry::common(), options);
        let packets = lenient.parse(&frame);
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].padded_payload(9).as_ref(), &payload);
    }

    #[test]
    fn test_signature_verification() {
        let mut signer = Signer::new(&KEY, 1).unwrap();
        let signed = FrameBuilder::v2(1, 1)
            .build_signed(ids::HEARTBEAT, &heartbeat_payload(0), 50, &mut signer)
            .unwrap();
        let unsigned = FrameBuilder::v2(1, 1)
            .build(ids::HEARTBEAT, &heartbeat_payload(0), 50)
            .unwrap();

        let verify = SigningVerification::new(&KEY).unwrap();
        let mut parser = MavlinkParser::with_options(
            MessageRegistry::common(),
            ParserOptions::default().with_signing(verify.clone()),
        );
        assert_eq!(parser.parse(&signed).len(), 1);
        assert_eq!(parser.parse(&unsigned).len(), 1);

        let mut tampered = signed.clone();
        let last = tampered.len() - 1;
        tampered[last] ^= 0x01;
        assert!(parser.parse(&tampered).is_empty());
        assert_eq!(parser.stats().bad_signature, 1);

        let mut strict = MavlinkParser::with_options(
            MessageRegistry::common(),
            ParserOptions::default().with_signing(verify.with_allow_unsigned(false)),
        );
        assert!(strict.parse(&unsigned).is_empty());
        assert_eq!(strict.stats().bad_signature, 1);
    }

    #[test]
    fn test_wrong_key_rejected() {
        let mut signer = Signer::new(&[0x22; 32], 1).unwrap();
        let signed = FrameBuilder::v2(1, 1)
            .build_signed(ids::HEARTBEAT, &heartbeat_payload(0), 50, &mut signer)
            .unwrap();
        let mut parser = MavlinkParser::with_options(
            MessageRegistry::common(),
            ParserOptions::default().with_signing(SigningVerification::new(&KEY).unwrap()),
        );
        assert!(parser.parse(&signed).is_empty());
        assert_eq!(parser.stats().bad_signature, 1);
    }
}
