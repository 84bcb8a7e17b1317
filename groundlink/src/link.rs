//! Connection session.
//!
//! A [`Link`] is created when a transport connects and dropped when it
//! disconnects. It owns everything stateful about the conversation: the
//! MAVLink stream parser, the MSP decoder, the outgoing sequence counter
//! and the optional signer.

use log::{debug, trace};

use crate::error::{Error, Result};
use crate::protocol::mavlink::{
    FrameBuilder, MavlinkPacket, MavlinkParser, MavlinkVersion, MessageRegistry, ParserOptions,
    ParserStats, Signer,
};
use crate::protocol::msp::{MspDecoder, MspFrame, MspStats, build_msp_request};
use crate::transport::{Endpoint, Transport, TransportConfig};

/// System id used for outgoing frames unless overridden.
pub const DEFAULT_SYSTEM_ID: u8 = 255;

/// Component id used for outgoing frames unless overridden.
pub const DEFAULT_COMPONENT_ID: u8 = 190;

const READ_CHUNK: usize = 4096;

/// One decoded inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// A validated MAVLink frame.
    Mavlink(MavlinkPacket),
    /// A checksum-verified MSP frame.
    Msp(MspFrame),
}

/// Session state for one connected transport.
pub struct Link<T> {
    transport: T,
    parser: MavlinkParser,
    msp: MspDecoder,
    builder: FrameBuilder,
    signer: Option<Signer>,
    force_msp_v2: bool,
    buf: Vec<u8>,
}

impl<T> std::fmt::Debug for Link<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link")
            .field("sequence", &self.builder.sequence())
            .field("signed", &self.signer.is_some())
            .field("stats", &self.parser.stats())
            .finish_non_exhaustive()
    }
}

impl Link<Box<dyn Transport>> {
    /// Open `endpoint` and wrap it in a session.
    pub fn connect(endpoint: &Endpoint, config: TransportConfig, registry: MessageRegistry) -> Result<Self> {
        let transport = endpoint.connect(config)?;
        debug!("Link up on {endpoint}");
        Ok(Self::new(transport, registry))
    }
}

impl<T: Transport> Link<T> {
    /// Wrap an already open transport.
    pub fn new(transport: T, registry: MessageRegistry) -> Self {
        Self {
            transport,
            parser: MavlinkParser::new(registry),
            msp: MspDecoder::new(),
            builder: FrameBuilder::v2(DEFAULT_SYSTEM_ID, DEFAULT_COMPONENT_ID),
            signer: None,
            force_msp_v2: false,
            buf: vec![0u8; READ_CHUNK],
        }
    }

    /// Replace the parser options. Buffered input and stats are dropped.
    #[must_use]
    pub fn with_parser_options(mut self, options: ParserOptions) -> Self {
        let registry = self.parser.registry().clone();
        self.parser = MavlinkParser::with_options(registry, options);
        self
    }

    /// Identity and framing version for outgoing MAVLink frames.
    #[must_use]
    pub fn with_identity(mut self, version: MavlinkVersion, sysid: u8, compid: u8) -> Self {
        self.builder = match version {
            MavlinkVersion::V1 => FrameBuilder::v1(sysid, compid),
            MavlinkVersion::V2 => FrameBuilder::v2(sysid, compid),
        };
        self
    }

    /// Sign every outgoing MAVLink 2 frame.
    #[must_use]
    pub fn with_signer(mut self, signer: Signer) -> Self {
        self.signer = Some(signer);
        self
    }

    /// Send every MSP request as v2.
    #[must_use]
    pub fn with_force_msp_v2(mut self, force: bool) -> Self {
        self.force_msp_v2 = force;
        self
    }

    /// Read once and decode whatever arrived.
    ///
    /// Bytes go to both decoders; each ignores what is not its own.
    pub fn poll(&mut self) -> Result<Vec<LinkEvent>> {
        if !self.transport.is_open() {
            return Err(Error::TransportClosed(self.transport.name().to_string()));
        }
        let n = self.transport.read_chunk(&mut self.buf)?;
        if n == 0 {
            return Ok(Vec::new());
        }
        let chunk = &self.buf[..n];
        trace!("Link read {n} bytes");

        let mut events: Vec<LinkEvent> = self
            .parser
            .parse(chunk)
            .into_iter()
            .map(LinkEvent::Mavlink)
            .collect();
        events.extend(self.msp.push(chunk).into_iter().map(LinkEvent::Msp));
        Ok(events)
    }

    /// Frame and send a registered MAVLink message. Returns the sequence
    /// number used.
    pub fn send_mavlink(&mut self, msgid: u32, payload: &[u8]) -> Result<u8> {
        let crc_extra = self
            .parser
            .registry()
            .get(msgid)
            .map(|info| info.crc_extra)
            .ok_or_else(|| Error::Protocol(format!("msgid {msgid} is not in the registry")))?;
        self.send_mavlink_with_extra(msgid, payload, crc_extra)
    }

    /// Frame and send a message with an explicit CRC extra.
    pub fn send_mavlink_with_extra(&mut self, msgid: u32, payload: &[u8], crc_extra: u8) -> Result<u8> {
        let seq = self.builder.sequence();
        let frame = match self.signer.as_mut() {
            Some(signer) => self.builder.build_signed(msgid, payload, crc_extra, signer)?,
            None => self.builder.build(msgid, payload, crc_extra)?,
        };
        self.transport.write(&frame)?;
        self.builder.set_sequence(seq.wrapping_add(1));
        trace!("Sent msgid {msgid} seq {seq} ({} bytes)", frame.len());
        Ok(seq)
    }

    /// Send an MSP request, picking v1 or v2 from the command and payload.
    pub fn send_msp(&mut self, command: u16, payload: &[u8]) -> Result<()> {
        let frame = build_msp_request(command, payload, self.force_msp_v2)?;
        self.transport.write(&frame)?;
        trace!("Sent MSP {command} ({} bytes)", frame.len());
        Ok(())
    }

    /// Return to the just-connected state: empty buffers, zeroed counters,
    /// sequence 0. Pending input on the transport is discarded.
    pub fn reset_all(&mut self) {
        self.parser.reset();
        self.msp.reset();
        self.builder.set_sequence(0);
        if let Err(e) = self.transport.discard_in_buffer() {
            debug!("Discard on reset failed: {e}");
        }
    }

    /// MAVLink parser counters.
    pub fn mavlink_stats(&self) -> ParserStats {
        self.parser.stats()
    }

    /// MSP decoder counters.
    pub fn msp_stats(&self) -> MspStats {
        self.msp.stats()
    }

    /// Next outgoing MAVLink sequence number.
    pub fn sequence(&self) -> u8 {
        self.builder.sequence()
    }

    /// The underlying transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// The underlying transport, mutably.
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Close the transport and end the session.
    pub fn close(mut self) -> Result<T> {
        self.transport.close()?;
        Ok(self.transport)
    }
}

#[cfg(test)]
mod tests {
    use std::io;

    use super::*;
    use crate::protocol::mavlink::SigningVerification;
    use crate::protocol::mavlink::registry::ids;
    use crate::protocol::msp::{MspDirection, MspVersion, commands};
    use crate::transport::mock::MockTransport;

    const HEARTBEAT: [u8; 9] = [0, 0, 0, 0, 2, 3, 0x51, 4, 3];

    fn link(input: &[u8]) -> Link<MockTransport> {
        Link::new(MockTransport::new(input), MessageRegistry::common())
    }

    fn heartbeat_frame(seq: u8) -> Vec<u8> {
        FrameBuilder::v2(1, 1)
            .with_sequence(seq)
            .build(ids::HEARTBEAT, &HEARTBEAT, 50)
            .unwrap()
    }

    #[test]
    fn test_poll_decodes_both_protocols() {
        let msp = MspFrame {
            version: MspVersion::V1,
            direction: MspDirection::Response,
            flag: 0,
            command: commands::MSP_ATTITUDE,
            payload: vec![0x10, 0, 0x20, 0, 0x30, 0],
        };
        let mut input = msp.to_bytes().unwrap();
        input.extend_from_slice(&heartbeat_frame(7));

        let mut link = link(&input);
        let events = link.poll().unwrap();
        assert_eq!(events.len(), 2);
        match &events[0] {
            LinkEvent::Mavlink(p) => {
                assert_eq!(p.msgid(), ids::HEARTBEAT);
                assert_eq!(p.seq(), 7);
            },
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(events[1], LinkEvent::Msp(msp));
        assert_eq!(link.mavlink_stats().packets_received, 1);
        assert_eq!(link.msp_stats().frames_received, 1);

        assert!(link.poll().unwrap().is_empty());
    }

    #[test]
    fn test_send_mavlink_advances_sequence() {
        let mut link = link(&[]);
        assert_eq!(link.send_mavlink(ids::HEARTBEAT, &HEARTBEAT).unwrap(), 0);
        assert_eq!(link.send_mavlink(ids::HEARTBEAT, &HEARTBEAT).unwrap(), 1);
        assert_eq!(link.sequence(), 2);

        let mut parser = MavlinkParser::new(MessageRegistry::common());
        let sent = parser.parse(&link.transport().write_buf);
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[1].seq(), 1);
        assert_eq!(sent[0].sysid(), DEFAULT_SYSTEM_ID);
        assert_eq!(sent[0].compid(), DEFAULT_COMPONENT_ID);
    }

    #[test]
    fn test_send_unregistered_message_fails() {
        let mut link = link(&[]);
        assert!(matches!(link.send_mavlink(60_000, &[1, 2]), Err(Error::Protocol(_))));
        assert!(link.transport().write_buf.is_empty());
        assert_eq!(link.sequence(), 0);
        link.send_mavlink_with_extra(60_000, &[1, 2], 0x42).unwrap();
        assert_eq!(link.sequence(), 1);
    }

    #[test]
    fn test_signed_link_frames_verify() {
        let key = [0x5Au8; 32];
        let mut link = link(&[]).with_signer(Signer::new(&key, 3).unwrap());
        link.send_mavlink(ids::HEARTBEAT, &HEARTBEAT).unwrap();

        let verify = SigningVerification::new(&key).unwrap().with_allow_unsigned(false);
        let mut parser = MavlinkParser::with_options(
            MessageRegistry::common(),
            ParserOptions::default().with_signing(verify),
        );
        let packets = parser.parse(&link.transport().write_buf);
        assert_eq!(packets.len(), 1);
        assert!(packets[0].is_signed());
    }

    #[test]
    fn test_v1_identity() {
        let mut link = link(&[]).with_identity(MavlinkVersion::V1, 42, 7);
        link.send_mavlink(ids::HEARTBEAT, &HEARTBEAT).unwrap();
        let written = &link.transport().write_buf;
        assert_eq!(written[0], 0xFE);
        assert_eq!(written[3], 42);
        assert_eq!(written[4], 7);
    }

    #[test]
    fn test_send_msp_request() {
        let mut link = link(&[]);
        link.send_msp(commands::MSP_ATTITUDE, &[]).unwrap();
        assert_eq!(link.transport().write_buf, vec![0x24, 0x4D, 0x3C, 0x00, 0x6C, 0x6C]);

        let mut v2 = self::link(&[]).with_force_msp_v2(true);
        v2.send_msp(commands::MSP_ATTITUDE, &[]).unwrap();
        assert_eq!(&v2.transport().write_buf[..3], b"$X<");
    }

    #[test]
    fn test_reset_all() {
        let frame = heartbeat_frame(0);
        let mut link = link(&frame[..5]);
        link.send_mavlink(ids::HEARTBEAT, &HEARTBEAT).unwrap();
        assert!(link.poll().unwrap().is_empty());
        link.transport_mut().read_buf.extend([0xAA, 0xBB]);

        link.reset_all();
        assert_eq!(link.mavlink_stats(), ParserStats::default());
        assert_eq!(link.sequence(), 0);
        assert!(link.transport().read_buf.is_empty());

        // The stale half frame is gone, so a fresh frame parses cleanly
        link.transport_mut().read_buf.extend(heartbeat_frame(9));
        let events = link.poll().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(link.mavlink_stats().bad_crc, 0);
    }

    #[test]
    fn test_read_failure_surfaces() {
        let mut link = link(&[]);
        link.transport_mut().fail_read = Some(io::ErrorKind::BrokenPipe);
        assert!(matches!(link.poll(), Err(Error::Io(_))));
        assert!(matches!(link.poll(), Err(Error::TransportClosed(_))));
    }

    #[test]
    fn test_close_returns_transport() {
        let transport = link(&[]).close().unwrap();
        assert!(!transport.is_open());
    }
}
