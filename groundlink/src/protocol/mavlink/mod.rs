//! MAVLink v1/v2 framing, signing and stream parsing.
//!
//! Message payloads are left raw; dialect-specific decoding belongs to the
//! caller. The [`registry`] supplies what framing needs per msgid.

pub mod packet;
pub mod parser;
pub mod registry;
pub mod signing;

pub use packet::{FrameBuilder, MavlinkPacket, MavlinkVersion, calculate_packet_length, parse_packet};
pub use parser::{LengthPolicy, MavlinkParser, ParseState, ParserOptions, ParserStats, SigningVerification};
pub use registry::{FieldDefinition, MessageDefinition, MessageInfo, MessageRegistry};
pub use signing::{SignatureVerifyOptions, Signer, create_signature, verify_signature};
