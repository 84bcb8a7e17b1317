//! Wire protocols spoken over a flight-controller link.

pub mod crc;
pub mod mavlink;
pub mod msp;

pub use msp::{MspDecoder, MspDirection, MspFrame, MspVersion, build_msp_request};
