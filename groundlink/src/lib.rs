//! # groundlink
//!
//! Ground-station plumbing for flight controllers.
//!
//! This crate speaks to autopilots over serial, UDP and TCP links and to
//! STM32 bootloaders over USB DFU:
//!
//! - MAVLink v1/v2 stream parsing, framing and message signing
//! - MSP v1/v2 request building and response decoding
//! - Serial, UDP and TCP transports with a single-subscriber dispatcher
//! - USB DFU 1.1 with DfuSe extensions and an STM32 flash sequence
//! - Intel HEX, DfuSe and raw binary firmware images
//!
//! ## Features
//!
//! - `native` (default): serial port support via the `serialport` crate
//! - `usb` (default): USB DFU host via `rusb`
//! - `serde`: Serialization support for data types
//!
//! ## Example
//!
//! ```rust,no_run
//! use groundlink::{FirmwareImage, FlashOptions, RusbHost, Stm32Flasher};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let image = FirmwareImage::from_file("firmware.hex")?;
//!
//!     let host = RusbHost::new()?;
//!     let mut flasher = Stm32Flasher::connect_first(host, FlashOptions::default())?;
//!     let report = flasher.flash(&image, &mut |progress| {
//!         println!("{}: {}%", progress.phase, progress.percent);
//!     })?;
//!     println!("Wrote {} bytes", report.bytes_written);
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

use std::sync::{Arc, OnceLock};

pub mod device;
pub mod dfu;
pub mod error;
pub mod image;
pub mod link;
pub mod protocol;
pub mod transport;

static INTERRUPT_CHECKER: OnceLock<Arc<dyn Fn() -> bool + Send + Sync>> = OnceLock::new();

/// Register a global interruption checker used by long-running library loops.
///
/// The checker should return `true` when the current operation should stop
/// (for example after receiving Ctrl-C in CLI applications).
pub fn set_interrupt_checker<F>(checker: F)
where
    F: Fn() -> bool + Send + Sync + 'static,
{
    let _ = INTERRUPT_CHECKER.set(Arc::new(checker));
}

/// Returns whether interruption was requested by the embedding application.
#[must_use]
pub fn is_interrupted_requested() -> bool {
    INTERRUPT_CHECKER
        .get()
        .is_some_and(|checker| checker())
}

#[cfg(test)]
pub(crate) fn test_set_interrupted(value: bool) {
    use std::sync::atomic::{AtomicBool, Ordering};

    static TEST_INTERRUPT_FLAG: OnceLock<Arc<AtomicBool>> = OnceLock::new();

    let flag = TEST_INTERRUPT_FLAG
        .get_or_init(|| {
            let shared = Arc::new(AtomicBool::new(false));
            let checker = Arc::clone(&shared);
            set_interrupt_checker(move || checker.load(Ordering::Relaxed));
            shared
        })
        .clone();

    flag.store(value, Ordering::Relaxed);
}

/// Serializes tests that toggle or observe the global interrupt flag.
#[cfg(test)]
pub(crate) fn interrupt_test_lock() -> std::sync::MutexGuard<'static, ()> {
    use std::sync::{Mutex, PoisonError};

    static LOCK: Mutex<()> = Mutex::new(());
    LOCK.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(feature = "usb")]
pub use dfu::{RusbBackend, RusbHost};
pub use {
    device::{DetectedPort, DeviceKind, ProtocolHint, auto_detect_port, detect_ports},
    dfu::{
        DfuDevice, DfuDeviceInfo, DfuHost, DfuState, DfuStatus, EraseMethod, FlashOptions,
        FlashPhase, FlashProgress, FlashReport, MemoryLayout, Stm32Flasher,
    },
    error::{Error, Result},
    image::{FirmwareImage, ImageFormat, Segment},
    link::{Link, LinkEvent},
    protocol::{
        mavlink::{FrameBuilder, MavlinkPacket, MavlinkParser, MessageRegistry, Signer},
        msp::{MspDecoder, MspFrame},
    },
    transport::{Endpoint, Transport, TransportConfig, TransportDispatcher},
};
