//! USB DFU 1.1 with ST's DfuSe extensions.
//!
//! - [`protocol`]: class requests, status/state tables, DfuSe commands
//! - [`memory`]: interface-string memory layouts
//! - [`descriptor`]: the DFU functional descriptor
//! - [`device`]: backend/host traits and the [`DfuDevice`] session
//! - [`flasher`]: the STM32 flash sequence with erase fallback
//! - `usb` (feature `usb`): the libusb host

pub mod descriptor;
pub mod device;
pub mod flasher;
pub mod memory;
pub mod protocol;
#[cfg(feature = "usb")]
pub mod usb;

#[cfg(test)]
pub(crate) mod sim;

pub use descriptor::FunctionalDescriptor;
pub use device::{DfuBackend, DfuDevice, DfuDeviceInfo, DfuHost, wait_for_device};
pub use flasher::{
    DfuTimings, EraseMethod, FlashOptions, FlashPhase, FlashProgress, FlashReport, Stm32Flasher,
};
pub use memory::{MemoryLayout, MemorySector};
pub use protocol::{DfuState, DfuStatus, DfuStatusCode};
#[cfg(feature = "usb")]
pub use usb::{RusbBackend, RusbHost};
