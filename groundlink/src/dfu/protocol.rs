//! DFU 1.1 class requests and the DfuSe command set.
//!
//! DfuSe commands travel as DNLOAD requests with `wValue = 0`:
//!
//! ```text
//! +------+---------------------+
//! | 0x21 | address (u32 LE)    |  Set Address Pointer
//! | 0x41 | address (u32 LE)    |  Erase page
//! | 0x41 |                     |  Mass erase
//! | 0x92 |                     |  Read Unprotect
//! +------+---------------------+
//! ```
//!
//! Data blocks use `wValue = block + 2` and land at
//! `address_pointer + block * transfer_size`.

use std::fmt;
use std::time::Duration;

use crate::error::{Error, Result};

/// bmRequestType for host-to-device class requests on an interface.
pub const REQUEST_TYPE_OUT: u8 = 0x21;

/// bmRequestType for device-to-host class requests on an interface.
pub const REQUEST_TYPE_IN: u8 = 0xA1;

/// Length of a GETSTATUS reply.
pub const STATUS_LEN: usize = 6;

/// First wValue used for DfuSe data blocks.
pub const DFUSE_DATA_BLOCK_OFFSET: u16 = 2;

/// DFU class request codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DfuRequest {
    /// DFU_DETACH
    Detach = 0,
    /// DFU_DNLOAD
    Dnload = 1,
    /// DFU_UPLOAD
    Upload = 2,
    /// DFU_GETSTATUS
    GetStatus = 3,
    /// DFU_CLRSTATUS
    ClrStatus = 4,
    /// DFU_GETSTATE
    GetState = 5,
    /// DFU_ABORT
    Abort = 6,
}

impl DfuRequest {
    /// bRequest value.
    pub fn code(self) -> u8 {
        self as u8
    }
}

/// Device state reported in bState.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum DfuState {
    /// appIDLE
    AppIdle,
    /// appDETACH
    AppDetach,
    /// dfuIDLE
    DfuIdle,
    /// dfuDNLOAD-SYNC
    DnloadSync,
    /// dfuDNBUSY
    DnBusy,
    /// dfuDNLOAD-IDLE
    DnloadIdle,
    /// dfuMANIFEST-SYNC
    ManifestSync,
    /// dfuMANIFEST
    Manifest,
    /// dfuMANIFEST-WAIT-RESET
    ManifestWaitReset,
    /// dfuUPLOAD-IDLE
    UploadIdle,
    /// dfuERROR
    Error,
    /// Value outside the DFU 1.1 table.
    Unknown(u8),
}

impl From<u8> for DfuState {
    fn from(v: u8) -> Self {
        match v {
            0 => Self::AppIdle,
            1 => Self::AppDetach,
            2 => Self::DfuIdle,
            3 => Self::DnloadSync,
            4 => Self::DnBusy,
            5 => Self::DnloadIdle,
            6 => Self::ManifestSync,
            7 => Self::Manifest,
            8 => Self::ManifestWaitReset,
            9 => Self::UploadIdle,
            10 => Self::Error,
            other => Self::Unknown(other),
        }
    }
}

impl DfuState {
    /// Raw bState value.
    pub fn as_u8(self) -> u8 {
        match self {
            Self::AppIdle => 0,
            Self::AppDetach => 1,
            Self::DfuIdle => 2,
            Self::DnloadSync => 3,
            Self::DnBusy => 4,
            Self::DnloadIdle => 5,
            Self::ManifestSync => 6,
            Self::Manifest => 7,
            Self::ManifestWaitReset => 8,
            Self::UploadIdle => 9,
            Self::Error => 10,
            Self::Unknown(v) => v,
        }
    }
}

impl fmt::Display for DfuState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AppIdle => f.write_str("appIDLE"),
            Self::AppDetach => f.write_str("appDETACH"),
            Self::DfuIdle => f.write_str("dfuIDLE"),
            Self::DnloadSync => f.write_str("dfuDNLOAD-SYNC"),
            Self::DnBusy => f.write_str("dfuDNBUSY"),
            Self::DnloadIdle => f.write_str("dfuDNLOAD-IDLE"),
            Self::ManifestSync => f.write_str("dfuMANIFEST-SYNC"),
            Self::Manifest => f.write_str("dfuMANIFEST"),
            Self::ManifestWaitReset => f.write_str("dfuMANIFEST-WAIT-RESET"),
            Self::UploadIdle => f.write_str("dfuUPLOAD-IDLE"),
            Self::Error => f.write_str("dfuERROR"),
            Self::Unknown(v) => write!(f, "state {v}"),
        }
    }
}

/// Status code reported in bStatus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum DfuStatusCode {
    /// No error.
    Ok,
    /// File is not targeted for this device.
    ErrTarget,
    /// File fails a vendor-specific verification.
    ErrFile,
    /// Unable to write memory.
    ErrWrite,
    /// Memory erase failed.
    ErrErase,
    /// Memory erase check failed.
    ErrCheckErased,
    /// Program memory function failed.
    ErrProg,
    /// Programmed memory failed verification.
    ErrVerify,
    /// Address out of range.
    ErrAddress,
    /// Received zero-length DNLOAD but the device expects more data.
    ErrNotDone,
    /// Firmware is corrupt.
    ErrFirmware,
    /// Vendor-specific error.
    ErrVendor,
    /// Unexpected USB reset.
    ErrUsbr,
    /// Unexpected power-on reset.
    ErrPor,
    /// Unknown error.
    ErrUnknown,
    /// Unexpected request.
    ErrStalledPkt,
    /// Value outside the DFU 1.1 table.
    Other(u8),
}

impl From<u8> for DfuStatusCode {
    fn from(v: u8) -> Self {
        match v {
            0x00 => Self::Ok,
            0x01 => Self::ErrTarget,
            0x02 => Self::ErrFile,
            0x03 => Self::ErrWrite,
            0x04 => Self::ErrErase,
            0x05 => Self::ErrCheckErased,
            0x06 => Self::ErrProg,
            0x07 => Self::ErrVerify,
            0x08 => Self::ErrAddress,
            0x09 => Self::ErrNotDone,
            0x0A => Self::ErrFirmware,
            0x0B => Self::ErrVendor,
            0x0C => Self::ErrUsbr,
            0x0D => Self::ErrPor,
            0x0E => Self::ErrUnknown,
            0x0F => Self::ErrStalledPkt,
            other => Self::Other(other),
        }
    }
}

impl DfuStatusCode {
    /// Raw bStatus value.
    pub fn as_u8(self) -> u8 {
        match self {
            Self::Ok => 0x00,
            Self::ErrTarget => 0x01,
            Self::ErrFile => 0x02,
            Self::ErrWrite => 0x03,
            Self::ErrErase => 0x04,
            Self::ErrCheckErased => 0x05,
            Self::ErrProg => 0x06,
            Self::ErrVerify => 0x07,
            Self::ErrAddress => 0x08,
            Self::ErrNotDone => 0x09,
            Self::ErrFirmware => 0x0A,
            Self::ErrVendor => 0x0B,
            Self::ErrUsbr => 0x0C,
            Self::ErrPor => 0x0D,
            Self::ErrUnknown => 0x0E,
            Self::ErrStalledPkt => 0x0F,
            Self::Other(v) => v,
        }
    }
}

impl fmt::Display for DfuStatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Ok => "OK",
            Self::ErrTarget => "errTARGET",
            Self::ErrFile => "errFILE",
            Self::ErrWrite => "errWRITE",
            Self::ErrErase => "errERASE",
            Self::ErrCheckErased => "errCHECK_ERASED",
            Self::ErrProg => "errPROG",
            Self::ErrVerify => "errVERIFY",
            Self::ErrAddress => "errADDRESS",
            Self::ErrNotDone => "errNOTDONE",
            Self::ErrFirmware => "errFIRMWARE",
            Self::ErrVendor => "errVENDOR",
            Self::ErrUsbr => "errUSBR",
            Self::ErrPor => "errPOR",
            Self::ErrUnknown => "errUNKNOWN",
            Self::ErrStalledPkt => "errSTALLEDPKT",
            Self::Other(v) => return write!(f, "status 0x{v:02X}"),
        };
        f.write_str(text)
    }
}

/// Parsed GETSTATUS reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DfuStatus {
    /// bStatus
    pub status: DfuStatusCode,
    /// bwPollTimeout: how long to wait before the next GETSTATUS.
    pub poll_timeout: Duration,
    /// bState
    pub state: DfuState,
    /// iString
    pub string_index: u8,
}

impl DfuStatus {
    /// Parse the 6-byte GETSTATUS payload.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < STATUS_LEN {
            return Err(Error::Protocol(format!(
                "GETSTATUS returned {} bytes, expected {STATUS_LEN}",
                data.len()
            )));
        }
        let poll_ms = u32::from_le_bytes([data[1], data[2], data[3], 0]);
        Ok(Self {
            status: DfuStatusCode::from(data[0]),
            poll_timeout: Duration::from_millis(u64::from(poll_ms)),
            state: DfuState::from(data[4]),
            string_index: data[5],
        })
    }

    /// Encode back to the 6-byte wire form.
    #[allow(clippy::cast_possible_truncation)]
    pub fn to_bytes(&self) -> [u8; STATUS_LEN] {
        let ms = (self.poll_timeout.as_millis().min(0x00FF_FFFF) as u32).to_le_bytes();
        [
            self.status.as_u8(),
            ms[0],
            ms[1],
            ms[2],
            self.state.as_u8(),
            self.string_index,
        ]
    }

    /// Whether the status byte is OK.
    pub fn is_ok(&self) -> bool {
        self.status == DfuStatusCode::Ok
    }

    /// Turn a non-OK status into an error.
    pub fn check(self) -> Result<Self> {
        if self.is_ok() && self.state != DfuState::Error {
            Ok(self)
        } else {
            Err(Error::DfuStatus {
                status: self.status,
                state: self.state,
            })
        }
    }
}

/// DfuSe command opcodes.
pub mod dfuse {
    /// Set Address Pointer.
    pub const SET_ADDRESS: u8 = 0x21;
    /// Erase (page with address, mass without).
    pub const ERASE: u8 = 0x41;
    /// Read Unprotect.
    pub const READ_UNPROTECT: u8 = 0x92;
    /// Get Commands.
    pub const GET_COMMANDS: u8 = 0x00;
}

/// DfuSe Set Address Pointer command.
pub fn set_address_command(address: u32) -> [u8; 5] {
    let a = address.to_le_bytes();
    [dfuse::SET_ADDRESS, a[0], a[1], a[2], a[3]]
}

/// DfuSe page erase command.
pub fn erase_page_command(address: u32) -> [u8; 5] {
    let a = address.to_le_bytes();
    [dfuse::ERASE, a[0], a[1], a[2], a[3]]
}

/// DfuSe mass erase command.
pub fn mass_erase_command() -> [u8; 1] {
    [dfuse::ERASE]
}

/// DfuSe read-unprotect command.
pub fn read_unprotect_command() -> [u8; 1] {
    [dfuse::READ_UNPROTECT]
}

/// wValue for the DfuSe data block `block`.
pub fn data_block_value(block: u16) -> Result<u16> {
    block
        .checked_add(DFUSE_DATA_BLOCK_OFFSET)
        .ok_or_else(|| Error::Protocol(format!("block {block} exceeds the DfuSe block range")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_parse() {
        let status = DfuStatus::parse(&[0x00, 0x64, 0x00, 0x00, 0x05, 0x00]).unwrap();
        assert!(status.is_ok());
        assert_eq!(status.poll_timeout, Duration::from_millis(100));
        assert_eq!(status.state, DfuState::DnloadIdle);
        assert_eq!(status.to_bytes(), [0x00, 0x64, 0x00, 0x00, 0x05, 0x00]);
    }

    #[test]
    fn test_status_poll_timeout_is_24_bit() {
        let status = DfuStatus::parse(&[0x00, 0x01, 0x02, 0x03, 0x04, 0x00]).unwrap();
        assert_eq!(status.poll_timeout, Duration::from_millis(0x03_0201));
        assert_eq!(status.state, DfuState::DnBusy);
    }

    #[test]
    fn test_status_check() {
        let err = DfuStatus::parse(&[0x0A, 0, 0, 0, 10, 0]).unwrap().check().unwrap_err();
        match err {
            Error::DfuStatus { status, state } => {
                assert_eq!(status, DfuStatusCode::ErrFirmware);
                assert_eq!(state, DfuState::Error);
            },
            other => panic!("unexpected error {other:?}"),
        }
        assert!(DfuStatus::parse(&[0, 0, 0]).is_err());
    }

    #[test]
    fn test_state_and_status_tables() {
        for v in 0..=10u8 {
            assert_eq!(DfuState::from(v).as_u8(), v);
        }
        assert_eq!(DfuState::from(42), DfuState::Unknown(42));
        for v in 0..=0x0Fu8 {
            assert_eq!(DfuStatusCode::from(v).as_u8(), v);
        }
        assert_eq!(DfuStatusCode::ErrCheckErased.to_string(), "errCHECK_ERASED");
        assert_eq!(DfuState::ManifestWaitReset.to_string(), "dfuMANIFEST-WAIT-RESET");
    }

    #[test]
    fn test_dfuse_commands() {
        assert_eq!(set_address_command(0x0800_0000), [0x21, 0x00, 0x00, 0x00, 0x08]);
        assert_eq!(erase_page_command(0x0800_4000), [0x41, 0x00, 0x40, 0x00, 0x08]);
        assert_eq!(mass_erase_command(), [0x41]);
        assert_eq!(read_unprotect_command(), [0x92]);
        assert_eq!(data_block_value(0).unwrap(), 2);
        assert!(data_block_value(u16::MAX).is_err());
    }

    #[test]
    fn test_request_codes() {
        assert_eq!(DfuRequest::Detach.code(), 0);
        assert_eq!(DfuRequest::GetStatus.code(), 3);
        assert_eq!(DfuRequest::Abort.code(), 6);
    }
}
