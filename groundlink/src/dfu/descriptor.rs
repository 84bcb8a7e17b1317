//! DFU functional descriptor.

use crate::error::{Error, Result};

/// bDescriptorType of the DFU functional descriptor.
pub const DFU_FUNCTIONAL_DESCRIPTOR_TYPE: u8 = 0x21;

/// Length of the DFU 1.1 functional descriptor.
pub const DFU_FUNCTIONAL_DESCRIPTOR_LEN: usize = 9;

/// Transfer size assumed when the device gives none.
pub const DEFAULT_TRANSFER_SIZE: u16 = 2048;

/// bcdDFU of DfuSe devices.
pub const DFUSE_VERSION: u16 = 0x011A;

/// Parsed DFU functional descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FunctionalDescriptor {
    /// bmAttributes
    pub attributes: u8,
    /// wDetachTimeOut in milliseconds.
    pub detach_timeout: u16,
    /// wTransferSize
    pub transfer_size: u16,
    /// bcdDFU
    pub dfu_version: u16,
}

impl Default for FunctionalDescriptor {
    fn default() -> Self {
        Self {
            attributes: Self::CAN_DOWNLOAD | Self::CAN_UPLOAD,
            detach_timeout: 255,
            transfer_size: DEFAULT_TRANSFER_SIZE,
            dfu_version: DFUSE_VERSION,
        }
    }
}

impl FunctionalDescriptor {
    /// bitCanDnload
    pub const CAN_DOWNLOAD: u8 = 0x01;
    /// bitCanUpload
    pub const CAN_UPLOAD: u8 = 0x02;
    /// bitManifestationTolerant
    pub const MANIFESTATION_TOLERANT: u8 = 0x04;
    /// bitWillDetach
    pub const WILL_DETACH: u8 = 0x08;

    /// Parse a descriptor starting at `data[0]` (bLength).
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < DFU_FUNCTIONAL_DESCRIPTOR_LEN {
            return Err(Error::Protocol(format!(
                "DFU functional descriptor is {} bytes, expected {DFU_FUNCTIONAL_DESCRIPTOR_LEN}",
                data.len()
            )));
        }
        if data[1] != DFU_FUNCTIONAL_DESCRIPTOR_TYPE {
            return Err(Error::Protocol(format!(
                "descriptor type 0x{:02X} is not a DFU functional descriptor",
                data[1]
            )));
        }
        Ok(Self {
            attributes: data[2],
            detach_timeout: u16::from_le_bytes([data[3], data[4]]),
            transfer_size: u16::from_le_bytes([data[5], data[6]]),
            dfu_version: u16::from_le_bytes([data[7], data[8]]),
        })
    }

    /// Scan the extra bytes of an interface descriptor for the functional
    /// descriptor.
    pub fn find_in(extra: &[u8]) -> Option<Self> {
        let mut rest = extra;
        while rest.len() >= 2 {
            let len = usize::from(rest[0]);
            if len < 2 || len > rest.len() {
                return None;
            }
            if rest[1] == DFU_FUNCTIONAL_DESCRIPTOR_TYPE {
                return Self::parse(&rest[..len]).ok();
            }
            rest = &rest[len..];
        }
        None
    }

    /// Transfer size to use, falling back to the default for a zero field.
    pub fn effective_transfer_size(&self) -> u16 {
        if self.transfer_size == 0 {
            DEFAULT_TRANSFER_SIZE
        } else {
            self.transfer_size
        }
    }

    /// Whether the device will detach by itself.
    pub fn will_detach(&self) -> bool {
        self.attributes & Self::WILL_DETACH != 0
    }

    /// Whether the device accepts UPLOAD.
    pub fn can_upload(&self) -> bool {
        self.attributes & Self::CAN_UPLOAD != 0
    }

    /// Whether this is an ST DfuSe device.
    pub fn is_dfuse(&self) -> bool {
        self.dfu_version == DFUSE_VERSION
    }
}
