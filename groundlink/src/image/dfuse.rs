//! ST DfuSe file container.
//!
//! ```text
//! +--------------------------+
//! | Prefix (11B)             |  "DfuSe", version, image size, target count
//! +--------------------------+
//! | Target prefix (274B)     |  "Target", alt setting, name, size, elements
//! |   Element (8B + data)    |  address, size, data
//! |   ...                    |
//! +--------------------------+
//! | ...more targets          |
//! +--------------------------+
//! | Suffix (16B)             |  bcdDevice, PID, VID, bcdDFU, "UFD", len, CRC
//! +--------------------------+
//! ```
//!
//! The suffix CRC covers every byte before it and is stored without the
//! final inversion.

use std::io::{Cursor, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use log::debug;

use crate::dfu::descriptor::DFUSE_VERSION;
use crate::error::{Error, Result};
use crate::image::{FirmwareImage, ImageFormat, Segment};
use crate::protocol::crc::dfu_crc32;

/// File signature.
pub const PREFIX_SIGNATURE: &[u8] = b"DfuSe";
/// Target signature.
pub const TARGET_SIGNATURE: &[u8] = b"Target";
/// Suffix signature as stored (reversed "DFU").
pub const SUFFIX_SIGNATURE: &[u8] = b"UFD";

/// Prefix length.
pub const PREFIX_LEN: usize = 11;
/// Target prefix length.
pub const TARGET_PREFIX_LEN: usize = 274;
/// Element header length.
pub const ELEMENT_HEADER_LEN: usize = 8;
/// Suffix length.
pub const SUFFIX_LEN: usize = 16;

const TARGET_NAME_LEN: usize = 255;

/// DFU suffix fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DfuSuffix {
    /// bcdDevice
    pub device: u16,
    /// idProduct
    pub product: u16,
    /// idVendor
    pub vendor: u16,
    /// bcdDFU
    pub dfu_version: u16,
}

impl Default for DfuSuffix {
    fn default() -> Self {
        Self {
            device: 0xFFFF,
            product: 0xDF11,
            vendor: 0x0483,
            dfu_version: DFUSE_VERSION,
        }
    }
}

/// One target (alternate setting) in the file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DfuSeTarget {
    /// Alternate setting the elements belong to.
    pub alt_setting: u8,
    /// Target name, when flagged as named.
    pub name: Option<String>,
    /// Elements in file order.
    pub elements: Vec<Segment>,
}

/// Parsed DfuSe file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DfuSeFile {
    /// bVersion from the prefix.
    pub version: u8,
    /// Targets in file order.
    pub targets: Vec<DfuSeTarget>,
    /// Suffix fields.
    pub suffix: DfuSuffix,
}

fn invalid(msg: impl Into<String>) -> Error {
    Error::InvalidImage(msg.into())
}

impl DfuSeFile {
    /// Parse and CRC-check a complete file.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < PREFIX_LEN + SUFFIX_LEN {
            return Err(invalid("DfuSe file too small"));
        }
        if !data.starts_with(PREFIX_SIGNATURE) {
            return Err(invalid("missing DfuSe signature"));
        }

        let (body, suffix_bytes) = data.split_at(data.len() - SUFFIX_LEN);
        if &suffix_bytes[8..11] != SUFFIX_SIGNATURE {
            return Err(invalid("missing DFU suffix signature"));
        }
        if usize::from(suffix_bytes[11]) != SUFFIX_LEN {
            return Err(invalid(format!("DFU suffix length {} is not 16", suffix_bytes[11])));
        }

        let mut suffix = Cursor::new(suffix_bytes);
        let device = suffix.read_u16::<LittleEndian>()?;
        let product = suffix.read_u16::<LittleEndian>()?;
        let vendor = suffix.read_u16::<LittleEndian>()?;
        let dfu_version = suffix.read_u16::<LittleEndian>()?;
        suffix.set_position(12);
        let stored_crc = suffix.read_u32::<LittleEndian>()?;

        let computed = dfu_crc32(&data[..data.len() - 4]);
        if computed != stored_crc {
            return Err(invalid(format!(
                "DFU suffix CRC mismatch: stored {stored_crc:#010x}, computed {computed:#010x}"
            )));
        }

        let mut cursor = Cursor::new(body);
        cursor.set_position(PREFIX_SIGNATURE.len() as u64);
        let version = cursor.read_u8()?;
        let image_size = cursor.read_u32::<LittleEndian>()? as usize;
        let target_count = cursor.read_u8()?;
        if image_size != body.len() {
            debug!(
                "DfuSe prefix size {image_size} differs from body size {}",
                body.len()
            );
        }

        let mut targets = Vec::with_capacity(usize::from(target_count));
        for index in 0..target_count {
            targets.push(read_target(&mut cursor, index)?);
        }

        debug!(
            "DfuSe v{version}: {} target(s), VID {vendor:04X} PID {product:04X}",
            targets.len()
        );
        Ok(Self {
            version,
            targets,
            suffix: DfuSuffix {
                device,
                product,
                vendor,
                dfu_version,
            },
        })
    }

    /// Flatten every target's elements into one image.
    pub fn into_image(self) -> Result<FirmwareImage> {
        let segments = self
            .targets
            .into_iter()
            .flat_map(|t| t.elements)
            .collect();
        FirmwareImage::new(ImageFormat::DfuSe, segments, None)
    }

    /// Serialize with a fresh suffix CRC.
    #[allow(clippy::unwrap_used, clippy::cast_possible_truncation)] // Writing to Vec<u8> cannot fail
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        out.extend_from_slice(PREFIX_SIGNATURE);
        out.write_u8(self.version).unwrap();
        out.write_u32::<LittleEndian>(0).unwrap();
        let count = u8::try_from(self.targets.len())
            .map_err(|_| invalid("a DfuSe file holds at most 255 targets"))?;
        out.write_u8(count).unwrap();

        for target in &self.targets {
            out.extend_from_slice(TARGET_SIGNATURE);
            out.write_u8(target.alt_setting).unwrap();
            out.write_u32::<LittleEndian>(u32::from(target.name.is_some())).unwrap();
            let mut name = [0u8; TARGET_NAME_LEN];
            if let Some(n) = &target.name {
                let bytes = n.as_bytes();
                let len = bytes.len().min(TARGET_NAME_LEN - 1);
                name[..len].copy_from_slice(&bytes[..len]);
            }
            out.write_all(&name).unwrap();

            let size: usize = target
                .elements
                .iter()
                .map(|e| ELEMENT_HEADER_LEN + e.data.len())
                .sum();
            let size = u32::try_from(size).map_err(|_| invalid("target exceeds 4 GiB"))?;
            let elements = u32::try_from(target.elements.len())
                .map_err(|_| invalid("too many elements"))?;
            out.write_u32::<LittleEndian>(size).unwrap();
            out.write_u32::<LittleEndian>(elements).unwrap();

            for element in &target.elements {
                out.write_u32::<LittleEndian>(element.address).unwrap();
                out.write_u32::<LittleEndian>(element.data.len() as u32).unwrap();
                out.extend_from_slice(&element.data);
            }
        }

        let image_size = u32::try_from(out.len()).map_err(|_| invalid("file exceeds 4 GiB"))?;
        out[6..10].copy_from_slice(&image_size.to_le_bytes());

        out.write_u16::<LittleEndian>(self.suffix.device).unwrap();
        out.write_u16::<LittleEndian>(self.suffix.product).unwrap();
        out.write_u16::<LittleEndian>(self.suffix.vendor).unwrap();
        out.write_u16::<LittleEndian>(self.suffix.dfu_version).unwrap();
        out.extend_from_slice(SUFFIX_SIGNATURE);
        out.write_u8(SUFFIX_LEN as u8).unwrap();
        let crc = dfu_crc32(&out);
        out.write_u32::<LittleEndian>(crc).unwrap();
        Ok(out)
    }
}

fn read_target(cursor: &mut Cursor<&[u8]>, index: u8) -> Result<DfuSeTarget> {
    let truncated = |_| invalid(format!("target {index} is truncated"));

    let mut signature = [0u8; 6];
    cursor.read_exact(&mut signature).map_err(truncated)?;
    if signature != TARGET_SIGNATURE {
        return Err(invalid(format!("target {index} has no 'Target' signature")));
    }
    let alt_setting = cursor.read_u8().map_err(truncated)?;
    let named = cursor.read_u32::<LittleEndian>().map_err(truncated)? != 0;
    let mut raw_name = [0u8; TARGET_NAME_LEN];
    cursor.read_exact(&mut raw_name).map_err(truncated)?;
    let _target_size = cursor.read_u32::<LittleEndian>().map_err(truncated)?;
    let element_count = cursor.read_u32::<LittleEndian>().map_err(truncated)?;

    let name = named.then(|| {
        let end = raw_name.iter().position(|&b| b == 0).unwrap_or(raw_name.len());
        String::from_utf8_lossy(&raw_name[..end]).into_owned()
    });

    let mut elements = Vec::new();
    for e in 0..element_count {
        let address = cursor.read_u32::<LittleEndian>().map_err(truncated)?;
        let size = cursor.read_u32::<LittleEndian>().map_err(truncated)? as usize;
        let remaining = cursor.get_ref().len() - cursor.position() as usize;
        if size > remaining {
            return Err(invalid(format!(
                "element {e} of target {index} claims {size} bytes, {remaining} left"
            )));
        }
        let mut data = vec![0u8; size];
        cursor.read_exact(&mut data).map_err(truncated)?;
        elements.push(Segment::new(address, data));
    }

    Ok(DfuSeTarget {
        alt_setting,
        name,
        elements,
    })
}
