//! Firmware images.
//!
//! A [`FirmwareImage`] is a list of non-overlapping segments to write, plus
//! an optional entry point. Three container formats are loaded:
//!
//! - DfuSe `.dfu` files ([`dfuse`]), possibly multi-target
//! - Intel HEX ([`ihex`])
//! - raw binaries, placed at a base address ([`DEFAULT_BASE_ADDRESS`])

pub mod dfuse;
pub mod ihex;

use std::fmt;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use log::debug;

use crate::error::{Error, Result};

/// Base address of STM32 internal flash, used for raw binaries.
pub const DEFAULT_BASE_ADDRESS: u32 = 0x0800_0000;

/// Container format an image was loaded from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ImageFormat {
    /// ST DfuSe container.
    DfuSe,
    /// Intel HEX text.
    IntelHex,
    /// Raw binary.
    Binary,
}

impl ImageFormat {
    /// Pick a format from file content, falling back to the extension.
    pub fn sniff(data: &[u8], extension: Option<&str>) -> Self {
        if data.starts_with(dfuse::PREFIX_SIGNATURE) {
            return Self::DfuSe;
        }
        let ext = extension.map(str::to_ascii_lowercase);
        match ext.as_deref() {
            Some("dfu") => return Self::DfuSe,
            Some("hex" | "ihex" | "ihx") => return Self::IntelHex,
            Some("bin") => return Self::Binary,
            _ => {},
        }
        let looks_like_hex = data
            .iter()
            .find(|b| !b.is_ascii_whitespace())
            .is_some_and(|&b| b == b':')
            && data.iter().all(|b| b.is_ascii_hexdigit() || b.is_ascii_whitespace() || *b == b':');
        if looks_like_hex { Self::IntelHex } else { Self::Binary }
    }
}

impl fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::DfuSe => "DfuSe",
            Self::IntelHex => "Intel HEX",
            Self::Binary => "binary",
        })
    }
}

/// Contiguous bytes at a flash address.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Segment {
    /// Load address.
    pub address: u32,
    /// Bytes to write.
    pub data: Vec<u8>,
}

impl Segment {
    /// Create a segment.
    pub fn new(address: u32, data: Vec<u8>) -> Self {
        Self { address, data }
    }

    /// One past the last byte.
    pub fn end(&self) -> u64 {
        u64::from(self.address) + self.data.len() as u64
    }

    /// Length in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the segment holds no data.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Parsed firmware, ready to flash.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FirmwareImage {
    format: ImageFormat,
    segments: Vec<Segment>,
    entry_point: Option<u32>,
}

impl FirmwareImage {
    /// Build an image from segments.
    ///
    /// Empty segments are dropped and the rest sorted by address. Fails if
    /// nothing is left, if segments overlap, or if one runs past 4 GiB.
    pub fn new(format: ImageFormat, segments: Vec<Segment>, entry_point: Option<u32>) -> Result<Self> {
        let mut segments: Vec<Segment> = segments.into_iter().filter(|s| !s.is_empty()).collect();
        if segments.is_empty() {
            return Err(Error::InvalidImage("image contains no data".into()));
        }
        segments.sort_by_key(|s| s.address);

        for pair in segments.windows(2) {
            if pair[0].end() > u64::from(pair[1].address) {
                return Err(Error::InvalidImage(format!(
                    "segments at {:#010x} and {:#010x} overlap",
                    pair[0].address, pair[1].address
                )));
            }
        }
        if let Some(last) = segments.last() {
            if last.end() > 1 << 32 {
                return Err(Error::InvalidImage(format!(
                    "segment at {:#010x} runs past the 32-bit address space",
                    last.address
                )));
            }
        }

        Ok(Self {
            format,
            segments,
            entry_point,
        })
    }

    /// Raw binary placed at `base`.
    pub fn from_binary(data: Vec<u8>, base: u32) -> Result<Self> {
        Self::new(ImageFormat::Binary, vec![Segment::new(base, data)], None)
    }

    /// Load from a file, sniffing the format.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::from_file_with_base(path, DEFAULT_BASE_ADDRESS)
    }

    /// Load from a file; raw binaries are placed at `base`.
    pub fn from_file_with_base<P: AsRef<Path>>(path: P, base: u32) -> Result<Self> {
        let path = path.as_ref();
        debug!("Loading firmware from: {}", path.display());

        let file = File::open(path)?;
        let mut reader = BufReader::new(file);
        let mut data = Vec::new();
        reader.read_to_end(&mut data)?;

        let extension = path.extension().and_then(|e| e.to_str());
        Self::from_bytes(data, extension, base)
    }

    /// Parse in-memory content. `extension` breaks ties when content is
    /// ambiguous.
    pub fn from_bytes(data: Vec<u8>, extension: Option<&str>, base: u32) -> Result<Self> {
        let format = ImageFormat::sniff(&data, extension);
        debug!("Detected {format} image ({} bytes)", data.len());
        match format {
            ImageFormat::DfuSe => dfuse::DfuSeFile::parse(&data)?.into_image(),
            ImageFormat::IntelHex => {
                let text = std::str::from_utf8(&data)
                    .map_err(|_| Error::InvalidImage("Intel HEX file is not ASCII".into()))?;
                let parsed = ihex::parse(text)?;
                Self::new(ImageFormat::IntelHex, parsed.segments, parsed.entry_point)
            },
            ImageFormat::Binary => Self::from_binary(data, base),
        }
    }

    /// Source format.
    pub fn format(&self) -> ImageFormat {
        self.format
    }

    /// Segments in address order.
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Entry point declared by the container, if any.
    pub fn entry_point(&self) -> Option<u32> {
        self.entry_point
    }

    /// Address of the lowest segment.
    pub fn start_address(&self) -> u32 {
        self.segments.first().map_or(DEFAULT_BASE_ADDRESS, |s| s.address)
    }

    /// Sum of segment lengths.
    pub fn total_size(&self) -> usize {
        self.segments.iter().map(Segment::len).sum()
    }
}

impl fmt::Display for FirmwareImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Format: {}", self.format)?;
        writeln!(f, "Segments: {}", self.segments.len())?;
        writeln!(f, "Total size: {} bytes", self.total_size())?;
        if let Some(entry) = self.entry_point {
            writeln!(f, "Entry point: {entry:#010x}")?;
        }
        for (i, s) in self.segments.iter().enumerate() {
            writeln!(
                f,
                "  [{i}] {:#010x}..{:#010x} ({} bytes)",
                s.address,
                s.end(),
                s.len()
            )?;
        }
        Ok(())
    }
}
