//! DfuSe memory layout strings.
//!
//! The interface string of a DfuSe alternate setting describes its memory:
//!
//! ```text
//! @Internal Flash  /0x08000000/04*016Kg,01*064Kg,07*128Kg
//!  ^name            ^base      ^count*size unit flags
//! ```
//!
//! Several `/base/list` pairs may follow the name. The unit is ` `, `B`,
//! `K` or `M`; the flag letter `a`..`g` encodes readable (1), erasable (2)
//! and writable (4) as `letter - 'a' + 1`.

use crate::error::{Error, Result};

const FLAG_READABLE: u8 = 1;
const FLAG_ERASABLE: u8 = 2;
const FLAG_WRITABLE: u8 = 4;

/// A run of equally sized sectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MemorySector {
    /// Address of the first sector in the run.
    pub start: u32,
    /// Size of one sector in bytes.
    pub size: u32,
    /// Number of sectors in the run.
    pub count: u32,
    /// Readable via UPLOAD.
    pub readable: bool,
    /// Erasable via the DfuSe erase command.
    pub erasable: bool,
    /// Writable via DNLOAD.
    pub writable: bool,
}

impl MemorySector {
    /// One past the last byte of the run.
    pub fn end(&self) -> u64 {
        u64::from(self.start) + u64::from(self.size) * u64::from(self.count)
    }

    /// Whether `address` lies in this run.
    pub fn contains(&self, address: u32) -> bool {
        address >= self.start && u64::from(address) < self.end()
    }

    /// Start address of the sector holding `address`.
    pub fn sector_start(&self, address: u32) -> Option<u32> {
        if !self.contains(address) || self.size == 0 {
            return None;
        }
        let index = (address - self.start) / self.size;
        Some(self.start + index * self.size)
    }
}

/// Parsed memory map of one alternate setting.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MemoryLayout {
    /// Region name, e.g. `Internal Flash`.
    pub name: String,
    /// Sector runs in address order.
    pub sectors: Vec<MemorySector>,
}

impl MemoryLayout {
    /// Parse an interface string.
    pub fn parse(descriptor: &str) -> Result<Self> {
        let body = descriptor
            .trim()
            .strip_prefix('@')
            .ok_or_else(|| Error::MemoryLayout(format!("'{descriptor}' does not start with '@'")))?;

        let mut parts = body.split('/');
        let name = parts.next().unwrap_or_default().trim().to_string();

        let mut sectors = Vec::new();
        loop {
            let Some(base) = parts.next() else { break };
            let base = base.trim();
            if base.is_empty() {
                continue;
            }
            let mut start = parse_address(base)?;
            let list = parts
                .next()
                .ok_or_else(|| Error::MemoryLayout(format!("address {base} has no sector list")))?;

            for group in list.split(',').filter(|g| !g.trim().is_empty()) {
                let sector = parse_group(group, start)?;
                let span = u64::from(sector.size) * u64::from(sector.count);
                start = u32::try_from(u64::from(start) + span).map_err(|_| {
                    Error::MemoryLayout(format!("sector list '{list}' runs past 4 GiB"))
                })?;
                sectors.push(sector);
            }
        }

        if sectors.is_empty() {
            return Err(Error::MemoryLayout(format!("'{descriptor}' lists no sectors")));
        }
        Ok(Self { name, sectors })
    }

    /// Sector run holding `address`.
    pub fn find(&self, address: u32) -> Option<&MemorySector> {
        self.sectors.iter().find(|s| s.contains(address))
    }

    /// Start addresses of every erasable sector that `[start, start + len)` touches.
    ///
    /// Fails if any byte of the range is outside the layout or not writable.
    pub fn sectors_to_erase(&self, start: u32, len: usize) -> Result<Vec<u32>> {
        if len == 0 {
            return Ok(Vec::new());
        }
        let end = u64::from(start) + len as u64;
        let mut pages = Vec::new();
        let mut cursor = u64::from(start);

        while cursor < end {
            let address = u32::try_from(cursor)
                .map_err(|_| Error::MemoryLayout(format!("range ends past 4 GiB ({end:#x})")))?;
            let run = self.find(address).ok_or_else(|| {
                Error::MemoryLayout(format!("address {address:#010x} is outside '{}'", self.name))
            })?;
            if !run.writable {
                return Err(Error::MemoryLayout(format!(
                    "address {address:#010x} is not writable"
                )));
            }
            let page = run.sector_start(address).unwrap_or(address);
            if run.erasable && pages.last() != Some(&page) {
                pages.push(page);
            }
            cursor = u64::from(page) + u64::from(run.size.max(1));
        }
        Ok(pages)
    }

    /// Total bytes described.
    pub fn total_size(&self) -> u64 {
        self.sectors
            .iter()
            .map(|s| u64::from(s.size) * u64::from(s.count))
            .sum()
    }
}

fn parse_address(s: &str) -> Result<u32> {
    let hex = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .ok_or_else(|| Error::MemoryLayout(format!("address '{s}' is not hex")))?;
    u32::from_str_radix(hex, 16).map_err(|_| Error::MemoryLayout(format!("bad address '{s}'")))
}

/// Parse `NN*SSS<unit><flags>`.
fn parse_group(group: &str, start: u32) -> Result<MemorySector> {
    let bad = || Error::MemoryLayout(format!("bad sector group '{group}'"));

    let (count, rest) = group.trim_start().split_once('*').ok_or_else(bad)?;
    let count: u32 = count.trim().parse().map_err(|_| bad())?;

    let digits_end = rest
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(bad)?;
    let size: u32 = rest[..digits_end].parse().map_err(|_| bad())?;

    let mut tail = rest[digits_end..].chars();
    let unit = tail.next().ok_or_else(bad)?;
    let multiplier = match unit {
        ' ' | 'B' => 1,
        'K' => 1024,
        'M' => 1024 * 1024,
        _ => return Err(bad()),
    };
    let flag = tail.next().ok_or_else(bad)?;
    if !('a'..='g').contains(&flag) {
        return Err(bad());
    }
    let bits = (flag as u8) - b'a' + 1;

    Ok(MemorySector {
        start,
        size: size.checked_mul(multiplier).ok_or_else(bad)?,
        count,
        readable: bits & FLAG_READABLE != 0,
        erasable: bits & FLAG_ERASABLE != 0,
        writable: bits & FLAG_WRITABLE != 0,
    })
}
