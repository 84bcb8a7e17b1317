//! DFU device session.
//!
//! [`DfuBackend`] is one claimed USB interface; [`DfuHost`] enumerates and
//! opens them. [`DfuDevice`] layers the DFU/DfuSe request sequences on top
//! and owns the session state (open flag, transfer size, memory layout).

use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info, trace, warn};

use crate::dfu::descriptor::{DEFAULT_TRANSFER_SIZE, FunctionalDescriptor};
use crate::dfu::memory::MemoryLayout;
use crate::dfu::protocol::{
    DfuRequest, DfuState, DfuStatus, STATUS_LEN, data_block_value, erase_page_command,
    mass_erase_command, read_unprotect_command, set_address_command,
};
use crate::error::{Error, Result};

/// USB interface class for DFU.
pub const DFU_CLASS: u8 = 0xFE;

/// USB interface subclass for DFU.
pub const DFU_SUBCLASS: u8 = 0x01;

/// Interface protocol of a device in DFU mode.
pub const DFU_MODE_PROTOCOL: u8 = 0x02;

/// ST's DFU bootloader VID:PID.
pub const STM32_DFU_VID: u16 = 0x0483;
/// ST's DFU bootloader PID.
pub const STM32_DFU_PID: u16 = 0xDF11;

/// Lower bound for the enumeration poll interval.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Default limit for a device to leave dfuDNBUSY after one command.
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(60);

/// One claimed (or claimable) DFU interface alternate setting.
pub trait DfuBackend {
    /// Claim the interface and select the alternate setting.
    fn claim(&mut self) -> Result<()>;

    /// Release the interface.
    fn release(&mut self) -> Result<()>;

    /// Class request, host to device. Returns bytes sent.
    fn control_out(&mut self, request: DfuRequest, value: u16, data: &[u8]) -> Result<usize>;

    /// Class request, device to host. Returns bytes received.
    fn control_in(&mut self, request: DfuRequest, value: u16, buf: &mut [u8]) -> Result<usize>;

    /// The alternate setting's interface string (memory layout on DfuSe).
    fn interface_string(&mut self) -> Result<Option<String>>;

    /// DFU functional descriptor, if the interface carries one.
    fn functional_descriptor(&mut self) -> Result<Option<FunctionalDescriptor>>;
}

/// Identity of one DFU alternate setting on the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DfuDeviceInfo {
    /// USB vendor id.
    pub vid: u16,
    /// USB product id.
    pub pid: u16,
    /// Bus number.
    pub bus: u8,
    /// Device address on the bus. Changes on re-enumeration.
    pub address: u8,
    /// Interface number.
    pub interface: u8,
    /// Alternate setting.
    pub alt_setting: u8,
    /// iSerialNumber string, when readable.
    pub serial: Option<String>,
    /// Interface string, when readable.
    pub alt_name: Option<String>,
}

impl DfuDeviceInfo {
    /// Whether `other` is the same target after a re-enumeration.
    ///
    /// Bus address is ignored; serial numbers must agree when both are known.
    pub fn same_target(&self, other: &Self) -> bool {
        self.vid == other.vid
            && self.pid == other.pid
            && self.interface == other.interface
            && self.alt_setting == other.alt_setting
            && match (&self.serial, &other.serial) {
                (Some(a), Some(b)) => a == b,
                _ => true,
            }
    }
}

impl std::fmt::Display for DfuDeviceInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:04x}:{:04x} bus {} addr {} alt {}",
            self.vid, self.pid, self.bus, self.address, self.alt_setting
        )?;
        if let Some(name) = &self.alt_name {
            write!(f, " \"{name}\"")?;
        }
        Ok(())
    }
}

/// Enumerates DFU interfaces and opens them.
pub trait DfuHost {
    /// Backend type produced by [`connect`](Self::connect).
    type Backend: DfuBackend;

    /// List every DFU-mode alternate setting currently attached.
    fn enumerate(&mut self) -> Result<Vec<DfuDeviceInfo>>;

    /// Open an OS handle for one alternate setting.
    fn connect(&mut self, info: &DfuDeviceInfo) -> Result<Self::Backend>;
}

/// Poll enumeration until a device matching `filter` shows up.
///
/// Polls first and sleeps afterwards. `interval` is raised to
/// [`MIN_POLL_INTERVAL`]; the last sleep is cut short at the deadline.
pub fn wait_for_device<H, F>(
    host: &mut H,
    filter: F,
    timeout: Duration,
    interval: Duration,
) -> Result<DfuDeviceInfo>
where
    H: DfuHost,
    F: Fn(&DfuDeviceInfo) -> bool,
{
    let interval = interval.max(MIN_POLL_INTERVAL);
    let deadline = Instant::now() + timeout;
    loop {
        match host.enumerate() {
            Ok(devices) => {
                if let Some(found) = devices.into_iter().find(|d| filter(d)) {
                    debug!("Found {found}");
                    return Ok(found);
                }
            },
            Err(e) => trace!("Enumeration failed while waiting: {e}"),
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(Error::DeviceNotFound);
        }
        thread::sleep(interval.min(deadline - now));
    }
}

/// One DFU alternate setting and its session state.
#[derive(Debug)]
pub struct DfuDevice<B> {
    info: DfuDeviceInfo,
    backend: Option<B>,
    is_open: bool,
    transfer_size: u16,
    memory_layout: Option<MemoryLayout>,
    functional: Option<FunctionalDescriptor>,
    busy_timeout: Duration,
}

impl<B: DfuBackend> DfuDevice<B> {
    /// Wrap an unopened backend.
    pub fn new(info: DfuDeviceInfo, backend: B) -> Self {
        Self {
            info,
            backend: Some(backend),
            is_open: false,
            transfer_size: DEFAULT_TRANSFER_SIZE,
            memory_layout: None,
            functional: None,
            busy_timeout: DEFAULT_BUSY_TIMEOUT,
        }
    }

    /// Limit for one command to leave dfuDNBUSY.
    #[must_use]
    pub fn with_busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }

    /// Bus identity.
    pub fn info(&self) -> &DfuDeviceInfo {
        &self.info
    }

    /// Whether the interface is claimed.
    pub fn is_open(&self) -> bool {
        self.is_open
    }

    /// Negotiated block size.
    pub fn transfer_size(&self) -> u16 {
        self.transfer_size
    }

    /// Sector map read at open, if the interface string parsed.
    pub fn memory_layout(&self) -> Option<&MemoryLayout> {
        self.memory_layout.as_ref()
    }

    /// Functional descriptor read at open.
    pub fn functional_descriptor(&self) -> Option<&FunctionalDescriptor> {
        self.functional.as_ref()
    }

    fn backend(&mut self) -> Result<&mut B> {
        if !self.is_open {
            return Err(Error::Protocol(format!("DFU device {} is not open", self.info)));
        }
        self.backend
            .as_mut()
            .ok_or_else(|| Error::DeviceLost(self.info.to_string()))
    }

    /// Claim the interface and read layout and transfer size.
    pub fn open(&mut self) -> Result<()> {
        if self.is_open {
            return Ok(());
        }
        let info = self.info.to_string();
        let backend = self
            .backend
            .as_mut()
            .ok_or_else(|| Error::DeviceLost(info.clone()))?;
        backend.claim()?;

        let layout = match backend.interface_string() {
            Ok(Some(s)) => match MemoryLayout::parse(&s) {
                Ok(layout) => Some(layout),
                Err(e) => {
                    warn!("Ignoring memory layout of {info}: {e}");
                    None
                },
            },
            Ok(None) => None,
            Err(e) => {
                warn!("Could not read interface string of {info}: {e}");
                None
            },
        };

        let functional = backend.functional_descriptor().unwrap_or_else(|e| {
            debug!("No functional descriptor on {info}: {e}");
            None
        });

        self.transfer_size = functional.map_or(DEFAULT_TRANSFER_SIZE, |f| f.effective_transfer_size());
        self.memory_layout = layout;
        self.functional = functional;
        self.is_open = true;
        info!(
            "Opened {info}, transfer size {}{}",
            self.transfer_size,
            self.memory_layout
                .as_ref()
                .map(|l| format!(", {} ({} sector runs)", l.name, l.sectors.len()))
                .unwrap_or_default()
        );
        Ok(())
    }

    /// Release the interface and drop the OS handle.
    pub fn close(&mut self) -> Result<()> {
        let was_open = std::mem::replace(&mut self.is_open, false);
        if let Some(mut backend) = self.backend.take() {
            if was_open {
                if let Err(e) = backend.release() {
                    debug!("Release of {} failed: {e}", self.info);
                }
            }
        }
        Ok(())
    }

    /// Swap in a new OS handle after the device re-enumerated.
    ///
    /// The old handle is closed first. The device stays closed until
    /// [`open`](Self::open) is called again.
    pub fn reacquire(&mut self, info: DfuDeviceInfo, backend: B) -> Result<()> {
        self.close()?;
        debug!("Reacquired {} as {info}", self.info);
        self.info = info;
        self.backend = Some(backend);
        Ok(())
    }

    /// DFU_GETSTATUS
    pub fn get_status(&mut self) -> Result<DfuStatus> {
        let mut buf = [0u8; STATUS_LEN];
        let n = self.backend()?.control_in(DfuRequest::GetStatus, 0, &mut buf)?;
        let status = DfuStatus::parse(&buf[..n])?;
        trace!("GETSTATUS: {} / {}", status.status, status.state);
        Ok(status)
    }

    /// DFU_GETSTATE
    pub fn get_state(&mut self) -> Result<DfuState> {
        let mut buf = [0u8; 1];
        let n = self.backend()?.control_in(DfuRequest::GetState, 0, &mut buf)?;
        if n != 1 {
            return Err(Error::Protocol("GETSTATE returned no data".into()));
        }
        Ok(DfuState::from(buf[0]))
    }

    /// DFU_CLRSTATUS
    pub fn clear_status(&mut self) -> Result<()> {
        self.backend()?.control_out(DfuRequest::ClrStatus, 0, &[])?;
        Ok(())
    }

    /// DFU_ABORT
    pub fn abort(&mut self) -> Result<()> {
        self.backend()?.control_out(DfuRequest::Abort, 0, &[])?;
        Ok(())
    }

    /// Bring the device to dfuIDLE, clearing a stale error first.
    pub fn reset_to_idle(&mut self) -> Result<()> {
        let mut status = self.get_status()?;
        if status.state == DfuState::Error {
            debug!("Clearing {} left over in dfuERROR", status.status);
            self.clear_status()?;
            status = self.get_status()?;
        }
        if status.state != DfuState::DfuIdle {
            debug!("Aborting from {}", status.state);
            self.abort()?;
            status = self.get_status()?;
        }
        if status.state == DfuState::DfuIdle {
            Ok(())
        } else {
            Err(Error::DfuStatus {
                status: status.status,
                state: status.state,
            })
        }
    }

    /// Poll GETSTATUS until the device leaves its busy states.
    fn wait_while_busy(&mut self) -> Result<DfuStatus> {
        let deadline = Instant::now() + self.busy_timeout;
        loop {
            let status = self.get_status()?.check()?;
            match status.state {
                DfuState::DnBusy | DfuState::DnloadSync => {
                    if Instant::now() >= deadline {
                        return Err(Error::Timeout(format!(
                            "device stayed in {} for {:?}",
                            status.state, self.busy_timeout
                        )));
                    }
                    thread::sleep(status.poll_timeout);
                },
                DfuState::DnloadIdle | DfuState::DfuIdle => return Ok(status),
                other => {
                    return Err(Error::Protocol(format!(
                        "unexpected state {other} after download"
                    )));
                },
            }
        }
    }

    fn dfuse_command(&mut self, command: &[u8]) -> Result<()> {
        self.backend()?.control_out(DfuRequest::Dnload, 0, command)?;
        self.wait_while_busy()?;
        Ok(())
    }

    /// DfuSe Set Address Pointer.
    pub fn set_address(&mut self, address: u32) -> Result<()> {
        trace!("Set address {address:#010x}");
        self.dfuse_command(&set_address_command(address))
    }

    /// DfuSe page erase.
    pub fn erase_page(&mut self, address: u32) -> Result<()> {
        debug!("Erase page {address:#010x}");
        self.dfuse_command(&erase_page_command(address))
    }

    /// DfuSe mass erase.
    pub fn mass_erase(&mut self) -> Result<()> {
        info!("Mass erase");
        self.dfuse_command(&mass_erase_command())
    }

    /// DfuSe Read Unprotect.
    ///
    /// The device mass-erases and resets, so the handle is dead afterwards.
    /// Errors from the status read that triggers the reset are expected and
    /// ignored.
    pub fn read_unprotect(&mut self) -> Result<()> {
        warn!("Removing read protection (mass-erases the chip)");
        self.backend()?
            .control_out(DfuRequest::Dnload, 0, &read_unprotect_command())?;
        if let Err(e) = self.get_status() {
            debug!("GETSTATUS after read-unprotect failed as expected: {e}");
        }
        Ok(())
    }

    /// Download one block relative to the address pointer.
    pub fn download_block(&mut self, block: u16, data: &[u8]) -> Result<()> {
        if data.len() > usize::from(self.transfer_size) {
            return Err(Error::PayloadTooLarge {
                max: usize::from(self.transfer_size),
                actual: data.len(),
            });
        }
        let value = data_block_value(block)?;
        trace!("DNLOAD block {block} ({} bytes)", data.len());
        self.backend()?.control_out(DfuRequest::Dnload, value, data)?;
        self.wait_while_busy()?;
        Ok(())
    }

    /// Upload one block relative to the address pointer.
    pub fn upload_block(&mut self, block: u16, len: usize) -> Result<Vec<u8>> {
        let value = data_block_value(block)?;
        let mut buf = vec![0u8; len];
        let n = self.backend()?.control_in(DfuRequest::Upload, value, &mut buf)?;
        buf.truncate(n);
        Ok(buf)
    }

    /// Write `data` at `address` in transfer-size blocks.
    ///
    /// `progress` receives the number of bytes written so far.
    pub fn download(
        &mut self,
        address: u32,
        data: &[u8],
        progress: &mut dyn FnMut(usize),
    ) -> Result<()> {
        self.set_address(address)?;
        let mut written = 0;
        for (i, chunk) in data.chunks(usize::from(self.transfer_size)).enumerate() {
            let block = u16::try_from(i)
                .map_err(|_| Error::Protocol(format!("segment at {address:#010x} needs too many blocks")))?;
            self.download_block(block, chunk)?;
            written += chunk.len();
            progress(written);
        }
        Ok(())
    }

    /// Read `len` bytes from `address`.
    pub fn upload(&mut self, address: u32, len: usize) -> Result<Vec<u8>> {
        self.reset_to_idle()?;
        self.set_address(address)?;
        // UPLOAD must start from dfuIDLE
        self.abort()?;

        let size = usize::from(self.transfer_size);
        let mut out = Vec::with_capacity(len);
        let mut block = 0u16;
        while out.len() < len {
            let want = size.min(len - out.len());
            let chunk = self.upload_block(block, want)?;
            if chunk.is_empty() {
                return Err(Error::Protocol(format!(
                    "upload ended after {} of {len} bytes",
                    out.len()
                )));
            }
            out.extend_from_slice(&chunk);
            block = block
                .checked_add(1)
                .ok_or_else(|| Error::Protocol("upload exceeds the DfuSe block range".into()))?;
        }
        out.truncate(len);
        self.abort()?;
        Ok(out)
    }

    /// Leave DFU mode and start the application at `entry_point`.
    ///
    /// The final GETSTATUS triggers the reset; its failure is tolerated.
    pub fn leave(&mut self, entry_point: u32) -> Result<()> {
        info!("Leaving DFU, jumping to {entry_point:#010x}");
        self.set_address(entry_point)?;
        self.backend()?.control_out(DfuRequest::Dnload, 0, &[])?;
        match self.get_status() {
            Ok(status) => trace!("Leave status {} / {}", status.status, status.state),
            Err(e) => debug!("GETSTATUS after leave failed as expected: {e}"),
        }
        Ok(())
    }

    /// Hand back the backend, closing nothing.
    pub fn into_backend(self) -> Option<B> {
        self.backend
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dfu::sim::{Recorded, SimConfig, SimHost};

    fn open_device(config: SimConfig) -> (SimHost, DfuDevice<crate::dfu::sim::SimBackend>) {
        let mut host = SimHost::new(config);
        let info = host.enumerate().unwrap().remove(0);
        let backend = host.connect(&info).unwrap();
        let mut device = DfuDevice::new(info, backend);
        device.open().unwrap();
        (host, device)
    }

    #[test]
    fn test_open_reads_layout_and_transfer_size() {
        let (_host, device) = open_device(SimConfig::default());
        assert!(device.is_open());
        assert_eq!(device.transfer_size(), 1024);
        assert_eq!(device.memory_layout().unwrap().name, "Internal Flash");
    }

    #[test]
    fn test_open_without_descriptor_uses_default() {
        let config = SimConfig {
            functional_descriptor: false,
            ..SimConfig::default()
        };
        let (_host, device) = open_device(config);
        assert_eq!(device.transfer_size(), DEFAULT_TRANSFER_SIZE);
    }

    #[test]
    fn test_reset_to_idle_clears_error() {
        let (host, mut device) = open_device(SimConfig::default());
        host.force_error();
        device.reset_to_idle().unwrap();
        assert_eq!(device.get_state().unwrap(), DfuState::DfuIdle);
        assert!(host.recorded().contains(&Recorded::ClrStatus));
    }

    #[test]
    fn test_download_blocks_use_offset_values() {
        let (host, mut device) = open_device(SimConfig::default());
        device.reset_to_idle().unwrap();
        let data: Vec<u8> = (0..2500u32).map(|i| (i % 251) as u8).collect();
        let mut seen = Vec::new();
        device
            .download(0x0800_0000, &data, &mut |n| seen.push(n))
            .unwrap();

        assert_eq!(seen, vec![1024, 2048, 2500]);
        let downloads: Vec<_> = host
            .recorded()
            .into_iter()
            .filter_map(|r| match r {
                Recorded::Download { value, len } => Some((value, len)),
                _ => None,
            })
            .collect();
        assert_eq!(downloads, vec![(2, 1024), (3, 1024), (4, 452)]);
        assert_eq!(host.flash(0x0800_0000, data.len()), data);
    }

    #[test]
    fn test_upload_reads_back() {
        let (host, mut device) = open_device(SimConfig::default());
        device.reset_to_idle().unwrap();
        let data = vec![0x5A; 3000];
        device.download(0x0800_4000, &data, &mut |_| {}).unwrap();
        let read = device.upload(0x0800_4000, data.len()).unwrap();
        assert_eq!(read, data);
        assert!(host.recorded().contains(&Recorded::Abort));
    }

    #[test]
    fn test_oversized_block_rejected() {
        let (_host, mut device) = open_device(SimConfig::default());
        assert!(matches!(
            device.download_block(0, &[0u8; 1025]),
            Err(Error::PayloadTooLarge { .. })
        ));
    }

    #[test]
    fn test_closed_device_rejects_requests() {
        let (_host, mut device) = open_device(SimConfig::default());
        device.close().unwrap();
        assert!(!device.is_open());
        assert!(device.get_status().is_err());
        device.close().unwrap();
    }

    #[test]
    fn test_wait_for_device_times_out() {
        let mut host = SimHost::new(SimConfig::default());
        host.unplug();
        let start = Instant::now();
        let err = wait_for_device(&mut host, |_| true, Duration::from_millis(1), Duration::ZERO).unwrap_err();
        assert!(matches!(err, Error::DeviceNotFound));
        assert!(start.elapsed() < MIN_POLL_INTERVAL);
    }

    #[test]
    fn test_same_target_ignores_address() {
        let info = DfuDeviceInfo {
            vid: STM32_DFU_VID,
            pid: STM32_DFU_PID,
            bus: 1,
            address: 7,
            interface: 0,
            alt_setting: 0,
            serial: Some("3276".into()),
            alt_name: None,
        };
        let moved = DfuDeviceInfo {
            address: 9,
            ..info.clone()
        };
        assert!(info.same_target(&moved));
        let other = DfuDeviceInfo {
            serial: Some("9999".into()),
            ..moved
        };
        assert!(!info.same_target(&other));
    }
}
