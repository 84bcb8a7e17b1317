//! STM32 DfuSe flashing.
//!
//! [`Stm32Flasher::flash`] walks a fixed sequence of states:
//!
//! ```text
//! Prepare -> SectorErase --ok--> Download(0..n) -> Manifest -> Done
//!                |                  ^      \
//!              fail                 |       `--leave_in_dfu--> Done
//!                v                  |
//!            MassErase ----ok-------+
//!                |                  |
//!              fail                 |
//!                v                  |
//!          ReadUnprotect --ok-------'
//! ```
//!
//! Each transition does its I/O before returning the next state. Abort is
//! checked before every transition, so between phases and between segments
//! but never inside a block transfer.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use log::{debug, info, warn};

use crate::dfu::device::{DfuDevice, DfuHost, MIN_POLL_INTERVAL, STM32_DFU_VID, wait_for_device};
use crate::error::{Error, Result};
use crate::image::{FirmwareImage, Segment};

/// Delays around device resets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DfuTimings {
    /// Wait after read-unprotect before polling enumeration.
    pub settle: Duration,
    /// How long to poll for the device to come back.
    pub reenumerate_timeout: Duration,
    /// Enumeration poll interval, never below 500 ms.
    pub poll_interval: Duration,
}

impl Default for DfuTimings {
    fn default() -> Self {
        Self {
            settle: Duration::from_secs(3),
            reenumerate_timeout: Duration::from_secs(10),
            poll_interval: MIN_POLL_INTERVAL,
        }
    }
}

/// Options for [`Stm32Flasher::flash`].
#[derive(Debug, Clone, Default)]
pub struct FlashOptions {
    /// Read each segment back after writing it.
    pub verify: bool,
    /// Stay in DFU mode afterwards.
    pub leave_in_dfu: bool,
    /// Address passed to the leave sequence. Defaults to the image start.
    pub entry_address: Option<u32>,
    /// Set to request a stop at the next checkpoint.
    pub abort: Option<Arc<AtomicBool>>,
    /// Reset delays.
    pub timings: DfuTimings,
}

impl FlashOptions {
    /// Enable read-back verification.
    #[must_use]
    pub fn with_verify(mut self, verify: bool) -> Self {
        self.verify = verify;
        self
    }

    /// Skip the manifest phase.
    #[must_use]
    pub fn with_leave_in_dfu(mut self, leave: bool) -> Self {
        self.leave_in_dfu = leave;
        self
    }

    /// Override the leave address.
    #[must_use]
    pub fn with_entry_address(mut self, address: u32) -> Self {
        self.entry_address = Some(address);
        self
    }

    /// Install an abort flag.
    #[must_use]
    pub fn with_abort_signal(mut self, abort: Arc<AtomicBool>) -> Self {
        self.abort = Some(abort);
        self
    }

    /// Replace the reset delays.
    #[must_use]
    pub fn with_timings(mut self, timings: DfuTimings) -> Self {
        self.timings = timings;
        self
    }
}

/// Phase reported through progress callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum FlashPhase {
    /// Erasing flash.
    Erase,
    /// Writing segments.
    Download,
    /// Reading segments back.
    Verify,
    /// Leaving DFU mode.
    Manifest,
}

impl std::fmt::Display for FlashPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Erase => "erase",
            Self::Download => "download",
            Self::Verify => "verify",
            Self::Manifest => "manifest",
        })
    }
}

/// Progress of the current phase. Counts restart for each segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlashProgress {
    /// Current phase.
    pub phase: FlashPhase,
    /// Units done (bytes or sectors).
    pub current: usize,
    /// Units in this step.
    pub total: usize,
    /// `current / total` as a percentage.
    pub percent: u8,
    /// Human-readable step description.
    pub message: String,
}

impl FlashProgress {
    #[allow(clippy::cast_possible_truncation)]
    fn new(phase: FlashPhase, current: usize, total: usize, message: &str) -> Self {
        let percent = if total == 0 {
            100
        } else {
            (current.min(total) * 100 / total) as u8
        };
        Self {
            phase,
            current,
            total,
            percent,
            message: message.to_string(),
        }
    }
}

/// Which erase tier succeeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum EraseMethod {
    /// No erase ran.
    #[default]
    None,
    /// Only the sectors the image touches.
    Sector,
    /// Whole-chip erase.
    Mass,
    /// Read-unprotect, which mass-erases as a side effect.
    ReadUnprotect,
}

/// Outcome of a successful flash.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlashReport {
    /// Erase tier that succeeded.
    pub erase_method: EraseMethod,
    /// Bytes downloaded.
    pub bytes_written: usize,
    /// Segments downloaded.
    pub segments: usize,
    /// Segments that read back identical.
    pub verified_segments: usize,
    /// Verification problems that did not stop the flash.
    pub verify_warnings: Vec<String>,
    /// Whether the device was re-acquired after a reset.
    pub reacquired: bool,
    /// Whether the leave sequence ran.
    pub manifested: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FlashState {
    Prepare,
    SectorErase,
    MassErase,
    ReadUnprotect,
    Download(usize),
    Manifest,
    Done,
}

/// Flashes STM32 parts through the ST DfuSe bootloader.
pub struct Stm32Flasher<H: DfuHost> {
    host: H,
    device: DfuDevice<H::Backend>,
    options: FlashOptions,
}

impl<H: DfuHost> Stm32Flasher<H> {
    /// Flash `device`, using `host` to find it again after resets.
    pub fn new(host: H, device: DfuDevice<H::Backend>, options: FlashOptions) -> Self {
        Self {
            host,
            device,
            options,
        }
    }

    /// Connect to the first attached DFU device, preferring ST's VID.
    pub fn connect_first(mut host: H, options: FlashOptions) -> Result<Self> {
        let devices = host.enumerate()?;
        let info = devices
            .iter()
            .find(|d| d.vid == STM32_DFU_VID && d.alt_setting == 0)
            .or_else(|| devices.first())
            .cloned()
            .ok_or(Error::DeviceNotFound)?;
        let backend = host.connect(&info)?;
        let device = DfuDevice::new(info, backend);
        Ok(Self::new(host, device, options))
    }

    /// The device being flashed.
    pub fn device(&self) -> &DfuDevice<H::Backend> {
        &self.device
    }

    /// Options in use.
    pub fn options(&self) -> &FlashOptions {
        &self.options
    }

    /// Split back into host and device.
    pub fn into_parts(self) -> (H, DfuDevice<H::Backend>) {
        (self.host, self.device)
    }

    fn check_abort(&self) -> Result<()> {
        let flagged = self
            .options
            .abort
            .as_ref()
            .is_some_and(|a| a.load(Ordering::Relaxed));
        if flagged || crate::is_interrupted_requested() {
            warn!("Flash aborted");
            return Err(Error::Aborted);
        }
        Ok(())
    }

    /// Erase, write and optionally verify `image`, then leave DFU mode.
    pub fn flash(
        &mut self,
        image: &FirmwareImage,
        progress: &mut dyn FnMut(&FlashProgress),
    ) -> Result<FlashReport> {
        let mut report = FlashReport::default();
        let mut state = FlashState::Prepare;

        loop {
            if state == FlashState::Done {
                info!(
                    "Flashed {} bytes in {} segment(s)",
                    report.bytes_written, report.segments
                );
                return Ok(report);
            }
            self.check_abort()?;
            debug!("Flash state {state:?}");

            state = match state {
                FlashState::Prepare => {
                    self.device.open()?;
                    self.device.reset_to_idle()?;
                    FlashState::SectorErase
                },
                FlashState::SectorErase => match self.erase_sectors(image, progress) {
                    Ok(()) => {
                        report.erase_method = EraseMethod::Sector;
                        FlashState::Download(0)
                    },
                    Err(e) => {
                        warn!("Sector erase failed ({e}), falling back to mass erase");
                        FlashState::MassErase
                    },
                },
                FlashState::MassErase => match self.mass_erase(progress) {
                    Ok(()) => {
                        report.erase_method = EraseMethod::Mass;
                        FlashState::Download(0)
                    },
                    Err(e) => {
                        warn!("Mass erase failed ({e}), falling back to read-unprotect");
                        FlashState::ReadUnprotect
                    },
                },
                FlashState::ReadUnprotect => {
                    self.read_unprotect(progress)?;
                    report.erase_method = EraseMethod::ReadUnprotect;
                    report.reacquired = true;
                    FlashState::Download(0)
                },
                FlashState::Download(index) => match image.segments().get(index) {
                    Some(segment) => {
                        let count = image.segments().len();
                        self.download_segment(index, count, segment, progress)?;
                        report.bytes_written += segment.len();
                        report.segments += 1;
                        if self.options.verify {
                            match self.verify_segment(index, count, segment, progress)? {
                                None => report.verified_segments += 1,
                                Some(warning) => report.verify_warnings.push(warning),
                            }
                        }
                        FlashState::Download(index + 1)
                    },
                    None if self.options.leave_in_dfu => {
                        info!("Staying in DFU mode");
                        FlashState::Done
                    },
                    None => FlashState::Manifest,
                },
                FlashState::Manifest => {
                    let entry = self.options.entry_address.unwrap_or_else(|| image.start_address());
                    progress(&FlashProgress::new(
                        FlashPhase::Manifest,
                        0,
                        1,
                        &format!("starting application at {entry:#010x}"),
                    ));
                    self.device.leave(entry)?;
                    progress(&FlashProgress::new(FlashPhase::Manifest, 1, 1, "done"));
                    report.manifested = true;
                    FlashState::Done
                },
                FlashState::Done => FlashState::Done,
            };
        }
    }

    fn erase_sectors(
        &mut self,
        image: &FirmwareImage,
        progress: &mut dyn FnMut(&FlashProgress),
    ) -> Result<()> {
        let layout = self
            .device
            .memory_layout()
            .cloned()
            .ok_or_else(|| Error::MemoryLayout("device reported no memory layout".into()))?;

        let count = image.segments().len();
        for (index, segment) in image.segments().iter().enumerate() {
            let pages = layout.sectors_to_erase(segment.address, segment.len())?;
            let message = format!("segment {}/{count} at {:#010x}", index + 1, segment.address);
            info!("Erasing {} sector(s) for {message}", pages.len());
            progress(&FlashProgress::new(FlashPhase::Erase, 0, pages.len(), &message));
            for (done, page) in pages.iter().enumerate() {
                self.device.erase_page(*page)?;
                progress(&FlashProgress::new(FlashPhase::Erase, done + 1, pages.len(), &message));
            }
        }
        Ok(())
    }

    fn mass_erase(&mut self, progress: &mut dyn FnMut(&FlashProgress)) -> Result<()> {
        progress(&FlashProgress::new(FlashPhase::Erase, 0, 1, "mass erase"));
        self.device.reset_to_idle()?;
        self.device.mass_erase()?;
        progress(&FlashProgress::new(FlashPhase::Erase, 1, 1, "mass erase"));
        Ok(())
    }

    fn read_unprotect(&mut self, progress: &mut dyn FnMut(&FlashProgress)) -> Result<()> {
        progress(&FlashProgress::new(FlashPhase::Erase, 0, 1, "removing read protection"));
        self.device.reset_to_idle()?;
        self.device.read_unprotect()?;
        self.device.close()?;

        let timings = self.options.timings;
        let previous = self.device.info().clone();
        info!(
            "Waiting for {previous} to re-enumerate (settle {:?}, timeout {:?})",
            timings.settle, timings.reenumerate_timeout
        );
        thread::sleep(timings.settle);

        let found = wait_for_device(
            &mut self.host,
            |d| previous.same_target(d),
            timings.reenumerate_timeout,
            timings.poll_interval,
        )
        .map_err(|_| Error::DeviceLost(format!("{previous} did not come back after read-unprotect")))?;

        let backend = self.host.connect(&found)?;
        self.device.reacquire(found, backend)?;
        self.device.open()?;
        self.device.reset_to_idle()?;
        progress(&FlashProgress::new(FlashPhase::Erase, 1, 1, "read protection removed"));
        Ok(())
    }

    fn download_segment(
        &mut self,
        index: usize,
        count: usize,
        segment: &Segment,
        progress: &mut dyn FnMut(&FlashProgress),
    ) -> Result<()> {
        let total = segment.len();
        let message = format!("segment {}/{count} at {:#010x}", index + 1, segment.address);
        info!("Downloading {message} ({total} bytes)");
        progress(&FlashProgress::new(FlashPhase::Download, 0, total, &message));
        self.device.download(segment.address, &segment.data, &mut |written| {
            progress(&FlashProgress::new(FlashPhase::Download, written, total, &message));
        })
    }

    /// Returns a warning instead of failing; the device is back in dfuIDLE
    /// either way.
    fn verify_segment(
        &mut self,
        index: usize,
        count: usize,
        segment: &Segment,
        progress: &mut dyn FnMut(&FlashProgress),
    ) -> Result<Option<String>> {
        let total = segment.len();
        let message = format!("segment {}/{count} at {:#010x}", index + 1, segment.address);

        if self.device.functional_descriptor().is_some_and(|f| !f.can_upload()) {
            let warning = format!("{message}: device does not support upload, not verified");
            warn!("{warning}");
            return Ok(Some(warning));
        }

        progress(&FlashProgress::new(FlashPhase::Verify, 0, total, &message));
        let warning = match self.device.upload(segment.address, total) {
            Ok(read) if read == segment.data => {
                progress(&FlashProgress::new(FlashPhase::Verify, total, total, &message));
                return Ok(None);
            },
            Ok(read) => {
                let offset = read
                    .iter()
                    .zip(&segment.data)
                    .position(|(a, b)| a != b)
                    .unwrap_or(read.len());
                format!(
                    "{message}: read-back differs at {:#010x}",
                    u64::from(segment.address) + offset as u64
                )
            },
            Err(e) => format!("{message}: read-back failed ({e})"),
        };

        warn!("Verify: {warning}; continuing");
        self.device.reset_to_idle()?;
        Ok(Some(warning))
    }
}
