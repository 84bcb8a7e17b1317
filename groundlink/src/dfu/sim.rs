//! Simulated DfuSe bootloader for tests.
//!
//! Models the DFU state machine closely enough for the flasher: commands
//! execute on the GETSTATUS that follows them, one dfuDNBUSY round is
//! reported per command, and read-unprotect re-enumerates the device with a
//! new handle generation. Every request is recorded.

use std::io;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::dfu::descriptor::FunctionalDescriptor;
use crate::dfu::device::{DfuBackend, DfuDeviceInfo, DfuHost, STM32_DFU_PID, STM32_DFU_VID};
use crate::dfu::memory::MemoryLayout;
use crate::dfu::protocol::{DfuRequest, DfuState, DfuStatus, DfuStatusCode, dfuse};
use crate::error::{Error, Result};

pub const FLASH_BASE: u32 = 0x0800_0000;
pub const LAYOUT: &str = "@Internal Flash  /0x08000000/04*016Kg,01*064Kg,03*128Kg";

/// Protocol requests observed by the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recorded {
    Claim,
    Release,
    SetAddress(u32),
    ErasePage(u32),
    MassErase,
    ReadUnprotect,
    Download { value: u16, len: usize },
    Upload { value: u16, len: usize },
    ClrStatus,
    Abort,
    Leave(u32),
}

#[derive(Debug, Clone)]
pub struct SimConfig {
    pub layout: Option<String>,
    pub transfer_size: u16,
    pub functional_descriptor: bool,
    pub reject_sector_erase: bool,
    pub reject_mass_erase: bool,
    pub reject_upload: bool,
    pub vanish_after_unprotect: bool,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            layout: Some(LAYOUT.to_string()),
            transfer_size: 1024,
            functional_descriptor: true,
            reject_sector_erase: false,
            reject_mass_erase: false,
            reject_upload: false,
            vanish_after_unprotect: false,
        }
    }
}

#[derive(Debug)]
enum Pending {
    SetAddress(u32),
    ErasePage(u32),
    MassErase,
    Write { block: u16, data: Vec<u8> },
}

#[derive(Debug)]
struct SimState {
    config: SimConfig,
    layout: Option<MemoryLayout>,
    flash: Vec<u8>,
    state: DfuState,
    status: DfuStatusCode,
    pointer: u32,
    pending: Option<Pending>,
    generation: u8,
    present: bool,
    log: Vec<Recorded>,
    enumerations: usize,
}

impl SimState {
    fn stall(&mut self) -> Error {
        self.state = DfuState::Error;
        self.status = DfuStatusCode::ErrStalledPkt;
        Error::Io(io::Error::new(io::ErrorKind::BrokenPipe, "pipe stall"))
    }

    fn offset(&self, address: u32, len: usize) -> Option<usize> {
        let offset = usize::try_from(address.checked_sub(FLASH_BASE)?).ok()?;
        (offset + len <= self.flash.len()).then_some(offset)
    }

    fn execute(&mut self, pending: Pending) -> std::result::Result<(), DfuStatusCode> {
        match pending {
            Pending::SetAddress(address) => {
                self.pointer = address;
                Ok(())
            },
            Pending::ErasePage(address) => {
                if self.config.reject_sector_erase {
                    return Err(DfuStatusCode::ErrTarget);
                }
                let run = self
                    .layout
                    .as_ref()
                    .and_then(|l| l.find(address).copied())
                    .ok_or(DfuStatusCode::ErrAddress)?;
                let start = run.sector_start(address).ok_or(DfuStatusCode::ErrAddress)?;
                let size = run.size as usize;
                let offset = self.offset(start, size).ok_or(DfuStatusCode::ErrAddress)?;
                self.flash[offset..offset + size].fill(0xFF);
                Ok(())
            },
            Pending::MassErase => {
                if self.config.reject_mass_erase {
                    return Err(DfuStatusCode::ErrVendor);
                }
                self.flash.fill(0xFF);
                Ok(())
            },
            Pending::Write { block, data } => {
                let address = self.pointer + u32::from(block) * u32::from(self.config.transfer_size);
                let offset = self.offset(address, data.len()).ok_or(DfuStatusCode::ErrAddress)?;
                self.flash[offset..offset + data.len()].copy_from_slice(&data);
                Ok(())
            },
        }
    }

    fn reenumerate(&mut self, present: bool) {
        self.generation = self.generation.wrapping_add(1);
        self.present = present;
        self.state = DfuState::DfuIdle;
        self.status = DfuStatusCode::Ok;
        self.pending = None;
    }

    fn info(&self) -> DfuDeviceInfo {
        DfuDeviceInfo {
            vid: STM32_DFU_VID,
            pid: STM32_DFU_PID,
            bus: 1,
            address: 10 + self.generation,
            interface: 0,
            alt_setting: 0,
            serial: Some("SIM0001".to_string()),
            alt_name: self.config.layout.clone(),
        }
    }
}

/// Test host; clones share one device.
#[derive(Debug, Clone)]
pub struct SimHost {
    state: Arc<Mutex<SimState>>,
}

impl SimHost {
    pub fn new(config: SimConfig) -> Self {
        let layout = config.layout.as_deref().and_then(|l| MemoryLayout::parse(l).ok());
        Self {
            state: Arc::new(Mutex::new(SimState {
                config,
                layout,
                flash: vec![0xFF; 512 * 1024],
                state: DfuState::DfuIdle,
                status: DfuStatusCode::Ok,
                pointer: FLASH_BASE,
                pending: None,
                generation: 0,
                present: true,
                log: Vec::new(),
                enumerations: 0,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().expect("sim state poisoned")
    }

    pub fn recorded(&self) -> Vec<Recorded> {
        self.lock().log.clone()
    }

    pub fn flash(&self, address: u32, len: usize) -> Vec<u8> {
        let state = self.lock();
        let offset = state.offset(address, len).expect("range outside sim flash");
        state.flash[offset..offset + len].to_vec()
    }

    pub fn enumerations(&self) -> usize {
        self.lock().enumerations
    }

    pub fn generation(&self) -> u8 {
        self.lock().generation
    }

    /// Put the device in dfuERROR as a previous session might have left it.
    pub fn force_error(&self) {
        let mut state = self.lock();
        state.state = DfuState::Error;
        state.status = DfuStatusCode::ErrUnknown;
    }

    pub fn unplug(&self) {
        self.lock().present = false;
    }
}

impl DfuHost for SimHost {
    type Backend = SimBackend;

    fn enumerate(&mut self) -> Result<Vec<DfuDeviceInfo>> {
        let mut state = self.lock();
        state.enumerations += 1;
        Ok(if state.present { vec![state.info()] } else { Vec::new() })
    }

    fn connect(&mut self, _info: &DfuDeviceInfo) -> Result<SimBackend> {
        let state = self.lock();
        if !state.present {
            return Err(Error::DeviceNotFound);
        }
        Ok(SimBackend {
            state: Arc::clone(&self.state),
            generation: state.generation,
        })
    }
}

/// Handle to one enumeration of the simulated device.
#[derive(Debug)]
pub struct SimBackend {
    state: Arc<Mutex<SimState>>,
    generation: u8,
}

impl SimBackend {
    fn live(&self) -> Result<MutexGuard<'_, SimState>> {
        let state = self.state.lock().expect("sim state poisoned");
        if state.present && state.generation == self.generation {
            Ok(state)
        } else {
            Err(Error::Io(io::Error::new(io::ErrorKind::NotConnected, "no such device")))
        }
    }
}

impl DfuBackend for SimBackend {
    fn claim(&mut self) -> Result<()> {
        self.live()?.log.push(Recorded::Claim);
        Ok(())
    }

    fn release(&mut self) -> Result<()> {
        self.live()?.log.push(Recorded::Release);
        Ok(())
    }

    fn control_out(&mut self, request: DfuRequest, value: u16, data: &[u8]) -> Result<usize> {
        let mut state = self.live()?;
        match request {
            DfuRequest::Dnload => {
                if !matches!(state.state, DfuState::DfuIdle | DfuState::DnloadIdle) {
                    return Err(state.stall());
                }
                if value >= 2 {
                    state.log.push(Recorded::Download {
                        value,
                        len: data.len(),
                    });
                    state.pending = Some(Pending::Write {
                        block: value - 2,
                        data: data.to_vec(),
                    });
                    state.state = DfuState::DnloadSync;
                    return Ok(data.len());
                }
                let pending = match data {
                    [] => {
                        let pointer = state.pointer;
                        state.log.push(Recorded::Leave(pointer));
                        state.state = DfuState::ManifestSync;
                        return Ok(0);
                    },
                    [dfuse::READ_UNPROTECT] => {
                        state.log.push(Recorded::ReadUnprotect);
                        state.flash.fill(0xFF);
                        let present = !state.config.vanish_after_unprotect;
                        state.reenumerate(present);
                        return Ok(1);
                    },
                    [dfuse::ERASE] => {
                        state.log.push(Recorded::MassErase);
                        Pending::MassErase
                    },
                    [dfuse::ERASE, a, b, c, d] => {
                        let address = u32::from_le_bytes([*a, *b, *c, *d]);
                        state.log.push(Recorded::ErasePage(address));
                        Pending::ErasePage(address)
                    },
                    [dfuse::SET_ADDRESS, a, b, c, d] => {
                        let address = u32::from_le_bytes([*a, *b, *c, *d]);
                        state.log.push(Recorded::SetAddress(address));
                        Pending::SetAddress(address)
                    },
                    _ => return Err(state.stall()),
                };
                state.pending = Some(pending);
                state.state = DfuState::DnloadSync;
                Ok(data.len())
            },
            DfuRequest::ClrStatus => {
                state.log.push(Recorded::ClrStatus);
                state.state = DfuState::DfuIdle;
                state.status = DfuStatusCode::Ok;
                Ok(0)
            },
            DfuRequest::Abort => {
                state.log.push(Recorded::Abort);
                if state.state == DfuState::Error {
                    return Err(state.stall());
                }
                state.state = DfuState::DfuIdle;
                Ok(0)
            },
            _ => Err(state.stall()),
        }
    }

    fn control_in(&mut self, request: DfuRequest, value: u16, buf: &mut [u8]) -> Result<usize> {
        let mut state = self.live()?;
        match request {
            DfuRequest::GetStatus => {
                let mut vanish = false;
                let current = state.state;
                match current {
                    DfuState::DnloadSync => {
                        let result = match state.pending.take() {
                            Some(pending) => state.execute(pending),
                            None => Ok(()),
                        };
                        match result {
                            Ok(()) => state.state = DfuState::DnBusy,
                            Err(code) => {
                                state.state = DfuState::Error;
                                state.status = code;
                            },
                        }
                    },
                    DfuState::DnBusy => state.state = DfuState::DnloadIdle,
                    DfuState::ManifestSync => {
                        state.state = DfuState::Manifest;
                        vanish = true;
                    },
                    _ => {},
                }
                let reply = DfuStatus {
                    status: state.status,
                    poll_timeout: std::time::Duration::ZERO,
                    state: state.state,
                    string_index: 0,
                }
                .to_bytes();
                if vanish {
                    state.reenumerate(false);
                }
                let n = reply.len().min(buf.len());
                buf[..n].copy_from_slice(&reply[..n]);
                Ok(n)
            },
            DfuRequest::GetState => {
                buf[0] = state.state.as_u8();
                Ok(1)
            },
            DfuRequest::Upload => {
                state.log.push(Recorded::Upload {
                    value,
                    len: buf.len(),
                });
                if state.config.reject_upload
                    || value < 2
                    || !matches!(state.state, DfuState::DfuIdle | DfuState::UploadIdle)
                {
                    return Err(state.stall());
                }
                let address = state.pointer
                    + u32::from(value - 2) * u32::from(state.config.transfer_size);
                let Some(offset) = state.offset(address, buf.len()) else {
                    return Err(state.stall());
                };
                buf.copy_from_slice(&state.flash[offset..offset + buf.len()]);
                state.state = DfuState::UploadIdle;
                Ok(buf.len())
            },
            _ => Err(state.stall()),
        }
    }

    fn interface_string(&mut self) -> Result<Option<String>> {
        Ok(self.live()?.config.layout.clone())
    }

    fn functional_descriptor(&mut self) -> Result<Option<FunctionalDescriptor>> {
        let state = self.live()?;
        Ok(state.config.functional_descriptor.then(|| FunctionalDescriptor {
            transfer_size: state.config.transfer_size,
            ..FunctionalDescriptor::default()
        }))
    }
}
