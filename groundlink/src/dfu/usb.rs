//! libusb-backed DFU host.

use std::time::Duration;

use log::{debug, trace};
use rusb::{Context, Device, DeviceHandle, UsbContext};

use crate::dfu::descriptor::FunctionalDescriptor;
use crate::dfu::device::{
    DFU_CLASS, DFU_MODE_PROTOCOL, DFU_SUBCLASS, DfuBackend, DfuDeviceInfo, DfuHost,
};
use crate::dfu::protocol::{DfuRequest, REQUEST_TYPE_IN, REQUEST_TYPE_OUT};
use crate::error::{Error, Result};

/// Timeout for one control transfer.
pub const CONTROL_TIMEOUT: Duration = Duration::from_secs(5);

/// Enumerates DFU-mode interfaces through libusb.
pub struct RusbHost {
    context: Context,
}

impl RusbHost {
    /// Create a libusb context.
    pub fn new() -> Result<Self> {
        Ok(Self {
            context: Context::new()?,
        })
    }

    fn find(&self, info: &DfuDeviceInfo) -> Result<Device<Context>> {
        self.context
            .devices()?
            .iter()
            .find(|d| d.bus_number() == info.bus && d.address() == info.address)
            .ok_or(Error::DeviceNotFound)
    }
}

/// One DFU alternate setting on the bus, as found in its descriptors.
struct DfuInterfaceDesc {
    interface: u8,
    alt_setting: u8,
    name_index: Option<u8>,
    functional: Option<FunctionalDescriptor>,
}

fn dfu_interfaces(device: &Device<Context>) -> Vec<DfuInterfaceDesc> {
    let Ok(config) = device.active_config_descriptor().or_else(|_| device.config_descriptor(0)) else {
        return Vec::new();
    };
    let mut found = Vec::new();
    for interface in config.interfaces() {
        for desc in interface.descriptors() {
            if desc.class_code() == DFU_CLASS
                && desc.sub_class_code() == DFU_SUBCLASS
                && desc.protocol_code() == DFU_MODE_PROTOCOL
            {
                found.push(DfuInterfaceDesc {
                    interface: desc.interface_number(),
                    alt_setting: desc.setting_number(),
                    name_index: desc.description_string_index(),
                    functional: FunctionalDescriptor::find_in(desc.extra()),
                });
            }
        }
    }
    found
}

impl DfuHost for RusbHost {
    type Backend = RusbBackend;

    fn enumerate(&mut self) -> Result<Vec<DfuDeviceInfo>> {
        let mut result = Vec::new();
        for device in self.context.devices()?.iter() {
            let Ok(descriptor) = device.device_descriptor() else {
                continue;
            };
            let interfaces = dfu_interfaces(&device);
            if interfaces.is_empty() {
                continue;
            }

            // Strings are best-effort; permissions may forbid opening
            let handle = device.open().ok();
            let read_string = |index: Option<u8>| {
                let (handle, index) = (handle.as_ref()?, index?);
                handle.read_string_descriptor_ascii(index).ok()
            };
            let serial = read_string(descriptor.serial_number_string_index());

            for iface in interfaces {
                let info = DfuDeviceInfo {
                    vid: descriptor.vendor_id(),
                    pid: descriptor.product_id(),
                    bus: device.bus_number(),
                    address: device.address(),
                    interface: iface.interface,
                    alt_setting: iface.alt_setting,
                    serial: serial.clone(),
                    alt_name: read_string(iface.name_index),
                };
                trace!("Found DFU interface {info}");
                result.push(info);
            }
        }
        debug!("{} DFU interface(s) attached", result.len());
        Ok(result)
    }

    fn connect(&mut self, info: &DfuDeviceInfo) -> Result<RusbBackend> {
        let device = self.find(info)?;
        let desc = dfu_interfaces(&device)
            .into_iter()
            .find(|d| d.interface == info.interface && d.alt_setting == info.alt_setting)
            .ok_or(Error::DeviceNotFound)?;
        let handle = device.open()?;
        Ok(RusbBackend {
            handle,
            interface: desc.interface,
            alt_setting: desc.alt_setting,
            name_index: desc.name_index,
            functional: desc.functional,
            claimed: false,
        })
    }
}

/// An opened DFU interface.
pub struct RusbBackend {
    handle: DeviceHandle<Context>,
    interface: u8,
    alt_setting: u8,
    name_index: Option<u8>,
    functional: Option<FunctionalDescriptor>,
    claimed: bool,
}

impl std::fmt::Debug for RusbBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RusbBackend")
            .field("interface", &self.interface)
            .field("alt_setting", &self.alt_setting)
            .field("claimed", &self.claimed)
            .finish_non_exhaustive()
    }
}

impl DfuBackend for RusbBackend {
    fn claim(&mut self) -> Result<()> {
        if let Err(e) = self.handle.set_auto_detach_kernel_driver(true) {
            trace!("Kernel driver auto-detach unavailable: {e}");
        }
        self.handle.claim_interface(self.interface)?;
        self.claimed = true;
        if self.alt_setting != 0 {
            self.handle
                .set_alternate_setting(self.interface, self.alt_setting)?;
        }
        Ok(())
    }

    fn release(&mut self) -> Result<()> {
        if self.claimed {
            self.claimed = false;
            self.handle.release_interface(self.interface)?;
        }
        Ok(())
    }

    fn control_out(&mut self, request: DfuRequest, value: u16, data: &[u8]) -> Result<usize> {
        Ok(self.handle.write_control(
            REQUEST_TYPE_OUT,
            request.code(),
            value,
            u16::from(self.interface),
            data,
            CONTROL_TIMEOUT,
        )?)
    }

    fn control_in(&mut self, request: DfuRequest, value: u16, buf: &mut [u8]) -> Result<usize> {
        Ok(self.handle.read_control(
            REQUEST_TYPE_IN,
            request.code(),
            value,
            u16::from(self.interface),
            buf,
            CONTROL_TIMEOUT,
        )?)
    }

    fn interface_string(&mut self) -> Result<Option<String>> {
        match self.name_index {
            Some(index) => Ok(Some(self.handle.read_string_descriptor_ascii(index)?)),
            None => Ok(None),
        }
    }

    fn functional_descriptor(&mut self) -> Result<Option<FunctionalDescriptor>> {
        Ok(self.functional)
    }
}
