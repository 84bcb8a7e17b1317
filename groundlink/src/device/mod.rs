//! Serial endpoint discovery and classification.
//!
//! Ports are classified by USB VID/PID into flight-controller and
//! USB-UART bridge kinds so a sensible default can be picked.

use crate::error::{Error, Result};

#[cfg(feature = "native")]
use log::{debug, info, trace};

/// Known USB device kinds seen on flight-controller links.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum DeviceKind {
    /// STM32 virtual COM port (Betaflight, iNav, older ArduPilot).
    Stm32Vcp,
    /// ArduPilot ChibiOS composite device.
    ArduPilot,
    /// PX4 / Pixhawk bootloader or firmware.
    Px4,
    /// Silicon Labs CP210x USB-to-Serial converter (telemetry radios).
    Cp210x,
    /// FTDI USB-to-Serial converter.
    Ftdi,
    /// CH340/CH341 USB-to-Serial converter.
    Ch340,
    /// STM32 in the ROM DFU bootloader (not a serial port).
    Stm32Dfu,
    /// Unknown device.
    Unknown,
}

/// Protocol a device kind usually speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ProtocolHint {
    /// MAVLink (ArduPilot, PX4).
    Mavlink,
    /// MSP (Betaflight, iNav).
    Msp,
    /// USB DFU.
    Dfu,
}

/// `(vid, pids, kind)`; an empty pid list matches any product.
const KNOWN_USB_DEVICES: &[(u16, &[u16], DeviceKind)] = &[
    (0x0483, &[0x5740], DeviceKind::Stm32Vcp),
    (0x0483, &[0xDF11], DeviceKind::Stm32Dfu),
    (0x1209, &[0x5740, 0x5741], DeviceKind::ArduPilot),
    (0x2DAE, &[], DeviceKind::ArduPilot),
    (0x26AC, &[], DeviceKind::Px4),
    (0x10C4, &[0xEA60, 0xEA70, 0xEA71], DeviceKind::Cp210x),
    (0x0403, &[0x6001, 0x6010, 0x6014, 0x6015], DeviceKind::Ftdi),
    (0x1A86, &[0x7523, 0x7522, 0x5523, 0x55D4], DeviceKind::Ch340),
];

impl DeviceKind {
    /// Classify a VID/PID pair.
    #[must_use]
    pub fn from_vid_pid(vid: u16, pid: u16) -> Self {
        for (known_vid, pids, device) in KNOWN_USB_DEVICES {
            if vid == *known_vid && (pids.is_empty() || pids.contains(&pid)) {
                return *device;
            }
        }
        Self::Unknown
    }

    /// Human-readable name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Stm32Vcp => "STM32 VCP",
            Self::ArduPilot => "ArduPilot",
            Self::Px4 => "PX4",
            Self::Cp210x => "CP210x",
            Self::Ftdi => "FTDI",
            Self::Ch340 => "CH340/CH341",
            Self::Stm32Dfu => "STM32 DFU",
            Self::Unknown => "Unknown",
        }
    }

    /// Check if this is a known/expected device kind.
    pub fn is_known(&self) -> bool {
        !matches!(self, Self::Unknown)
    }

    /// Whether this is a flight controller rather than a bridge.
    pub fn is_flight_controller(&self) -> bool {
        matches!(self, Self::Stm32Vcp | Self::ArduPilot | Self::Px4)
    }

    /// Protocol this kind usually speaks, if it is telling.
    pub fn protocol_hint(&self) -> Option<ProtocolHint> {
        match self {
            Self::ArduPilot | Self::Px4 => Some(ProtocolHint::Mavlink),
            Self::Stm32Vcp => Some(ProtocolHint::Msp),
            Self::Stm32Dfu => Some(ProtocolHint::Dfu),
            _ => None,
        }
    }
}

/// Discovered serial endpoint.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DetectedPort {
    /// Endpoint name/path (e.g., "/dev/ttyACM0" or "COM3").
    pub name: String,
    /// Classified device kind.
    pub device: DeviceKind,
    /// USB Vendor ID (if available).
    pub vid: Option<u16>,
    /// USB Product ID (if available).
    pub pid: Option<u16>,
    /// Device manufacturer string (if available).
    pub manufacturer: Option<String>,
    /// Device product string (if available).
    pub product: Option<String>,
    /// Serial number (if available).
    pub serial: Option<String>,
}

impl DetectedPort {
    /// Port with no USB metadata.
    pub fn plain(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            device: DeviceKind::Unknown,
            vid: None,
            pid: None,
            manufacturer: None,
            product: None,
            serial: None,
        }
    }

    /// Selection rank: lower is better.
    fn rank(&self) -> u8 {
        if self.device.is_flight_controller() {
            0
        } else if self.device.is_known() {
            1
        } else if self.vid.is_some() {
            2
        } else {
            3
        }
    }
}

/// Detect all available serial endpoints with metadata.
#[cfg(feature = "native")]
pub fn detect_ports() -> Vec<DetectedPort> {
    let mut result = Vec::new();

    match serialport::available_ports() {
        Ok(ports) => {
            for port_info in ports {
                let mut detected = DetectedPort::plain(port_info.port_name.clone());

                if let serialport::SerialPortType::UsbPort(usb_info) = port_info.port_type {
                    detected.vid = Some(usb_info.vid);
                    detected.pid = Some(usb_info.pid);
                    detected.manufacturer = usb_info.manufacturer;
                    detected.product = usb_info.product;
                    detected.serial = usb_info.serial_number;
                    detected.device = DeviceKind::from_vid_pid(usb_info.vid, usb_info.pid);

                    trace!(
                        "Found USB port: {} (VID: {:04X}, PID: {:04X}, Device: {:?})",
                        port_info.port_name, usb_info.vid, usb_info.pid, detected.device
                    );
                }

                result.push(detected);
            }
        },
        Err(e) => {
            debug!("Failed to enumerate serial ports: {e}");
        },
    }

    result
}

/// Detect all available endpoints (no serial support compiled in).
#[cfg(not(feature = "native"))]
pub fn detect_ports() -> Vec<DetectedPort> {
    Vec::new()
}

/// Pick the most likely flight-controller port from a list.
///
/// Flight controllers beat USB-UART bridges, which beat unclassified USB
/// ports, which beat on-board UARTs.
pub fn select_port(ports: &[DetectedPort]) -> Option<&DetectedPort> {
    ports.iter().min_by_key(|p| p.rank())
}

/// Auto-detect a single flight-controller endpoint.
#[cfg(feature = "native")]
pub fn auto_detect_port() -> Result<DetectedPort> {
    let ports = detect_ports();
    let port = select_port(&ports).ok_or(Error::DeviceNotFound)?;
    if port.device.is_known() {
        info!("Auto-detected {}: {}", port.device.name(), port.name);
    } else {
        info!("Using first available port: {}", port.name);
    }
    Ok(port.clone())
}

/// Auto-detect a single endpoint (no serial support compiled in).
#[cfg(not(feature = "native"))]
pub fn auto_detect_port() -> Result<DetectedPort> {
    Err(Error::Unsupported(
        "serial discovery requires the `native` feature".to_string(),
    ))
}

/// Format a list of detected endpoints for display.
pub fn format_port_list(ports: &[DetectedPort]) -> Vec<String> {
    let mut result = Vec::new();

    for port in ports {
        let device_info = if port.device.is_known() {
            format!(" [{}]", port.device.name())
        } else if let (Some(vid), Some(pid)) = (port.vid, port.pid) {
            format!(" [VID:{vid:04X} PID:{pid:04X}]")
        } else {
            String::new()
        };

        let product_info = port
            .product
            .as_ref()
            .map(|p| format!(" - {p}"))
            .unwrap_or_default();

        result.push(format!("{}{}{}", port.name, device_info, product_info));
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn usb(name: &str, vid: u16, pid: u16) -> DetectedPort {
        DetectedPort {
            vid: Some(vid),
            pid: Some(pid),
            device: DeviceKind::from_vid_pid(vid, pid),
            ..DetectedPort::plain(name)
        }
    }

    #[test]
    fn test_device_kind_from_vid_pid() {
        assert_eq!(DeviceKind::from_vid_pid(0x0483, 0x5740), DeviceKind::Stm32Vcp);
        assert_eq!(DeviceKind::from_vid_pid(0x0483, 0xDF11), DeviceKind::Stm32Dfu);
        assert_eq!(DeviceKind::from_vid_pid(0x1209, 0x5741), DeviceKind::ArduPilot);
        assert_eq!(DeviceKind::from_vid_pid(0x26AC, 0x0011), DeviceKind::Px4);
        assert_eq!(DeviceKind::from_vid_pid(0x10C4, 0xEA60), DeviceKind::Cp210x);
        assert_eq!(DeviceKind::from_vid_pid(0x0403, 0x6001), DeviceKind::Ftdi);
        assert_eq!(DeviceKind::from_vid_pid(0x1A86, 0x7523), DeviceKind::Ch340);
        assert_eq!(DeviceKind::from_vid_pid(0x0483, 0x1234), DeviceKind::Unknown);
    }

    #[test]
    fn test_protocol_hints() {
        assert_eq!(DeviceKind::ArduPilot.protocol_hint(), Some(ProtocolHint::Mavlink));
        assert_eq!(DeviceKind::Stm32Vcp.protocol_hint(), Some(ProtocolHint::Msp));
        assert_eq!(DeviceKind::Cp210x.protocol_hint(), None);
        assert!(DeviceKind::Px4.is_flight_controller());
        assert!(!DeviceKind::Ftdi.is_flight_controller());
    }

    #[test]
    fn test_select_port_prefers_flight_controller() {
        let ports = vec![
            DetectedPort::plain("/dev/ttyS0"),
            usb("/dev/ttyUSB0", 0x10C4, 0xEA60),
            usb("/dev/ttyACM0", 0x1209, 0x5740),
        ];
        assert_eq!(select_port(&ports).unwrap().name, "/dev/ttyACM0");

        let bridges = vec![DetectedPort::plain("/dev/ttyS0"), usb("/dev/ttyUSB3", 0x0403, 0x6001)];
        assert_eq!(select_port(&bridges).unwrap().name, "/dev/ttyUSB3");

        let unknown_usb = vec![DetectedPort::plain("/dev/ttyS0"), usb("/dev/ttyACM7", 0xAAAA, 0x0001)];
        assert_eq!(select_port(&unknown_usb).unwrap().name, "/dev/ttyACM7");

        assert!(select_port(&[]).is_none());
    }

    #[test]
    fn test_format_port_list() {
        let mut fc = usb("/dev/ttyACM0", 0x0483, 0x5740);
        fc.product = Some("SPRacingH7".to_string());
        let ports = vec![fc, usb("/dev/ttyUSB1", 0xAAAA, 0x0001)];

        let formatted = format_port_list(&ports);
        assert_eq!(formatted.len(), 2);
        assert_eq!(formatted[0], "/dev/ttyACM0 [STM32 VCP] - SPRacingH7");
        assert_eq!(formatted[1], "/dev/ttyUSB1 [VID:AAAA PID:0001]");
    }
}
