//! Configuration file support for groundlink.
//!
//! Configuration is loaded from multiple sources with the following priority (highest first):
//! 1. Command-line arguments
//! 2. Environment variables (GROUNDLINK_*)
//! 3. Local config file (./groundlink.toml)
//! 4. Global config file (~/.config/groundlink/config.toml)

use directories::ProjectDirs;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Local configuration file name.
pub const LOCAL_CONFIG_FILE: &str = "groundlink.toml";

/// USB device identification for port matching.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UsbDevice {
    /// USB Vendor ID.
    pub vid: u16,
    /// USB Product ID.
    pub pid: u16,
}

impl UsbDevice {
    /// Check if this device matches the given USB info.
    pub fn matches(&self, vid: u16, pid: u16) -> bool {
        self.vid == vid && self.pid == pid
    }
}

/// Connection configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Endpoint string (e.g. "udp:14550" or "serial:/dev/ttyACM0:57600").
    pub endpoint: Option<String>,
    /// Preferred serial port (e.g., "/dev/ttyACM0" or "COM3").
    pub serial: Option<String>,
    /// Default baud rate.
    pub baud: Option<u32>,
}

/// MAVLink settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MavlinkConfig {
    /// Signing key as 64 hex characters.
    pub signing_key: Option<String>,
    /// Reject truncated v2 payloads.
    #[serde(default)]
    pub strict_length: bool,
}

/// MSP settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MspConfig {
    /// Always frame requests as MSP v2.
    #[serde(default)]
    pub force_v2: bool,
}

/// DFU flashing settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DfuConfig {
    /// Read back after download (default on).
    pub verify: Option<bool>,
    /// Stay in the bootloader after flashing.
    #[serde(default)]
    pub leave_in_dfu: bool,
    /// Jump address used when leaving DFU.
    pub entry_address: Option<u32>,
}

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Connection settings.
    #[serde(default)]
    pub connection: ConnectionConfig,
    /// Extra USB devices treated as known for port selection.
    #[serde(default)]
    pub usb_device: Vec<UsbDevice>,
    /// MAVLink settings.
    #[serde(default)]
    pub mavlink: MavlinkConfig,
    /// MSP settings.
    #[serde(default)]
    pub msp: MspConfig,
    /// DFU settings.
    #[serde(default)]
    pub dfu: DfuConfig,
}

impl Config {
    /// Load configuration from all available sources.
    pub fn load() -> Self {
        let mut config = Self::default();

        if let Some(global_path) = Self::global_config_path() {
            if let Some(global_config) = Self::load_from_file(&global_path) {
                debug!("Loaded global config from {}", global_path.display());
                config.merge(global_config);
            }
        }

        if let Some(local_config) = Self::load_from_file(Path::new(LOCAL_CONFIG_FILE)) {
            debug!("Loaded local config from {LOCAL_CONFIG_FILE}");
            config.merge(local_config);
        }

        config
    }

    /// Load configuration from a specific file path (--config flag).
    pub fn load_from_path(path: &Path) -> Self {
        if let Some(config) = Self::load_from_file(path) {
            debug!("Loaded config from {}", path.display());
            config
        } else {
            warn!(
                "Could not load config from {}, using defaults",
                path.display()
            );
            Self::default()
        }
    }

    fn load_from_file(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }

        match fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => Some(config),
                Err(e) => {
                    warn!("Failed to parse config file {}: {}", path.display(), e);
                    None
                },
            },
            Err(e) => {
                warn!("Failed to read config file {}: {}", path.display(), e);
                None
            },
        }
    }

    /// Get the global configuration directory.
    pub fn global_config_dir() -> Option<PathBuf> {
        ProjectDirs::from("", "", "groundlink").map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Get the global configuration file path.
    pub fn global_config_path() -> Option<PathBuf> {
        Self::global_config_dir().map(|dir| dir.join("config.toml"))
    }

    /// Merge another config into this one.
    fn merge(&mut self, other: Self) {
        if other.connection.endpoint.is_some() {
            self.connection.endpoint = other.connection.endpoint;
        }
        if other.connection.serial.is_some() {
            self.connection.serial = other.connection.serial;
        }
        if other.connection.baud.is_some() {
            self.connection.baud = other.connection.baud;
        }
        for device in other.usb_device {
            if !self.usb_device.contains(&device) {
                self.usb_device.push(device);
            }
        }

        if other.mavlink.signing_key.is_some() {
            self.mavlink.signing_key = other.mavlink.signing_key;
        }
        if other.mavlink.strict_length {
            self.mavlink.strict_length = true;
        }
        if other.msp.force_v2 {
            self.msp.force_v2 = true;
        }

        if other.dfu.verify.is_some() {
            self.dfu.verify = other.dfu.verify;
        }
        if other.dfu.leave_in_dfu {
            self.dfu.leave_in_dfu = true;
        }
        if other.dfu.entry_address.is_some() {
            self.dfu.entry_address = other.dfu.entry_address;
        }
    }

    /// Save USB device for future auto-detection.
    pub fn remember_usb_device(&mut self, vid: u16, pid: u16) -> anyhow::Result<()> {
        let device = UsbDevice { vid, pid };
        if self.usb_device.contains(&device) {
            return Ok(());
        }

        let path = if Path::new(LOCAL_CONFIG_FILE).exists() {
            PathBuf::from(LOCAL_CONFIG_FILE)
        } else if let Some(global_path) = Self::global_config_path() {
            if let Some(dir) = global_path.parent() {
                fs::create_dir_all(dir)?;
            }
            global_path
        } else {
            PathBuf::from(LOCAL_CONFIG_FILE)
        };

        // Re-read the target so unrelated settings in it survive.
        let mut on_disk = Self::load_from_file(&path).unwrap_or_default();
        on_disk.usb_device.push(device.clone());
        self.usb_device.push(device);

        let content = toml::to_string_pretty(&on_disk)?;
        fs::write(&path, content)?;
        info!("Saved USB device to {}", path.display());

        Ok(())
    }
}
