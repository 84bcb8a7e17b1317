//! Serial transport backed by the `serialport` crate.

#[cfg(feature = "native")]
use {
    super::{Transport, TransportConfig, is_timeout, write_error},
    crate::error::{Error, Result},
    log::{debug, trace},
    serialport::ClearBuffer,
    std::{
        io::{Read, Write},
        time::Duration,
    },
};

/// Serial line settings.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SerialConfig {
    /// Port name/path (e.g., "/dev/ttyACM0", "COM3").
    pub port_name: String,
    /// Baud rate. Ignored by USB CDC flight controllers but still required.
    pub baud_rate: u32,
    /// Data bits (typically 8).
    pub data_bits: DataBits,
    /// Parity (typically None).
    pub parity: Parity,
    /// Stop bits (typically One).
    pub stop_bits: StopBits,
    /// Flow control (typically None).
    pub flow_control: FlowControl,
    /// DTR level asserted after opening. Some boards only stream with DTR high.
    pub dtr_on_open: Option<bool>,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port_name: String::new(),
            baud_rate: super::DEFAULT_BAUD,
            data_bits: DataBits::Eight,
            parity: Parity::None,
            stop_bits: StopBits::One,
            flow_control: FlowControl::None,
            dtr_on_open: Some(true),
        }
    }
}

impl SerialConfig {
    /// Create a new configuration with port name and baud rate.
    pub fn new(port_name: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port_name: port_name.into(),
            baud_rate,
            ..Default::default()
        }
    }

    /// Set flow control.
    #[must_use]
    pub fn with_flow_control(mut self, flow_control: FlowControl) -> Self {
        self.flow_control = flow_control;
        self
    }

    /// Set the DTR level applied after opening (`None` leaves it alone).
    #[must_use]
    pub fn with_dtr_on_open(mut self, level: Option<bool>) -> Self {
        self.dtr_on_open = level;
        self
    }
}

/// Number of data bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum DataBits {
    /// 7 data bits.
    Seven,
    /// 8 data bits.
    #[default]
    Eight,
}

/// Parity checking mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Parity {
    /// No parity.
    #[default]
    None,
    /// Odd parity.
    Odd,
    /// Even parity.
    Even,
}

/// Number of stop bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum StopBits {
    /// 1 stop bit.
    #[default]
    One,
    /// 2 stop bits.
    Two,
}

/// Flow control mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum FlowControl {
    /// No flow control.
    #[default]
    None,
    /// Hardware flow control (RTS/CTS). Used by telemetry radios.
    Hardware,
}

/// Serial port transport.
#[cfg(feature = "native")]
pub struct SerialTransport {
    config: SerialConfig,
    timeouts: TransportConfig,
    port: Option<Box<dyn serialport::SerialPort>>,
}

#[cfg(feature = "native")]
impl std::fmt::Debug for SerialTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialTransport")
            .field("config", &self.config)
            .field("open", &self.port.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(feature = "native")]
impl SerialTransport {
    /// Create a closed serial transport.
    pub fn new(config: SerialConfig, timeouts: TransportConfig) -> Self {
        Self {
            config,
            timeouts,
            port: None,
        }
    }

    /// Line settings.
    pub fn config(&self) -> &SerialConfig {
        &self.config
    }

    /// Current baud rate.
    pub fn baud_rate(&self) -> u32 {
        self.config.baud_rate
    }

    /// Change the baud rate, on the open port as well if there is one.
    pub fn set_baud_rate(&mut self, baud_rate: u32) -> Result<()> {
        if let Some(ref mut p) = self.port {
            debug!("{}: baud {} -> {baud_rate}", self.config.port_name, self.config.baud_rate);
            if let Err(e) = p.set_baud_rate(baud_rate) {
                self.port = None;
                return Err(e.into());
            }
        }
        self.config.baud_rate = baud_rate;
        Ok(())
    }

    /// Set DTR (Data Terminal Ready) pin state.
    pub fn set_dtr(&mut self, level: bool) -> Result<()> {
        trace!("Setting DTR to {level}");
        let p = self.port_mut()?;
        if let Err(e) = p.write_data_terminal_ready(level) {
            self.port = None;
            return Err(e.into());
        }
        Ok(())
    }

    /// Set RTS (Request To Send) pin state.
    pub fn set_rts(&mut self, level: bool) -> Result<()> {
        trace!("Setting RTS to {level}");
        let p = self.port_mut()?;
        if let Err(e) = p.write_request_to_send(level) {
            self.port = None;
            return Err(e.into());
        }
        Ok(())
    }

    fn port_mut(&mut self) -> Result<&mut Box<dyn serialport::SerialPort>> {
        self.port
            .as_mut()
            .ok_or_else(|| Error::TransportClosed(self.config.port_name.clone()))
    }

    fn set_port_timeout(&mut self, timeout: Duration) -> Result<()> {
        let p = self.port_mut()?;
        p.set_timeout(timeout)?;
        Ok(())
    }
}

#[cfg(feature = "native")]
impl Transport for SerialTransport {
    fn open(&mut self) -> Result<()> {
        if self.port.is_some() {
            return Ok(());
        }
        let mut port = serialport::new(&self.config.port_name, self.config.baud_rate)
            .timeout(self.timeouts.read_timeout)
            .data_bits(self.config.data_bits.into())
            .parity(self.config.parity.into())
            .stop_bits(self.config.stop_bits.into())
            .flow_control(self.config.flow_control.into())
            .open()?;
        if let Some(level) = self.config.dtr_on_open {
            port.write_data_terminal_ready(level)?;
        }
        debug!(
            "Opened {} at {} baud",
            self.config.port_name, self.config.baud_rate
        );
        self.port = Some(port);
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        // Dropping the handle closes the port
        if self.port.take().is_some() {
            debug!("Closed {}", self.config.port_name);
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.port.is_some()
    }

    fn write(&mut self, data: &[u8]) -> Result<()> {
        let write_timeout = self.timeouts.write_timeout;
        let read_timeout = self.timeouts.read_timeout;
        self.set_port_timeout(write_timeout)?;

        let p = self.port_mut()?;
        let result = p.write_all(data).and_then(|()| p.flush());
        if let Err(e) = result {
            self.port = None;
            return Err(write_error(e, write_timeout));
        }
        self.set_port_timeout(read_timeout)
    }

    fn read_chunk(&mut self, buf: &mut [u8]) -> Result<usize> {
        let p = self.port_mut()?;
        match p.read(buf) {
            Ok(n) => Ok(n),
            Err(e) if is_timeout(&e) => Ok(0),
            Err(e) => {
                self.port = None;
                Err(Error::Io(e))
            },
        }
    }

    fn discard_in_buffer(&mut self) -> Result<()> {
        let p = self.port_mut()?;
        p.clear(ClearBuffer::Input)?;
        Ok(())
    }

    fn name(&self) -> &str {
        &self.config.port_name
    }
}

#[cfg(feature = "native")]
impl From<DataBits> for serialport::DataBits {
    fn from(bits: DataBits) -> Self {
        match bits {
            DataBits::Seven => Self::Seven,
            DataBits::Eight => Self::Eight,
        }
    }
}

#[cfg(feature = "native")]
impl From<Parity> for serialport::Parity {
    fn from(parity: Parity) -> Self {
        match parity {
            Parity::None => Self::None,
            Parity::Odd => Self::Odd,
            Parity::Even => Self::Even,
        }
    }
}

#[cfg(feature = "native")]
impl From<StopBits> for serialport::StopBits {
    fn from(bits: StopBits) -> Self {
        match bits {
            StopBits::One => Self::One,
            StopBits::Two => Self::Two,
        }
    }
}

#[cfg(feature = "native")]
impl From<FlowControl> for serialport::FlowControl {
    fn from(flow: FlowControl) -> Self {
        match flow {
            FlowControl::None => Self::None,
            FlowControl::Hardware => Self::Hardware,
        }
    }
}
