//! Byte-stream transports to a flight controller.
//!
//! A [`Transport`] moves raw bytes with no framing. Serial, TCP and UDP
//! implementations are provided; the protocol layer only sees the trait.
//!
//! ```text
//! +-------------------+      +---------------------+
//! |  MavlinkParser /  | <--- | TransportDispatcher |  on_data / on_error
//! |  MspDecoder       |      +----------+----------+
//! +-------------------+                 |
//!                                       v
//!                        +--------------+--------------+
//!                        |       Transport trait       |
//!                        +----+----------+---------+---+
//!                             |          |         |
//!                          serial       tcp       udp
//! ```
//!
//! Error policy: any error on the underlying channel closes the transport.
//! Reopening is the caller's job.

pub mod serial;
pub mod tcp;
pub mod udp;

use std::fmt;
use std::io;
use std::str::FromStr;
use std::time::Duration;

use log::{debug, warn};

use crate::error::{Error, Result};

pub use serial::SerialConfig;
#[cfg(feature = "native")]
pub use serial::SerialTransport;
pub use tcp::TcpTransport;
pub use udp::UdpTransport;

/// Default baud rate for flight-controller serial links.
pub const DEFAULT_BAUD: u32 = 115_200;

/// Default TCP port (ArduPilot SITL serial 0).
pub const DEFAULT_TCP_PORT: u16 = 5760;

/// Default UDP port for MAVLink ground stations.
pub const DEFAULT_UDP_PORT: u16 = 14550;

/// Timeouts shared by all transports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TransportConfig {
    /// How long one `read_chunk` waits for data.
    pub read_timeout: Duration,
    /// How long a `write` may wait for the channel to accept data.
    pub write_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_millis(100),
            write_timeout: Duration::from_secs(1),
        }
    }
}

impl TransportConfig {
    /// Set the read timeout.
    #[must_use]
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Set the write timeout.
    #[must_use]
    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }
}

/// A byte-stream channel.
///
/// `open` and `close` are idempotent. After any channel error the
/// implementation reports `is_open() == false` until reopened.
pub trait Transport: Send {
    /// Open the channel. No-op when already open.
    fn open(&mut self) -> Result<()>;

    /// Close the channel. No-op when already closed.
    fn close(&mut self) -> Result<()>;

    /// Whether the channel is usable.
    fn is_open(&self) -> bool;

    /// Write every byte or fail with [`Error::WriteTimeout`].
    fn write(&mut self, data: &[u8]) -> Result<()>;

    /// Read whatever has arrived, waiting up to the read timeout.
    ///
    /// Returns `Ok(0)` if nothing arrived in time.
    fn read_chunk(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Drop any received bytes not yet read.
    fn discard_in_buffer(&mut self) -> Result<()>;

    /// Human-readable channel name.
    fn name(&self) -> &str;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn open(&mut self) -> Result<()> {
        (**self).open()
    }

    fn close(&mut self) -> Result<()> {
        (**self).close()
    }

    fn is_open(&self) -> bool {
        (**self).is_open()
    }

    fn write(&mut self, data: &[u8]) -> Result<()> {
        (**self).write(data)
    }

    fn read_chunk(&mut self, buf: &mut [u8]) -> Result<usize> {
        (**self).read_chunk(buf)
    }

    fn discard_in_buffer(&mut self) -> Result<()> {
        (**self).discard_in_buffer()
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}

/// Whether an I/O error just means "nothing right now".
pub(crate) fn is_timeout(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

/// Map a write failure, turning timeouts into [`Error::WriteTimeout`].
pub(crate) fn write_error(e: io::Error, timeout: Duration) -> Error {
    if is_timeout(&e) {
        Error::WriteTimeout(timeout)
    } else {
        Error::Io(e)
    }
}

/// Where to connect.
///
/// String forms: `serial:<path>[:<baud>]`, `tcp:<host>[:<port>]`,
/// `udp:<bind>[:<port>][@<remote>]`. A bare path is taken as serial.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Endpoint {
    /// Serial port.
    Serial {
        /// Port path.
        path: String,
        /// Baud rate.
        baud: u32,
    },
    /// TCP client.
    Tcp {
        /// Host name or address.
        host: String,
        /// Port.
        port: u16,
    },
    /// UDP socket.
    Udp {
        /// Local bind address.
        bind: String,
        /// Fixed remote. Replies go to the last sender when absent.
        remote: Option<String>,
    },
}

impl Endpoint {
    /// Build (but do not open) the transport.
    pub fn transport(&self, config: TransportConfig) -> Result<Box<dyn Transport>> {
        match self {
            #[cfg(feature = "native")]
            Self::Serial { path, baud } => Ok(Box::new(SerialTransport::new(
                SerialConfig::new(path.clone(), *baud),
                config,
            ))),
            #[cfg(not(feature = "native"))]
            Self::Serial { .. } => Err(Error::Unsupported(
                "serial transport requires the `native` feature".into(),
            )),
            Self::Tcp { host, port } => Ok(Box::new(TcpTransport::new(format!("{host}:{port}"), config))),
            Self::Udp { bind, remote } => {
                Ok(Box::new(UdpTransport::new(bind.clone(), remote.clone(), config)))
            },
        }
    }

    /// Build and open the transport.
    pub fn connect(&self, config: TransportConfig) -> Result<Box<dyn Transport>> {
        let mut transport = self.transport(config)?;
        debug!("Opening {self}");
        transport.open()?;
        Ok(transport)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Serial { path, baud } => write!(f, "serial:{path}:{baud}"),
            Self::Tcp { host, port } => write!(f, "tcp:{host}:{port}"),
            Self::Udp { bind, remote: None } => write!(f, "udp:{bind}"),
            Self::Udp {
                bind,
                remote: Some(remote),
            } => write!(f, "udp:{bind}@{remote}"),
        }
    }
}

impl FromStr for Endpoint {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Err(Error::Config("empty endpoint".into()));
        }

        if let Some(rest) = s.strip_prefix("tcp:") {
            let (host, port) = split_host_port(rest, DEFAULT_TCP_PORT)?;
            if host.is_empty() {
                return Err(Error::Config(format!("missing host in '{s}'")));
            }
            return Ok(Self::Tcp { host, port });
        }

        if let Some(rest) = s.strip_prefix("udp:") {
            let (local, remote) = match rest.split_once('@') {
                Some((l, r)) if !r.is_empty() => (l, Some(r)),
                Some(_) => return Err(Error::Config(format!("missing remote in '{s}'"))),
                None => (rest, None),
            };
            let bind = if let Ok(port) = local.parse::<u16>() {
                format!("0.0.0.0:{port}")
            } else {
                let (host, port) = split_host_port(local, DEFAULT_UDP_PORT)?;
                let host = if host.is_empty() { "0.0.0.0".to_string() } else { host };
                format!("{host}:{port}")
            };
            let remote = remote
                .map(|r| split_host_port(r, DEFAULT_UDP_PORT).map(|(h, p)| format!("{h}:{p}")))
                .transpose()?;
            return Ok(Self::Udp { bind, remote });
        }

        let rest = s.strip_prefix("serial:").unwrap_or(s);
        let (path, baud) = match rest.rsplit_once(':') {
            Some((path, baud)) if !path.is_empty() => match baud.parse::<u32>() {
                Ok(baud) if baud > 0 => (path.to_string(), baud),
                _ => (rest.to_string(), DEFAULT_BAUD),
            },
            _ => (rest.to_string(), DEFAULT_BAUD),
        };
        if path.is_empty() {
            return Err(Error::Config(format!("missing serial path in '{s}'")));
        }
        Ok(Self::Serial { path, baud })
    }
}

fn split_host_port(s: &str, default_port: u16) -> Result<(String, u16)> {
    match s.rsplit_once(':') {
        Some((host, port)) => {
            let port = port
                .parse::<u16>()
                .map_err(|_| Error::Config(format!("bad port in '{s}'")))?;
            Ok((host.to_string(), port))
        },
        None => Ok((s.to_string(), default_port)),
    }
}

/// Callback for incoming bytes.
pub type DataListener = Box<dyn FnMut(&[u8]) + Send>;

/// Callback for a channel failure.
pub type ErrorListener = Box<dyn FnOnce(&Error) + Send>;

/// Delivers incoming bytes from a transport to registered listeners.
///
/// Each [`pump`](Self::pump) performs at most one read and one delivery.
/// On a channel error the transport is closed and every listener is
/// deregistered before the error listeners run.
pub struct TransportDispatcher<T> {
    transport: T,
    data_listeners: Vec<DataListener>,
    error_listeners: Vec<ErrorListener>,
    buf: Vec<u8>,
}

impl<T: fmt::Debug> fmt::Debug for TransportDispatcher<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportDispatcher")
            .field("transport", &self.transport)
            .field("data_listeners", &self.data_listeners.len())
            .field("error_listeners", &self.error_listeners.len())
            .finish_non_exhaustive()
    }
}

impl<T: Transport> TransportDispatcher<T> {
    /// Read buffer size used by [`new`](Self::new).
    pub const DEFAULT_CHUNK: usize = 4096;

    /// Wrap a transport.
    pub fn new(transport: T) -> Self {
        Self::with_chunk_size(transport, Self::DEFAULT_CHUNK)
    }

    /// Wrap a transport with a custom read size.
    pub fn with_chunk_size(transport: T, chunk: usize) -> Self {
        Self {
            transport,
            data_listeners: Vec::new(),
            error_listeners: Vec::new(),
            buf: vec![0u8; chunk.max(1)],
        }
    }

    /// Register a data listener.
    pub fn on_data<F>(&mut self, listener: F)
    where
        F: FnMut(&[u8]) + Send + 'static,
    {
        self.data_listeners.push(Box::new(listener));
    }

    /// Register an error listener. Each runs at most once.
    pub fn on_error<F>(&mut self, listener: F)
    where
        F: FnOnce(&Error) + Send + 'static,
    {
        self.error_listeners.push(Box::new(listener));
    }

    /// Number of registered listeners (data, error).
    pub fn listener_count(&self) -> (usize, usize) {
        (self.data_listeners.len(), self.error_listeners.len())
    }

    /// Read once and hand the bytes to every data listener.
    ///
    /// Returns the number of bytes delivered.
    pub fn pump(&mut self) -> Result<usize> {
        if !self.transport.is_open() {
            return Err(Error::TransportClosed(self.transport.name().to_string()));
        }
        match self.transport.read_chunk(&mut self.buf) {
            Ok(0) => Ok(0),
            Ok(n) => {
                let chunk = &self.buf[..n];
                for listener in &mut self.data_listeners {
                    listener(chunk);
                }
                Ok(n)
            },
            Err(e) => Err(self.fail(e)),
        }
    }

    /// Write through the transport, applying the same teardown on failure.
    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        match self.transport.write(data) {
            Ok(()) => Ok(()),
            Err(e) => Err(self.fail(e)),
        }
    }

    fn fail(&mut self, error: Error) -> Error {
        warn!("{} failed: {error}", self.transport.name());
        if let Err(close_err) = self.transport.close() {
            debug!("Close after failure also failed: {close_err}");
        }
        self.data_listeners.clear();
        let listeners = std::mem::take(&mut self.error_listeners);
        for listener in listeners {
            listener(&error);
        }
        error
    }

    /// Underlying transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Underlying transport, mutably.
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Give back the transport, dropping all listeners.
    pub fn into_inner(self) -> T {
        self.transport
    }
}

#[cfg(test)]
pub(crate) mod mock {
    use std::collections::VecDeque;

    use super::*;

    /// In-memory transport with separate read and write sides.
    #[derive(Debug, Default)]
    pub(crate) struct MockTransport {
        pub(crate) read_buf: VecDeque<u8>,
        pub(crate) write_buf: Vec<u8>,
        pub(crate) open: bool,
        pub(crate) max_chunk: Option<usize>,
        pub(crate) fail_read: Option<io::ErrorKind>,
        pub(crate) fail_write: Option<io::ErrorKind>,
    }

    impl MockTransport {
        pub(crate) fn new(response: &[u8]) -> Self {
            Self {
                read_buf: response.iter().copied().collect(),
                open: true,
                ..Self::default()
            }
        }
    }

    impl Transport for MockTransport {
        fn open(&mut self) -> Result<()> {
            self.open = true;
            Ok(())
        }

        fn close(&mut self) -> Result<()> {
            self.open = false;
            Ok(())
        }

        fn is_open(&self) -> bool {
            self.open
        }

        fn write(&mut self, data: &[u8]) -> Result<()> {
            if !self.open {
                return Err(Error::TransportClosed("mock".into()));
            }
            if let Some(kind) = self.fail_write.take() {
                self.open = false;
                return Err(write_error(io::Error::new(kind, "mock"), Duration::from_millis(5)));
            }
            self.write_buf.extend_from_slice(data);
            Ok(())
        }

        fn read_chunk(&mut self, buf: &mut [u8]) -> Result<usize> {
            if !self.open {
                return Err(Error::TransportClosed("mock".into()));
            }
            if let Some(kind) = self.fail_read.take() {
                self.open = false;
                return Err(Error::Io(io::Error::new(kind, "mock")));
            }
            let limit = self.max_chunk.unwrap_or(usize::MAX);
            let n = buf.len().min(self.read_buf.len()).min(limit);
            for (slot, byte) in buf.iter_mut().zip(self.read_buf.drain(..n)) {
                *slot = byte;
            }
            Ok(n)
        }

        fn discard_in_buffer(&mut self) -> Result<()> {
            self.read_buf.clear();
            Ok(())
        }

        fn name(&self) -> &str {
            "mock"
        }
    }
}
