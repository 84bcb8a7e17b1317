//! UDP transport.
//!
//! With a fixed remote every datagram goes there. Without one the socket
//! acts like a ground-station listener: it replies to whoever sent last.

use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::time::Duration;

use log::{debug, trace};

use super::{Transport, TransportConfig, is_timeout, write_error};
use crate::error::{Error, Result};

/// UDP transport.
#[derive(Debug)]
pub struct UdpTransport {
    bind: String,
    remote: Option<String>,
    timeouts: TransportConfig,
    socket: Option<UdpSocket>,
    target: Option<SocketAddr>,
}

fn resolve(addr: &str) -> Result<SocketAddr> {
    addr.to_socket_addrs()?
        .next()
        .ok_or_else(|| Error::Config(format!("'{addr}' resolved to no addresses")))
}

impl UdpTransport {
    /// Create a closed transport.
    pub fn new(bind: impl Into<String>, remote: Option<String>, timeouts: TransportConfig) -> Self {
        Self {
            bind: bind.into(),
            remote,
            timeouts,
            socket: None,
            target: None,
        }
    }

    /// Where outgoing datagrams currently go.
    pub fn peer(&self) -> Option<SocketAddr> {
        self.target
    }

    /// Local address once open.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        let socket = self
            .socket
            .as_ref()
            .ok_or_else(|| Error::TransportClosed(self.bind.clone()))?;
        Ok(socket.local_addr()?)
    }

    fn socket(&self) -> Result<&UdpSocket> {
        self.socket
            .as_ref()
            .ok_or_else(|| Error::TransportClosed(self.bind.clone()))
    }
}

fn non_zero(d: Duration) -> Option<Duration> {
    (!d.is_zero()).then_some(d)
}

impl Transport for UdpTransport {
    fn open(&mut self) -> Result<()> {
        if self.socket.is_some() {
            return Ok(());
        }
        let socket = UdpSocket::bind(resolve(&self.bind)?)?;
        socket.set_read_timeout(non_zero(self.timeouts.read_timeout))?;
        socket.set_write_timeout(non_zero(self.timeouts.write_timeout))?;
        self.target = self.remote.as_deref().map(resolve).transpose()?;
        debug!(
            "Bound {} (remote {:?})",
            socket.local_addr()?,
            self.target
        );
        self.socket = Some(socket);
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if self.socket.take().is_some() {
            debug!("Closed {}", self.bind);
        }
        if self.remote.is_none() {
            self.target = None;
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.socket.is_some()
    }

    fn write(&mut self, data: &[u8]) -> Result<()> {
        let timeout = self.timeouts.write_timeout;
        let Some(target) = self.target else {
            self.socket()?;
            debug!("No UDP peer yet, dropping {} bytes", data.len());
            return Ok(());
        };
        let sent = self.socket()?.send_to(data, target);
        match sent {
            Ok(_) => Ok(()),
            Err(e) => {
                self.socket = None;
                Err(write_error(e, timeout))
            },
        }
    }

    fn read_chunk(&mut self, buf: &mut [u8]) -> Result<usize> {
        let received = self.socket()?.recv_from(buf);
        match received {
            Ok((n, from)) => {
                if self.remote.is_none() && self.target != Some(from) {
                    trace!("UDP peer is now {from}");
                    self.target = Some(from);
                }
                Ok(n)
            },
            Err(e) if is_timeout(&e) => Ok(0),
            Err(e) => {
                self.socket = None;
                Err(Error::Io(e))
            },
        }
    }

    fn discard_in_buffer(&mut self) -> Result<()> {
        let socket = self.socket()?;
        socket.set_nonblocking(true)?;
        let mut scratch = [0u8; 2048];
        let drained = loop {
            match socket.recv_from(&mut scratch) {
                Ok(_) => {},
                Err(e) if is_timeout(&e) => break Ok(()),
                Err(e) => break Err(e),
            }
        };
        socket.set_nonblocking(false)?;
        drained.map_err(Error::Io)
    }

    fn name(&self) -> &str {
        &self.bind
    }
}
