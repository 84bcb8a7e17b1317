//! TCP client transport (SITL, network telemetry bridges).

use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use log::debug;

use super::{Transport, TransportConfig, is_timeout, write_error};
use crate::error::{Error, Result};

/// TCP client transport.
#[derive(Debug)]
pub struct TcpTransport {
    addr: String,
    timeouts: TransportConfig,
    stream: Option<TcpStream>,
}

/// `set_*_timeout` rejects zero; treat zero as "block".
fn socket_timeout(d: Duration) -> Option<Duration> {
    (!d.is_zero()).then_some(d)
}

impl TcpTransport {
    /// Create a closed transport for `host:port`.
    pub fn new(addr: impl Into<String>, timeouts: TransportConfig) -> Self {
        Self {
            addr: addr.into(),
            timeouts,
            stream: None,
        }
    }

    /// Wrap an already connected stream.
    pub fn from_stream(stream: TcpStream, timeouts: TransportConfig) -> Result<Self> {
        let addr = stream.peer_addr()?.to_string();
        configure(&stream, timeouts)?;
        Ok(Self {
            addr,
            timeouts,
            stream: Some(stream),
        })
    }

    fn stream_mut(&mut self) -> Result<&mut TcpStream> {
        self.stream
            .as_mut()
            .ok_or_else(|| Error::TransportClosed(self.addr.clone()))
    }
}

fn configure(stream: &TcpStream, timeouts: TransportConfig) -> io::Result<()> {
    stream.set_read_timeout(socket_timeout(timeouts.read_timeout))?;
    stream.set_write_timeout(socket_timeout(timeouts.write_timeout))?;
    stream.set_nodelay(true)
}

impl Transport for TcpTransport {
    fn open(&mut self) -> Result<()> {
        if self.stream.is_some() {
            return Ok(());
        }
        let mut last_err = None;
        for addr in self.addr.to_socket_addrs()? {
            let connect_timeout = socket_timeout(self.timeouts.write_timeout).unwrap_or(Duration::from_secs(5));
            match TcpStream::connect_timeout(&addr, connect_timeout) {
                Ok(stream) => {
                    configure(&stream, self.timeouts)?;
                    debug!("Connected to {addr}");
                    self.stream = Some(stream);
                    return Ok(());
                },
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.map_or_else(
            || Error::Config(format!("'{}' resolved to no addresses", self.addr)),
            Error::Io,
        ))
    }

    fn close(&mut self) -> Result<()> {
        if let Some(stream) = self.stream.take() {
            // Peer may already be gone
            let _ = stream.shutdown(std::net::Shutdown::Both);
            debug!("Closed {}", self.addr);
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    fn write(&mut self, data: &[u8]) -> Result<()> {
        let timeout = self.timeouts.write_timeout;
        let stream = self.stream_mut()?;
        if let Err(e) = stream.write_all(data).and_then(|()| stream.flush()) {
            self.stream = None;
            return Err(write_error(e, timeout));
        }
        Ok(())
    }

    fn read_chunk(&mut self, buf: &mut [u8]) -> Result<usize> {
        let stream = self.stream_mut()?;
        match stream.read(buf) {
            Ok(0) if !buf.is_empty() => {
                self.stream = None;
                Err(Error::TransportClosed(format!("{}: connection closed by peer", self.addr)))
            },
            Ok(n) => Ok(n),
            Err(e) if is_timeout(&e) => Ok(0),
            Err(e) => {
                self.stream = None;
                Err(Error::Io(e))
            },
        }
    }

    fn discard_in_buffer(&mut self) -> Result<()> {
        let stream = self.stream_mut()?;
        stream.set_nonblocking(true)?;
        let mut scratch = [0u8; 1024];
        let drained = loop {
            match stream.read(&mut scratch) {
                Ok(0) => break Ok(()),
                Ok(_) => {},
                Err(e) if is_timeout(&e) => break Ok(()),
                Err(e) => break Err(e),
            }
        };
        stream.set_nonblocking(false)?;
        drained.map_err(Error::Io)
    }

    fn name(&self) -> &str {
        &self.addr
    }
}

#[cfg(test)]
mod tests {
    use std::net::TcpListener;

    use super::*;

    fn quick() -> TransportConfig {
        TransportConfig::default()
            .with_read_timeout(Duration::from_millis(50))
            .with_write_timeout(Duration::from_millis(500))
    }

    #[test]
    fn test_loopback_exchange() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let mut client = TcpTransport::new(addr.to_string(), quick());
        client.open().unwrap();
        client.open().unwrap();
        assert!(client.is_open());

        let (mut server, _) = listener.accept().unwrap();
        server.write_all(b"\xFD\x00ping").unwrap();

        let mut buf = [0u8; 64];
        let mut got = Vec::new();
        for _ in 0..20 {
            let n = client.read_chunk(&mut buf).unwrap();
            got.extend_from_slice(&buf[..n]);
            if got.len() >= 6 {
                break;
            }
        }
        assert_eq!(got, b"\xFD\x00ping");

        client.write(b"pong").unwrap();
        let mut reply = [0u8; 4];
        server.read_exact(&mut reply).unwrap();
        assert_eq!(&reply, b"pong");
    }

    #[test]
    fn test_peer_close_closes_transport() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let mut client = TcpTransport::new(addr.to_string(), quick());
        client.open().unwrap();
        drop(listener.accept().unwrap());

        let mut buf = [0u8; 16];
        let mut result = client.read_chunk(&mut buf);
        for _ in 0..20 {
            if result.is_err() {
                break;
            }
            result = client.read_chunk(&mut buf);
        }
        assert!(matches!(result, Err(Error::TransportClosed(_)) | Err(Error::Io(_))));
        assert!(!client.is_open());
        client.close().unwrap();
    }

    #[test]
    fn test_read_timeout_yields_zero() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut client = TcpTransport::new(listener.local_addr().unwrap().to_string(), quick());
        client.open().unwrap();
        let _server = listener.accept().unwrap();

        let mut buf = [0u8; 16];
        assert_eq!(client.read_chunk(&mut buf).unwrap(), 0);
        client.discard_in_buffer().unwrap();
    }
}
