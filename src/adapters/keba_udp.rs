use std::io::ErrorKind;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::time::Duration;

use thiserror::Error;

const UDP_BUFFER_SIZE: usize = 4096;
const MIN_READ_TIMEOUT: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    pub payload: Vec<u8>,
    pub from: SocketAddr,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Received {
    Datagram(Datagram),
    TimedOut,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to resolve KEBA endpoint: {0}")]
    Resolve(std::io::Error),
    #[error("failed to bind local UDP port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },
    #[error("udp communication failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid replay script: {0}")]
    Script(String),
}

/// Raw datagram exchange with one fixed peer. No retry or validation.
pub trait Transport {
    fn peer(&self) -> SocketAddr;
    fn send(&mut self, payload: &[u8]) -> Result<(), TransportError>;
    fn receive(&mut self, timeout: Duration) -> Result<Received, TransportError>;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn peer(&self) -> SocketAddr {
        (**self).peer()
    }

    fn send(&mut self, payload: &[u8]) -> Result<(), TransportError> {
        (**self).send(payload)
    }

    fn receive(&mut self, timeout: Duration) -> Result<Received, TransportError> {
        (**self).receive(timeout)
    }
}

#[derive(Debug)]
pub struct UdpTransport {
    socket: UdpSocket,
    peer: SocketAddr,
}

impl UdpTransport {
    /// Binds the local port to the device's own port number; the device does
    /// not answer requests coming from any other port.
    pub fn for_device(host: &str, port: u16) -> Result<Self, TransportError> {
        let peer = resolve_peer(host, port)?;
        let local = SocketAddr::from(([0, 0, 0, 0], port));
        Self::bind(local, peer)
    }

    pub fn bind(local: SocketAddr, peer: SocketAddr) -> Result<Self, TransportError> {
        let socket = UdpSocket::bind(local).map_err(|source| TransportError::Bind {
            port: local.port(),
            source,
        })?;

        tracing::debug!(local = %local, peer = %peer, "udp transport bound");

        Ok(Self { socket, peer })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        self.socket.local_addr().map_err(TransportError::from)
    }
}

impl Transport for UdpTransport {
    fn peer(&self) -> SocketAddr {
        self.peer
    }

    fn send(&mut self, payload: &[u8]) -> Result<(), TransportError> {
        self.socket.send_to(payload, self.peer)?;
        Ok(())
    }

    fn receive(&mut self, timeout: Duration) -> Result<Received, TransportError> {
        self.socket
            .set_read_timeout(Some(timeout.max(MIN_READ_TIMEOUT)))?;

        let mut buffer = [0_u8; UDP_BUFFER_SIZE];
        match self.socket.recv_from(&mut buffer) {
            Ok((size, from)) => Ok(Received::Datagram(Datagram {
                payload: buffer[..size].to_vec(),
                from,
            })),
            Err(error) if matches!(error.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                Ok(Received::TimedOut)
            }
            Err(error) => Err(TransportError::Io(error)),
        }
    }
}

pub fn resolve_peer(host: &str, port: u16) -> Result<SocketAddr, TransportError> {
    let mut addrs = format!("{host}:{port}")
        .to_socket_addrs()
        .map_err(TransportError::Resolve)?;
    addrs.next().ok_or_else(|| {
        TransportError::Resolve(std::io::Error::new(
            ErrorKind::AddrNotAvailable,
            "no socket address resolved for KEBA endpoint",
        ))
    })
}
