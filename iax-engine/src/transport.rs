//! Datagram transport abstraction.
//!
//! The engine and every transaction write through `dyn Transport`, so the
//! whole stack runs against a captured in-memory transport in tests and a
//! real UDP socket in production.

use std::io;
use std::net::{SocketAddr, SocketAddrV4, UdpSocket};
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};

pub trait Transport: Send + Sync {
    fn send_to(&self, buf: &[u8], addr: SocketAddr) -> io::Result<usize>;
    fn local_addr(&self) -> SocketAddr;
}

/// A bound UDP socket with the engine's socket options applied.
pub struct UdpTransport {
    socket: UdpSocket,
    local: SocketAddr,
}

impl UdpTransport {
    /// Bind per the engine configuration: TOS and receive-buffer options
    /// first, then the address, falling back to an ephemeral port when
    /// `force_bind` is set and the configured port is taken.
    pub fn bind(config: &EngineConfig) -> EngineResult<Self> {
        let want = SocketAddrV4::new(config.addr, config.port);
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
            .map_err(EngineError::Socket)?;
        if config.tos != 0 {
            if let Err(err) = socket.set_tos(config.tos) {
                warn!(tos = config.tos, %err, "failed to set socket TOS");
            }
        }
        if config.stream_readbuffer != 0 {
            if let Err(err) = socket.set_recv_buffer_size(config.stream_readbuffer) {
                warn!(size = config.stream_readbuffer, %err, "failed to set receive buffer");
            }
        }
        let bound = match socket.bind(&SocketAddr::V4(want).into()) {
            Ok(()) => Ok(()),
            Err(err) if config.force_bind => {
                debug!(addr = %want, %err, "configured port taken, falling back to ephemeral");
                let fallback = SocketAddrV4::new(config.addr, 0);
                socket.bind(&SocketAddr::V4(fallback).into())
            }
            Err(err) => Err(err),
        };
        bound.map_err(|source| EngineError::BindFailed {
            addr: SocketAddr::V4(want),
            source,
        })?;

        let socket: UdpSocket = socket.into();
        // Listener threads poll the shutdown flag between reads.
        socket
            .set_read_timeout(Some(Duration::from_millis(100)))
            .map_err(EngineError::Socket)?;
        let local = socket.local_addr().map_err(EngineError::Socket)?;
        Ok(UdpTransport { socket, local })
    }

    /// Blocking receive honoring the poll timeout; `None` on timeout.
    pub fn recv_from(&self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>> {
        match self.socket.recv_from(buf) {
            Ok((len, addr)) => Ok(Some((len, addr))),
            Err(err)
                if err.kind() == io::ErrorKind::WouldBlock
                    || err.kind() == io::ErrorKind::TimedOut =>
            {
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }
}

impl Transport for UdpTransport {
    fn send_to(&self, buf: &[u8], addr: SocketAddr) -> io::Result<usize> {
        self.socket.send_to(buf, addr)
    }

    fn local_addr(&self) -> SocketAddr {
        self.local
    }
}
