//! Deterministic test support: a transport that captures every datagram
//! instead of touching a socket.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;

use iax_proto::Frame;

use crate::transport::Transport;

/// Records outbound datagrams for inspection; never fails, never blocks.
pub struct MockTransport {
    local: SocketAddr,
    sent: Mutex<Vec<(Vec<u8>, SocketAddr)>>,
}

impl MockTransport {
    pub fn new(local: SocketAddr) -> Arc<Self> {
        Arc::new(MockTransport {
            local,
            sent: Mutex::new(Vec::new()),
        })
    }

    /// Drain everything captured so far.
    pub fn take_sent(&self) -> Vec<(Vec<u8>, SocketAddr)> {
        std::mem::take(&mut *self.sent.lock())
    }

    /// Drain and decode; panics on undecodable bytes since tests only
    /// ever send well-formed frames.
    pub fn take_frames(&self) -> Vec<Frame> {
        self.take_sent()
            .into_iter()
            .map(|(bytes, _)| Frame::decode(&bytes).expect("captured frame decodes"))
            .collect()
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().len()
    }
}

impl Transport for MockTransport {
    fn send_to(&self, buf: &[u8], addr: SocketAddr) -> io::Result<usize> {
        self.sent.lock().push((buf.to_vec(), addr));
        Ok(buf.len())
    }

    fn local_addr(&self) -> SocketAddr {
        self.local
    }
}
