//! Outbound meta-trunk aggregation: one buffer per remote endpoint,
//! filled by `send_media` across calls and flushed by a trunk thread at a
//! fixed cadence.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use smallvec::SmallVec;
use tracing::{debug, warn};

use iax_proto::{Frame, MetaTrunkFrame, TrunkEntry};

use crate::time::TimeProvider;
use crate::transport::Transport;

pub struct TrunkFrame {
    addr: SocketAddr,
    send_interval: Duration,
    max_len: usize,
    with_timestamps: bool,
    transport: Arc<dyn Transport>,
    created: Instant,
    inner: Mutex<TrunkBuf>,
}

impl std::fmt::Debug for TrunkFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrunkFrame")
            .field("addr", &self.addr)
            .field("send_interval", &self.send_interval)
            .field("max_len", &self.max_len)
            .field("with_timestamps", &self.with_timestamps)
            .field("created", &self.created)
            .finish()
    }
}

struct TrunkBuf {
    entries: SmallVec<[TrunkEntry; 8]>,
    /// Wire length of the frame being built.
    bytes: usize,
    /// Entries added since the last flush.
    dirty: bool,
    /// Transactions currently feeding this trunk.
    calls: u32,
    next_send: Instant,
}

impl TrunkFrame {
    pub fn new(
        addr: SocketAddr,
        send_interval: Duration,
        max_len: usize,
        with_timestamps: bool,
        transport: Arc<dyn Transport>,
        time: &dyn TimeProvider,
    ) -> Self {
        let now = time.now_instant();
        TrunkFrame {
            addr,
            send_interval,
            max_len,
            with_timestamps,
            transport,
            created: now,
            inner: Mutex::new(TrunkBuf {
                entries: SmallVec::new(),
                bytes: iax_proto::frame::META_TRUNK_HEADER_LEN,
                dirty: false,
                calls: 0,
                next_send: now + send_interval,
            }),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn send_interval(&self) -> Duration {
        self.send_interval
    }

    /// Number of transactions feeding this trunk.
    pub fn calls(&self) -> u32 {
        self.inner.lock().calls
    }

    pub fn attach(&self) {
        self.inner.lock().calls += 1;
    }

    pub fn detach(&self) {
        let mut buf = self.inner.lock();
        buf.calls = buf.calls.saturating_sub(1);
    }

    /// Append one call's media. Flushes first when the entry would push
    /// the frame past its size cap. Returns the payload bytes queued.
    pub fn add(&self, src_call: u16, payload: &[u8], timestamp: u32, now: Instant) -> usize {
        let entry_len = payload.len() + if self.with_timestamps { 6 } else { 4 };
        let mut buf = self.inner.lock();
        if buf.bytes + entry_len > self.max_len && buf.dirty {
            self.flush_locked(&mut buf, now);
        }
        buf.entries.push(TrunkEntry {
            src_call,
            timestamp: self.with_timestamps.then_some(timestamp as u16),
            payload: payload.to_vec(),
        });
        buf.bytes += entry_len;
        buf.dirty = true;
        payload.len()
    }

    /// Immediate flush, used to keep media order when a call must emit a
    /// full frame.
    pub fn send_now(&self, now: Instant) -> bool {
        let mut buf = self.inner.lock();
        self.flush_locked(&mut buf, now)
    }

    /// Timer-driven flush.
    pub fn flush_due(&self, now: Instant) -> bool {
        let mut buf = self.inner.lock();
        if now < buf.next_send {
            return false;
        }
        buf.next_send = now + self.send_interval;
        self.flush_locked(&mut buf, now)
    }

    pub fn next_send(&self) -> Instant {
        self.inner.lock().next_send
    }

    fn flush_locked(&self, buf: &mut TrunkBuf, now: Instant) -> bool {
        if !buf.dirty {
            return false;
        }
        let mut frame = MetaTrunkFrame::new(
            now.duration_since(self.created).as_millis() as u32,
            self.with_timestamps,
        );
        frame.entries = std::mem::take(&mut buf.entries);
        buf.bytes = iax_proto::frame::META_TRUNK_HEADER_LEN;
        buf.dirty = false;
        let count = frame.entries.len();
        match Frame::MetaTrunk(frame).to_bytes() {
            Ok(bytes) => {
                debug!(addr = %self.addr, entries = count, len = bytes.len(), "flushing trunk frame");
                if let Err(err) = self.transport.send_to(&bytes, self.addr) {
                    warn!(addr = %self.addr, %err, "trunk frame send failed");
                    return false;
                }
                true
            }
            Err(err) => {
                warn!(addr = %self.addr, %err, "trunk frame encode failed");
                false
            }
        }
    }
}
