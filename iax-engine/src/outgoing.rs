//! A sent full frame waiting in the reliability queue.

use std::time::{Duration, Instant};

use iax_proto::constants::{FrameType, IaxControl};
use iax_proto::{FullFrame, IeList, ProtoResult};

/// One full frame on the wire, tracked until the peer acknowledges or
/// answers it, retransmitted on a doubling interval until its budget is
/// spent.
#[derive(Debug)]
pub(crate) struct FrameOut {
    pub full: FullFrame,
    wire: Vec<u8>,
    /// An ACK fully satisfies this frame; no higher-level response is
    /// expected.
    pub ack_only: bool,
    pub acked: bool,
    /// Retransmissions remaining.
    pub retries_left: u32,
    /// The budget this frame started with.
    pub initial_retries: u32,
    interval: Duration,
    pub next_retrans: Instant,
    /// Absolute response deadline granted on top of the retransmission
    /// schedule (challenge wait).
    pub abs_timeout: Option<Instant>,
}

impl FrameOut {
    pub fn new(
        full: FullFrame,
        retries: u32,
        interval: Duration,
        ack_only: bool,
        now: Instant,
    ) -> ProtoResult<Self> {
        let mut wire = Vec::new();
        full.encode(&mut wire)?;
        Ok(FrameOut {
            full,
            wire,
            ack_only,
            acked: false,
            retries_left: retries,
            initial_retries: retries,
            interval,
            next_retrans: now + interval,
            abs_timeout: None,
        })
    }

    pub fn wire(&self) -> &[u8] {
        &self.wire
    }

    pub fn is_iax(&self, subclass: IaxControl) -> bool {
        self.full.frame_type == FrameType::Iax && self.full.subclass == subclass as u32
    }

    /// Past the retransmission (or absolute) deadline?
    pub fn due(&self, now: Instant) -> bool {
        match self.abs_timeout {
            Some(abs) => now >= abs && now >= self.next_retrans,
            None => now >= self.next_retrans,
        }
    }

    pub fn exhausted(&self) -> bool {
        self.retries_left == 0
    }

    pub fn never_retransmitted(&self) -> bool {
        self.retries_left == self.initial_retries
    }

    /// Burn one retransmission: set the wire retransmit bit, double the
    /// interval, reschedule.
    pub fn consume_retransmission(&mut self, now: Instant) {
        self.full.retrans = true;
        // High bit of the destination-call-number field.
        self.wire[2] |= 0x80;
        self.retries_left = self.retries_left.saturating_sub(1);
        self.interval *= 2;
        self.next_retrans = now + self.interval;
    }

    /// Replace the IE payload of a queued frame (call-token retry) and
    /// refresh the cached wire image.
    pub fn replace_ies(&mut self, ies: &IeList) -> ProtoResult<()> {
        self.full.payload = ies.to_bytes()?;
        let mut wire = Vec::new();
        self.full.encode(&mut wire)?;
        self.wire = wire;
        Ok(())
    }
}
