//! One end of one IAX2 call, registration or poke exchange: the per-call
//! state machine, the full-frame reliability layer, and the media send
//! and receive paths.
//!
//! Frames arrive from the engine through [`Transaction::process_frame`];
//! the state machine advances when an event thread calls
//! [`Transaction::get_event`], which also drives acks, retransmissions,
//! pings and timeouts. Owner commands (`send_accept`, `send_hangup`,
//! `send_media`, …) post frames into the reliability queue.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use tracing::{debug, info, warn};

use iax_proto::constants::format::{self, MediaType};
use iax_proto::constants::{ControlType, FrameType, IaxControl};
use iax_proto::{ie_tag, Frame, FullFrame, IeList, MetaVideoFrame, MiniFrame};

use crate::auth;
use crate::config::TransactionConfig;
use crate::engine::EngineHooks;
use crate::event::{Event, EventKind};
use crate::media::{widen_timestamp, MediaBucket, MediaSink, MediaStats, Widened};
use crate::outgoing::FrameOut;
use crate::time::TimeProvider;
use crate::transport::Transport;
use crate::trunk::TrunkFrame;

const NO_AUTH_METHOD: &str = "Unsupported or missing authentication method or missing challenge";
const NO_MEDIA_FORMAT: &str = "Unsupported or missing media format or capability";
const NO_USERNAME: &str = "Username is missing";
const VOICE_BEFORE_ACCEPT: &str = "Received full Voice before Accept";
const BAD_VERSION: &str = "Unsupported or missing protocol version";

/// Limit on voice-VNAK requests sent while minis arrive before the first
/// full voice frame.
const MAX_VOICE_VNAK: u32 = 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionType {
    New,
    RegReq,
    RegRel,
    Poke,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    Unknown,
    NewLocalInvite,
    NewLocalInviteAuthRecv,
    NewLocalInviteRepSent,
    NewRemoteInvite,
    NewRemoteInviteAuthSent,
    NewRemoteInviteRepRecv,
    Connected,
    Terminating,
    Terminated,
}

/// The object a transaction reports to. Held weakly so an owner dropping
/// its transaction reference breaks the cycle (the owner keeps the strong
/// side).
pub trait TransactionOwner: Send + Sync {
    fn on_event(&self, transaction: &Arc<Transaction>, event: Event);
}

struct NoOwner;

impl TransactionOwner for NoOwner {
    fn on_event(&self, _transaction: &Arc<Transaction>, _event: Event) {}
}

fn no_owner() -> Weak<dyn TransactionOwner> {
    Weak::<NoOwner>::new()
}

/// Parameters of a locally started transaction.
#[derive(Debug, Clone, Default)]
pub struct CallParams {
    pub username: Option<String>,
    pub calling_number: Option<String>,
    pub calling_name: Option<String>,
    pub called_number: Option<String>,
    pub called_context: Option<String>,
    pub format: u32,
    pub capability: u32,
    /// Registration refresh request in seconds.
    pub refresh: u32,
    /// Append an empty CALLTOKEN IE to the first frame.
    pub call_token: bool,
}

struct Inner {
    state: State,
    remote_call: u16,
    oseq: u8,
    iseq: u8,
    /// Highest acked inbound oseq, guarded by the wrap rule.
    last_ack: u32,
    last_full_out_ts: u32,
    in_frames: VecDeque<FullFrame>,
    out_frames: Vec<FrameOut>,
    pending_event: Option<Event>,
    destroy: bool,
    accepted: bool,
    /// The local side asked for termination; we are draining our own
    /// final frame's acks.
    local_req_end: bool,
    terminate_at: Option<Instant>,
    next_ping: Option<Instant>,
    in_total: u64,
    in_oo: u64,
    in_dropped: u64,
    req_voice_vnak: u32,
    /// Expected iseq already claimed by a VNAK, so one gap asks once.
    last_vnak: Option<u8>,

    username: Option<String>,
    calling_number: Option<String>,
    calling_name: Option<String>,
    called_number: Option<String>,
    called_context: Option<String>,
    challenge: Option<String>,
    auth_data: Option<String>,
    expire: u32,

    /// Negotiated formats and the peer capability intersection.
    fmt_audio: u32,
    fmt_video: u32,
    capability: u32,
    /// The first outgoing frame carried a CALLTOKEN IE and may be
    /// restarted with a server-issued token.
    call_token_pending: bool,
}

pub struct Transaction {
    local_call: u16,
    remote_addr: SocketAddr,
    trans_type: TransactionType,
    outgoing_side: bool,
    created: Instant,
    cfg: TransactionConfig,
    time: Arc<dyn TimeProvider>,
    transport: Arc<dyn Transport>,
    hooks: Arc<dyn EngineHooks>,
    rng: Mutex<StdRng>,
    pub(crate) audio: MediaBucket,
    pub(crate) video: MediaBucket,
    owner: Mutex<Weak<dyn TransactionOwner>>,
    /// One event-thread pass owns the transaction at a time.
    pumping: AtomicBool,
    inner: Mutex<Inner>,
}

#[allow(clippy::too_many_arguments)]
impl Transaction {
    pub(crate) fn outgoing(
        trans_type: TransactionType,
        local_call: u16,
        remote_addr: SocketAddr,
        params: CallParams,
        cfg: TransactionConfig,
        transport: Arc<dyn Transport>,
        time: Arc<dyn TimeProvider>,
        hooks: Arc<dyn EngineHooks>,
        rng: StdRng,
    ) -> Arc<Self> {
        let now = time.now_instant();
        let tr = Arc::new(Transaction {
            local_call,
            remote_addr,
            trans_type,
            outgoing_side: true,
            created: now,
            cfg,
            time,
            transport,
            hooks,
            rng: Mutex::new(rng),
            audio: MediaBucket::new(MediaType::Audio),
            video: MediaBucket::new(MediaType::Video),
            owner: Mutex::new(no_owner()),
            pumping: AtomicBool::new(false),
            inner: Mutex::new(Inner::new(State::Unknown, 0, &params)),
        });
        debug!(
            call = local_call,
            remote = %remote_addr,
            kind = ?trans_type,
            "outgoing transaction created"
        );
        tr
    }

    pub(crate) fn incoming(
        first: FullFrame,
        local_call: u16,
        remote_addr: SocketAddr,
        params: CallParams,
        cfg: TransactionConfig,
        transport: Arc<dyn Transport>,
        time: Arc<dyn TimeProvider>,
        hooks: Arc<dyn EngineHooks>,
        rng: StdRng,
    ) -> Option<Arc<Self>> {
        let trans_type = match IaxControl::from_u32(first.subclass)? {
            IaxControl::New => TransactionType::New,
            IaxControl::RegReq => TransactionType::RegReq,
            IaxControl::RegRel => TransactionType::RegRel,
            IaxControl::Poke => TransactionType::Poke,
            _ => return None,
        };
        let now = time.now_instant();
        let remote_call = first.src_call;
        let mut inner = Inner::new(State::Unknown, remote_call, &params);
        // The first frame is already sequence-correct by construction.
        if first.oseq == 0 {
            inner.iseq = 1;
        }
        inner.in_total = 1;
        inner.in_frames.push_back(first);
        let tr = Arc::new(Transaction {
            local_call,
            remote_addr,
            trans_type,
            outgoing_side: false,
            created: now,
            cfg,
            time,
            transport,
            hooks,
            rng: Mutex::new(rng),
            audio: MediaBucket::new(MediaType::Audio),
            video: MediaBucket::new(MediaType::Video),
            owner: Mutex::new(no_owner()),
            pumping: AtomicBool::new(false),
            inner: Mutex::new(inner),
        });
        debug!(
            call = local_call,
            remote = %remote_addr,
            kind = ?trans_type,
            "inbound transaction created"
        );
        Some(tr)
    }

    /// Send the opening frame of a locally started transaction.
    pub fn start(self: &Arc<Self>) {
        let mut inner = self.inner.lock();
        if inner.state != State::Unknown || !self.outgoing_side {
            return;
        }
        let mut ies = IeList::new();
        let subclass = match self.trans_type {
            TransactionType::New => {
                ies.append_u16(ie_tag::VERSION, iax_proto::PROTOCOL_VERSION);
                if let Some(v) = inner.called_number.clone() {
                    ies.append_str(ie_tag::CALLED_NUMBER, v);
                }
                if let Some(v) = inner.called_context.clone() {
                    ies.append_str(ie_tag::CALLED_CONTEXT, v);
                }
                if let Some(v) = inner.calling_number.clone() {
                    ies.append_str(ie_tag::CALLING_NUMBER, v);
                }
                if let Some(v) = inner.calling_name.clone() {
                    ies.append_str(ie_tag::CALLING_NAME, v);
                }
                if let Some(v) = inner.username.clone() {
                    ies.append_str(ie_tag::USERNAME, v);
                }
                ies.append_u32(ie_tag::FORMAT, inner.fmt_audio | inner.fmt_video);
                ies.append_u32(ie_tag::CAPABILITY, inner.capability);
                IaxControl::New
            }
            TransactionType::RegReq => {
                if let Some(v) = inner.username.clone() {
                    ies.append_str(ie_tag::USERNAME, v);
                }
                ies.append_u16(ie_tag::REFRESH, inner.expire as u16);
                IaxControl::RegReq
            }
            TransactionType::RegRel => {
                if let Some(v) = inner.username.clone() {
                    ies.append_str(ie_tag::USERNAME, v);
                }
                IaxControl::RegRel
            }
            TransactionType::Poke => IaxControl::Poke,
        };
        if inner.call_token_pending {
            ies.append_empty(ie_tag::CALLTOKEN);
        }
        self.post_frame_ies(&mut inner, subclass, &ies, 0, false);
        self.change_state(&mut inner, State::NewLocalInvite);
    }

    // ---- simple accessors -------------------------------------------------

    pub fn local_call(&self) -> u16 {
        self.local_call
    }

    pub fn remote_call(&self) -> u16 {
        self.inner.lock().remote_call
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn trans_type(&self) -> TransactionType {
        self.trans_type
    }

    pub fn is_outgoing(&self) -> bool {
        self.outgoing_side
    }

    pub fn state(&self) -> State {
        self.inner.lock().state
    }

    pub fn username(&self) -> Option<String> {
        self.inner.lock().username.clone()
    }

    pub fn called_number(&self) -> Option<String> {
        self.inner.lock().called_number.clone()
    }

    pub fn called_context(&self) -> Option<String> {
        self.inner.lock().called_context.clone()
    }

    pub fn calling_number(&self) -> Option<String> {
        self.inner.lock().calling_number.clone()
    }

    pub fn calling_name(&self) -> Option<String> {
        self.inner.lock().calling_name.clone()
    }

    pub fn challenge(&self) -> Option<String> {
        self.inner.lock().challenge.clone()
    }

    pub fn auth_data(&self) -> Option<String> {
        self.inner.lock().auth_data.clone()
    }

    pub fn expire(&self) -> u32 {
        self.inner.lock().expire
    }

    pub fn format_audio(&self) -> u32 {
        self.inner.lock().fmt_audio
    }

    pub fn format_video(&self) -> u32 {
        self.inner.lock().fmt_video
    }

    pub fn capability(&self) -> u32 {
        self.inner.lock().capability
    }

    pub fn audio_stats(&self) -> MediaStats {
        self.audio.stats()
    }

    pub fn video_stats(&self) -> MediaStats {
        self.video.stats()
    }

    pub fn set_owner(&self, owner: Weak<dyn TransactionOwner>) {
        *self.owner.lock() = owner;
    }

    pub fn owner(&self) -> Option<Arc<dyn TransactionOwner>> {
        self.owner.lock().upgrade()
    }

    pub fn set_media_sink(&self, media: MediaType, sink: Option<Box<dyn MediaSink>>) {
        self.bucket(media).set_sink(sink);
    }

    /// Ask the transaction to wind down at its next event pass.
    pub fn set_destroy(&self) {
        self.inner.lock().destroy = true;
    }

    pub(crate) fn begin_pump(&self) -> bool {
        self.pumping
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    pub(crate) fn end_pump(&self) {
        self.pumping.store(false, Ordering::Release);
    }

    pub(crate) fn learn_remote_call(&self, remote: u16) {
        let mut inner = self.inner.lock();
        if inner.remote_call == 0 {
            inner.remote_call = remote;
        }
    }

    fn bucket(&self, media: MediaType) -> &MediaBucket {
        match media {
            MediaType::Audio => &self.audio,
            MediaType::Video => &self.video,
        }
    }

    fn elapsed_ms(&self, now: Instant) -> u32 {
        now.duration_since(self.created).as_millis() as u32
    }

    // ---- inbound path -----------------------------------------------------

    /// Route one demultiplexed frame into this transaction. Called from a
    /// listener thread.
    pub fn process_frame(self: &Arc<Self>, frame: Frame, now: Instant) {
        match frame {
            Frame::Full(full) => self.process_full(full, now),
            Frame::Mini(mini) => {
                if matches!(self.state(), State::Terminating | State::Terminated) {
                    return;
                }
                let MiniFrame {
                    timestamp, payload, ..
                } = mini;
                self.process_media(&payload, timestamp as u32, MediaType::Audio, false, false, now);
            }
            Frame::MetaVideo(video) => {
                if matches!(self.state(), State::Terminating | State::Terminated) {
                    return;
                }
                let MetaVideoFrame {
                    timestamp,
                    mark,
                    payload,
                    ..
                } = video;
                self.process_media(&payload, timestamp as u32, MediaType::Video, false, mark, now);
            }
            // The engine splits trunk frames into entries before routing.
            Frame::MetaTrunk(_) => {}
        }
    }

    fn process_full(self: &Arc<Self>, full: FullFrame, now: Instant) {
        let mut inner = self.inner.lock();
        if inner.state == State::Terminated {
            drop(inner);
            self.send_inval_reply(&full);
            return;
        }
        inner.in_total += 1;
        let is_iax = full.frame_type == FrameType::Iax;
        if is_iax && full.subclass == IaxControl::Vnak as u32 {
            self.retransmit_on_vnak(&mut inner, full.iseq);
            return;
        }
        // A call-token bounce is stateless on the server side and must
        // not consume sequence numbers here.
        if is_iax && full.subclass == IaxControl::CallToken as u32 {
            self.process_call_token(&mut inner, &full);
            return;
        }
        let f_ack = is_iax
            && (full.subclass == IaxControl::Ack as u32 || full.subclass == IaxControl::Inval as u32);
        if !f_ack && !self.is_frame_acceptable(&mut inner, &full) {
            return;
        }
        // Full media frames are processed immediately, not queued.
        if self.trans_type == TransactionType::New
            && matches!(full.frame_type, FrameType::Voice | FrameType::Video)
        {
            if inner.state == State::Terminating {
                return;
            }
            let media = if full.frame_type == FrameType::Voice {
                MediaType::Audio
            } else {
                MediaType::Video
            };
            if media == MediaType::Audio && !inner.accepted {
                if self.outgoing_side {
                    if let Some(ev) = self.check_accept_recv(&mut inner, now) {
                        inner.pending_event = Some(ev);
                        return;
                    }
                } else {
                    let ev = self.internal_reject(&mut inner, VOICE_BEFORE_ACCEPT, 101, now);
                    inner.pending_event = Some(ev);
                    return;
                }
            }
            if !self.process_media_frame(&mut inner, &full, media, now) {
                return;
            }
            drop(inner);
            if media == MediaType::Audio {
                let mut binc = self.audio.incoming.lock();
                binc.last_voice_full = Some(now);
                binc.last_voice_full_ts = full.timestamp;
            }
            self.process_media(&full.payload, full.timestamp, media, true, false, now);
            return;
        }
        // Answer pings inline; the Pong is the whole exchange.
        if is_iax && full.subclass == IaxControl::Ping as u32 {
            self.post_frame(
                &mut inner,
                FrameType::Iax,
                IaxControl::Pong as u32,
                Vec::new(),
                full.timestamp,
                true,
            );
            return;
        }
        // While terminating only ACK and INVAL matter; everything else
        // is acked so the peer stops retransmitting, then dropped.
        if inner.state == State::Terminating && !f_ack {
            self.send_ack(&mut inner, &full);
            return;
        }
        if inner.in_frames.len() >= self.cfg.max_in_frames {
            warn!(
                call = self.local_call,
                cap = self.cfg.max_in_frames,
                "inbound frame queue overrun"
            );
            inner.in_dropped += 1;
            return;
        }
        inner.in_frames.push_back(full);
    }

    /// Sequence acceptance for ordinary full frames: in-order frames
    /// advance the expected counter, gaps trigger a VNAK, late
    /// duplicates are re-acked and dropped.
    fn is_frame_acceptable(&self, inner: &mut Inner, frame: &FullFrame) -> bool {
        let delta = frame.oseq.wrapping_sub(inner.iseq) as i8;
        if delta == 0 {
            if counts_for_sequence(frame) {
                inner.iseq = inner.iseq.wrapping_add(1);
                inner.last_vnak = None;
            }
            return true;
        }
        if delta > 0 {
            if inner.last_vnak != Some(inner.iseq) {
                debug!(
                    call = self.local_call,
                    oseq = frame.oseq,
                    expected = inner.iseq,
                    "frame out of order, sending VNAK"
                );
                self.send_vnak(inner);
                inner.last_vnak = Some(inner.iseq);
            }
            inner.in_oo += 1;
            return false;
        }
        self.send_ack(inner, frame);
        false
    }

    /// Resend every queued frame from the peer's expected sequence on.
    fn retransmit_on_vnak(&self, inner: &mut Inner, from_oseq: u8) {
        let mut resent = 0;
        for fo in &inner.out_frames {
            if (fo.full.oseq.wrapping_sub(from_oseq) as i8) >= 0 {
                let _ = self.transport.send_to(fo.wire(), self.remote_addr);
                resent += 1;
            }
        }
        debug!(
            call = self.local_call,
            from = from_oseq,
            resent,
            "retransmitted on VNAK"
        );
    }

    /// The server rejected our New pending a call token; re-send the
    /// opening frame with the token attached.
    fn process_call_token(&self, inner: &mut Inner, frame: &FullFrame) {
        if !(inner.state == State::NewLocalInvite && inner.call_token_pending) {
            debug!(call = self.local_call, "call token in invalid state");
            return;
        }
        inner.call_token_pending = false;
        let token = match IeList::decode(&frame.payload) {
            Ok(ies) => ies.binary(ie_tag::CALLTOKEN).map(|b| b.to_vec()),
            Err(_) => None,
        };
        let Some(token) = token else {
            debug!(call = self.local_call, "call token frame without token");
            return;
        };
        let Some(first) = inner.out_frames.first_mut() else {
            return;
        };
        if !(first.is_iax(IaxControl::New)
            || first.is_iax(IaxControl::RegReq)
            || first.is_iax(IaxControl::RegRel))
        {
            return;
        }
        let mut ies = match IeList::decode(&first.full.payload) {
            Ok(ies) => ies,
            Err(_) => return,
        };
        ies.set(iax_proto::Ie {
            tag: ie_tag::CALLTOKEN,
            value: iax_proto::IeValue::Bin(token),
        });
        if first.replace_ies(&ies).is_ok() {
            let _ = self.transport.send_to(first.wire(), self.remote_addr);
        }
    }

    // ---- media ------------------------------------------------------------

    /// Common receive path for media payloads. `full` marks payloads
    /// whose timestamp is already 32 bits wide.
    pub(crate) fn process_media(
        &self,
        payload: &[u8],
        ts: u32,
        media: MediaType,
        full: bool,
        mark: bool,
        _now: Instant,
    ) {
        if matches!(self.state(), State::Terminated | State::Terminating) {
            return;
        }
        let bucket = self.bucket(media);
        let mut binc = bucket.incoming.lock();
        if media == MediaType::Audio && binc.last_voice_full.is_none() {
            drop(binc);
            self.received_voice_mini_before_full();
            return;
        }
        if binc.fmt == 0 {
            debug!(call = self.local_call, media = media.name(), "media without format");
            return;
        }
        if !binc.started {
            binc.started = true;
            debug!(call = self.local_call, media = media.name(), "incoming media started");
        }
        binc.recv += 1;
        binc.recv_bytes += payload.len() as u64;
        let multiplier = format::multiplier(binc.fmt);
        let mut ts = ts;
        if !full {
            match widen_timestamp(ts, bucket.wire_mask(), binc.last_in.unwrap_or(0)) {
                Widened::OutOfOrder => {
                    binc.oo_packets += 1;
                    binc.oo_bytes += payload.len() as u64;
                    return;
                }
                Widened::Timestamp(widened) => ts = widened,
            }
        }
        let forward = match binc.last_in {
            None => true,
            Some(last) => {
                if media == MediaType::Audio {
                    ts > last
                } else {
                    ts >= last
                }
            }
        };
        if !forward {
            binc.oo_packets += 1;
            binc.oo_bytes += payload.len() as u64;
            return;
        }
        binc.last_in = Some(ts);
        drop(binc);
        bucket.deliver(payload, ts.wrapping_mul(multiplier), mark);
    }

    /// Minis before the first full voice frame are useless (no format
    /// yet); nudge the peer into retransmitting the full frame.
    fn received_voice_mini_before_full(&self) {
        let mut inner = self.inner.lock();
        if matches!(inner.state, State::Terminated | State::Terminating) {
            return;
        }
        if inner.req_voice_vnak > MAX_VOICE_VNAK {
            return;
        }
        inner.req_voice_vnak += 1;
        if inner.req_voice_vnak % 3 == 0 {
            self.send_vnak(&mut inner);
        }
    }

    /// Full voice/video frame: ack it and track the peer's format.
    fn process_media_frame(
        self: &Arc<Self>,
        inner: &mut Inner,
        full: &FullFrame,
        media: MediaType,
        now: Instant,
    ) -> bool {
        self.send_ack(inner, full);
        if full.subclass == 0 {
            return true;
        }
        let recv_fmt = format::mask(full.subclass, media);
        if recv_fmt == 0 {
            debug!(
                call = self.local_call,
                subclass = full.subclass,
                media = media.name(),
                "media frame with invalid format"
            );
            return true;
        }
        if format::name(recv_fmt).is_none() {
            let ev = self.internal_reject(inner, NO_MEDIA_FORMAT, 58, now);
            inner.pending_event = Some(ev);
            return false;
        }
        let bucket = self.bucket(media);
        let mut binc = bucket.incoming.lock();
        if binc.fmt == recv_fmt {
            return true;
        }
        if binc.fmt != 0 {
            if !self.hooks.media_format_changed(media, binc.fmt, recv_fmt) {
                drop(binc);
                let ev = self.internal_reject(inner, NO_MEDIA_FORMAT, 58, now);
                inner.pending_event = Some(ev);
                return false;
            }
            info!(
                call = self.local_call,
                media = media.name(),
                old = binc.fmt,
                new = recv_fmt,
                "incoming format changed"
            );
        }
        binc.fmt = recv_fmt;
        drop(binc);
        match media {
            MediaType::Audio => {
                if inner.fmt_audio == 0 {
                    inner.fmt_audio = recv_fmt;
                }
            }
            MediaType::Video => {
                if inner.fmt_video == 0 {
                    inner.fmt_video = recv_fmt;
                }
            }
        }
        true
    }

    /// Send one media payload, pacing its timestamp against the
    /// transaction clock. Returns the payload bytes actually written.
    pub fn send_media(
        self: &Arc<Self>,
        data: &[u8],
        src_ts: u32,
        fmt: u32,
        media: MediaType,
        mark: bool,
    ) -> usize {
        if data.is_empty() {
            return 0;
        }
        if matches!(self.state(), State::Terminated | State::Terminating) {
            return 0;
        }
        let now = self.time.now_instant();
        let trans_ts = self.elapsed_ms(now);
        let bucket = self.bucket(media);
        let mut bout = bucket.outgoing.lock();
        let fmt_changed = bout.fmt != fmt;
        if fmt_changed {
            info!(
                call = self.local_call,
                media = media.name(),
                old = bout.fmt,
                new = fmt,
                "outgoing format changed"
            );
            bout.fmt = fmt;
        }
        let multiplier = format::multiplier(fmt);
        let ts;
        if bout.started {
            if multiplier > 1 {
                if bout.first_src > src_ts {
                    debug!(
                        call = self.local_call,
                        media = media.name(),
                        src_ts,
                        first = bout.first_src,
                        "dropping media with old source timestamp"
                    );
                    bout.drop_out(data.len());
                    return 0;
                }
                let mut paced = bout
                    .start_trans
                    .wrapping_add((src_ts - bout.first_src) / multiplier);
                if media == MediaType::Audio {
                    if paced > trans_ts {
                        // The source runs hot: drop and pull the media
                        // clock back.
                        if paced - trans_ts >= self.cfg.adjust_ts_threshold {
                            bout.drop_out(data.len());
                            bout.start_trans =
                                bout.start_trans.wrapping_sub(self.cfg.adjust_ts_overrun);
                            debug!(call = self.local_call, ts = paced, trans_ts, "voice overrun");
                            return 0;
                        }
                    } else if paced < trans_ts
                        && trans_ts - paced >= self.cfg.adjust_ts_threshold
                    {
                        bout.start_trans = bout.start_trans.wrapping_add(self.cfg.adjust_ts_underrun);
                        debug!(call = self.local_call, ts = paced, trans_ts, "voice underrun");
                    }
                    if paced == bout.last_out {
                        paced += 1;
                    }
                }
                ts = paced;
            } else {
                let mut paced = trans_ts;
                if media == MediaType::Audio && paced == bout.last_out {
                    paced += 1;
                }
                ts = paced;
            }
        } else {
            bout.started = true;
            bout.start_trans = trans_ts;
            bout.first_src = src_ts;
            ts = trans_ts;
            debug!(call = self.local_call, media = media.name(), "outgoing media started");
        }
        if ts < bout.last_out {
            bout.drop_out(data.len());
            return 0;
        }
        // First frame and format changes go out as full frames so the
        // peer learns the codec; so does a timestamp that no longer fits
        // the truncated wire form.
        let mut full_frame = fmt_changed || bout.last_out == 0;
        if !full_frame {
            let mask = bucket.wire_mask();
            full_frame = (ts & mask) < (bout.last_out & mask) || (ts - bout.last_out) > mask;
        }
        bout.last_out = ts;
        let mut sent = 0;
        match media {
            MediaType::Audio => {
                if full_frame {
                    if let Some(trunk) = bout.trunk.clone() {
                        if !bout.trunk_calls_set {
                            bout.trunk_calls_set = true;
                            trunk.attach();
                        }
                        // Flush queued minis first to keep media order.
                        if bout.trunk_send {
                            trunk.send_now(now);
                        }
                    }
                    // The reliability queue needs the transaction lock;
                    // never hold a bucket lock across it.
                    drop(bout);
                    self.post_media_full(FrameType::Voice, fmt, data, ts);
                    sent = data.len();
                    bout = bucket.outgoing.lock();
                } else if let Some(trunk) = bout.trunk.clone() {
                    if !bout.trunk_calls_set {
                        bout.trunk_calls_set = true;
                        trunk.attach();
                    }
                    bout.trunk_send = !(bout.trunk_efficient && trunk.calls() <= 1);
                    if bout.trunk_send {
                        sent = trunk.add(self.local_call, data, ts, now);
                    } else {
                        sent = self.send_mini(data, ts);
                    }
                } else {
                    sent = self.send_mini(data, ts);
                }
            }
            MediaType::Video => {
                if full_frame {
                    drop(bout);
                    self.post_media_full(FrameType::Video, fmt, data, ts);
                    sent = data.len();
                    bout = bucket.outgoing.lock();
                } else {
                    let frame = MetaVideoFrame {
                        src_call: self.local_call,
                        mark,
                        timestamp: (ts & 0x7FFF) as u16,
                        payload: data.to_vec(),
                    };
                    let mut wire = Vec::new();
                    frame.encode(&mut wire);
                    if self.transport.send_to(&wire, self.remote_addr).is_ok() {
                        sent = data.len();
                    }
                }
            }
        }
        bout.sent += 1;
        bout.sent_bytes += sent as u64;
        sent
    }

    fn post_media_full(&self, frame_type: FrameType, fmt: u32, data: &[u8], ts: u32) {
        let mut inner = self.inner.lock();
        if inner.state == State::Terminated {
            return;
        }
        self.post_frame(&mut inner, frame_type, fmt, data.to_vec(), ts, true);
    }

    fn send_mini(&self, data: &[u8], ts: u32) -> usize {
        let frame = MiniFrame {
            src_call: self.local_call,
            timestamp: (ts & 0xFFFF) as u16,
            payload: data.to_vec(),
        };
        let mut wire = Vec::new();
        frame.encode(&mut wire);
        match self.transport.send_to(&wire, self.remote_addr) {
            Ok(_) => data.len(),
            Err(_) => 0,
        }
    }

    /// Bind this call's audio to an outbound trunk frame.
    pub fn enable_trunking(&self, trunk: Arc<TrunkFrame>, efficient_use: bool) -> bool {
        let mut bout = self.audio.outgoing.lock();
        if bout.trunk.is_some() {
            return false;
        }
        bout.trunk_send = false;
        bout.trunk_calls_set = false;
        bout.trunk_efficient = efficient_use;
        bout.trunk = Some(trunk);
        true
    }

    fn reset_trunk(&self) {
        let mut bout = self.audio.outgoing.lock();
        if let Some(trunk) = bout.trunk.take() {
            if bout.trunk_calls_set {
                trunk.detach();
            }
        }
    }

    /// Inbound trunk entries without per-entry timestamps: rebase the
    /// trunk clock onto this call's media clock and deliver the batch
    /// with consecutive timestamps.
    pub(crate) fn process_mini_no_ts(&self, trunk_ts: u32, payloads: &[Vec<u8>], now: Instant) {
        let mut binc = self.audio.incoming.lock();
        let Some(last_voice_at) = binc.last_voice_full else {
            drop(binc);
            self.received_voice_mini_before_full();
            return;
        };
        let mut ts;
        if self.cfg.trunk_in_sync_using_ts {
            let mut restart = binc.trunk_start.is_none();
            if !restart && trunk_ts < binc.trunk_first_ts {
                if binc.trunk_first_ts - trunk_ts > self.cfg.trunk_in_ts_diff_restart {
                    // The peer's trunk clock jumped back: it restarted.
                    restart = true;
                } else {
                    for payload in payloads {
                        if !payload.is_empty() {
                            binc.oo_packets += 1;
                            binc.oo_bytes += payload.len() as u64;
                        }
                    }
                    return;
                }
            }
            if restart {
                binc.trunk_start = Some(now);
                binc.trunk_first_ts = trunk_ts;
                binc.trunk_ts_delta = now
                    .saturating_duration_since(last_voice_at)
                    .as_millis() as u32
                    + binc.last_voice_full_ts;
            }
            ts = binc.trunk_ts_delta + (trunk_ts - binc.trunk_first_ts);
        } else {
            ts = now.saturating_duration_since(last_voice_at).as_millis() as u32
                + binc.last_voice_full_ts;
        }
        drop(binc);
        for payload in payloads {
            // Timestamps are synthesized, so skip the truncated-widening
            // path.
            self.process_media(payload, ts, MediaType::Audio, true, false, now);
            ts += 1;
        }
    }

    // ---- event pump -------------------------------------------------------

    /// Advance the state machine: ack queued frames, retransmit or expire
    /// outbound frames, answer internal requests, and hand the next
    /// owner-visible event back.
    pub fn get_event(self: &Arc<Self>, now: Instant) -> Option<Event> {
        let mut inner = self.inner.lock();
        if inner.state == State::Terminated {
            return None;
        }
        if inner.destroy {
            return Some(self.terminate_ev(&mut inner, EventKind::Terminated, true, None));
        }
        if self.outgoing_side && inner.state == State::Unknown {
            return None;
        }
        self.ack_in_frames(&mut inner);
        if inner.state == State::Terminating {
            if let Some(deadline) = inner.terminate_at {
                if now >= deadline {
                    let local = inner.local_req_end;
                    return Some(self.terminate_ev(&mut inner, EventKind::Timeout, local, None));
                }
            }
            // Nothing left to drain: the final event is already out, so
            // slip into Terminated without another one.
            if inner.out_frames.is_empty() {
                self.change_state(&mut inner, State::Terminated);
                debug!(call = self.local_call, "terminating queue drained");
                return None;
            }
            // Remote asked for the end; we only wait for retransmissions.
            if !inner.local_req_end {
                return None;
            }
        } else {
            match inner.next_ping {
                None => inner.next_ping = Some(now + self.cfg.ping_interval),
                Some(due) if now > due => {
                    self.post_frame(
                        &mut inner,
                        FrameType::Iax,
                        IaxControl::Ping as u32,
                        Vec::new(),
                        0,
                        false,
                    );
                    inner.next_ping = Some(now + self.cfg.ping_interval);
                }
                Some(_) => {}
            }
        }
        if let Some(ev) = inner.pending_event.take() {
            return Some(ev);
        }
        if let Some(ev) = self.pump_outgoing(&mut inner, now) {
            return Some(ev);
        }
        self.pump_incoming(&mut inner, now)
    }

    fn pump_outgoing(self: &Arc<Self>, inner: &mut Inner, now: Instant) -> Option<Event> {
        let mut result: Option<Event> = None;
        let mut del_frame = false;
        let mut last_ack_idx: Option<usize> = None;
        let mut idx = 0;
        while idx < inner.out_frames.len() {
            let (ev, del) = self.get_event_response(inner, idx, now);
            let state = inner.state;
            // `timed_out` carries the frame identity out of the borrow so
            // the terminate event can take the whole state.
            let mut timed_out: Option<(FrameType, u32)> = None;
            let mut stop = false;
            {
                let frame = &mut inner.out_frames[idx];
                if frame.acked || del {
                    frame.acked = true;
                    last_ack_idx = Some(idx);
                    if ev.is_some() || del {
                        result = ev;
                        del_frame = del;
                        break;
                    }
                    if frame.ack_only {
                        idx += 1;
                        continue;
                    }
                }
                // An acked challenge grants the peer time to produce
                // credentials beyond the plain retransmission schedule.
                if state == State::NewRemoteInviteAuthSent
                    && frame.acked
                    && (frame.is_iax(IaxControl::AuthReq) || frame.is_iax(IaxControl::RegAuth))
                    && frame.abs_timeout.is_none()
                {
                    frame.abs_timeout = Some(now + self.cfg.challenge_timeout);
                }
                if frame.exhausted() {
                    if frame.due(now) {
                        timed_out = Some((frame.full.frame_type, frame.full.subclass));
                    }
                    stop = true;
                } else if frame.due(now) {
                    if frame.acked {
                        // Keep the schedule moving without resending.
                        frame.consume_retransmission(now);
                    } else {
                        debug!(
                            call = self.local_call,
                            oseq = frame.full.oseq,
                            remaining = frame.retries_left - 1,
                            "retransmitting frame"
                        );
                        frame.consume_retransmission(now);
                        let _ = self.transport.send_to(frame.wire(), self.remote_addr);
                    }
                }
            }
            if stop {
                if let Some(from) = timed_out {
                    warn!(
                        call = self.local_call,
                        frame_type = ?from.0,
                        subclass = from.1,
                        "frame retransmission budget exhausted"
                    );
                    result = if state == State::Terminating {
                        Some(self.terminate_ev(inner, EventKind::Timeout, true, None))
                    } else {
                        Some(self.terminate_ev(inner, EventKind::Timeout, true, Some(from)))
                    };
                }
                break;
            }
            idx += 1;
        }
        if let Some(last) = last_ack_idx {
            // Everything before the acked frame is implicitly acked;
            // ack-only frames can go, the rest wait for their response.
            let consumed = result.is_some() || del_frame;
            let mut i = 0;
            inner.out_frames.retain_mut(|frame| {
                let this = i;
                i += 1;
                if this < last {
                    frame.acked = true;
                    !frame.ack_only
                } else if this == last {
                    !(consumed || frame.ack_only)
                } else {
                    true
                }
            });
        }
        result
    }

    /// Match one outbound frame against queued responses.
    fn get_event_response(
        self: &Arc<Self>,
        inner: &mut Inner,
        idx: usize,
        now: Instant,
    ) -> (Option<Event>, bool) {
        if self.find_in_frame_ack(inner, idx) {
            inner.out_frames[idx].acked = true;
            if inner.state == State::Terminating {
                let frame = &inner.out_frames[idx];
                let done = frame.is_iax(IaxControl::Hangup)
                    || frame.is_iax(IaxControl::Reject)
                    || frame.is_iax(IaxControl::RegRej)
                    || (!self.outgoing_side
                        && matches!(
                            self.trans_type,
                            TransactionType::RegReq | TransactionType::RegRel
                        )
                        && frame.is_iax(IaxControl::RegAck));
                if done {
                    // A retransmitted final frame may still collect late
                    // acks; hold on until the schedule drains.
                    if frame.never_retransmitted() {
                        return (
                            Some(self.terminate_ev(inner, EventKind::Terminated, true, None)),
                            false,
                        );
                    }
                    return (None, false);
                }
            }
            if inner.out_frames[idx].ack_only {
                return (None, false);
            }
        }
        if inner.out_frames[idx].ack_only {
            return (None, false);
        }
        match self.trans_type {
            TransactionType::New => self.get_event_response_new(inner, idx, now),
            TransactionType::RegReq | TransactionType::RegRel => {
                self.get_event_response_reg(inner, idx, now)
            }
            TransactionType::Poke => {
                if inner.state == State::NewLocalInvite
                    && inner.out_frames[idx].is_iax(IaxControl::Poke)
                {
                    if let Some(ev) = self.create_response(
                        inner,
                        idx,
                        IaxControl::Pong,
                        EventKind::Terminated,
                        false,
                        State::Terminating,
                        now,
                    ) {
                        return (Some(ev), true);
                    }
                }
                self.process_internal_outgoing(inner, idx)
            }
        }
    }

    fn get_event_response_new(
        self: &Arc<Self>,
        inner: &mut Inner,
        idx: usize,
        now: Instant,
    ) -> (Option<Event>, bool) {
        match inner.state {
            State::NewLocalInvite if inner.out_frames[idx].is_iax(IaxControl::New) => {
                if let Some(ev) = self.create_response(
                    inner,
                    idx,
                    IaxControl::AuthReq,
                    EventKind::AuthReq,
                    false,
                    State::NewLocalInviteAuthRecv,
                    now,
                ) {
                    return (Some(self.process_auth_req(inner, ev, now)), true);
                }
                if let Some(ev) = self.create_response(
                    inner,
                    idx,
                    IaxControl::Accept,
                    EventKind::Accept,
                    false,
                    State::Connected,
                    now,
                ) {
                    return (Some(self.process_accept(inner, ev, now)), true);
                }
                if let Some(ev) = self.create_response(
                    inner,
                    idx,
                    IaxControl::Reject,
                    EventKind::Reject,
                    false,
                    State::Terminating,
                    now,
                ) {
                    return (Some(ev), true);
                }
                if let Some(ev) = self.create_response(
                    inner,
                    idx,
                    IaxControl::Hangup,
                    EventKind::Hangup,
                    false,
                    State::Terminating,
                    now,
                ) {
                    return (Some(ev), true);
                }
            }
            State::NewLocalInviteRepSent if inner.out_frames[idx].is_iax(IaxControl::AuthRep) => {
                if let Some(ev) = self.create_response(
                    inner,
                    idx,
                    IaxControl::Accept,
                    EventKind::Accept,
                    false,
                    State::Connected,
                    now,
                ) {
                    return (Some(self.process_accept(inner, ev, now)), true);
                }
                if let Some(ev) = self.create_response(
                    inner,
                    idx,
                    IaxControl::Reject,
                    EventKind::Reject,
                    false,
                    State::Terminating,
                    now,
                ) {
                    return (Some(ev), true);
                }
                if let Some(ev) = self.create_response(
                    inner,
                    idx,
                    IaxControl::Hangup,
                    EventKind::Hangup,
                    false,
                    State::Terminating,
                    now,
                ) {
                    return (Some(ev), true);
                }
            }
            State::NewRemoteInviteAuthSent if inner.out_frames[idx].is_iax(IaxControl::AuthReq) => {
                if let Some(ev) = self.create_response(
                    inner,
                    idx,
                    IaxControl::AuthRep,
                    EventKind::AuthRep,
                    false,
                    State::NewRemoteInviteRepRecv,
                    now,
                ) {
                    return (Some(self.process_auth_rep(inner, ev)), true);
                }
                if let Some(ev) = self.create_response(
                    inner,
                    idx,
                    IaxControl::Reject,
                    EventKind::Reject,
                    false,
                    State::Terminating,
                    now,
                ) {
                    return (Some(ev), true);
                }
                if let Some(ev) = self.create_response(
                    inner,
                    idx,
                    IaxControl::Hangup,
                    EventKind::Hangup,
                    false,
                    State::Terminating,
                    now,
                ) {
                    return (Some(ev), true);
                }
            }
            _ => {}
        }
        self.process_internal_outgoing(inner, idx)
    }

    fn get_event_response_reg(
        self: &Arc<Self>,
        inner: &mut Inner,
        idx: usize,
        now: Instant,
    ) -> (Option<Event>, bool) {
        let is_reg_open = inner.out_frames[idx].is_iax(IaxControl::RegReq)
            || inner.out_frames[idx].is_iax(IaxControl::RegRel);
        match inner.state {
            State::NewLocalInvite if is_reg_open => {
                if let Some(ev) = self.create_response(
                    inner,
                    idx,
                    IaxControl::RegAck,
                    EventKind::Accept,
                    false,
                    State::Terminating,
                    now,
                ) {
                    return (Some(self.process_reg_ack(inner, ev)), true);
                }
                if let Some(ev) = self.create_response(
                    inner,
                    idx,
                    IaxControl::RegAuth,
                    EventKind::AuthReq,
                    false,
                    State::NewLocalInviteAuthRecv,
                    now,
                ) {
                    return (Some(self.process_auth_req(inner, ev, now)), true);
                }
                if let Some(ev) = self.create_response(
                    inner,
                    idx,
                    IaxControl::RegRej,
                    EventKind::Reject,
                    false,
                    State::Terminating,
                    now,
                ) {
                    return (Some(ev), true);
                }
            }
            State::NewLocalInviteRepSent if is_reg_open => {
                if let Some(ev) = self.create_response(
                    inner,
                    idx,
                    IaxControl::RegAck,
                    EventKind::Accept,
                    false,
                    State::Terminating,
                    now,
                ) {
                    return (Some(self.process_reg_ack(inner, ev)), true);
                }
                if let Some(ev) = self.create_response(
                    inner,
                    idx,
                    IaxControl::RegRej,
                    EventKind::Reject,
                    false,
                    State::Terminating,
                    now,
                ) {
                    return (Some(ev), true);
                }
            }
            State::NewRemoteInviteAuthSent
                if inner.out_frames[idx].is_iax(IaxControl::RegAuth) =>
            {
                let reply = if self.trans_type == TransactionType::RegReq {
                    IaxControl::RegReq
                } else {
                    IaxControl::RegRel
                };
                if let Some(ev) = self.create_response(
                    inner,
                    idx,
                    reply,
                    EventKind::AuthRep,
                    false,
                    State::NewRemoteInviteRepRecv,
                    now,
                ) {
                    return (Some(self.process_auth_rep(inner, ev)), true);
                }
                if let Some(ev) = self.create_response(
                    inner,
                    idx,
                    IaxControl::RegRej,
                    EventKind::Reject,
                    false,
                    State::Terminating,
                    now,
                ) {
                    return (Some(ev), true);
                }
            }
            _ => {}
        }
        self.process_internal_outgoing(inner, idx)
    }

    /// Internal request/response pairs that produce no owner event:
    /// Ping wants a Pong, LagRq wants a LagRp.
    fn process_internal_outgoing(&self, inner: &mut Inner, idx: usize) -> (Option<Event>, bool) {
        if inner.out_frames[idx].full.frame_type != FrameType::Iax {
            return (None, false);
        }
        if inner.out_frames[idx].is_iax(IaxControl::Ping)
            && self.find_in_frame_timestamp(inner, idx, IaxControl::Pong)
        {
            return (None, true);
        }
        if inner.out_frames[idx].is_iax(IaxControl::LagRq)
            && self.find_in_frame_timestamp(inner, idx, IaxControl::LagRp)
        {
            return (None, true);
        }
        (None, false)
    }

    /// Find a queued response frame, consume it and build its event.
    fn create_response(
        self: &Arc<Self>,
        inner: &mut Inner,
        out_idx: usize,
        find: IaxControl,
        kind: EventKind,
        local: bool,
        new_state: State,
        now: Instant,
    ) -> Option<Event> {
        let pos = inner
            .in_frames
            .iter()
            .position(|f| f.frame_type == FrameType::Iax && f.subclass == find as u32)?;
        inner.out_frames[out_idx].acked = true;
        let frame = inner.in_frames.remove(pos).expect("position just found");
        Some(self.create_event(inner, kind, local, Some(&frame), new_state, now))
    }

    fn pump_incoming(self: &Arc<Self>, inner: &mut Inner, now: Instant) -> Option<Event> {
        let mut idx = 0;
        while idx < inner.in_frames.len() {
            let frame = inner.in_frames[idx].clone();
            if frame.frame_type == FrameType::Iax && frame.subclass == IaxControl::Ack as u32 {
                // Acks are consumed by the outbound scan; once nothing
                // is waiting they are stale.
                if inner.out_frames.is_empty() {
                    inner.in_frames.remove(idx);
                } else {
                    idx += 1;
                }
                continue;
            }
            let (ev, del) = if inner.state == State::Unknown {
                self.get_event_start(inner, &frame, now)
            } else {
                self.get_event_request(inner, &frame, now)
            };
            if del {
                inner.in_frames.remove(idx);
            } else {
                idx += 1;
            }
            if ev.is_some() {
                return ev;
            }
        }
        None
    }

    /// First frame of a peer-initiated transaction.
    fn get_event_start(
        self: &Arc<Self>,
        inner: &mut Inner,
        frame: &FullFrame,
        now: Instant,
    ) -> (Option<Event>, bool) {
        let is = |sub: IaxControl| {
            frame.frame_type == FrameType::Iax && frame.subclass == sub as u32
        };
        match self.trans_type {
            TransactionType::New if is(IaxControl::New) => {
                let ev = self.create_event(
                    inner,
                    EventKind::New,
                    false,
                    Some(frame),
                    State::NewRemoteInvite,
                    now,
                );
                if ev.kind == EventKind::Invalid {
                    return (Some(ev), true);
                }
                if ev.ies.validate_version().is_err() {
                    self.send_reject_locked(inner, BAD_VERSION, 0, now);
                    return (None, true);
                }
                self.init_from_ies(inner, &ev.ies);
                (Some(ev), true)
            }
            TransactionType::RegReq | TransactionType::RegRel
                if is(IaxControl::RegReq) || is(IaxControl::RegRel) =>
            {
                let ev = self.create_event(
                    inner,
                    EventKind::New,
                    false,
                    Some(frame),
                    State::NewRemoteInvite,
                    now,
                );
                if ev.kind == EventKind::Invalid {
                    return (Some(ev), true);
                }
                if !ev.ies.has(ie_tag::USERNAME) {
                    return (Some(self.internal_reject(inner, NO_USERNAME, 96, now)), true);
                }
                self.init_from_ies(inner, &ev.ies);
                (Some(ev), true)
            }
            TransactionType::Poke if is(IaxControl::Poke) => {
                self.post_frame(
                    inner,
                    FrameType::Iax,
                    IaxControl::Pong as u32,
                    Vec::new(),
                    frame.timestamp,
                    true,
                );
                (
                    Some(self.create_event(
                        inner,
                        EventKind::Terminated,
                        false,
                        None,
                        State::Terminating,
                        now,
                    )),
                    true,
                )
            }
            _ => (None, false),
        }
    }

    fn get_event_request(
        self: &Arc<Self>,
        inner: &mut Inner,
        frame: &FullFrame,
        now: Instant,
    ) -> (Option<Event>, bool) {
        if frame.frame_type == FrameType::Iax && frame.subclass == IaxControl::Inval as u32 {
            debug!(call = self.local_call, "received INVAL, terminating");
            return (
                Some(self.create_event(
                    inner,
                    EventKind::Invalid,
                    false,
                    Some(frame),
                    State::Terminated,
                    now,
                )),
                true,
            );
        }
        match self.trans_type {
            TransactionType::New => self.get_event_request_new(inner, frame, now),
            TransactionType::RegReq | TransactionType::RegRel => {
                if matches!(
                    inner.state,
                    State::NewLocalInviteAuthRecv
                        | State::NewRemoteInvite
                        | State::NewRemoteInviteRepRecv
                ) {
                    if let Some(ev) = self.remote_reject_call(inner, frame, now) {
                        return (Some(ev), true);
                    }
                }
                self.process_internal_incoming(inner, frame)
            }
            TransactionType::Poke => self.process_internal_incoming(inner, frame),
        }
    }

    fn get_event_request_new(
        self: &Arc<Self>,
        inner: &mut Inner,
        frame: &FullFrame,
        now: Instant,
    ) -> (Option<Event>, bool) {
        match inner.state {
            State::Connected => match frame.frame_type {
                FrameType::Control => return self.process_mid_call_control(inner, frame, now),
                FrameType::Iax => return self.process_mid_call_iax(inner, frame, now),
                FrameType::Dtmf => {
                    let state = inner.state;
                    return (
                        Some(self.create_event(inner, EventKind::Dtmf, false, Some(frame), state, now)),
                        true,
                    );
                }
                FrameType::Text => {
                    let state = inner.state;
                    return (
                        Some(self.create_event(inner, EventKind::Text, false, Some(frame), state, now)),
                        true,
                    );
                }
                FrameType::Noise => {
                    let state = inner.state;
                    return (
                        Some(self.create_event(inner, EventKind::Noise, false, Some(frame), state, now)),
                        true,
                    );
                }
                FrameType::Video | FrameType::Image | FrameType::Html => {
                    let state = inner.state;
                    return (
                        Some(self.create_event(
                            inner,
                            EventKind::NotImplemented,
                            false,
                            Some(frame),
                            state,
                            now,
                        )),
                        true,
                    );
                }
                _ => {}
            },
            State::NewLocalInviteAuthRecv
            | State::NewRemoteInvite
            | State::NewRemoteInviteRepRecv => {
                if let Some(ev) = self.remote_reject_call(inner, frame, now) {
                    return (Some(ev), true);
                }
            }
            _ => {}
        }
        self.process_internal_incoming(inner, frame)
    }

    fn process_mid_call_control(
        self: &Arc<Self>,
        inner: &mut Inner,
        frame: &FullFrame,
        now: Instant,
    ) -> (Option<Event>, bool) {
        let state = inner.state;
        let Some(control) = ControlType::from_u32(frame.subclass) else {
            return self.process_internal_incoming(inner, frame);
        };
        let (kind, new_state) = match control {
            ControlType::Hangup => (EventKind::Hangup, State::Terminating),
            ControlType::Busy => (EventKind::Busy, State::Terminating),
            ControlType::Ringing => (EventKind::Ringing, state),
            ControlType::Answer => (EventKind::Answer, State::Connected),
            ControlType::Progressing | ControlType::Proceeding => (EventKind::Progressing, state),
            _ => (EventKind::NotImplemented, state),
        };
        (
            Some(self.create_event(inner, kind, false, Some(frame), new_state, now)),
            true,
        )
    }

    fn process_mid_call_iax(
        self: &Arc<Self>,
        inner: &mut Inner,
        frame: &FullFrame,
        now: Instant,
    ) -> (Option<Event>, bool) {
        let state = inner.state;
        let Some(control) = IaxControl::from_u32(frame.subclass) else {
            self.send_unsupport(inner, frame.subclass);
            return (None, true);
        };
        match control {
            IaxControl::Ping
            | IaxControl::LagRq
            | IaxControl::Pong
            | IaxControl::LagRp
            | IaxControl::Vnak => self.process_internal_incoming(inner, frame),
            IaxControl::Quelch => (
                Some(self.create_event(inner, EventKind::Quelch, false, Some(frame), state, now)),
                true,
            ),
            IaxControl::Unquelch => (
                Some(self.create_event(inner, EventKind::Unquelch, false, Some(frame), state, now)),
                true,
            ),
            IaxControl::Hangup | IaxControl::Reject => (
                Some(self.create_event(
                    inner,
                    EventKind::Hangup,
                    false,
                    Some(frame),
                    State::Terminating,
                    now,
                )),
                true,
            ),
            // Duplicates of setup frames mid-call are stale; drop them.
            IaxControl::New | IaxControl::Accept | IaxControl::AuthReq | IaxControl::AuthRep => {
                (None, true)
            }
            IaxControl::Inval => (
                Some(self.create_event(
                    inner,
                    EventKind::Invalid,
                    false,
                    Some(frame),
                    State::Terminated,
                    now,
                )),
                true,
            ),
            IaxControl::Unsupport => (None, true),
            IaxControl::Transfer | IaxControl::TxReady => {
                self.send_unsupport(inner, frame.subclass);
                (
                    Some(self.create_event(
                        inner,
                        EventKind::NotImplemented,
                        false,
                        Some(frame),
                        State::Terminating,
                        now,
                    )),
                    true,
                )
            }
            IaxControl::DpReq
            | IaxControl::DpRep
            | IaxControl::Dial
            | IaxControl::TxReq
            | IaxControl::TxCnt
            | IaxControl::TxAcc
            | IaxControl::TxRel
            | IaxControl::TxRej
            | IaxControl::Mwi
            | IaxControl::Provision
            | IaxControl::FwDownl
            | IaxControl::FwData => {
                self.send_unsupport(inner, frame.subclass);
                (
                    Some(self.create_event(
                        inner,
                        EventKind::NotImplemented,
                        false,
                        Some(frame),
                        state,
                        now,
                    )),
                    true,
                )
            }
            _ => {
                self.send_unsupport(inner, frame.subclass);
                (None, true)
            }
        }
    }

    fn process_internal_incoming(
        &self,
        inner: &mut Inner,
        frame: &FullFrame,
    ) -> (Option<Event>, bool) {
        if frame.frame_type == FrameType::Iax {
            if frame.subclass == IaxControl::LagRq as u32 {
                self.post_frame(
                    inner,
                    FrameType::Iax,
                    IaxControl::LagRp as u32,
                    Vec::new(),
                    frame.timestamp,
                    true,
                );
                return (None, true);
            }
            if frame.subclass == IaxControl::Pong as u32 {
                self.send_ack(inner, frame);
                return (None, true);
            }
        }
        debug!(
            call = self.local_call,
            frame_type = ?frame.frame_type,
            subclass = frame.subclass,
            "dropping unhandled frame"
        );
        (None, true)
    }

    fn remote_reject_call(
        self: &Arc<Self>,
        inner: &mut Inner,
        frame: &FullFrame,
        now: Instant,
    ) -> Option<Event> {
        let rejected = match self.trans_type {
            TransactionType::New => {
                (frame.frame_type == FrameType::Iax
                    && (frame.subclass == IaxControl::Hangup as u32
                        || frame.subclass == IaxControl::Reject as u32))
                    || (frame.frame_type == FrameType::Control
                        && frame.subclass == ControlType::Hangup as u32)
            }
            TransactionType::RegReq | TransactionType::RegRel => {
                frame.frame_type == FrameType::Iax && frame.subclass == IaxControl::RegRej as u32
            }
            TransactionType::Poke => false,
        };
        rejected.then(|| {
            self.create_event(
                inner,
                EventKind::Reject,
                false,
                Some(frame),
                State::Terminating,
                now,
            )
        })
    }

    // ---- event plumbing ---------------------------------------------------

    fn create_event(
        self: &Arc<Self>,
        inner: &mut Inner,
        kind: EventKind,
        local: bool,
        frame: Option<&FullFrame>,
        new_state: State,
        now: Instant,
    ) -> Event {
        // Unparseable IEs poison the frame: answer INVAL and fold up.
        let ies = match frame {
            Some(f) if f.frame_type == FrameType::Iax && !f.payload.is_empty() => {
                match IeList::decode(&f.payload) {
                    Ok(ies) => ies,
                    Err(err) => {
                        warn!(call = self.local_call, %err, "received invalid IE list");
                        self.send_inval_reply(f);
                        return self.wait_for_terminate(inner, EventKind::Invalid, local, now);
                    }
                }
            }
            _ => IeList::new(),
        };
        self.change_state(inner, new_state);
        let mut ev = match inner.state {
            State::Terminating => self.wait_for_terminate(inner, kind, local, now),
            State::Terminated => self.terminate_ev(inner, kind, local, None),
            _ => Event::bare(kind, local, false),
        };
        if let Some(f) = frame {
            ev.frame_type = Some(f.frame_type);
            ev.subclass = f.subclass;
            if matches!(f.frame_type, FrameType::Text | FrameType::Noise) {
                ev.payload = f.payload.clone();
            }
        }
        ev.ies = ies;
        ev
    }

    /// Final event plus the Terminated state.
    fn terminate_ev(
        &self,
        inner: &mut Inner,
        kind: EventKind,
        local: bool,
        from: Option<(FrameType, u32)>,
    ) -> Event {
        self.change_state(inner, State::Terminated);
        let mut ev = Event::bare(kind, local, true);
        if let Some((frame_type, subclass)) = from {
            ev.frame_type = Some(frame_type);
            ev.subclass = subclass;
        }
        debug!(call = self.local_call, kind = ?kind, "transaction terminated");
        ev
    }

    /// Final event plus the Terminating state and its drain deadline.
    fn wait_for_terminate(
        &self,
        inner: &mut Inner,
        kind: EventKind,
        local: bool,
        now: Instant,
    ) -> Event {
        self.change_state(inner, State::Terminating);
        inner.terminate_at =
            Some(now + self.cfg.retrans_interval * self.cfg.retrans_count * 2);
        Event::bare(kind, local, true)
    }

    fn wait_for_terminate_silent(&self, inner: &mut Inner, now: Instant) {
        self.change_state(inner, State::Terminating);
        inner.terminate_at =
            Some(now + self.cfg.retrans_interval * self.cfg.retrans_count * 2);
    }

    fn change_state(&self, inner: &mut Inner, new_state: State) -> bool {
        if inner.state == new_state {
            return true;
        }
        match inner.state {
            State::Terminated => return false,
            State::Terminating if new_state != State::Terminated => return false,
            _ => {}
        }
        debug!(
            call = self.local_call,
            from = ?inner.state,
            to = ?new_state,
            "state change"
        );
        inner.state = new_state;
        if matches!(new_state, State::Terminating | State::Terminated) {
            self.reset_trunk();
        }
        true
    }

    // ---- response matching helpers ----------------------------------------

    /// Look for an explicit ACK of one outbound frame. The ACK mirrors
    /// the acked frame's timestamp and carries its in-sequence as oseq.
    fn find_in_frame_ack(&self, inner: &mut Inner, idx: usize) -> bool {
        let out = &inner.out_frames[idx];
        // A Ping is answered by Pong, never by a bare ACK.
        if out.is_iax(IaxControl::Ping) {
            return false;
        }
        let (out_ts, out_iseq) = (out.full.timestamp, out.full.iseq);
        let pos = inner.in_frames.iter().position(|f| {
            f.frame_type == FrameType::Iax
                && f.subclass == IaxControl::Ack as u32
                && f.timestamp == out_ts
                && f.oseq == out_iseq
        });
        match pos {
            Some(pos) => {
                inner.in_frames.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Match a response by echoed timestamp (exact, or loose for Pong
    /// where the peer may echo a larger value).
    fn find_in_frame_timestamp(&self, inner: &mut Inner, idx: usize, find: IaxControl) -> bool {
        let out_ts = inner.out_frames[idx].full.timestamp;
        let loose = find == IaxControl::Pong;
        let pos = inner.in_frames.iter().position(|f| {
            f.frame_type == FrameType::Iax
                && f.subclass == find as u32
                && if loose {
                    f.timestamp >= out_ts
                } else {
                    f.timestamp == out_ts
                }
        });
        match pos {
            Some(pos) => {
                inner.in_frames.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Ack the newest queued frame that deserves one.
    fn ack_in_frames(&self, inner: &mut Inner) {
        let mut best: Option<FullFrame> = None;
        for frame in &inner.in_frames {
            if let Some(b) = &best {
                if (frame.oseq.wrapping_sub(b.oseq) as i8) < 0 {
                    continue;
                }
            }
            let skip = frame.frame_type == FrameType::Iax
                && matches!(
                    IaxControl::from_u32(frame.subclass),
                    Some(IaxControl::Ack)
                        | Some(IaxControl::Inval)
                        | Some(IaxControl::LagRq)
                        | Some(IaxControl::Ping)
                );
            if !skip {
                best = Some(frame.clone());
            }
        }
        if let Some(frame) = best {
            if can_update_last_ack(frame.oseq as u32, inner.last_ack) {
                self.send_ack(inner, &frame);
            }
        }
    }

    // ---- frame emission ---------------------------------------------------

    /// Queue and transmit a reliable frame.
    fn post_frame(
        &self,
        inner: &mut Inner,
        frame_type: FrameType,
        subclass: u32,
        payload: Vec<u8>,
        tstamp: u32,
        ack_only: bool,
    ) {
        if inner.state == State::Terminated {
            return;
        }
        let now = self.time.now_instant();
        // Pong and LagRp echo the peer's clock; video runs its own wrap
        // space. Everything else bends onto the monotonic full-frame
        // clock.
        let echo = frame_type == FrameType::Iax
            && (subclass == IaxControl::Pong as u32 || subclass == IaxControl::LagRp as u32);
        let ts = if echo || frame_type == FrameType::Video {
            tstamp
        } else {
            self.adjust_tstamp(inner, tstamp, now)
        };
        let full = FullFrame {
            frame_type,
            subclass,
            src_call: self.local_call,
            dst_call: inner.remote_call,
            retrans: false,
            oseq: inner.oseq,
            iseq: inner.iseq,
            timestamp: ts,
            payload,
        };
        if counts_for_sequence(&full) {
            inner.oseq = inner.oseq.wrapping_add(1);
        }
        match FrameOut::new(
            full,
            self.cfg.retrans_count,
            self.cfg.retrans_interval,
            ack_only,
            now,
        ) {
            Ok(fo) => {
                debug!(
                    call = self.local_call,
                    frame_type = ?frame_type,
                    subclass,
                    oseq = fo.full.oseq,
                    iseq = fo.full.iseq,
                    ts = fo.full.timestamp,
                    "posting frame"
                );
                let _ = self.transport.send_to(fo.wire(), self.remote_addr);
                inner.out_frames.push(fo);
            }
            Err(err) => warn!(call = self.local_call, %err, "cannot encode frame"),
        }
    }

    fn post_frame_ies(
        &self,
        inner: &mut Inner,
        subclass: IaxControl,
        ies: &IeList,
        tstamp: u32,
        ack_only: bool,
    ) {
        match ies.to_bytes() {
            Ok(payload) => self.post_frame(
                inner,
                FrameType::Iax,
                subclass as u32,
                payload,
                tstamp,
                ack_only,
            ),
            Err(err) => warn!(call = self.local_call, %err, "cannot encode IE list"),
        }
    }

    /// Full-frame timestamps are strictly monotonic per transaction; a
    /// zero input means "now", clamped forward past the last audio
    /// timestamp so media and signaling share one clock.
    fn adjust_tstamp(&self, inner: &mut Inner, tstamp: u32, now: Instant) -> u32 {
        let mut ts = tstamp;
        if ts == 0 {
            ts = self.elapsed_ms(now);
            let bout = self.audio.outgoing.lock();
            if ts <= bout.last_out {
                ts = bout.last_out + 1;
            }
        }
        if ts <= inner.last_full_out_ts {
            ts = inner.last_full_out_ts + 1;
        }
        inner.last_full_out_ts = ts;
        ts
    }

    fn send_ack(&self, inner: &mut Inner, frame: &FullFrame) {
        if can_update_last_ack(frame.oseq as u32, inner.last_ack) {
            inner.last_ack = frame.oseq as u32;
        }
        let ack = FullFrame {
            frame_type: FrameType::Iax,
            subclass: IaxControl::Ack as u32,
            src_call: self.local_call,
            dst_call: inner.remote_call,
            retrans: false,
            oseq: frame.iseq,
            iseq: inner.iseq,
            timestamp: frame.timestamp,
            payload: Vec::new(),
        };
        if let Ok(wire) = Frame::Full(ack).to_bytes() {
            let _ = self.transport.send_to(&wire, self.remote_addr);
        }
    }

    fn send_vnak(&self, inner: &mut Inner) {
        let vnak = FullFrame {
            frame_type: FrameType::Iax,
            subclass: IaxControl::Vnak as u32,
            src_call: self.local_call,
            dst_call: inner.remote_call,
            retrans: false,
            oseq: inner.oseq,
            iseq: inner.iseq,
            timestamp: self.elapsed_ms(self.time.now_instant()),
            payload: Vec::new(),
        };
        if let Ok(wire) = Frame::Full(vnak).to_bytes() {
            let _ = self.transport.send_to(&wire, self.remote_addr);
        }
    }

    fn send_inval_reply(&self, frame: &FullFrame) {
        let inval = FullFrame {
            frame_type: FrameType::Iax,
            subclass: IaxControl::Inval as u32,
            src_call: frame.dst_call,
            dst_call: frame.src_call,
            retrans: true,
            oseq: frame.iseq,
            iseq: frame.oseq,
            timestamp: frame.timestamp,
            payload: Vec::new(),
        };
        if let Ok(wire) = Frame::Full(inval).to_bytes() {
            let _ = self.transport.send_to(&wire, self.remote_addr);
        }
    }

    fn send_unsupport(&self, inner: &mut Inner, subclass: u32) {
        let mut ies = IeList::new();
        let packed = iax_proto::pack_subclass(subclass).unwrap_or(0);
        ies.append_u8(ie_tag::IAX_UNKNOWN, packed);
        self.post_frame_ies(inner, IaxControl::Unsupport, &ies, 0, true);
    }

    // ---- owner commands ---------------------------------------------------

    /// Accept an inbound call (New) or finish an inbound registration
    /// (RegAck).
    pub fn send_accept(self: &Arc<Self>, expires: Option<u32>) -> bool {
        let now = self.time.now_instant();
        let mut inner = self.inner.lock();
        let allowed = match self.trans_type {
            TransactionType::New | TransactionType::RegReq | TransactionType::RegRel => matches!(
                inner.state,
                State::NewRemoteInvite | State::NewRemoteInviteRepRecv
            ),
            TransactionType::Poke => false,
        };
        if !allowed {
            return false;
        }
        inner.accepted = true;
        if self.trans_type == TransactionType::New {
            let mut ies = IeList::new();
            ies.append_u32(ie_tag::FORMAT, inner.fmt_audio | inner.fmt_video);
            ies.append_u32(ie_tag::CAPABILITY, inner.capability);
            self.post_frame_ies(&mut inner, IaxControl::Accept, &ies, 0, true);
            self.change_state(&mut inner, State::Connected);
            // The negotiated format is now ours in both directions.
            let fmt_audio = inner.fmt_audio;
            let fmt_video = inner.fmt_video;
            drop(inner);
            self.audio.incoming.lock().fmt = fmt_audio;
            self.audio.outgoing.lock().fmt = fmt_audio;
            self.video.incoming.lock().fmt = fmt_video;
            self.video.outgoing.lock().fmt = fmt_video;
        } else {
            let mut ies = IeList::new();
            if let Some(user) = inner.username.clone() {
                ies.append_str(ie_tag::USERNAME, user);
            }
            if self.trans_type == TransactionType::RegReq {
                if let Some(expires) = expires {
                    inner.expire = expires;
                }
                ies.append_u16(ie_tag::REFRESH, inner.expire as u16);
            }
            if let SocketAddr::V4(addr) = self.remote_addr {
                ies.append_addr(ie_tag::APPARENT_ADDR, addr);
            }
            self.post_frame_ies(&mut inner, IaxControl::RegAck, &ies, 0, true);
            self.wait_for_terminate_silent(&mut inner, now);
            inner.local_req_end = true;
        }
        true
    }

    /// Tear down an established or pending call.
    pub fn send_hangup(self: &Arc<Self>, cause: Option<&str>, code: u8) -> bool {
        let now = self.time.now_instant();
        let mut inner = self.inner.lock();
        if self.trans_type != TransactionType::New
            || matches!(inner.state, State::Terminated | State::Terminating)
        {
            return false;
        }
        let mut ies = IeList::new();
        if let Some(cause) = cause {
            if !cause.is_empty() {
                ies.append_str(ie_tag::CAUSE, cause);
            }
        }
        if code != 0 {
            ies.append_u8(ie_tag::CAUSECODE, code);
        }
        debug!(call = self.local_call, cause, code, "hangup");
        self.post_frame_ies(&mut inner, IaxControl::Hangup, &ies, 0, true);
        self.wait_for_terminate_silent(&mut inner, now);
        inner.local_req_end = true;
        true
    }

    /// Decline a transaction before it connects.
    pub fn send_reject(self: &Arc<Self>, cause: Option<&str>, code: u8) -> bool {
        let now = self.time.now_instant();
        let mut inner = self.inner.lock();
        self.send_reject_locked(&mut inner, cause.unwrap_or(""), code, now)
    }

    fn send_reject_locked(
        self: &Arc<Self>,
        inner: &mut Inner,
        cause: &str,
        code: u8,
        now: Instant,
    ) -> bool {
        if matches!(inner.state, State::Terminated | State::Terminating) {
            return false;
        }
        let (subclass, cause, code) = match self.trans_type {
            TransactionType::New => (IaxControl::Reject, cause, code),
            TransactionType::RegReq | TransactionType::RegRel => {
                // Registration rejects demand parameters.
                let code = if code == 0 { 29 } else { code };
                (IaxControl::RegRej, cause, code)
            }
            TransactionType::Poke => return false,
        };
        debug!(call = self.local_call, cause, code, "reject");
        let mut ies = IeList::new();
        if !cause.is_empty() || subclass == IaxControl::RegRej {
            ies.append_str(ie_tag::CAUSE, cause);
        }
        if code != 0 {
            ies.append_u8(ie_tag::CAUSECODE, code);
        }
        self.post_frame_ies(inner, subclass, &ies, 0, true);
        self.wait_for_terminate_silent(inner, now);
        inner.local_req_end = true;
        true
    }

    /// Challenge the peer (MD5).
    pub fn send_auth(self: &Arc<Self>) -> bool {
        let mut inner = self.inner.lock();
        if inner.state != State::NewRemoteInvite {
            return false;
        }
        let challenge = auth::new_challenge(&mut *self.rng.lock());
        inner.challenge = Some(challenge.clone());
        let subclass = match self.trans_type {
            TransactionType::New => IaxControl::AuthReq,
            TransactionType::RegReq | TransactionType::RegRel => IaxControl::RegAuth,
            TransactionType::Poke => return false,
        };
        let mut ies = IeList::new();
        if let Some(user) = inner.username.clone() {
            ies.append_str(ie_tag::USERNAME, user);
        }
        ies.append_u16(ie_tag::AUTHMETHODS, crate::engine::AUTH_METHOD_MD5);
        ies.append_str(ie_tag::CHALLENGE, challenge);
        self.post_frame_ies(&mut inner, subclass, &ies, 0, false);
        self.change_state(&mut inner, State::NewRemoteInviteAuthSent);
        true
    }

    /// Answer a received challenge with the MD5 digest.
    pub fn send_auth_reply(self: &Arc<Self>, response: String) -> bool {
        let mut inner = self.inner.lock();
        if inner.state != State::NewLocalInviteAuthRecv {
            return false;
        }
        inner.auth_data = Some(response.clone());
        let mut ies = IeList::new();
        let subclass = match self.trans_type {
            TransactionType::New => IaxControl::AuthRep,
            TransactionType::RegReq => {
                if let Some(user) = inner.username.clone() {
                    ies.append_str(ie_tag::USERNAME, user);
                }
                ies.append_u16(ie_tag::REFRESH, inner.expire as u16);
                IaxControl::RegReq
            }
            TransactionType::RegRel => {
                if let Some(user) = inner.username.clone() {
                    ies.append_str(ie_tag::USERNAME, user);
                }
                IaxControl::RegRel
            }
            TransactionType::Poke => return false,
        };
        ies.append_str(ie_tag::MD5_RESULT, response);
        self.post_frame_ies(&mut inner, subclass, &ies, 0, false);
        self.change_state(&mut inner, State::NewLocalInviteRepSent);
        true
    }

    pub fn send_text(self: &Arc<Self>, text: &str) -> bool {
        let mut inner = self.inner.lock();
        if inner.state != State::Connected {
            return false;
        }
        self.post_frame(
            &mut inner,
            FrameType::Text,
            0,
            text.as_bytes().to_vec(),
            0,
            true,
        );
        true
    }

    pub fn send_dtmf(self: &Arc<Self>, digit: char) -> bool {
        let mut inner = self.inner.lock();
        if inner.state != State::Connected || !digit.is_ascii() {
            return false;
        }
        self.post_frame(
            &mut inner,
            FrameType::Dtmf,
            digit as u32,
            Vec::new(),
            0,
            true,
        );
        true
    }

    pub fn send_ringing(self: &Arc<Self>) -> bool {
        self.send_connected(ControlType::Ringing)
    }

    pub fn send_answer(self: &Arc<Self>) -> bool {
        self.send_connected(ControlType::Answer)
    }

    pub fn send_progressing(self: &Arc<Self>) -> bool {
        self.send_connected(ControlType::Progressing)
    }

    fn send_connected(self: &Arc<Self>, control: ControlType) -> bool {
        let mut inner = self.inner.lock();
        if inner.state != State::Connected {
            return false;
        }
        self.post_frame(
            &mut inner,
            FrameType::Control,
            control as u32,
            Vec::new(),
            0,
            true,
        );
        true
    }

    /// Abandon a registration attempt without waiting for the server.
    pub fn abort_registration(self: &Arc<Self>) -> bool {
        {
            let mut inner = self.inner.lock();
            if !matches!(
                self.trans_type,
                TransactionType::RegReq | TransactionType::RegRel
            ) || matches!(inner.state, State::Terminated | State::Terminating)
            {
                return false;
            }
            inner.out_frames.clear();
        }
        *self.owner.lock() = no_owner();
        self.send_reject(Some("Aborted"), 0)
    }

    // ---- inbound setup helpers --------------------------------------------

    fn init_from_ies(&self, inner: &mut Inner, ies: &IeList) {
        match self.trans_type {
            TransactionType::New => {
                inner.username = ies.string(ie_tag::USERNAME).map(str::to_owned);
                inner.calling_number = ies.string(ie_tag::CALLING_NUMBER).map(str::to_owned);
                inner.calling_name = ies.string(ie_tag::CALLING_NAME).map(str::to_owned);
                inner.called_number = ies.string(ie_tag::CALLED_NUMBER).map(str::to_owned);
                inner.called_context = ies.string(ie_tag::CALLED_CONTEXT).map(str::to_owned);
                let peer_cap = ies.numeric(ie_tag::CAPABILITY).unwrap_or(0);
                let fmt = ies.numeric(ie_tag::FORMAT).unwrap_or(0);
                inner.capability &= peer_cap;
                let usable = fmt & inner.capability;
                inner.fmt_audio = format::mask(usable, MediaType::Audio);
                inner.fmt_video = format::mask(usable, MediaType::Video);
                // The offered codec may fall outside the shared set while
                // some other shared codec still exists.
                if inner.fmt_audio == 0 {
                    let cap_audio = format::mask(inner.capability, MediaType::Audio);
                    if cap_audio != 0 {
                        inner.fmt_audio = 1 << cap_audio.trailing_zeros();
                    }
                }
            }
            TransactionType::RegReq => {
                inner.username = ies.string(ie_tag::USERNAME).map(str::to_owned);
                inner.called_number = ies.string(ie_tag::CALLED_NUMBER).map(str::to_owned);
                if let Some(refresh) = ies.numeric(ie_tag::REFRESH) {
                    inner.expire = refresh;
                }
            }
            TransactionType::RegRel => {
                inner.username = ies.string(ie_tag::USERNAME).map(str::to_owned);
            }
            TransactionType::Poke => {}
        }
    }

    fn process_auth_req(self: &Arc<Self>, inner: &mut Inner, ev: Event, now: Instant) -> Event {
        if ev.kind != EventKind::AuthReq {
            return ev;
        }
        let methods = ev.ies.numeric(ie_tag::AUTHMETHODS).unwrap_or(0);
        let challenge = ev.ies.string(ie_tag::CHALLENGE).map(str::to_owned);
        let md5_offered = methods & crate::engine::AUTH_METHOD_MD5 as u32 != 0;
        match challenge {
            Some(challenge) if md5_offered => {
                inner.challenge = Some(challenge);
                ev
            }
            // Code 47: resource unavailable.
            _ => self.internal_reject(inner, NO_AUTH_METHOD, 47, now),
        }
    }

    fn process_accept(self: &Arc<Self>, inner: &mut Inner, ev: Event, now: Instant) -> Event {
        if ev.kind != EventKind::Accept || inner.accepted {
            return ev;
        }
        inner.accepted = true;
        if self.process_accept_fmt(inner, &ev.ies) {
            ev
        } else {
            // Code 58: no media.
            self.internal_reject(inner, NO_MEDIA_FORMAT, 58, now)
        }
    }

    fn process_auth_rep(&self, inner: &mut Inner, ev: Event) -> Event {
        if ev.kind == EventKind::AuthRep {
            inner.auth_data = ev.ies.string(ie_tag::MD5_RESULT).map(str::to_owned);
        }
        ev
    }

    fn process_reg_ack(&self, inner: &mut Inner, ev: Event) -> Event {
        if let Some(refresh) = ev.ies.numeric(ie_tag::REFRESH) {
            inner.expire = refresh;
        }
        if let Some(v) = ev.ies.string(ie_tag::CALLING_NAME) {
            inner.calling_name = Some(v.to_owned());
        }
        if let Some(v) = ev.ies.string(ie_tag::CALLING_NUMBER) {
            inner.calling_number = Some(v.to_owned());
        }
        ev
    }

    /// Apply the formats granted by an Accept.
    fn process_accept_fmt(&self, inner: &mut Inner, ies: &IeList) -> bool {
        let fmt = ies.numeric(ie_tag::FORMAT).unwrap_or(0);
        let usable = fmt & inner.capability;
        inner.fmt_audio = format::mask(usable, MediaType::Audio);
        inner.fmt_video = format::mask(usable, MediaType::Video);
        let fmt_audio = inner.fmt_audio;
        let fmt_video = inner.fmt_video;
        if fmt_audio != 0 {
            self.audio.incoming.lock().fmt = fmt_audio;
            self.audio.outgoing.lock().fmt = fmt_audio;
        }
        if fmt_video != 0 {
            self.video.incoming.lock().fmt = fmt_video;
            self.video.outgoing.lock().fmt = fmt_video;
        }
        fmt_audio != 0 || fmt_video != 0
    }

    /// A buffered Accept may justify voice that arrived early.
    fn check_accept_recv(self: &Arc<Self>, inner: &mut Inner, now: Instant) -> Option<Event> {
        let accept = inner
            .in_frames
            .iter()
            .find(|f| f.frame_type == FrameType::Iax && f.subclass == IaxControl::Accept as u32)
            .cloned();
        let Some(accept) = accept else {
            // Code 101: message not compatible with call state.
            return Some(self.internal_reject(inner, VOICE_BEFORE_ACCEPT, 101, now));
        };
        inner.accepted = true;
        let ies = IeList::decode(&accept.payload).unwrap_or_default();
        if self.process_accept_fmt(inner, &ies) {
            None
        } else {
            Some(self.internal_reject(inner, NO_MEDIA_FORMAT, 58, now))
        }
    }

    /// Reject locally and synthesize the matching final event.
    fn internal_reject(self: &Arc<Self>, inner: &mut Inner, reason: &str, code: u8, now: Instant) -> Event {
        debug!(call = self.local_call, reason, code, "internal reject");
        self.send_reject_locked(inner, reason, code, now);
        let mut ev = Event::bare(EventKind::Reject, true, true);
        ev.frame_type = Some(FrameType::Iax);
        ev.subclass = IaxControl::Reject as u32;
        ev.ies.append_str(ie_tag::CAUSE, reason);
        if code != 0 {
            ev.ies.append_u8(ie_tag::CAUSECODE, code);
        }
        inner.local_req_end = true;
        ev
    }
}

impl Inner {
    fn new(state: State, remote_call: u16, params: &CallParams) -> Self {
        Inner {
            state,
            remote_call,
            oseq: 0,
            iseq: 0,
            last_ack: 0xFFFF,
            last_full_out_ts: 0,
            in_frames: VecDeque::new(),
            out_frames: Vec::new(),
            pending_event: None,
            destroy: false,
            accepted: false,
            local_req_end: false,
            terminate_at: None,
            next_ping: None,
            in_total: 0,
            in_oo: 0,
            in_dropped: 0,
            req_voice_vnak: 0,
            last_vnak: None,
            username: params.username.clone(),
            calling_number: params.calling_number.clone(),
            calling_name: params.calling_name.clone(),
            called_number: params.called_number.clone(),
            called_context: params.called_context.clone(),
            challenge: None,
            auth_data: None,
            expire: if params.refresh == 0 { 60 } else { params.refresh },
            fmt_audio: format::mask(params.format, MediaType::Audio),
            fmt_video: format::mask(params.format, MediaType::Video),
            capability: params.capability,
            call_token_pending: params.call_token,
        }
    }
}

/// ACK, INVAL, VNAK and the transfer probes travel outside the sequence
/// space.
fn counts_for_sequence(frame: &FullFrame) -> bool {
    if frame.frame_type != FrameType::Iax {
        return true;
    }
    !matches!(
        IaxControl::from_u32(frame.subclass),
        Some(IaxControl::Ack)
            | Some(IaxControl::Inval)
            | Some(IaxControl::Vnak)
            | Some(IaxControl::TxAcc)
            | Some(IaxControl::TxCnt)
    )
}

/// The last-ack counter only moves forward (with wrap headroom).
fn can_update_last_ack(seq: u32, last: u32) -> bool {
    let interval = seq as i64 - last as i64;
    (interval > 0 && interval <= 32767) || interval <= -32767
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts_for_sequence() {
        let mut frame = FullFrame {
            frame_type: FrameType::Iax,
            subclass: IaxControl::Ack as u32,
            src_call: 1,
            dst_call: 2,
            retrans: false,
            oseq: 0,
            iseq: 0,
            timestamp: 0,
            payload: Vec::new(),
        };
        assert!(!counts_for_sequence(&frame));
        frame.subclass = IaxControl::New as u32;
        assert!(counts_for_sequence(&frame));
        frame.frame_type = FrameType::Voice;
        frame.subclass = 4;
        assert!(counts_for_sequence(&frame));
    }

    #[test]
    fn test_last_ack_guard() {
        // Fresh transaction: first ack always allowed.
        assert!(can_update_last_ack(0, 0xFFFF));
        assert!(can_update_last_ack(5, 0));
        assert!(!can_update_last_ack(5, 5));
        assert!(!can_update_last_ack(4, 5));
    }
}
