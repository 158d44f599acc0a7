//! The UDP engine: one bound endpoint, the call-number space, and the
//! demultiplexer routing datagrams onto transactions, plus the worker
//! thread pools driving them.

use std::collections::{BTreeSet, HashMap};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam::channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use tracing::{debug, error, info, warn};

use iax_proto::constants::format::MediaType;
use iax_proto::constants::{AuthMethod, FrameType, IaxControl, MAX_CALL_NUMBER};
use iax_proto::{ie_tag, Frame, FullFrame, IeList, MiniFrame};

use crate::auth;
use crate::config::{EngineConfig, TransactionConfig};
use crate::error::{EngineError, EngineResult};
use crate::event::{Event, EventKind};
use crate::time::{SystemTimeProvider, TimeProvider};
use crate::transaction::{CallParams, State, Transaction, TransactionType};
use crate::transport::{Transport, UdpTransport};
use crate::trunk::TrunkFrame;

/// AUTHMETHODS bit for MD5, the one mechanism this stack implements.
pub const AUTH_METHOD_MD5: u16 = AuthMethod::Md5 as u16;

/// Call number 1 never names a transaction; it sources engine-level
/// replies (call-token bounces, congestion rejects).
const INTERNAL_CALL_NUMBER: u16 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineStatus {
    Listening,
    Disabled,
    Removed,
    Exiting,
    BindFailed,
    Idle,
}

/// The identity of an inbound call presented to the router.
#[derive(Debug, Clone, Default)]
pub struct NewCallParams {
    pub username: Option<String>,
    pub called_number: Option<String>,
    pub called_context: Option<String>,
    pub calling_number: Option<String>,
    pub calling_name: Option<String>,
    pub format: u32,
    pub capability: u32,
}

#[derive(Debug, Clone)]
pub enum RouteDecision {
    Accept,
    Reject { cause: String, code: u8 },
}

/// The host side of the engine: credential lookups, call routing, and
/// the media format-change veto.
pub trait EngineHooks: Send + Sync {
    /// Synchronous password lookup for MD5 verification. `None` fails
    /// authentication.
    fn password_for(&self, _username: &str) -> Option<String> {
        None
    }

    /// Route an authenticated inbound call.
    fn route_call(&self, _params: &NewCallParams) -> RouteDecision {
        // Q.850 cause 3: no route to destination.
        RouteDecision::Reject {
            cause: "No route".into(),
            code: 3,
        }
    }

    /// Whether a mid-call format change is acceptable.
    fn media_format_changed(&self, _media: MediaType, _old: u32, _new: u32) -> bool {
        true
    }
}

/// Hooks that reject every inbound call and know no passwords.
#[derive(Debug, Default)]
pub struct DefaultHooks;

impl EngineHooks for DefaultHooks {}

struct CallNumAllocator {
    used: BTreeSet<u16>,
}

impl CallNumAllocator {
    fn new() -> Self {
        CallNumAllocator {
            used: BTreeSet::new(),
        }
    }

    /// Lowest free call number in [2, 32767].
    fn allocate(&mut self) -> Option<u16> {
        let mut candidate = 2;
        for used in self.used.iter() {
            if *used < 2 {
                continue;
            }
            if *used > candidate {
                break;
            }
            candidate = *used + 1;
        }
        if candidate > MAX_CALL_NUMBER {
            return None;
        }
        self.used.insert(candidate);
        Some(candidate)
    }

    fn release(&mut self, call: u16) {
        self.used.remove(&call);
    }
}

struct EngineInner {
    allocator: CallNumAllocator,
    by_local: HashMap<u16, Arc<Transaction>>,
    by_remote: HashMap<(SocketAddr, u16), u16>,
    trunks: HashMap<SocketAddr, Arc<TrunkFrame>>,
    exit_deadline: Option<Instant>,
    workers: Vec<JoinHandle<()>>,
}

pub struct Engine {
    config: EngineConfig,
    transport: Arc<dyn Transport>,
    udp: Option<Arc<UdpTransport>>,
    time: Arc<dyn TimeProvider>,
    hooks: Arc<dyn EngineHooks>,
    status: Mutex<EngineStatus>,
    shutdown: Arc<AtomicBool>,
    rng: Mutex<StdRng>,
    token_secret: [u8; 16],
    events_tx: Sender<(Arc<Transaction>, Event)>,
    events_rx: Receiver<(Arc<Transaction>, Event)>,
    inner: Mutex<EngineInner>,
}

impl Engine {
    /// Bind a UDP endpoint and stand the engine up around it. Workers
    /// are not started yet; call [`Engine::start_workers`].
    pub fn bind(
        config: EngineConfig,
        hooks: Arc<dyn EngineHooks>,
        time: Arc<dyn TimeProvider>,
    ) -> EngineResult<Arc<Self>> {
        let udp = Arc::new(UdpTransport::bind(&config)?);
        info!(name = %config.name, addr = %udp.local_addr(), "engine listening");
        let transport: Arc<dyn Transport> = udp.clone();
        Ok(Self::assemble(config, transport, Some(udp), hooks, time))
    }

    /// Assemble an engine over an arbitrary transport (tests drive the
    /// demux directly and capture writes).
    pub fn with_transport(
        config: EngineConfig,
        transport: Arc<dyn Transport>,
        hooks: Arc<dyn EngineHooks>,
        time: Arc<dyn TimeProvider>,
    ) -> Arc<Self> {
        Self::assemble(config, transport, None, hooks, time)
    }

    fn assemble(
        config: EngineConfig,
        transport: Arc<dyn Transport>,
        udp: Option<Arc<UdpTransport>>,
        hooks: Arc<dyn EngineHooks>,
        time: Arc<dyn TimeProvider>,
    ) -> Arc<Self> {
        let mut seed_rng = StdRng::from_entropy();
        let mut token_secret = [0u8; 16];
        seed_rng.fill_bytes(&mut token_secret);
        let (events_tx, events_rx) = unbounded();
        Arc::new(Engine {
            config,
            transport,
            udp,
            time,
            hooks,
            status: Mutex::new(EngineStatus::Listening),
            shutdown: Arc::new(AtomicBool::new(false)),
            rng: Mutex::new(seed_rng),
            token_secret,
            events_tx,
            events_rx,
            inner: Mutex::new(EngineInner {
                allocator: CallNumAllocator::new(),
                by_local: HashMap::new(),
                by_remote: HashMap::new(),
                trunks: HashMap::new(),
                exit_deadline: None,
                workers: Vec::new(),
            }),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn status(&self) -> EngineStatus {
        *self.status.lock()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.transport.local_addr()
    }

    pub fn transport(&self) -> Arc<dyn Transport> {
        self.transport.clone()
    }

    pub(crate) fn time(&self) -> Arc<dyn TimeProvider> {
        self.time.clone()
    }

    /// Events for transactions nobody owns; the host drains these.
    pub fn events(&self) -> &Receiver<(Arc<Transaction>, Event)> {
        &self.events_rx
    }

    pub fn transaction_count(&self) -> usize {
        self.inner.lock().by_local.len()
    }

    fn child_rng(&self) -> StdRng {
        StdRng::seed_from_u64(self.rng.lock().next_u64())
    }

    // ---- transaction construction -----------------------------------------

    /// Start an outgoing call.
    pub fn start_call(
        self: &Arc<Self>,
        remote: SocketAddr,
        mut params: CallParams,
    ) -> EngineResult<Arc<Transaction>> {
        if params.capability == 0 {
            params.capability = self.config.capability;
        }
        if params.format == 0 {
            params.format = self.config.preferred | self.config.preferred_video;
        }
        params.call_token = params.call_token || self.config.calltoken_out;
        self.start_transaction(TransactionType::New, remote, params)
    }

    /// Start an outgoing registration (`RegReq`) or unregistration
    /// (`RegRel`).
    pub fn start_registration(
        self: &Arc<Self>,
        remote: SocketAddr,
        mut params: CallParams,
        unregister: bool,
    ) -> EngineResult<Arc<Transaction>> {
        params.call_token = params.call_token || self.config.calltoken_out;
        let kind = if unregister {
            TransactionType::RegRel
        } else {
            TransactionType::RegReq
        };
        self.start_transaction(kind, remote, params)
    }

    /// Probe a peer for liveness.
    pub fn poke(self: &Arc<Self>, remote: SocketAddr) -> EngineResult<Arc<Transaction>> {
        self.start_transaction(TransactionType::Poke, remote, CallParams::default())
    }

    fn start_transaction(
        self: &Arc<Self>,
        kind: TransactionType,
        remote: SocketAddr,
        params: CallParams,
    ) -> EngineResult<Arc<Transaction>> {
        if self.status() != EngineStatus::Listening {
            return Err(EngineError::Exiting);
        }
        let mut inner = self.inner.lock();
        let local_call = inner
            .allocator
            .allocate()
            .ok_or(EngineError::CallNumbersExhausted)?;
        let tr = Transaction::outgoing(
            kind,
            local_call,
            remote,
            params,
            TransactionConfig::from(&self.config),
            self.transport.clone(),
            self.time.clone(),
            self.hooks.clone(),
            self.child_rng(),
        );
        inner.by_local.insert(local_call, tr.clone());
        drop(inner);
        tr.start();
        Ok(tr)
    }

    /// Attach a call's audio to the outbound trunk towards its peer,
    /// creating the trunk frame on first use.
    pub fn enable_trunking(self: &Arc<Self>, tr: &Arc<Transaction>) -> bool {
        let trunk = {
            let mut inner = self.inner.lock();
            let addr = tr.remote_addr();
            inner
                .trunks
                .entry(addr)
                .or_insert_with(|| {
                    Arc::new(TrunkFrame::new(
                        addr,
                        Duration::from_millis(self.config.trunk_send_interval_ms),
                        self.config.trunk_max_len,
                        self.config.trunk_timestamps,
                        self.transport.clone(),
                        &*self.time,
                    ))
                })
                .clone()
        };
        tr.enable_trunking(trunk, self.config.trunk_efficient_use)
    }

    // ---- demux ------------------------------------------------------------

    /// Route one received datagram. Called from listener threads (or
    /// directly in tests).
    pub fn process_datagram(self: &Arc<Self>, buf: &[u8], addr: SocketAddr, now: Instant) {
        let frame = match Frame::decode(buf) {
            Ok(frame) => frame,
            Err(err) => {
                debug!(%addr, %err, len = buf.len(), "dropping undecodable datagram");
                return;
            }
        };
        match frame {
            Frame::Mini(ref mini) => {
                if let Some(tr) = self.find_remote(addr, mini.src_call) {
                    tr.process_frame(frame, now);
                }
            }
            Frame::MetaVideo(ref video) => {
                if let Some(tr) = self.find_remote(addr, video.src_call) {
                    tr.process_frame(frame, now);
                }
            }
            Frame::MetaTrunk(trunk) => self.process_trunk_frame(trunk, addr, now),
            Frame::Full(full) => self.process_full_frame(full, addr, now),
        }
    }

    fn process_trunk_frame(
        self: &Arc<Self>,
        trunk: iax_proto::MetaTrunkFrame,
        addr: SocketAddr,
        now: Instant,
    ) {
        if trunk.with_timestamps {
            for entry in trunk.entries {
                let Some(tr) = self.find_remote(addr, entry.src_call) else {
                    continue;
                };
                let mini = MiniFrame {
                    src_call: entry.src_call,
                    timestamp: entry.timestamp.unwrap_or(0),
                    payload: entry.payload,
                };
                tr.process_frame(Frame::Mini(mini), now);
            }
        } else {
            // Batch consecutive payloads per call, preserving order.
            let mut batches: Vec<(u16, Vec<Vec<u8>>)> = Vec::new();
            for entry in trunk.entries {
                match batches.last_mut() {
                    Some((call, batch)) if *call == entry.src_call => {
                        batch.push(entry.payload);
                        continue;
                    }
                    _ => {}
                }
                batches.push((entry.src_call, vec![entry.payload]));
            }
            for (src_call, payloads) in batches {
                if let Some(tr) = self.find_remote(addr, src_call) {
                    tr.process_mini_no_ts(trunk.timestamp, &payloads, now);
                }
            }
        }
    }

    fn process_full_frame(self: &Arc<Self>, full: FullFrame, addr: SocketAddr, now: Instant) {
        if full.dst_call != 0 {
            let known = self.inner.lock().by_local.get(&full.dst_call).cloned();
            if let Some(tr) = known {
                if tr.remote_addr() == addr {
                    // A call-token bounce is sourced from the reserved
                    // call number; never adopt it as the peer's call.
                    let token_bounce = full.frame_type == FrameType::Iax
                        && full.subclass == IaxControl::CallToken as u32;
                    if tr.remote_call() == 0 && !token_bounce {
                        tr.learn_remote_call(full.src_call);
                        self.inner
                            .lock()
                            .by_remote
                            .insert((addr, full.src_call), tr.local_call());
                    }
                    tr.process_frame(Frame::Full(full), now);
                    return;
                }
            }
            self.send_inval(&full, addr);
            return;
        }
        // Destination zero: an opening frame, possibly retransmitted.
        if let Some(tr) = self.find_remote(addr, full.src_call) {
            tr.process_frame(Frame::Full(full), now);
            return;
        }
        let opener = full.frame_type == FrameType::Iax
            && matches!(
                IaxControl::from_u32(full.subclass),
                Some(IaxControl::New)
                    | Some(IaxControl::RegReq)
                    | Some(IaxControl::RegRel)
                    | Some(IaxControl::Poke)
            );
        if !opener {
            self.send_inval(&full, addr);
            return;
        }
        if self.status() != EngineStatus::Listening {
            // Winding down: refuse with switch congestion.
            self.send_engine_reject(&full, addr, "Exiting", 42);
            return;
        }
        if self.config.calltoken_in && !self.calltoken_gate(&full, addr) {
            return;
        }
        self.accept_inbound(full, addr, now);
    }

    /// Call-token admission: callers without a token get one and must
    /// retry; tokens presented are validated against our secret.
    fn calltoken_gate(self: &Arc<Self>, full: &FullFrame, addr: SocketAddr) -> bool {
        if full.subclass == IaxControl::Poke as u32 {
            return true;
        }
        let ies = match IeList::decode(&full.payload) {
            Ok(ies) => ies,
            Err(_) => return false,
        };
        match ies.binary(ie_tag::CALLTOKEN) {
            Some(token) if !token.is_empty() => {
                let ok = auth::validate_call_token(
                    &self.token_secret,
                    addr,
                    token,
                    self.time.now_system_ms(),
                    self.config.calltoken_age_ms,
                );
                if !ok {
                    debug!(%addr, "rejecting stale or forged call token");
                    self.send_inval(full, addr);
                }
                ok
            }
            _ => {
                let token = auth::mint_call_token(
                    &self.token_secret,
                    addr,
                    self.time.now_system_ms(),
                );
                let mut ies = IeList::new();
                ies.append_bin(ie_tag::CALLTOKEN, token);
                let reply = FullFrame {
                    frame_type: FrameType::Iax,
                    subclass: IaxControl::CallToken as u32,
                    src_call: INTERNAL_CALL_NUMBER,
                    dst_call: full.src_call,
                    retrans: false,
                    oseq: 0,
                    iseq: 0,
                    timestamp: full.timestamp,
                    payload: ies.to_bytes().unwrap_or_default(),
                };
                if let Ok(wire) = Frame::Full(reply).to_bytes() {
                    let _ = self.transport.send_to(&wire, addr);
                }
                false
            }
        }
    }

    fn accept_inbound(self: &Arc<Self>, full: FullFrame, addr: SocketAddr, _now: Instant) {
        let mut inner = self.inner.lock();
        let Some(local_call) = inner.allocator.allocate() else {
            warn!(%addr, "call number space exhausted, refusing call");
            drop(inner);
            self.send_engine_reject(&full, addr, "Congestion", 42);
            return;
        };
        let src_call = full.src_call;
        // Inbound transactions negotiate against our configured
        // capability and preferences.
        let params = CallParams {
            capability: self.config.capability,
            format: self.config.preferred | self.config.preferred_video,
            ..CallParams::default()
        };
        let Some(tr) = Transaction::incoming(
            full,
            local_call,
            addr,
            params,
            TransactionConfig::from(&self.config),
            self.transport.clone(),
            self.time.clone(),
            self.hooks.clone(),
            self.child_rng(),
        ) else {
            inner.allocator.release(local_call);
            return;
        };
        inner.by_local.insert(local_call, tr.clone());
        inner.by_remote.insert((addr, src_call), local_call);
        drop(inner);
        debug!(%addr, local_call, src_call, "inbound transaction admitted");
    }

    fn find_remote(&self, addr: SocketAddr, src_call: u16) -> Option<Arc<Transaction>> {
        let inner = self.inner.lock();
        let local = inner.by_remote.get(&(addr, src_call))?;
        inner.by_local.get(local).cloned()
    }

    /// Tell a peer we have no transaction matching its frame. Never
    /// answers ACK, INVAL or VNAK, which would ping-pong forever.
    fn send_inval(&self, full: &FullFrame, addr: SocketAddr) {
        if full.frame_type == FrameType::Iax
            && matches!(
                IaxControl::from_u32(full.subclass),
                Some(IaxControl::Ack) | Some(IaxControl::Inval) | Some(IaxControl::Vnak)
            )
        {
            return;
        }
        debug!(%addr, src = full.src_call, dst = full.dst_call, "replying INVAL");
        let inval = FullFrame {
            frame_type: FrameType::Iax,
            subclass: IaxControl::Inval as u32,
            src_call: full.dst_call,
            dst_call: full.src_call,
            retrans: true,
            oseq: full.iseq,
            iseq: full.oseq,
            timestamp: full.timestamp,
            payload: Vec::new(),
        };
        if let Ok(wire) = Frame::Full(inval).to_bytes() {
            let _ = self.transport.send_to(&wire, addr);
        }
    }

    /// A transaction-less reject sourced from the reserved call number.
    fn send_engine_reject(&self, full: &FullFrame, addr: SocketAddr, cause: &str, code: u8) {
        let reject_subclass = match IaxControl::from_u32(full.subclass) {
            Some(IaxControl::RegReq) | Some(IaxControl::RegRel) => IaxControl::RegRej,
            _ => IaxControl::Reject,
        };
        let mut ies = IeList::new();
        ies.append_str(ie_tag::CAUSE, cause);
        ies.append_u8(ie_tag::CAUSECODE, code);
        let reject = FullFrame {
            frame_type: FrameType::Iax,
            subclass: reject_subclass as u32,
            src_call: INTERNAL_CALL_NUMBER,
            dst_call: full.src_call,
            retrans: false,
            oseq: 0,
            iseq: 1,
            timestamp: full.timestamp,
            payload: ies.to_bytes().unwrap_or_default(),
        };
        if let Ok(wire) = Frame::Full(reject).to_bytes() {
            let _ = self.transport.send_to(&wire, addr);
        }
    }

    // ---- event pump -------------------------------------------------------

    /// One pass over all transactions: run their state machines, deliver
    /// events, collect the dead. Returns the number of events handled.
    pub fn pump_events(self: &Arc<Self>, now: Instant) -> usize {
        let transactions: Vec<Arc<Transaction>> =
            self.inner.lock().by_local.values().cloned().collect();
        let mut handled = 0;
        for tr in transactions {
            if !tr.begin_pump() {
                continue;
            }
            while let Some(ev) = tr.get_event(now) {
                handled += 1;
                self.dispatch_event(&tr, ev);
            }
            tr.end_pump();
            if tr.state() == State::Terminated {
                self.remove_transaction(&tr);
            }
        }
        handled
    }

    fn dispatch_event(self: &Arc<Self>, tr: &Arc<Transaction>, ev: Event) {
        if let Some(owner) = tr.owner() {
            owner.on_event(tr, ev);
            return;
        }
        // Unowned transactions are inbound; the engine plays host-side
        // driver until someone claims them.
        match ev.kind {
            EventKind::New => {
                self.handle_inbound_new(tr);
                let _ = self.events_tx.send((tr.clone(), ev));
            }
            EventKind::AuthRep => {
                self.handle_auth_reply(tr);
                let _ = self.events_tx.send((tr.clone(), ev));
            }
            _ => {
                let _ = self.events_tx.send((tr.clone(), ev));
            }
        }
    }

    fn handle_inbound_new(self: &Arc<Self>, tr: &Arc<Transaction>) {
        match tr.trans_type() {
            TransactionType::Poke => {}
            TransactionType::New => {
                if self.config.auth_required {
                    tr.send_auth();
                } else {
                    self.route_and_answer(tr);
                }
            }
            TransactionType::RegReq | TransactionType::RegRel => {
                if self.config.auth_required {
                    tr.send_auth();
                } else {
                    self.finish_registration(tr);
                }
            }
        }
    }

    fn handle_auth_reply(self: &Arc<Self>, tr: &Arc<Transaction>) {
        let authenticated = match (tr.username(), tr.challenge(), tr.auth_data()) {
            (Some(user), Some(challenge), Some(response)) => self
                .hooks
                .password_for(&user)
                .map(|password| auth::verify_md5(&challenge, &password, &response))
                .unwrap_or(false),
            _ => false,
        };
        if !authenticated {
            info!(
                call = tr.local_call(),
                user = tr.username().as_deref().unwrap_or(""),
                "authentication failed"
            );
            // Q.850 cause 29: facility rejected.
            tr.send_reject(Some("Invalid password"), 29);
            return;
        }
        match tr.trans_type() {
            TransactionType::New => self.route_and_answer(tr),
            TransactionType::RegReq | TransactionType::RegRel => self.finish_registration(tr),
            TransactionType::Poke => {}
        }
    }

    fn route_and_answer(self: &Arc<Self>, tr: &Arc<Transaction>) {
        let params = NewCallParams {
            username: tr.username(),
            called_number: tr.called_number(),
            called_context: tr.called_context(),
            calling_number: tr.calling_number(),
            calling_name: tr.calling_name(),
            format: tr.format_audio() | tr.format_video(),
            capability: tr.capability(),
        };
        if tr.format_audio() == 0 && tr.format_video() == 0 {
            // Q.850 cause 58: bearer capability not available.
            tr.send_reject(Some("No media format"), 58);
            return;
        }
        match self.hooks.route_call(&params) {
            RouteDecision::Accept => {
                tr.send_accept(None);
            }
            RouteDecision::Reject { cause, code } => {
                tr.send_reject(Some(&cause), code);
            }
        }
    }

    fn finish_registration(self: &Arc<Self>, tr: &Arc<Transaction>) {
        let granted = self.config.clamp_expires(tr.expire());
        tr.send_accept(Some(granted));
    }

    fn remove_transaction(&self, tr: &Arc<Transaction>) {
        let mut inner = self.inner.lock();
        if inner.by_local.remove(&tr.local_call()).is_some() {
            inner.allocator.release(tr.local_call());
        }
        inner
            .by_remote
            .remove(&(tr.remote_addr(), tr.remote_call()));
        debug!(call = tr.local_call(), "transaction removed");
    }

    // ---- workers ----------------------------------------------------------

    /// Spawn the three worker pools. The listener pool only runs over a
    /// real UDP transport.
    pub fn start_workers(self: &Arc<Self>) {
        let mut inner = self.inner.lock();
        if let Some(udp) = &self.udp {
            for n in 0..self.config.read_threads.max(1) {
                let engine = self.clone();
                let udp = udp.clone();
                inner.workers.push(
                    std::thread::Builder::new()
                        .name(format!("{}-read-{n}", self.config.name))
                        .spawn(move || engine.listener_loop(udp))
                        .expect("spawn listener thread"),
                );
            }
        }
        for n in 0..self.config.event_threads.max(1) {
            let engine = self.clone();
            inner.workers.push(
                std::thread::Builder::new()
                    .name(format!("{}-event-{n}", self.config.name))
                    .spawn(move || engine.event_loop())
                    .expect("spawn event thread"),
            );
        }
        for n in 0..self.config.trunk_threads.max(1) {
            let engine = self.clone();
            inner.workers.push(
                std::thread::Builder::new()
                    .name(format!("{}-trunk-{n}", self.config.name))
                    .spawn(move || engine.trunk_loop())
                    .expect("spawn trunk thread"),
            );
        }
    }

    fn listener_loop(self: Arc<Self>, udp: Arc<UdpTransport>) {
        let mut buf = vec![0u8; 65536];
        while !self.shutdown.load(Ordering::Relaxed) {
            match udp.recv_from(&mut buf) {
                Ok(Some((len, addr))) => {
                    let now = self.time.now_instant();
                    self.process_datagram(&buf[..len], addr, now);
                }
                Ok(None) => {}
                Err(err) => {
                    error!(%err, "socket read failed, listener exiting");
                    *self.status.lock() = EngineStatus::Removed;
                    break;
                }
            }
        }
    }

    fn event_loop(self: Arc<Self>) {
        let idle = Duration::from_micros(self.config.idle_interval_us.max(100));
        loop {
            let now = self.time.now_instant();
            let handled = self.pump_events(now);
            self.check_exiting(now);
            if self.shutdown.load(Ordering::Relaxed) && self.transaction_count() == 0 {
                break;
            }
            if handled == 0 {
                std::thread::sleep(idle);
            }
        }
    }

    fn trunk_loop(self: Arc<Self>) {
        let interval = Duration::from_millis(self.config.trunk_send_interval_ms.max(1));
        while !self.shutdown.load(Ordering::Relaxed) {
            let now = self.time.now_instant();
            let trunks: Vec<Arc<TrunkFrame>> =
                self.inner.lock().trunks.values().cloned().collect();
            for trunk in trunks {
                trunk.flush_due(now);
            }
            std::thread::sleep(interval / 2);
        }
    }

    /// Flush every due trunk buffer once; exposed for tick-driven tests.
    pub fn flush_trunks(&self, now: Instant) {
        let trunks: Vec<Arc<TrunkFrame>> = self.inner.lock().trunks.values().cloned().collect();
        for trunk in trunks {
            trunk.flush_due(now);
        }
    }

    // ---- lifecycle --------------------------------------------------------

    /// Begin shutdown: refuse new work, ask live transactions to wind
    /// down, and let workers drain until the overall deadline.
    pub fn shutdown(self: &Arc<Self>) {
        {
            let mut status = self.status.lock();
            if matches!(*status, EngineStatus::Exiting | EngineStatus::Removed) {
                return;
            }
            *status = EngineStatus::Exiting;
        }
        let now = self.time.now_instant();
        self.inner.lock().exit_deadline = Some(now + self.config.overall_timeout());
        info!(name = %self.config.name, "engine exiting");
        let transactions: Vec<Arc<Transaction>> =
            self.inner.lock().by_local.values().cloned().collect();
        for tr in transactions {
            match tr.state() {
                State::Terminated | State::Terminating => {}
                _ => {
                    tr.send_reject(Some("Server shutdown"), 42);
                }
            }
        }
    }

    /// An exiting engine becomes removable once its transactions are
    /// gone or its drain deadline passes.
    pub fn check_exiting(&self, now: Instant) {
        let mut status = self.status.lock();
        if *status != EngineStatus::Exiting {
            return;
        }
        let inner = self.inner.lock();
        let expired = inner.exit_deadline.map(|d| now >= d).unwrap_or(false);
        if expired || inner.by_local.is_empty() {
            *status = EngineStatus::Removed;
            self.shutdown.store(true, Ordering::Relaxed);
            info!(name = %self.config.name, "engine removed");
        }
    }

    /// Block until all workers exit. Call after [`Engine::shutdown`].
    pub fn join(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
        let workers = std::mem::take(&mut self.inner.lock().workers);
        for handle in workers {
            let _ = handle.join();
        }
    }
}

/// The owned list of engines; replaces any notion of a process-global
/// engine table. The host constructs one and passes it where needed.
pub struct Registry {
    time: Arc<dyn TimeProvider>,
    engines: Mutex<Vec<Arc<Engine>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::with_time(Arc::new(SystemTimeProvider))
    }

    pub fn with_time(time: Arc<dyn TimeProvider>) -> Self {
        Registry {
            time,
            engines: Mutex::new(Vec::new()),
        }
    }

    pub fn create_engine(
        &self,
        config: EngineConfig,
        hooks: Arc<dyn EngineHooks>,
    ) -> EngineResult<Arc<Engine>> {
        let engine = Engine::bind(config, hooks, self.time.clone())?;
        self.engines.lock().push(engine.clone());
        Ok(engine)
    }

    pub fn insert(&self, engine: Arc<Engine>) {
        self.engines.lock().push(engine);
    }

    pub fn engines(&self) -> Vec<Arc<Engine>> {
        self.engines.lock().clone()
    }

    pub fn find(&self, name: &str) -> Option<Arc<Engine>> {
        self.engines
            .lock()
            .iter()
            .find(|e| e.config().name == name)
            .cloned()
    }

    /// Reap engines that finished exiting.
    pub fn tick(&self, now: Instant) {
        let mut engines = self.engines.lock();
        for engine in engines.iter() {
            engine.check_exiting(now);
        }
        engines.retain(|e| e.status() != EngineStatus::Removed);
    }

    pub fn shutdown_all(&self) {
        for engine in self.engines() {
            engine.shutdown();
        }
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_number_allocation_lowest_free() {
        let mut alloc = CallNumAllocator::new();
        assert_eq!(alloc.allocate(), Some(2));
        assert_eq!(alloc.allocate(), Some(3));
        assert_eq!(alloc.allocate(), Some(4));
        alloc.release(3);
        assert_eq!(alloc.allocate(), Some(3));
        assert_eq!(alloc.allocate(), Some(5));
    }

    #[test]
    fn test_call_number_exhaustion() {
        let mut alloc = CallNumAllocator::new();
        for expected in 2..=MAX_CALL_NUMBER {
            assert_eq!(alloc.allocate(), Some(expected));
        }
        assert_eq!(alloc.allocate(), None);
        alloc.release(1234);
        assert_eq!(alloc.allocate(), Some(1234));
    }
}
