//! Outgoing registration lines: keep a client registered against a
//! peer, retry on failure, keep NAT bindings warm, and notify the host
//! when (un)registration completes.

use std::net::{SocketAddr, SocketAddrV4};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use crossbeam::channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use iax_proto::ie_tag;

use crate::auth;
use crate::config::LineConfig;
use crate::engine::Engine;
use crate::event::{Event, EventKind, LineNotify};
use crate::time::TimeProvider;
use crate::transaction::{CallParams, Transaction, TransactionOwner, TransactionType};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineOp {
    Login,
    Logout,
    Delete,
}

struct LineState {
    config: LineConfig,
    /// Addressing change applied after the pending unregister finishes.
    pending: Option<LineConfig>,
    oper: LineOp,
    registered: bool,
    next_reg: Option<Instant>,
    next_keepalive: Option<Instant>,
    transaction: Option<Arc<Transaction>>,
}

pub struct Line {
    name: String,
    set: Weak<LineSet>,
    state: Mutex<LineState>,
}

/// What an event pass decided to do once the line lock is released.
/// Starting a transaction reaches for the engine lock, which sits above
/// the line lock in the hierarchy, so it never happens under it.
enum LineAction {
    None,
    Register,
    Unregister,
    AuthReply(Arc<Transaction>, String),
}

impl Line {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn registered(&self) -> bool {
        self.state.lock().registered
    }

    pub fn config(&self) -> LineConfig {
        self.state.lock().config.clone()
    }

    fn remote(&self, config: &LineConfig) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(config.host, config.port))
    }

    fn busy(state: &LineState) -> bool {
        state.transaction.is_some()
    }

    /// Schedule the next registration at `expire × num / den`.
    fn schedule_next_reg(state: &mut LineState, now: Instant, num: u32, den: u32) {
        let expire = state.config.expire.max(1) as u64;
        let secs = expire * num as u64 / den.max(1) as u64;
        state.next_reg = Some(now + Duration::from_secs(secs.max(1)));
    }
}

impl TransactionOwner for Line {
    fn on_event(&self, transaction: &Arc<Transaction>, event: Event) {
        let Some(set) = self.set.upgrade() else {
            return;
        };
        let now = set.time.now_instant();
        let action = self.handle_event(&set, transaction, event, now);
        match action {
            LineAction::None => {}
            LineAction::Register => set.register_line(&self.name, false),
            LineAction::Unregister => set.register_line(&self.name, true),
            LineAction::AuthReply(tr, response) => {
                tr.send_auth_reply(response);
            }
        }
    }
}

impl Line {
    fn handle_event(
        &self,
        set: &Arc<LineSet>,
        transaction: &Arc<Transaction>,
        event: Event,
        now: Instant,
    ) -> LineAction {
        let mut state = self.state.lock();
        match event.kind {
            EventKind::AuthReq => {
                let Some(challenge) = transaction.challenge() else {
                    return LineAction::None;
                };
                let response = auth::md5_response(&challenge, &state.config.password);
                LineAction::AuthReply(transaction.clone(), response)
            }
            EventKind::Accept => {
                state.transaction = None;
                let was_reg_req = transaction.trans_type() == TransactionType::RegReq;
                match state.oper {
                    LineOp::Login => {
                        if was_reg_req {
                            // Honor the server's refresh grant, defaulting
                            // when it is absent or zero.
                            let granted = match event.ies.numeric(ie_tag::REFRESH) {
                                Some(0) | None => 60,
                                Some(v) => v,
                            };
                            if state.config.expire != granted {
                                debug!(
                                    line = %self.name,
                                    old = state.config.expire,
                                    new = granted,
                                    "expire interval changed by server"
                                );
                                state.config.expire = granted;
                            }
                            state.registered = true;
                            Line::schedule_next_reg(&mut state, now, 3, 4);
                            info!(line = %self.name, "registration succeeded");
                            set.notify(&self.name, true, "", None);
                            LineAction::None
                        } else {
                            // Unregistered from the old endpoint; apply
                            // any pending addressing and log in again.
                            state.registered = false;
                            if let Some(pending) = state.pending.take() {
                                state.config = pending;
                            }
                            LineAction::Register
                        }
                    }
                    LineOp::Logout | LineOp::Delete => {
                        if was_reg_req {
                            // Still registered; release it now.
                            state.registered = true;
                            LineAction::Unregister
                        } else {
                            state.registered = false;
                            state.next_reg = None;
                            info!(line = %self.name, "unregistered");
                            set.notify(&self.name, false, "", None);
                            if state.oper == LineOp::Delete {
                                drop(state);
                                set.remove(&self.name);
                            }
                            LineAction::None
                        }
                    }
                }
            }
            EventKind::Reject => {
                state.transaction = None;
                state.registered = false;
                let reason = event
                    .ies
                    .string(ie_tag::CAUSE)
                    .unwrap_or("rejected")
                    .to_owned();
                warn!(line = %self.name, %reason, "registration rejected");
                if state.oper == LineOp::Login {
                    Line::schedule_next_reg(&mut state, now, 1, 4);
                } else {
                    state.next_reg = None;
                }
                set.notify(&self.name, false, &reason, Some("noauth"));
                LineAction::None
            }
            EventKind::Timeout => {
                state.transaction = None;
                state.registered = false;
                warn!(line = %self.name, "registration timed out");
                if state.oper == LineOp::Login {
                    Line::schedule_next_reg(&mut state, now, 1, 2);
                } else {
                    state.next_reg = None;
                }
                set.notify(&self.name, false, "timeout", None);
                LineAction::None
            }
            EventKind::Terminated | EventKind::Invalid => {
                if state.transaction.is_some() {
                    state.transaction = None;
                    if state.registered || state.oper == LineOp::Login {
                        state.registered = false;
                        if state.oper == LineOp::Login {
                            Line::schedule_next_reg(&mut state, now, 1, 2);
                        }
                        set.notify(&self.name, false, "failure", None);
                    }
                }
                LineAction::None
            }
            _ => LineAction::None,
        }
    }
}

/// The set of configured lines bound to one engine.
pub struct LineSet {
    engine: Mutex<Weak<Engine>>,
    time: Arc<dyn TimeProvider>,
    lines: Mutex<Vec<Arc<Line>>>,
    notify_tx: Sender<LineNotify>,
    notify_rx: Receiver<LineNotify>,
}

impl LineSet {
    pub fn new(engine: &Arc<Engine>) -> Arc<Self> {
        let (notify_tx, notify_rx) = unbounded();
        Arc::new(LineSet {
            engine: Mutex::new(Arc::downgrade(engine)),
            time: engine.time(),
            lines: Mutex::new(Vec::new()),
            notify_tx,
            notify_rx,
        })
    }

    /// Registration outcome notifications for the host.
    pub fn notifications(&self) -> &Receiver<LineNotify> {
        &self.notify_rx
    }

    pub fn find(&self, name: &str) -> Option<Arc<Line>> {
        self.lines.lock().iter().find(|l| l.name == name).cloned()
    }

    fn notify(&self, line: &str, registered: bool, reason: &str, error: Option<&str>) {
        let _ = self.notify_tx.send(LineNotify {
            line: line.to_owned(),
            registered,
            reason: reason.to_owned(),
            error: error.map(str::to_owned),
        });
    }

    /// Create or update a line and log it in. An addressing change on a
    /// registered line unregisters from the old endpoint first.
    pub fn login(self: &Arc<Self>, config: LineConfig) -> Arc<Line> {
        let name = config.name.clone();
        let line = match self.find(&name) {
            Some(line) => {
                let mut state = line.state.lock();
                state.oper = LineOp::Login;
                let changed = state.config.username != config.username
                    || state.config.host != config.host
                    || state.config.port != config.port;
                if changed && state.registered {
                    state.pending = Some(config);
                    drop(state);
                    self.register_line(&name, true);
                    return line;
                }
                state.config = config;
                state.next_reg = None;
                drop(state);
                line
            }
            None => {
                let line = Arc::new(Line {
                    name: name.clone(),
                    set: Arc::downgrade(self),
                    state: Mutex::new(LineState {
                        config,
                        pending: None,
                        oper: LineOp::Login,
                        registered: false,
                        next_reg: None,
                        next_keepalive: None,
                        transaction: None,
                    }),
                });
                self.lines.lock().push(line.clone());
                line
            }
        };
        self.register_line(&name, false);
        line
    }

    /// Unregister but keep the line configured.
    pub fn logout(self: &Arc<Self>, name: &str) -> bool {
        let Some(line) = self.find(name) else {
            return false;
        };
        let registered = {
            let mut state = line.state.lock();
            state.oper = LineOp::Logout;
            state.next_reg = None;
            state.registered
        };
        if registered {
            self.register_line(name, true);
        }
        true
    }

    /// Unregister and forget the line.
    pub fn delete(self: &Arc<Self>, name: &str) -> bool {
        let Some(line) = self.find(name) else {
            return false;
        };
        let registered = {
            let mut state = line.state.lock();
            state.oper = LineOp::Delete;
            state.next_reg = None;
            state.registered
        };
        if registered {
            self.register_line(name, true);
        } else {
            self.remove(name);
        }
        true
    }

    fn remove(&self, name: &str) {
        self.lines.lock().retain(|l| l.name != name);
    }

    /// Start a RegReq (or RegRel) transaction for one line.
    fn register_line(self: &Arc<Self>, name: &str, unregister: bool) {
        let Some(engine) = self.engine.lock().upgrade() else {
            return;
        };
        let Some(line) = self.find(name) else {
            return;
        };
        let (remote, params) = {
            let state = line.state.lock();
            if Line::busy(&state) {
                return;
            }
            let config = &state.config;
            (
                line.remote(config),
                CallParams {
                    username: Some(config.username.clone()),
                    calling_number: Some(config.calling_number.clone())
                        .filter(|s| !s.is_empty()),
                    calling_name: Some(config.calling_name.clone()).filter(|s| !s.is_empty()),
                    refresh: config.expire,
                    call_token: config.calltoken,
                    ..CallParams::default()
                },
            )
        };
        match engine.start_registration(remote, params, unregister) {
            Ok(tr) => {
                let owner: Weak<dyn TransactionOwner> =
                    Arc::downgrade(&(line.clone() as Arc<dyn TransactionOwner>));
                tr.set_owner(owner);
                let mut state = line.state.lock();
                state.transaction = Some(tr);
                state.next_reg = None;
                debug!(line = %name, unregister, "registration transaction started");
            }
            Err(err) => {
                warn!(line = %name, %err, "cannot start registration");
                let mut state = line.state.lock();
                let now = self.time.now_instant();
                Line::schedule_next_reg(&mut state, now, 1, 2);
            }
        }
    }

    /// Drive retries and keepalives. The host (or an engine event
    /// thread) calls this periodically.
    pub fn tick(self: &Arc<Self>, now: Instant) {
        let lines: Vec<Arc<Line>> = self.lines.lock().clone();
        let engine = self.engine.lock().upgrade();
        for line in lines {
            let mut due_register = false;
            let mut keepalive_to: Option<SocketAddr> = None;
            {
                let mut state = line.state.lock();
                if state.oper == LineOp::Login && !Line::busy(&state) {
                    match state.next_reg {
                        Some(due) if now >= due => due_register = true,
                        None if !state.registered => due_register = true,
                        _ => {}
                    }
                }
                if state.registered && state.config.keepalive != 0 {
                    let interval = Duration::from_secs(state.config.keepalive as u64);
                    match state.next_keepalive {
                        Some(due) if now >= due => {
                            keepalive_to = Some(line.remote(&state.config));
                            state.next_keepalive = Some(now + interval);
                        }
                        None => state.next_keepalive = Some(now + interval),
                        _ => {}
                    }
                } else {
                    state.next_keepalive = None;
                }
            }
            if due_register {
                self.register_line(&line.name, false);
            }
            if let (Some(addr), Some(engine)) = (keepalive_to, engine.as_ref()) {
                // A zero-length datagram is enough to hold the NAT
                // binding open.
                let _ = engine.transport().send_to(&[], addr);
            }
        }
    }
}
