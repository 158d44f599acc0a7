//! Engine and line configuration.

use std::net::Ipv4Addr;
use std::time::Duration;

use iax_proto::constants::{format, DEFAULT_PORT};
use serde::{Deserialize, Serialize};

/// Configuration of one bound UDP endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub name: String,
    pub addr: Ipv4Addr,
    pub port: u16,
    /// Fall back to an ephemeral port when the configured one is taken.
    pub force_bind: bool,

    pub read_threads: usize,
    pub event_threads: usize,
    pub trunk_threads: usize,

    /// IP DSCP/TOS byte, 0 leaves the socket default.
    pub tos: u32,
    /// SO_RCVBUF request in bytes, 0 leaves the socket default.
    pub stream_readbuffer: usize,

    /// Append an empty CALLTOKEN IE to outgoing New/RegReq frames.
    pub calltoken_out: bool,
    /// Demand call tokens from inbound callers.
    pub calltoken_in: bool,
    /// Accepted age of an inbound call token.
    pub calltoken_age_ms: u64,

    pub expires_min: u32,
    pub expires_def: u32,
    pub expires_max: u32,

    /// Challenge inbound New transactions before accepting.
    pub auth_required: bool,
    /// Grace granted to a challenged peer before its AuthReq times out.
    pub challenge_timeout_ms: u64,

    pub retrans_count: u32,
    pub retrans_interval_ms: u64,
    pub ping_interval_ms: u64,
    /// Event-thread sleep between idle passes.
    pub idle_interval_us: u64,
    /// Inbound full-frame queue cap per transaction.
    pub max_in_frames: usize,

    /// Negotiable audio formats.
    pub capability: u32,
    /// Preferred audio codec bit.
    pub preferred: u32,
    /// Preferred video codec bit, 0 disables video.
    pub preferred_video: u32,

    /// Outgoing media pacing (milliseconds).
    pub adjust_ts_threshold: u32,
    pub adjust_ts_overrun: u32,
    pub adjust_ts_underrun: u32,

    /// Outbound trunking.
    pub trunking: bool,
    pub trunk_send_interval_ms: u64,
    pub trunk_max_len: usize,
    pub trunk_timestamps: bool,
    /// Only aggregate when at least two calls share the trunk.
    pub trunk_efficient_use: bool,
    /// Inbound trunk timestamps: rebase against the peer's trunk clock
    /// rather than the local wall clock.
    pub trunk_in_sync_using_ts: bool,
    /// Backwards jump in the peer's trunk clock treated as a restart.
    pub trunk_in_ts_diff_restart: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            name: "iax".into(),
            addr: Ipv4Addr::UNSPECIFIED,
            port: DEFAULT_PORT,
            force_bind: true,
            read_threads: 3,
            event_threads: 3,
            trunk_threads: 1,
            tos: 0,
            stream_readbuffer: 0,
            calltoken_out: true,
            calltoken_in: false,
            calltoken_age_ms: 10_000,
            expires_min: 60,
            expires_def: 60,
            expires_max: 3600,
            auth_required: true,
            challenge_timeout_ms: 30_000,
            retrans_count: 5,
            retrans_interval_ms: 500,
            ping_interval_ms: 20_000,
            idle_interval_us: 2_000,
            max_in_frames: 100,
            capability: format::ULAW | format::ALAW | format::GSM | format::SLIN,
            preferred: format::ULAW,
            preferred_video: 0,
            adjust_ts_threshold: 120,
            adjust_ts_overrun: 120,
            adjust_ts_underrun: 60,
            trunking: false,
            trunk_send_interval_ms: 20,
            trunk_max_len: 1400,
            trunk_timestamps: true,
            trunk_efficient_use: false,
            trunk_in_sync_using_ts: true,
            trunk_in_ts_diff_restart: 5_000,
        }
    }
}

impl EngineConfig {
    /// Client-profile defaults: single worker per pool.
    pub fn client() -> Self {
        Self {
            read_threads: 1,
            event_threads: 1,
            trunk_threads: 1,
            ..Self::default()
        }
    }

    pub fn retrans_interval(&self) -> Duration {
        Duration::from_millis(self.retrans_interval_ms)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    /// How long a terminating transaction may wait for its last acks:
    /// the full retransmission schedule with headroom.
    pub fn overall_timeout(&self) -> Duration {
        Duration::from_millis(self.retrans_interval_ms * self.retrans_count as u64 * 2)
    }

    /// Clamp a refresh requested by a registering peer.
    pub fn clamp_expires(&self, requested: u32) -> u32 {
        if requested == 0 {
            self.expires_def
        } else {
            requested.clamp(self.expires_min, self.expires_max)
        }
    }
}

/// The per-transaction slice of the engine configuration, snapshotted at
/// transaction creation so a reload cannot skew a call in flight.
#[derive(Debug, Clone)]
pub(crate) struct TransactionConfig {
    pub retrans_count: u32,
    pub retrans_interval: Duration,
    pub ping_interval: Duration,
    pub challenge_timeout: Duration,
    pub max_in_frames: usize,
    pub adjust_ts_threshold: u32,
    pub adjust_ts_overrun: u32,
    pub adjust_ts_underrun: u32,
    pub trunk_in_sync_using_ts: bool,
    pub trunk_in_ts_diff_restart: u32,
}

impl From<&EngineConfig> for TransactionConfig {
    fn from(cfg: &EngineConfig) -> Self {
        Self {
            retrans_count: cfg.retrans_count,
            retrans_interval: cfg.retrans_interval(),
            ping_interval: cfg.ping_interval(),
            challenge_timeout: Duration::from_millis(cfg.challenge_timeout_ms),
            max_in_frames: cfg.max_in_frames,
            adjust_ts_threshold: cfg.adjust_ts_threshold,
            adjust_ts_overrun: cfg.adjust_ts_overrun,
            adjust_ts_underrun: cfg.adjust_ts_underrun,
            trunk_in_sync_using_ts: cfg.trunk_in_sync_using_ts,
            trunk_in_ts_diff_restart: cfg.trunk_in_ts_diff_restart,
        }
    }
}

/// Configuration of one outgoing registration line.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LineConfig {
    pub name: String,
    pub username: String,
    pub password: String,
    pub host: Ipv4Addr,
    pub port: u16,
    /// Requested registration lifetime in seconds.
    pub expire: u32,
    /// NAT keepalive cadence in seconds, 0 disables.
    pub keepalive: u32,
    pub calling_number: String,
    pub calling_name: String,
    pub calltoken: bool,
}

impl Default for LineConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            username: String::new(),
            password: String::new(),
            host: Ipv4Addr::LOCALHOST,
            port: DEFAULT_PORT,
            expire: 60,
            keepalive: 25,
            calling_number: String::new(),
            calling_name: String::new(),
            calltoken: true,
        }
    }
}
