//! # IAX2 transaction engine
//!
//! The signaling and media core of an IAX2 endpoint: per-call state
//! machines with a sequence-number reliability layer, a UDP engine that
//! demultiplexes one trunked socket onto many transactions, meta-trunk
//! aggregation, and client registration lines.
//!
//! ## Architecture
//!
//! - **Reliability**: every full frame is acked; gaps trigger VNAK
//!   retransmit-from-here requests; late duplicates are re-acked and
//!   dropped.
//! - **Media**: mini frames carry truncated timestamps that are widened
//!   against the last accepted frame; outgoing media is paced against the
//!   transaction clock with overrun/underrun adjustment.
//! - **Threading**: blocking OS threads in three pools per engine
//!   (listener, event, trunk), fine-grained `parking_lot` mutexes in a
//!   fixed hierarchy (engine → line set → line → transaction → media
//!   buckets).
//! - **Time**: all timing flows through `TimeProvider`, so tests run on a
//!   manual clock.

pub mod auth;
pub mod config;
pub mod engine;
pub mod error;
pub mod event;
pub mod line;
pub mod media;
mod outgoing;
pub mod testing;
pub mod time;
pub mod transaction;
pub mod transport;
pub mod trunk;

pub use config::{EngineConfig, LineConfig};
pub use engine::{DefaultHooks, Engine, EngineHooks, EngineStatus, NewCallParams, Registry, RouteDecision};
pub use error::{EngineError, EngineResult};
pub use event::{Event, EventKind, LineNotify};
pub use line::{Line, LineSet};
pub use media::{MediaSink, MediaStats};
pub use time::{ManualTimeProvider, SystemTimeProvider, TimeProvider};
pub use transaction::{CallParams, State, Transaction, TransactionOwner, TransactionType};
pub use transport::{Transport, UdpTransport};
pub use trunk::TrunkFrame;
