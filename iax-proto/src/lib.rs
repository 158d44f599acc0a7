//! # IAX2 wire format
//!
//! Bit-exact encoding and decoding of the four IAX2 frame shapes (full,
//! mini, meta-video, meta-trunk) and the TLV information-element lists
//! carried inside IAX-control full frames.
//!
//! This crate knows nothing about sockets, timers or call state; it turns
//! bytes into typed frames and back. The transaction engine lives in
//! `iax-engine`.

pub mod constants;
pub mod error;
pub mod frame;
pub mod ies;

pub use constants::{format, AuthMethod, ControlType, FrameType, IaxControl, PROTOCOL_VERSION};
pub use error::{FrameError, ProtoResult};
pub use frame::{
    pack_subclass, unpack_subclass, Frame, FullFrame, MetaTrunkFrame, MetaVideoFrame, MiniFrame,
    TrunkEntry,
};
pub use ies::{ie_tag, Ie, IeList, IeValue};
