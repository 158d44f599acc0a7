//! Events a transaction hands to its owner.

use iax_proto::constants::FrameType;
use iax_proto::IeList;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// A peer started a call, registration or poke towards us.
    New,
    Accept,
    Answer,
    Hangup,
    Reject,
    Ringing,
    Progressing,
    Busy,
    Dtmf,
    Text,
    Noise,
    Quelch,
    Unquelch,
    /// The peer demands credentials; the IE list carries the challenge.
    AuthReq,
    /// The peer supplied credentials; the IE list carries the digest.
    AuthRep,
    /// The retransmission budget of some frame ran out.
    Timeout,
    /// The transaction reached its end of life.
    Terminated,
    /// The peer does not know this transaction (INVAL), or sent
    /// unparseable IEs.
    Invalid,
    /// A protocol feature this stack does not implement.
    NotImplemented,
}

#[derive(Debug, Clone)]
pub struct Event {
    pub kind: EventKind,
    /// Generated locally rather than by a peer frame.
    pub local: bool,
    /// No further events will follow this one.
    pub is_final: bool,
    /// Type/subclass of the triggering frame, when there was one.
    pub frame_type: Option<FrameType>,
    pub subclass: u32,
    pub ies: IeList,
    /// Raw payload for Text/Noise frames.
    pub payload: Vec<u8>,
}

impl Event {
    pub(crate) fn bare(kind: EventKind, local: bool, is_final: bool) -> Self {
        Event {
            kind,
            local,
            is_final,
            frame_type: None,
            subclass: 0,
            ies: IeList::new(),
            payload: Vec::new(),
        }
    }
}

/// Registration outcome notification delivered by a [`crate::LineSet`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineNotify {
    pub line: String,
    pub registered: bool,
    /// Failure reason, empty on success.
    pub reason: String,
    /// Set when the failure was an authentication rejection.
    pub error: Option<String>,
}
