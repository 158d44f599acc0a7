//! The four IAX2 frame shapes and their wire codecs.
//!
//! Layouts (all integers big-endian):
//!
//! - Full: `[0x8000|src:16][retrans|dst:16][timestamp:32][oseq:8][iseq:8][type:8][subclass:8]` + payload
//! - Mini: `[src:16 (high bit clear)][timestamp:16]` + payload
//! - Meta video: `[0x0000][0x8000|src:15][mark|timestamp:15]` + payload
//! - Meta trunk: `[0x0000][0x01][flags:8][timestamp:32]` + entries

use byteorder::{BigEndian, ByteOrder, WriteBytesExt};
use smallvec::SmallVec;

use crate::constants::FrameType;
use crate::error::{FrameError, ProtoResult};

pub const FULL_HEADER_LEN: usize = 12;
pub const MINI_HEADER_LEN: usize = 4;
pub const META_VIDEO_HEADER_LEN: usize = 6;
pub const META_TRUNK_HEADER_LEN: usize = 8;

/// Meta-command byte selecting a trunk frame.
const META_TRUNK_INDICATOR: u8 = 0x01;
/// Trunk flags bit: entries carry their own 16-bit timestamps.
const TRUNK_FLAG_TIMESTAMPS: u8 = 0x01;

/// Compress a 32-bit subclass into the wire byte.
///
/// Values below 0x80 travel literally; larger exact powers of two travel
/// as `0x80 | log2(value)`. Anything else has no wire representation.
pub fn pack_subclass(value: u32) -> ProtoResult<u8> {
    if value < 0x80 {
        Ok(value as u8)
    } else if value.is_power_of_two() {
        Ok(0x80 | value.trailing_zeros() as u8)
    } else {
        Err(FrameError::InvalidSubclass(value))
    }
}

/// Invert [`pack_subclass`].
pub fn unpack_subclass(raw: u8) -> ProtoResult<u32> {
    if raw & 0x80 == 0 {
        return Ok(raw as u32);
    }
    let exp = (raw & 0x7F) as u32;
    1u32.checked_shl(exp)
        .ok_or(FrameError::InvalidSubclass(raw as u32))
}

/// A reliable frame: sequence numbers, full timestamp, must be acked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FullFrame {
    pub frame_type: FrameType,
    /// Decompressed subclass (control value or format bit).
    pub subclass: u32,
    pub src_call: u16,
    pub dst_call: u16,
    /// Retransmission indicator (high bit of the destination field).
    pub retrans: bool,
    pub oseq: u8,
    pub iseq: u8,
    pub timestamp: u32,
    pub payload: Vec<u8>,
}

impl FullFrame {
    pub fn wire_len(&self) -> usize {
        FULL_HEADER_LEN + self.payload.len()
    }

    pub fn encode(&self, buf: &mut Vec<u8>) -> ProtoResult<()> {
        let subclass = pack_subclass(self.subclass)?;
        buf.reserve(self.wire_len());
        buf.write_u16::<BigEndian>(0x8000 | (self.src_call & 0x7FFF))
            .expect("vec write");
        let dst = (self.dst_call & 0x7FFF) | if self.retrans { 0x8000 } else { 0 };
        buf.write_u16::<BigEndian>(dst).expect("vec write");
        buf.write_u32::<BigEndian>(self.timestamp).expect("vec write");
        buf.push(self.oseq);
        buf.push(self.iseq);
        buf.push(self.frame_type as u8);
        buf.push(subclass);
        buf.extend_from_slice(&self.payload);
        Ok(())
    }

    pub fn decode(buf: &[u8]) -> ProtoResult<Self> {
        if buf.len() < FULL_HEADER_LEN {
            return Err(FrameError::short(FULL_HEADER_LEN, buf.len()));
        }
        let src = BigEndian::read_u16(&buf[0..2]);
        let dst = BigEndian::read_u16(&buf[2..4]);
        let timestamp = BigEndian::read_u32(&buf[4..8]);
        let type_byte = buf[10];
        let frame_type =
            FrameType::from_u8(type_byte).ok_or(FrameError::UnknownFrameType(type_byte))?;
        Ok(FullFrame {
            frame_type,
            subclass: unpack_subclass(buf[11])?,
            src_call: src & 0x7FFF,
            dst_call: dst & 0x7FFF,
            retrans: dst & 0x8000 != 0,
            oseq: buf[8],
            iseq: buf[9],
            timestamp,
            payload: buf[FULL_HEADER_LEN..].to_vec(),
        })
    }
}

/// An unreliable audio frame with a truncated 16-bit timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MiniFrame {
    pub src_call: u16,
    pub timestamp: u16,
    pub payload: Vec<u8>,
}

impl MiniFrame {
    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.reserve(MINI_HEADER_LEN + self.payload.len());
        buf.write_u16::<BigEndian>(self.src_call & 0x7FFF)
            .expect("vec write");
        buf.write_u16::<BigEndian>(self.timestamp).expect("vec write");
        buf.extend_from_slice(&self.payload);
    }

    pub fn decode(buf: &[u8]) -> ProtoResult<Self> {
        if buf.len() < MINI_HEADER_LEN {
            return Err(FrameError::short(MINI_HEADER_LEN, buf.len()));
        }
        Ok(MiniFrame {
            src_call: BigEndian::read_u16(&buf[0..2]) & 0x7FFF,
            timestamp: BigEndian::read_u16(&buf[2..4]),
            payload: buf[MINI_HEADER_LEN..].to_vec(),
        })
    }
}

/// An unreliable video frame: 15-bit timestamp plus a mark bit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetaVideoFrame {
    pub src_call: u16,
    pub mark: bool,
    /// Low 15 bits of the media timestamp.
    pub timestamp: u16,
    pub payload: Vec<u8>,
}

impl MetaVideoFrame {
    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.reserve(META_VIDEO_HEADER_LEN + self.payload.len());
        buf.write_u16::<BigEndian>(0).expect("vec write");
        buf.write_u16::<BigEndian>(0x8000 | (self.src_call & 0x7FFF))
            .expect("vec write");
        let ts = (self.timestamp & 0x7FFF) | if self.mark { 0x8000 } else { 0 };
        buf.write_u16::<BigEndian>(ts).expect("vec write");
        buf.extend_from_slice(&self.payload);
    }

    pub fn decode(buf: &[u8]) -> ProtoResult<Self> {
        if buf.len() < META_VIDEO_HEADER_LEN {
            return Err(FrameError::short(META_VIDEO_HEADER_LEN, buf.len()));
        }
        let call = BigEndian::read_u16(&buf[2..4]);
        let ts = BigEndian::read_u16(&buf[4..6]);
        Ok(MetaVideoFrame {
            src_call: call & 0x7FFF,
            mark: ts & 0x8000 != 0,
            timestamp: ts & 0x7FFF,
            payload: buf[META_VIDEO_HEADER_LEN..].to_vec(),
        })
    }
}

/// One call's contribution to a meta-trunk frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrunkEntry {
    pub src_call: u16,
    /// Present when the trunk frame carries per-entry timestamps.
    pub timestamp: Option<u16>,
    pub payload: Vec<u8>,
}

/// Aggregated media for several calls to one peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetaTrunkFrame {
    /// Sender-side trunk clock in milliseconds.
    pub timestamp: u32,
    /// All entries carry timestamps, or none do.
    pub with_timestamps: bool,
    pub entries: SmallVec<[TrunkEntry; 8]>,
}

impl MetaTrunkFrame {
    pub fn new(timestamp: u32, with_timestamps: bool) -> Self {
        MetaTrunkFrame {
            timestamp,
            with_timestamps,
            entries: SmallVec::new(),
        }
    }

    pub fn wire_len(&self) -> usize {
        let per_entry = if self.with_timestamps { 6 } else { 4 };
        META_TRUNK_HEADER_LEN
            + self
                .entries
                .iter()
                .map(|e| per_entry + e.payload.len())
                .sum::<usize>()
    }

    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.reserve(self.wire_len());
        buf.write_u16::<BigEndian>(0).expect("vec write");
        buf.push(META_TRUNK_INDICATOR);
        buf.push(if self.with_timestamps {
            TRUNK_FLAG_TIMESTAMPS
        } else {
            0
        });
        buf.write_u32::<BigEndian>(self.timestamp).expect("vec write");
        for entry in &self.entries {
            buf.write_u16::<BigEndian>(entry.src_call & 0x7FFF)
                .expect("vec write");
            if self.with_timestamps {
                buf.write_u16::<BigEndian>(entry.timestamp.unwrap_or(0))
                    .expect("vec write");
            }
            buf.write_u16::<BigEndian>(entry.payload.len() as u16)
                .expect("vec write");
            buf.extend_from_slice(&entry.payload);
        }
    }

    pub fn decode(buf: &[u8]) -> ProtoResult<Self> {
        if buf.len() < META_TRUNK_HEADER_LEN {
            return Err(FrameError::short(META_TRUNK_HEADER_LEN, buf.len()));
        }
        if buf[2] != META_TRUNK_INDICATOR {
            return Err(FrameError::InvalidMeta(buf[2]));
        }
        let with_timestamps = buf[3] & TRUNK_FLAG_TIMESTAMPS != 0;
        let timestamp = BigEndian::read_u32(&buf[4..8]);
        let mut entries = SmallVec::new();
        let mut rest = &buf[META_TRUNK_HEADER_LEN..];
        let entry_header = if with_timestamps { 6 } else { 4 };
        while !rest.is_empty() {
            if rest.len() < entry_header {
                return Err(FrameError::short(entry_header, rest.len()));
            }
            let src_call = BigEndian::read_u16(&rest[0..2]) & 0x7FFF;
            let (timestamp, len_at) = if with_timestamps {
                (Some(BigEndian::read_u16(&rest[2..4])), 4)
            } else {
                (None, 2)
            };
            let len = BigEndian::read_u16(&rest[len_at..len_at + 2]) as usize;
            let body = &rest[entry_header..];
            if body.len() < len {
                return Err(FrameError::short(len, body.len()));
            }
            entries.push(TrunkEntry {
                src_call,
                timestamp,
                payload: body[..len].to_vec(),
            });
            rest = &body[len..];
        }
        Ok(MetaTrunkFrame {
            timestamp,
            with_timestamps,
            entries,
        })
    }
}

/// A decoded datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Full(FullFrame),
    Mini(MiniFrame),
    MetaVideo(MetaVideoFrame),
    MetaTrunk(MetaTrunkFrame),
}

impl Frame {
    /// Classify and decode a raw datagram.
    ///
    /// The first 16-bit word drives the split: high bit set is a full
    /// frame, a nonzero value with the high bit clear is a mini frame,
    /// and zero introduces a meta frame whose third byte separates video
    /// (its own high bit, the video flag) from trunk (the 0x01 meta
    /// command).
    pub fn decode(buf: &[u8]) -> ProtoResult<Self> {
        if buf.len() < 4 {
            return Err(FrameError::short(4, buf.len()));
        }
        let lead = BigEndian::read_u16(&buf[0..2]);
        if lead & 0x8000 != 0 {
            return FullFrame::decode(buf).map(Frame::Full);
        }
        if lead != 0 {
            return MiniFrame::decode(buf).map(Frame::Mini);
        }
        if buf[2] & 0x80 != 0 {
            MetaVideoFrame::decode(buf).map(Frame::MetaVideo)
        } else if buf[2] == META_TRUNK_INDICATOR {
            MetaTrunkFrame::decode(buf).map(Frame::MetaTrunk)
        } else {
            Err(FrameError::InvalidMeta(buf[2]))
        }
    }

    pub fn encode(&self, buf: &mut Vec<u8>) -> ProtoResult<()> {
        match self {
            Frame::Full(f) => f.encode(buf)?,
            Frame::Mini(f) => f.encode(buf),
            Frame::MetaVideo(f) => f.encode(buf),
            Frame::MetaTrunk(f) => f.encode(buf),
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> ProtoResult<Vec<u8>> {
        let mut buf = Vec::new();
        self.encode(&mut buf)?;
        Ok(buf)
    }
}
