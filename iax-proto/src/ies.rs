//! Information elements: the `{tag, length, value}` TLV fields carried in
//! the payload of IAX-control full frames.
//!
//! Every tag has a fixed semantic type. Tags this stack does not know are
//! preserved as raw bytes and re-emitted verbatim, so a list containing
//! them still round-trips.

use std::net::{Ipv4Addr, SocketAddrV4};

use byteorder::{BigEndian, ByteOrder, WriteBytesExt};

use crate::constants::PROTOCOL_VERSION;
use crate::error::{FrameError, ProtoResult};

/// Assigned IE tag numbers.
pub mod ie_tag {
    pub const CALLED_NUMBER: u8 = 1;
    pub const CALLING_NUMBER: u8 = 2;
    pub const CALLING_ANI: u8 = 3;
    pub const CALLING_NAME: u8 = 4;
    pub const CALLED_CONTEXT: u8 = 5;
    pub const USERNAME: u8 = 6;
    pub const PASSWORD: u8 = 7;
    pub const CAPABILITY: u8 = 8;
    pub const FORMAT: u8 = 9;
    pub const LANGUAGE: u8 = 10;
    pub const VERSION: u8 = 11;
    pub const ADSICPE: u8 = 12;
    pub const DNID: u8 = 13;
    pub const AUTHMETHODS: u8 = 14;
    pub const CHALLENGE: u8 = 15;
    pub const MD5_RESULT: u8 = 16;
    pub const RSA_RESULT: u8 = 17;
    pub const APPARENT_ADDR: u8 = 18;
    pub const REFRESH: u8 = 19;
    pub const DPSTATUS: u8 = 20;
    pub const CALLNO: u8 = 21;
    pub const CAUSE: u8 = 22;
    pub const IAX_UNKNOWN: u8 = 23;
    pub const MSGCOUNT: u8 = 24;
    pub const AUTOANSWER: u8 = 25;
    pub const MUSICONHOLD: u8 = 26;
    pub const TRANSFERID: u8 = 27;
    pub const RDNIS: u8 = 28;
    pub const DATETIME: u8 = 31;
    pub const CALLINGPRES: u8 = 38;
    pub const CALLINGTON: u8 = 39;
    pub const CALLINGTNS: u8 = 40;
    pub const SAMPLINGRATE: u8 = 41;
    pub const CAUSECODE: u8 = 42;
    pub const ENCRYPTION: u8 = 43;
    pub const ENCKEY: u8 = 44;
    pub const CODEC_PREFS: u8 = 45;
    pub const CALLTOKEN: u8 = 54;
}

/// The decoded value of one IE. Numeric variants remember their wire
/// width so re-encoding is byte-identical.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IeValue {
    Empty,
    U8(u8),
    U16(u16),
    U32(u32),
    Str(String),
    Bin(Vec<u8>),
    Addr(SocketAddrV4),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ie {
    pub tag: u8,
    pub value: IeValue,
}

/// Wire type of a tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IeKind {
    Str,
    Num,
    Bin,
    Addr,
    Flag,
    /// Not in the table: raw passthrough.
    Opaque,
}

fn kind_for(tag: u8) -> IeKind {
    use ie_tag::*;
    match tag {
        CALLED_NUMBER | CALLING_NUMBER | CALLING_ANI | CALLING_NAME | CALLED_CONTEXT
        | USERNAME | PASSWORD | LANGUAGE | DNID | CHALLENGE | MD5_RESULT | RSA_RESULT | CAUSE
        | RDNIS | CODEC_PREFS => IeKind::Str,
        CAPABILITY | FORMAT | VERSION | ADSICPE | AUTHMETHODS | REFRESH | DPSTATUS | CALLNO
        | IAX_UNKNOWN | MSGCOUNT | TRANSFERID | DATETIME | CALLINGPRES | CALLINGTON
        | CALLINGTNS | SAMPLINGRATE | CAUSECODE | ENCRYPTION => IeKind::Num,
        ENCKEY | CALLTOKEN => IeKind::Bin,
        APPARENT_ADDR => IeKind::Addr,
        AUTOANSWER | MUSICONHOLD => IeKind::Flag,
        _ => IeKind::Opaque,
    }
}

impl Ie {
    fn decode_value(tag: u8, data: &[u8]) -> ProtoResult<IeValue> {
        Ok(match kind_for(tag) {
            IeKind::Str => IeValue::Str(String::from_utf8_lossy(data).into_owned()),
            IeKind::Num => match data.len() {
                1 => IeValue::U8(data[0]),
                2 => IeValue::U16(BigEndian::read_u16(data)),
                4 => IeValue::U32(BigEndian::read_u32(data)),
                // An empty numeric IE is tolerated as an empty marker
                // (outgoing CALLTOKEN probes are built the same way).
                0 => IeValue::Empty,
                _ => return Err(FrameError::InvalidIe { tag }),
            },
            IeKind::Bin => {
                if data.is_empty() {
                    IeValue::Empty
                } else {
                    IeValue::Bin(data.to_vec())
                }
            }
            IeKind::Addr => {
                if data.len() != 16 {
                    return Err(FrameError::InvalidIe { tag });
                }
                let family = BigEndian::read_u16(&data[0..2]);
                if family != 2 {
                    return Err(FrameError::InvalidIe { tag });
                }
                let port = BigEndian::read_u16(&data[2..4]);
                let ip = Ipv4Addr::new(data[4], data[5], data[6], data[7]);
                IeValue::Addr(SocketAddrV4::new(ip, port))
            }
            IeKind::Flag => {
                if data.is_empty() {
                    IeValue::Empty
                } else {
                    return Err(FrameError::InvalidIe { tag });
                }
            }
            IeKind::Opaque => IeValue::Bin(data.to_vec()),
        })
    }

    fn encode(&self, buf: &mut Vec<u8>) -> ProtoResult<()> {
        buf.push(self.tag);
        match &self.value {
            IeValue::Empty => buf.push(0),
            IeValue::U8(v) => {
                buf.push(1);
                buf.push(*v);
            }
            IeValue::U16(v) => {
                buf.push(2);
                buf.write_u16::<BigEndian>(*v).expect("vec write");
            }
            IeValue::U32(v) => {
                buf.push(4);
                buf.write_u32::<BigEndian>(*v).expect("vec write");
            }
            IeValue::Str(s) => {
                if s.len() > u8::MAX as usize {
                    return Err(FrameError::InvalidIe { tag: self.tag });
                }
                buf.push(s.len() as u8);
                buf.extend_from_slice(s.as_bytes());
            }
            IeValue::Bin(b) => {
                if b.len() > u8::MAX as usize {
                    return Err(FrameError::InvalidIe { tag: self.tag });
                }
                buf.push(b.len() as u8);
                buf.extend_from_slice(b);
            }
            IeValue::Addr(addr) => {
                // A sockaddr_in image: family, port, address, zero padding.
                buf.push(16);
                buf.write_u16::<BigEndian>(2).expect("vec write");
                buf.write_u16::<BigEndian>(addr.port()).expect("vec write");
                buf.extend_from_slice(&addr.ip().octets());
                buf.extend_from_slice(&[0u8; 8]);
            }
        }
        Ok(())
    }
}

/// An ordered list of IEs with typed access helpers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IeList(pub Vec<Ie>);

impl IeList {
    pub fn new() -> Self {
        IeList(Vec::new())
    }

    pub fn decode(mut buf: &[u8]) -> ProtoResult<Self> {
        let mut ies = Vec::new();
        while !buf.is_empty() {
            if buf.len() < 2 {
                return Err(FrameError::short(2, buf.len()));
            }
            let tag = buf[0];
            let len = buf[1] as usize;
            if buf.len() < 2 + len {
                return Err(FrameError::short(2 + len, buf.len()));
            }
            ies.push(Ie {
                tag,
                value: Ie::decode_value(tag, &buf[2..2 + len])?,
            });
            buf = &buf[2 + len..];
        }
        Ok(IeList(ies))
    }

    pub fn encode(&self, buf: &mut Vec<u8>) -> ProtoResult<()> {
        for ie in &self.0 {
            ie.encode(buf)?;
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> ProtoResult<Vec<u8>> {
        let mut buf = Vec::new();
        self.encode(&mut buf)?;
        Ok(buf)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, tag: u8) -> Option<&Ie> {
        self.0.iter().find(|ie| ie.tag == tag)
    }

    pub fn has(&self, tag: u8) -> bool {
        self.get(tag).is_some()
    }

    pub fn string(&self, tag: u8) -> Option<&str> {
        match &self.get(tag)?.value {
            IeValue::Str(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Width-agnostic numeric read, the way senders of any width expect.
    pub fn numeric(&self, tag: u8) -> Option<u32> {
        match &self.get(tag)?.value {
            IeValue::U8(v) => Some(*v as u32),
            IeValue::U16(v) => Some(*v as u32),
            IeValue::U32(v) => Some(*v),
            _ => None,
        }
    }

    pub fn binary(&self, tag: u8) -> Option<&[u8]> {
        match &self.get(tag)?.value {
            IeValue::Bin(b) => Some(b.as_slice()),
            IeValue::Empty => Some(&[]),
            _ => None,
        }
    }

    pub fn addr(&self, tag: u8) -> Option<SocketAddrV4> {
        match &self.get(tag)?.value {
            IeValue::Addr(a) => Some(*a),
            _ => None,
        }
    }

    /// Check the VERSION IE if present; absence is accepted.
    pub fn validate_version(&self) -> ProtoResult<()> {
        match self.numeric(ie_tag::VERSION) {
            None => Ok(()),
            Some(v) if v == PROTOCOL_VERSION as u32 => Ok(()),
            Some(v) => Err(FrameError::BadVersion(v as u16)),
        }
    }

    pub fn append(&mut self, ie: Ie) -> &mut Self {
        self.0.push(ie);
        self
    }

    pub fn append_str(&mut self, tag: u8, value: impl Into<String>) -> &mut Self {
        self.append(Ie {
            tag,
            value: IeValue::Str(value.into()),
        })
    }

    pub fn append_u8(&mut self, tag: u8, value: u8) -> &mut Self {
        self.append(Ie {
            tag,
            value: IeValue::U8(value),
        })
    }

    pub fn append_u16(&mut self, tag: u8, value: u16) -> &mut Self {
        self.append(Ie {
            tag,
            value: IeValue::U16(value),
        })
    }

    pub fn append_u32(&mut self, tag: u8, value: u32) -> &mut Self {
        self.append(Ie {
            tag,
            value: IeValue::U32(value),
        })
    }

    pub fn append_bin(&mut self, tag: u8, value: impl Into<Vec<u8>>) -> &mut Self {
        let value = value.into();
        self.append(Ie {
            tag,
            value: if value.is_empty() {
                IeValue::Empty
            } else {
                IeValue::Bin(value)
            },
        })
    }

    pub fn append_empty(&mut self, tag: u8) -> &mut Self {
        self.append(Ie {
            tag,
            value: IeValue::Empty,
        })
    }

    pub fn append_addr(&mut self, tag: u8, addr: SocketAddrV4) -> &mut Self {
        self.append(Ie {
            tag,
            value: IeValue::Addr(addr),
        })
    }

    /// Replace the first IE with this tag, or append it.
    pub fn set(&mut self, ie: Ie) -> &mut Self {
        match self.0.iter().position(|e| e.tag == ie.tag) {
            Some(pos) => self.0[pos] = ie,
            None => self.0.push(ie),
        }
        self
    }
}
