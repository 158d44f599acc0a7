//! Protocol numbers: frame types, subclasses, auth methods and the media
//! format bitmask space.

/// The only VERSION IE value this stack speaks.
pub const PROTOCOL_VERSION: u16 = 2;

/// Default IAX2 UDP port.
pub const DEFAULT_PORT: u16 = 4569;

/// Highest assignable call number (15 bits on the wire).
pub const MAX_CALL_NUMBER: u16 = 0x7FFF;

/// The type byte of a full frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameType {
    Dtmf = 1,
    Voice = 2,
    Video = 3,
    Control = 4,
    Null = 5,
    Iax = 6,
    Text = 7,
    Image = 8,
    Html = 9,
    Noise = 10,
}

impl FrameType {
    pub fn from_u8(raw: u8) -> Option<Self> {
        Some(match raw {
            1 => FrameType::Dtmf,
            2 => FrameType::Voice,
            3 => FrameType::Video,
            4 => FrameType::Control,
            5 => FrameType::Null,
            6 => FrameType::Iax,
            7 => FrameType::Text,
            8 => FrameType::Image,
            9 => FrameType::Html,
            10 => FrameType::Noise,
            _ => return None,
        })
    }
}

/// Subclasses of IAX-control full frames (`FrameType::Iax`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum IaxControl {
    New = 1,
    Ping = 2,
    Pong = 3,
    Ack = 4,
    Hangup = 5,
    Reject = 6,
    Accept = 7,
    AuthReq = 8,
    AuthRep = 9,
    Inval = 10,
    LagRq = 11,
    LagRp = 12,
    RegReq = 13,
    RegAuth = 14,
    RegAck = 15,
    RegRej = 16,
    RegRel = 17,
    Vnak = 18,
    DpReq = 19,
    DpRep = 20,
    Dial = 21,
    TxReq = 22,
    TxCnt = 23,
    TxAcc = 24,
    TxReady = 25,
    TxRel = 26,
    TxRej = 27,
    Quelch = 28,
    Unquelch = 29,
    Poke = 30,
    Mwi = 32,
    Unsupport = 33,
    Transfer = 34,
    Provision = 35,
    FwDownl = 36,
    FwData = 37,
    CallToken = 40,
}

impl IaxControl {
    pub fn from_u32(raw: u32) -> Option<Self> {
        Some(match raw {
            1 => IaxControl::New,
            2 => IaxControl::Ping,
            3 => IaxControl::Pong,
            4 => IaxControl::Ack,
            5 => IaxControl::Hangup,
            6 => IaxControl::Reject,
            7 => IaxControl::Accept,
            8 => IaxControl::AuthReq,
            9 => IaxControl::AuthRep,
            10 => IaxControl::Inval,
            11 => IaxControl::LagRq,
            12 => IaxControl::LagRp,
            13 => IaxControl::RegReq,
            14 => IaxControl::RegAuth,
            15 => IaxControl::RegAck,
            16 => IaxControl::RegRej,
            17 => IaxControl::RegRel,
            18 => IaxControl::Vnak,
            19 => IaxControl::DpReq,
            20 => IaxControl::DpRep,
            21 => IaxControl::Dial,
            22 => IaxControl::TxReq,
            23 => IaxControl::TxCnt,
            24 => IaxControl::TxAcc,
            25 => IaxControl::TxReady,
            26 => IaxControl::TxRel,
            27 => IaxControl::TxRej,
            28 => IaxControl::Quelch,
            29 => IaxControl::Unquelch,
            30 => IaxControl::Poke,
            32 => IaxControl::Mwi,
            33 => IaxControl::Unsupport,
            34 => IaxControl::Transfer,
            35 => IaxControl::Provision,
            36 => IaxControl::FwDownl,
            37 => IaxControl::FwData,
            40 => IaxControl::CallToken,
            _ => return None,
        })
    }
}

/// Subclasses of call-control full frames (`FrameType::Control`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ControlType {
    Hangup = 1,
    Ring = 2,
    Ringing = 3,
    Answer = 4,
    Busy = 5,
    Congestion = 8,
    FlashHook = 9,
    Option = 11,
    KeyRadio = 12,
    UnkeyRadio = 13,
    Progressing = 14,
    Proceeding = 15,
    Hold = 16,
    Unhold = 17,
    VidUpdate = 18,
}

impl ControlType {
    pub fn from_u32(raw: u32) -> Option<Self> {
        Some(match raw {
            1 => ControlType::Hangup,
            2 => ControlType::Ring,
            3 => ControlType::Ringing,
            4 => ControlType::Answer,
            5 => ControlType::Busy,
            8 => ControlType::Congestion,
            9 => ControlType::FlashHook,
            11 => ControlType::Option,
            12 => ControlType::KeyRadio,
            13 => ControlType::UnkeyRadio,
            14 => ControlType::Progressing,
            15 => ControlType::Proceeding,
            16 => ControlType::Hold,
            17 => ControlType::Unhold,
            18 => ControlType::VidUpdate,
            _ => return None,
        })
    }
}

/// Advertised authentication mechanisms (AUTHMETHODS IE bitmask).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum AuthMethod {
    Text = 1,
    Md5 = 2,
    Rsa = 4,
}

/// Media format bitmask space shared by the FORMAT and CAPABILITY IEs and
/// the subclass of Voice/Video full frames.
pub mod format {
    pub const G723_1: u32 = 1 << 0;
    pub const GSM: u32 = 1 << 1;
    pub const ULAW: u32 = 1 << 2;
    pub const ALAW: u32 = 1 << 3;
    pub const G726: u32 = 1 << 4;
    pub const ADPCM: u32 = 1 << 5;
    pub const SLIN: u32 = 1 << 6;
    pub const LPC10: u32 = 1 << 7;
    pub const G729: u32 = 1 << 8;
    pub const SPEEX: u32 = 1 << 9;
    pub const ILBC: u32 = 1 << 10;
    pub const G726_AAL2: u32 = 1 << 11;
    pub const G722: u32 = 1 << 12;
    pub const AMR: u32 = 1 << 13;

    pub const JPEG: u32 = 1 << 16;
    pub const PNG: u32 = 1 << 17;
    pub const H261: u32 = 1 << 18;
    pub const H263: u32 = 1 << 19;
    pub const H263P: u32 = 1 << 20;
    pub const H264: u32 = 1 << 21;

    pub const AUDIO_MASK: u32 = 0x0000_FFFF;
    pub const VIDEO_MASK: u32 = 0x00FF_0000;

    /// The two media lanes a transaction carries.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub enum MediaType {
        Audio,
        Video,
    }

    impl MediaType {
        pub fn mask(self) -> u32 {
            match self {
                MediaType::Audio => AUDIO_MASK,
                MediaType::Video => VIDEO_MASK,
            }
        }

        pub fn name(self) -> &'static str {
            match self {
                MediaType::Audio => "audio",
                MediaType::Video => "video",
            }
        }
    }

    /// Restrict a raw format bitmask to one media lane.
    pub fn mask(value: u32, media: MediaType) -> u32 {
        value & media.mask()
    }

    /// Source-timestamp divisor turning sample counts into milliseconds.
    /// 8 kHz audio formats tick 8 samples per ms; wideband ticks 16;
    /// video uses the 90 kHz RTP clock.
    pub fn multiplier(fmt: u32) -> u32 {
        if fmt & VIDEO_MASK != 0 {
            90
        } else if fmt & (G722 | SPEEX | AMR) != 0 {
            16
        } else if fmt & AUDIO_MASK != 0 {
            8
        } else {
            1
        }
    }

    pub fn name(fmt: u32) -> Option<&'static str> {
        Some(match fmt {
            G723_1 => "g723.1",
            GSM => "gsm",
            ULAW => "mulaw",
            ALAW => "alaw",
            G726 => "g726",
            ADPCM => "adpcm",
            SLIN => "slin",
            LPC10 => "lpc10",
            G729 => "g729",
            SPEEX => "speex",
            ILBC => "ilbc",
            G726_AAL2 => "g726aal2",
            G722 => "g722",
            AMR => "amr",
            JPEG => "jpeg",
            PNG => "png",
            H261 => "h261",
            H263 => "h263",
            H263P => "h263p",
            H264 => "h264",
            _ => return None,
        })
    }
}
