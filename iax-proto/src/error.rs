use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("buffer too short: need {need} bytes, have {have}")]
    ShortBuffer { need: usize, have: usize },
    #[error("unsupported protocol version {0}")]
    BadVersion(u16),
    #[error("subclass {0:#x} is neither a small literal nor a power of two")]
    InvalidSubclass(u32),
    #[error("unknown full frame type {0}")]
    UnknownFrameType(u8),
    #[error("unknown meta frame indicator {0:#x}")]
    InvalidMeta(u8),
    #[error("malformed information element, tag {tag}")]
    InvalidIe { tag: u8 },
}

pub type ProtoResult<T> = Result<T, FrameError>;

impl FrameError {
    pub(crate) fn short(need: usize, have: usize) -> Self {
        FrameError::ShortBuffer { need, have }
    }
}
