use std::io;

use thiserror::Error;

use iax_proto::FrameError;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("failed to bind {addr}: {source}")]
    BindFailed {
        addr: std::net::SocketAddr,
        source: io::Error,
    },
    #[error("socket error: {0}")]
    Socket(#[from] io::Error),
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),
    #[error("call number space exhausted")]
    CallNumbersExhausted,
    #[error("engine is shutting down")]
    Exiting,
    #[error("transaction is in the wrong state for this operation")]
    InvalidState,
    #[error("no line named '{0}'")]
    NoSuchLine(String),
}

pub type EngineResult<T> = Result<T, EngineError>;
