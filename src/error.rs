//! Bus-level error types

use crate::net::wire::CodecError;

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("event loop stopped")]
    LoopStopped,

    #[error("server start failed: {0}")]
    ServerStart(String),

    #[error("tls error: {0}")]
    Tls(#[from] rustls::Error),
}
