//! The crate-wide error type.

use std::io;

use thiserror::Error;

use crate::core::statistics::DisconnectReason;

/// Errors surfaced by the wire formats, the configuration loader and the async services.
///
/// Transient network errors (malformed or expired packets) are dropped by the services that
/// receive them; protocol mismatches carry the [`DisconnectReason`] to send to the peer.
#[derive(Debug, Error)]
pub enum Error {
    #[error("rlp: {0}")]
    Rlp(#[from] rlp::DecoderError),

    #[error("packet too short: {0} bytes")]
    PacketTooShort(usize),

    #[error("packet hash doesn't match its contents")]
    HashMismatch,

    #[error("invalid signature")]
    Signature,

    #[error("message expired {0}s ago")]
    Expired(u64),

    #[error("unknown discovery packet type {0:#04x}")]
    UnknownPacket(u8),

    #[error("message code {code:#04x} isn't supported by eth/{version}")]
    Unsupported { version: u8, code: u8 },

    #[error("unsupported eth protocol version {0}")]
    UnsupportedVersion(u8),

    #[error("invalid frame magic {0:#010x}")]
    BadMagic(u32),

    #[error("frame of {0} bytes exceeds the limit")]
    FrameTooLarge(usize),

    #[error("peer must be disconnected: {0:?}")]
    Disconnect(DisconnectReason),

    #[error("invalid node: {0}")]
    InvalidNode(String),

    #[error("config: {0}")]
    Config(#[from] toml::de::Error),

    #[error("chain: {0}")]
    Chain(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// A specialised [`Result`](std::result::Result) for this crate.
pub type Result<T> = std::result::Result<T, Error>;
