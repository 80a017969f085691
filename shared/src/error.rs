//! Error type shared by the transport, codec and token layers.

use thiserror::Error;

/// Errors raised by the protocol core
///
/// Capacity exhaustion and lookups that find nothing are not errors; those
/// surface as `bool` / `Option` from the client manager. Everything here is
/// either a transport fault or a datagram/token that must be discarded.
#[derive(Debug, Error)]
pub enum NetcodeError {
    #[error("attempted to write to a closed socket")]
    WriteClosedSocket,

    #[error("socket returned zero bytes")]
    SocketZeroRecv,

    #[error("packet size exceeds maximum of {max} bytes")]
    PacketSizeMax { max: usize },

    #[error("invalid packet")]
    InvalidPacket,

    #[error("receive handler must be set before listen or dial")]
    PacketHandlerBeforeListen,

    #[error("socket is not bound")]
    NotBound,

    #[error("packet is too small: expected at least {expected} bytes, got {actual}")]
    PacketTooSmall { expected: usize, actual: usize },

    #[error("unknown packet type {0}")]
    UnknownPacketType(u8),

    #[error("payload size {0} is out of range")]
    PayloadSize(usize),

    #[error("packet requires an encryption key")]
    MissingKey,

    #[error("encryption failed")]
    EncryptionFailed,

    #[error("decryption failed: authentication failure")]
    DecryptionFailed,

    #[error("invalid connect token: {0}")]
    InvalidConnectToken(String),

    #[error("connect token expired")]
    ConnectTokenExpired,

    #[error("invalid challenge token")]
    InvalidChallengeToken,

    #[error("protocol id mismatch: expected {expected:#x}, got {actual:#x}")]
    ProtocolMismatch { expected: u64, actual: u64 },

    #[error("not connected")]
    NotConnected,

    #[error("client slot {0} is not connected")]
    ClientNotConnected(usize),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, NetcodeError>;
