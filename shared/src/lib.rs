//! # Shared protocol core
//!
//! Everything both ends of a connection need: constants, the AEAD envelope,
//! connect and challenge tokens, the packet codec, replay protection and the
//! UDP transport.
//!
//! ## Handshake
//!
//! 1. The client sends a connection request carrying the sealed private half
//!    of its connect token.
//! 2. The server opens it, records an encryption mapping for the sender's
//!    address and answers with a challenge holding a server-sealed challenge
//!    token.
//! 3. The client echoes the challenge token back in a response.
//! 4. The server opens the challenge token, assigns a client slot and starts
//!    sending keep-alives. The first keep-alive or payload the client receives
//!    marks it connected.
//!
//! After the handshake both sides exchange encrypted keep-alive and payload
//! frames. Delivery stays best-effort; the only guarantees are
//! confidentiality, integrity and replay rejection.

pub mod challenge;
pub mod crypto;
pub mod error;
pub mod packet;
pub mod replay;
pub mod token;
pub mod transport;

pub use challenge::ChallengeToken;
pub use crypto::Key;
pub use error::{NetcodeError, Result};
pub use packet::{Packet, PacketType};
pub use replay::ReplayProtection;
pub use token::{ConnectToken, ConnectTokenPrivate, TokenGenerator};
pub use transport::{NetcodeConn, NetcodeData};

use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub const VERSION_INFO_BYTES: usize = 13;
pub const VERSION_INFO: &[u8; VERSION_INFO_BYTES] = b"NETCODE 1.01\0";

pub const KEY_BYTES: usize = 32;
pub const MAC_BYTES: usize = 16;
pub const NONCE_BYTES: usize = 12;
pub const USER_DATA_BYTES: usize = 256;

pub const CONNECT_TOKEN_BYTES: usize = 2048;
pub const CONNECT_TOKEN_PRIVATE_BYTES: usize = 1024;
pub const CHALLENGE_TOKEN_BYTES: usize = 300;
pub const MAX_SERVERS_PER_CONNECT: usize = 16;

pub const MAX_PACKET_BYTES: usize = 1400;
pub const MAX_PAYLOAD_BYTES: usize = 1300;
pub const MAX_CLIENTS: usize = 256;

/// Handshake resends and keep-alives per second
pub const PACKET_SEND_RATE: f64 = 10.0;
pub const TIMEOUT_SECONDS: i32 = 5;
pub const NUM_DISCONNECT_PACKETS: usize = 10;
pub const REPLAY_PROTECTION_BUFFER_SIZE: usize = 256;

pub const SOCKET_RCVBUF_SIZE: usize = 2048 * 2048;
pub const SOCKET_SNDBUF_SIZE: usize = 2048 * 2048;

/// Seconds between handshake resends or keep-alives
pub fn send_interval() -> f64 {
    1.0 / PACKET_SEND_RATE
}

/// Current wall-clock time in unix seconds, used for token timestamps
pub fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_secs()
}
