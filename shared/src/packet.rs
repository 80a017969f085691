//! Wire frames and their encoding
//!
//! ```text
//! connection request : [0][version info 13][protocol id 8][expire 8][token sequence 8][sealed private 1024]
//! connection denied  : [1]
//! everything else    : [type][sequence 8][sealed body]
//! ```
//!
//! All integers are little-endian. Sealed bodies use the sender's per-session
//! key and the frame sequence as nonce; the associated data binds the version
//! info, protocol id and type byte.

use crate::crypto::{self, Key};
use crate::error::{NetcodeError, Result};
use crate::token::ConnectToken;
use crate::{
    CHALLENGE_TOKEN_BYTES, CONNECT_TOKEN_PRIVATE_BYTES, MAC_BYTES, MAX_PACKET_BYTES,
    MAX_PAYLOAD_BYTES, VERSION_INFO, VERSION_INFO_BYTES,
};

/// Exact length of a connection request frame
pub const CONNECTION_REQUEST_BYTES: usize = 1 + VERSION_INFO_BYTES + 8 + 8 + 8 + CONNECT_TOKEN_PRIVATE_BYTES;

const ENCRYPTED_HEADER_BYTES: usize = 1 + 8;
const CHALLENGE_BODY_BYTES: usize = 8 + CHALLENGE_TOKEN_BYTES;
const KEEP_ALIVE_BODY_BYTES: usize = 4 + 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    ConnectionRequest = 0,
    ConnectionDenied = 1,
    Challenge = 2,
    Response = 3,
    KeepAlive = 4,
    Payload = 5,
    Disconnect = 6,
}

impl PacketType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(PacketType::ConnectionRequest),
            1 => Some(PacketType::ConnectionDenied),
            2 => Some(PacketType::Challenge),
            3 => Some(PacketType::Response),
            4 => Some(PacketType::KeepAlive),
            5 => Some(PacketType::Payload),
            6 => Some(PacketType::Disconnect),
            _ => None,
        }
    }

    /// Structural gate applied before any decryption
    ///
    /// Checks the datagram size bounds and the type tag only.
    pub fn from_prefix(data: &[u8]) -> Result<Self> {
        if data.is_empty() {
            return Err(NetcodeError::PacketTooSmall {
                expected: 1,
                actual: 0,
            });
        }
        if data.len() > MAX_PACKET_BYTES {
            return Err(NetcodeError::PacketSizeMax {
                max: MAX_PACKET_BYTES,
            });
        }
        PacketType::from_u8(data[0]).ok_or(NetcodeError::UnknownPacketType(data[0]))
    }

    /// Whether frames of this type carry a sequence and a sealed body
    pub fn is_encrypted(self) -> bool {
        !matches!(
            self,
            PacketType::ConnectionRequest | PacketType::ConnectionDenied
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    ConnectionRequest {
        version_info: [u8; VERSION_INFO_BYTES],
        protocol_id: u64,
        expire_timestamp: u64,
        token_sequence: u64,
        private_data: Vec<u8>,
    },
    ConnectionDenied,
    Challenge {
        token_sequence: u64,
        token_data: Vec<u8>,
    },
    Response {
        token_sequence: u64,
        token_data: Vec<u8>,
    },
    KeepAlive {
        client_index: u32,
        max_clients: u32,
    },
    Payload(Vec<u8>),
    Disconnect,
}

impl Packet {
    /// The request a client sends to present `token` to a server
    pub fn connection_request(token: &ConnectToken) -> Self {
        Packet::ConnectionRequest {
            version_info: token.version_info,
            protocol_id: token.protocol_id,
            expire_timestamp: token.expire_timestamp,
            token_sequence: token.sequence,
            private_data: token.private_data.clone(),
        }
    }

    pub fn packet_type(&self) -> PacketType {
        match self {
            Packet::ConnectionRequest { .. } => PacketType::ConnectionRequest,
            Packet::ConnectionDenied => PacketType::ConnectionDenied,
            Packet::Challenge { .. } => PacketType::Challenge,
            Packet::Response { .. } => PacketType::Response,
            Packet::KeepAlive { .. } => PacketType::KeepAlive,
            Packet::Payload(_) => PacketType::Payload,
            Packet::Disconnect => PacketType::Disconnect,
        }
    }

    /// Encodes the frame
    ///
    /// `sequence` and `key` are ignored for the two cleartext frame types and
    /// required for every other one.
    pub fn write(&self, sequence: u64, protocol_id: u64, key: Option<&Key>) -> Result<Vec<u8>> {
        let packet_type = self.packet_type();

        match self {
            Packet::ConnectionRequest {
                version_info,
                protocol_id,
                expire_timestamp,
                token_sequence,
                private_data,
            } => {
                if private_data.len() != CONNECT_TOKEN_PRIVATE_BYTES {
                    return Err(NetcodeError::InvalidPacket);
                }
                let mut data = Vec::with_capacity(CONNECTION_REQUEST_BYTES);
                data.push(packet_type as u8);
                data.extend_from_slice(version_info);
                data.extend_from_slice(&protocol_id.to_le_bytes());
                data.extend_from_slice(&expire_timestamp.to_le_bytes());
                data.extend_from_slice(&token_sequence.to_le_bytes());
                data.extend_from_slice(private_data);
                Ok(data)
            }
            Packet::ConnectionDenied => Ok(vec![packet_type as u8]),
            _ => {
                let key = key.ok_or(NetcodeError::MissingKey)?;
                let body = self.write_body()?;
                let aad = additional_data(protocol_id, packet_type);
                let sealed = crypto::seal(&body, key, sequence, &aad)?;

                let mut data = Vec::with_capacity(ENCRYPTED_HEADER_BYTES + sealed.len());
                data.push(packet_type as u8);
                data.extend_from_slice(&sequence.to_le_bytes());
                data.extend_from_slice(&sealed);

                if data.len() > MAX_PACKET_BYTES {
                    return Err(NetcodeError::PacketSizeMax {
                        max: MAX_PACKET_BYTES,
                    });
                }
                Ok(data)
            }
        }
    }

    fn write_body(&self) -> Result<Vec<u8>> {
        let body = match self {
            Packet::Challenge {
                token_sequence,
                token_data,
            }
            | Packet::Response {
                token_sequence,
                token_data,
            } => {
                if token_data.len() != CHALLENGE_TOKEN_BYTES {
                    return Err(NetcodeError::InvalidChallengeToken);
                }
                let mut body = Vec::with_capacity(CHALLENGE_BODY_BYTES);
                body.extend_from_slice(&token_sequence.to_le_bytes());
                body.extend_from_slice(token_data);
                body
            }
            Packet::KeepAlive {
                client_index,
                max_clients,
            } => {
                let mut body = Vec::with_capacity(KEEP_ALIVE_BODY_BYTES);
                body.extend_from_slice(&client_index.to_le_bytes());
                body.extend_from_slice(&max_clients.to_le_bytes());
                body
            }
            Packet::Payload(payload) => {
                if payload.is_empty() || payload.len() > MAX_PAYLOAD_BYTES {
                    return Err(NetcodeError::PayloadSize(payload.len()));
                }
                payload.clone()
            }
            Packet::Disconnect => Vec::new(),
            Packet::ConnectionRequest { .. } | Packet::ConnectionDenied => {
                return Err(NetcodeError::InvalidPacket)
            }
        };
        Ok(body)
    }

    /// Decodes a frame, returning its sequence (zero for cleartext frames)
    ///
    /// Size and type are validated before the body is opened, so a datagram
    /// that fails structurally never costs a decryption.
    pub fn read(data: &[u8], protocol_id: u64, key: Option<&Key>) -> Result<(u64, Packet)> {
        let packet_type = PacketType::from_prefix(data)?;

        match packet_type {
            PacketType::ConnectionRequest => {
                if data.len() != CONNECTION_REQUEST_BYTES {
                    return Err(NetcodeError::InvalidPacket);
                }
                let mut version_info = [0u8; VERSION_INFO_BYTES];
                version_info.copy_from_slice(&data[1..1 + VERSION_INFO_BYTES]);
                if version_info != *VERSION_INFO {
                    return Err(NetcodeError::InvalidPacket);
                }

                let offset = 1 + VERSION_INFO_BYTES;
                let request_protocol_id = read_u64(data, offset);
                if request_protocol_id != protocol_id {
                    return Err(NetcodeError::ProtocolMismatch {
                        expected: protocol_id,
                        actual: request_protocol_id,
                    });
                }

                Ok((
                    0,
                    Packet::ConnectionRequest {
                        version_info,
                        protocol_id: request_protocol_id,
                        expire_timestamp: read_u64(data, offset + 8),
                        token_sequence: read_u64(data, offset + 16),
                        private_data: data[offset + 24..].to_vec(),
                    },
                ))
            }
            PacketType::ConnectionDenied => {
                if data.len() != 1 {
                    return Err(NetcodeError::InvalidPacket);
                }
                Ok((0, Packet::ConnectionDenied))
            }
            _ => {
                let minimum = ENCRYPTED_HEADER_BYTES + MAC_BYTES;
                if data.len() < minimum {
                    return Err(NetcodeError::PacketTooSmall {
                        expected: minimum,
                        actual: data.len(),
                    });
                }
                let key = key.ok_or(NetcodeError::MissingKey)?;

                let sequence = read_u64(data, 1);
                let aad = additional_data(protocol_id, packet_type);
                let body = crypto::open(&data[ENCRYPTED_HEADER_BYTES..], key, sequence, &aad)?;

                Ok((sequence, Self::read_body(packet_type, body)?))
            }
        }
    }

    fn read_body(packet_type: PacketType, body: Vec<u8>) -> Result<Packet> {
        match packet_type {
            PacketType::Challenge | PacketType::Response => {
                if body.len() != CHALLENGE_BODY_BYTES {
                    return Err(NetcodeError::InvalidPacket);
                }
                let token_sequence = read_u64(&body, 0);
                let token_data = body[8..].to_vec();
                if packet_type == PacketType::Challenge {
                    Ok(Packet::Challenge {
                        token_sequence,
                        token_data,
                    })
                } else {
                    Ok(Packet::Response {
                        token_sequence,
                        token_data,
                    })
                }
            }
            PacketType::KeepAlive => {
                if body.len() != KEEP_ALIVE_BODY_BYTES {
                    return Err(NetcodeError::InvalidPacket);
                }
                Ok(Packet::KeepAlive {
                    client_index: read_u32(&body, 0),
                    max_clients: read_u32(&body, 4),
                })
            }
            PacketType::Payload => {
                if body.is_empty() || body.len() > MAX_PAYLOAD_BYTES {
                    return Err(NetcodeError::PayloadSize(body.len()));
                }
                Ok(Packet::Payload(body))
            }
            PacketType::Disconnect => {
                if !body.is_empty() {
                    return Err(NetcodeError::InvalidPacket);
                }
                Ok(Packet::Disconnect)
            }
            PacketType::ConnectionRequest | PacketType::ConnectionDenied => {
                Err(NetcodeError::InvalidPacket)
            }
        }
    }
}

fn additional_data(protocol_id: u64, packet_type: PacketType) -> Vec<u8> {
    let mut aad = Vec::with_capacity(VERSION_INFO_BYTES + 8 + 1);
    aad.extend_from_slice(VERSION_INFO);
    aad.extend_from_slice(&protocol_id.to_le_bytes());
    aad.push(packet_type as u8);
    aad
}

fn read_u64(data: &[u8], offset: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&data[offset..offset + 8]);
    u64::from_le_bytes(bytes)
}

fn read_u32(data: &[u8], offset: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&data[offset..offset + 4]);
    u32::from_le_bytes(bytes)
}
