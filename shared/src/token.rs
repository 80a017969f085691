//! Connect tokens: the credential a client presents to be admitted
//!
//! A token has a public half the client can read (timestamps, server list,
//! session keys) and a private half sealed with the server private key. The
//! private half is what travels inside a connection request; only a server
//! holding the private key can open it.

use crate::crypto::{self, Key};
use crate::error::{NetcodeError, Result};
use crate::{
    unix_timestamp, CONNECT_TOKEN_BYTES, CONNECT_TOKEN_PRIVATE_BYTES, MAC_BYTES,
    MAX_SERVERS_PER_CONNECT, TIMEOUT_SECONDS, USER_DATA_BYTES, VERSION_INFO, VERSION_INFO_BYTES,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

/// Seconds a freshly generated token stays valid unless configured otherwise
pub const DEFAULT_TOKEN_EXPIRY_SECONDS: u64 = 30;

/// Decrypted private section of a connect token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectTokenPrivate {
    pub client_id: u64,
    pub timeout_seconds: i32,
    pub server_addresses: Vec<SocketAddr>,
    pub client_to_server_key: Key,
    pub server_to_client_key: Key,
    pub user_data: Vec<u8>,
}

impl ConnectTokenPrivate {
    /// Creates a private section with fresh random session keys
    pub fn generate(
        client_id: u64,
        timeout_seconds: i32,
        server_addresses: Vec<SocketAddr>,
        user_data: Vec<u8>,
    ) -> Result<Self> {
        let private = Self {
            client_id,
            timeout_seconds,
            server_addresses,
            client_to_server_key: crypto::generate_key(),
            server_to_client_key: crypto::generate_key(),
            user_data,
        };
        private.validate()?;
        Ok(private)
    }

    fn validate(&self) -> Result<()> {
        validate_server_addresses(&self.server_addresses)?;
        if self.user_data.len() > USER_DATA_BYTES {
            return Err(NetcodeError::InvalidConnectToken(format!(
                "user data is {} bytes, maximum is {}",
                self.user_data.len(),
                USER_DATA_BYTES
            )));
        }
        Ok(())
    }

    /// Seals the private section; the result is exactly `CONNECT_TOKEN_PRIVATE_BYTES` long
    pub fn encrypt(
        &self,
        protocol_id: u64,
        expire_timestamp: u64,
        sequence: u64,
        private_key: &Key,
    ) -> Result<Vec<u8>> {
        self.validate()?;

        let mut plaintext = bincode::serialize(self)?;
        let capacity = CONNECT_TOKEN_PRIVATE_BYTES - MAC_BYTES;
        if plaintext.len() > capacity {
            return Err(NetcodeError::InvalidConnectToken(format!(
                "private data is {} bytes, maximum is {}",
                plaintext.len(),
                capacity
            )));
        }
        plaintext.resize(capacity, 0);

        let aad = additional_data(protocol_id, expire_timestamp);
        crypto::seal(&plaintext, private_key, sequence, &aad)
    }

    /// Opens a sealed private section
    ///
    /// Wrong length, authentication failure and malformed contents all map to
    /// `InvalidConnectToken`; the token is never retried.
    pub fn decrypt(
        sealed: &[u8],
        protocol_id: u64,
        expire_timestamp: u64,
        sequence: u64,
        private_key: &Key,
    ) -> Result<Self> {
        if sealed.len() != CONNECT_TOKEN_PRIVATE_BYTES {
            return Err(NetcodeError::InvalidConnectToken(format!(
                "sealed private data is {} bytes, expected {}",
                sealed.len(),
                CONNECT_TOKEN_PRIVATE_BYTES
            )));
        }

        let aad = additional_data(protocol_id, expire_timestamp);
        let plaintext = crypto::open(sealed, private_key, sequence, &aad)
            .map_err(|_| NetcodeError::InvalidConnectToken("authentication failed".into()))?;

        let private: Self = bincode::deserialize(&plaintext)
            .map_err(|e| NetcodeError::InvalidConnectToken(e.to_string()))?;
        private.validate()?;
        Ok(private)
    }
}

/// The token blob handed to a client by the backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectToken {
    pub version_info: [u8; VERSION_INFO_BYTES],
    pub protocol_id: u64,
    pub create_timestamp: u64,
    pub expire_timestamp: u64,
    /// Nonce for the sealed private section
    pub sequence: u64,
    pub private_data: Vec<u8>,
    pub timeout_seconds: i32,
    pub server_addresses: Vec<SocketAddr>,
    pub client_to_server_key: Key,
    pub server_to_client_key: Key,
}

impl ConnectToken {
    /// Serializes the token for out-of-band delivery to the client
    pub fn write(&self) -> Result<Vec<u8>> {
        let data = bincode::serialize(self)?;
        if data.len() > CONNECT_TOKEN_BYTES {
            return Err(NetcodeError::InvalidConnectToken(format!(
                "token is {} bytes, maximum is {}",
                data.len(),
                CONNECT_TOKEN_BYTES
            )));
        }
        Ok(data)
    }

    pub fn read(data: &[u8]) -> Result<Self> {
        if data.is_empty() || data.len() > CONNECT_TOKEN_BYTES {
            return Err(NetcodeError::InvalidConnectToken(format!(
                "token blob is {} bytes",
                data.len()
            )));
        }

        let token: Self = bincode::deserialize(data)
            .map_err(|e| NetcodeError::InvalidConnectToken(e.to_string()))?;
        token.validate()?;
        Ok(token)
    }

    /// Structural checks a client can make without the server key
    pub fn validate(&self) -> Result<()> {
        if self.version_info != *VERSION_INFO {
            return Err(NetcodeError::InvalidConnectToken(
                "version info mismatch".into(),
            ));
        }
        if self.private_data.len() != CONNECT_TOKEN_PRIVATE_BYTES {
            return Err(NetcodeError::InvalidConnectToken(format!(
                "sealed private data is {} bytes, expected {}",
                self.private_data.len(),
                CONNECT_TOKEN_PRIVATE_BYTES
            )));
        }
        if self.create_timestamp > self.expire_timestamp {
            return Err(NetcodeError::InvalidConnectToken(
                "token expires before it was created".into(),
            ));
        }
        validate_server_addresses(&self.server_addresses)
    }

    pub fn is_expired(&self, now: u64) -> bool {
        now >= self.expire_timestamp
    }

    /// Opens the private section; only meaningful on the server side
    pub fn decrypt_private(&self, private_key: &Key) -> Result<ConnectTokenPrivate> {
        ConnectTokenPrivate::decrypt(
            &self.private_data,
            self.protocol_id,
            self.expire_timestamp,
            self.sequence,
            private_key,
        )
    }
}

/// Mints connect tokens, assigning each one the next sequence number
///
/// In production this lives in the backend; the server binary's development
/// tool and the tests use it directly.
pub struct TokenGenerator {
    protocol_id: u64,
    private_key: Key,
    expire_seconds: u64,
    timeout_seconds: i32,
    next_sequence: u64,
}

impl TokenGenerator {
    pub fn new(protocol_id: u64, private_key: Key) -> Self {
        Self {
            protocol_id,
            private_key,
            expire_seconds: DEFAULT_TOKEN_EXPIRY_SECONDS,
            timeout_seconds: TIMEOUT_SECONDS,
            next_sequence: 0,
        }
    }

    pub fn with_expire_seconds(mut self, expire_seconds: u64) -> Self {
        self.expire_seconds = expire_seconds;
        self
    }

    /// Session timeout written into tokens; negative disables timeouts
    pub fn with_timeout_seconds(mut self, timeout_seconds: i32) -> Self {
        self.timeout_seconds = timeout_seconds;
        self
    }

    pub fn generate(
        &mut self,
        client_id: u64,
        server_addresses: Vec<SocketAddr>,
        user_data: Vec<u8>,
    ) -> Result<ConnectToken> {
        let private = ConnectTokenPrivate::generate(
            client_id,
            self.timeout_seconds,
            server_addresses,
            user_data,
        )?;

        let create_timestamp = unix_timestamp();
        let expire_timestamp = create_timestamp + self.expire_seconds;
        let sequence = self.next_sequence;
        self.next_sequence += 1;

        let private_data = private.encrypt(
            self.protocol_id,
            expire_timestamp,
            sequence,
            &self.private_key,
        )?;

        Ok(ConnectToken {
            version_info: *VERSION_INFO,
            protocol_id: self.protocol_id,
            create_timestamp,
            expire_timestamp,
            sequence,
            private_data,
            timeout_seconds: private.timeout_seconds,
            server_addresses: private.server_addresses,
            client_to_server_key: private.client_to_server_key,
            server_to_client_key: private.server_to_client_key,
        })
    }
}

fn validate_server_addresses(addresses: &[SocketAddr]) -> Result<()> {
    if addresses.is_empty() || addresses.len() > MAX_SERVERS_PER_CONNECT {
        return Err(NetcodeError::InvalidConnectToken(format!(
            "token lists {} server addresses, expected 1..={}",
            addresses.len(),
            MAX_SERVERS_PER_CONNECT
        )));
    }
    Ok(())
}

fn additional_data(protocol_id: u64, expire_timestamp: u64) -> Vec<u8> {
    let mut aad = Vec::with_capacity(VERSION_INFO_BYTES + 16);
    aad.extend_from_slice(VERSION_INFO);
    aad.extend_from_slice(&protocol_id.to_le_bytes());
    aad.extend_from_slice(&expire_timestamp.to_le_bytes());
    aad
}
