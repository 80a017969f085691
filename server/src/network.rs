//! Server network layer: admission pipeline and tick driver
//!
//! The socket read loop runs on its own task and only queues datagrams. All
//! protocol work happens in [`Server::update`], which the caller drives with a
//! monotonically increasing time in seconds:
//! 1. Drain and process every queued datagram
//! 2. Expire handshakes and time out silent clients
//! 3. Send keep-alives to idle clients
//! 4. Flush queued frames to the socket

use crate::client_manager::{ClientManager, DisconnectNotice};
use log::{debug, info, warn};
use shared::crypto::generate_key;
use shared::transport::recv_channel;
use shared::{
    send_interval, unix_timestamp, ChallengeToken, ConnectTokenPrivate, Key, NetcodeConn,
    NetcodeData, NetcodeError, Packet, PacketType, Result, MAC_BYTES, MAX_CLIENTS,
    NUM_DISCONNECT_PACKETS, TIMEOUT_SECONDS,
};
use std::net::SocketAddr;
use tokio::sync::mpsc;

/// Datagrams the read loop may queue between two updates
const RECV_QUEUE_CAPACITY: usize = 4096;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub protocol_id: u64,
    /// Key shared with the backend that mints connect tokens
    pub private_key: Key,
    /// Address clients know this server by; must appear in their tokens
    pub public_address: SocketAddr,
    pub max_clients: usize,
    /// Session timeout for tokens that carry none
    pub timeout_seconds: i32,
}

impl ServerConfig {
    pub fn new(protocol_id: u64, private_key: Key, public_address: SocketAddr) -> Self {
        Self {
            protocol_id,
            private_key,
            public_address,
            max_clients: 32,
            timeout_seconds: TIMEOUT_SECONDS,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_clients == 0 || self.max_clients > MAX_CLIENTS {
            return Err(NetcodeError::InvalidConfig(format!(
                "max clients must be between 1 and {}, got {}",
                MAX_CLIENTS, self.max_clients
            )));
        }
        Ok(())
    }
}

/// Authoritative end of the protocol
pub struct Server {
    config: ServerConfig,
    conn: NetcodeConn,
    packets: Option<mpsc::Receiver<NetcodeData>>,
    clients: ClientManager,

    // Only this server can open the challenge tokens it hands out.
    challenge_key: Key,
    challenge_sequence: u64,

    server_time: f64,
    outgoing: Vec<(Vec<u8>, SocketAddr)>,
}

impl Server {
    pub fn new(config: ServerConfig) -> Result<Self> {
        config.validate()?;

        let clients = ClientManager::new(config.timeout_seconds as f64, config.max_clients);
        Ok(Server {
            config,
            conn: NetcodeConn::new(),
            packets: None,
            clients,
            challenge_key: generate_key(),
            challenge_sequence: 0,
            server_time: 0.0,
            outgoing: Vec::new(),
        })
    }

    /// Binds the socket and starts receiving; must run inside a Tokio runtime
    pub fn listen(&mut self, bind_addr: SocketAddr) -> Result<()> {
        let (tx, rx) = recv_channel(RECV_QUEUE_CAPACITY);
        self.conn.set_recv_handler(tx);
        self.conn.listen(bind_addr)?;
        self.packets = Some(rx);

        info!(
            "Server listening on {} as {} (protocol {:#x}, {} slots)",
            self.conn.local_addr()?,
            self.config.public_address,
            self.config.protocol_id,
            self.config.max_clients
        );
        Ok(())
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.conn.local_addr()
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn time(&self) -> f64 {
        self.server_time
    }

    pub fn max_clients(&self) -> usize {
        self.clients.max_clients()
    }

    pub fn connected_client_count(&self) -> usize {
        self.clients.connected_client_count()
    }

    pub fn is_client_connected(&self, client_index: usize) -> bool {
        self.clients
            .client(client_index)
            .map_or(false, |client| client.connected)
    }

    pub fn client_id(&self, client_index: usize) -> Option<u64> {
        self.clients
            .client(client_index)
            .filter(|client| client.connected)
            .map(|client| client.client_id)
    }

    pub fn client_user_data(&self, client_index: usize) -> Option<&[u8]> {
        self.clients
            .client(client_index)
            .filter(|client| client.connected)
            .map(|client| client.user_data.as_slice())
    }

    /// Runs one server tick at `time`
    pub fn update(&mut self, time: f64) {
        self.server_time = time;

        let received: Vec<NetcodeData> = match self.packets.as_mut() {
            Some(rx) => std::iter::from_fn(|| rx.try_recv().ok()).collect(),
            None => Vec::new(),
        };
        for datagram in received {
            self.process_packet(&datagram.data, datagram.from);
        }

        self.tick();
        self.flush();
    }

    /// Timeouts and keep-alives for the current server time
    pub fn tick(&mut self) {
        let time = self.server_time;

        for client_id in self.clients.check_timeouts(time) {
            debug!("Removed timed out client {}", client_id);
        }

        let idle: Vec<usize> = self
            .clients
            .connected_clients()
            .filter(|client| client.last_send_time + send_interval() <= time)
            .map(|client| client.client_index)
            .collect();
        for client_index in idle {
            self.send_keep_alive(client_index);
        }
    }

    /// Routes one datagram through the admission pipeline
    ///
    /// Anything that fails validation is dropped; the sender never learns why.
    pub fn process_packet(&mut self, data: &[u8], from: SocketAddr) {
        let packet_type = match PacketType::from_prefix(data) {
            Ok(packet_type) => packet_type,
            Err(e) => {
                debug!("Dropping datagram from {}: {}", from, e);
                return;
            }
        };

        match packet_type {
            PacketType::ConnectionRequest => self.process_connection_request(data, from),
            PacketType::Response => self.process_connection_response(data, from),
            PacketType::KeepAlive | PacketType::Payload | PacketType::Disconnect => {
                self.process_session_packet(data, from)
            }
            PacketType::ConnectionDenied | PacketType::Challenge => {
                debug!("Ignoring {:?} from {}", packet_type, from);
            }
        }
    }

    fn process_connection_request(&mut self, data: &[u8], from: SocketAddr) {
        let time = self.server_time;

        let (expire_timestamp, token_sequence, private_data) =
            match Packet::read(data, self.config.protocol_id, None) {
                Ok((
                    _,
                    Packet::ConnectionRequest {
                        expire_timestamp,
                        token_sequence,
                        private_data,
                        ..
                    },
                )) => (expire_timestamp, token_sequence, private_data),
                Ok(_) => return,
                Err(e) => {
                    debug!("Bad connection request from {}: {}", from, e);
                    return;
                }
            };

        if expire_timestamp <= unix_timestamp() {
            debug!("Connection request from {} carries an expired token", from);
            return;
        }

        let token = match ConnectTokenPrivate::decrypt(
            &private_data,
            self.config.protocol_id,
            expire_timestamp,
            token_sequence,
            &self.config.private_key,
        ) {
            Ok(token) => token,
            Err(e) => {
                debug!("Connection request from {}: {}", from, e);
                return;
            }
        };

        if !token.server_addresses.contains(&self.config.public_address) {
            debug!(
                "Token from {} is not valid for {}",
                from, self.config.public_address
            );
            return;
        }
        if self.clients.find_client_index_by_address(&from).is_some() {
            debug!("Connection request from already connected {}", from);
            return;
        }
        if self.clients.find_client_index_by_id(token.client_id).is_some() {
            debug!("Client id {} is already connected", token.client_id);
            return;
        }

        // The sealed section's MAC identifies the token without trusting the sender
        let Some(mac) = private_data
            .len()
            .checked_sub(MAC_BYTES)
            .and_then(|start| <[u8; MAC_BYTES]>::try_from(&private_data[start..]).ok())
        else {
            return;
        };
        if !self.clients.find_or_add_token_entry(&mac, &from, time) {
            debug!(
                "Connect token for client {} already used from another address, ignoring {}",
                token.client_id, from
            );
            return;
        }

        if self.clients.find_free_client_index().is_none() {
            info!("Server full, denying {}", from);
            self.send_denied(from);
            return;
        }

        let timeout = if token.timeout_seconds > 0 {
            token.timeout_seconds
        } else {
            TIMEOUT_SECONDS
        };
        let expire_time = time + timeout as f64;
        if !self
            .clients
            .add_encryption_mapping(&token, &from, time, expire_time)
        {
            self.send_denied(from);
            return;
        }

        let challenge_sequence = self.challenge_sequence;
        self.challenge_sequence += 1;
        let token_data = match ChallengeToken::new(token.client_id, token.user_data)
            .seal(challenge_sequence, &self.challenge_key)
        {
            Ok(sealed) => sealed,
            Err(e) => {
                warn!("Failed to seal challenge token for {}: {}", from, e);
                self.clients.remove_encryption_entry(&from);
                return;
            }
        };

        let Some(entry_index) = self.clients.find_encryption_entry_index(&from, time) else {
            return;
        };
        let Some(sequence) = self.clients.next_entry_sequence(entry_index) else {
            return;
        };
        let Some(send_key) = self
            .clients
            .encryption_entry(entry_index)
            .map(|entry| entry.send_key)
        else {
            return;
        };

        debug!("Sending challenge {} to {}", challenge_sequence, from);
        let challenge = Packet::Challenge {
            token_sequence: challenge_sequence,
            token_data,
        };
        self.send_packet(&challenge, sequence, &send_key, from);
    }

    fn process_connection_response(&mut self, data: &[u8], from: SocketAddr) {
        let time = self.server_time;

        let Some(entry_index) = self.clients.find_encryption_entry_index(&from, time) else {
            debug!("Response from {} without a pending handshake", from);
            return;
        };
        let Some(recv_key) = self
            .clients
            .encryption_entry(entry_index)
            .map(|entry| entry.recv_key)
        else {
            return;
        };

        let (token_sequence, token_data) =
            match Packet::read(data, self.config.protocol_id, Some(&recv_key)) {
                Ok((
                    _,
                    Packet::Response {
                        token_sequence,
                        token_data,
                    },
                )) => (token_sequence, token_data),
                Ok(_) => return,
                Err(e) => {
                    debug!("Bad response from {}: {}", from, e);
                    return;
                }
            };

        if let Some(entry) = self.clients.encryption_entry_mut(entry_index) {
            entry.last_access_time = time;
        }

        if self.clients.find_client_index_by_address(&from).is_some() {
            return;
        }
        if self.clients.find_free_client_index().is_none() {
            info!("Server full, denying {}", from);
            self.send_denied(from);
            return;
        }

        let challenge_key = self.challenge_key;
        let Some(client_index) = self.clients.open_challenge_and_connect(
            &from,
            &token_data,
            token_sequence,
            &challenge_key,
            time,
        ) else {
            return;
        };

        self.send_keep_alive(client_index);
    }

    fn process_session_packet(&mut self, data: &[u8], from: SocketAddr) {
        let time = self.server_time;

        let Some(client_index) = self.clients.find_client_index_by_address(&from) else {
            debug!("Session packet from unknown address {}", from);
            return;
        };
        let protocol_id = self.config.protocol_id;
        let Some(client) = self.clients.client_mut(client_index) else {
            return;
        };

        let (sequence, packet) = match Packet::read(data, protocol_id, Some(&client.recv_key)) {
            Ok(decoded) => decoded,
            Err(e) => {
                debug!("Bad packet from client {}: {}", client.client_id, e);
                return;
            }
        };

        if !client.replay_protection.accept(sequence) {
            debug!(
                "Dropping replayed packet {} from client {}",
                sequence, client.client_id
            );
            return;
        }

        client.last_recv_time = time;
        if !client.confirmed {
            debug!("Client {} confirmed", client.client_id);
            client.confirmed = true;
        }

        match packet {
            Packet::KeepAlive { .. } => {}
            Packet::Payload(payload) => client.queue_payload(payload, sequence),
            Packet::Disconnect => {
                info!("Client {} sent disconnect", client.client_id);
                self.clients.disconnect_client_by_address(&from, false, time);
            }
            _ => {}
        }
    }

    /// Queues a payload for a connected client
    ///
    /// Until the client has been heard from in its session, each payload is
    /// preceded by a keep-alive so a client whose first keep-alive was lost
    /// still learns its slot.
    pub fn send_payload(&mut self, client_index: usize, payload: &[u8]) -> Result<()> {
        let protocol_id = self.config.protocol_id;
        let time = self.server_time;

        let confirmed = self
            .clients
            .client(client_index)
            .filter(|client| client.connected)
            .ok_or(NetcodeError::ClientNotConnected(client_index))?
            .confirmed;
        if !confirmed {
            self.send_keep_alive(client_index);
        }

        let client = self
            .clients
            .client_mut(client_index)
            .ok_or(NetcodeError::ClientNotConnected(client_index))?;
        let Some(address) = client.address else {
            return Err(NetcodeError::ClientNotConnected(client_index));
        };

        let frame = Packet::Payload(payload.to_vec()).write(
            client.sequence,
            protocol_id,
            Some(&client.send_key),
        )?;
        client.next_sequence();
        client.last_send_time = time;

        self.outgoing.push((frame, address));
        Ok(())
    }

    /// Next payload received from a client, with its packet sequence
    pub fn recv_payload(&mut self, client_index: usize) -> Option<(Vec<u8>, u64)> {
        self.clients
            .client_mut(client_index)
            .filter(|client| client.connected)
            .and_then(|client| client.payloads.pop_front())
    }

    pub fn disconnect_client(&mut self, client_index: usize, send_disconnect_packets: bool) {
        let time = self.server_time;
        if let Some(notice) =
            self.clients
                .disconnect_client(client_index, send_disconnect_packets, time)
        {
            self.send_disconnect_packets(&notice);
        }
    }

    pub fn disconnect_all(&mut self) {
        for client_index in 0..self.clients.max_clients() {
            self.disconnect_client(client_index, true);
        }
    }

    /// Disconnects everyone, flushes their disconnect frames and stops listening
    pub fn close(&mut self) {
        self.disconnect_all();
        self.flush();
        self.conn.close();
        self.packets = None;
        info!("Server closed");
    }

    fn send_keep_alive(&mut self, client_index: usize) {
        let max_clients = self.clients.max_clients() as u32;
        let time = self.server_time;
        let Some(client) = self.clients.client_mut(client_index) else {
            return;
        };
        let Some(address) = client.address else {
            return;
        };

        let packet = Packet::KeepAlive {
            client_index: client_index as u32,
            max_clients,
        };
        let sequence = client.next_sequence();
        let send_key = client.send_key;
        client.last_send_time = time;

        self.send_packet(&packet, sequence, &send_key, address);
    }

    fn send_disconnect_packets(&mut self, notice: &DisconnectNotice) {
        for i in 0..NUM_DISCONNECT_PACKETS as u64 {
            self.send_packet(
                &Packet::Disconnect,
                notice.sequence + i,
                &notice.send_key,
                notice.address,
            );
        }
    }

    fn send_denied(&mut self, to: SocketAddr) {
        match Packet::ConnectionDenied.write(0, self.config.protocol_id, None) {
            Ok(frame) => self.outgoing.push((frame, to)),
            Err(e) => warn!("Failed to encode denial for {}: {}", to, e),
        }
    }

    fn send_packet(&mut self, packet: &Packet, sequence: u64, key: &Key, to: SocketAddr) {
        match packet.write(sequence, self.config.protocol_id, Some(key)) {
            Ok(frame) => self.outgoing.push((frame, to)),
            Err(e) => warn!("Failed to encode {:?} for {}: {}", packet.packet_type(), to, e),
        }
    }

    /// Writes queued frames to the socket
    ///
    /// Without an open socket the frames stay queued for [`Server::drain_outgoing`].
    pub fn flush(&mut self) {
        if self.conn.is_closed() {
            return;
        }
        for (frame, to) in self.outgoing.drain(..) {
            if let Err(e) = self.conn.write_to(&frame, to) {
                warn!("Failed to send to {}: {}", to, e);
            }
        }
    }

    /// Takes every queued frame with its destination
    pub fn drain_outgoing(&mut self) -> Vec<(Vec<u8>, SocketAddr)> {
        std::mem::take(&mut self.outgoing)
    }
}
