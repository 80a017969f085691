//! Client handshake and session state machine
//!
//! Like the server, the client is driven by [`Client::update`] with a caller
//! supplied time in seconds. The socket read loop only queues datagrams; all
//! state changes happen inside `update`.

use crate::state::ClientState;
use log::{debug, info, warn};
use shared::transport::recv_channel;
use shared::{
    send_interval, unix_timestamp, ConnectToken, Key, NetcodeConn, NetcodeData, NetcodeError,
    Packet, PacketType, ReplayProtection, Result, NUM_DISCONNECT_PACKETS, TIMEOUT_SECONDS,
};
use std::collections::VecDeque;
use std::net::SocketAddr;
use tokio::sync::mpsc;

const RECV_QUEUE_CAPACITY: usize = 1024;

/// Received payloads kept before the oldest is dropped
pub const MAX_QUEUED_PAYLOADS: usize = 256;

pub struct Client {
    token: ConnectToken,
    state: ClientState,
    conn: NetcodeConn,
    packets: Option<mpsc::Receiver<NetcodeData>>,

    server_index: usize,
    server_address: Option<SocketAddr>,

    send_key: Key,
    recv_key: Key,
    sequence: u64,
    timeout: f64,
    replay_protection: ReplayProtection,

    // Sealed challenge token and its sequence, echoed back verbatim
    challenge: Option<(u64, Vec<u8>)>,
    client_index: u32,
    max_clients: u32,

    time: f64,
    start_time: Option<f64>,
    state_start_time: f64,
    last_send_time: f64,
    last_recv_time: f64,

    received: VecDeque<(Vec<u8>, u64)>,
    outgoing: Vec<(Vec<u8>, SocketAddr)>,
}

impl Client {
    /// Creates a client for `token`
    ///
    /// The token is checked up front: a malformed one leaves the client in
    /// `InvalidConnectToken` and an expired one in `ConnectTokenExpired`.
    pub fn new(token: ConnectToken) -> Self {
        let state = if let Err(e) = token.validate() {
            warn!("Rejecting connect token: {}", e);
            ClientState::InvalidConnectToken
        } else if token.is_expired(unix_timestamp()) {
            warn!("Connect token expired at {}", token.expire_timestamp);
            ClientState::ConnectTokenExpired
        } else {
            ClientState::SendingConnectionRequest
        };

        let timeout = match token.timeout_seconds {
            0 => TIMEOUT_SECONDS as f64,
            seconds => seconds as f64,
        };

        Client {
            server_address: token.server_addresses.first().copied(),
            send_key: token.client_to_server_key,
            recv_key: token.server_to_client_key,
            token,
            state,
            conn: NetcodeConn::new(),
            packets: None,
            server_index: 0,
            sequence: 0,
            timeout,
            replay_protection: ReplayProtection::new(),
            challenge: None,
            client_index: 0,
            max_clients: 0,
            time: 0.0,
            start_time: None,
            state_start_time: 0.0,
            last_send_time: f64::NEG_INFINITY,
            last_recv_time: 0.0,
            received: VecDeque::new(),
            outgoing: Vec::new(),
        }
    }

    /// Reads a token blob and creates a client for it
    pub fn from_token_bytes(data: &[u8]) -> Result<Self> {
        Ok(Self::new(ConnectToken::read(data)?))
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    /// Slot assigned by the server; meaningful once connected
    pub fn client_index(&self) -> u32 {
        self.client_index
    }

    pub fn max_clients(&self) -> u32 {
        self.max_clients
    }

    pub fn server_address(&self) -> Option<SocketAddr> {
        self.server_address
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.conn.local_addr()
    }

    /// Opens a socket to the current server; must run inside a Tokio runtime
    pub fn connect(&mut self) -> Result<()> {
        match self.state {
            ClientState::InvalidConnectToken => {
                return Err(NetcodeError::InvalidConnectToken(self.state.to_string()))
            }
            ClientState::ConnectTokenExpired => return Err(NetcodeError::ConnectTokenExpired),
            state if !state.is_connecting() => return Err(NetcodeError::NotConnected),
            _ => {}
        }
        let address = self.server_address.ok_or(NetcodeError::NotConnected)?;

        if self.packets.is_none() {
            let (tx, rx) = recv_channel(RECV_QUEUE_CAPACITY);
            self.conn.set_recv_handler(tx);
            self.packets = Some(rx);
        }
        self.conn.dial(address)?;

        info!("Connecting to {}", address);
        Ok(())
    }

    /// Processes queued datagrams, advances timers and flushes frames
    pub fn update(&mut self, time: f64) {
        self.time = time;

        let received: Vec<NetcodeData> = match self.packets.as_mut() {
            Some(rx) => std::iter::from_fn(|| rx.try_recv().ok()).collect(),
            None => Vec::new(),
        };
        for datagram in received {
            self.process_packet(&datagram.data, datagram.from);
        }

        self.tick(time);
        self.flush();
    }

    /// Timeouts, handshake resends and keep-alives
    pub fn tick(&mut self, time: f64) {
        self.time = time;
        if self.state.is_terminal() {
            return;
        }

        let start = match self.start_time {
            Some(start) => start,
            None => {
                self.start_time = Some(time);
                self.state_start_time = time;
                self.last_recv_time = time;
                time
            }
        };

        if self.state.is_connecting() {
            let lifetime = self
                .token
                .expire_timestamp
                .saturating_sub(self.token.create_timestamp) as f64;
            if time - start >= lifetime {
                self.set_state(ClientState::ConnectTokenExpired);
                return;
            }

            if self.timeout >= 0.0 && self.state_start_time + self.timeout < time {
                let failure = if self.state == ClientState::SendingConnectionRequest {
                    ClientState::ConnectionRequestTimedOut
                } else {
                    ClientState::ConnectionResponseTimedOut
                };
                if !self.next_server() {
                    self.set_state(failure);
                    return;
                }
            }

            if self.last_send_time + send_interval() <= time {
                self.send_handshake_packet();
            }
            return;
        }

        if self.timeout >= 0.0 && self.last_recv_time + self.timeout < time {
            self.set_state(ClientState::ConnectionTimedOut);
            return;
        }
        if self.last_send_time + send_interval() <= time {
            self.send_encrypted(&Packet::KeepAlive {
                client_index: self.client_index,
                max_clients: self.max_clients,
            });
        }
    }

    /// Handles one datagram from the network
    pub fn process_packet(&mut self, data: &[u8], from: SocketAddr) {
        if self.state.is_terminal() {
            return;
        }
        if self.server_address != Some(from) {
            debug!("Ignoring datagram from unexpected address {}", from);
            return;
        }

        let packet_type = match PacketType::from_prefix(data) {
            Ok(packet_type) => packet_type,
            Err(e) => {
                debug!("Dropping datagram from {}: {}", from, e);
                return;
            }
        };
        let key = packet_type.is_encrypted().then_some(&self.recv_key);
        let (sequence, packet) = match Packet::read(data, self.token.protocol_id, key) {
            Ok(decoded) => decoded,
            Err(e) => {
                debug!("Bad {:?} from {}: {}", packet_type, from, e);
                return;
            }
        };

        // Windowed frames are recorded only once an arm below acts on them
        let windowed = matches!(
            packet_type,
            PacketType::KeepAlive | PacketType::Payload | PacketType::Disconnect
        );
        if windowed && self.replay_protection.already_received(sequence) {
            debug!("Dropping replayed packet {}", sequence);
            return;
        }

        match (self.state, packet) {
            (state, Packet::ConnectionDenied) if state.is_connecting() => {
                warn!("Connection denied by {}", from);
                self.set_state(ClientState::ConnectionDenied);
                return;
            }
            (
                ClientState::SendingConnectionRequest,
                Packet::Challenge {
                    token_sequence,
                    token_data,
                },
            ) => {
                debug!("Received challenge {} from {}", token_sequence, from);
                self.challenge = Some((token_sequence, token_data));
                self.last_send_time = f64::NEG_INFINITY;
                self.set_state(ClientState::SendingChallengeResponse);
            }
            (
                ClientState::SendingChallengeResponse,
                Packet::KeepAlive {
                    client_index,
                    max_clients,
                },
            ) => {
                self.client_index = client_index;
                self.max_clients = max_clients;
                self.set_state(ClientState::Connected);
                info!(
                    "Connected to {} in slot {} of {}",
                    from, client_index, max_clients
                );
            }
            (ClientState::SendingChallengeResponse, Packet::Payload(payload)) => {
                self.set_state(ClientState::Connected);
                info!("Connected to {}", from);
                self.queue_payload(payload, sequence);
            }
            (ClientState::Connected, Packet::KeepAlive { .. }) => {}
            (ClientState::Connected, Packet::Payload(payload)) => {
                self.queue_payload(payload, sequence);
            }
            (ClientState::Connected, Packet::Disconnect) => {
                info!("Server {} disconnected us", from);
                self.replay_protection.accept(sequence);
                self.set_state(ClientState::Disconnected);
                return;
            }
            (state, packet) => {
                debug!("Ignoring {:?} while {}", packet.packet_type(), state);
                return;
            }
        }

        if windowed {
            self.replay_protection.accept(sequence);
        }
        self.last_recv_time = self.time;
    }

    /// Queues a payload for the server; only valid while connected
    pub fn send_data(&mut self, payload: &[u8]) -> Result<()> {
        if self.state != ClientState::Connected {
            return Err(NetcodeError::NotConnected);
        }
        let address = self.server_address.ok_or(NetcodeError::NotConnected)?;

        let frame = Packet::Payload(payload.to_vec()).write(
            self.sequence,
            self.token.protocol_id,
            Some(&self.send_key),
        )?;
        self.sequence += 1;
        self.last_send_time = self.time;
        self.outgoing.push((frame, address));
        Ok(())
    }

    /// Next payload received from the server, with its packet sequence
    pub fn recv_data(&mut self) -> Option<(Vec<u8>, u64)> {
        self.received.pop_front()
    }

    /// Tells a connected server goodbye and releases the socket
    pub fn close(&mut self) {
        if self.state == ClientState::Connected {
            for _ in 0..NUM_DISCONNECT_PACKETS {
                self.send_encrypted(&Packet::Disconnect);
            }
            self.flush();
        }
        if !self.state.is_terminal() {
            self.set_state(ClientState::Disconnected);
        }
        self.conn.close();
        self.packets = None;
    }

    /// Writes queued frames to the socket
    ///
    /// Without an open socket the frames stay queued for [`Client::drain_outgoing`].
    pub fn flush(&mut self) {
        if self.conn.is_closed() {
            return;
        }
        for (frame, to) in self.outgoing.drain(..) {
            if let Err(e) = self.conn.write(&frame) {
                warn!("Failed to send to {}: {}", to, e);
            }
        }
    }

    /// Takes every queued frame with its destination
    pub fn drain_outgoing(&mut self) -> Vec<(Vec<u8>, SocketAddr)> {
        std::mem::take(&mut self.outgoing)
    }

    fn set_state(&mut self, state: ClientState) {
        if self.state != state {
            debug!("Client state {} -> {}", self.state, state);
            self.state = state;
            self.state_start_time = self.time;
        }
    }

    /// Moves on to the next server in the token, if there is one
    fn next_server(&mut self) -> bool {
        let next = self.server_index + 1;
        let Some(&address) = self.token.server_addresses.get(next) else {
            return false;
        };

        info!(
            "No answer from {:?}, trying {}",
            self.server_address, address
        );
        self.server_index = next;
        self.server_address = Some(address);
        self.challenge = None;
        self.last_send_time = f64::NEG_INFINITY;
        self.replay_protection.reset();
        self.state = ClientState::SendingConnectionRequest;
        self.state_start_time = self.time;

        if !self.conn.is_closed() {
            if let Err(e) = self.conn.dial(address) {
                warn!("Failed to dial {}: {}", address, e);
            }
        }
        true
    }

    fn send_handshake_packet(&mut self) {
        match self.state {
            ClientState::SendingConnectionRequest => {
                let Some(address) = self.server_address else {
                    return;
                };
                match Packet::connection_request(&self.token).write(
                    0,
                    self.token.protocol_id,
                    None,
                ) {
                    Ok(frame) => self.outgoing.push((frame, address)),
                    Err(e) => warn!("Failed to encode connection request: {}", e),
                }
                self.last_send_time = self.time;
            }
            ClientState::SendingChallengeResponse => {
                let Some((token_sequence, token_data)) = self.challenge.clone() else {
                    return;
                };
                self.send_encrypted(&Packet::Response {
                    token_sequence,
                    token_data,
                });
            }
            _ => {}
        }
    }

    fn send_encrypted(&mut self, packet: &Packet) {
        let Some(address) = self.server_address else {
            return;
        };
        match packet.write(self.sequence, self.token.protocol_id, Some(&self.send_key)) {
            Ok(frame) => {
                self.sequence += 1;
                self.last_send_time = self.time;
                self.outgoing.push((frame, address));
            }
            Err(e) => warn!("Failed to encode {:?}: {}", packet.packet_type(), e),
        }
    }

    fn queue_payload(&mut self, payload: Vec<u8>, sequence: u64) {
        if self.received.len() >= MAX_QUEUED_PAYLOADS {
            self.received.pop_front();
        }
        self.received.push_back((payload, sequence));
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        if self.state == ClientState::Connected {
            self.close();
        }
    }
}
