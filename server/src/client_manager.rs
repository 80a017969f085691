//! Server-side client table and handshake bookkeeping
//!
//! This module owns the fixed-size tables the admission pipeline works on:
//! - Encryption mappings: per-address session keys for handshakes in progress
//! - Client slots: one entry per connected session, indexed by slot number
//! - Connect token entries: which address first presented each token
//!
//! The tables are sized from `max_clients` at construction and never grow.
//! Lookups are linear scans, which is all a table this small needs. The
//! manager has no internal locking; exactly one task may mutate it.
//!
//! Every frame the server seals draws its sequence from one counter that only
//! moves forward, so a token's keys never see the same nonce twice even when
//! the token is used again after a handshake expires or a session ends.

use crate::client::ClientInstance;
use log::{debug, info, warn};
use shared::{
    ChallengeToken, ConnectTokenPrivate, Key, KEY_BYTES, MAC_BYTES, NUM_DISCONNECT_PACKETS,
};
use std::net::SocketAddr;

/// Session keys for an address that has sent a valid connection request
/// but has not yet answered its challenge
#[derive(Debug, Clone)]
pub struct EncryptionEntry {
    /// Peer address; `None` marks an unused entry
    pub address: Option<SocketAddr>,
    pub send_key: Key,
    pub recv_key: Key,
    /// Next outbound sequence for frames sealed with `send_key`
    pub sequence: u64,
    pub create_time: f64,
    pub expire_time: f64,
    pub last_access_time: f64,
    /// Session timeout carried over to the client slot
    pub timeout: f64,
}

impl EncryptionEntry {
    fn empty() -> Self {
        Self {
            address: None,
            send_key: [0; KEY_BYTES],
            recv_key: [0; KEY_BYTES],
            sequence: 0,
            create_time: 0.0,
            expire_time: 0.0,
            last_access_time: 0.0,
            timeout: 0.0,
        }
    }

    /// An entry counts only while it is in use and its expiry lies ahead
    pub fn is_live(&self, server_time: f64) -> bool {
        self.address.is_some() && self.expire_time > server_time
    }

}

/// Connect token entries kept per client slot
pub const CONNECT_TOKEN_ENTRIES_PER_CLIENT: usize = 16;

/// First address seen presenting a connect token, keyed by the token's MAC
#[derive(Debug, Clone)]
struct ConnectTokenEntry {
    mac: [u8; MAC_BYTES],
    address: Option<SocketAddr>,
    time: f64,
}

impl ConnectTokenEntry {
    fn empty() -> Self {
        Self {
            mac: [0; MAC_BYTES],
            address: None,
            time: f64::NEG_INFINITY,
        }
    }
}

/// Everything needed to tell a peer it was disconnected, captured before
/// its slot is wiped
#[derive(Debug, Clone)]
pub struct DisconnectNotice {
    pub client_index: usize,
    pub client_id: u64,
    pub address: SocketAddr,
    pub send_key: Key,
    pub sequence: u64,
}

/// Bounded table of pending encryption mappings and connected client slots
///
/// Capacity exhaustion and failed lookups are ordinary outcomes reported as
/// `bool` or `None`. The manager never sends packets; when a disconnect should
/// be announced it hands the caller a [`DisconnectNotice`] instead.
pub struct ClientManager {
    instances: Vec<ClientInstance>,
    entries: Vec<EncryptionEntry>,
    token_entries: Vec<ConnectTokenEntry>,
    /// Lower bound for the next sequence sealed with any key
    global_sequence: u64,
    /// Session timeout used when a token does not carry one
    timeout: f64,
    max_clients: usize,
}

impl ClientManager {
    /// Creates a manager with `max_clients` slots and as many mapping entries
    pub fn new(timeout: f64, max_clients: usize) -> Self {
        Self {
            instances: (0..max_clients).map(ClientInstance::new).collect(),
            entries: vec![EncryptionEntry::empty(); max_clients],
            token_entries: vec![
                ConnectTokenEntry::empty();
                max_clients * CONNECT_TOKEN_ENTRIES_PER_CLIENT
            ],
            global_sequence: 0,
            timeout,
            max_clients,
        }
    }

    pub fn max_clients(&self) -> usize {
        self.max_clients
    }

    /// Returns the first slot that is not connected
    pub fn find_free_client_index(&self) -> Option<usize> {
        self.instances.iter().position(|client| !client.connected)
    }

    /// Finds the connected slot bound to `addr`
    pub fn find_client_index_by_address(&self, addr: &SocketAddr) -> Option<usize> {
        self.instances
            .iter()
            .position(|client| client.connected && client.address.as_ref() == Some(addr))
    }

    /// Finds the connected slot owned by `client_id`
    pub fn find_client_index_by_id(&self, client_id: u64) -> Option<usize> {
        self.instances
            .iter()
            .position(|client| client.connected && client.client_id == client_id)
    }

    pub fn connected_client_count(&self) -> usize {
        self.instances.iter().filter(|client| client.connected).count()
    }

    pub fn client(&self, index: usize) -> Option<&ClientInstance> {
        self.instances.get(index)
    }

    pub fn client_mut(&mut self, index: usize) -> Option<&mut ClientInstance> {
        self.instances.get_mut(index)
    }

    pub fn connected_clients(&self) -> impl Iterator<Item = &ClientInstance> {
        self.instances.iter().filter(|client| client.connected)
    }

    pub fn global_sequence(&self) -> u64 {
        self.global_sequence
    }

    /// Binds a connect token to the first address that presents it
    ///
    /// Returns false when the token, identified by the MAC of its sealed
    /// private section, was already seen from a different address. An unknown
    /// token takes an unused entry or evicts the oldest one.
    pub fn find_or_add_token_entry(
        &mut self,
        mac: &[u8; MAC_BYTES],
        addr: &SocketAddr,
        server_time: f64,
    ) -> bool {
        if let Some(entry) = self
            .token_entries
            .iter()
            .find(|entry| entry.address.is_some() && entry.mac == *mac)
        {
            return entry.address.as_ref() == Some(addr);
        }

        let oldest = self
            .token_entries
            .iter()
            .enumerate()
            .min_by(|(_, a), (_, b)| a.time.total_cmp(&b.time))
            .map(|(index, _)| index);
        if let Some(index) = oldest {
            self.token_entries[index] = ConnectTokenEntry {
                mac: *mac,
                address: Some(*addr),
                time: server_time,
            };
        }
        true
    }

    /// Records session keys for `addr` from a decrypted connect token
    ///
    /// A live entry for the same address is refreshed in place and does not
    /// consume another entry. A new address takes the first unused or expired
    /// entry; if every entry is live the call fails and nothing changes.
    pub fn add_encryption_mapping(
        &mut self,
        token: &ConnectTokenPrivate,
        addr: &SocketAddr,
        server_time: f64,
        expire_time: f64,
    ) -> bool {
        let timeout = match token.timeout_seconds {
            0 => self.timeout,
            seconds => seconds as f64,
        };

        if let Some(index) = self.find_encryption_entry_index(addr, server_time) {
            let entry = &mut self.entries[index];
            entry.send_key = token.server_to_client_key;
            entry.recv_key = token.client_to_server_key;
            entry.expire_time = expire_time;
            entry.last_access_time = server_time;
            entry.timeout = timeout;
            debug!("Refreshed encryption mapping {} for {}", index, addr);
            return true;
        }

        let Some(index) = self
            .entries
            .iter()
            .position(|entry| !entry.is_live(server_time))
        else {
            warn!("Encryption mapping table full, rejecting {}", addr);
            return false;
        };

        self.entries[index] = EncryptionEntry {
            address: Some(*addr),
            send_key: token.server_to_client_key,
            recv_key: token.client_to_server_key,
            sequence: self.global_sequence,
            create_time: server_time,
            expire_time,
            last_access_time: server_time,
            timeout,
        };
        debug!("Added encryption mapping {} for {}", index, addr);
        true
    }

    /// Returns the live mapping for `addr`
    ///
    /// An entry whose expiry has passed is treated as absent even before the
    /// next sweep physically removes it.
    pub fn find_encryption_entry_index(&self, addr: &SocketAddr, server_time: f64) -> Option<usize> {
        self.entries
            .iter()
            .position(|entry| entry.is_live(server_time) && entry.address.as_ref() == Some(addr))
    }

    pub fn encryption_entry(&self, index: usize) -> Option<&EncryptionEntry> {
        self.entries.get(index).filter(|entry| entry.address.is_some())
    }

    pub fn encryption_entry_mut(&mut self, index: usize) -> Option<&mut EncryptionEntry> {
        self.entries
            .get_mut(index)
            .filter(|entry| entry.address.is_some())
    }

    /// Sequence for the next frame sealed with a mapping's send key
    ///
    /// Drawn from the global counter, so it never repeats a sequence used
    /// with any key before.
    pub fn next_entry_sequence(&mut self, index: usize) -> Option<u64> {
        let sequence = self.global_sequence;
        let entry = self
            .entries
            .get_mut(index)
            .filter(|entry| entry.address.is_some())?;
        entry.sequence = sequence + 1;
        self.global_sequence += 1;
        Some(sequence)
    }

    /// Moves a mapping's expiry; fails for out-of-range or unused entries
    pub fn set_encryption_entry_expiration(&mut self, index: usize, expire_time: f64) -> bool {
        match self.encryption_entry_mut(index) {
            Some(entry) => {
                entry.expire_time = expire_time;
                true
            }
            None => false,
        }
    }

    /// Drops any mapping held for `addr`, live or not
    pub fn remove_encryption_entry(&mut self, addr: &SocketAddr) -> bool {
        let mut removed = false;
        for entry in &mut self.entries {
            if entry.address.as_ref() == Some(addr) {
                *entry = EncryptionEntry::empty();
                removed = true;
            }
        }
        removed
    }

    /// Purges expired mappings and disconnects silent clients
    ///
    /// Runs once per server tick. Timed-out clients are reset without any
    /// disconnect packets; their ids are returned for the caller to log or
    /// clean up after.
    pub fn check_timeouts(&mut self, server_time: f64) -> Vec<u64> {
        for (index, entry) in self.entries.iter_mut().enumerate() {
            if entry.address.is_some() && entry.expire_time <= server_time {
                debug!("Encryption mapping {} expired", index);
                *entry = EncryptionEntry::empty();
            }
        }

        let timed_out: Vec<usize> = self
            .instances
            .iter()
            .filter(|client| client.connected && client.is_timed_out(server_time))
            .map(|client| client.client_index)
            .collect();

        let mut client_ids = Vec::with_capacity(timed_out.len());
        for index in timed_out {
            client_ids.push(self.instances[index].client_id);
            info!("Client {} timed out", self.instances[index].client_id);
            self.disconnect_client(index, false, server_time);
        }
        client_ids
    }

    /// Promotes the handshake for `addr` into a connected slot
    ///
    /// Requires a live encryption mapping for `addr`, a free slot, and that
    /// neither the address nor the client id is already connected. The
    /// mapping's keys move into the slot and the mapping itself is released.
    pub fn connect_client(
        &mut self,
        addr: &SocketAddr,
        challenge_token: &ChallengeToken,
        server_time: f64,
    ) -> Option<usize> {
        if self.find_client_index_by_address(addr).is_some() {
            debug!("Address {} is already connected", addr);
            return None;
        }
        if self
            .find_client_index_by_id(challenge_token.client_id)
            .is_some()
        {
            debug!("Client id {} is already connected", challenge_token.client_id);
            return None;
        }

        let Some(entry_index) = self.find_encryption_entry_index(addr, server_time) else {
            debug!("No encryption mapping for {}", addr);
            return None;
        };
        let Some(client_index) = self.find_free_client_index() else {
            warn!("No free client slot for {}", addr);
            return None;
        };

        let entry = std::mem::replace(&mut self.entries[entry_index], EncryptionEntry::empty());

        let client = &mut self.instances[client_index];
        client.clear();
        client.client_id = challenge_token.client_id;
        client.address = Some(*addr);
        client.connected = true;
        client.send_key = entry.send_key;
        client.recv_key = entry.recv_key;
        // Start above everything already sealed with these keys
        client.sequence = entry.sequence.max(self.global_sequence);
        client.last_send_time = server_time;
        client.last_recv_time = server_time;
        client.timeout = entry.timeout;
        client.user_data = challenge_token.user_data.clone();

        info!(
            "Client {} connected from {} in slot {}",
            client.client_id, addr, client_index
        );
        Some(client_index)
    }

    /// Opens a sealed challenge token and connects its client
    ///
    /// A token that fails to open is discarded; the handshake is not retried
    /// with the same bytes.
    pub fn open_challenge_and_connect(
        &mut self,
        addr: &SocketAddr,
        sealed_token: &[u8],
        token_sequence: u64,
        challenge_key: &Key,
        server_time: f64,
    ) -> Option<usize> {
        match ChallengeToken::open(sealed_token, token_sequence, challenge_key) {
            Ok(token) => self.connect_client(addr, &token, server_time),
            Err(e) => {
                debug!("Rejecting challenge response from {}: {}", addr, e);
                None
            }
        }
    }

    /// Resets a connected slot
    ///
    /// With `send_disconnect_packets` the slot's address, key and next
    /// sequence are returned so the caller can announce the disconnect; the
    /// manager itself never transmits.
    pub fn disconnect_client(
        &mut self,
        index: usize,
        send_disconnect_packets: bool,
        server_time: f64,
    ) -> Option<DisconnectNotice> {
        let client = self.instances.get_mut(index)?;
        if !client.connected {
            return None;
        }

        let notice = if send_disconnect_packets {
            client.address.map(|address| DisconnectNotice {
                client_index: index,
                client_id: client.client_id,
                address,
                send_key: client.send_key,
                sequence: client.sequence,
            })
        } else {
            None
        };

        info!(
            "Client {} disconnected from slot {} at {:.3}",
            client.client_id, index, server_time
        );
        // Disconnect frames use the sequences right after the slot's last one
        let spent = client.sequence + NUM_DISCONNECT_PACKETS as u64;
        self.global_sequence = self.global_sequence.max(spent);
        client.clear();
        notice
    }

    pub fn disconnect_client_by_address(
        &mut self,
        addr: &SocketAddr,
        send_disconnect_packets: bool,
        server_time: f64,
    ) -> Option<DisconnectNotice> {
        let index = self.find_client_index_by_address(addr)?;
        self.disconnect_client(index, send_disconnect_packets, server_time)
    }
}

/// Tests follow the handshake bookkeeping end to end: mapping capacity and
/// idempotence, expiry and sweeping, promotion into slots, and disconnects.
#[cfg(test)]
mod tests {
    use super::*;
    use shared::crypto::generate_key;

    const TEST_CLIENT_ID: u64 = 0x1122334455667788;
    const TIMEOUT: f64 = 4.0;

    fn test_addr() -> SocketAddr {
        "[::1]:62424".parse().unwrap()
    }

    fn test_addr2() -> SocketAddr {
        "[::1]:62425".parse().unwrap()
    }

    fn test_token(client_id: u64) -> ConnectTokenPrivate {
        let servers = vec!["[::1]:40000".parse().unwrap()];
        ConnectTokenPrivate::generate(client_id, 5, servers, vec![1, 2, 3]).unwrap()
    }

    fn connect(manager: &mut ClientManager, addr: SocketAddr, client_id: u64) -> usize {
        assert!(manager.add_encryption_mapping(&test_token(client_id), &addr, 1.0, 1.1));
        manager
            .connect_client(&addr, &ChallengeToken::new(client_id, vec![]), 1.0)
            .unwrap()
    }

    #[test]
    fn test_new_client_manager() {
        let manager = ClientManager::new(TIMEOUT, 2);

        assert_eq!(manager.find_free_client_index(), Some(0));
        let empty: SocketAddr = "0.0.0.0:0".parse().unwrap();
        assert_eq!(manager.find_client_index_by_address(&empty), None);
        assert_eq!(manager.find_client_index_by_id(0), None);
        assert_eq!(manager.connected_client_count(), 0);
        assert_eq!(manager.max_clients(), 2);
    }

    #[test]
    fn test_add_encryption_mapping() {
        let mut manager = ClientManager::new(TIMEOUT, 2);
        let token = test_token(TEST_CLIENT_ID);
        let (server_time, expire_time) = (1.0, 1.1);

        assert!(manager.add_encryption_mapping(&token, &test_addr(), server_time, expire_time));
        // Re-adding the same address refreshes in place.
        assert!(manager.add_encryption_mapping(&token, &test_addr(), server_time, expire_time));
        assert!(manager.add_encryption_mapping(&token, &test_addr2(), server_time, expire_time));

        let over_addrs: Vec<SocketAddr> = (0..manager.max_clients() * 8)
            .map(|i| format!("[::1]:{}", 6000 + i).parse().unwrap())
            .collect();

        let mut failed = false;
        for addr in &over_addrs {
            if !manager.add_encryption_mapping(&token, addr, server_time, expire_time) {
                failed = true;
            }
        }
        assert!(failed, "added more encryption mappings than allowed");
    }

    #[test]
    fn test_full_table_rejects_every_new_address() {
        let max_clients = 4;
        let mut manager = ClientManager::new(TIMEOUT, max_clients);
        let token = test_token(TEST_CLIENT_ID);

        for i in 0..max_clients {
            let addr: SocketAddr = format!("127.0.0.1:{}", 7000 + i).parse().unwrap();
            assert!(manager.add_encryption_mapping(&token, &addr, 1.0, 2.0));
        }

        let extra: SocketAddr = "127.0.0.1:8000".parse().unwrap();
        assert!(!manager.add_encryption_mapping(&token, &extra, 1.0, 2.0));
        assert_eq!(manager.find_encryption_entry_index(&extra, 1.0), None);

        // Existing addresses can still be refreshed.
        let first: SocketAddr = "127.0.0.1:7000".parse().unwrap();
        assert!(manager.add_encryption_mapping(&token, &first, 1.5, 3.0));
        let index = manager.find_encryption_entry_index(&first, 1.5).unwrap();
        assert_eq!(manager.encryption_entry(index).unwrap().expire_time, 3.0);
    }

    #[test]
    fn test_refresh_replaces_keys() {
        let mut manager = ClientManager::new(TIMEOUT, 2);
        let first = test_token(TEST_CLIENT_ID);
        let second = test_token(TEST_CLIENT_ID);

        assert!(manager.add_encryption_mapping(&first, &test_addr(), 1.0, 2.0));
        assert!(manager.add_encryption_mapping(&second, &test_addr(), 1.0, 2.0));

        let index = manager.find_encryption_entry_index(&test_addr(), 1.0).unwrap();
        let entry = manager.encryption_entry(index).unwrap();
        assert_eq!(entry.recv_key, second.client_to_server_key);
        assert_eq!(entry.send_key, second.server_to_client_key);

        // Only one entry is in use, so a second address still fits.
        assert!(manager.add_encryption_mapping(&first, &test_addr2(), 1.0, 2.0));
    }

    #[test]
    fn test_add_encryption_mapping_timeout() {
        let mut manager = ClientManager::new(TIMEOUT, 2);
        let token = test_token(TEST_CLIENT_ID);
        let server_time = 1.0;

        assert!(manager.add_encryption_mapping(&token, &test_addr(), server_time, 1.1));

        let index = manager
            .find_encryption_entry_index(&test_addr(), server_time)
            .expect("encryption entry should exist");
        assert!(manager.set_encryption_entry_expiration(index, 0.1));

        manager.check_timeouts(server_time);
        assert_eq!(manager.find_encryption_entry_index(&test_addr(), server_time), None);
        assert!(manager.encryption_entry(index).is_none());
    }

    #[test]
    fn test_expired_entry_is_absent_before_sweep() {
        let mut manager = ClientManager::new(TIMEOUT, 1);
        let token = test_token(TEST_CLIENT_ID);

        assert!(manager.add_encryption_mapping(&token, &test_addr(), 1.0, 1.1));
        assert_eq!(manager.find_encryption_entry_index(&test_addr(), 1.2), None);
        // Still physically present until the sweep runs.
        assert!(manager.encryption_entry(0).is_some());

        // Its slot may be reused by a new address without a sweep.
        assert!(manager.add_encryption_mapping(&token, &test_addr2(), 1.2, 2.0));
        assert_eq!(manager.find_encryption_entry_index(&test_addr2(), 1.2), Some(0));

        manager.check_timeouts(2.0);
        assert!(manager.encryption_entry(0).is_none());
    }

    #[test]
    fn test_set_expiration_out_of_range() {
        let mut manager = ClientManager::new(TIMEOUT, 2);
        assert!(!manager.set_encryption_entry_expiration(0, 5.0));
        assert!(!manager.set_encryption_entry_expiration(10, 5.0));
    }

    #[test]
    fn test_entry_sequence_carries_into_slot() {
        let mut manager = ClientManager::new(TIMEOUT, 2);
        assert!(manager.add_encryption_mapping(&test_token(1), &test_addr(), 1.0, 1.1));
        let index = manager.find_encryption_entry_index(&test_addr(), 1.0).unwrap();

        assert_eq!(manager.next_entry_sequence(index), Some(0));
        assert_eq!(manager.next_entry_sequence(index), Some(1));
        assert_eq!(manager.next_entry_sequence(index + 1), None);

        let slot = manager
            .connect_client(&test_addr(), &ChallengeToken::new(1, vec![]), 1.0)
            .unwrap();
        assert_eq!(manager.client_mut(slot).unwrap().next_sequence(), 2);
    }

    #[test]
    fn test_remove_encryption_entry() {
        let mut manager = ClientManager::new(TIMEOUT, 2);
        assert!(manager.add_encryption_mapping(&test_token(1), &test_addr(), 1.0, 2.0));
        assert!(manager.remove_encryption_entry(&test_addr()));
        assert!(!manager.remove_encryption_entry(&test_addr()));
        assert_eq!(manager.find_encryption_entry_index(&test_addr(), 1.0), None);
    }

    #[test]
    fn test_disconnect_client() {
        let mut manager = ClientManager::new(TIMEOUT, 2);
        let server_time = 1.0;

        assert!(manager.add_encryption_mapping(
            &test_token(TEST_CLIENT_ID),
            &test_addr(),
            server_time,
            1.1
        ));

        let token = ChallengeToken::new(TEST_CLIENT_ID, vec![]);
        let connected = manager.connect_client(&test_addr(), &token, server_time);
        let client_index = manager
            .find_client_index_by_id(TEST_CLIENT_ID)
            .expect("client should be connected");
        assert_eq!(connected, Some(client_index));
        assert_eq!(manager.connected_client_count(), 1);

        manager.disconnect_client(client_index, false, server_time);
        assert!(!manager.client(client_index).unwrap().connected);
        assert_eq!(manager.connected_client_count(), 0);
    }

    #[test]
    fn test_connect_copies_mapping_into_slot() {
        let mut manager = ClientManager::new(TIMEOUT, 2);
        let private = test_token(TEST_CLIENT_ID);
        assert!(manager.add_encryption_mapping(&private, &test_addr(), 1.0, 1.1));

        let token = ChallengeToken::new(TEST_CLIENT_ID, vec![4, 5, 6]);
        let index = manager.connect_client(&test_addr(), &token, 1.0).unwrap();
        let client = manager.client(index).unwrap();

        assert!(client.connected);
        assert_eq!(client.address, Some(test_addr()));
        assert_eq!(client.send_key, private.server_to_client_key);
        assert_eq!(client.recv_key, private.client_to_server_key);
        assert_eq!(client.timeout, 5.0);
        assert_eq!(client.user_data, vec![4, 5, 6]);
        assert_eq!(manager.find_client_index_by_address(&test_addr()), Some(index));

        // Promotion supersedes the mapping.
        assert_eq!(manager.find_encryption_entry_index(&test_addr(), 1.0), None);
    }

    #[test]
    fn test_connect_requires_mapping() {
        let mut manager = ClientManager::new(TIMEOUT, 2);
        let token = ChallengeToken::new(TEST_CLIENT_ID, vec![]);
        assert_eq!(manager.connect_client(&test_addr(), &token, 1.0), None);
        assert_eq!(manager.connected_client_count(), 0);
    }

    #[test]
    fn test_connect_rejects_duplicate_id() {
        let mut manager = ClientManager::new(TIMEOUT, 2);
        connect(&mut manager, test_addr(), TEST_CLIENT_ID);

        assert!(manager.add_encryption_mapping(&test_token(TEST_CLIENT_ID), &test_addr2(), 1.0, 1.1));
        let token = ChallengeToken::new(TEST_CLIENT_ID, vec![]);
        assert_eq!(manager.connect_client(&test_addr2(), &token, 1.0), None);
        assert_eq!(manager.connected_client_count(), 1);
    }

    #[test]
    fn test_connect_fails_when_full() {
        let mut manager = ClientManager::new(TIMEOUT, 1);
        connect(&mut manager, test_addr(), 1);
        assert_eq!(manager.find_free_client_index(), None);

        assert!(manager.add_encryption_mapping(&test_token(2), &test_addr2(), 1.0, 1.1));
        let token = ChallengeToken::new(2, vec![]);
        assert_eq!(manager.connect_client(&test_addr2(), &token, 1.0), None);
    }

    #[test]
    fn test_open_challenge_and_connect() {
        let mut manager = ClientManager::new(TIMEOUT, 2);
        let challenge_key = generate_key();
        assert!(manager.add_encryption_mapping(&test_token(7), &test_addr(), 1.0, 1.1));

        let sealed = ChallengeToken::new(7, vec![]).seal(11, &challenge_key).unwrap();

        assert_eq!(
            manager.open_challenge_and_connect(&test_addr(), &sealed, 12, &challenge_key, 1.0),
            None
        );
        assert_eq!(
            manager.open_challenge_and_connect(&test_addr(), &sealed, 11, &generate_key(), 1.0),
            None
        );

        let index = manager
            .open_challenge_and_connect(&test_addr(), &sealed, 11, &challenge_key, 1.0)
            .unwrap();
        assert_eq!(manager.client(index).unwrap().client_id, 7);
    }

    #[test]
    fn test_check_timeouts_disconnects_idle_clients() {
        let mut manager = ClientManager::new(TIMEOUT, 2);
        let index = connect(&mut manager, test_addr(), TEST_CLIENT_ID);

        assert!(manager.check_timeouts(5.0).is_empty());
        assert_eq!(manager.connected_client_count(), 1);

        // Last receive at 1.0 with a five second timeout.
        let timed_out = manager.check_timeouts(6.5);
        assert_eq!(timed_out, vec![TEST_CLIENT_ID]);
        assert!(!manager.client(index).unwrap().connected);
    }

    #[test]
    fn test_disconnect_notice() {
        let mut manager = ClientManager::new(TIMEOUT, 2);
        let index = connect(&mut manager, test_addr(), TEST_CLIENT_ID);
        let send_key = manager.client(index).unwrap().send_key;

        let notice = manager.disconnect_client(index, true, 2.0).unwrap();
        assert_eq!(notice.address, test_addr());
        assert_eq!(notice.client_id, TEST_CLIENT_ID);
        assert_eq!(notice.send_key, send_key);

        // The slot is already reset; a second disconnect is a no-op.
        assert!(manager.disconnect_client(index, true, 2.0).is_none());
        assert!(manager.disconnect_client(99, true, 2.0).is_none());
    }

    #[test]
    fn test_disconnect_by_address() {
        let mut manager = ClientManager::new(TIMEOUT, 2);
        connect(&mut manager, test_addr(), TEST_CLIENT_ID);

        assert!(manager
            .disconnect_client_by_address(&test_addr2(), false, 2.0)
            .is_none());
        assert_eq!(manager.connected_client_count(), 1);

        manager.disconnect_client_by_address(&test_addr(), false, 2.0);
        assert_eq!(manager.connected_client_count(), 0);
        assert_eq!(manager.find_free_client_index(), Some(0));
    }

    #[test]
    fn test_sequences_never_restart_for_a_token() {
        let mut manager = ClientManager::new(TIMEOUT, 2);
        let token = test_token(TEST_CLIENT_ID);

        assert!(manager.add_encryption_mapping(&token, &test_addr(), 1.0, 1.1));
        let index = manager.find_encryption_entry_index(&test_addr(), 1.0).unwrap();
        let first = manager.next_entry_sequence(index).unwrap();

        // The mapping lapses and the same token comes back.
        manager.check_timeouts(2.0);
        assert!(manager.add_encryption_mapping(&token, &test_addr(), 2.0, 3.0));
        let index = manager.find_encryption_entry_index(&test_addr(), 2.0).unwrap();
        let second = manager.next_entry_sequence(index).unwrap();
        assert!(second > first);

        let slot = manager
            .connect_client(&test_addr(), &ChallengeToken::new(TEST_CLIENT_ID, vec![]), 2.0)
            .unwrap();
        let client = manager.client_mut(slot).unwrap();
        assert!(client.sequence > second);
        for _ in 0..5 {
            client.next_sequence();
        }
        let last_used = client.sequence - 1;

        let notice = manager.disconnect_client(slot, true, 2.5).unwrap();
        assert_eq!(notice.sequence, last_used + 1);
        let last_disconnect = notice.sequence + NUM_DISCONNECT_PACKETS as u64 - 1;

        // A fresh handshake with the same keys starts past the disconnect frames.
        assert!(manager.add_encryption_mapping(&token, &test_addr(), 3.0, 4.0));
        let index = manager.find_encryption_entry_index(&test_addr(), 3.0).unwrap();
        let third = manager.next_entry_sequence(index).unwrap();
        assert!(third > last_disconnect);
        assert!(manager.global_sequence() > third);
    }

    #[test]
    fn test_token_entry_binds_first_address() {
        let mut manager = ClientManager::new(TIMEOUT, 2);
        let mac = [7; MAC_BYTES];

        assert!(manager.find_or_add_token_entry(&mac, &test_addr(), 1.0));
        assert!(manager.find_or_add_token_entry(&mac, &test_addr(), 1.5));
        assert!(!manager.find_or_add_token_entry(&mac, &test_addr2(), 2.0));

        assert!(manager.find_or_add_token_entry(&[8; MAC_BYTES], &test_addr2(), 2.0));
    }

    #[test]
    fn test_token_entries_evict_oldest() {
        let mut manager = ClientManager::new(TIMEOUT, 1);
        let owner: SocketAddr = "127.0.0.1:9000".parse().unwrap();

        for i in 0..CONNECT_TOKEN_ENTRIES_PER_CLIENT {
            assert!(manager.find_or_add_token_entry(&[i as u8; MAC_BYTES], &owner, i as f64));
        }
        // Table is full; the next token pushes out the one seen first.
        assert!(manager.find_or_add_token_entry(&[0xEE; MAC_BYTES], &owner, 100.0));

        assert!(!manager.find_or_add_token_entry(&[1; MAC_BYTES], &test_addr(), 101.0));
        assert!(manager.find_or_add_token_entry(&[0; MAC_BYTES], &test_addr(), 101.0));
    }
}
