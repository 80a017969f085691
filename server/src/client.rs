use shared::{Key, ReplayProtection};
use std::collections::VecDeque;
use std::net::SocketAddr;

/// Payloads a slot buffers before the oldest is dropped
pub const MAX_QUEUED_PAYLOADS: usize = 256;

// One connected-client slot in the server's fixed table
#[derive(Debug, Clone)]
pub struct ClientInstance {
    pub client_index: usize,
    pub client_id: u64,
    pub address: Option<SocketAddr>,
    pub connected: bool,
    // Set once the client proves it holds the keys by sending a keep-alive or payload
    pub confirmed: bool,
    pub send_key: Key,
    pub recv_key: Key,
    pub sequence: u64,
    pub last_send_time: f64,
    pub last_recv_time: f64,
    pub timeout: f64,
    pub replay_protection: ReplayProtection,
    pub user_data: Vec<u8>,
    pub payloads: VecDeque<(Vec<u8>, u64)>,
}

impl ClientInstance {
    pub fn new(client_index: usize) -> Self {
        ClientInstance {
            client_index,
            client_id: 0,
            address: None,
            connected: false,
            confirmed: false,
            send_key: [0; shared::KEY_BYTES],
            recv_key: [0; shared::KEY_BYTES],
            sequence: 0,
            last_send_time: 0.0,
            last_recv_time: 0.0,
            timeout: 0.0,
            replay_protection: ReplayProtection::new(),
            user_data: Vec::new(),
            payloads: VecDeque::new(),
        }
    }

    // Return the slot to its empty state, keeping only the index
    pub fn clear(&mut self) {
        *self = ClientInstance::new(self.client_index);
    }

    // Sequence for the next outbound frame
    pub fn next_sequence(&mut self) -> u64 {
        let sequence = self.sequence;
        self.sequence += 1;
        sequence
    }

    // A negative timeout means the session never times out
    pub fn is_timed_out(&self, server_time: f64) -> bool {
        self.timeout >= 0.0 && self.last_recv_time + self.timeout < server_time
    }

    pub fn queue_payload(&mut self, payload: Vec<u8>, sequence: u64) {
        if self.payloads.len() >= MAX_QUEUED_PAYLOADS {
            self.payloads.pop_front();
        }
        self.payloads.push_back((payload, sequence));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_slot_is_empty() {
        let slot = ClientInstance::new(3);
        assert_eq!(slot.client_index, 3);
        assert!(!slot.connected);
        assert!(slot.address.is_none());
        assert!(slot.payloads.is_empty());
    }

    #[test]
    fn test_clear_keeps_index() {
        let mut slot = ClientInstance::new(1);
        slot.connected = true;
        slot.client_id = 99;
        slot.address = Some("127.0.0.1:5000".parse().unwrap());
        slot.queue_payload(vec![1], 0);

        slot.clear();
        assert_eq!(slot.client_index, 1);
        assert_eq!(slot.client_id, 0);
        assert!(!slot.connected);
        assert!(slot.address.is_none());
        assert!(slot.payloads.is_empty());
    }

    #[test]
    fn test_timeout() {
        let mut slot = ClientInstance::new(0);
        slot.timeout = 5.0;
        slot.last_recv_time = 10.0;
        assert!(!slot.is_timed_out(15.0));
        assert!(slot.is_timed_out(15.1));

        slot.timeout = -1.0;
        assert!(!slot.is_timed_out(1_000.0));
    }

    #[test]
    fn test_sequence_and_queue_bound() {
        let mut slot = ClientInstance::new(0);
        assert_eq!(slot.next_sequence(), 0);
        assert_eq!(slot.next_sequence(), 1);

        for i in 0..(MAX_QUEUED_PAYLOADS + 4) {
            slot.queue_payload(vec![0], i as u64);
        }
        assert_eq!(slot.payloads.len(), MAX_QUEUED_PAYLOADS);
        assert_eq!(slot.payloads.front().unwrap().1, 4);
    }
}
