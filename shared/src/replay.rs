//! Sliding-window replay protection for encrypted session traffic.

use crate::REPLAY_PROTECTION_BUFFER_SIZE;

const EMPTY: u64 = u64::MAX;

/// Tracks which of the most recent sequence numbers have been accepted
///
/// The window is anchored at the highest sequence seen. Anything that falls
/// behind the window is rejected outright, anything inside it is rejected if
/// it was already accepted. Connection requests and challenge responses do
/// not go through this window.
#[derive(Debug, Clone)]
pub struct ReplayProtection {
    most_recent_sequence: u64,
    received: [u64; REPLAY_PROTECTION_BUFFER_SIZE],
}

impl ReplayProtection {
    pub fn new() -> Self {
        Self {
            most_recent_sequence: 0,
            received: [EMPTY; REPLAY_PROTECTION_BUFFER_SIZE],
        }
    }

    /// Clears all history, used when a slot is recycled
    pub fn reset(&mut self) {
        self.most_recent_sequence = 0;
        self.received = [EMPTY; REPLAY_PROTECTION_BUFFER_SIZE];
    }

    pub fn most_recent_sequence(&self) -> u64 {
        self.most_recent_sequence
    }

    /// Returns true if `sequence` is stale or a duplicate, without recording it
    pub fn already_received(&self, sequence: u64) -> bool {
        let window = REPLAY_PROTECTION_BUFFER_SIZE as u64;

        if sequence.saturating_add(window) <= self.most_recent_sequence {
            return true;
        }

        let entry = self.received[Self::slot(sequence)];
        entry != EMPTY && entry >= sequence
    }

    /// Accepts `sequence` if it is neither stale nor a duplicate
    ///
    /// On success the sequence is recorded and the window advances when it is
    /// the highest seen so far.
    pub fn accept(&mut self, sequence: u64) -> bool {
        if sequence == EMPTY || self.already_received(sequence) {
            return false;
        }

        if sequence > self.most_recent_sequence {
            self.most_recent_sequence = sequence;
        }
        self.received[Self::slot(sequence)] = sequence;
        true
    }

    fn slot(sequence: u64) -> usize {
        (sequence % REPLAY_PROTECTION_BUFFER_SIZE as u64) as usize
    }
}

impl Default for ReplayProtection {
    fn default() -> Self {
        Self::new()
    }
}
