//! Client connection states

use std::fmt;

/// Where a client is in its connection lifecycle
///
/// The discriminants match the numeric codes the protocol reports: negative
/// values are failures, zero is a clean disconnect and positive values are
/// live states. Every state at or below zero is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i8)]
pub enum ClientState {
    ConnectTokenExpired = -6,
    InvalidConnectToken = -5,
    ConnectionTimedOut = -4,
    ConnectionResponseTimedOut = -3,
    ConnectionRequestTimedOut = -2,
    ConnectionDenied = -1,
    Disconnected = 0,
    SendingConnectionRequest = 1,
    SendingChallengeResponse = 2,
    Connected = 3,
}

impl ClientState {
    pub fn code(self) -> i8 {
        self as i8
    }

    pub fn is_error(self) -> bool {
        self.code() < 0
    }

    /// Terminal states are never left
    pub fn is_terminal(self) -> bool {
        self.code() <= 0
    }

    pub fn is_connecting(self) -> bool {
        matches!(
            self,
            ClientState::SendingConnectionRequest | ClientState::SendingChallengeResponse
        )
    }
}

impl fmt::Display for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ClientState::ConnectTokenExpired => "connect token expired",
            ClientState::InvalidConnectToken => "invalid connect token",
            ClientState::ConnectionTimedOut => "connection timed out",
            ClientState::ConnectionResponseTimedOut => "connection response timed out",
            ClientState::ConnectionRequestTimedOut => "connection request timed out",
            ClientState::ConnectionDenied => "connection denied",
            ClientState::Disconnected => "disconnected",
            ClientState::SendingConnectionRequest => "sending connection request",
            ClientState::SendingChallengeResponse => "sending challenge response",
            ClientState::Connected => "connected",
        };
        f.write_str(name)
    }
}
