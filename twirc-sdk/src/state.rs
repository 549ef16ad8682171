//! Connection lifecycle state and disconnect classification.

use std::fmt;

use serde::Serialize;

/// Where the engine is in the connection lifecycle.
///
/// Ordered: `Reconnecting < Offline < Connecting < Connected < Registered`.
/// `Reconnecting` sits below `Offline` because it only exists while a retry
/// timer is pending and no socket is alive.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(i8)]
pub enum ConnectionState {
    Reconnecting = -1,
    #[default]
    Offline = 0,
    Connecting = 1,
    Connected = 2,
    Registered = 3,
}

impl ConnectionState {
    pub fn rank(self) -> i8 {
        self as i8
    }

    /// Whether moving from `self` to `next` is a legal transition.
    ///
    /// Forward moves follow `Offline → Connecting → Connected → Registered`
    /// (a pending retry may also start connecting). Backward moves are only
    /// the drop to `Offline` and `Offline → Reconnecting`.
    pub fn can_become(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        match (self, next) {
            (a, b) if a == b => true,
            (_, Offline) => true,
            (Offline, Reconnecting) => true,
            (Offline | Reconnecting, Connecting) => true,
            (Connecting, Connected) => true,
            (Connected, Registered) => true,
            _ => false,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Offline => "offline",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Registered => "registered",
        };
        f.write_str(s)
    }
}

/// Why a connection ended. Produced exactly once per disconnect.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum DisconnectReason {
    UnknownHost,
    SocketTimeout,
    SocketError(String),
    RequestedDisconnect,
    ConnectionClosed,
    /// The server closed the connection before sending the welcome numeric.
    RegistrationFailed,
    RequestedReconnect,
}

impl DisconnectReason {
    /// True for disconnects the consumer asked for.
    pub fn is_requested(&self) -> bool {
        matches!(
            self,
            DisconnectReason::RequestedDisconnect | DisconnectReason::RequestedReconnect
        )
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::UnknownHost => f.write_str("Unknown host"),
            DisconnectReason::SocketTimeout => f.write_str("Connection timed out"),
            DisconnectReason::SocketError(msg) => write!(f, "Socket error: {msg}"),
            DisconnectReason::RequestedDisconnect => f.write_str("Disconnected"),
            DisconnectReason::ConnectionClosed => f.write_str("Connection closed"),
            DisconnectReason::RegistrationFailed => {
                f.write_str("Connection closed before registration (login may have been rejected)")
            }
            DisconnectReason::RequestedReconnect => f.write_str("Reconnecting"),
        }
    }
}
