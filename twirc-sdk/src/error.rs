//! Errors reported synchronously to the caller.
//!
//! Transport and resolution failures are not errors in this sense: they end
//! the connection attempt and arrive as [`crate::event::Event::Disconnected`].

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("already connected or connecting")]
    AlreadyConnected,
    #[error("no server address configured")]
    NoAddress,
    #[error("invalid port list {0:?}")]
    InvalidPorts(String),
    #[error("a reconnect attempt is already pending")]
    ReconnectPending,
    #[error("gave up reconnecting after {attempts} attempts")]
    AttemptsExhausted { attempts: u32 },
    #[error("no previous connection to reconnect with")]
    NoSession,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
