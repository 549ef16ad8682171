//! Events emitted by the client for the consumer to handle.

use std::collections::HashMap;

use serde::Serialize;

use crate::irc::ParsedMessage;
use crate::state::DisconnectReason;

/// Events delivered to the consumer (UI, bot, logger) in the order the
/// corresponding lines were received.
///
/// Serialized with `#[serde(tag = "type", content = "data")]` so consumers can
/// forward them as JSON and switch on `type`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Event {
    /// TCP connection established; registration has been sent.
    Connected { address: String },

    /// The server accepted the session (numeric 004).
    Registered { nick: String },

    /// A message in a channel.
    ChannelMessage {
        channel: String,
        nick: String,
        prefix: String,
        text: String,
        tags: HashMap<String, String>,
    },

    /// A `/me` action in a channel.
    ChannelAction {
        channel: String,
        nick: String,
        prefix: String,
        text: String,
        tags: HashMap<String, String>,
    },

    /// A private message addressed to us.
    QueryMessage {
        nick: String,
        prefix: String,
        text: String,
        tags: HashMap<String, String>,
    },

    /// A NOTICE. Channel-targeted notices only arrive when
    /// `EngineConfig::channel_notices` is set.
    Notice {
        target: String,
        nick: String,
        prefix: String,
        text: String,
    },

    Joined {
        channel: String,
        nick: String,
        prefix: String,
    },

    Parted {
        channel: String,
        nick: String,
        prefix: String,
        message: String,
    },

    /// A single-flag user mode change, e.g. `MODE #chan +o nick`.
    ModeChanged {
        channel: String,
        nick: String,
        added: bool,
        mode: char,
        prefix: String,
    },

    /// One NAMES reply (353) for a channel.
    Userlist { channel: String, nicks: Vec<String> },

    /// Status text from the engine itself (connecting, retry scheduled, ...).
    SystemMessage { text: String },

    /// Every parsed line, when `EngineConfig::emit_parsed` is set.
    Parsed(ParsedMessage),

    /// The connection ended. Emitted exactly once per connection attempt.
    Disconnected {
        reason: DisconnectReason,
        message: String,
    },
}
