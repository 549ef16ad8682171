//! Rendering events for the terminal.

use twirc_sdk::event::Event;

/// One line per event as JSON, for piping into other tools.
pub fn json(event: &Event) -> serde_json::Result<String> {
    serde_json::to_string(event)
}

/// Human-readable rendering. `None` for events not worth a line.
pub fn text(event: &Event) -> Option<String> {
    let line = match event {
        Event::Connected { address } => format!("-!- Connected to {address}"),
        Event::Registered { nick } => format!("-!- Logged in as {nick}"),
        Event::ChannelMessage {
            channel, nick, text, ..
        } => format!("[{channel}] <{nick}> {text}"),
        Event::ChannelAction {
            channel, nick, text, ..
        } => format!("[{channel}] * {nick} {text}"),
        Event::QueryMessage { nick, text, .. } => format!("*{nick}* {text}"),
        Event::Notice {
            target, nick, text, ..
        } => {
            let from = if nick.is_empty() { "server" } else { nick.as_str() };
            format!("-{from}:{target}- {text}")
        }
        Event::Joined { channel, nick, .. } => format!("[{channel}] -> {nick} joined"),
        Event::Parted {
            channel, nick, message, ..
        } => {
            if message.is_empty() {
                format!("[{channel}] <- {nick} left")
            } else {
                format!("[{channel}] <- {nick} left ({message})")
            }
        }
        Event::ModeChanged {
            channel,
            nick,
            added,
            mode,
            ..
        } => format!("[{channel}] mode {}{mode} {nick}", if *added { '+' } else { '-' }),
        Event::Userlist { channel, nicks } => format!("[{channel}] users: {}", nicks.join(" ")),
        Event::SystemMessage { text } => format!("-!- {text}"),
        Event::Parsed(_) => return None,
        Event::Disconnected { message, .. } => format!("-!- {message}"),
    };
    Some(line)
}
