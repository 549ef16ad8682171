//! Parsing of lines typed on stdin.
//!
//!   /join <channel>        Join and make it the current channel
//!   /part [channel]        Leave (default: current channel)
//!   /me <text>             Action in the current channel
//!   /msg <target> <text>   Message to a channel or user
//!   /raw <line>            Send a raw protocol line
//!   /reconnect             Reconnect now
//!   /info                  Connection status and traffic
//!   /quit                  Disconnect and exit
//!   anything else          Message to the current channel

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    Join(String),
    Part(Option<String>),
    Action(String),
    Message { target: String, text: String },
    Say(String),
    Raw(String),
    Reconnect,
    Info,
    Quit,
    Unknown(String),
    Empty,
}

pub fn parse(line: &str) -> Input {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.trim().is_empty() {
        return Input::Empty;
    }
    let Some(command) = line.strip_prefix('/') else {
        return Input::Say(line.to_string());
    };
    let (name, rest) = match command.split_once(' ') {
        Some((name, rest)) => (name, rest.trim()),
        None => (command, ""),
    };
    match name.to_ascii_lowercase().as_str() {
        "join" | "j" if !rest.is_empty() => Input::Join(rest.to_string()),
        "part" | "leave" => Input::Part(Some(rest).filter(|r| !r.is_empty()).map(str::to_string)),
        "me" if !rest.is_empty() => Input::Action(rest.to_string()),
        "msg" => match rest.split_once(' ') {
            Some((target, text)) if !text.trim().is_empty() => Input::Message {
                target: target.to_string(),
                text: text.trim().to_string(),
            },
            _ => Input::Unknown(line.to_string()),
        },
        "raw" | "quote" if !rest.is_empty() => Input::Raw(rest.to_string()),
        "reconnect" => Input::Reconnect,
        "info" => Input::Info,
        "quit" | "exit" => Input::Quit,
        _ => Input::Unknown(line.to_string()),
    }
}
