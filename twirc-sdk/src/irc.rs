//! IRC line parsing.
//!
//! Lines have the shape `[@tags ][:prefix ]command[ param]*[ :trailing]`.
//! Parsing follows the classic client algorithm: the trailing part starts at
//! the first `:` after the prefix, everything before it is split on spaces.

use std::collections::HashMap;
use std::fmt;

use serde::Serialize;

/// A parsed IRC line. Built once per received line and never mutated.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ParsedMessage {
    /// IRCv3 message tags (empty if none).
    pub tags: HashMap<String, String>,
    /// `nick!user@host` or server name; empty when the line has no prefix.
    pub prefix: String,
    pub command: String,
    pub params: Vec<String>,
    /// Text after the trailing `:`; empty when absent.
    pub trailing: String,
    /// Whether the line had a trailing `:`, so an empty trailing is kept when
    /// the message is written back.
    #[serde(skip)]
    pub has_trailing: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("empty line")]
    Empty,
    #[error("tag section not followed by a space")]
    UnterminatedTags,
    #[error("prefix not followed by a space")]
    UnterminatedPrefix,
    #[error("no command")]
    MissingCommand,
}

impl ParsedMessage {
    pub fn parse(line: &str) -> Result<Self, ParseError> {
        let line = line.trim_end_matches(['\r', '\n']);
        if line.is_empty() {
            return Err(ParseError::Empty);
        }

        let (tags, line) = match line.strip_prefix('@') {
            Some(rest) => {
                let (raw, rest) = rest.split_once(' ').ok_or(ParseError::UnterminatedTags)?;
                (parse_tags(raw), rest.trim_start_matches(' '))
            }
            None => (HashMap::new(), line),
        };

        let (prefix, prefix_end) = match line.strip_prefix(':') {
            Some(rest) => {
                let space = rest.find(' ').ok_or(ParseError::UnterminatedPrefix)?;
                (&rest[..space], space + 1)
            }
            None => ("", 0),
        };

        let rest = &line[prefix_end..];
        let (middle, trailing, has_trailing) = match rest.find(':') {
            Some(i) => (&rest[..i], &rest[i + 1..], true),
            None => (rest, "", false),
        };

        let mut tokens = middle.trim().split(' ').filter(|t| !t.is_empty());
        let command = tokens.next().ok_or(ParseError::MissingCommand)?.to_string();
        let params = tokens.map(str::to_string).collect();

        Ok(Self {
            tags,
            prefix: prefix.to_string(),
            command,
            params,
            trailing: trailing.to_string(),
            has_trailing,
        })
    }

    /// Nick of the sender, taken from the prefix.
    pub fn nick(&self) -> &str {
        nick_from_prefix(&self.prefix)
    }

    pub fn param(&self, index: usize) -> Option<&str> {
        self.params.get(index).map(String::as_str)
    }

    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(String::as_str)
    }
}

/// Writes the wire form. Parsed messages round-trip; a hand-built one whose
/// middle param contains `:` or a space does not, since the parser ends the
/// middle params at the first `:`.
impl fmt::Display for ParsedMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.tags.is_empty() {
            let mut tags: Vec<_> = self.tags.iter().collect();
            tags.sort();
            f.write_str("@")?;
            for (i, (key, value)) in tags.into_iter().enumerate() {
                if i > 0 {
                    f.write_str(";")?;
                }
                if value.is_empty() {
                    write!(f, "{key}")?;
                } else {
                    write!(f, "{key}={}", escape_tag_value(value))?;
                }
            }
            f.write_str(" ")?;
        }
        if !self.prefix.is_empty() {
            write!(f, ":{} ", self.prefix)?;
        }
        f.write_str(&self.command)?;
        for param in &self.params {
            write!(f, " {param}")?;
        }
        if self.has_trailing || !self.trailing.is_empty() {
            write!(f, " :{}", self.trailing)?;
        }
        Ok(())
    }
}

/// The part of `prefix` before the first `!`, or the whole prefix.
pub fn nick_from_prefix(prefix: &str) -> &str {
    match prefix.find('!') {
        Some(i) => &prefix[..i],
        None => prefix,
    }
}

/// Text of a CTCP ACTION (`\x01ACTION text\x01`), if `trailing` is one.
pub fn action_text(trailing: &str) -> Option<&str> {
    let rest = trailing.strip_prefix("\u{1}ACTION")?;
    let rest = rest.strip_prefix(' ').unwrap_or(rest);
    Some(rest.strip_suffix('\u{1}').unwrap_or(rest))
}

/// Normalize a channel name to carry a leading `#`.
pub fn channel_name(name: &str) -> String {
    let name = name.trim();
    if name.starts_with('#') {
        name.to_string()
    } else {
        format!("#{name}")
    }
}

fn parse_tags(raw: &str) -> HashMap<String, String> {
    raw.split(';')
        .filter(|t| !t.is_empty())
        .map(|tag| match tag.split_once('=') {
            Some((key, value)) => (key.to_string(), unescape_tag_value(value)),
            None => (tag.to_string(), String::new()),
        })
        .collect()
}

fn unescape_tag_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some(':') => out.push(';'),
            Some('s') => out.push(' '),
            Some('r') => out.push('\r'),
            Some('n') => out.push('\n'),
            Some(other) => out.push(other),
            None => {}
        }
    }
    out
}

fn escape_tag_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            ';' => out.push_str("\\:"),
            ' ' => out.push_str("\\s"),
            '\\' => out.push_str("\\\\"),
            '\r' => out.push_str("\\r"),
            '\n' => out.push_str("\\n"),
            c => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_privmsg_with_prefix() {
        let msg = ParsedMessage::parse(":nick!user@host PRIVMSG #chan :hello").unwrap();
        assert_eq!(msg.prefix, "nick!user@host");
        assert_eq!(msg.command, "PRIVMSG");
        assert_eq!(msg.params, vec!["#chan"]);
        assert_eq!(msg.trailing, "hello");
        assert_eq!(msg.nick(), "nick");
    }

    #[test]
    fn parse_without_prefix() {
        let msg = ParsedMessage::parse("PING :tmi.twitch.tv\r\n").unwrap();
        assert_eq!(msg.prefix, "");
        assert_eq!(msg.command, "PING");
        assert!(msg.params.is_empty());
        assert_eq!(msg.trailing, "tmi.twitch.tv");
    }

    #[test]
    fn trailing_keeps_spaces_and_colons() {
        let msg = ParsedMessage::parse(":a!a@a PRIVMSG #c :see: http://x y").unwrap();
        assert_eq!(msg.trailing, "see: http://x y");
    }

    #[test]
    fn no_trailing_means_empty() {
        let msg = ParsedMessage::parse(":tmi MODE #chan +o someone").unwrap();
        assert_eq!(msg.command, "MODE");
        assert_eq!(msg.params, vec!["#chan", "+o", "someone"]);
        assert_eq!(msg.trailing, "");
    }

    #[test]
    fn numeric_with_params() {
        let msg = ParsedMessage::parse(":tmi.twitch.tv 353 me = #chan :a b c").unwrap();
        assert_eq!(msg.command, "353");
        assert_eq!(msg.params, vec!["me", "=", "#chan"]);
        assert_eq!(msg.trailing, "a b c");
        // No '!' in the prefix: the whole prefix is the nick.
        assert_eq!(msg.nick(), "tmi.twitch.tv");
    }

    #[test]
    fn repeated_spaces_do_not_produce_empty_params() {
        let msg = ParsedMessage::parse(":x  JOIN   #chan").unwrap();
        assert_eq!(msg.command, "JOIN");
        assert_eq!(msg.params, vec!["#chan"]);
    }

    #[test]
    fn malformed_lines_are_rejected() {
        assert_eq!(ParsedMessage::parse(""), Err(ParseError::Empty));
        assert_eq!(ParsedMessage::parse("\r\n"), Err(ParseError::Empty));
        assert_eq!(ParsedMessage::parse(":prefixonly"), Err(ParseError::UnterminatedPrefix));
        assert_eq!(ParsedMessage::parse(":prefix :text"), Err(ParseError::MissingCommand));
        assert_eq!(ParsedMessage::parse("@a=b"), Err(ParseError::UnterminatedTags));
    }

    #[test]
    fn tags_are_split_off_and_unescaped() {
        let line = "@badges=moderator/1;display-name=Some\\sOne;emotes= :u!u@u PRIVMSG #c :hi";
        let msg = ParsedMessage::parse(line).unwrap();
        assert_eq!(msg.tag("badges"), Some("moderator/1"));
        assert_eq!(msg.tag("display-name"), Some("Some One"));
        assert_eq!(msg.tag("emotes"), Some(""));
        assert_eq!(msg.prefix, "u!u@u");
        assert_eq!(msg.trailing, "hi");
    }

    #[test]
    fn display_matches_wire_format() {
        let msg = ParsedMessage::parse(":nick!u@h PRIVMSG #chan :hello there").unwrap();
        assert_eq!(msg.to_string(), ":nick!u@h PRIVMSG #chan :hello there");

        let msg = ParsedMessage::parse("@k=a\\sb :p CMD x").unwrap();
        assert_eq!(msg.to_string(), "@k=a\\sb :p CMD x");
    }

    #[test]
    fn join_command_reparses() {
        // What the client writes for `send_command("JOIN", "#test")`.
        let msg = ParsedMessage::parse("JOIN #test").unwrap();
        assert_eq!(msg.command, "JOIN");
        assert_eq!(msg.params, vec!["#test"]);
        assert_eq!(ParsedMessage::parse(&msg.to_string()).unwrap(), msg);
    }

    #[test]
    fn empty_trailing_is_kept() {
        let msg = ParsedMessage::parse("PRIVMSG #c :").unwrap();
        assert_eq!(msg.trailing, "");
        assert!(msg.has_trailing);
        assert_eq!(msg.to_string(), "PRIVMSG #c :");
        assert_eq!(ParsedMessage::parse(&msg.to_string()).unwrap(), msg);

        let msg = ParsedMessage::parse("JOIN #c").unwrap();
        assert!(!msg.has_trailing);
        assert_eq!(msg.to_string(), "JOIN #c");
    }

    #[test]
    fn action_detection() {
        assert_eq!(action_text("\u{1}ACTION waves\u{1}"), Some("waves"));
        assert_eq!(action_text("\u{1}ACTION waves"), Some("waves"));
        assert_eq!(action_text("ACTION waves"), None);
        assert_eq!(action_text("hello"), None);
    }

    #[test]
    fn channel_names_get_a_hash() {
        assert_eq!(channel_name("test"), "#test");
        assert_eq!(channel_name("#test"), "#test");
        assert_eq!(channel_name(" test "), "#test");
    }
}
