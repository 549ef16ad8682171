//! Configuration for the twirc CLI.
//!
//! Config file lives at `~/.config/twirc/config.toml` unless `--config` is
//! given. The `[server]` table names what to connect to; the `[engine]` table
//! is passed to the SDK as-is.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use twirc_sdk::config::EngineConfig;

pub const DEFAULT_HOST: &str = "irc.chat.twitch.tv";
pub const DEFAULT_PORTS: &str = "6667,80";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub engine: EngineConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Comma-separated host list.
    pub host: Option<String>,
    /// Comma-separated port list.
    pub ports: Option<String>,
    pub nick: Option<String>,
    /// Channels to join after registration.
    pub channels: Option<Vec<String>>,
}

pub fn default_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("twirc")
        .join("config.toml")
}

impl Config {
    /// Load from `path` (or the default location). A missing file gives the
    /// defaults; an unreadable or invalid one is reported and ignored.
    pub fn load(path: Option<&Path>) -> Self {
        let path = path.map(Path::to_path_buf).unwrap_or_else(default_path);
        if path.exists() {
            match std::fs::read_to_string(&path) {
                Ok(s) => match toml::from_str(&s) {
                    Ok(c) => return c,
                    Err(e) => tracing::warn!(path = %path.display(), error = %e, "Bad config file"),
                },
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "Can't read config file"),
            }
        }
        Self::default()
    }
}

/// Effective connection settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolved {
    pub host: String,
    pub ports: String,
    pub nick: String,
    pub token: Option<String>,
    pub channels: Vec<String>,
}

impl Resolved {
    /// Merge: CLI overrides > config file > defaults.
    pub fn merge(cli: &super::Args, config: &Config) -> Self {
        let server = &config.server;
        let host = cli
            .server
            .clone()
            .or_else(|| server.host.clone())
            .unwrap_or_else(|| DEFAULT_HOST.to_string());
        let ports = cli
            .ports
            .clone()
            .or_else(|| server.ports.clone())
            .unwrap_or_else(|| DEFAULT_PORTS.to_string());

        // Without a token the server only accepts the anonymous justinfan nicks.
        let nick = cli
            .nick
            .clone()
            .or_else(|| server.nick.clone())
            .unwrap_or_else(|| format!("justinfan{}", std::process::id() % 100_000));

        let channels = if let Some(ref ch) = cli.channels {
            ch.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        } else {
            server.channels.clone().unwrap_or_default()
        };

        Self {
            host,
            ports,
            nick,
            token: cli.token.clone().filter(|t| !t.is_empty()),
            channels,
        }
    }
}
