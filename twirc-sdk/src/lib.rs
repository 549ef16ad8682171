//! Client engine for Twitch-style IRC chat.
//!
//! Maintains a single live connection to a line-oriented IRC server, parses
//! incoming lines into [`event::Event`]s and manages the connection lifecycle:
//! address rotation on repeated failures, adaptive keepalive pings and
//! reconnection with a fixed backoff table.
//!
//! ```rust,no_run
//! use twirc_sdk::client::Client;
//! use twirc_sdk::config::EngineConfig;
//! use twirc_sdk::event::Event;
//!
//! # async fn example() -> twirc_sdk::Result<()> {
//! let (client, mut events) = Client::new(EngineConfig::default());
//! client.connect("irc.chat.twitch.tv", "6667,80", "justinfan123", None).await?;
//!
//! while let Some(event) = events.recv().await {
//!     match event {
//!         Event::Registered { .. } => client.join_channel("somechannel").await,
//!         Event::Disconnected { reason, .. } if !reason.is_requested() => {
//!             let _ = client.schedule_reconnect(&reason);
//!         }
//!         _ => {}
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod event;
pub mod irc;
pub mod reconnect;
pub mod resolver;
pub mod socket;
pub mod state;
pub mod stats;

pub use error::{Error, Result};
