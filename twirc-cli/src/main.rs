//! twirc: terminal chat client for Twitch-style IRC servers.
//!
//! Prints events to stdout (text, or JSON lines with `--json`) and sends what
//! is typed on stdin to the current channel. See `input.rs` for the slash
//! commands. Unexpected disconnects are retried with backoff until the
//! engine's attempt limit is reached.

mod config;
mod input;
mod output;

use std::path::PathBuf;

use anyhow::{Result, bail};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};

use twirc_sdk::Error;
use twirc_sdk::client::Client;
use twirc_sdk::event::Event;
use twirc_sdk::irc;
use twirc_sdk::state::{ConnectionState, DisconnectReason};

use crate::config::{Config, Resolved};
use crate::input::Input;

#[derive(Parser, Debug)]
#[command(name = "twirc", about = "Terminal client for Twitch-style IRC chat")]
pub struct Args {
    /// Server host, or a comma-separated list of hosts
    #[arg(long)]
    server: Option<String>,

    /// Port or comma-separated port list (default: 6667,80)
    #[arg(long)]
    ports: Option<String>,

    /// Nick (default: anonymous justinfan nick)
    #[arg(long)]
    nick: Option<String>,

    /// OAuth token sent as PASS
    #[arg(long, env = "TWIRC_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Comma-separated channels to join after login
    #[arg(long)]
    channels: Option<String>,

    /// Config file (default: ~/.config/twirc/config.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Print events as JSON lines
    #[arg(long)]
    json: bool,

    /// Log raw protocol traffic (needs RUST_LOG=twirc_sdk=debug)
    #[arg(long)]
    debug: bool,

    /// Exit on the first unexpected disconnect instead of retrying
    #[arg(long)]
    no_reconnect: bool,
}

enum Flow {
    Continue,
    Exit,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "twirc=info,twirc_sdk=info".into()),
        )
        .init();

    let args = Args::parse();
    let config = Config::load(args.config.as_deref());
    let resolved = Resolved::merge(&args, &config);

    let mut engine = config.engine.clone();
    engine.debug |= args.debug;
    let (client, mut events) = Client::new(engine);

    // Joining while offline only records the channels; the engine joins them
    // after every registration.
    for channel in &resolved.channels {
        client.join_channel(channel).await;
    }

    tracing::info!(
        server = %resolved.host,
        ports = %resolved.ports,
        nick = %resolved.nick,
        channels = ?resolved.channels,
        "Starting twirc"
    );
    client
        .connect(
            &resolved.host,
            &resolved.ports,
            &resolved.nick,
            resolved.token.as_deref(),
        )
        .await?;

    let mut current = resolved.channels.first().map(|c| irc::channel_name(c));
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else {
                    tracing::warn!("Event channel closed, exiting");
                    break;
                };
                match handle_event(&client, &args, &resolved, &event).await? {
                    Flow::Continue => {}
                    Flow::Exit => break,
                }
            }
            line = stdin.next_line(), if stdin_open => match line {
                Ok(Some(line)) => {
                    if let Flow::Exit = handle_input(&client, &mut current, &line).await {
                        if quit(&client).await {
                            break;
                        }
                    }
                }
                Ok(None) => stdin_open = false,
                Err(e) => {
                    tracing::warn!(error = %e, "Can't read stdin");
                    stdin_open = false;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted, disconnecting");
                if quit(&client).await {
                    break;
                }
            }
        }
    }

    Ok(())
}

/// Disconnect. Returns true when there is no connection left whose
/// `Disconnected` event should be waited for.
async fn quit(client: &Client) -> bool {
    client.disconnect().await;
    client.state() < ConnectionState::Connected
}

async fn handle_event(client: &Client, args: &Args, resolved: &Resolved, event: &Event) -> Result<Flow> {
    if args.json {
        println!("{}", output::json(event)?);
    } else if let Some(line) = output::text(event) {
        println!("{line}");
    }

    match event {
        Event::Registered { .. } if !client.config().rejoin_channels => {
            for channel in &resolved.channels {
                client.join_channel(channel).await;
            }
        }
        Event::Disconnected { reason, .. } => return reconnect_or_exit(client, args, reason),
        _ => {}
    }
    Ok(Flow::Continue)
}

fn reconnect_or_exit(client: &Client, args: &Args, reason: &DisconnectReason) -> Result<Flow> {
    match reason {
        DisconnectReason::RequestedDisconnect => return Ok(Flow::Exit),
        DisconnectReason::RequestedReconnect => return Ok(Flow::Continue),
        _ if args.no_reconnect => return Ok(Flow::Exit),
        _ => {}
    }
    match client.schedule_reconnect(reason) {
        Ok(delay) => {
            tracing::debug!(delay_secs = delay.as_secs(), "Retry scheduled");
            Ok(Flow::Continue)
        }
        Err(Error::AttemptsExhausted { attempts }) => {
            bail!("giving up after {attempts} reconnect attempts (last: {reason})")
        }
        Err(e) => {
            tracing::warn!(error = %e, "Could not schedule reconnect");
            Ok(Flow::Continue)
        }
    }
}

async fn handle_input(client: &Client, current: &mut Option<String>, line: &str) -> Flow {
    match input::parse(line) {
        Input::Empty => {}
        Input::Say(text) => match current.as_deref() {
            Some(channel) if client.is_registered() => client.send_message(channel, &text).await,
            Some(_) => eprintln!("Not logged in yet"),
            None => eprintln!("No current channel, /join one first"),
        },
        Input::Join(name) => {
            let channel = irc::channel_name(&name);
            client.join_channel(&channel).await;
            *current = Some(channel);
        }
        Input::Part(name) => {
            let Some(channel) = name.map(|n| irc::channel_name(&n)).or_else(|| current.clone()) else {
                eprintln!("No channel to leave");
                return Flow::Continue;
            };
            client.part_channel(&channel).await;
            if current.as_deref() == Some(channel.as_str()) {
                *current = None;
            }
        }
        Input::Action(text) => match current.as_deref() {
            Some(channel) => client.send_action_message(channel, &text).await,
            None => eprintln!("No current channel, /join one first"),
        },
        Input::Message { target, text } => client.send_message(&target, &text).await,
        Input::Raw(line) => client.send(&line).await,
        Input::Reconnect => {
            if let Err(e) = client.reconnect().await {
                eprintln!("Can't reconnect: {e}");
            }
        }
        Input::Info => {
            eprintln!("{}", client.connection_info());
            if let Some(traffic) = client.traffic() {
                eprintln!(
                    "received {} lines ({} bytes), sent {} lines ({} bytes)",
                    traffic.lines_received, traffic.bytes_received, traffic.lines_sent, traffic.bytes_sent
                );
            }
            let channels = client.channels();
            if !channels.is_empty() {
                eprintln!("on {}", channels.join(", "));
            }
        }
        Input::Quit => return Flow::Exit,
        Input::Unknown(line) => eprintln!("Unknown command: {line}"),
    }
    Flow::Continue
}
