//! The protocol engine.
//!
//! [`Client`] owns the connection lifecycle
//! (`Offline → Connecting → Connected → Registered`), turns received lines into
//! [`Event`]s and exposes the commands a consumer sends. Events arrive on the
//! receiver returned by [`Client::new`], in the order the lines were received.
//!
//! ## Reconnection
//!
//! The engine never reconnects on its own after an unexpected disconnect. The
//! consumer decides: on [`Event::Disconnected`] it may call
//! [`Client::schedule_reconnect`], which waits according to the backoff table
//! and then connects again with the remembered host, nick and token. The
//! attempt counter resets once a connection reaches `Registered`.
//!
//! ## Locking
//!
//! Session state lives behind one mutex. The disconnect classification runs
//! entirely inside it and queues the `Disconnected` event before releasing it,
//! so a `disconnect()` racing a dying socket cannot produce two events. When
//! both are needed, the session lock is taken before the scheduler lock.

use std::collections::BTreeSet;
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::event::Event;
use crate::irc::{self, ParsedMessage};
use crate::reconnect::{ReconnectPolicy, ReconnectScheduler};
use crate::resolver::{self, AddressResolver, ServerAddress};
use crate::socket::{LineHandler, LineSocket};
use crate::state::{ConnectionState, DisconnectReason};
use crate::stats::Traffic;

/// How long a requested disconnect waits for QUIT to go out.
const QUIT_GRACE: Duration = Duration::from_secs(1);

/// Credentials and server list remembered for reconnects.
#[derive(Debug, Clone)]
struct Login {
    host: String,
    ports: Vec<u16>,
    nick: String,
    token: Option<String>,
}

#[derive(Default)]
struct Session {
    state: ConnectionState,
    requested_disconnect: bool,
    requested_reconnect: bool,
    login: Option<Login>,
    socket: Option<Arc<LineSocket>>,
    address: Option<ServerAddress>,
    connected_at: Option<DateTime<Utc>>,
    /// Channels the consumer asked to be in; rejoined after registration.
    wanted: BTreeSet<String>,
    /// Channels the server confirmed we joined on this connection.
    joined: BTreeSet<String>,
}

impl Session {
    fn set_state(&mut self, next: ConnectionState) {
        if !self.state.can_become(next) {
            tracing::warn!(from = %self.state, to = %next, "Unexpected state transition");
        }
        self.state = next;
    }

    fn is_current(&self, socket: &LineSocket) -> bool {
        self.socket.as_ref().is_some_and(|s| s.id() == socket.id())
    }
}

struct Inner {
    config: EngineConfig,
    session: Mutex<Session>,
    resolver: AddressResolver,
    reconnect: Mutex<ReconnectScheduler>,
    events: mpsc::UnboundedSender<Event>,
    next_socket_id: AtomicU64,
}

/// Handle to the engine. Cheap to clone; all clones drive the same connection.
#[derive(Clone)]
pub struct Client {
    inner: Arc<Inner>,
}

impl Client {
    pub fn new(config: EngineConfig) -> (Self, mpsc::UnboundedReceiver<Event>) {
        let (events, rx) = mpsc::unbounded_channel();
        let policy = ReconnectPolicy::from_config(&config);
        let inner = Inner {
            config,
            session: Mutex::new(Session::default()),
            resolver: AddressResolver::new(),
            reconnect: Mutex::new(ReconnectScheduler::new(policy)),
            events,
            next_socket_id: AtomicU64::new(1),
        };
        (
            Self {
                inner: Arc::new(inner),
            },
            rx,
        )
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    // ── Lifecycle ──

    /// Connect to `host` (comma-separated list) on one of `ports`
    /// (comma-separated list).
    ///
    /// Returns an error only for policy problems: already connecting or
    /// connected, or an empty or invalid server list. Lookup and connection
    /// failures are reported through [`Event::Disconnected`]. The nick and
    /// token are remembered for later reconnects.
    pub async fn connect(&self, host: &str, ports: &str, nick: &str, auth_token: Option<&str>) -> Result<()> {
        if resolver::parse_hosts(host).is_empty() {
            return Err(Error::NoAddress);
        }
        let login = Login {
            host: host.to_string(),
            ports: resolver::parse_ports(ports)?,
            nick: nick.to_string(),
            token: auth_token.map(str::to_string),
        };
        {
            let mut session = self.inner.session.lock();
            if session.state >= ConnectionState::Connecting {
                return Err(Error::AlreadyConnected);
            }
            // A manual connect supersedes a pending retry.
            self.inner.reconnect.lock().cancel();
            self.begin(&mut session, login.clone());
        }
        self.start(&login).await;
        Ok(())
    }

    /// Quit and close the connection, or cancel a pending retry.
    ///
    /// Safe to call repeatedly and from any task; the resulting
    /// `Disconnected` event carries [`DisconnectReason::RequestedDisconnect`].
    pub async fn disconnect(&self) {
        let socket = {
            let mut session = self.inner.session.lock();
            let cancelled = self.inner.reconnect.lock().cancel();
            if session.state == ConnectionState::Reconnecting {
                session.set_state(ConnectionState::Offline);
                drop(session);
                if cancelled {
                    tracing::info!("Pending reconnect cancelled");
                    self.system("Reconnect cancelled");
                }
                return;
            }
            if session.state <= ConnectionState::Connecting {
                return;
            }
            session.requested_disconnect = true;
            session.socket.clone()
        };
        if let Some(socket) = socket {
            self.quit_and_close(&socket).await;
        }
    }

    /// Reconnect now with the remembered login, cancelling any pending retry
    /// and resetting the attempt counter.
    ///
    /// When online, the current connection is closed first (reported as
    /// [`DisconnectReason::RequestedReconnect`]) and the new attempt starts
    /// once it is gone.
    pub async fn reconnect(&self) -> Result<()> {
        let (socket, login) = {
            let mut session = self.inner.session.lock();
            let login = session.login.clone().ok_or(Error::NoSession)?;
            if session.state == ConnectionState::Connecting {
                return Err(Error::AlreadyConnected);
            }
            {
                let mut scheduler = self.inner.reconnect.lock();
                scheduler.cancel();
                scheduler.reset();
            }
            if session.state > ConnectionState::Connecting {
                session.requested_reconnect = true;
                (session.socket.clone(), login)
            } else {
                self.begin(&mut session, login.clone());
                (None, login)
            }
        };
        match socket {
            Some(socket) => self.quit_and_close(&socket).await,
            None => self.start(&login).await,
        }
        Ok(())
    }

    /// Schedule a delayed reconnect after an unexpected disconnect.
    ///
    /// Returns the delay on success. Fails if a retry is already pending, the
    /// engine is not offline, there is nothing to reconnect to, or the maximum
    /// number of attempts has been used up (a terminal condition until the
    /// next successful registration or manual [`Client::reconnect`]).
    pub fn schedule_reconnect(&self, reason: &DisconnectReason) -> Result<Duration> {
        let mut session = self.inner.session.lock();
        let mut scheduler = self.inner.reconnect.lock();
        if scheduler.is_pending() {
            return Err(Error::ReconnectPending);
        }
        if session.state != ConnectionState::Offline {
            return Err(Error::AlreadyConnected);
        }
        if session.login.is_none() {
            return Err(Error::NoSession);
        }

        let client = self.clone();
        let scheduled = scheduler.schedule(reason, |id, delay| {
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                client.retry(id).await;
            })
        });
        let max_attempts = scheduler.policy().max_attempts();
        drop(scheduler);

        match scheduled {
            Ok(retry) => {
                session.set_state(ConnectionState::Reconnecting);
                drop(session);
                tracing::info!(
                    attempt = retry.attempt,
                    max_attempts,
                    delay_secs = retry.delay.as_secs(),
                    reason = %reason,
                    "Reconnect scheduled"
                );
                self.system(&format!(
                    "Reconnecting in {}s (attempt {}/{max_attempts})",
                    retry.delay.as_secs(),
                    retry.attempt
                ));
                Ok(retry.delay)
            }
            Err(e) => {
                drop(session);
                if let Error::AttemptsExhausted { attempts } = e {
                    tracing::warn!(attempts, "Giving up reconnecting");
                    self.system(&format!("Gave up reconnecting after {attempts} attempts"));
                }
                Err(e)
            }
        }
    }

    // ── Sending ──

    /// Send a raw line. Silently dropped while offline.
    pub async fn send(&self, raw: &str) {
        let socket = {
            let session = self.inner.session.lock();
            if session.state <= ConnectionState::Offline {
                return;
            }
            session.socket.clone()
        };
        if let Some(socket) = socket
            && let Err(e) = socket.send(raw).await
        {
            tracing::warn!(address = %socket.address(), error = %e, "Send failed");
        }
    }

    /// Send `command param`, or just `command` when `param` is empty.
    pub async fn send_command(&self, command: &str, param: &str) {
        if param.is_empty() {
            self.send(command).await;
        } else {
            self.send(&format!("{command} {param}")).await;
        }
    }

    pub async fn join_channel(&self, name: &str) {
        let channel = irc::channel_name(name);
        self.inner.session.lock().wanted.insert(channel.clone());
        self.send_command("JOIN", &channel).await;
    }

    pub async fn part_channel(&self, name: &str) {
        let channel = irc::channel_name(name);
        self.inner.session.lock().wanted.remove(&channel);
        self.send_command("PART", &channel).await;
    }

    pub async fn send_message(&self, to: &str, text: &str) {
        self.send(&format!("PRIVMSG {to} :{text}")).await;
    }

    pub async fn send_action_message(&self, to: &str, text: &str) {
        self.send(&format!("PRIVMSG {to} :\u{1}ACTION {text}\u{1}")).await;
    }

    // ── Accessors ──

    pub fn state(&self) -> ConnectionState {
        self.inner.session.lock().state
    }

    pub fn is_registered(&self) -> bool {
        self.state() == ConnectionState::Registered
    }

    pub fn is_offline(&self) -> bool {
        self.state() <= ConnectionState::Offline
    }

    /// Whether the server confirmed we are in `name` on this connection.
    pub fn on_channel(&self, name: &str) -> bool {
        let channel = irc::channel_name(name);
        self.inner.session.lock().joined.contains(&channel)
    }

    pub fn channels(&self) -> Vec<String> {
        self.inner.session.lock().joined.iter().cloned().collect()
    }

    pub fn nick(&self) -> Option<String> {
        self.inner.session.lock().login.as_ref().map(|l| l.nick.clone())
    }

    pub fn ip(&self) -> Option<IpAddr> {
        self.inner.session.lock().address.as_ref().map(|a| a.ip)
    }

    pub fn traffic(&self) -> Option<Traffic> {
        self.inner.session.lock().socket.as_ref().map(|s| s.traffic())
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.reconnect.lock().policy().attempts()
    }

    /// Human-readable connection status, e.g.
    /// `Connected to irc.chat.twitch.tv:6667 (1.2.3.4) for 1h 4m 10s`.
    pub fn connection_info(&self) -> String {
        let session = self.inner.session.lock();
        match (session.state, &session.address, session.connected_at) {
            (ConnectionState::Connected | ConnectionState::Registered, Some(address), Some(since)) => {
                format!(
                    "Connected to {address} ({}) for {}",
                    address.ip,
                    format_elapsed(Utc::now() - since)
                )
            }
            (ConnectionState::Connecting, Some(address), _) => format!("Connecting to {address}"),
            (ConnectionState::Connecting, None, _) => "Connecting".to_string(),
            (ConnectionState::Reconnecting, _, _) => "Waiting to reconnect".to_string(),
            _ => "Not connected".to_string(),
        }
    }

    // ── Internals ──

    fn begin(&self, session: &mut Session, login: Login) {
        session.requested_disconnect = false;
        session.requested_reconnect = false;
        session.login = Some(login);
        session.set_state(ConnectionState::Connecting);
    }

    /// Resolve an address and start a socket task. The session must already
    /// be in `Connecting`.
    async fn start(&self, login: &Login) {
        tracing::info!(server = %login.host, nick = %login.nick, "Connecting");
        self.system(&format!("Connecting to {}...", login.host));

        let address = match self.inner.resolver.resolve(&login.host, &login.ports).await {
            Ok(address) => address,
            Err(e) => {
                self.disconnected(None, DisconnectReason::UnknownHost, e.to_string());
                return;
            }
        };

        let id = self.inner.next_socket_id.fetch_add(1, Ordering::Relaxed);
        let socket = Arc::new(LineSocket::new(id, address.clone(), &self.inner.config));
        {
            let mut session = self.inner.session.lock();
            if session.state != ConnectionState::Connecting {
                tracing::debug!(state = %session.state, "Connect abandoned");
                return;
            }
            session.address = Some(address);
            session.socket = Some(Arc::clone(&socket));
        }
        tokio::spawn(socket.run(self.clone()));
    }

    async fn retry(&self, id: u64) {
        let login = {
            let mut session = self.inner.session.lock();
            if !self.inner.reconnect.lock().fire(id) {
                return;
            }
            if session.state != ConnectionState::Reconnecting {
                return;
            }
            let Some(login) = session.login.clone() else {
                session.set_state(ConnectionState::Offline);
                return;
            };
            self.begin(&mut session, login.clone());
            login
        };
        self.start(&login).await;
    }

    /// Send QUIT if the link takes it within [`QUIT_GRACE`], then close.
    async fn quit_and_close(&self, socket: &LineSocket) {
        match tokio::time::timeout(QUIT_GRACE, socket.send("QUIT")).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::debug!(error = %e, "QUIT not sent"),
            Err(_) => tracing::debug!(socket = socket.id(), "QUIT not sent, link is stalled"),
        }
        socket.close().await;
    }

    /// Classify and report the end of a connection attempt.
    ///
    /// `socket` is `None` when no socket was created (lookup failure).
    fn disconnected(&self, socket: Option<&LineSocket>, reason: DisconnectReason, message: String) {
        let mut session = self.inner.session.lock();
        if let Some(socket) = socket
            && !session.is_current(socket)
        {
            tracing::debug!(socket = socket.id(), "Ignoring close of a stale socket");
            return;
        }

        let prior = session.state;
        session.set_state(ConnectionState::Offline);
        session.socket = None;
        session.connected_at = None;
        session.joined.clear();
        let address = session.address.take();

        let requested = session.requested_disconnect || session.requested_reconnect;
        if !requested
            && prior != ConnectionState::Registered
            && let Some(address) = &address
        {
            self.inner.resolver.record_failure(address);
        }

        let classified = if std::mem::take(&mut session.requested_reconnect) {
            session.requested_disconnect = false;
            DisconnectReason::RequestedReconnect
        } else if std::mem::take(&mut session.requested_disconnect) {
            DisconnectReason::RequestedDisconnect
        } else if reason == DisconnectReason::ConnectionClosed && prior != ConnectionState::Registered {
            DisconnectReason::RegistrationFailed
        } else {
            reason.clone()
        };
        let message = if classified == reason { message } else { classified.to_string() };

        match &address {
            Some(address) => tracing::info!(address = %address, prior = %prior, reason = %classified, "Disconnected: {message}"),
            None => tracing::info!(prior = %prior, reason = %classified, "Disconnected: {message}"),
        }
        let _ = self.inner.events.send(Event::Disconnected {
            reason: classified.clone(),
            message,
        });

        if classified == DisconnectReason::RequestedReconnect
            && let Some(login) = session.login.clone()
        {
            self.begin(&mut session, login.clone());
            drop(session);
            let client = self.clone();
            tokio::spawn(async move { client.start(&login).await });
        }
    }

    fn emit(&self, event: Event) {
        let _ = self.inner.events.send(event);
    }

    fn system(&self, text: &str) {
        self.emit(Event::SystemMessage {
            text: text.to_string(),
        });
    }

    async fn registered(&self, socket: &LineSocket, msg: &ParsedMessage) {
        let (nick, rejoin) = {
            let mut session = self.inner.session.lock();
            if !session.is_current(socket) {
                return;
            }
            session.set_state(ConnectionState::Registered);
            self.inner.reconnect.lock().reset();
            self.inner.resolver.record_success(socket.address());
            let nick = msg
                .param(0)
                .filter(|n| !n.is_empty() && *n != "*")
                .map(str::to_string)
                .or_else(|| session.login.as_ref().map(|l| l.nick.clone()))
                .unwrap_or_default();
            let rejoin: Vec<String> = if self.inner.config.rejoin_channels {
                session.wanted.iter().cloned().collect()
            } else {
                Vec::new()
            };
            (nick, rejoin)
        };

        tracing::info!(address = %socket.address(), nick = %nick, "Registered");
        self.emit(Event::Registered { nick });

        let caps = &self.inner.config.capabilities;
        if !caps.is_empty() {
            self.reply(socket, &format!("CAP REQ :{}", caps.join(" "))).await;
        }
        for channel in rejoin {
            self.reply(socket, &format!("JOIN {channel}")).await;
        }
    }

    async fn reply(&self, socket: &LineSocket, line: &str) {
        if let Err(e) = socket.send(line).await {
            tracing::warn!(address = %socket.address(), error = %e, "Send failed");
        }
    }

    fn is_own_nick(&self, nick: &str) -> bool {
        self.inner
            .session
            .lock()
            .login
            .as_ref()
            .is_some_and(|l| l.nick.eq_ignore_ascii_case(nick))
    }

    async fn dispatch(&self, socket: &LineSocket, msg: ParsedMessage) {
        let nick = msg.nick().to_string();
        match msg.command.as_str() {
            "PING" => {
                self.reply(socket, &format!("PONG :{}", msg.trailing)).await;
            }
            "PRIVMSG" => {
                let Some(target) = msg.param(0).map(str::to_string) else {
                    tracing::warn!(line = %msg, "PRIVMSG without target");
                    return;
                };
                let event = if target.starts_with('#') {
                    match irc::action_text(&msg.trailing) {
                        Some(text) => Event::ChannelAction {
                            channel: target.clone(),
                            nick,
                            text: text.to_string(),
                            prefix: msg.prefix,
                            tags: msg.tags,
                        },
                        None => Event::ChannelMessage {
                            channel: target.clone(),
                            nick,
                            prefix: msg.prefix,
                            text: msg.trailing,
                            tags: msg.tags,
                        },
                    }
                } else {
                    Event::QueryMessage {
                        nick,
                        prefix: msg.prefix,
                        text: msg.trailing,
                        tags: msg.tags,
                    }
                };
                self.emit(event);
            }
            "NOTICE" => {
                let Some(target) = msg.param(0).map(str::to_string) else {
                    tracing::warn!(line = %msg, "NOTICE without target");
                    return;
                };
                if target.starts_with('#') && !self.inner.config.channel_notices {
                    return;
                }
                self.emit(Event::Notice {
                    target,
                    nick,
                    prefix: msg.prefix,
                    text: msg.trailing,
                });
            }
            "JOIN" => {
                let channel = if !msg.trailing.is_empty() {
                    msg.trailing.clone()
                } else if let Some(channel) = msg.param(0) {
                    channel.to_string()
                } else {
                    tracing::warn!(line = %msg, "JOIN without channel");
                    return;
                };
                if self.is_own_nick(&nick) {
                    self.inner.session.lock().joined.insert(channel.clone());
                }
                self.emit(Event::Joined {
                    channel,
                    nick,
                    prefix: msg.prefix,
                });
            }
            "PART" => {
                let Some(channel) = msg.param(0).map(str::to_string) else {
                    tracing::warn!(line = %msg, "PART without channel");
                    return;
                };
                if self.is_own_nick(&nick) {
                    self.inner.session.lock().joined.remove(&channel);
                }
                self.emit(Event::Parted {
                    channel,
                    nick,
                    prefix: msg.prefix,
                    message: msg.trailing,
                });
            }
            "MODE" => {
                if msg.params.len() != 3 {
                    return;
                }
                let mut flag = msg.params[1].chars();
                if let (Some(sign @ ('+' | '-')), Some(mode), None) = (flag.next(), flag.next(), flag.next()) {
                    self.emit(Event::ModeChanged {
                        channel: msg.params[0].clone(),
                        nick: msg.params[2].clone(),
                        added: sign == '+',
                        mode,
                        prefix: msg.prefix,
                    });
                }
            }
            "004" => self.registered(socket, &msg).await,
            "353" => {
                if msg.params.len() == 3 && msg.params[1] == "=" && msg.params[2].starts_with('#') {
                    let nicks = msg
                        .trailing
                        .split(' ')
                        .filter(|n| !n.is_empty())
                        .map(str::to_string)
                        .collect();
                    self.emit(Event::Userlist {
                        channel: msg.params[2].clone(),
                        nicks,
                    });
                }
            }
            _ => {}
        }
    }
}

impl LineHandler for Client {
    async fn opened(&self, socket: &Arc<LineSocket>) {
        let login = {
            let mut session = self.inner.session.lock();
            if !session.is_current(socket) {
                return;
            }
            session.set_state(ConnectionState::Connected);
            session.connected_at = Some(Utc::now());
            session.login.clone()
        };
        self.emit(Event::Connected {
            address: socket.address().to_string(),
        });

        let Some(login) = login else {
            return;
        };
        if let Some(token) = &login.token {
            self.reply(socket, &format!("PASS {token}")).await;
        }
        self.reply(socket, &format!("NICK {}", login.nick)).await;
    }

    async fn line_received(&self, socket: &Arc<LineSocket>, line: String) {
        let msg = match ParsedMessage::parse(&line) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::warn!(address = %socket.address(), error = %e, line = %line, "Dropping malformed line");
                return;
            }
        };
        if self.inner.config.debug {
            tracing::debug!(command = %msg.command, prefix = %msg.prefix, params = ?msg.params, "Parsed");
        }
        if self.inner.config.emit_parsed {
            self.emit(Event::Parsed(msg.clone()));
        }
        self.dispatch(socket, msg).await;
    }

    fn closed(&self, socket: &Arc<LineSocket>, reason: DisconnectReason) {
        let message = reason.to_string();
        self.disconnected(Some(socket.as_ref()), reason, message);
    }
}

fn format_elapsed(elapsed: TimeDelta) -> String {
    let secs = elapsed.num_seconds().max(0);
    let (hours, minutes, seconds) = (secs / 3600, secs % 3600 / 60, secs % 60);
    if hours > 0 {
        format!("{hours}h {minutes}m {seconds}s")
    } else if minutes > 0 {
        format!("{minutes}m {seconds}s")
    } else {
        format!("{seconds}s")
    }
}
