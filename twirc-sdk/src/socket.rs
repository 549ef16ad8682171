//! One TCP connection carrying CRLF-terminated lines.
//!
//! A [`LineSocket`] is used for exactly one connection attempt. [`LineSocket::run`]
//! connects, then reads with a fixed timeout so the task wakes up regularly
//! even on a silent link; each timeout is a keepalive tick. Every received line
//! is handed to a [`LineHandler`] on the read task itself, so lines are handled
//! strictly in arrival order.
//!
//! Whatever ends the connection, the handler's `closed` is called exactly once.
//! A write that fails or stalls past the write timeout ends the connection
//! too, and [`LineSocket::close`] never waits on a stalled writer: senders
//! blocked on the link give up as soon as the socket is closed.

use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::watch;

use crate::config::EngineConfig;
use crate::resolver::ServerAddress;
use crate::state::DisconnectReason;
use crate::stats::{ActivityStats, Keepalive, Traffic};

/// Consecutive hard read errors before the connection is given up.
const MAX_READ_ERRORS: u32 = 2;

/// Longest accepted line: 512 bytes of message plus 8191 bytes of IRCv3 tags.
pub const MAX_LINE_BYTES: usize = 512 + 8191;

/// Receives what happens on a [`LineSocket`].
pub trait LineHandler: Send + Sync + 'static {
    /// The TCP connection is up and lines can be sent.
    fn opened(&self, socket: &Arc<LineSocket>) -> impl Future<Output = ()> + Send;

    /// One received line, without its line terminator.
    fn line_received(&self, socket: &Arc<LineSocket>, line: String) -> impl Future<Output = ()> + Send;

    /// The connection attempt failed or the connection ended.
    fn closed(&self, socket: &Arc<LineSocket>, reason: DisconnectReason);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    Idle,
    Connecting,
    Open,
    Closed,
}

pub struct LineSocket {
    id: u64,
    address: ServerAddress,
    connect_timeout: Duration,
    read_timeout: Duration,
    write_timeout: Duration,
    ping_timeout: Duration,
    debug: bool,
    state: parking_lot::Mutex<SocketState>,
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    stats: parking_lot::Mutex<ActivityStats>,
    /// Why the socket closed itself, reported instead of `ConnectionClosed`.
    failure: parking_lot::Mutex<Option<DisconnectReason>>,
    shutdown: watch::Sender<bool>,
}

impl LineSocket {
    pub fn new(id: u64, address: ServerAddress, config: &EngineConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            id,
            address,
            connect_timeout: config.connect_timeout(),
            read_timeout: config.read_timeout(),
            write_timeout: config.write_timeout(),
            ping_timeout: config.ping_timeout(),
            debug: config.debug,
            state: parking_lot::Mutex::new(SocketState::Idle),
            writer: tokio::sync::Mutex::new(None),
            stats: parking_lot::Mutex::new(ActivityStats::new(
                config.activity_window(),
                config.activity_granularity(),
                Instant::now(),
            )),
            failure: parking_lot::Mutex::new(None),
            shutdown,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn address(&self) -> &ServerAddress {
        &self.address
    }

    pub fn state(&self) -> SocketState {
        *self.state.lock()
    }

    pub fn traffic(&self) -> Traffic {
        self.stats.lock().traffic()
    }

    /// Connect and run the read loop until the connection ends.
    pub async fn run<H: LineHandler>(self: Arc<Self>, handler: H) {
        let reason = match self.open().await {
            Ok(reader) => {
                handler.opened(&self).await;
                self.read_loop(reader, &handler).await
            }
            Err(reason) => reason,
        };
        self.mark_closed();
        self.release_writer().await;
        tracing::debug!(address = %self.address, reason = %reason, "Socket closed");
        handler.closed(&self, reason);
    }

    /// Write one line followed by CRLF and flush it.
    ///
    /// Returns `NotConnected` if the socket is closed, including while this
    /// call waits for another sender or for the peer. A write error or a write
    /// that exceeds the write timeout closes the connection.
    pub async fn send(&self, line: &str) -> io::Result<()> {
        let data = format!("{line}\r\n");
        let mut shutdown = self.shutdown.subscribe();
        if *shutdown.borrow_and_update() {
            return Err(not_open());
        }

        let written = {
            let mut slot = tokio::select! {
                slot = self.writer.lock() => slot,
                _ = shutdown.changed() => return Err(not_open()),
            };
            let Some(writer) = slot.as_mut() else {
                return Err(not_open());
            };
            tokio::select! {
                result = tokio::time::timeout(self.write_timeout, write_line(writer, data.as_bytes())) => result,
                _ = shutdown.changed() => return Err(not_open()),
            }
        };

        match written {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                self.fail(DisconnectReason::SocketError(e.to_string()));
                return Err(e);
            }
            Err(_) => {
                self.fail(DisconnectReason::SocketTimeout);
                return Err(io::Error::new(io::ErrorKind::TimedOut, "write timed out"));
            }
        }
        self.stats.lock().record_sent(data.len());
        if self.debug {
            tracing::debug!(address = %self.address, ">> {line}");
        }
        Ok(())
    }

    /// Close the connection. Calling it again is a no-op.
    ///
    /// Wakes the read task, which reports `closed` to the handler, and any
    /// sender still waiting on the link. Errors while shutting the stream down
    /// are logged and otherwise ignored.
    pub async fn close(&self) {
        if self.mark_closed() {
            self.release_writer().await;
        }
    }

    /// Flip to `Closed` and signal everyone waiting on the socket. Returns
    /// false if it was already closed.
    fn mark_closed(&self) -> bool {
        {
            let mut state = self.state.lock();
            if *state == SocketState::Closed {
                return false;
            }
            *state = SocketState::Closed;
        }
        self.shutdown.send_replace(true);
        true
    }

    /// Close because the link is unusable; `reason` is what gets reported.
    fn fail(&self, reason: DisconnectReason) {
        let mut failure = self.failure.lock();
        if *self.state.lock() == SocketState::Closed {
            return;
        }
        tracing::warn!(address = %self.address, reason = %reason, "Write failed, closing");
        *failure = Some(reason);
        drop(failure);
        self.mark_closed();
    }

    fn close_reason(&self) -> DisconnectReason {
        self.failure.lock().take().unwrap_or(DisconnectReason::ConnectionClosed)
    }

    /// Take the write half and shut it down. Senders give up once the socket
    /// is closed, so the wait for the slot is short; it is bounded anyway.
    async fn release_writer(&self) {
        let writer = match tokio::time::timeout(self.write_timeout, self.writer.lock()).await {
            Ok(mut slot) => slot.take(),
            Err(_) => {
                tracing::warn!(address = %self.address, "Writer still busy, dropping it with the socket");
                return;
            }
        };
        let Some(mut writer) = writer else {
            return;
        };
        match tokio::time::timeout(self.write_timeout, writer.shutdown()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(address = %self.address, error = %e, "Error shutting down socket"),
            Err(_) => tracing::warn!(address = %self.address, "Timed out shutting down socket"),
        }
    }

    async fn open(&self) -> Result<BufReader<OwnedReadHalf>, DisconnectReason> {
        {
            let mut state = self.state.lock();
            if *state == SocketState::Closed {
                return Err(DisconnectReason::ConnectionClosed);
            }
            *state = SocketState::Connecting;
        }
        let mut shutdown = self.shutdown.subscribe();
        let addr = self.address.socket_addr();
        tracing::info!(address = %self.address, ip = %addr.ip(), "Connecting");

        let stream = tokio::select! {
            result = tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr)) => match result {
                Err(_) => return Err(DisconnectReason::SocketTimeout),
                Ok(Err(e)) => return Err(DisconnectReason::SocketError(e.to_string())),
                Ok(Ok(stream)) => stream,
            },
            _ = shutdown.changed() => return Err(DisconnectReason::ConnectionClosed),
        };
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(error = %e, "Could not set TCP_NODELAY");
        }

        let (reader, writer) = stream.into_split();
        let mut slot = self.writer.lock().await;
        {
            let mut state = self.state.lock();
            if *state == SocketState::Closed {
                return Err(DisconnectReason::ConnectionClosed);
            }
            *state = SocketState::Open;
        }
        *slot = Some(writer);
        drop(slot);
        tracing::info!(address = %self.address, "Connected");
        Ok(BufReader::new(reader))
    }

    async fn read_loop<H: LineHandler>(
        self: &Arc<Self>,
        mut reader: BufReader<OwnedReadHalf>,
        handler: &H,
    ) -> DisconnectReason {
        let mut shutdown = self.shutdown.subscribe();
        let mut keepalive = Keepalive::new(self.read_timeout, self.ping_timeout);
        let mut buf = Vec::with_capacity(512);
        let mut read_errors = 0;
        // Set while skipping the rest of an oversized line.
        let mut discarding = false;

        loop {
            if *shutdown.borrow_and_update() {
                return self.close_reason();
            }
            // read_until keeps partial data in `buf` when the timeout fires,
            // so a line split across ticks is not lost. The take() bound stops
            // `buf` one byte past the line limit.
            let limit = (MAX_LINE_BYTES + 1).saturating_sub(buf.len()) as u64;
            let mut limited = (&mut reader).take(limit);
            let read = tokio::select! {
                result = tokio::time::timeout(self.read_timeout, limited.read_until(b'\n', &mut buf)) => result,
                _ = shutdown.changed() => return self.close_reason(),
            };
            match read {
                Err(_) => self.check_connection(&mut keepalive).await,
                Ok(Ok(0)) => return DisconnectReason::ConnectionClosed,
                Ok(Ok(_)) => {
                    read_errors = 0;
                    if buf.last() != Some(&b'\n') {
                        if buf.len() > MAX_LINE_BYTES {
                            if !discarding {
                                tracing::warn!(address = %self.address, limit = MAX_LINE_BYTES, "Dropping oversized line");
                            }
                            buf.clear();
                            discarding = true;
                        }
                        continue;
                    }
                    if std::mem::take(&mut discarding) {
                        buf.clear();
                        continue;
                    }
                    let size = buf.len();
                    let line = String::from_utf8_lossy(&buf)
                        .trim_end_matches(['\r', '\n'])
                        .to_string();
                    buf.clear();
                    self.stats.lock().record_received(size, Instant::now());
                    if line.is_empty() {
                        continue;
                    }
                    if self.debug {
                        tracing::debug!(address = %self.address, "<< {line}");
                    }
                    handler.line_received(self, line).await;
                }
                Ok(Err(e)) => {
                    read_errors += 1;
                    if read_errors >= MAX_READ_ERRORS {
                        return DisconnectReason::SocketError(e.to_string());
                    }
                    tracing::warn!(address = %self.address, error = %e, "Read error");
                }
            }
        }
    }

    /// A failed PING closes the socket through `send`; the read loop then
    /// stops with the write error.
    async fn check_connection(&self, keepalive: &mut Keepalive) {
        let recent = self.stats.lock().recent_activity(Instant::now());
        if !keepalive.tick(recent) {
            return;
        }
        self.stats.lock().mark_checked();
        tracing::debug!(address = %self.address, recent_activity = recent, "Idle, sending keepalive PING");
        if let Err(e) = self.send("PING").await {
            tracing::warn!(address = %self.address, error = %e, "Keepalive PING failed");
        }
    }
}

fn not_open() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "socket is not open")
}

async fn write_line(writer: &mut OwnedWriteHalf, data: &[u8]) -> io::Result<()> {
    writer.write_all(data).await?;
    writer.flush().await
}
