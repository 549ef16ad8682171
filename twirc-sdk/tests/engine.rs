//! Engine tests against a scripted server on 127.0.0.1.
//!
//! Tests cover:
//! - Registration (PASS/NICK, 004) and the state sequence
//! - PING/PONG and the typed events for PRIVMSG, JOIN, MODE, 353, NOTICE
//! - Disconnect classification (requested, registration failed, unknown host)
//! - Disconnecting from a peer that stopped reading
//! - Scheduled and manual reconnects, address rotation, giving up
//!
//! Set `RUST_LOG=twirc_sdk=debug` to see the engine's logs in test output.

use std::collections::HashMap;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc::UnboundedReceiver;

use twirc_sdk::Error;
use twirc_sdk::client::Client;
use twirc_sdk::config::EngineConfig;
use twirc_sdk::event::Event;
use twirc_sdk::state::{ConnectionState, DisconnectReason};

const NICK: &str = "justinfan1";
const WAIT: Duration = Duration::from_secs(5);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

struct Peer {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl Peer {
    async fn accept(listener: &TcpListener) -> Self {
        let (stream, _) = tokio::time::timeout(WAIT, listener.accept())
            .await
            .expect("no connection")
            .unwrap();
        let (reader, writer) = stream.into_split();
        Self {
            reader: BufReader::new(reader),
            writer,
        }
    }

    /// Next line exactly as sent, terminator included.
    async fn raw_line(&mut self) -> String {
        let mut line = String::new();
        tokio::time::timeout(WAIT, self.reader.read_line(&mut line))
            .await
            .expect("no line from client")
            .unwrap();
        line
    }

    async fn line(&mut self) -> String {
        self.raw_line().await.trim_end_matches(['\r', '\n']).to_string()
    }

    async fn send(&mut self, line: &str) {
        self.writer.write_all(format!("{line}\r\n").as_bytes()).await.unwrap();
    }
}

/// Next event that is not a status message.
async fn next_event(events: &mut UnboundedReceiver<Event>) -> Event {
    loop {
        let event = tokio::time::timeout(WAIT, events.recv())
            .await
            .expect("no event")
            .expect("event channel closed");
        if !matches!(event, Event::SystemMessage { .. }) {
            return event;
        }
    }
}

async fn listen() -> (TcpListener, String) {
    init_tracing();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port().to_string();
    (listener, port)
}

struct Session {
    client: Client,
    events: UnboundedReceiver<Event>,
    listener: TcpListener,
    peer: Peer,
}

/// Connect and complete registration with the scripted server.
async fn registered(config: EngineConfig) -> Session {
    let (listener, port) = listen().await;
    let (client, mut events) = Client::new(config);
    client.connect("127.0.0.1", &port, NICK, None).await.unwrap();

    let mut peer = Peer::accept(&listener).await;
    assert!(matches!(next_event(&mut events).await, Event::Connected { .. }));
    assert_eq!(peer.line().await, format!("NICK {NICK}"));

    peer.send(&format!(":tmi.twitch.tv 004 {NICK} :-")).await;
    assert_eq!(
        next_event(&mut events).await,
        Event::Registered {
            nick: NICK.to_string()
        }
    );
    Session {
        client,
        events,
        listener,
        peer,
    }
}

#[tokio::test]
async fn registers_with_token_and_nick() {
    let (listener, port) = listen().await;
    let (client, mut events) = Client::new(EngineConfig::default());
    client
        .connect("127.0.0.1", &port, NICK, Some("oauth:secret"))
        .await
        .unwrap();

    let mut peer = Peer::accept(&listener).await;
    assert_eq!(
        next_event(&mut events).await,
        Event::Connected {
            address: format!("127.0.0.1:{port}")
        }
    );
    assert_eq!(client.state(), ConnectionState::Connected);
    assert_eq!(peer.raw_line().await, "PASS oauth:secret\r\n");
    assert_eq!(peer.raw_line().await, format!("NICK {NICK}\r\n"));

    peer.send(&format!(":tmi.twitch.tv 001 {NICK} :Welcome, GLHF!")).await;
    peer.send(&format!(":tmi.twitch.tv 004 {NICK} :-")).await;
    assert_eq!(
        next_event(&mut events).await,
        Event::Registered {
            nick: NICK.to_string()
        }
    );
    assert!(client.is_registered());
    assert_eq!(client.ip(), Some("127.0.0.1".parse().unwrap()));
    assert!(
        client
            .connection_info()
            .starts_with(&format!("Connected to 127.0.0.1:{port} (127.0.0.1) for "))
    );
}

#[tokio::test]
async fn connect_twice_is_refused() {
    let mut s = registered(EngineConfig::default()).await;
    assert_eq!(
        s.client.connect("127.0.0.1", "6667", NICK, None).await,
        Err(Error::AlreadyConnected)
    );
    s.peer.send("PING :still-here").await;
    assert_eq!(s.peer.line().await, "PONG :still-here");
}

#[tokio::test]
async fn ping_is_answered_with_pong() {
    let mut s = registered(EngineConfig::default()).await;
    s.peer.send("PING :tmi.twitch.tv").await;
    assert_eq!(s.peer.raw_line().await, "PONG :tmi.twitch.tv\r\n");
}

#[tokio::test]
async fn channel_messages_and_actions() {
    let mut s = registered(EngineConfig::default()).await;
    let prefix = "jtv!jtv@jtv.tmi.twitch.tv";

    s.peer.send(&format!(":{prefix} PRIVMSG #chan :\u{1}ACTION waves\u{1}")).await;
    assert_eq!(
        next_event(&mut s.events).await,
        Event::ChannelAction {
            channel: "#chan".to_string(),
            nick: "jtv".to_string(),
            prefix: prefix.to_string(),
            text: "waves".to_string(),
            tags: HashMap::new(),
        }
    );

    s.peer
        .send(&format!("@badges=;color=#FF0000 :{prefix} PRIVMSG #chan :hello there"))
        .await;
    match next_event(&mut s.events).await {
        Event::ChannelMessage {
            channel, nick, text, tags, ..
        } => {
            assert_eq!(channel, "#chan");
            assert_eq!(nick, "jtv");
            assert_eq!(text, "hello there");
            assert_eq!(tags.get("color").map(String::as_str), Some("#FF0000"));
        }
        other => panic!("unexpected event {other:?}"),
    }

    s.peer.send(&format!(":{prefix} PRIVMSG {NICK} :psst")).await;
    assert!(matches!(
        next_event(&mut s.events).await,
        Event::QueryMessage { text, .. } if text == "psst"
    ));
}

#[tokio::test]
async fn joins_parts_modes_and_userlists() {
    let mut s = registered(EngineConfig::default()).await;

    s.client.join_channel("chan").await;
    assert_eq!(s.peer.line().await, "JOIN #chan");
    s.peer.send(&format!(":{NICK}!{NICK}@{NICK}.tmi.twitch.tv JOIN #chan")).await;
    assert!(matches!(next_event(&mut s.events).await, Event::Joined { channel, .. } if channel == "#chan"));
    assert!(s.client.on_channel("#chan"));
    assert_eq!(s.client.channels(), vec!["#chan".to_string()]);

    // Channel in trailing position.
    s.peer.send(":jtv!jtv@jtv.tmi.twitch.tv JOIN :#chan").await;
    assert_eq!(
        next_event(&mut s.events).await,
        Event::Joined {
            channel: "#chan".to_string(),
            nick: "jtv".to_string(),
            prefix: "jtv!jtv@jtv.tmi.twitch.tv".to_string(),
        }
    );

    s.peer.send(":jtv MODE #chan +o somebody").await;
    assert_eq!(
        next_event(&mut s.events).await,
        Event::ModeChanged {
            channel: "#chan".to_string(),
            nick: "somebody".to_string(),
            added: true,
            mode: 'o',
            prefix: "jtv".to_string(),
        }
    );
    // Multi-flag changes are not reported.
    s.peer.send(":jtv MODE #chan +ov a b").await;

    s.peer.send(&format!(":{NICK}.tmi.twitch.tv 353 {NICK} = #chan :alice bob {NICK}")).await;
    assert_eq!(
        next_event(&mut s.events).await,
        Event::Userlist {
            channel: "#chan".to_string(),
            nicks: vec!["alice".to_string(), "bob".to_string(), NICK.to_string()],
        }
    );

    s.client.part_channel("#chan").await;
    assert_eq!(s.peer.line().await, "PART #chan");
    s.peer.send(&format!(":{NICK}!{NICK}@{NICK}.tmi.twitch.tv PART #chan :bye")).await;
    assert!(matches!(next_event(&mut s.events).await, Event::Parted { message, .. } if message == "bye"));
    assert!(!s.client.on_channel("chan"));
}

#[tokio::test]
async fn channel_notices_are_dropped_by_default() {
    let mut s = registered(EngineConfig::default()).await;
    s.peer.send(":tmi.twitch.tv NOTICE #chan :Now hosting someone").await;
    s.peer.send(":tmi.twitch.tv NOTICE * :Login unsuccessful").await;
    assert!(matches!(
        next_event(&mut s.events).await,
        Event::Notice { target, text, .. } if target == "*" && text == "Login unsuccessful"
    ));
}

#[tokio::test]
async fn channel_notices_can_be_enabled() {
    let config = EngineConfig {
        channel_notices: true,
        ..EngineConfig::default()
    };
    let mut s = registered(config).await;
    s.peer.send(":tmi.twitch.tv NOTICE #chan :Now hosting someone").await;
    assert!(matches!(
        next_event(&mut s.events).await,
        Event::Notice { target, .. } if target == "#chan"
    ));
}

#[tokio::test]
async fn malformed_lines_do_not_end_the_connection() {
    let mut s = registered(EngineConfig::default()).await;
    s.peer.send(":prefix-without-command").await;
    s.peer.send("PING :after").await;
    assert_eq!(s.peer.line().await, "PONG :after");
    assert!(s.client.is_registered());
}

#[tokio::test]
async fn disconnect_twice_reports_once() {
    let mut s = registered(EngineConfig::default()).await;
    s.client.disconnect().await;
    s.client.disconnect().await;

    assert_eq!(s.peer.line().await, "QUIT");
    assert_eq!(
        next_event(&mut s.events).await,
        Event::Disconnected {
            reason: DisconnectReason::RequestedDisconnect,
            message: "Disconnected".to_string(),
        }
    );
    assert!(s.client.is_offline());

    s.client.disconnect().await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    while let Ok(event) = s.events.try_recv() {
        assert!(!matches!(event, Event::Disconnected { .. }), "second disconnect: {event:?}");
    }
}

#[tokio::test]
async fn close_before_welcome_is_registration_failure() {
    let (listener, port) = listen().await;
    let (client, mut events) = Client::new(EngineConfig::default());
    client.connect("127.0.0.1", &port, NICK, Some("oauth:wrong")).await.unwrap();

    let mut peer = Peer::accept(&listener).await;
    assert!(matches!(next_event(&mut events).await, Event::Connected { .. }));
    assert_eq!(peer.line().await, "PASS oauth:wrong");
    assert_eq!(peer.line().await, format!("NICK {NICK}"));
    peer.send(":tmi.twitch.tv NOTICE * :Login authentication failed").await;
    drop(peer);

    assert!(matches!(next_event(&mut events).await, Event::Notice { .. }));
    match next_event(&mut events).await {
        Event::Disconnected { reason, .. } => assert_eq!(reason, DisconnectReason::RegistrationFailed),
        other => panic!("unexpected event {other:?}"),
    }
    assert_eq!(client.state(), ConnectionState::Offline);
}

#[tokio::test]
async fn close_after_welcome_is_connection_closed() {
    let Session {
        mut events, peer, ..
    } = registered(EngineConfig::default()).await;
    drop(peer);
    match next_event(&mut events).await {
        Event::Disconnected { reason, message } => {
            assert_eq!(reason, DisconnectReason::ConnectionClosed);
            assert_eq!(message, "Connection closed");
        }
        other => panic!("unexpected event {other:?}"),
    }
}

#[tokio::test]
async fn refused_connection_is_socket_error() {
    let (listener, port) = listen().await;
    drop(listener);
    let (client, mut events) = Client::new(EngineConfig::default());
    client.connect("127.0.0.1", &port, NICK, None).await.unwrap();
    assert!(matches!(
        next_event(&mut events).await,
        Event::Disconnected {
            reason: DisconnectReason::SocketError(_),
            ..
        }
    ));
    assert!(client.is_offline());
}

#[tokio::test]
async fn unresolvable_host_is_unknown_host() {
    init_tracing();
    let (client, mut events) = Client::new(EngineConfig::default());
    client.connect("no-such-host.invalid", "6667", NICK, None).await.unwrap();
    assert!(matches!(
        next_event(&mut events).await,
        Event::Disconnected {
            reason: DisconnectReason::UnknownHost,
            ..
        }
    ));
    // Unknown hosts wait the longest delay in the table.
    let config = EngineConfig::default();
    assert_eq!(
        client.schedule_reconnect(&DisconnectReason::UnknownHost),
        Ok(Duration::from_secs(*config.reconnect_delays.iter().max().unwrap()))
    );
    client.disconnect().await;
}

#[tokio::test]
async fn send_while_offline_is_a_no_op() {
    let Session {
        client,
        mut events,
        mut peer,
        ..
    } = registered(EngineConfig::default()).await;
    client.disconnect().await;
    assert_eq!(peer.line().await, "QUIT");
    assert!(matches!(next_event(&mut events).await, Event::Disconnected { .. }));

    client.send_message("#chan", "anyone?").await;
    client.send_action_message("#chan", "waves").await;
    assert_eq!(client.traffic(), None);
}

#[tokio::test]
async fn scheduled_reconnect_can_be_cancelled() {
    let config = EngineConfig {
        reconnect_delays: vec![60],
        ..EngineConfig::default()
    };
    let Session {
        client, mut events, peer, ..
    } = registered(config).await;
    drop(peer);
    let Event::Disconnected { reason, .. } = next_event(&mut events).await else {
        panic!("expected a disconnect");
    };

    assert_eq!(client.schedule_reconnect(&reason), Ok(Duration::from_secs(60)));
    assert_eq!(client.state(), ConnectionState::Reconnecting);
    assert_eq!(client.schedule_reconnect(&reason), Err(Error::ReconnectPending));

    client.disconnect().await;
    assert_eq!(client.state(), ConnectionState::Offline);
    assert_eq!(client.reconnect_attempts(), 0);
}

#[tokio::test]
async fn scheduled_reconnect_connects_again() {
    let config = EngineConfig {
        reconnect_delays: vec![1],
        ..EngineConfig::default()
    };
    let Session {
        client,
        mut events,
        listener,
        peer,
    } = registered(config).await;
    drop(peer);
    let Event::Disconnected { reason, .. } = next_event(&mut events).await else {
        panic!("expected a disconnect");
    };
    assert_eq!(client.schedule_reconnect(&reason), Ok(Duration::from_secs(1)));

    let mut peer = Peer::accept(&listener).await;
    assert!(matches!(next_event(&mut events).await, Event::Connected { .. }));
    assert_eq!(client.reconnect_attempts(), 1);
    assert_eq!(peer.line().await, format!("NICK {NICK}"));

    peer.send(&format!(":tmi.twitch.tv 004 {NICK} :-")).await;
    assert!(matches!(next_event(&mut events).await, Event::Registered { .. }));
    assert_eq!(client.reconnect_attempts(), 0);
}

#[tokio::test]
async fn registration_rejoins_channels_and_requests_caps() {
    let config = EngineConfig {
        capabilities: vec!["twitch.tv/tags".to_string(), "twitch.tv/commands".to_string()],
        ..EngineConfig::default()
    };
    let mut s = registered(config).await;
    assert_eq!(s.peer.line().await, "CAP REQ :twitch.tv/tags twitch.tv/commands");

    s.client.join_channel("#chan").await;
    assert_eq!(s.peer.line().await, "JOIN #chan");

    // Manual reconnect: the old connection is closed, a new one registers
    // and the wanted channel is joined again.
    s.client.reconnect().await.unwrap();
    assert_eq!(s.peer.line().await, "QUIT");
    assert_eq!(
        next_event(&mut s.events).await,
        Event::Disconnected {
            reason: DisconnectReason::RequestedReconnect,
            message: "Reconnecting".to_string(),
        }
    );

    let mut peer = Peer::accept(&s.listener).await;
    assert!(matches!(next_event(&mut s.events).await, Event::Connected { .. }));
    assert_eq!(peer.line().await, format!("NICK {NICK}"));
    peer.send(&format!(":tmi.twitch.tv 004 {NICK} :-")).await;
    assert!(matches!(next_event(&mut s.events).await, Event::Registered { .. }));
    assert_eq!(peer.line().await, "CAP REQ :twitch.tv/tags twitch.tv/commands");
    assert_eq!(peer.line().await, "JOIN #chan");
}

#[tokio::test]
async fn disconnect_does_not_wait_for_a_stalled_peer() {
    let Session {
        client,
        mut events,
        peer: _peer,
        ..
    } = registered(EngineConfig::default()).await;

    // The peer never reads again; keep writing until the kernel buffers are
    // full and the sender is stuck on the link.
    let flooder = client.clone();
    let flood = tokio::spawn(async move {
        let text = "x".repeat(64 * 1024);
        while !flooder.is_offline() {
            flooder.send_message("#chan", &text).await;
        }
    });
    tokio::time::sleep(Duration::from_secs(1)).await;

    tokio::time::timeout(WAIT, client.disconnect())
        .await
        .expect("disconnect hung");
    assert_eq!(
        next_event(&mut events).await,
        Event::Disconnected {
            reason: DisconnectReason::RequestedDisconnect,
            message: "Disconnected".to_string(),
        }
    );
    assert!(client.is_offline());
    tokio::time::timeout(WAIT, flood).await.expect("sender still blocked").unwrap();
}

#[tokio::test]
async fn refused_port_is_avoided_on_retry() {
    let (dead, dead_port) = listen().await;
    drop(dead);
    let (live, live_port) = listen().await;
    let config = EngineConfig {
        reconnect_delays: vec![1],
        ..EngineConfig::default()
    };
    let (client, mut events) = Client::new(config);
    client
        .connect("127.0.0.1", &format!("{dead_port},{live_port}"), NICK, None)
        .await
        .unwrap();

    let Event::Disconnected { reason, .. } = next_event(&mut events).await else {
        panic!("expected a disconnect");
    };
    assert!(matches!(reason, DisconnectReason::SocketError(_)));
    assert_eq!(client.schedule_reconnect(&reason), Ok(Duration::from_secs(1)));

    let mut peer = Peer::accept(&live).await;
    assert_eq!(
        next_event(&mut events).await,
        Event::Connected {
            address: format!("127.0.0.1:{live_port}")
        }
    );
    assert_eq!(peer.line().await, format!("NICK {NICK}"));
}

#[tokio::test]
async fn requested_disconnect_before_welcome_keeps_the_address() {
    let (first, first_port) = listen().await;
    let (_second, second_port) = listen().await;
    let ports = format!("{first_port},{second_port}");
    let (client, mut events) = Client::new(EngineConfig::default());

    client.connect("127.0.0.1", &ports, NICK, None).await.unwrap();
    let mut peer = Peer::accept(&first).await;
    assert!(matches!(next_event(&mut events).await, Event::Connected { .. }));
    assert_eq!(peer.line().await, format!("NICK {NICK}"));

    client.disconnect().await;
    assert_eq!(peer.line().await, "QUIT");
    assert!(matches!(
        next_event(&mut events).await,
        Event::Disconnected {
            reason: DisconnectReason::RequestedDisconnect,
            ..
        }
    ));

    // Same first choice, so nothing was held against it.
    client.connect("127.0.0.1", &ports, NICK, None).await.unwrap();
    let mut peer = Peer::accept(&first).await;
    assert_eq!(
        next_event(&mut events).await,
        Event::Connected {
            address: format!("127.0.0.1:{first_port}")
        }
    );
    assert_eq!(peer.line().await, format!("NICK {NICK}"));
}

#[tokio::test]
async fn reconnect_gives_up_after_max_attempts() {
    let (dead, port) = listen().await;
    drop(dead);
    let config = EngineConfig {
        reconnect_delays: vec![1],
        max_reconnect_attempts: 1,
        ..EngineConfig::default()
    };
    let (client, mut events) = Client::new(config);
    client.connect("127.0.0.1", &port, NICK, None).await.unwrap();

    let Event::Disconnected { reason, .. } = next_event(&mut events).await else {
        panic!("expected a disconnect");
    };
    assert_eq!(client.schedule_reconnect(&reason), Ok(Duration::from_secs(1)));

    let Event::Disconnected { reason, .. } = next_event(&mut events).await else {
        panic!("expected a second disconnect");
    };
    assert!(matches!(reason, DisconnectReason::SocketError(_)));
    assert_eq!(client.reconnect_attempts(), 1);
    assert_eq!(
        client.schedule_reconnect(&reason),
        Err(Error::AttemptsExhausted { attempts: 1 })
    );
    assert_eq!(client.state(), ConnectionState::Offline);

    let mut gave_up = false;
    while let Ok(event) = events.try_recv() {
        if let Event::SystemMessage { text } = event {
            gave_up |= text.starts_with("Gave up reconnecting");
        }
    }
    assert!(gave_up, "no give-up message");
}

#[tokio::test]
async fn events_serialize_with_type_and_data() {
    let event = Event::Disconnected {
        reason: DisconnectReason::SocketError("reset".to_string()),
        message: "Socket error: reset".to_string(),
    };
    let json = serde_json::to_value(&event).unwrap();
    assert_eq!(json["type"], "disconnected");
    assert_eq!(json["data"]["reason"]["kind"], "socket_error");
    assert_eq!(json["data"]["reason"]["detail"], "reset");
}
