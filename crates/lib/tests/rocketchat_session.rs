//! Full Rocket.Chat session against a scripted local websocket server.

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use steward::channels::rocketchat::{Backoff, SessionState, SUBSCRIPTION_REFRESH_INTERVAL};
use steward::channels::{ChatBackend, DispatcherPorts, RocketChatBackend};
use steward::config::{Config, RocketChatConfig};
use steward::{handler, Orchestrator, Scheduler};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;

const WAIT: Duration = Duration::from_secs(5);

/// What the fake server saw from the client on connection `conn` (counted from 1).
#[derive(Debug, Clone, PartialEq)]
enum Seen {
    /// A connect, login, subscriptions/get or `sub:<room>` request.
    Call { conn: usize, what: String },
    Pong,
    Sent { rid: String, msg: String, emoji: String },
    Closed(usize),
}

/// How the fake server behaves.
#[derive(Clone, Default)]
struct Script {
    refuse_connect: bool,
    login_error: Option<&'static str>,
    /// Rooms returned by successive `subscriptions/get` calls; the last entry repeats.
    /// Empty means `room1` only.
    rooms: Vec<Vec<&'static str>>,
    /// Close the first connection once its first subscription is acknowledged.
    drop_first_connection: bool,
    /// After the first subscription: ping, then "ping" from the bot and from alice.
    chatter: bool,
}

impl Script {
    fn rooms_for(&self, call: usize) -> Vec<&'static str> {
        match self.rooms.get(call).or(self.rooms.last()) {
            Some(rooms) => rooms.clone(),
            None => vec!["room1"],
        }
    }
}

type ServerSocket = tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>;

async fn send(ws: &mut ServerSocket, frame: Value) {
    ws.send(Message::Text(frame.to_string()))
        .await
        .expect("server send");
}

/// Play a Rocket.Chat server following `script`, accepting connections one after another.
async fn fake_server(script: Script) -> (String, mpsc::UnboundedReceiver<Seen>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let url = format!("ws://{}/websocket", listener.local_addr().expect("addr"));
    let (seen_tx, seen_rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        let mut gets = 0;
        for conn in 1.. {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
                continue;
            };
            serve(conn, &mut ws, &script, &mut gets, &seen_tx).await;
            let _ = seen_tx.send(Seen::Closed(conn));
        }
    });
    (url, seen_rx)
}

async fn serve(
    conn: usize,
    ws: &mut ServerSocket,
    script: &Script,
    gets: &mut usize,
    seen: &mpsc::UnboundedSender<Seen>,
) {
    let record = |what: String| {
        let _ = seen.send(Seen::Call { conn, what });
    };
    let mut pushed = false;
    while let Some(Ok(message)) = ws.next().await {
        let Message::Text(text) = message else {
            continue;
        };
        let frame: Value = serde_json::from_str(&text).expect("client sends json");
        let id = frame["id"].clone();
        match (frame["msg"].as_str(), frame["method"].as_str()) {
            (Some("connect"), _) => {
                record("connect".to_string());
                let answer = if script.refuse_connect {
                    json!({"msg": "failed", "version": "1"})
                } else {
                    json!({"msg": "connected", "session": format!("s{}", conn)})
                };
                send(ws, answer).await;
            }
            (Some("method"), Some("login")) => {
                record("login".to_string());
                assert_eq!(frame["params"][0]["user"]["username"], "bot");
                let reply = match script.login_error {
                    Some(reason) => json!({"msg": "result", "id": id,
                        "error": {"error": 403, "reason": reason, "errorType": "Meteor.Error"}}),
                    None => json!({"msg": "result", "id": id, "result": {"id": "u1", "token": "t"}}),
                };
                send(ws, reply).await;
            }
            (Some("method"), Some("subscriptions/get")) => {
                record("subscriptions/get".to_string());
                let rooms: Vec<Value> = script
                    .rooms_for(*gets)
                    .into_iter()
                    .map(|rid| json!({"rid": rid}))
                    .collect();
                *gets += 1;
                send(ws, json!({"msg": "result", "id": id, "result": rooms})).await;
            }
            (Some("sub"), _) => {
                let room = frame["params"][0].as_str().unwrap_or_default().to_string();
                record(format!("sub:{}", room));
                send(ws, json!({"msg": "ready", "subs": [id]})).await;
                if pushed {
                    continue;
                }
                pushed = true;
                if script.drop_first_connection && conn == 1 {
                    let _ = ws.close(None).await;
                    return;
                }
                if script.chatter {
                    send(ws, json!({"msg": "ping"})).await;
                    for (user, text) in [("bot", "ping"), ("alice", "ping")] {
                        send(ws, json!({
                            "msg": "changed",
                            "collection": "stream-room-messages",
                            "id": "id",
                            "fields": {"eventName": room, "args": [
                                {"_id": "m", "rid": room, "msg": text, "u": {"username": user}}
                            ]}
                        }))
                        .await;
                    }
                }
            }
            (Some("method"), Some("sendMessage")) => {
                let p = &frame["params"][0];
                let _ = seen.send(Seen::Sent {
                    rid: p["rid"].as_str().unwrap_or_default().to_string(),
                    msg: p["msg"].as_str().unwrap_or_default().to_string(),
                    emoji: p["emoji"].as_str().unwrap_or_default().to_string(),
                });
                send(ws, json!({"msg": "result", "id": id})).await;
            }
            (Some("pong"), _) => {
                let _ = seen.send(Seen::Pong);
            }
            _ => {}
        }
    }
}

fn call(conn: usize, what: &str) -> Seen {
    Seen::Call {
        conn,
        what: what.to_string(),
    }
}

/// Collect server events until `stop` matches one, or panic after `WAIT`.
async fn events_until(
    seen: &mut mpsc::UnboundedReceiver<Seen>,
    stop: impl Fn(&Seen) -> bool,
) -> Vec<Seen> {
    let mut events = Vec::new();
    loop {
        let event = tokio::time::timeout(WAIT, seen.recv())
            .await
            .expect("server event in time")
            .expect("server alive");
        let done = stop(&event);
        events.push(event);
        if done {
            return events;
        }
    }
}

/// Everything the server reports within `window`.
async fn events_within(seen: &mut mpsc::UnboundedReceiver<Seen>, window: Duration) -> Vec<Seen> {
    let mut events = Vec::new();
    let deadline = tokio::time::Instant::now() + window;
    while let Ok(Some(event)) = tokio::time::timeout_at(deadline, seen.recv()).await {
        events.push(event);
    }
    events
}

/// A backend with short reconnect delays, outside any orchestrator. The returned
/// dispatcher ports must stay alive while the backend runs.
fn direct_backend(url: String) -> (RocketChatBackend, watch::Receiver<SessionState>, DispatcherPorts) {
    let (ports, dispatcher) = steward::channels::queue_pair(tokio::runtime::Handle::current());
    let backend = RocketChatBackend::with_backoff(
        RocketChatConfig::new(url, "bot", "pw"),
        ports,
        Backoff::new(Duration::from_millis(50), Duration::from_millis(200)),
    )
    .expect("backend");
    let states = backend.state_changes();
    (backend, states, dispatcher)
}

async fn wait_for(states: &mut watch::Receiver<SessionState>, wanted: SessionState) {
    tokio::time::timeout(WAIT, states.wait_for(|s| *s == wanted))
        .await
        .expect("state reached in time")
        .expect("session alive");
}

#[tokio::test]
async fn session_reaches_ready_and_answers_room_messages() {
    let (url, mut seen) = fake_server(Script {
        chatter: true,
        ..Script::default()
    })
    .await;
    let (states_tx, states_rx) = tokio::sync::oneshot::channel();

    let mut orchestrator = Orchestrator::new(Config::default());
    orchestrator.register(
        "ping",
        "answers pong",
        handler(|c| async move {
            c.send("pong").await?;
            Ok(())
        }),
    );
    orchestrator.add_custom_backend("rocketchat", move |ports| {
        let backend = RocketChatBackend::new(RocketChatConfig::new(url, "bot", "pw"), ports)?;
        let _ = states_tx.send(backend.state_changes());
        Ok(Arc::new(backend) as Arc<dyn ChatBackend>)
    });
    orchestrator.start(&Scheduler::current()).await.expect("start");
    let mut states = states_rx.await.expect("state watch");
    wait_for(&mut states, SessionState::Ready).await;

    let mut pongs = 0;
    let mut sent = Vec::new();
    while sent.is_empty() {
        match tokio::time::timeout(WAIT, seen.recv()).await.expect("server event") {
            Some(Seen::Pong) => pongs += 1,
            Some(Seen::Sent { rid, msg, emoji }) => sent.push((rid, msg, emoji)),
            Some(Seen::Call { .. }) => {}
            other => panic!("unexpected server event {:?}", other),
        }
    }
    assert_eq!(pongs, 1);
    assert_eq!(
        sent,
        vec![("room1".to_string(), "pong".to_string(), ":tophat:".to_string())]
    );
    // The bot's own "ping" in the room was not answered.
    assert!(tokio::time::timeout(Duration::from_millis(300), seen.recv())
        .await
        .is_err());

    orchestrator.stop().await;
    wait_for(&mut states, SessionState::Stopped).await;
}

#[tokio::test]
async fn rejected_login_ends_the_attempt() {
    let (url, mut seen) = fake_server(Script {
        login_error: Some("User not found"),
        ..Script::default()
    })
    .await;
    let (ports, _dispatcher) = steward::channels::queue_pair(tokio::runtime::Handle::current());
    let backend = RocketChatBackend::new(RocketChatConfig::new(url, "bot", "pw"), ports)
        .expect("backend");
    let mut states = backend.state_changes();
    backend.start().await.expect("start");

    let events = events_until(&mut seen, |e| matches!(e, Seen::Closed(_))).await;
    assert_eq!(
        events,
        vec![call(1, "connect"), call(1, "login"), Seen::Closed(1)]
    );
    // Back to Connecting, waiting out the reconnect delay; never Ready.
    wait_for(&mut states, SessionState::Connecting).await;
    assert_ne!(backend.state(), SessionState::Ready);
    backend.stop();
    wait_for(&mut states, SessionState::Stopped).await;
}

#[tokio::test]
async fn refused_connect_never_logs_in() {
    let (url, mut seen) = fake_server(Script {
        refuse_connect: true,
        ..Script::default()
    })
    .await;
    let (backend, mut states, _dispatcher) = direct_backend(url);
    backend.start().await.expect("start");

    let events = events_until(&mut seen, |e| matches!(e, Seen::Closed(_))).await;
    assert_eq!(events, vec![call(1, "connect"), Seen::Closed(1)]);
    // The next attempt is refused the same way.
    let events = events_until(&mut seen, |e| matches!(e, Seen::Closed(_))).await;
    assert_eq!(events, vec![call(2, "connect"), Seen::Closed(2)]);
    assert_ne!(backend.state(), SessionState::Ready);
    backend.stop();
    wait_for(&mut states, SessionState::Stopped).await;
}

#[tokio::test]
async fn dropped_connection_reconnects_and_resubscribes() {
    let (url, mut seen) = fake_server(Script {
        drop_first_connection: true,
        ..Script::default()
    })
    .await;
    let (backend, mut states, _dispatcher) = direct_backend(url);
    backend.start().await.expect("start");

    let first = events_until(&mut seen, |e| matches!(e, Seen::Closed(_))).await;
    assert_eq!(
        first,
        vec![
            call(1, "connect"),
            call(1, "login"),
            call(1, "subscriptions/get"),
            call(1, "sub:room1"),
            Seen::Closed(1),
        ]
    );
    let second = events_until(&mut seen, |e| *e == call(2, "sub:room1")).await;
    assert_eq!(
        second,
        vec![
            call(2, "connect"),
            call(2, "login"),
            call(2, "subscriptions/get"),
            call(2, "sub:room1"),
        ]
    );
    wait_for(&mut states, SessionState::Ready).await;
    backend.stop();
    wait_for(&mut states, SessionState::Stopped).await;
}

#[tokio::test]
async fn refresh_subscribes_rooms_joined_later_once() {
    let (url, mut seen) = fake_server(Script {
        rooms: vec![vec!["room1"], vec!["room1", "room2"]],
        ..Script::default()
    })
    .await;
    let (backend, mut states, _dispatcher) = direct_backend(url);
    backend.start().await.expect("start");
    wait_for(&mut states, SessionState::Ready).await;

    // Two refresh periods: the second listing brings room2, the third repeats it.
    let events = events_within(&mut seen, SUBSCRIPTION_REFRESH_INTERVAL * 2 + Duration::from_millis(500)).await;
    let count = |what: &str| events.iter().filter(|e| **e == call(1, what)).count();
    assert!(count("subscriptions/get") >= 2, "events: {:?}", events);
    assert_eq!(count("sub:room1"), 1, "events: {:?}", events);
    assert_eq!(count("sub:room2"), 1, "events: {:?}", events);
    assert!(!events.iter().any(|e| matches!(e, Seen::Closed(_))));
    backend.stop();
    wait_for(&mut states, SessionState::Stopped).await;
}
