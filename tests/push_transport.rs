// End-to-end tests against an in-process backend stub.
// The stub serves the REST endpoints and a STOMP-over-WebSocket endpoint with warp.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tokio::time::{sleep, timeout};
use warp::http::StatusCode;
use warp::ws::{Message as WsMessage, WebSocket};
use warp::{Filter, Reply};

use subject_chat::chat::MessageId;
use subject_chat::config::ChatConfig;
use subject_chat::{ChatClient, ChatError, ConnectionState, HttpChatApi, RoomHandle, RoomUpdate};

const GOOD_TOKEN: &str = "good-token";
const REVOKED_TOKEN: &str = "revoked-token";

struct Stub {
    next_id: AtomicI64,
    messages: Mutex<Vec<Value>>,
    online: Mutex<Vec<i64>>,
    connects: AtomicUsize,
    disconnects: AtomicUsize,
    rest_sends: AtomicUsize,
    catch_ups: AtomicUsize,
    subscriptions: Mutex<Vec<String>>,
    commands: Mutex<Vec<String>>,
    pushes: broadcast::Sender<(String, String)>,
    kills: broadcast::Sender<()>,
}

impl Stub {
    fn new() -> Arc<Self> {
        let (pushes, _) = broadcast::channel(64);
        let (kills, _) = broadcast::channel(4);
        Arc::new(Self {
            next_id: AtomicI64::new(1),
            messages: Mutex::new(Vec::new()),
            online: Mutex::new(vec![1]),
            connects: AtomicUsize::new(0),
            disconnects: AtomicUsize::new(0),
            rest_sends: AtomicUsize::new(0),
            catch_ups: AtomicUsize::new(0),
            subscriptions: Mutex::new(Vec::new()),
            commands: Mutex::new(Vec::new()),
            pushes,
            kills,
        })
    }

    /// Persists a message and broadcasts it on the room topic
    fn post(&self, room_id: i64, content: &str, broadcast: bool) -> Value {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let message = json!({
            "id": id,
            "subjectId": room_id,
            "senderId": 100,
            "senderName": "Ms. Rao",
            "senderRole": "TEACHER",
            "content": content,
            "createdAt": "2024-03-01T10:00:00Z",
            "own": false
        });
        self.messages.lock().unwrap().push(message.clone());
        if broadcast {
            self.publish(&format!("/topic/chat.{}", room_id), message.to_string());
        }
        message
    }

    fn publish(&self, destination: &str, body: String) {
        let _ = self.pushes.send((destination.to_string(), body));
    }

    fn drop_connections(&self) {
        let _ = self.kills.send(());
    }

    fn messages_after(&self, room_id: i64, after: Option<i64>) -> Vec<Value> {
        self.messages
            .lock()
            .unwrap()
            .iter()
            .filter(|m| m["subjectId"] == room_id)
            .filter(|m| after.map_or(true, |a| m["id"].as_i64().unwrap_or(0) > a))
            .cloned()
            .collect()
    }

    fn roster(&self) -> Value {
        let online = self.online.lock().unwrap();
        let students: Vec<Value> = (1..=3)
            .map(|id| {
                json!({
                    "userId": id,
                    "name": format!("student-{}", id),
                    "role": "STUDENT",
                    "online": online.contains(&id)
                })
            })
            .collect();
        let mut participants = vec![json!({"userId": 100, "name": "Ms. Rao", "role": "TEACHER", "online": true})];
        participants.extend(students);
        json!({"totalStudents": 3, "onlineStudents": online.len(), "participants": participants})
    }

    fn subscribed_to(&self, destination: &str) -> bool {
        self.subscriptions.lock().unwrap().iter().any(|d| d == destination)
    }

    fn received_command(&self, destination: &str) -> bool {
        self.command_count(destination) > 0
    }

    fn command_count(&self, destination: &str) -> usize {
        self.commands.lock().unwrap().iter().filter(|d| *d == destination).count()
    }

    /// Announces a guest on every presence update, as the server does for each joining client
    fn announce_guest(&self, room_id: i64) {
        let event = json!({
            "userId": 7,
            "subjectId": room_id,
            "userName": "guest-7",
            "role": "STUDENT",
            "online": true
        });
        self.publish(&format!("/topic/presence.{}", room_id), event.to_string());
    }
}

fn envelope(data: Value) -> warp::reply::Response {
    warp::reply::json(&json!({"message": "ok", "data": data})).into_response()
}

fn unauthorized() -> warp::reply::Response {
    warp::reply::with_status(
        warp::reply::json(&json!({"message": "Unauthorized", "data": null})),
        StatusCode::UNAUTHORIZED,
    )
    .into_response()
}

fn authorized(header: &Option<String>) -> bool {
    header.as_deref() != Some(format!("Bearer {}", REVOKED_TOKEN).as_str())
}

fn bearer() -> impl Filter<Extract = (Option<String>,), Error = warp::Rejection> + Clone {
    warp::header::optional::<String>("authorization")
}

async fn spawn_stub(stub: Arc<Stub>) -> SocketAddr {
    let with_stub = {
        let stub = stub.clone();
        warp::any().map(move || stub.clone())
    };

    let fetch = warp::path!("api" / "chat" / "subjects" / i64 / "messages")
        .and(warp::get())
        .and(warp::query::<HashMap<String, String>>())
        .and(bearer())
        .and(with_stub.clone())
        .map(|room_id: i64, query: HashMap<String, String>, auth: Option<String>, stub: Arc<Stub>| {
            if !authorized(&auth) {
                return unauthorized();
            }
            let after = query.get("afterId").and_then(|v| v.parse().ok());
            if after.is_some() {
                stub.catch_ups.fetch_add(1, Ordering::SeqCst);
            }
            envelope(Value::Array(stub.messages_after(room_id, after)))
        });

    let send = warp::path!("api" / "chat" / "subjects" / i64 / "messages")
        .and(warp::post())
        .and(warp::body::json())
        .and(bearer())
        .and(with_stub.clone())
        .map(|room_id: i64, body: Value, auth: Option<String>, stub: Arc<Stub>| {
            if !authorized(&auth) {
                return unauthorized();
            }
            stub.rest_sends.fetch_add(1, Ordering::SeqCst);
            let content = body["content"].as_str().unwrap_or_default().to_string();
            let mut message = stub.post(room_id, &content, true);
            message["own"] = json!(true);
            envelope(message)
        });

    let ping = warp::path!("api" / "chat" / "subjects" / i64 / "presence" / "ping")
        .and(warp::post())
        .and(bearer())
        .map(|_room_id: i64, auth: Option<String>| {
            if !authorized(&auth) {
                return unauthorized();
            }
            envelope(Value::Null)
        });

    let participants = warp::path!("api" / "chat" / "subjects" / i64 / "participants")
        .and(warp::get())
        .and(bearer())
        .and(with_stub.clone())
        .map(|_room_id: i64, auth: Option<String>, stub: Arc<Stub>| {
            if !authorized(&auth) {
                return unauthorized();
            }
            envelope(stub.roster())
        });

    let stomp = warp::path!("ws" / "websocket")
        .and(warp::ws())
        .and(with_stub)
        .map(|ws: warp::ws::Ws, stub: Arc<Stub>| {
            ws.on_upgrade(move |socket| stomp_session(socket, stub))
        });

    let routes = fetch.or(send).or(ping).or(participants).or(stomp);
    let (addr, server) = warp::serve(routes).bind_ephemeral(([127, 0, 0, 1], 0));
    tokio::spawn(server);
    addr
}

struct RawFrame {
    command: String,
    headers: HashMap<String, String>,
    body: String,
}

fn parse_frame(text: &str) -> Option<RawFrame> {
    let text = text.trim_end_matches('\0');
    let (head, body) = text.split_once("\n\n").unwrap_or((text, ""));
    let mut lines = head.lines();
    let command = lines.next()?.trim().to_string();
    if command.is_empty() {
        return None;
    }
    let headers = lines
        .filter_map(|line| line.split_once(':'))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    Some(RawFrame {
        command,
        headers,
        body: body.to_string(),
    })
}

async fn stomp_session(socket: WebSocket, stub: Arc<Stub>) {
    let (mut tx, mut rx) = socket.split();
    let mut pushes = stub.pushes.subscribe();
    let mut kills = stub.kills.subscribe();
    let mut subscribed: HashMap<String, String> = HashMap::new();
    let mut sequence = 0u64;

    loop {
        tokio::select! {
            incoming = rx.next() => {
                let Some(Ok(message)) = incoming else { break };
                let Ok(text) = message.to_str() else { continue };
                let Some(frame) = parse_frame(text) else { continue };
                let destination = frame.headers.get("destination").cloned().unwrap_or_default();

                match frame.command.as_str() {
                    "CONNECT" => {
                        stub.connects.fetch_add(1, Ordering::SeqCst);
                        let expected = format!("Bearer {}", GOOD_TOKEN);
                        if frame.headers.get("Authorization") != Some(&expected) {
                            let _ = tx
                                .send(WsMessage::text("ERROR\nmessage:Invalid token\n\n\0"))
                                .await;
                            break;
                        }
                        let _ = tx.send(WsMessage::text("CONNECTED\nversion:1.2\n\n\0")).await;
                    }
                    "SUBSCRIBE" => {
                        let id = frame.headers.get("id").cloned().unwrap_or_default();
                        stub.subscriptions.lock().unwrap().push(destination.clone());
                        subscribed.insert(destination, id);
                    }
                    "SEND" => {
                        stub.commands.lock().unwrap().push(destination.clone());
                        if destination == "/app/chat.send" {
                            let body: Value = serde_json::from_str(&frame.body).unwrap_or_default();
                            let room_id = body["subjectId"].as_i64().unwrap_or_default();
                            let content = body["content"].as_str().unwrap_or_default();
                            stub.post(room_id, content, true);
                        } else if destination == "/app/presence.update" {
                            let body: Value = serde_json::from_str(&frame.body).unwrap_or_default();
                            stub.announce_guest(body["subjectId"].as_i64().unwrap_or_default());
                        }
                    }
                    "DISCONNECT" => {
                        stub.disconnects.fetch_add(1, Ordering::SeqCst);
                        break;
                    }
                    _ => {}
                }
            }
            pushed = pushes.recv() => {
                let Ok((destination, body)) = pushed else { continue };
                if let Some(id) = subscribed.get(&destination) {
                    sequence += 1;
                    let frame = format!(
                        "MESSAGE\ndestination:{}\nsubscription:{}\nmessage-id:{}\ncontent-type:application/json\n\n{}\0",
                        destination, id, sequence, body
                    );
                    if tx.send(WsMessage::text(frame)).await.is_err() {
                        break;
                    }
                }
            }
            _ = kills.recv() => break,
        }
    }
}

fn chat_config(addr: SocketAddr) -> ChatConfig {
    ChatConfig {
        push_url: Some(format!("ws://{}/ws/websocket", addr)),
        poll_interval: Duration::from_secs(60),
        reconnect_delay: Duration::from_millis(50),
        poll_messages: false,
    }
}

fn client(addr: SocketAddr, config: ChatConfig) -> ChatClient {
    let api = HttpChatApi::with_timeout(&format!("http://{}", addr), Duration::from_secs(5)).unwrap();
    ChatClient::new(Arc::new(api), config)
}

async fn wait_until(what: &str, check: impl Fn() -> bool) {
    timeout(Duration::from_secs(5), async {
        while !check() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {}", what));
}

async fn wait_for_message(room: &RoomHandle, id: MessageId) {
    timeout(Duration::from_secs(5), async {
        while !room.messages().await.iter().any(|m| m.id == id) {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("message {} never arrived", id));
}

async fn ids(room: &RoomHandle) -> Vec<MessageId> {
    room.messages().await.iter().map(|m| m.id).collect()
}

#[tokio::test]
async fn test_room_connects_and_subscribes() {
    let stub = Stub::new();
    stub.post(5, "welcome", false);
    let addr = spawn_stub(stub.clone()).await;
    let client = client(addr, chat_config(addr));

    let room = client.open_room(5, GOOD_TOKEN).await.unwrap();
    assert_eq!(ids(&room).await, vec![1]);

    wait_until("connected", || room.connection_state() == ConnectionState::Connected).await;
    wait_until("presence update", || stub.received_command("/app/presence.update")).await;
    assert!(stub.subscribed_to("/topic/chat.5"));
    assert!(stub.subscribed_to("/topic/presence.5"));

    // First subscription also fetches whatever was posted since the initial load
    wait_until("catch-up fetch", || stub.catch_ups.load(Ordering::SeqCst) >= 1).await;

    client.close_room(&room).await;
    assert_eq!(room.connection_state(), ConnectionState::Closed);
    wait_until("disconnect frame", || stub.disconnects.load(Ordering::SeqCst) == 1).await;
}

#[tokio::test]
async fn test_push_send_is_stored_once_from_echo() {
    let stub = Stub::new();
    let addr = spawn_stub(stub.clone()).await;
    let client = client(addr, chat_config(addr));

    let room = client.open_room(5, GOOD_TOKEN).await.unwrap();
    wait_until("connected", || room.connection_state() == ConnectionState::Connected).await;
    wait_until("subscribed", || stub.subscribed_to("/topic/chat.5")).await;

    client.send(&room, "  hello class ").await.unwrap();
    wait_for_message(&room, 1).await;
    sleep(Duration::from_millis(50)).await;

    let messages = room.messages().await;
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].content, "hello class");
    assert_eq!(stub.rest_sends.load(Ordering::SeqCst), 0);
    assert!(stub.received_command("/app/chat.send"));

    client.close_room(&room).await;
}

#[tokio::test]
async fn test_republished_message_is_not_duplicated() {
    let stub = Stub::new();
    let addr = spawn_stub(stub.clone()).await;
    let config = chat_config(addr);
    let client = client(addr, config);

    let room = client.open_room(5, GOOD_TOKEN).await.unwrap();
    wait_until("connected", || room.connection_state() == ConnectionState::Connected).await;
    wait_until("subscribed", || stub.subscribed_to("/topic/chat.5")).await;

    // Someone else posts over REST; the stub echoes it on the topic as well
    stub.post(5, "from teacher", true);
    wait_for_message(&room, 1).await;
    stub.publish("/topic/chat.5", stub.messages_after(5, None)[0].to_string());
    sleep(Duration::from_millis(50)).await;

    assert_eq!(ids(&room).await, vec![1]);
    client.close_room(&room).await;
}

#[tokio::test]
async fn test_payload_for_other_room_is_ignored() {
    let stub = Stub::new();
    let addr = spawn_stub(stub.clone()).await;
    let client = client(addr, chat_config(addr));

    let room = client.open_room(5, GOOD_TOKEN).await.unwrap();
    wait_until("subscribed", || stub.subscribed_to("/topic/chat.5")).await;

    stub.publish(
        "/topic/chat.5",
        json!({"id": 40, "subjectId": 6, "content": "misrouted"}).to_string(),
    );
    stub.publish("/topic/chat.5", "{not json".to_string());
    stub.publish("/topic/chat.5", json!({"content": "no id"}).to_string());
    stub.publish(
        "/topic/chat.5",
        json!({"id": 41, "subjectId": 5, "content": "valid"}).to_string(),
    );

    wait_for_message(&room, 41).await;
    assert_eq!(ids(&room).await, vec![41]);
    client.close_room(&room).await;
}

#[tokio::test]
async fn test_reconnect_catches_up_without_duplicates() {
    let stub = Stub::new();
    stub.post(5, "first", false);
    let addr = spawn_stub(stub.clone()).await;
    let client = client(addr, chat_config(addr));

    let room = client.open_room(5, GOOD_TOKEN).await.unwrap();
    let mut updates = room.subscribe();
    wait_until("connected", || room.connection_state() == ConnectionState::Connected).await;
    wait_until("subscribed", || stub.subscribed_to("/topic/chat.5")).await;

    stub.post(5, "second", true);
    wait_for_message(&room, 2).await;

    // Never pushed, only reachable through the catch-up fetch
    stub.post(5, "missed", false);
    stub.drop_connections();
    wait_until("reconnected", || stub.connects.load(Ordering::SeqCst) >= 2).await;
    wait_until("connected again", || room.connection_state() == ConnectionState::Connected).await;
    wait_for_message(&room, 3).await;

    stub.post(5, "after", true);
    wait_for_message(&room, 4).await;
    assert_eq!(ids(&room).await, vec![1, 2, 3, 4]);

    // The guest is announced once per connection but listed once
    wait_until("second presence update", || stub.command_count("/app/presence.update") >= 2).await;
    timeout(Duration::from_secs(5), async {
        while !room.roster().await.participants.iter().any(|p| p.user_id == 7) {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("guest never listed");
    sleep(Duration::from_millis(50)).await;
    let roster = room.roster().await;
    let mut user_ids: Vec<_> = roster.participants.iter().map(|p| p.user_id).collect();
    user_ids.sort_unstable();
    user_ids.dedup();
    assert_eq!(user_ids.len(), roster.participants.len());
    assert_eq!(roster.participants.iter().filter(|p| p.user_id == 7).count(), 1);

    let mut saw_reconnecting = false;
    while let Ok(update) = updates.try_recv() {
        if update == RoomUpdate::Connection(ConnectionState::Reconnecting) {
            saw_reconnecting = true;
        }
    }
    assert!(saw_reconnecting);

    client.close_room(&room).await;
}

#[tokio::test]
async fn test_push_failure_does_not_stop_polling() {
    let stub = Stub::new();
    let addr = spawn_stub(stub.clone()).await;
    let config = ChatConfig {
        push_url: Some("ws://127.0.0.1:9/ws/websocket".to_string()),
        poll_interval: Duration::from_millis(100),
        reconnect_delay: Duration::from_millis(50),
        poll_messages: false,
    };
    let client = client(addr, config);

    let room = client.open_room(5, GOOD_TOKEN).await.unwrap();
    assert_eq!(room.roster().await.online_students, 1);

    *stub.online.lock().unwrap() = vec![1, 2, 3];
    timeout(Duration::from_secs(5), async {
        while room.roster().await.online_students != 3 {
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("roster never refreshed");

    assert_ne!(room.connection_state(), ConnectionState::Connected);

    // REST path is used while push is down
    client.send(&room, "still here").await.unwrap();
    assert_eq!(stub.rest_sends.load(Ordering::SeqCst), 1);
    assert_eq!(room.messages().await.len(), 1);

    client.close_room(&room).await;
}

#[tokio::test]
async fn test_handshake_rejection_is_reported() {
    let stub = Stub::new();
    let addr = spawn_stub(stub.clone()).await;
    let client = client(addr, chat_config(addr));

    let room = client.open_room(5, "stale-token").await.unwrap();

    let reason = timeout(Duration::from_secs(5), async {
        loop {
            if let Some(reason) = room.last_error().await {
                return reason;
            }
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("no auth rejection");

    assert_eq!(reason, "Invalid token");
    assert_ne!(room.connection_state(), ConnectionState::Connected);
    client.close_room(&room).await;
}

#[tokio::test]
async fn test_revoked_token_fails_open() {
    let stub = Stub::new();
    let addr = spawn_stub(stub.clone()).await;
    let client = client(addr, chat_config(addr));

    let result = client.open_room(5, REVOKED_TOKEN).await;
    assert!(matches!(result, Err(ChatError::Auth(_))));
    assert_eq!(stub.connects.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_switching_rooms_isolates_push_traffic() {
    let stub = Stub::new();
    let addr = spawn_stub(stub.clone()).await;
    let client = client(addr, chat_config(addr));

    let room_a = client.open_room(5, GOOD_TOKEN).await.unwrap();
    wait_until("room 5 subscribed", || stub.subscribed_to("/topic/chat.5")).await;

    let room_b = client.open_room(6, GOOD_TOKEN).await.unwrap();
    assert_eq!(room_a.connection_state(), ConnectionState::Closed);
    wait_until("room 6 subscribed", || stub.subscribed_to("/topic/chat.6")).await;

    stub.post(5, "for room 5", true);
    stub.post(6, "for room 6", true);
    wait_for_message(&room_b, 2).await;
    sleep(Duration::from_millis(50)).await;

    assert_eq!(ids(&room_b).await, vec![2]);
    assert!(room_a.messages().await.is_empty());

    client.close_room(&room_b).await;
}
