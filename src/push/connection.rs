use std::sync::Arc;
use std::time::Duration;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, timeout, Instant};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use super::frame::{Command, Frame};
use super::{RoomTopics, CHAT_SEND_DESTINATION, PRESENCE_UPDATE_DESTINATION};
use crate::chat::model::{ChatSendCommand, PresenceUpdateCommand, RoomId};
use crate::error::{ChatError, Result};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsWrite = SplitSink<WsStream, WsMessage>;
type WsRead = SplitStream<WsStream>;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const TEARDOWN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Closed,
}

/// Receiver of everything the push transport produces for a room.
///
/// Called from the connection task; implementations must not block.
pub trait PushSink: Send + Sync + 'static {
    /// A MESSAGE frame from one of the room's subscriptions, undecoded
    fn frame(&self, frame: Frame);

    /// The server refused our credentials at the handshake
    fn auth_rejected(&self, reason: String);
}

struct Outbound {
    frame: Frame,
    ack: oneshot::Sender<Result<()>>,
}

enum Exit {
    Shutdown,
    Dropped,
}

/// Owns the push transport for one room.
///
/// `open` spawns a worker that connects, subscribes to the room's message and
/// presence topics, and reconnects after `reconnect_delay` whenever the link
/// is lost, for as long as the manager is open. `close` tears the link down
/// and waits for the worker to finish, so no sink callback can run after it
/// returns. Dropping the manager aborts the worker.
pub struct ConnectionManager {
    topics: RoomTopics,
    url: String,
    reconnect_delay: Duration,
    state: Arc<watch::Sender<ConnectionState>>,
    shutdown: watch::Sender<bool>,
    commands: mpsc::UnboundedSender<Outbound>,
    pending: Mutex<Option<mpsc::UnboundedReceiver<Outbound>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionManager {
    pub fn new(room_id: RoomId, url: impl Into<String>, reconnect_delay: Duration) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (shutdown, _) = watch::channel(false);
        let (commands, pending) = mpsc::unbounded_channel();

        Self {
            topics: RoomTopics::for_room(room_id),
            url: url.into(),
            reconnect_delay,
            state: Arc::new(state),
            shutdown,
            commands,
            pending: Mutex::new(Some(pending)),
            task: Mutex::new(None),
        }
    }

    /// Starts the connection worker. Calling it again, or after `close`, does nothing.
    pub async fn open(&self, token: &str, sink: Arc<dyn PushSink>) {
        let mut task = self.task.lock().await;
        if task.is_some() || self.state() == ConnectionState::Closed {
            return;
        }

        let Some(commands) = self.pending.lock().await.take() else {
            return;
        };

        self.state.send_replace(ConnectionState::Connecting);

        let worker = Worker {
            topics: self.topics.clone(),
            url: self.url.clone(),
            token: token.to_string(),
            reconnect_delay: self.reconnect_delay,
            state: self.state.clone(),
            shutdown: self.shutdown.subscribe(),
            commands,
            sink,
        };

        tracing::info!(room_id = self.topics.room_id, url = %self.url, "Opening push transport");
        *task = Some(tokio::spawn(worker.run()));
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Publishes a chat message on the command destination.
    ///
    /// Resolves once the frame is written; the persisted copy comes back on
    /// the message topic.
    pub async fn publish_chat(&self, content: &str) -> Result<()> {
        let body = serde_json::to_string(&ChatSendCommand {
            subject_id: self.topics.room_id,
            content,
        })?;
        self.publish(Frame::send_json(CHAT_SEND_DESTINATION, body)).await
    }

    async fn publish(&self, frame: Frame) -> Result<()> {
        if !self.connected() {
            return Err(ChatError::transport("push transport is not connected"));
        }

        let (ack, done) = oneshot::channel();
        self.commands
            .send(Outbound { frame, ack })
            .map_err(|_| ChatError::transport("push transport worker has stopped"))?;

        done.await
            .map_err(|_| ChatError::transport("push transport dropped the frame"))?
    }

    /// Unsubscribes, disconnects and stops the worker. Idempotent.
    pub async fn close(&self) {
        self.shutdown.send_replace(true);

        let handle = self.task.lock().await.take();
        if let Some(mut handle) = handle {
            if timeout(TEARDOWN_TIMEOUT, &mut handle).await.is_err() {
                tracing::warn!(room_id = self.topics.room_id, "Push teardown timed out, aborting worker");
                handle.abort();
            }
        }

        if self.state.send_replace(ConnectionState::Closed) != ConnectionState::Closed {
            tracing::info!(room_id = self.topics.room_id, "Push transport closed");
        }
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
        if let Some(handle) = self.task.get_mut().take() {
            handle.abort();
        }
        self.state.send_replace(ConnectionState::Closed);
    }
}

struct Worker {
    topics: RoomTopics,
    url: String,
    token: String,
    reconnect_delay: Duration,
    state: Arc<watch::Sender<ConnectionState>>,
    shutdown: watch::Receiver<bool>,
    commands: mpsc::UnboundedReceiver<Outbound>,
    sink: Arc<dyn PushSink>,
}

impl Worker {
    async fn run(mut self) {
        let room_id = self.topics.room_id;
        let mut attempt: u64 = 0;

        loop {
            attempt += 1;
            if attempt > 1 {
                tracing::info!(room_id, attempt, "Reconnecting push transport");
            }

            match self.connect_once().await {
                Ok(Exit::Shutdown) => break,
                Ok(Exit::Dropped) => {
                    tracing::warn!(room_id, "Push transport dropped by server");
                }
                Err(ChatError::Auth(reason)) => {
                    tracing::warn!(room_id, reason = %reason, "Push handshake rejected credentials");
                    self.sink.auth_rejected(reason);
                }
                Err(e) => {
                    tracing::warn!(room_id, error = %e, "Push transport failed");
                }
            }

            self.state.send_replace(ConnectionState::Reconnecting);
            if !self.wait_before_retry().await {
                break;
            }
        }

        self.state.send_replace(ConnectionState::Closed);
        tracing::debug!(room_id, "Push worker stopped");
    }

    /// Sleeps out the reconnect delay, refusing publishes meanwhile.
    /// Returns false when shutdown was requested.
    async fn wait_before_retry(&mut self) -> bool {
        let deadline = Instant::now() + self.reconnect_delay;
        loop {
            tokio::select! {
                _ = sleep_until(deadline) => return true,
                _ = shutdown_requested(&mut self.shutdown) => return false,
                Some(outbound) = self.commands.recv() => {
                    let _ = outbound.ack.send(Err(ChatError::transport("push transport is reconnecting")));
                }
            }
        }
    }

    async fn connect_once(&mut self) -> Result<Exit> {
        let stream = tokio::select! {
            result = connect_async(self.url.as_str()) => result?.0,
            _ = shutdown_requested(&mut self.shutdown) => return Ok(Exit::Shutdown),
        };
        let (mut write, mut read) = stream.split();

        let handshake = Frame::connect(host_of(&self.url), &self.token);
        write.send(WsMessage::Text(handshake.encode())).await?;

        let reply = tokio::select! {
            reply = timeout(HANDSHAKE_TIMEOUT, next_frame(&mut read)) => reply
                .map_err(|_| ChatError::transport("timed out waiting for CONNECTED"))??,
            _ = shutdown_requested(&mut self.shutdown) => return Ok(Exit::Shutdown),
        };

        match reply.command {
            Command::Connected => {}
            Command::Error => {
                let reason = reply
                    .get_header("message")
                    .map(str::to_string)
                    .unwrap_or_else(|| reply.body.clone());
                return Err(ChatError::Auth(reason));
            }
            other => {
                return Err(ChatError::transport(format!("expected CONNECTED, got {}", other)));
            }
        }

        for (id, destination) in [
            (RoomTopics::MESSAGES_SUBSCRIPTION, &self.topics.messages),
            (RoomTopics::PRESENCE_SUBSCRIPTION, &self.topics.presence),
        ] {
            write
                .send(WsMessage::Text(Frame::subscribe(id, destination).encode()))
                .await?;
        }

        self.state.send_replace(ConnectionState::Connected);
        tracing::info!(room_id = self.topics.room_id, "Push transport connected");

        // Ask the server to announce us to the room
        let presence = serde_json::to_string(&PresenceUpdateCommand {
            subject_id: self.topics.room_id,
        })?;
        write
            .send(WsMessage::Text(
                Frame::send_json(PRESENCE_UPDATE_DESTINATION, presence).encode(),
            ))
            .await?;

        loop {
            tokio::select! {
                incoming = read.next() => match incoming {
                    Some(Ok(WsMessage::Text(text))) => self.handle_text(&text)?,
                    Some(Ok(WsMessage::Close(_))) | None => return Ok(Exit::Dropped),
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e.into()),
                },
                Some(outbound) = self.commands.recv() => {
                    match write.send(WsMessage::Text(outbound.frame.encode())).await {
                        Ok(()) => {
                            let _ = outbound.ack.send(Ok(()));
                        }
                        Err(e) => {
                            let err = ChatError::from(e);
                            let _ = outbound.ack.send(Err(ChatError::transport(err.to_string())));
                            return Err(err);
                        }
                    }
                }
                _ = shutdown_requested(&mut self.shutdown) => {
                    teardown(&mut write).await;
                    return Ok(Exit::Shutdown);
                }
            }
        }
    }

    fn handle_text(&self, text: &str) -> Result<()> {
        match Frame::parse(text) {
            Ok(Some(frame)) => match frame.command {
                Command::Message => self.sink.frame(frame),
                Command::Error => {
                    let reason = frame.get_header("message").unwrap_or("ERROR frame").to_string();
                    return Err(ChatError::transport(reason));
                }
                Command::Receipt => {}
                other => {
                    tracing::debug!(command = %other, "Ignoring unexpected STOMP frame");
                }
            },
            Ok(None) => {}
            Err(e) => {
                tracing::debug!(room_id = self.topics.room_id, error = %e, "Dropping malformed push frame");
            }
        }
        Ok(())
    }
}

async fn teardown(write: &mut WsWrite) {
    for id in [RoomTopics::MESSAGES_SUBSCRIPTION, RoomTopics::PRESENCE_SUBSCRIPTION] {
        if write
            .send(WsMessage::Text(Frame::unsubscribe(id).encode()))
            .await
            .is_err()
        {
            return;
        }
    }
    let _ = write.send(WsMessage::Text(Frame::disconnect().encode())).await;
    let _ = write.close().await;
}

/// Next STOMP frame on the stream, skipping heart-beats and non-text messages
async fn next_frame(read: &mut WsRead) -> Result<Frame> {
    while let Some(message) = read.next().await {
        if let WsMessage::Text(text) = message? {
            if let Some(frame) = Frame::parse(&text)? {
                return Ok(frame);
            }
        }
    }
    Err(ChatError::transport("connection closed during handshake"))
}

/// Resolves once shutdown is flagged or the manager is gone
async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

fn host_of(url: &str) -> &str {
    let without_scheme = url.split_once("://").map(|(_, rest)| rest).unwrap_or(url);
    without_scheme.split(['/', '?']).next().unwrap_or(without_scheme)
}
