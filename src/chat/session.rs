use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;

use super::decode::{decode_frame, PushEvent};
use super::message_store::MessageStore;
use super::model::{Message, MessageId, RoomId, Roster};
use super::poll::PollScheduler;
use super::presence::PresenceTracker;
use super::send::SendPipeline;
use crate::api::ChatApi;
use crate::config::ChatConfig;
use crate::error::{ChatError, Result};
use crate::push::{ConnectionManager, ConnectionState, Frame, PushSink, RoomTopics};

const UPDATE_CHANNEL_CAPACITY: usize = 64;

/// Change notifications for whoever renders the room
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoomUpdate {
    Messages,
    Roster,
    Connection(ConnectionState),
    AuthRejected(String),
}

#[derive(Debug)]
pub(crate) enum EventKind {
    Push(PushEvent),
    Roster(Roster),
    /// Incremental fetch after the newest known id
    Messages(Vec<Message>),
    /// Stored copy returned by the REST send path
    Sent(Message),
    AuthRejected(String),
}

/// Every store mutation is one of these, tagged with the room it was produced for
#[derive(Debug)]
pub(crate) struct RoomEvent {
    pub room_id: RoomId,
    pub kind: EventKind,
}

impl RoomEvent {
    pub fn new(room_id: RoomId, kind: EventKind) -> Self {
        Self { room_id, kind }
    }
}

#[derive(Debug, Default)]
struct RoomState {
    messages: MessageStore,
    presence: PresenceTracker,
    last_error: Option<String>,
}

impl RoomState {
    fn apply(&mut self, kind: EventKind) -> Option<RoomUpdate> {
        match kind {
            EventKind::Push(PushEvent::Message(message)) | EventKind::Sent(message) => {
                self.messages.merge(message).then_some(RoomUpdate::Messages)
            }
            EventKind::Push(PushEvent::Presence(event)) => self
                .presence
                .merge_presence_event(event)
                .then_some(RoomUpdate::Roster),
            EventKind::Messages(batch) => {
                (self.messages.merge_all(batch) > 0).then_some(RoomUpdate::Messages)
            }
            EventKind::Roster(roster) => {
                self.presence.hydrate_roster(roster);
                Some(RoomUpdate::Roster)
            }
            EventKind::AuthRejected(reason) => {
                self.last_error = Some(reason.clone());
                Some(RoomUpdate::AuthRejected(reason))
            }
        }
    }
}

/// State shared by the session and the tasks feeding it
pub(crate) struct RoomShared {
    room_id: RoomId,
    state: RwLock<RoomState>,
    closed: AtomicBool,
    updates: broadcast::Sender<RoomUpdate>,
    inbox: mpsc::UnboundedSender<RoomEvent>,
}

impl RoomShared {
    pub fn room_id(&self) -> RoomId {
        self.room_id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Queues an event for the session's consumer
    pub fn deliver(&self, event: RoomEvent) {
        if self.inbox.send(event).is_err() {
            tracing::debug!(room_id = self.room_id, "Room inbox closed, dropping event");
        }
    }

    /// The single mutation entry point. Events for another room, or arriving
    /// after close, are discarded.
    pub async fn apply(&self, event: RoomEvent) -> bool {
        if event.room_id != self.room_id {
            tracing::debug!(
                room_id = self.room_id,
                event_room_id = event.room_id,
                "Discarding event tagged for another room"
            );
            return false;
        }

        let update = {
            let mut state = self.state.write().await;
            if self.is_closed() {
                tracing::debug!(room_id = self.room_id, "Discarding event for closed room");
                return false;
            }
            state.apply(event.kind)
        };

        match update {
            Some(update) => {
                self.notify(update);
                true
            }
            None => false,
        }
    }

    pub fn notify(&self, update: RoomUpdate) {
        let _ = self.updates.send(update);
    }

    pub async fn last_message_id(&self) -> Option<MessageId> {
        self.state.read().await.messages.last_id()
    }
}

/// Forwards push frames into the room inbox through the decode step
struct InboxSink {
    topics: RoomTopics,
    shared: Arc<RoomShared>,
}

impl PushSink for InboxSink {
    fn frame(&self, frame: Frame) {
        match decode_frame(&self.topics, &frame) {
            Ok(event) => self
                .shared
                .deliver(RoomEvent::new(self.topics.room_id, EventKind::Push(event))),
            Err(e) => {
                tracing::debug!(room_id = self.topics.room_id, error = %e, "Dropping push payload");
            }
        }
    }

    fn auth_rejected(&self, reason: String) {
        self.shared
            .deliver(RoomEvent::new(self.topics.room_id, EventKind::AuthRejected(reason)));
    }
}

/// Everything that exists for one open room.
///
/// Owns the push connection, the poll timer and the stores. `close` releases
/// all of them and is also what `Drop` falls back to, without waiting.
pub struct RoomSession {
    shared: Arc<RoomShared>,
    connection: Option<Arc<ConnectionManager>>,
    poller: PollScheduler,
    sender: SendPipeline,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl RoomSession {
    /// Fetches history and roster, then starts push and poll.
    ///
    /// Fails if either fetch fails; the presence ping is best effort.
    pub async fn open(
        room_id: RoomId,
        token: &str,
        api: Arc<dyn ChatApi>,
        config: &ChatConfig,
    ) -> Result<Self> {
        let (ping, messages, roster) = tokio::join!(
            api.ping_presence(token, room_id),
            api.fetch_messages(token, room_id, None),
            api.fetch_roster(token, room_id),
        );
        if let Err(e) = ping {
            tracing::debug!(room_id, error = %e, "Initial presence ping failed");
        }
        let messages = messages?;
        let roster = roster?;

        let mut state = RoomState::default();
        state.messages.hydrate(messages);
        state.presence.hydrate_roster(roster);

        let (inbox, mut inbox_rx) = mpsc::unbounded_channel();
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        let shared = Arc::new(RoomShared {
            room_id,
            state: RwLock::new(state),
            closed: AtomicBool::new(false),
            updates,
            inbox,
        });

        let mut tasks = Vec::new();

        let consumer = shared.clone();
        tasks.push(tokio::spawn(async move {
            while let Some(event) = inbox_rx.recv().await {
                consumer.apply(event).await;
            }
        }));

        let connection = config.push_url.as_ref().map(|url| {
            Arc::new(ConnectionManager::new(room_id, url, config.reconnect_delay))
        });

        // Subscribed before the worker starts so the first Connected is observed
        let push_state = connection.as_ref().map(|c| c.watch_state());
        let poller = PollScheduler::new(config.poll_interval, config.poll_messages);
        poller.start(api.clone(), token, shared.clone(), push_state).await;

        match &connection {
            Some(manager) => {
                tasks.push(spawn_state_forwarder(manager.watch_state(), shared.clone()));
                let sink = Arc::new(InboxSink {
                    topics: RoomTopics::for_room(room_id),
                    shared: shared.clone(),
                });
                manager.open(token, sink).await;
            }
            None => {
                tracing::info!(room_id, "Push disabled, room runs on polling only");
            }
        }

        let sender = SendPipeline::new(api, token, connection.clone(), shared.clone());

        tracing::info!(room_id, "Room opened");
        Ok(Self {
            shared,
            connection,
            poller,
            sender,
            tasks: Mutex::new(tasks),
        })
    }

    pub fn room_id(&self) -> RoomId {
        self.shared.room_id
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    pub async fn messages(&self) -> Vec<Message> {
        self.shared.state.read().await.messages.get()
    }

    pub async fn roster(&self) -> Roster {
        self.shared.state.read().await.presence.get()
    }

    /// Most recent auth rejection seen by push or poll
    pub async fn last_error(&self) -> Option<String> {
        self.shared.state.read().await.last_error.clone()
    }

    pub fn connection_state(&self) -> ConnectionState {
        match &self.connection {
            Some(connection) => connection.state(),
            None if self.is_closed() => ConnectionState::Closed,
            None => ConnectionState::Disconnected,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RoomUpdate> {
        self.shared.updates.subscribe()
    }

    pub async fn send(&self, content: &str) -> Result<()> {
        if self.is_closed() {
            return Err(ChatError::RoomClosed(self.room_id()));
        }
        self.sender.send(content).await
    }

    /// Stops polling, closes the push transport and the consumer. Idempotent.
    pub async fn close(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        self.poller.stop().await;
        if let Some(connection) = &self.connection {
            connection.close().await;
        }
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }

        self.shared.notify(RoomUpdate::Connection(ConnectionState::Closed));
        tracing::info!(room_id = self.room_id(), "Room closed");
    }

    #[cfg(test)]
    pub(crate) fn shared(&self) -> &Arc<RoomShared> {
        &self.shared
    }
}

impl Drop for RoomSession {
    fn drop(&mut self) {
        self.shared.closed.store(true, Ordering::Release);
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

fn spawn_state_forwarder(
    mut states: watch::Receiver<ConnectionState>,
    shared: Arc<RoomShared>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while states.changed().await.is_ok() {
            let state = *states.borrow_and_update();
            tracing::debug!(room_id = shared.room_id(), state = ?state, "Connection state changed");
            shared.notify(RoomUpdate::Connection(state));
        }
    })
}
