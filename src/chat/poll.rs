use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use super::session::{EventKind, RoomEvent, RoomShared};
use crate::api::ChatApi;
use crate::error::ChatError;
use crate::push::ConnectionState;

/// Periodic presence refresh for the open room.
///
/// Each tick pings presence and reloads the roster, independent of the push
/// transport's health. When a push state feed is attached, the scheduler
/// also fetches messages newer than the last known id every time push
/// (re)subscribes.
pub struct PollScheduler {
    interval: Duration,
    poll_messages: bool,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl PollScheduler {
    pub fn new(interval: Duration, poll_messages: bool) -> Self {
        Self {
            interval,
            poll_messages,
            task: Mutex::new(None),
        }
    }

    /// Starts the timer; the first tick fires one interval from now. Idempotent.
    pub(crate) async fn start(
        &self,
        api: Arc<dyn ChatApi>,
        token: &str,
        shared: Arc<RoomShared>,
        push_state: Option<watch::Receiver<ConnectionState>>,
    ) {
        let mut task = self.task.lock().await;
        if task.is_some() {
            return;
        }

        let poller = Poller {
            api,
            token: token.to_string(),
            shared,
            poll_messages: self.poll_messages,
        };
        *task = Some(tokio::spawn(poller.run(self.interval, push_state)));
    }

    /// Stops the timer and waits until no tick is in progress. Idempotent.
    pub async fn stop(&self) {
        if let Some(handle) = self.task.lock().await.take() {
            handle.abort();
            let _ = handle.await;
        }
    }

    pub async fn is_running(&self) -> bool {
        self.task.lock().await.is_some()
    }
}

impl Drop for PollScheduler {
    fn drop(&mut self) {
        if let Some(handle) = self.task.get_mut().take() {
            handle.abort();
        }
    }
}

struct Poller {
    api: Arc<dyn ChatApi>,
    token: String,
    shared: Arc<RoomShared>,
    poll_messages: bool,
}

impl Poller {
    async fn run(self, period: Duration, mut push_state: Option<watch::Receiver<ConnectionState>>) {
        let room_id = self.shared.room_id();
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::debug!(room_id, period_ms = period.as_millis() as u64, "Poll scheduler started");

        loop {
            tokio::select! {
                _ = ticker.tick() => self.tick().await,
                // Anything posted while unsubscribed only reaches us through REST
                changed = next_state(&mut push_state) => match changed {
                    Some(ConnectionState::Connected) => {
                        tracing::debug!(room_id, "Push subscribed, fetching missed messages");
                        self.catch_up().await;
                    }
                    Some(_) => {}
                    None => push_state = None,
                },
            }
        }
    }

    async fn tick(&self) {
        let room_id = self.shared.room_id();

        if let Err(e) = self.api.ping_presence(&self.token, room_id).await {
            tracing::debug!(room_id, error = %e, "Presence ping failed");
        }

        match self.api.fetch_roster(&self.token, room_id).await {
            Ok(roster) => self
                .shared
                .deliver(RoomEvent::new(room_id, EventKind::Roster(roster))),
            Err(e) => self.report(e, "Roster refresh failed"),
        }

        if self.poll_messages {
            self.catch_up().await;
        }
    }

    /// Fetches messages newer than the newest one already held
    async fn catch_up(&self) {
        let room_id = self.shared.room_id();
        let after_id = self.shared.last_message_id().await;

        match self.api.fetch_messages(&self.token, room_id, after_id).await {
            Ok(messages) if messages.is_empty() => {}
            Ok(messages) => {
                tracing::debug!(room_id, count = messages.len(), "Fetched newer messages");
                self.shared
                    .deliver(RoomEvent::new(room_id, EventKind::Messages(messages)));
            }
            Err(e) => self.report(e, "Message catch-up failed"),
        }
    }

    fn report(&self, error: ChatError, context: &str) {
        let room_id = self.shared.room_id();
        match error {
            ChatError::Auth(reason) => {
                tracing::warn!(room_id, reason = %reason, "{}: credentials rejected", context);
                self.shared
                    .deliver(RoomEvent::new(room_id, EventKind::AuthRejected(reason)));
            }
            other => tracing::warn!(room_id, error = %other, "{}", context),
        }
    }
}

/// Next push state, or `None` once the feed is gone. Pends forever without a feed.
async fn next_state(
    states: &mut Option<watch::Receiver<ConnectionState>>,
) -> Option<ConnectionState> {
    match states {
        Some(rx) => match rx.changed().await {
            Ok(()) => Some(*rx.borrow_and_update()),
            Err(_) => None,
        },
        None => std::future::pending().await,
    }
}
