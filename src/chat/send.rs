use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::session::{EventKind, RoomEvent, RoomShared};
use crate::api::ChatApi;
use crate::error::{ChatError, Result};
use crate::push::ConnectionManager;

/// Outbound path for the open room.
///
/// Publishes over push when connected and relies on the echo from the
/// message topic to populate the store. Otherwise posts over REST and merges
/// the returned copy directly. At most one send is in flight per room.
pub struct SendPipeline {
    api: Arc<dyn ChatApi>,
    token: String,
    connection: Option<Arc<ConnectionManager>>,
    shared: Arc<RoomShared>,
    in_flight: AtomicBool,
}

/// Clears the in-flight flag however the send ends
struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl SendPipeline {
    pub(crate) fn new(
        api: Arc<dyn ChatApi>,
        token: &str,
        connection: Option<Arc<ConnectionManager>>,
        shared: Arc<RoomShared>,
    ) -> Self {
        Self {
            api,
            token: token.to_string(),
            connection,
            shared,
            in_flight: AtomicBool::new(false),
        }
    }

    pub fn in_flight(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    pub async fn send(&self, content: &str) -> Result<()> {
        let content = content.trim();
        if content.is_empty() {
            return Err(ChatError::EmptyMessage);
        }

        if self.in_flight.swap(true, Ordering::AcqRel) {
            return Err(ChatError::SendInProgress);
        }
        let _guard = InFlight(&self.in_flight);

        let room_id = self.shared.room_id();

        if let Some(connection) = self.connection.as_ref().filter(|c| c.connected()) {
            match connection.publish_chat(content).await {
                Ok(()) => {
                    tracing::debug!(room_id, "Message published over push");
                    return Ok(());
                }
                Err(e) if e.is_transport() => {
                    tracing::warn!(room_id, error = %e, "Push publish failed, sending over REST");
                }
                Err(e) => return Err(e),
            }
        }

        let message = self.api.send_message(&self.token, room_id, content).await?;
        tracing::debug!(room_id, message_id = message.id, "Message sent over REST");
        self.shared
            .apply(RoomEvent::new(room_id, EventKind::Sent(message)))
            .await;
        Ok(())
    }
}
