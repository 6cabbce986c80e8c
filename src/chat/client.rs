use std::sync::Arc;

use tokio::sync::Mutex;

use super::model::RoomId;
use super::session::RoomSession;
use crate::api::ChatApi;
use crate::config::ChatConfig;
use crate::error::Result;

pub type RoomHandle = Arc<RoomSession>;

/// Entry point for room chat. At most one room is open at a time.
pub struct ChatClient {
    api: Arc<dyn ChatApi>,
    config: ChatConfig,
    active: Mutex<Option<RoomHandle>>,
}

impl ChatClient {
    pub fn new(api: Arc<dyn ChatApi>, config: ChatConfig) -> Self {
        Self {
            api,
            config,
            active: Mutex::new(None),
        }
    }

    /// Opens `room_id`, fully closing the previously open room first
    pub async fn open_room(&self, room_id: RoomId, token: &str) -> Result<RoomHandle> {
        let mut active = self.active.lock().await;
        if let Some(previous) = active.take() {
            tracing::info!(from = previous.room_id(), to = room_id, "Switching rooms");
            previous.close().await;
        }

        let session = Arc::new(RoomSession::open(room_id, token, self.api.clone(), &self.config).await?);
        *active = Some(session.clone());
        Ok(session)
    }

    pub async fn close_room(&self, handle: &RoomHandle) {
        handle.close().await;

        let mut active = self.active.lock().await;
        if active.as_ref().is_some_and(|current| Arc::ptr_eq(current, handle)) {
            *active = None;
        }
    }

    pub async fn send(&self, handle: &RoomHandle, content: &str) -> Result<()> {
        handle.send(content).await
    }

    pub async fn active_room(&self) -> Option<RoomHandle> {
        self.active.lock().await.clone()
    }
}
