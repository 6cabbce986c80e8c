//! REST side of the backend chat service.

mod rest;

pub use rest::HttpChatApi;

use async_trait::async_trait;

use crate::chat::model::{Message, MessageId, RoomId, Roster};
use crate::error::Result;

/// Room-scoped REST calls the client depends on.
///
/// Every call carries the caller's bearer token; a 401 surfaces as
/// [`ChatError::Auth`](crate::error::ChatError::Auth).
#[async_trait]
pub trait ChatApi: Send + Sync {
    /// Messages in ascending id order, only those after `after_id` when given
    async fn fetch_messages(
        &self,
        token: &str,
        room_id: RoomId,
        after_id: Option<MessageId>,
    ) -> Result<Vec<Message>>;

    /// Persists a message and returns the stored copy
    async fn send_message(&self, token: &str, room_id: RoomId, content: &str) -> Result<Message>;

    /// Marks the caller as present in the room
    async fn ping_presence(&self, token: &str, room_id: RoomId) -> Result<()>;

    async fn fetch_roster(&self, token: &str, room_id: RoomId) -> Result<Roster>;
}
