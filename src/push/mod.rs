mod connection;
mod frame;

pub use connection::{ConnectionManager, ConnectionState, PushSink};
pub use frame::{Command, Frame};

use crate::chat::model::RoomId;

/// Command destination for chat messages
pub const CHAT_SEND_DESTINATION: &str = "/app/chat.send";
/// Command destination that asks the server to broadcast our presence
pub const PRESENCE_UPDATE_DESTINATION: &str = "/app/presence.update";

/// Per-room topics and the subscription ids used for them
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomTopics {
    pub room_id: RoomId,
    pub messages: String,
    pub presence: String,
}

impl RoomTopics {
    pub const MESSAGES_SUBSCRIPTION: &'static str = "sub-chat";
    pub const PRESENCE_SUBSCRIPTION: &'static str = "sub-presence";

    pub fn for_room(room_id: RoomId) -> Self {
        Self {
            room_id,
            messages: format!("/topic/chat.{}", room_id),
            presence: format!("/topic/presence.{}", room_id),
        }
    }
}
