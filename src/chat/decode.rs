//! Validation of inbound push frames.
//!
//! Nothing from the push transport reaches a store without passing through
//! [`decode_frame`]. Rejections carry a reason for the debug log and are
//! otherwise dropped by the caller.

use super::model::{Message, MessageDto, PresenceDto, PresenceEvent, RoomId};
use crate::error::{ChatError, Result};
use crate::push::{Command, Frame, RoomTopics};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushEvent {
    Message(Message),
    Presence(PresenceEvent),
}

pub fn decode_frame(topics: &RoomTopics, frame: &Frame) -> Result<PushEvent> {
    if frame.command != Command::Message {
        return Err(ChatError::decode(format!("not a MESSAGE frame: {}", frame.command)));
    }

    let destination = frame
        .get_header("destination")
        .ok_or_else(|| ChatError::decode("MESSAGE frame without destination"))?;

    if destination == topics.messages {
        let dto: MessageDto = serde_json::from_str(&frame.body)?;
        check_room(topics.room_id, dto.subject_id)?;
        Ok(PushEvent::Message(Message::try_from(dto)?))
    } else if destination == topics.presence {
        let dto: PresenceDto = serde_json::from_str(&frame.body)?;
        check_room(topics.room_id, dto.subject_id)?;
        Ok(PushEvent::Presence(PresenceEvent::try_from(dto)?))
    } else {
        Err(ChatError::decode(format!("unexpected destination {}", destination)))
    }
}

fn check_room(expected: RoomId, carried: Option<RoomId>) -> Result<()> {
    match carried {
        Some(room_id) if room_id != expected => Err(ChatError::decode(format!(
            "payload for room {} on room {} topic",
            room_id, expected
        ))),
        _ => Ok(()),
    }
}
