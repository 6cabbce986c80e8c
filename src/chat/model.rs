//! Room data model.
//!
//! Wire shapes (`*Dto`) mirror the backend's JSON exactly and are lenient:
//! every field is optional so a partial payload still deserializes. The
//! domain types are what the stores hold; getting from one to the other goes
//! through `TryFrom`, which is where required fields are enforced.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ChatError;

pub type RoomId = i64;
pub type MessageId = i64;
pub type UserId = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Teacher,
    Student,
    Unknown,
}

impl Role {
    /// Roles are compared case-insensitively, anything else is `Unknown`
    pub fn from_wire(raw: Option<&str>) -> Self {
        match raw.map(str::trim) {
            Some(r) if r.eq_ignore_ascii_case("TEACHER") => Role::Teacher,
            Some(r) if r.eq_ignore_ascii_case("STUDENT") => Role::Student,
            _ => Role::Unknown,
        }
    }

    fn display_rank(self) -> u8 {
        match self {
            Role::Teacher => 0,
            Role::Student => 1,
            Role::Unknown => 2,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Teacher => write!(f, "teacher"),
            Role::Student => write!(f, "student"),
            Role::Unknown => write!(f, "unknown"),
        }
    }
}

/// Response envelope used by every REST endpoint
#[derive(Debug, Clone, Deserialize)]
pub struct ApiEnvelope<T> {
    pub message: Option<String>,
    pub data: Option<T>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageDto {
    pub id: Option<MessageId>,
    pub subject_id: Option<RoomId>,
    pub sender_id: Option<UserId>,
    pub sender_name: Option<String>,
    pub sender_role: Option<String>,
    pub content: Option<String>,
    pub created_at: Option<String>,
    #[serde(default)]
    pub own: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceDto {
    pub user_id: Option<UserId>,
    pub subject_id: Option<RoomId>,
    pub user_name: Option<String>,
    pub role: Option<String>,
    #[serde(default)]
    pub online: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantDto {
    pub user_id: Option<UserId>,
    pub name: Option<String>,
    pub role: Option<String>,
    #[serde(default)]
    pub online: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RosterDto {
    #[serde(default)]
    pub total_students: u32,
    #[serde(default)]
    pub online_students: u32,
    #[serde(default)]
    pub participants: Vec<ParticipantDto>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SendMessageRequest<'a> {
    pub content: &'a str,
}

/// Body published to the chat send command destination
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatSendCommand<'a> {
    pub subject_id: RoomId,
    pub content: &'a str,
}

/// Body published to the presence update command destination
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceUpdateCommand {
    pub subject_id: RoomId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: MessageId,
    pub sender_id: Option<UserId>,
    pub sender_name: String,
    pub sender_role: Role,
    pub content: String,
    pub created_at: Option<String>,
    /// Supplied by the feed, never re-derived locally
    pub own: bool,
}

impl TryFrom<MessageDto> for Message {
    type Error = ChatError;

    fn try_from(dto: MessageDto) -> Result<Self, Self::Error> {
        let id = match dto.id {
            Some(id) if id != 0 => id,
            _ => return Err(ChatError::decode("message without id")),
        };

        Ok(Self {
            id,
            sender_id: dto.sender_id,
            sender_name: dto.sender_name.unwrap_or_default(),
            sender_role: Role::from_wire(dto.sender_role.as_deref()),
            content: dto.content.unwrap_or_default(),
            created_at: dto.created_at,
            own: dto.own,
        })
    }
}

/// Online/offline transition delivered on the presence feed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceEvent {
    pub user_id: UserId,
    pub user_name: String,
    pub role: Role,
    pub online: bool,
}

impl TryFrom<PresenceDto> for PresenceEvent {
    type Error = ChatError;

    fn try_from(dto: PresenceDto) -> Result<Self, Self::Error> {
        let user_id = match dto.user_id {
            Some(id) if id != 0 => id,
            _ => return Err(ChatError::decode("presence event without userId")),
        };

        Ok(Self {
            user_id,
            user_name: dto.user_name.unwrap_or_default(),
            role: Role::from_wire(dto.role.as_deref()),
            online: dto.online,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceEntry {
    pub user_id: UserId,
    pub name: String,
    pub role: Role,
    pub online: bool,
    /// Added from the push feed and not yet confirmed by a roster fetch
    pub provisional: bool,
}

impl PresenceEntry {
    /// Teachers first, then students, then by name
    pub fn display_order(&self, other: &Self) -> Ordering {
        self.role
            .display_rank()
            .cmp(&other.role.display_rank())
            .then_with(|| self.name.to_lowercase().cmp(&other.name.to_lowercase()))
            .then_with(|| self.name.cmp(&other.name))
            .then_with(|| self.user_id.cmp(&other.user_id))
    }
}

impl TryFrom<ParticipantDto> for PresenceEntry {
    type Error = ChatError;

    fn try_from(dto: ParticipantDto) -> Result<Self, Self::Error> {
        let user_id = match dto.user_id {
            Some(id) if id != 0 => id,
            _ => return Err(ChatError::decode("participant without userId")),
        };

        Ok(Self {
            user_id,
            name: dto.name.unwrap_or_default(),
            role: Role::from_wire(dto.role.as_deref()),
            online: dto.online,
            provisional: false,
        })
    }
}

/// Point-in-time view of the room's participants
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Roster {
    pub total_students: u32,
    pub online_students: u32,
    pub participants: Vec<PresenceEntry>,
}
