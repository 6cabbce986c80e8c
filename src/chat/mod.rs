//! Per-room chat state and the tasks that keep it current.

mod client;
mod decode;
mod message_store;
pub mod model;
mod poll;
mod presence;
mod send;
mod session;
#[cfg(test)]
mod testing;

pub use client::{ChatClient, RoomHandle};
pub use decode::{decode_frame, PushEvent};
pub use message_store::MessageStore;
pub use model::{Message, MessageId, PresenceEntry, PresenceEvent, Role, RoomId, Roster, UserId};
pub use poll::PollScheduler;
pub use presence::PresenceTracker;
pub use send::SendPipeline;
pub use session::{RoomSession, RoomUpdate};
