pub mod api;
pub mod chat;
pub mod config;
pub mod error;
pub mod push;

pub use api::{ChatApi, HttpChatApi};
pub use chat::{ChatClient, RoomHandle, RoomSession, RoomUpdate};
pub use config::Config;
pub use error::{ChatError, Result};
pub use push::ConnectionState;
