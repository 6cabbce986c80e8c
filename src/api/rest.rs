use std::time::Duration;

use async_trait::async_trait;
use reqwest::{RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;

use super::ChatApi;
use crate::chat::model::{
    ApiEnvelope, Message, MessageDto, MessageId, PresenceEntry, RoomId, Roster, RosterDto,
    SendMessageRequest,
};
use crate::config::ApiConfig;
use crate::error::{ChatError, Result};

/// `ChatApi` over HTTP with reqwest
pub struct HttpChatApi {
    base_url: String,
    client: reqwest::Client,
}

impl HttpChatApi {
    pub fn new(config: &ApiConfig) -> Result<Self> {
        Self::with_timeout(&config.base_url, config.request_timeout)
    }

    pub fn with_timeout(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| {
                ChatError::InvalidConfiguration(format!("Failed to create HTTP client: {}", e))
            })?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    fn room_url(&self, room_id: RoomId, path: &str) -> String {
        format!("{}/api/chat/subjects/{}/{}", self.base_url, room_id, path)
    }

    /// Sends the request and unwraps the `{message, data}` envelope
    async fn execute<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
        token: &str,
    ) -> Result<Option<T>> {
        let response = request.bearer_auth(token).send().await?;
        let status = response.status();

        if status == StatusCode::UNAUTHORIZED {
            return Err(ChatError::Auth(format!("{} rejected the token", response.url().path())));
        }

        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(ChatError::request(
                Some(status.as_u16()),
                server_message(&error_text).unwrap_or(error_text),
            ));
        }

        let envelope: ApiEnvelope<T> = response.json().await.map_err(|e| {
            ChatError::request(Some(status.as_u16()), format!("Failed to parse response: {}", e))
        })?;
        Ok(envelope.data)
    }
}

#[async_trait]
impl ChatApi for HttpChatApi {
    async fn fetch_messages(
        &self,
        token: &str,
        room_id: RoomId,
        after_id: Option<MessageId>,
    ) -> Result<Vec<Message>> {
        let mut request = self.client.get(self.room_url(room_id, "messages"));
        if let Some(after_id) = after_id {
            request = request.query(&[("afterId", after_id)]);
        }

        let dtos: Vec<MessageDto> = self.execute(request, token).await?.unwrap_or_default();
        Ok(dtos
            .into_iter()
            .filter_map(|dto| match Message::try_from(dto) {
                Ok(message) => Some(message),
                Err(e) => {
                    tracing::warn!(room_id, error = %e, "Skipping invalid message in history");
                    None
                }
            })
            .collect())
    }

    async fn send_message(&self, token: &str, room_id: RoomId, content: &str) -> Result<Message> {
        let request = self
            .client
            .post(self.room_url(room_id, "messages"))
            .json(&SendMessageRequest { content });

        let dto: MessageDto = self
            .execute(request, token)
            .await?
            .ok_or_else(|| ChatError::request(None, "send returned no message"))?;
        Message::try_from(dto)
    }

    async fn ping_presence(&self, token: &str, room_id: RoomId) -> Result<()> {
        let request = self.client.post(self.room_url(room_id, "presence/ping"));
        self.execute::<serde_json::Value>(request, token).await?;
        Ok(())
    }

    async fn fetch_roster(&self, token: &str, room_id: RoomId) -> Result<Roster> {
        let request = self.client.get(self.room_url(room_id, "participants"));
        let dto: RosterDto = self.execute(request, token).await?.unwrap_or_default();
        Ok(roster_from_dto(room_id, dto))
    }
}

fn roster_from_dto(room_id: RoomId, dto: RosterDto) -> Roster {
    let participants = dto
        .participants
        .into_iter()
        .filter_map(|p| match PresenceEntry::try_from(p) {
            Ok(entry) => Some(entry),
            Err(e) => {
                tracing::warn!(room_id, error = %e, "Skipping invalid participant");
                None
            }
        })
        .collect();

    Roster {
        total_students: dto.total_students,
        online_students: dto.online_students,
        participants,
    }
}

/// Pulls `message` out of an error body shaped like the success envelope
fn server_message(body: &str) -> Option<String> {
    serde_json::from_str::<ApiEnvelope<serde_json::Value>>(body)
        .ok()
        .and_then(|envelope| envelope.message)
}
