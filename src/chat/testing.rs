//! In-memory `ChatApi` for unit tests.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use super::model::{Message, MessageId, PresenceEntry, RoomId, Role, Roster, UserId};
use crate::api::ChatApi;
use crate::error::{ChatError, Result};

const TEACHER_ID: UserId = 100;
const STUDENT_IDS: std::ops::RangeInclusive<UserId> = 1..=8;

/// Fixed classroom: one teacher online, eight enrolled students of which
/// 1-4 are online, and a total of ten students on the subject.
pub struct FakeApi {
    history: Mutex<Vec<Message>>,
    online: Mutex<HashSet<UserId>>,
    fetch_failure: Mutex<Option<u16>>,
    fail_pings: AtomicBool,
    reject_roster: AtomicBool,
    last_after_id: Mutex<Option<MessageId>>,
    pings: AtomicUsize,
    sends: AtomicUsize,
}

impl FakeApi {
    pub fn with_history(ids: &[MessageId]) -> Self {
        Self {
            history: Mutex::new(ids.iter().map(|id| Self::message(*id, "earlier")).collect()),
            online: Mutex::new((1..=4).collect()),
            fetch_failure: Mutex::new(None),
            fail_pings: AtomicBool::new(false),
            reject_roster: AtomicBool::new(false),
            last_after_id: Mutex::new(None),
            pings: AtomicUsize::new(0),
            sends: AtomicUsize::new(0),
        }
    }

    pub fn message(id: MessageId, content: &str) -> Message {
        Message {
            id,
            sender_id: Some(1),
            sender_name: "student-01".to_string(),
            sender_role: Role::Student,
            content: content.to_string(),
            created_at: None,
            own: false,
        }
    }

    pub fn fail_fetches_with_status(&self, status: u16) {
        *self.fetch_failure.lock().unwrap() = Some(status);
    }

    pub fn fail_pings(&self) {
        self.fail_pings.store(true, Ordering::SeqCst);
    }

    pub fn reject_roster(&self) {
        self.reject_roster.store(true, Ordering::SeqCst);
    }

    pub fn set_online(&self, students: &[UserId]) {
        *self.online.lock().unwrap() = students.iter().copied().collect();
    }

    /// Stores a message as if another participant had sent it
    pub fn push_history(&self, id: MessageId) {
        self.history.lock().unwrap().push(Self::message(id, "later"));
    }

    pub fn last_after_id(&self) -> Option<MessageId> {
        *self.last_after_id.lock().unwrap()
    }

    pub fn pings(&self) -> usize {
        self.pings.load(Ordering::SeqCst)
    }

    pub fn sends(&self) -> usize {
        self.sends.load(Ordering::SeqCst)
    }

    fn roster(&self) -> Roster {
        let online = self.online.lock().unwrap();
        let mut participants = vec![PresenceEntry {
            user_id: TEACHER_ID,
            name: "Ms. Rao".to_string(),
            role: Role::Teacher,
            online: true,
            provisional: false,
        }];
        participants.extend(STUDENT_IDS.map(|id| PresenceEntry {
            user_id: id,
            name: format!("student-{:02}", id),
            role: Role::Student,
            online: online.contains(&id),
            provisional: false,
        }));

        Roster {
            total_students: 10,
            // deliberately wrong; the tracker recomputes it
            online_students: 99,
            participants,
        }
    }
}

#[async_trait]
impl ChatApi for FakeApi {
    async fn fetch_messages(
        &self,
        _token: &str,
        _room_id: RoomId,
        after_id: Option<MessageId>,
    ) -> Result<Vec<Message>> {
        if let Some(status) = *self.fetch_failure.lock().unwrap() {
            return Err(ChatError::request(Some(status), "fetch failed"));
        }
        *self.last_after_id.lock().unwrap() = after_id;

        Ok(self
            .history
            .lock()
            .unwrap()
            .iter()
            .filter(|m| after_id.map_or(true, |after| m.id > after))
            .cloned()
            .collect())
    }

    async fn send_message(&self, _token: &str, _room_id: RoomId, content: &str) -> Result<Message> {
        self.sends.fetch_add(1, Ordering::SeqCst);
        let mut history = self.history.lock().unwrap();
        let id = history.iter().map(|m| m.id).max().unwrap_or(0) + 1;
        let message = Message {
            own: true,
            ..Self::message(id, content)
        };
        history.push(message.clone());
        Ok(message)
    }

    async fn ping_presence(&self, _token: &str, _room_id: RoomId) -> Result<()> {
        self.pings.fetch_add(1, Ordering::SeqCst);
        if self.fail_pings.load(Ordering::SeqCst) {
            return Err(ChatError::request(Some(503), "ping failed"));
        }
        Ok(())
    }

    async fn fetch_roster(&self, _token: &str, _room_id: RoomId) -> Result<Roster> {
        if self.reject_roster.load(Ordering::SeqCst) {
            return Err(ChatError::Auth("token expired".to_string()));
        }
        if let Some(status) = *self.fetch_failure.lock().unwrap() {
            return Err(ChatError::request(Some(status), "fetch failed"));
        }
        Ok(self.roster())
    }
}
