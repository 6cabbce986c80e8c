use std::collections::BTreeMap;

use super::model::{Message, MessageId};

/// Ordered, deduplicated message history for one room.
///
/// Keyed by id, so iteration order is the display order no matter which
/// channel delivered a message or when.
#[derive(Debug, Default)]
pub struct MessageStore {
    messages: BTreeMap<MessageId, Message>,
}

impl MessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the whole history with an authoritative fetch.
    ///
    /// Duplicate ids inside `initial` keep their first occurrence.
    pub fn hydrate(&mut self, initial: Vec<Message>) {
        self.messages.clear();
        for message in initial {
            self.messages.entry(message.id).or_insert(message);
        }
    }

    /// Inserts `message` if its id is unseen. Returns whether the store changed.
    pub fn merge(&mut self, message: Message) -> bool {
        if self.messages.contains_key(&message.id) {
            return false;
        }
        self.messages.insert(message.id, message);
        true
    }

    /// Merges a batch, returning how many messages were new
    pub fn merge_all(&mut self, messages: impl IntoIterator<Item = Message>) -> usize {
        let mut added = 0;
        for message in messages {
            if self.merge(message) {
                added += 1;
            }
        }
        added
    }

    /// Snapshot sorted ascending by id
    pub fn get(&self) -> Vec<Message> {
        self.messages.values().cloned().collect()
    }

    pub fn last_id(&self) -> Option<MessageId> {
        self.messages.keys().next_back().copied()
    }

    pub fn contains(&self, id: MessageId) -> bool {
        self.messages.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}
