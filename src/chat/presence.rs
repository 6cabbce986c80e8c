//! Participant roster with split write authority.
//!
//! `hydrate_roster` (roster fetch) owns membership and `total_students`: it
//! replaces every entry. `merge_presence_event` (push feed) owns nothing but
//! the `online` flag; for a user the roster has not reported yet it appends a
//! provisional entry that the next hydrate either confirms or removes.
//! `online_students` is derived, never copied from the wire.

use std::collections::HashMap;

use super::model::{PresenceEntry, PresenceEvent, Role, Roster, UserId};

#[derive(Debug, Default)]
pub struct PresenceTracker {
    entries: HashMap<UserId, PresenceEntry>,
    total_students: u32,
    online_students: u32,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces membership and `total_students` with `roster`.
    ///
    /// The server's `online_students` is ignored and recomputed from the
    /// entries. If an id repeats, the last occurrence wins.
    pub fn hydrate_roster(&mut self, roster: Roster) {
        self.entries = roster
            .participants
            .into_iter()
            .map(|mut entry| {
                entry.provisional = false;
                (entry.user_id, entry)
            })
            .collect();
        self.total_students = roster.total_students;
        self.recompute();
    }

    /// Applies a push presence transition. Returns whether anything changed.
    pub fn merge_presence_event(&mut self, event: PresenceEvent) -> bool {
        let changed = match self.entries.get_mut(&event.user_id) {
            Some(entry) => {
                let changed = entry.online != event.online;
                entry.online = event.online;
                changed
            }
            None => {
                self.entries.insert(
                    event.user_id,
                    PresenceEntry {
                        user_id: event.user_id,
                        name: event.user_name,
                        role: event.role,
                        online: event.online,
                        provisional: true,
                    },
                );
                true
            }
        };
        self.recompute();
        changed
    }

    fn recompute(&mut self) {
        self.online_students = self
            .entries
            .values()
            .filter(|entry| entry.role == Role::Student && entry.online)
            .count() as u32;
    }

    pub fn total_students(&self) -> u32 {
        self.total_students
    }

    pub fn online_students(&self) -> u32 {
        self.online_students
    }

    pub fn entry(&self, user_id: UserId) -> Option<&PresenceEntry> {
        self.entries.get(&user_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Snapshot with participants in display order
    pub fn get(&self) -> Roster {
        let mut participants: Vec<PresenceEntry> = self.entries.values().cloned().collect();
        participants.sort_by(|a, b| a.display_order(b));

        Roster {
            total_students: self.total_students,
            online_students: self.online_students,
            participants,
        }
    }
}
