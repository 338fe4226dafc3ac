//! Presence and awareness for collaborative sessions
//!
//! Who is connected to a chapter, where their cursor is, and what they have
//! selected. Awareness is relayed by the document actor but never persisted.

use crate::{ItemId, ReplicaId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// User presence information
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserPresence {
    pub replica_id: ReplicaId,
    /// Application user id
    pub user_id: String,
    /// Display name
    pub name: String,
    /// Cursor/highlight color, derived from the replica id
    pub color: String,
    pub status: PresenceStatus,
    pub cursor: Option<CursorPosition>,
    pub selection: Option<SelectionRange>,
    pub last_seen: DateTime<Utc>,
}

impl UserPresence {
    pub fn new(replica_id: ReplicaId, user_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            replica_id,
            user_id: user_id.into(),
            name: name.into(),
            color: generate_color(&replica_id),
            status: PresenceStatus::Active,
            cursor: None,
            selection: None,
            last_seen: Utc::now(),
        }
    }

    pub fn touch(&mut self) {
        self.last_seen = Utc::now();
    }

    pub fn set_cursor(&mut self, position: CursorPosition) {
        self.cursor = Some(position);
        self.touch();
    }

    pub fn set_selection(&mut self, selection: SelectionRange) {
        self.selection = Some(selection);
        self.touch();
    }

    pub fn clear_selection(&mut self) {
        self.selection = None;
        self.touch();
    }

    pub fn set_status(&mut self, status: PresenceStatus) {
        self.status = status;
        self.touch();
    }

    pub fn is_online(&self, timeout: Duration) -> bool {
        let elapsed = Utc::now().signed_duration_since(self.last_seen);
        elapsed < chrono::Duration::from_std(timeout).unwrap_or(chrono::Duration::seconds(30))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceStatus {
    /// Typing
    #[default]
    Active,
    /// Reading only
    Viewing,
    Idle,
    Away,
}

/// Cursor position in a chapter.
///
/// `offset` is the visible index when the cursor was sent; `anchor` is the
/// item just left of the cursor, which stays meaningful while other replicas
/// edit (see [`TextDocument::index_of_anchor`](crate::TextDocument::index_of_anchor)).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorPosition {
    pub offset: u32,
    pub anchor: Option<ItemId>,
}

impl CursorPosition {
    pub fn new(offset: u32) -> Self {
        Self {
            offset,
            anchor: None,
        }
    }

    pub fn anchored(offset: u32, anchor: Option<ItemId>) -> Self {
        Self { offset, anchor }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectionRange {
    pub start: CursorPosition,
    pub end: CursorPosition,
}

impl SelectionRange {
    pub fn new(start: CursorPosition, end: CursorPosition) -> Self {
        Self { start, end }
    }

    pub fn is_collapsed(&self) -> bool {
        self.start.offset == self.end.offset
    }

    pub fn len(&self) -> u32 {
        self.end.offset.saturating_sub(self.start.offset)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Presence of the other replicas on a document, as seen by one client.
#[derive(Debug, Clone, Default)]
pub struct PresenceTable {
    users: HashMap<ReplicaId, UserPresence>,
}

impl PresenceTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, presence: UserPresence) {
        self.users.insert(presence.replica_id, presence);
    }

    pub fn remove(&mut self, replica_id: &ReplicaId) -> Option<UserPresence> {
        self.users.remove(replica_id)
    }

    pub fn get(&self, replica_id: &ReplicaId) -> Option<&UserPresence> {
        self.users.get(replica_id)
    }

    /// Users seen within `timeout`, ordered by name.
    pub fn online(&self, timeout: Duration) -> Vec<&UserPresence> {
        let mut online: Vec<_> = self
            .users
            .values()
            .filter(|u| u.is_online(timeout))
            .collect();
        online.sort_by(|a, b| a.name.cmp(&b.name));
        online
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    pub fn clear(&mut self) {
        self.users.clear();
    }

    pub fn cleanup_stale(&mut self, max_age: Duration) {
        let cutoff =
            Utc::now() - chrono::Duration::from_std(max_age).unwrap_or(chrono::Duration::hours(1));
        self.users.retain(|_, u| u.last_seen > cutoff);
    }
}

/// Stable color for a replica id
fn generate_color(replica_id: &ReplicaId) -> String {
    let bytes = replica_id.0.as_bytes();
    let hue = (bytes[0] as u32 * 256 + bytes[1] as u32) % 360;
    format!("hsl({}, 70%, 50%)", hue)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_presence() {
        let replica = ReplicaId::new();
        let mut presence = UserPresence::new(replica, "user-1", "Ada");

        assert_eq!(presence.status, PresenceStatus::Active);
        assert_eq!(presence.color, UserPresence::new(replica, "x", "y").color);

        presence.set_cursor(CursorPosition::new(10));
        presence.set_status(PresenceStatus::Viewing);
        assert_eq!(presence.cursor.map(|c| c.offset), Some(10));
        assert!(presence.is_online(Duration::from_secs(5)));
    }

    #[test]
    fn test_presence_table() {
        let mut table = PresenceTable::new();
        let a = ReplicaId::from_u128(1);
        let b = ReplicaId::from_u128(2);

        table.update(UserPresence::new(a, "u1", "Zoe"));
        table.update(UserPresence::new(b, "u2", "Ada"));
        assert_eq!(table.len(), 2);

        let names: Vec<_> = table
            .online(Duration::from_secs(30))
            .iter()
            .map(|u| u.name.as_str())
            .collect();
        assert_eq!(names, vec!["Ada", "Zoe"]);

        assert!(table.remove(&a).is_some());
        assert!(table.get(&a).is_none());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_cleanup_stale() {
        let mut table = PresenceTable::new();
        let mut old = UserPresence::new(ReplicaId::new(), "u", "Old");
        old.last_seen = Utc::now() - chrono::Duration::minutes(10);
        table.update(old);
        table.update(UserPresence::new(ReplicaId::new(), "v", "New"));

        table.cleanup_stale(Duration::from_secs(60));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_selection_range() {
        let selection = SelectionRange::new(CursorPosition::new(5), CursorPosition::new(10));
        assert_eq!(selection.len(), 5);
        assert!(!selection.is_collapsed());
    }
}
