//! Presence registry: who is in the document, where their cursor is,
//! and what their IME is composing.
//!
//! One registry per document, owned by the document actor. Joins get a
//! full snapshot; everything after is broadcast as diffs:
//! ```text
//! join          ──► presence_snapshot (full list) + diff.added
//! cursor / ime  ──► diff.updated   (last-writer-wins per field)
//! profile       ──► diff.updated   (label/color sanitized)
//! leave / idle  ──► diff.removed
//! ```
//! Presence is ephemeral: it is never persisted and carries no
//! ordering guarantee relative to applied edits.

use std::collections::HashMap;

use uuid::Uuid;

use crate::protocol::{CursorState, ImeEvent, ImeSnapshot, PresenceEntry};

/// Maximum label length in code points.
pub const MAX_LABEL_CHARS: usize = 32;

/// Per-document presence map.
#[derive(Debug, Default)]
pub struct PresenceRegistry {
    clients: HashMap<Uuid, PresenceEntry>,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    pub fn contains(&self, client_id: &Uuid) -> bool {
        self.clients.contains_key(client_id)
    }

    /// Full list for `presence_snapshot`.
    pub fn snapshot(&self) -> Vec<PresenceEntry> {
        self.clients.values().cloned().collect()
    }

    /// Add a client. Returns the sanitized entry for `diff.added`.
    pub fn register(
        &mut self,
        client_id: Uuid,
        label: Option<String>,
        color: Option<String>,
        now_ms: u64,
    ) -> PresenceEntry {
        let entry = PresenceEntry {
            client_id,
            label: sanitize_label(label),
            color: sanitize_color(color),
            cursor: None,
            ime: None,
            last_seen_ms: now_ms,
        };
        self.clients.insert(client_id, entry.clone());
        entry
    }

    /// Bump liveness without changing anything else.
    pub fn touch(&mut self, client_id: &Uuid, now_ms: u64) {
        if let Some(entry) = self.clients.get_mut(client_id) {
            entry.last_seen_ms = now_ms;
        }
    }

    pub fn update_cursor(
        &mut self,
        client_id: Uuid,
        cursor: CursorState,
        now_ms: u64,
    ) -> Option<PresenceEntry> {
        let entry = self.clients.get_mut(&client_id)?;
        entry.cursor = Some(cursor);
        entry.last_seen_ms = now_ms;
        Some(entry.clone())
    }

    pub fn update_ime(
        &mut self,
        client_id: Uuid,
        ime: &ImeEvent,
        now_ms: u64,
    ) -> Option<PresenceEntry> {
        let entry = self.clients.get_mut(&client_id)?;
        entry.ime = Some(ImeSnapshot::from_event(ime));
        entry.last_seen_ms = now_ms;
        Some(entry.clone())
    }

    /// Update label/color. A provided-but-invalid value clears the
    /// field; an absent value leaves it untouched.
    pub fn update_profile(
        &mut self,
        client_id: Uuid,
        label: Option<String>,
        color: Option<String>,
        now_ms: u64,
    ) -> Option<PresenceEntry> {
        let entry = self.clients.get_mut(&client_id)?;
        if label.is_some() {
            entry.label = sanitize_label(label);
        }
        if color.is_some() {
            entry.color = sanitize_color(color);
        }
        entry.last_seen_ms = now_ms;
        Some(entry.clone())
    }

    pub fn remove(&mut self, client_id: &Uuid) -> Option<PresenceEntry> {
        self.clients.remove(client_id)
    }

    /// Remove every entry silent for longer than `idle_ms`. Returns
    /// the evicted ids for `diff.removed`.
    pub fn evict_idle(&mut self, now_ms: u64, idle_ms: u64) -> Vec<Uuid> {
        let expired: Vec<Uuid> = self
            .clients
            .values()
            .filter(|e| now_ms.saturating_sub(e.last_seen_ms) > idle_ms)
            .map(|e| e.client_id)
            .collect();
        for id in &expired {
            self.clients.remove(id);
        }
        expired
    }
}

fn sanitize_label(label: Option<String>) -> Option<String> {
    label
        .map(|l| l.trim().to_string())
        .filter(|l| !l.is_empty())
        .map(|l| l.chars().take(MAX_LABEL_CHARS).collect())
}

/// Colors must be exactly `#RRGGBB`; anything else is dropped.
fn sanitize_color(color: Option<String>) -> Option<String> {
    color
        .map(|c| c.trim().to_string())
        .filter(|c| is_hex_color(c))
}

fn is_hex_color(c: &str) -> bool {
    let bytes = c.as_bytes();
    bytes.len() == 7 && bytes[0] == b'#' && bytes[1..].iter().all(u8::is_ascii_hexdigit)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::TextRange;

    fn uuid(n: u8) -> Uuid {
        Uuid::from_bytes([n; 16])
    }

    fn cursor(position: u32) -> CursorState {
        CursorState {
            position,
            anchor: None,
            selection_direction: None,
        }
    }

    #[test]
    fn test_register_sanitizes_profile() {
        let mut reg = PresenceRegistry::new();
        let long_label = format!("  {}  ", "a".repeat(80));
        let entry = reg.register(uuid(1), Some(long_label), Some("#12AB3f".into()), 10);

        assert_eq!(entry.label.as_ref().map(|l| l.chars().count()), Some(32));
        assert_eq!(entry.color.as_deref(), Some("#12AB3f"));
        assert_eq!(entry.last_seen_ms, 10);
    }

    #[test]
    fn test_malformed_colors_dropped() {
        let mut reg = PresenceRegistry::new();
        for bad in ["#12", "red", "#12345g", "123456", "#1234567", ""] {
            let entry = reg.register(uuid(1), None, Some(bad.into()), 0);
            assert_eq!(entry.color, None, "color {bad:?} should be dropped");
        }
    }

    #[test]
    fn test_cursor_update_is_last_writer_wins() {
        let mut reg = PresenceRegistry::new();
        reg.register(uuid(1), None, None, 1);

        reg.update_cursor(uuid(1), cursor(3), 2);
        let updated = reg.update_cursor(uuid(1), cursor(7), 5).unwrap();
        assert_eq!(updated.cursor.as_ref().map(|c| c.position), Some(7));
        assert_eq!(updated.last_seen_ms, 5);
    }

    #[test]
    fn test_cursor_for_unknown_client_is_ignored() {
        let mut reg = PresenceRegistry::new();
        assert!(reg.update_cursor(uuid(9), cursor(0), 1).is_none());
    }

    #[test]
    fn test_ime_state_tracks_latest_event() {
        let mut reg = PresenceRegistry::new();
        reg.register(uuid(1), None, None, 0);

        let ev = ImeEvent::Update {
            range: TextRange { start: 2, end: 4 },
            text: "かな".into(),
        };
        let updated = reg.update_ime(uuid(1), &ev, 3).unwrap();
        let ime = updated.ime.unwrap();
        assert_eq!(ime.phase, "update");
        assert_eq!(ime.text.as_deref(), Some("かな"));
    }

    #[test]
    fn test_profile_update_clears_on_invalid() {
        let mut reg = PresenceRegistry::new();
        reg.register(uuid(1), Some("name".into()), Some("#aabbcc".into()), 0);

        let updated = reg
            .update_profile(uuid(1), Some("   ".into()), Some("nope".into()), 9)
            .unwrap();
        assert_eq!(updated.label, None);
        assert_eq!(updated.color, None);

        // Absent fields stay untouched.
        reg.update_profile(uuid(1), Some("back".into()), None, 10);
        let updated = reg.update_profile(uuid(1), None, None, 11).unwrap();
        assert_eq!(updated.label.as_deref(), Some("back"));
    }

    #[test]
    fn test_idle_eviction() {
        let mut reg = PresenceRegistry::new();
        reg.register(uuid(1), None, None, 1_000);
        reg.register(uuid(2), None, None, 50_000);

        // 61s after client 1 was last seen, 12s after client 2.
        let removed = reg.evict_idle(62_000, 60_000);
        assert_eq!(removed, vec![uuid(1)]);
        assert!(reg.contains(&uuid(2)));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn test_touch_defers_eviction() {
        let mut reg = PresenceRegistry::new();
        reg.register(uuid(1), None, None, 0);
        reg.touch(&uuid(1), 55_000);
        assert!(reg.evict_idle(60_000, 60_000).is_empty());
    }

    #[test]
    fn test_remove_returns_entry() {
        let mut reg = PresenceRegistry::new();
        reg.register(uuid(1), Some("x".into()), None, 0);
        let removed = reg.remove(&uuid(1)).unwrap();
        assert_eq!(removed.client_id, uuid(1));
        assert!(reg.is_empty());
    }
}
