use dashmap::DashMap;
use notes_core::PersonId;
use notes_protocol::ConversationItem;

/// In-memory, append-only per-(person, session) timeline (C6).
///
/// Items are appended only after a run terminates, atomically — the
/// orchestrator accumulates a run-local buffer and calls `append_run` once,
/// so a concurrent `GetConversationHistory` never observes a partial run.
#[derive(Default)]
pub struct ConversationStore {
    timelines: DashMap<(PersonId, String), Vec<ConversationItem>>,
}

impl ConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a completed run's buffered items to the timeline in one step.
    pub fn append_run(&self, person: &PersonId, session_id: &str, items: Vec<ConversationItem>) {
        if items.is_empty() {
            return;
        }
        self.timelines
            .entry((person.clone(), session_id.to_string()))
            .or_default()
            .extend(items);
    }

    /// Return the stored timeline, if any, for this (person, session_id).
    pub fn get(&self, person: &PersonId, session_id: &str) -> Option<Vec<ConversationItem>> {
        self.timelines
            .get(&(person.clone(), session_id.to_string()))
            .map(|v| v.clone())
    }

    /// Overwrite the stored timeline — used when `GetConversationHistory`
    /// recovers items from a backend transcript and caches them (§4.5).
    pub fn put(&self, person: &PersonId, session_id: &str, items: Vec<ConversationItem>) {
        self.timelines
            .insert((person.clone(), session_id.to_string()), items);
    }

    /// Discard a session's timeline (used by `ClearSession`).
    pub fn clear(&self, person: &PersonId, session_id: &str) {
        self.timelines
            .remove(&(person.clone(), session_id.to_string()));
    }

    /// Find the last `message` item with `role: assistant` in a timeline,
    /// used to derive the §4.8 session preview.
    pub fn last_assistant_text(&self, person: &PersonId, session_id: &str) -> Option<String> {
        use notes_protocol::{ConversationItemKind, Role};
        self.get(person, session_id)?.into_iter().rev().find_map(|item| {
            match item.kind {
                ConversationItemKind::Message {
                    role: Role::Assistant,
                    content,
                } => Some(content),
                _ => None,
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notes_core::RunId;
    use notes_protocol::{ConversationItemKind, Role};

    fn msg(session_id: &str, run_id: RunId, seq: u64, role: Role, content: &str) -> ConversationItem {
        ConversationItem::new(
            session_id,
            run_id,
            seq,
            0,
            ConversationItemKind::Message {
                role,
                content: content.to_string(),
            },
        )
    }

    #[test]
    fn append_run_is_a_no_op_for_empty_buffers() {
        let store = ConversationStore::new();
        let person = PersonId::from("alice");
        store.append_run(&person, "s1", vec![]);
        assert!(store.get(&person, "s1").is_none());
    }

    #[test]
    fn appended_items_are_visible_in_order() {
        let store = ConversationStore::new();
        let person = PersonId::from("alice");
        let run_id = RunId::new();
        let items = vec![
            msg("s1", run_id.clone(), 1, Role::User, "hi"),
            msg("s1", run_id, 2, Role::Assistant, "hello there"),
        ];
        store.append_run(&person, "s1", items);

        let stored = store.get(&person, "s1").unwrap();
        assert_eq!(stored.len(), 2);
        assert_eq!(store.last_assistant_text(&person, "s1").unwrap(), "hello there");
    }

    #[test]
    fn clear_removes_the_timeline() {
        let store = ConversationStore::new();
        let person = PersonId::from("alice");
        store.append_run(&person, "s1", vec![msg("s1", RunId::new(), 1, Role::User, "hi")]);
        store.clear(&person, "s1");
        assert!(store.get(&person, "s1").is_none());
    }
}
