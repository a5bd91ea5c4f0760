use dashmap::DashMap;
use notes_core::PersonId;
use tracing::instrument;

use crate::error::{Result, SessionError};
use crate::types::{derive_session_name, RuntimeMode, SessionRecord, SessionSummary};

/// In-memory session registry (C5).
///
/// Ordering, name derivation, and recovery-coalescing mirror the teacher's
/// SQLite-backed `SessionManager` query shapes, reimagined over a `DashMap`
/// since persistence here is process-memory only (no durable replay log).
#[derive(Default)]
pub struct SessionRegistry {
    records: DashMap<(PersonId, String), SessionRecord>,
    name_counters: DashMap<PersonId, u32>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new session record for a just-assigned `session_id`.
    #[instrument(skip(self, first_message), fields(person = %person, session_id))]
    pub fn create(
        &self,
        person: &PersonId,
        session_id: &str,
        first_message: Option<&str>,
        runtime_mode: RuntimeMode,
        now: i64,
    ) -> SessionRecord {
        let counter = {
            let mut entry = self.name_counters.entry(person.clone()).or_insert(0);
            *entry += 1;
            *entry
        };
        let name = first_message
            .map(|m| derive_session_name(m, counter))
            .unwrap_or_else(|| format!("Session {counter}"));

        let record = SessionRecord {
            session_id: session_id.to_string(),
            name,
            runtime_mode,
            created_at: now,
            last_used_at: now,
        };
        self.records
            .insert((person.clone(), session_id.to_string()), record.clone());
        record
    }

    /// Update `last_used_at` on an existing record, or insert one if this
    /// session_id was first observed mid-run (§4.5 worker loop "touch
    /// SessionRecord").
    pub fn touch(&self, person: &PersonId, session_id: &str, now: i64, runtime_mode: RuntimeMode) {
        let key = (person.clone(), session_id.to_string());
        match self.records.get_mut(&key) {
            Some(mut rec) => rec.last_used_at = now,
            None => {
                self.create(person, session_id, None, runtime_mode, now);
            }
        }
    }

    pub fn get(&self, person: &PersonId, session_id: &str) -> Result<SessionRecord> {
        self.records
            .get(&(person.clone(), session_id.to_string()))
            .map(|r| r.clone())
            .ok_or_else(|| SessionError::NotFound {
                session_id: session_id.to_string(),
            })
    }

    /// Insert a record synthesized from gateway transcript recovery, unless
    /// one already exists for this session_id (existing records win so a
    /// mapped app_session and its backing transcript file never appear as
    /// two distinct sessions, per §4.8).
    pub fn insert_recovered(&self, person: &PersonId, record: SessionRecord) {
        self.records
            .entry((person.clone(), record.session_id.clone()))
            .or_insert(record);
    }

    /// List sessions for a person, ordered `last_used_at desc, created_at desc`.
    pub fn list_for_person(
        &self,
        person: &PersonId,
        previews: impl Fn(&str) -> Option<String>,
    ) -> Vec<SessionSummary> {
        let mut records: Vec<SessionRecord> = self
            .records
            .iter()
            .filter(|e| &e.key().0 == person)
            .map(|e| e.value().clone())
            .collect();

        records.sort_by(|a, b| {
            b.last_used_at
                .cmp(&a.last_used_at)
                .then_with(|| b.created_at.cmp(&a.created_at))
        });

        records
            .into_iter()
            .map(|r| SessionSummary {
                preview: previews(&r.session_id),
                session_id: r.session_id,
                name: r.name,
                runtime_mode: r.runtime_mode,
                created_at: r.created_at,
                last_used_at: r.last_used_at,
            })
            .collect()
    }

    /// Remove a session record (used by `ClearSession`).
    pub fn delete(&self, person: &PersonId, session_id: &str) {
        self.records.remove(&(person.clone(), session_id.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_assigns_incrementing_counters_per_person() {
        let reg = SessionRegistry::new();
        let person = PersonId::from("alice");
        let r1 = reg.create(&person, "s1", None, RuntimeMode::DirectKey, 100);
        let r2 = reg.create(&person, "s2", None, RuntimeMode::DirectKey, 101);
        assert_eq!(r1.name, "Session 1");
        assert_eq!(r2.name, "Session 2");
    }

    #[test]
    fn list_orders_by_last_used_then_created_desc() {
        let reg = SessionRegistry::new();
        let person = PersonId::from("alice");
        reg.create(&person, "old", Some("first"), RuntimeMode::DirectKey, 100);
        reg.create(&person, "new", Some("second"), RuntimeMode::DirectKey, 200);
        reg.touch(&person, "old", 300, RuntimeMode::DirectKey);

        let list = reg.list_for_person(&person, |_| None);
        assert_eq!(list[0].session_id, "old");
        assert_eq!(list[1].session_id, "new");
    }

    #[test]
    fn recovered_record_does_not_overwrite_existing() {
        let reg = SessionRegistry::new();
        let person = PersonId::from("alice");
        reg.create(&person, "s1", Some("hi"), RuntimeMode::Gateway, 100);
        reg.insert_recovered(
            &person,
            SessionRecord {
                session_id: "s1".to_string(),
                name: "Recovered".to_string(),
                runtime_mode: RuntimeMode::Gateway,
                created_at: 0,
                last_used_at: 0,
            },
        );
        let rec = reg.get(&person, "s1").unwrap();
        assert_ne!(rec.name, "Recovered");
    }

    #[test]
    fn get_missing_session_errors() {
        let reg = SessionRegistry::new();
        let person = PersonId::from("alice");
        assert!(matches!(
            reg.get(&person, "nope"),
            Err(SessionError::NotFound { .. })
        ));
    }
}
