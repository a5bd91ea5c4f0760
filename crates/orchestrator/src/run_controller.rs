use std::sync::Mutex;

use notes_core::{PersonId, RunId};
use tokio_util::sync::CancellationToken;

use crate::error::{OrchestratorError, Result};

/// One in-flight run (§3 `Run`). Registered when admitted, removed when the
/// worker terminates.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub run_id: RunId,
    pub person: PersonId,
    pub session_id: String,
    pub started_at: i64,
    pub updated_at: i64,
}

struct RunEntry {
    summary: RunSummary,
    cancel: CancellationToken,
}

/// A live handle to a registered run, returned on successful admission.
/// Dropping it does not release the run — callers must call
/// `RunController::release` explicitly once the worker finishes.
pub struct RunHandle {
    pub run_id: RunId,
    pub cancel: CancellationToken,
}

#[derive(Default)]
struct Inner {
    active_runs: std::collections::HashMap<String, RunEntry>,
    session_busy: std::collections::HashMap<(PersonId, String), String>,
}

/// Per-session mutual exclusion and active-run bookkeeping (C7, §4.7).
///
/// A single mutex guards both maps; contention is low because critical
/// sections never touch I/O — only the streaming worker blocks for long
/// periods, and it holds no lock while doing so.
#[derive(Default)]
pub struct RunController {
    inner: Mutex<Inner>,
}

impl RunController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit a new run. Fails with `session_busy` if `session_id` is
    /// non-empty and already locked. An empty `session_id` is never locked
    /// (§4.7): a brand-new conversation gets its session id from the
    /// runtime's `start` event, so two concurrent first requests from the
    /// same person each get their own run.
    pub fn admit(&self, person: &PersonId, session_id: &str, now: i64) -> Result<RunHandle> {
        let mut inner = self.inner.lock().unwrap();

        if !session_id.is_empty() {
            if let Some(existing_run_id) = inner.session_busy.get(&(person.clone(), session_id.to_string())) {
                return Err(OrchestratorError::SessionBusy {
                    session_id: session_id.to_string(),
                    run_id: existing_run_id.clone(),
                });
            }
        }

        let run_id = RunId::new();
        let cancel = CancellationToken::new();
        let summary = RunSummary {
            run_id: run_id.clone(),
            person: person.clone(),
            session_id: session_id.to_string(),
            started_at: now,
            updated_at: now,
        };

        if !session_id.is_empty() {
            inner
                .session_busy
                .insert((person.clone(), session_id.to_string()), run_id.as_str().to_string());
        }
        inner.active_runs.insert(
            run_id.as_str().to_string(),
            RunEntry {
                summary,
                cancel: cancel.clone(),
            },
        );

        Ok(RunHandle { run_id, cancel })
    }

    /// Update a Run's session field once the runtime reports one (does not
    /// retroactively acquire the session lock — only `admit` does that).
    pub fn update_session(&self, run_id: &RunId, session_id: &str, now: i64) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(entry) = inner.active_runs.get_mut(run_id.as_str()) {
            entry.summary.session_id = session_id.to_string();
            entry.summary.updated_at = now;
        }
    }

    /// Signal cancellation for a run owned by `person`. Returns `true` if a
    /// matching active run was found and signalled, `false` otherwise
    /// (already finished, or belongs to someone else) — safe to call twice.
    pub fn stop(&self, person: &PersonId, run_id: &str) -> bool {
        let inner = self.inner.lock().unwrap();
        match inner.active_runs.get(run_id) {
            Some(entry) if &entry.summary.person == person => {
                entry.cancel.cancel();
                true
            }
            _ => false,
        }
    }

    /// Release a run's bookkeeping. Idempotent: only succeeds if the stored
    /// run_id still matches, defending against a race between `StopRun` and
    /// natural completion both trying to release the same session lock.
    pub fn release(&self, person: &PersonId, session_id: &str, run_id: &RunId) {
        let mut inner = self.inner.lock().unwrap();
        inner.active_runs.remove(run_id.as_str());

        let key = (person.clone(), session_id.to_string());
        if let Some(stored) = inner.session_busy.get(&key) {
            if stored == run_id.as_str() {
                inner.session_busy.remove(&key);
            }
        }
    }

    pub fn list_active(&self, person: &PersonId) -> Vec<RunSummary> {
        let inner = self.inner.lock().unwrap();
        inner
            .active_runs
            .values()
            .filter(|e| &e.summary.person == person)
            .map(|e| e.summary.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_session_id_is_never_locked() {
        let controller = RunController::new();
        let person = PersonId::from("alice");
        let a = controller.admit(&person, "", 0).unwrap();
        let b = controller.admit(&person, "", 0).unwrap();
        assert_ne!(a.run_id, b.run_id);
    }

    #[test]
    fn second_admit_on_same_session_is_rejected() {
        let controller = RunController::new();
        let person = PersonId::from("alice");
        let _first = controller.admit(&person, "s1", 0).unwrap();
        let second = controller.admit(&person, "s1", 0);
        assert!(matches!(second, Err(OrchestratorError::SessionBusy { .. })));
    }

    #[test]
    fn release_frees_the_session_for_reuse() {
        let controller = RunController::new();
        let person = PersonId::from("alice");
        let first = controller.admit(&person, "s1", 0).unwrap();
        controller.release(&person, "s1", &first.run_id);
        let second = controller.admit(&person, "s1", 0);
        assert!(second.is_ok());
    }

    #[test]
    fn release_is_idempotent_and_race_safe() {
        let controller = RunController::new();
        let person = PersonId::from("alice");
        let first = controller.admit(&person, "s1", 0).unwrap();
        controller.release(&person, "s1", &first.run_id);
        // A second release of the same (already-released) run must not
        // clobber a subsequent run that reused the session.
        let second = controller.admit(&person, "s1", 0).unwrap();
        controller.release(&person, "s1", &first.run_id);
        assert!(controller.list_active(&person).iter().any(|r| r.run_id == second.run_id));
    }

    #[test]
    fn stop_returns_true_once_then_false() {
        let controller = RunController::new();
        let person = PersonId::from("alice");
        let handle = controller.admit(&person, "s1", 0).unwrap();
        assert!(controller.stop(&person, handle.run_id.as_str()));
        controller.release(&person, "s1", &handle.run_id);
        assert!(!controller.stop(&person, handle.run_id.as_str()));
    }

    #[test]
    fn stop_rejects_a_run_owned_by_another_person() {
        let controller = RunController::new();
        let alice = PersonId::from("alice");
        let bob = PersonId::from("bob");
        let handle = controller.admit(&alice, "s1", 0).unwrap();
        assert!(!controller.stop(&bob, handle.run_id.as_str()));
    }

    #[test]
    fn list_active_only_returns_the_given_person() {
        let controller = RunController::new();
        let alice = PersonId::from("alice");
        let bob = PersonId::from("bob");
        controller.admit(&alice, "s1", 0).unwrap();
        controller.admit(&bob, "s2", 0).unwrap();
        assert_eq!(controller.list_active(&alice).len(), 1);
    }
}
