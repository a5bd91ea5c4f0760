use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use tracing::warn;

const MAP_RELATIVE_PATH: &str = ".notes-editor/runtime-session-map.json";

#[derive(Debug, Default, Serialize, Deserialize)]
struct OnDisk {
    mappings: HashMap<String, String>,
}

fn composite_key(person: &str, app_session: &str) -> String {
    format!("{person}::{app_session}")
}

/// Persisted `(person, app_session) -> runtime_session` mapping (§3, §6.3).
/// Once assigned, a runtime session id is stable across process restarts
/// until explicitly cleared.
pub struct RuntimeSessionMap {
    path: PathBuf,
    state: RwLock<OnDisk>,
}

impl RuntimeSessionMap {
    /// Load the map from `<vault_root>/.notes-editor/runtime-session-map.json`,
    /// starting empty if the file does not exist yet.
    pub fn load(vault_root: &Path) -> Self {
        let path = vault_root.join(MAP_RELATIVE_PATH);
        let state = std::fs::read_to_string(&path)
            .ok()
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_default();

        Self {
            path,
            state: RwLock::new(state),
        }
    }

    pub fn get(&self, person: &str, app_session: &str) -> Option<String> {
        let key = composite_key(person, app_session);
        self.state.read().unwrap().mappings.get(&key).cloned()
    }

    /// Record a mapping and persist it immediately.
    pub fn set(&self, person: &str, app_session: &str, runtime_session: &str) {
        let key = composite_key(person, app_session);
        {
            let mut state = self.state.write().unwrap();
            state
                .mappings
                .insert(key, runtime_session.to_string());
        }
        self.persist();
    }

    /// All `(app_session, runtime_session)` pairs recorded for `person`.
    pub fn entries_for_person(&self, person: &str) -> Vec<(String, String)> {
        let prefix = format!("{person}::");
        self.state
            .read()
            .unwrap()
            .mappings
            .iter()
            .filter_map(|(key, runtime_session)| {
                key.strip_prefix(&prefix)
                    .map(|app_session| (app_session.to_string(), runtime_session.clone()))
            })
            .collect()
    }

    /// Drop a mapping (a cleared session gets a fresh backend session next time).
    pub fn clear(&self, person: &str, app_session: &str) {
        let key = composite_key(person, app_session);
        {
            let mut state = self.state.write().unwrap();
            state.mappings.remove(&key);
        }
        self.persist();
    }

    fn persist(&self) {
        if let Some(parent) = self.path.parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                warn!(error = %e, "failed to create runtime session map directory");
                return;
            }
        }
        let state = self.state.read().unwrap();
        match serde_json::to_string_pretty(&*state) {
            Ok(json) => {
                if let Err(e) = std::fs::write(&self.path, json) {
                    warn!(error = %e, path = %self.path.display(), "failed to persist runtime session map");
                }
            }
            Err(e) => warn!(error = %e, "failed to serialize runtime session map"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_across_a_simulated_restart() {
        let dir = tempfile::tempdir().unwrap();

        {
            let map = RuntimeSessionMap::load(dir.path());
            map.set("alice", "app-1", "backend-42");
        }

        let reloaded = RuntimeSessionMap::load(dir.path());
        assert_eq!(reloaded.get("alice", "app-1"), Some("backend-42".to_string()));
    }

    #[test]
    fn missing_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let map = RuntimeSessionMap::load(dir.path());
        assert_eq!(map.get("alice", "app-1"), None);
    }

    #[test]
    fn clear_removes_the_mapping() {
        let dir = tempfile::tempdir().unwrap();
        let map = RuntimeSessionMap::load(dir.path());
        map.set("alice", "app-1", "backend-42");
        map.clear("alice", "app-1");
        assert_eq!(map.get("alice", "app-1"), None);

        let reloaded = RuntimeSessionMap::load(dir.path());
        assert_eq!(reloaded.get("alice", "app-1"), None);
    }

    #[test]
    fn entries_for_person_excludes_other_people() {
        let dir = tempfile::tempdir().unwrap();
        let map = RuntimeSessionMap::load(dir.path());
        map.set("alice", "app-1", "backend-1");
        map.set("alice", "app-2", "backend-2");
        map.set("bob", "app-1", "backend-9");

        let mut entries = map.entries_for_person("alice");
        entries.sort();
        assert_eq!(
            entries,
            vec![
                ("app-1".to_string(), "backend-1".to_string()),
                ("app-2".to_string(), "backend-2".to_string()),
            ]
        );
    }

    #[test]
    fn distinguishes_sessions_by_person_and_app_session() {
        let dir = tempfile::tempdir().unwrap();
        let map = RuntimeSessionMap::load(dir.path());
        map.set("alice", "app-1", "backend-1");
        map.set("bob", "app-1", "backend-2");
        assert_eq!(map.get("alice", "app-1"), Some("backend-1".to_string()));
        assert_eq!(map.get("bob", "app-1"), Some("backend-2".to_string()));
    }
}
