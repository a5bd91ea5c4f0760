use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{OrchestratorError, Result};

const ACTIONS_RELATIVE_DIR: &str = "agent/actions";
const MAX_PROMPT_BYTES: usize = 64 * 1024;

/// Front matter keys an action file may declare (§4.9). Anything else in
/// the YAML block is ignored rather than rejected.
#[derive(Debug, Default, Deserialize)]
struct FrontMatter {
    #[serde(default)]
    requires_confirmation: bool,
    #[serde(default)]
    max_steps: Option<u32>,
}

/// A resolved action: a named prompt template plus optional execution
/// metadata, read from a vault file (§4.9, §GLOSSARY).
#[derive(Debug, Clone)]
pub struct Action {
    pub id: String,
    pub prompt: String,
    pub requires_confirmation: bool,
    pub max_steps: Option<u32>,
}

/// Discovers and parses action files under `<person>/agent/actions/` (C9).
pub struct ActionResolver {
    vault_root: PathBuf,
}

impl ActionResolver {
    pub fn new(vault_root: impl Into<PathBuf>) -> Self {
        Self {
            vault_root: vault_root.into(),
        }
    }

    /// Resolve an action by ID, matching it against the derived ID of every
    /// file under the person's actions directory.
    pub fn resolve(&self, person: &str, action_id: &str) -> Result<Action> {
        let dir = self.vault_root.join(person).join(ACTIONS_RELATIVE_DIR);
        let entries = std::fs::read_dir(&dir)
            .map_err(|_| OrchestratorError::ActionNotFound(action_id.to_string()))?;

        for entry in entries.flatten() {
            let path = entry.path();
            let Some(stem) = action_stem(&path) else {
                continue;
            };
            if derive_action_id(&stem) != action_id {
                continue;
            }
            return self.parse_file(action_id, &path);
        }

        Err(OrchestratorError::ActionNotFound(action_id.to_string()))
    }

    fn parse_file(&self, action_id: &str, path: &Path) -> Result<Action> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| OrchestratorError::InvalidRequest(format!("failed to read action file: {e}")))?;

        let (front_matter_src, body) = split_front_matter(&raw);

        let front_matter: FrontMatter = match front_matter_src {
            Some(src) => serde_yaml::from_str(src).map_err(|e| {
                OrchestratorError::InvalidRequest(format!(
                    "malformed front matter in action '{action_id}': {e}"
                ))
            })?,
            None => FrontMatter::default(),
        };

        if let Some(max_steps) = front_matter.max_steps {
            if max_steps == 0 {
                return Err(OrchestratorError::InvalidRequest(format!(
                    "action '{action_id}' has non-positive max_steps"
                )));
            }
        }

        let prompt = body.trim().to_string();
        if prompt.len() > MAX_PROMPT_BYTES {
            return Err(OrchestratorError::InvalidRequest(format!(
                "action '{action_id}' prompt exceeds {MAX_PROMPT_BYTES} bytes"
            )));
        }

        Ok(Action {
            id: action_id.to_string(),
            prompt,
            requires_confirmation: front_matter.requires_confirmation,
            max_steps: front_matter.max_steps,
        })
    }
}

/// Extract the filename stem for a `.md` or `.prompt.md` action file.
fn action_stem(path: &Path) -> Option<String> {
    let name = path.file_name()?.to_str()?;
    if let Some(stripped) = name.strip_suffix(".prompt.md") {
        return Some(stripped.to_string());
    }
    name.strip_suffix(".md").map(|s| s.to_string())
}

/// Lowercase, non-alphanumerics → `-`, runs of `-` collapsed, trimmed (§4.9).
fn derive_action_id(stem: &str) -> String {
    let mut id = String::with_capacity(stem.len());
    let mut last_was_dash = false;
    for ch in stem.chars() {
        if ch.is_ascii_alphanumeric() {
            id.push(ch.to_ascii_lowercase());
            last_was_dash = false;
        } else if !last_was_dash {
            id.push('-');
            last_was_dash = true;
        }
    }
    id.trim_matches('-').to_string()
}

/// Split a `---\n...\n---\n` YAML front matter block from the remaining body.
/// Returns `(None, raw)` when no front matter block is present.
fn split_front_matter(raw: &str) -> (Option<&str>, &str) {
    let Some(rest) = raw.strip_prefix("---\n") else {
        return (None, raw);
    };
    let Some(end) = rest.find("\n---") else {
        return (None, raw);
    };
    let front_matter = &rest[..end];
    let after_marker = &rest[end + 4..];
    let body = after_marker.strip_prefix('\n').unwrap_or(after_marker);
    (Some(front_matter), body)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_action(dir: &Path, person: &str, filename: &str, content: &str) {
        let actions = dir.join(person).join(ACTIONS_RELATIVE_DIR);
        std::fs::create_dir_all(&actions).unwrap();
        std::fs::write(actions.join(filename), content).unwrap();
    }

    #[test]
    fn derives_id_from_filename_stem() {
        assert_eq!(derive_action_id("Daily Standup!!"), "daily-standup");
        assert_eq!(derive_action_id("__weird__Name__"), "weird-name");
    }

    #[test]
    fn resolves_plain_md_action_without_front_matter() {
        let dir = tempfile::tempdir().unwrap();
        write_action(dir.path(), "alice", "summarize.md", "Summarize the day's notes.");
        let resolver = ActionResolver::new(dir.path());
        let action = resolver.resolve("alice", "summarize").unwrap();
        assert_eq!(action.prompt, "Summarize the day's notes.");
        assert!(!action.requires_confirmation);
        assert_eq!(action.max_steps, None);
    }

    #[test]
    fn resolves_prompt_md_action_with_front_matter() {
        let dir = tempfile::tempdir().unwrap();
        write_action(
            dir.path(),
            "alice",
            "delete-all.prompt.md",
            "---\nrequires_confirmation: true\nmax_steps: 3\n---\nDelete every note in the vault.",
        );
        let resolver = ActionResolver::new(dir.path());
        let action = resolver.resolve("alice", "delete-all").unwrap();
        assert_eq!(action.prompt, "Delete every note in the vault.");
        assert!(action.requires_confirmation);
        assert_eq!(action.max_steps, Some(3));
    }

    #[test]
    fn missing_action_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("alice").join(ACTIONS_RELATIVE_DIR)).unwrap();
        let resolver = ActionResolver::new(dir.path());
        assert!(matches!(
            resolver.resolve("alice", "nope"),
            Err(OrchestratorError::ActionNotFound(_))
        ));
    }

    #[test]
    fn malformed_front_matter_is_a_validation_error() {
        let dir = tempfile::tempdir().unwrap();
        write_action(
            dir.path(),
            "alice",
            "broken.md",
            "---\nmax_steps: [not, a, number]\n---\nBody.",
        );
        let resolver = ActionResolver::new(dir.path());
        assert!(matches!(
            resolver.resolve("alice", "broken"),
            Err(OrchestratorError::InvalidRequest(_))
        ));
    }

    #[test]
    fn zero_max_steps_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        write_action(dir.path(), "alice", "zero.md", "---\nmax_steps: 0\n---\nBody.");
        let resolver = ActionResolver::new(dir.path());
        assert!(matches!(
            resolver.resolve("alice", "zero"),
            Err(OrchestratorError::InvalidRequest(_))
        ));
    }

    #[test]
    fn oversized_prompt_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let big = "a".repeat(MAX_PROMPT_BYTES + 1);
        write_action(dir.path(), "alice", "huge.md", &big);
        let resolver = ActionResolver::new(dir.path());
        assert!(matches!(
            resolver.resolve("alice", "huge"),
            Err(OrchestratorError::InvalidRequest(_))
        ));
    }
}
