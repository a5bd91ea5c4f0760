use serde::{Deserialize, Serialize};

/// Which Runtime backend a session is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeMode {
    DirectKey,
    Gateway,
}

/// Per-person session metadata (§3 `SessionRecord`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: String,
    pub name: String,
    pub runtime_mode: RuntimeMode,
    pub created_at: i64,
    pub last_used_at: i64,
}

/// Summary returned by `ListSessions` — the record plus a preview string.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub name: String,
    pub runtime_mode: RuntimeMode,
    pub created_at: i64,
    pub last_used_at: i64,
    pub preview: Option<String>,
}

const PREVIEW_MAX_CHARS: usize = 140;

/// Derive a session name from the first user message: whitespace-collapsed,
/// truncated at 72 chars on a word boundary (§3).
pub fn derive_session_name(first_message: &str, fallback_counter: u32) -> String {
    let collapsed = collapse_whitespace(first_message);
    if collapsed.is_empty() {
        return format!("Session {fallback_counter}");
    }
    truncate_on_word_boundary(&collapsed, 72)
}

/// Build the preview shown in `ListSessions`: the last assistant text,
/// whitespace-collapsed and truncated at 140 chars on a word boundary (§4.8).
pub fn derive_preview(last_assistant_text: &str) -> String {
    let collapsed = collapse_whitespace(last_assistant_text);
    truncate_on_word_boundary(&collapsed, PREVIEW_MAX_CHARS)
}

fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn truncate_on_word_boundary(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        return s.to_string();
    }
    let truncated: String = s.chars().take(max_chars).collect();
    match truncated.rfind(' ') {
        Some(idx) if idx > 0 => truncated[..idx].to_string(),
        _ => truncated,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derive_name_collapses_whitespace_and_truncates() {
        let name = derive_session_name("  hello   world  ", 1);
        assert_eq!(name, "hello world");
    }

    #[test]
    fn derive_name_falls_back_on_empty_message() {
        let name = derive_session_name("   ", 7);
        assert_eq!(name, "Session 7");
    }

    #[test]
    fn derive_name_truncates_long_text_on_word_boundary() {
        let long = "a".repeat(80);
        let msg = format!("{long} more words after the boundary");
        let name = derive_session_name(&msg, 1);
        assert!(name.chars().count() <= 72);
        assert!(!name.ends_with(' '));
    }

    #[test]
    fn preview_truncates_at_140_chars() {
        let long = "word ".repeat(60);
        let preview = derive_preview(&long);
        assert!(preview.chars().count() <= 140);
    }
}
