use notes_core::RunId;
use serde::{Deserialize, Serialize};

/// A persisted timeline element (§3). Tagged the same way as
/// `CanonicalEvent` for symmetry between the wire protocol and the
/// stored record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConversationItemKind {
    Message { role: Role, content: String },
    ToolCall { tool: String, args: serde_json::Value },
    ToolResult { tool: String, ok: bool, summary: String },
    Status { message: String },
    Error { message: String },
    Usage {
        input_tokens: u64,
        output_tokens: u64,
        total_tokens: u64,
        context_window: Option<u64>,
        remaining_tokens: Option<u64>,
    },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

/// One entry in a person/session's append-only timeline (§3).
///
/// Items are appended only after a run terminates, atomically, so a
/// concurrent reader never observes a partial run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConversationItem {
    pub session_id: String,
    pub run_id: RunId,
    pub seq: u64,
    pub ts: i64,
    #[serde(flatten)]
    pub kind: ConversationItemKind,
}

impl ConversationItem {
    pub fn new(session_id: impl Into<String>, run_id: RunId, seq: u64, ts: i64, kind: ConversationItemKind) -> Self {
        Self {
            session_id: session_id.into(),
            run_id,
            seq,
            ts,
            kind,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_item_round_trips_through_json() {
        let item = ConversationItem::new(
            "sess-1",
            RunId::new(),
            3,
            1_700_000_000,
            ConversationItemKind::Message {
                role: Role::User,
                content: "hello".to_string(),
            },
        );
        let json = serde_json::to_string(&item).unwrap();
        assert!(json.contains("\"type\":\"message\""));
        let back: ConversationItem = serde_json::from_str(&json).unwrap();
        assert_eq!(back, item);
    }

    #[test]
    fn tool_call_and_result_are_distinct_kinds() {
        let call = ConversationItemKind::ToolCall {
            tool: "read_file".to_string(),
            args: serde_json::json!({"path": "a.md"}),
        };
        let result = ConversationItemKind::ToolResult {
            tool: "read_file".to_string(),
            ok: true,
            summary: "12 lines".to_string(),
        };
        assert_ne!(
            serde_json::to_value(&call).unwrap()["type"],
            serde_json::to_value(&result).unwrap()["type"]
        );
    }
}
