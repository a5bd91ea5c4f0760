use notes_core::RunId;
use serde::{Deserialize, Serialize};

/// Canonical event union (§4.4): the only schema a client ever sees, one
/// object per NDJSON line. Internally tagged exactly as the teacher's
/// `ContentBlock` enum in `anthropic.rs` is tagged.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CanonicalEvent {
    /// First event of a run; clients may persist `session_id` immediately.
    Start {
        session_id: String,
        run_id: RunId,
        seq: u64,
        ts: i64,
    },
    /// Append to the current assistant segment.
    Text {
        delta: String,
        run_id: RunId,
        seq: u64,
        ts: i64,
    },
    /// The assistant invoked a tool.
    ToolCall {
        tool: String,
        args: serde_json::Value,
        run_id: RunId,
        seq: u64,
        ts: i64,
    },
    /// A tool call completed.
    ToolResult {
        tool: String,
        ok: bool,
        summary: String,
        run_id: RunId,
        seq: u64,
        ts: i64,
    },
    /// Advisory message — fallback notice, action max-steps reached, etc.
    Status {
        message: String,
        run_id: RunId,
        seq: u64,
        ts: i64,
    },
    /// Terminal-or-non-terminal error. A run ends with at most one terminal
    /// error immediately before `done`.
    Error {
        message: String,
        run_id: RunId,
        seq: u64,
        ts: i64,
    },
    /// Periodic token/context accounting.
    Usage {
        input_tokens: u64,
        output_tokens: u64,
        total_tokens: u64,
        context_window: Option<u64>,
        remaining_tokens: Option<u64>,
        run_id: RunId,
        seq: u64,
        ts: i64,
    },
    /// Last event of a run.
    Done {
        session_id: String,
        run_id: RunId,
        seq: u64,
        ts: i64,
    },
}

impl CanonicalEvent {
    pub fn run_id(&self) -> &RunId {
        match self {
            CanonicalEvent::Start { run_id, .. }
            | CanonicalEvent::Text { run_id, .. }
            | CanonicalEvent::ToolCall { run_id, .. }
            | CanonicalEvent::ToolResult { run_id, .. }
            | CanonicalEvent::Status { run_id, .. }
            | CanonicalEvent::Error { run_id, .. }
            | CanonicalEvent::Usage { run_id, .. }
            | CanonicalEvent::Done { run_id, .. } => run_id,
        }
    }

    pub fn seq(&self) -> u64 {
        match self {
            CanonicalEvent::Start { seq, .. }
            | CanonicalEvent::Text { seq, .. }
            | CanonicalEvent::ToolCall { seq, .. }
            | CanonicalEvent::ToolResult { seq, .. }
            | CanonicalEvent::Status { seq, .. }
            | CanonicalEvent::Error { seq, .. }
            | CanonicalEvent::Usage { seq, .. }
            | CanonicalEvent::Done { seq, .. } => *seq,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, CanonicalEvent::Done { .. })
    }
}

/// Monotonic per-run sequence allocator. One instance lives per run; the
/// orchestrator stamps every outgoing event through it before it reaches
/// the caller's channel. Sequence numbers are strictly increasing and
/// start at 1 within a run.
#[derive(Debug)]
pub struct SeqCounter(u64);

impl Default for SeqCounter {
    fn default() -> Self {
        Self::new()
    }
}

impl SeqCounter {
    pub fn new() -> Self {
        Self(0)
    }

    pub fn next(&mut self) -> u64 {
        self.0 += 1;
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seq_counter_is_monotonic_from_one() {
        let mut c = SeqCounter::new();
        assert_eq!(c.next(), 1);
        assert_eq!(c.next(), 2);
        assert_eq!(c.next(), 3);
    }

    #[test]
    fn start_event_round_trips_through_json() {
        let run_id = RunId::new();
        let event = CanonicalEvent::Start {
            session_id: "sess-1".to_string(),
            run_id: run_id.clone(),
            seq: 0,
            ts: 1_700_000_000,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"start\""));
        let back: CanonicalEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
        assert_eq!(back.run_id(), &run_id);
    }

    #[test]
    fn done_is_the_only_terminal_variant() {
        let run_id = RunId::new();
        let done = CanonicalEvent::Done {
            session_id: "s".into(),
            run_id: run_id.clone(),
            seq: 5,
            ts: 0,
        };
        let text = CanonicalEvent::Text {
            delta: "hi".into(),
            run_id,
            seq: 1,
            ts: 0,
        };
        assert!(done.is_terminal());
        assert!(!text.is_terminal());
    }
}
