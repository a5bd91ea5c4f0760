//! Tool execution loop — the core agentic behavior of the Direct-key Runtime.
//!
//! Flow: prompt → LLM → if tool_use → execute tools → inject results → LLM → repeat.
//! Stops when: stop_reason is not "tool_use", max iterations reached, or error.

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::provider::{ChatRequest, ChatResponse, LlmProvider, ToolCall};
use crate::runtime::UpstreamEvent;
use crate::stream::StreamEvent;

use super::{Tool, ToolResult};

/// Safety cap on tool loop iterations — independent of (and larger than)
/// any per-run `max_tool_calls` the orchestrator enforces, so a runtime
/// bug upstream can never spin forever.
const MAX_ITERATIONS: usize = 50;

/// Run the full tool execution loop (non-streaming).
///
/// Starts from `initial_request`, which must have `messages` or `raw_messages` set.
/// Returns the final `ChatResponse` (the one with `stop_reason != "tool_use"`).
pub async fn run_tool_loop(
    provider: &dyn LlmProvider,
    initial_request: ChatRequest,
    tools: &[Box<dyn Tool>],
) -> Result<ChatResponse, crate::provider::ProviderError> {
    let mut raw_messages = initial_raw_messages(&initial_request);
    let mut last_response: Option<ChatResponse> = None;

    for iteration in 0..MAX_ITERATIONS {
        let mut req = initial_request.clone();
        req.raw_messages = Some(raw_messages.clone());

        debug!(iteration, "tool loop iteration");

        let response = provider.send(&req).await?;

        if response.tool_calls.is_empty() || response.stop_reason != "tool_use" {
            info!(iteration, "tool loop complete — no more tool calls");
            return Ok(response);
        }

        append_turn(&mut raw_messages, &response, tools).await;
        last_response = Some(response);
    }

    warn!(max_iterations = MAX_ITERATIONS, "tool loop hit maximum iterations");

    last_response.ok_or_else(|| {
        crate::provider::ProviderError::Parse(format!(
            "tool loop exceeded {MAX_ITERATIONS} iterations without a final response"
        ))
    })
}

/// Streaming counterpart: forwards text deltas and tool call/result events
/// as they happen, suppressing any leading blank-line text at the start of
/// each assistant turn (§4.2).
pub async fn run_tool_loop_streaming(
    provider: &dyn LlmProvider,
    initial_request: ChatRequest,
    tools: &[Box<dyn Tool>],
    tx: &mpsc::Sender<UpstreamEvent>,
) -> Result<String, crate::provider::ProviderError> {
    let mut raw_messages = initial_raw_messages(&initial_request);

    for iteration in 0..MAX_ITERATIONS {
        let mut req = initial_request.clone();
        req.raw_messages = Some(raw_messages.clone());

        debug!(iteration, "streaming tool loop iteration");

        let response = collect_streamed_turn(provider, &req, tx).await?;

        if response.tool_calls.is_empty() || response.stop_reason != "tool_use" {
            let _ = tx
                .send(UpstreamEvent::Usage {
                    input_tokens: response.tokens_in as u64,
                    output_tokens: response.tokens_out as u64,
                    total_tokens: (response.tokens_in + response.tokens_out) as u64,
                    context_window: None,
                    remaining_tokens: None,
                })
                .await;
            info!(iteration, "streaming tool loop complete — no more tool calls");
            return Ok(response.content);
        }

        append_turn(&mut raw_messages, &response, tools).await;

        for call in &response.tool_calls {
            let result = execute_tool(tools, call).await;
            let _ = tx
                .send(UpstreamEvent::ToolResult {
                    tool: call.name.clone(),
                    ok: !result.is_error,
                    summary: result.content.clone(),
                })
                .await;
        }
    }

    warn!(
        max_iterations = MAX_ITERATIONS,
        "streaming tool loop hit maximum iterations"
    );
    Err(crate::provider::ProviderError::Parse(format!(
        "tool loop exceeded {MAX_ITERATIONS} iterations without a final response"
    )))
}

/// Drive one streamed turn to completion, forwarding text deltas (through
/// the leading-blank-line trimmer) and tool_call announcements, and
/// assembling the accumulated `ChatResponse` for this turn.
async fn collect_streamed_turn(
    provider: &dyn LlmProvider,
    req: &ChatRequest,
    tx: &mpsc::Sender<UpstreamEvent>,
) -> Result<ChatResponse, crate::provider::ProviderError> {
    let (inner_tx, mut inner_rx) = mpsc::channel::<StreamEvent>(64);
    provider.send_stream(req, inner_tx).await?;

    let mut trimmer = BlankLineTrimmer::default();
    let mut content = String::new();
    let mut tool_calls: Vec<ToolCall> = Vec::new();
    let mut model = String::new();
    let mut tokens_in: u32 = 0;
    let mut tokens_out: u32 = 0;
    let mut stop_reason = String::new();

    while let Some(event) = inner_rx.recv().await {
        match event {
            StreamEvent::TextDelta { text } => {
                content.push_str(&text);
                if let Some(visible) = trimmer.push(&text) {
                    let _ = tx.send(UpstreamEvent::Text { delta: visible }).await;
                }
            }
            StreamEvent::ToolUse { id, name, input } => {
                let _ = tx
                    .send(UpstreamEvent::ToolCall {
                        tool: name.clone(),
                        args: input.clone(),
                    })
                    .await;
                tool_calls.push(ToolCall { id, name, input });
            }
            StreamEvent::Done {
                model: m,
                tokens_in: ti,
                tokens_out: to,
                stop_reason: sr,
            } => {
                model = m;
                tokens_in = ti;
                tokens_out = to;
                stop_reason = sr;
            }
            StreamEvent::Error { message } => {
                return Err(crate::provider::ProviderError::Parse(message));
            }
        }
    }

    Ok(ChatResponse {
        content,
        model,
        tokens_in,
        tokens_out,
        stop_reason,
        tool_calls,
    })
}

fn initial_raw_messages(initial_request: &ChatRequest) -> Vec<serde_json::Value> {
    if let Some(ref raw) = initial_request.raw_messages {
        raw.clone()
    } else {
        initial_request
            .messages
            .iter()
            .map(|m| serde_json::json!({ "role": m.role, "content": m.content }))
            .collect()
    }
}

/// Append one assistant turn (text + tool_use blocks) and the resulting
/// tool_result user turn to the raw message history.
async fn append_turn(
    raw_messages: &mut Vec<serde_json::Value>,
    response: &ChatResponse,
    tools: &[Box<dyn Tool>],
) {
    let mut assistant_content: Vec<serde_json::Value> = Vec::new();

    if !response.content.is_empty() {
        assistant_content.push(serde_json::json!({
            "type": "text",
            "text": response.content,
        }));
    }

    for call in &response.tool_calls {
        assistant_content.push(serde_json::json!({
            "type": "tool_use",
            "id": call.id,
            "name": call.name,
            "input": call.input,
        }));
    }

    raw_messages.push(serde_json::json!({
        "role": "assistant",
        "content": assistant_content,
    }));

    let mut tool_result_content: Vec<serde_json::Value> = Vec::new();
    for call in &response.tool_calls {
        let result = execute_tool(tools, call).await;
        tool_result_content.push(serde_json::json!({
            "type": "tool_result",
            "tool_use_id": call.id,
            "content": result.content,
            "is_error": result.is_error,
        }));
    }

    raw_messages.push(serde_json::json!({
        "role": "user",
        "content": tool_result_content,
    }));
}

/// Find and execute the named tool. Returns an error ToolResult if not found.
async fn execute_tool(tools: &[Box<dyn Tool>], call: &ToolCall) -> ToolResult {
    match tools.iter().find(|t| t.name() == call.name) {
        Some(tool) => {
            debug!(tool = %call.name, "executing tool");
            tool.execute(call.input.clone()).await
        }
        None => ToolResult::error(format!("unknown tool: {}", call.name)),
    }
}

/// Suppresses leading blank-line text deltas within a single assistant
/// turn (§4.2): forwards nothing until the first non-whitespace rune, then
/// passes everything through untouched, including the delta that finally
/// broke the run of whitespace.
#[derive(Default)]
struct BlankLineTrimmer {
    seen_non_whitespace: bool,
}

impl BlankLineTrimmer {
    /// Feed the next delta; returns the text to forward, if any.
    fn push(&mut self, text: &str) -> Option<String> {
        if self.seen_non_whitespace {
            return Some(text.to_string());
        }

        match text.find(|c: char| !c.is_whitespace()) {
            Some(idx) => {
                self.seen_non_whitespace = true;
                Some(text[idx..].to_string())
            }
            None => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_line_trimmer_suppresses_leading_whitespace_only_deltas() {
        let mut trimmer = BlankLineTrimmer::default();
        assert_eq!(trimmer.push("\n\n"), None);
        assert_eq!(trimmer.push("   "), None);
        assert_eq!(trimmer.push("  Hello"), Some("Hello".to_string()));
        assert_eq!(trimmer.push(", world"), Some(", world".to_string()));
    }

    #[test]
    fn blank_line_trimmer_passes_through_when_first_delta_has_content() {
        let mut trimmer = BlankLineTrimmer::default();
        assert_eq!(trimmer.push("Hi there"), Some("Hi there".to_string()));
        assert_eq!(trimmer.push(" more"), Some(" more".to_string()));
    }
}
