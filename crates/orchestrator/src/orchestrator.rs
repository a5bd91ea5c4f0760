use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use notes_core::config::LimitsConfig;
use notes_core::{PersonId, RunId};
use notes_protocol::{CanonicalEvent, ConversationItem, ConversationItemKind, Role};
use notes_runtime::{ChatStreamRequest, Runtime, RuntimeError, UpstreamEvent};
use notes_sessions::{ConversationStore, RuntimeMode, SessionRegistry, SessionSummary};

use crate::action_resolver::ActionResolver;
use crate::config_resolver::ConfigResolver;
use crate::error::{OrchestratorError, Result};
use crate::run_controller::{RunController, RunSummary};

/// Bound on how many backend transcripts `list_sessions` will coalesce into
/// the registry per call (§4.8).
const RECOVERY_SCAN_LIMIT: usize = 50;

/// Request body shape accepted by `Chat`/`ChatStream` (§6.1 canonical names).
#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    pub session_id: Option<String>,
    pub message: Option<String>,
    pub action_id: Option<String>,
    pub confirm: bool,
}

/// Result of a completed non-streaming `Chat` call.
#[derive(Debug, Clone)]
pub struct ChatResult {
    pub response_text: String,
    pub session_id: String,
    pub run_id: RunId,
}

/// Result of admitting a streaming `ChatStream` call.
pub struct ChatStreamHandle {
    pub run_id: RunId,
    pub events: mpsc::Receiver<CanonicalEvent>,
}

struct Inner {
    direct_key: Arc<dyn Runtime>,
    gateway: Arc<dyn Runtime>,
    run_controller: RunController,
    sessions: SessionRegistry,
    conversations: ConversationStore,
    config_resolver: ConfigResolver,
    action_resolver: ActionResolver,
    limits: LimitsConfig,
    fallback_enabled: bool,
}

/// The orchestration core (C8): admits requests, drives the per-run worker,
/// and owns the session registry / conversation store on behalf of the
/// rest of the system.
#[derive(Clone)]
pub struct Orchestrator(Arc<Inner>);

impl Orchestrator {
    pub fn new(
        direct_key: Arc<dyn Runtime>,
        gateway: Arc<dyn Runtime>,
        vault_root: impl Into<PathBuf>,
        default_mode: RuntimeMode,
        limits: LimitsConfig,
        fallback_enabled: bool,
    ) -> Self {
        let vault_root = vault_root.into();
        Self(Arc::new(Inner {
            direct_key,
            gateway,
            run_controller: RunController::new(),
            sessions: SessionRegistry::new(),
            conversations: ConversationStore::new(),
            config_resolver: ConfigResolver::new(vault_root.clone(), default_mode),
            action_resolver: ActionResolver::new(vault_root),
            limits,
            fallback_enabled,
        }))
    }

    /// Non-streaming `Chat`: drives a run to completion, collecting text
    /// deltas into a single string.
    #[instrument(skip(self, request), fields(person = %person))]
    pub async fn chat(&self, person: &PersonId, request: ChatRequest) -> Result<ChatResult> {
        let mut handle = self.chat_stream(person, request).await?;
        let mut response_text = String::new();
        let mut session_id = String::new();

        while let Some(event) = handle.events.recv().await {
            match event {
                CanonicalEvent::Start { session_id: sid, .. } => session_id = sid,
                CanonicalEvent::Text { delta, .. } => response_text.push_str(&delta),
                CanonicalEvent::Done { session_id: sid, .. } => {
                    session_id = sid;
                    break;
                }
                _ => {}
            }
        }

        Ok(ChatResult {
            response_text,
            session_id,
            run_id: handle.run_id,
        })
    }

    /// Admit a streaming run and return immediately with a freshly created
    /// event channel; an independent worker drives the run to completion.
    #[instrument(skip(self, request), fields(person = %person))]
    pub async fn chat_stream(&self, person: &PersonId, request: ChatRequest) -> Result<ChatStreamHandle> {
        let action = match &request.action_id {
            Some(id) => Some(self.0.action_resolver.resolve(person.as_str(), id)?),
            None => None,
        };

        if let Some(ref action) = action {
            if action.requires_confirmation && !request.confirm {
                return Err(OrchestratorError::ActionRequiresConfirmation(action.id.clone()));
            }
        }

        let user_message = request.message.as_deref().map(str::trim).unwrap_or("");
        if action.is_none() && user_message.is_empty() {
            return Err(OrchestratorError::InvalidRequest(
                "at least one of 'message' or 'action_id' must be present".to_string(),
            ));
        }

        let effective_message = match (&action, user_message) {
            (Some(action), msg) if !msg.is_empty() => {
                format!("{}\n\nAdditional context:\n{}", action.prompt, msg)
            }
            (Some(action), _) => action.prompt.clone(),
            (None, msg) => msg.to_string(),
        };

        if effective_message.len() > self.0.limits.max_prompt_bytes {
            return Err(OrchestratorError::InvalidRequest(format!(
                "prompt exceeds max_prompt_bytes ({})",
                self.0.limits.max_prompt_bytes
            )));
        }

        let session_id = match &request.session_id {
            Some(sid) if !sid.is_empty() => sid.clone(),
            _ => format!("sess-{}", uuid::Uuid::new_v4()),
        };

        let now = now_ms();
        let handle = self.0.run_controller.admit(person, &session_id, now)?;

        let preferred_mode = self.0.config_resolver.resolve(person.as_str());
        let max_tool_calls = self.0.limits.max_tool_calls_per_run;

        let chat_req = ChatStreamRequest {
            session_id: Some(session_id.clone()),
            message: effective_message.clone(),
            max_tool_calls,
        };

        let (upstream, runtime_mode, fallback_status) =
            match self.start_with_fallback(person.as_str(), chat_req, preferred_mode).await {
                Ok(started) => started,
                Err(e) => {
                    self.0.run_controller.release(person, &session_id, &handle.run_id);
                    return Err(e);
                }
            };

        let action_status = action
            .as_ref()
            .and_then(|a| a.max_steps)
            .map(|n| format!("max_steps={n} applied"));

        let first_message = effective_message.clone();

        let mut buffer = vec![ConversationItem::new(
            session_id.clone(),
            handle.run_id.clone(),
            0,
            now,
            ConversationItemKind::Message {
                role: Role::User,
                content: effective_message,
            },
        )];

        let (tx, rx) = mpsc::channel(self.0.limits.event_channel_capacity);

        let inner = self.0.clone();
        let person = person.clone();
        let run_id = handle.run_id.clone();
        let cancel = handle.cancel.clone();

        tokio::spawn(async move {
            run_worker(
                inner,
                WorkerParams {
                    run_id,
                    person,
                    session_id,
                    runtime_mode,
                    cancel,
                    tx,
                    upstream,
                    max_tool_calls,
                    fallback_status,
                    action_status,
                    first_message,
                    buffer,
                },
            )
            .await;
        });

        Ok(ChatStreamHandle {
            run_id: handle.run_id,
            events: rx,
        })
    }

    /// Attempt the preferred runtime, falling back to direct_key on a
    /// recoverable `RuntimeUnavailable` from gateway mode (§4.6).
    async fn start_with_fallback(
        &self,
        person: &str,
        request: ChatStreamRequest,
        preferred: RuntimeMode,
    ) -> Result<(mpsc::Receiver<UpstreamEvent>, RuntimeMode, Option<String>)> {
        let preferred_runtime = self.runtime_for(preferred);
        match preferred_runtime.chat_stream(person, request.clone()).await {
            Ok(rx) => Ok((rx, preferred, None)),
            Err(RuntimeError::Unavailable { mode, reason }) => {
                if preferred == RuntimeMode::Gateway && self.0.fallback_enabled {
                    let fallback = self.runtime_for(RuntimeMode::DirectKey);
                    if fallback.available().await {
                        match fallback.chat_stream(person, request).await {
                            Ok(rx) => {
                                let status =
                                    format!("runtime '{mode}' unavailable ({reason}); falling back to direct_key");
                                return Ok((rx, RuntimeMode::DirectKey, Some(status)));
                            }
                            Err(RuntimeError::Unavailable { mode, reason }) => {
                                return Err(OrchestratorError::RuntimeUnavailable { mode, reason });
                            }
                            Err(RuntimeError::Other(msg)) => {
                                return Err(OrchestratorError::UpstreamError(msg));
                            }
                        }
                    }
                }
                Err(OrchestratorError::RuntimeUnavailable { mode, reason })
            }
            Err(RuntimeError::Other(msg)) => Err(OrchestratorError::UpstreamError(msg)),
        }
    }

    fn runtime_for(&self, mode: RuntimeMode) -> Arc<dyn Runtime> {
        match mode {
            RuntimeMode::DirectKey => self.0.direct_key.clone(),
            RuntimeMode::Gateway => self.0.gateway.clone(),
        }
    }

    /// Signal cancellation for a run owned by `person` (§4.5 `StopRun`).
    pub fn stop_run(&self, person: &PersonId, run_id: &str) -> bool {
        self.0.run_controller.stop(person, run_id)
    }

    /// Wipe backend state, the SessionRecord, and the stored timeline.
    /// Rejected while a run is active for that session (§4.5 `ClearSession`).
    #[instrument(skip(self), fields(person = %person))]
    pub async fn clear_session(&self, person: &PersonId, session_id: &str) -> Result<()> {
        if self.0.run_controller.list_active(person).iter().any(|r| r.session_id == session_id) {
            return Err(OrchestratorError::InvalidRequest(format!(
                "session '{session_id}' has an active run; stop it before clearing"
            )));
        }

        let mode = self.0.sessions.get(person, session_id).ok().map(|r| r.runtime_mode);
        match mode {
            Some(RuntimeMode::DirectKey) => {
                let _ = self.0.direct_key.clear_session(person.as_str(), session_id).await;
            }
            Some(RuntimeMode::Gateway) => {
                let _ = self.0.gateway.clear_session(person.as_str(), session_id).await;
            }
            None => {
                let _ = self.0.direct_key.clear_session(person.as_str(), session_id).await;
                let _ = self.0.gateway.clear_session(person.as_str(), session_id).await;
            }
        }

        self.0.sessions.delete(person, session_id);
        self.0.conversations.clear(person, session_id);
        Ok(())
    }

    /// List sessions for `person`, coalescing in any backend transcripts the
    /// in-memory registry doesn't know about yet — e.g. after a process
    /// restart (§4.8).
    pub async fn list_sessions(&self, person: &PersonId) -> Vec<SessionSummary> {
        for recovered in self.0.gateway.recover_sessions(person.as_str(), RECOVERY_SCAN_LIMIT).await {
            self.0.sessions.insert_recovered(
                person,
                notes_sessions::SessionRecord {
                    session_id: recovered.session_id,
                    name: "Recovered session".to_string(),
                    runtime_mode: RuntimeMode::Gateway,
                    created_at: recovered.last_used_at,
                    last_used_at: recovered.last_used_at,
                },
            );
        }

        self.0
            .sessions
            .list_for_person(person, |session_id| self.0.conversations.last_assistant_text(person, session_id))
    }

    pub fn list_active_runs(&self, person: &PersonId) -> Vec<RunSummary> {
        self.0.run_controller.list_active(person)
    }

    /// Returns the stored timeline if present; otherwise recovers it from
    /// the session's runtime backend, caches it, and returns it (§4.5).
    #[instrument(skip(self), fields(person = %person))]
    pub async fn get_conversation_history(&self, person: &PersonId, session_id: &str) -> Result<Vec<ConversationItem>> {
        if let Some(items) = self.0.conversations.get(person, session_id) {
            return Ok(items);
        }

        let mode = self.0.sessions.get(person, session_id).ok().map(|r| r.runtime_mode);
        let messages = match mode {
            Some(RuntimeMode::DirectKey) => self.0.direct_key.get_history(person.as_str(), session_id).await,
            Some(RuntimeMode::Gateway) => self.0.gateway.get_history(person.as_str(), session_id).await,
            None => {
                match self.0.gateway.get_history(person.as_str(), session_id).await {
                    Ok(history) if !history.is_empty() => Ok(history),
                    _ => self.0.direct_key.get_history(person.as_str(), session_id).await,
                }
            }
        }
        .unwrap_or_default();

        if messages.is_empty() {
            return Ok(Vec::new());
        }

        let run_id = RunId::new();
        let now = now_ms();
        let items: Vec<ConversationItem> = messages
            .into_iter()
            .enumerate()
            .map(|(i, msg)| {
                ConversationItem::new(
                    session_id,
                    run_id.clone(),
                    i as u64 + 1,
                    now,
                    ConversationItemKind::Message {
                        role: match msg.role {
                            notes_runtime::provider::Role::User => Role::User,
                            _ => Role::Assistant,
                        },
                        content: msg.content,
                    },
                )
            })
            .collect();

        self.0.conversations.put(person, session_id, items.clone());
        info!(person = %person, session_id, count = items.len(), "recovered conversation history from runtime");
        Ok(items)
    }
}

struct WorkerParams {
    run_id: RunId,
    person: PersonId,
    session_id: String,
    runtime_mode: RuntimeMode,
    cancel: CancellationToken,
    tx: mpsc::Sender<CanonicalEvent>,
    upstream: mpsc::Receiver<UpstreamEvent>,
    max_tool_calls: u32,
    fallback_status: Option<String>,
    action_status: Option<String>,
    first_message: String,
    buffer: Vec<ConversationItem>,
}

enum TerminalReason {
    Cancelled,
    TimedOut,
    ToolCallLimit,
    Ok,
}

/// The per-run worker (§4.5): drives one upstream event stream to
/// completion, translating it into canonical events and a persisted
/// timeline, observing cancellation and the run deadline.
#[instrument(skip_all, fields(run_id = %params.run_id, person = %params.person))]
async fn run_worker(inner: Arc<Inner>, mut params: WorkerParams) {
    let mut seq = notes_protocol::SeqCounter::new();
    let run_id = params.run_id.clone();
    let mut session_id = params.session_id.clone();

    emit(&params.tx, CanonicalEvent::Start {
        session_id: session_id.clone(),
        run_id: run_id.clone(),
        seq: seq.next(),
        ts: now_ms(),
    })
    .await;

    if let Some(message) = params.fallback_status.take() {
        emit_status(&params.tx, &mut params.buffer, &session_id, &run_id, &mut seq, message).await;
    }
    if let Some(message) = params.action_status.take() {
        emit_status(&params.tx, &mut params.buffer, &session_id, &run_id, &mut seq, message).await;
    }

    let deadline = tokio::time::sleep(Duration::from_secs(inner.limits.max_run_duration_secs));
    tokio::pin!(deadline);

    let mut buf_assistant = String::new();
    let mut tool_calls: u32 = 0;
    let mut saw_text = false;
    let mut saw_err = false;

    let reason = loop {
        tokio::select! {
            biased;
            _ = params.cancel.cancelled() => {
                break TerminalReason::Cancelled;
            }
            _ = &mut deadline => {
                break TerminalReason::TimedOut;
            }
            maybe_event = params.upstream.recv() => {
                match maybe_event {
                    None => break TerminalReason::Ok,
                    Some(UpstreamEvent::Start { backend_session_id }) => {
                        if let Some(sid) = backend_session_id {
                            session_id = sid.clone();
                            inner.run_controller.update_session(&run_id, &sid, now_ms());
                        }
                    }
                    Some(UpstreamEvent::Done) => break TerminalReason::Ok,
                    Some(UpstreamEvent::Text { delta }) => {
                        saw_text = true;
                        buf_assistant.push_str(&delta);
                        emit(&params.tx, CanonicalEvent::Text {
                            delta,
                            run_id: run_id.clone(),
                            seq: seq.next(),
                            ts: now_ms(),
                        }).await;
                    }
                    Some(UpstreamEvent::ToolCall { tool, args }) => {
                        tool_calls += 1;
                        if tool_calls > params.max_tool_calls {
                            break TerminalReason::ToolCallLimit;
                        }
                        flush_assistant(&mut buf_assistant, &mut params.buffer, &session_id, &run_id, &mut seq);
                        emit_item(&params.tx, &mut params.buffer, &session_id, &run_id, &mut seq,
                            CanonicalEvent::ToolCall { tool: tool.clone(), args: args.clone(), run_id: run_id.clone(), seq: 0, ts: 0 },
                            ConversationItemKind::ToolCall { tool, args }).await;
                    }
                    Some(UpstreamEvent::ToolResult { tool, ok, summary }) => {
                        flush_assistant(&mut buf_assistant, &mut params.buffer, &session_id, &run_id, &mut seq);
                        emit_item(&params.tx, &mut params.buffer, &session_id, &run_id, &mut seq,
                            CanonicalEvent::ToolResult { tool: tool.clone(), ok, summary: summary.clone(), run_id: run_id.clone(), seq: 0, ts: 0 },
                            ConversationItemKind::ToolResult { tool, ok, summary }).await;
                    }
                    Some(UpstreamEvent::Status { message }) => {
                        flush_assistant(&mut buf_assistant, &mut params.buffer, &session_id, &run_id, &mut seq);
                        if !message.contains("gateway mode==") {
                            emit_status(&params.tx, &mut params.buffer, &session_id, &run_id, &mut seq, message).await;
                        }
                    }
                    Some(UpstreamEvent::Error { message }) => {
                        saw_err = true;
                        flush_assistant(&mut buf_assistant, &mut params.buffer, &session_id, &run_id, &mut seq);
                        emit_item(&params.tx, &mut params.buffer, &session_id, &run_id, &mut seq,
                            CanonicalEvent::Error { message: message.clone(), run_id: run_id.clone(), seq: 0, ts: 0 },
                            ConversationItemKind::Error { message }).await;
                    }
                    Some(UpstreamEvent::Usage { input_tokens, output_tokens, total_tokens, context_window, remaining_tokens }) => {
                        flush_assistant(&mut buf_assistant, &mut params.buffer, &session_id, &run_id, &mut seq);
                        emit_item(&params.tx, &mut params.buffer, &session_id, &run_id, &mut seq,
                            CanonicalEvent::Usage { input_tokens, output_tokens, total_tokens, context_window, remaining_tokens, run_id: run_id.clone(), seq: 0, ts: 0 },
                            ConversationItemKind::Usage { input_tokens, output_tokens, total_tokens, context_window, remaining_tokens }).await;
                    }
                }
            }
        }
    };

    flush_assistant(&mut buf_assistant, &mut params.buffer, &session_id, &run_id, &mut seq);

    match reason {
        TerminalReason::Cancelled => {
            emit_item(&params.tx, &mut params.buffer, &session_id, &run_id, &mut seq,
                CanonicalEvent::Error { message: "Run cancelled".to_string(), run_id: run_id.clone(), seq: 0, ts: 0 },
                ConversationItemKind::Error { message: "Run cancelled".to_string() }).await;
            spawn_drain(params.upstream);
        }
        TerminalReason::TimedOut => {
            emit_item(&params.tx, &mut params.buffer, &session_id, &run_id, &mut seq,
                CanonicalEvent::Error { message: "Run timed out".to_string(), run_id: run_id.clone(), seq: 0, ts: 0 },
                ConversationItemKind::Error { message: "Run timed out".to_string() }).await;
            spawn_drain(params.upstream);
        }
        TerminalReason::ToolCallLimit => {
            let message = format!("max tool calls ({}) exceeded", params.max_tool_calls);
            emit_item(&params.tx, &mut params.buffer, &session_id, &run_id, &mut seq,
                CanonicalEvent::Error { message: message.clone(), run_id: run_id.clone(), seq: 0, ts: 0 },
                ConversationItemKind::Error { message }).await;
            spawn_drain(params.upstream);
        }
        TerminalReason::Ok if !saw_text && !saw_err => {
            let message = "No assistant output received from the runtime".to_string();
            emit_item(&params.tx, &mut params.buffer, &session_id, &run_id, &mut seq,
                CanonicalEvent::Error { message: message.clone(), run_id: run_id.clone(), seq: 0, ts: 0 },
                ConversationItemKind::Error { message }).await;
        }
        TerminalReason::Ok => {}
    }

    emit(&params.tx, CanonicalEvent::Done {
        session_id: session_id.clone(),
        run_id: run_id.clone(),
        seq: seq.next(),
        ts: now_ms(),
    })
    .await;

    let now = now_ms();
    if !session_id.is_empty() {
        inner.conversations.append_run(&params.person, &session_id, std::mem::take(&mut params.buffer));
        if inner.sessions.get(&params.person, &session_id).is_err() {
            inner.sessions.create(&params.person, &session_id, Some(&params.first_message), params.runtime_mode, now);
        } else {
            inner.sessions.touch(&params.person, &session_id, now, params.runtime_mode);
        }
    }
    inner.run_controller.release(&params.person, &session_id, &run_id);

    warn_if_tool_limit(tool_calls, params.max_tool_calls);
}

fn warn_if_tool_limit(tool_calls: u32, max: u32) {
    if tool_calls > max {
        warn!(tool_calls, max, "run terminated on tool call limit");
    }
}

async fn emit(tx: &mpsc::Sender<CanonicalEvent>, event: CanonicalEvent) {
    let _ = tx.send(event).await;
}

async fn emit_status(
    tx: &mpsc::Sender<CanonicalEvent>,
    buffer: &mut Vec<ConversationItem>,
    session_id: &str,
    run_id: &RunId,
    seq: &mut notes_protocol::SeqCounter,
    message: String,
) {
    emit_item(tx, buffer, session_id, run_id, seq,
        CanonicalEvent::Status { message: message.clone(), run_id: run_id.clone(), seq: 0, ts: 0 },
        ConversationItemKind::Status { message }).await;
}

/// Stamp `seq`/`ts` onto `event`, record the matching `ConversationItem`,
/// and send the event to the client.
async fn emit_item(
    tx: &mpsc::Sender<CanonicalEvent>,
    buffer: &mut Vec<ConversationItem>,
    session_id: &str,
    run_id: &RunId,
    seq: &mut notes_protocol::SeqCounter,
    event: CanonicalEvent,
    kind: ConversationItemKind,
) {
    let stamped_seq = seq.next();
    let ts = now_ms();
    let event = restamp(event, stamped_seq, ts);
    buffer.push(ConversationItem::new(session_id, run_id.clone(), stamped_seq, ts, kind));
    let _ = tx.send(event).await;
}

fn restamp(event: CanonicalEvent, seq: u64, ts: i64) -> CanonicalEvent {
    match event {
        CanonicalEvent::ToolCall { tool, args, run_id, .. } => {
            CanonicalEvent::ToolCall { tool, args, run_id, seq, ts }
        }
        CanonicalEvent::ToolResult { tool, ok, summary, run_id, .. } => {
            CanonicalEvent::ToolResult { tool, ok, summary, run_id, seq, ts }
        }
        CanonicalEvent::Status { message, run_id, .. } => {
            CanonicalEvent::Status { message, run_id, seq, ts }
        }
        CanonicalEvent::Error { message, run_id, .. } => {
            CanonicalEvent::Error { message, run_id, seq, ts }
        }
        CanonicalEvent::Usage { input_tokens, output_tokens, total_tokens, context_window, remaining_tokens, run_id, .. } => {
            CanonicalEvent::Usage { input_tokens, output_tokens, total_tokens, context_window, remaining_tokens, run_id, seq, ts }
        }
        other => other,
    }
}

fn flush_assistant(
    buf_assistant: &mut String,
    buffer: &mut Vec<ConversationItem>,
    session_id: &str,
    run_id: &RunId,
    seq: &mut notes_protocol::SeqCounter,
) {
    if buf_assistant.is_empty() {
        return;
    }
    let content = std::mem::take(buf_assistant);
    buffer.push(ConversationItem::new(
        session_id,
        run_id.clone(),
        seq.next(),
        now_ms(),
        ConversationItemKind::Message { role: Role::Assistant, content },
    ));
}

/// Drain the rest of an upstream channel in the background so its producer
/// task (still running a tool loop or reading a sidecar stream) never
/// blocks on a full channel after the orchestrator has stopped listening.
fn spawn_drain(mut upstream: mpsc::Receiver<UpstreamEvent>) {
    tokio::spawn(async move { while upstream.recv().await.is_some() {} });
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use notes_core::config::CoreConfig;
    use notes_runtime::ChatMessage;

    struct StubRuntime {
        mode: &'static str,
        available: bool,
        events: Vec<UpstreamEvent>,
    }

    #[async_trait]
    impl Runtime for StubRuntime {
        fn mode(&self) -> &str {
            self.mode
        }
        async fn available(&self) -> bool {
            self.available
        }
        async fn chat_stream(
            &self,
            _person: &str,
            _request: ChatStreamRequest,
        ) -> std::result::Result<mpsc::Receiver<UpstreamEvent>, RuntimeError> {
            if !self.available {
                return Err(RuntimeError::Unavailable {
                    mode: self.mode.to_string(),
                    reason: "stub unavailable".to_string(),
                });
            }
            let (tx, rx) = mpsc::channel(16);
            let events = self.events.clone();
            tokio::spawn(async move {
                for e in events {
                    let _ = tx.send(e).await;
                }
            });
            Ok(rx)
        }
        async fn clear_session(&self, _person: &str, _session_id: &str) -> std::result::Result<(), RuntimeError> {
            Ok(())
        }
        async fn get_history(&self, _person: &str, _session_id: &str) -> std::result::Result<Vec<ChatMessage>, RuntimeError> {
            Ok(Vec::new())
        }
    }

    fn make_orchestrator(direct_available: bool, gateway_available: bool, events: Vec<UpstreamEvent>) -> (Orchestrator, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let direct_key: Arc<dyn Runtime> = Arc::new(StubRuntime { mode: "direct_key", available: direct_available, events: events.clone() });
        let gateway: Arc<dyn Runtime> = Arc::new(StubRuntime { mode: "gateway", available: gateway_available, events });
        let limits = CoreConfig::default().limits;
        let orch = Orchestrator::new(direct_key, gateway, dir.path(), RuntimeMode::DirectKey, limits, true);
        (orch, dir)
    }

    #[tokio::test]
    async fn chat_collects_text_and_ends_with_done() {
        let (orch, _dir) = make_orchestrator(
            true,
            false,
            vec![UpstreamEvent::Text { delta: "hello".into() }, UpstreamEvent::Done],
        );
        let person = PersonId::from("alice");
        let result = orch.chat(&person, ChatRequest { message: Some("hi".into()), ..Default::default() }).await.unwrap();
        assert_eq!(result.response_text, "hello");
        assert!(!result.session_id.is_empty());
    }

    #[tokio::test]
    async fn empty_upstream_yields_synthetic_error_then_done() {
        let (orch, _dir) = make_orchestrator(true, false, vec![UpstreamEvent::Done]);
        let person = PersonId::from("alice");
        let mut handle = orch.chat_stream(&person, ChatRequest { message: Some("hi".into()), ..Default::default() }).await.unwrap();

        let mut kinds = Vec::new();
        while let Some(e) = handle.events.recv().await {
            kinds.push(event_kind(&e));
        }
        assert_eq!(kinds, vec!["start", "error", "done"]);
    }

    #[tokio::test]
    async fn second_request_on_same_session_is_rejected_while_first_runs() {
        // Upstream channel is held open (never sends Done) to simulate a blocking run.
        struct BlockingRuntime;
        #[async_trait]
        impl Runtime for BlockingRuntime {
            fn mode(&self) -> &str { "direct_key" }
            async fn available(&self) -> bool { true }
            async fn chat_stream(&self, _p: &str, _r: ChatStreamRequest) -> std::result::Result<mpsc::Receiver<UpstreamEvent>, RuntimeError> {
                let (tx, rx) = mpsc::channel(4);
                std::mem::forget(tx); // leaked sender keeps the channel open forever
                Ok(rx)
            }
            async fn clear_session(&self, _p: &str, _s: &str) -> std::result::Result<(), RuntimeError> { Ok(()) }
            async fn get_history(&self, _p: &str, _s: &str) -> std::result::Result<Vec<ChatMessage>, RuntimeError> { Ok(Vec::new()) }
        }
        let dir = tempfile::tempdir().unwrap();
        let direct_key: Arc<dyn Runtime> = Arc::new(BlockingRuntime);
        let gateway: Arc<dyn Runtime> = Arc::new(StubRuntime { mode: "gateway", available: false, events: vec![] });
        let limits = CoreConfig::default().limits;
        let orch = Orchestrator::new(direct_key, gateway, dir.path(), RuntimeMode::DirectKey, limits, false);

        let person = PersonId::from("alice");
        let _first = orch
            .chat_stream(&person, ChatRequest { session_id: Some("session-x".into()), message: Some("go".into()), ..Default::default() })
            .await
            .unwrap();

        let second = orch
            .chat_stream(&person, ChatRequest { session_id: Some("session-x".into()), message: Some("again".into()), ..Default::default() })
            .await;
        assert!(matches!(second, Err(OrchestratorError::SessionBusy { .. })));
    }

    #[tokio::test]
    async fn gateway_unavailable_falls_back_to_direct_key_with_status() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("alice/agent")).unwrap();
        std::fs::write(dir.path().join("alice/agent/config.json"), r#"{"runtime_mode":"gateway"}"#).unwrap();

        let direct_key: Arc<dyn Runtime> = Arc::new(StubRuntime {
            mode: "direct_key",
            available: true,
            events: vec![UpstreamEvent::Text { delta: "ok".into() }, UpstreamEvent::Done],
        });
        let gateway: Arc<dyn Runtime> = Arc::new(StubRuntime { mode: "gateway", available: false, events: vec![] });
        let limits = CoreConfig::default().limits;
        let orch = Orchestrator::new(direct_key, gateway, dir.path(), RuntimeMode::DirectKey, limits, true);

        let person = PersonId::from("alice");
        let mut handle = orch
            .chat_stream(&person, ChatRequest { message: Some("hi".into()), ..Default::default() })
            .await
            .unwrap();

        let mut saw_fallback_status = false;
        while let Some(e) = handle.events.recv().await {
            if let CanonicalEvent::Status { message, .. } = &e {
                if message.contains("unavailable") {
                    saw_fallback_status = true;
                }
            }
        }
        assert!(saw_fallback_status);
    }

    #[tokio::test]
    async fn two_concurrent_runs_on_different_sessions_for_same_person_both_admit() {
        let (orch, _dir) = make_orchestrator(
            true,
            false,
            vec![UpstreamEvent::Text { delta: "hi".into() }, UpstreamEvent::Done],
        );
        let person = PersonId::from("alice");
        let a = orch
            .chat_stream(&person, ChatRequest { session_id: Some("s1".into()), message: Some("a".into()), ..Default::default() })
            .await
            .unwrap();
        let b = orch
            .chat_stream(&person, ChatRequest { session_id: Some("s2".into()), message: Some("b".into()), ..Default::default() })
            .await
            .unwrap();
        assert_ne!(a.run_id, b.run_id);
    }

    #[tokio::test]
    async fn assistant_text_is_segmented_by_a_tool_call() {
        let (orch, _dir) = make_orchestrator(
            true,
            false,
            vec![
                UpstreamEvent::Text { delta: "before".into() },
                UpstreamEvent::ToolCall { tool: "search".into(), args: serde_json::json!({}) },
                UpstreamEvent::ToolResult { tool: "search".into(), ok: true, summary: "done".into() },
                UpstreamEvent::Text { delta: "after".into() },
                UpstreamEvent::Done,
            ],
        );
        let person = PersonId::from("alice");
        let mut handle = orch
            .chat_stream(&person, ChatRequest { message: Some("hi".into()), ..Default::default() })
            .await
            .unwrap();

        let mut kinds = Vec::new();
        while let Some(e) = handle.events.recv().await {
            kinds.push(event_kind(&e));
        }
        assert_eq!(kinds, vec!["start", "text", "tool_call", "tool_result", "text", "done"]);
    }

    #[tokio::test]
    async fn oversized_prompt_is_rejected_before_any_run_is_admitted() {
        let (orch, _dir) = make_orchestrator(true, false, vec![]);
        let person = PersonId::from("alice");
        let huge = "a".repeat(CoreConfig::default().limits.max_prompt_bytes + 1);
        let result = orch.chat_stream(&person, ChatRequest { message: Some(huge), ..Default::default() }).await;
        assert!(matches!(result, Err(OrchestratorError::InvalidRequest(_))));
    }

    #[tokio::test]
    async fn exceeding_max_tool_calls_terminates_the_run_with_an_error() {
        let mut events = Vec::new();
        for i in 0..3 {
            events.push(UpstreamEvent::ToolCall { tool: format!("t{i}"), args: serde_json::json!({}) });
            events.push(UpstreamEvent::ToolResult { tool: format!("t{i}"), ok: true, summary: "ok".into() });
        }
        let dir = tempfile::tempdir().unwrap();
        let direct_key: Arc<dyn Runtime> = Arc::new(StubRuntime { mode: "direct_key", available: true, events });
        let gateway: Arc<dyn Runtime> = Arc::new(StubRuntime { mode: "gateway", available: false, events: vec![] });
        let mut limits = CoreConfig::default().limits;
        limits.max_tool_calls_per_run = 2;
        let orch = Orchestrator::new(direct_key, gateway, dir.path(), RuntimeMode::DirectKey, limits, false);

        let person = PersonId::from("alice");
        let mut handle = orch.chat_stream(&person, ChatRequest { message: Some("go".into()), ..Default::default() }).await.unwrap();

        let mut saw_limit_error = false;
        while let Some(e) = handle.events.recv().await {
            if let CanonicalEvent::Error { message, .. } = &e {
                if message.contains("max tool calls") {
                    saw_limit_error = true;
                }
            }
        }
        assert!(saw_limit_error);
    }

    #[tokio::test]
    async fn completed_run_names_its_session_from_the_first_message() {
        let (orch, _dir) = make_orchestrator(true, false, vec![UpstreamEvent::Text { delta: "hi".into() }, UpstreamEvent::Done]);
        let person = PersonId::from("alice");
        let mut handle = orch
            .chat_stream(&person, ChatRequest { message: Some("  what's   the plan for today  ".into()), ..Default::default() })
            .await
            .unwrap();
        while handle.events.recv().await.is_some() {}

        let sessions = orch.list_sessions(&person).await;
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].name, "what's the plan for today");
    }

    #[tokio::test]
    async fn a_second_run_on_the_same_session_does_not_rename_it() {
        let (orch, _dir) = make_orchestrator(true, false, vec![UpstreamEvent::Text { delta: "hi".into() }, UpstreamEvent::Done]);
        let person = PersonId::from("alice");

        let mut first = orch
            .chat_stream(&person, ChatRequest { session_id: Some("s1".into()), message: Some("first message".into()), ..Default::default() })
            .await
            .unwrap();
        while first.events.recv().await.is_some() {}

        let mut second = orch
            .chat_stream(&person, ChatRequest { session_id: Some("s1".into()), message: Some("second message".into()), ..Default::default() })
            .await
            .unwrap();
        while second.events.recv().await.is_some() {}

        let sessions = orch.list_sessions(&person).await;
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].name, "first message");
    }

    fn event_kind(e: &CanonicalEvent) -> &'static str {
        match e {
            CanonicalEvent::Start { .. } => "start",
            CanonicalEvent::Text { .. } => "text",
            CanonicalEvent::ToolCall { .. } => "tool_call",
            CanonicalEvent::ToolResult { .. } => "tool_result",
            CanonicalEvent::Status { .. } => "status",
            CanonicalEvent::Error { .. } => "error",
            CanonicalEvent::Usage { .. } => "usage",
            CanonicalEvent::Done { .. } => "done",
        }
    }
}
