use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::prompt::{SystemPromptLoader, TurnInfo};
use crate::provider::{Message, Role};
use crate::runtime::{ChatMessage, ChatStreamRequest, RecoveredSession, Runtime, RuntimeError, UpstreamEvent};
use crate::session_map::RuntimeSessionMap;

use notes_core::config::MIN_EVENT_CHANNEL_CAPACITY;

const TRANSCRIPT_DIR_ENV: &str = "PI_GATEWAY_PI_SESSION_DIR";

#[derive(Serialize)]
struct GatewayRequest<'a> {
    person: &'a str,
    session_id: &'a str,
    message: &'a str,
    system_prompt: &'a str,
}

/// NDJSON line shape emitted by the sidecar — field names identical to
/// the canonical event protocol (§6.2); `run_id`/`seq`/`ts` are the
/// gateway's own and are ignored here since the orchestrator stamps its
/// own values before forwarding to clients.
#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum GatewayLine {
    Start {
        session_id: String,
    },
    Text {
        delta: String,
    },
    ToolCall {
        tool: String,
        args: serde_json::Value,
    },
    ToolResult {
        tool: String,
        ok: bool,
        summary: String,
    },
    Status {
        message: String,
    },
    Error {
        message: String,
    },
    Usage {
        input_tokens: u64,
        output_tokens: u64,
        total_tokens: u64,
        #[serde(default)]
        context_window: Option<u64>,
        #[serde(default)]
        remaining_tokens: Option<u64>,
    },
    Done {},
}

impl From<GatewayLine> for UpstreamEvent {
    fn from(line: GatewayLine) -> Self {
        match line {
            GatewayLine::Start { session_id } => UpstreamEvent::Start {
                backend_session_id: Some(session_id),
            },
            GatewayLine::Text { delta } => UpstreamEvent::Text { delta },
            GatewayLine::ToolCall { tool, args } => UpstreamEvent::ToolCall { tool, args },
            GatewayLine::ToolResult { tool, ok, summary } => {
                UpstreamEvent::ToolResult { tool, ok, summary }
            }
            GatewayLine::Status { message } => UpstreamEvent::Status { message },
            GatewayLine::Error { message } => UpstreamEvent::Error { message },
            GatewayLine::Usage {
                input_tokens,
                output_tokens,
                total_tokens,
                context_window,
                remaining_tokens,
            } => UpstreamEvent::Usage {
                input_tokens,
                output_tokens,
                total_tokens,
                context_window,
                remaining_tokens,
            },
            GatewayLine::Done {} => UpstreamEvent::Done,
        }
    }
}

/// Transcript entry shape recognised during history recovery (§6.3). Any
/// other `type` or non-text content part is ignored.
#[derive(Deserialize)]
struct TranscriptLine {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    message: Option<TranscriptMessage>,
}

#[derive(Deserialize)]
struct TranscriptMessage {
    role: String,
    content: Vec<TranscriptContentPart>,
}

#[derive(Deserialize)]
struct TranscriptContentPart {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

/// Forwards to an external sidecar over NDJSON (C3). Maintains the
/// app-session ↔ backend-session mapping persisted in the vault.
pub struct GatewayRuntime {
    client: reqwest::Client,
    base_url: String,
    session_map: Arc<RuntimeSessionMap>,
    prompt_loader: SystemPromptLoader,
    transcript_dir: PathBuf,
}

impl GatewayRuntime {
    pub fn new(base_url: String, vault_root: PathBuf) -> Self {
        let session_map = Arc::new(RuntimeSessionMap::load(&vault_root));
        let prompt_loader = SystemPromptLoader::new(vault_root);
        let transcript_dir = std::env::var(TRANSCRIPT_DIR_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| default_transcript_dir());

        Self {
            client: reqwest::Client::new(),
            base_url,
            session_map,
            prompt_loader,
            transcript_dir,
        }
    }

    fn transcript_path(&self, person: &str, runtime_session: &str) -> PathBuf {
        self.transcript_dir
            .join(format!("{person}--{runtime_session}.jsonl"))
    }
}

#[async_trait]
impl Runtime for GatewayRuntime {
    fn mode(&self) -> &str {
        "gateway"
    }

    async fn available(&self) -> bool {
        !self.base_url.trim().is_empty()
    }

    async fn chat_stream(
        &self,
        person: &str,
        request: ChatStreamRequest,
    ) -> Result<mpsc::Receiver<UpstreamEvent>, RuntimeError> {
        if self.base_url.trim().is_empty() {
            return Err(RuntimeError::Unavailable {
                mode: self.mode().to_string(),
                reason: "no gateway URL configured".to_string(),
            });
        }

        let app_session = request.session_id.clone().ok_or_else(|| RuntimeError::Other(
            "gateway runtime requires a resolved session_id".to_string(),
        ))?;

        let backend_session_id = self
            .session_map
            .get(person, &app_session)
            .unwrap_or_default();

        let system_prompt = self
            .prompt_loader
            .build(person, Some(&TurnInfo { session_id: app_session.clone(), turn_count: 0 }))
            .to_plain_text();

        let body = GatewayRequest {
            person,
            session_id: &backend_session_id,
            message: &request.message,
            system_prompt: &system_prompt,
        };

        let url = format!("{}/v1/chat-stream", self.base_url.trim_end_matches('/'));
        debug!(url, person, "posting to gateway sidecar");

        let resp = self
            .client
            .post(&url)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| RuntimeError::Unavailable {
                mode: self.mode().to_string(),
                reason: e.to_string(),
            })?;

        let status = resp.status();
        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(RuntimeError::Unavailable {
                mode: self.mode().to_string(),
                reason: format!("gateway rejected the request (HTTP {status})"),
            });
        }
        if !status.is_success() {
            return Err(RuntimeError::Unavailable {
                mode: self.mode().to_string(),
                reason: format!("gateway returned HTTP {status}"),
            });
        }

        let (tx, rx) = mpsc::channel(MIN_EVENT_CHANNEL_CAPACITY);
        let session_map = self.session_map.clone();
        let person = person.to_string();

        tokio::spawn(async move {
            let mut saw_done = false;
            let mut byte_stream = resp.bytes_stream();
            let mut line_buf = String::new();

            while let Some(chunk) = byte_stream.next().await {
                let chunk = match chunk {
                    Ok(c) => c,
                    Err(e) => {
                        let _ = tx.send(UpstreamEvent::Error { message: e.to_string() }).await;
                        break;
                    }
                };
                let Ok(text) = std::str::from_utf8(&chunk) else {
                    continue;
                };
                line_buf.push_str(text);

                while let Some(newline_pos) = line_buf.find('\n') {
                    let line = line_buf[..newline_pos].trim().to_string();
                    line_buf.drain(..=newline_pos);
                    if line.is_empty() {
                        continue;
                    }

                    match serde_json::from_str::<GatewayLine>(&line) {
                        Ok(GatewayLine::Start { session_id }) => {
                            session_map.set(&person, &app_session, &session_id);
                            if tx
                                .send(UpstreamEvent::Start {
                                    backend_session_id: Some(session_id),
                                })
                                .await
                                .is_err()
                            {
                                return;
                            }
                        }
                        Ok(parsed) => {
                            if matches!(parsed, GatewayLine::Done {}) {
                                saw_done = true;
                            }
                            if tx.send(parsed.into()).await.is_err() {
                                return;
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, line, "unparseable gateway NDJSON line");
                        }
                    }
                }
            }

            if !saw_done {
                // Synthesize a terminal done on a close that didn't send one.
                let _ = tx.send(UpstreamEvent::Done).await;
            }
        });

        Ok(rx)
    }

    async fn clear_session(&self, person: &str, session_id: &str) -> Result<(), RuntimeError> {
        self.session_map.clear(person, session_id);
        Ok(())
    }

    async fn get_history(
        &self,
        person: &str,
        session_id: &str,
    ) -> Result<Vec<ChatMessage>, RuntimeError> {
        let Some(backend_session) = self.session_map.get(person, session_id) else {
            return Ok(Vec::new());
        };

        let path = self.transcript_path(person, &backend_session);
        let content = match std::fs::read_to_string(&path) {
            Ok(c) => c,
            Err(_) => return Ok(Vec::new()),
        };

        let mut messages = Vec::new();
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let Ok(parsed) = serde_json::from_str::<TranscriptLine>(line) else {
                continue;
            };
            if parsed.kind != "message" {
                continue;
            }
            let Some(msg) = parsed.message else { continue };
            let role = match msg.role.as_str() {
                "user" => Role::User,
                "assistant" => Role::Assistant,
                _ => Role::System,
            };
            let text: String = msg
                .content
                .into_iter()
                .filter(|p| p.kind == "text")
                .filter_map(|p| p.text)
                .collect::<Vec<_>>()
                .join("");
            if !text.is_empty() {
                messages.push(Message { role, content: text });
            }
        }

        info!(person, session_id, count = messages.len(), "recovered gateway transcript");
        Ok(messages)
    }

    /// Walks the persisted app-session↔backend-session map for `person` and
    /// checks which backend sessions still have a transcript file on disk,
    /// newest-first by the transcript's modification time (§4.8).
    async fn recover_sessions(&self, person: &str, limit: usize) -> Vec<RecoveredSession> {
        let mut found: Vec<RecoveredSession> = self
            .session_map
            .entries_for_person(person)
            .into_iter()
            .filter_map(|(app_session, runtime_session)| {
                let path = self.transcript_path(person, &runtime_session);
                let modified = std::fs::metadata(&path).ok()?.modified().ok()?;
                let last_used_at = modified
                    .duration_since(std::time::UNIX_EPOCH)
                    .ok()?
                    .as_millis() as i64;
                Some(RecoveredSession { session_id: app_session, last_used_at })
            })
            .collect();

        found.sort_by(|a, b| b.last_used_at.cmp(&a.last_used_at));
        found.truncate(limit);
        found
    }
}

fn default_transcript_dir() -> PathBuf {
    std::env::var("HOME")
        .map(|home| PathBuf::from(home).join(".pi").join("sessions"))
        .unwrap_or_else(|_| PathBuf::from(".pi/sessions"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gateway_line_start_maps_to_upstream_start() {
        let line: GatewayLine =
            serde_json::from_str(r#"{"type":"start","session_id":"s1","run_id":"ignored"}"#)
                .unwrap();
        let event: UpstreamEvent = line.into();
        match event {
            UpstreamEvent::Start { backend_session_id } => {
                assert_eq!(backend_session_id, Some("s1".to_string()));
            }
            _ => panic!("expected Start"),
        }
    }

    #[test]
    fn gateway_line_ignores_unknown_extra_fields() {
        let line: GatewayLine =
            serde_json::from_str(r#"{"type":"text","delta":"hi","run_id":"r","seq":3,"ts":1}"#)
                .unwrap();
        match line {
            GatewayLine::Text { delta } => assert_eq!(delta, "hi"),
            _ => panic!("expected Text"),
        }
    }

    #[test]
    fn transcript_recovery_ignores_non_text_parts_and_other_types() {
        let jsonl = r#"{"type":"meta","message":{"role":"user","content":[]}}
{"type":"message","message":{"role":"user","content":[{"type":"text","text":"hello"}]}}
{"type":"message","message":{"role":"assistant","content":[{"type":"image","text":null},{"type":"text","text":"world"}]}}
"#;
        let mut messages = Vec::new();
        for line in jsonl.lines() {
            let Ok(parsed) = serde_json::from_str::<TranscriptLine>(line) else { continue };
            if parsed.kind != "message" {
                continue;
            }
            let Some(msg) = parsed.message else { continue };
            let text: String = msg
                .content
                .into_iter()
                .filter(|p| p.kind == "text")
                .filter_map(|p| p.text)
                .collect::<Vec<_>>()
                .join("");
            if !text.is_empty() {
                messages.push(text);
            }
        }
        assert_eq!(messages, vec!["hello".to_string(), "world".to_string()]);
    }

    fn runtime_with_transcript_dir(vault: &std::path::Path, transcript_dir: PathBuf) -> GatewayRuntime {
        GatewayRuntime {
            client: reqwest::Client::new(),
            base_url: "http://example.test".to_string(),
            session_map: Arc::new(RuntimeSessionMap::load(vault)),
            prompt_loader: SystemPromptLoader::new(vault.to_path_buf()),
            transcript_dir,
        }
    }

    #[tokio::test]
    async fn recover_sessions_finds_transcripts_still_on_disk_newest_first() {
        let vault = tempfile::tempdir().unwrap();
        let transcripts = tempfile::tempdir().unwrap();
        let runtime = runtime_with_transcript_dir(vault.path(), transcripts.path().to_path_buf());

        runtime.session_map.set("alice", "app-old", "backend-old");
        runtime.session_map.set("alice", "app-new", "backend-new");
        runtime.session_map.set("alice", "app-gone", "backend-gone");

        std::fs::write(transcripts.path().join("alice--backend-old.jsonl"), "{}").unwrap();
        std::thread::sleep(std::time::Duration::from_millis(10));
        std::fs::write(transcripts.path().join("alice--backend-new.jsonl"), "{}").unwrap();

        let recovered = runtime.recover_sessions("alice", 10).await;
        let ids: Vec<&str> = recovered.iter().map(|r| r.session_id.as_str()).collect();
        assert_eq!(ids, vec!["app-new", "app-old"]);
    }

    #[tokio::test]
    async fn recover_sessions_is_bounded_by_limit() {
        let vault = tempfile::tempdir().unwrap();
        let transcripts = tempfile::tempdir().unwrap();
        let runtime = runtime_with_transcript_dir(vault.path(), transcripts.path().to_path_buf());

        for i in 0..5 {
            let app = format!("app-{i}");
            let backend = format!("backend-{i}");
            runtime.session_map.set("alice", &app, &backend);
            std::fs::write(transcripts.path().join(format!("alice--{backend}.jsonl")), "{}").unwrap();
        }

        let recovered = runtime.recover_sessions("alice", 2).await;
        assert_eq!(recovered.len(), 2);
    }

    #[tokio::test]
    async fn recover_sessions_ignores_other_people() {
        let vault = tempfile::tempdir().unwrap();
        let transcripts = tempfile::tempdir().unwrap();
        let runtime = runtime_with_transcript_dir(vault.path(), transcripts.path().to_path_buf());

        runtime.session_map.set("bob", "app-1", "backend-1");
        std::fs::write(transcripts.path().join("bob--backend-1.jsonl"), "{}").unwrap();

        assert!(runtime.recover_sessions("alice", 10).await.is_empty());
    }
}
