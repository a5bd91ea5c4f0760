use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::anthropic::AnthropicProvider;
use crate::prompt::{SystemPromptLoader, TurnInfo};
use crate::provider::{ChatRequest, LlmProvider, Message, Role};
use crate::runtime::{ChatMessage, ChatStreamRequest, Runtime, RuntimeError, UpstreamEvent};
use crate::tools::{build_tools, to_definitions};

use notes_core::config::MIN_EVENT_CHANNEL_CAPACITY;

const DEFAULT_MAX_TOKENS: u32 = 4096;

type SessionKey = (String, String);

struct Inner {
    provider: AnthropicProvider,
    default_model: String,
    vault_root: PathBuf,
    prompt_loader: SystemPromptLoader,
    has_credentials: bool,
    histories: DashMap<SessionKey, Vec<Message>>,
    turn_counts: DashMap<SessionKey, u32>,
}

/// In-process LLM runtime (C2): runs the tool-use loop directly against the
/// Anthropic Messages API, executing tools against the person's vault.
#[derive(Clone)]
pub struct DirectKeyRuntime(Arc<Inner>);

impl DirectKeyRuntime {
    pub fn new(
        api_key: String,
        base_url: Option<String>,
        vault_root: PathBuf,
        default_model: String,
    ) -> Self {
        let has_credentials = !api_key.trim().is_empty();
        let prompt_loader = SystemPromptLoader::new(vault_root.clone());
        Self(Arc::new(Inner {
            provider: AnthropicProvider::new(api_key, base_url),
            default_model,
            vault_root,
            prompt_loader,
            has_credentials,
            histories: DashMap::new(),
            turn_counts: DashMap::new(),
        }))
    }
}

#[async_trait]
impl Runtime for DirectKeyRuntime {
    fn mode(&self) -> &str {
        "direct_key"
    }

    async fn available(&self) -> bool {
        self.0.has_credentials
    }

    async fn chat_stream(
        &self,
        person: &str,
        request: ChatStreamRequest,
    ) -> Result<mpsc::Receiver<UpstreamEvent>, RuntimeError> {
        if !self.0.has_credentials {
            return Err(RuntimeError::Unavailable {
                mode: self.mode().to_string(),
                reason: "no API key configured".to_string(),
            });
        }

        let session_id = request.session_id.clone().ok_or_else(|| RuntimeError::Other(
            "direct_key runtime requires a resolved session_id".to_string(),
        ))?;
        let key: SessionKey = (person.to_string(), session_id.clone());

        let messages = {
            let mut history = self.0.histories.entry(key.clone()).or_default();
            history.push(Message {
                role: Role::User,
                content: request.message.clone(),
            });
            history.clone()
        };

        let turn = {
            let mut counter = self.0.turn_counts.entry(key.clone()).or_insert(0);
            *counter += 1;
            *counter
        };

        let person_root = self.0.vault_root.join(person);
        let system_prompt = self.0.prompt_loader.build(
            person,
            Some(&TurnInfo {
                session_id: session_id.clone(),
                turn_count: turn,
            }),
        );

        let tools = build_tools(person_root);
        let tool_defs = to_definitions(&tools);

        let req = ChatRequest {
            model: self.0.default_model.clone(),
            system: system_prompt.to_plain_text(),
            system_prompt: Some(system_prompt),
            messages,
            max_tokens: DEFAULT_MAX_TOKENS,
            stream: true,
            tools: tool_defs,
            raw_messages: None,
        };

        let (tx, rx) = mpsc::channel(MIN_EVENT_CHANNEL_CAPACITY);
        let inner = self.0.clone();
        let person = person.to_string();

        tokio::spawn(async move {
            let _ = tx.send(UpstreamEvent::Start { backend_session_id: None }).await;

            let final_text = match crate::tools::tool_loop::run_tool_loop_streaming(
                &inner.provider,
                req,
                &tools,
                &tx,
            )
            .await
            {
                Ok(text) => text,
                Err(e) => {
                    warn!(person = %person, error = %e, "direct_key tool loop failed");
                    let _ = tx
                        .send(UpstreamEvent::Error {
                            message: e.to_string(),
                        })
                        .await;
                    let _ = tx.send(UpstreamEvent::Done).await;
                    return;
                }
            };

            if let Some(mut history) = inner.histories.get_mut(&key) {
                // Best-effort backend-side transcript entry; the orchestrator
                // persists the authoritative canonical-event timeline.
                history.push(Message {
                    role: Role::Assistant,
                    content: final_text,
                });
            }

            info!(person = %person, session_id = %session_id, "direct_key run complete");
            let _ = tx.send(UpstreamEvent::Done).await;
        });

        Ok(rx)
    }

    async fn clear_session(&self, person: &str, session_id: &str) -> Result<(), RuntimeError> {
        let key: SessionKey = (person.to_string(), session_id.to_string());
        self.0.histories.remove(&key);
        self.0.turn_counts.remove(&key);
        Ok(())
    }

    async fn get_history(
        &self,
        person: &str,
        session_id: &str,
    ) -> Result<Vec<ChatMessage>, RuntimeError> {
        let key: SessionKey = (person.to_string(), session_id.to_string());
        Ok(self
            .0
            .histories
            .get(&key)
            .map(|h| h.clone())
            .unwrap_or_default())
    }
}
