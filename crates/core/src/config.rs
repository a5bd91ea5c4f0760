use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

/// Default per-run deadline (§5): 2 minutes.
pub const DEFAULT_MAX_RUN_DURATION_SECS: u64 = 120;
/// Default cap on `tool_call` events per run before the orchestrator aborts it.
pub const DEFAULT_MAX_TOOL_CALLS_PER_RUN: u32 = 50;
/// Default cap on an action's expanded prompt size (§4.9).
pub const DEFAULT_MAX_PROMPT_BYTES: usize = 64 * 1024;
/// Minimum bounded-channel capacity for a run's output stream (§5).
pub const MIN_EVENT_CHANNEL_CAPACITY: usize = 100;

/// Top-level orchestration-core config (`agent.toml` + `NOTES_AGENT_*` env overrides).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CoreConfig {
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub vault: VaultConfig,
    #[serde(default)]
    pub fallback: FallbackConfig,
    #[serde(default)]
    pub runtime: RuntimeBackendConfig,
    #[serde(default)]
    pub gateway: GatewayServerConfig,
}

/// Which backend credentials/endpoints the two `Runtime` implementations use.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RuntimeBackendConfig {
    #[serde(default)]
    pub default_mode: DefaultRuntimeMode,
    #[serde(default)]
    pub anthropic_api_key: String,
    #[serde(default = "default_anthropic_base_url")]
    pub anthropic_base_url: String,
    #[serde(default = "default_model")]
    pub default_model: String,
    #[serde(default)]
    pub gateway_base_url: String,
}

/// Mirrors `notes_sessions::RuntimeMode` without introducing a dependency
/// cycle — `notes-core` sits below `notes-sessions` in the workspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DefaultRuntimeMode {
    #[default]
    DirectKey,
    Gateway,
}

/// HTTP listener and auth settings for the `notes-gateway` binary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayServerConfig {
    #[serde(default = "default_gateway_port")]
    pub port: u16,
    #[serde(default = "default_gateway_bind")]
    pub bind: String,
    #[serde(default)]
    pub auth: GatewayAuthConfig,
}

impl Default for GatewayServerConfig {
    fn default() -> Self {
        Self {
            port: default_gateway_port(),
            bind: default_gateway_bind(),
            auth: GatewayAuthConfig::default(),
        }
    }
}

/// Same bearer-token idiom as the teacher's WS/HTTP gateway, minus the
/// auth modes this workspace has no use for (password, tailscale, etc.).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayAuthConfig {
    #[serde(default)]
    pub mode: GatewayAuthMode,
    #[serde(default)]
    pub token: Option<String>,
    /// The single `PersonId` an authenticated bearer token resolves to.
    /// This workspace does not attempt multi-user identity management
    /// (§1 Non-goals); one deployment serves one person.
    #[serde(default = "default_person_id")]
    pub person_id: String,
}

impl Default for GatewayAuthConfig {
    fn default() -> Self {
        Self {
            mode: GatewayAuthMode::None,
            token: None,
            person_id: default_person_id(),
        }
    }
}

fn default_person_id() -> String {
    "default".to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum GatewayAuthMode {
    Token,
    #[default]
    None,
}

fn default_gateway_port() -> u16 {
    8787
}
fn default_gateway_bind() -> String {
    "127.0.0.1".to_string()
}
fn default_anthropic_base_url() -> String {
    "https://api.anthropic.com".to_string()
}
fn default_model() -> String {
    "claude-sonnet-4-6".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    #[serde(default = "default_max_run_duration_secs")]
    pub max_run_duration_secs: u64,
    #[serde(default = "default_max_tool_calls_per_run")]
    pub max_tool_calls_per_run: u32,
    #[serde(default = "default_max_prompt_bytes")]
    pub max_prompt_bytes: usize,
    #[serde(default = "default_event_channel_capacity")]
    pub event_channel_capacity: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_run_duration_secs: default_max_run_duration_secs(),
            max_tool_calls_per_run: default_max_tool_calls_per_run(),
            max_prompt_bytes: default_max_prompt_bytes(),
            event_channel_capacity: default_event_channel_capacity(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultConfig {
    #[serde(default = "default_vault_root")]
    pub root: String,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            root: default_vault_root(),
        }
    }
}

/// Whether the gateway→direct-key fallback described in `spec.md` §4.6 is enabled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FallbackConfig {
    #[serde(default = "bool_true")]
    pub enabled: bool,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

fn bool_true() -> bool {
    true
}

fn default_max_run_duration_secs() -> u64 {
    DEFAULT_MAX_RUN_DURATION_SECS
}
fn default_max_tool_calls_per_run() -> u32 {
    DEFAULT_MAX_TOOL_CALLS_PER_RUN
}
fn default_max_prompt_bytes() -> usize {
    DEFAULT_MAX_PROMPT_BYTES
}
fn default_event_channel_capacity() -> usize {
    MIN_EVENT_CHANNEL_CAPACITY
}
fn default_vault_root() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.notes-editor/vault", home)
}

impl CoreConfig {
    /// Load config from a TOML file with `NOTES_AGENT_*` env var overrides.
    ///
    /// A missing file is not an error — every field has a default, mirroring
    /// the "missing config file ⇒ default mode" rule used throughout §6.3.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let config: CoreConfig = Figment::from(Serialized::defaults(CoreConfig::default()))
            .merge(Toml::file(&path))
            .merge(Env::prefixed("NOTES_AGENT_").split("_"))
            .extract()
            .map_err(|e| crate::error::CoreError::Config(e.to_string()))?;

        Ok(config)
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.notes-editor/agent.toml", home)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_constants() {
        let cfg = CoreConfig::default();
        assert_eq!(cfg.limits.max_run_duration_secs, 120);
        assert_eq!(cfg.limits.max_prompt_bytes, 64 * 1024);
        assert!(cfg.limits.event_channel_capacity >= MIN_EVENT_CHANNEL_CAPACITY);
    }

    #[test]
    fn load_missing_file_falls_back_to_defaults() {
        let cfg = CoreConfig::load(Some("/nonexistent/path/agent.toml")).expect("load");
        assert_eq!(
            cfg.limits.max_tool_calls_per_run,
            DEFAULT_MAX_TOOL_CALLS_PER_RUN
        );
        assert!(cfg.fallback.enabled);
    }

    #[test]
    fn load_overrides_from_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.toml");
        std::fs::write(
            &path,
            "[limits]\nmax_tool_calls_per_run = 7\n\n[fallback]\nenabled = false\n",
        )
        .unwrap();

        let cfg = CoreConfig::load(Some(path.to_str().unwrap())).expect("load");
        assert_eq!(cfg.limits.max_tool_calls_per_run, 7);
        assert!(!cfg.fallback.enabled);
    }
}
