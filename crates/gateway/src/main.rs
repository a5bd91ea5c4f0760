use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;

use notes_core::config::{CoreConfig, DefaultRuntimeMode};
use notes_orchestrator::Orchestrator;
use notes_runtime::{DirectKeyRuntime, GatewayRuntime, Runtime};
use notes_sessions::RuntimeMode;

mod app;
mod http;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "notes_gateway=info,tower_http=debug".into()),
        )
        .init();

    // load config: explicit path > NOTES_AGENT_CONFIG env > ~/.notes-editor/agent.toml
    let config_path = std::env::var("NOTES_AGENT_CONFIG").ok();
    let config = CoreConfig::load(config_path.as_deref()).unwrap_or_else(|e| {
        tracing::warn!("Config load failed ({}), using defaults", e);
        CoreConfig::default()
    });

    let bind = config.gateway.bind.clone();
    let port = config.gateway.port;

    let vault_root = std::path::PathBuf::from(&config.vault.root);

    let direct_key: Arc<dyn Runtime> = Arc::new(DirectKeyRuntime::new(
        config.runtime.anthropic_api_key.clone(),
        Some(config.runtime.anthropic_base_url.clone()),
        vault_root.clone(),
        config.runtime.default_model.clone(),
    ));
    let gateway: Arc<dyn Runtime> = Arc::new(GatewayRuntime::new(
        config.runtime.gateway_base_url.clone(),
        vault_root.clone(),
    ));

    let default_mode = match config.runtime.default_mode {
        DefaultRuntimeMode::DirectKey => RuntimeMode::DirectKey,
        DefaultRuntimeMode::Gateway => RuntimeMode::Gateway,
    };

    let orchestrator = Orchestrator::new(
        direct_key,
        gateway,
        vault_root,
        default_mode,
        config.limits.clone(),
        config.fallback.enabled,
    );

    let state = Arc::new(app::AppState::new(config, orchestrator));
    let router = app::build_router(state.clone());

    let addr: SocketAddr = format!("{}:{}", bind, port).parse()?;
    info!("notes-gateway listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router).await?;

    Ok(())
}
