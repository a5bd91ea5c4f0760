pub mod anthropic;
pub mod anthropic_stream;
pub mod direct_key;
pub mod gateway;
pub mod prompt;
pub mod provider;
pub mod runtime;
pub mod session_map;
pub mod stream;
pub mod tools;

pub use direct_key::DirectKeyRuntime;
pub use gateway::GatewayRuntime;
pub use runtime::{ChatMessage, ChatStreamRequest, RecoveredSession, Runtime, RuntimeError, UpstreamEvent};
pub use session_map::RuntimeSessionMap;
