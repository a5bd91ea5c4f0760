pub mod error;
pub mod registry;
pub mod store;
pub mod types;

pub use error::SessionError;
pub use registry::SessionRegistry;
pub use store::ConversationStore;
pub use types::{derive_preview, derive_session_name, RuntimeMode, SessionRecord, SessionSummary};
