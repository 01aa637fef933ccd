pub mod chat;
pub mod config;
pub mod db;
pub mod error;
pub mod llm;
pub mod models;
pub mod server;
pub mod settings;
pub mod sse;
pub mod telemetry;

/**
 * \brief SDK 预导入集合，方便外部引用常用模块。
 */
pub mod prelude {
    pub use crate::chat::{ChatClient, ChatStore, TurnOutcome};
    pub use crate::config::RelayConfig;
    pub use crate::db::Storage;
    pub use crate::error::RelayError;
    pub use crate::llm::{AbortHandle, RelaySession, StreamEvent, UpstreamClient};
    pub use crate::models::{ChatMessage, ChatSession, ModelConfig, Role};
    pub use crate::settings::{ConfigStore, ModelConfigPatch};
    pub use crate::{server, telemetry};
}
