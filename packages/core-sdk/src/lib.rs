pub mod chat;
pub mod config;
pub mod connectivity;
pub mod db;
pub mod executor;
pub mod generation;
pub mod history;
pub mod llm;
pub mod models;
pub mod server;
pub mod settings;
pub mod telemetry;

/**
 * \brief SDK 预导入集合，方便外部引用常用类型。
 */
pub mod prelude {
    pub use crate::chat::ChatService;
    pub use crate::config::AppConfig;
    pub use crate::connectivity::{ConnectionParams, ConnectivityTester};
    pub use crate::executor::{PgExecutor, QueryExecutor};
    pub use crate::generation::QueryGenerationService;
    pub use crate::history::{FileStorage, QueryHistory, QueryHistoryItem};
    pub use crate::llm::Dispatcher;
    pub use crate::models::{ProviderConfig, ProviderId, SqlResponse};
    pub use crate::settings::SettingsStore;
    pub use crate::telemetry;
}
