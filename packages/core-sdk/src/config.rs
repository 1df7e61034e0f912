use std::{path::PathBuf, time::Duration};

/**
 * \brief 进程级配置，从环境变量读取。
 */
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppConfig {
    /** \brief `serve` 的监听地址。 */
    pub addr: String,
    pub ui_dir: PathBuf,
    pub ui_fallback: PathBuf,
    /** \brief 保存设置槽位的 SQLite 文件。 */
    pub db_path: PathBuf,
    /** \brief CLI 使用的本地历史文件。 */
    pub history_path: PathBuf,
    /** \brief 服务端 Key，用于查询生成与聊天回退。 */
    pub openai_api_key: Option<String>,
    pub generation_model: String,
    pub fallback_model: String,
    /** \brief 执行查询使用的 Postgres 连接串。 */
    pub database_url: Option<String>,
    pub request_timeout: Duration,
    pub telemetry_enabled: bool,
    pub log_dir: PathBuf,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:5173".to_string(),
            ui_dir: PathBuf::from("packages/ui/dist"),
            ui_fallback: PathBuf::from("web"),
            db_path: PathBuf::from("sqlquill.db"),
            history_path: PathBuf::from("sqlquill-history.json"),
            openai_api_key: None,
            generation_model: "gpt-4o-mini".to_string(),
            fallback_model: "gpt-4o".to_string(),
            database_url: None,
            request_timeout: Duration::from_secs(60),
            telemetry_enabled: false,
            log_dir: PathBuf::from("logs"),
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /**
     * \brief 从任意变量来源构建，空值视为未设置。
     */
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let defaults = Self::default();
        Self {
            addr: get("SQLQUILL_ADDR").unwrap_or(defaults.addr),
            ui_dir: get("SQLQUILL_UI_DIR").map(PathBuf::from).unwrap_or(defaults.ui_dir),
            ui_fallback: get("SQLQUILL_UI_FALLBACK")
                .map(PathBuf::from)
                .unwrap_or(defaults.ui_fallback),
            db_path: get("SQLQUILL_DB").map(PathBuf::from).unwrap_or(defaults.db_path),
            history_path: get("SQLQUILL_HISTORY")
                .map(PathBuf::from)
                .unwrap_or(defaults.history_path),
            openai_api_key: get("OPENAI_API_KEY"),
            generation_model: get("SQLQUILL_GENERATION_MODEL")
                .unwrap_or(defaults.generation_model),
            fallback_model: get("SQLQUILL_FALLBACK_MODEL").unwrap_or(defaults.fallback_model),
            database_url: get("DATABASE_URL").or_else(|| get("POSTGRES_URL")),
            request_timeout: get("SQLQUILL_REQUEST_TIMEOUT_SECS")
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.request_timeout),
            telemetry_enabled: get("SQLQUILL_TELEMETRY")
                .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "on"))
                .unwrap_or(defaults.telemetry_enabled),
            log_dir: get("SQLQUILL_LOG_DIR").map(PathBuf::from).unwrap_or(defaults.log_dir),
        }
    }
}
