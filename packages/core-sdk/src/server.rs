use std::sync::Arc;

use anyhow::Result;
use axum::{
    extract::State,
    http::{
        header::{COOKIE, SET_COOKIE},
        HeaderMap, HeaderValue, StatusCode,
    },
    routing::{get, get_service, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use tower_http::services::ServeDir;
use uuid::Uuid;

use crate::{
    chat::ChatService,
    config::AppConfig,
    connectivity::{ConnectionParams, ConnectivityTester},
    db::SqliteSecretStore,
    executor::{PgExecutor, QueryExecutor},
    generation::QueryGenerationService,
    llm::Dispatcher,
    models::{
        ChatReply, ConnectivityTestResult, ProviderConfig, QuerySuggestions, SchemaAnalysis,
        SqlResponse,
    },
    settings::{SecretStore, SettingsStore},
    telemetry,
};

pub const SESSION_COOKIE: &str = "sqlquill_session";

type ApiError = (StatusCode, String);

/**
 * \brief 各请求处理器共享的服务。
 */
#[derive(Clone)]
pub struct AppState {
    pub settings: SettingsStore,
    pub tester: ConnectivityTester,
    pub generator: QueryGenerationService,
    pub chat: ChatService,
    pub executor: Option<Arc<dyn QueryExecutor>>,
}

impl AppState {
    pub fn new(
        config: &AppConfig,
        dispatcher: Arc<Dispatcher>,
        store: Arc<dyn SecretStore>,
        executor: Option<Arc<dyn QueryExecutor>>,
    ) -> Self {
        Self {
            settings: SettingsStore::new(store),
            tester: ConnectivityTester::new(dispatcher.clone()),
            generator: QueryGenerationService::new(dispatcher.clone(), config),
            chat: ChatService::new(dispatcher, config),
            executor,
        }
    }

    /**
     * \brief 按 `config` 组装生产环境服务。
     */
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        let dispatcher = Arc::new(Dispatcher::new(config.request_timeout)?);
        let store: Arc<dyn SecretStore> = Arc::new(SqliteSecretStore::open(&config.db_path)?);
        let executor = match config.database_url.as_deref() {
            Some(url) => Some(Arc::new(PgExecutor::connect_lazy(url)?) as Arc<dyn QueryExecutor>),
            None => None,
        };
        Ok(Self::new(config, dispatcher, store, executor))
    }
}

/**
 * \brief API 路由，静态前端作为兜底。
 */
pub fn router(state: AppState, config: &AppConfig) -> Router {
    let static_handler = if config.ui_dir.exists() {
        ServeDir::new(&config.ui_dir)
    } else {
        ServeDir::new(&config.ui_fallback)
    }
    .append_index_html_on_directories(true);

    Router::new()
        .route("/api/settings", get(get_settings).post(save_settings))
        .route("/api/settings/test", post(test_settings))
        .route("/api/generate", post(generate_sql))
        .route("/api/schema/analyze", post(analyze_schema))
        .route("/api/schema/suggestions", post(suggest_queries))
        .route("/api/execute", post(execute_query))
        .route("/api/chat", post(chat))
        .route("/api/health", get(health_check))
        .with_state(state)
        .fallback_service(get_service(static_handler))
}

/**
 * \brief 启动 HTTP 服务。
 */
pub async fn run(config: AppConfig) -> Result<()> {
    let state = AppState::from_config(&config)?;
    let app = router(state, &config);
    let listener = tokio::net::TcpListener::bind(&config.addr).await?;
    println!("Server listening on http://{}", config.addr);
    telemetry::log_event("server", &format!("listening addr={}", config.addr));
    axum::serve(listener, app).await?;
    Ok(())
}

#[derive(Deserialize, Debug)]
struct GenerateRequest {
    prompt: String,
    #[serde(default)]
    schema: Option<String>,
}

#[derive(Deserialize, Debug)]
struct SchemaRequest {
    schema: String,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct ExecuteRequest {
    sql_query: String,
}

#[derive(Deserialize, Debug)]
struct ChatRequest {
    message: String,
    /** \brief 原始 Provider 标识，缺省为会话当前的 Provider。 */
    #[serde(default)]
    provider: Option<String>,
    #[serde(default)]
    model: Option<String>,
}

/**
 * \brief 当前会话的 Provider 设置（未保存时返回默认值）。
 */
async fn get_settings(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> (HeaderMap, Json<ProviderConfig>) {
    let (scope, cookie) = session_scope(&headers);
    (cookie, Json(state.settings.load_or_default(&scope)))
}

async fn save_settings(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(mut config): Json<ProviderConfig>,
) -> Result<(HeaderMap, Json<serde_json::Value>), ApiError> {
    let (scope, cookie) = session_scope(&headers);
    config.normalize();
    config
        .validate_for_save()
        .map_err(|msg| (StatusCode::BAD_REQUEST, msg))?;
    state.settings.save(&scope, &config).map_err(|e| {
        telemetry::log_error("server.settings", &format!("{:#}", e));
        internal_err("Failed to save API settings")
    })?;
    Ok((cookie, Json(json!({"success": true}))))
}

async fn test_settings(
    State(state): State<AppState>,
    Json(params): Json<ConnectionParams>,
) -> Json<ConnectivityTestResult> {
    Json(state.tester.test(&params).await)
}

async fn generate_sql(
    State(state): State<AppState>,
    Json(req): Json<GenerateRequest>,
) -> Result<Json<SqlResponse>, ApiError> {
    if req.prompt.trim().is_empty() {
        return Err((StatusCode::BAD_REQUEST, "Prompt must not be empty".to_string()));
    }
    state
        .generator
        .generate(&req.prompt, req.schema.as_deref())
        .await
        .map(Json)
        .map_err(internal_err)
}

async fn analyze_schema(
    State(state): State<AppState>,
    Json(req): Json<SchemaRequest>,
) -> Result<Json<SchemaAnalysis>, ApiError> {
    state
        .generator
        .analyze_schema(&req.schema)
        .await
        .map(Json)
        .map_err(internal_err)
}

async fn suggest_queries(
    State(state): State<AppState>,
    Json(req): Json<SchemaRequest>,
) -> Result<Json<QuerySuggestions>, ApiError> {
    state
        .generator
        .suggest_queries(&req.schema)
        .await
        .map(|queries| Json(QuerySuggestions { queries }))
        .map_err(internal_err)
}

async fn execute_query(
    State(state): State<AppState>,
    Json(req): Json<ExecuteRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let executor = state.executor.as_ref().ok_or_else(|| {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            "No database configured".to_string(),
        )
    })?;
    let rows = executor.execute(&req.sql_query).await.map_err(internal_err)?;
    Ok(Json(json!({ "rows": rows })))
}

async fn chat(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<ChatRequest>,
) -> Result<(HeaderMap, Json<ChatReply>), ApiError> {
    let (scope, cookie) = session_scope(&headers);
    let settings = state.settings.load_or_default(&scope);
    let provider = req
        .provider
        .unwrap_or_else(|| settings.active_provider.as_str().to_string());
    let model = req.model.unwrap_or_else(|| {
        provider
            .parse()
            .map(|id| settings.model(id).to_string())
            .unwrap_or_default()
    });
    let reply = state
        .chat
        .respond(&settings, &req.message, &provider, &model)
        .await
        .map_err(internal_err)?;
    Ok((cookie, Json(reply)))
}

async fn health_check(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "ok": true,
        "database": state.executor.is_some(),
    }))
}

/**
 * \brief 请求对应的设置作用域；新建会话时附带 `Set-Cookie` 头。
 */
fn session_scope(headers: &HeaderMap) -> (String, HeaderMap) {
    let mut out = HeaderMap::new();
    if let Some(id) = read_cookie(headers, SESSION_COOKIE) {
        return (id, out);
    }
    let id = Uuid::new_v4().to_string();
    let cookie = format!("{}={}; Path=/; HttpOnly; SameSite=Lax", SESSION_COOKIE, id);
    if let Ok(value) = HeaderValue::from_str(&cookie) {
        out.insert(SET_COOKIE, value);
    }
    (id, out)
}

fn read_cookie(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|raw| raw.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(k, _)| *k == name)
        .map(|(_, v)| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn internal_err<E: std::fmt::Display>(e: E) -> ApiError {
    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use serde_json::Value;

    use super::*;
    use crate::llm::testing::scripted_dispatcher;

    async fn spawn_app(calls: Arc<Mutex<Vec<String>>>) -> String {
        let config = AppConfig {
            openai_api_key: Some("sk-env".into()),
            ..AppConfig::default()
        };
        let dispatcher = scripted_dispatcher(
            Ok("Sales grew 12% last quarter.".into()),
            Ok(json!({"sqlQuery": "SELECT 1 LIMIT 1;", "explanation": "Returns one."})),
            calls,
        );
        let store: Arc<dyn SecretStore> =
            Arc::new(SqliteSecretStore::in_memory().expect("in-memory store"));
        let state = AppState::new(&config, Arc::new(dispatcher), store, None);
        let app = router(state, &config);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("serve");
        });
        format!("http://{}", addr)
    }

    fn session_cookie(resp: &reqwest::Response) -> String {
        resp.headers()
            .get(SET_COOKIE)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(';').next())
            .expect("session cookie")
            .to_string()
    }

    #[test]
    fn test_read_cookie() {
        let mut headers = HeaderMap::new();
        headers.insert(
            COOKIE,
            HeaderValue::from_static("theme=dark; sqlquill_session=abc-123"),
        );
        assert_eq!(read_cookie(&headers, SESSION_COOKIE).as_deref(), Some("abc-123"));
        assert_eq!(read_cookie(&headers, "missing"), None);
        let (scope, set) = session_scope(&headers);
        assert_eq!(scope, "abc-123");
        assert!(set.get(SET_COOKIE).is_none());
        let (fresh, set) = session_scope(&HeaderMap::new());
        assert!(!fresh.is_empty());
        assert!(set.get(SET_COOKIE).is_some());
    }

    #[tokio::test]
    async fn test_settings_round_trip_per_session() {
        let base = spawn_app(Arc::new(Mutex::new(Vec::new()))).await;
        let client = reqwest::Client::new();

        let resp = client
            .get(format!("{}/api/settings", base))
            .send()
            .await
            .expect("get settings");
        let cookie = session_cookie(&resp);
        let defaults: ProviderConfig = resp.json().await.expect("json");
        assert_eq!(defaults, ProviderConfig::default());

        let mut config = ProviderConfig::default();
        config.active_provider = crate::models::ProviderId::Cohere;
        config
            .api_keys
            .insert(crate::models::ProviderId::Cohere, "co-key".into());
        let resp = client
            .post(format!("{}/api/settings", base))
            .header(COOKIE, &cookie)
            .json(&config)
            .send()
            .await
            .expect("save settings");
        assert_eq!(resp.status(), StatusCode::OK);

        let loaded: ProviderConfig = client
            .get(format!("{}/api/settings", base))
            .header(COOKIE, &cookie)
            .send()
            .await
            .expect("get again")
            .json()
            .await
            .expect("json");
        assert_eq!(loaded, config);

        let other: ProviderConfig = client
            .get(format!("{}/api/settings", base))
            .send()
            .await
            .expect("other session")
            .json()
            .await
            .expect("json");
        assert_eq!(other, ProviderConfig::default());
    }

    #[tokio::test]
    async fn test_custom_without_endpoint_is_rejected_before_save() {
        let base = spawn_app(Arc::new(Mutex::new(Vec::new()))).await;
        let resp = reqwest::Client::new()
            .post(format!("{}/api/settings", base))
            .json(&json!({"activeProvider": "custom", "customEndpoint": ""}))
            .send()
            .await
            .expect("post");
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_unknown_provider_asymmetry_over_http() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let base = spawn_app(calls.clone()).await;
        let client = reqwest::Client::new();

        let tested: ConnectivityTestResult = client
            .post(format!("{}/api/settings/test", base))
            .json(&json!({"provider": "made-up-id", "apiKey": "k", "model": "m"}))
            .send()
            .await
            .expect("test")
            .json()
            .await
            .expect("json");
        assert_eq!(
            tested,
            ConnectivityTestResult::failed("Provider made-up-id not supported")
        );

        let reply: ChatReply = client
            .post(format!("{}/api/chat", base))
            .json(&json!({"message": "how are sales?", "provider": "made-up-id"}))
            .send()
            .await
            .expect("chat")
            .json()
            .await
            .expect("json");
        assert_eq!(reply.text, "Sales grew 12% last quarter.");
        assert_eq!(*calls.lock().unwrap(), vec!["openai:sk-env:gpt-4o".to_string()]);
    }

    #[tokio::test]
    async fn test_generate_and_execute_without_database() {
        let base = spawn_app(Arc::new(Mutex::new(Vec::new()))).await;
        let client = reqwest::Client::new();

        let generated: SqlResponse = client
            .post(format!("{}/api/generate", base))
            .json(&json!({"prompt": "one row please"}))
            .send()
            .await
            .expect("generate")
            .json()
            .await
            .expect("json");
        assert_eq!(generated.sql_query, "SELECT 1 LIMIT 1;");

        let resp = client
            .post(format!("{}/api/execute", base))
            .json(&json!({"sqlQuery": generated.sql_query}))
            .send()
            .await
            .expect("execute");
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);

        let health: Value = client
            .get(format!("{}/api/health", base))
            .send()
            .await
            .expect("health")
            .json()
            .await
            .expect("json");
        assert_eq!(health["database"], false);
    }
}
