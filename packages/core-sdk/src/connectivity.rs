use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::{
    llm::{Credentials, Dispatcher, TextRequest},
    models::{ConnectivityTestResult, ProviderConfig, ProviderId},
    telemetry,
};

pub const CANARY_PROMPT: &str =
    "Hello, this is a test message. Please respond with 'Connection successful'.";
pub const CANARY_MAX_TOKENS: u32 = 10;
/** \brief 自定义端点未选模型时，测试请求使用的占位模型名。 */
const CUSTOM_PLACEHOLDER_MODEL: &str = "model";

/**
 * \brief 待检测的 Provider/Key/模型/端点组合，`provider` 为原始标识。
 */
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionParams {
    pub provider: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub endpoint: Option<String>,
}

impl ConnectionParams {
    /**
     * \brief 由已保存配置的当前 Provider 生成检测参数。
     */
    pub fn from_config(config: &ProviderConfig) -> Self {
        let id = config.active_provider;
        let (model, endpoint) = if id == ProviderId::Custom {
            let model = if config.custom_model.is_empty() {
                config.model(id).to_string()
            } else {
                config.custom_model.clone()
            };
            (model, Some(config.custom_endpoint.clone()))
        } else {
            (config.model(id).to_string(), None)
        };
        Self {
            provider: id.as_str().to_string(),
            api_key: config.api_key(id).to_string(),
            model,
            endpoint,
        }
    }
}

/**
 * \brief 发送探测提示词以检查连通性与鉴权，错误一律转为失败结果。
 */
#[derive(Clone)]
pub struct ConnectivityTester {
    dispatcher: Arc<Dispatcher>,
}

impl ConnectivityTester {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self { dispatcher }
    }

    pub async fn test(&self, params: &ConnectionParams) -> ConnectivityTestResult {
        let provider = match self.dispatcher.resolve(&params.provider) {
            Ok(id) => id,
            Err(err) => return ConnectivityTestResult::failed(err.to_string()),
        };

        let mut credentials = Credentials::new(&params.api_key, &params.model);
        if provider == ProviderId::Custom {
            credentials.endpoint = params.endpoint.clone();
            if credentials.model.trim().is_empty() {
                credentials.model = CUSTOM_PLACEHOLDER_MODEL.to_string();
            }
        }
        let request = TextRequest {
            system: None,
            prompt: CANARY_PROMPT.to_string(),
            max_tokens: Some(CANARY_MAX_TOKENS),
        };

        match self
            .dispatcher
            .generate_text(provider, &credentials, &request)
            .await
        {
            Ok(_) => {
                telemetry::log_event(
                    "settings.test",
                    &format!("provider={} model={} ok", provider, params.model),
                );
                ConnectivityTestResult::ok(success_message(provider))
            }
            Err(err) => {
                telemetry::log_warn(
                    "settings.test",
                    &format!("provider={} model={} failed: {}", provider, params.model, err),
                );
                ConnectivityTestResult::failed(err.to_string())
            }
        }
    }
}

fn success_message(provider: ProviderId) -> String {
    match provider {
        ProviderId::Custom => "Successfully connected to custom API endpoint".to_string(),
        other => format!("Successfully connected to {} API", other.display_name()),
    }
}
