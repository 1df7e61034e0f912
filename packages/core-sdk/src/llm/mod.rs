//! Provider dispatch: one `LanguageModel` per vendor, built on demand from a
//! registry keyed by `ProviderId`.

use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::{models::ProviderId, telemetry};

pub mod anthropic;
pub mod cohere;
pub mod openai;

pub const OPENAI_BASE: &str = "https://api.openai.com/v1";
pub const MISTRAL_BASE: &str = "https://api.mistral.ai/v1";
pub const ANTHROPIC_BASE: &str = "https://api.anthropic.com";
pub const COHERE_BASE: &str = "https://api.cohere.com";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LlmError {
    /// Detected before any network call.
    #[error("{0}")]
    Config(String),
    #[error("Provider {0} not supported")]
    UnsupportedProvider(String),
    #[error("{0}")]
    Provider(String),
    #[error("Malformed model output: {0}")]
    Parse(String),
}

impl From<reqwest::Error> for LlmError {
    fn from(e: reqwest::Error) -> Self {
        LlmError::Provider(e.to_string())
    }
}

/**
 * \brief 单次调用的 Key、模型以及（仅 custom）端点。
 */
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub api_key: String,
    pub model: String,
    pub endpoint: Option<String>,
}

impl Credentials {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            model: model.into(),
            endpoint: None,
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TextRequest {
    pub system: Option<String>,
    pub prompt: String,
    pub max_tokens: Option<u32>,
}

/**
 * \brief 结构化生成请求；回复需满足 `schema` 描述的 JSON 结构。
 */
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectRequest {
    pub system: Option<String>,
    pub prompt: String,
    pub schema_name: String,
    pub schema: Value,
}

/**
 * \brief 针对单个 Provider/模型的文本与结构化生成。
 */
#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn generate_text(&self, request: &TextRequest) -> Result<String, LlmError>;
    async fn generate_object(&self, request: &ObjectRequest) -> Result<Value, LlmError>;
}

pub type ModelFactory =
    Arc<dyn Fn(&Credentials) -> Result<Box<dyn LanguageModel>, LlmError> + Send + Sync>;

/**
 * \brief Provider 工厂注册表，工厂仅在对应 Provider 被调用时执行。
 */
#[derive(Clone)]
pub struct Dispatcher {
    registry: HashMap<ProviderId, ModelFactory>,
}

impl Dispatcher {
    /**
     * \brief 注册内置厂商，共享同一个 HTTP 客户端。
     */
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        let mut dispatcher = Self::empty();

        let c = client.clone();
        dispatcher.register(ProviderId::OpenAi, move |creds| {
            Ok(Box::new(openai::OpenAiCompatible::new(
                c.clone(),
                OPENAI_BASE,
                &creds.api_key,
                &creds.model,
                "openai",
            )))
        });
        let c = client.clone();
        dispatcher.register(ProviderId::Mistral, move |creds| {
            Ok(Box::new(openai::OpenAiCompatible::new(
                c.clone(),
                MISTRAL_BASE,
                &creds.api_key,
                &creds.model,
                "mistral",
            )))
        });
        let c = client.clone();
        dispatcher.register(ProviderId::Anthropic, move |creds| {
            Ok(Box::new(anthropic::Anthropic::new(
                c.clone(),
                ANTHROPIC_BASE,
                &creds.api_key,
                &creds.model,
            )))
        });
        let c = client.clone();
        dispatcher.register(ProviderId::Cohere, move |creds| {
            Ok(Box::new(cohere::Cohere::new(
                c.clone(),
                COHERE_BASE,
                &creds.api_key,
                &creds.model,
            )))
        });
        dispatcher.register(ProviderId::Custom, move |creds| {
            let endpoint = creds.endpoint.as_deref().unwrap_or_default();
            Ok(Box::new(openai::OpenAiCompatible::new(
                client.clone(),
                endpoint,
                &creds.api_key,
                &creds.model,
                "custom",
            )))
        });
        Ok(dispatcher)
    }

    pub fn empty() -> Self {
        Self {
            registry: HashMap::new(),
        }
    }

    /** \brief 新增或替换 `id` 的工厂。 */
    pub fn register<F>(&mut self, id: ProviderId, factory: F)
    where
        F: Fn(&Credentials) -> Result<Box<dyn LanguageModel>, LlmError> + Send + Sync + 'static,
    {
        self.registry.insert(id, Arc::new(factory));
    }

    /**
     * \brief 将原始 Provider 标识解析为已注册的 Provider。
     */
    pub fn resolve(&self, raw: &str) -> Result<ProviderId, LlmError> {
        raw.parse::<ProviderId>()
            .ok()
            .filter(|id| self.registry.contains_key(id))
            .ok_or_else(|| LlmError::UnsupportedProvider(raw.to_string()))
    }

    pub async fn generate_text(
        &self,
        provider: ProviderId,
        credentials: &Credentials,
        request: &TextRequest,
    ) -> Result<String, LlmError> {
        let model = self.model_for(provider, credentials)?;
        model.generate_text(request).await.map_err(|e| {
            telemetry::log_error(
                "llm.text",
                &format!("provider={} model={} {}", provider, credentials.model, e),
            );
            e
        })
    }

    pub async fn generate_object(
        &self,
        provider: ProviderId,
        credentials: &Credentials,
        request: &ObjectRequest,
    ) -> Result<Value, LlmError> {
        let model = self.model_for(provider, credentials)?;
        model.generate_object(request).await.map_err(|e| {
            telemetry::log_error(
                "llm.object",
                &format!(
                    "provider={} model={} schema={} {}",
                    provider, credentials.model, request.schema_name, e
                ),
            );
            e
        })
    }

    /**
     * \brief 以 `T` 的 JSON schema 约束输出的结构化生成。
     */
    pub async fn generate_typed<T>(
        &self,
        provider: ProviderId,
        credentials: &Credentials,
        system: &str,
        prompt: &str,
    ) -> Result<T, LlmError>
    where
        T: DeserializeOwned + JsonSchema,
    {
        let schema_name = T::schema_name().into_owned();
        let schema = serde_json::to_value(schemars::schema_for!(T))
            .map_err(|e| LlmError::Parse(e.to_string()))?;
        let request = ObjectRequest {
            system: Some(system.to_string()),
            prompt: prompt.to_string(),
            schema_name: schema_name.clone(),
            schema,
        };
        let value = self.generate_object(provider, credentials, &request).await?;
        serde_json::from_value(value)
            .map_err(|e| LlmError::Parse(format!("reply does not match {}: {}", schema_name, e)))
    }

    fn model_for(
        &self,
        provider: ProviderId,
        credentials: &Credentials,
    ) -> Result<Box<dyn LanguageModel>, LlmError> {
        check_credentials(provider, credentials)?;
        let factory = self
            .registry
            .get(&provider)
            .ok_or_else(|| LlmError::UnsupportedProvider(provider.to_string()))?;
        factory(credentials)
    }
}

/**
 * \brief 构建客户端前必须通过的配置检查。
 */
pub fn check_credentials(provider: ProviderId, credentials: &Credentials) -> Result<(), LlmError> {
    if provider == ProviderId::Custom {
        let endpoint = credentials.endpoint.as_deref().unwrap_or("").trim();
        if endpoint.is_empty() {
            return Err(LlmError::Config(
                "No endpoint provided for custom provider".to_string(),
            ));
        }
    } else if credentials.api_key.trim().is_empty() {
        return Err(LlmError::Config(format!(
            "No API key found for {}",
            provider.display_name()
        )));
    }
    if credentials.model.trim().is_empty() {
        return Err(LlmError::Config(format!(
            "No model selected for {}",
            provider.display_name()
        )));
    }
    Ok(())
}

/**
 * \brief 追加了期望 JSON 结构的系统提示词。
 */
pub(crate) fn structured_system_prompt(request: &ObjectRequest) -> String {
    let schema = serde_json::to_string_pretty(&request.schema).unwrap_or_default();
    let instruction = format!(
        "Respond only with a single JSON object (no prose, no Markdown) that conforms to this JSON schema named {}:\n{}",
        request.schema_name, schema
    );
    match request.system.as_deref() {
        Some(sys) if !sys.trim().is_empty() => format!("{}\n\n{}", sys, instruction),
        _ => instruction,
    }
}

/**
 * \brief 将模型回复解析为 JSON，容忍代码块围栏与前后说明文字。
 */
pub(crate) fn parse_json_payload(text: &str) -> Result<Value, LlmError> {
    let trimmed = text.trim();
    let inner = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .map(|s| s.strip_suffix("```").unwrap_or(s))
        .unwrap_or(trimmed)
        .trim();
    if let Ok(v) = serde_json::from_str::<Value>(inner) {
        return Ok(v);
    }
    match (inner.find('{'), inner.rfind('}')) {
        (Some(start), Some(end)) if start < end => serde_json::from_str(&inner[start..=end])
            .map_err(|e| LlmError::Parse(e.to_string())),
        _ => Err(LlmError::Parse(format!(
            "no JSON object in reply: {}",
            truncate_for_log(inner)
        ))),
    }
}

pub(crate) async fn read_json(label: &str, resp: reqwest::Response) -> Result<Value, LlmError> {
    if !resp.status().is_success() {
        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        return Err(LlmError::Provider(format!(
            "{} request failed: {} -> {}",
            label, status, text
        )));
    }
    Ok(resp.json().await?)
}

fn truncate_for_log(text: &str) -> String {
    text.chars().take(200).collect()
}
