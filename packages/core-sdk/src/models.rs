use std::{collections::BTreeMap, fmt, str::FromStr};

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/**
 * \brief 已知 LLM Provider；`Custom` 指任意 OpenAI 兼容端点。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderId {
    OpenAi,
    Anthropic,
    Cohere,
    Mistral,
    Custom,
}

impl ProviderId {
    pub const ALL: [ProviderId; 5] = [
        ProviderId::OpenAi,
        ProviderId::Anthropic,
        ProviderId::Cohere,
        ProviderId::Mistral,
        ProviderId::Custom,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderId::OpenAi => "openai",
            ProviderId::Anthropic => "anthropic",
            ProviderId::Cohere => "cohere",
            ProviderId::Mistral => "mistral",
            ProviderId::Custom => "custom",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            ProviderId::OpenAi => "OpenAI",
            ProviderId::Anthropic => "Anthropic",
            ProviderId::Cohere => "Cohere",
            ProviderId::Mistral => "Mistral",
            ProviderId::Custom => "Custom",
        }
    }

    /** \brief 未保存设置时的默认模型。 */
    pub fn default_model(&self) -> &'static str {
        match self {
            ProviderId::OpenAi => "gpt-4o-mini",
            ProviderId::Anthropic => "claude-3-opus-20240229",
            ProviderId::Cohere => "command",
            ProviderId::Mistral => "mistral-large-latest",
            ProviderId::Custom => "",
        }
    }
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderId {
    type Err = UnknownProvider;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ProviderId::ALL
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| UnknownProvider(s.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownProvider(pub String);

impl fmt::Display for UnknownProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Provider {} not supported", self.0)
    }
}

impl std::error::Error for UnknownProvider {}

/**
 * \brief 单个设置作用域（用户会话）的 Provider 配置。
 * \details API Key 以明文保存。
 */
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ProviderConfig {
    pub active_provider: ProviderId,
    pub api_keys: BTreeMap<ProviderId, String>,
    pub selected_models: BTreeMap<ProviderId, String>,
    pub custom_endpoint: String,
    pub custom_model: String,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            active_provider: ProviderId::OpenAi,
            api_keys: default_api_keys(),
            selected_models: default_models(),
            custom_endpoint: String::new(),
            custom_model: String::new(),
        }
    }
}

impl ProviderConfig {
    /**
     * \brief 为每个已知 Provider 补齐 Key 与模型槽位。
     */
    pub fn normalize(&mut self) {
        for id in ProviderId::ALL {
            self.api_keys.entry(id).or_default();
            self.selected_models
                .entry(id)
                .or_insert_with(|| id.default_model().to_string());
        }
    }

    pub fn api_key(&self, id: ProviderId) -> &str {
        self.api_keys.get(&id).map(String::as_str).unwrap_or("")
    }

    pub fn model(&self, id: ProviderId) -> &str {
        self.selected_models
            .get(&id)
            .map(String::as_str)
            .unwrap_or_else(|| id.default_model())
    }

    /**
     * \brief 保存前由调用方执行的校验。
     */
    pub fn validate_for_save(&self) -> Result<(), String> {
        if self.active_provider == ProviderId::Custom && self.custom_endpoint.trim().is_empty() {
            return Err("Custom provider requires an endpoint URL".to_string());
        }
        Ok(())
    }
}

pub fn default_api_keys() -> BTreeMap<ProviderId, String> {
    ProviderId::ALL
        .into_iter()
        .map(|id| (id, String::new()))
        .collect()
}

pub fn default_models() -> BTreeMap<ProviderId, String> {
    ProviderId::ALL
        .into_iter()
        .map(|id| (id, id.default_model().to_string()))
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectivityTestResult {
    pub success: bool,
    pub message: String,
}

impl ConnectivityTestResult {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}

/**
 * \brief 自然语言查询的结构化结果。
 */
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SqlResponse {
    pub sql_query: String,
    pub explanation: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ColumnInfo {
    pub name: String,
    #[serde(rename = "type")]
    pub data_type: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_primary: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_foreign: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub references: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct TableInfo {
    pub name: String,
    pub description: String,
    pub columns: Vec<ColumnInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Relationship {
    pub from: String,
    pub to: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub description: String,
}

/**
 * \brief 模型生成的 schema 说明。
 */
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct SchemaAnalysis {
    pub tables: Vec<TableInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relationships: Option<Vec<Relationship>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct QuerySuggestions {
    pub queries: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatReply {
    pub text: String,
}
