use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use serde_json::{json, Value};

use super::{
    parse_json_payload, read_json, structured_system_prompt, LanguageModel, LlmError,
    ObjectRequest, TextRequest,
};

const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 1024;

/**
 * \brief Anthropic Messages API 客户端。
 */
pub struct Anthropic {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl Anthropic {
    pub fn new(client: reqwest::Client, base_url: &str, api_key: &str, model: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
        }
    }

    async fn complete(
        &self,
        system: Option<&str>,
        prompt: &str,
        max_tokens: Option<u32>,
    ) -> Result<String, LlmError> {
        let url = format!("{}/v1/messages", self.base_url);
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            "x-api-key",
            HeaderValue::from_str(&self.api_key)
                .map_err(|_| LlmError::Config("API key contains invalid characters".into()))?,
        );
        headers.insert(
            "anthropic-version",
            HeaderValue::from_static(ANTHROPIC_VERSION),
        );

        let body = messages_body(&self.model, system, prompt, max_tokens);
        let resp = self
            .client
            .post(url)
            .headers(headers)
            .json(&body)
            .send()
            .await?;
        let v = read_json("anthropic", resp).await?;
        extract_content(&v)
    }
}

#[async_trait]
impl LanguageModel for Anthropic {
    async fn generate_text(&self, request: &TextRequest) -> Result<String, LlmError> {
        self.complete(
            request.system.as_deref(),
            &request.prompt,
            request.max_tokens,
        )
        .await
    }

    async fn generate_object(&self, request: &ObjectRequest) -> Result<Value, LlmError> {
        let system = structured_system_prompt(request);
        let text = self.complete(Some(&system), &request.prompt, None).await?;
        parse_json_payload(&text)
    }
}

fn messages_body(model: &str, system: Option<&str>, prompt: &str, max_tokens: Option<u32>) -> Value {
    let mut body = json!({
        "model": model,
        "max_tokens": max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
        "messages": [{
            "role": "user",
            "content": [{"type": "text", "text": prompt}]
        }],
    });
    if let Some(sys) = system {
        body["system"] = json!(sys);
    }
    body
}

fn extract_content(v: &Value) -> Result<String, LlmError> {
    v.get("content")
        .and_then(|arr| arr.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|item| item.get("text").and_then(|t| t.as_str()))
                .collect::<Vec<_>>()
                .join("")
        })
        .filter(|text| !text.is_empty())
        .ok_or_else(|| LlmError::Provider("empty completion".to_string()))
}
