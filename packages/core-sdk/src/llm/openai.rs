use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use serde_json::{json, Value};

use super::{
    parse_json_payload, read_json, structured_system_prompt, LanguageModel, LlmError,
    ObjectRequest, TextRequest,
};

/**
 * \brief OpenAI chat-completions 协议客户端。
 * \details 供 OpenAI、Mistral 与自定义端点使用；`base_url` 已包含版本段（如 `https://api.openai.com/v1`）。
 */
pub struct OpenAiCompatible {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    label: &'static str,
}

impl OpenAiCompatible {
    pub fn new(
        client: reqwest::Client,
        base_url: &str,
        api_key: &str,
        model: &str,
        label: &'static str,
    ) -> Self {
        Self {
            client,
            base_url: base_url.trim().trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
            label,
        }
    }

    fn url(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    async fn complete(&self, body: &Value) -> Result<String, LlmError> {
        let mut req = self
            .client
            .post(self.url())
            .header(CONTENT_TYPE, "application/json")
            .json(body);
        if !self.api_key.is_empty() {
            req = req.header(AUTHORIZATION, format!("Bearer {}", self.api_key));
        }
        let v = read_json(self.label, req.send().await?).await?;
        extract_content(&v)
    }
}

#[async_trait]
impl LanguageModel for OpenAiCompatible {
    async fn generate_text(&self, request: &TextRequest) -> Result<String, LlmError> {
        let body = chat_body(
            &self.model,
            request.system.as_deref(),
            &request.prompt,
            request.max_tokens,
            false,
        );
        self.complete(&body).await
    }

    async fn generate_object(&self, request: &ObjectRequest) -> Result<Value, LlmError> {
        let system = structured_system_prompt(request);
        let body = chat_body(&self.model, Some(&system), &request.prompt, None, true);
        let text = self.complete(&body).await?;
        parse_json_payload(&text)
    }
}

pub(crate) fn chat_body(
    model: &str,
    system: Option<&str>,
    prompt: &str,
    max_tokens: Option<u32>,
    json_mode: bool,
) -> Value {
    let mut messages = Vec::new();
    if let Some(sys) = system {
        messages.push(json!({"role": "system", "content": sys}));
    }
    messages.push(json!({"role": "user", "content": prompt}));

    let mut body = json!({
        "model": model,
        "messages": messages,
        "stream": false,
    });
    if let Some(max) = max_tokens {
        body["max_tokens"] = json!(max);
    }
    if json_mode {
        body["response_format"] = json!({"type": "json_object"});
    }
    body
}

fn extract_content(v: &Value) -> Result<String, LlmError> {
    v.get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_str())
        .filter(|text| !text.is_empty())
        .map(str::to_string)
        .ok_or_else(|| LlmError::Provider("empty completion".to_string()))
}
