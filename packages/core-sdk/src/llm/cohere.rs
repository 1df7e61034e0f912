use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use serde_json::{json, Value};

use super::{
    parse_json_payload, read_json, structured_system_prompt, LanguageModel, LlmError,
    ObjectRequest, TextRequest,
};

/**
 * \brief Cohere v2 chat 客户端。
 */
pub struct Cohere {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl Cohere {
    pub fn new(client: reqwest::Client, base_url: &str, api_key: &str, model: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
        }
    }

    async fn complete(&self, body: &Value) -> Result<String, LlmError> {
        let resp = self
            .client
            .post(format!("{}/v2/chat", self.base_url))
            .header(CONTENT_TYPE, "application/json")
            .header(AUTHORIZATION, format!("Bearer {}", self.api_key))
            .json(body)
            .send()
            .await?;
        let v = read_json("cohere", resp).await?;
        extract_content(&v)
    }
}

#[async_trait]
impl LanguageModel for Cohere {
    async fn generate_text(&self, request: &TextRequest) -> Result<String, LlmError> {
        let body = chat_body(
            &self.model,
            request.system.as_deref(),
            &request.prompt,
            request.max_tokens,
            None,
        );
        self.complete(&body).await
    }

    async fn generate_object(&self, request: &ObjectRequest) -> Result<Value, LlmError> {
        let system = structured_system_prompt(request);
        let body = chat_body(
            &self.model,
            Some(&system),
            &request.prompt,
            None,
            Some(&request.schema),
        );
        let text = self.complete(&body).await?;
        parse_json_payload(&text)
    }
}

fn chat_body(
    model: &str,
    system: Option<&str>,
    prompt: &str,
    max_tokens: Option<u32>,
    schema: Option<&Value>,
) -> Value {
    let mut messages = Vec::new();
    if let Some(sys) = system {
        messages.push(json!({"role": "system", "content": sys}));
    }
    messages.push(json!({"role": "user", "content": prompt}));
    let mut body = json!({
        "model": model,
        "messages": messages,
    });
    if let Some(max) = max_tokens {
        body["max_tokens"] = json!(max);
    }
    if let Some(schema) = schema {
        body["response_format"] = json!({"type": "json_object", "json_schema": schema});
    }
    body
}

fn extract_content(v: &Value) -> Result<String, LlmError> {
    v.get("message")
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|item| item.get("text").and_then(|t| t.as_str()))
                .collect::<Vec<_>>()
                .join("")
        })
        .filter(|text| !text.is_empty())
        .ok_or_else(|| LlmError::Provider("empty completion".to_string()))
}
