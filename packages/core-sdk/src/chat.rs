use std::sync::Arc;

use anyhow::{anyhow, Result};

use crate::{
    config::AppConfig,
    llm::{Credentials, Dispatcher, TextRequest},
    models::{ChatReply, ProviderConfig, ProviderId},
    telemetry,
};

pub const BI_ASSISTANT_PROMPT: &str = "You are a business intelligence assistant that helps users analyze data and generate insights.
You have access to a SQL database that contains tables for customers, products, orders, and sales.
When asked about data, you should generate SQL queries to answer the question and explain your reasoning.
Keep your responses concise and focused on providing actionable business insights.";

/**
 * \brief 基于任意已配置 Provider 的 BI 助手对话。
 * \details 无状态，仅发送最新一条用户消息。无法识别的 Provider 回退到使用服务端 Key 的
 * OpenAI（连通性检测则直接报告不支持）。
 */
#[derive(Clone)]
pub struct ChatService {
    dispatcher: Arc<Dispatcher>,
    env_api_key: Option<String>,
    fallback_model: String,
}

impl ChatService {
    pub fn new(dispatcher: Arc<Dispatcher>, config: &AppConfig) -> Self {
        Self {
            dispatcher,
            env_api_key: config.openai_api_key.clone(),
            fallback_model: config.fallback_model.clone(),
        }
    }

    pub async fn respond(
        &self,
        settings: &ProviderConfig,
        message: &str,
        provider: &str,
        model: &str,
    ) -> Result<ChatReply> {
        self.try_respond(settings, message, provider, model)
            .await
            .map_err(|e| {
                telemetry::log_error("chat", &format!("provider={} {:#}", provider, e));
                anyhow!("Failed to generate chat response: {}", e)
            })
    }

    async fn try_respond(
        &self,
        settings: &ProviderConfig,
        message: &str,
        provider: &str,
        model: &str,
    ) -> Result<ChatReply> {
        let (id, credentials) = self.resolve_credentials(settings, provider, model)?;
        let request = TextRequest {
            system: Some(BI_ASSISTANT_PROMPT.to_string()),
            prompt: message.to_string(),
            max_tokens: None,
        };
        let text = self
            .dispatcher
            .generate_text(id, &credentials, &request)
            .await?;
        telemetry::log_event(
            "chat",
            &format!(
                "provider={} model={} prompt_len={}",
                id,
                credentials.model,
                message.len()
            ),
        );
        Ok(ChatReply { text })
    }

    fn resolve_credentials(
        &self,
        settings: &ProviderConfig,
        provider: &str,
        model: &str,
    ) -> Result<(ProviderId, Credentials)> {
        let id = match self.dispatcher.resolve(provider) {
            Ok(id) => id,
            Err(_) => {
                telemetry::log_warn(
                    "chat",
                    &format!("Provider {} not recognized, falling back to OpenAI", provider),
                );
                let key = self
                    .env_api_key
                    .clone()
                    .ok_or_else(|| anyhow!("No API key found for OpenAI fallback"))?;
                return Ok((
                    ProviderId::OpenAi,
                    Credentials::new(key, &self.fallback_model),
                ));
            }
        };

        let saved_key = settings.api_key(id);
        let credentials = match id {
            ProviderId::OpenAi => {
                let key = if saved_key.is_empty() {
                    self.env_api_key.clone().unwrap_or_default()
                } else {
                    saved_key.to_string()
                };
                if key.is_empty() {
                    return Err(anyhow!("No API key found for OpenAI"));
                }
                Credentials::new(key, model)
            }
            ProviderId::Custom => {
                if saved_key.is_empty() || settings.custom_endpoint.trim().is_empty() {
                    return Err(anyhow!("Missing API key or endpoint for custom provider"));
                }
                let custom_model = if settings.custom_model.is_empty() {
                    model
                } else {
                    settings.custom_model.as_str()
                };
                Credentials::new(saved_key, custom_model).with_endpoint(&settings.custom_endpoint)
            }
            other => {
                if saved_key.is_empty() {
                    return Err(anyhow!("No API key found for {}", other.display_name()));
                }
                Credentials::new(saved_key, model)
            }
        };
        Ok((id, credentials))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use serde_json::json;

    use super::*;
    use crate::llm::{testing::scripted_dispatcher, LlmError};

    fn chat(
        text: std::result::Result<String, LlmError>,
        env_key: Option<&str>,
    ) -> (ChatService, Arc<Mutex<Vec<String>>>) {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let dispatcher = scripted_dispatcher(text, Ok(json!({})), calls.clone());
        let config = AppConfig {
            openai_api_key: env_key.map(str::to_string),
            ..AppConfig::default()
        };
        (ChatService::new(Arc::new(dispatcher), &config), calls)
    }

    #[tokio::test]
    async fn test_unknown_provider_falls_back_to_openai() {
        let (svc, calls) = chat(Ok("Revenue is up.".into()), Some("sk-env"));
        let reply = svc
            .respond(&ProviderConfig::default(), "how are sales?", "made-up-id", "whatever")
            .await
            .expect("fallback reply");
        assert_eq!(reply.text, "Revenue is up.");
        assert_eq!(*calls.lock().unwrap(), vec!["openai:sk-env:gpt-4o".to_string()]);
    }

    #[tokio::test]
    async fn test_fallback_without_env_key_fails() {
        let (svc, _) = chat(Ok("unused".into()), None);
        let err = svc
            .respond(&ProviderConfig::default(), "hi", "made-up-id", "m")
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Failed to generate chat response: No API key found for OpenAI fallback"
        );
    }

    #[tokio::test]
    async fn test_openai_prefers_saved_key_over_env() {
        let (svc, calls) = chat(Ok("ok".into()), Some("sk-env"));
        let mut settings = ProviderConfig::default();
        settings
            .api_keys
            .insert(ProviderId::OpenAi, "sk-saved".into());
        svc.respond(&settings, "hi", "openai", "gpt-4o-mini")
            .await
            .expect("reply");
        svc.respond(&ProviderConfig::default(), "hi", "openai", "gpt-4o-mini")
            .await
            .expect("reply with env key");
        assert_eq!(
            *calls.lock().unwrap(),
            vec![
                "openai:sk-saved:gpt-4o-mini".to_string(),
                "openai:sk-env:gpt-4o-mini".to_string()
            ]
        );
    }

    #[tokio::test]
    async fn test_vendor_without_saved_key_fails() {
        let (svc, calls) = chat(Ok("ok".into()), Some("sk-env"));
        let err = svc
            .respond(&ProviderConfig::default(), "hi", "anthropic", "claude-3-opus-20240229")
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Failed to generate chat response: No API key found for Anthropic"
        );
        assert!(calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_custom_uses_saved_endpoint_and_model() {
        let (svc, calls) = chat(Ok("ok".into()), None);
        let mut settings = ProviderConfig::default();
        settings.api_keys.insert(ProviderId::Custom, "local".into());
        let err = svc
            .respond(&settings, "hi", "custom", "fallback-model")
            .await
            .unwrap_err();
        assert!(err
            .to_string()
            .ends_with("Missing API key or endpoint for custom provider"));

        settings.custom_endpoint = "http://localhost:8000/v1".into();
        svc.respond(&settings, "hi", "custom", "fallback-model")
            .await
            .expect("custom reply");
        settings.custom_model = "llama3".into();
        svc.respond(&settings, "hi", "custom", "fallback-model")
            .await
            .expect("custom reply");
        assert_eq!(
            *calls.lock().unwrap(),
            vec![
                "custom:local:fallback-model".to_string(),
                "custom:local:llama3".to_string()
            ]
        );
    }

    #[tokio::test]
    async fn test_provider_error_is_wrapped() {
        let (svc, _) = chat(
            Err(LlmError::Provider("mistral request failed: 429 -> slow down".into())),
            None,
        );
        let mut settings = ProviderConfig::default();
        settings.api_keys.insert(ProviderId::Mistral, "mk".into());
        let err = svc
            .respond(&settings, "hi", "mistral", "mistral-large-latest")
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Failed to generate chat response: mistral request failed: 429 -> slow down"
        );
    }
}
