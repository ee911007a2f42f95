use std::time::Duration;

use async_trait::async_trait;

use crate::config::AiConfig;
use crate::error::Result;

use super::http::HttpChat;
use super::{AiError, ChatBackend, ChatProvider, ProviderInfo};

const BASE_URL: &str = "https://api.anthropic.com";
const DEFAULT_MODEL: &str = "claude-sonnet-4-5";
const API_VERSION: &str = "2023-06-01";
const CALL_TIMEOUT: Duration = Duration::from_secs(120);

pub struct AnthropicBackend {
    api_key: String,
    base_url: String,
    model: String,
    http: HttpChat,
}

#[async_trait]
impl ChatBackend for AnthropicBackend {
    fn name(&self) -> &str {
        "anthropic"
    }

    fn info(&self) -> ProviderInfo {
        ProviderInfo {
            name: "anthropic".to_string(),
            model: self.model.clone(),
            endpoint: self.base_url.clone(),
        }
    }

    async fn available(&self) -> bool {
        !self.api_key.is_empty()
    }

    async fn chat(&self, system: &str, user: &str) -> Result<String> {
        let url = format!("{}/v1/messages", self.base_url);
        let body = serde_json::json!({
            "model": self.model,
            "max_tokens": 4096,
            "system": system,
            "messages": [{"role": "user", "content": user}],
            "temperature": 0.2,
        });
        let headers = vec![
            ("x-api-key".to_string(), self.api_key.clone()),
            ("anthropic-version".to_string(), API_VERSION.to_string()),
        ];

        let response = self.http.post(&url, &headers, &body).await?;
        response["content"][0]["text"]
            .as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| {
                AiError::InvalidResponse {
                    provider: "anthropic".to_string(),
                    message: "missing content[0].text".to_string(),
                }
                .into()
            })
    }
}

pub type AnthropicProvider = ChatProvider<AnthropicBackend>;

impl ChatProvider<AnthropicBackend> {
    pub fn new(cfg: &AiConfig) -> Result<Self> {
        let env_name = cfg
            .api_key_env
            .clone()
            .unwrap_or_else(|| "ANTHROPIC_API_KEY".to_string());
        let backend = AnthropicBackend {
            api_key: std::env::var(&env_name).unwrap_or_default(),
            base_url: cfg
                .endpoint
                .clone()
                .unwrap_or_else(|| BASE_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            model: cfg.model.clone().unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            http: HttpChat::new("anthropic", CALL_TIMEOUT)?,
        };
        Ok(Self::from_backend(backend, cfg.profile.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::AiProvider;

    fn cfg() -> AiConfig {
        AiConfig {
            provider: "anthropic".to_string(),
            fallbacks: vec![],
            model: None,
            endpoint: None,
            api_key_env: Some("CTRLSCAN_TEST_MISSING_KEY".to_string()),
            local_optimized: false,
            profile: None,
            triage_chunk_size: None,
            min_confidence: None,
            confidence: Default::default(),
        }
    }

    #[test]
    fn test_defaults() {
        let provider = AnthropicProvider::new(&cfg()).unwrap();
        let info = provider.info();
        assert_eq!(info.name, "anthropic");
        assert_eq!(info.model, DEFAULT_MODEL);
        assert_eq!(info.endpoint, BASE_URL);
    }

    #[tokio::test]
    async fn test_unavailable_without_key() {
        let provider = AnthropicProvider::new(&cfg()).unwrap();
        assert!(!provider.is_available().await);
    }

    #[test]
    fn test_model_override() {
        let mut config = cfg();
        config.model = Some("claude-opus-4-1".to_string());
        let provider = AnthropicProvider::new(&config).unwrap();
        assert_eq!(provider.info().model, "claude-opus-4-1");
    }
}
