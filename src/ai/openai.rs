use std::time::Duration;

use async_trait::async_trait;

use crate::config::AiConfig;
use crate::error::Result;

use super::http::HttpChat;
use super::{AiError, ChatBackend, ChatProvider, ProviderInfo};

const OPENAI_BASE: &str = "https://api.openai.com/v1";
const OPENAI_MODEL: &str = "gpt-4.1";
const ZAI_BASE: &str = "https://api.z.ai/api/paas/v4";
const ZAI_MODEL: &str = "glm-4.6";
const LOCAL_MODEL: &str = "local";

const CALL_TIMEOUT: Duration = Duration::from_secs(120);
const LOCAL_CALL_TIMEOUT: Duration = Duration::from_secs(180);

/// Chat-completions backend for OpenAI and OpenAI-compatible endpoints
/// (Z.AI, local servers).
pub struct OpenAiBackend {
    name: String,
    api_key: String,
    base_url: String,
    model: String,
    http: HttpChat,
}

/// Newer OpenAI model families renamed the token cap parameter.
fn max_tokens_param(model: &str) -> &'static str {
    let bytes = model.as_bytes();
    let is_o_family = bytes.len() >= 2 && bytes[0] == b'o' && bytes[1].is_ascii_digit();
    if is_o_family || model.starts_with("gpt-5") {
        "max_completion_tokens"
    } else {
        "max_tokens"
    }
}

fn api_key_from_env(cfg: &AiConfig, default_env: &str) -> String {
    let env_name = cfg.api_key_env.clone().unwrap_or_else(|| default_env.to_string());
    std::env::var(&env_name).unwrap_or_default()
}

impl OpenAiBackend {
    fn build(
        name: &str,
        cfg: &AiConfig,
        default_base: &str,
        default_model: &str,
        default_key_env: &str,
        timeout: Duration,
    ) -> Result<Self> {
        let base_url = cfg
            .endpoint
            .clone()
            .unwrap_or_else(|| default_base.to_string())
            .trim_end_matches('/')
            .to_string();
        Ok(Self {
            name: name.to_string(),
            api_key: api_key_from_env(cfg, default_key_env),
            base_url,
            model: cfg.model.clone().unwrap_or_else(|| default_model.to_string()),
            http: HttpChat::new(name, timeout)?,
        })
    }
}

#[async_trait]
impl ChatBackend for OpenAiBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn info(&self) -> ProviderInfo {
        ProviderInfo {
            name: self.name.clone(),
            model: self.model.clone(),
            endpoint: self.base_url.clone(),
        }
    }

    async fn available(&self) -> bool {
        // Local endpoints may run without auth; everything else needs a key.
        self.name == "local" || !self.api_key.is_empty()
    }

    async fn chat(&self, system: &str, user: &str) -> Result<String> {
        let url = format!("{}/chat/completions", self.base_url);
        let mut body = serde_json::json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": user},
            ],
            "temperature": 0.2,
        });
        body[max_tokens_param(&self.model)] = serde_json::json!(4096);

        let mut headers = Vec::new();
        if !self.api_key.is_empty() {
            headers.push(("Authorization".to_string(), format!("Bearer {}", self.api_key)));
        }

        let response = self.http.post(&url, &headers, &body).await?;
        response["choices"][0]["message"]["content"]
            .as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| {
                AiError::InvalidResponse {
                    provider: self.name.clone(),
                    message: "missing choices[0].message.content".to_string(),
                }
                .into()
            })
    }
}

pub type OpenAiProvider = ChatProvider<OpenAiBackend>;

impl ChatProvider<OpenAiBackend> {
    pub fn openai(cfg: &AiConfig) -> Result<Self> {
        let backend = OpenAiBackend::build(
            "openai",
            cfg,
            OPENAI_BASE,
            OPENAI_MODEL,
            "OPENAI_API_KEY",
            CALL_TIMEOUT,
        )?;
        Ok(Self::from_backend(backend, cfg.profile.clone()))
    }

    pub fn zai(cfg: &AiConfig) -> Result<Self> {
        let backend =
            OpenAiBackend::build("zai", cfg, ZAI_BASE, ZAI_MODEL, "ZAI_API_KEY", CALL_TIMEOUT)?;
        Ok(Self::from_backend(backend, cfg.profile.clone()))
    }

    /// OpenAI-compatible custom endpoint, e.g. a llama.cpp or vLLM server.
    pub fn local(cfg: &AiConfig) -> Result<Self> {
        let backend = OpenAiBackend::build(
            "local",
            cfg,
            "http://localhost:8080/v1",
            LOCAL_MODEL,
            "LOCAL_AI_API_KEY",
            LOCAL_CALL_TIMEOUT,
        )?;
        Ok(Self::from_backend(backend, cfg.profile.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::super::AiProvider;

    #[test]
    fn test_max_tokens_param_by_family() {
        assert_eq!(max_tokens_param("gpt-4.1"), "max_tokens");
        assert_eq!(max_tokens_param("gpt-4o-mini"), "max_tokens");
        assert_eq!(max_tokens_param("gpt-5"), "max_completion_tokens");
        assert_eq!(max_tokens_param("gpt-5-turbo"), "max_completion_tokens");
        assert_eq!(max_tokens_param("o3"), "max_completion_tokens");
        assert_eq!(max_tokens_param("o1-preview"), "max_completion_tokens");
        // "ollama-ish" names are not the o-family
        assert_eq!(max_tokens_param("open-mistral"), "max_tokens");
    }

    fn cfg() -> AiConfig {
        AiConfig {
            provider: "openai".to_string(),
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
    fn test_openai_defaults() {
        let provider = OpenAiProvider::openai(&cfg()).unwrap();
        let info = provider.info();
        assert_eq!(info.name, "openai");
        assert_eq!(info.model, OPENAI_MODEL);
        assert_eq!(info.endpoint, OPENAI_BASE);
    }

    #[test]
    fn test_zai_defaults() {
        let provider = OpenAiProvider::zai(&cfg()).unwrap();
        let info = provider.info();
        assert_eq!(info.name, "zai");
        assert_eq!(info.model, ZAI_MODEL);
        assert!(info.endpoint.contains("z.ai"));
    }

    #[tokio::test]
    async fn test_availability_requires_key_except_local() {
        use super::super::AiProvider;
        let openai = OpenAiProvider::openai(&cfg()).unwrap();
        assert!(!openai.is_available().await);

        let local = OpenAiProvider::local(&cfg()).unwrap();
        assert!(local.is_available().await);
    }

    #[test]
    fn test_endpoint_override_and_trailing_slash() {
        let mut config = cfg();
        config.endpoint = Some("https://llm.internal/v1/".to_string());
        let provider = OpenAiProvider::openai(&config).unwrap();
        assert_eq!(provider.info().endpoint, "https://llm.internal/v1");
    }
}
