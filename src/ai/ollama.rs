use std::time::Duration;

use async_trait::async_trait;

use crate::config::AiConfig;
use crate::error::Result;

use super::http::HttpChat;
use super::{AiError, ChatBackend, ChatProvider, ProviderInfo};

const BASE_URL: &str = "http://localhost:11434";
const DEFAULT_MODEL: &str = "qwen2.5-coder";
// Local models are slow; give them room.
const CALL_TIMEOUT: Duration = Duration::from_secs(180);

pub struct OllamaBackend {
    base_url: String,
    model: String,
    http: HttpChat,
}

#[async_trait]
impl ChatBackend for OllamaBackend {
    fn name(&self) -> &str {
        "ollama"
    }

    fn info(&self) -> ProviderInfo {
        ProviderInfo {
            name: "ollama".to_string(),
            model: self.model.clone(),
            endpoint: self.base_url.clone(),
        }
    }

    async fn available(&self) -> bool {
        true
    }

    async fn chat(&self, system: &str, user: &str) -> Result<String> {
        let url = format!("{}/api/chat", self.base_url);
        let body = serde_json::json!({
            "model": self.model,
            "stream": false,
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": user},
            ],
            "options": {"temperature": 0.2},
        });

        let response = self.http.post(&url, &[], &body).await?;
        response["message"]["content"]
            .as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| {
                AiError::InvalidResponse {
                    provider: "ollama".to_string(),
                    message: "missing message.content".to_string(),
                }
                .into()
            })
    }
}

pub type OllamaProvider = ChatProvider<OllamaBackend>;

impl ChatProvider<OllamaBackend> {
    pub fn new(cfg: &AiConfig) -> Result<Self> {
        let backend = OllamaBackend {
            base_url: cfg
                .endpoint
                .clone()
                .unwrap_or_else(|| BASE_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            model: cfg.model.clone().unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            http: HttpChat::new("ollama", CALL_TIMEOUT)?,
        };
        Ok(Self::from_backend(backend, cfg.profile.clone()))
    }
}
