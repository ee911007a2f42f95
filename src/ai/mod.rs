pub mod anthropic;
pub mod breaker;
pub mod chain;
pub mod http;
pub mod ollama;
pub mod openai;
pub mod prompts;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::AiConfig;
use crate::error::Result;
use crate::findings::Finding;

/// Errors from AI providers, classified for failover policy.
#[derive(Debug, thiserror::Error)]
pub enum AiError {
    #[error("{provider}: rate limited: {message}")]
    RateLimited { provider: String, message: String },

    #[error("{provider}: server error: {message}")]
    Server { provider: String, message: String },

    #[error("{provider}: timed out")]
    Timeout { provider: String },

    #[error("{provider}: connection failed: {message}")]
    Connect { provider: String, message: String },

    #[error("{provider}: auth rejected: {message}")]
    Auth { provider: String, message: String },

    #[error("{provider}: request rejected: {message}")]
    Client { provider: String, message: String },

    #[error("{provider}: invalid response: {message}")]
    InvalidResponse { provider: String, message: String },

    #[error("ai provider not configured")]
    NotConfigured,

    #[error("all providers failed, last error: {message}")]
    ChainExhausted { message: String },
}

impl AiError {
    /// Transient failures worth failing over for: rate limits, 5xx,
    /// timeouts, refused connections.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            AiError::RateLimited { .. }
                | AiError::Server { .. }
                | AiError::Timeout { .. }
                | AiError::Connect { .. }
        )
    }

    /// 401/403. Opens the circuit immediately; retrying cannot help.
    pub fn is_auth(&self) -> bool {
        matches!(self, AiError::Auth { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriagedFinding {
    pub finding_id: String,
    pub priority: u32,
    #[serde(default)]
    pub rationale: String,
    #[serde(default)]
    pub suggested_fix: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TriageOutcome {
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub prioritised: Vec<TriagedFinding>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplyStrategy {
    #[default]
    GitApply,
    EditFileDirectly,
    DependencyBump,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Ecosystem {
    Go,
    Npm,
    #[default]
    Unknown,
}

/// Structured guidance attached to a generated fix, telling the PR worker
/// how to realize the change.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApplyHints {
    #[serde(default)]
    pub apply_strategy: ApplyStrategy,
    #[serde(default)]
    pub ecosystem: Ecosystem,
    #[serde(default)]
    pub dependency_name: String,
    #[serde(default)]
    pub target_version: String,
    #[serde(default)]
    pub manifest_path: String,
    #[serde(default)]
    pub lockfile_path: String,
    #[serde(default)]
    pub target_files: Vec<String>,
    #[serde(default)]
    pub prerequisites: Vec<String>,
    #[serde(default)]
    pub post_apply_checks: Vec<String>,
    #[serde(default)]
    pub fallback_patch_notes: String,
    #[serde(default)]
    pub risk_notes: String,
}

#[derive(Debug, Clone)]
pub struct FixRequest {
    pub finding: Finding,
    /// Target file content (full file or a marked window).
    pub file_context: String,
    pub repo_slug: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FixOutcome {
    #[serde(default)]
    pub patch: String,
    #[serde(default)]
    pub explanation: String,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub apply_hints: ApplyHints,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PrText {
    pub title: String,
    pub body: String,
}

/// Summary of a queued fix, fed to PR-description generation.
#[derive(Debug, Clone)]
pub struct FixSummary {
    pub finding_title: String,
    pub file_path: String,
    pub explanation: String,
}

/// Identity of the provider that produced a fix, persisted on the fix-queue
/// row.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProviderInfo {
    pub name: String,
    pub model: String,
    pub endpoint: String,
}

/// Capability set of a language-model backend.
#[async_trait]
pub trait AiProvider: Send + Sync {
    fn name(&self) -> &str;
    fn info(&self) -> ProviderInfo;
    async fn is_available(&self) -> bool;
    async fn triage_findings(&self, findings: &[Finding]) -> Result<TriageOutcome>;
    async fn generate_fix(&self, req: &FixRequest) -> Result<FixOutcome>;
    async fn generate_pr_description(&self, fixes: &[FixSummary]) -> Result<PrText>;
}

/// Lower seam implemented by the concrete HTTP backends: one chat
/// completion, given a system and a user prompt.
#[async_trait]
pub(crate) trait ChatBackend: Send + Sync {
    fn name(&self) -> &str;
    fn info(&self) -> ProviderInfo;
    async fn available(&self) -> bool;
    async fn chat(&self, system: &str, user: &str) -> Result<String>;
}

/// Adapter that turns any `ChatBackend` into a full `AiProvider` by pairing
/// it with the prompt templates and response parsers.
pub struct ChatProvider<B> {
    backend: B,
    runner: prompts::PromptRunner,
}

impl<B: ChatBackend> ChatProvider<B> {
    pub(crate) fn from_backend(backend: B, profile: Option<String>) -> Self {
        Self {
            backend,
            runner: prompts::PromptRunner::new(profile),
        }
    }

    fn invalid(&self, message: String) -> crate::error::Error {
        AiError::InvalidResponse {
            provider: self.backend.name().to_string(),
            message,
        }
        .into()
    }
}

#[async_trait]
impl<B: ChatBackend> AiProvider for ChatProvider<B> {
    fn name(&self) -> &str {
        self.backend.name()
    }

    fn info(&self) -> ProviderInfo {
        self.backend.info()
    }

    async fn is_available(&self) -> bool {
        self.backend.available().await
    }

    async fn triage_findings(&self, findings: &[Finding]) -> Result<TriageOutcome> {
        let user = self.runner.triage_user_prompt(findings)?;
        let system = self.runner.system(prompts::SYSTEM_TRIAGE);
        let raw = self.backend.chat(&system, &user).await?;
        prompts::parse_triage_response(&raw).map_err(|m| self.invalid(m))
    }

    async fn generate_fix(&self, req: &FixRequest) -> Result<FixOutcome> {
        let user = self.runner.fix_user_prompt(req)?;
        let system = self.runner.system(prompts::SYSTEM_FIX);
        let raw = self.backend.chat(&system, &user).await?;
        prompts::parse_fix_response(&raw).map_err(|m| self.invalid(m))
    }

    async fn generate_pr_description(&self, fixes: &[FixSummary]) -> Result<PrText> {
        let user = self.runner.pr_user_prompt(fixes)?;
        let system = self.runner.system(prompts::SYSTEM_PR);
        let raw = self.backend.chat(&system, &user).await?;
        prompts::parse_pr_response(&raw).map_err(|m| self.invalid(m))
    }
}

/// Zero-cost variant used when no provider is configured. Every operation
/// returns a typed "not configured" error.
pub struct NoopProvider;

#[async_trait]
impl AiProvider for NoopProvider {
    fn name(&self) -> &str {
        "noop"
    }

    fn info(&self) -> ProviderInfo {
        ProviderInfo {
            name: "noop".to_string(),
            ..Default::default()
        }
    }

    async fn is_available(&self) -> bool {
        false
    }

    async fn triage_findings(&self, _findings: &[Finding]) -> Result<TriageOutcome> {
        Err(AiError::NotConfigured.into())
    }

    async fn generate_fix(&self, _req: &FixRequest) -> Result<FixOutcome> {
        Err(AiError::NotConfigured.into())
    }

    async fn generate_pr_description(&self, _fixes: &[FixSummary]) -> Result<PrText> {
        Err(AiError::NotConfigured.into())
    }
}

/// Build the configured provider, wrapping primary + fallbacks in the chain
/// when anything concrete is configured.
pub fn build_from_config(cfg: &AiConfig) -> Result<std::sync::Arc<dyn AiProvider>> {
    use std::sync::Arc;

    if cfg.provider == "noop" {
        return Ok(Arc::new(NoopProvider));
    }

    let mut providers: Vec<Arc<dyn AiProvider>> = Vec::new();
    for name in std::iter::once(&cfg.provider).chain(cfg.fallbacks.iter()) {
        providers.push(build_one(name, cfg)?);
    }
    Ok(Arc::new(chain::ProviderChain::new(providers)))
}

fn build_one(name: &str, cfg: &AiConfig) -> Result<std::sync::Arc<dyn AiProvider>> {
    use std::sync::Arc;

    let provider: Arc<dyn AiProvider> = match name {
        "openai" => Arc::new(openai::OpenAiProvider::openai(cfg)?),
        "zai" => Arc::new(openai::OpenAiProvider::zai(cfg)?),
        "local" => Arc::new(openai::OpenAiProvider::local(cfg)?),
        "anthropic" => Arc::new(anthropic::AnthropicProvider::new(cfg)?),
        "ollama" => Arc::new(ollama::OllamaProvider::new(cfg)?),
        "noop" => Arc::new(NoopProvider),
        other => {
            return Err(crate::error::Error::ConfigValidation(format!(
                "unknown ai provider: {other}"
            )));
        }
    };
    Ok(provider)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let rate = AiError::RateLimited {
            provider: "openai".to_string(),
            message: "429".to_string(),
        };
        assert!(rate.is_retriable());
        assert!(!rate.is_auth());

        let auth = AiError::Auth {
            provider: "openai".to_string(),
            message: "401".to_string(),
        };
        assert!(!auth.is_retriable());
        assert!(auth.is_auth());

        let client = AiError::Client {
            provider: "openai".to_string(),
            message: "400".to_string(),
        };
        assert!(!client.is_retriable());
        assert!(!client.is_auth());

        let timeout = AiError::Timeout {
            provider: "ollama".to_string(),
        };
        assert!(timeout.is_retriable());
    }

    #[tokio::test]
    async fn test_noop_provider() {
        let noop = NoopProvider;
        assert_eq!(noop.name(), "noop");
        assert!(!noop.is_available().await);
        let err = noop.triage_findings(&[]).await.unwrap_err();
        assert!(err.to_string().contains("not configured"));
    }

    #[test]
    fn test_apply_hints_deserialize_defaults() {
        let hints: ApplyHints = serde_json::from_str("{}").unwrap();
        assert_eq!(hints.apply_strategy, ApplyStrategy::GitApply);
        assert_eq!(hints.ecosystem, Ecosystem::Unknown);
        assert!(hints.target_files.is_empty());
    }

    #[test]
    fn test_apply_hints_roundtrip() {
        let hints = ApplyHints {
            apply_strategy: ApplyStrategy::DependencyBump,
            ecosystem: Ecosystem::Npm,
            dependency_name: "lodash".to_string(),
            target_version: "4.17.21".to_string(),
            manifest_path: "package.json".to_string(),
            lockfile_path: "package-lock.json".to_string(),
            target_files: vec!["package.json".to_string(), "package-lock.json".to_string()],
            ..Default::default()
        };
        let json = serde_json::to_string(&hints).unwrap();
        assert!(json.contains("\"dependency_bump\""));
        assert!(json.contains("\"npm\""));
        let back: ApplyHints = serde_json::from_str(&json).unwrap();
        assert_eq!(back, hints);
    }

    #[test]
    fn test_build_noop_from_config() {
        let cfg = AiConfig {
            provider: "noop".to_string(),
            fallbacks: vec![],
            model: None,
            endpoint: None,
            api_key_env: None,
            local_optimized: false,
            profile: None,
            triage_chunk_size: None,
            min_confidence: None,
            confidence: Default::default(),
        };
        let provider = build_from_config(&cfg).unwrap();
        assert_eq!(provider.name(), "noop");
    }
}
