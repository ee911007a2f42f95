pub mod azure;
pub mod github;
pub mod gitlab;

use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::warn;

use crate::config::ProviderConfig;
use crate::error::{Error, Result};

const MAX_RETRIES: u32 = 3;
const INITIAL_BACKOFF_MS: u64 = 500;

/// A repository as seen through a provider adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoRef {
    pub provider: String,
    pub owner: String,
    pub name: String,
    pub clone_url: String,
    pub default_branch: String,
}

/// Options for repo listing. `all_accessible` widens the affiliation from
/// owned repos to everything the token can reach.
#[derive(Debug, Clone, Copy, Default)]
pub struct ListRepoOptions {
    pub all_accessible: bool,
}

#[derive(Debug, Clone)]
pub struct CreatePrOptions {
    pub owner: String,
    pub repo: String,
    pub title: String,
    pub body: String,
    /// For fork-mode PRs on GitHub this is `<fork_owner>:<branch>`; maps to
    /// `source_branch` on GitLab.
    pub head_branch: String,
    pub base_branch: String,
    pub draft: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullRequest {
    pub number: i64,
    pub url: String,
}

/// Capability set over a git-hosting platform.
///
/// `auth_token` is the bearer credential used for git push. It is injected
/// into the clone URL at push time and must never be logged.
pub trait GitProvider: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &str;
    fn auth_token(&self) -> &str;
    fn list_repos(&self, opts: &ListRepoOptions) -> Result<Vec<RepoRef>>;
    fn get_repo(&self, owner: &str, name: &str) -> Result<RepoRef>;
    fn fork_repo(&self, owner: &str, name: &str) -> Result<RepoRef>;
    fn create_pr(&self, opts: &CreatePrOptions) -> Result<PullRequest>;
    fn search_repos(&self, query: &str) -> Result<Vec<RepoRef>>;
}

/// One authenticated client per configured provider, keyed by name.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn GitProvider>>,
}

impl ProviderRegistry {
    pub fn from_config(configs: &[ProviderConfig]) -> Result<Self> {
        let mut providers: HashMap<String, Arc<dyn GitProvider>> = HashMap::new();
        for cfg in configs {
            let provider: Arc<dyn GitProvider> = match cfg.name.as_str() {
                "github" => Arc::new(github::GitHubProvider::new(cfg)),
                "gitlab" => Arc::new(gitlab::GitLabProvider::new(cfg)),
                "azure" => Arc::new(azure::AzureProvider::new(cfg)?),
                other => {
                    return Err(Error::Provider(format!("unknown provider: {other}")));
                }
            };
            providers.insert(cfg.name.clone(), provider);
        }
        Ok(Self { providers })
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn GitProvider>> {
        self.providers
            .get(name)
            .cloned()
            .ok_or_else(|| Error::Provider(format!("provider not configured: {name}")))
    }

    pub fn all(&self) -> Vec<Arc<dyn GitProvider>> {
        let mut all: Vec<_> = self.providers.values().cloned().collect();
        all.sort_by(|a, b| a.name().to_string().cmp(&b.name().to_string()));
        all
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    #[cfg(test)]
    pub fn with_provider(provider: Arc<dyn GitProvider>) -> Self {
        let mut providers: HashMap<String, Arc<dyn GitProvider>> = HashMap::new();
        providers.insert(provider.name().to_string(), provider);
        Self { providers }
    }
}

/// Only retry rate-limits (429), server errors (5xx), and transport errors.
pub(crate) fn is_retryable(err: &ureq::Error) -> bool {
    match err {
        ureq::Error::Status(code, _) => *code == 429 || *code >= 500,
        ureq::Error::Transport(_) => true,
    }
}

pub(crate) fn retry_with_backoff<F>(f: F) -> Result<ureq::Response>
where
    F: Fn() -> std::result::Result<ureq::Response, ureq::Error>,
{
    let mut backoff_ms = INITIAL_BACKOFF_MS;

    for attempt in 1..=MAX_RETRIES {
        match f() {
            Ok(val) => return Ok(val),
            Err(ref e) if attempt < MAX_RETRIES && is_retryable(e) => {
                warn!(attempt, error = %e, backoff_ms, "retrying provider call after transient error");
                thread::sleep(Duration::from_millis(backoff_ms));
                backoff_ms *= 2;
            }
            Err(e) => return Err(map_ureq_error(e)),
        }
    }
    unreachable!()
}

/// GET with retry, parsing the response body as JSON.
pub(crate) fn get_json<T, F>(build: F) -> Result<T>
where
    T: serde::de::DeserializeOwned,
    F: Fn() -> ureq::Request,
{
    let response = retry_with_backoff(|| build().call())?;
    response
        .into_json()
        .map_err(|e| Error::Provider(format!("invalid json from provider: {e}")))
}

/// POST a JSON body with retry, parsing the response body as JSON.
pub(crate) fn post_json<T, F>(build: F, body: serde_json::Value) -> Result<T>
where
    T: serde::de::DeserializeOwned,
    F: Fn() -> ureq::Request,
{
    let response = retry_with_backoff(|| build().send_json(body.clone()))?;
    response
        .into_json()
        .map_err(|e| Error::Provider(format!("invalid json from provider: {e}")))
}

pub(crate) fn map_ureq_error(err: ureq::Error) -> Error {
    match err {
        ureq::Error::Status(code, response) => {
            let body = response.into_string().unwrap_or_default();
            let snippet: String = body.chars().take(200).collect();
            Error::Provider(format!("HTTP {code}: {snippet}"))
        }
        ureq::Error::Transport(t) => Error::Provider(format!("transport error: {t}")),
    }
}
