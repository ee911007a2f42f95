use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{AdvisoryConfig, Config, RepoSelector, ScanTarget};
use crate::db::Db;
use crate::error::{Error, Result};
use crate::providers::{ListRepoOptions, ProviderRegistry, RepoRef};
use crate::severity::Severity;

/// Handoff envelope from discovery to the scanner pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoJob {
    pub provider: String,
    pub owner: String,
    pub name: String,
    pub clone_url: String,
    /// None scans the default branch (HEAD).
    pub branch: Option<String>,
}

impl RepoJob {
    fn from_ref(repo: &RepoRef) -> Self {
        // Pin the default branch so the freshness key matches what the scan
        // job records.
        let branch = (!repo.default_branch.is_empty()).then(|| repo.default_branch.clone());
        Self {
            provider: repo.provider.clone(),
            owner: repo.owner.clone(),
            name: repo.name.clone(),
            clone_url: repo.clone_url.clone(),
            branch,
        }
    }
}

/// One advisory entry from the external vulnerability database.
#[derive(Debug, Clone, Deserialize)]
pub struct Advisory {
    pub id: String,
    pub package: String,
    pub ecosystem: String,
    pub cvss_score: Option<f64>,
    pub modified: DateTime<Utc>,
}

impl Advisory {
    /// Advisories without a severity are included by default.
    pub fn passes_min_severity(&self, min: Severity) -> bool {
        match self.cvss_score {
            Some(score) => Severity::from_cvss(score) >= min,
            None => true,
        }
    }
}

/// External vulnerability database, queried for advisories modified since a
/// cursor.
#[async_trait]
pub trait AdvisoryFeed: Send + Sync {
    fn source(&self) -> &str;
    async fn fetch_since(
        &self,
        ecosystems: &[String],
        cursor: Option<DateTime<Utc>>,
    ) -> Result<Vec<Advisory>>;
}

#[derive(Debug, Deserialize)]
struct FeedResponse {
    #[serde(default)]
    advisories: Vec<Advisory>,
}

/// HTTP client for an OSV-style advisory feed.
pub struct OsvFeed {
    source: String,
    endpoint: String,
    client: reqwest::Client,
}

impl OsvFeed {
    pub fn new(cfg: &AdvisoryConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .map_err(|e| Error::Provider(format!("advisory client: {e}")))?;
        Ok(Self {
            source: cfg.source.clone(),
            endpoint: cfg.endpoint.trim_end_matches('/').to_string(),
            client,
        })
    }
}

#[async_trait]
impl AdvisoryFeed for OsvFeed {
    fn source(&self) -> &str {
        &self.source
    }

    async fn fetch_since(
        &self,
        ecosystems: &[String],
        cursor: Option<DateTime<Utc>>,
    ) -> Result<Vec<Advisory>> {
        let mut all = Vec::new();
        for ecosystem in ecosystems {
            let mut request = self
                .client
                .get(format!("{}/v1/advisories", self.endpoint))
                .query(&[("ecosystem", ecosystem.as_str())]);
            if let Some(cursor) = cursor {
                request = request.query(&[("modified_since", cursor.to_rfc3339())]);
            }
            let response = request
                .send()
                .await
                .map_err(|e| Error::Provider(format!("advisory feed: {e}")))?;
            if !response.status().is_success() {
                return Err(Error::Provider(format!(
                    "advisory feed: HTTP {}",
                    response.status().as_u16()
                )));
            }
            let parsed: FeedResponse = response
                .json()
                .await
                .map_err(|e| Error::Provider(format!("advisory feed json: {e}")))?;
            all.extend(parsed.advisories);
        }
        Ok(all)
    }
}

/// Ecosystem-specific code-search query for repos that depend on `package`.
pub fn ecosystem_search_query(ecosystem: &str, package: &str) -> String {
    match ecosystem.to_lowercase().as_str() {
        "npm" => format!("\"{package}\" filename:package.json"),
        "go" => format!("\"{package}\" filename:go.mod"),
        "pypi" => format!("\"{package}\" filename:requirements.txt"),
        _ => format!("\"{package}\""),
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DiscoveryStats {
    pub repos_emitted: u64,
    pub advisories_seen: u64,
}

/// Produces the stream of repo jobs for one sweep.
pub struct Discovery {
    config: Arc<Config>,
    providers: ProviderRegistry,
    db: Db,
    feed: Arc<dyn AdvisoryFeed>,
}

impl Discovery {
    pub fn new(
        config: Arc<Config>,
        providers: ProviderRegistry,
        db: Db,
        feed: Arc<dyn AdvisoryFeed>,
    ) -> Self {
        Self {
            config,
            providers,
            db,
            feed,
        }
    }

    /// Run one discovery sweep, emitting repo jobs into `tx`. Honors
    /// cancellation on every send. A non-empty `selected` list bypasses the
    /// configured targets.
    pub async fn run_once(
        &self,
        targets: &[ScanTarget],
        selected: &[RepoSelector],
        tx: &mpsc::Sender<RepoJob>,
        cancel: &CancellationToken,
    ) -> Result<DiscoveryStats> {
        let mut stats = DiscoveryStats::default();
        let mut seen: HashSet<(String, String, String)> = HashSet::new();

        if !selected.is_empty() {
            for selector in selected {
                match self.resolve_selector(selector) {
                    Ok(job) => {
                        self.emit(job, &mut seen, &mut stats, tx, cancel).await?;
                    }
                    Err(e) => {
                        warn!(
                            owner = %selector.owner,
                            repo = %selector.name,
                            error = %e,
                            "selected repo lookup failed"
                        );
                    }
                }
            }
            return Ok(stats);
        }

        for target in targets {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            match target {
                ScanTarget::OwnRepos => {
                    self.emit_listing(false, &mut seen, &mut stats, tx, cancel)
                        .await?;
                }
                ScanTarget::AllAccessible => {
                    self.emit_listing(true, &mut seen, &mut stats, tx, cancel)
                        .await?;
                }
                ScanTarget::Watchlist => {
                    for selector in &self.config.watchlist {
                        match self.resolve_selector(selector) {
                            Ok(job) => {
                                self.emit(job, &mut seen, &mut stats, tx, cancel).await?;
                            }
                            Err(e) => {
                                warn!(
                                    owner = %selector.owner,
                                    repo = %selector.name,
                                    error = %e,
                                    "watchlist repo lookup failed"
                                );
                            }
                        }
                    }
                }
                ScanTarget::CveSearch => {
                    // Stateless variant of the advisory sweep: no cursor, no
                    // poll-state writes.
                    let advisories = self
                        .feed
                        .fetch_since(&self.config.advisory.ecosystems, None)
                        .await?;
                    stats.advisories_seen += advisories.len() as u64;
                    self.emit_for_advisories(&advisories, &mut seen, &mut stats, tx, cancel)
                        .await?;
                }
                ScanTarget::AdvisoryFeed => {
                    self.sweep_advisory_feed(&mut seen, &mut stats, tx, cancel)
                        .await?;
                }
            }
        }

        Ok(stats)
    }

    fn resolve_selector(&self, selector: &RepoSelector) -> Result<RepoJob> {
        let provider = self.providers.get(&selector.provider)?;
        let repo = provider.get_repo(&selector.owner, &selector.name)?;
        Ok(RepoJob::from_ref(&repo))
    }

    async fn emit_listing(
        &self,
        all_accessible: bool,
        seen: &mut HashSet<(String, String, String)>,
        stats: &mut DiscoveryStats,
        tx: &mpsc::Sender<RepoJob>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        for provider in self.providers.all() {
            let repos = match provider.list_repos(&ListRepoOptions { all_accessible }) {
                Ok(repos) => repos,
                Err(e) => {
                    warn!(provider = provider.name(), error = %e, "repo listing failed");
                    continue;
                }
            };
            for repo in &repos {
                self.emit(RepoJob::from_ref(repo), seen, stats, tx, cancel)
                    .await?;
            }
        }
        Ok(())
    }

    async fn sweep_advisory_feed(
        &self,
        seen: &mut HashSet<(String, String, String)>,
        stats: &mut DiscoveryStats,
        tx: &mpsc::Sender<RepoJob>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if !self.config.advisory.enabled {
            info!("advisory feed disabled, skipping target");
            return Ok(());
        }

        let source = self.feed.source().to_string();
        let state = self.db.load_advisory_poll_state(&source).await?;
        let cursor = state.and_then(|s| s.cursor);

        let advisories = self
            .feed
            .fetch_since(&self.config.advisory.ecosystems, cursor)
            .await?;
        stats.advisories_seen += advisories.len() as u64;

        let emitted_before = stats.repos_emitted;
        self.emit_for_advisories(&advisories, seen, stats, tx, cancel)
            .await?;

        // Advance the cursor to the newest modified timestamp seen.
        let newest = advisories.iter().map(|a| a.modified).max();
        self.db
            .save_advisory_poll_state(
                &source,
                newest,
                advisories.len() as i64,
                (stats.repos_emitted - emitted_before) as i64,
            )
            .await?;
        Ok(())
    }

    async fn emit_for_advisories(
        &self,
        advisories: &[Advisory],
        seen: &mut HashSet<(String, String, String)>,
        stats: &mut DiscoveryStats,
        tx: &mpsc::Sender<RepoJob>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let min = self.config.advisory.min_severity;
        let cap = self.config.advisory.max_repos_per_advisory;

        for advisory in advisories {
            if !advisory.passes_min_severity(min) {
                continue;
            }
            let query = ecosystem_search_query(&advisory.ecosystem, &advisory.package);

            for provider in self.providers.all() {
                let repos = match provider.search_repos(&query) {
                    Ok(repos) => repos,
                    Err(e) => {
                        warn!(
                            provider = provider.name(),
                            advisory = %advisory.id,
                            error = %e,
                            "advisory repo search failed"
                        );
                        continue;
                    }
                };
                for repo in repos.iter().take(cap) {
                    self.emit(RepoJob::from_ref(repo), seen, stats, tx, cancel)
                        .await?;
                }
            }
        }
        Ok(())
    }

    async fn emit(
        &self,
        job: RepoJob,
        seen: &mut HashSet<(String, String, String)>,
        stats: &mut DiscoveryStats,
        tx: &mpsc::Sender<RepoJob>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let key = (job.provider.clone(), job.owner.clone(), job.name.clone());
        if !seen.insert(key) {
            return Ok(());
        }
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled),
            sent = tx.send(job) => {
                sent.map_err(|_| Error::Orchestrator("repo queue closed".to_string()))?;
                stats.repos_emitted += 1;
                Ok(())
            }
        }
    }
}
