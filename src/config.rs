use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::cli::Cli;
use crate::error::{Error, Result};
use crate::severity::Severity;

const DEFAULT_CONFIG_FILE: &str = ".ctrlscan/config.toml";

pub const KNOWN_SCANNERS: &[&str] = &["trivy", "semgrep", "gitleaks", "checkov"];
pub const KNOWN_AI_PROVIDERS: &[&str] = &["openai", "anthropic", "ollama", "zai", "local", "noop"];

#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ProviderFileConfig {
    pub token_env: Option<String>,
    pub token: Option<String>,
    pub api_base: Option<String>,
    /// Azure DevOps organization; ignored by other providers.
    pub organization: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct AiFileConfig {
    pub provider: Option<String>,
    #[serde(default)]
    pub fallbacks: Vec<String>,
    pub model: Option<String>,
    pub endpoint: Option<String>,
    pub api_key_env: Option<String>,
    pub local_optimized: Option<bool>,
    pub profile: Option<String>,
    pub triage_chunk_size: Option<usize>,
    pub min_confidence: Option<f64>,
    #[serde(default)]
    pub confidence: HashMap<String, f64>,
}

#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct AdvisoryFileConfig {
    pub enabled: Option<bool>,
    pub source: Option<String>,
    pub endpoint: Option<String>,
    #[serde(default)]
    pub ecosystems: Vec<String>,
    pub min_severity: Option<String>,
    pub max_repos_per_advisory: Option<usize>,
}

#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    pub db_path: Option<String>,
    #[serde(default)]
    pub scan_targets: Vec<String>,
    pub workers: Option<usize>,
    #[serde(default)]
    pub scanners: Vec<String>,
    pub parallel_scanners: Option<bool>,
    pub scanner_timeout: Option<u64>,
    pub scanner_bin_dir: Option<String>,
    #[serde(default)]
    pub watchlist: Vec<String>,
    pub mode: Option<String>,
    pub force_scan: Option<bool>,
    pub force_retry: Option<bool>,
    pub max_fix_attempts: Option<u32>,
    pub scratch_dir: Option<String>,
    #[serde(default)]
    pub providers: HashMap<String, ProviderFileConfig>,
    #[serde(default)]
    pub ai: AiFileConfig,
    #[serde(default)]
    pub advisory: AdvisoryFileConfig,
}

/// Which discovery targets a sweep consults, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanTarget {
    OwnRepos,
    Watchlist,
    CveSearch,
    AllAccessible,
    AdvisoryFeed,
}

impl ScanTarget {
    pub fn parse(s: &str) -> Option<ScanTarget> {
        match s.trim() {
            "own_repos" => Some(ScanTarget::OwnRepos),
            "watchlist" => Some(ScanTarget::Watchlist),
            "cve_search" => Some(ScanTarget::CveSearch),
            "all_accessible" => Some(ScanTarget::AllAccessible),
            "advisory_feed" => Some(ScanTarget::AdvisoryFeed),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ScanTarget::OwnRepos => "own_repos",
            ScanTarget::Watchlist => "watchlist",
            ScanTarget::CveSearch => "cve_search",
            ScanTarget::AllAccessible => "all_accessible",
            ScanTarget::AdvisoryFeed => "advisory_feed",
        }
    }
}

/// Agent mode: `triage` queues fixes as pending and opens draft PRs, `auto`
/// approves fixes immediately and opens ready PRs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AgentMode {
    #[default]
    Triage,
    Auto,
}

impl AgentMode {
    pub fn parse(s: &str) -> Option<AgentMode> {
        match s {
            "triage" => Some(AgentMode::Triage),
            "auto" => Some(AgentMode::Auto),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AgentMode::Triage => "triage",
            AgentMode::Auto => "auto",
        }
    }
}

/// A specific repo named in the watchlist or a trigger override.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoSelector {
    pub provider: String,
    pub host: String,
    pub owner: String,
    pub name: String,
}

impl RepoSelector {
    /// Parse `owner/name` or `provider:owner/name`.
    pub fn parse(s: &str) -> Result<RepoSelector> {
        let (provider, rest) = match s.split_once(':') {
            Some((p, rest)) => (p.to_string(), rest),
            None => ("github".to_string(), s),
        };
        let (owner, name) = rest.split_once('/').ok_or_else(|| {
            Error::ConfigValidation(format!(
                "invalid repo selector: {s} (expected owner/name or provider:owner/name)"
            ))
        })?;
        if owner.is_empty() || name.is_empty() {
            return Err(Error::ConfigValidation(format!("invalid repo selector: {s}")));
        }
        Ok(RepoSelector {
            provider,
            host: String::new(),
            owner: owner.to_string(),
            name: name.to_string(),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProviderConfig {
    pub name: String,
    pub token: String,
    pub api_base: String,
    pub organization: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AiConfig {
    pub provider: String,
    pub fallbacks: Vec<String>,
    pub model: Option<String>,
    pub endpoint: Option<String>,
    pub api_key_env: Option<String>,
    pub local_optimized: bool,
    pub profile: Option<String>,
    pub triage_chunk_size: Option<usize>,
    pub min_confidence: Option<f64>,
    pub confidence: HashMap<String, f64>,
}

impl AiConfig {
    /// Minimum confidence to accept a generated patch for a finding of the
    /// given severity. Per-severity override wins over the global override
    /// wins over the built-in defaults.
    pub fn confidence_threshold(&self, severity: Severity) -> f64 {
        let key = severity.label().to_lowercase();
        if let Some(v) = self.confidence.get(&key) {
            return *v;
        }
        if let Some(v) = self.min_confidence {
            return v;
        }
        match severity {
            Severity::Critical => 0.6,
            Severity::High => 0.4,
            Severity::Low => 0.1,
            _ => 0.2,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AdvisoryConfig {
    pub enabled: bool,
    pub source: String,
    pub endpoint: String,
    pub ecosystems: Vec<String>,
    pub min_severity: Severity,
    pub max_repos_per_advisory: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub db_path: PathBuf,
    pub scan_targets: Vec<ScanTarget>,
    pub workers: usize,
    pub scanners: Vec<String>,
    pub parallel_scanners: bool,
    pub scanner_timeout: u64,
    pub scanner_bin_dir: Option<PathBuf>,
    pub watchlist: Vec<RepoSelector>,
    pub mode: AgentMode,
    pub force_scan: bool,
    pub force_retry: bool,
    pub max_fix_attempts: u32,
    pub scratch_dir: PathBuf,
    pub once: bool,
    pub continuous: bool,
    pub dry_run: bool,
    pub selected_repos: Vec<RepoSelector>,
    pub providers: Vec<ProviderConfig>,
    pub ai: AiConfig,
    pub advisory: AdvisoryConfig,
}

impl Config {
    pub fn load(cli: &Cli) -> Result<Self> {
        Self::load_from(cli, Path::new("."))
    }

    pub fn load_from(cli: &Cli, project_dir: &Path) -> Result<Self> {
        let file_config = match &cli.config {
            Some(explicit_path) => {
                let path = Path::new(explicit_path);
                if !path.exists() {
                    return Err(Error::ConfigNotFound(path.to_path_buf()));
                }
                let content = std::fs::read_to_string(path)?;
                parse_config(&content)?
            }
            None => {
                let path = project_dir.join(DEFAULT_CONFIG_FILE);
                if path.exists() {
                    let content = std::fs::read_to_string(&path)?;
                    parse_config(&content)?
                } else {
                    ConfigFile::default()
                }
            }
        };

        merge(file_config, cli)
    }
}

pub fn parse_config(content: &str) -> Result<ConfigFile> {
    let config: ConfigFile = toml::from_str(content)?;
    Ok(config)
}

fn resolve_token(name: &str, file: &ProviderFileConfig) -> Result<String> {
    if let Some(token) = &file.token {
        return Ok(token.clone());
    }
    let env_name = file
        .token_env
        .clone()
        .unwrap_or_else(|| format!("{}_TOKEN", name.to_uppercase()));
    std::env::var(&env_name).map_err(|_| {
        Error::ConfigValidation(format!("provider {name}: token not found in ${env_name}"))
    })
}

fn default_api_base(name: &str) -> &'static str {
    match name {
        "gitlab" => "https://gitlab.com/api/v4",
        "azure" => "https://dev.azure.com",
        _ => "https://api.github.com",
    }
}

pub fn merge(file: ConfigFile, cli: &Cli) -> Result<Config> {
    let scan_targets_raw: Vec<String> = match &cli.scan_targets {
        Some(csv) => csv.split(',').map(|s| s.trim().to_string()).collect(),
        None if !file.scan_targets.is_empty() => file.scan_targets.clone(),
        None => vec!["own_repos".to_string()],
    };
    let mut scan_targets = Vec::new();
    for raw in &scan_targets_raw {
        let target = ScanTarget::parse(raw).ok_or_else(|| {
            Error::ConfigValidation(format!(
                "unknown scan target: {raw} (expected: own_repos, watchlist, cve_search, all_accessible, advisory_feed)"
            ))
        })?;
        scan_targets.push(target);
    }

    let mut watchlist = Vec::new();
    for raw in &file.watchlist {
        watchlist.push(RepoSelector::parse(raw)?);
    }
    let mut selected_repos = Vec::new();
    for raw in &cli.repos {
        selected_repos.push(RepoSelector::parse(raw)?);
    }

    let mode = match (cli.auto_pr, file.mode.as_deref()) {
        (true, _) => AgentMode::Auto,
        (false, Some(raw)) => AgentMode::parse(raw).ok_or_else(|| {
            Error::ConfigValidation(format!("unknown mode: {raw} (expected: triage, auto)"))
        })?,
        (false, None) => AgentMode::Triage,
    };

    let mut providers = Vec::new();
    for (name, pf) in &file.providers {
        match name.as_str() {
            "github" | "gitlab" | "azure" => {}
            other => {
                return Err(Error::ConfigValidation(format!(
                    "unknown provider: {other} (expected: github, gitlab, azure)"
                )));
            }
        }
        providers.push(ProviderConfig {
            name: name.clone(),
            token: resolve_token(name, pf)?,
            api_base: pf
                .api_base
                .clone()
                .unwrap_or_else(|| default_api_base(name).to_string()),
            organization: pf.organization.clone(),
        });
    }
    providers.sort_by(|a, b| a.name.cmp(&b.name));

    let ai_provider = cli
        .ai_provider
        .clone()
        .or(file.ai.provider.clone())
        .unwrap_or_else(|| "noop".to_string());

    let advisory_min_severity = match file.advisory.min_severity.as_deref() {
        Some(raw) => match raw {
            "low" | "medium" | "high" | "critical" => Severity::parse(raw),
            other => {
                return Err(Error::ConfigValidation(format!(
                    "unknown advisory min_severity: {other} (expected: low, medium, high, critical)"
                )));
            }
        },
        None => Severity::Low,
    };

    let config = Config {
        db_path: PathBuf::from(
            cli.db_path
                .clone()
                .or(file.db_path)
                .unwrap_or_else(|| ".ctrlscan/ctrlscan.db".to_string()),
        ),
        scan_targets,
        workers: cli.workers.or(file.workers).unwrap_or(3),
        scanners: if file.scanners.is_empty() {
            KNOWN_SCANNERS.iter().map(|s| s.to_string()).collect()
        } else {
            file.scanners
        },
        parallel_scanners: file.parallel_scanners.unwrap_or(true),
        scanner_timeout: file.scanner_timeout.unwrap_or(30),
        scanner_bin_dir: file.scanner_bin_dir.map(PathBuf::from),
        watchlist,
        mode,
        force_scan: cli.force_scan || file.force_scan.unwrap_or(false),
        force_retry: file.force_retry.unwrap_or(false),
        max_fix_attempts: file.max_fix_attempts.unwrap_or(20),
        scratch_dir: PathBuf::from(
            cli.scratch_dir
                .clone()
                .or(file.scratch_dir)
                .unwrap_or_else(|| std::env::temp_dir().join("ctrlscan").display().to_string()),
        ),
        once: cli.once,
        continuous: cli.continuous,
        dry_run: cli.dry_run,
        selected_repos,
        providers,
        ai: AiConfig {
            provider: ai_provider,
            fallbacks: file.ai.fallbacks,
            model: file.ai.model,
            endpoint: file.ai.endpoint,
            api_key_env: file.ai.api_key_env,
            local_optimized: file.ai.local_optimized.unwrap_or(false),
            profile: file.ai.profile,
            triage_chunk_size: file.ai.triage_chunk_size,
            min_confidence: file.ai.min_confidence,
            confidence: file.ai.confidence,
        },
        advisory: AdvisoryConfig {
            enabled: file.advisory.enabled.unwrap_or(false),
            source: file.advisory.source.unwrap_or_else(|| "osv".to_string()),
            endpoint: file
                .advisory
                .endpoint
                .unwrap_or_else(|| "https://api.osv.dev".to_string()),
            ecosystems: file.advisory.ecosystems,
            min_severity: advisory_min_severity,
            max_repos_per_advisory: file.advisory.max_repos_per_advisory.unwrap_or(20),
        },
    };
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.workers == 0 {
        return Err(Error::ConfigValidation("workers must be > 0".to_string()));
    }
    for scanner in &config.scanners {
        if !KNOWN_SCANNERS.contains(&scanner.as_str()) {
            return Err(Error::ConfigValidation(format!(
                "unknown scanner: {scanner} (expected: {})",
                KNOWN_SCANNERS.join(", ")
            )));
        }
    }
    let all_ai = std::iter::once(&config.ai.provider).chain(config.ai.fallbacks.iter());
    for name in all_ai {
        if !KNOWN_AI_PROVIDERS.contains(&name.as_str()) {
            return Err(Error::ConfigValidation(format!(
                "unknown ai provider: {name} (expected: {})",
                KNOWN_AI_PROVIDERS.join(", ")
            )));
        }
    }
    for (key, value) in &config.ai.confidence {
        if Severity::parse(key) == Severity::Unknown && key != "unknown" {
            return Err(Error::ConfigValidation(format!(
                "unknown severity in ai.confidence: {key}"
            )));
        }
        if !(0.0..=1.0).contains(value) {
            return Err(Error::ConfigValidation(format!(
                "ai.confidence.{key} must be within [0, 1]"
            )));
        }
    }
    if let Some(v) = config.ai.min_confidence
        && !(0.0..=1.0).contains(&v)
    {
        return Err(Error::ConfigValidation(
            "ai.min_confidence must be within [0, 1]".to_string(),
        ));
    }
    if config.advisory.max_repos_per_advisory == 0 {
        return Err(Error::ConfigValidation(
            "advisory.max_repos_per_advisory must be > 0".to_string(),
        ));
    }
    Ok(())
}
