use clap::Parser;

/// ctrlscan — autonomous security remediation agent
#[derive(Parser, Debug)]
#[command(name = "ctrlscan", version, about)]
pub struct Cli {
    /// Run a single sweep then exit
    #[arg(long)]
    pub once: bool,

    /// Run continuously, sweeping on triggers and timers
    #[arg(long, conflicts_with = "once")]
    pub continuous: bool,

    /// Go through the full pipeline without pushing branches or opening PRs
    #[arg(long)]
    pub dry_run: bool,

    /// Path to config file
    #[arg(long)]
    pub config: Option<String>,

    /// Path to the SQLite database
    #[arg(long)]
    pub db_path: Option<String>,

    /// Number of scanner workers
    #[arg(long)]
    pub workers: Option<usize>,

    /// Discovery targets, comma-separated
    /// (own_repos, watchlist, cve_search, all_accessible, advisory_feed)
    #[arg(long)]
    pub scan_targets: Option<String>,

    /// Scan only these repos, e.g. `--repo owner/name` (repeatable)
    #[arg(long = "repo")]
    pub repos: Vec<String>,

    /// Ignore the 24h freshness skip and rescan everything
    #[arg(long)]
    pub force_scan: bool,

    /// Auto-approve generated fixes for PR creation (agent mode "auto")
    #[arg(long)]
    pub auto_pr: bool,

    /// AI provider to use (openai, anthropic, ollama, zai, local, noop)
    #[arg(long)]
    pub ai_provider: Option<String>,

    /// Scratch directory for shallow clones
    #[arg(long)]
    pub scratch_dir: Option<String>,
}
