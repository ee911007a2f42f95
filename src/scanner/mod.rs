pub mod parsers;

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::findings::{Finding, FindingKind};
use crate::process::{ProcessConfig, ensure_allowed, spawn_and_collect};
use crate::severity::SeverityCounts;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScannerStatus {
    Completed,
    Failed,
    Skipped,
}

impl ScannerStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ScannerStatus::Completed => "completed",
            ScannerStatus::Failed => "failed",
            ScannerStatus::Skipped => "skipped",
        }
    }
}

/// Result of one scanner run against one clone.
#[derive(Debug)]
pub struct ScanOutcome {
    pub scanner: &'static str,
    pub status: ScannerStatus,
    pub counts: SeverityCounts,
    pub raw: Vec<u8>,
    pub error: Option<String>,
    pub duration_ms: i64,
    pub findings: Vec<Finding>,
}

impl ScanOutcome {
    fn skipped(scanner: &'static str, reason: &str) -> Self {
        Self {
            scanner,
            status: ScannerStatus::Skipped,
            counts: SeverityCounts::default(),
            raw: Vec::new(),
            error: Some(reason.to_string()),
            duration_ms: 0,
            findings: Vec::new(),
        }
    }

    fn failed(scanner: &'static str, error: String, duration_ms: i64) -> Self {
        Self {
            scanner,
            status: ScannerStatus::Failed,
            counts: SeverityCounts::default(),
            raw: Vec::new(),
            error: Some(error),
            duration_ms,
            findings: Vec::new(),
        }
    }
}

/// One external scanner. The runner handles invocation (local binary or
/// Docker image with the clone mounted read-only at /scan); the scanner
/// describes itself and parses its own vendor schema.
pub trait Scanner: Send + Sync {
    fn name(&self) -> &'static str;
    fn kind(&self) -> FindingKind;
    fn docker_image(&self) -> &'static str;
    /// Arguments for scanning `target` (`.` locally, `/scan` under Docker).
    fn command_args(&self, target: &str) -> Vec<String>;
    /// Exit codes that signal "findings found" rather than failure.
    fn ignorable_exit(&self, code: i32) -> bool {
        code == 0
    }
    /// Parse raw stdout into unified findings, stripping `repo_prefix` from
    /// reported paths.
    fn parse(&self, raw: &[u8], repo_prefix: &Path) -> Result<Vec<Finding>>;
}

pub fn scanner_by_name(name: &str) -> Option<Box<dyn Scanner>> {
    match name {
        "trivy" => Some(Box::new(parsers::Trivy)),
        "semgrep" => Some(Box::new(parsers::Semgrep)),
        "gitleaks" => Some(Box::new(parsers::Gitleaks)),
        "checkov" => Some(Box::new(parsers::Checkov)),
        _ => None,
    }
}

/// Locate a scanner binary in `bin_dir` or on PATH.
pub fn find_binary(name: &str, bin_dir: Option<&Path>) -> Option<PathBuf> {
    if let Some(dir) = bin_dir {
        let candidate = dir.join(name);
        if candidate.is_file() {
            return Some(candidate);
        }
    }
    let path = std::env::var_os("PATH")?;
    for dir in std::env::split_paths(&path) {
        let candidate = dir.join(name);
        if candidate.is_file() {
            return Some(candidate);
        }
    }
    None
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub parallel: bool,
    pub timeout: Duration,
    pub bin_dir: Option<PathBuf>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            parallel: true,
            timeout: Duration::from_secs(30),
            bin_dir: None,
        }
    }
}

/// Aggregate status for a scan job derived from its scanners' outcomes.
pub fn job_status(outcomes: &[ScanOutcome]) -> &'static str {
    let completed = outcomes
        .iter()
        .filter(|o| o.status == ScannerStatus::Completed)
        .count();
    let failed = outcomes
        .iter()
        .filter(|o| o.status == ScannerStatus::Failed)
        .count();
    if failed == 0 {
        "completed"
    } else if completed > 0 {
        "partial"
    } else {
        "failed"
    }
}

/// Run the configured scanners against a clone.
pub async fn run_scanners(
    scanner_names: &[String],
    repo_path: &Path,
    opts: &RunOptions,
    cancel: &CancellationToken,
) -> Result<Vec<ScanOutcome>> {
    let mut outcomes = Vec::new();

    if opts.parallel {
        let mut handles = Vec::new();
        for name in scanner_names {
            let name = name.clone();
            let repo = repo_path.to_path_buf();
            let opts = opts.clone();
            let cancel = cancel.clone();
            handles.push(tokio::spawn(async move {
                run_one_by_name(&name, &repo, &opts, &cancel).await
            }));
        }
        for handle in handles {
            let outcome = handle
                .await
                .map_err(|e| Error::Scanner(format!("scanner task panicked: {e}")))??;
            outcomes.push(outcome);
        }
    } else {
        for name in scanner_names {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            outcomes.push(run_one_by_name(name, repo_path, opts, cancel).await?);
        }
    }

    Ok(outcomes)
}

async fn run_one_by_name(
    name: &str,
    repo_path: &Path,
    opts: &RunOptions,
    cancel: &CancellationToken,
) -> Result<ScanOutcome> {
    let scanner =
        scanner_by_name(name).ok_or_else(|| Error::Scanner(format!("unknown scanner: {name}")))?;
    Ok(run_one(scanner.as_ref(), repo_path, opts, cancel).await)
}

/// Invoke one scanner, preferring the local binary, falling back to Docker.
pub async fn run_one(
    scanner: &dyn Scanner,
    repo_path: &Path,
    opts: &RunOptions,
    cancel: &CancellationToken,
) -> ScanOutcome {
    let name = scanner.name();

    let (command, args) = if let Some(binary) = find_binary(name, opts.bin_dir.as_deref()) {
        (binary.display().to_string(), scanner.command_args("."))
    } else if find_binary("docker", None).is_some() {
        let mut args = vec![
            "run".to_string(),
            "--rm".to_string(),
            "-v".to_string(),
            format!("{}:/scan:ro", repo_path.display()),
            scanner.docker_image().to_string(),
        ];
        args.extend(scanner.command_args("/scan"));
        ("docker".to_string(), args)
    } else {
        warn!(scanner = name, "not available locally or via docker, skipping");
        return ScanOutcome::skipped(name, "scanner not available locally or via docker");
    };

    if let Err(e) = ensure_allowed(&command, &[name.to_string()]) {
        return ScanOutcome::failed(name, e.to_string(), 0);
    }

    let started = Instant::now();
    let config = ProcessConfig {
        command,
        args,
        working_dir: repo_path.to_path_buf(),
        timeout: Some(opts.timeout),
        log_prefix: format!("scanner:{name}"),
        env: Vec::new(),
        log_output: false,
    };

    let output = match spawn_and_collect(config, cancel).await {
        Ok(o) => o,
        Err(Error::Cancelled) => {
            return ScanOutcome::failed(name, "cancelled".to_string(), elapsed_ms(started));
        }
        Err(e) => return ScanOutcome::failed(name, e.to_string(), elapsed_ms(started)),
    };

    let duration_ms = elapsed_ms(started);

    // A non-zero exit with a valid JSON document on stdout means "findings
    // found"; only empty stdout plus a non-ignorable exit is fatal.
    let stdout_is_json = serde_json::from_slice::<serde_json::Value>(output.stdout.as_bytes()).is_ok();
    if !output.success() && !scanner.ignorable_exit(output.exit_code) && !stdout_is_json {
        let detail = if output.stderr.is_empty() {
            format!("exit code {}", output.exit_code)
        } else {
            let snippet: String = output.stderr.chars().take(400).collect();
            format!("exit code {}: {snippet}", output.exit_code)
        };
        return ScanOutcome::failed(name, detail, duration_ms);
    }

    let raw = output.stdout.into_bytes();

    let findings = match scanner.parse(&raw, repo_path) {
        Ok(f) => f,
        Err(e) => {
            return ScanOutcome {
                scanner: name,
                status: ScannerStatus::Failed,
                counts: SeverityCounts::default(),
                raw,
                error: Some(format!("parse error: {e}")),
                duration_ms,
                findings: Vec::new(),
            };
        }
    };

    let mut counts = SeverityCounts::default();
    for f in &findings {
        counts.record(f.severity);
    }

    info!(
        scanner = name,
        findings = findings.len(),
        duration_ms,
        "scanner finished"
    );

    ScanOutcome {
        scanner: name,
        status: ScannerStatus::Completed,
        counts,
        raw,
        error: None,
        duration_ms,
        findings,
    }
}

fn elapsed_ms(started: Instant) -> i64 {
    started.elapsed().as_millis() as i64
}
