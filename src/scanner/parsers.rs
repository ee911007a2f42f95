//! Vendor-schema parsers. Each maps one scanner's JSON output into unified
//! findings, normalizing file paths so the scratch-clone prefix never leaks
//! into the database.

use std::path::Path;

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::findings::{Finding, FindingKind};
use crate::severity::Severity;

use super::Scanner;

/// Strip the scratch-clone prefix, the Docker mount prefix and any leading
/// `./` from a scanner-reported path.
pub fn normalize_scan_path(path: &str, repo_prefix: &Path) -> String {
    let prefix = repo_prefix.display().to_string();
    let mut p = path;
    if let Some(rest) = p.strip_prefix(&prefix) {
        p = rest;
    }
    for lead in ["/scan/", "/scan", "./", "/"] {
        if let Some(rest) = p.strip_prefix(lead) {
            p = rest;
        }
    }
    p.to_string()
}

fn truncate(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

// ---------------------------------------------------------------------------
// trivy (sca)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct TrivyReport {
    #[serde(rename = "Results", default)]
    results: Vec<TrivyResult>,
}

#[derive(Debug, Deserialize)]
struct TrivyResult {
    #[serde(rename = "Target", default)]
    target: String,
    #[serde(rename = "Vulnerabilities", default)]
    vulnerabilities: Vec<TrivyVuln>,
}

#[derive(Debug, Deserialize)]
struct TrivyVuln {
    #[serde(rename = "VulnerabilityID", default)]
    id: String,
    #[serde(rename = "PkgName", default)]
    pkg_name: String,
    #[serde(rename = "InstalledVersion", default)]
    installed_version: String,
    #[serde(rename = "FixedVersion", default)]
    fixed_version: String,
    #[serde(rename = "Severity", default)]
    severity: String,
    #[serde(rename = "Title", default)]
    title: String,
    #[serde(rename = "Description", default)]
    description: String,
}

pub struct Trivy;

impl Scanner for Trivy {
    fn name(&self) -> &'static str {
        "trivy"
    }

    fn kind(&self) -> FindingKind {
        FindingKind::Sca
    }

    fn docker_image(&self) -> &'static str {
        "aquasec/trivy:latest"
    }

    fn command_args(&self, target: &str) -> Vec<String> {
        vec![
            "fs".to_string(),
            "--format".to_string(),
            "json".to_string(),
            "--quiet".to_string(),
            target.to_string(),
        ]
    }

    fn parse(&self, raw: &[u8], repo_prefix: &Path) -> Result<Vec<Finding>> {
        if raw.is_empty() {
            return Ok(Vec::new());
        }
        let report: TrivyReport = serde_json::from_slice(raw)
            .map_err(|e| Error::Scanner(format!("trivy json: {e}")))?;

        let mut findings = Vec::new();
        for result in report.results {
            let file_path = normalize_scan_path(&result.target, repo_prefix);
            for vuln in result.vulnerabilities {
                let title = if vuln.title.is_empty() {
                    vuln.id.clone()
                } else {
                    format!("{}: {}", vuln.id, vuln.title)
                };
                let id = Finding::make_id(
                    FindingKind::Sca,
                    self.name(),
                    &title,
                    &file_path,
                    0,
                    &vuln.pkg_name,
                );
                findings.push(Finding {
                    id,
                    kind: FindingKind::Sca,
                    scanner: self.name().to_string(),
                    severity: Severity::parse(&vuln.severity),
                    title,
                    message: truncate(&vuln.description, 2000),
                    file_path: file_path.clone(),
                    line: 0,
                    package: vuln.pkg_name,
                    package_version: vuln.installed_version,
                    fix_version: vuln.fixed_version,
                });
            }
        }
        Ok(findings)
    }
}

// ---------------------------------------------------------------------------
// semgrep (sast)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct SemgrepReport {
    #[serde(default)]
    results: Vec<SemgrepResult>,
}

#[derive(Debug, Deserialize)]
struct SemgrepResult {
    check_id: String,
    path: String,
    start: SemgrepPosition,
    extra: SemgrepExtra,
}

#[derive(Debug, Deserialize)]
struct SemgrepPosition {
    line: i64,
}

#[derive(Debug, Deserialize)]
struct SemgrepExtra {
    #[serde(default)]
    severity: String,
    #[serde(default)]
    message: String,
}

pub struct Semgrep;

impl Scanner for Semgrep {
    fn name(&self) -> &'static str {
        "semgrep"
    }

    fn kind(&self) -> FindingKind {
        FindingKind::Sast
    }

    fn docker_image(&self) -> &'static str {
        "semgrep/semgrep:latest"
    }

    fn command_args(&self, target: &str) -> Vec<String> {
        vec![
            "scan".to_string(),
            "--json".to_string(),
            "--quiet".to_string(),
            "--config".to_string(),
            "auto".to_string(),
            target.to_string(),
        ]
    }

    fn ignorable_exit(&self, code: i32) -> bool {
        // 0 = clean, 1 = findings present
        code == 0 || code == 1
    }

    fn parse(&self, raw: &[u8], repo_prefix: &Path) -> Result<Vec<Finding>> {
        if raw.is_empty() {
            return Ok(Vec::new());
        }
        let report: SemgrepReport = serde_json::from_slice(raw)
            .map_err(|e| Error::Scanner(format!("semgrep json: {e}")))?;

        Ok(report
            .results
            .into_iter()
            .map(|r| {
                let file_path = normalize_scan_path(&r.path, repo_prefix);
                let title = r
                    .check_id
                    .rsplit('.')
                    .next()
                    .unwrap_or(&r.check_id)
                    .to_string();
                let id = Finding::make_id(
                    FindingKind::Sast,
                    self.name(),
                    &title,
                    &file_path,
                    r.start.line,
                    "",
                );
                Finding {
                    id,
                    kind: FindingKind::Sast,
                    scanner: self.name().to_string(),
                    severity: Severity::parse(&r.extra.severity),
                    title,
                    message: truncate(&r.extra.message, 2000),
                    file_path,
                    line: r.start.line,
                    package: String::new(),
                    package_version: String::new(),
                    fix_version: String::new(),
                }
            })
            .collect())
    }
}

// ---------------------------------------------------------------------------
// gitleaks (secrets)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct GitleaksFinding {
    #[serde(default)]
    description: String,
    #[serde(default)]
    file: String,
    #[serde(default)]
    start_line: i64,
    #[serde(rename = "RuleID", default)]
    rule_id: String,
}

pub struct Gitleaks;

impl Scanner for Gitleaks {
    fn name(&self) -> &'static str {
        "gitleaks"
    }

    fn kind(&self) -> FindingKind {
        FindingKind::Secrets
    }

    fn docker_image(&self) -> &'static str {
        "zricethezav/gitleaks:latest"
    }

    fn command_args(&self, target: &str) -> Vec<String> {
        vec![
            "detect".to_string(),
            "--source".to_string(),
            target.to_string(),
            "--no-banner".to_string(),
            "--report-format".to_string(),
            "json".to_string(),
            "--report-path".to_string(),
            "/dev/stdout".to_string(),
        ]
    }

    fn ignorable_exit(&self, code: i32) -> bool {
        // gitleaks exits 1 when leaks are found
        code == 0 || code == 1
    }

    fn parse(&self, raw: &[u8], repo_prefix: &Path) -> Result<Vec<Finding>> {
        if raw.is_empty() {
            return Ok(Vec::new());
        }
        let report: Vec<GitleaksFinding> = serde_json::from_slice(raw)
            .map_err(|e| Error::Scanner(format!("gitleaks json: {e}")))?;

        Ok(report
            .into_iter()
            .map(|f| {
                let file_path = normalize_scan_path(&f.file, repo_prefix);
                let title = if f.rule_id.is_empty() {
                    "hardcoded-secret".to_string()
                } else {
                    f.rule_id
                };
                let id = Finding::make_id(
                    FindingKind::Secrets,
                    self.name(),
                    &title,
                    &file_path,
                    f.start_line,
                    "",
                );
                Finding {
                    id,
                    kind: FindingKind::Secrets,
                    scanner: self.name().to_string(),
                    // gitleaks reports no severity; exposed credentials are
                    // treated as high.
                    severity: Severity::High,
                    title,
                    message: truncate(&f.description, 2000),
                    file_path,
                    line: f.start_line,
                    package: String::new(),
                    package_version: String::new(),
                    fix_version: String::new(),
                }
            })
            .collect())
    }
}

// ---------------------------------------------------------------------------
// checkov (iac)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct CheckovReport {
    #[serde(default)]
    results: CheckovResults,
}

#[derive(Debug, Deserialize, Default)]
struct CheckovResults {
    #[serde(default)]
    failed_checks: Vec<CheckovCheck>,
}

#[derive(Debug, Deserialize)]
struct CheckovCheck {
    #[serde(default)]
    check_id: String,
    #[serde(default)]
    check_name: String,
    #[serde(default)]
    file_path: String,
    #[serde(default)]
    file_line_range: Vec<i64>,
    #[serde(default)]
    severity: Option<String>,
}

pub struct Checkov;

impl Checkov {
    fn check_to_finding(&self, check: CheckovCheck, repo_prefix: &Path) -> Finding {
        let file_path = normalize_scan_path(&check.file_path, repo_prefix);
        let line = check.file_line_range.first().copied().unwrap_or(0);
        let title = if check.check_id.is_empty() {
            "iac-misconfiguration".to_string()
        } else {
            check.check_id
        };
        let severity = match check.severity.as_deref() {
            // Unrated checks land in the middle of the scale.
            None | Some("") => Severity::Medium,
            Some(s) => Severity::parse(s),
        };
        let id = Finding::make_id(FindingKind::Iac, self.name(), &title, &file_path, line, "");
        Finding {
            id,
            kind: FindingKind::Iac,
            scanner: self.name().to_string(),
            severity,
            title,
            message: truncate(&check.check_name, 2000),
            file_path,
            line,
            package: String::new(),
            package_version: String::new(),
            fix_version: String::new(),
        }
    }
}

impl Scanner for Checkov {
    fn name(&self) -> &'static str {
        "checkov"
    }

    fn kind(&self) -> FindingKind {
        FindingKind::Iac
    }

    fn docker_image(&self) -> &'static str {
        "bridgecrew/checkov:latest"
    }

    fn command_args(&self, target: &str) -> Vec<String> {
        vec![
            "-d".to_string(),
            target.to_string(),
            "-o".to_string(),
            "json".to_string(),
            "--quiet".to_string(),
            "--compact".to_string(),
        ]
    }

    fn ignorable_exit(&self, code: i32) -> bool {
        // checkov exits 1 when any check fails
        code == 0 || code == 1
    }

    fn parse(&self, raw: &[u8], repo_prefix: &Path) -> Result<Vec<Finding>> {
        if raw.is_empty() {
            return Ok(Vec::new());
        }
        // One report object for a single framework, an array when several
        // frameworks ran.
        let value: serde_json::Value = serde_json::from_slice(raw)
            .map_err(|e| Error::Scanner(format!("checkov json: {e}")))?;
        let reports: Vec<CheckovReport> = if value.is_array() {
            serde_json::from_value(value).map_err(|e| Error::Scanner(format!("checkov json: {e}")))?
        } else {
            vec![
                serde_json::from_value(value)
                    .map_err(|e| Error::Scanner(format!("checkov json: {e}")))?,
            ]
        };

        let mut findings = Vec::new();
        for report in reports {
            for check in report.results.failed_checks {
                findings.push(self.check_to_finding(check, repo_prefix));
            }
        }
        Ok(findings)
    }
}
