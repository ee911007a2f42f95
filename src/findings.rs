use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

use crate::severity::Severity;

/// Kind of finding, matching the scanner class that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FindingKind {
    Sca,
    Sast,
    Secrets,
    Iac,
}

impl FindingKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FindingKind::Sca => "sca",
            FindingKind::Sast => "sast",
            FindingKind::Secrets => "secrets",
            FindingKind::Iac => "iac",
        }
    }

    pub fn parse(s: &str) -> Option<FindingKind> {
        match s {
            "sca" => Some(FindingKind::Sca),
            "sast" => Some(FindingKind::Sast),
            "secrets" => Some(FindingKind::Secrets),
            "iac" => Some(FindingKind::Iac),
            _ => None,
        }
    }

    /// Kind bonus added on top of the severity weight when ranking without
    /// model triage. Code-level findings outrank dependency and secret hits.
    fn bonus(self) -> i64 {
        match self {
            FindingKind::Sast | FindingKind::Iac => 30,
            FindingKind::Sca => 10,
            FindingKind::Secrets => 5,
        }
    }
}

impl fmt::Display for FindingKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A unified finding as produced by the scanner parsers.
///
/// `id` is a stable content-derived reference: the same finding parsed from
/// two runs of the same scanner yields the same id, which is what lets the
/// fixer skip findings that already have a fix-queue row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    pub id: String,
    pub kind: FindingKind,
    pub scanner: String,
    pub severity: Severity,
    pub title: String,
    pub message: String,
    pub file_path: String,
    /// 1-based line number; 0 when the scanner did not report one.
    pub line: i64,
    pub package: String,
    pub package_version: String,
    /// Version that resolves the finding, when the scanner knows one (SCA).
    pub fix_version: String,
}

impl Finding {
    /// Compute the stable finding reference from identity fields.
    pub fn make_id(
        kind: FindingKind,
        scanner: &str,
        title: &str,
        file_path: &str,
        line: i64,
        package: &str,
    ) -> String {
        let mut hasher = Sha1::new();
        hasher.update(scanner.as_bytes());
        hasher.update(b"\0");
        hasher.update(title.as_bytes());
        hasher.update(b"\0");
        hasher.update(file_path.as_bytes());
        hasher.update(b"\0");
        hasher.update(line.to_string().as_bytes());
        hasher.update(b"\0");
        hasher.update(package.as_bytes());
        let digest = hasher.finalize();
        format!("{}-{}", kind.as_str(), &hex::encode(digest)[..12])
    }

    /// Weight used for local (non-model) prioritization.
    pub fn fallback_weight(&self) -> i64 {
        self.severity.weight() * 100 + self.kind.bonus()
    }

    /// A finding is actionable for fix generation when it names a file, or is
    /// an SCA entry that carries both a package and a fix version.
    pub fn is_actionable(&self) -> bool {
        if !self.file_path.is_empty() {
            return true;
        }
        self.kind == FindingKind::Sca && !self.package.is_empty() && !self.fix_version.is_empty()
    }
}

/// Path substrings that never produce a useful fix: third-party trees and
/// build output.
const SKIP_PATH_SUBSTRINGS: &[&str] = &[
    "node_modules/",
    "vendor/",
    ".git/",
    "dist/",
    "build/",
    "coverage/",
];

/// Additional substrings dropped for secrets findings only. Secrets reported
/// in tests and fixtures are overwhelmingly placeholders.
const SECRETS_SKIP_SUBSTRINGS: &[&str] = &["test", "fixture", "example", "readme", "_test."];

/// Apply the fix-eligibility pre-filters.
///
/// `ignore_rules` are the enabled substrings from `finding_path_ignore_rules`,
/// applied in addition to the built-in skip list.
pub fn prefilter(findings: Vec<Finding>, ignore_rules: &[String]) -> Vec<Finding> {
    findings
        .into_iter()
        .filter(|f| {
            if !f.is_actionable() {
                return false;
            }
            let path = f.file_path.to_lowercase();
            if SKIP_PATH_SUBSTRINGS.iter().any(|s| path.contains(s)) {
                return false;
            }
            if ignore_rules.iter().any(|s| path.contains(&s.to_lowercase())) {
                return false;
            }
            if f.kind == FindingKind::Secrets
                && SECRETS_SKIP_SUBSTRINGS.iter().any(|s| path.contains(s))
            {
                return false;
            }
            true
        })
        .collect()
}

fn normalized_path(path: &str) -> String {
    path.trim_start_matches("./").to_string()
}

fn dedupe_key(f: &Finding) -> (String, String, String, String, String, i64) {
    (
        f.kind.as_str().to_string(),
        f.scanner.clone(),
        f.title.clone(),
        normalized_path(&f.file_path),
        f.package.clone(),
        if f.line > 0 { f.line } else { 0 },
    )
}

/// Collapse duplicate findings.
///
/// Grouped by `(kind, scanner, title, normalized path, package, line>0)`;
/// the representative is the one with the higher fallback weight, tie-broken
/// by the longer message. The result is sorted stably by weight descending,
/// id ascending, which makes `dedupe` idempotent.
pub fn dedupe(findings: Vec<Finding>) -> Vec<Finding> {
    let mut by_key: HashMap<(String, String, String, String, String, i64), Finding> =
        HashMap::new();

    for f in findings {
        let key = dedupe_key(&f);
        match by_key.get(&key) {
            Some(existing) => {
                let replace = f.fallback_weight() > existing.fallback_weight()
                    || (f.fallback_weight() == existing.fallback_weight()
                        && f.message.len() > existing.message.len());
                if replace {
                    by_key.insert(key, f);
                }
            }
            None => {
                by_key.insert(key, f);
            }
        }
    }

    let mut out: Vec<Finding> = by_key.into_values().collect();
    out.sort_by(|a, b| {
        b.fallback_weight()
            .cmp(&a.fallback_weight())
            .then_with(|| a.id.cmp(&b.id))
    });
    out
}

#[cfg(test)]
pub(crate) fn test_finding(kind: FindingKind, severity: Severity, path: &str) -> Finding {
    let id = Finding::make_id(kind, "test-scanner", "finding", path, 0, "");
    Finding {
        id,
        kind,
        scanner: "test-scanner".to_string(),
        severity,
        title: "finding".to_string(),
        message: "a test finding".to_string(),
        file_path: path.to_string(),
        line: 0,
        package: String::new(),
        package_version: String::new(),
        fix_version: String::new(),
    }
}
