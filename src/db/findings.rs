use sqlx::FromRow;

use crate::error::Result;
use crate::findings::{Finding, FindingKind};
use crate::severity::Severity;

use super::Db;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FindingStatus {
    Open,
    Fixed,
    Ignored,
    PrOpen,
    PrMerged,
}

impl FindingStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            FindingStatus::Open => "open",
            FindingStatus::Fixed => "fixed",
            FindingStatus::Ignored => "ignored",
            FindingStatus::PrOpen => "pr_open",
            FindingStatus::PrMerged => "pr_merged",
        }
    }
}

#[derive(Debug, Clone, FromRow)]
struct FindingRow {
    finding_ref: String,
    kind: String,
    scanner: String,
    severity: String,
    title: String,
    message: String,
    file_path: String,
    line: i64,
    package_name: String,
    package_version: String,
    fix_hint: String,
}

impl FindingRow {
    fn into_finding(self) -> Option<Finding> {
        let kind = FindingKind::parse(&self.kind)?;
        Some(Finding {
            id: self.finding_ref,
            kind,
            scanner: self.scanner,
            severity: Severity::parse(&self.severity),
            title: self.title,
            message: self.message,
            file_path: self.file_path,
            line: self.line,
            package: self.package_name,
            package_version: self.package_version,
            fix_version: self.fix_hint,
        })
    }
}

impl Db {
    pub async fn insert_findings(&self, scan_job_id: i64, findings: &[Finding]) -> Result<()> {
        for f in findings {
            sqlx::query(
                "INSERT INTO scan_job_findings
                    (scan_job_id, finding_ref, kind, scanner, severity, title, message,
                     file_path, line, package_name, package_version, fix_hint, status)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 'open')",
            )
            .bind(scan_job_id)
            .bind(&f.id)
            .bind(f.kind.as_str())
            .bind(&f.scanner)
            .bind(f.severity.label())
            .bind(&f.title)
            .bind(&f.message)
            .bind(&f.file_path)
            .bind(f.line)
            .bind(&f.package)
            .bind(&f.package_version)
            .bind(&f.fix_version)
            .execute(self.pool())
            .await?;
        }
        Ok(())
    }

    /// Open findings from the unified table.
    pub async fn load_open_findings(&self, scan_job_id: i64) -> Result<Vec<Finding>> {
        let rows = sqlx::query_as::<_, FindingRow>(
            "SELECT finding_ref, kind, scanner, severity, title, message, file_path, line,
                    package_name, package_version, fix_hint
             FROM scan_job_findings WHERE scan_job_id = ? AND status = 'open'
             ORDER BY id",
        )
        .bind(scan_job_id)
        .fetch_all(self.pool())
        .await?;
        Ok(rows.into_iter().filter_map(FindingRow::into_finding).collect())
    }

    /// Fallback source: the legacy per-kind tables. Rows there predate the
    /// unified table and carry no finding_ref, so one is derived.
    pub async fn load_legacy_findings(&self, scan_job_id: i64) -> Result<Vec<Finding>> {
        let mut out = Vec::new();

        let sca: Vec<(String, String, String, String, String, String, String, String)> =
            sqlx::query_as(
                "SELECT scanner, severity, title, message, file_path,
                        package_name, package_version, fix_version
                 FROM sca_vulns WHERE scan_job_id = ? AND status = 'open' ORDER BY id",
            )
            .bind(scan_job_id)
            .fetch_all(self.pool())
            .await?;
        for (scanner, severity, title, message, file_path, package, version, fix) in sca {
            let id = Finding::make_id(FindingKind::Sca, &scanner, &title, &file_path, 0, &package);
            out.push(Finding {
                id,
                kind: FindingKind::Sca,
                scanner,
                severity: Severity::parse(&severity),
                title,
                message,
                file_path,
                line: 0,
                package,
                package_version: version,
                fix_version: fix,
            });
        }

        for (table, kind) in [
            ("sast_findings", FindingKind::Sast),
            ("secrets_findings", FindingKind::Secrets),
            ("iac_findings", FindingKind::Iac),
        ] {
            let rows: Vec<(String, String, String, String, String, i64)> = sqlx::query_as(&format!(
                "SELECT scanner, severity, title, message, file_path, line
                 FROM {table} WHERE scan_job_id = ? AND status = 'open' ORDER BY id"
            ))
            .bind(scan_job_id)
            .fetch_all(self.pool())
            .await?;
            for (scanner, severity, title, message, file_path, line) in rows {
                let id = Finding::make_id(kind, &scanner, &title, &file_path, line, "");
                out.push(Finding {
                    id,
                    kind,
                    scanner,
                    severity: Severity::parse(&severity),
                    title,
                    message,
                    file_path,
                    line,
                    package: String::new(),
                    package_version: String::new(),
                    fix_version: String::new(),
                });
            }
        }

        Ok(out)
    }

    pub async fn set_finding_status(
        &self,
        scan_job_id: i64,
        finding_ref: &str,
        status: FindingStatus,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE scan_job_findings SET status = ? WHERE scan_job_id = ? AND finding_ref = ?",
        )
        .bind(status.as_str())
        .bind(scan_job_id)
        .bind(finding_ref)
        .execute(self.pool())
        .await?;
        Ok(())
    }
}
