mod advisory;
mod findings;
mod fix_queue;
mod remediation;
mod scan_jobs;

pub use advisory::AdvisoryPollState;
pub use findings::FindingStatus;
pub use fix_queue::{FixStatus, FixQueueRow, NewFix};
pub use remediation::{
    CampaignRow, CampaignStatus, ProgressPhase, TaskRow, TaskStatus, TriageStatus,
};
pub use scan_jobs::{NewScanJob, ScanJobRow, ScanJobState, ScannerRunRow};

use std::path::Path;
use std::str::FromStr;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::info;

use crate::error::Result;

/// Logical schema. Executed statement-by-statement at startup; every
/// statement is idempotent.
const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS scan_jobs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        provider TEXT NOT NULL,
        owner TEXT NOT NULL,
        repo TEXT NOT NULL,
        branch TEXT NOT NULL,
        commit_sha TEXT NOT NULL DEFAULT '',
        unique_key TEXT NOT NULL UNIQUE,
        status TEXT NOT NULL DEFAULT 'pending',
        severity_rollup TEXT NOT NULL DEFAULT '',
        error_message TEXT,
        started_at TEXT NOT NULL,
        completed_at TEXT
    )",
    "CREATE INDEX IF NOT EXISTS idx_scan_jobs_repo
        ON scan_jobs (provider, owner, repo, branch)",
    "CREATE TABLE IF NOT EXISTS scan_job_scanners (
        scan_job_id INTEGER NOT NULL,
        scanner TEXT NOT NULL,
        status TEXT NOT NULL,
        duration_ms INTEGER NOT NULL DEFAULT 0,
        error_message TEXT,
        PRIMARY KEY (scan_job_id, scanner)
    )",
    "CREATE TABLE IF NOT EXISTS scan_job_raw_outputs (
        scan_job_id INTEGER NOT NULL,
        scanner TEXT NOT NULL,
        raw BLOB NOT NULL,
        PRIMARY KEY (scan_job_id, scanner)
    )",
    "CREATE TABLE IF NOT EXISTS scan_job_findings (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        scan_job_id INTEGER NOT NULL,
        finding_ref TEXT NOT NULL,
        kind TEXT NOT NULL,
        scanner TEXT NOT NULL,
        severity TEXT NOT NULL,
        title TEXT NOT NULL,
        message TEXT NOT NULL DEFAULT '',
        file_path TEXT NOT NULL DEFAULT '',
        line INTEGER NOT NULL DEFAULT 0,
        package_name TEXT NOT NULL DEFAULT '',
        package_version TEXT NOT NULL DEFAULT '',
        fix_hint TEXT NOT NULL DEFAULT '',
        status TEXT NOT NULL DEFAULT 'open'
    )",
    "CREATE INDEX IF NOT EXISTS idx_findings_job
        ON scan_job_findings (scan_job_id, status)",
    // Legacy per-kind tables, still read as a fallback source.
    "CREATE TABLE IF NOT EXISTS sca_vulns (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        scan_job_id INTEGER NOT NULL,
        scanner TEXT NOT NULL DEFAULT '',
        severity TEXT NOT NULL DEFAULT 'UNKNOWN',
        title TEXT NOT NULL DEFAULT '',
        message TEXT NOT NULL DEFAULT '',
        file_path TEXT NOT NULL DEFAULT '',
        package_name TEXT NOT NULL DEFAULT '',
        package_version TEXT NOT NULL DEFAULT '',
        fix_version TEXT NOT NULL DEFAULT '',
        status TEXT NOT NULL DEFAULT 'open'
    )",
    "CREATE TABLE IF NOT EXISTS sast_findings (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        scan_job_id INTEGER NOT NULL,
        scanner TEXT NOT NULL DEFAULT '',
        severity TEXT NOT NULL DEFAULT 'UNKNOWN',
        title TEXT NOT NULL DEFAULT '',
        message TEXT NOT NULL DEFAULT '',
        file_path TEXT NOT NULL DEFAULT '',
        line INTEGER NOT NULL DEFAULT 0,
        status TEXT NOT NULL DEFAULT 'open'
    )",
    "CREATE TABLE IF NOT EXISTS secrets_findings (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        scan_job_id INTEGER NOT NULL,
        scanner TEXT NOT NULL DEFAULT '',
        severity TEXT NOT NULL DEFAULT 'UNKNOWN',
        title TEXT NOT NULL DEFAULT '',
        message TEXT NOT NULL DEFAULT '',
        file_path TEXT NOT NULL DEFAULT '',
        line INTEGER NOT NULL DEFAULT 0,
        status TEXT NOT NULL DEFAULT 'open'
    )",
    "CREATE TABLE IF NOT EXISTS iac_findings (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        scan_job_id INTEGER NOT NULL,
        scanner TEXT NOT NULL DEFAULT '',
        severity TEXT NOT NULL DEFAULT 'UNKNOWN',
        title TEXT NOT NULL DEFAULT '',
        message TEXT NOT NULL DEFAULT '',
        file_path TEXT NOT NULL DEFAULT '',
        line INTEGER NOT NULL DEFAULT 0,
        status TEXT NOT NULL DEFAULT 'open'
    )",
    "CREATE TABLE IF NOT EXISTS fix_queue (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        scan_job_id INTEGER NOT NULL,
        finding_type TEXT NOT NULL,
        finding_ref TEXT NOT NULL,
        ai_provider TEXT NOT NULL DEFAULT '',
        ai_model TEXT NOT NULL DEFAULT '',
        ai_endpoint TEXT NOT NULL DEFAULT '',
        apply_hints_json TEXT NOT NULL DEFAULT '',
        patch TEXT NOT NULL DEFAULT '',
        pr_title TEXT NOT NULL DEFAULT '',
        pr_body TEXT NOT NULL DEFAULT '',
        status TEXT NOT NULL DEFAULT 'pending',
        pr_number INTEGER,
        pr_url TEXT,
        generated_at TEXT NOT NULL,
        approved_at TEXT
    )",
    "CREATE INDEX IF NOT EXISTS idx_fix_queue_status ON fix_queue (status)",
    // One open attempt per (scan job, finding)
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_fix_queue_open_attempt
        ON fix_queue (scan_job_id, finding_ref)
        WHERE status IN ('pending', 'approved', 'pr_open')",
    "CREATE TABLE IF NOT EXISTS remediation_campaigns (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL DEFAULT '',
        mode TEXT NOT NULL DEFAULT 'triage',
        auto_pr INTEGER NOT NULL DEFAULT 0,
        status TEXT NOT NULL DEFAULT 'running',
        tasks_total INTEGER NOT NULL DEFAULT 0,
        tasks_completed INTEGER NOT NULL DEFAULT 0,
        tasks_failed INTEGER NOT NULL DEFAULT 0,
        fixes_queued INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS remediation_tasks (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        campaign_id INTEGER NOT NULL,
        scan_job_id INTEGER NOT NULL,
        status TEXT NOT NULL DEFAULT 'pending',
        error_message TEXT,
        findings_loaded INTEGER NOT NULL DEFAULT 0,
        deduped_count INTEGER NOT NULL DEFAULT 0,
        triage_status TEXT NOT NULL DEFAULT '',
        triage_batches INTEGER NOT NULL DEFAULT 0,
        triage_summary TEXT NOT NULL DEFAULT '',
        prioritized_json TEXT NOT NULL DEFAULT '',
        progress_phase TEXT NOT NULL DEFAULT 'starting',
        progress_current INTEGER NOT NULL DEFAULT 0,
        progress_total INTEGER NOT NULL DEFAULT 0,
        progress_percent INTEGER NOT NULL DEFAULT 0,
        progress_note TEXT NOT NULL DEFAULT '',
        fix_attempted INTEGER NOT NULL DEFAULT 0,
        fix_queued INTEGER NOT NULL DEFAULT 0,
        fix_skipped_low_conf INTEGER NOT NULL DEFAULT 0,
        fix_failed INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_remediation_tasks_status
        ON remediation_tasks (status)",
    "CREATE TABLE IF NOT EXISTS advisory_poll_state (
        source TEXT PRIMARY KEY,
        cursor TEXT,
        advisories_seen INTEGER NOT NULL DEFAULT 0,
        repos_queued INTEGER NOT NULL DEFAULT 0
    )",
    "CREATE TABLE IF NOT EXISTS finding_path_ignore_rules (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        substring TEXT NOT NULL,
        enabled INTEGER NOT NULL DEFAULT 1
    )",
];

/// Handle to the agent's SQLite database.
#[derive(Clone)]
pub struct Db {
    pool: SqlitePool,
}

impl Db {
    /// Open (creating if needed) the database at `path` and bootstrap the
    /// schema.
    pub async fn connect(path: &Path) -> Result<Db> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        let db = Db { pool };
        db.bootstrap().await?;
        info!(path = %path.display(), "database ready");
        Ok(db)
    }

    /// In-memory database for tests. A single connection keeps the shared
    /// in-memory store alive.
    pub async fn in_memory() -> Result<Db> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(sqlx::Error::from)?;
        // A single pinned connection: the shared in-memory store dies with
        // its last connection.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        let db = Db { pool };
        db.bootstrap().await?;
        Ok(db)
    }

    async fn bootstrap(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Enabled substrings from `finding_path_ignore_rules`.
    pub async fn list_ignore_rules(&self) -> Result<Vec<String>> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT substring FROM finding_path_ignore_rules WHERE enabled = 1")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().map(|(s,)| s).collect())
    }

    /// Insert an ignore rule. Used by operators and tests.
    pub async fn add_ignore_rule(&self, substring: &str) -> Result<()> {
        sqlx::query("INSERT INTO finding_path_ignore_rules (substring, enabled) VALUES (?, 1)")
            .bind(substring)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bootstrap_is_idempotent() {
        let db = Db::in_memory().await.unwrap();
        // Re-running the schema must not fail.
        db.bootstrap().await.unwrap();
    }

    #[tokio::test]
    async fn test_ignore_rules_roundtrip() {
        let db = Db::in_memory().await.unwrap();
        assert!(db.list_ignore_rules().await.unwrap().is_empty());
        db.add_ignore_rule("generated/").await.unwrap();
        db.add_ignore_rule("third_party/").await.unwrap();
        let rules = db.list_ignore_rules().await.unwrap();
        assert_eq!(rules, vec!["generated/", "third_party/"]);
    }
}
