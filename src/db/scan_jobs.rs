use chrono::{DateTime, Duration, Utc};
use sqlx::FromRow;

use crate::error::Result;

use super::Db;

/// Scan-job lifecycle. `Completed`, `Partial`, `Failed` and `Stopped` are
/// terminal and carry `completed_at`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanJobState {
    Pending,
    Running,
    Completed,
    Partial,
    Failed,
    Stopped,
}

impl ScanJobState {
    pub fn as_str(self) -> &'static str {
        match self {
            ScanJobState::Pending => "pending",
            ScanJobState::Running => "running",
            ScanJobState::Completed => "completed",
            ScanJobState::Partial => "partial",
            ScanJobState::Failed => "failed",
            ScanJobState::Stopped => "stopped",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ScanJobState::Completed | ScanJobState::Partial | ScanJobState::Failed | ScanJobState::Stopped
        )
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct ScanJobRow {
    pub id: i64,
    pub provider: String,
    pub owner: String,
    pub repo: String,
    pub branch: String,
    pub commit_sha: String,
    pub unique_key: String,
    pub status: String,
    pub severity_rollup: String,
    pub error_message: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct NewScanJob {
    pub provider: String,
    pub owner: String,
    pub repo: String,
    pub branch: String,
    pub commit_sha: String,
}

impl NewScanJob {
    /// `provider:owner:repo:branch:commit:<nanos>`. The nanosecond suffix
    /// keeps the key unique per run.
    pub fn unique_key(&self) -> String {
        let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
        format!(
            "{}:{}:{}:{}:{}:{}",
            self.provider, self.owner, self.repo, self.branch, self.commit_sha, nanos
        )
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct ScannerRunRow {
    pub scan_job_id: i64,
    pub scanner: String,
    pub status: String,
    pub duration_ms: i64,
    pub error_message: Option<String>,
}

impl Db {
    pub async fn insert_scan_job(&self, job: &NewScanJob) -> Result<i64> {
        let result = sqlx::query(
            "INSERT INTO scan_jobs
                (provider, owner, repo, branch, commit_sha, unique_key, status, started_at)
             VALUES (?, ?, ?, ?, ?, ?, 'running', ?)",
        )
        .bind(&job.provider)
        .bind(&job.owner)
        .bind(&job.repo)
        .bind(&job.branch)
        .bind(&job.commit_sha)
        .bind(job.unique_key())
        .bind(Utc::now())
        .execute(self.pool())
        .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn get_scan_job(&self, id: i64) -> Result<Option<ScanJobRow>> {
        let row = sqlx::query_as::<_, ScanJobRow>("SELECT * FROM scan_jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?;
        Ok(row)
    }

    /// Transition a job into a terminal state, stamping `completed_at`.
    pub async fn complete_scan_job(
        &self,
        id: i64,
        state: ScanJobState,
        error: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE scan_jobs SET status = ?, error_message = ?, completed_at = ? WHERE id = ?",
        )
        .bind(state.as_str())
        .bind(error)
        .bind(Utc::now())
        .bind(id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Persist the per-severity rollup computed from the scanners' outputs.
    pub async fn set_scan_job_rollup(
        &self,
        id: i64,
        rollup: &crate::severity::SeverityCounts,
    ) -> Result<()> {
        let json = serde_json::to_string(rollup).unwrap_or_default();
        sqlx::query("UPDATE scan_jobs SET severity_rollup = ? WHERE id = ?")
            .bind(json)
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    pub async fn list_recent_scan_jobs(&self, limit: i64) -> Result<Vec<ScanJobRow>> {
        let rows = sqlx::query_as::<_, ScanJobRow>(
            "SELECT * FROM scan_jobs ORDER BY started_at DESC, id DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }

    /// The most recent terminal job for a repo branch, if any completed
    /// within `within_hours`. Drives the freshness skip.
    pub async fn fresh_scan_job(
        &self,
        provider: &str,
        owner: &str,
        repo: &str,
        branch: &str,
        within_hours: i64,
    ) -> Result<Option<ScanJobRow>> {
        let cutoff = Utc::now() - Duration::hours(within_hours);
        let row = sqlx::query_as::<_, ScanJobRow>(
            "SELECT * FROM scan_jobs
             WHERE provider = ? AND owner = ? AND repo = ? AND branch = ?
               AND status IN ('completed', 'partial')
               AND completed_at IS NOT NULL AND completed_at > ?
             ORDER BY completed_at DESC LIMIT 1",
        )
        .bind(provider)
        .bind(owner)
        .bind(repo)
        .bind(branch)
        .bind(cutoff)
        .fetch_optional(self.pool())
        .await?;
        Ok(row)
    }

    /// Force `running` jobs older than `older_than_hours` into `stopped`.
    /// Returns the number of jobs reaped.
    pub async fn reap_stale_running(
        &self,
        provider: &str,
        owner: &str,
        repo: &str,
        branch: &str,
        older_than_hours: i64,
    ) -> Result<u64> {
        let cutoff = Utc::now() - Duration::hours(older_than_hours);
        let result = sqlx::query(
            "UPDATE scan_jobs SET status = 'stopped', completed_at = ?
             WHERE provider = ? AND owner = ? AND repo = ? AND branch = ?
               AND status = 'running' AND started_at < ?",
        )
        .bind(Utc::now())
        .bind(provider)
        .bind(owner)
        .bind(repo)
        .bind(branch)
        .bind(cutoff)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn upsert_scanner_run(
        &self,
        scan_job_id: i64,
        scanner: &str,
        status: &str,
        duration_ms: i64,
        error: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO scan_job_scanners (scan_job_id, scanner, status, duration_ms, error_message)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT (scan_job_id, scanner)
             DO UPDATE SET status = excluded.status, duration_ms = excluded.duration_ms,
                           error_message = excluded.error_message",
        )
        .bind(scan_job_id)
        .bind(scanner)
        .bind(status)
        .bind(duration_ms)
        .bind(error)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn list_scanner_runs(&self, scan_job_id: i64) -> Result<Vec<ScannerRunRow>> {
        let rows = sqlx::query_as::<_, ScannerRunRow>(
            "SELECT * FROM scan_job_scanners WHERE scan_job_id = ? ORDER BY scanner",
        )
        .bind(scan_job_id)
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }

    pub async fn insert_raw_output(
        &self,
        scan_job_id: i64,
        scanner: &str,
        raw: &[u8],
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO scan_job_raw_outputs (scan_job_id, scanner, raw) VALUES (?, ?, ?)
             ON CONFLICT (scan_job_id, scanner) DO UPDATE SET raw = excluded.raw",
        )
        .bind(scan_job_id)
        .bind(scanner)
        .bind(raw)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn list_raw_outputs(&self, scan_job_id: i64) -> Result<Vec<(String, Vec<u8>)>> {
        let rows: Vec<(String, Vec<u8>)> = sqlx::query_as(
            "SELECT scanner, raw FROM scan_job_raw_outputs WHERE scan_job_id = ? ORDER BY scanner",
        )
        .bind(scan_job_id)
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(owner: &str, repo: &str) -> NewScanJob {
        NewScanJob {
            provider: "github".to_string(),
            owner: owner.to_string(),
            repo: repo.to_string(),
            branch: "main".to_string(),
            commit_sha: "abc123".to_string(),
        }
    }

    #[tokio::test]
    async fn test_insert_and_get() {
        let db = Db::in_memory().await.unwrap();
        let id = db.insert_scan_job(&job("octo", "webapp")).await.unwrap();
        let row = db.get_scan_job(id).await.unwrap().unwrap();
        assert_eq!(row.owner, "octo");
        assert_eq!(row.status, "running");
        assert!(row.completed_at.is_none());
        assert!(row.unique_key.starts_with("github:octo:webapp:main:abc123:"));
    }

    #[tokio::test]
    async fn test_unique_key_differs_per_run() {
        let j = job("octo", "webapp");
        assert_ne!(j.unique_key(), j.unique_key());
    }

    #[tokio::test]
    async fn test_complete_sets_completed_at() {
        let db = Db::in_memory().await.unwrap();
        let id = db.insert_scan_job(&job("octo", "webapp")).await.unwrap();
        db.complete_scan_job(id, ScanJobState::Partial, Some("one scanner failed"))
            .await
            .unwrap();
        let row = db.get_scan_job(id).await.unwrap().unwrap();
        assert_eq!(row.status, "partial");
        assert!(row.completed_at.is_some());
        assert_eq!(row.error_message.as_deref(), Some("one scanner failed"));
    }

    #[tokio::test]
    async fn test_fresh_scan_job_within_window() {
        let db = Db::in_memory().await.unwrap();
        let id = db.insert_scan_job(&job("octo", "webapp")).await.unwrap();
        db.complete_scan_job(id, ScanJobState::Completed, None)
            .await
            .unwrap();
        let fresh = db
            .fresh_scan_job("github", "octo", "webapp", "main", 24)
            .await
            .unwrap();
        assert!(fresh.is_some());
        // Different branch is not fresh
        let other = db
            .fresh_scan_job("github", "octo", "webapp", "develop", 24)
            .await
            .unwrap();
        assert!(other.is_none());
    }

    #[tokio::test]
    async fn test_running_job_is_not_fresh() {
        let db = Db::in_memory().await.unwrap();
        db.insert_scan_job(&job("octo", "webapp")).await.unwrap();
        let fresh = db
            .fresh_scan_job("github", "octo", "webapp", "main", 24)
            .await
            .unwrap();
        assert!(fresh.is_none());
    }

    #[tokio::test]
    async fn test_reap_stale_running() {
        let db = Db::in_memory().await.unwrap();
        let id = db.insert_scan_job(&job("octo", "webapp")).await.unwrap();
        // Backdate started_at beyond the 24h window
        sqlx::query("UPDATE scan_jobs SET started_at = ? WHERE id = ?")
            .bind(Utc::now() - Duration::hours(30))
            .bind(id)
            .execute(db.pool())
            .await
            .unwrap();

        let reaped = db
            .reap_stale_running("github", "octo", "webapp", "main", 24)
            .await
            .unwrap();
        assert_eq!(reaped, 1);
        let row = db.get_scan_job(id).await.unwrap().unwrap();
        assert_eq!(row.status, "stopped");
        assert!(row.completed_at.is_some());

        // A young running job is left alone
        let id2 = db.insert_scan_job(&job("octo", "webapp")).await.unwrap();
        let reaped = db
            .reap_stale_running("github", "octo", "webapp", "main", 24)
            .await
            .unwrap();
        assert_eq!(reaped, 0);
        assert_eq!(db.get_scan_job(id2).await.unwrap().unwrap().status, "running");
    }

    #[tokio::test]
    async fn test_rollup_and_recent_listing() {
        let db = Db::in_memory().await.unwrap();
        let id = db.insert_scan_job(&job("octo", "webapp")).await.unwrap();
        let mut rollup = crate::severity::SeverityCounts::default();
        rollup.record(crate::severity::Severity::High);
        rollup.record(crate::severity::Severity::Low);
        db.set_scan_job_rollup(id, &rollup).await.unwrap();

        let row = db.get_scan_job(id).await.unwrap().unwrap();
        let stored: crate::severity::SeverityCounts =
            serde_json::from_str(&row.severity_rollup).unwrap();
        assert_eq!(stored.high, 1);
        assert_eq!(stored.low, 1);

        db.insert_scan_job(&job("octo", "api")).await.unwrap();
        let recent = db.list_recent_scan_jobs(10).await.unwrap();
        assert_eq!(recent.len(), 2);
        let one = db.list_recent_scan_jobs(1).await.unwrap();
        assert_eq!(one.len(), 1);
    }

    #[tokio::test]
    async fn test_scanner_runs_and_raw_outputs() {
        let db = Db::in_memory().await.unwrap();
        let id = db.insert_scan_job(&job("octo", "webapp")).await.unwrap();
        db.upsert_scanner_run(id, "trivy", "completed", 1200, None)
            .await
            .unwrap();
        db.upsert_scanner_run(id, "trivy", "failed", 1500, Some("boom"))
            .await
            .unwrap();
        let runs = db.list_scanner_runs(id).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, "failed");
        assert_eq!(runs[0].error_message.as_deref(), Some("boom"));

        db.insert_raw_output(id, "trivy", br#"{"Results":[]}"#)
            .await
            .unwrap();
        let raws = db.list_raw_outputs(id).await.unwrap();
        assert_eq!(raws.len(), 1);
        assert_eq!(raws[0].0, "trivy");
        assert!(!raws[0].1.is_empty());
    }
}
