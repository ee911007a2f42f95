use chrono::{DateTime, Utc};
use sqlx::FromRow;

use crate::error::Result;

use super::Db;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CampaignStatus {
    Running,
    Completed,
    Stopped,
}

impl CampaignStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CampaignStatus::Running => "running",
            CampaignStatus::Completed => "completed",
            CampaignStatus::Stopped => "stopped",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }
}

/// Outcome of the triage phase, persisted on the task row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriageStatus {
    Running,
    Completed,
    FailedFallback,
    NoFindings,
    NoActionableFindings,
    AllFindingsAlreadyProcessed,
    AiUnavailable,
}

impl TriageStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TriageStatus::Running => "running",
            TriageStatus::Completed => "completed",
            TriageStatus::FailedFallback => "failed_fallback",
            TriageStatus::NoFindings => "no_findings",
            TriageStatus::NoActionableFindings => "no_actionable_findings",
            TriageStatus::AllFindingsAlreadyProcessed => "all_findings_already_processed",
            TriageStatus::AiUnavailable => "ai_unavailable",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressPhase {
    Starting,
    LoadingFindings,
    Triage,
    Fixing,
    Done,
}

impl ProgressPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            ProgressPhase::Starting => "starting",
            ProgressPhase::LoadingFindings => "loading_findings",
            ProgressPhase::Triage => "triage",
            ProgressPhase::Fixing => "fixing",
            ProgressPhase::Done => "done",
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct CampaignRow {
    pub id: i64,
    pub name: String,
    pub mode: String,
    pub auto_pr: i64,
    pub status: String,
    pub tasks_total: i64,
    pub tasks_completed: i64,
    pub tasks_failed: i64,
    pub fixes_queued: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow)]
pub struct TaskRow {
    pub id: i64,
    pub campaign_id: i64,
    pub scan_job_id: i64,
    pub status: String,
    pub error_message: Option<String>,
    pub findings_loaded: i64,
    pub deduped_count: i64,
    pub triage_status: String,
    pub triage_batches: i64,
    pub triage_summary: String,
    pub prioritized_json: String,
    pub progress_phase: String,
    pub progress_current: i64,
    pub progress_total: i64,
    pub progress_percent: i64,
    pub progress_note: String,
    pub fix_attempted: i64,
    pub fix_queued: i64,
    pub fix_skipped_low_conf: i64,
    pub fix_failed: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskRow {
    /// A chunked triage is resumable iff it crashed mid-triage with at least
    /// one checkpointed batch and a serialized prioritized list.
    pub fn triage_resumable(&self) -> bool {
        self.progress_phase == "triage"
            && self.progress_current > 0
            && self.progress_current < self.progress_total
            && !self.prioritized_json.is_empty()
    }

    /// The fix phase is resumable iff triage finished and the list survived.
    pub fn fix_resumable(&self) -> bool {
        self.triage_status == "completed" && !self.prioritized_json.is_empty()
    }
}

impl Db {
    pub async fn insert_campaign(&self, name: &str, mode: &str, auto_pr: bool) -> Result<i64> {
        let result = sqlx::query(
            "INSERT INTO remediation_campaigns (name, mode, auto_pr, status, created_at)
             VALUES (?, ?, ?, 'running', ?)",
        )
        .bind(name)
        .bind(mode)
        .bind(auto_pr as i64)
        .bind(Utc::now())
        .execute(self.pool())
        .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn get_campaign(&self, id: i64) -> Result<Option<CampaignRow>> {
        let row =
            sqlx::query_as::<_, CampaignRow>("SELECT * FROM remediation_campaigns WHERE id = ?")
                .bind(id)
                .fetch_optional(self.pool())
                .await?;
        Ok(row)
    }

    pub async fn insert_remediation_task(&self, campaign_id: i64, scan_job_id: i64) -> Result<i64> {
        let now = Utc::now();
        let result = sqlx::query(
            "INSERT INTO remediation_tasks (campaign_id, scan_job_id, status, created_at, updated_at)
             VALUES (?, ?, 'pending', ?, ?)",
        )
        .bind(campaign_id)
        .bind(scan_job_id)
        .bind(now)
        .bind(now)
        .execute(self.pool())
        .await?;
        sqlx::query(
            "UPDATE remediation_campaigns SET tasks_total = tasks_total + 1 WHERE id = ?",
        )
        .bind(campaign_id)
        .execute(self.pool())
        .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn get_remediation_task(&self, id: i64) -> Result<Option<TaskRow>> {
        let row = sqlx::query_as::<_, TaskRow>("SELECT * FROM remediation_tasks WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?;
        Ok(row)
    }

    /// Tasks left `running` by a crashed process go back to `pending` at
    /// startup.
    pub async fn requeue_running_tasks(&self) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE remediation_tasks
             SET status = 'pending', error_message = 'requeued after restart', updated_at = ?
             WHERE status = 'running'",
        )
        .bind(Utc::now())
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected())
    }

    /// Next pending task belonging to a running campaign, lowest id first.
    pub async fn next_pending_task(&self) -> Result<Option<TaskRow>> {
        let row = sqlx::query_as::<_, TaskRow>(
            "SELECT t.* FROM remediation_tasks t
             JOIN remediation_campaigns c ON c.id = t.campaign_id
             WHERE t.status = 'pending' AND c.status = 'running'
             ORDER BY t.id LIMIT 1",
        )
        .fetch_optional(self.pool())
        .await?;
        Ok(row)
    }

    pub async fn set_task_status(&self, id: i64, status: TaskStatus, error: Option<&str>) -> Result<()> {
        sqlx::query(
            "UPDATE remediation_tasks SET status = ?, error_message = ?, updated_at = ? WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(error)
        .bind(Utc::now())
        .bind(id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn set_task_counts(&self, id: i64, findings_loaded: i64, deduped: i64) -> Result<()> {
        sqlx::query(
            "UPDATE remediation_tasks
             SET findings_loaded = ?, deduped_count = ?, updated_at = ? WHERE id = ?",
        )
        .bind(findings_loaded)
        .bind(deduped)
        .bind(Utc::now())
        .bind(id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn set_task_progress(
        &self,
        id: i64,
        phase: ProgressPhase,
        current: i64,
        total: i64,
        note: &str,
    ) -> Result<()> {
        let percent = if total > 0 { current * 100 / total } else { 0 };
        sqlx::query(
            "UPDATE remediation_tasks
             SET progress_phase = ?, progress_current = ?, progress_total = ?,
                 progress_percent = ?, progress_note = ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(phase.as_str())
        .bind(current)
        .bind(total)
        .bind(percent)
        .bind(note)
        .bind(Utc::now())
        .bind(id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Atomic triage checkpoint: status, batch count, serialized prioritized
    /// list and progress pointer in one statement, so a resume sees either the
    /// whole checkpoint or none of it.
    #[allow(clippy::too_many_arguments)]
    pub async fn checkpoint_triage(
        &self,
        id: i64,
        status: TriageStatus,
        batches: i64,
        prioritized_json: &str,
        current: i64,
        total: i64,
        note: &str,
    ) -> Result<()> {
        let percent = if total > 0 { current * 100 / total } else { 0 };
        sqlx::query(
            "UPDATE remediation_tasks
             SET triage_status = ?, triage_batches = ?, prioritized_json = ?,
                 progress_phase = 'triage', progress_current = ?, progress_total = ?,
                 progress_percent = ?, progress_note = ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(batches)
        .bind(prioritized_json)
        .bind(current)
        .bind(total)
        .bind(percent)
        .bind(note)
        .bind(Utc::now())
        .bind(id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn set_triage_outcome(
        &self,
        id: i64,
        status: TriageStatus,
        summary: &str,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE remediation_tasks SET triage_status = ?, triage_summary = ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(summary)
        .bind(Utc::now())
        .bind(id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn set_task_fix_counters(
        &self,
        id: i64,
        attempted: i64,
        queued: i64,
        skipped_low_conf: i64,
        failed: i64,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE remediation_tasks
             SET fix_attempted = ?, fix_queued = ?, fix_skipped_low_conf = ?, fix_failed = ?,
                 updated_at = ?
             WHERE id = ?",
        )
        .bind(attempted)
        .bind(queued)
        .bind(skipped_low_conf)
        .bind(failed)
        .bind(Utc::now())
        .bind(id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Fold one finished task into the campaign totals. When the last task
    /// terminates, the campaign itself is marked completed. Returns true if
    /// the campaign just completed.
    pub async fn record_campaign_task_done(
        &self,
        campaign_id: i64,
        failed: bool,
        fixes_queued: i64,
    ) -> Result<bool> {
        sqlx::query(
            "UPDATE remediation_campaigns
             SET tasks_completed = tasks_completed + ?,
                 tasks_failed = tasks_failed + ?,
                 fixes_queued = fixes_queued + ?
             WHERE id = ?",
        )
        .bind(if failed { 0 } else { 1 })
        .bind(if failed { 1 } else { 0 })
        .bind(fixes_queued)
        .bind(campaign_id)
        .execute(self.pool())
        .await?;

        let result = sqlx::query(
            "UPDATE remediation_campaigns SET status = 'completed'
             WHERE id = ? AND status = 'running'
               AND tasks_completed + tasks_failed >= tasks_total",
        )
        .bind(campaign_id)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::NewScanJob;

    async fn seeded(db: &Db) -> (i64, i64) {
        let job = db
            .insert_scan_job(&NewScanJob {
                provider: "github".to_string(),
                owner: "octo".to_string(),
                repo: "webapp".to_string(),
                branch: "main".to_string(),
                commit_sha: "abc".to_string(),
            })
            .await
            .unwrap();
        let campaign = db.insert_campaign("q3 cleanup", "auto", true).await.unwrap();
        (campaign, job)
    }

    #[tokio::test]
    async fn test_task_lifecycle() {
        let db = Db::in_memory().await.unwrap();
        let (campaign, job) = seeded(&db).await;
        let task = db.insert_remediation_task(campaign, job).await.unwrap();

        let row = db.get_remediation_task(task).await.unwrap().unwrap();
        assert_eq!(row.status, "pending");
        assert_eq!(row.progress_phase, "starting");

        db.set_task_status(task, TaskStatus::Running, None).await.unwrap();
        db.set_task_status(task, TaskStatus::Completed, None).await.unwrap();
        let row = db.get_remediation_task(task).await.unwrap().unwrap();
        assert_eq!(row.status, "completed");
    }

    #[tokio::test]
    async fn test_requeue_running_tasks() {
        let db = Db::in_memory().await.unwrap();
        let (campaign, job) = seeded(&db).await;
        let task = db.insert_remediation_task(campaign, job).await.unwrap();
        db.set_task_status(task, TaskStatus::Running, None).await.unwrap();

        let requeued = db.requeue_running_tasks().await.unwrap();
        assert_eq!(requeued, 1);
        let row = db.get_remediation_task(task).await.unwrap().unwrap();
        assert_eq!(row.status, "pending");
        assert_eq!(row.error_message.as_deref(), Some("requeued after restart"));
    }

    #[tokio::test]
    async fn test_next_pending_requires_running_campaign() {
        let db = Db::in_memory().await.unwrap();
        let (campaign, job) = seeded(&db).await;
        db.insert_remediation_task(campaign, job).await.unwrap();
        assert!(db.next_pending_task().await.unwrap().is_some());

        sqlx::query("UPDATE remediation_campaigns SET status = 'stopped' WHERE id = ?")
            .bind(campaign)
            .execute(db.pool())
            .await
            .unwrap();
        assert!(db.next_pending_task().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_triage_checkpoint_and_resume_predicates() {
        let db = Db::in_memory().await.unwrap();
        let (campaign, job) = seeded(&db).await;
        let task = db.insert_remediation_task(campaign, job).await.unwrap();

        let row = db.get_remediation_task(task).await.unwrap().unwrap();
        assert!(!row.triage_resumable());
        assert!(!row.fix_resumable());

        db.checkpoint_triage(task, TriageStatus::Running, 3, r#"[{"finding_id":"x"}]"#, 2, 3, "batch 2/3")
            .await
            .unwrap();
        let row = db.get_remediation_task(task).await.unwrap().unwrap();
        assert!(row.triage_resumable());
        assert!(!row.fix_resumable());
        assert_eq!(row.progress_percent, 66);

        db.checkpoint_triage(task, TriageStatus::Completed, 3, r#"[{"finding_id":"x"}]"#, 3, 3, "triage done")
            .await
            .unwrap();
        let row = db.get_remediation_task(task).await.unwrap().unwrap();
        assert!(!row.triage_resumable());
        assert!(row.fix_resumable());
    }

    #[tokio::test]
    async fn test_campaign_stats_and_completion() {
        let db = Db::in_memory().await.unwrap();
        let (campaign, job) = seeded(&db).await;
        db.insert_remediation_task(campaign, job).await.unwrap();
        db.insert_remediation_task(campaign, job).await.unwrap();

        let done = db.record_campaign_task_done(campaign, false, 4).await.unwrap();
        assert!(!done);
        let done = db.record_campaign_task_done(campaign, true, 0).await.unwrap();
        assert!(done);

        let row = db.get_campaign(campaign).await.unwrap().unwrap();
        assert_eq!(row.status, "completed");
        assert_eq!(row.tasks_completed, 1);
        assert_eq!(row.tasks_failed, 1);
        assert_eq!(row.fixes_queued, 4);
    }
}
