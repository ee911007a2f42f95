use chrono::{DateTime, Utc};
use sqlx::FromRow;

use crate::error::Result;

use super::Db;

/// Fix-queue status machine:
/// `pending | approved | rejected → pr_open → pr_merged` or `→ pr_failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FixStatus {
    Pending,
    Approved,
    Rejected,
    PrOpen,
    PrMerged,
    PrFailed,
}

impl FixStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            FixStatus::Pending => "pending",
            FixStatus::Approved => "approved",
            FixStatus::Rejected => "rejected",
            FixStatus::PrOpen => "pr_open",
            FixStatus::PrMerged => "pr_merged",
            FixStatus::PrFailed => "pr_failed",
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct FixQueueRow {
    pub id: i64,
    pub scan_job_id: i64,
    pub finding_type: String,
    pub finding_ref: String,
    pub ai_provider: String,
    pub ai_model: String,
    pub ai_endpoint: String,
    pub apply_hints_json: String,
    pub patch: String,
    pub pr_title: String,
    pub pr_body: String,
    pub status: String,
    pub pr_number: Option<i64>,
    pub pr_url: Option<String>,
    pub generated_at: DateTime<Utc>,
    pub approved_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default)]
pub struct NewFix {
    pub scan_job_id: i64,
    pub finding_type: String,
    pub finding_ref: String,
    pub ai_provider: String,
    pub ai_model: String,
    pub ai_endpoint: String,
    pub apply_hints_json: String,
    pub patch: String,
    pub pr_title: String,
    pub pr_body: String,
    pub approved: bool,
}

impl Db {
    /// Insert a generated fix. In auto mode the row lands pre-approved.
    pub async fn insert_fix(&self, fix: &NewFix) -> Result<i64> {
        let status = if fix.approved {
            FixStatus::Approved
        } else {
            FixStatus::Pending
        };
        let approved_at = fix.approved.then(Utc::now);
        let result = sqlx::query(
            "INSERT INTO fix_queue
                (scan_job_id, finding_type, finding_ref, ai_provider, ai_model, ai_endpoint,
                 apply_hints_json, patch, pr_title, pr_body, status, generated_at, approved_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(fix.scan_job_id)
        .bind(&fix.finding_type)
        .bind(&fix.finding_ref)
        .bind(&fix.ai_provider)
        .bind(&fix.ai_model)
        .bind(&fix.ai_endpoint)
        .bind(&fix.apply_hints_json)
        .bind(&fix.patch)
        .bind(&fix.pr_title)
        .bind(&fix.pr_body)
        .bind(status.as_str())
        .bind(Utc::now())
        .bind(approved_at)
        .execute(self.pool())
        .await?;
        Ok(result.last_insert_rowid())
    }

    /// Whether the finding already has a row in a non-terminal state for this
    /// scan job. Terminal states are rejected, pr_merged and pr_failed.
    pub async fn has_open_fix_attempt(&self, scan_job_id: i64, finding_ref: &str) -> Result<bool> {
        let count: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM fix_queue
             WHERE scan_job_id = ? AND finding_ref = ?
               AND status IN ('pending', 'approved', 'pr_open')",
        )
        .bind(scan_job_id)
        .bind(finding_ref)
        .fetch_one(self.pool())
        .await?;
        Ok(count.0 > 0)
    }

    pub async fn list_approved_fixes(&self, limit: i64) -> Result<Vec<FixQueueRow>> {
        let rows = sqlx::query_as::<_, FixQueueRow>(
            "SELECT * FROM fix_queue WHERE status = 'approved' ORDER BY id LIMIT ?",
        )
        .bind(limit)
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }

    pub async fn get_fix(&self, id: i64) -> Result<Option<FixQueueRow>> {
        let row = sqlx::query_as::<_, FixQueueRow>("SELECT * FROM fix_queue WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?;
        Ok(row)
    }

    pub async fn set_fix_status(&self, id: i64, status: FixStatus) -> Result<()> {
        sqlx::query("UPDATE fix_queue SET status = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Record a successfully opened PR.
    pub async fn mark_fix_pr_opened(&self, id: i64, pr_number: i64, pr_url: &str) -> Result<()> {
        sqlx::query(
            "UPDATE fix_queue
             SET status = 'pr_open', pr_number = ?, pr_url = ?, approved_at = COALESCE(approved_at, ?)
             WHERE id = ?",
        )
        .bind(pr_number)
        .bind(pr_url)
        .bind(Utc::now())
        .bind(id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn set_fix_pr_text(&self, id: i64, title: &str, body: &str) -> Result<()> {
        sqlx::query("UPDATE fix_queue SET pr_title = ?, pr_body = ? WHERE id = ?")
            .bind(title)
            .bind(body)
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(())
    }
}
