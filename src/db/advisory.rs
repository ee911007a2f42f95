use chrono::{DateTime, Utc};
use sqlx::FromRow;

use crate::error::Result;

use super::Db;

/// Poll cursor for an advisory feed source. One row per source.
#[derive(Debug, Clone, FromRow)]
pub struct AdvisoryPollState {
    pub source: String,
    pub cursor: Option<DateTime<Utc>>,
    pub advisories_seen: i64,
    pub repos_queued: i64,
}

impl Db {
    pub async fn load_advisory_poll_state(&self, source: &str) -> Result<Option<AdvisoryPollState>> {
        let row = sqlx::query_as::<_, AdvisoryPollState>(
            "SELECT * FROM advisory_poll_state WHERE source = ?",
        )
        .bind(source)
        .fetch_optional(self.pool())
        .await?;
        Ok(row)
    }

    /// Advance the cursor and bump the counters after a sweep of the feed.
    pub async fn save_advisory_poll_state(
        &self,
        source: &str,
        cursor: Option<DateTime<Utc>>,
        advisories_seen: i64,
        repos_queued: i64,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO advisory_poll_state (source, cursor, advisories_seen, repos_queued)
             VALUES (?, ?, ?, ?)
             ON CONFLICT (source) DO UPDATE SET
                cursor = COALESCE(excluded.cursor, advisory_poll_state.cursor),
                advisories_seen = advisory_poll_state.advisories_seen + excluded.advisories_seen,
                repos_queued = advisory_poll_state.repos_queued + excluded.repos_queued",
        )
        .bind(source)
        .bind(cursor)
        .bind(advisories_seen)
        .bind(repos_queued)
        .execute(self.pool())
        .await?;
        Ok(())
    }
}
