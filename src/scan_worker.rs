use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::clone::{CloneHandle, CloneManager};
use crate::config::Config;
use crate::db::{Db, NewScanJob, ScanJobState};
use crate::discovery::RepoJob;
use crate::error::{Error, Result};
use crate::events::{EventHooks, WorkerPhase, WorkerStatus};
use crate::scanner::{self, RunOptions, ScannerStatus};

/// Hours a terminal scan stays fresh, and the age at which a `running` job
/// is presumed dead.
pub const FRESHNESS_HOURS: i64 = 24;

pub const SKIP_REASON_FRESH: &str = "recently scanned within 24h";

/// Handoff envelope from a scanner worker to the fixer. The clone stays on
/// disk until `release` runs; release is idempotent.
#[derive(Debug, Clone)]
pub struct FixJob {
    pub scan_job_id: i64,
    pub remediation_task_id: Option<i64>,
    pub provider: String,
    pub owner: String,
    pub repo: String,
    pub branch: String,
    pub commit: String,
    pub clone_path: PathBuf,
    pub cleanup: Arc<CloneHandle>,
}

impl FixJob {
    pub fn repo_slug(&self) -> String {
        format!("{}/{}", self.owner, self.repo)
    }

    pub fn release(&self) {
        self.cleanup.release();
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct PoolStats {
    pub scanned: u64,
    pub skipped: u64,
    pub failed: u64,
}

/// Shared context for the scanner pool.
#[derive(Clone)]
pub struct ScanWorkerPool {
    pub config: Arc<Config>,
    pub db: Db,
    pub clones: Arc<CloneManager>,
    pub events: EventHooks,
}

impl ScanWorkerPool {
    /// Run N workers until the repo queue closes, emitting fix jobs. The
    /// caller drops `tx` (closing the fix queue) only after this returns,
    /// which is after every worker has exited.
    pub async fn run(
        &self,
        workers: usize,
        force_scan: bool,
        rx: mpsc::Receiver<RepoJob>,
        tx: mpsc::Sender<FixJob>,
        cancel: CancellationToken,
    ) -> PoolStats {
        let rx = Arc::new(Mutex::new(rx));
        let mut set = JoinSet::new();

        for n in 1..=workers {
            let pool = self.clone();
            let rx = Arc::clone(&rx);
            let tx = tx.clone();
            let cancel = cancel.clone();
            set.spawn(async move { pool.worker_loop(n, force_scan, rx, tx, cancel).await });
        }
        drop(tx);

        let mut stats = PoolStats::default();
        while let Some(result) = set.join_next().await {
            match result {
                Ok(worker_stats) => {
                    stats.scanned += worker_stats.scanned;
                    stats.skipped += worker_stats.skipped;
                    stats.failed += worker_stats.failed;
                }
                Err(e) => warn!(error = %e, "scanner worker panicked"),
            }
        }
        stats
    }

    async fn worker_loop(
        &self,
        n: usize,
        force_scan: bool,
        rx: Arc<Mutex<mpsc::Receiver<RepoJob>>>,
        tx: mpsc::Sender<FixJob>,
        cancel: CancellationToken,
    ) -> PoolStats {
        let worker_id = format!("scanner-{n}");
        let mut stats = PoolStats::default();

        loop {
            self.status(&worker_id, WorkerPhase::Waiting, "waiting for repo job", None);
            let job = {
                let mut rx = rx.lock().await;
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => None,
                    job = rx.recv() => job,
                }
            };
            let Some(job) = job else { break };

            let repo = format!("{}/{}", job.owner, job.name);
            match self.process(&worker_id, &job, force_scan, &tx, &cancel).await {
                Ok(true) => stats.scanned += 1,
                Ok(false) => stats.skipped += 1,
                Err(Error::Cancelled) => {
                    stats.failed += 1;
                    break;
                }
                Err(e) => {
                    stats.failed += 1;
                    warn!(worker = %worker_id, repo = %repo, error = %e, "repo job failed");
                    self.status(
                        &worker_id,
                        WorkerPhase::Failed,
                        format!("failed: {e}"),
                        Some(repo),
                    );
                }
            }
        }

        self.status(&worker_id, WorkerPhase::Stopped, "stopped", None);
        stats
    }

    /// Returns Ok(true) when the repo was scanned, Ok(false) on a freshness
    /// skip.
    async fn process(
        &self,
        worker_id: &str,
        job: &RepoJob,
        force_scan: bool,
        tx: &mpsc::Sender<FixJob>,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        let repo = format!("{}/{}", job.owner, job.name);
        let branch_for_freshness = job.branch.clone().unwrap_or_default();

        // Reap zombie running jobs, then check freshness.
        self.db
            .reap_stale_running(
                &job.provider,
                &job.owner,
                &job.name,
                &branch_for_freshness,
                FRESHNESS_HOURS,
            )
            .await?;
        if !force_scan {
            let fresh = self
                .db
                .fresh_scan_job(
                    &job.provider,
                    &job.owner,
                    &job.name,
                    &branch_for_freshness,
                    FRESHNESS_HOURS,
                )
                .await?;
            if fresh.is_some() {
                info!(repo = %repo, "skipping, {SKIP_REASON_FRESH}");
                self.events
                    .fire_repo_skipped(repo.clone(), SKIP_REASON_FRESH.to_string());
                return Ok(false);
            }
        }

        self.status(worker_id, WorkerPhase::Running, "cloning", Some(repo.clone()));
        let (clone, handle) = self
            .clones
            .clone_shallow(
                &job.clone_url,
                &job.owner,
                &job.name,
                job.branch.as_deref(),
                cancel,
            )
            .await?;

        let result = self
            .scan_and_emit(worker_id, job, &repo, &clone.branch, &clone.commit, clone.path.clone(), Arc::clone(&handle), tx, cancel)
            .await;
        if result.is_err() {
            handle.release();
        }
        result?;
        Ok(true)
    }

    #[allow(clippy::too_many_arguments)]
    async fn scan_and_emit(
        &self,
        worker_id: &str,
        job: &RepoJob,
        repo: &str,
        branch: &str,
        commit: &str,
        clone_path: PathBuf,
        handle: Arc<CloneHandle>,
        tx: &mpsc::Sender<FixJob>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let scan_job_id = self
            .db
            .insert_scan_job(&NewScanJob {
                provider: job.provider.clone(),
                owner: job.owner.clone(),
                repo: job.name.clone(),
                branch: branch.to_string(),
                commit_sha: commit.to_string(),
            })
            .await?;

        self.status(worker_id, WorkerPhase::Running, "scanning", Some(repo.to_string()));
        let opts = RunOptions {
            parallel: self.config.parallel_scanners,
            timeout: Duration::from_secs(self.config.scanner_timeout),
            bin_dir: self.config.scanner_bin_dir.clone(),
        };
        let outcomes =
            scanner::run_scanners(&self.config.scanners, &clone_path, &opts, cancel).await?;

        let mut all_findings = Vec::new();
        let mut rollup = crate::severity::SeverityCounts::default();
        for outcome in &outcomes {
            rollup.merge(&outcome.counts);
            self.db
                .upsert_scanner_run(
                    scan_job_id,
                    outcome.scanner,
                    outcome.status.as_str(),
                    outcome.duration_ms,
                    outcome.error.as_deref(),
                )
                .await?;
            if !outcome.raw.is_empty() {
                self.db
                    .insert_raw_output(scan_job_id, outcome.scanner, &outcome.raw)
                    .await?;
            }
            all_findings.extend(outcome.findings.iter().cloned());
        }
        self.db.insert_findings(scan_job_id, &all_findings).await?;
        self.db.set_scan_job_rollup(scan_job_id, &rollup).await?;

        let status = scanner::job_status(&outcomes);
        let state = match status {
            "completed" => ScanJobState::Completed,
            "partial" => ScanJobState::Partial,
            _ => ScanJobState::Failed,
        };
        let errors: Vec<String> = outcomes
            .iter()
            .filter(|o| o.status == ScannerStatus::Failed)
            .filter_map(|o| o.error.as_ref().map(|e| format!("{}: {e}", o.scanner)))
            .collect();
        self.db
            .complete_scan_job(
                scan_job_id,
                state,
                (!errors.is_empty()).then(|| errors.join("; ")).as_deref(),
            )
            .await?;

        if state == ScanJobState::Failed {
            return Err(Error::Scanner(format!(
                "all scanners failed for {repo}: {}",
                errors.join("; ")
            )));
        }

        info!(
            repo = %repo,
            scan_job_id,
            findings = all_findings.len(),
            status,
            "scan persisted"
        );

        let fix_job = FixJob {
            scan_job_id,
            remediation_task_id: None,
            provider: job.provider.clone(),
            owner: job.owner.clone(),
            repo: job.name.clone(),
            branch: branch.to_string(),
            commit: commit.to_string(),
            clone_path,
            cleanup: handle,
        };

        // Clone release on the cancellation path happens here; the fixer owns
        // it after a successful send.
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                fix_job.release();
                Err(Error::Cancelled)
            }
            sent = tx.send(fix_job.clone()) => {
                if sent.is_err() {
                    fix_job.release();
                    return Err(Error::Orchestrator("fix queue closed".to_string()));
                }
                Ok(())
            }
        }
    }

    fn status(&self, worker: &str, phase: WorkerPhase, action: impl Into<String>, repo: Option<String>) {
        self.events
            .fire_worker_status(worker.to_string(), WorkerStatus::new(phase, action, repo));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::ScanJobState;
    use std::sync::Mutex as StdMutex;

    async fn pool_with_db() -> (ScanWorkerPool, Db, tempfile::TempDir) {
        let tmp = tempfile::tempdir().unwrap();
        let db = Db::in_memory().await.unwrap();
        let config = Arc::new(crate::discovery::tests::test_config());
        let pool = ScanWorkerPool {
            config,
            db: db.clone(),
            clones: Arc::new(CloneManager::new(tmp.path().join("scratch"))),
            events: EventHooks::default(),
        };
        (pool, db, tmp)
    }

    fn job(owner: &str, name: &str, url: &str) -> RepoJob {
        RepoJob {
            provider: "github".to_string(),
            owner: owner.to_string(),
            name: name.to_string(),
            clone_url: url.to_string(),
            branch: None,
        }
    }

    #[tokio::test]
    async fn test_freshness_skip_emits_event_and_no_new_row() {
        let (pool, db, _tmp) = pool_with_db().await;

        // Seed a completed job within the window
        let id = db
            .insert_scan_job(&NewScanJob {
                provider: "github".to_string(),
                owner: "o".to_string(),
                repo: "r".to_string(),
                branch: String::new(),
                commit_sha: "c".to_string(),
            })
            .await
            .unwrap();
        db.complete_scan_job(id, ScanJobState::Completed, None)
            .await
            .unwrap();

        let skips: Arc<StdMutex<Vec<(String, String)>>> = Arc::new(StdMutex::new(Vec::new()));
        let skips_hook = skips.clone();
        let mut pool = pool;
        pool.events = EventHooks::default().on_repo_skipped(move |(repo, reason)| {
            skips_hook.lock().unwrap().push((repo.clone(), reason.clone()));
        });

        let (tx, _rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        let scanned = pool
            .process("scanner-1", &job("o", "r", "https://example.invalid/r.git"), false, &tx, &cancel)
            .await
            .unwrap();
        assert!(!scanned);

        let events = skips.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].0, "o/r");
        assert_eq!(events[0].1, SKIP_REASON_FRESH);

        // No second scan-job row was created
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM scan_jobs")
            .fetch_one(db.pool())
            .await
            .unwrap();
        assert_eq!(count.0, 1);
    }

    #[tokio::test]
    async fn test_force_scan_bypasses_freshness() {
        let (pool, db, _tmp) = pool_with_db().await;
        let id = db
            .insert_scan_job(&NewScanJob {
                provider: "github".to_string(),
                owner: "o".to_string(),
                repo: "r".to_string(),
                branch: String::new(),
                commit_sha: "c".to_string(),
            })
            .await
            .unwrap();
        db.complete_scan_job(id, ScanJobState::Completed, None)
            .await
            .unwrap();

        let (tx, _rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        // Force scan proceeds to the clone step and fails on the bogus URL —
        // proving the freshness gate was bypassed.
        let err = pool
            .process("scanner-1", &job("o", "r", "https://example.invalid/r.git"), true, &tx, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Clone(_)));
    }

    #[tokio::test]
    async fn test_clone_failure_is_a_job_failure() {
        let (pool, _db, _tmp) = pool_with_db().await;
        let (tx, _rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        let err = pool
            .process(
                "scanner-1",
                &job("octo", "gone", "https://example.invalid/gone.git"),
                false,
                &tx,
                &cancel,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Clone(_)));
    }

    #[tokio::test]
    async fn test_pool_exits_when_queue_closes() {
        let (pool, _db, _tmp) = pool_with_db().await;
        let (repo_tx, repo_rx) = mpsc::channel::<RepoJob>(4);
        let (fix_tx, mut fix_rx) = mpsc::channel::<FixJob>(4);
        let cancel = CancellationToken::new();

        drop(repo_tx);
        let stats = pool.run(3, false, repo_rx, fix_tx, cancel).await;
        assert_eq!(stats.scanned, 0);
        // Fix queue closed only after all workers exited
        assert!(fix_rx.recv().await.is_none());
    }
}
