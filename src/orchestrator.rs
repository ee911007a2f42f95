use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::ai::{self, AiProvider};
use crate::clone::CloneManager;
use crate::config::{AgentMode, Config, RepoSelector, ScanTarget};
use crate::db::{Db, TaskRow, TaskStatus};
use crate::discovery::{AdvisoryFeed, Discovery, OsvFeed};
use crate::error::{Error, Result};
use crate::events::{EventHooks, RemediationEvent, SweepSummary, WorkerStatus};
use crate::fixer::Fixer;
use crate::pr_worker::PrWorker;
use crate::providers::ProviderRegistry;
use crate::scan_worker::{FixJob, ScanWorkerPool, SKIP_REASON_FRESH};

const REMEDIATION_POLL: Duration = Duration::from_secs(3);

/// One-shot overrides a trigger may attach to exactly one sweep.
#[derive(Debug, Clone, Default)]
pub struct SweepOverrides {
    pub scan_targets: Option<Vec<ScanTarget>>,
    pub workers: Option<usize>,
    pub selected_repos: Option<Vec<RepoSelector>>,
    pub force_scan: Option<bool>,
    pub mode: Option<AgentMode>,
}

#[derive(Default)]
struct Inner {
    pending_trigger: Option<SweepOverrides>,
    active_sweep_cancel: Option<CancellationToken>,
    worker_states: HashMap<String, WorkerStatus>,
}

/// Process-wide composition root: owns the sweep loop, the PR loop and the
/// remediation-task loop.
pub struct Orchestrator {
    config: Arc<Config>,
    db: Db,
    providers: ProviderRegistry,
    ai: Arc<dyn AiProvider>,
    clones: Arc<CloneManager>,
    feed: Arc<dyn AdvisoryFeed>,
    events: EventHooks,
    inner: Arc<Mutex<Inner>>,
    trigger_tx: mpsc::Sender<SweepOverrides>,
    trigger_rx: Mutex<Option<mpsc::Receiver<SweepOverrides>>>,
    pr_trigger_tx: mpsc::Sender<()>,
    pr_trigger_rx: Mutex<Option<mpsc::Receiver<()>>>,
}

impl Orchestrator {
    pub fn new(config: Config, db: Db, events: EventHooks) -> Result<Arc<Self>> {
        let providers = ProviderRegistry::from_config(&config.providers)?;
        let ai = ai::build_from_config(&config.ai)?;
        let feed: Arc<dyn AdvisoryFeed> = Arc::new(OsvFeed::new(&config.advisory)?);
        Ok(Self::with_parts(config, db, providers, ai, feed, events))
    }

    pub fn with_parts(
        config: Config,
        db: Db,
        providers: ProviderRegistry,
        ai: Arc<dyn AiProvider>,
        feed: Arc<dyn AdvisoryFeed>,
        events: EventHooks,
    ) -> Arc<Self> {
        let clones = Arc::new(CloneManager::new(config.scratch_dir.clone()));
        // Trigger channels hold at most one signal; extra triggers coalesce.
        let (trigger_tx, trigger_rx) = mpsc::channel(1);
        let (pr_trigger_tx, pr_trigger_rx) = mpsc::channel(1);
        Arc::new(Self {
            config: Arc::new(config),
            db,
            providers,
            ai,
            clones,
            feed,
            events,
            inner: Arc::new(Mutex::new(Inner::default())),
            trigger_tx,
            trigger_rx: Mutex::new(Some(trigger_rx)),
            pr_trigger_tx,
            pr_trigger_rx: Mutex::new(Some(pr_trigger_rx)),
        })
    }

    /// Request a sweep. While one is in progress the request is parked; only
    /// the latest pending trigger is retained.
    pub fn trigger(&self, overrides: SweepOverrides) {
        let mut inner = self.inner.lock().unwrap();
        if inner.active_sweep_cancel.is_some() {
            inner.pending_trigger = Some(overrides);
            return;
        }
        if let Err(mpsc::error::TrySendError::Full(overrides)) =
            self.trigger_tx.try_send(overrides)
        {
            inner.pending_trigger = Some(overrides);
        }
    }

    /// Cancel the in-flight sweep without affecting the loop.
    pub fn stop_current_sweep(&self) {
        let inner = self.inner.lock().unwrap();
        if let Some(cancel) = &inner.active_sweep_cancel {
            info!("stopping current sweep");
            cancel.cancel();
        }
    }

    /// Wake the PR worker outside its timer.
    pub fn trigger_pr_pass(&self) {
        let _ = self.pr_trigger_tx.try_send(());
    }

    /// Snapshot of the live worker-status map.
    pub fn worker_states(&self) -> HashMap<String, WorkerStatus> {
        self.inner.lock().unwrap().worker_states.clone()
    }

    fn pool_events(&self) -> EventHooks {
        // Record worker status into the shared map, then forward to the
        // user's hooks.
        let inner = Arc::clone(&self.inner);
        let user = self.events.clone();
        let forward = self.events.clone();
        EventHooks::default()
            .on_worker_status(move |(worker, status)| {
                inner
                    .lock()
                    .unwrap()
                    .worker_states
                    .insert(worker.clone(), status.clone());
                user.fire_worker_status(worker.clone(), status.clone());
            })
            .on_repo_skipped(move |(repo, reason)| {
                forward.fire_repo_skipped(repo.clone(), reason.clone());
            })
    }

    fn pr_worker(&self) -> PrWorker {
        PrWorker::new(
            Arc::clone(&self.config),
            self.db.clone(),
            self.providers.clone(),
            Arc::clone(&self.ai),
            Arc::clone(&self.clones),
        )
    }

    /// Startup recovery: remediation tasks stuck in `running` go back to
    /// `pending`.
    async fn recover(&self) -> Result<()> {
        let requeued = self.db.requeue_running_tasks().await?;
        if requeued > 0 {
            info!(requeued, "requeued remediation tasks after restart");
        }
        Ok(())
    }

    /// Single-sweep mode: one sweep, one PR pass, exit.
    pub async fn run_once(&self, cancel: &CancellationToken) -> Result<SweepSummary> {
        self.recover().await?;
        let overrides = SweepOverrides {
            selected_repos: (!self.config.selected_repos.is_empty())
                .then(|| self.config.selected_repos.clone()),
            ..Default::default()
        };
        let summary = self.run_sweep(overrides, cancel).await?;
        self.pr_worker().drain(cancel).await?;
        Ok(summary)
    }

    /// Continuous mode: sweep on triggers, with the PR and remediation loops
    /// running alongside for the process lifetime.
    pub async fn run(self: &Arc<Self>, cancel: CancellationToken) -> Result<()> {
        self.recover().await?;

        let mut trigger_rx = self
            .trigger_rx
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| Error::Orchestrator("orchestrator already running".to_string()))?;
        let pr_trigger_rx = self
            .pr_trigger_rx
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| Error::Orchestrator("orchestrator already running".to_string()))?;

        let pr_worker = self.pr_worker();
        let pr_cancel = cancel.clone();
        let pr_handle = tokio::spawn(async move { pr_worker.run(pr_trigger_rx, pr_cancel).await });

        let this = Arc::clone(self);
        let rem_cancel = cancel.clone();
        let rem_handle = tokio::spawn(async move { this.remediation_loop(rem_cancel).await });

        // Kick off an initial sweep.
        self.trigger(SweepOverrides::default());

        loop {
            let overrides = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                overrides = trigger_rx.recv() => match overrides {
                    Some(overrides) => overrides,
                    None => break,
                },
            };

            let mut next = Some(overrides);
            while let Some(overrides) = next.take() {
                if cancel.is_cancelled() {
                    break;
                }
                match self.run_sweep(overrides, &cancel).await {
                    Ok(_) | Err(Error::Cancelled) => {}
                    Err(e) => warn!(error = %e, "sweep failed"),
                }
                next = self.inner.lock().unwrap().pending_trigger.take();
            }
        }

        pr_handle.abort();
        rem_handle.abort();
        Ok(())
    }

    async fn run_sweep(
        &self,
        overrides: SweepOverrides,
        parent_cancel: &CancellationToken,
    ) -> Result<SweepSummary> {
        let sweep_cancel = parent_cancel.child_token();
        {
            let mut inner = self.inner.lock().unwrap();
            inner.active_sweep_cancel = Some(sweep_cancel.clone());
        }
        self.events.fire_sweep_started();
        let result = self.sweep_pipeline(overrides, &sweep_cancel).await;
        {
            let mut inner = self.inner.lock().unwrap();
            inner.active_sweep_cancel = None;
        }
        if let Ok(summary) = &result {
            self.events.fire_sweep_completed(summary);
            // Freshly approved fixes can go out immediately.
            self.trigger_pr_pass();
        }
        result
    }

    async fn sweep_pipeline(
        &self,
        overrides: SweepOverrides,
        cancel: &CancellationToken,
    ) -> Result<SweepSummary> {
        let targets = overrides
            .scan_targets
            .unwrap_or_else(|| self.config.scan_targets.clone());
        let workers = overrides.workers.unwrap_or(self.config.workers);
        let selected = overrides.selected_repos.unwrap_or_default();
        let force_scan = overrides.force_scan.unwrap_or(self.config.force_scan);
        let mode = overrides.mode.unwrap_or(self.config.mode);

        let effective = Arc::new(Config {
            mode,
            force_scan,
            ..(*self.config).clone()
        });

        let (repo_tx, repo_rx) = mpsc::channel(256);
        let (fix_tx, fix_rx) = mpsc::channel(512);

        // Discovery closes the repo queue when it exits (repo_tx moves into
        // the task).
        let discovery = Discovery::new(
            Arc::clone(&effective),
            self.providers.clone(),
            self.db.clone(),
            Arc::clone(&self.feed),
        );
        let discovery_cancel = cancel.clone();
        let discovery_handle = tokio::spawn(async move {
            let result = discovery
                .run_once(&targets, &selected, &repo_tx, &discovery_cancel)
                .await;
            drop(repo_tx);
            result
        });

        // The pool closes the fix queue only after the last worker exits.
        let pool = ScanWorkerPool {
            config: Arc::clone(&effective),
            db: self.db.clone(),
            clones: Arc::clone(&self.clones),
            events: self.pool_events(),
        };
        let pool_cancel = cancel.clone();
        let pool_handle =
            tokio::spawn(async move { pool.run(workers, force_scan, repo_rx, fix_tx, pool_cancel).await });

        // The fixer is the sweep's single fix-queue consumer; it runs on
        // this task.
        let fixer = Fixer::new(
            Arc::clone(&effective),
            self.db.clone(),
            Arc::clone(&self.ai),
            self.events.clone(),
        );
        fixer.run(fix_rx, cancel).await;

        let discovery_result = discovery_handle
            .await
            .map_err(|e| Error::Orchestrator(format!("discovery task panicked: {e}")))?;
        let pool_stats = pool_handle
            .await
            .map_err(|e| Error::Orchestrator(format!("scanner pool panicked: {e}")))?;

        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let stats = match discovery_result {
            Ok(stats) => stats,
            Err(Error::Cancelled) => return Err(Error::Cancelled),
            Err(e) => {
                warn!(error = %e, "discovery failed");
                Default::default()
            }
        };

        let mut skips = HashMap::new();
        if pool_stats.skipped > 0 {
            skips.insert(SKIP_REASON_FRESH.to_string(), pool_stats.skipped);
        }
        let summary = SweepSummary {
            repos_discovered: stats.repos_emitted,
            repos_scanned: pool_stats.scanned,
            repos_failed: pool_stats.failed,
            skips,
        };
        info!(
            discovered = summary.repos_discovered,
            scanned = summary.repos_scanned,
            skipped = pool_stats.skipped,
            failed = summary.repos_failed,
            "sweep complete"
        );
        Ok(summary)
    }

    // -----------------------------------------------------------------
    // Remediation campaigns
    // -----------------------------------------------------------------

    async fn remediation_loop(self: Arc<Self>, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(REMEDIATION_POLL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                _ = interval.tick() => {}
            }
            loop {
                let task = match self.db.next_pending_task().await {
                    Ok(Some(task)) => task,
                    Ok(None) => break,
                    Err(e) => {
                        warn!(error = %e, "remediation poll failed");
                        break;
                    }
                };
                match self.run_remediation_task(&task, &cancel).await {
                    Ok(()) => {}
                    Err(Error::Cancelled) => return,
                    Err(e) => {
                        warn!(task = task.id, error = %e, "remediation task errored");
                    }
                }
            }
        }
    }

    /// Drive the fixer directly for one user-initiated task.
    pub async fn run_remediation_task(
        &self,
        task: &TaskRow,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let campaign = self
            .db
            .get_campaign(task.campaign_id)
            .await?
            .ok_or_else(|| Error::Orchestrator(format!("campaign {} missing", task.campaign_id)))?;

        self.db.set_task_status(task.id, TaskStatus::Running, None).await?;
        self.events.fire_remediation(RemediationEvent::TaskStarted {
            campaign_id: campaign.id,
            task_id: task.id,
        });

        let result = self.remediate(task, &campaign.mode, cancel).await;

        match result {
            Ok(fixes_queued) => {
                self.db
                    .set_task_status(task.id, TaskStatus::Completed, None)
                    .await?;
                self.events.fire_remediation(RemediationEvent::TaskCompleted {
                    task_id: task.id,
                    fixes_queued,
                });
                let campaign_done = self
                    .db
                    .record_campaign_task_done(campaign.id, false, fixes_queued)
                    .await?;
                if campaign.auto_pr != 0 {
                    self.trigger_pr_pass();
                }
                if campaign_done {
                    self.events
                        .fire_remediation(RemediationEvent::CampaignCompleted {
                            campaign_id: campaign.id,
                        });
                }
                Ok(())
            }
            Err(Error::Cancelled) => Err(Error::Cancelled),
            Err(e) => {
                let message = e.to_string();
                self.db
                    .set_task_status(task.id, TaskStatus::Failed, Some(&message))
                    .await?;
                self.events.fire_remediation(RemediationEvent::TaskFailed {
                    task_id: task.id,
                    error: message,
                });
                let campaign_done = self
                    .db
                    .record_campaign_task_done(campaign.id, true, 0)
                    .await?;
                if campaign_done {
                    self.events
                        .fire_remediation(RemediationEvent::CampaignCompleted {
                            campaign_id: campaign.id,
                        });
                }
                Ok(())
            }
        }
    }

    async fn remediate(
        &self,
        task: &TaskRow,
        campaign_mode: &str,
        cancel: &CancellationToken,
    ) -> Result<i64> {
        let job_row = self
            .db
            .get_scan_job(task.scan_job_id)
            .await?
            .ok_or_else(|| Error::Orchestrator(format!("scan job {} missing", task.scan_job_id)))?;
        let provider = self.providers.get(&job_row.provider)?;
        let repo = provider.get_repo(&job_row.owner, &job_row.repo)?;

        let branch_opt = (!job_row.branch.is_empty()).then(|| job_row.branch.clone());
        let (clone, handle) = self
            .clones
            .clone_shallow(
                &repo.clone_url,
                &job_row.owner,
                &job_row.repo,
                branch_opt.as_deref(),
                cancel,
            )
            .await?;

        let mode = AgentMode::parse(campaign_mode).unwrap_or(self.config.mode);
        let effective = Arc::new(Config {
            mode,
            ..(*self.config).clone()
        });
        let fixer = Fixer::new(
            effective,
            self.db.clone(),
            Arc::clone(&self.ai),
            self.events.clone(),
        );

        let fix_job = FixJob {
            scan_job_id: task.scan_job_id,
            remediation_task_id: Some(task.id),
            provider: job_row.provider.clone(),
            owner: job_row.owner.clone(),
            repo: job_row.repo.clone(),
            branch: job_row.branch.clone(),
            commit: job_row.commit_sha.clone(),
            clone_path: clone.path.clone(),
            cleanup: Arc::clone(&handle),
        };

        let result = fixer.process(&fix_job, cancel).await;
        fix_job.release();
        result.map(|report| report.counters.queued)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::NoopProvider;
    use crate::db::NewScanJob;
    use crate::discovery::tests::{FakeFeed, FakeGitProvider, test_config};
    use crate::process::run_git;
    use std::sync::Mutex as StdMutex;

    async fn fixture_repo(dir: &std::path::Path) {
        let cancel = CancellationToken::new();
        std::fs::create_dir_all(dir).unwrap();
        run_git(dir, &["init", "-b", "main"], &cancel).await.unwrap();
        run_git(dir, &["config", "user.email", "t@t"], &cancel).await.unwrap();
        run_git(dir, &["config", "user.name", "t"], &cancel).await.unwrap();
        std::fs::write(dir.join("README.md"), "hello\n").unwrap();
        run_git(dir, &["add", "-A"], &cancel).await.unwrap();
        run_git(dir, &["commit", "-m", "init"], &cancel).await.unwrap();
    }

    async fn orchestrator_with_local_repo(
        tmp: &tempfile::TempDir,
        events: EventHooks,
    ) -> (Arc<Orchestrator>, Db) {
        let upstream = tmp.path().join("upstream");
        fixture_repo(&upstream).await;

        let db = Db::in_memory().await.unwrap();
        let mut provider = FakeGitProvider::with_repos(&[]);
        provider.repos.push(crate::providers::RepoRef {
            provider: "github".to_string(),
            owner: "octo".to_string(),
            name: "webapp".to_string(),
            clone_url: upstream.display().to_string(),
            default_branch: "main".to_string(),
        });

        let mut config = test_config();
        config.scanners = vec![];
        config.scratch_dir = tmp.path().join("scratch");

        let orchestrator = Orchestrator::with_parts(
            config,
            db.clone(),
            ProviderRegistry::with_provider(Arc::new(provider)),
            Arc::new(NoopProvider),
            Arc::new(FakeFeed { advisories: vec![] }),
            events,
        );
        (orchestrator, db)
    }

    #[tokio::test]
    async fn test_trigger_coalesced_while_sweep_active() {
        let tmp = tempfile::tempdir().unwrap();
        let (orchestrator, _db) =
            orchestrator_with_local_repo(&tmp, EventHooks::default()).await;

        // Simulate an active sweep
        {
            let mut inner = orchestrator.inner.lock().unwrap();
            inner.active_sweep_cancel = Some(CancellationToken::new());
        }
        orchestrator.trigger(SweepOverrides {
            workers: Some(1),
            ..Default::default()
        });
        orchestrator.trigger(SweepOverrides {
            workers: Some(9),
            ..Default::default()
        });

        let inner = orchestrator.inner.lock().unwrap();
        // Only the latest pending trigger is retained
        assert_eq!(inner.pending_trigger.as_ref().unwrap().workers, Some(9));
    }

    #[tokio::test]
    async fn test_trigger_enqueues_when_idle() {
        let tmp = tempfile::tempdir().unwrap();
        let (orchestrator, _db) =
            orchestrator_with_local_repo(&tmp, EventHooks::default()).await;
        orchestrator.trigger(SweepOverrides::default());

        let mut rx = orchestrator.trigger_rx.lock().unwrap().take().unwrap();
        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_run_once_sweeps_and_fires_events() {
        let tmp = tempfile::tempdir().unwrap();
        let started: Arc<StdMutex<u32>> = Arc::new(StdMutex::new(0));
        let completed: Arc<StdMutex<Option<SweepSummary>>> = Arc::new(StdMutex::new(None));
        let started_hook = started.clone();
        let completed_hook = completed.clone();
        let events = EventHooks::default()
            .on_sweep_started(move |_| *started_hook.lock().unwrap() += 1)
            .on_sweep_completed(move |s| *completed_hook.lock().unwrap() = Some(s.clone()));

        let (orchestrator, db) = orchestrator_with_local_repo(&tmp, events).await;
        let cancel = CancellationToken::new();
        let summary = orchestrator.run_once(&cancel).await.unwrap();

        assert_eq!(summary.repos_discovered, 1);
        assert_eq!(summary.repos_scanned, 1);
        assert_eq!(*started.lock().unwrap(), 1);
        assert!(completed.lock().unwrap().is_some());

        // A scan job row landed in a terminal state
        let row = db.get_scan_job(1).await.unwrap().unwrap();
        assert_eq!(row.status, "completed");
        assert_eq!(row.owner, "octo");
        assert_eq!(row.branch, "main");
        assert_eq!(row.commit_sha.len(), 40);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_second_sweep_freshness_skips() {
        let tmp = tempfile::tempdir().unwrap();
        let skips: Arc<StdMutex<Vec<(String, String)>>> = Arc::new(StdMutex::new(Vec::new()));
        let skips_hook = skips.clone();
        let events = EventHooks::default().on_repo_skipped(move |(repo, reason)| {
            skips_hook.lock().unwrap().push((repo.clone(), reason.clone()));
        });
        let (orchestrator, _db) = orchestrator_with_local_repo(&tmp, events).await;

        let cancel = CancellationToken::new();
        let first = orchestrator.run_once(&cancel).await.unwrap();
        assert_eq!(first.repos_scanned, 1);

        let second = orchestrator.run_once(&cancel).await.unwrap();
        assert_eq!(second.repos_scanned, 0);
        assert_eq!(second.skips.get(SKIP_REASON_FRESH), Some(&1));

        let skipped = skips.lock().unwrap();
        assert_eq!(skipped.len(), 1);
        assert_eq!(skipped[0].0, "octo/webapp");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stop_current_sweep_cancels_only_sweep() {
        let tmp = tempfile::tempdir().unwrap();
        let (orchestrator, _db) =
            orchestrator_with_local_repo(&tmp, EventHooks::default()).await;
        {
            let mut inner = orchestrator.inner.lock().unwrap();
            let token = CancellationToken::new();
            inner.active_sweep_cancel = Some(token.clone());
            drop(inner);
            orchestrator.stop_current_sweep();
            assert!(token.is_cancelled());
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_remediation_task_completes_with_noop_ai() {
        let tmp = tempfile::tempdir().unwrap();
        let events_seen: Arc<StdMutex<Vec<String>>> = Arc::new(StdMutex::new(Vec::new()));
        let hook = events_seen.clone();
        let events = EventHooks::default().on_remediation(move |event| {
            let name = match event {
                RemediationEvent::TaskStarted { .. } => "task.started",
                RemediationEvent::TaskProgress { .. } => "task.progress",
                RemediationEvent::TaskCompleted { .. } => "task.completed",
                RemediationEvent::TaskFailed { .. } => "task.failed",
                RemediationEvent::CampaignCompleted { .. } => "campaign.completed",
            };
            hook.lock().unwrap().push(name.to_string());
        });
        let (orchestrator, db) = orchestrator_with_local_repo(&tmp, events).await;

        let scan_job_id = db
            .insert_scan_job(&NewScanJob {
                provider: "github".to_string(),
                owner: "octo".to_string(),
                repo: "webapp".to_string(),
                branch: "main".to_string(),
                commit_sha: "abc".to_string(),
            })
            .await
            .unwrap();
        let campaign = db.insert_campaign("camp", "auto", false).await.unwrap();
        let task_id = db.insert_remediation_task(campaign, scan_job_id).await.unwrap();
        let task = db.get_remediation_task(task_id).await.unwrap().unwrap();

        let cancel = CancellationToken::new();
        orchestrator.run_remediation_task(&task, &cancel).await.unwrap();

        let row = db.get_remediation_task(task_id).await.unwrap().unwrap();
        assert_eq!(row.status, "completed");
        // Noop AI → triage marked unavailable
        assert_eq!(row.triage_status, "ai_unavailable");

        let campaign_row = db.get_campaign(campaign).await.unwrap().unwrap();
        assert_eq!(campaign_row.tasks_completed, 1);
        assert_eq!(campaign_row.status, "completed");

        let seen = events_seen.lock().unwrap();
        assert!(seen.contains(&"task.started".to_string()));
        assert!(seen.contains(&"task.completed".to_string()));
        assert!(seen.contains(&"campaign.completed".to_string()));
    }

    #[tokio::test]
    async fn test_recover_requeues_running_tasks() {
        let tmp = tempfile::tempdir().unwrap();
        let (orchestrator, db) =
            orchestrator_with_local_repo(&tmp, EventHooks::default()).await;

        let scan_job_id = db
            .insert_scan_job(&NewScanJob {
                provider: "github".to_string(),
                owner: "octo".to_string(),
                repo: "webapp".to_string(),
                branch: "main".to_string(),
                commit_sha: "abc".to_string(),
            })
            .await
            .unwrap();
        let campaign = db.insert_campaign("camp", "auto", false).await.unwrap();
        let task_id = db.insert_remediation_task(campaign, scan_job_id).await.unwrap();
        db.set_task_status(task_id, TaskStatus::Running, None).await.unwrap();

        orchestrator.recover().await.unwrap();
        let row = db.get_remediation_task(task_id).await.unwrap().unwrap();
        assert_eq!(row.status, "pending");
        assert_eq!(row.error_message.as_deref(), Some("requeued after restart"));
    }
}
