use std::collections::HashMap;
use std::sync::Arc;

/// Live view of one scanner worker, fed to the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerPhase {
    Waiting,
    Running,
    Stopped,
    Failed,
}

impl WorkerPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            WorkerPhase::Waiting => "waiting",
            WorkerPhase::Running => "running",
            WorkerPhase::Stopped => "stopped",
            WorkerPhase::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerStatus {
    pub phase: WorkerPhase,
    pub action: String,
    pub repo: Option<String>,
}

impl WorkerStatus {
    pub fn new(phase: WorkerPhase, action: impl Into<String>, repo: Option<String>) -> Self {
        Self {
            phase,
            action: action.into(),
            repo,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepSummary {
    pub repos_discovered: u64,
    pub repos_scanned: u64,
    pub repos_failed: u64,
    /// Skip counts keyed by reason.
    pub skips: HashMap<String, u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RemediationEvent {
    TaskStarted {
        campaign_id: i64,
        task_id: i64,
    },
    TaskProgress {
        task_id: i64,
        phase: String,
        current: i64,
        total: i64,
        note: String,
    },
    TaskCompleted {
        task_id: i64,
        fixes_queued: i64,
    },
    TaskFailed {
        task_id: i64,
        error: String,
    },
    CampaignCompleted {
        campaign_id: i64,
    },
}

type Hook<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Opt-in callbacks the orchestrator fires as a sweep progresses. Every
/// hook defaults to a no-op.
#[derive(Clone, Default)]
pub struct EventHooks {
    sweep_started: Option<Hook<()>>,
    sweep_completed: Option<Hook<SweepSummary>>,
    repo_skipped: Option<Hook<(String, String)>>,
    worker_status: Option<Hook<(String, WorkerStatus)>>,
    remediation: Option<Hook<RemediationEvent>>,
}

impl EventHooks {
    pub fn on_sweep_started(mut self, f: impl Fn(&()) + Send + Sync + 'static) -> Self {
        self.sweep_started = Some(Arc::new(f));
        self
    }

    pub fn on_sweep_completed(mut self, f: impl Fn(&SweepSummary) + Send + Sync + 'static) -> Self {
        self.sweep_completed = Some(Arc::new(f));
        self
    }

    /// `(repo, reason)`
    pub fn on_repo_skipped(mut self, f: impl Fn(&(String, String)) + Send + Sync + 'static) -> Self {
        self.repo_skipped = Some(Arc::new(f));
        self
    }

    /// `(worker id, status)`
    pub fn on_worker_status(
        mut self,
        f: impl Fn(&(String, WorkerStatus)) + Send + Sync + 'static,
    ) -> Self {
        self.worker_status = Some(Arc::new(f));
        self
    }

    pub fn on_remediation(mut self, f: impl Fn(&RemediationEvent) + Send + Sync + 'static) -> Self {
        self.remediation = Some(Arc::new(f));
        self
    }

    pub fn fire_sweep_started(&self) {
        if let Some(hook) = &self.sweep_started {
            hook(&());
        }
    }

    pub fn fire_sweep_completed(&self, summary: &SweepSummary) {
        if let Some(hook) = &self.sweep_completed {
            hook(summary);
        }
    }

    pub fn fire_repo_skipped(&self, repo: String, reason: String) {
        if let Some(hook) = &self.repo_skipped {
            hook(&(repo, reason));
        }
    }

    pub fn fire_worker_status(&self, worker: String, status: WorkerStatus) {
        if let Some(hook) = &self.worker_status {
            hook(&(worker, status));
        }
    }

    pub fn fire_remediation(&self, event: RemediationEvent) {
        if let Some(hook) = &self.remediation {
            hook(&event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_default_hooks_are_noops() {
        let hooks = EventHooks::default();
        hooks.fire_sweep_started();
        hooks.fire_repo_skipped("octo/webapp".to_string(), "fresh".to_string());
        hooks.fire_sweep_completed(&SweepSummary::default());
    }

    #[test]
    fn test_hooks_receive_events() {
        let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let seen_skips = seen.clone();
        let seen_status = seen.clone();
        let hooks = EventHooks::default()
            .on_repo_skipped(move |(repo, reason)| {
                seen_skips.lock().unwrap().push(format!("{repo}: {reason}"));
            })
            .on_worker_status(move |(worker, status)| {
                seen_status
                    .lock()
                    .unwrap()
                    .push(format!("{worker}: {}", status.phase.as_str()));
            });

        hooks.fire_repo_skipped(
            "octo/webapp".to_string(),
            "recently scanned within 24h".to_string(),
        );
        hooks.fire_worker_status(
            "scanner-1".to_string(),
            WorkerStatus::new(WorkerPhase::Running, "cloning", None),
        );

        let events = seen.lock().unwrap();
        assert_eq!(events.len(), 2);
        assert!(events[0].contains("recently scanned within 24h"));
        assert!(events[1].contains("scanner-1: running"));
    }
}
