use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::ai::{
    AiProvider, ApplyHints, ApplyStrategy, Ecosystem, FixRequest, TriagedFinding,
};
use crate::config::{AgentMode, Config};
use crate::db::{Db, NewFix, ProgressPhase, TaskStatus, TriageStatus};
use crate::error::{Error, Result};
use crate::events::{EventHooks, RemediationEvent};
use crate::findings::{self, Finding, FindingKind};
use crate::patch::{clean_patch, looks_like_unified_diff_patch, safe_repo_join};
use crate::scan_worker::FixJob;
use crate::scanner::scanner_by_name;

const DEFAULT_CHUNK_SIZE: usize = 40;
const MAX_FULL_FILE_LINES: usize = 300;
const DEFAULT_WINDOW: usize = 10;
const LOCAL_WINDOW: usize = 30;

const CHUNK_ENV: &str = "CTRLSCAN_TRIAGE_CHUNK";
const STREAM_ENV: &str = "CTRLSCAN_STREAM_FIXES";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixCounters {
    pub attempted: i64,
    pub queued: i64,
    pub skipped_low_conf: i64,
    pub failed: i64,
}

impl FixCounters {
    fn zero() -> Self {
        Self {
            attempted: 0,
            queued: 0,
            skipped_low_conf: 0,
            failed: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixerReport {
    pub triage_status: TriageStatus,
    pub counters: FixCounters,
}

impl FixerReport {
    fn early(status: TriageStatus) -> Self {
        Self {
            triage_status: status,
            counters: FixCounters::zero(),
        }
    }
}

/// Single consumer of the fix queue: dedupes findings, runs chunked triage
/// with checkpointing, generates patches and inserts fix-queue rows.
pub struct Fixer {
    config: Arc<Config>,
    db: Db,
    ai: Arc<dyn AiProvider>,
    events: EventHooks,
}

impl Fixer {
    pub fn new(config: Arc<Config>, db: Db, ai: Arc<dyn AiProvider>, events: EventHooks) -> Self {
        Self {
            config,
            db,
            ai,
            events,
        }
    }

    fn fire_progress(&self, task_id: i64, phase: &str, current: i64, total: i64, note: &str) {
        self.events.fire_remediation(RemediationEvent::TaskProgress {
            task_id,
            phase: phase.to_string(),
            current,
            total,
            note: note.to_string(),
        });
    }

    /// Drain the sweep's fix queue until it closes. Each job's clone is
    /// released exactly once, here.
    pub async fn run(&self, mut rx: mpsc::Receiver<FixJob>, cancel: &CancellationToken) {
        while let Some(job) = rx.recv().await {
            let repo = job.repo_slug();
            let result = self.process(&job, cancel).await;
            job.release();
            match result {
                Ok(report) => {
                    info!(
                        repo = %repo,
                        triage_status = report.triage_status.as_str(),
                        queued = report.counters.queued,
                        "fix job done"
                    );
                }
                Err(Error::Cancelled) => {
                    // Drain remaining jobs, releasing their clones.
                    while let Ok(job) = rx.try_recv() {
                        job.release();
                    }
                    return;
                }
                Err(e) => {
                    warn!(repo = %repo, error = %e, "fix job failed");
                }
            }
        }
    }

    pub async fn process(&self, job: &FixJob, cancel: &CancellationToken) -> Result<FixerReport> {
        let task_id = job.remediation_task_id;

        // 1. No provider, no triage. Scan results are already persisted.
        if !self.ai.is_available().await {
            info!(repo = %job.repo_slug(), "ai unavailable, skipping fix phase");
            if let Some(id) = task_id {
                self.db
                    .set_triage_outcome(id, TriageStatus::AiUnavailable, "")
                    .await?;
            }
            return Ok(FixerReport::early(TriageStatus::AiUnavailable));
        }

        // 2. Resume directly into fix generation when a completed triage
        //    survived a restart.
        let task = match task_id {
            Some(id) => self.db.get_remediation_task(id).await?,
            None => None,
        };
        if let Some(task) = &task
            && task.fix_resumable()
        {
            let prioritized: Vec<TriagedFinding> = serde_json::from_str(&task.prioritized_json)
                .map_err(|e| Error::Fixer(format!("corrupt prioritized list: {e}")))?;
            let skip = if task.progress_phase == "fixing" {
                task.progress_current as usize
            } else {
                0
            };
            info!(task = task.id, skip, "resuming fix generation");
            let by_id = self.load_deduped_findings(job).await?.1;
            let counters = FixCounters {
                attempted: task.fix_attempted,
                queued: task.fix_queued,
                skipped_low_conf: task.fix_skipped_low_conf,
                failed: task.fix_failed,
            };
            let counters = self
                .fix_loop(job, &prioritized, &by_id, skip, counters, cancel)
                .await?;
            self.finish_task(task_id, TriageStatus::Completed, counters).await?;
            return Ok(FixerReport {
                triage_status: TriageStatus::Completed,
                counters,
            });
        }

        if let Some(id) = task_id {
            self.db
                .set_task_progress(id, ProgressPhase::LoadingFindings, 0, 0, "loading findings")
                .await?;
        }

        // 3-6. Load, pre-filter, drop already-processed, dedupe.
        let (loaded_count, by_id, deduped) = {
            let (deduped, by_id, loaded_count) = self.load_pipeline(job).await?;
            (loaded_count, by_id, deduped)
        };

        if loaded_count == 0 {
            if let Some(id) = task_id {
                self.db
                    .set_triage_outcome(id, TriageStatus::NoFindings, "")
                    .await?;
                self.db.set_task_status(id, TaskStatus::Completed, None).await?;
            }
            return Ok(FixerReport::early(TriageStatus::NoFindings));
        }
        let outcome_if_empty = if deduped.is_empty() {
            // Distinguish "filtered to nothing" from "all already queued".
            let any_open = self.any_unprocessed(job).await?;
            if any_open {
                TriageStatus::NoActionableFindings
            } else {
                TriageStatus::AllFindingsAlreadyProcessed
            }
        } else {
            TriageStatus::Running
        };
        if deduped.is_empty() {
            if let Some(id) = task_id {
                self.db.set_triage_outcome(id, outcome_if_empty, "").await?;
                self.db.set_task_status(id, TaskStatus::Completed, None).await?;
            }
            return Ok(FixerReport::early(outcome_if_empty));
        }

        if let Some(id) = task_id {
            self.db
                .set_task_counts(id, loaded_count as i64, deduped.len() as i64)
                .await?;
        }

        // 7-8. Triage, chunked or streaming.
        let chunk_size = self.resolve_chunk_size();
        let streaming = chunk_size == 1 || env_flag(STREAM_ENV);

        let (prioritized, triage_status) = if streaming {
            return self.run_streaming(job, &deduped, &by_id, cancel).await;
        } else {
            self.run_chunked_triage(job, task.as_ref(), &deduped, chunk_size, cancel)
                .await?
        };

        // 9-10. Fix generation.
        let counters = self
            .fix_loop(job, &prioritized, &by_id, 0, FixCounters::zero(), cancel)
            .await?;
        self.finish_task(task_id, triage_status, counters).await?;

        Ok(FixerReport {
            triage_status,
            counters,
        })
    }

    // -----------------------------------------------------------------
    // Loading
    // -----------------------------------------------------------------

    /// Findings for the scan job: unified table first, then the legacy
    /// tables, finally a re-parse of persisted raw outputs.
    async fn load_findings(&self, job: &FixJob) -> Result<Vec<Finding>> {
        let unified = self.db.load_open_findings(job.scan_job_id).await?;
        if !unified.is_empty() {
            return Ok(unified);
        }
        let legacy = self.db.load_legacy_findings(job.scan_job_id).await?;
        if !legacy.is_empty() {
            return Ok(legacy);
        }

        let mut reparsed = Vec::new();
        for (scanner_name, raw) in self.db.list_raw_outputs(job.scan_job_id).await? {
            let Some(scanner) = scanner_by_name(&scanner_name) else {
                continue;
            };
            match scanner.parse(&raw, &job.clone_path) {
                Ok(findings) => reparsed.extend(findings),
                Err(e) => {
                    warn!(scanner = %scanner_name, error = %e, "raw output re-parse failed")
                }
            }
        }
        Ok(reparsed)
    }

    async fn load_pipeline(
        &self,
        job: &FixJob,
    ) -> Result<(Vec<Finding>, HashMap<String, Finding>, usize)> {
        let loaded = self.load_findings(job).await?;
        let loaded_count = loaded.len();

        let ignore_rules = self.db.list_ignore_rules().await?;
        let filtered = findings::prefilter(loaded, &ignore_rules);

        // 5. Skip findings that already have an open fix-queue row, unless
        //    the force-retry escape hatch is set.
        let mut eligible = Vec::new();
        for finding in filtered {
            if !self.config.force_retry
                && self
                    .db
                    .has_open_fix_attempt(job.scan_job_id, &finding.id)
                    .await?
            {
                continue;
            }
            eligible.push(finding);
        }

        let deduped = findings::dedupe(eligible);
        let by_id: HashMap<String, Finding> =
            deduped.iter().map(|f| (f.id.clone(), f.clone())).collect();
        Ok((deduped, by_id, loaded_count))
    }

    async fn load_deduped_findings(
        &self,
        job: &FixJob,
    ) -> Result<(Vec<Finding>, HashMap<String, Finding>)> {
        // Resume path: rebuild the id → finding map without the
        // already-processed filter (their rows exist by definition).
        let loaded = self.load_findings(job).await?;
        let ignore_rules = self.db.list_ignore_rules().await?;
        let deduped = findings::dedupe(findings::prefilter(loaded, &ignore_rules));
        let by_id = deduped.iter().map(|f| (f.id.clone(), f.clone())).collect();
        Ok((deduped, by_id))
    }

    async fn any_unprocessed(&self, job: &FixJob) -> Result<bool> {
        let loaded = self.load_findings(job).await?;
        let ignore_rules = self.db.list_ignore_rules().await?;
        let filtered = findings::prefilter(loaded, &ignore_rules);
        if filtered.is_empty() {
            // Nothing actionable at all
            return Ok(true);
        }
        for finding in &filtered {
            if !self
                .db
                .has_open_fix_attempt(job.scan_job_id, &finding.id)
                .await?
            {
                return Ok(true);
            }
        }
        Ok(false)
    }

    // -----------------------------------------------------------------
    // Triage
    // -----------------------------------------------------------------

    fn resolve_chunk_size(&self) -> usize {
        if let Ok(raw) = std::env::var(CHUNK_ENV)
            && let Ok(value) = raw.trim().parse::<usize>()
            && value > 0
        {
            return value;
        }
        let provider = self.ai.info().name;
        if self.config.ai.local_optimized || provider == "ollama" || provider == "local" {
            return 1;
        }
        self.config.ai.triage_chunk_size.unwrap_or(DEFAULT_CHUNK_SIZE)
    }

    fn local_fallback_order(chunk: &[Finding], offset: usize) -> Vec<TriagedFinding> {
        chunk
            .iter()
            .enumerate()
            .map(|(i, f)| TriagedFinding {
                finding_id: f.id.clone(),
                priority: (offset + i + 1) as u32,
                rationale: "local severity fallback".to_string(),
                suggested_fix: String::new(),
            })
            .collect()
    }

    /// Renumber a chunk's triage result globally: model order first (ids
    /// restricted to the chunk), findings the model dropped appended in
    /// local order.
    fn renumber_chunk(
        chunk: &[Finding],
        model_order: &[TriagedFinding],
        offset: usize,
    ) -> Vec<TriagedFinding> {
        let chunk_ids: HashMap<&str, &Finding> =
            chunk.iter().map(|f| (f.id.as_str(), f)).collect();

        let mut ordered: Vec<TriagedFinding> = model_order
            .iter()
            .filter(|t| chunk_ids.contains_key(t.finding_id.as_str()))
            .cloned()
            .collect();
        ordered.sort_by_key(|t| t.priority);
        ordered.dedup_by(|a, b| a.finding_id == b.finding_id);

        for finding in chunk {
            if !ordered.iter().any(|t| t.finding_id == finding.id) {
                ordered.push(TriagedFinding {
                    finding_id: finding.id.clone(),
                    priority: 0,
                    rationale: "local severity fallback".to_string(),
                    suggested_fix: String::new(),
                });
            }
        }

        for (i, entry) in ordered.iter_mut().enumerate() {
            entry.priority = (offset + i + 1) as u32;
        }
        ordered
    }

    async fn run_chunked_triage(
        &self,
        job: &FixJob,
        task: Option<&crate::db::TaskRow>,
        deduped: &[Finding],
        chunk_size: usize,
        cancel: &CancellationToken,
    ) -> Result<(Vec<TriagedFinding>, TriageStatus)> {
        let chunks: Vec<&[Finding]> = deduped.chunks(chunk_size).collect();
        let total_batches = chunks.len() as i64;

        // Resume mid-triage from the last checkpoint.
        let (mut prioritized, start_batch) = match task {
            Some(t) if t.triage_resumable() && t.progress_total == total_batches => {
                let existing: Vec<TriagedFinding> = serde_json::from_str(&t.prioritized_json)
                    .map_err(|e| Error::Fixer(format!("corrupt prioritized list: {e}")))?;
                info!(task = t.id, batch = t.progress_current, "resuming chunked triage");
                (existing, t.progress_current as usize)
            }
            _ => (Vec::new(), 0),
        };

        let mut summaries: Vec<String> = Vec::new();
        let mut any_model_success = !prioritized.is_empty();

        for (index, chunk) in chunks.iter().enumerate().skip(start_batch) {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let offset = prioritized.len();
            let result = with_cancel(cancel, self.ai.triage_findings(chunk)).await;

            let batch = match result {
                Ok(outcome) => {
                    if !outcome.summary.is_empty() {
                        summaries.push(outcome.summary.clone());
                    }
                    if outcome.prioritised.is_empty() {
                        // Summary-only response: local order for this chunk.
                        Self::local_fallback_order(chunk, offset)
                    } else {
                        any_model_success = true;
                        Self::renumber_chunk(chunk, &outcome.prioritised, offset)
                    }
                }
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(e) => {
                    warn!(batch = index + 1, error = %e, "triage batch failed, local fallback");
                    Self::local_fallback_order(chunk, offset)
                }
            };
            prioritized.extend(batch);

            if let Some(t) = task {
                let json = serde_json::to_string(&prioritized)
                    .map_err(|e| Error::Fixer(format!("serialize prioritized: {e}")))?;
                self.db
                    .checkpoint_triage(
                        t.id,
                        TriageStatus::Running,
                        total_batches,
                        &json,
                        (index + 1) as i64,
                        total_batches,
                        &format!("triage batch {}/{}", index + 1, total_batches),
                    )
                    .await?;
                self.fire_progress(
                    t.id,
                    "triage",
                    (index + 1) as i64,
                    total_batches,
                    "triage batch complete",
                );
            }
        }

        let status = if any_model_success {
            TriageStatus::Completed
        } else {
            TriageStatus::FailedFallback
        };
        let summary = summaries.join("\n");

        if let Some(t) = task {
            let json = serde_json::to_string(&prioritized)
                .map_err(|e| Error::Fixer(format!("serialize prioritized: {e}")))?;
            self.db
                .checkpoint_triage(
                    t.id,
                    status,
                    total_batches,
                    &json,
                    total_batches,
                    total_batches,
                    "triage complete",
                )
                .await?;
            self.db.set_triage_outcome(t.id, status, &summary).await?;
        }

        info!(
            repo = %job.repo_slug(),
            batches = total_batches,
            findings = prioritized.len(),
            status = status.as_str(),
            "triage finished"
        );
        Ok((prioritized, status))
    }

    /// Streaming mode: triage one finding, generate its fix immediately.
    async fn run_streaming(
        &self,
        job: &FixJob,
        deduped: &[Finding],
        by_id: &HashMap<String, Finding>,
        cancel: &CancellationToken,
    ) -> Result<FixerReport> {
        let task_id = job.remediation_task_id;
        let mut prioritized = Vec::new();
        let mut counters = FixCounters::zero();
        let mut any_model_success = false;

        for (index, finding) in deduped.iter().enumerate() {
            if counters.attempted >= self.config.max_fix_attempts as i64 {
                break;
            }
            let chunk = std::slice::from_ref(finding);
            let entry = match with_cancel(cancel, self.ai.triage_findings(chunk)).await {
                Ok(outcome) if !outcome.prioritised.is_empty() => {
                    any_model_success = true;
                    Self::renumber_chunk(chunk, &outcome.prioritised, index)
                }
                Ok(_) => Self::local_fallback_order(chunk, index),
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(e) => {
                    warn!(finding = %finding.id, error = %e, "streaming triage failed, local fallback");
                    Self::local_fallback_order(chunk, index)
                }
            };

            counters = self
                .attempt_fix(job, &entry[0], by_id, counters, cancel)
                .await?;
            prioritized.extend(entry);

            if let Some(id) = task_id {
                let json = serde_json::to_string(&prioritized)
                    .map_err(|e| Error::Fixer(format!("serialize prioritized: {e}")))?;
                self.db
                    .checkpoint_triage(
                        id,
                        TriageStatus::Running,
                        deduped.len() as i64,
                        &json,
                        (index + 1) as i64,
                        deduped.len() as i64,
                        &format!("streamed {}/{}", index + 1, deduped.len()),
                    )
                    .await?;
                self.persist_counters(id, counters).await?;
                self.fire_progress(
                    id,
                    "triage",
                    (index + 1) as i64,
                    deduped.len() as i64,
                    "streamed finding",
                );
            }
        }

        let status = if any_model_success {
            TriageStatus::Completed
        } else {
            TriageStatus::FailedFallback
        };
        self.finish_task(task_id, status, counters).await?;
        Ok(FixerReport {
            triage_status: status,
            counters,
        })
    }

    // -----------------------------------------------------------------
    // Fix generation
    // -----------------------------------------------------------------

    async fn fix_loop(
        &self,
        job: &FixJob,
        prioritized: &[TriagedFinding],
        by_id: &HashMap<String, Finding>,
        skip: usize,
        mut counters: FixCounters,
        cancel: &CancellationToken,
    ) -> Result<FixCounters> {
        let task_id = job.remediation_task_id;
        let total = prioritized.len() as i64;

        for (index, entry) in prioritized.iter().enumerate().skip(skip) {
            if counters.attempted >= self.config.max_fix_attempts as i64 {
                info!(cap = self.config.max_fix_attempts, "fix attempt cap reached");
                break;
            }
            if let Some(id) = task_id {
                self.db
                    .set_task_progress(
                        id,
                        ProgressPhase::Fixing,
                        index as i64,
                        total,
                        &format!("fixing {}", entry.finding_id),
                    )
                    .await?;
            }

            counters = self.attempt_fix(job, entry, by_id, counters, cancel).await?;

            if let Some(id) = task_id {
                self.persist_counters(id, counters).await?;
                self.db
                    .set_task_progress(
                        id,
                        ProgressPhase::Fixing,
                        (index + 1) as i64,
                        total,
                        &format!("fixed {}", entry.finding_id),
                    )
                    .await?;
                self.fire_progress(id, "fixing", (index + 1) as i64, total, &entry.finding_id);
            }
        }
        Ok(counters)
    }

    async fn attempt_fix(
        &self,
        job: &FixJob,
        entry: &TriagedFinding,
        by_id: &HashMap<String, Finding>,
        mut counters: FixCounters,
        cancel: &CancellationToken,
    ) -> Result<FixCounters> {
        let Some(finding) = by_id.get(&entry.finding_id) else {
            warn!(finding = %entry.finding_id, "prioritized finding not in working set, skipping");
            return Ok(counters);
        };
        counters.attempted += 1;

        // Deterministic dependency bump: no model call.
        if let Some(hints) = dependency_bump_hints(finding) {
            match self.insert_fix(job, finding, "", "", &hints).await {
                Ok(()) => counters.queued += 1,
                Err(e) => {
                    warn!(finding = %finding.id, error = %e, "fix insert failed");
                    counters.failed += 1;
                }
            }
            return Ok(counters);
        }

        let file_context = match self.build_file_context(&job.clone_path, finding) {
            Ok(context) => context,
            Err(e) => {
                warn!(finding = %finding.id, error = %e, "cannot read target file");
                counters.failed += 1;
                return Ok(counters);
            }
        };

        let request = FixRequest {
            finding: finding.clone(),
            file_context,
            repo_slug: job.repo_slug(),
        };
        let outcome = match with_cancel(cancel, self.ai.generate_fix(&request)).await {
            Ok(outcome) => outcome,
            Err(Error::Cancelled) => return Err(Error::Cancelled),
            Err(e) => {
                warn!(finding = %finding.id, error = %e, "fix generation failed");
                counters.failed += 1;
                return Ok(counters);
            }
        };

        let threshold = self.config.ai.confidence_threshold(finding.severity);
        if outcome.confidence < threshold {
            info!(
                finding = %finding.id,
                confidence = outcome.confidence,
                threshold,
                "fix below confidence threshold"
            );
            counters.skipped_low_conf += 1;
            return Ok(counters);
        }

        let patch = clean_patch(&outcome.patch);
        let uses_patch = !matches!(
            outcome.apply_hints.apply_strategy,
            ApplyStrategy::DependencyBump
        );
        if uses_patch && !looks_like_unified_diff_patch(&patch) {
            warn!(finding = %finding.id, "generated patch failed the structural gate");
            counters.failed += 1;
            return Ok(counters);
        }

        match self
            .insert_fix(job, finding, &patch, &outcome.explanation, &outcome.apply_hints)
            .await
        {
            Ok(()) => counters.queued += 1,
            Err(e) => {
                warn!(finding = %finding.id, error = %e, "fix insert failed");
                counters.failed += 1;
            }
        }
        Ok(counters)
    }

    async fn insert_fix(
        &self,
        job: &FixJob,
        finding: &Finding,
        patch: &str,
        _explanation: &str,
        hints: &ApplyHints,
    ) -> Result<()> {
        let info = self.ai.info();
        let fix = NewFix {
            scan_job_id: job.scan_job_id,
            finding_type: finding.kind.as_str().to_string(),
            finding_ref: finding.id.clone(),
            ai_provider: info.name,
            ai_model: info.model,
            ai_endpoint: info.endpoint,
            apply_hints_json: serde_json::to_string(hints)
                .map_err(|e| Error::Fixer(format!("serialize hints: {e}")))?,
            patch: patch.to_string(),
            pr_title: String::new(),
            pr_body: String::new(),
            approved: self.config.mode == AgentMode::Auto,
        };
        self.db.insert_fix(&fix).await?;
        Ok(())
    }

    /// Full file when small, otherwise a ±window slice with the target line
    /// marked `>>`.
    fn build_file_context(&self, clone_path: &Path, finding: &Finding) -> Result<String> {
        let target = safe_repo_join(clone_path, &finding.file_path)?;
        let content = std::fs::read_to_string(&target)
            .map_err(|e| Error::Fixer(format!("read {}: {e}", finding.file_path)))?;
        let lines: Vec<&str> = content.lines().collect();

        let window = if self.config.ai.local_optimized {
            LOCAL_WINDOW
        } else {
            DEFAULT_WINDOW
        };
        let target_line = finding.line.max(0) as usize;

        let (start, end) = if lines.len() <= MAX_FULL_FILE_LINES {
            (0, lines.len())
        } else {
            let center = target_line.max(1) - 1;
            let start = center.saturating_sub(window);
            let end = (center + window + 1).min(lines.len());
            (start, end)
        };

        let mut out = String::new();
        for (i, line) in lines[start..end].iter().enumerate() {
            let number = start + i + 1;
            let marker = if number == target_line { ">>" } else { "  " };
            out.push_str(&format!("{marker}{number:5} | {line}\n"));
        }
        Ok(out)
    }

    async fn persist_counters(&self, task_id: i64, counters: FixCounters) -> Result<()> {
        self.db
            .set_task_fix_counters(
                task_id,
                counters.attempted,
                counters.queued,
                counters.skipped_low_conf,
                counters.failed,
            )
            .await
    }

    async fn finish_task(
        &self,
        task_id: Option<i64>,
        _status: TriageStatus,
        counters: FixCounters,
    ) -> Result<()> {
        if let Some(id) = task_id {
            self.persist_counters(id, counters).await?;
            self.db
                .set_task_progress(id, ProgressPhase::Done, 0, 0, "done")
                .await?;
            self.db.set_task_status(id, TaskStatus::Completed, None).await?;
        }
        Ok(())
    }
}

/// Recognized manifests for the deterministic SCA short-circuit.
fn dependency_bump_hints(finding: &Finding) -> Option<ApplyHints> {
    if finding.kind != FindingKind::Sca
        || finding.package.is_empty()
        || finding.fix_version.is_empty()
    {
        return None;
    }
    let manifest_name = Path::new(&finding.file_path)
        .file_name()?
        .to_string_lossy()
        .to_string();

    let (ecosystem, manifest_path, lockfile_path, target_files) = match manifest_name.as_str() {
        "go.mod" => (
            Ecosystem::Go,
            finding.file_path.clone(),
            String::new(),
            vec![finding.file_path.clone(), "go.sum".to_string()],
        ),
        "package.json" => (
            Ecosystem::Npm,
            finding.file_path.clone(),
            "package-lock.json".to_string(),
            vec![finding.file_path.clone(), "package-lock.json".to_string()],
        ),
        "package-lock.json" => (
            Ecosystem::Npm,
            "package.json".to_string(),
            finding.file_path.clone(),
            vec!["package.json".to_string(), finding.file_path.clone()],
        ),
        _ => return None,
    };

    Some(ApplyHints {
        apply_strategy: ApplyStrategy::DependencyBump,
        ecosystem,
        dependency_name: finding.package.clone(),
        target_version: finding.fix_version.clone(),
        manifest_path,
        lockfile_path,
        target_files,
        prerequisites: Vec::new(),
        post_apply_checks: Vec::new(),
        fallback_patch_notes: String::new(),
        risk_notes: String::new(),
    })
}

fn env_flag(name: &str) -> bool {
    matches!(
        std::env::var(name).as_deref(),
        Ok("1") | Ok("true") | Ok("yes")
    )
}

async fn with_cancel<T>(
    cancel: &CancellationToken,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Error::Cancelled),
        result = fut => result,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::{
        AiError, FixOutcome, FixSummary, PrText, ProviderInfo, TriageOutcome,
    };
    use crate::config::Config;
    use crate::db::NewScanJob;
    use crate::findings::test_finding;
    use crate::severity::Severity;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Fake provider: reverses triage order, returns a fixed-confidence
    /// patch, counts calls.
    struct FakeAi {
        triage_calls: AtomicUsize,
        fix_calls: AtomicUsize,
        confidence: f64,
        patch: String,
        triage_fails: StdMutex<usize>,
        available: bool,
    }

    impl FakeAi {
        fn new(confidence: f64) -> Self {
            Self {
                triage_calls: AtomicUsize::new(0),
                fix_calls: AtomicUsize::new(0),
                confidence,
                patch: "--- a/src/a.js\n+++ b/src/a.js\n@@ -1,1 +1,2 @@\n old\n+new\n".to_string(),
                triage_fails: StdMutex::new(0),
                available: true,
            }
        }

        fn failing_triage(count: usize) -> Self {
            let fake = Self::new(0.9);
            *fake.triage_fails.lock().unwrap() = count;
            fake
        }
    }

    #[async_trait]
    impl AiProvider for FakeAi {
        fn name(&self) -> &str {
            "fake"
        }

        fn info(&self) -> ProviderInfo {
            ProviderInfo {
                name: "fake".to_string(),
                model: "fake-1".to_string(),
                endpoint: "http://fake".to_string(),
            }
        }

        async fn is_available(&self) -> bool {
            self.available
        }

        async fn triage_findings(&self, findings: &[Finding]) -> Result<TriageOutcome> {
            self.triage_calls.fetch_add(1, Ordering::SeqCst);
            {
                let mut fails = self.triage_fails.lock().unwrap();
                if *fails > 0 {
                    *fails -= 1;
                    return Err(AiError::Server {
                        provider: "fake".to_string(),
                        message: "boom".to_string(),
                    }
                    .into());
                }
            }
            // Reverse order so model ranking is distinguishable from input
            let prioritised = findings
                .iter()
                .rev()
                .enumerate()
                .map(|(i, f)| TriagedFinding {
                    finding_id: f.id.clone(),
                    priority: (i + 1) as u32,
                    rationale: "model".to_string(),
                    suggested_fix: String::new(),
                })
                .collect();
            Ok(TriageOutcome {
                summary: "batch summary".to_string(),
                prioritised,
            })
        }

        async fn generate_fix(&self, _req: &FixRequest) -> Result<FixOutcome> {
            self.fix_calls.fetch_add(1, Ordering::SeqCst);
            Ok(FixOutcome {
                patch: self.patch.clone(),
                explanation: "swap".to_string(),
                confidence: self.confidence,
                apply_hints: ApplyHints::default(),
            })
        }

        async fn generate_pr_description(&self, _fixes: &[FixSummary]) -> Result<PrText> {
            Ok(PrText {
                title: "t".to_string(),
                body: "b".to_string(),
            })
        }
    }

    struct Harness {
        fixer: Fixer,
        db: Db,
        ai: Arc<FakeAi>,
        job: FixJob,
        _tmp: tempfile::TempDir,
    }

    async fn harness(ai: FakeAi, mutate: impl FnOnce(&mut Config)) -> Harness {
        let tmp = tempfile::tempdir().unwrap();
        let clone_dir = tmp.path().join("clone");
        std::fs::create_dir_all(clone_dir.join("src")).unwrap();
        std::fs::write(clone_dir.join("src/a.js"), "old\nline2\nline3\n").unwrap();
        std::fs::write(clone_dir.join("package.json"), "{}\n").unwrap();

        let db = Db::in_memory().await.unwrap();
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

        let mut config = crate::discovery::tests::test_config();
        mutate(&mut config);
        let ai = Arc::new(ai);
        let fixer = Fixer::new(Arc::new(config), db.clone(), ai.clone(), EventHooks::default());

        let job = FixJob {
            scan_job_id,
            remediation_task_id: None,
            provider: "github".to_string(),
            owner: "octo".to_string(),
            repo: "webapp".to_string(),
            branch: "main".to_string(),
            commit: "abc".to_string(),
            clone_path: clone_dir.clone(),
            cleanup: Arc::new(crate::clone::CloneHandle::new_for_tests(clone_dir)),
        };
        Harness {
            fixer,
            db,
            ai,
            job,
            _tmp: tmp,
        }
    }

    fn sca_finding() -> Finding {
        let mut f = test_finding(FindingKind::Sca, Severity::High, "package.json");
        f.package = "lodash".to_string();
        f.package_version = "4.17.20".to_string();
        f.fix_version = "4.17.21".to_string();
        f.id = Finding::make_id(FindingKind::Sca, &f.scanner, &f.title, "package.json", 0, "lodash");
        f
    }

    #[tokio::test]
    async fn test_ai_unavailable_short_exit() {
        let mut ai = FakeAi::new(0.9);
        ai.available = false;
        let h = harness(ai, |_| {}).await;
        let cancel = CancellationToken::new();
        let report = h.fixer.process(&h.job, &cancel).await.unwrap();
        assert_eq!(report.triage_status, TriageStatus::AiUnavailable);
        assert_eq!(h.ai.triage_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_no_findings() {
        let h = harness(FakeAi::new(0.9), |_| {}).await;
        let cancel = CancellationToken::new();
        let report = h.fixer.process(&h.job, &cancel).await.unwrap();
        assert_eq!(report.triage_status, TriageStatus::NoFindings);
    }

    #[tokio::test]
    async fn test_sca_short_circuit_no_model_call() {
        let h = harness(FakeAi::new(0.9), |_| {}).await;
        h.db.insert_findings(h.job.scan_job_id, &[sca_finding()])
            .await
            .unwrap();
        let cancel = CancellationToken::new();
        let report = h.fixer.process(&h.job, &cancel).await.unwrap();

        assert_eq!(report.counters.queued, 1);
        // Triage ran, but no fix-generation model call was issued
        assert_eq!(h.ai.fix_calls.load(Ordering::SeqCst), 0);

        let fixes = sqlx::query_as::<_, crate::db::FixQueueRow>("SELECT * FROM fix_queue")
            .fetch_all(h.db.pool())
            .await
            .unwrap();
        assert_eq!(fixes.len(), 1);
        assert_eq!(fixes[0].patch, "");
        let hints: ApplyHints = serde_json::from_str(&fixes[0].apply_hints_json).unwrap();
        assert_eq!(hints.apply_strategy, ApplyStrategy::DependencyBump);
        assert_eq!(hints.ecosystem, Ecosystem::Npm);
        assert_eq!(hints.dependency_name, "lodash");
        assert_eq!(hints.target_version, "4.17.21");
        assert_eq!(
            hints.target_files,
            vec!["package.json".to_string(), "package-lock.json".to_string()]
        );
    }

    #[tokio::test]
    async fn test_patch_fix_queued_with_mode_status() {
        let h = harness(FakeAi::new(0.9), |c| c.mode = AgentMode::Auto).await;
        let mut f = test_finding(FindingKind::Sast, Severity::High, "src/a.js");
        f.line = 1;
        h.db.insert_findings(h.job.scan_job_id, &[f]).await.unwrap();
        let cancel = CancellationToken::new();
        let report = h.fixer.process(&h.job, &cancel).await.unwrap();

        assert_eq!(report.counters.queued, 1);
        assert_eq!(h.ai.fix_calls.load(Ordering::SeqCst), 1);
        let row = h.db.list_approved_fixes(10).await.unwrap();
        assert_eq!(row.len(), 1);
        assert!(row[0].patch.contains("+new"));
    }

    #[tokio::test]
    async fn test_triage_mode_inserts_pending() {
        let h = harness(FakeAi::new(0.9), |c| c.mode = AgentMode::Triage).await;
        let mut f = test_finding(FindingKind::Sast, Severity::High, "src/a.js");
        f.line = 1;
        h.db.insert_findings(h.job.scan_job_id, &[f]).await.unwrap();
        let cancel = CancellationToken::new();
        h.fixer.process(&h.job, &cancel).await.unwrap();
        assert!(h.db.list_approved_fixes(10).await.unwrap().is_empty());
        let count: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM fix_queue WHERE status = 'pending'")
                .fetch_one(h.db.pool())
                .await
                .unwrap();
        assert_eq!(count.0, 1);
    }

    #[tokio::test]
    async fn test_low_confidence_skipped() {
        let h = harness(FakeAi::new(0.2), |_| {}).await;
        let mut f = test_finding(FindingKind::Sast, Severity::Critical, "src/a.js");
        f.line = 1;
        h.db.insert_findings(h.job.scan_job_id, &[f]).await.unwrap();
        let cancel = CancellationToken::new();
        let report = h.fixer.process(&h.job, &cancel).await.unwrap();
        // 0.2 < 0.6 critical threshold
        assert_eq!(report.counters.skipped_low_conf, 1);
        assert_eq!(report.counters.queued, 0);
    }

    #[tokio::test]
    async fn test_invalid_patch_counts_failed() {
        let mut ai = FakeAi::new(0.9);
        ai.patch = "this is not a diff".to_string();
        let h = harness(ai, |_| {}).await;
        let mut f = test_finding(FindingKind::Sast, Severity::High, "src/a.js");
        f.line = 1;
        h.db.insert_findings(h.job.scan_job_id, &[f]).await.unwrap();
        let cancel = CancellationToken::new();
        let report = h.fixer.process(&h.job, &cancel).await.unwrap();
        assert_eq!(report.counters.failed, 1);
        assert_eq!(report.counters.queued, 0);
    }

    #[tokio::test]
    async fn test_already_processed_findings_skipped() {
        let h = harness(FakeAi::new(0.9), |_| {}).await;
        let mut f = test_finding(FindingKind::Sast, Severity::High, "src/a.js");
        f.line = 1;
        h.db.insert_findings(h.job.scan_job_id, &[f.clone()])
            .await
            .unwrap();
        // Simulate a previous attempt still open
        h.db.insert_fix(&NewFix {
            scan_job_id: h.job.scan_job_id,
            finding_type: "sast".to_string(),
            finding_ref: f.id.clone(),
            approved: true,
            ..Default::default()
        })
        .await
        .unwrap();

        let cancel = CancellationToken::new();
        let report = h.fixer.process(&h.job, &cancel).await.unwrap();
        assert_eq!(report.triage_status, TriageStatus::AllFindingsAlreadyProcessed);
        assert_eq!(h.ai.fix_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_chunked_triage_renumbers_globally() {
        let h = harness(FakeAi::new(0.9), |c| {
            c.ai.triage_chunk_size = Some(2);
            c.max_fix_attempts = 0; // triage only
        })
        .await;
        let mut fs = Vec::new();
        for i in 0..5 {
            let mut f = test_finding(FindingKind::Sast, Severity::High, &format!("src/f{i}.js"));
            f.line = 1;
            f.id = format!("sast-{i:03}");
            fs.push(f);
        }
        h.db.insert_findings(h.job.scan_job_id, &fs).await.unwrap();

        let cancel = CancellationToken::new();
        let report = h.fixer.process(&h.job, &cancel).await.unwrap();
        assert_eq!(report.triage_status, TriageStatus::Completed);
        // 5 findings, chunk 2 → 3 triage calls
        assert_eq!(h.ai.triage_calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_chunked_triage_resume_from_checkpoint() {
        let h = harness(FakeAi::new(0.9), |c| {
            c.ai.triage_chunk_size = Some(2);
            c.max_fix_attempts = 0;
        })
        .await;
        let mut fs = Vec::new();
        for i in 0..6 {
            let mut f = test_finding(FindingKind::Sast, Severity::High, &format!("src/f{i}.js"));
            f.line = 1;
            f.id = format!("sast-{i:03}");
            fs.push(f);
        }
        h.db.insert_findings(h.job.scan_job_id, &fs).await.unwrap();

        // Build the task with a checkpoint after batch 2 of 3
        let campaign = h.db.insert_campaign("c", "triage", false).await.unwrap();
        let task = h
            .db
            .insert_remediation_task(campaign, h.job.scan_job_id)
            .await
            .unwrap();
        let first_four: Vec<TriagedFinding> = (0..4)
            .map(|i| TriagedFinding {
                finding_id: format!("sast-{i:03}"),
                priority: (i + 1) as u32,
                rationale: String::new(),
                suggested_fix: String::new(),
            })
            .collect();
        h.db.checkpoint_triage(
            task,
            TriageStatus::Running,
            3,
            &serde_json::to_string(&first_four).unwrap(),
            2,
            3,
            "batch 2/3",
        )
        .await
        .unwrap();

        let mut job = h.job.clone();
        job.remediation_task_id = Some(task);
        let cancel = CancellationToken::new();
        let report = h.fixer.process(&job, &cancel).await.unwrap();

        assert_eq!(report.triage_status, TriageStatus::Completed);
        // Exactly one more triage call for the third chunk
        assert_eq!(h.ai.triage_calls.load(Ordering::SeqCst), 1);

        let row = h.db.get_remediation_task(task).await.unwrap().unwrap();
        let prioritized: Vec<TriagedFinding> =
            serde_json::from_str(&row.prioritized_json).unwrap();
        assert_eq!(prioritized.len(), 6);
        // Priorities 1..6, monotonically increasing
        for (i, entry) in prioritized.iter().enumerate() {
            assert_eq!(entry.priority, (i + 1) as u32);
        }
        assert_eq!(row.triage_status, "completed");
    }

    #[tokio::test]
    async fn test_triage_batch_failure_falls_back_locally() {
        let h = harness(FakeAi::failing_triage(10), |c| {
            c.ai.triage_chunk_size = Some(2);
            c.max_fix_attempts = 0;
        })
        .await;
        let mut fs = Vec::new();
        for i in 0..4 {
            let mut f = test_finding(FindingKind::Sast, Severity::High, &format!("src/f{i}.js"));
            f.line = 1;
            f.id = format!("sast-{i:03}");
            fs.push(f);
        }
        h.db.insert_findings(h.job.scan_job_id, &fs).await.unwrap();

        let cancel = CancellationToken::new();
        let report = h.fixer.process(&h.job, &cancel).await.unwrap();
        // All batches failed → fallback ordering, failed_fallback status
        assert_eq!(report.triage_status, TriageStatus::FailedFallback);
    }

    #[tokio::test]
    async fn test_max_fix_attempts_cap() {
        let h = harness(FakeAi::new(0.9), |c| c.max_fix_attempts = 2).await;
        let mut fs = Vec::new();
        for i in 0..5 {
            let mut f = test_finding(FindingKind::Sast, Severity::High, "src/a.js");
            f.line = 1;
            f.title = format!("finding-{i}");
            f.id = format!("sast-{i:03}");
            fs.push(f);
        }
        h.db.insert_findings(h.job.scan_job_id, &fs).await.unwrap();

        let cancel = CancellationToken::new();
        let report = h.fixer.process(&h.job, &cancel).await.unwrap();
        assert_eq!(report.counters.attempted, 2);
    }

    #[test]
    fn test_dependency_bump_hints_recognized_manifests() {
        let mut go = test_finding(FindingKind::Sca, Severity::High, "go.mod");
        go.package = "golang.org/x/net".to_string();
        go.fix_version = "0.17.0".to_string();
        let hints = dependency_bump_hints(&go).unwrap();
        assert_eq!(hints.ecosystem, Ecosystem::Go);
        assert_eq!(hints.target_files, vec!["go.mod", "go.sum"]);

        let mut lock = test_finding(FindingKind::Sca, Severity::High, "frontend/package-lock.json");
        lock.package = "minimist".to_string();
        lock.fix_version = "1.2.8".to_string();
        let hints = dependency_bump_hints(&lock).unwrap();
        assert_eq!(hints.manifest_path, "package.json");

        // Unrecognized manifest → no short-circuit
        let mut pom = test_finding(FindingKind::Sca, Severity::High, "pom.xml");
        pom.package = "log4j".to_string();
        pom.fix_version = "2.17.1".to_string();
        assert!(dependency_bump_hints(&pom).is_none());

        // Missing fix version → no short-circuit
        let mut nofix = test_finding(FindingKind::Sca, Severity::High, "go.mod");
        nofix.package = "x".to_string();
        assert!(dependency_bump_hints(&nofix).is_none());
    }

    #[tokio::test]
    async fn test_file_context_window_marks_target() {
        let h = harness(FakeAi::new(0.9), |_| {}).await;
        let long: String = (1..=400).map(|i| format!("line{i}\n")).collect();
        std::fs::write(h.job.clone_path.join("src/long.js"), long).unwrap();
        let mut f = test_finding(FindingKind::Sast, Severity::High, "src/long.js");
        f.line = 200;
        let context = h.fixer.build_file_context(&h.job.clone_path, &f).unwrap();
        assert!(context.contains(">>  200 | line200"));
        // ±10 window
        assert!(context.contains("line190"));
        assert!(context.contains("line210"));
        assert!(!context.contains("line150"));
    }

    #[tokio::test]
    async fn test_file_context_full_small_file() {
        let h = harness(FakeAi::new(0.9), |_| {}).await;
        let mut f = test_finding(FindingKind::Sast, Severity::High, "src/a.js");
        f.line = 2;
        let context = h.fixer.build_file_context(&h.job.clone_path, &f).unwrap();
        assert!(context.contains("    1 | old"));
        assert!(context.contains(">>    2 | line2"));
        assert!(context.contains("line3"));
    }
}
