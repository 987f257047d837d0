//! The generation engine
//!
//! Ties the pieces together: a bounded pool of workers pulls tasks from the
//! `GenerationQueue`, and each worker carries one asset all the way through
//! cache lookup, prompt competition, scoring, image rendering under the
//! retry ladder, budget commit and cache write. A single coordinator (the
//! calling thread) receives every task outcome, so checkpoints, re-queues
//! and approval submissions happen in one place.

use crate::approval::{ApprovalGate, REJECTED_MESSAGE};
use crate::cancel::CancellationToken;
use crate::circuit::CircuitRegistry;
use crate::config::AtelierConfig;
use crate::manifest::{EntryStatus, ReportEntry, RunReport};
use crate::orchestrator::{CompetitionContext, OpenRouterOrchestrator, PromptCompetition};
use crate::progress::{ProgressTracker, RunProgress};
use crate::provider::{file_stem, ImageOutput, ImageParams, ImageProvider, ImageRequest, ModelClient};
use crate::providers::{create_image_provider, create_model_client};
use crate::queue::{AssetRequest, GenerationQueue, GenerationTask, QueueConfig};
use crate::rate_limit::RateLimiter;
use crate::retry::{retry_storage_once, RetryPolicy, RetryRequest, SmartRetryManager};
use crate::scoring::QualityScorer;
use crate::style::StyleGuide;
use crate::transaction::TransactionManager;
use atelier_core::{
    ApprovalStatus, AssetStatus, AssetType, AtelierError, AttemptRecord, Fingerprint,
    GenerationStatus, Priority, Result, TaskId,
};
use atelier_store::{AssetCache, AssetDatabase, AssetRecord, CacheSource, GeneratedAsset, Transaction};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// How often an idle worker re-checks for shutdown
const WORKER_POLL: Duration = Duration::from_millis(50);

/// Longest asset name derived from a bare prompt
const MAX_DERIVED_NAME: usize = 48;

/// What happened to one asset request
#[derive(Debug)]
pub enum TaskOutcome {
    Completed {
        record: AssetRecord,
        /// Cost charged to this request (zero for hits and joins)
        attributed_cost: f64,
        source: CacheSource,
        attempts: Vec<AttemptRecord>,
    },
    Failed {
        error: AtelierError,
        attempts: Vec<AttemptRecord>,
    },
}

impl TaskOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, TaskOutcome::Completed { .. })
    }

    pub fn record(&self) -> Option<&AssetRecord> {
        match self {
            TaskOutcome::Completed { record, .. } => Some(record),
            TaskOutcome::Failed { .. } => None,
        }
    }

    pub fn attributed_cost(&self) -> f64 {
        match self {
            TaskOutcome::Completed { attributed_cost, .. } => *attributed_cost,
            TaskOutcome::Failed { .. } => 0.0,
        }
    }

    pub fn attempts(&self) -> &[AttemptRecord] {
        match self {
            TaskOutcome::Completed { attempts, .. } | TaskOutcome::Failed { attempts, .. } => attempts,
        }
    }
}

/// An asset stored during this run and waiting on a reviewer
struct PendingReview {
    item_id: String,
    /// Index into the run report
    entry: usize,
    record: AssetRecord,
    fingerprint: Fingerprint,
}

/// Approval state of one run
#[derive(Default)]
struct Review {
    batch_id: Option<String>,
    items: Vec<PendingReview>,
}

pub struct Engine {
    config: AtelierConfig,
    cache: AssetCache,
    transactions: TransactionManager,
    queue: GenerationQueue,
    orchestrator: OpenRouterOrchestrator,
    scorer: QualityScorer,
    image: Arc<dyn ImageProvider>,
    breakers: Arc<CircuitRegistry>,
    limiter: Arc<RateLimiter>,
    policy: RetryPolicy,
    approvals: ApprovalGate,
    progress: ProgressTracker,
    style: Option<StyleGuide>,
    cancel: CancellationToken,
    await_approvals: bool,
}

impl Engine {
    pub fn new(
        config: AtelierConfig,
        db: AssetDatabase,
        model_client: Arc<dyn ModelClient>,
        image: Arc<dyn ImageProvider>,
    ) -> Result<Self> {
        config.validate()?;

        let cancel = CancellationToken::new();
        let breakers = Arc::new(CircuitRegistry::new(config.circuit_breaker.clone()));
        let limiter = Arc::new(if config.engine.requests_per_second > 0.0 {
            RateLimiter::new(config.engine.requests_per_second, config.engine.burst)
        } else {
            RateLimiter::unlimited()
        });
        let policy = RetryPolicy::from_config(&config.retry);

        let orchestrator = OpenRouterOrchestrator::new(
            model_client,
            config.competition.clone(),
            breakers.clone(),
            limiter.clone(),
            policy.clone(),
            cancel.clone(),
        );
        let queue = GenerationQueue::new(QueueConfig {
            max_concurrent: config.engine.max_concurrent.max(1),
            max_attempts: config.engine.max_attempts.max(1),
            requeue_backoff: Duration::from_millis(config.engine.requeue_backoff_ms),
            ..QueueConfig::default()
        });

        Ok(Self {
            cache: AssetCache::new(db.clone(), &config.storage.asset_dir),
            transactions: TransactionManager::new(db.clone(), config.budget.ceiling)?,
            queue,
            orchestrator,
            scorer: QualityScorer::new(config.scoring.weights.clone()),
            image,
            breakers,
            limiter,
            policy,
            approvals: ApprovalGate::new(db.clone()).with_cancellation(cancel.clone()),
            progress: ProgressTracker::new(db),
            style: None,
            cancel,
            await_approvals: true,
            config,
        })
    }

    /// Open the configured database and build the configured providers
    pub fn from_config(config: AtelierConfig) -> Result<Self> {
        let db = AssetDatabase::open(&config.storage.database)?;
        let models = create_model_client(&config.engine.model_client, &config)?;
        let image = create_image_provider(&config.engine.image_provider, &config)?;
        Self::new(config, db, models, image)
    }

    pub fn with_style(mut self, style: StyleGuide) -> Self {
        self.style = Some(style);
        self
    }

    /// How often approval waits re-read the batch
    pub fn with_approval_poll_interval(mut self, interval: Duration) -> Self {
        self.approvals = self.approvals.with_poll_interval(interval);
        self
    }

    /// When false, a run submits its assets for review and returns without
    /// waiting for decisions.
    pub fn set_await_approvals(&mut self, wait: bool) {
        self.await_approvals = wait;
    }

    pub fn config(&self) -> &AtelierConfig {
        &self.config
    }

    pub fn style(&self) -> Option<&StyleGuide> {
        self.style.as_ref()
    }

    pub fn cache(&self) -> &AssetCache {
        &self.cache
    }

    pub fn transactions(&self) -> &TransactionManager {
        &self.transactions
    }

    pub fn queue(&self) -> &GenerationQueue {
        &self.queue
    }

    pub fn approvals(&self) -> &ApprovalGate {
        &self.approvals
    }

    pub fn progress(&self) -> &ProgressTracker {
        &self.progress
    }

    pub fn breakers(&self) -> &CircuitRegistry {
        &self.breakers
    }

    /// Token that stops the run between tasks and before each retry
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Queue an asset named after its prompt
    pub fn enqueue_asset_request(&self, prompt: &str, asset_type: AssetType, priority: Priority) -> TaskId {
        let name: String = file_stem(prompt).chars().take(MAX_DERIVED_NAME).collect();
        self.enqueue(AssetRequest::new(&name, prompt, asset_type).with_priority(priority))
    }

    pub fn enqueue(&self, request: AssetRequest) -> TaskId {
        self.queue.enqueue(request)
    }

    /// Final or current status of a queued task
    pub fn task_status(&self, id: TaskId) -> Option<GenerationStatus> {
        self.queue.status(id)
    }

    /// The prompt the cache is keyed on: the request prompt wrapped in the
    /// active style guide.
    pub fn resolve_prompt(&self, prompt: &str) -> String {
        match &self.style {
            Some(style) => style.enrich_prompt(prompt),
            None => prompt.to_string(),
        }
    }

    pub fn fingerprint(&self, request: &AssetRequest) -> Fingerprint {
        Fingerprint::compute(request.asset_type, &self.resolve_prompt(&request.prompt))
    }

    /// Queue the requests and work them off as a new checkpointed run
    pub fn run(&self, requests: &[AssetRequest]) -> Result<RunReport> {
        for request in requests {
            self.enqueue(request.clone());
        }
        self.run_queued()
    }

    /// Work off everything currently queued as a new checkpointed run
    pub fn run_queued(&self) -> Result<RunReport> {
        self.cancel.check()?;
        if self.queue.is_closed() {
            return Err(AtelierError::InvalidState("engine queue has been closed".to_string()));
        }

        let tasks = self.queued_tasks();
        let requests: Vec<AssetRequest> = tasks.iter().map(|t| t.payload.clone()).collect();
        let run_id = format!("run-{}", uuid::Uuid::new_v4());
        let style = self.style.as_ref().map(|s| s.name.as_str());
        self.progress.start_run_with(&run_id, &requests, style)?;

        let mut report = RunReport::new(&run_id);
        let mut review = Review::default();
        self.drive(&run_id, tasks.len(), &mut report, &mut review)?;
        self.finish_run(&run_id, &requests, report, review)
    }

    /// Continue an interrupted run. Assets already in the cache are
    /// reported without being regenerated; only the rest are queued.
    pub fn resume(&self, run_id: &str) -> Result<RunReport> {
        self.cancel.check()?;
        let checkpoint = self.progress.resume(run_id)?;
        let previous = RunProgress::from_checkpoint(&checkpoint)?;
        if previous.requests.len() != previous.total {
            return Err(AtelierError::InvalidState(format!(
                "run {} did not record its requests and cannot be resumed",
                run_id
            )));
        }
        let active_style = self.style.as_ref().map(|s| s.name.as_str());
        if previous.style.as_deref() != active_style {
            return Err(AtelierError::Config(format!(
                "run {} used style {:?}, engine has {:?}",
                run_id, previous.style, active_style
            )));
        }
        self.progress.clear_failures(run_id)?;

        let mut report = RunReport::new(run_id);
        let mut review = Review::default();
        let mut queued = 0;
        for request in &previous.requests {
            let resolved = self.resolve_prompt(&request.prompt);
            let hit = self.cache.lookup(&resolved, request.asset_type)?;
            match hit {
                Some(record) => {
                    let fingerprint = Fingerprint::compute(request.asset_type, &resolved);
                    self.progress.record_completed(run_id, &fingerprint)?;
                    let entry = report.entries.len();
                    report.push(entry_for(request, EntryStatus::Cached, &record, 0.0, 0));
                    if record.status == AssetStatus::Processing {
                        self.carry_review(run_id, previous.approval_batch.as_deref(), request, record, fingerprint, entry, &mut report, &mut review)?;
                    }
                }
                None => {
                    self.enqueue(request.clone());
                    queued += 1;
                }
            }
        }
        tracing::info!(run_id, cached = report.entries.len(), queued, "resuming run");

        self.drive(run_id, queued, &mut report, &mut review)?;
        self.finish_run(run_id, &previous.requests, report, review)
    }

    /// Produce one asset on the calling thread. Concurrent callers asking
    /// for the same fingerprint share a single paid generation.
    pub fn execute(&self, request: &AssetRequest) -> TaskOutcome {
        let resolved = self.resolve_prompt(&request.prompt);
        let mut history = Vec::new();
        let mut audit = None;

        let result = self.cache.get_or_generate(&resolved, request.asset_type, || {
            self.generate_paid(request, &resolved, &mut history, &mut audit)
        });

        match result {
            Ok(outcome) => {
                if outcome.source == CacheSource::Generated {
                    if let Some(competition) = audit {
                        keep_competition(&outcome.record, &competition);
                    }
                }
                TaskOutcome::Completed {
                    record: outcome.record,
                    attributed_cost: outcome.attributed_cost,
                    source: outcome.source,
                    attempts: history,
                }
            }
            Err(error) => {
                let attempts = match &error {
                    AtelierError::GenerationFailed { attempts, .. } => attempts.clone(),
                    _ => history,
                };
                TaskOutcome::Failed { error, attempts }
            }
        }
    }

    /// Reserve budget, run the competition and render the winner.
    /// Called by the cache only on a miss, at most once per fingerprint.
    fn generate_paid(
        &self,
        request: &AssetRequest,
        resolved: &str,
        history: &mut Vec<AttemptRecord>,
        audit: &mut Option<PromptCompetition>,
    ) -> Result<GeneratedAsset> {
        self.cancel.check()?;
        let estimate = self.config.budget.estimate(request.asset_type);
        let mut tx = self.transactions.begin(request.asset_type, estimate, resolved)?;

        match self.compete_and_render(request, history, audit) {
            Ok((output, competition_cost, retries)) => {
                let actual = output.cost + competition_cost;
                if self.cancel.is_cancelled() {
                    // The call finished after cancellation; its result is discarded
                    std::fs::remove_file(&output.file_path).ok();
                    self.close_unfinished(tx, "cancelled", actual)?;
                    return Err(AtelierError::Cancelled);
                }
                tx.retry_count = retries;
                if let Err(e) = self.transactions.commit(tx.clone(), actual) {
                    std::fs::remove_file(&output.file_path).ok();
                    if self.transactions.is_open(&tx.id) {
                        self.close_unfinished(tx, &e.to_string(), actual)?;
                    }
                    return Err(e);
                }

                let status = if self.config.approval.required {
                    AssetStatus::Processing
                } else {
                    AssetStatus::Completed
                };
                Ok(GeneratedAsset {
                    file_path: output.file_path,
                    url: output.url,
                    cost: actual,
                    status,
                })
            }
            Err(e) => {
                // A competition that resolved was paid for even if the image failed
                let spent = match audit {
                    Some(competition) => competition.total_cost(),
                    None => 0.0,
                };
                let reason = match e {
                    AtelierError::Cancelled => "cancelled".to_string(),
                    ref other => other.to_string(),
                };
                self.close_unfinished(tx, &reason, spent)?;
                Err(e)
            }
        }
    }

    /// Finalize a transaction that won't be committed. Money already spent
    /// upstream is kept on the ledger; otherwise the reservation is rolled back.
    fn close_unfinished(&self, tx: Transaction, reason: &str, spent: f64) -> Result<()> {
        if spent > 0.0 {
            self.transactions.fail(tx, reason, spent)?;
        } else {
            self.transactions.rollback(tx, reason)?;
        }
        Ok(())
    }

    fn compete_and_render(
        &self,
        request: &AssetRequest,
        history: &mut Vec<AttemptRecord>,
        audit: &mut Option<PromptCompetition>,
    ) -> Result<(ImageOutput, f64, u32)> {
        let mut context = CompetitionContext::new(&request.name, &request.prompt, request.asset_type);
        if let Some(style) = &self.style {
            context = context.with_style(style);
        }
        let mut competition = self.orchestrator.generate_competition(&context)?;
        let competition_cost = competition.total_cost();
        let winner = competition
            .resolve(&self.scorer)
            .map(|evaluation| evaluation.variant.clone())
            .ok_or_else(|| AtelierError::GenerationFailed {
                asset: request.name.clone(),
                attempts: Vec::new(),
                fatal: false,
            })?;
        tracing::debug!(
            asset = %request.name,
            model = %winner.model,
            variants = competition.variants.len(),
            "competition resolved"
        );
        *audit = Some(competition);

        let image_prompt = self.resolve_prompt(&winner.prompt);
        let model = request
            .model
            .clone()
            .unwrap_or_else(|| self.image.default_model().to_string());
        let retry = RetryRequest::new(
            &request.name,
            &image_prompt,
            request.asset_type,
            self.image.name(),
            &model,
        )
        .with_alternatives(&self.config.retry.fallback_models);
        let negative = self.style.as_ref().and_then(StyleGuide::negative);
        let manager = SmartRetryManager::new(self.breakers.clone(), self.policy.clone(), self.cancel.clone());

        let retried = manager.execute(&retry, |plan| {
            self.limiter.acquire_cancellable(&self.cancel)?;
            let mut params = ImageParams::for_asset_type(request.asset_type);
            if plan.adjust_params {
                params = params.adjusted();
            }
            params.negative_prompt = negative.clone();
            let image_request = ImageRequest {
                name: request.name.clone(),
                prompt: plan.prompt.clone(),
                asset_type: request.asset_type,
                model: plan.model.clone(),
                params,
            };
            self.image.generate(&image_request, &self.config.storage.scratch_dir)
        })?;

        let retries = retried.context.retry_count();
        history.extend(retried.context.history);
        Ok((retried.value, competition_cost, retries))
    }

    fn queued_tasks(&self) -> Vec<GenerationTask> {
        let ids = self
            .queue
            .by_status()
            .remove(GenerationStatus::Queued.as_str())
            .unwrap_or_default();
        ids.into_iter().filter_map(|id| self.queue.task(id)).collect()
    }

    /// Run the worker pool until `expected` tasks have settled or the run
    /// is aborted.
    fn drive(&self, run_id: &str, expected: usize, report: &mut RunReport, review: &mut Review) -> Result<()> {
        if expected == 0 {
            return Ok(());
        }
        let workers = self.config.engine.max_concurrent.max(1);
        let stop = AtomicBool::new(false);
        let mut pending = expected;
        let mut abort: Option<AtelierError> = None;

        thread::scope(|scope| {
            let (results, inbox) = mpsc::channel();
            for worker in 0..workers {
                let results = results.clone();
                let stop = &stop;
                scope.spawn(move || self.work(worker, stop, results));
            }
            drop(results);

            for (task, outcome) in inbox.iter() {
                let aborting = abort.is_some();
                match self.settle(run_id, &task, outcome, aborting, report, review) {
                    Ok(true) => pending = pending.saturating_sub(1),
                    Ok(false) => {}
                    Err(e) => {
                        pending = pending.saturating_sub(1);
                        if abort.is_none() {
                            tracing::error!(run_id, error = %e, "aborting run");
                            self.cancel.cancel();
                            abort = Some(e);
                        }
                    }
                }
                if pending == 0 || abort.is_some() {
                    stop.store(true, Ordering::SeqCst);
                }
            }
        });

        if pending > 0 {
            let reason = match &abort {
                Some(e) => format!("run aborted: {}", e),
                None => "cancelled".to_string(),
            };
            for id in self.queue.close(&reason) {
                let Some(task) = self.queue.task(id) else {
                    continue;
                };
                let request = &task.payload;
                if let Err(e) = self.progress.record_failed(run_id, &self.fingerprint(request), &reason) {
                    tracing::warn!(run_id, error = %e, "could not checkpoint abandoned task");
                }
                report.push(failed_entry(request, &reason, 0));
            }
        }

        match abort {
            // A cancelled run still closes normally so it can be resumed
            None | Some(AtelierError::Cancelled) => Ok(()),
            Some(e) => {
                self.progress.finish(run_id, false).ok();
                Err(e)
            }
        }
    }

    fn work(&self, worker: usize, stop: &AtomicBool, results: Sender<(GenerationTask, TaskOutcome)>) {
        tracing::debug!(worker, "worker started");
        while !stop.load(Ordering::SeqCst) && !self.cancel.is_cancelled() && !self.queue.is_closed() {
            let tasks = if self.config.engine.batch_mode {
                self.queue.dequeue_batch_timeout(
                    self.config.engine.batch_size,
                    self.image.default_model(),
                    WORKER_POLL,
                )
            } else {
                self.queue.dequeue_timeout(WORKER_POLL).into_iter().collect()
            };

            for task in tasks {
                tracing::debug!(worker, task_id = %task.id, asset = %task.payload.name, attempt = task.attempts, "task started");
                let outcome = self.execute(&task.payload);
                if results.send((task, outcome)).is_err() {
                    return;
                }
            }
        }
        tracing::debug!(worker, "worker stopped");
    }

    /// Record one task outcome. Returns whether the task reached a final
    /// state; an error means the run must stop.
    fn settle(
        &self,
        run_id: &str,
        task: &GenerationTask,
        outcome: TaskOutcome,
        aborting: bool,
        report: &mut RunReport,
        review: &mut Review,
    ) -> Result<bool> {
        let request = &task.payload;
        let fingerprint = self.fingerprint(request);

        match outcome {
            TaskOutcome::Completed {
                record,
                attributed_cost,
                source,
                attempts,
            } => {
                self.queue.complete(task.id);
                self.progress.record_completed(run_id, &fingerprint)?;
                tracing::info!(
                    task_id = %task.id,
                    asset = %request.name,
                    fingerprint = %fingerprint,
                    source = ?source,
                    cost = attributed_cost,
                    "asset ready"
                );

                let entry = report.entries.len();
                let status = match source {
                    CacheSource::Generated => EntryStatus::Generated,
                    CacheSource::Hit | CacheSource::Joined => EntryStatus::Cached,
                };
                report.push(entry_for(request, status, &record, attributed_cost, attempts.len()));
                if source == CacheSource::Generated && record.status == AssetStatus::Processing {
                    self.submit_review(run_id, request, record, fingerprint, entry, report, review)?;
                }
                Ok(true)
            }
            TaskOutcome::Failed { error, attempts } => {
                let message = error.to_string();
                let halts_run = matches!(error, AtelierError::Storage(_) | AtelierError::Cancelled);
                let retryable = !aborting && !halts_run && error.is_requeueable();

                let status = if retryable {
                    self.queue.fail(task.id, &message)
                } else {
                    self.queue.fail_permanently(task.id, &message)
                };
                if status != GenerationStatus::Failed {
                    return Ok(false);
                }

                let record = AssetRecord::failed(request.asset_type, &self.resolve_prompt(&request.prompt), &message);
                let stored = retry_storage_once("record failed asset", || self.cache.database().put(&record))
                    .and_then(|_| self.progress.record_failed(run_id, &fingerprint, &message));
                report.push(failed_entry(request, &message, attempts.len()));

                if halts_run {
                    return Err(error);
                }
                stored?;
                Ok(true)
            }
        }
    }

    fn review_batch(&self, run_id: &str, review: &mut Review) -> Result<String> {
        if let Some(id) = &review.batch_id {
            return Ok(id.clone());
        }
        let id = ApprovalGate::new_batch_id();
        self.progress.set_approval_batch(run_id, &id)?;
        review.batch_id = Some(id.clone());
        Ok(id)
    }

    #[allow(clippy::too_many_arguments)]
    fn submit_review(
        &self,
        run_id: &str,
        request: &AssetRequest,
        record: AssetRecord,
        fingerprint: Fingerprint,
        entry: usize,
        report: &mut RunReport,
        review: &mut Review,
    ) -> Result<()> {
        let batch_id = self.review_batch(run_id, review)?;
        let item = retry_storage_once("submit approval", || {
            self.approvals.submit(&batch_id, &request.name, Some(record.id))
        })?;
        report.entries[entry].status = EntryStatus::AwaitingApproval;
        review.items.push(PendingReview {
            item_id: item.id,
            entry,
            record,
            fingerprint,
        });
        Ok(())
    }

    /// A resumed asset that was still in review: apply a decision the
    /// reviewer already made, or re-submit it to this run's batch.
    #[allow(clippy::too_many_arguments)]
    fn carry_review(
        &self,
        run_id: &str,
        previous_batch: Option<&str>,
        request: &AssetRequest,
        record: AssetRecord,
        fingerprint: Fingerprint,
        entry: usize,
        report: &mut RunReport,
        review: &mut Review,
    ) -> Result<()> {
        let earlier = match previous_batch {
            Some(batch) => self
                .approvals
                .batch(batch)?
                .into_iter()
                .find(|item| item.asset_id == Some(record.id)),
            None => None,
        };

        if let Some(item) = earlier {
            match item.status {
                ApprovalStatus::Approved | ApprovalStatus::Modified | ApprovalStatus::Rejected => {
                    let pending = PendingReview {
                        item_id: item.id,
                        entry,
                        record,
                        fingerprint,
                    };
                    return self.apply_decision(run_id, &pending, item.status, report);
                }
                ApprovalStatus::Pending => {
                    self.approvals.withdraw(&item.id, "superseded by resumed run")?;
                }
                ApprovalStatus::Timeout => {}
            }
        }
        self.submit_review(run_id, request, record, fingerprint, entry, report, review)
    }

    fn apply_decision(
        &self,
        run_id: &str,
        pending: &PendingReview,
        decision: ApprovalStatus,
        report: &mut RunReport,
    ) -> Result<()> {
        let settled = retry_storage_once("settle reviewed asset", || {
            self.approvals.settle_asset(pending.record.id, decision)
        })?;
        let entry = &mut report.entries[pending.entry];
        match settled {
            Some(AssetStatus::Failed) => {
                self.progress.record_rejected(run_id, &pending.fingerprint, REJECTED_MESSAGE)?;
                entry.status = EntryStatus::Rejected;
                entry.error = Some(REJECTED_MESSAGE.to_string());
            }
            Some(_) => {
                entry.status = if entry.cost > 0.0 {
                    EntryStatus::Generated
                } else {
                    EntryStatus::Cached
                };
            }
            None => {}
        }
        Ok(())
    }

    /// Wait for reviewers if asked to, then close the run
    fn finish_run(
        &self,
        run_id: &str,
        requests: &[AssetRequest],
        mut report: RunReport,
        review: Review,
    ) -> Result<RunReport> {
        report.approval_batch = review.batch_id.clone();
        if let Some(batch_id) = review.batch_id.as_deref() {
            if self.await_approvals && !review.items.is_empty() {
                let timeout = Duration::from_secs(self.config.approval.timeout_secs);
                match self.approvals.await_batch(batch_id, timeout) {
                    Ok(outcome) => {
                        for item in outcome.items() {
                            if let Some(pending) = review.items.iter().find(|p| p.item_id == item.id) {
                                self.apply_decision(run_id, pending, item.status, &mut report)?;
                            }
                        }
                    }
                    Err(AtelierError::Cancelled) => {
                        tracing::warn!(run_id, batch = batch_id, "stopped waiting for approvals");
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        // Report in request order rather than completion order
        report
            .entries
            .sort_by_key(|entry| requests.iter().position(|r| r.name == entry.name).unwrap_or(usize::MAX));
        report.finish();
        self.progress.finish(run_id, report.is_success())?;
        tracing::info!(
            run_id,
            generated = report.count(EntryStatus::Generated),
            cached = report.count(EntryStatus::Cached),
            awaiting = report.count(EntryStatus::AwaitingApproval),
            failed = report.count(EntryStatus::Failed),
            spend = report.total_cost(),
            "run finished"
        );
        Ok(report)
    }
}

fn entry_for(request: &AssetRequest, status: EntryStatus, record: &AssetRecord, cost: f64, attempts: usize) -> ReportEntry {
    ReportEntry {
        name: request.name.clone(),
        asset_type: request.asset_type,
        status,
        file_path: record.file_path.clone(),
        cost,
        error: None,
        attempts,
    }
}

fn failed_entry(request: &AssetRequest, error: &str, attempts: usize) -> ReportEntry {
    ReportEntry {
        name: request.name.clone(),
        asset_type: request.asset_type,
        status: EntryStatus::Failed,
        file_path: None,
        cost: 0.0,
        error: Some(error.to_string()),
        attempts,
    }
}

/// Write the full competition next to the stored image
fn keep_competition(record: &AssetRecord, competition: &PromptCompetition) {
    let Some(file) = record.file_path.as_deref() else {
        return;
    };
    let path = Path::new(file).with_extension("competition.json");
    let written = serde_json::to_string_pretty(competition)
        .map_err(|e| AtelierError::JsonError(e.to_string()))
        .and_then(|json| std::fs::write(&path, json).map_err(AtelierError::from));
    if let Err(e) = written {
        tracing::warn!(path = %path.display(), error = %e, "could not keep competition record");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::mock::{MockFailure, MockImageProvider, MockModelClient};
    use std::path::PathBuf;

    fn temp_root() -> PathBuf {
        std::env::temp_dir().join(format!("atelier_engine_test_{}", uuid::Uuid::new_v4()))
    }

    fn test_config(root: &Path) -> AtelierConfig {
        let mut config = AtelierConfig::default();
        config.engine.max_concurrent = 2;
        config.engine.requests_per_second = 0.0;
        config.engine.max_attempts = 1;
        config.engine.requeue_backoff_ms = 10;
        config.retry.base_delay_ms = 1;
        config.retry.max_delay_ms = 5;
        config.retry.jitter = 0.0;
        config.competition.models = vec!["model-a".to_string(), "model-b".to_string()];
        config.storage.database = root.join("assets.db");
        config.storage.asset_dir = root.join("assets");
        config.storage.scratch_dir = root.join("scratch");
        config
    }

    fn engine_with(config: AtelierConfig, image: Arc<MockImageProvider>) -> Engine {
        let db = AssetDatabase::open_in_memory().unwrap();
        Engine::new(config, db, Arc::new(MockModelClient::new()), image).unwrap()
    }

    #[test]
    fn test_run_generates_and_reports() {
        let root = temp_root();
        let image = Arc::new(MockImageProvider::new());
        let engine = engine_with(test_config(&root), image.clone());

        let requests = vec![
            AssetRequest::new("legal", "Legal Documents icon", AssetType::Icon),
            AssetRequest::new("roadmap", "Roadmap cover", AssetType::Cover),
        ];
        let report = engine.run(&requests).unwrap();

        assert!(report.is_success());
        assert_eq!(report.count(EntryStatus::Generated), 2);
        assert_eq!(report.entries[0].name, "legal");
        assert_eq!(report.entries[1].name, "roadmap");
        assert_eq!(image.call_count(), 2);

        let file = report.entries[0].file_path.clone().unwrap();
        assert!(Path::new(&file).is_file());
        assert!(Path::new(&file).with_extension("competition.json").is_file());

        let progress = engine.progress().progress(&report.run_id).unwrap();
        assert_eq!(progress.completed.len(), 2);
        assert_eq!(
            engine.progress().latest(&report.run_id).unwrap().unwrap().status,
            atelier_core::CheckpointStatus::Completed
        );

        std::fs::remove_dir_all(&root).ok();
    }

    #[test]
    fn test_second_run_hits_cache() {
        let root = temp_root();
        let image = Arc::new(MockImageProvider::new());
        let engine = engine_with(test_config(&root), image.clone());
        let request = AssetRequest::new("legal", "Legal Documents icon", AssetType::Icon);

        engine.run(std::slice::from_ref(&request)).unwrap();
        let committed = engine.transactions().committed();
        let report = engine.run(&[request]).unwrap();

        assert_eq!(report.count(EntryStatus::Cached), 1);
        assert_eq!(report.total_cost(), 0.0);
        assert_eq!(image.call_count(), 1);
        assert_eq!(engine.transactions().committed(), committed);

        std::fs::remove_dir_all(&root).ok();
    }

    #[test]
    fn test_execute_charges_competition_and_image() {
        let root = temp_root();
        let image = Arc::new(MockImageProvider::new().with_cost(0.01));
        let engine = engine_with(test_config(&root), image);

        let outcome = engine.execute(&AssetRequest::new("folder", "Shared folder icon", AssetType::Icon));
        let record = outcome.record().cloned().unwrap();
        // two competition calls at 0.0005 plus the image
        assert!((outcome.attributed_cost() - 0.011).abs() < 1e-9);
        assert!((record.cost - 0.011).abs() < 1e-9);
        assert!((engine.transactions().committed() - 0.011).abs() < 1e-9);

        std::fs::remove_dir_all(&root).ok();
    }

    #[test]
    fn test_failed_generation_is_recorded() {
        let root = temp_root();
        let image = Arc::new(MockImageProvider::new());
        let mut config = test_config(&root);
        config.retry.fallback_models.clear();
        let engine = engine_with(config, image.clone());
        image.fail_next(&[MockFailure::Auth]);

        let report = engine
            .run(&[AssetRequest::new("broken", "Broken icon", AssetType::Icon)])
            .unwrap();

        let entry = report.entry("broken").unwrap();
        assert_eq!(entry.status, EntryStatus::Failed);
        assert!(!report.is_success());
        // the competition ran before the image failed and stays paid for
        assert!((engine.transactions().committed() - 0.001).abs() < 1e-9);
        assert_eq!(engine.transactions().summary().unwrap().reserved, 0.0);
        let failed = engine.cache().database().list_assets(Some(AssetStatus::Failed)).unwrap();
        assert_eq!(failed.len(), 1);
        let progress = engine.progress().progress(&report.run_id).unwrap();
        assert_eq!(progress.failed.len(), 1);

        std::fs::remove_dir_all(&root).ok();
    }

    #[test]
    fn test_approval_required_holds_assets() {
        let root = temp_root();
        let image = Arc::new(MockImageProvider::new());
        let mut config = test_config(&root);
        config.approval.required = true;
        let mut engine = engine_with(config, image);
        engine.set_await_approvals(false);

        let report = engine
            .run(&[AssetRequest::new("legal", "Legal Documents icon", AssetType::Icon)])
            .unwrap();

        assert_eq!(report.count(EntryStatus::AwaitingApproval), 1);
        let batch = report.approval_batch.clone().unwrap();
        let items = engine.approvals().batch(&batch).unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].asset_name, "legal");
        let stored = engine.cache().database().list_assets(Some(AssetStatus::Processing)).unwrap();
        assert_eq!(stored.len(), 1);

        std::fs::remove_dir_all(&root).ok();
    }

    #[test]
    fn test_enqueue_asset_request_derives_name() {
        let root = temp_root();
        let engine = engine_with(test_config(&root), Arc::new(MockImageProvider::new()));

        let id = engine.enqueue_asset_request("Legal Documents icon", AssetType::Icon, Priority::High);
        let task = engine.queue().task(id).unwrap();
        assert_eq!(task.payload.name, "legal_documents_icon");
        assert_eq!(task.priority, Priority::High);
        assert_eq!(engine.task_status(id), Some(GenerationStatus::Queued));

        let report = engine.run_queued().unwrap();
        assert_eq!(report.entries.len(), 1);
        assert_eq!(engine.task_status(id), Some(GenerationStatus::Completed));

        std::fs::remove_dir_all(&root).ok();
    }

    #[test]
    fn test_cancelled_engine_refuses_runs() {
        let root = temp_root();
        let engine = engine_with(test_config(&root), Arc::new(MockImageProvider::new()));
        engine.cancellation_token().cancel();

        let result = engine.run(&[AssetRequest::new("legal", "Legal Documents icon", AssetType::Icon)]);
        assert!(matches!(result, Err(AtelierError::Cancelled)));

        std::fs::remove_dir_all(&root).ok();
    }

    #[test]
    fn test_resume_rejects_style_mismatch() {
        let root = temp_root();
        let engine = engine_with(test_config(&root), Arc::new(MockImageProvider::new()));
        let requests = vec![AssetRequest::new("legal", "Legal Documents icon", AssetType::Icon)];
        engine.progress().start_run_with("run-x", &requests, Some("calm_office")).unwrap();

        assert!(matches!(engine.resume("run-x"), Err(AtelierError::Config(_))));

        std::fs::remove_dir_all(&root).ok();
    }
}
