use crate::{
    checkpoint::CheckpointStore,
    config::{PipelineConfig, PipelineConfigPatch},
    error::{PipelineError, Result},
    gateway::{EnrichmentGateway, KnowledgeBaseContext, ReplyContext},
    persister::ResultPersister,
    quota::{QuotaGate, UnlimitedQuota},
    state::FeedbackQueueState,
    types::{
        AnalysisJobMetadata, AnalysisRecord, Checkpoint, FeedbackItem, KnowledgeBaseMatchResult,
        PipelineItemStatus, PipelineProgress, RunStatus, SentimentResult, SuggestedReply,
        SummaryResult,
    },
};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex, PoisonError,
};
use tracing::{debug, error, info, warn};

/// Options for [`PipelineProcessor::start`].
#[derive(Debug, Clone)]
pub struct StartOptions {
    pub user_id: String,
    pub items: Vec<FeedbackItem>,
    /// Merge the user's saved checkpoint before enqueuing `items`.
    pub resume_from_checkpoint: bool,
}

impl StartOptions {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            items: Vec::new(),
            resume_from_checkpoint: true,
        }
    }

    pub fn with_items(mut self, items: Vec<FeedbackItem>) -> Self {
        self.items = items;
        self
    }

    /// Ignore any saved checkpoint.
    pub fn fresh(mut self) -> Self {
        self.resume_from_checkpoint = false;
        self
    }
}

/// An item that ended in the `failed` state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedItem {
    pub id: String,
    pub error: Option<String>,
    pub attempts: u32,
}

/// What a call to `start`/`resume` left behind.
///
/// Taken before a clean completion resets the queue state, so failed items
/// stay visible to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RunReport {
    pub processed_ids: Vec<String>,
    pub failed: Vec<FailedItem>,
    /// Items still waiting (queued or interrupted) when the run returned.
    pub remaining: usize,
    pub status: RunStatus,
}

impl RunReport {
    fn from_state(state: &FeedbackQueueState) -> Self {
        let mut failed: Vec<FailedItem> = state
            .items()
            .filter(|entry| entry.status == PipelineItemStatus::Failed)
            .map(|entry| FailedItem {
                id: entry.item.id.clone(),
                error: entry.error.clone(),
                attempts: entry.attempts,
            })
            .collect();
        failed.sort_by(|a, b| a.id.cmp(&b.id));

        let progress = state.progress();
        Self {
            processed_ids: state.processed_ids().to_vec(),
            failed,
            remaining: progress.pending + progress.processing,
            status: state.status(),
        }
    }

    /// True when nothing is left to process.
    pub fn is_complete(&self) -> bool {
        self.remaining == 0
    }
}

enum ItemOutcome {
    Completed,
    Failed,
    Skipped,
    /// Stopped by pause or cancel; an open item stays in flight.
    Interrupted,
}

/// Stage outputs of one successful attempt.
struct Enrichment {
    sentiment: SentimentResult,
    summary: Option<SummaryResult>,
    kb_matches: KnowledgeBaseMatchResult,
    reply: SuggestedReply,
}

impl Enrichment {
    fn into_record(
        self,
        feedback: &FeedbackItem,
        started_at: DateTime<Utc>,
        attempts: u32,
        retry_delays: Vec<u64>,
    ) -> AnalysisRecord {
        let completed_at = Utc::now();
        AnalysisRecord {
            id: format!("{}-{}", feedback.id, completed_at.to_rfc3339()),
            user_id: feedback.user_id.clone(),
            feedback_id: feedback.id.clone(),
            sentiment: self.sentiment,
            tags: self.kb_matches.matches.iter().map(|m| m.id.clone()).collect(),
            kb_match_ids: self.kb_matches.kb_match_ids,
            suggested_reply: self.reply,
            summary: self.summary.map(|s| s.summary),
            job: AnalysisJobMetadata {
                started_at,
                completed_at,
                attempts,
                retry_delays,
                last_error: None,
            },
        }
    }
}

struct BusyGuard<'a>(&'a AtomicBool);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

fn as_checkpoint_error(err: PipelineError) -> PipelineError {
    match err {
        PipelineError::Checkpoint(_) => err,
        other => PipelineError::Checkpoint(other.to_string()),
    }
}

/// Drives feedback items through sentiment, summary, knowledge-base match
/// and reply generation, one item at a time.
///
/// All methods take `&self`; wrap the processor in an `Arc` to call
/// [`pause`](Self::pause) or [`cancel`](Self::cancel) from another task while
/// a run is in progress. Both are cooperative and take effect once the
/// current awaited call returns.
pub struct PipelineProcessor {
    state: Mutex<FeedbackQueueState>,
    gateway: Arc<dyn EnrichmentGateway>,
    persister: Arc<dyn ResultPersister>,
    checkpoints: Arc<dyn CheckpointStore>,
    quota: Arc<dyn QuotaGate>,
    user_id: Mutex<Option<String>>,
    busy: AtomicBool,
    keep_running: AtomicBool,
    /// Set by a checkpoint restore, consumed by the next run.
    checkpoint_restored: AtomicBool,
}

impl std::fmt::Debug for PipelineProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineProcessor")
            .field("user_id", &self.current_user())
            .field("busy", &self.is_busy())
            .field("status", &self.status())
            .finish()
    }
}

impl PipelineProcessor {
    pub fn builder() -> PipelineProcessorBuilder {
        PipelineProcessorBuilder::default()
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut FeedbackQueueState) -> R) -> R {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut state)
    }

    fn current_user(&self) -> Option<String> {
        self.user_id
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_user(&self, user_id: &str) {
        *self.user_id.lock().unwrap_or_else(PoisonError::into_inner) = Some(user_id.to_string());
    }

    fn keep_running(&self) -> bool {
        self.keep_running.load(Ordering::SeqCst)
    }

    /// A copy of the current queue state.
    pub fn snapshot(&self) -> FeedbackQueueState {
        self.with_state(|state| state.clone())
    }

    pub fn status(&self) -> RunStatus {
        self.with_state(|state| state.status())
    }

    pub fn progress(&self) -> PipelineProgress {
        self.with_state(|state| state.progress())
    }

    pub fn config(&self) -> PipelineConfig {
        self.with_state(|state| state.config().clone())
    }

    /// Whether a run loop currently owns the processor.
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    /// Apply a partial configuration. The merged result must validate.
    pub fn reconfigure(&self, patch: &PipelineConfigPatch) -> Result<()> {
        let mut merged = self.config();
        merged.merge(patch);
        merged.validate()?;
        self.with_state(|state| state.set_config(patch));
        Ok(())
    }

    /// Load the user's checkpoint into the queue state without running it.
    ///
    /// Checkpointed ids missing from `known_items` are logged and dropped.
    /// Fails while a run loop is active, since the restore would replace the
    /// state that loop is working on.
    pub async fn hydrate_from_checkpoint(
        &self,
        user_id: &str,
        known_items: &[FeedbackItem],
    ) -> Result<Option<Checkpoint>> {
        if self.is_busy() {
            return Err(PipelineError::Config(
                "Cannot hydrate from a checkpoint while the pipeline is running".to_string(),
            ));
        }
        self.set_user(user_id);
        let Some(checkpoint) = self
            .checkpoints
            .load(user_id)
            .await
            .map_err(as_checkpoint_error)?
        else {
            debug!(user_id, "No checkpoint found for user");
            return Ok(None);
        };

        let known: Vec<Arc<FeedbackItem>> = known_items.iter().cloned().map(Arc::new).collect();
        self.restore(user_id, &checkpoint, known);
        Ok(Some(checkpoint))
    }

    fn restore(&self, user_id: &str, checkpoint: &Checkpoint, known: Vec<Arc<FeedbackItem>>) {
        let known_ids: std::collections::HashSet<&str> =
            known.iter().map(|item| item.id.as_str()).collect();
        let missing: Vec<&str> = checkpoint
            .queue
            .iter()
            .map(|entry| entry.id.as_str())
            .filter(|id| !known_ids.contains(id))
            .collect();
        if !missing.is_empty() {
            warn!(
                user_id,
                missing = ?missing,
                "Checkpoint references missing feedback items; they will be skipped"
            );
        }

        self.with_state(|state| {
            state.restore_from_checkpoint(checkpoint, known.iter().cloned());
            if checkpoint.status == RunStatus::Paused {
                state.pause();
            }
        });
        self.checkpoint_restored.store(true, Ordering::SeqCst);
    }

    /// Every item the state knows about, overlaid with `new_items`.
    fn collect_known_items(&self, new_items: &[Arc<FeedbackItem>]) -> Vec<Arc<FeedbackItem>> {
        let mut known: HashMap<String, Arc<FeedbackItem>> = self.with_state(|state| {
            state
                .items()
                .map(|entry| (entry.item.id.clone(), Arc::clone(&entry.item)))
                .collect()
        });
        for item in new_items {
            known.insert(item.id.clone(), Arc::clone(item));
        }
        known.into_values().collect()
    }

    /// Establish the user context, merge the saved checkpoint (unless told
    /// not to), enqueue `items`, and run until the queue drains, the run is
    /// paused, or quota runs out.
    ///
    /// While a run is already active, `items` are handed to that run and the
    /// checkpoint is left alone. Starting for a different user at that point
    /// is a configuration error.
    pub async fn start(&self, options: StartOptions) -> Result<RunReport> {
        let user_id = options.user_id;
        let items: Vec<Arc<FeedbackItem>> = options.items.into_iter().map(Arc::new).collect();

        if self.is_busy() {
            if self.current_user().as_deref() != Some(user_id.as_str()) {
                return Err(PipelineError::Config(
                    "Pipeline is already running for another user".to_string(),
                ));
            }
            debug!(user_id = %user_id, added = items.len(), "Pipeline busy; adding items to the active run");
            return Ok(self.with_state(|state| {
                state.enqueue(items);
                RunReport::from_state(state)
            }));
        }

        self.set_user(&user_id);
        let mut restored_paused = false;

        if options.resume_from_checkpoint {
            let saved = self
                .checkpoints
                .load(&user_id)
                .await
                .map_err(as_checkpoint_error)?;
            if let Some(checkpoint) = saved {
                info!(
                    user_id = %user_id,
                    status = checkpoint.status.as_str(),
                    queue_size = checkpoint.queue.len(),
                    "Restoring checkpoint before starting pipeline"
                );
                let known = self.collect_known_items(&items);
                self.restore(&user_id, &checkpoint, known);
                restored_paused = checkpoint.status == RunStatus::Paused;
            }
        }

        self.with_state(|state| {
            if !items.is_empty() {
                state.enqueue(items);
            }
            if restored_paused {
                state.pause();
            }
        });

        self.run().await
    }

    /// Continue a paused or hydrated run.
    pub async fn resume(&self) -> Result<RunReport> {
        if self.current_user().is_none() {
            return Err(PipelineError::Config(
                "Cannot resume pipeline without a user context".to_string(),
            ));
        }
        if self.is_busy() {
            debug!("Pipeline already running; resume ignored");
            return Ok(self.with_state(|state| RunReport::from_state(state)));
        }

        self.with_state(|state| state.resume());
        self.run().await
    }

    /// Ask the run loop to stop after its current await and save progress.
    pub async fn pause(&self) -> Result<()> {
        self.keep_running.store(false, Ordering::SeqCst);
        self.with_state(|state| state.pause());
        if let Some(user_id) = self.current_user() {
            self.persist_checkpoint(&user_id).await?;
        }
        Ok(())
    }

    /// Stop the run, cancel every open item and delete the checkpoint.
    pub async fn cancel(&self) -> Result<()> {
        self.keep_running.store(false, Ordering::SeqCst);
        self.with_state(|state| state.cancel(None));
        if let Some(user_id) = self.current_user() {
            self.checkpoints
                .clear(&user_id)
                .await
                .map_err(as_checkpoint_error)?;
            info!(user_id = %user_id, "Pipeline canceled");
        }
        Ok(())
    }

    async fn persist_checkpoint(&self, user_id: &str) -> Result<()> {
        let snapshot = self.with_state(|state| state.get_snapshot(user_id));
        self.checkpoints
            .save(&snapshot)
            .await
            .map_err(as_checkpoint_error)
    }

    async fn run(&self) -> Result<RunReport> {
        let Some(user_id) = self.current_user() else {
            return Err(PipelineError::Config(
                "Pipeline requires a user context before starting".to_string(),
            ));
        };

        if self
            .busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!(user_id = %user_id, "Run loop already active");
            return Ok(self.with_state(|state| RunReport::from_state(state)));
        }
        let _busy = BusyGuard(&self.busy);
        let restored = self.checkpoint_restored.swap(false, Ordering::SeqCst);

        if !self.with_state(|state| state.has_pending_work()) {
            debug!(user_id = %user_id, "No pending items to process; skipping run");
            let report = self.with_state(|state| RunReport::from_state(state));
            if restored {
                // Nothing in the restored checkpoint can be replayed.
                self.with_state(|state| state.reset());
                self.checkpoints
                    .clear(&user_id)
                    .await
                    .map_err(as_checkpoint_error)?;
                info!(user_id = %user_id, "Cleared checkpoint with no remaining work");
            }
            return Ok(report);
        }

        self.keep_running.store(true, Ordering::SeqCst);
        self.with_state(|state| {
            state.mark_running();
            state.clear_rate_limit_error();
        });
        self.persist_checkpoint(&user_id).await?;

        while self.keep_running() && self.with_state(|state| state.has_pending_work()) {
            if self.status() == RunStatus::Paused {
                info!(user_id = %user_id, "Pipeline paused; breaking processing loop");
                break;
            }

            let batch = self.collect_next_batch();
            if batch.is_empty() {
                break;
            }
            debug!(user_id = %user_id, batch = ?batch, "Processing batch");

            for (index, item_id) in batch.iter().enumerate() {
                if !self.keep_running() {
                    break;
                }

                match self.process_item(&user_id, item_id).await {
                    Ok(ItemOutcome::Completed) => {
                        if let Err(err) = self.quota.register_usage(1).await {
                            error!(user_id = %user_id, item_id = %item_id, error = %err, "Failed to register quota usage");
                        }
                    }
                    Ok(ItemOutcome::Failed | ItemOutcome::Skipped | ItemOutcome::Interrupted) => {}
                    Err(err @ PipelineError::Checkpoint(_)) => {
                        self.keep_running.store(false, Ordering::SeqCst);
                        error!(user_id = %user_id, item_id = %item_id, error = %err, "Checkpoint write failed; aborting run");
                        return Err(err);
                    }
                    Err(err) => {
                        error!(user_id = %user_id, item_id = %item_id, error = %err, "Pipeline item processing failed");
                    }
                }

                if !self.keep_running() {
                    break;
                }

                let more = index + 1 < batch.len() || self.with_state(|s| s.has_pending_work());
                let delay = self.config().delay();
                if more && !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
            }
        }

        self.keep_running.store(false, Ordering::SeqCst);
        let report = self.with_state(|state| RunReport::from_state(state));

        if report.is_complete() {
            self.with_state(|state| state.reset());
            self.checkpoints
                .clear(&user_id)
                .await
                .map_err(as_checkpoint_error)?;
            info!(
                user_id = %user_id,
                processed = report.processed_ids.len(),
                failed = report.failed.len(),
                "Pipeline processing completed"
            );
        } else {
            self.persist_checkpoint(&user_id).await?;
            info!(user_id = %user_id, remaining = report.remaining, "Pipeline suspended");
        }

        Ok(report)
    }

    /// Unfinished in-flight ids (active first), then up to `batch_size`
    /// ids pulled from the queue.
    fn collect_next_batch(&self) -> Vec<String> {
        self.with_state(|state| {
            let batch_size = state.config().batch_size.max(1);
            let mut ids = state.unfinished_in_flight();
            while ids.len() < batch_size {
                let Some(next) = state.dequeue() else {
                    break;
                };
                if !ids.contains(&next) {
                    ids.push(next);
                }
            }
            ids
        })
    }

    fn is_item_open(&self, id: &str) -> bool {
        self.with_state(|state| state.item(id).is_some_and(|entry| entry.status.is_open()))
    }

    async fn enrich(&self, feedback: &FeedbackItem, config: &PipelineConfig) -> Result<Enrichment> {
        let sentiment = self
            .gateway
            .analyze_sentiment(feedback)
            .await
            .map_err(|source| PipelineError::Stage {
                stage: "sentiment",
                source,
            })?;

        let summary = if config.summarization_enabled && self.gateway.supports_summary() {
            let summary = self
                .gateway
                .summarize(feedback, &sentiment)
                .await
                .map_err(|source| PipelineError::Stage {
                    stage: "summary",
                    source,
                })?;
            Some(summary)
        } else {
            None
        };

        let kb_matches = self
            .gateway
            .match_knowledge_base(
                feedback,
                KnowledgeBaseContext {
                    sentiment: &sentiment,
                    summary: summary.as_ref(),
                },
            )
            .await
            .map_err(|source| PipelineError::Stage {
                stage: "knowledge_base",
                source,
            })?;

        let reply = self
            .gateway
            .generate_reply(
                feedback,
                ReplyContext {
                    sentiment: &sentiment,
                    summary: summary.as_ref(),
                    kb_matches: &kb_matches,
                },
            )
            .await
            .map_err(|source| PipelineError::Stage {
                stage: "reply",
                source,
            })?;

        Ok(Enrichment {
            sentiment,
            summary,
            kb_matches,
            reply,
        })
    }

    async fn process_item(&self, user_id: &str, id: &str) -> Result<ItemOutcome> {
        let Some((feedback, status, prior_attempts)) = self.with_state(|state| {
            state
                .item(id)
                .map(|entry| (Arc::clone(&entry.item), entry.status, entry.attempts))
        }) else {
            warn!(user_id, item_id = id, "Skipping unknown pipeline item");
            return Ok(ItemOutcome::Skipped);
        };
        if !status.is_open() {
            debug!(user_id, item_id = id, status = status.as_str(), "Skipping finished pipeline item");
            return Ok(ItemOutcome::Skipped);
        }

        if let Err(err) = self.quota.ensure_within_quota(1).await {
            self.with_state(|state| state.pause());
            error!(user_id, item_id = id, error = %err, "Quota exceeded while processing pipeline item");
            return Err(err);
        }

        self.with_state(|state| state.mark_processing(id));

        let config = self.config();
        let started_at = Utc::now();
        let mut retry_delays: Vec<u64> = Vec::new();
        let mut attempt = prior_attempts;

        while attempt < config.max_retries {
            attempt += 1;
            self.with_state(|state| state.record_attempt(id));

            let result = match self.enrich(&feedback, &config).await {
                Ok(_) if !self.is_item_open(id) => {
                    info!(user_id, item_id = id, "Item canceled mid-flight; discarding result");
                    return Ok(ItemOutcome::Skipped);
                }
                Ok(enrichment) => {
                    let record =
                        enrichment.into_record(&feedback, started_at, attempt, retry_delays.clone());
                    self.persister
                        .persist(&record, &feedback)
                        .await
                        .map(|()| record)
                }
                Err(err) => Err(err),
            };

            let err = match result {
                Ok(record) => {
                    self.with_state(|state| {
                        state.mark_completed(id);
                        state.clear_rate_limit_error();
                    });
                    self.persist_checkpoint(user_id).await?;
                    info!(
                        user_id,
                        item_id = id,
                        attempts = record.job.attempts,
                        "Pipeline item completed"
                    );
                    return Ok(ItemOutcome::Completed);
                }
                Err(err) => err,
            };

            let message = err.to_string();
            warn!(user_id, item_id = id, attempt, error = %message, "Pipeline attempt failed");

            if !self.is_item_open(id) {
                return Ok(ItemOutcome::Skipped);
            }

            if err.is_rate_limited() {
                let delay = config.backoff_delay(retry_delays.len() as u32);
                retry_delays.push(delay.as_millis() as u64);
                self.with_state(|state| state.set_rate_limit_error(&message));
                info!(user_id, item_id = id, delay_ms = delay.as_millis() as u64, "Rate limited; backing off");
                tokio::time::sleep(delay).await;
                if !self.keep_running() || !self.is_item_open(id) {
                    return Ok(ItemOutcome::Interrupted);
                }
                self.with_state(|state| state.resume());
                continue;
            }

            if attempt >= config.max_retries {
                self.with_state(|state| state.mark_failed(id, &message));
                self.persist_checkpoint(user_id).await?;
                return Err(err);
            }

            let delay = config.backoff_delay(retry_delays.len() as u32);
            retry_delays.push(delay.as_millis() as u64);
            tokio::time::sleep(delay).await;
            if !self.keep_running() || !self.is_item_open(id) {
                return Ok(ItemOutcome::Interrupted);
            }
        }

        if !self.is_item_open(id) {
            return Ok(ItemOutcome::Skipped);
        }
        self.with_state(|state| state.mark_failed(id, "Max retries exceeded"));
        self.persist_checkpoint(user_id).await?;
        warn!(user_id, item_id = id, attempts = attempt, "Pipeline item exhausted its retries");
        Ok(ItemOutcome::Failed)
    }
}

/// Builder for [`PipelineProcessor`].
#[derive(Default)]
pub struct PipelineProcessorBuilder {
    gateway: Option<Arc<dyn EnrichmentGateway>>,
    persister: Option<Arc<dyn ResultPersister>>,
    checkpoints: Option<Arc<dyn CheckpointStore>>,
    quota: Option<Arc<dyn QuotaGate>>,
    config: PipelineConfig,
}

impl PipelineProcessorBuilder {
    pub fn gateway(mut self, gateway: Arc<dyn EnrichmentGateway>) -> Self {
        self.gateway = Some(gateway);
        self
    }

    pub fn persister(mut self, persister: Arc<dyn ResultPersister>) -> Self {
        self.persister = Some(persister);
        self
    }

    pub fn checkpoint_store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoints = Some(store);
        self
    }

    /// Defaults to [`UnlimitedQuota`].
    pub fn quota(mut self, quota: Arc<dyn QuotaGate>) -> Self {
        self.quota = Some(quota);
        self
    }

    pub fn config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    /// Build the processor, validating configuration.
    pub fn build(self) -> Result<PipelineProcessor> {
        self.config.validate()?;
        let gateway = self
            .gateway
            .ok_or_else(|| PipelineError::Config("An enrichment gateway is required".to_string()))?;
        let persister = self
            .persister
            .ok_or_else(|| PipelineError::Config("A result persister is required".to_string()))?;
        let checkpoints = self
            .checkpoints
            .ok_or_else(|| PipelineError::Config("A checkpoint store is required".to_string()))?;

        Ok(PipelineProcessor {
            state: Mutex::new(FeedbackQueueState::new(self.config)),
            gateway,
            persister,
            checkpoints,
            quota: self.quota.unwrap_or_else(|| Arc::new(UnlimitedQuota)),
            user_id: Mutex::new(None),
            busy: AtomicBool::new(false),
            keep_running: AtomicBool::new(false),
            checkpoint_restored: AtomicBool::new(false),
        })
    }
}
