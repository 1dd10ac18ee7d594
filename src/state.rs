//! In-process pipeline progress.
//!
//! [`FeedbackQueueState`] is a plain value with named transitions. Every
//! transition that changes something bumps [`version`](FeedbackQueueState::version),
//! so an observer can cheaply tell whether a snapshot it holds is stale.
//! Transitions on unknown ids are no-ops.

use crate::{
    config::{PipelineConfig, PipelineConfigPatch},
    types::{
        Checkpoint, FeedbackItem, PipelineItemState, PipelineItemStatus, PipelineProgress,
        RunStatus,
    },
};
use chrono::Utc;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

#[derive(Debug, Clone, Default)]
pub struct FeedbackQueueState {
    items: HashMap<String, PipelineItemState>,
    queue: VecDeque<String>,
    /// Ids handed out by `dequeue` that have not reached a terminal status yet.
    in_flight: Vec<String>,
    processed_ids: Vec<String>,
    status: RunStatus,
    active_item_id: Option<String>,
    last_error: Option<String>,
    rate_limit_error: Option<String>,
    config: PipelineConfig,
    version: u64,
}

impl FeedbackQueueState {
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            config,
            ..Default::default()
        }
    }

    // -- reads --

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn status(&self) -> RunStatus {
        self.status
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn item(&self, id: &str) -> Option<&PipelineItemState> {
        self.items.get(id)
    }

    pub fn items(&self) -> impl Iterator<Item = &PipelineItemState> {
        self.items.values()
    }

    pub fn queue(&self) -> impl Iterator<Item = &str> {
        self.queue.iter().map(String::as_str)
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn in_flight(&self) -> &[String] {
        &self.in_flight
    }

    pub fn processed_ids(&self) -> &[String] {
        &self.processed_ids
    }

    pub fn active_item_id(&self) -> Option<&str> {
        self.active_item_id.as_deref()
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn rate_limit_error(&self) -> Option<&str> {
        self.rate_limit_error.as_deref()
    }

    fn is_open(&self, id: &str) -> bool {
        self.items.get(id).is_some_and(|entry| entry.status.is_open())
    }

    fn is_started(&self, id: &str) -> bool {
        self.items
            .get(id)
            .is_some_and(|entry| entry.status == PipelineItemStatus::Processing)
    }

    /// The active item, but only once work on it has begun.
    fn started_active(&self) -> Option<&str> {
        self.active_item_id
            .as_deref()
            .filter(|id| self.is_started(id))
    }

    /// True while anything is queued or a dequeued item is still unfinished.
    pub fn has_pending_work(&self) -> bool {
        !self.queue.is_empty() || self.in_flight.iter().any(|id| self.is_open(id))
    }

    /// Dequeued-but-unfinished ids in dequeue order, led by the active item
    /// when it was already being processed.
    pub fn unfinished_in_flight(&self) -> Vec<String> {
        let mut ids = Vec::new();
        if let Some(active) = self.started_active() {
            ids.push(active.to_string());
        }
        for id in &self.in_flight {
            if self.is_open(id) && !ids.contains(id) {
                ids.push(id.clone());
            }
        }
        ids
    }

    pub fn progress(&self) -> PipelineProgress {
        let mut progress = PipelineProgress::default();
        for entry in self.items.values() {
            match entry.status {
                PipelineItemStatus::Pending => progress.pending += 1,
                PipelineItemStatus::Processing => progress.processing += 1,
                PipelineItemStatus::Completed => progress.completed += 1,
                PipelineItemStatus::Failed => progress.failed += 1,
                PipelineItemStatus::Canceled => progress.canceled += 1,
            }
        }
        progress
    }

    // -- transitions --

    fn touch(&mut self) {
        self.version += 1;
    }

    fn update_item<F>(&mut self, id: &str, f: F) -> bool
    where
        F: FnOnce(&mut PipelineItemState),
    {
        match self.items.get_mut(id) {
            Some(entry) => {
                f(entry);
                entry.last_updated_at = Utc::now();
                self.version += 1;
                true
            }
            None => false,
        }
    }

    fn release(&mut self, id: &str) {
        self.in_flight.retain(|entry| entry != id);
        if self.active_item_id.as_deref() == Some(id) {
            self.active_item_id = None;
        }
    }

    /// Add items as pending and append them to the queue in input order.
    ///
    /// Items already known keep their status and attempts, except that a
    /// failed or canceled item is reset to pending: submitting it again is
    /// how a caller asks for a retry. Completed ids are never queued again.
    pub fn enqueue<I>(&mut self, items: I)
    where
        I: IntoIterator<Item = Arc<FeedbackItem>>,
    {
        let now = Utc::now();
        for item in items {
            let id = item.id.clone();
            match self.items.get_mut(&id) {
                Some(existing) => {
                    existing.item = item;
                    existing.last_updated_at = now;
                    if matches!(
                        existing.status,
                        PipelineItemStatus::Failed | PipelineItemStatus::Canceled
                    ) {
                        existing.status = PipelineItemStatus::Pending;
                        existing.attempts = 0;
                        existing.error = None;
                    }
                }
                None => {
                    self.items.insert(id.clone(), PipelineItemState::pending(item));
                }
            }

            let already_tracked = self.processed_ids.contains(&id)
                || self.queue.contains(&id)
                || self.in_flight.contains(&id)
                || self.active_item_id.as_deref() == Some(id.as_str());
            if !already_tracked {
                self.queue.push_back(id);
            }
        }
        self.touch();
    }

    /// Pop the queue head and record it as the active item.
    ///
    /// While an earlier dequeued item is still open it stays active, so the
    /// active id is always the head of the current batch.
    pub fn dequeue(&mut self) -> Option<String> {
        let next = self.queue.pop_front()?;
        if !self.in_flight.contains(&next) {
            self.in_flight.push(next.clone());
        }
        let keep_active = self
            .active_item_id
            .as_deref()
            .is_some_and(|active| active != next && self.is_open(active));
        if !keep_active {
            self.active_item_id = Some(next.clone());
        }
        self.touch();
        Some(next)
    }

    /// Mark an item processing. An in-flight item also becomes the active one.
    pub fn mark_processing(&mut self, id: &str) {
        if self.update_item(id, |entry| entry.status = PipelineItemStatus::Processing)
            && self.in_flight.iter().any(|entry| entry == id)
        {
            self.active_item_id = Some(id.to_string());
        }
    }

    pub fn mark_pending(&mut self, id: &str) {
        self.update_item(id, |entry| {
            entry.status = PipelineItemStatus::Pending;
            entry.error = None;
        });
    }

    pub fn record_attempt(&mut self, id: &str) {
        self.update_item(id, |entry| entry.attempts += 1);
    }

    pub fn mark_completed(&mut self, id: &str) {
        if !self.update_item(id, |entry| {
            entry.status = PipelineItemStatus::Completed;
            entry.error = None;
        }) {
            return;
        }
        if !self.processed_ids.iter().any(|entry| entry == id) {
            self.processed_ids.push(id.to_string());
        }
        self.release(id);
        self.last_error = None;

        let all_completed = self
            .items
            .values()
            .all(|entry| entry.status == PipelineItemStatus::Completed);
        if self.queue.is_empty() && all_completed {
            self.status = RunStatus::Idle;
        }
    }

    /// Record a permanent failure. The item stays visible with its error.
    pub fn mark_failed(&mut self, id: &str, error: &str) {
        if !self.update_item(id, |entry| {
            entry.status = PipelineItemStatus::Failed;
            entry.error = Some(error.to_string());
        }) {
            return;
        }
        self.last_error = Some(error.to_string());
        self.release(id);
    }

    /// Cancel one item, or every open item when `id` is `None`.
    pub fn cancel(&mut self, id: Option<&str>) {
        match id {
            Some(id) => {
                if self.update_item(id, |entry| entry.status = PipelineItemStatus::Canceled) {
                    self.queue.retain(|entry| entry != id);
                    self.release(id);
                }
            }
            None => {
                let now = Utc::now();
                for entry in self.items.values_mut() {
                    if entry.status.is_open() {
                        entry.status = PipelineItemStatus::Canceled;
                        entry.last_updated_at = now;
                    }
                }
                self.queue.clear();
                self.in_flight.clear();
                self.active_item_id = None;
                self.status = RunStatus::Idle;
                self.touch();
            }
        }
    }

    /// Forget an id entirely, including any queue or in-flight reference.
    pub fn remove(&mut self, id: &str) {
        self.items.remove(id);
        self.queue.retain(|entry| entry != id);
        self.processed_ids.retain(|entry| entry != id);
        self.release(id);
        self.touch();
    }

    /// Drop all progress. Configuration is kept.
    pub fn reset(&mut self) {
        let config = self.config.clone();
        let version = self.version;
        *self = Self::new(config);
        self.version = version + 1;
    }

    pub fn set_config(&mut self, patch: &PipelineConfigPatch) {
        self.config.merge(patch);
        self.touch();
    }

    pub fn mark_running(&mut self) {
        self.status = RunStatus::Running;
        self.last_error = None;
        self.touch();
    }

    pub fn pause(&mut self) {
        self.status = RunStatus::Paused;
        self.touch();
    }

    pub fn resume(&mut self) {
        self.status = RunStatus::Running;
        self.rate_limit_error = None;
        self.touch();
    }

    /// Raise the advisory rate-limit flag. Forces the run status to paused.
    pub fn set_rate_limit_error(&mut self, message: &str) {
        self.rate_limit_error = Some(message.to_string());
        self.status = RunStatus::Paused;
        self.touch();
    }

    pub fn clear_rate_limit_error(&mut self) {
        if self.rate_limit_error.take().is_some() {
            self.touch();
        }
    }

    /// Serialize progress into the durable checkpoint shape.
    ///
    /// An active item that was already processing leads the queue, followed
    /// by the rest of the current batch in dequeue order and then the
    /// untouched queue, so hydration replays interrupted work first and
    /// otherwise keeps FIFO order.
    pub fn get_snapshot(&self, user_id: &str) -> Checkpoint {
        let mut ordered: Vec<&str> = Vec::new();
        if let Some(active) = self.started_active() {
            ordered.push(active);
        }
        for id in &self.in_flight {
            if self.is_open(id) && !ordered.contains(&id.as_str()) {
                ordered.push(id);
            }
        }
        for id in &self.queue {
            if !ordered.contains(&id.as_str()) {
                ordered.push(id);
            }
        }

        Checkpoint {
            user_id: user_id.to_string(),
            queue: ordered
                .into_iter()
                .filter_map(|id| self.items.get(id))
                .map(PipelineItemState::to_checkpoint_item)
                .collect(),
            processed_ids: self.processed_ids.clone(),
            status: self.status,
            active_item_id: self.active_item_id.clone(),
            updated_at: Utc::now(),
            error: self.last_error.clone(),
        }
    }

    /// Rebuild progress from a checkpoint.
    ///
    /// Checkpointed ids are resolved against `known_items`; ids without a
    /// payload cannot be replayed and are dropped. Processed ids come back as
    /// completed.
    pub fn restore_from_checkpoint<I>(&mut self, checkpoint: &Checkpoint, known_items: I)
    where
        I: IntoIterator<Item = Arc<FeedbackItem>>,
    {
        let now = Utc::now();
        let known: HashMap<String, Arc<FeedbackItem>> = known_items
            .into_iter()
            .map(|item| (item.id.clone(), item))
            .collect();

        let mut processed_ids = Vec::new();
        let mut seen = HashSet::new();
        for id in &checkpoint.processed_ids {
            if seen.insert(id.as_str()) {
                processed_ids.push(id.clone());
            }
        }

        let mut items = HashMap::new();
        let mut queue = VecDeque::new();
        let mut in_flight = Vec::new();
        let active = checkpoint.active_item_id.as_deref();

        for entry in &checkpoint.queue {
            let Some(feedback) = known.get(&entry.id) else {
                continue;
            };
            if items.contains_key(&entry.id) {
                continue;
            }
            items.insert(
                entry.id.clone(),
                PipelineItemState {
                    item: Arc::clone(feedback),
                    status: entry.status,
                    attempts: entry.attempts,
                    error: entry.error.clone(),
                    last_updated_at: now,
                },
            );
            if entry.status.is_open() && !seen.contains(entry.id.as_str()) {
                let interrupted = Some(entry.id.as_str()) == active
                    && entry.status == PipelineItemStatus::Processing;
                if interrupted {
                    in_flight.push(entry.id.clone());
                } else {
                    queue.push_back(entry.id.clone());
                }
            }
        }

        for id in &processed_ids {
            if let Some(entry) = items.get_mut(id) {
                entry.status = PipelineItemStatus::Completed;
                continue;
            }
            if let Some(feedback) = known.get(id) {
                items.insert(
                    id.clone(),
                    PipelineItemState {
                        item: Arc::clone(feedback),
                        status: PipelineItemStatus::Completed,
                        attempts: 1,
                        error: None,
                        last_updated_at: now,
                    },
                );
            }
        }

        let active_item_id = in_flight.first().cloned();

        self.items = items;
        self.queue = queue;
        self.in_flight = in_flight;
        self.processed_ids = processed_ids;
        self.status = checkpoint.status;
        self.active_item_id = active_item_id;
        self.last_error = checkpoint.error.clone();
        self.rate_limit_error = None;
        self.touch();
    }
}
