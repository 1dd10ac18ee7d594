use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;

/// Free-form metadata attached to feedback and knowledge-base matches.
pub type Metadata = Map<String, Value>;

/// A single piece of customer feedback submitted for enrichment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedbackItem {
    pub id: String,
    pub user_id: String,
    pub text: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
}

impl FeedbackItem {
    /// Create a new feedback item with a generated UUID.
    pub fn new(user_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            text: text.into(),
            created_at: Utc::now(),
            metadata: None,
        }
    }

    /// Set a custom ID for this item (builder pattern).
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Attach metadata (builder pattern).
    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Item lifecycle: Pending -> Processing -> Completed/Failed, or Canceled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineItemStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Canceled,
}

impl PipelineItemStatus {
    pub fn as_str(&self) -> &str {
        match self {
            PipelineItemStatus::Pending => "pending",
            PipelineItemStatus::Processing => "processing",
            PipelineItemStatus::Completed => "completed",
            PipelineItemStatus::Failed => "failed",
            PipelineItemStatus::Canceled => "canceled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(PipelineItemStatus::Pending),
            "processing" => Some(PipelineItemStatus::Processing),
            "completed" => Some(PipelineItemStatus::Completed),
            "failed" => Some(PipelineItemStatus::Failed),
            "canceled" => Some(PipelineItemStatus::Canceled),
            _ => None,
        }
    }

    /// Pending and processing items still have work left.
    pub fn is_open(&self) -> bool {
        matches!(
            self,
            PipelineItemStatus::Pending | PipelineItemStatus::Processing
        )
    }
}

/// Per-item bookkeeping held by the queue state.
#[derive(Debug, Clone)]
pub struct PipelineItemState {
    pub item: Arc<FeedbackItem>,
    pub status: PipelineItemStatus,
    pub attempts: u32,
    pub error: Option<String>,
    pub last_updated_at: DateTime<Utc>,
}

impl PipelineItemState {
    pub(crate) fn pending(item: Arc<FeedbackItem>) -> Self {
        Self {
            item,
            status: PipelineItemStatus::Pending,
            attempts: 0,
            error: None,
            last_updated_at: Utc::now(),
        }
    }

    pub(crate) fn to_checkpoint_item(&self) -> CheckpointItem {
        CheckpointItem {
            id: self.item.id.clone(),
            status: self.status,
            attempts: self.attempts,
            error: self.error.clone(),
        }
    }
}

/// Process-wide run status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    #[default]
    Idle,
    Running,
    Paused,
}

impl RunStatus {
    pub fn as_str(&self) -> &str {
        match self {
            RunStatus::Idle => "idle",
            RunStatus::Running => "running",
            RunStatus::Paused => "paused",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SentimentResult {
    pub label: String,
    pub score: f64,
    #[serde(default)]
    pub raw: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryResult {
    pub summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeBaseMatch {
    pub id: String,
    pub score: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KnowledgeBaseMatchResult {
    pub kb_match_ids: Vec<String>,
    pub matches: Vec<KnowledgeBaseMatch>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuggestedReply {
    pub content: String,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<Value>,
}

/// Timing and retry history of the job that produced an analysis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisJobMetadata {
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub attempts: u32,
    /// Backoff waits actually incurred, in milliseconds.
    pub retry_delays: Vec<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// The enriched result for one feedback item. Written once, never updated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisRecord {
    pub id: String,
    pub user_id: String,
    pub feedback_id: String,
    pub sentiment: SentimentResult,
    pub tags: Vec<String>,
    pub kb_match_ids: Vec<String>,
    pub suggested_reply: SuggestedReply,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    pub job: AnalysisJobMetadata,
}

/// One queue entry inside a [`Checkpoint`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointItem {
    pub id: String,
    pub status: PipelineItemStatus,
    pub attempts: u32,
    #[serde(default)]
    pub error: Option<String>,
}

/// Durable snapshot of pipeline progress for one user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    pub user_id: String,
    pub queue: Vec<CheckpointItem>,
    pub processed_ids: Vec<String>,
    pub status: RunStatus,
    #[serde(default)]
    pub active_item_id: Option<String>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Item counts per status, for progress displays.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineProgress {
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub canceled: usize,
}

impl PipelineProgress {
    pub fn total(&self) -> usize {
        self.pending + self.processing + self.completed + self.failed + self.canceled
    }
}
