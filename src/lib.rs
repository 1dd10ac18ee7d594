//! # Feedback Pipeline
//!
//! Resumable enrichment pipeline for customer feedback.
//!
//! Each feedback item goes through sentiment analysis, an optional summary,
//! knowledge-base matching and reply generation. The finished analysis is
//! persisted atomically and the run is checkpointed after every item.
//!
//! ## Features
//!
//! - FIFO batches with a configurable inter-item delay
//! - Exponential backoff on rate limits and transient failures
//! - Per-item retry budget; failed items never block the rest of the queue
//! - Quota gating (fixed, monthly, or unlimited)
//! - Checkpoint/resume across process restarts, with SQLite or in-memory stores
//! - Cooperative pause and cancel
//!
//! ## Quick Start
//!
//! 1. Implement [`EnrichmentGateway`] or use [`HttpEnrichmentGateway`]
//! 2. Pick a [`ResultPersister`] and a [`CheckpointStore`]
//! 3. Build a [`PipelineProcessor`] and call [`PipelineProcessor::start`]
//!
//! See the `demos/` directory for complete usage examples.

pub mod checkpoint;
pub mod config;
pub mod db;
pub mod error;
pub mod gateway;
pub mod persister;
pub mod processor;
pub mod quota;
pub mod state;
pub mod types;

pub use checkpoint::{CheckpointStore, InMemoryCheckpointStore, SqliteCheckpointStore};
pub use config::{PipelineConfig, PipelineConfigBuilder, PipelineConfigPatch};
pub use error::{PipelineError, Result, StageError};
pub use gateway::{
    EnrichmentGateway, HttpEnrichmentGateway, HttpGatewayConfig, KnowledgeBaseContext,
    ReplyContext,
};
pub use persister::{InMemoryResultPersister, ResultPersister, SqliteResultPersister};
pub use processor::{
    FailedItem, PipelineProcessor, PipelineProcessorBuilder, RunReport, StartOptions,
};
pub use quota::{MonthlyQuotaGate, MonthlyUsage, QuotaGate, SimpleQuotaGate, UnlimitedQuota};
pub use state::FeedbackQueueState;
pub use types::{
    AnalysisJobMetadata, AnalysisRecord, Checkpoint, CheckpointItem, FeedbackItem,
    KnowledgeBaseMatch, KnowledgeBaseMatchResult, PipelineItemState, PipelineItemStatus,
    PipelineProgress, RunStatus, SentimentResult, SuggestedReply, SummaryResult,
};
