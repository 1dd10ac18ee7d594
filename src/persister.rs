use crate::{
    db,
    error::{PipelineError, Result},
    types::{AnalysisRecord, FeedbackItem},
};
use async_trait::async_trait;
use rusqlite::Connection;
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Durable sink for finished analyses.
///
/// `persist` must be atomic: the analysis, the feedback item's
/// last-modified timestamp and the user's last-processed pointer are
/// written together or not at all.
#[async_trait]
pub trait ResultPersister: Send + Sync {
    async fn persist(&self, record: &AnalysisRecord, feedback: &FeedbackItem) -> Result<()>;
}

fn persist_err(err: impl std::fmt::Display) -> PipelineError {
    PipelineError::Persistence(err.to_string())
}

/// SQLite-backed persister writing the analysis and its side effects in one
/// transaction.
#[derive(Clone)]
pub struct SqliteResultPersister {
    db: Arc<Mutex<Connection>>,
}

impl SqliteResultPersister {
    pub fn open(path: Option<&Path>) -> Result<Self> {
        let conn = db::open_database(path).map_err(|e| persist_err(format!("{:#}", e)))?;
        Ok(Self::from_connection(Arc::new(Mutex::new(conn))))
    }

    pub fn from_connection(db: Arc<Mutex<Connection>>) -> Self {
        Self { db }
    }

    /// All analyses stored for a user, oldest first.
    pub fn list(&self, user_id: &str) -> Result<Vec<AnalysisRecord>> {
        let conn = self.db.lock().map_err(persist_err)?;
        db::list_analyses(&conn, user_id).map_err(|e| persist_err(format!("{:#}", e)))
    }
}

#[async_trait]
impl ResultPersister for SqliteResultPersister {
    async fn persist(&self, record: &AnalysisRecord, feedback: &FeedbackItem) -> Result<()> {
        let mut conn = self.db.lock().map_err(persist_err)?;
        db::persist_analysis(&mut conn, record, feedback)
            .map_err(|e| persist_err(format!("{:#}", e)))
    }
}

/// Keeps every persisted record in memory, in call order.
#[derive(Debug, Default)]
pub struct InMemoryResultPersister {
    records: Mutex<Vec<(AnalysisRecord, FeedbackItem)>>,
}

impl InMemoryResultPersister {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<AnalysisRecord> {
        self.records
            .lock()
            .map(|records| records.iter().map(|(r, _)| r.clone()).collect())
            .unwrap_or_default()
    }

    /// Feedback ids in persist order, duplicates included.
    pub fn feedback_ids(&self) -> Vec<String> {
        self.records
            .lock()
            .map(|records| records.iter().map(|(_, f)| f.id.clone()).collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ResultPersister for InMemoryResultPersister {
    async fn persist(&self, record: &AnalysisRecord, feedback: &FeedbackItem) -> Result<()> {
        let mut records = self.records.lock().map_err(persist_err)?;
        records.push((record.clone(), feedback.clone()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AnalysisJobMetadata, SentimentResult, SuggestedReply};
    use chrono::Utc;
    use serde_json::json;

    fn record(feedback: &FeedbackItem) -> AnalysisRecord {
        let now = Utc::now();
        AnalysisRecord {
            id: format!("{}-{}", feedback.id, now.to_rfc3339()),
            user_id: feedback.user_id.clone(),
            feedback_id: feedback.id.clone(),
            sentiment: SentimentResult {
                label: "negative".into(),
                score: 0.2,
                raw: json!({}),
            },
            tags: vec![],
            kb_match_ids: vec![],
            suggested_reply: SuggestedReply {
                content: "Sorry to hear that".into(),
                model: "test".into(),
                raw: None,
            },
            summary: None,
            job: AnalysisJobMetadata {
                started_at: now,
                completed_at: now,
                attempts: 1,
                retry_delays: vec![],
                last_error: None,
            },
        }
    }

    #[tokio::test]
    async fn test_in_memory_persister_keeps_order() {
        let persister = InMemoryResultPersister::new();
        assert!(persister.is_empty());

        for id in ["f-2", "f-1"] {
            let item = FeedbackItem::new("user-1", "text").with_id(id);
            persister.persist(&record(&item), &item).await.unwrap();
        }

        assert_eq!(persister.feedback_ids(), vec!["f-2", "f-1"]);
        assert_eq!(persister.records().len(), 2);
    }

    #[tokio::test]
    async fn test_sqlite_persister_rejects_duplicate_feedback() {
        let persister = SqliteResultPersister::open(None).unwrap();
        let item = FeedbackItem::new("user-1", "text").with_id("f-1");

        persister.persist(&record(&item), &item).await.unwrap();
        let err = persister.persist(&record(&item), &item).await.unwrap_err();
        assert!(matches!(err, PipelineError::Persistence(_)));

        let stored = persister.list("user-1").unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].feedback_id, "f-1");
    }
}
