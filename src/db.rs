use crate::types::{AnalysisRecord, Checkpoint, FeedbackItem};
use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS pipeline_checkpoints (
    user_id          TEXT PRIMARY KEY,
    status           TEXT CHECK(status IN ('idle', 'running', 'paused')),
    checkpoint_json  TEXT NOT NULL,
    updated_at       DATETIME NOT NULL
);

CREATE TABLE IF NOT EXISTS feedback (
    id              TEXT PRIMARY KEY,
    user_id         TEXT NOT NULL,
    text            TEXT NOT NULL,
    metadata_json   TEXT,
    created_at      DATETIME NOT NULL,
    updated_at      DATETIME
);

CREATE TABLE IF NOT EXISTS analyses (
    id              TEXT PRIMARY KEY,
    user_id         TEXT NOT NULL,
    feedback_id     TEXT NOT NULL UNIQUE,
    record_json     TEXT NOT NULL,
    completed_at    DATETIME NOT NULL
);

CREATE TABLE IF NOT EXISTS user_progress (
    user_id                     TEXT PRIMARY KEY,
    last_processed_feedback_id  TEXT NOT NULL,
    last_processed_at           DATETIME NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_analyses_user ON analyses(user_id, completed_at);
"#;

/// Open (or create) the pipeline database. Pass `None` for an in-memory database.
pub fn open_database(path: Option<&std::path::Path>) -> Result<Connection> {
    let conn = match path {
        Some(p) => Connection::open(p).context("Failed to open pipeline database")?,
        None => Connection::open_in_memory().context("Failed to open in-memory database")?,
    };

    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;",
    )
    .context("Failed to set PRAGMA options")?;

    conn.execute_batch(SCHEMA)
        .context("Failed to create pipeline schema")?;

    Ok(conn)
}

/// Insert or replace the checkpoint for `checkpoint.user_id`.
pub fn save_checkpoint(conn: &Connection, checkpoint: &Checkpoint) -> Result<()> {
    let json = serde_json::to_string(checkpoint).context("Failed to serialize checkpoint")?;
    conn.execute(
        "INSERT INTO pipeline_checkpoints (user_id, status, checkpoint_json, updated_at)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(user_id) DO UPDATE SET
            status = excluded.status,
            checkpoint_json = excluded.checkpoint_json,
            updated_at = excluded.updated_at",
        params![
            checkpoint.user_id,
            checkpoint.status.as_str(),
            json,
            checkpoint.updated_at.to_rfc3339()
        ],
    )
    .context("Failed to save checkpoint")?;
    Ok(())
}

pub fn load_checkpoint(conn: &Connection, user_id: &str) -> Result<Option<Checkpoint>> {
    let json: Option<String> = conn
        .query_row(
            "SELECT checkpoint_json FROM pipeline_checkpoints WHERE user_id = ?1",
            params![user_id],
            |row| row.get(0),
        )
        .optional()
        .context("Failed to query checkpoint")?;

    match json {
        Some(json) => {
            let checkpoint =
                serde_json::from_str(&json).context("Failed to parse checkpoint JSON")?;
            Ok(Some(checkpoint))
        }
        None => Ok(None),
    }
}

/// Delete the checkpoint for a user. Returns whether one existed.
pub fn clear_checkpoint(conn: &Connection, user_id: &str) -> Result<bool> {
    let count = conn
        .execute(
            "DELETE FROM pipeline_checkpoints WHERE user_id = ?1",
            params![user_id],
        )
        .context("Failed to clear checkpoint")?;
    Ok(count > 0)
}

/// Write an analysis together with its side effects in one transaction:
/// the analysis row, the feedback row's `updated_at`, and the user's
/// last-processed pointer.
pub fn persist_analysis(
    conn: &mut Connection,
    record: &AnalysisRecord,
    feedback: &FeedbackItem,
) -> Result<()> {
    let tx = conn
        .transaction()
        .context("Failed to begin persist transaction")?;
    let completed_at = record.job.completed_at.to_rfc3339();

    tx.execute(
        "INSERT INTO analyses (id, user_id, feedback_id, record_json, completed_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            record.id,
            record.user_id,
            record.feedback_id,
            serde_json::to_string(record)?,
            completed_at
        ],
    )
    .context("Failed to insert analysis")?;

    let metadata_json = feedback
        .metadata
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;
    tx.execute(
        "INSERT INTO feedback (id, user_id, text, metadata_json, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(id) DO UPDATE SET updated_at = excluded.updated_at",
        params![
            feedback.id,
            feedback.user_id,
            feedback.text,
            metadata_json,
            feedback.created_at.to_rfc3339(),
            completed_at
        ],
    )
    .context("Failed to touch feedback row")?;

    tx.execute(
        "INSERT INTO user_progress (user_id, last_processed_feedback_id, last_processed_at)
         VALUES (?1, ?2, ?3)
         ON CONFLICT(user_id) DO UPDATE SET
            last_processed_feedback_id = excluded.last_processed_feedback_id,
            last_processed_at = excluded.last_processed_at",
        params![record.user_id, feedback.id, completed_at],
    )
    .context("Failed to advance last-processed pointer")?;

    tx.commit().context("Failed to commit analysis")?;
    Ok(())
}

pub fn get_analysis(conn: &Connection, feedback_id: &str) -> Result<Option<AnalysisRecord>> {
    let json: Option<String> = conn
        .query_row(
            "SELECT record_json FROM analyses WHERE feedback_id = ?1",
            params![feedback_id],
            |row| row.get(0),
        )
        .optional()
        .context("Failed to query analysis")?;

    json.map(|j| serde_json::from_str(&j).context("Failed to parse analysis JSON"))
        .transpose()
}

/// All analyses for a user, oldest first.
pub fn list_analyses(conn: &Connection, user_id: &str) -> Result<Vec<AnalysisRecord>> {
    let mut stmt = conn
        .prepare(
            "SELECT record_json FROM analyses
             WHERE user_id = ?1
             ORDER BY completed_at ASC, rowid ASC",
        )
        .context("Failed to prepare list_analyses query")?;

    let rows = stmt
        .query_map(params![user_id], |row| row.get::<_, String>(0))
        .context("Failed to execute list_analyses query")?;

    let mut records = Vec::new();
    for row in rows {
        let json = row.context("Failed to read analysis row")?;
        records.push(serde_json::from_str(&json).context("Failed to parse analysis JSON")?);
    }
    Ok(records)
}

/// Returns `(feedback_id, processed_at)` of the user's most recent analysis.
pub fn last_processed(conn: &Connection, user_id: &str) -> Result<Option<(String, String)>> {
    conn.query_row(
        "SELECT last_processed_feedback_id, last_processed_at
         FROM user_progress WHERE user_id = ?1",
        params![user_id],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )
    .optional()
    .context("Failed to query last-processed pointer")
}

pub fn feedback_updated_at(conn: &Connection, feedback_id: &str) -> Result<Option<String>> {
    let updated: Option<Option<String>> = conn
        .query_row(
            "SELECT updated_at FROM feedback WHERE id = ?1",
            params![feedback_id],
            |row| row.get(0),
        )
        .optional()
        .context("Failed to query feedback row")?;
    Ok(updated.flatten())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{
        AnalysisJobMetadata, CheckpointItem, PipelineItemStatus, RunStatus, SentimentResult,
        SuggestedReply,
    };
    use chrono::Utc;

    fn setup() -> Connection {
        open_database(None).unwrap()
    }

    fn checkpoint(user_id: &str, status: RunStatus) -> Checkpoint {
        Checkpoint {
            user_id: user_id.to_string(),
            queue: vec![CheckpointItem {
                id: "f-2".into(),
                status: PipelineItemStatus::Pending,
                attempts: 0,
                error: None,
            }],
            processed_ids: vec!["f-1".into()],
            status,
            active_item_id: None,
            updated_at: Utc::now(),
            error: Some("last failure".into()),
        }
    }

    fn record(feedback: &FeedbackItem) -> AnalysisRecord {
        let now = Utc::now();
        AnalysisRecord {
            id: format!("{}-{}", feedback.id, now.to_rfc3339()),
            user_id: feedback.user_id.clone(),
            feedback_id: feedback.id.clone(),
            sentiment: SentimentResult {
                label: "positive".into(),
                score: 0.9,
                raw: serde_json::Value::Null,
            },
            tags: vec!["kb-1".into()],
            kb_match_ids: vec!["kb-1".into()],
            suggested_reply: SuggestedReply {
                content: "Thanks!".into(),
                model: "test-model".into(),
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

    #[test]
    fn test_open_in_memory() {
        let conn = open_database(None);
        assert!(conn.is_ok());
    }

    #[test]
    fn test_checkpoint_save_and_load() {
        let conn = setup();
        let saved = checkpoint("user-1", RunStatus::Paused);
        save_checkpoint(&conn, &saved).unwrap();

        let loaded = load_checkpoint(&conn, "user-1").unwrap().unwrap();
        assert_eq!(loaded, saved);
        assert!(load_checkpoint(&conn, "user-2").unwrap().is_none());
    }

    #[test]
    fn test_checkpoint_last_write_wins() {
        let conn = setup();
        save_checkpoint(&conn, &checkpoint("user-1", RunStatus::Running)).unwrap();
        let mut second = checkpoint("user-1", RunStatus::Paused);
        second.queue.clear();
        save_checkpoint(&conn, &second).unwrap();

        let loaded = load_checkpoint(&conn, "user-1").unwrap().unwrap();
        assert_eq!(loaded.status, RunStatus::Paused);
        assert!(loaded.queue.is_empty());
    }

    #[test]
    fn test_clear_checkpoint() {
        let conn = setup();
        save_checkpoint(&conn, &checkpoint("user-1", RunStatus::Idle)).unwrap();
        assert!(clear_checkpoint(&conn, "user-1").unwrap());
        assert!(!clear_checkpoint(&conn, "user-1").unwrap());
        assert!(load_checkpoint(&conn, "user-1").unwrap().is_none());
    }

    #[test]
    fn test_persist_analysis_side_effects() {
        let mut conn = setup();
        let feedback = FeedbackItem::new("user-1", "love it").with_id("f-1");
        let rec = record(&feedback);
        persist_analysis(&mut conn, &rec, &feedback).unwrap();

        let stored = get_analysis(&conn, "f-1").unwrap().unwrap();
        assert_eq!(stored, rec);

        let (last_id, _) = last_processed(&conn, "user-1").unwrap().unwrap();
        assert_eq!(last_id, "f-1");
        assert_eq!(
            feedback_updated_at(&conn, "f-1").unwrap(),
            Some(rec.job.completed_at.to_rfc3339())
        );
    }

    #[test]
    fn test_persist_analysis_is_all_or_nothing() {
        let mut conn = setup();
        let first = FeedbackItem::new("user-1", "one").with_id("f-1");
        persist_analysis(&mut conn, &record(&first), &first).unwrap();

        let second = FeedbackItem::new("user-1", "two").with_id("f-2");
        persist_analysis(&mut conn, &record(&second), &second).unwrap();

        // Same feedback id again: the unique constraint rejects the analysis
        // and the pointer must not move back to f-1.
        let err = persist_analysis(&mut conn, &record(&first), &first);
        assert!(err.is_err());

        let (last_id, _) = last_processed(&conn, "user-1").unwrap().unwrap();
        assert_eq!(last_id, "f-2");
        assert_eq!(list_analyses(&conn, "user-1").unwrap().len(), 2);
    }

    #[test]
    fn test_list_analyses_scoped_to_user() {
        let mut conn = setup();
        let mine = FeedbackItem::new("user-1", "a").with_id("f-1");
        let theirs = FeedbackItem::new("user-2", "b").with_id("f-2");
        persist_analysis(&mut conn, &record(&mine), &mine).unwrap();
        persist_analysis(&mut conn, &record(&theirs), &theirs).unwrap();

        let records = list_analyses(&conn, "user-1").unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].feedback_id, "f-1");
    }

    #[test]
    fn test_get_analysis_not_found() {
        let conn = setup();
        assert!(get_analysis(&conn, "nonexistent").unwrap().is_none());
        assert!(last_processed(&conn, "nobody").unwrap().is_none());
    }
}
