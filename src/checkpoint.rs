use crate::{
    db,
    error::{PipelineError, Result},
    types::Checkpoint,
};
use async_trait::async_trait;
use rusqlite::Connection;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Durable per-user checkpoint storage.
///
/// `save` is last-write-wins and is called after every terminal item
/// outcome, so it has to be cheap.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn load(&self, user_id: &str) -> Result<Option<Checkpoint>>;
    async fn save(&self, checkpoint: &Checkpoint) -> Result<()>;
    async fn clear(&self, user_id: &str) -> Result<()>;
}

fn store_err(err: impl std::fmt::Display) -> PipelineError {
    PipelineError::Checkpoint(err.to_string())
}

/// SQLite-backed checkpoint store; survives process restarts.
#[derive(Clone)]
pub struct SqliteCheckpointStore {
    db: Arc<Mutex<Connection>>,
}

impl SqliteCheckpointStore {
    /// Open (or create) the database at `path`. `None` = in-memory.
    pub fn open(path: Option<&Path>) -> Result<Self> {
        let conn = db::open_database(path).map_err(|e| store_err(format!("{:#}", e)))?;
        Ok(Self::from_connection(Arc::new(Mutex::new(conn))))
    }

    /// Share an already-open connection, e.g. with a
    /// [`SqliteResultPersister`](crate::persister::SqliteResultPersister).
    pub fn from_connection(db: Arc<Mutex<Connection>>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl CheckpointStore for SqliteCheckpointStore {
    async fn load(&self, user_id: &str) -> Result<Option<Checkpoint>> {
        let conn = self.db.lock().map_err(store_err)?;
        db::load_checkpoint(&conn, user_id).map_err(|e| store_err(format!("{:#}", e)))
    }

    async fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        let conn = self.db.lock().map_err(store_err)?;
        db::save_checkpoint(&conn, checkpoint).map_err(|e| store_err(format!("{:#}", e)))
    }

    async fn clear(&self, user_id: &str) -> Result<()> {
        let conn = self.db.lock().map_err(store_err)?;
        db::clear_checkpoint(&conn, user_id).map_err(|e| store_err(format!("{:#}", e)))?;
        Ok(())
    }
}

/// Process-local checkpoint store. Keeps a count of saves for inspection.
#[derive(Debug, Default)]
pub struct InMemoryCheckpointStore {
    inner: Mutex<InMemoryCheckpoints>,
}

#[derive(Debug, Default)]
struct InMemoryCheckpoints {
    by_user: HashMap<String, Checkpoint>,
    saves: usize,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current checkpoint for a user, if any.
    pub fn get(&self, user_id: &str) -> Option<Checkpoint> {
        self.inner
            .lock()
            .ok()
            .and_then(|inner| inner.by_user.get(user_id).cloned())
    }

    /// Number of `save` calls so far.
    pub fn save_count(&self) -> usize {
        self.inner.lock().map(|inner| inner.saves).unwrap_or(0)
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn load(&self, user_id: &str) -> Result<Option<Checkpoint>> {
        let inner = self.inner.lock().map_err(store_err)?;
        Ok(inner.by_user.get(user_id).cloned())
    }

    async fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        let mut inner = self.inner.lock().map_err(store_err)?;
        inner
            .by_user
            .insert(checkpoint.user_id.clone(), checkpoint.clone());
        inner.saves += 1;
        Ok(())
    }

    async fn clear(&self, user_id: &str) -> Result<()> {
        let mut inner = self.inner.lock().map_err(store_err)?;
        inner.by_user.remove(user_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CheckpointItem, PipelineItemStatus, RunStatus};
    use chrono::Utc;

    fn checkpoint(user_id: &str) -> Checkpoint {
        Checkpoint {
            user_id: user_id.to_string(),
            queue: vec![CheckpointItem {
                id: "f-1".into(),
                status: PipelineItemStatus::Processing,
                attempts: 1,
                error: None,
            }],
            processed_ids: vec![],
            status: RunStatus::Running,
            active_item_id: Some("f-1".into()),
            updated_at: Utc::now(),
            error: None,
        }
    }

    #[tokio::test]
    async fn test_in_memory_store() {
        let store = InMemoryCheckpointStore::new();
        assert!(store.load("user-1").await.unwrap().is_none());

        store.save(&checkpoint("user-1")).await.unwrap();
        store.save(&checkpoint("user-2")).await.unwrap();
        assert_eq!(store.save_count(), 2);
        assert_eq!(store.load("user-1").await.unwrap(), store.get("user-1"));

        store.clear("user-1").await.unwrap();
        assert!(store.get("user-1").is_none());
        assert!(store.get("user-2").is_some());
    }

    #[tokio::test]
    async fn test_sqlite_store_survives_reopen() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("checkpoints.db");
        let saved = checkpoint("user-1");

        {
            let store = SqliteCheckpointStore::open(Some(&path)).unwrap();
            store.save(&saved).await.unwrap();
        }

        let store = SqliteCheckpointStore::open(Some(&path)).unwrap();
        assert_eq!(store.load("user-1").await.unwrap(), Some(saved));

        store.clear("user-1").await.unwrap();
        assert!(store.load("user-1").await.unwrap().is_none());
    }
}
