use async_trait::async_trait;
use feedback_pipeline::*;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing_subscriber::EnvFilter;

struct EchoGateway;

#[async_trait]
impl EnrichmentGateway for EchoGateway {
    async fn analyze_sentiment(
        &self,
        _item: &FeedbackItem,
    ) -> std::result::Result<SentimentResult, StageError> {
        Ok(SentimentResult {
            label: "neutral".to_string(),
            score: 0.5,
            raw: serde_json::Value::Null,
        })
    }

    async fn match_knowledge_base(
        &self,
        _item: &FeedbackItem,
        _context: KnowledgeBaseContext<'_>,
    ) -> std::result::Result<KnowledgeBaseMatchResult, StageError> {
        Ok(KnowledgeBaseMatchResult::default())
    }

    async fn generate_reply(
        &self,
        item: &FeedbackItem,
        _context: ReplyContext<'_>,
    ) -> std::result::Result<SuggestedReply, StageError> {
        Ok(SuggestedReply {
            content: format!("Re: {}", item.text),
            model: "echo".to_string(),
            raw: None,
        })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("feedback_pipeline=info".parse()?))
        .init();

    // Run this twice: the first run stops at the quota, the second picks up
    // from the saved checkpoint.
    let path = PathBuf::from("/tmp/feedback-pipeline-example.db");
    let conn = Arc::new(Mutex::new(db::open_database(Some(&path))?));
    let checkpoints = Arc::new(SqliteCheckpointStore::from_connection(conn.clone()));
    let persister = Arc::new(SqliteResultPersister::from_connection(conn));

    let done: Vec<String> = persister
        .list("demo-user")?
        .into_iter()
        .map(|record| record.feedback_id)
        .collect();
    let already = done.len() as u64;
    println!("Found {} analyses from previous runs", already);

    let processor = PipelineProcessor::builder()
        .gateway(Arc::new(EchoGateway))
        .persister(persister.clone())
        .checkpoint_store(checkpoints)
        .quota(Arc::new(SimpleQuotaGate::with_usage(already + 3, already)))
        .config(PipelineConfig::builder().with_delay_ms(0).build())
        .build()?;

    let items: Vec<FeedbackItem> = (1..=5)
        .map(|i| FeedbackItem::new("demo-user", format!("Feedback #{}", i)).with_id(format!("fb-{}", i)))
        .filter(|item| !done.contains(&item.id))
        .collect();
    if items.is_empty() {
        println!("Nothing left to process");
        return Ok(());
    }

    let report = processor
        .start(StartOptions::new("demo-user").with_items(items))
        .await?;

    if report.is_complete() {
        println!("All feedback processed; checkpoint cleared");
    } else {
        println!(
            "Stopped with {} items remaining (status: {}). Run again to resume.",
            report.remaining,
            report.status.as_str()
        );
    }

    Ok(())
}
