use async_trait::async_trait;
use feedback_pipeline::*;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Canned gateway standing in for the real AI endpoints.
struct KeywordGateway;

#[async_trait]
impl EnrichmentGateway for KeywordGateway {
    async fn analyze_sentiment(
        &self,
        item: &FeedbackItem,
    ) -> std::result::Result<SentimentResult, StageError> {
        tokio::time::sleep(tokio::time::Duration::from_millis(50)).await;
        let negative = ["broken", "slow", "refund"]
            .iter()
            .any(|word| item.text.to_lowercase().contains(word));
        Ok(SentimentResult {
            label: if negative { "negative" } else { "positive" }.to_string(),
            score: if negative { 0.2 } else { 0.9 },
            raw: serde_json::Value::Null,
        })
    }

    async fn match_knowledge_base(
        &self,
        _item: &FeedbackItem,
        context: KnowledgeBaseContext<'_>,
    ) -> std::result::Result<KnowledgeBaseMatchResult, StageError> {
        let ids = if context.sentiment.label == "negative" {
            vec!["kb-troubleshooting".to_string()]
        } else {
            vec![]
        };
        Ok(KnowledgeBaseMatchResult {
            kb_match_ids: ids,
            matches: vec![],
        })
    }

    async fn generate_reply(
        &self,
        _item: &FeedbackItem,
        context: ReplyContext<'_>,
    ) -> std::result::Result<SuggestedReply, StageError> {
        let content = match context.sentiment.label.as_str() {
            "negative" => "Sorry about that, we're looking into it.",
            _ => "Thanks for the kind words!",
        };
        Ok(SuggestedReply {
            content: content.to_string(),
            model: "keyword-demo".to_string(),
            raw: None,
        })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("feedback_pipeline=info".parse()?))
        .init();

    let persister = Arc::new(InMemoryResultPersister::new());
    let processor = PipelineProcessor::builder()
        .gateway(Arc::new(KeywordGateway))
        .persister(persister.clone())
        .checkpoint_store(Arc::new(InMemoryCheckpointStore::new()))
        .config(PipelineConfig::builder().with_batch_size(2).with_delay_ms(100).build())
        .build()?;

    let items = vec![
        FeedbackItem::new("demo-user", "Love the new dashboard"),
        FeedbackItem::new("demo-user", "Export is broken since the update"),
        FeedbackItem::new("demo-user", "Search feels slow on large projects"),
        FeedbackItem::new("demo-user", "Great support team"),
    ];

    let report = processor
        .start(StartOptions::new("demo-user").with_items(items))
        .await?;

    println!("Processed {} items", report.processed_ids.len());
    for record in persister.records() {
        println!(
            "  {} [{}] -> {}",
            record.feedback_id, record.sentiment.label, record.suggested_reply.content
        );
    }

    Ok(())
}
