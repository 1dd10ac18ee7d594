#![allow(dead_code)]

use async_trait::async_trait;
use feedback_pipeline::*;
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

pub const USER: &str = "user-1";

pub fn feedback(n: usize) -> Vec<FeedbackItem> {
    (1..=n)
        .map(|i| FeedbackItem::new(USER, format!("Feedback number {}", i)).with_id(format!("f-{}", i)))
        .collect()
}

pub fn fast_config() -> PipelineConfigBuilder {
    PipelineConfig::builder()
        .with_delay_ms(0)
        .with_backoff(100, 2.0)
        .with_max_retries(3)
}

/// Gateway whose failures are scripted per feedback id.
#[derive(Default)]
pub struct ScriptedGateway {
    summaries: bool,
    rate_limit_once: HashSet<String>,
    always_rate_limited: HashSet<String>,
    always_failing: HashSet<String>,
    sentiment_calls: Mutex<Vec<String>>,
    summary_calls: Mutex<usize>,
    seen: Mutex<HashMap<String, u32>>,
}

impl ScriptedGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_summaries(mut self) -> Self {
        self.summaries = true;
        self
    }

    pub fn rate_limit_once(mut self, id: &str) -> Self {
        self.rate_limit_once.insert(id.to_string());
        self
    }

    pub fn always_rate_limited(mut self, id: &str) -> Self {
        self.always_rate_limited.insert(id.to_string());
        self
    }

    pub fn always_failing(mut self, id: &str) -> Self {
        self.always_failing.insert(id.to_string());
        self
    }

    pub fn sentiment_calls(&self) -> Vec<String> {
        self.sentiment_calls.lock().unwrap().clone()
    }

    pub fn summary_calls(&self) -> usize {
        *self.summary_calls.lock().unwrap()
    }
}

#[async_trait]
impl EnrichmentGateway for ScriptedGateway {
    async fn analyze_sentiment(
        &self,
        item: &FeedbackItem,
    ) -> std::result::Result<SentimentResult, StageError> {
        self.sentiment_calls.lock().unwrap().push(item.id.clone());
        let calls = {
            let mut seen = self.seen.lock().unwrap();
            let calls = seen.entry(item.id.clone()).or_insert(0);
            *calls += 1;
            *calls
        };

        if self.always_rate_limited.contains(&item.id)
            || (calls == 1 && self.rate_limit_once.contains(&item.id))
        {
            return Err(StageError::rate_limited("Too many requests"));
        }
        if self.always_failing.contains(&item.id) {
            return Err(StageError::failed("Upstream exploded"));
        }

        Ok(SentimentResult {
            label: "positive".into(),
            score: 0.9,
            raw: json!({ "label": "positive", "score": 0.9 }),
        })
    }

    fn supports_summary(&self) -> bool {
        self.summaries
    }

    async fn summarize(
        &self,
        item: &FeedbackItem,
        _sentiment: &SentimentResult,
    ) -> std::result::Result<SummaryResult, StageError> {
        *self.summary_calls.lock().unwrap() += 1;
        Ok(SummaryResult {
            summary: format!("summary of {}", item.id),
            raw: None,
        })
    }

    async fn match_knowledge_base(
        &self,
        item: &FeedbackItem,
        _context: KnowledgeBaseContext<'_>,
    ) -> std::result::Result<KnowledgeBaseMatchResult, StageError> {
        Ok(KnowledgeBaseMatchResult {
            kb_match_ids: vec![format!("kb-{}", item.id)],
            matches: vec![KnowledgeBaseMatch {
                id: "faq-shipping".into(),
                score: 0.7,
                metadata: None,
            }],
        })
    }

    async fn generate_reply(
        &self,
        item: &FeedbackItem,
        context: ReplyContext<'_>,
    ) -> std::result::Result<SuggestedReply, StageError> {
        Ok(SuggestedReply {
            content: format!("Thanks for {} ({})", item.id, context.sentiment.label),
            model: "test-model".into(),
            raw: None,
        })
    }
}

pub struct Harness {
    pub gateway: Arc<ScriptedGateway>,
    pub persister: Arc<InMemoryResultPersister>,
    pub checkpoints: Arc<InMemoryCheckpointStore>,
    pub processor: Arc<PipelineProcessor>,
}

pub fn harness(gateway: ScriptedGateway, config: PipelineConfig) -> Harness {
    harness_with(
        gateway,
        config,
        Arc::new(InMemoryCheckpointStore::new()),
        Arc::new(UnlimitedQuota),
    )
}

pub fn harness_with(
    gateway: ScriptedGateway,
    config: PipelineConfig,
    checkpoints: Arc<InMemoryCheckpointStore>,
    quota: Arc<dyn QuotaGate>,
) -> Harness {
    let gateway = Arc::new(gateway);
    let persister = Arc::new(InMemoryResultPersister::new());
    let processor = PipelineProcessor::builder()
        .gateway(gateway.clone())
        .persister(persister.clone())
        .checkpoint_store(checkpoints.clone())
        .quota(quota)
        .config(config)
        .build()
        .unwrap();

    Harness {
        gateway,
        persister,
        checkpoints,
        processor: Arc::new(processor),
    }
}

pub fn distinct(ids: &[String]) -> HashSet<String> {
    ids.iter().cloned().collect()
}
