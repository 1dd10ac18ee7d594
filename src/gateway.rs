use crate::{
    error::StageError,
    types::{
        FeedbackItem, KnowledgeBaseMatch, KnowledgeBaseMatchResult, SentimentResult,
        SuggestedReply, SummaryResult,
    },
};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};

/// Context handed to the knowledge-base stage.
#[derive(Debug, Clone, Copy)]
pub struct KnowledgeBaseContext<'a> {
    pub sentiment: &'a SentimentResult,
    pub summary: Option<&'a SummaryResult>,
}

/// Context handed to the reply stage.
#[derive(Debug, Clone, Copy)]
pub struct ReplyContext<'a> {
    pub sentiment: &'a SentimentResult,
    pub summary: Option<&'a SummaryResult>,
    pub kb_matches: &'a KnowledgeBaseMatchResult,
}

/// The four AI calls behind one enrichment attempt.
///
/// Implementations must report throttling as [`StageError::RateLimited`];
/// the processor picks its retry strategy from that distinction.
#[async_trait]
pub trait EnrichmentGateway: Send + Sync {
    async fn analyze_sentiment(&self, item: &FeedbackItem) -> Result<SentimentResult, StageError>;

    /// Whether [`summarize`](Self::summarize) is available at all.
    fn supports_summary(&self) -> bool {
        false
    }

    async fn summarize(
        &self,
        _item: &FeedbackItem,
        _sentiment: &SentimentResult,
    ) -> Result<SummaryResult, StageError> {
        Err(StageError::failed("Summarization is not supported"))
    }

    async fn match_knowledge_base(
        &self,
        item: &FeedbackItem,
        context: KnowledgeBaseContext<'_>,
    ) -> Result<KnowledgeBaseMatchResult, StageError>;

    async fn generate_reply(
        &self,
        item: &FeedbackItem,
        context: ReplyContext<'_>,
    ) -> Result<SuggestedReply, StageError>;
}

/// Endpoints used by [`HttpEnrichmentGateway`].
#[derive(Debug, Clone)]
pub struct HttpGatewayConfig {
    pub base_url: String,
    pub sentiment_path: String,
    /// `None` disables the summary stage.
    pub summarize_path: Option<String>,
    pub knowledge_base_path: String,
    pub generate_path: String,
}

impl Default for HttpGatewayConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:3000".to_string(),
            sentiment_path: "/api/hf/sentiment".to_string(),
            summarize_path: Some("/api/hf/summarize".to_string()),
            knowledge_base_path: "/api/kb/match".to_string(),
            generate_path: "/api/hf/generate".to_string(),
        }
    }
}

impl HttpGatewayConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Default::default()
        }
    }

    pub fn without_summary(mut self) -> Self {
        self.summarize_path = None;
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }
}

/// JSON-over-HTTP gateway. Each stage is a POST carrying the feedback text.
#[derive(Debug, Clone)]
pub struct HttpEnrichmentGateway {
    client: Client,
    config: HttpGatewayConfig,
}

impl HttpEnrichmentGateway {
    pub fn new(client: Client, config: HttpGatewayConfig) -> Self {
        Self { client, config }
    }

    async fn post_json(&self, path: &str, body: &Value) -> Result<Value, StageError> {
        let url = self.config.url(path);
        let resp = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| StageError::failed(format!("Failed to reach {}: {}", url, e)))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(StageError::from_status(status.as_u16(), &text));
        }

        resp.json::<Value>().await.map_err(StageError::from)
    }
}

fn item_body(item: &FeedbackItem) -> Value {
    json!({
        "text": item.text,
        "metadata": item.metadata,
    })
}

#[async_trait]
impl EnrichmentGateway for HttpEnrichmentGateway {
    async fn analyze_sentiment(&self, item: &FeedbackItem) -> Result<SentimentResult, StageError> {
        let payload = self
            .post_json(&self.config.sentiment_path, &item_body(item))
            .await?;
        Ok(parse_sentiment(payload))
    }

    fn supports_summary(&self) -> bool {
        self.config.summarize_path.is_some()
    }

    async fn summarize(
        &self,
        item: &FeedbackItem,
        _sentiment: &SentimentResult,
    ) -> Result<SummaryResult, StageError> {
        let Some(path) = self.config.summarize_path.as_deref() else {
            return Err(StageError::failed("Summarization endpoint is not configured"));
        };
        let payload = self.post_json(path, &item_body(item)).await?;
        Ok(parse_summary(payload))
    }

    async fn match_knowledge_base(
        &self,
        item: &FeedbackItem,
        _context: KnowledgeBaseContext<'_>,
    ) -> Result<KnowledgeBaseMatchResult, StageError> {
        let payload = self
            .post_json(&self.config.knowledge_base_path, &item_body(item))
            .await?;
        Ok(parse_knowledge_base_matches(&payload))
    }

    async fn generate_reply(
        &self,
        item: &FeedbackItem,
        context: ReplyContext<'_>,
    ) -> Result<SuggestedReply, StageError> {
        let body = json!({
            "text": item.text,
            "metadata": item.metadata,
            "sentiment": context.sentiment,
            "summary": context.summary,
            "kbMatches": context.kb_matches,
        });
        let payload = self.post_json(&self.config.generate_path, &body).await?;
        Ok(parse_reply(payload))
    }
}

fn string_field(payload: &Value, key: &str) -> Option<String> {
    match payload.get(key)? {
        Value::String(s) => Some(s.clone()),
        Value::Null => None,
        other => Some(other.to_string()),
    }
}

pub fn parse_sentiment(payload: Value) -> SentimentResult {
    SentimentResult {
        label: string_field(&payload, "label").unwrap_or_else(|| "neutral".to_string()),
        score: payload.get("score").and_then(Value::as_f64).unwrap_or(0.0),
        raw: payload,
    }
}

pub fn parse_summary(payload: Value) -> SummaryResult {
    SummaryResult {
        summary: string_field(&payload, "summary").unwrap_or_default(),
        raw: Some(payload),
    }
}

/// Accepts `{ "matches": [{ "id" | "documentId", "score", "metadata" }] }`.
/// Anything else yields no matches.
pub fn parse_knowledge_base_matches(payload: &Value) -> KnowledgeBaseMatchResult {
    let Some(entries) = payload.get("matches").and_then(Value::as_array) else {
        return KnowledgeBaseMatchResult::default();
    };

    let matches: Vec<KnowledgeBaseMatch> = entries
        .iter()
        .map(|entry| KnowledgeBaseMatch {
            id: string_field(entry, "id")
                .or_else(|| string_field(entry, "documentId"))
                .unwrap_or_default(),
            score: entry.get("score").and_then(Value::as_f64).unwrap_or(0.0),
            metadata: entry.get("metadata").and_then(Value::as_object).cloned(),
        })
        .collect();

    KnowledgeBaseMatchResult {
        kb_match_ids: matches
            .iter()
            .filter(|m| !m.id.is_empty())
            .map(|m| m.id.clone())
            .collect(),
        matches,
    }
}

pub fn parse_reply(payload: Value) -> SuggestedReply {
    SuggestedReply {
        content: string_field(&payload, "content").unwrap_or_default(),
        model: string_field(&payload, "model").unwrap_or_else(|| "hf-generate".to_string()),
        raw: Some(payload),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_sentiment_defaults() {
        let result = parse_sentiment(json!({}));
        assert_eq!(result.label, "neutral");
        assert_eq!(result.score, 0.0);

        let result = parse_sentiment(json!({"label": "negative", "score": 0.93}));
        assert_eq!(result.label, "negative");
        assert_eq!(result.score, 0.93);
        assert_eq!(result.raw["label"], "negative");
    }

    #[test]
    fn test_parse_kb_matches() {
        let payload = json!({
            "matches": [
                {"id": "kb-1", "score": 0.8, "metadata": {"title": "Refunds"}},
                {"documentId": "kb-2"},
                {"score": 0.1}
            ]
        });
        let result = parse_knowledge_base_matches(&payload);
        assert_eq!(result.matches.len(), 3);
        assert_eq!(result.kb_match_ids, vec!["kb-1", "kb-2"]);
        assert_eq!(result.matches[1].score, 0.0);
        assert_eq!(
            result.matches[0].metadata.as_ref().unwrap()["title"],
            "Refunds"
        );
    }

    #[test]
    fn test_parse_kb_matches_wrong_shape() {
        let result = parse_knowledge_base_matches(&json!({"results": []}));
        assert!(result.matches.is_empty());
        assert!(result.kb_match_ids.is_empty());
    }

    #[test]
    fn test_parse_reply_defaults() {
        let reply = parse_reply(json!({"content": "Thanks!"}));
        assert_eq!(reply.content, "Thanks!");
        assert_eq!(reply.model, "hf-generate");
    }

    #[test]
    fn test_config_urls() {
        let config = HttpGatewayConfig::new("http://api.local/");
        assert_eq!(
            config.url(&config.sentiment_path),
            "http://api.local/api/hf/sentiment"
        );
        assert!(config.without_summary().summarize_path.is_none());
    }

    #[test]
    fn test_http_gateway_summary_support() {
        let config = HttpGatewayConfig::default().without_summary();
        let gateway = HttpEnrichmentGateway::new(Client::new(), config);
        assert!(!gateway.supports_summary());
    }
}
