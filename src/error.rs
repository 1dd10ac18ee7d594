use thiserror::Error;

/// Errors that can occur in the enrichment pipeline.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Monthly quota exceeded (limit {limit}, usage {usage}, requested {requested})")]
    QuotaExceeded {
        limit: u64,
        usage: u64,
        requested: u64,
    },

    #[error("Stage '{stage}' failed: {source}")]
    Stage {
        stage: &'static str,
        #[source]
        source: StageError,
    },

    #[error("Checkpoint store error: {0}")]
    Checkpoint(String),

    #[error("Result persistence failed: {0}")]
    Persistence(String),

    #[error("{0}")]
    Other(String),
}

impl From<anyhow::Error> for PipelineError {
    fn from(err: anyhow::Error) -> Self {
        PipelineError::Other(format!("{:#}", err))
    }
}

impl PipelineError {
    /// True when this error wraps a throttled enrichment call.
    pub fn is_rate_limited(&self) -> bool {
        matches!(
            self,
            PipelineError::Stage {
                source: StageError::RateLimited { .. },
                ..
            }
        )
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;

/// Outcome of a failed enrichment call.
///
/// The processor retries both variants, but only `RateLimited` is reported
/// through the advisory rate-limit flag while it backs off.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StageError {
    #[error("{message}")]
    RateLimited { message: String },

    #[error("{message}")]
    Failed { message: String },
}

impl StageError {
    pub fn rate_limited(message: impl Into<String>) -> Self {
        StageError::RateLimited {
            message: message.into(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        StageError::Failed {
            message: message.into(),
        }
    }

    /// Classify a non-success HTTP response.
    pub fn from_status(status: u16, body: &str) -> Self {
        if status == 429 {
            return StageError::rate_limited("Rate limited by upstream API");
        }
        if body.trim().is_empty() {
            StageError::failed(format!("Unexpected API response: {}", status))
        } else {
            StageError::failed(body.trim().to_string())
        }
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(self, StageError::RateLimited { .. })
    }

    pub fn message(&self) -> &str {
        match self {
            StageError::RateLimited { message } | StageError::Failed { message } => message,
        }
    }
}

impl From<reqwest::Error> for StageError {
    fn from(err: reqwest::Error) -> Self {
        match err.status() {
            Some(status) if status.as_u16() == 429 => {
                StageError::rate_limited("Rate limited by upstream API")
            }
            _ => StageError::failed(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_429_is_rate_limited() {
        let err = StageError::from_status(429, "slow down");
        assert!(err.is_rate_limited());
    }

    #[test]
    fn test_other_status_uses_body() {
        let err = StageError::from_status(500, "  model exploded \n");
        assert_eq!(err, StageError::failed("model exploded"));
    }

    #[test]
    fn test_empty_body_reports_status() {
        let err = StageError::from_status(502, "");
        assert_eq!(err.message(), "Unexpected API response: 502");
    }

    #[test]
    fn test_pipeline_error_rate_limit_detection() {
        let err = PipelineError::Stage {
            stage: "sentiment",
            source: StageError::rate_limited("429"),
        };
        assert!(err.is_rate_limited());

        let err = PipelineError::Stage {
            stage: "sentiment",
            source: StageError::failed("boom"),
        };
        assert!(!err.is_rate_limited());
        assert_eq!(err.to_string(), "Stage 'sentiment' failed: boom");
    }
}
