use crate::error::{PipelineError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tuning knobs read by every processing decision.
///
/// Use [`PipelineConfig::builder()`] for ergonomic construction, or
/// [`PipelineConfig::default()`] for the stock values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PipelineConfig {
    /// Maximum number of new ids pulled from the queue per batch.
    pub batch_size: usize,

    /// Pause between consecutive items, in milliseconds.
    pub delay_ms: u64,

    /// Run the optional summary stage when the gateway supports it.
    pub summarization_enabled: bool,

    /// Attempt budget per item, rate-limited attempts included.
    pub max_retries: u32,

    /// Base backoff delay, in milliseconds.
    pub backoff_ms: u64,

    /// Multiplier applied per backoff already taken.
    pub backoff_factor: f64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            batch_size: 5,
            delay_ms: 800,
            summarization_enabled: true,
            max_retries: 5,
            backoff_ms: 1000,
            backoff_factor: 2.0,
        }
    }
}

impl PipelineConfig {
    /// Start building a config with the builder pattern.
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder::default()
    }

    /// Shallow-merge the fields set in `patch`.
    pub fn merge(&mut self, patch: &PipelineConfigPatch) {
        if let Some(v) = patch.batch_size {
            self.batch_size = v;
        }
        if let Some(v) = patch.delay_ms {
            self.delay_ms = v;
        }
        if let Some(v) = patch.summarization_enabled {
            self.summarization_enabled = v;
        }
        if let Some(v) = patch.max_retries {
            self.max_retries = v;
        }
        if let Some(v) = patch.backoff_ms {
            self.backoff_ms = v;
        }
        if let Some(v) = patch.backoff_factor {
            self.backoff_factor = v;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(PipelineError::Config(
                "batch_size must be at least 1".to_string(),
            ));
        }
        if self.max_retries == 0 {
            return Err(PipelineError::Config(
                "max_retries must be at least 1".to_string(),
            ));
        }
        if !self.backoff_factor.is_finite() || self.backoff_factor < 1.0 {
            return Err(PipelineError::Config(format!(
                "backoff_factor must be >= 1.0 (got {})",
                self.backoff_factor
            )));
        }
        Ok(())
    }

    /// Delay before the `retry_count`-th (zero-indexed) retry:
    /// `backoff_ms * backoff_factor^retry_count`.
    pub fn backoff_delay(&self, retry_count: u32) -> Duration {
        let exponent = i32::try_from(retry_count).unwrap_or(i32::MAX);
        let millis = self.backoff_ms as f64 * self.backoff_factor.powi(exponent);
        if !millis.is_finite() || millis >= u64::MAX as f64 {
            return Duration::from_millis(u64::MAX);
        }
        Duration::from_millis(millis.round() as u64)
    }

    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

/// A partial [`PipelineConfig`]; only the fields that are `Some` are applied.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineConfigPatch {
    pub batch_size: Option<usize>,
    pub delay_ms: Option<u64>,
    pub summarization_enabled: Option<bool>,
    pub max_retries: Option<u32>,
    pub backoff_ms: Option<u64>,
    pub backoff_factor: Option<f64>,
}

/// Builder for [`PipelineConfig`].
#[derive(Default)]
pub struct PipelineConfigBuilder {
    config: PipelineConfig,
}

impl PipelineConfigBuilder {
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.config.batch_size = size;
        self
    }

    pub fn with_delay_ms(mut self, delay_ms: u64) -> Self {
        self.config.delay_ms = delay_ms;
        self
    }

    pub fn with_summarization(mut self, enabled: bool) -> Self {
        self.config.summarization_enabled = enabled;
        self
    }

    pub fn with_max_retries(mut self, max: u32) -> Self {
        self.config.max_retries = max;
        self
    }

    /// Set the base delay and growth factor for retry backoff.
    pub fn with_backoff(mut self, backoff_ms: u64, factor: f64) -> Self {
        self.config.backoff_ms = backoff_ms;
        self.config.backoff_factor = factor;
        self
    }

    /// Build the final [`PipelineConfig`].
    pub fn build(self) -> PipelineConfig {
        self.config
    }
}
