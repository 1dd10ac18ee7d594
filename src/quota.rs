use crate::error::{PipelineError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Datelike, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;

/// Admission control over a usage budget.
#[async_trait]
pub trait QuotaGate: Send + Sync {
    /// Fail with [`PipelineError::QuotaExceeded`] if `count` more units
    /// would go over budget.
    async fn ensure_within_quota(&self, count: u64) -> Result<()>;

    /// Record `count` units of completed work.
    async fn register_usage(&self, count: u64) -> Result<()>;
}

/// Admits everything and records nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnlimitedQuota;

#[async_trait]
impl QuotaGate for UnlimitedQuota {
    async fn ensure_within_quota(&self, _count: u64) -> Result<()> {
        Ok(())
    }

    async fn register_usage(&self, _count: u64) -> Result<()> {
        Ok(())
    }
}

/// In-process counter against a fixed limit. Nothing is persisted.
#[derive(Debug)]
pub struct SimpleQuotaGate {
    limit: u64,
    usage: Mutex<u64>,
}

impl SimpleQuotaGate {
    pub fn new(limit: u64) -> Self {
        Self::with_usage(limit, 0)
    }

    pub fn with_usage(limit: u64, initial_usage: u64) -> Self {
        Self {
            limit,
            usage: Mutex::new(initial_usage),
        }
    }

    pub fn usage(&self) -> u64 {
        self.usage.lock().map(|u| *u).unwrap_or(0)
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }
}

#[async_trait]
impl QuotaGate for SimpleQuotaGate {
    async fn ensure_within_quota(&self, count: u64) -> Result<()> {
        if self.limit == 0 {
            return Err(PipelineError::Config(
                "Monthly quota limit is not configured".to_string(),
            ));
        }
        let usage = *self
            .usage
            .lock()
            .map_err(|e| PipelineError::Other(e.to_string()))?;
        if usage.saturating_add(count) > self.limit {
            return Err(PipelineError::QuotaExceeded {
                limit: self.limit,
                usage,
                requested: count,
            });
        }
        Ok(())
    }

    async fn register_usage(&self, count: u64) -> Result<()> {
        let mut usage = self
            .usage
            .lock()
            .map_err(|e| PipelineError::Other(e.to_string()))?;
        *usage = usage.saturating_add(count);
        Ok(())
    }
}

pub const DEFAULT_MONTHLY_QUOTA: u64 = 30;

/// A user's monthly processing allowance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonthlyUsage {
    pub monthly_quota: u64,
    pub processed_this_month: u64,
    /// First instant of the month the counter belongs to.
    pub quota_reset_at: DateTime<Utc>,
    /// Subscribers are never limited.
    pub is_subscriber: bool,
}

fn start_of_month(at: DateTime<Utc>) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(at.year(), at.month(), 1, 0, 0, 0)
        .single()
        .unwrap_or(at)
}

fn same_month(a: DateTime<Utc>, b: DateTime<Utc>) -> bool {
    a.year() == b.year() && a.month() == b.month()
}

impl MonthlyUsage {
    pub fn new(monthly_quota: u64, now: DateTime<Utc>) -> Self {
        Self {
            monthly_quota,
            processed_this_month: 0,
            quota_reset_at: start_of_month(now),
            is_subscriber: false,
        }
    }

    /// Zero the counter once the calendar month has rolled over.
    pub fn reset_if_needed(&mut self, now: DateTime<Utc>) -> bool {
        if same_month(self.quota_reset_at, now) {
            return false;
        }
        self.processed_this_month = 0;
        self.quota_reset_at = start_of_month(now);
        true
    }

    /// `None` means unlimited.
    pub fn remaining(&self) -> Option<u64> {
        if self.is_subscriber {
            return None;
        }
        Some(self.monthly_quota.saturating_sub(self.processed_this_month))
    }

    pub fn admits(&self, count: u64) -> bool {
        self.remaining().map_or(true, |left| count <= left)
    }
}

/// Quota gate backed by a [`MonthlyUsage`] allowance.
#[derive(Debug)]
pub struct MonthlyQuotaGate {
    usage: Mutex<MonthlyUsage>,
}

impl MonthlyQuotaGate {
    pub fn new(usage: MonthlyUsage) -> Self {
        Self {
            usage: Mutex::new(usage),
        }
    }

    /// Current allowance, after applying any month rollover.
    pub fn usage(&self) -> Result<MonthlyUsage> {
        let mut usage = self
            .usage
            .lock()
            .map_err(|e| PipelineError::Other(e.to_string()))?;
        usage.reset_if_needed(Utc::now());
        Ok(usage.clone())
    }

    pub(crate) fn check_at(&self, count: u64, now: DateTime<Utc>) -> Result<()> {
        let mut usage = self
            .usage
            .lock()
            .map_err(|e| PipelineError::Other(e.to_string()))?;
        usage.reset_if_needed(now);
        if usage.admits(count) {
            return Ok(());
        }
        Err(PipelineError::QuotaExceeded {
            limit: usage.monthly_quota,
            usage: usage.processed_this_month,
            requested: count,
        })
    }

    pub(crate) fn register_at(&self, count: u64, now: DateTime<Utc>) -> Result<()> {
        let mut usage = self
            .usage
            .lock()
            .map_err(|e| PipelineError::Other(e.to_string()))?;
        usage.reset_if_needed(now);
        if !usage.is_subscriber {
            usage.processed_this_month = usage.processed_this_month.saturating_add(count);
        }
        Ok(())
    }
}

#[async_trait]
impl QuotaGate for MonthlyQuotaGate {
    async fn ensure_within_quota(&self, count: u64) -> Result<()> {
        self.check_at(count, Utc::now())
    }

    async fn register_usage(&self, count: u64) -> Result<()> {
        self.register_at(count, Utc::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 12, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn test_simple_quota_admits_until_limit() {
        let quota = SimpleQuotaGate::new(2);
        quota.ensure_within_quota(1).await.unwrap();
        quota.register_usage(1).await.unwrap();
        quota.ensure_within_quota(1).await.unwrap();
        quota.register_usage(1).await.unwrap();

        match quota.ensure_within_quota(1).await {
            Err(PipelineError::QuotaExceeded {
                limit,
                usage,
                requested,
            }) => {
                assert_eq!((limit, usage, requested), (2, 2, 1));
            }
            other => panic!("Expected QuotaExceeded, got {:?}", other),
        }
        assert_eq!(quota.usage(), 2);
    }

    #[tokio::test]
    async fn test_simple_quota_zero_limit_is_config_error() {
        let quota = SimpleQuotaGate::new(0);
        assert!(matches!(
            quota.ensure_within_quota(1).await,
            Err(PipelineError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_simple_quota_initial_usage() {
        let quota = SimpleQuotaGate::with_usage(5, 4);
        assert!(quota.ensure_within_quota(1).await.is_ok());
        assert!(quota.ensure_within_quota(2).await.is_err());
    }

    #[tokio::test]
    async fn test_unlimited_quota() {
        let quota = UnlimitedQuota;
        assert!(quota.ensure_within_quota(u64::MAX).await.is_ok());
        assert!(quota.register_usage(10).await.is_ok());
    }

    #[test]
    fn test_monthly_usage_resets_on_new_month() {
        let mut usage = MonthlyUsage::new(DEFAULT_MONTHLY_QUOTA, at(2024, 1, 20));
        usage.processed_this_month = 30;
        assert!(!usage.admits(1));

        assert!(!usage.reset_if_needed(at(2024, 1, 31)));
        assert!(usage.reset_if_needed(at(2024, 2, 1)));
        assert_eq!(usage.processed_this_month, 0);
        let february = Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap();
        assert_eq!(usage.quota_reset_at, february);
        assert_eq!(usage.remaining(), Some(30));
    }

    #[test]
    fn test_monthly_usage_same_month_other_year() {
        let mut usage = MonthlyUsage::new(10, at(2023, 3, 1));
        usage.processed_this_month = 10;
        assert!(usage.reset_if_needed(at(2024, 3, 1)));
    }

    #[test]
    fn test_monthly_gate_enforces_and_counts() {
        let now = at(2024, 5, 10);
        let gate = MonthlyQuotaGate::new(MonthlyUsage::new(2, now));

        gate.check_at(1, now).unwrap();
        gate.register_at(1, now).unwrap();
        gate.register_at(1, now).unwrap();
        assert!(matches!(
            gate.check_at(1, now),
            Err(PipelineError::QuotaExceeded { limit: 2, usage: 2, .. })
        ));

        // Next month the budget is fresh again
        assert!(gate.check_at(1, at(2024, 6, 1)).is_ok());
    }

    #[test]
    fn test_monthly_gate_subscriber_unlimited() {
        let now = at(2024, 5, 10);
        let mut usage = MonthlyUsage::new(1, now);
        usage.is_subscriber = true;
        let gate = MonthlyQuotaGate::new(usage);

        for _ in 0..5 {
            gate.check_at(1, now).unwrap();
            gate.register_at(1, now).unwrap();
        }
        assert_eq!(gate.usage.lock().unwrap().processed_this_month, 0);
    }
}
