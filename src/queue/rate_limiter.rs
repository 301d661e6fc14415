//! Distributed rate limiter
//!
//! Per provider, a sliding one-minute window of request timestamps bounds
//! RPM and an expiring counter bounds TPM. Checking both limits and reserving
//! capacity is one store transaction, so concurrent workers on different
//! hosts cannot both squeeze through the last slot.
//!
//! When the store cannot be reached the limiter fails open and logs a warning.

use super::QueueResult;
use crate::llm::providers::{ProviderCatalog, ProviderId};
use crate::store::{AtomicStore, KeySpace, Reservation, ReservationOutcome, StoreError};
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};
use uuid::Uuid;

pub const WINDOW: Duration = Duration::from_secs(60);

/// Expiry on both counters, independent of the logical window
pub const SAFETY_TTL: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AdmissionDecision {
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl AdmissionDecision {
    fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
        }
    }

    fn deny(reason: String) -> Self {
        Self {
            allowed: false,
            reason: Some(reason),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderUsage {
    pub provider: ProviderId,
    pub rpm: u64,
    pub rpm_limit: u64,
    pub tpm: u64,
    pub tpm_limit: u64,
    /// Fraction of the tighter limit in use, clamped to [0, 1]
    pub utilization: f64,
}

pub struct RateLimiter {
    store: Arc<dyn AtomicStore>,
    keys: KeySpace,
    providers: Arc<ProviderCatalog>,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn AtomicStore>, keys: KeySpace, providers: Arc<ProviderCatalog>) -> Self {
        Self {
            store,
            keys,
            providers,
        }
    }

    /// Check both limits and, if they allow it, reserve one request and
    /// `estimated_tokens` tokens for `provider`.
    pub async fn can_process(&self, provider: ProviderId, estimated_tokens: u64) -> AdmissionDecision {
        self.can_process_at(provider, estimated_tokens, Utc::now().timestamp_millis())
            .await
    }

    pub(crate) async fn can_process_at(
        &self,
        provider: ProviderId,
        estimated_tokens: u64,
        now_ms: i64,
    ) -> AdmissionDecision {
        let Some(profile) = self.providers.profile(provider) else {
            return AdmissionDecision::deny(format!("{} is not a configured provider", provider));
        };

        let reservation = Reservation {
            window_key: self.keys.request_window(provider.as_str()),
            tokens_key: self.keys.token_counter(provider.as_str()),
            now_ms,
            window_ms: WINDOW.as_millis() as i64,
            rpm_limit: profile.rpm_limit,
            tpm_limit: profile.tpm_limit,
            tokens: estimated_tokens,
            request_id: format!("{}-{}", now_ms, Uuid::new_v4()),
            safety_ttl: SAFETY_TTL,
        };

        match self.store.reserve(&reservation).await {
            Ok(ReservationOutcome::Admitted { requests, tokens }) => {
                debug!(
                    "{} admitted: {}/{} requests, {}/{} tokens",
                    provider, requests, profile.rpm_limit, tokens, profile.tpm_limit
                );
                AdmissionDecision::allow()
            }
            Ok(ReservationOutcome::RequestLimit { requests }) => AdmissionDecision::deny(format!(
                "{} RPM limit reached ({}/{})",
                provider, requests, profile.rpm_limit
            )),
            Ok(ReservationOutcome::TokenLimit { tokens }) => AdmissionDecision::deny(format!(
                "{} TPM limit reached ({} + {} > {})",
                provider, tokens, estimated_tokens, profile.tpm_limit
            )),
            Err(StoreError::Unavailable(e)) => {
                warn!("Rate limiter unavailable for {}, failing open: {}", provider, e);
                AdmissionDecision {
                    allowed: true,
                    reason: Some("rate limiter unavailable, failing open".to_string()),
                }
            }
            // The store answered but the reservation itself is broken
            Err(StoreError::Command(e)) => {
                error!("Rate limiter error for {}: {}", provider, e);
                AdmissionDecision::deny(format!("{} rate limiter error: {}", provider, e))
            }
        }
    }

    /// Current usage of one provider. Read-only apart from pruning the window.
    pub async fn usage(&self, provider: ProviderId) -> QueueResult<Option<ProviderUsage>> {
        let Some(profile) = self.providers.profile(provider) else {
            return Ok(None);
        };

        let window_start = Utc::now().timestamp_millis() - WINDOW.as_millis() as i64;
        let (rpm, tpm) = self
            .store
            .usage(
                &self.keys.request_window(provider.as_str()),
                &self.keys.token_counter(provider.as_str()),
                window_start,
            )
            .await?;

        Ok(Some(ProviderUsage {
            provider,
            rpm,
            rpm_limit: profile.rpm_limit,
            tpm,
            tpm_limit: profile.tpm_limit,
            utilization: utilization(rpm, profile.rpm_limit, tpm, profile.tpm_limit),
        }))
    }

    pub async fn usage_all(&self) -> QueueResult<Vec<ProviderUsage>> {
        let mut all = Vec::new();
        for profile in self.providers.profiles() {
            if let Some(usage) = self.usage(profile.id).await? {
                all.push(usage);
            }
        }
        Ok(all)
    }
}

fn utilization(rpm: u64, rpm_limit: u64, tpm: u64, tpm_limit: u64) -> f64 {
    let ratio = |used: u64, limit: u64| {
        if limit == 0 {
            1.0
        } else {
            used as f64 / limit as f64
        }
    };
    ratio(rpm, rpm_limit).max(ratio(tpm, tpm_limit)).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::providers::ProviderProfile;
    use crate::store::MemoryStore;

    fn limiter_with(rpm: u64, tpm: u64) -> (Arc<MemoryStore>, RateLimiter) {
        let store = Arc::new(MemoryStore::new());
        let catalog = ProviderCatalog::new([
            ProviderProfile::default_for(ProviderId::Groq).with_limits(rpm, tpm)
        ]);
        let limiter = RateLimiter::new(store.clone(), KeySpace::new("test"), Arc::new(catalog));
        (store, limiter)
    }

    #[tokio::test]
    async fn test_rpm_limit_allows_exactly_limit() {
        let (_, limiter) = limiter_with(5, 1_000_000);

        let mut decisions = Vec::new();
        for _ in 0..6 {
            decisions.push(limiter.can_process(ProviderId::Groq, 10).await);
        }

        assert_eq!(decisions.iter().filter(|d| d.allowed).count(), 5);
        let last = decisions.last().unwrap();
        assert!(!last.allowed);
        assert!(last.reason.as_deref().unwrap().contains("RPM limit"));
    }

    #[tokio::test]
    async fn test_tpm_limit_rejects_overflow() {
        let (_, limiter) = limiter_with(100, 1_000);

        assert!(limiter.can_process(ProviderId::Groq, 600).await.allowed);
        let second = limiter.can_process(ProviderId::Groq, 500).await;
        assert!(!second.allowed);
        assert!(second.reason.unwrap().contains("TPM limit"));

        // A rejected request reserves nothing
        assert!(limiter.can_process(ProviderId::Groq, 400).await.allowed);
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_the_limit() {
        let (_, limiter) = limiter_with(10, 1_000_000);
        let limiter = Arc::new(limiter);

        let handles: Vec<_> = (0..25)
            .map(|_| {
                let limiter = limiter.clone();
                tokio::spawn(async move { limiter.can_process(ProviderId::Groq, 1).await.allowed })
            })
            .collect();

        let mut allowed = 0;
        for handle in handles {
            if handle.await.unwrap() {
                allowed += 1;
            }
        }
        assert_eq!(allowed, 10);
    }

    #[tokio::test]
    async fn test_window_slides() {
        let (_, limiter) = limiter_with(1, 1_000_000);
        let t0 = Utc::now().timestamp_millis();

        assert!(limiter.can_process_at(ProviderId::Groq, 1, t0).await.allowed);
        assert!(!limiter.can_process_at(ProviderId::Groq, 1, t0 + 30_000).await.allowed);
        assert!(limiter.can_process_at(ProviderId::Groq, 1, t0 + 60_001).await.allowed);
    }

    #[tokio::test]
    async fn test_fails_open_when_store_unreachable() {
        let (store, limiter) = limiter_with(0, 0);
        store.set_offline(true);

        let decision = limiter.can_process(ProviderId::Groq, 1_000_000).await;
        assert!(decision.allowed);
        assert!(decision.reason.unwrap().contains("failing open"));
    }

    #[tokio::test]
    async fn test_unknown_provider_is_denied() {
        let (_, limiter) = limiter_with(5, 1_000);
        assert!(!limiter.can_process(ProviderId::Glm, 1).await.allowed);
    }

    #[tokio::test]
    async fn test_usage_reports_utilization() {
        let (_, limiter) = limiter_with(4, 1_000);
        limiter.can_process(ProviderId::Groq, 100).await;
        limiter.can_process(ProviderId::Groq, 100).await;

        let usage = limiter.usage(ProviderId::Groq).await.unwrap().unwrap();
        assert_eq!(usage.rpm, 2);
        assert_eq!(usage.tpm, 200);
        assert!((usage.utilization - 0.5).abs() < f64::EPSILON);

        let all = limiter.usage_all().await.unwrap();
        assert_eq!(all.len(), 1);
    }

    #[test]
    fn test_utilization_is_clamped() {
        assert_eq!(utilization(10, 5, 0, 100), 1.0);
        assert_eq!(utilization(0, 5, 0, 100), 0.0);
        assert_eq!(utilization(1, 0, 0, 100), 1.0);
    }

    #[tokio::test]
    async fn test_command_errors_do_not_fail_open() {
        let (store, limiter) = limiter_with(100, 1_000_000);
        let keys = KeySpace::new("test");

        // Something other than an integer sits in the token counter
        store
            .enqueue_job(&crate::store::JobWrite {
                job_key: keys.token_counter("groq"),
                payload: "not-a-number".to_string(),
                index_key: "unrelated:index".to_string(),
                legacy_key: "unrelated:legacy".to_string(),
                member: "x".to_string(),
                score: 0,
                status_key: "unrelated:status".to_string(),
                status_fields: vec![("k".to_string(), "v".to_string())],
                ttl: Duration::from_secs(60),
            })
            .await
            .unwrap();

        let decision = limiter.can_process(ProviderId::Groq, 10).await;
        assert!(!decision.allowed);
        assert!(decision.reason.unwrap().contains("rate limiter error"));
    }
}
