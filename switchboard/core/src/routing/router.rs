//! Provider Router
//!
//! Turns one logical [`ChatRequest`] into at most one successful upstream
//! call, falling back across providers on retryable failures.
//!
//! ```text
//! dispatch(request)
//!   -> validate
//!   -> fingerprint -> ResponseCache::get_or_compute ──hit──> cached reply
//!                          │ miss
//!                          v
//!      candidates (enabled, not blocked, within budget, capable)
//!        ordered by explicit, priority, avg latency, id
//!                          │
//!      for each: re-check health -> try_acquire budget -> invoke
//!         success      -> record, return
//!         retryable    -> record, next candidate
//!         non-retryable-> record, abort
//!                          │ exhausted
//!                          v
//!                NoProvidersAvailable { attempts }
//! ```
//!
//! No provider lock is held across an upstream call. The overall deadline
//! bounds both the candidate loop and the caller's wait.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use super::cache::{CacheStats, ResponseCache};
use super::config::RouterConfig;
use super::events::{EventBus, RouterEvent};
use super::health::ProviderHealthRegistry;
use super::metrics::RouterMetrics;
use super::rate_limit::RateLimitTracker;
use crate::backend::{ProviderClient, ProviderError, ProviderRequest};
use crate::clock::SharedClock;
use crate::config::ConfigError;
use crate::error::{AttemptOutcome, AttemptRecord, ErrorClass, RouterError};
use crate::provider::{ProviderCatalog, ProviderId};
use crate::request::{ChatRequest, Preferences};

// ============================================================================
// Results
// ============================================================================

/// What the candidate loop produced; this is what the cache stores
#[derive(Clone, Debug, PartialEq)]
pub struct RoutedReply {
    pub provider: ProviderId,
    pub content: String,
    pub model: String,
    pub tokens_used: u32,
    pub attempts: Vec<AttemptRecord>,
}

/// Answer to a dispatch
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DispatchResponse {
    pub request_id: String,
    pub content: String,
    /// Provider that produced the content
    pub provider: ProviderId,
    pub model: String,
    pub tokens_used: u32,
    /// Served from a stored or concurrently computed cache entry
    pub cached: bool,
    pub latency_ms: u64,
    /// Candidates considered by this dispatch (empty when cached)
    pub attempts: Vec<AttemptRecord>,
}

// ============================================================================
// Router
// ============================================================================

struct RouterInner {
    catalog: Arc<ProviderCatalog>,
    usage: Arc<RateLimitTracker>,
    health: Arc<ProviderHealthRegistry>,
    cache: ResponseCache<RoutedReply, RouterError>,
    client: Arc<dyn ProviderClient>,
    config: RwLock<RouterConfig>,
    events: EventBus,
    metrics: Arc<RouterMetrics>,
    clock: SharedClock,
}

/// Everything the candidate loop needs, owned so it can outlive the caller
struct DispatchPlan {
    request_id: String,
    explicit: Option<ProviderId>,
    preferences: Preferences,
    request: ProviderRequest,
    deadline: Instant,
    overall: Duration,
}

/// Longest deadline the timer is asked to track
const MAX_DEADLINE: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Cheap-to-clone handle to the shared routing state
#[derive(Clone)]
pub struct ProviderRouter {
    inner: Arc<RouterInner>,
}

impl std::fmt::Debug for ProviderRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRouter")
            .field("client", &self.inner.client.name())
            .field("config", &*self.inner.config.read())
            .finish_non_exhaustive()
    }
}

impl ProviderRouter {
    /// Router over `catalog`, calling upstream through `client`
    pub fn new(
        config: RouterConfig,
        catalog: Arc<ProviderCatalog>,
        client: Arc<dyn ProviderClient>,
        clock: SharedClock,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let usage = Arc::new(RateLimitTracker::from_catalog(&catalog, Arc::clone(&clock)));
        let events = EventBus::default();
        let health = Arc::new(ProviderHealthRegistry::with_events(
            config.health.clone(),
            Arc::clone(&clock),
            events.clone(),
        ));
        let cache = ResponseCache::new(config.cache.clone(), Arc::clone(&clock));

        tracing::info!(
            client = client.name(),
            cache_enabled = config.cache.enabled,
            "Provider router created"
        );

        Ok(Self {
            inner: Arc::new(RouterInner {
                catalog,
                usage,
                health,
                cache,
                client,
                config: RwLock::new(config),
                events,
                metrics: Arc::new(RouterMetrics::new()),
                clock,
            }),
        })
    }

    /// Serve one request
    pub async fn dispatch(&self, request: ChatRequest) -> Result<DispatchResponse, RouterError> {
        let started = Instant::now();
        let result = self.dispatch_inner(&request, started).await;
        let elapsed = started.elapsed();

        match &result {
            Ok(response) => {
                let upstream = response.attempts.iter().filter(|a| a.reached_upstream()).count();
                self.inner
                    .metrics
                    .record_dispatch(elapsed, response.cached, upstream, true);
                tracing::debug!(
                    request_id = %response.request_id,
                    provider = %response.provider,
                    cached = response.cached,
                    latency_ms = response.latency_ms,
                    "Dispatch served"
                );
            }
            Err(e) => {
                self.inner.metrics.record_dispatch(elapsed, false, 0, false);
                self.inner.events.emit(RouterEvent::DispatchFailed {
                    request_id: request.request_id.clone(),
                    class: e.class(),
                    retryable: e.is_retryable(),
                });
                tracing::warn!(
                    request_id = %request.request_id,
                    class = %e.class(),
                    error = %e,
                    "Dispatch failed"
                );
            }
        }

        result
    }

    async fn dispatch_inner(
        &self,
        request: &ChatRequest,
        started: Instant,
    ) -> Result<DispatchResponse, RouterError> {
        request.validate()?;

        let config = self.inner.config.read().clone();
        let overall = request.timeout().unwrap_or(config.dispatch.default_timeout);
        let deadline = started + overall.min(MAX_DEADLINE);
        let plan = DispatchPlan {
            request_id: request.request_id.clone(),
            explicit: request.provider,
            preferences: request.preferences.clone(),
            request: request.normalized(),
            deadline,
            overall,
        };

        let work = async {
            if request.use_cache && config.cache.enabled {
                let inner = Arc::clone(&self.inner);
                let lookup = self
                    .inner
                    .cache
                    .get_or_compute(request.fingerprint(), move || run_candidates(inner, plan))
                    .await?;
                let cached = lookup.is_cached();
                Ok::<_, RouterError>((lookup.into_value(), cached))
            } else {
                let reply = run_candidates(Arc::clone(&self.inner), plan).await?;
                Ok((reply, false))
            }
        };

        let (reply, cached) = tokio::time::timeout_at(deadline, work)
            .await
            .map_err(|_| RouterError::Timeout {
                after_ms: duration_ms(overall),
            })??;

        if cached {
            self.inner.events.emit(RouterEvent::CacheHit {
                request_id: request.request_id.clone(),
            });
        }

        Ok(DispatchResponse {
            request_id: request.request_id.clone(),
            content: reply.content,
            provider: reply.provider,
            model: reply.model,
            tokens_used: reply.tokens_used,
            cached,
            latency_ms: duration_ms(started.elapsed()),
            attempts: if cached { Vec::new() } else { reply.attempts },
        })
    }

    /// Ordered eligible providers for `request`, without calling anything
    pub fn candidates(&self, request: &ChatRequest) -> Result<Vec<ProviderId>, RouterError> {
        self.inner
            .candidates(request.provider, &request.preferences)
    }

    /// Provider profiles in effect
    pub fn catalog(&self) -> &Arc<ProviderCatalog> {
        &self.inner.catalog
    }

    /// Per-provider rate-limit usage
    pub fn usage(&self) -> &Arc<RateLimitTracker> {
        &self.inner.usage
    }

    /// Per-provider health records
    pub fn health(&self) -> &Arc<ProviderHealthRegistry> {
        &self.inner.health
    }

    pub fn metrics(&self) -> &Arc<RouterMetrics> {
        &self.inner.metrics
    }

    /// Bus carrying attempt, cache and health events
    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    pub fn clock(&self) -> &SharedClock {
        &self.inner.clock
    }

    /// Hit, miss and in-flight counters of the response cache
    pub fn cache_stats(&self) -> CacheStats {
        self.inner.cache.stats()
    }

    /// Drop every cached response
    pub fn clear_cache(&self) {
        self.inner.cache.clear();
    }

    /// Current configuration
    pub fn config(&self) -> RouterConfig {
        self.inner.config.read().clone()
    }

    /// Validate and apply a new configuration to every component
    pub fn update_config(&self, config: RouterConfig) -> Result<(), ConfigError> {
        config.validate()?;
        self.inner.health.update_config(config.health.clone())?;
        self.inner.cache.update_config(config.cache.clone());
        *self.inner.config.write() = config;
        tracing::info!("Router configuration updated");
        Ok(())
    }
}

// ============================================================================
// Candidate Selection
// ============================================================================

impl RouterInner {
    /// Why `id` may not serve a request with `preferences`, if anything
    fn ineligibility(&self, id: ProviderId, preferences: &Preferences) -> Option<String> {
        let profile = self.catalog.profile(id);
        if !profile.enabled {
            return Some("provider is disabled".to_string());
        }

        let state = self.health.state(id);
        if !state.allows_requests() {
            return Some(format!("provider is {state}"));
        }

        if !self.client.is_configured(id) {
            return Some("provider has no credentials configured".to_string());
        }

        if !self.usage.is_within_budget(id) {
            return Some("rate-limit budget exhausted".to_string());
        }

        preferences.unmet_capability(&profile.capabilities)
    }

    fn candidates(
        &self,
        explicit: Option<ProviderId>,
        preferences: &Preferences,
    ) -> Result<Vec<ProviderId>, RouterError> {
        if let Some(provider) = explicit {
            if let Some(reason) = self.ineligibility(provider, preferences) {
                return Err(RouterError::ProviderUnavailable { provider, reason });
            }
            if !self.config.read().dispatch.fallback_from_explicit {
                return Ok(vec![provider]);
            }
        }

        let mut eligible: Vec<(bool, u32, u64, ProviderId)> = ProviderId::ALL
            .into_iter()
            .filter(|id| Some(*id) == explicit || self.ineligibility(*id, preferences).is_none())
            .map(|id| {
                // Unknown latency sorts first so new providers get traffic
                let latency_us = self
                    .health
                    .avg_latency(id)
                    .map_or(0, |ms| (ms * 1000.0) as u64);
                (Some(id) != explicit, self.catalog.profile(id).priority, latency_us, id)
            })
            .collect();
        eligible.sort_unstable();

        Ok(eligible.into_iter().map(|(_, _, _, id)| id).collect())
    }

    fn record_skip(&self, request_id: &str, provider: ProviderId, reason: String, attempts: &mut Vec<AttemptRecord>) {
        tracing::debug!(request_id, provider = %provider, reason = %reason, "Candidate skipped");
        self.metrics.record_skip(provider);
        self.events.emit(RouterEvent::AttemptSkipped {
            request_id: request_id.to_string(),
            provider,
            reason: reason.clone(),
        });
        attempts.push(AttemptRecord {
            provider,
            outcome: AttemptOutcome::Skipped { reason },
            latency_ms: 0,
        });
    }
}

// ============================================================================
// Candidate Loop
// ============================================================================

async fn run_candidates(inner: Arc<RouterInner>, plan: DispatchPlan) -> Result<RoutedReply, RouterError> {
    let candidates = inner.candidates(plan.explicit, &plan.preferences)?;
    let dispatch = inner.config.read().dispatch.clone();
    let mut attempts = Vec::with_capacity(candidates.len());

    for provider in candidates {
        let remaining = plan.deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(RouterError::Timeout {
                after_ms: duration_ms(plan.overall),
            });
        }

        // State may have moved since the list was built
        let state = inner.health.state(provider);
        if !state.allows_requests() {
            inner.record_skip(&plan.request_id, provider, format!("provider is {state}"), &mut attempts);
            continue;
        }
        if !inner.usage.try_acquire(provider) {
            inner.record_skip(
                &plan.request_id,
                provider,
                "rate-limit budget exhausted".to_string(),
                &mut attempts,
            );
            continue;
        }

        let mut request = plan.request.clone();
        if request.model.is_none() {
            request.model = Some(inner.catalog.profile(provider).default_model);
        }
        let attempt_timeout = dispatch.attempt_timeout.min(remaining);

        let started = Instant::now();
        let result = tokio::time::timeout(
            attempt_timeout,
            inner.client.invoke(provider, &request, attempt_timeout),
        )
        .await
        .unwrap_or_else(|_| Err(ProviderError::timeout(attempt_timeout)));
        let latency = started.elapsed();

        match result {
            Ok(reply) => {
                inner.health.record_success(provider, latency);
                inner
                    .metrics
                    .record_attempt_success(provider, latency, reply.tokens_used);
                inner.events.emit(RouterEvent::AttemptSucceeded {
                    request_id: plan.request_id.clone(),
                    provider,
                    latency_ms: duration_ms(latency),
                });
                attempts.push(AttemptRecord {
                    provider,
                    outcome: AttemptOutcome::Succeeded,
                    latency_ms: duration_ms(latency),
                });

                return Ok(RoutedReply {
                    provider,
                    content: reply.content,
                    model: reply.model,
                    tokens_used: reply.tokens_used,
                    attempts,
                });
            }
            Err(e) => {
                tracing::warn!(
                    request_id = %plan.request_id,
                    provider = %provider,
                    class = %e.class,
                    error = %e.message,
                    "Provider attempt failed"
                );
                inner.health.record_failure(provider, e.class);
                inner.metrics.record_attempt_failure(provider, e.class, latency);
                inner.events.emit(RouterEvent::AttemptFailed {
                    request_id: plan.request_id.clone(),
                    provider,
                    class: e.class,
                    latency_ms: duration_ms(latency),
                });
                attempts.push(AttemptRecord {
                    provider,
                    outcome: AttemptOutcome::Failed {
                        class: e.class,
                        message: e.message.clone(),
                    },
                    latency_ms: duration_ms(latency),
                });

                if e.class == ErrorClass::RateLimited {
                    inner.usage.saturate_minute(provider);
                }

                let aborts = match e.class {
                    ErrorClass::Authentication => !dispatch.failover_on_authentication,
                    class => !class.is_retryable(),
                };
                if aborts {
                    return Err(RouterError::Upstream {
                        provider,
                        class: e.class,
                        message: e.message,
                    });
                }
            }
        }
    }

    Err(RouterError::NoProvidersAvailable { attempts })
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::provider::{ProviderOverride, Quota};
    use crate::routing::health::HealthState;
    use crate::routing::test_utils::{ScriptedOutcome, ScriptedProvider};
    use chrono::{TimeZone, Utc};
    use pretty_assertions::assert_eq;

    fn router_with(client: ScriptedProvider) -> (ProviderRouter, Arc<ManualClock>) {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap());
        let router = ProviderRouter::new(
            RouterConfig::default(),
            Arc::new(ProviderCatalog::builtin()),
            Arc::new(client),
            clock.clone(),
        )
        .unwrap();
        (router, clock)
    }

    #[tokio::test]
    async fn test_candidate_order_priority_then_id() {
        let (router, _) = router_with(ScriptedProvider::new());
        let order = router.candidates(&ChatRequest::user("hi")).unwrap();
        assert_eq!(
            order,
            vec![
                ProviderId::OpenAi,
                ProviderId::Anthropic,
                ProviderId::Gemini,
                ProviderId::Groq,
                ProviderId::Mistral,
                ProviderId::DeepSeek,
            ]
        );
    }

    #[tokio::test]
    async fn test_explicit_provider_goes_first() {
        let (router, _) = router_with(ScriptedProvider::new());
        let order = router
            .candidates(&ChatRequest::user("hi").with_provider(ProviderId::Mistral))
            .unwrap();
        assert_eq!(order[0], ProviderId::Mistral);
        assert_eq!(order.len(), ProviderId::COUNT);
    }

    #[tokio::test]
    async fn test_capability_filter() {
        let (router, _) = router_with(ScriptedProvider::new());
        let order = router
            .candidates(&ChatRequest::user("call a tool").with_function_calling())
            .unwrap();
        assert!(!order.contains(&ProviderId::Groq));
    }

    #[tokio::test]
    async fn test_lower_latency_wins_within_tier() {
        let (router, _) = router_with(ScriptedProvider::new());
        router
            .health()
            .record_success(ProviderId::OpenAi, Duration::from_millis(900));
        router
            .health()
            .record_success(ProviderId::Anthropic, Duration::from_millis(200));

        let order = router.candidates(&ChatRequest::user("hi")).unwrap();
        assert_eq!(&order[..2], &[ProviderId::Anthropic, ProviderId::OpenAi]);
    }

    #[tokio::test]
    async fn test_validation_attempts_nothing() {
        let client = ScriptedProvider::new();
        let (router, _) = router_with(client.clone());
        let err = router
            .dispatch(ChatRequest::user("hi").with_temperature(3.5))
            .await
            .unwrap_err();
        assert_eq!(err.class(), ErrorClass::Validation);
        assert!(!err.is_retryable());
        assert_eq!(client.total_calls(), 0);
    }

    #[tokio::test]
    async fn test_upstream_validation_rejections_keep_provider_healthy() {
        let client = ScriptedProvider::new();
        client.set_default(ProviderId::OpenAi, ScriptedOutcome::Fail(ErrorClass::Validation));
        let (router, _) = router_with(client.clone());

        for i in 0..6 {
            let err = router
                .dispatch(ChatRequest::user(format!("malformed {i}")).without_cache())
                .await
                .unwrap_err();
            assert_eq!(err.class(), ErrorClass::Validation);
        }

        assert_eq!(client.calls(ProviderId::OpenAi), 6);
        let snapshot = router.health().snapshot(ProviderId::OpenAi);
        assert_eq!(snapshot.state, HealthState::Healthy);
        assert_eq!(snapshot.consecutive_failures, 0);
    }

    #[tokio::test]
    async fn test_unconfigured_provider_is_never_charged() {
        let client = ScriptedProvider::new();
        client.set_configured(ProviderId::OpenAi, false);
        let (router, _) = router_with(client.clone());

        let order = router.candidates(&ChatRequest::user("hi")).unwrap();
        assert!(!order.contains(&ProviderId::OpenAi));

        for i in 0..3 {
            let response = router
                .dispatch(ChatRequest::user(format!("question {i}")).without_cache())
                .await
                .unwrap();
            assert_eq!(response.provider, ProviderId::Anthropic);
        }

        assert_eq!(client.calls(ProviderId::OpenAi), 0);
        assert_eq!(router.usage().status(ProviderId::OpenAi).minute.usage, 0);
        assert_eq!(router.health().state(ProviderId::OpenAi), HealthState::Healthy);

        let err = router
            .dispatch(ChatRequest::user("hi").with_provider(ProviderId::OpenAi))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RouterError::ProviderUnavailable {
                provider: ProviderId::OpenAi,
                ..
            }
        ));
        assert_eq!(router.usage().status(ProviderId::OpenAi).minute.usage, 0);
    }

    #[tokio::test]
    async fn test_unbounded_timeout_dispatches() {
        let (router, _) = router_with(ScriptedProvider::new());
        let response = router
            .dispatch(ChatRequest::user("hi").with_timeout(Duration::MAX))
            .await
            .unwrap();
        assert_eq!(response.provider, ProviderId::OpenAi);
    }

    #[tokio::test]
    async fn test_retryable_failure_falls_back() {
        let client = ScriptedProvider::new();
        client.push(ProviderId::OpenAi, ScriptedOutcome::Fail(ErrorClass::Network));
        let (router, _) = router_with(client.clone());

        let response = router.dispatch(ChatRequest::user("hi")).await.unwrap();
        assert_eq!(response.provider, ProviderId::Anthropic);
        assert_eq!(response.attempts.len(), 2);
        assert!(!response.cached);
        assert_eq!(router.usage().status(ProviderId::OpenAi).minute.usage, 1);
        assert_eq!(router.usage().status(ProviderId::Anthropic).minute.usage, 1);
    }

    #[tokio::test]
    async fn test_authentication_aborts_and_blocks() {
        let client = ScriptedProvider::new();
        client.push(ProviderId::OpenAi, ScriptedOutcome::Fail(ErrorClass::Authentication));
        let (router, _) = router_with(client.clone());

        let err = router.dispatch(ChatRequest::user("hi")).await.unwrap_err();
        assert!(matches!(
            err,
            RouterError::Upstream {
                provider: ProviderId::OpenAi,
                class: ErrorClass::Authentication,
                ..
            }
        ));
        assert_eq!(client.total_calls(), 1);
        assert_eq!(router.health().state(ProviderId::OpenAi), HealthState::Blocked);
    }

    #[tokio::test]
    async fn test_authentication_failover_when_configured() {
        let client = ScriptedProvider::new();
        client.push(ProviderId::OpenAi, ScriptedOutcome::Fail(ErrorClass::Authentication));
        let (router, _) = router_with(client.clone());
        let mut config = router.config();
        config.dispatch.failover_on_authentication = true;
        router.update_config(config).unwrap();

        let response = router.dispatch(ChatRequest::user("hi")).await.unwrap();
        assert_eq!(response.provider, ProviderId::Anthropic);
    }

    #[tokio::test]
    async fn test_rate_limited_saturates_minute_window() {
        let client = ScriptedProvider::new();
        client.push(ProviderId::OpenAi, ScriptedOutcome::Fail(ErrorClass::RateLimited));
        let (router, _) = router_with(client);

        let response = router.dispatch(ChatRequest::user("hi")).await.unwrap();
        assert_eq!(response.provider, ProviderId::Anthropic);
        assert!(!router.usage().is_within_budget(ProviderId::OpenAi));
    }

    #[tokio::test]
    async fn test_explicit_ineligible_fails_fast() {
        let client = ScriptedProvider::new();
        let (router, _) = router_with(client.clone());
        router.catalog().apply_override(
            ProviderId::Gemini,
            &ProviderOverride::default().with_enabled(false),
        );

        let err = router
            .dispatch(ChatRequest::user("hi").with_provider(ProviderId::Gemini))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RouterError::ProviderUnavailable {
                provider: ProviderId::Gemini,
                ..
            }
        ));
        assert_eq!(client.total_calls(), 0);
    }

    #[tokio::test]
    async fn test_explicit_without_fallback() {
        let client = ScriptedProvider::new();
        client.push(ProviderId::Mistral, ScriptedOutcome::Fail(ErrorClass::Timeout));
        let (router, _) = router_with(client.clone());
        let mut config = router.config();
        config.dispatch.fallback_from_explicit = false;
        router.update_config(config).unwrap();

        let err = router
            .dispatch(ChatRequest::user("hi").with_provider(ProviderId::Mistral))
            .await
            .unwrap_err();
        match err {
            RouterError::NoProvidersAvailable { attempts } => {
                assert_eq!(attempts.len(), 1);
                assert_eq!(attempts[0].provider, ProviderId::Mistral);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(client.total_calls(), 1);
    }

    #[tokio::test]
    async fn test_exhausted_candidates_lists_attempts() {
        let client = ScriptedProvider::new();
        for id in ProviderId::ALL {
            client.set_default(id, ScriptedOutcome::Fail(ErrorClass::Unknown));
        }
        let (router, _) = router_with(client.clone());

        let err = router.dispatch(ChatRequest::user("hi")).await.unwrap_err();
        assert!(err.is_retryable());
        match err {
            RouterError::NoProvidersAvailable { attempts } => {
                assert_eq!(attempts.len(), ProviderId::COUNT);
                assert!(attempts.iter().all(AttemptRecord::reached_upstream));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_over_budget_provider_never_called() {
        let client = ScriptedProvider::new();
        let (router, _) = router_with(client.clone());
        router.usage().set_quota(ProviderId::OpenAi, Quota::new(1, 100));
        router.usage().record_usage(ProviderId::OpenAi);

        let response = router
            .dispatch(ChatRequest::user("hi").without_cache())
            .await
            .unwrap();
        assert_eq!(response.provider, ProviderId::Anthropic);
        assert_eq!(client.calls(ProviderId::OpenAi), 0);
    }

    #[tokio::test]
    async fn test_cached_dispatch_skips_upstream() {
        let client = ScriptedProvider::new();
        let (router, _) = router_with(client.clone());

        let first = router.dispatch(ChatRequest::user("same")).await.unwrap();
        let second = router.dispatch(ChatRequest::user("same")).await.unwrap();

        assert!(!first.cached);
        assert!(second.cached);
        assert!(second.attempts.is_empty());
        assert_eq!(first.content, second.content);
        assert_eq!(client.total_calls(), 1);
        assert_eq!(router.usage().status(first.provider).lifetime_requests, 1);
    }

    #[tokio::test]
    async fn test_events_published() {
        let client = ScriptedProvider::new();
        client.push(ProviderId::OpenAi, ScriptedOutcome::Fail(ErrorClass::Timeout));
        let (router, _) = router_with(client);
        let mut rx = router.events().subscribe();

        router.dispatch(ChatRequest::user("hi")).await.unwrap();

        let first = rx.recv().await.unwrap();
        assert!(matches!(
            first,
            RouterEvent::AttemptFailed {
                provider: ProviderId::OpenAi,
                class: ErrorClass::Timeout,
                ..
            }
        ));
        let second = rx.recv().await.unwrap();
        assert!(matches!(
            second,
            RouterEvent::AttemptSucceeded {
                provider: ProviderId::Anthropic,
                ..
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_overall_deadline() {
        let client = ScriptedProvider::new();
        for id in ProviderId::ALL {
            client.set_default(id, ScriptedOutcome::Hang);
        }
        let (router, _) = router_with(client);

        let err = router
            .dispatch(ChatRequest::user("hi").with_timeout(Duration::from_secs(5)))
            .await
            .unwrap_err();
        assert_eq!(err, RouterError::Timeout { after_ms: 5000 });
    }
}
