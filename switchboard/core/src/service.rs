//! AI Service Manager
//!
//! Facade owning the router and the alert monitor. Everything a dashboard
//! or admin surface needs goes through here.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::alerts::{Alert, AlertEvent, AlertMonitor};
use crate::backend::ProviderClient;
use crate::clock::SharedClock;
use crate::config::{ConfigError, ConfigUpdate, SwitchboardConfig};
use crate::error::RouterError;
use crate::provider::{ProviderId, ProviderOverride, ProviderProfile};
use crate::request::ChatRequest;
use crate::routing::cache::CacheStats;
use crate::routing::events::RouterEvent;
use crate::routing::health::{HealthSnapshot, HealthTransition};
use crate::routing::metrics::ProviderMetricsSummary;
use crate::routing::rate_limit::UsageStatus;
use crate::routing::router::{DispatchResponse, ProviderRouter};

/// Per-provider view for dashboards
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProviderStatistics {
    /// Effective profile after overrides
    pub profile: ProviderProfile,
    /// Health after the lazy cooldown check
    pub health: HealthSnapshot,
    /// Minute and day window usage
    pub usage: UsageStatus,
    /// Attempt counters
    pub metrics: ProviderMetricsSummary,
}

/// Whole-service view for dashboards
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ServiceStatistics {
    /// Clock time of the snapshot
    pub generated_at: DateTime<Utc>,
    /// One entry per provider, in declaration order
    pub providers: Vec<ProviderStatistics>,
    /// Response cache counters
    pub cache: CacheStats,
    /// Dispatches finished, successful or not
    pub dispatches: u64,
    /// Dispatches served from the cache
    pub cache_hits: u64,
    /// Dispatches that needed more than one provider
    pub fallbacks: u64,
    /// Dispatches that returned an error
    pub dispatch_failures: u64,
    /// Alerts currently active
    pub active_alerts: usize,
    /// Seconds since the router was built
    pub uptime_secs: u64,
}

/// Router plus alert monitor behind one handle
pub struct AiServiceManager {
    router: ProviderRouter,
    alerts: Arc<AlertMonitor>,
}

impl AiServiceManager {
    /// Build the router and alert monitor from a loaded configuration
    pub fn new(
        config: &SwitchboardConfig,
        client: Arc<dyn ProviderClient>,
        clock: SharedClock,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let router = ProviderRouter::new(
            config.router.clone(),
            Arc::new(config.catalog()),
            client,
            Arc::clone(&clock),
        )?;
        let alerts = AlertMonitor::new(
            config.alerts.clone(),
            Arc::clone(router.usage()),
            Arc::clone(router.health()),
            clock,
        )?;

        Ok(Self { router, alerts })
    }

    /// Start background work (the alert schedule)
    pub fn start(&self) {
        if self.alerts.start() {
            tracing::info!("AI service manager started");
        }
    }

    /// Stop background work; in-flight dispatches are not interrupted
    pub fn shutdown(&self) {
        self.alerts.stop();
        tracing::info!("AI service manager stopped");
    }

    /// Route one request through the cache and candidate providers
    pub async fn dispatch(&self, request: ChatRequest) -> Result<DispatchResponse, RouterError> {
        self.router.dispatch(request).await
    }

    /// Underlying router
    pub fn router(&self) -> &ProviderRouter {
        &self.router
    }

    /// Underlying alert monitor
    pub fn alert_monitor(&self) -> &Arc<AlertMonitor> {
        &self.alerts
    }

    /// Health, usage and counters for every provider
    pub fn statistics(&self) -> ServiceStatistics {
        let metrics = self.router.metrics();
        let summaries = metrics.provider_summaries();

        let providers = ProviderId::ALL
            .into_iter()
            .zip(summaries)
            .map(|(id, metrics)| ProviderStatistics {
                profile: self.router.catalog().profile(id),
                health: self.router.health().snapshot(id),
                usage: self.router.usage().status(id),
                metrics,
            })
            .collect();

        ServiceStatistics {
            generated_at: self.router.clock().now(),
            providers,
            cache: self.router.cache_stats(),
            dispatches: metrics.dispatches.get(),
            cache_hits: metrics.cache_hits.get(),
            fallbacks: metrics.fallbacks.get(),
            dispatch_failures: metrics.dispatch_failures.get(),
            active_alerts: self.alerts.active_alerts().len(),
            uptime_secs: metrics.uptime().as_secs(),
        }
    }

    /// Alerts currently active
    pub fn active_alerts(&self) -> Vec<Alert> {
        self.alerts.active_alerts()
    }

    /// Drop an active alert; `false` when `id` is unknown
    pub fn dismiss_alert(&self, id: Uuid) -> bool {
        self.alerts.dismiss_alert(id)
    }

    /// Run an alert check now instead of waiting for the schedule
    pub fn check_alerts(&self) -> Vec<AlertEvent> {
        self.alerts.check_now()
    }

    /// Validate the merged result of `update`, then apply it
    ///
    /// Nothing is changed when any part fails validation.
    pub fn update_config(&self, update: &ConfigUpdate) -> Result<(), ConfigError> {
        let router = update.apply_to_router(&self.router.config());
        router.validate()?;
        if let Some(ref alerts) = update.alerts {
            alerts.apply_to(&self.alerts.config()).validate()?;
        }

        self.router.update_config(router)?;
        if let Some(ref alerts) = update.alerts {
            self.alerts.update_config(alerts)?;
        }
        Ok(())
    }

    /// Re-apply thresholds and timeouts from a freshly loaded configuration
    ///
    /// Provider profiles are left alone; use [`AiServiceManager::override_provider`].
    pub fn reload(&self, config: &SwitchboardConfig) -> Result<(), ConfigError> {
        self.update_config(&ConfigUpdate::from_config(config))?;
        tracing::info!(
            path = ?config.config_file_path,
            source = %config.source(),
            "Configuration reloaded"
        );
        Ok(())
    }

    /// Change a provider's priority, quota, enabled flag or default model
    pub fn override_provider(&self, id: ProviderId, patch: &ProviderOverride) -> ProviderProfile {
        let profile = self.router.catalog().apply_override(id, patch);
        if let Some(quota) = patch.quota {
            self.router.usage().set_quota(id, quota);
        }
        profile
    }

    /// Forget a provider's health history and usage counts
    pub fn reset_provider(&self, id: ProviderId) -> Option<HealthTransition> {
        self.router.usage().reset(id);
        self.router.health().reset(id)
    }

    /// Attempt, cache and health events from the router
    pub fn subscribe_events(&self) -> broadcast::Receiver<RouterEvent> {
        self.router.events().subscribe()
    }

    /// Alert raises, escalations and clears
    pub fn subscribe_alerts(&self) -> broadcast::Receiver<AlertEvent> {
        self.alerts.subscribe()
    }

    /// Router counters in Prometheus text format
    pub fn metrics_prometheus(&self) -> String {
        self.router.metrics().to_prometheus()
    }
}

impl Drop for AiServiceManager {
    fn drop(&mut self) {
        self.alerts.stop();
    }
}
