//! Usage Alerts
//!
//! Periodic, threshold-based alerts on provider quota usage.
//!
//! ```text
//!   0% ........ warning (80%) ........ critical (95%) ..... 100%
//!   |  no alert  |      Warning        |      Critical       |
//! ```
//!
//! Each check reconciles the active set against current usage: a provider
//! gets at most one alert, which is raised, moved between levels in place
//! (same id and creation time), or cleared once usage falls below the
//! warning threshold. A dismissed alert stays quiet until usage goes above
//! its dismissed level or drops below warning.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch, Notify};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::clock::SharedClock;
use crate::config::ConfigError;
use crate::provider::ProviderId;
use crate::routing::health::{HealthState, ProviderHealthRegistry};
use crate::routing::rate_limit::{RateLimitTracker, UsageStatus, WindowPeriod};

// ============================================================================
// Configuration
// ============================================================================

/// Alert thresholds and schedule
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AlertConfig {
    /// Whether the periodic check runs
    pub enabled: bool,

    /// Time between scheduled checks
    pub check_interval: Duration,

    /// Usage percentage that raises a warning
    pub warning_threshold: f64,

    /// Usage percentage that raises a critical alert
    pub critical_threshold: f64,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            check_interval: Duration::from_secs(60),
            warning_threshold: 80.0,
            critical_threshold: 95.0,
        }
    }
}

impl AlertConfig {
    /// `0 < warning < critical <= 100` and a positive interval
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.check_interval.is_zero() {
            return Err(ConfigError::ValidationError(
                "alerts.check_interval must be positive".to_string(),
            ));
        }
        let (w, c) = (self.warning_threshold, self.critical_threshold);
        if !(w > 0.0 && w < c && c <= 100.0) {
            return Err(ConfigError::ValidationError(format!(
                "alert thresholds must satisfy 0 < warning ({w}) < critical ({c}) <= 100"
            )));
        }
        Ok(())
    }

    /// Level for a usage percentage
    #[must_use]
    pub fn classify(&self, percentage: f64) -> Option<AlertLevel> {
        if percentage >= self.critical_threshold {
            Some(AlertLevel::Critical)
        } else if percentage >= self.warning_threshold {
            Some(AlertLevel::Warning)
        } else {
            None
        }
    }
}

/// Partial update of [`AlertConfig`]; `None` fields are kept
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertConfigUpdate {
    /// Turn scheduled checks on or off
    pub enabled: Option<bool>,
    /// Period of the scheduled check
    pub check_interval: Option<Duration>,
    /// Usage percentage raising a warning
    pub warning_threshold: Option<f64>,
    /// Usage percentage raising a critical alert
    pub critical_threshold: Option<f64>,
}

impl AlertConfigUpdate {
    /// `base` with this update applied
    #[must_use]
    pub fn apply_to(&self, base: &AlertConfig) -> AlertConfig {
        AlertConfig {
            enabled: self.enabled.unwrap_or(base.enabled),
            check_interval: self.check_interval.unwrap_or(base.check_interval),
            warning_threshold: self.warning_threshold.unwrap_or(base.warning_threshold),
            critical_threshold: self.critical_threshold.unwrap_or(base.critical_threshold),
        }
    }
}

// ============================================================================
// Alerts
// ============================================================================

/// Severity of a usage alert
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    /// At or above the warning threshold
    Warning,
    /// At or above the critical threshold
    Critical,
}

impl std::fmt::Display for AlertLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Warning => write!(f, "warning"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

/// An active usage alert for one provider
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    /// Stable across escalation; new after a clear
    pub id: Uuid,
    /// Current severity
    pub level: AlertLevel,
    /// Provider whose usage crossed a threshold
    pub provider: ProviderId,
    /// Human-readable summary naming the hottest window
    pub message: String,
    /// Usage when the alert was last evaluated
    pub usage: UsageStatus,
    /// Provider health when the alert was last evaluated
    pub health: HealthState,
    /// When the alert was first raised
    pub created_at: DateTime<Utc>,
    /// When the level or usage last changed
    pub updated_at: DateTime<Utc>,
}

/// Changes to the active alert set
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AlertEvent {
    /// A provider crossed a threshold
    Raised {
        /// The new alert
        alert: Alert,
    },
    /// An active alert changed level
    Updated {
        /// Level before the change
        previous: AlertLevel,
        /// The alert at its new level
        alert: Alert,
    },
    /// Usage fell back below the warning threshold
    Cleared {
        /// The alert as it was when cleared
        alert: Alert,
    },
    /// An operator dismissed the alert
    Dismissed {
        /// The dismissed alert
        alert: Alert,
    },
}

fn describe(provider: ProviderId, level: AlertLevel, usage: &UsageStatus) -> String {
    let (period, window) = usage.hottest();
    let period = match period {
        WindowPeriod::Minute => "per-minute",
        WindowPeriod::Day => "daily",
    };
    format!(
        "{} {level}: {:.1}% of {period} quota used ({}/{})",
        provider.display_name(),
        window.percentage,
        window.usage,
        window.limit.unwrap_or_default()
    )
}

// ============================================================================
// Monitor
// ============================================================================

/// Watches quota usage and maintains the active alert set
pub struct AlertMonitor {
    usage: Arc<RateLimitTracker>,
    health: Arc<ProviderHealthRegistry>,
    clock: SharedClock,
    config: RwLock<AlertConfig>,
    active: DashMap<ProviderId, Alert>,
    /// Level at which each provider's alert was dismissed
    dismissed: DashMap<ProviderId, AlertLevel>,
    events: broadcast::Sender<AlertEvent>,
    reconfigured: Notify,
    shutdown_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl AlertMonitor {
    /// Monitor over shared usage and health state
    pub fn new(
        config: AlertConfig,
        usage: Arc<RateLimitTracker>,
        health: Arc<ProviderHealthRegistry>,
        clock: SharedClock,
    ) -> Result<Arc<Self>, ConfigError> {
        config.validate()?;
        let (events, _) = broadcast::channel(64);
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Arc::new(Self {
            usage,
            health,
            clock,
            config: RwLock::new(config),
            active: DashMap::new(),
            dismissed: DashMap::new(),
            events,
            reconfigured: Notify::new(),
            shutdown_tx,
            task: Mutex::new(None),
        }))
    }

    /// Start the periodic check; returns false if it is already running
    pub fn start(self: &Arc<Self>) -> bool {
        let mut task = self.task.lock();
        if task.as_ref().is_some_and(|h| !h.is_finished()) {
            return false;
        }

        self.shutdown_tx.send_replace(false);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let monitor = Arc::clone(self);

        *task = Some(tokio::spawn(async move {
            tracing::info!("Alert monitor started");
            loop {
                let interval = monitor.config.read().check_interval;

                tokio::select! {
                    () = tokio::time::sleep(interval) => {
                        if monitor.config.read().enabled {
                            monitor.evaluate();
                        }
                    }
                    () = monitor.reconfigured.notified() => {
                        tracing::debug!("Alert monitor reconfigured");
                    }
                    _ = shutdown_rx.changed() => {
                        tracing::info!("Alert monitor shutting down");
                        break;
                    }
                }
            }
        }));
        true
    }

    /// Stop the periodic check; dispatches are not affected
    pub fn stop(&self) {
        self.shutdown_tx.send_replace(true);
        if let Some(handle) = self.task.lock().take() {
            handle.abort();
        }
    }

    /// Whether the scheduled check task is alive
    pub fn is_running(&self) -> bool {
        self.task.lock().as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Run one check immediately, returning the changes it made
    pub fn check_now(&self) -> Vec<AlertEvent> {
        self.evaluate()
    }

    fn evaluate(&self) -> Vec<AlertEvent> {
        let config = self.config.read().clone();
        let now = self.clock.now();
        let mut changes = Vec::new();

        for provider in ProviderId::ALL {
            let usage = self.usage.status(provider);
            let Some(level) = config.classify(usage.percentage()) else {
                self.dismissed.remove(&provider);
                if let Some((_, alert)) = self.active.remove(&provider) {
                    tracing::info!(provider = %provider, alert_id = %alert.id, "Usage alert cleared");
                    changes.push(AlertEvent::Cleared { alert });
                }
                continue;
            };

            if let Some(dismissed_at) = self.dismissed.get(&provider).map(|e| *e.value()) {
                if level <= dismissed_at {
                    continue;
                }
                self.dismissed.remove(&provider);
            }

            let health = self.health.state(provider);
            let message = describe(provider, level, &usage);

            match self.active.entry(provider) {
                Entry::Occupied(mut entry) => {
                    let alert = entry.get_mut();
                    let previous = alert.level;
                    alert.usage = usage;
                    alert.health = health;
                    if previous != level {
                        alert.level = level;
                        alert.message = message;
                        alert.updated_at = now;
                        tracing::warn!(
                            provider = %provider,
                            alert_id = %alert.id,
                            from = %previous,
                            to = %level,
                            "Usage alert level changed"
                        );
                        changes.push(AlertEvent::Updated {
                            previous,
                            alert: alert.clone(),
                        });
                    }
                }
                Entry::Vacant(entry) => {
                    let alert = Alert {
                        id: Uuid::new_v4(),
                        level,
                        provider,
                        message,
                        usage,
                        health,
                        created_at: now,
                        updated_at: now,
                    };
                    tracing::warn!(
                        provider = %provider,
                        alert_id = %alert.id,
                        level = %level,
                        message = %alert.message,
                        "Usage alert raised"
                    );
                    changes.push(AlertEvent::Raised {
                        alert: alert.clone(),
                    });
                    entry.insert(alert);
                }
            }
        }

        for event in &changes {
            // No subscribers is fine
            let _ = self.events.send(event.clone());
        }
        changes
    }

    /// Active alerts in provider order
    pub fn active_alerts(&self) -> Vec<Alert> {
        let mut alerts: Vec<Alert> = self.active.iter().map(|e| e.value().clone()).collect();
        alerts.sort_by_key(|a| a.provider);
        alerts
    }

    /// Dismiss an active alert; false if no such alert is active
    pub fn dismiss_alert(&self, id: Uuid) -> bool {
        let Some(provider) = self
            .active
            .iter()
            .find(|e| e.value().id == id)
            .map(|e| *e.key())
        else {
            return false;
        };

        let Some((_, alert)) = self.active.remove(&provider) else {
            return false;
        };
        self.dismissed.insert(provider, alert.level);
        tracing::info!(provider = %provider, alert_id = %id, "Usage alert dismissed");
        let _ = self.events.send(AlertEvent::Dismissed { alert });
        true
    }

    /// Current thresholds and schedule
    pub fn config(&self) -> AlertConfig {
        self.config.read().clone()
    }

    /// Validate and apply a partial update; wakes the scheduler
    pub fn update_config(&self, update: &AlertConfigUpdate) -> Result<AlertConfig, ConfigError> {
        let next = update.apply_to(&self.config.read());
        next.validate()?;
        *self.config.write() = next.clone();
        self.reconfigured.notify_one();
        tracing::info!(
            warning = next.warning_threshold,
            critical = next.critical_threshold,
            interval_secs = next.check_interval.as_secs(),
            "Alert configuration updated"
        );
        Ok(next)
    }

    /// Receiver for alert changes from now on
    pub fn subscribe(&self) -> broadcast::Receiver<AlertEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::provider::{ProviderTable, Quota};
    use crate::routing::health::HealthConfig;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    const P: ProviderId = ProviderId::Mistral;

    fn monitor() -> (Arc<AlertMonitor>, Arc<RateLimitTracker>, Arc<ManualClock>) {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap());
        let quotas = ProviderTable::from_fn(|id| {
            if id == P {
                Quota {
                    requests_per_minute: Some(100),
                    requests_per_day: None,
                }
            } else {
                Quota::unlimited()
            }
        });
        let usage = Arc::new(RateLimitTracker::new(quotas, clock.clone()));
        let health = Arc::new(ProviderHealthRegistry::new(HealthConfig::default(), clock.clone()));
        let monitor =
            AlertMonitor::new(AlertConfig::default(), Arc::clone(&usage), health, clock.clone()).unwrap();
        (monitor, usage, clock)
    }

    fn record(usage: &RateLimitTracker, n: usize) {
        for _ in 0..n {
            usage.record_usage(P);
        }
    }

    #[test]
    fn test_config_validation() {
        assert!(AlertConfig::default().validate().is_ok());

        let inverted = AlertConfigUpdate {
            warning_threshold: Some(96.0),
            ..Default::default()
        }
        .apply_to(&AlertConfig::default());
        assert!(inverted.validate().is_err());

        let over = AlertConfig {
            critical_threshold: 120.0,
            ..AlertConfig::default()
        };
        assert!(over.validate().is_err());

        let zero = AlertConfig {
            check_interval: Duration::ZERO,
            ..AlertConfig::default()
        };
        assert!(zero.validate().is_err());
    }

    #[test]
    fn test_classify_boundaries() {
        let config = AlertConfig::default();
        assert_eq!(config.classify(79.9), None);
        assert_eq!(config.classify(80.0), Some(AlertLevel::Warning));
        assert_eq!(config.classify(94.9), Some(AlertLevel::Warning));
        assert_eq!(config.classify(95.0), Some(AlertLevel::Critical));
    }

    #[tokio::test]
    async fn test_warning_upgrade_and_clear() {
        let (monitor, usage, clock) = monitor();

        record(&usage, 82);
        monitor.check_now();
        let alerts = monitor.active_alerts();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].level, AlertLevel::Warning);
        let id = alerts[0].id;
        let created = alerts[0].created_at;

        record(&usage, 14);
        clock.advance(Duration::from_secs(5));
        let changes = monitor.check_now();
        assert!(matches!(
            changes.as_slice(),
            [AlertEvent::Updated {
                previous: AlertLevel::Warning,
                ..
            }]
        ));
        let alerts = monitor.active_alerts();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].level, AlertLevel::Critical);
        assert_eq!(alerts[0].id, id);
        assert_eq!(alerts[0].created_at, created);

        clock.advance(Duration::from_secs(60));
        record(&usage, 50);
        monitor.check_now();
        assert!(monitor.active_alerts().is_empty());
    }

    #[tokio::test]
    async fn test_repeated_check_is_idempotent() {
        let (monitor, usage, _) = monitor();
        record(&usage, 85);

        assert_eq!(monitor.check_now().len(), 1);
        assert!(monitor.check_now().is_empty());
        assert_eq!(monitor.active_alerts().len(), 1);
    }

    #[tokio::test]
    async fn test_dismiss_suppresses_until_escalation() {
        let (monitor, usage, _) = monitor();
        let mut rx = monitor.subscribe();
        record(&usage, 85);
        monitor.check_now();
        let id = monitor.active_alerts()[0].id;

        assert!(monitor.dismiss_alert(id));
        assert!(!monitor.dismiss_alert(id));
        monitor.check_now();
        assert!(monitor.active_alerts().is_empty());

        record(&usage, 12);
        monitor.check_now();
        let alerts = monitor.active_alerts();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].level, AlertLevel::Critical);
        assert_ne!(alerts[0].id, id);

        assert!(matches!(rx.recv().await.unwrap(), AlertEvent::Raised { .. }));
        assert!(matches!(rx.recv().await.unwrap(), AlertEvent::Dismissed { .. }));
        assert!(matches!(rx.recv().await.unwrap(), AlertEvent::Raised { .. }));
    }

    #[tokio::test]
    async fn test_update_config_rejects_invalid() {
        let (monitor, _, _) = monitor();
        let bad = AlertConfigUpdate {
            critical_threshold: Some(50.0),
            ..Default::default()
        };
        assert!(monitor.update_config(&bad).is_err());
        assert_eq!(monitor.config(), AlertConfig::default());

        let good = AlertConfigUpdate {
            warning_threshold: Some(70.0),
            ..Default::default()
        };
        assert_eq!(monitor.update_config(&good).unwrap().warning_threshold, 70.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scheduled_check_and_stop() {
        let (monitor, usage, _) = monitor();
        monitor
            .update_config(&AlertConfigUpdate {
                check_interval: Some(Duration::from_secs(10)),
                ..Default::default()
            })
            .unwrap();
        record(&usage, 90);

        assert!(monitor.start());
        assert!(!monitor.start());
        assert!(monitor.is_running());

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(monitor.active_alerts().len(), 1);

        monitor.stop();
        tokio::task::yield_now().await;
        assert!(!monitor.is_running());
    }
}
