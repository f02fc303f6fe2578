//! Provider Health State Machine
//!
//! Hysteretic per-provider health derived from recent call outcomes.
//!
//! ```text
//!                 N consecutive failures
//!                 or low success rate
//! +---------+  ------------------------->  +----------+
//! | Healthy |                              | Degraded |
//! +---------+  <-------------------------  +----------+
//!    ^   |       K successes / cooldown         |
//!    |   |                                      | M further failures
//!    |   | authentication failure               v
//!    |   +-----------------------------> +-----------+
//!    |                                   |  Blocked  |
//!    +---------------------------------- +-----------+
//!       K successes / cooldown (probation)
//! ```
//!
//! Every transition is produced by [`ProviderHealth::apply`], a pure function
//! of the record, the event, the time and [`HealthConfig`]. Guards are named
//! methods so each rule can be tested in isolation. Consecutive counters
//! reset on every transition, so "M further failures" really means M more.
//!
//! A provider reopened by cooldown from `Blocked` is on probation: the next
//! failure blocks it again immediately (half-open probe).

use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::clock::{to_chrono, SharedClock};
use crate::config::ConfigError;
use crate::error::ErrorClass;
use crate::provider::{ProviderId, ProviderTable};
use crate::routing::events::{EventBus, RouterEvent};

// ============================================================================
// States, Events, Transitions
// ============================================================================

/// Health state of a provider
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    #[default]
    Healthy,
    Degraded,
    Blocked,
}

impl HealthState {
    /// Whether the router may dispatch to a provider in this state
    #[must_use]
    pub fn allows_requests(self) -> bool {
        !matches!(self, Self::Blocked)
    }
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Degraded => write!(f, "degraded"),
            Self::Blocked => write!(f, "blocked"),
        }
    }
}

/// Input to the state machine
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum HealthEvent {
    /// Upstream call succeeded
    Success { latency: Duration },
    /// Upstream call failed with a class
    Failure { class: ErrorClass },
    /// Time passed; evaluates cooldown guards only
    Tick,
}

/// Named guard that fired a transition
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionReason {
    ConsecutiveFailures,
    LowSuccessRate,
    AuthenticationFailure,
    ProbeFailed,
    ConsecutiveSuccesses,
    CooldownElapsed,
    Forced,
    Reset,
}

/// A state change of one provider
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HealthTransition {
    pub provider: ProviderId,
    pub from: HealthState,
    pub to: HealthState,
    pub reason: TransitionReason,
    pub at: DateTime<Utc>,
}

// ============================================================================
// Configuration
// ============================================================================

/// Thresholds for the health state machine
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HealthConfig {
    /// N: consecutive failures that degrade a healthy provider
    pub degrade_after_failures: u32,

    /// M: further consecutive failures that block a degraded provider
    pub block_after_failures: u32,

    /// K: consecutive successes that restore a degraded/blocked provider
    pub recover_after_successes: u32,

    /// Quiet time after the last failure before a provider reopens
    pub cooldown: Duration,

    /// Number of recent outcomes kept for the success-rate guard
    pub success_rate_window: usize,

    /// Outcomes required before the success-rate guard may fire
    pub min_samples: usize,

    /// Success rate (0.0 - 1.0) below which a healthy provider degrades
    pub min_success_rate: f64,

    /// Alpha for the latency exponential moving average (0.0 - 1.0)
    pub latency_ema_alpha: f64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            degrade_after_failures: 3,
            block_after_failures: 3,
            recover_after_successes: 3,
            cooldown: Duration::from_secs(60),
            success_rate_window: 20,
            min_samples: 10,
            min_success_rate: 0.5,
            latency_ema_alpha: 0.3,
        }
    }
}

impl HealthConfig {
    /// Reject thresholds that would make the machine degenerate
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.degrade_after_failures == 0
            || self.block_after_failures == 0
            || self.recover_after_successes == 0
        {
            return Err(ConfigError::ValidationError(
                "health thresholds must be at least 1".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.min_success_rate)
            || !(0.0..=1.0).contains(&self.latency_ema_alpha)
        {
            return Err(ConfigError::ValidationError(
                "health rates must be within 0.0..=1.0".to_string(),
            ));
        }
        if self.min_samples > self.success_rate_window {
            return Err(ConfigError::ValidationError(
                "health.min_samples cannot exceed success_rate_window".to_string(),
            ));
        }
        Ok(())
    }
}

// ============================================================================
// Per-Provider Record
// ============================================================================

/// Mutable health record of one provider
#[derive(Clone, Debug)]
pub struct ProviderHealth {
    state: HealthState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    last_success_at: Option<DateTime<Utc>>,
    last_failure_at: Option<DateTime<Utc>>,
    state_since: DateTime<Utc>,
    avg_latency_ms: Option<f64>,
    outcomes: VecDeque<bool>,
    total_successes: u64,
    total_failures: u64,
    last_error: Option<ErrorClass>,
    on_probation: bool,
}

impl ProviderHealth {
    /// Fresh healthy record
    #[must_use]
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            state: HealthState::Healthy,
            consecutive_failures: 0,
            consecutive_successes: 0,
            last_success_at: None,
            last_failure_at: None,
            state_since: now,
            avg_latency_ms: None,
            outcomes: VecDeque::new(),
            total_successes: 0,
            total_failures: 0,
            last_error: None,
            on_probation: false,
        }
    }

    /// Current state (without evaluating cooldown)
    #[must_use]
    pub fn state(&self) -> HealthState {
        self.state
    }

    /// Success rate over the rolling outcome window
    #[must_use]
    pub fn success_rate(&self) -> Option<f64> {
        if self.outcomes.is_empty() {
            return None;
        }
        let ok = self.outcomes.iter().filter(|o| **o).count();
        Some(ok as f64 / self.outcomes.len() as f64)
    }

    // ---- guards ------------------------------------------------------------

    fn consecutive_failures_reached(&self, threshold: u32) -> bool {
        self.consecutive_failures >= threshold
    }

    fn consecutive_successes_reached(&self, config: &HealthConfig) -> bool {
        self.consecutive_successes >= config.recover_after_successes
    }

    fn success_rate_too_low(&self, config: &HealthConfig) -> bool {
        self.outcomes.len() >= config.min_samples.max(1)
            && self
                .success_rate()
                .is_some_and(|rate| rate < config.min_success_rate)
    }

    fn cooldown_elapsed(&self, now: DateTime<Utc>, config: &HealthConfig) -> bool {
        let quiet_since = self.last_failure_at.unwrap_or(self.state_since);
        now >= quiet_since + to_chrono(config.cooldown)
    }

    // ---- transition function -----------------------------------------------

    /// Feed one event; returns `(from, to, reason)` when the state changed
    pub fn apply(
        &mut self,
        event: HealthEvent,
        now: DateTime<Utc>,
        config: &HealthConfig,
    ) -> Option<(HealthState, HealthState, TransitionReason)> {
        let next = match event {
            HealthEvent::Success { latency } => {
                self.observe_success(latency, now, config);
                self.after_success(config)
            }
            HealthEvent::Failure { class } => {
                self.observe_failure(class, now, config);
                self.after_failure(class, config)
            }
            HealthEvent::Tick => self.after_tick(now, config),
        };

        let (to, reason) = next?;
        let from = self.state;
        self.enter(to, reason, now);
        Some((from, to, reason))
    }

    fn after_success(&mut self, config: &HealthConfig) -> Option<(HealthState, TransitionReason)> {
        if !self.consecutive_successes_reached(config) {
            return None;
        }
        match self.state {
            HealthState::Healthy => {
                self.on_probation = false;
                None
            }
            HealthState::Degraded | HealthState::Blocked => {
                Some((HealthState::Healthy, TransitionReason::ConsecutiveSuccesses))
            }
        }
    }

    fn after_failure(
        &self,
        class: ErrorClass,
        config: &HealthConfig,
    ) -> Option<(HealthState, TransitionReason)> {
        if class == ErrorClass::Authentication && self.state != HealthState::Blocked {
            return Some((HealthState::Blocked, TransitionReason::AuthenticationFailure));
        }
        match self.state {
            HealthState::Healthy if self.on_probation => {
                Some((HealthState::Blocked, TransitionReason::ProbeFailed))
            }
            HealthState::Healthy
                if self.consecutive_failures_reached(config.degrade_after_failures) =>
            {
                Some((HealthState::Degraded, TransitionReason::ConsecutiveFailures))
            }
            HealthState::Healthy if self.success_rate_too_low(config) => {
                Some((HealthState::Degraded, TransitionReason::LowSuccessRate))
            }
            HealthState::Degraded
                if self.consecutive_failures_reached(config.block_after_failures) =>
            {
                Some((HealthState::Blocked, TransitionReason::ConsecutiveFailures))
            }
            _ => None,
        }
    }

    fn after_tick(
        &self,
        now: DateTime<Utc>,
        config: &HealthConfig,
    ) -> Option<(HealthState, TransitionReason)> {
        match self.state {
            HealthState::Healthy => None,
            HealthState::Degraded | HealthState::Blocked if self.cooldown_elapsed(now, config) => {
                Some((HealthState::Healthy, TransitionReason::CooldownElapsed))
            }
            _ => None,
        }
    }

    fn observe_success(&mut self, latency: Duration, now: DateTime<Utc>, config: &HealthConfig) {
        self.consecutive_successes = self.consecutive_successes.saturating_add(1);
        self.consecutive_failures = 0;
        self.total_successes += 1;
        self.last_success_at = Some(now);

        let sample = latency.as_secs_f64() * 1000.0;
        self.avg_latency_ms = Some(match self.avg_latency_ms {
            None => sample,
            Some(avg) => config.latency_ema_alpha * sample + (1.0 - config.latency_ema_alpha) * avg,
        });
        self.push_outcome(true, config);
    }

    fn observe_failure(&mut self, class: ErrorClass, now: DateTime<Utc>, config: &HealthConfig) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.consecutive_successes = 0;
        self.total_failures += 1;
        self.last_failure_at = Some(now);
        self.last_error = Some(class);
        self.push_outcome(false, config);
    }

    fn push_outcome(&mut self, ok: bool, config: &HealthConfig) {
        self.outcomes.push_back(ok);
        while self.outcomes.len() > config.success_rate_window.max(1) {
            self.outcomes.pop_front();
        }
    }

    fn enter(&mut self, to: HealthState, reason: TransitionReason, now: DateTime<Utc>) {
        self.on_probation = to == HealthState::Healthy
            && self.state == HealthState::Blocked
            && reason == TransitionReason::CooldownElapsed;
        self.state = to;
        self.state_since = now;
        self.consecutive_failures = 0;
        self.consecutive_successes = 0;
        self.outcomes.clear();
    }

    fn snapshot(&self, provider: ProviderId) -> HealthSnapshot {
        HealthSnapshot {
            provider,
            state: self.state,
            consecutive_failures: self.consecutive_failures,
            consecutive_successes: self.consecutive_successes,
            success_rate: self.success_rate(),
            avg_latency_ms: self.avg_latency_ms,
            last_success_at: self.last_success_at,
            last_failure_at: self.last_failure_at,
            state_since: self.state_since,
            total_successes: self.total_successes,
            total_failures: self.total_failures,
            last_error: self.last_error,
            on_probation: self.on_probation,
        }
    }
}

// ============================================================================
// Snapshot
// ============================================================================

/// Read-only view of a provider's health
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub provider: ProviderId,
    pub state: HealthState,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub success_rate: Option<f64>,
    pub avg_latency_ms: Option<f64>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub state_since: DateTime<Utc>,
    pub total_successes: u64,
    pub total_failures: u64,
    pub last_error: Option<ErrorClass>,
    pub on_probation: bool,
}

// ============================================================================
// Registry
// ============================================================================

/// Health records for every provider, one lock per record
///
/// Every transition, including a lazy cooldown reopen found by a read, is
/// published as [`RouterEvent::HealthChanged`] on the registry's bus.
#[derive(Debug)]
pub struct ProviderHealthRegistry {
    records: ProviderTable<Mutex<ProviderHealth>>,
    config: RwLock<HealthConfig>,
    clock: SharedClock,
    events: EventBus,
}

impl ProviderHealthRegistry {
    /// Registry with every provider healthy and a private event bus
    pub fn new(config: HealthConfig, clock: SharedClock) -> Self {
        Self::with_events(config, clock, EventBus::default())
    }

    /// Registry publishing transitions on `events`
    pub fn with_events(config: HealthConfig, clock: SharedClock, events: EventBus) -> Self {
        let now = clock.now();
        Self {
            records: ProviderTable::from_fn(|_| Mutex::new(ProviderHealth::new(now))),
            config: RwLock::new(config),
            clock,
            events,
        }
    }

    /// Bus carrying this registry's transitions
    #[must_use]
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    fn publish(&self, transition: Option<HealthTransition>) -> Option<HealthTransition> {
        if let Some(ref t) = transition {
            self.events.emit(RouterEvent::HealthChanged(t.clone()));
        }
        transition
    }

    fn drive(&self, provider: ProviderId, event: HealthEvent) -> Option<HealthTransition> {
        let now = self.clock.now();
        let config = self.config.read().clone();
        let changed = self.records[provider].lock().apply(event, now, &config);

        let transition = changed.map(|(from, to, reason)| {
            match to {
                HealthState::Healthy => tracing::info!(
                    provider = %provider, from = %from, reason = ?reason,
                    "Provider recovered"
                ),
                _ => tracing::warn!(
                    provider = %provider, from = %from, to = %to, reason = ?reason,
                    "Provider health downgraded"
                ),
            }
            HealthTransition {
                provider,
                from,
                to,
                reason,
                at: now,
            }
        });
        self.publish(transition)
    }

    /// Evaluate the cooldown guard and return the current state
    pub fn poll(&self, provider: ProviderId) -> (HealthState, Option<HealthTransition>) {
        let transition = self.drive(provider, HealthEvent::Tick);
        (self.records[provider].lock().state(), transition)
    }

    /// Current state, after the lazy cooldown check
    #[must_use]
    pub fn state(&self, provider: ProviderId) -> HealthState {
        self.poll(provider).0
    }

    /// Whether the router may dispatch to `provider`
    #[must_use]
    pub fn is_eligible(&self, provider: ProviderId) -> bool {
        self.state(provider).allows_requests()
    }

    /// Record a successful upstream call
    pub fn record_success(
        &self,
        provider: ProviderId,
        latency: Duration,
    ) -> Option<HealthTransition> {
        self.drive(provider, HealthEvent::Success { latency })
    }

    /// Record a failed upstream call
    ///
    /// Validation failures are caused by the caller's input and leave the
    /// provider's health untouched.
    pub fn record_failure(
        &self,
        provider: ProviderId,
        class: ErrorClass,
    ) -> Option<HealthTransition> {
        if class == ErrorClass::Validation {
            return None;
        }
        self.drive(provider, HealthEvent::Failure { class })
    }

    /// Average latency, if any success was recorded
    #[must_use]
    pub fn avg_latency(&self, provider: ProviderId) -> Option<f64> {
        self.records[provider].lock().avg_latency_ms
    }

    /// Snapshot of one provider
    #[must_use]
    pub fn snapshot(&self, provider: ProviderId) -> HealthSnapshot {
        self.drive(provider, HealthEvent::Tick);
        self.records[provider].lock().snapshot(provider)
    }

    /// Snapshot of every provider
    #[must_use]
    pub fn all_snapshots(&self) -> Vec<HealthSnapshot> {
        ProviderId::ALL.into_iter().map(|id| self.snapshot(id)).collect()
    }

    /// Admin override of the state
    pub fn force_state(&self, provider: ProviderId, to: HealthState) -> Option<HealthTransition> {
        let now = self.clock.now();
        let from = {
            let mut record = self.records[provider].lock();
            let from = record.state;
            if from == to {
                return None;
            }
            record.enter(to, TransitionReason::Forced, now);
            from
        };
        tracing::info!(provider = %provider, from = %from, to = %to, "Provider health forced");
        self.publish(Some(HealthTransition {
            provider,
            from,
            to,
            reason: TransitionReason::Forced,
            at: now,
        }))
    }

    /// Forget all history of a provider
    pub fn reset(&self, provider: ProviderId) -> Option<HealthTransition> {
        let now = self.clock.now();
        let from = {
            let mut record = self.records[provider].lock();
            std::mem::replace(&mut *record, ProviderHealth::new(now)).state
        };
        self.publish((from != HealthState::Healthy).then(|| HealthTransition {
            provider,
            from,
            to: HealthState::Healthy,
            reason: TransitionReason::Reset,
            at: now,
        }))
    }

    /// Current thresholds
    #[must_use]
    pub fn config(&self) -> HealthConfig {
        self.config.read().clone()
    }

    /// Replace thresholds; applies to subsequent events
    pub fn update_config(&self, config: HealthConfig) -> Result<(), ConfigError> {
        config.validate()?;
        *self.config.write() = config;
        Ok(())
    }
}
