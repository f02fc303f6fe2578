//! Routing Configuration
//!
//! Runtime configuration for dispatch timeouts, fallback policy and the
//! response cache. Health thresholds live next to the state machine in
//! [`super::health`]; alert thresholds in [`crate::alerts`].

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::health::HealthConfig;
use crate::config::ConfigError;

// ============================================================================
// Dispatch
// ============================================================================

/// Timeouts and fallback policy for a dispatch
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Upper bound for a single upstream attempt
    pub attempt_timeout: Duration,

    /// Overall dispatch budget when the request does not carry one
    pub default_timeout: Duration,

    /// Keep trying other candidates after an authentication failure
    pub failover_on_authentication: bool,

    /// Let other candidates follow an explicitly requested provider
    pub fallback_from_explicit: bool,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            attempt_timeout: Duration::from_secs(30),
            default_timeout: Duration::from_secs(90),
            failover_on_authentication: false,
            fallback_from_explicit: true,
        }
    }
}

// ============================================================================
// Cache
// ============================================================================

/// Response cache settings
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Whether dispatches consult the cache at all
    pub enabled: bool,

    /// Age after which an entry is treated as a miss
    pub ttl: Duration,

    /// Ready entries kept before the oldest is evicted
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl: Duration::from_secs(300),
            max_entries: 1024,
        }
    }
}

// ============================================================================
// Full Router Configuration
// ============================================================================

/// Complete router configuration
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Dispatch timeouts and fallback policy
    pub dispatch: DispatchConfig,

    /// Response cache
    pub cache: CacheConfig,

    /// Health state machine thresholds
    pub health: HealthConfig,
}

impl RouterConfig {
    /// Reject settings the router cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.dispatch.attempt_timeout.is_zero() || self.dispatch.default_timeout.is_zero() {
            return Err(ConfigError::ValidationError(
                "dispatch timeouts must be positive".to_string(),
            ));
        }
        if self.cache.max_entries == 0 {
            return Err(ConfigError::ValidationError(
                "cache.max_entries must be at least 1".to_string(),
            ));
        }
        self.health.validate()
    }
}
