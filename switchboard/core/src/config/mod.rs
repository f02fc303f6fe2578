//! TOML Configuration File Support
//!
//! Centralized configuration loading for the router, from a TOML file at
//! `~/.config/switchboard/router.toml`.
//!
//! # Configuration Priority
//!
//! Configuration values are loaded with the following priority (highest first):
//! 1. CLI arguments (when applicable)
//! 2. Environment variables
//! 3. TOML configuration file
//! 4. Default values
//!
//! # XDG Base Directory Compliance
//!
//! - `$XDG_CONFIG_HOME/switchboard/router.toml` (typically `~/.config/switchboard/router.toml`)
//!
//! # Example Configuration
//!
//! ```toml
//! [dispatch]
//! attempt_timeout_ms = 20000
//! default_timeout_ms = 60000
//! failover_on_authentication = false
//!
//! [cache]
//! enabled = true
//! ttl_secs = 600
//!
//! [health]
//! degrade_after_failures = 3
//! cooldown_secs = 120
//!
//! [alerts]
//! warning_threshold = 75.0
//! critical_threshold = 90.0
//!
//! [providers.groq]
//! priority = 1
//! requests_per_minute = 30
//! requests_per_day = 0      # 0 = unlimited
//!
//! [providers.deepseek]
//! enabled = false
//! ```

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::alerts::{AlertConfig, AlertConfigUpdate};
use crate::backend::ProviderEndpoint;
use crate::provider::{ProviderCatalog, ProviderId, ProviderProfile, ProviderTable};
use crate::routing::config::RouterConfig;
use crate::routing::health::HealthConfig;

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur when loading or applying configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file at {path}: {source}")]
    ReadError {
        /// The path that was attempted
        path: PathBuf,
        /// The underlying IO error
        source: std::io::Error,
    },

    /// Failed to parse TOML
    #[error("Failed to parse TOML config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

// =============================================================================
// Configuration Source Tracking
// =============================================================================

/// Tracks where a configuration value came from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigSource {
    /// Value from command-line argument
    Cli,
    /// Value from environment variable
    Env,
    /// Value from TOML configuration file
    File,
    /// Default value
    Default,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cli => write!(f, "CLI"),
            Self::Env => write!(f, "environment"),
            Self::File => write!(f, "config file"),
            Self::Default => write!(f, "default"),
        }
    }
}

// =============================================================================
// TOML Configuration Structures
// =============================================================================

/// Dispatch section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchToml {
    /// Upper bound for one upstream attempt in milliseconds
    pub attempt_timeout_ms: Option<u64>,

    /// Overall dispatch budget in milliseconds
    pub default_timeout_ms: Option<u64>,

    /// Try other providers after an authentication failure
    pub failover_on_authentication: Option<bool>,

    /// Let other providers follow an explicitly requested one
    pub fallback_from_explicit: Option<bool>,
}

/// Cache section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheToml {
    /// Serve repeated requests from the cache
    pub enabled: Option<bool>,
    /// Lifetime of a stored response
    pub ttl_secs: Option<u64>,
    /// Entries kept before the oldest are evicted
    pub max_entries: Option<usize>,
}

/// Health section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthToml {
    /// Consecutive failures before Healthy becomes Degraded
    pub degrade_after_failures: Option<u32>,
    /// Consecutive failures before Degraded becomes Blocked
    pub block_after_failures: Option<u32>,
    /// Consecutive successes needed to recover
    pub recover_after_successes: Option<u32>,
    /// Time a blocked provider waits before probation
    pub cooldown_secs: Option<u64>,
    /// Outcomes kept for the success rate
    pub success_rate_window: Option<usize>,
    /// Outcomes required before the success rate counts
    pub min_samples: Option<usize>,
    /// Success rate below which a provider degrades
    pub min_success_rate: Option<f64>,
    /// Weight of the newest latency sample
    pub latency_ema_alpha: Option<f64>,
}

/// Alerts section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertsToml {
    /// Run the scheduled alert check
    pub enabled: Option<bool>,
    /// Period of the scheduled check
    pub check_interval_secs: Option<u64>,
    /// Usage percentage raising a warning
    pub warning_threshold: Option<f64>,
    /// Usage percentage raising a critical alert
    pub critical_threshold: Option<f64>,
}

/// Per-provider section (`[providers.<name>]`)
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderToml {
    /// Whether the provider may be selected
    pub enabled: Option<bool>,
    /// Lower is tried first
    pub priority: Option<u32>,

    /// Requests per minute (0 = unlimited)
    pub requests_per_minute: Option<u32>,

    /// Requests per day (0 = unlimited)
    pub requests_per_day: Option<u32>,

    /// Endpoint root
    pub base_url: Option<String>,
    /// Environment variable holding the API key
    pub api_key_env: Option<String>,
    /// Model used when a request names none
    pub default_model: Option<String>,
}

/// Top-level TOML configuration structure
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SwitchboardToml {
    /// `[dispatch]`
    pub dispatch: DispatchToml,
    /// `[cache]`
    pub cache: CacheToml,
    /// `[health]`
    pub health: HealthToml,
    /// `[alerts]`
    pub alerts: AlertsToml,
    /// `[providers.<name>]`, keyed by provider name
    pub providers: BTreeMap<String, ProviderToml>,
}

// =============================================================================
// Main Configuration Struct
// =============================================================================

/// Centralized configuration for the router and its daemon
///
/// Use [`load_config`] to load configuration with proper priority handling.
#[derive(Clone, Debug)]
pub struct SwitchboardConfig {
    /// Dispatch, cache and health settings
    pub router: RouterConfig,

    /// Alert thresholds and schedule
    pub alerts: AlertConfig,

    /// Provider profiles the catalog starts from
    pub profiles: ProviderTable<ProviderProfile>,

    /// Upstream connection settings
    pub endpoints: ProviderTable<ProviderEndpoint>,

    /// Path to the config file that was loaded (if any)
    pub config_file_path: Option<PathBuf>,

    source: ConfigSource,
}

impl Default for SwitchboardConfig {
    fn default() -> Self {
        let profiles = ProviderTable::from_fn(ProviderProfile::builtin);
        let endpoints = ProviderTable::from_fn(|id| {
            ProviderEndpoint::default_for(id, profiles.get(id).default_model.clone())
        });
        Self {
            router: RouterConfig::default(),
            alerts: AlertConfig::default(),
            profiles,
            endpoints,
            config_file_path: None,
            source: ConfigSource::Default,
        }
    }
}

impl SwitchboardConfig {
    /// Create a new configuration with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the primary source of this configuration
    #[must_use]
    pub fn source(&self) -> ConfigSource {
        self.source
    }

    /// Set the configuration source
    pub fn set_source(&mut self, source: ConfigSource) {
        self.source = source;
    }

    /// Catalog seeded with the configured profiles
    #[must_use]
    pub fn catalog(&self) -> ProviderCatalog {
        ProviderCatalog::from_profiles(self.profiles.clone())
    }

    /// Check every section
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.router.validate()?;
        self.alerts.validate()?;
        for (id, endpoint) in self.endpoints.iter() {
            if endpoint.base_url.trim().is_empty() {
                return Err(ConfigError::ValidationError(format!(
                    "providers.{id}.base_url must not be empty"
                )));
            }
        }
        Ok(())
    }
}

// =============================================================================
// Runtime Updates
// =============================================================================

/// Partial runtime update of router and alert settings
///
/// `None` fields keep their current value. The merged result is validated
/// as a whole before anything is applied.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigUpdate {
    /// Per-attempt upstream timeout
    pub attempt_timeout: Option<Duration>,
    /// Overall deadline for requests that set none
    pub default_timeout: Option<Duration>,
    /// Try the next provider after an authentication failure
    pub failover_on_authentication: Option<bool>,
    /// Let other providers follow an explicitly requested one
    pub fallback_from_explicit: Option<bool>,
    /// Serve repeated requests from the cache
    pub cache_enabled: Option<bool>,
    /// Lifetime of a stored response
    pub cache_ttl: Option<Duration>,
    /// Entries kept before the oldest are evicted
    pub cache_max_entries: Option<usize>,
    /// Replacement health thresholds
    pub health: Option<HealthConfig>,
    /// Alert threshold changes
    pub alerts: Option<AlertConfigUpdate>,
}

impl ConfigUpdate {
    /// Update that replaces every runtime setting with `config`'s
    #[must_use]
    pub fn from_config(config: &SwitchboardConfig) -> Self {
        let router = &config.router;
        Self {
            attempt_timeout: Some(router.dispatch.attempt_timeout),
            default_timeout: Some(router.dispatch.default_timeout),
            failover_on_authentication: Some(router.dispatch.failover_on_authentication),
            fallback_from_explicit: Some(router.dispatch.fallback_from_explicit),
            cache_enabled: Some(router.cache.enabled),
            cache_ttl: Some(router.cache.ttl),
            cache_max_entries: Some(router.cache.max_entries),
            health: Some(router.health.clone()),
            alerts: Some(AlertConfigUpdate {
                enabled: Some(config.alerts.enabled),
                check_interval: Some(config.alerts.check_interval),
                warning_threshold: Some(config.alerts.warning_threshold),
                critical_threshold: Some(config.alerts.critical_threshold),
            }),
        }
    }

    /// `base` with the router fields of this update applied
    #[must_use]
    pub fn apply_to_router(&self, base: &RouterConfig) -> RouterConfig {
        let mut next = base.clone();
        if let Some(t) = self.attempt_timeout {
            next.dispatch.attempt_timeout = t;
        }
        if let Some(t) = self.default_timeout {
            next.dispatch.default_timeout = t;
        }
        if let Some(v) = self.failover_on_authentication {
            next.dispatch.failover_on_authentication = v;
        }
        if let Some(v) = self.fallback_from_explicit {
            next.dispatch.fallback_from_explicit = v;
        }
        if let Some(v) = self.cache_enabled {
            next.cache.enabled = v;
        }
        if let Some(ttl) = self.cache_ttl {
            next.cache.ttl = ttl;
        }
        if let Some(n) = self.cache_max_entries {
            next.cache.max_entries = n;
        }
        if let Some(ref health) = self.health {
            next.health = health.clone();
        }
        next
    }
}

// =============================================================================
// Configuration Loading
// =============================================================================

/// Get the default configuration file path
///
/// Returns `$XDG_CONFIG_HOME/switchboard/router.toml` or
/// `~/.config/switchboard/router.toml` if `XDG_CONFIG_HOME` is not set.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("switchboard").join("router.toml"))
}

/// Load configuration from all sources with proper priority
///
/// # Errors
///
/// Returns an error if the config file exists but cannot be parsed, or the
/// merged configuration is invalid. A missing config file is not an error.
pub fn load_config() -> Result<SwitchboardConfig, ConfigError> {
    load_config_from_path(default_config_path())
}

/// Load configuration from a specific path
///
/// # Errors
///
/// Returns an error if the specified config file cannot be read or parsed,
/// names an unknown provider, or yields an invalid configuration.
pub fn load_config_from_path(path: Option<PathBuf>) -> Result<SwitchboardConfig, ConfigError> {
    let mut config = SwitchboardConfig::default();

    if let Some(ref config_path) = path {
        if config_path.exists() {
            let toml_content =
                std::fs::read_to_string(config_path).map_err(|e| ConfigError::ReadError {
                    path: config_path.clone(),
                    source: e,
                })?;

            let toml_config: SwitchboardToml = toml::from_str(&toml_content)?;
            apply_toml_config(&mut config, &toml_config)?;
            config.config_file_path = Some(config_path.clone());
            config.source = ConfigSource::File;

            tracing::info!(
                path = %config_path.display(),
                "Loaded configuration from file"
            );
        } else {
            tracing::debug!(
                path = %config_path.display(),
                "Config file not found, using defaults"
            );
        }
    }

    apply_env_config(&mut config);
    config.validate()?;

    Ok(config)
}

fn limit(value: u32) -> Option<u32> {
    (value > 0).then_some(value)
}

/// Apply TOML configuration values to the config struct
fn apply_toml_config(config: &mut SwitchboardConfig, toml: &SwitchboardToml) -> Result<(), ConfigError> {
    // Dispatch settings
    let dispatch = &mut config.router.dispatch;
    if let Some(ms) = toml.dispatch.attempt_timeout_ms {
        dispatch.attempt_timeout = Duration::from_millis(ms);
    }
    if let Some(ms) = toml.dispatch.default_timeout_ms {
        dispatch.default_timeout = Duration::from_millis(ms);
    }
    if let Some(v) = toml.dispatch.failover_on_authentication {
        dispatch.failover_on_authentication = v;
    }
    if let Some(v) = toml.dispatch.fallback_from_explicit {
        dispatch.fallback_from_explicit = v;
    }

    // Cache settings
    let cache = &mut config.router.cache;
    if let Some(v) = toml.cache.enabled {
        cache.enabled = v;
    }
    if let Some(secs) = toml.cache.ttl_secs {
        cache.ttl = Duration::from_secs(secs);
    }
    if let Some(n) = toml.cache.max_entries {
        cache.max_entries = n;
    }

    // Health settings
    let health = &mut config.router.health;
    if let Some(n) = toml.health.degrade_after_failures {
        health.degrade_after_failures = n;
    }
    if let Some(n) = toml.health.block_after_failures {
        health.block_after_failures = n;
    }
    if let Some(n) = toml.health.recover_after_successes {
        health.recover_after_successes = n;
    }
    if let Some(secs) = toml.health.cooldown_secs {
        health.cooldown = Duration::from_secs(secs);
    }
    if let Some(n) = toml.health.success_rate_window {
        health.success_rate_window = n;
    }
    if let Some(n) = toml.health.min_samples {
        health.min_samples = n;
    }
    if let Some(rate) = toml.health.min_success_rate {
        health.min_success_rate = rate;
    }
    if let Some(alpha) = toml.health.latency_ema_alpha {
        health.latency_ema_alpha = alpha;
    }

    // Alert settings
    if let Some(v) = toml.alerts.enabled {
        config.alerts.enabled = v;
    }
    if let Some(secs) = toml.alerts.check_interval_secs {
        config.alerts.check_interval = Duration::from_secs(secs);
    }
    if let Some(w) = toml.alerts.warning_threshold {
        config.alerts.warning_threshold = w;
    }
    if let Some(c) = toml.alerts.critical_threshold {
        config.alerts.critical_threshold = c;
    }

    // Provider sections
    for (name, section) in &toml.providers {
        let id: ProviderId = name
            .parse()
            .map_err(|e| ConfigError::ValidationError(format!("[providers.{name}]: {e}")))?;

        let profile = config.profiles.get_mut(id);
        if let Some(v) = section.enabled {
            profile.enabled = v;
        }
        if let Some(p) = section.priority {
            profile.priority = p;
        }
        if let Some(n) = section.requests_per_minute {
            profile.quota.requests_per_minute = limit(n);
        }
        if let Some(n) = section.requests_per_day {
            profile.quota.requests_per_day = limit(n);
        }
        if let Some(ref model) = section.default_model {
            profile.default_model = model.clone();
        }

        let endpoint = config.endpoints.get_mut(id);
        endpoint.default_model = profile.default_model.clone();
        if let Some(ref url) = section.base_url {
            endpoint.base_url = url.clone();
        }
        if let Some(ref var) = section.api_key_env {
            endpoint.api_key_env = var.clone();
        }
    }

    Ok(())
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(var = name, value = %raw, "Ignoring unparsable environment override");
            None
        }
    }
}

/// Apply environment variable overrides to the config
fn apply_env_config(config: &mut SwitchboardConfig) {
    // Dispatch settings from environment
    if let Some(ms) = env_parse::<u64>("SWITCHBOARD_ATTEMPT_TIMEOUT_MS") {
        config.router.dispatch.attempt_timeout = Duration::from_millis(ms);
        config.source = ConfigSource::Env;
    }
    if let Some(ms) = env_parse::<u64>("SWITCHBOARD_DISPATCH_TIMEOUT_MS") {
        config.router.dispatch.default_timeout = Duration::from_millis(ms);
        config.source = ConfigSource::Env;
    }

    // Cache settings from environment
    if let Ok(enabled) = std::env::var("SWITCHBOARD_CACHE") {
        config.router.cache.enabled = enabled != "0" && enabled.to_lowercase() != "false";
        config.source = ConfigSource::Env;
    }
    if let Some(secs) = env_parse::<u64>("SWITCHBOARD_CACHE_TTL_SECS") {
        config.router.cache.ttl = Duration::from_secs(secs);
        config.source = ConfigSource::Env;
    }

    // Alert settings from environment
    if let Some(w) = env_parse::<f64>("SWITCHBOARD_ALERT_WARNING") {
        config.alerts.warning_threshold = w;
        config.source = ConfigSource::Env;
    }
    if let Some(c) = env_parse::<f64>("SWITCHBOARD_ALERT_CRITICAL") {
        config.alerts.critical_threshold = c;
        config.source = ConfigSource::Env;
    }
    if let Some(secs) = env_parse::<u64>("SWITCHBOARD_ALERT_INTERVAL_SECS") {
        config.alerts.check_interval = Duration::from_secs(secs);
        config.source = ConfigSource::Env;
    }

    // Comma-separated provider names to disable
    if let Ok(list) = std::env::var("SWITCHBOARD_DISABLED_PROVIDERS") {
        for name in list.split(',').map(str::trim).filter(|n| !n.is_empty()) {
            match name.parse::<ProviderId>() {
                Ok(id) => config.profiles.get_mut(id).enabled = false,
                Err(e) => tracing::warn!(error = %e, "Ignoring unknown provider in SWITCHBOARD_DISABLED_PROVIDERS"),
            }
        }
        config.source = ConfigSource::Env;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::Quota;
    use pretty_assertions::assert_eq;
    use std::io::Write;
    use tempfile::NamedTempFile;

    /// Clean up all environment variables used by config loading.
    fn clear_config_env_vars() {
        std::env::remove_var("SWITCHBOARD_ATTEMPT_TIMEOUT_MS");
        std::env::remove_var("SWITCHBOARD_DISPATCH_TIMEOUT_MS");
        std::env::remove_var("SWITCHBOARD_CACHE");
        std::env::remove_var("SWITCHBOARD_CACHE_TTL_SECS");
        std::env::remove_var("SWITCHBOARD_ALERT_WARNING");
        std::env::remove_var("SWITCHBOARD_ALERT_CRITICAL");
        std::env::remove_var("SWITCHBOARD_ALERT_INTERVAL_SECS");
        std::env::remove_var("SWITCHBOARD_DISABLED_PROVIDERS");
    }

    fn write_toml(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_default_config() {
        let config = SwitchboardConfig::default();
        assert_eq!(config.router, RouterConfig::default());
        assert_eq!(config.alerts, AlertConfig::default());
        assert_eq!(config.source(), ConfigSource::Default);
        assert!(config.validate().is_ok());
        assert_eq!(
            config.endpoints.get(ProviderId::Groq).api_key_env,
            "GROQ_API_KEY"
        );
    }

    #[test]
    fn test_default_config_path() {
        if let Some(p) = default_config_path() {
            assert!(p.to_string_lossy().contains("switchboard"));
            assert!(p.to_string_lossy().ends_with("router.toml"));
        }
    }

    #[test]
    fn test_parse_valid_toml() {
        let file = write_toml(
            r#"
[dispatch]
attempt_timeout_ms = 5000
failover_on_authentication = true

[cache]
ttl_secs = 30
max_entries = 64

[health]
degrade_after_failures = 5
cooldown_secs = 10

[alerts]
warning_threshold = 70.0
critical_threshold = 90.0

[providers.groq]
priority = 1
requests_per_minute = 30
requests_per_day = 0
base_url = "http://localhost:9000/v1"

[providers.deepseek]
enabled = false
"#,
        );

        let config = load_config_from_path(Some(file.path().to_path_buf())).unwrap();

        assert_eq!(config.router.dispatch.attempt_timeout, Duration::from_millis(5000));
        assert!(config.router.dispatch.failover_on_authentication);
        assert_eq!(config.router.cache.ttl, Duration::from_secs(30));
        assert_eq!(config.router.cache.max_entries, 64);
        assert_eq!(config.router.health.degrade_after_failures, 5);
        assert_eq!(config.router.health.cooldown, Duration::from_secs(10));
        assert_eq!(config.alerts.warning_threshold, 70.0);

        let groq = config.profiles.get(ProviderId::Groq);
        assert_eq!(groq.priority, 1);
        assert_eq!(
            groq.quota,
            Quota {
                requests_per_minute: Some(30),
                requests_per_day: None,
            }
        );
        assert_eq!(
            config.endpoints.get(ProviderId::Groq).base_url,
            "http://localhost:9000/v1"
        );
        assert!(!config.profiles.get(ProviderId::DeepSeek).enabled);
        assert_eq!(config.source(), ConfigSource::File);
    }

    #[test]
    fn test_parse_partial_toml_keeps_defaults() {
        let file = write_toml("[cache]\nenabled = false\n");
        let config = load_config_from_path(Some(file.path().to_path_buf())).unwrap();

        assert!(!config.router.cache.enabled);
        assert_eq!(config.router.dispatch, RouterConfig::default().dispatch);
        assert_eq!(
            config.profiles.get(ProviderId::OpenAi),
            &ProviderProfile::builtin(ProviderId::OpenAi)
        );
    }

    #[test]
    fn test_unknown_provider_rejected() {
        let file = write_toml("[providers.cohere]\npriority = 1\n");
        let err = load_config_from_path(Some(file.path().to_path_buf())).unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(ref m) if m.contains("cohere")));
    }

    #[test]
    fn test_invalid_thresholds_rejected() {
        let file = write_toml("[alerts]\nwarning_threshold = 99.0\n");
        let err = load_config_from_path(Some(file.path().to_path_buf())).unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(_)));
    }

    #[test]
    fn test_parse_invalid_toml() {
        let file = write_toml("[dispatch\nattempt_timeout_ms = ");
        let err = load_config_from_path(Some(file.path().to_path_buf())).unwrap_err();
        assert!(matches!(err, ConfigError::ParseError(_)));
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let config =
            load_config_from_path(Some(PathBuf::from("/nonexistent/switchboard/router.toml")))
                .unwrap();
        assert!(config.config_file_path.is_none());
    }

    #[test]
    fn test_env_overrides_file() {
        clear_config_env_vars();
        let file = write_toml("[alerts]\ncheck_interval_secs = 30\n");

        std::env::set_var("SWITCHBOARD_ALERT_INTERVAL_SECS", "90");
        std::env::set_var("SWITCHBOARD_DISABLED_PROVIDERS", "mistral, bogus");
        let config = load_config_from_path(Some(file.path().to_path_buf())).unwrap();
        clear_config_env_vars();

        assert_eq!(config.alerts.check_interval, Duration::from_secs(90));
        assert!(!config.profiles.get(ProviderId::Mistral).enabled);
        assert_eq!(config.source(), ConfigSource::Env);
    }

    #[test]
    fn test_config_update_merges() {
        let update = ConfigUpdate {
            attempt_timeout: Some(Duration::from_secs(3)),
            cache_enabled: Some(false),
            ..Default::default()
        };
        let next = update.apply_to_router(&RouterConfig::default());
        assert_eq!(next.dispatch.attempt_timeout, Duration::from_secs(3));
        assert!(!next.cache.enabled);
        assert_eq!(next.health, HealthConfig::default());
    }
}
