//! Error taxonomy
//!
//! Upstream failures are classified exactly once, at the provider boundary
//! ([`crate::backend::ProviderError`]), and the class is carried unchanged
//! through the router to the caller together with a retryable flag.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::provider::ProviderId;
use crate::routing::cache::ComputationAborted;

/// Class of a failure
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Caller input malformed
    Validation,
    /// Provider credential rejected
    Authentication,
    /// Provider answered with a rate limit
    RateLimited,
    /// Attempt or dispatch exceeded its time budget
    Timeout,
    /// Transport failure or upstream 5xx
    Network,
    /// Anything the upstream boundary could not classify
    Unknown,
    /// Explicitly requested provider is not eligible
    ProviderUnavailable,
    /// Every candidate was exhausted or ineligible
    NoProvidersAvailable,
    /// Single-flight computation died before producing a result
    CacheComputationFailed,
}

impl ErrorClass {
    /// Whether the caller (or the router, for upstream classes) may retry
    #[must_use]
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::RateLimited
                | Self::Timeout
                | Self::Network
                | Self::Unknown
                | Self::NoProvidersAvailable
                | Self::CacheComputationFailed
        )
    }

    /// Stable snake_case name
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::Authentication => "authentication",
            Self::RateLimited => "rate_limited",
            Self::Timeout => "timeout",
            Self::Network => "network",
            Self::Unknown => "unknown",
            Self::ProviderUnavailable => "provider_unavailable",
            Self::NoProvidersAvailable => "no_providers_available",
            Self::CacheComputationFailed => "cache_computation_failed",
        }
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a single provider attempt within a dispatch
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AttemptOutcome {
    /// Upstream answered successfully
    Succeeded,
    /// Upstream call failed with the given class
    Failed {
        /// Class assigned by the client
        class: ErrorClass,
        /// Upstream detail
        message: String,
    },
    /// Candidate was dropped before calling upstream
    Skipped {
        /// Why the candidate was dropped
        reason: String,
    },
}

/// Record of one candidate considered during a dispatch
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    /// Provider considered
    pub provider: ProviderId,
    /// What happened
    #[serde(flatten)]
    pub outcome: AttemptOutcome,
    /// Upstream latency (zero for skipped candidates)
    pub latency_ms: u64,
}

impl AttemptRecord {
    /// Whether the attempt reached the upstream provider
    #[must_use]
    pub fn reached_upstream(&self) -> bool {
        !matches!(self.outcome, AttemptOutcome::Skipped { .. })
    }
}

/// Terminal error returned by a dispatch
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RouterError {
    /// Request failed validation; nothing was attempted
    #[error("invalid request: {0}")]
    Validation(String),

    /// Explicitly requested provider is ineligible
    #[error("requested provider {provider} is unavailable: {reason}")]
    ProviderUnavailable {
        /// The provider the caller asked for
        provider: ProviderId,
        /// Why it was not eligible
        reason: String,
    },

    /// Non-retryable upstream failure that aborted the dispatch
    #[error("provider {provider} failed ({class}): {message}")]
    Upstream {
        /// Provider that failed
        provider: ProviderId,
        /// Class of the failure
        class: ErrorClass,
        /// Upstream detail
        message: String,
    },

    /// All candidates were exhausted without success
    #[error("no healthy providers available ({} attempted)", .attempts.iter().filter(|a| a.reached_upstream()).count())]
    NoProvidersAvailable {
        /// Every candidate considered, in order
        attempts: Vec<AttemptRecord>,
    },

    /// The overall dispatch deadline passed
    #[error("dispatch timed out after {after_ms}ms")]
    Timeout {
        /// The deadline that elapsed
        after_ms: u64,
    },

    /// The shared computation for this fingerprint died
    #[error("cached computation failed: {0}")]
    CacheComputationFailed(String),
}

impl RouterError {
    /// Class carried by this error
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Validation(_) => ErrorClass::Validation,
            Self::ProviderUnavailable { .. } => ErrorClass::ProviderUnavailable,
            Self::Upstream { class, .. } => *class,
            Self::NoProvidersAvailable { .. } => ErrorClass::NoProvidersAvailable,
            Self::Timeout { .. } => ErrorClass::Timeout,
            Self::CacheComputationFailed(_) => ErrorClass::CacheComputationFailed,
        }
    }

    /// Whether the caller may retry later
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.class().is_retryable()
    }
}

impl From<ComputationAborted> for RouterError {
    fn from(e: ComputationAborted) -> Self {
        Self::CacheComputationFailed(e.reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classes() {
        assert!(ErrorClass::Timeout.is_retryable());
        assert!(ErrorClass::Network.is_retryable());
        assert!(ErrorClass::RateLimited.is_retryable());
        assert!(ErrorClass::Unknown.is_retryable());
        assert!(!ErrorClass::Validation.is_retryable());
        assert!(!ErrorClass::Authentication.is_retryable());
        assert!(!ErrorClass::ProviderUnavailable.is_retryable());
    }

    #[test]
    fn test_router_error_carries_class() {
        let err = RouterError::Upstream {
            provider: ProviderId::Anthropic,
            class: ErrorClass::Authentication,
            message: "invalid x-api-key".to_string(),
        };
        assert_eq!(err.class(), ErrorClass::Authentication);
        assert!(!err.is_retryable());

        let exhausted = RouterError::NoProvidersAvailable {
            attempts: vec![
                AttemptRecord {
                    provider: ProviderId::OpenAi,
                    outcome: AttemptOutcome::Failed {
                        class: ErrorClass::Timeout,
                        message: "timed out".to_string(),
                    },
                    latency_ms: 1000,
                },
                AttemptRecord {
                    provider: ProviderId::Gemini,
                    outcome: AttemptOutcome::Skipped {
                        reason: "budget exhausted".to_string(),
                    },
                    latency_ms: 0,
                },
            ],
        };
        assert!(exhausted.is_retryable());
        assert_eq!(
            exhausted.to_string(),
            "no healthy providers available (1 attempted)"
        );
    }

    #[test]
    fn test_class_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorClass::RateLimited).unwrap();
        assert_eq!(json, "\"rate_limited\"");
    }
}
