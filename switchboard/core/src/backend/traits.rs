//! Provider Client Traits
//!
//! The router talks to upstream vendors only through [`ProviderClient`].
//! Implementations own the wire format and are responsible for classifying
//! every failure into an [`ErrorClass`] exactly once.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::ErrorClass;
use crate::provider::ProviderId;
use crate::request::ChatMessage;

/// Normalized request handed to a provider
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProviderRequest {
    /// Conversation, system prompt first when present
    pub messages: Vec<ChatMessage>,
    /// Requested model (provider default when `None`)
    pub model: Option<String>,
    /// Sampling temperature
    pub temperature: Option<f32>,
    /// Completion token cap
    pub max_tokens: Option<u32>,
    /// Whether tools/function calling were requested
    pub function_calling: bool,
    /// Extra provider-agnostic parameters
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// Successful provider answer
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProviderReply {
    /// Completion text
    pub content: String,
    /// Model that produced it
    pub model: String,
    /// Tokens billed for the call
    pub tokens_used: u32,
    /// Upstream round-trip time as measured by the client
    pub latency: Duration,
}

/// Classified provider failure
#[derive(Clone, Debug, PartialEq, Error)]
#[error("{class}: {message}")]
pub struct ProviderError {
    /// Failure class, assigned here and never changed downstream
    pub class: ErrorClass,
    /// Human-readable detail
    pub message: String,
    /// HTTP status, when the failure came from a response
    pub status: Option<u16>,
}

impl ProviderError {
    /// Failure of the given class
    pub fn new(class: ErrorClass, message: impl Into<String>) -> Self {
        Self {
            class,
            message: message.into(),
            status: None,
        }
    }

    /// Attach the HTTP status
    #[must_use]
    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    /// Attempt ran past its deadline
    pub fn timeout(after: Duration) -> Self {
        Self::new(
            ErrorClass::Timeout,
            format!("no response within {}ms", after.as_millis()),
        )
    }

    /// Transport-level failure
    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Network, message)
    }

    /// Credential rejected
    pub fn authentication(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Authentication, message)
    }

    /// Upstream rate limit
    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::RateLimited, message)
    }

    /// Request rejected as malformed
    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Validation, message)
    }
}

/// Upstream provider transport
#[async_trait]
pub trait ProviderClient: Send + Sync {
    /// Call `provider` once; must return within roughly `timeout`
    async fn invoke(
        &self,
        provider: ProviderId,
        request: &ProviderRequest,
        timeout: Duration,
    ) -> Result<ProviderReply, ProviderError>;

    /// Whether this client can reach `provider` at all
    ///
    /// Providers reported as unconfigured are never selected, charged or
    /// counted against health.
    fn is_configured(&self, _provider: ProviderId) -> bool {
        true
    }

    /// Client name for logs
    fn name(&self) -> &'static str {
        "provider-client"
    }
}
