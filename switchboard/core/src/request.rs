//! Caller-facing request model
//!
//! A [`ChatRequest`] is validated, normalized into a
//! [`ProviderRequest`](crate::backend::ProviderRequest) and fingerprinted for
//! the response cache. The fingerprint covers every field that can change the
//! output (messages, provider override, model and sampling preferences) and
//! nothing volatile (request/user/session ids, timeouts, cache flags).

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::backend::ProviderRequest;
use crate::error::RouterError;
use crate::provider::{Capabilities, ProviderId};

/// Upper bound accepted for `temperature`
pub const MAX_TEMPERATURE: f32 = 2.0;

// ============================================================================
// Messages
// ============================================================================

/// Author of a chat message
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Instructions ahead of the conversation
    System,
    /// The end user
    User,
    /// A previous model answer
    Assistant,
}

/// One turn of a conversation
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Who wrote the turn
    pub role: Role,
    /// Text of the turn
    pub content: String,
}

impl ChatMessage {
    /// User message
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    /// Assistant message
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }

    /// System message
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }
}

// ============================================================================
// Preferences
// ============================================================================

/// Optional preference bag attached to a request
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Preferences {
    /// Model name; the provider's default model is used when absent
    pub model: Option<String>,
    /// Sampling temperature (0.0 - 2.0)
    pub temperature: Option<f32>,
    /// Maximum completion tokens
    pub max_tokens: Option<u32>,
    /// System prompt prepended to the conversation
    pub system_prompt: Option<String>,
    /// Requires a provider with function calling
    pub function_calling: bool,
    /// Requires a provider with streaming
    pub stream: bool,
    /// Provider-agnostic extra parameters forwarded upstream
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl Preferences {
    /// First capability a provider lacks for these preferences, if any
    #[must_use]
    pub fn unmet_capability(&self, caps: &Capabilities) -> Option<String> {
        if self.function_calling && !caps.function_calling {
            return Some("function calling not supported".to_string());
        }
        if self.stream && !caps.streaming {
            return Some("streaming not supported".to_string());
        }
        match self.max_tokens {
            Some(requested) if requested > caps.max_tokens => Some(format!(
                "max_tokens {requested} exceeds provider limit {}",
                caps.max_tokens
            )),
            _ => None,
        }
    }
}

// ============================================================================
// Chat Request
// ============================================================================

fn new_request_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn default_true() -> bool {
    true
}

/// A single logical chat/completion request
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChatRequest {
    /// Caller-visible id, excluded from the fingerprint
    #[serde(default = "new_request_id")]
    pub request_id: String,
    /// Conversation to complete
    pub messages: Vec<ChatMessage>,
    /// Explicit provider override
    #[serde(default)]
    pub provider: Option<ProviderId>,
    /// Output-affecting preferences
    #[serde(default)]
    pub preferences: Preferences,
    /// End user, excluded from the fingerprint
    #[serde(default)]
    pub user_id: Option<String>,
    /// Session, excluded from the fingerprint
    #[serde(default)]
    pub session_id: Option<String>,
    /// Overall dispatch timeout in milliseconds
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Whether the response cache may be used
    #[serde(default = "default_true")]
    pub use_cache: bool,
}

impl ChatRequest {
    /// Request for the given conversation
    #[must_use]
    pub fn new(messages: Vec<ChatMessage>) -> Self {
        Self {
            request_id: new_request_id(),
            messages,
            provider: None,
            preferences: Preferences::default(),
            user_id: None,
            session_id: None,
            timeout_ms: None,
            use_cache: true,
        }
    }

    /// Single-turn user prompt
    #[must_use]
    pub fn user(prompt: impl Into<String>) -> Self {
        Self::new(vec![ChatMessage::user(prompt)])
    }

    /// Pin the request to one provider
    #[must_use]
    pub fn with_provider(mut self, provider: ProviderId) -> Self {
        self.provider = Some(provider);
        self
    }

    /// Set the model
    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.preferences.model = Some(model.into());
        self
    }

    /// Set the sampling temperature
    #[must_use]
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.preferences.temperature = Some(temperature);
        self
    }

    /// Set the completion token cap
    #[must_use]
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.preferences.max_tokens = Some(max_tokens);
        self
    }

    /// Set a system prompt
    #[must_use]
    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.preferences.system_prompt = Some(prompt.into());
        self
    }

    /// Require function calling support
    #[must_use]
    pub fn with_function_calling(mut self) -> Self {
        self.preferences.function_calling = true;
        self
    }

    /// Set the overall dispatch timeout
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX));
        self
    }

    /// Attach user and session identifiers
    #[must_use]
    pub fn with_identity(mut self, user_id: impl Into<String>, session_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self.session_id = Some(session_id.into());
        self
    }

    /// Skip the response cache for this request
    #[must_use]
    pub fn without_cache(mut self) -> Self {
        self.use_cache = false;
        self
    }

    /// Overall timeout, if the caller set one
    #[must_use]
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    /// Check caller input; failures are never retried
    pub fn validate(&self) -> Result<(), RouterError> {
        if self.messages.is_empty() {
            return Err(RouterError::Validation(
                "request has no messages".to_string(),
            ));
        }
        if let Some(i) = self.messages.iter().position(|m| m.content.trim().is_empty()) {
            return Err(RouterError::Validation(format!("message {i} is empty")));
        }
        if let Some(t) = self.preferences.temperature {
            if !t.is_finite() || !(0.0..=MAX_TEMPERATURE).contains(&t) {
                return Err(RouterError::Validation(format!(
                    "temperature {t} outside 0.0..={MAX_TEMPERATURE}"
                )));
            }
        }
        if self.preferences.max_tokens == Some(0) {
            return Err(RouterError::Validation(
                "max_tokens must be positive".to_string(),
            ));
        }
        if self.timeout_ms == Some(0) {
            return Err(RouterError::Validation(
                "timeout must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Provider-facing form: trimmed content, system prompt folded in
    #[must_use]
    pub fn normalized(&self) -> ProviderRequest {
        let mut messages = Vec::with_capacity(self.messages.len() + 1);
        if let Some(ref prompt) = self.preferences.system_prompt {
            let prompt = prompt.trim();
            if !prompt.is_empty() {
                messages.push(ChatMessage::system(prompt));
            }
        }
        messages.extend(self.messages.iter().map(|m| ChatMessage {
            role: m.role,
            content: m.content.trim().to_string(),
        }));

        ProviderRequest {
            messages,
            model: self.preferences.model.clone(),
            temperature: self.preferences.temperature,
            max_tokens: self.preferences.max_tokens,
            function_calling: self.preferences.function_calling,
            extra: self.preferences.extra.clone(),
        }
    }

    /// Cache key for this request
    #[must_use]
    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::of(self.provider, &self.normalized())
    }
}

// ============================================================================
// Fingerprint
// ============================================================================

/// SHA-256 over the canonical JSON form of the normalized request
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Fingerprint(String);

#[derive(Serialize)]
struct FingerprintInput<'a> {
    provider: Option<ProviderId>,
    messages: &'a [ChatMessage],
    model: Option<&'a str>,
    temperature: Option<f32>,
    max_tokens: Option<u32>,
    function_calling: bool,
    extra: serde_json::Value,
}

impl Fingerprint {
    /// Fingerprint a normalized request under an optional provider override
    #[must_use]
    pub fn of(provider: Option<ProviderId>, request: &ProviderRequest) -> Self {
        let extra = canonicalize(serde_json::to_value(&request.extra).unwrap_or_default());
        let input = FingerprintInput {
            provider,
            messages: &request.messages,
            model: request.model.as_deref(),
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            function_calling: request.function_calling,
            extra,
        };
        // Serializing plain structs, strings and numbers cannot fail.
        let bytes = serde_json::to_vec(&input).unwrap_or_default();
        Self(hex::encode(Sha256::digest(&bytes)))
    }

    /// Hex digest
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0[..12.min(self.0.len())])
    }
}

/// Sort object keys recursively so equal values hash equally
fn canonicalize(value: serde_json::Value) -> serde_json::Value {
    use serde_json::Value;
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<String, Value> =
                map.into_iter().map(|(k, v)| (k, canonicalize(v))).collect();
            Value::Object(sorted.into_iter().collect())
        }
        Value::Array(items) => Value::Array(items.into_iter().map(canonicalize).collect()),
        other => other,
    }
}
