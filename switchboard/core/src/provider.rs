//! Provider Catalog
//!
//! The closed set of upstream AI vendors the router can dispatch to, their
//! static profiles (priority tier, quota, capabilities) and the fixed
//! per-provider table that backs all mutable per-provider state.
//!
//! Profiles are immutable for the life of the process except through an
//! explicit admin override ([`ProviderCatalog::apply_override`]).

use std::fmt;
use std::ops::Index;
use std::str::FromStr;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ============================================================================
// Provider Identity
// ============================================================================

/// Identifier of a known upstream provider
///
/// Declaration order is the final tie-break when ranking candidates.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderId {
    /// OpenAI chat completions
    OpenAi,
    /// Anthropic messages
    Anthropic,
    /// Google Gemini
    Gemini,
    /// Mistral AI
    Mistral,
    /// Groq
    Groq,
    /// DeepSeek
    DeepSeek,
}

impl ProviderId {
    /// Number of known providers
    pub const COUNT: usize = 6;

    /// Every provider, in declaration order
    pub const ALL: [ProviderId; Self::COUNT] = [
        ProviderId::OpenAi,
        ProviderId::Anthropic,
        ProviderId::Gemini,
        ProviderId::Mistral,
        ProviderId::Groq,
        ProviderId::DeepSeek,
    ];

    /// Position in [`ProviderId::ALL`]
    #[must_use]
    pub fn index(self) -> usize {
        self as usize
    }

    /// Stable lowercase name
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::Anthropic => "anthropic",
            Self::Gemini => "gemini",
            Self::Mistral => "mistral",
            Self::Groq => "groq",
            Self::DeepSeek => "deepseek",
        }
    }

    /// Human-readable vendor name
    #[must_use]
    pub fn display_name(self) -> &'static str {
        match self {
            Self::OpenAi => "OpenAI",
            Self::Anthropic => "Anthropic",
            Self::Gemini => "Google Gemini",
            Self::Mistral => "Mistral AI",
            Self::Groq => "Groq",
            Self::DeepSeek => "DeepSeek",
        }
    }

    /// Environment variable holding the API key
    #[must_use]
    pub fn api_key_env(self) -> &'static str {
        match self {
            Self::OpenAi => "OPENAI_API_KEY",
            Self::Anthropic => "ANTHROPIC_API_KEY",
            Self::Gemini => "GEMINI_API_KEY",
            Self::Mistral => "MISTRAL_API_KEY",
            Self::Groq => "GROQ_API_KEY",
            Self::DeepSeek => "DEEPSEEK_API_KEY",
        }
    }

    /// Base URL of the vendor's OpenAI-compatible endpoint
    #[must_use]
    pub fn default_base_url(self) -> &'static str {
        match self {
            Self::OpenAi => "https://api.openai.com/v1",
            Self::Anthropic => "https://api.anthropic.com/v1",
            Self::Gemini => "https://generativelanguage.googleapis.com/v1beta/openai",
            Self::Mistral => "https://api.mistral.ai/v1",
            Self::Groq => "https://api.groq.com/openai/v1",
            Self::DeepSeek => "https://api.deepseek.com/v1",
        }
    }
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A provider name that is not in the known set
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown provider: {0}")]
pub struct UnknownProvider(pub String);

impl FromStr for ProviderId {
    type Err = UnknownProvider;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase();
        ProviderId::ALL
            .into_iter()
            .find(|p| p.as_str() == normalized)
            .ok_or_else(|| UnknownProvider(s.to_string()))
    }
}

// ============================================================================
// Provider Table
// ============================================================================

/// Fixed table holding exactly one `T` per known provider
///
/// Entries are created at construction and never added or removed, so a
/// lookup can never miss.
#[derive(Debug, Clone)]
pub struct ProviderTable<T> {
    slots: [T; ProviderId::COUNT],
}

impl<T> ProviderTable<T> {
    /// Build a table by calling `f` once per provider
    pub fn from_fn(mut f: impl FnMut(ProviderId) -> T) -> Self {
        Self {
            slots: std::array::from_fn(|i| f(ProviderId::ALL[i])),
        }
    }

    /// Entry for `id`
    #[must_use]
    pub fn get(&self, id: ProviderId) -> &T {
        &self.slots[id.index()]
    }

    /// Mutable entry for `id`
    pub fn get_mut(&mut self, id: ProviderId) -> &mut T {
        &mut self.slots[id.index()]
    }

    /// Iterate entries in provider order
    pub fn iter(&self) -> impl Iterator<Item = (ProviderId, &T)> {
        ProviderId::ALL.into_iter().zip(self.slots.iter())
    }
}

impl<T: Default> Default for ProviderTable<T> {
    fn default() -> Self {
        Self::from_fn(|_| T::default())
    }
}

impl<T> Index<ProviderId> for ProviderTable<T> {
    type Output = T;

    fn index(&self, id: ProviderId) -> &T {
        self.get(id)
    }
}

// ============================================================================
// Provider Profile
// ============================================================================

/// Request quota for a provider; `None` means unlimited
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quota {
    /// Requests allowed per minute window
    pub requests_per_minute: Option<u32>,
    /// Requests allowed per day window
    pub requests_per_day: Option<u32>,
}

impl Quota {
    /// Quota with both windows limited
    #[must_use]
    pub fn new(per_minute: u32, per_day: u32) -> Self {
        Self {
            requests_per_minute: Some(per_minute),
            requests_per_day: Some(per_day),
        }
    }

    /// No limits at all
    #[must_use]
    pub fn unlimited() -> Self {
        Self::default()
    }
}

/// Declared provider capabilities
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    /// Supports streamed responses
    pub streaming: bool,
    /// Supports tool / function calling
    pub function_calling: bool,
    /// Maximum completion tokens per request
    pub max_tokens: u32,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            streaming: true,
            function_calling: true,
            max_tokens: 4096,
        }
    }
}

/// Static attributes of a provider
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProviderProfile {
    /// Provider identity
    pub id: ProviderId,
    /// Human-readable name
    pub display_name: String,
    /// Priority tier (lower = preferred)
    pub priority: u32,
    /// Base rate-limit quota
    pub quota: Quota,
    /// Declared capabilities
    pub capabilities: Capabilities,
    /// Model used when the caller does not name one
    pub default_model: String,
    /// Whether the provider may be dispatched to
    pub enabled: bool,
}

impl ProviderProfile {
    /// Built-in profile for a provider
    #[must_use]
    pub fn builtin(id: ProviderId) -> Self {
        let (priority, quota, capabilities, model) = match id {
            ProviderId::OpenAi => (
                1,
                Quota::new(500, 10_000),
                Capabilities {
                    streaming: true,
                    function_calling: true,
                    max_tokens: 16_384,
                },
                "gpt-4o-mini",
            ),
            ProviderId::Anthropic => (
                1,
                Quota::new(50, 5_000),
                Capabilities {
                    streaming: true,
                    function_calling: true,
                    max_tokens: 8_192,
                },
                "claude-3-5-haiku-latest",
            ),
            ProviderId::Gemini => (
                2,
                Quota::new(15, 1_500),
                Capabilities {
                    streaming: true,
                    function_calling: true,
                    max_tokens: 8_192,
                },
                "gemini-1.5-flash",
            ),
            ProviderId::Mistral => (
                3,
                Quota::new(60, 10_000),
                Capabilities {
                    streaming: true,
                    function_calling: true,
                    max_tokens: 8_192,
                },
                "mistral-small-latest",
            ),
            ProviderId::Groq => (
                2,
                Quota::new(30, 14_400),
                Capabilities {
                    streaming: true,
                    function_calling: false,
                    max_tokens: 8_192,
                },
                "llama-3.1-8b-instant",
            ),
            ProviderId::DeepSeek => (
                3,
                Quota::new(60, 10_000),
                Capabilities {
                    streaming: true,
                    function_calling: true,
                    max_tokens: 8_192,
                },
                "deepseek-chat",
            ),
        };

        Self {
            id,
            display_name: id.display_name().to_string(),
            priority,
            quota,
            capabilities,
            default_model: model.to_string(),
            enabled: true,
        }
    }
}

/// Admin override for a provider profile; `None` fields are left untouched
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderOverride {
    /// New priority tier
    pub priority: Option<u32>,
    /// New quota
    pub quota: Option<Quota>,
    /// Enable or disable the provider
    pub enabled: Option<bool>,
    /// New default model
    pub default_model: Option<String>,
}

impl ProviderOverride {
    /// Set the priority tier
    #[must_use]
    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Set the quota
    #[must_use]
    pub fn with_quota(mut self, quota: Quota) -> Self {
        self.quota = Some(quota);
        self
    }

    /// Enable or disable
    #[must_use]
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = Some(enabled);
        self
    }

    /// Set the default model
    #[must_use]
    pub fn with_default_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = Some(model.into());
        self
    }

    fn apply_to(&self, profile: &mut ProviderProfile) {
        if let Some(priority) = self.priority {
            profile.priority = priority;
        }
        if let Some(quota) = self.quota {
            profile.quota = quota;
        }
        if let Some(enabled) = self.enabled {
            profile.enabled = enabled;
        }
        if let Some(ref model) = self.default_model {
            profile.default_model = model.clone();
        }
    }
}

// ============================================================================
// Provider Catalog
// ============================================================================

/// Profiles for every known provider, one lock per provider
#[derive(Debug)]
pub struct ProviderCatalog {
    profiles: ProviderTable<RwLock<ProviderProfile>>,
}

impl Default for ProviderCatalog {
    fn default() -> Self {
        Self::builtin()
    }
}

impl ProviderCatalog {
    /// Catalog with the built-in profiles
    #[must_use]
    pub fn builtin() -> Self {
        Self::from_profiles(ProviderTable::from_fn(ProviderProfile::builtin))
    }

    /// Catalog from explicit profiles
    #[must_use]
    pub fn from_profiles(profiles: ProviderTable<ProviderProfile>) -> Self {
        Self {
            profiles: ProviderTable::from_fn(|id| RwLock::new(profiles.get(id).clone())),
        }
    }

    /// Current profile of a provider
    #[must_use]
    pub fn profile(&self, id: ProviderId) -> ProviderProfile {
        self.profiles[id].read().clone()
    }

    /// Current quota of a provider
    #[must_use]
    pub fn quota(&self, id: ProviderId) -> Quota {
        self.profiles[id].read().quota
    }

    /// Snapshot of every profile in provider order
    #[must_use]
    pub fn profiles(&self) -> Vec<ProviderProfile> {
        self.profiles.iter().map(|(_, p)| p.read().clone()).collect()
    }

    /// Apply an admin override, returning the updated profile
    pub fn apply_override(&self, id: ProviderId, patch: &ProviderOverride) -> ProviderProfile {
        let mut profile = self.profiles[id].write();
        patch.apply_to(&mut profile);
        tracing::info!(
            provider = %id,
            priority = profile.priority,
            enabled = profile.enabled,
            "Provider profile overridden"
        );
        profile.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_parse_and_display() {
        for id in ProviderId::ALL {
            assert_eq!(id.as_str().parse::<ProviderId>().unwrap(), id);
            assert_eq!(id.to_string(), id.as_str());
        }
        assert_eq!("  OpenAI ".parse::<ProviderId>().unwrap(), ProviderId::OpenAi);
        assert!("cohere".parse::<ProviderId>().is_err());
    }

    #[test]
    fn test_provider_serde_names() {
        let json = serde_json::to_string(&ProviderId::DeepSeek).unwrap();
        assert_eq!(json, "\"deepseek\"");
        let back: ProviderId = serde_json::from_str("\"openai\"").unwrap();
        assert_eq!(back, ProviderId::OpenAi);
    }

    #[test]
    fn test_table_indexes_by_provider() {
        let table = ProviderTable::from_fn(|id| id.index() * 10);
        assert_eq!(table[ProviderId::OpenAi], 0);
        assert_eq!(table[ProviderId::DeepSeek], 50);
        assert_eq!(table.iter().count(), ProviderId::COUNT);
    }

    #[test]
    fn test_override_only_touches_set_fields() {
        let catalog = ProviderCatalog::builtin();
        let before = catalog.profile(ProviderId::Groq);

        let after = catalog.apply_override(
            ProviderId::Groq,
            &ProviderOverride::default().with_priority(9).with_enabled(false),
        );

        assert_eq!(after.priority, 9);
        assert!(!after.enabled);
        assert_eq!(after.quota, before.quota);
        assert_eq!(after.default_model, before.default_model);
        assert_eq!(catalog.profile(ProviderId::Groq), after);
    }
}
