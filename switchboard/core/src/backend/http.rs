//! HTTP Provider Client
//!
//! Speaks the OpenAI-compatible `/chat/completions` shape that every
//! supported vendor exposes. Each provider gets its own base URL, API key
//! (read from the environment) and default model.
//!
//! # Failure classification
//!
//! | Condition                        | Class            |
//! |----------------------------------|------------------|
//! | 401, 403, missing API key        | `authentication` |
//! | 429                              | `rate_limited`   |
//! | 408, 504, client-side timeout    | `timeout`        |
//! | 400, 404, 413, 422               | `validation`     |
//! | other 5xx, connect/transport     | `network`        |
//! | anything else                    | `unknown`        |

use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::traits::{ProviderClient, ProviderError, ProviderReply, ProviderRequest};
use crate::error::ErrorClass;
use crate::provider::{ProviderCatalog, ProviderId, ProviderTable};
use crate::request::ChatMessage;

/// Connection settings for one provider
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProviderEndpoint {
    /// Base URL, without the trailing `/chat/completions`
    pub base_url: String,
    /// Environment variable holding the API key
    pub api_key_env: String,
    /// Model used when the request does not name one
    pub default_model: String,
}

impl ProviderEndpoint {
    /// Vendor defaults for a provider
    #[must_use]
    pub fn default_for(id: ProviderId, default_model: impl Into<String>) -> Self {
        Self {
            base_url: id.default_base_url().to_string(),
            api_key_env: id.api_key_env().to_string(),
            default_model: default_model.into(),
        }
    }
}

struct ResolvedEndpoint {
    url: String,
    api_key: Option<String>,
    default_model: String,
}

/// reqwest-backed [`ProviderClient`]
pub struct HttpProviderClient {
    http_client: reqwest::Client,
    endpoints: ProviderTable<ResolvedEndpoint>,
}

impl HttpProviderClient {
    /// Build a client; API keys are read from the environment once, here
    pub fn new(endpoints: &ProviderTable<ProviderEndpoint>) -> reqwest::Result<Self> {
        let http_client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;

        let endpoints = ProviderTable::from_fn(|id| {
            let endpoint = endpoints.get(id);
            let api_key = std::env::var(&endpoint.api_key_env)
                .ok()
                .filter(|k| !k.trim().is_empty());
            if api_key.is_none() {
                tracing::debug!(provider = %id, env = %endpoint.api_key_env, "No API key configured");
            }
            ResolvedEndpoint {
                url: format!("{}/chat/completions", endpoint.base_url.trim_end_matches('/')),
                api_key,
                default_model: endpoint.default_model.clone(),
            }
        });

        Ok(Self {
            http_client,
            endpoints,
        })
    }

    /// Client using vendor URLs and the catalog's default models
    pub fn from_catalog(catalog: &ProviderCatalog) -> reqwest::Result<Self> {
        let endpoints = ProviderTable::from_fn(|id| {
            ProviderEndpoint::default_for(id, catalog.profile(id).default_model)
        });
        Self::new(&endpoints)
    }

    /// Whether an API key was found for `provider`
    #[must_use]
    pub fn has_credentials(&self, provider: ProviderId) -> bool {
        self.endpoints[provider].api_key.is_some()
    }
}

#[derive(Serialize)]
struct CompletionBody<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(flatten)]
    extra: &'a std::collections::BTreeMap<String, serde_json::Value>,
}

#[derive(Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    model: Option<String>,
    choices: Vec<CompletionChoice>,
    #[serde(default)]
    usage: Option<CompletionUsage>,
}

#[derive(Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Deserialize)]
struct CompletionMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct CompletionUsage {
    #[serde(default)]
    total_tokens: u32,
}

/// Map an HTTP error status to a failure class
#[must_use]
pub fn classify_status(status: u16) -> ErrorClass {
    match status {
        401 | 403 => ErrorClass::Authentication,
        429 => ErrorClass::RateLimited,
        408 | 504 => ErrorClass::Timeout,
        400 | 404 | 413 | 422 => ErrorClass::Validation,
        500..=599 => ErrorClass::Network,
        _ => ErrorClass::Unknown,
    }
}

fn classify_transport(err: &reqwest::Error) -> ErrorClass {
    if err.is_timeout() {
        ErrorClass::Timeout
    } else if err.is_connect() || err.is_request() || err.is_body() {
        ErrorClass::Network
    } else {
        ErrorClass::Unknown
    }
}

#[async_trait]
impl ProviderClient for HttpProviderClient {
    fn name(&self) -> &'static str {
        "http"
    }

    fn is_configured(&self, provider: ProviderId) -> bool {
        self.has_credentials(provider)
    }

    async fn invoke(
        &self,
        provider: ProviderId,
        request: &ProviderRequest,
        timeout: Duration,
    ) -> Result<ProviderReply, ProviderError> {
        let endpoint = &self.endpoints[provider];
        let Some(ref api_key) = endpoint.api_key else {
            return Err(ProviderError::authentication(format!(
                "no API key for {provider}"
            )));
        };

        let model = request
            .model
            .as_deref()
            .unwrap_or(endpoint.default_model.as_str());
        let body = CompletionBody {
            model,
            messages: &request.messages,
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            extra: &request.extra,
        };

        let started = Instant::now();
        let response = self
            .http_client
            .post(&endpoint.url)
            .bearer_auth(api_key)
            .timeout(timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderError::new(classify_transport(&e), e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            let detail: String = detail.chars().take(512).collect();
            return Err(ProviderError::new(
                classify_status(status.as_u16()),
                format!("{provider} returned {status}: {detail}"),
            )
            .with_status(status.as_u16()));
        }

        let parsed: CompletionResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::new(classify_transport(&e), e.to_string()))?;

        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| {
                ProviderError::new(ErrorClass::Unknown, format!("{provider} returned no choices"))
            })?;

        Ok(ProviderReply {
            content,
            model: parsed.model.unwrap_or_else(|| model.to_string()),
            tokens_used: parsed.usage.map_or(0, |u| u.total_tokens),
            latency: started.elapsed(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_status() {
        assert_eq!(classify_status(401), ErrorClass::Authentication);
        assert_eq!(classify_status(403), ErrorClass::Authentication);
        assert_eq!(classify_status(429), ErrorClass::RateLimited);
        assert_eq!(classify_status(504), ErrorClass::Timeout);
        assert_eq!(classify_status(422), ErrorClass::Validation);
        assert_eq!(classify_status(502), ErrorClass::Network);
        assert_eq!(classify_status(418), ErrorClass::Unknown);
    }

    #[test]
    fn test_body_flattens_extra() {
        let mut extra = std::collections::BTreeMap::new();
        extra.insert("top_p".to_string(), serde_json::json!(0.9));
        let messages = vec![ChatMessage::user("hi")];
        let body = CompletionBody {
            model: "gpt-4o-mini",
            messages: &messages,
            temperature: None,
            max_tokens: Some(64),
            extra: &extra,
        };

        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["top_p"], serde_json::json!(0.9));
        assert_eq!(json["max_tokens"], serde_json::json!(64));
        assert!(json.get("temperature").is_none());
        assert_eq!(json["messages"][0]["role"], "user");
    }

    #[tokio::test]
    async fn test_missing_key_is_authentication_failure() {
        let endpoints = ProviderTable::from_fn(|id| ProviderEndpoint {
            base_url: "http://127.0.0.1:9".to_string(),
            api_key_env: format!("SWITCHBOARD_TEST_UNSET_KEY_{}", id.as_str().to_uppercase()),
            default_model: "m".to_string(),
        });
        let client = HttpProviderClient::new(&endpoints).unwrap();
        assert!(!client.has_credentials(ProviderId::Mistral));
        assert!(!client.is_configured(ProviderId::Mistral));

        let request = crate::request::ChatRequest::user("hi").normalized();
        let err = client
            .invoke(ProviderId::Mistral, &request, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err.class, ErrorClass::Authentication);
    }
}
