//! Scripted Provider for Tests
//!
//! Mock upstream for exercising routing without network access. Each
//! provider has a queue of scripted outcomes and a default used once the
//! queue is empty; every call is logged.
//!
//! # Usage
//!
//! ```ignore
//! use switchboard_core::routing::test_utils::{ScriptedOutcome, ScriptedProvider};
//!
//! let client = ScriptedProvider::new();
//! client.push(ProviderId::OpenAi, ScriptedOutcome::Fail(ErrorClass::Timeout));
//!
//! // ... dispatch ...
//! assert_eq!(client.calls(ProviderId::OpenAi), 1);
//! ```

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::backend::{ProviderClient, ProviderError, ProviderReply, ProviderRequest};
use crate::error::ErrorClass;
use crate::provider::{ProviderId, ProviderTable};

/// What a scripted call does
#[derive(Clone, Debug, PartialEq)]
pub enum ScriptedOutcome {
    /// Answer with this content
    Reply(String),
    /// Fail with this class
    Fail(ErrorClass),
    /// Never answer
    Hang,
    /// Panic inside the call
    Panic,
}

#[derive(Debug)]
struct Script {
    queue: VecDeque<ScriptedOutcome>,
    default: ScriptedOutcome,
    delay: Duration,
    calls: usize,
    configured: bool,
}

/// Mock [`ProviderClient`] driven by per-provider scripts
#[derive(Clone, Debug)]
pub struct ScriptedProvider {
    scripts: Arc<ProviderTable<Mutex<Script>>>,
    log: Arc<Mutex<Vec<(ProviderId, ProviderRequest)>>>,
}

impl Default for ScriptedProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedProvider {
    /// Every provider answers `"reply from <provider>"` immediately
    pub fn new() -> Self {
        Self {
            scripts: Arc::new(ProviderTable::from_fn(|id| {
                Mutex::new(Script {
                    queue: VecDeque::new(),
                    default: ScriptedOutcome::Reply(format!("reply from {id}")),
                    delay: Duration::ZERO,
                    calls: 0,
                    configured: true,
                })
            })),
            log: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Queue an outcome for the next call to `provider`
    pub fn push(&self, provider: ProviderId, outcome: ScriptedOutcome) {
        self.scripts[provider].lock().queue.push_back(outcome);
    }

    /// Outcome once the queue is drained
    pub fn set_default(&self, provider: ProviderId, outcome: ScriptedOutcome) {
        self.scripts[provider].lock().default = outcome;
    }

    /// Simulated upstream latency
    pub fn set_delay(&self, provider: ProviderId, delay: Duration) {
        self.scripts[provider].lock().delay = delay;
    }

    /// Report `provider` as missing credentials
    pub fn set_configured(&self, provider: ProviderId, configured: bool) {
        self.scripts[provider].lock().configured = configured;
    }

    /// Calls made to `provider`
    pub fn calls(&self, provider: ProviderId) -> usize {
        self.scripts[provider].lock().calls
    }

    /// Calls made to any provider
    pub fn total_calls(&self) -> usize {
        self.scripts.iter().map(|(_, s)| s.lock().calls).sum()
    }

    /// Providers in call order
    pub fn call_order(&self) -> Vec<ProviderId> {
        self.log.lock().iter().map(|(id, _)| *id).collect()
    }

    /// Requests received, in call order
    pub fn requests(&self) -> Vec<(ProviderId, ProviderRequest)> {
        self.log.lock().clone()
    }
}

#[async_trait]
impl ProviderClient for ScriptedProvider {
    async fn invoke(
        &self,
        provider: ProviderId,
        request: &ProviderRequest,
        _timeout: Duration,
    ) -> Result<ProviderReply, ProviderError> {
        let (outcome, delay) = {
            let mut script = self.scripts[provider].lock();
            script.calls += 1;
            let outcome = script
                .queue
                .pop_front()
                .unwrap_or_else(|| script.default.clone());
            (outcome, script.delay)
        };
        self.log.lock().push((provider, request.clone()));

        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        match outcome {
            ScriptedOutcome::Reply(content) => Ok(ProviderReply {
                tokens_used: content.split_whitespace().count() as u32,
                content,
                model: request
                    .model
                    .clone()
                    .unwrap_or_else(|| "scripted".to_string()),
                latency: delay,
            }),
            ScriptedOutcome::Fail(class) => Err(ProviderError::new(
                class,
                format!("scripted {class} from {provider}"),
            )),
            ScriptedOutcome::Hang => std::future::pending().await,
            ScriptedOutcome::Panic => panic!("scripted panic from {provider}"),
        }
    }

    fn is_configured(&self, provider: ProviderId) -> bool {
        self.scripts[provider].lock().configured
    }

    fn name(&self) -> &'static str {
        "scripted"
    }
}
