//! Switchboard Core - Multi-Provider AI Request Routing
//!
//! This crate decides which upstream AI provider serves each chat request.
//! It tracks every provider's rate-limit budget and health, falls back
//! across providers on failure, collapses identical concurrent requests into
//! one upstream call, and raises usage alerts. It has no UI or HTTP server
//! dependencies; `switchboard-daemon` exposes it over a Unix socket.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                        AiServiceManager                          │
//! │  ┌───────────────────────────────────────┐  ┌─────────────────┐ │
//! │  │             ProviderRouter            │  │  AlertMonitor   │ │
//! │  │  ┌──────────┐ ┌─────────┐ ┌────────┐  │  │ (periodic task) │ │
//! │  │  │ Response │ │  Usage  │ │ Health │  │◄─┤ reads usage and │ │
//! │  │  │  Cache   │ │ Tracker │ │Registry│  │  │ health          │ │
//! │  │  └──────────┘ └─────────┘ └────────┘  │  └─────────────────┘ │
//! │  └──────────────────┬────────────────────┘                      │
//! └─────────────────────┼───────────────────────────────────────────┘
//!                       │ ProviderClient::invoke
//!        ┌──────┬───────┼───────┬────────┬─────────┐
//!        v      v       v       v        v         v
//!     openai anthropic gemini mistral   groq    deepseek
//! ```
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use switchboard_core::{
//!     load_config, AiServiceManager, ChatRequest, HttpProviderClient, SystemClock,
//! };
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = load_config()?;
//!     let client = HttpProviderClient::new(&config.endpoints)?;
//!     let service = AiServiceManager::new(&config, Arc::new(client), SystemClock::shared())?;
//!     service.start();
//!
//!     let reply = service.dispatch(ChatRequest::user("Summarize my notes")).await?;
//!     println!("{} answered: {}", reply.provider, reply.content);
//!     Ok(())
//! }
//! ```
//!
//! # Module Overview
//!
//! - [`provider`]: Provider identities, profiles and the per-provider table
//! - [`request`]: Caller-facing request, validation and fingerprints
//! - [`backend`]: Upstream client trait and the HTTP implementation
//! - [`routing`]: Usage windows, health FSM, cache, router, events, metrics
//! - [`alerts`]: Threshold-based usage alerts
//! - [`service`]: Facade for dashboards and admin surfaces
//! - [`config`]: TOML/environment configuration loading
//! - [`protocol`]: Framed request/response protocol of the daemon

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod alerts;
pub mod backend;
pub mod clock;
pub mod config;
pub mod error;
pub mod protocol;
pub mod provider;
pub mod request;
pub mod routing;
pub mod service;

// Re-exports for convenience
pub use alerts::{Alert, AlertConfig, AlertConfigUpdate, AlertEvent, AlertLevel, AlertMonitor};
pub use backend::{
    HttpProviderClient, ProviderClient, ProviderEndpoint, ProviderError, ProviderReply,
    ProviderRequest,
};
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use error::{AttemptOutcome, AttemptRecord, ErrorClass, RouterError};
pub use provider::{
    Capabilities, ProviderCatalog, ProviderId, ProviderOverride, ProviderProfile, ProviderTable,
    Quota,
};
pub use request::{ChatMessage, ChatRequest, Fingerprint, Preferences, Role};
pub use routing::{
    DispatchResponse, HealthConfig, HealthState, ProviderRouter, RouterConfig, RouterEvent,
};
pub use service::{AiServiceManager, ProviderStatistics, ServiceStatistics};

// Config exports
pub use config::{
    default_config_path, load_config, load_config_from_path, ConfigError, ConfigSource,
    ConfigUpdate, SwitchboardConfig, SwitchboardToml,
};
