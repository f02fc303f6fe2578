#![allow(missing_docs)]
//! Multi-Provider Request Routing
//!
//! Budget- and health-aware selection of an upstream provider for each
//! request, with cross-provider fallback and single-flight caching.
//!
//! # Architecture
//!
//! ```text
//! +------------------+
//! |  ProviderRouter  |  <-- Entry point for every dispatch
//! +--------+---------+
//!          |
//!          v
//! +------------------+
//! |  ResponseCache   |  <-- Fingerprint -> reply, one computation per key
//! +--------+---------+
//!          | miss
//!          v
//! +------------------+     +-----------------------+
//! | RateLimitTracker | <-> | ProviderHealthRegistry|  <-- Candidate filter
//! +--------+---------+     +-----------------------+
//!          |
//!          v
//! +------------------+
//! |  ProviderClient  |  <-- Upstream call, classified failures
//! +------------------+
//! ```
//!
//! # Design Principles
//!
//! 1. **Per-Provider Locks**: Usage and health live in a fixed table, one lock each
//! 2. **Hysteresis**: Health changes need sustained evidence
//! 3. **Graceful Degradation**: Retryable failures move on to the next candidate
//! 4. **Observability**: Events and metrics for every attempt

pub mod cache;
pub mod config;
pub mod events;
pub mod health;
pub mod metrics;
pub mod rate_limit;
pub mod router;
pub mod test_utils;

pub use cache::{CacheLookup, CacheStats, ComputationAborted, ResponseCache};
pub use config::*;
pub use events::{EventBus, RouterEvent};
pub use health::*;
pub use metrics::{ProviderMetricsSummary, RouterMetrics};
pub use rate_limit::{RateLimitTracker, UsageStatus, WindowPeriod, WindowStatus};
pub use router::*;
