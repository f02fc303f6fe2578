//! Single-Flight Response Cache
//!
//! Maps a request [`Fingerprint`] to a computed response. Concurrent lookups
//! for the same fingerprint collapse into one computation:
//!
//! ```text
//!   caller A ──miss──> install Pending(token) ──spawn──> compute()
//!   caller B ──────────> Pending? await shared ─┐            │
//!   caller C ──────────> Pending? await shared ─┤            v
//!                                               └──── publish(token, result)
//!                                                      Ok  -> Ready
//!                                                      Err -> slot removed
//! ```
//!
//! The computation runs on its own task and publishes its own result, so it
//! completes (and fills the cache) even when every caller has gone away.
//! Failures are handed to every current awaiter and never stored.
//!
//! Entries expire after a fixed TTL measured from insertion, independent of
//! access. Expired entries are dropped lazily on lookup; [`ResponseCache::purge_expired`]
//! and the `max_entries` bound keep memory in check.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use super::config::CacheConfig;
use crate::clock::{to_chrono, SharedClock};
use crate::request::Fingerprint;

/// The shared computation died (panicked or was cancelled) before producing
/// a result
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ComputationAborted {
    pub reason: String,
}

type SharedComputation<V, E> = Shared<BoxFuture<'static, Result<V, E>>>;

enum Slot<V, E> {
    Ready {
        value: V,
        inserted_at: DateTime<Utc>,
    },
    Pending {
        token: u64,
        computation: SharedComputation<V, E>,
    },
}

/// How a lookup was answered
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CacheLookup<V> {
    /// Fresh stored entry
    Hit(V),
    /// Awaited a computation another caller started
    Joined(V),
    /// This caller started the computation
    Computed(V),
}

impl<V> CacheLookup<V> {
    /// Whether the value came from an earlier or concurrent computation
    #[must_use]
    pub fn is_cached(&self) -> bool {
        matches!(self, Self::Hit(_) | Self::Joined(_))
    }

    /// The value, however it was obtained
    pub fn into_value(self) -> V {
        match self {
            Self::Hit(v) | Self::Joined(v) | Self::Computed(v) => v,
        }
    }
}

/// Counters exposed for dashboards
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub joins: u64,
    pub computations_failed: u64,
    pub evictions: u64,
    pub entries: usize,
    pub in_flight: usize,
}

#[derive(Default)]
struct CacheCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    joins: AtomicU64,
    failed: AtomicU64,
    evictions: AtomicU64,
}

struct CacheInner<V, E> {
    slots: Mutex<HashMap<Fingerprint, Slot<V, E>>>,
    config: RwLock<CacheConfig>,
    clock: SharedClock,
    next_token: AtomicU64,
    counters: CacheCounters,
}

impl<V: Clone, E> CacheInner<V, E> {
    fn is_fresh(&self, inserted_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        let ttl = to_chrono(self.config.read().ttl);
        now < inserted_at + ttl
    }

    /// Store the outcome of computation `token`, unless its slot was
    /// invalidated or taken over meanwhile
    fn publish(&self, key: &Fingerprint, token: u64, result: &Result<V, E>) {
        let mut slots = self.slots.lock();
        let owns_slot = matches!(
            slots.get(key),
            Some(Slot::Pending { token: t, .. }) if *t == token
        );
        if !owns_slot {
            return;
        }
        match result {
            Ok(value) => {
                slots.insert(
                    key.clone(),
                    Slot::Ready {
                        value: value.clone(),
                        inserted_at: self.clock.now(),
                    },
                );
                self.enforce_bound(&mut slots);
            }
            Err(_) => {
                slots.remove(key);
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Drop the oldest ready entries above `max_entries`
    fn enforce_bound(&self, slots: &mut HashMap<Fingerprint, Slot<V, E>>) {
        let max = self.config.read().max_entries.max(1);
        let ready = slots
            .values()
            .filter(|s| matches!(s, Slot::Ready { .. }))
            .count();
        if ready <= max {
            return;
        }

        let mut by_age: Vec<(DateTime<Utc>, Fingerprint)> = slots
            .iter()
            .filter_map(|(k, s)| match s {
                Slot::Ready { inserted_at, .. } => Some((*inserted_at, k.clone())),
                Slot::Pending { .. } => None,
            })
            .collect();
        by_age.sort();
        for (_, key) in by_age.into_iter().take(ready - max) {
            slots.remove(&key);
            self.counters.evictions.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Fingerprint-keyed cache with per-key single-flight
pub struct ResponseCache<V, E> {
    inner: Arc<CacheInner<V, E>>,
}

impl<V, E> Clone for ResponseCache<V, E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V, E> ResponseCache<V, E>
where
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + From<ComputationAborted> + 'static,
{
    /// Empty cache
    pub fn new(config: CacheConfig, clock: SharedClock) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                slots: Mutex::new(HashMap::new()),
                config: RwLock::new(config),
                clock,
                next_token: AtomicU64::new(1),
                counters: CacheCounters::default(),
            }),
        }
    }

    /// Return the cached value for `key`, or compute it exactly once
    ///
    /// `compute` is only called on a miss, while the slot is reserved; it
    /// should build the future and return without touching the cache.
    /// Must be called within a tokio runtime.
    pub async fn get_or_compute<F, Fut>(&self, key: Fingerprint, compute: F) -> Result<CacheLookup<V>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
    {
        let (computation, started_here) = {
            let mut slots = self.inner.slots.lock();
            let now = self.inner.clock.now();

            let in_flight = match slots.get(&key) {
                Some(Slot::Ready { value, inserted_at })
                    if self.inner.is_fresh(*inserted_at, now) =>
                {
                    self.inner.counters.hits.fetch_add(1, Ordering::Relaxed);
                    return Ok(CacheLookup::Hit(value.clone()));
                }
                Some(Slot::Pending { computation, .. }) => Some(computation.clone()),
                _ => None,
            };

            match in_flight {
                Some(computation) => {
                    self.inner.counters.joins.fetch_add(1, Ordering::Relaxed);
                    (computation, false)
                }
                None => {
                    // Miss, or an expired entry that the insert below replaces
                    self.inner.counters.misses.fetch_add(1, Ordering::Relaxed);
                    let token = self.inner.next_token.fetch_add(1, Ordering::Relaxed);
                    let computation = self.spawn_computation(key.clone(), token, compute());
                    slots.insert(
                        key.clone(),
                        Slot::Pending {
                            token,
                            computation: computation.clone(),
                        },
                    );
                    (computation, true)
                }
            }
        };

        let value = computation.await?;
        Ok(if started_here {
            CacheLookup::Computed(value)
        } else {
            CacheLookup::Joined(value)
        })
    }

    fn spawn_computation<Fut>(&self, key: Fingerprint, token: u64, fut: Fut) -> SharedComputation<V, E>
    where
        Fut: Future<Output = Result<V, E>> + Send + 'static,
    {
        let publisher = Arc::clone(&self.inner);
        let publish_key = key.clone();
        let handle = tokio::spawn(async move {
            let result = fut.await;
            publisher.publish(&publish_key, token, &result);
            result
        });

        let cleanup = Arc::clone(&self.inner);
        async move {
            match handle.await {
                Ok(result) => result,
                Err(join_error) => {
                    tracing::error!(fingerprint = %key, error = %join_error, "Cache computation aborted");
                    let aborted = ComputationAborted {
                        reason: join_error.to_string(),
                    };
                    let err = E::from(aborted);
                    cleanup.publish(&key, token, &Err(err.clone()));
                    Err(err)
                }
            }
        }
        .boxed()
        .shared()
    }

    /// Fresh value for `key` without computing anything
    #[must_use]
    pub fn peek(&self, key: &Fingerprint) -> Option<V> {
        let slots = self.inner.slots.lock();
        match slots.get(key) {
            Some(Slot::Ready { value, inserted_at })
                if self.inner.is_fresh(*inserted_at, self.inner.clock.now()) =>
            {
                Some(value.clone())
            }
            _ => None,
        }
    }

    /// Drop a stored entry; an in-flight computation for it will not be stored
    pub fn invalidate(&self, key: &Fingerprint) -> bool {
        self.inner.slots.lock().remove(key).is_some()
    }

    /// Drop everything
    pub fn clear(&self) {
        self.inner.slots.lock().clear();
    }

    /// Drop expired entries, returning how many were removed
    pub fn purge_expired(&self) -> usize {
        let now = self.inner.clock.now();
        let mut slots = self.inner.slots.lock();
        let before = slots.len();
        slots.retain(|_, slot| match slot {
            Slot::Ready { inserted_at, .. } => self.inner.is_fresh(*inserted_at, now),
            Slot::Pending { .. } => true,
        });
        let removed = before - slots.len();
        self.inner
            .counters
            .evictions
            .fetch_add(removed as u64, Ordering::Relaxed);
        removed
    }

    /// Current settings
    #[must_use]
    pub fn config(&self) -> CacheConfig {
        self.inner.config.read().clone()
    }

    /// Replace settings; a smaller bound is enforced immediately
    pub fn update_config(&self, config: CacheConfig) {
        *self.inner.config.write() = config;
        let mut slots = self.inner.slots.lock();
        self.inner.enforce_bound(&mut slots);
    }

    /// Counter snapshot
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        let slots = self.inner.slots.lock();
        let in_flight = slots
            .values()
            .filter(|s| matches!(s, Slot::Pending { .. }))
            .count();
        let c = &self.inner.counters;
        CacheStats {
            hits: c.hits.load(Ordering::Relaxed),
            misses: c.misses.load(Ordering::Relaxed),
            joins: c.joins.load(Ordering::Relaxed),
            computations_failed: c.failed.load(Ordering::Relaxed),
            evictions: c.evictions.load(Ordering::Relaxed),
            entries: slots.len() - in_flight,
            in_flight,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::TimeZone;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[derive(Clone, Debug, PartialEq)]
    enum TestError {
        Upstream(String),
        Aborted,
    }

    impl From<ComputationAborted> for TestError {
        fn from(_: ComputationAborted) -> Self {
            Self::Aborted
        }
    }

    fn key(s: &str) -> Fingerprint {
        crate::request::ChatRequest::user(s).fingerprint()
    }

    fn cache(ttl: Duration) -> (ResponseCache<String, TestError>, Arc<ManualClock>) {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 2, 2, 12, 0, 0).unwrap());
        let config = CacheConfig {
            enabled: true,
            ttl,
            max_entries: 16,
        };
        (ResponseCache::new(config, clock.clone()), clock)
    }

    #[tokio::test]
    async fn test_concurrent_lookups_compute_once() {
        let (cache, _) = cache(Duration::from_secs(60));
        let calls = Arc::new(AtomicUsize::new(0));

        let lookups = (0..16).map(|_| {
            let cache = cache.clone();
            let calls = Arc::clone(&calls);
            tokio::spawn(async move {
                cache
                    .get_or_compute(key("same"), move || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok("answer".to_string())
                    })
                    .await
            })
        });

        let results = futures::future::join_all(lookups).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let mut computed = 0;
        for r in results {
            let lookup = r.unwrap().unwrap();
            if matches!(lookup, CacheLookup::Computed(_)) {
                computed += 1;
            }
            assert_eq!(lookup.into_value(), "answer");
        }
        assert_eq!(computed, 1);
        assert_eq!(cache.stats().misses, 1);
    }

    #[tokio::test]
    async fn test_hit_after_compute() {
        let (cache, _) = cache(Duration::from_secs(60));
        let first = cache
            .get_or_compute(key("q"), || async { Ok("a".to_string()) })
            .await
            .unwrap();
        assert!(!first.is_cached());

        let second = cache
            .get_or_compute(key("q"), || async { Ok("b".to_string()) })
            .await
            .unwrap();
        assert_eq!(second, CacheLookup::Hit("a".to_string()));
    }

    #[tokio::test]
    async fn test_failure_reaches_all_waiters_and_is_not_cached() {
        let (cache, _) = cache(Duration::from_secs(60));
        let calls = Arc::new(AtomicUsize::new(0));

        let lookups = (0..4).map(|_| {
            let cache = cache.clone();
            let calls = Arc::clone(&calls);
            tokio::spawn(async move {
                cache
                    .get_or_compute(key("boom"), move || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Err::<String, _>(TestError::Upstream("503".into()))
                    })
                    .await
            })
        });
        for r in futures::future::join_all(lookups).await {
            assert_eq!(r.unwrap().unwrap_err(), TestError::Upstream("503".into()));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.stats().entries, 0);

        let retry = cache
            .get_or_compute(key("boom"), || async { Ok("recovered".to_string()) })
            .await
            .unwrap();
        assert_eq!(retry, CacheLookup::Computed("recovered".to_string()));
    }

    #[tokio::test]
    async fn test_panicking_computation_is_reported_and_released() {
        let (cache, _) = cache(Duration::from_secs(60));
        let result = cache
            .get_or_compute(key("panic"), || async {
                if true {
                    panic!("compute exploded");
                }
                Ok::<String, TestError>(String::new())
            })
            .await;
        assert_eq!(result.unwrap_err(), TestError::Aborted);
        assert_eq!(cache.stats().in_flight, 0);
    }

    #[tokio::test]
    async fn test_ttl_expiry_is_independent_of_access() {
        let (cache, clock) = cache(Duration::from_secs(30));
        cache
            .get_or_compute(key("t"), || async { Ok("old".to_string()) })
            .await
            .unwrap();

        clock.advance(Duration::from_secs(20));
        assert_eq!(cache.peek(&key("t")), Some("old".to_string()));

        clock.advance(Duration::from_secs(10));
        assert_eq!(cache.peek(&key("t")), None);
        let lookup = cache
            .get_or_compute(key("t"), || async { Ok("new".to_string()) })
            .await
            .unwrap();
        assert_eq!(lookup, CacheLookup::Computed("new".to_string()));
    }

    #[tokio::test]
    async fn test_computation_survives_caller_cancellation() {
        let (cache, _) = cache(Duration::from_secs(60));
        let calls = Arc::new(AtomicUsize::new(0));

        let first = {
            let cache = cache.clone();
            let calls = Arc::clone(&calls);
            tokio::spawn(async move {
                cache
                    .get_or_compute(key("c"), move || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok("kept".to_string())
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        first.abort();

        let second = cache
            .get_or_compute(key("c"), || async { Ok("duplicate".to_string()) })
            .await
            .unwrap();
        assert_eq!(second.into_value(), "kept");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_max_entries_evicts_oldest() {
        let (cache, clock) = cache(Duration::from_secs(600));
        cache.update_config(CacheConfig {
            enabled: true,
            ttl: Duration::from_secs(600),
            max_entries: 2,
        });
        for name in ["a", "b", "c"] {
            cache
                .get_or_compute(key(name), move || async move { Ok(name.to_string()) })
                .await
                .unwrap();
            clock.advance(Duration::from_secs(1));
        }
        assert_eq!(cache.peek(&key("a")), None);
        assert_eq!(cache.peek(&key("c")), Some("c".to_string()));
        assert_eq!(cache.stats().evictions, 1);
    }

    #[tokio::test]
    async fn test_purge_and_invalidate() {
        let (cache, clock) = cache(Duration::from_secs(5));
        for name in ["x", "y"] {
            cache
                .get_or_compute(key(name), move || async move { Ok(name.to_string()) })
                .await
                .unwrap();
        }
        assert!(cache.invalidate(&key("x")));
        assert!(!cache.invalidate(&key("x")));

        clock.advance(Duration::from_secs(5));
        assert_eq!(cache.purge_expired(), 1);
        assert_eq!(cache.stats().entries, 0);
    }
}
