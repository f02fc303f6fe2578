//! Per-Provider Rate Limit Tracking
//!
//! Each provider has a minute window and a day window. Windows are aligned
//! to UTC period boundaries (`epoch + k * period`) and roll over lazily on
//! every read or write, so a window with no traffic still resets exactly on
//! schedule the next time anyone looks at it.
//!
//! # Clock skew
//!
//! A rollover only ever moves a window forward. If the clock jumps backwards
//! the current window is kept as is; counts are unsigned and only ever reset
//! to zero, never decremented.
//!
//! # Locking
//!
//! One mutex per provider record. Nothing here locks more than one provider
//! at a time.

use std::collections::BTreeMap;

use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::clock::SharedClock;
use crate::provider::{ProviderCatalog, ProviderId, ProviderTable, Quota};

// ============================================================================
// Windows
// ============================================================================

/// Length of a usage window
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WindowPeriod {
    Minute,
    Day,
}

impl WindowPeriod {
    fn millis(self) -> i64 {
        match self {
            Self::Minute => 60_000,
            Self::Day => 86_400_000,
        }
    }

    /// Start of the window containing `at`
    #[must_use]
    pub fn align(self, at: DateTime<Utc>) -> DateTime<Utc> {
        let ms = at.timestamp_millis();
        let start = ms - ms.rem_euclid(self.millis());
        Utc.timestamp_millis_opt(start).single().unwrap_or(at)
    }
}

#[derive(Debug)]
struct UsageWindow {
    period: WindowPeriod,
    count: u32,
    started_at: DateTime<Utc>,
}

impl UsageWindow {
    fn new(period: WindowPeriod, now: DateTime<Utc>) -> Self {
        Self {
            period,
            count: 0,
            started_at: period.align(now),
        }
    }

    /// Forward-only lazy rollover
    fn roll(&mut self, now: DateTime<Utc>) {
        let current = self.period.align(now);
        if current > self.started_at {
            self.started_at = current;
            self.count = 0;
        }
    }

    fn resets_at(&self) -> DateTime<Utc> {
        self.started_at + chrono::Duration::milliseconds(self.period.millis())
    }

    fn has_room(&self, limit: Option<u32>) -> bool {
        limit.map_or(true, |l| self.count < l)
    }

    fn status(&self, limit: Option<u32>) -> WindowStatus {
        let percentage = match limit {
            None => 0.0,
            Some(0) => 100.0,
            Some(l) => f64::from(self.count) / f64::from(l) * 100.0,
        };
        WindowStatus {
            usage: self.count,
            limit,
            percentage,
            window_reset_at: self.resets_at(),
        }
    }
}

#[derive(Debug)]
struct ProviderUsage {
    quota: Quota,
    minute: UsageWindow,
    day: UsageWindow,
    lifetime: u64,
}

impl ProviderUsage {
    fn roll(&mut self, now: DateTime<Utc>) {
        self.minute.roll(now);
        self.day.roll(now);
    }

    fn within_budget(&self) -> bool {
        self.minute.has_room(self.quota.requests_per_minute)
            && self.day.has_room(self.quota.requests_per_day)
    }

    fn record(&mut self) {
        self.minute.count = self.minute.count.saturating_add(1);
        self.day.count = self.day.count.saturating_add(1);
        self.lifetime += 1;
    }

    fn status(&self) -> UsageStatus {
        UsageStatus {
            minute: self.minute.status(self.quota.requests_per_minute),
            day: self.day.status(self.quota.requests_per_day),
            lifetime_requests: self.lifetime,
        }
    }
}

// ============================================================================
// Status Snapshots
// ============================================================================

/// Usage of one window
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WindowStatus {
    /// Requests recorded in the current window
    pub usage: u32,
    /// Configured limit (`None` = unlimited)
    pub limit: Option<u32>,
    /// `usage / limit` as a percentage (0 when unlimited)
    pub percentage: f64,
    /// When the current window ends
    pub window_reset_at: DateTime<Utc>,
}

/// Usage of both windows of a provider
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UsageStatus {
    pub minute: WindowStatus,
    pub day: WindowStatus,
    /// Requests recorded since startup
    pub lifetime_requests: u64,
}

impl UsageStatus {
    /// The hotter of the two windows
    #[must_use]
    pub fn percentage(&self) -> f64 {
        self.minute.percentage.max(self.day.percentage)
    }

    /// Window behind [`UsageStatus::percentage`]
    #[must_use]
    pub fn hottest(&self) -> (WindowPeriod, &WindowStatus) {
        if self.day.percentage > self.minute.percentage {
            (WindowPeriod::Day, &self.day)
        } else {
            (WindowPeriod::Minute, &self.minute)
        }
    }

    /// Whether both windows still have room
    #[must_use]
    pub fn within_budget(&self) -> bool {
        let room = |w: &WindowStatus| w.limit.map_or(true, |l| w.usage < l);
        room(&self.minute) && room(&self.day)
    }
}

// ============================================================================
// Tracker
// ============================================================================

/// Minute/day usage windows for every provider
#[derive(Debug)]
pub struct RateLimitTracker {
    usage: ProviderTable<Mutex<ProviderUsage>>,
    clock: SharedClock,
}

impl RateLimitTracker {
    /// Tracker with explicit quotas
    pub fn new(quotas: ProviderTable<Quota>, clock: SharedClock) -> Self {
        let now = clock.now();
        Self {
            usage: ProviderTable::from_fn(|id| {
                Mutex::new(ProviderUsage {
                    quota: *quotas.get(id),
                    minute: UsageWindow::new(WindowPeriod::Minute, now),
                    day: UsageWindow::new(WindowPeriod::Day, now),
                    lifetime: 0,
                })
            }),
            clock,
        }
    }

    /// Tracker seeded from the catalog's quotas
    pub fn from_catalog(catalog: &ProviderCatalog, clock: SharedClock) -> Self {
        Self::new(ProviderTable::from_fn(|id| catalog.quota(id)), clock)
    }

    /// Record one upstream request against both windows
    pub fn record_usage(&self, provider: ProviderId) {
        let now = self.clock.now();
        let mut usage = self.usage[provider].lock();
        usage.roll(now);
        usage.record();
    }

    /// Record one request only if it fits the budget
    ///
    /// Check and increment happen under the same lock, so concurrent callers
    /// can never push a window past its limit.
    pub fn try_acquire(&self, provider: ProviderId) -> bool {
        let now = self.clock.now();
        let mut usage = self.usage[provider].lock();
        usage.roll(now);
        if !usage.within_budget() {
            return false;
        }
        usage.record();
        true
    }

    /// `usage < limit` for both windows
    #[must_use]
    pub fn is_within_budget(&self, provider: ProviderId) -> bool {
        let now = self.clock.now();
        let mut usage = self.usage[provider].lock();
        usage.roll(now);
        usage.within_budget()
    }

    /// Current usage of a provider
    #[must_use]
    pub fn status(&self, provider: ProviderId) -> UsageStatus {
        let now = self.clock.now();
        let mut usage = self.usage[provider].lock();
        usage.roll(now);
        usage.status()
    }

    /// Snapshot of every provider
    #[must_use]
    pub fn statistics(&self) -> BTreeMap<ProviderId, UsageStatus> {
        ProviderId::ALL
            .into_iter()
            .map(|id| (id, self.status(id)))
            .collect()
    }

    /// Mark the current minute window as exhausted after an upstream 429
    pub fn saturate_minute(&self, provider: ProviderId) {
        let now = self.clock.now();
        let mut usage = self.usage[provider].lock();
        usage.roll(now);
        if let Some(limit) = usage.quota.requests_per_minute {
            usage.minute.count = usage.minute.count.max(limit);
            tracing::debug!(provider = %provider, limit, "Minute window saturated by upstream rate limit");
        }
    }

    /// Current quota of a provider
    #[must_use]
    pub fn quota(&self, provider: ProviderId) -> Quota {
        self.usage[provider].lock().quota
    }

    /// Replace a provider's quota; counts are kept
    pub fn set_quota(&self, provider: ProviderId, quota: Quota) {
        self.usage[provider].lock().quota = quota;
    }

    /// Zero both windows of a provider
    pub fn reset(&self, provider: ProviderId) {
        let now = self.clock.now();
        let mut usage = self.usage[provider].lock();
        usage.minute = UsageWindow::new(WindowPeriod::Minute, now);
        usage.day = UsageWindow::new(WindowPeriod::Day, now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::Arc;
    use std::time::Duration;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 10, 9, 30, 15).unwrap()
    }

    fn tracker_with(quota: Quota) -> (RateLimitTracker, Arc<ManualClock>) {
        let clock = ManualClock::new(start());
        let tracker = RateLimitTracker::new(ProviderTable::from_fn(|_| quota), clock.clone());
        (tracker, clock)
    }

    #[test]
    fn test_windows_align_to_period_boundaries() {
        let at = start();
        assert_eq!(
            WindowPeriod::Minute.align(at),
            Utc.with_ymd_and_hms(2024, 5, 10, 9, 30, 0).unwrap()
        );
        assert_eq!(
            WindowPeriod::Day.align(at),
            Utc.with_ymd_and_hms(2024, 5, 10, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_budget_exhausts_at_limit() {
        let (tracker, _clock) = tracker_with(Quota::new(3, 100));
        let p = ProviderId::Gemini;

        for _ in 0..3 {
            assert!(tracker.is_within_budget(p));
            tracker.record_usage(p);
        }
        assert!(!tracker.is_within_budget(p));

        let status = tracker.status(p);
        assert_eq!(status.minute.usage, 3);
        assert_eq!(status.day.usage, 3);
        assert!((status.percentage() - 100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_minute_window_resets_exactly_at_boundary() {
        let (tracker, clock) = tracker_with(Quota::new(2, 100));
        let p = ProviderId::Groq;
        tracker.record_usage(p);
        tracker.record_usage(p);
        assert!(!tracker.is_within_budget(p));

        // 09:30:15 -> 09:30:59.999, still the same window
        clock.advance(Duration::from_millis(44_999));
        assert!(!tracker.is_within_budget(p));

        // 09:31:00.000, no traffic in between
        clock.advance(Duration::from_millis(1));
        assert!(tracker.is_within_budget(p));
        let status = tracker.status(p);
        assert_eq!(status.minute.usage, 0);
        assert_eq!(status.day.usage, 2);
        assert_eq!(
            status.minute.window_reset_at,
            Utc.with_ymd_and_hms(2024, 5, 10, 9, 32, 0).unwrap()
        );
    }

    #[test]
    fn test_day_window_blocks_until_midnight() {
        let (tracker, clock) = tracker_with(Quota::new(100, 2));
        let p = ProviderId::DeepSeek;
        tracker.record_usage(p);
        clock.advance(Duration::from_secs(3600));
        tracker.record_usage(p);

        clock.advance(Duration::from_secs(3600));
        assert!(!tracker.is_within_budget(p));

        clock.set(Utc.with_ymd_and_hms(2024, 5, 11, 0, 0, 0).unwrap());
        assert!(tracker.is_within_budget(p));
    }

    #[test]
    fn test_backward_clock_jump_never_rolls_or_decrements() {
        let (tracker, clock) = tracker_with(Quota::new(10, 100));
        let p = ProviderId::OpenAi;
        tracker.record_usage(p);
        tracker.record_usage(p);

        clock.set(start() - chrono::Duration::minutes(5));
        let status = tracker.status(p);
        assert_eq!(status.minute.usage, 2);
        assert_eq!(status.day.usage, 2);

        tracker.record_usage(p);
        assert_eq!(tracker.status(p).minute.usage, 3);
    }

    #[test]
    fn test_unlimited_provider_is_always_within_budget() {
        let (tracker, _clock) = tracker_with(Quota::unlimited());
        let p = ProviderId::Mistral;
        for _ in 0..10_000 {
            assert!(tracker.try_acquire(p));
        }
        let status = tracker.status(p);
        assert_eq!(status.minute.limit, None);
        assert_eq!(status.percentage(), 0.0);
        assert!(status.within_budget());
    }

    #[test]
    fn test_try_acquire_stops_at_limit() {
        let (tracker, _clock) = tracker_with(Quota::new(5, 100));
        let p = ProviderId::Anthropic;
        let granted = (0..8).filter(|_| tracker.try_acquire(p)).count();
        assert_eq!(granted, 5);
        assert_eq!(tracker.status(p).minute.usage, 5);
    }

    #[test]
    fn test_concurrent_try_acquire_never_overshoots() {
        let (tracker, _clock) = tracker_with(Quota::new(50, 1000));
        let tracker = Arc::new(tracker);
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let tracker = Arc::clone(&tracker);
                std::thread::spawn(move || {
                    (0..20)
                        .filter(|_| tracker.try_acquire(ProviderId::OpenAi))
                        .count()
                })
            })
            .collect();
        let granted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(granted, 50);
    }

    #[test]
    fn test_saturate_minute_only_with_limit() {
        let (tracker, _clock) = tracker_with(Quota::new(30, 1000));
        tracker.saturate_minute(ProviderId::Groq);
        assert!(!tracker.is_within_budget(ProviderId::Groq));
        assert_eq!(tracker.status(ProviderId::Groq).day.usage, 0);

        tracker.set_quota(ProviderId::Gemini, Quota::unlimited());
        tracker.saturate_minute(ProviderId::Gemini);
        assert!(tracker.is_within_budget(ProviderId::Gemini));
    }

    #[test]
    fn test_statistics_cover_every_provider() {
        let (tracker, _clock) = tracker_with(Quota::new(10, 100));
        tracker.record_usage(ProviderId::Groq);
        let stats = tracker.statistics();
        assert_eq!(stats.len(), ProviderId::COUNT);
        assert_eq!(stats[&ProviderId::Groq].minute.usage, 1);
        assert_eq!(stats[&ProviderId::OpenAi].minute.usage, 0);
    }
}
