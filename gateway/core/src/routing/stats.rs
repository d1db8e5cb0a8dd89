//! Per-channel Statistics
//!
//! Rolling success/failure counters and an exponentially weighted latency
//! average per channel. Each channel's record sits in its own map shard, so
//! updates for different channels never contend and commute with each
//! other.

use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;

use super::channel::ChannelId;

/// EMA smoothing factor for latency
pub const DEFAULT_LATENCY_ALPHA: f64 = 0.3;

/// Counters for one channel
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ChannelStats {
    pub channel_id: ChannelId,
    pub success_count: u64,
    pub failure_count: u64,
    pub total_count: u64,
    /// EMA of successful request latency; `None` until the first success
    pub avg_latency_ms: Option<f64>,
    pub consecutive_failures: u32,
    pub last_used_at: Option<DateTime<Utc>>,
    pub last_failed_at: Option<DateTime<Utc>>,
    pub last_failure_reason: Option<String>,
}

impl ChannelStats {
    fn new(channel_id: ChannelId) -> Self {
        Self {
            channel_id,
            success_count: 0,
            failure_count: 0,
            total_count: 0,
            avg_latency_ms: None,
            consecutive_failures: 0,
            last_used_at: None,
            last_failed_at: None,
            last_failure_reason: None,
        }
    }

    /// Fraction of requests that succeeded (1.0 with no traffic)
    pub fn success_rate(&self) -> f64 {
        if self.total_count == 0 {
            return 1.0;
        }
        self.success_count as f64 / self.total_count as f64
    }
}

/// Concurrent map of channel id to [`ChannelStats`]
#[derive(Debug)]
pub struct StatsTracker {
    stats: DashMap<ChannelId, ChannelStats>,
    alpha: f64,
}

impl Default for StatsTracker {
    fn default() -> Self {
        Self::new(DEFAULT_LATENCY_ALPHA)
    }
}

impl StatsTracker {
    /// Tracker with the given EMA factor (clamped to (0, 1])
    pub fn new(alpha: f64) -> Self {
        let alpha = if alpha > 0.0 && alpha <= 1.0 {
            alpha
        } else {
            DEFAULT_LATENCY_ALPHA
        };
        Self {
            stats: DashMap::new(),
            alpha,
        }
    }

    /// Record a successful request and fold its latency into the average
    pub fn record_success(&self, channel_id: ChannelId, latency: Duration) {
        let latency_ms = latency.as_micros() as f64 / 1000.0;
        let mut entry = self
            .stats
            .entry(channel_id)
            .or_insert_with(|| ChannelStats::new(channel_id));
        entry.success_count += 1;
        entry.total_count += 1;
        entry.consecutive_failures = 0;
        entry.last_used_at = Some(Utc::now());
        entry.avg_latency_ms = Some(match entry.avg_latency_ms {
            Some(avg) => self.alpha * latency_ms + (1.0 - self.alpha) * avg,
            None => latency_ms,
        });
    }

    /// Record a failure; returns the consecutive-failure count afterwards
    pub fn record_failure(&self, channel_id: ChannelId, reason: &str) -> u32 {
        let now = Utc::now();
        let mut entry = self
            .stats
            .entry(channel_id)
            .or_insert_with(|| ChannelStats::new(channel_id));
        entry.failure_count += 1;
        entry.total_count += 1;
        entry.consecutive_failures += 1;
        entry.last_used_at = Some(now);
        entry.last_failed_at = Some(now);
        entry.last_failure_reason = Some(reason.to_string());
        entry.consecutive_failures
    }

    /// Latency average, if the channel has completed a request
    pub fn average_latency(&self, channel_id: ChannelId) -> Option<f64> {
        self.stats.get(&channel_id).and_then(|s| s.avg_latency_ms)
    }

    /// Copy of one channel's stats
    pub fn get(&self, channel_id: ChannelId) -> Option<ChannelStats> {
        self.stats.get(&channel_id).map(|s| s.clone())
    }

    /// Copy of every channel's stats, ordered by id
    pub fn snapshot(&self) -> Vec<ChannelStats> {
        let mut all: Vec<ChannelStats> = self.stats.iter().map(|s| s.clone()).collect();
        all.sort_by_key(|s| s.channel_id);
        all
    }

    /// Forget one channel
    pub fn reset(&self, channel_id: ChannelId) {
        self.stats.remove(&channel_id);
    }

    /// Forget everything
    pub fn clear(&self) {
        self.stats.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_sample_sets_average() {
        let tracker = StatsTracker::default();
        tracker.record_success(1, Duration::from_millis(200));
        assert_eq!(tracker.average_latency(1), Some(200.0));

        tracker.record_success(1, Duration::from_millis(100));
        // 0.3 * 100 + 0.7 * 200
        let avg = tracker.average_latency(1).unwrap();
        assert!((avg - 170.0).abs() < 1e-9);
    }

    #[test]
    fn test_failures_do_not_move_latency() {
        let tracker = StatsTracker::default();
        assert_eq!(tracker.record_failure(1, "timeout"), 1);
        assert_eq!(tracker.record_failure(1, "timeout"), 2);
        assert_eq!(tracker.average_latency(1), None);

        tracker.record_success(1, Duration::from_millis(50));
        let stats = tracker.get(1).unwrap();
        assert_eq!(stats.consecutive_failures, 0);
        assert_eq!(stats.failure_count, 2);
        assert_eq!(stats.total_count, 3);
        assert_eq!(stats.last_failure_reason.as_deref(), Some("timeout"));
        assert!((stats.success_rate() - 1.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_concurrent_updates_commute() {
        let tracker = std::sync::Arc::new(StatsTracker::default());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let tracker = std::sync::Arc::clone(&tracker);
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        tracker.record_success(i % 2, Duration::from_millis(10));
                        tracker.record_failure(i % 2, "x");
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let snapshot = tracker.snapshot();
        assert_eq!(snapshot.len(), 2);
        for stats in snapshot {
            assert_eq!(stats.success_count, 4000);
            assert_eq!(stats.failure_count, 4000);
            assert_eq!(stats.total_count, 8000);
        }
    }

    #[test]
    fn test_invalid_alpha_falls_back() {
        let tracker = StatsTracker::new(0.0);
        tracker.record_success(1, Duration::from_millis(100));
        tracker.record_success(1, Duration::from_millis(200));
        let avg = tracker.average_latency(1).unwrap();
        assert!((avg - 130.0).abs() < 1e-9);
    }
}
