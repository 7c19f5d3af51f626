//! Latency tracking against the session server
//!
//! Every outbound `State` stamps `clientLatencyCalculation` with the local
//! wall clock; the server echoes it back together with its own view of the
//! round trip (`serverRtt`). From those we keep a short RTT history and an
//! estimate of how old an incoming authoritative position already is.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::RwLock;

/// Number of RTT samples to keep for averaging
const RTT_SAMPLE_COUNT: usize = 5;

/// Seconds since the Unix epoch, as carried in ping fields
pub fn wall_clock_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

#[derive(Debug, Default)]
pub struct LatencyTracker {
    /// Recent RTT samples in seconds
    samples: Vec<f64>,
    /// Cached average RTT
    avg_rtt: f64,
    /// Most recent RTT
    last_rtt: f64,
    /// Estimated age of server state on arrival
    forward_delay: f64,
}

impl LatencyTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }

    /// Record an echoed probe. `sent_at` is our own stamp coming back, `now`
    /// the local wall clock on arrival. Returns the measured RTT if valid.
    pub fn record(&mut self, sent_at: f64, server_rtt: f64, now: f64) -> Option<f64> {
        let rtt = now - sent_at;
        if !rtt.is_finite() || rtt < 0.0 || server_rtt < 0.0 {
            tracing::debug!("Ignoring bogus latency sample: rtt={:.3}s server_rtt={:.3}s", rtt, server_rtt);
            return None;
        }

        if self.samples.len() >= RTT_SAMPLE_COUNT {
            self.samples.remove(0);
        }
        self.samples.push(rtt);
        self.avg_rtt = self.samples.iter().sum::<f64>() / self.samples.len() as f64;
        self.last_rtt = rtt;

        self.forward_delay = self.avg_rtt / 2.0 + (rtt - server_rtt).max(0.0);

        tracing::debug!(
            "Latency: rtt={:.0}ms avg={:.0}ms forward_delay={:.0}ms",
            rtt * 1000.0,
            self.avg_rtt * 1000.0,
            self.forward_delay * 1000.0
        );
        Some(rtt)
    }

    /// Last measured RTT in seconds (0 before the first sample)
    pub fn rtt(&self) -> f64 {
        self.last_rtt
    }

    pub fn average_rtt(&self) -> f64 {
        self.avg_rtt
    }

    /// Seconds to age incoming authoritative positions by
    pub fn forward_delay(&self) -> f64 {
        self.forward_delay
    }
}

/// Thread-safe wrapper for LatencyTracker
pub type SharedLatencyTracker = Arc<RwLock<LatencyTracker>>;

pub fn new_shared_tracker() -> SharedLatencyTracker {
    Arc::new(RwLock::new(LatencyTracker::new()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_averaging_window() {
        let mut tracker = LatencyTracker::new();
        for (i, rtt) in [0.1, 0.2, 0.15].iter().enumerate() {
            let now = 100.0 + i as f64;
            tracker.record(now - rtt, 0.0, now);
        }
        assert!((tracker.average_rtt() - 0.15).abs() < 1e-9);

        for i in 0..10 {
            let now = 200.0 + i as f64;
            tracker.record(now - 0.05, 0.0, now);
        }
        assert!((tracker.average_rtt() - 0.05).abs() < 1e-9);
        assert_eq!(tracker.samples.len(), RTT_SAMPLE_COUNT);
    }

    #[test]
    fn test_forward_delay() {
        let mut tracker = LatencyTracker::new();
        // rtt 0.2, server saw 0.1: half the average plus the excess
        tracker.record(9.8, 0.1, 10.0);
        assert!((tracker.forward_delay() - (0.1 + 0.1)).abs() < 1e-9);

        // server saw a longer trip than us: no excess term
        let mut tracker = LatencyTracker::new();
        tracker.record(9.8, 0.5, 10.0);
        assert!((tracker.forward_delay() - 0.1).abs() < 1e-9);
    }

    #[test]
    fn test_rejects_negative_rtt() {
        let mut tracker = LatencyTracker::new();
        assert!(tracker.record(11.0, 0.0, 10.0).is_none());
        assert_eq!(tracker.rtt(), 0.0);
        assert!(tracker.record(9.0, -1.0, 10.0).is_none());
    }

    #[test]
    fn test_wall_clock_is_recent() {
        assert!(wall_clock_secs() > 1_600_000_000.0);
    }
}
