//! Exponential reconnect backoff with jitter

use std::time::Duration;

use rand::Rng;

use crate::config::ReconnectPolicy;

#[derive(Debug, Clone)]
pub struct Backoff {
    policy: ReconnectPolicy,
    attempt: u32,
}

impl Backoff {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self { policy, attempt: 0 }
    }

    /// Attempts handed out so far
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Delay before the next attempt, or `None` once attempts are exhausted
    pub fn next_delay(&mut self) -> Option<Duration> {
        if let Some(max) = self.policy.max_attempts {
            if self.attempt >= max {
                return None;
            }
        }

        let base = self.base_delay(self.attempt);
        let jitter = self.policy.jitter.clamp(0.0, 0.99);
        let factor = if jitter > 0.0 {
            1.0 + rand::thread_rng().gen_range(-jitter..=jitter)
        } else {
            1.0
        };
        self.attempt += 1;

        let max = self.policy.max_delay.as_secs_f64();
        Some(Duration::from_secs_f64((base * factor).clamp(0.0, max)))
    }

    /// Un-jittered delay for a zero-based attempt, capped at `max_delay`
    fn base_delay(&self, attempt: u32) -> f64 {
        let initial = self.policy.initial_delay.as_secs_f64();
        let max = self.policy.max_delay.as_secs_f64();
        let exp = self.policy.multiplier.max(1.0).powi(attempt.min(64) as i32);
        (initial * exp).min(max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(jitter: f64, max_attempts: Option<u32>) -> ReconnectPolicy {
        ReconnectPolicy {
            jitter,
            max_attempts,
            ..ReconnectPolicy::default()
        }
    }

    #[test]
    fn test_doubles_until_cap() {
        let mut backoff = Backoff::new(policy(0.0, None));
        let delays: Vec<u64> = (0..7)
            .map(|_| backoff.next_delay().unwrap().as_secs())
            .collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 30, 30]);
    }

    #[test]
    fn test_jitter_stays_in_band() {
        let mut backoff = Backoff::new(policy(0.2, None));
        for _ in 0..50 {
            backoff.reset();
            let d = backoff.next_delay().unwrap().as_secs_f64();
            assert!((0.79..=1.21).contains(&d), "delay {d} outside jitter band");
        }
    }

    #[test]
    fn test_attempts_exhaust() {
        let mut backoff = Backoff::new(policy(0.0, Some(2)));
        assert!(backoff.next_delay().is_some());
        assert!(backoff.next_delay().is_some());
        assert!(backoff.next_delay().is_none());
        assert_eq!(backoff.attempt(), 2);
        backoff.reset();
        assert!(backoff.next_delay().is_some());
    }
}
