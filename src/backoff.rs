//! A shared exponential-backoff-with-jitter helper (spec §9's "transient
//! error budget" and blacklist escalation both reduce to the same
//! `min(base * 2^n, max)` shape; this is the one place that shape lives).

use std::time::Duration;

use rand::Rng;

/// Computes successive retry delays for a failure counter, capped at
/// `max` and randomized by up to 20% to avoid synchronized retries across a
/// swarm (thundering-herd avoidance when many peers lose a tracker or a
/// connection at the same time).
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    /// The delay before the `attempt`-th retry (`attempt` is 0 for the first
    /// retry after the first failure).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.min(31);
        let scaled = self.base.checked_mul(1u32 << exp).unwrap_or(self.max);
        jitter(scaled).min(self.max)
    }
}

fn jitter(d: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range(0.8..1.2);
    Duration::from_secs_f64(d.as_secs_f64() * factor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grows_exponentially_up_to_max() {
        let backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(100));
        // jitter is +-20%, so compare against a tolerant range
        let d0 = backoff.delay(0).as_secs_f64();
        assert!((0.8..=1.2).contains(&d0));
        let d3 = backoff.delay(3).as_secs_f64();
        assert!((6.4..=9.6).contains(&d3));
    }

    #[test]
    fn never_exceeds_max() {
        let backoff = Backoff::new(Duration::from_secs(30), Duration::from_secs(60));
        for attempt in 0..50 {
            assert!(backoff.delay(attempt) <= Duration::from_secs(60));
        }
    }
}
