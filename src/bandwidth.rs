//! C8: process-wide bandwidth limiting via a token bucket, shared across all
//! connections so the aggregate egress/ingress rate (not just per-connection
//! rate) is bounded.

use std::sync::Mutex;
use std::time::{Duration, Instant};

/// A single-direction token bucket. `bits_per_sec` tokens refill every
/// second, up to a burst size of `bucket_size` (in bits); a reservation for
/// `n` bits blocks until `n` tokens are available, then debits them.
///
/// Disabled (`bits_per_sec == 0`) buckets never block: `reserve` returns
/// immediately, matching spec's `bandwidth_disable` no-op mode.
///
/// Refill is time-based rather than event-based (there is no write that
/// could free up tokens early, only the clock), so waiters simply poll at a
/// fixed interval rather than waiting on a `Notify` that nothing would ever
/// signal ahead of that same interval.
pub struct TokenBucket {
    inner: Mutex<Inner>,
    bits_per_sec: u64,
    bucket_size: u64,
}

struct Inner {
    tokens: u64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(bits_per_sec: u64, bucket_size: u64) -> Self {
        Self {
            inner: Mutex::new(Inner {
                tokens: bucket_size,
                last_refill: Instant::now(),
            }),
            bits_per_sec,
            bucket_size,
        }
    }

    /// A bucket that never throttles, for `bandwidth_disable = true`.
    pub fn disabled() -> Self {
        Self::new(0, 0)
    }

    pub fn is_disabled(&self) -> bool {
        self.bits_per_sec == 0
    }

    /// Blocks until `bits` tokens are available, then debits them.
    ///
    /// A reservation larger than the bucket's burst size is granted once the
    /// bucket has been refilled to its full `bucket_size`, rather than
    /// blocking forever (a single piece may be larger than one second's
    /// worth of tokens).
    pub async fn reserve(&self, bits: u64) {
        if self.is_disabled() {
            return;
        }
        loop {
            {
                let mut inner = self.inner.lock().unwrap();
                self.refill(&mut inner);
                let need = bits.min(self.bucket_size);
                if inner.tokens >= need {
                    inner.tokens -= need;
                    return;
                }
            }
            // wait for the next refill tick rather than busy-looping.
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    fn refill(&self, inner: &mut Inner) {
        let now = Instant::now();
        let elapsed = now.duration_since(inner.last_refill);
        if elapsed.is_zero() {
            return;
        }
        let added = (elapsed.as_secs_f64() * self.bits_per_sec as f64) as u64;
        if added > 0 {
            inner.tokens = (inner.tokens + added).min(self.bucket_size);
            inner.last_refill = now;
        }
    }
}

/// The process-wide egress and ingress limiters, constructed once by the
/// scheduler from [`crate::conf::TorrentConf`] and shared (via `Arc`) with
/// every connection.
pub struct BandwidthLimiter {
    pub egress: TokenBucket,
    pub ingress: TokenBucket,
}

impl BandwidthLimiter {
    pub fn new(egress_bits_per_sec: u64, ingress_bits_per_sec: u64, token_size: u64, disabled: bool) -> Self {
        if disabled {
            Self {
                egress: TokenBucket::disabled(),
                ingress: TokenBucket::disabled(),
            }
        } else {
            Self {
                egress: TokenBucket::new(egress_bits_per_sec, token_size),
                ingress: TokenBucket::new(ingress_bits_per_sec, token_size),
            }
        }
    }

    pub async fn reserve_egress(&self, bytes: usize) {
        self.egress.reserve(bytes as u64 * 8).await;
    }

    pub async fn reserve_ingress(&self, bytes: usize) {
        self.ingress.reserve(bytes as u64 * 8).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn disabled_bucket_never_blocks() {
        let bucket = TokenBucket::disabled();
        tokio::time::timeout(Duration::from_millis(50), bucket.reserve(1_000_000_000))
            .await
            .expect("disabled bucket must not block");
    }

    #[tokio::test]
    async fn burst_within_bucket_is_immediate() {
        let bucket = TokenBucket::new(8_000, 8_000);
        tokio::time::timeout(Duration::from_millis(50), bucket.reserve(1_000))
            .await
            .expect("reservation within the full bucket should not block");
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_bucket_waits_for_refill() {
        let bucket = TokenBucket::new(8_000, 1_000);
        bucket.reserve(1_000).await;
        // bucket is now empty; a further reservation must wait for refill
        let start = Instant::now();
        bucket.reserve(1_000).await;
        assert!(Instant::now() >= start);
    }
}
