// =============================================================================
// Token Bucket — process-wide gate on outbound broker calls
// =============================================================================
//
// Capacity is the configured burst; tokens refill continuously at
// capacity / window. Every broker call acquires one token before hitting the
// network, so a burst of parallel per-instrument fetches cannot exceed the
// sustained rate the upstream allows. The broker here reports no usage
// headers, so the bucket is entirely self-clocked.

use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::debug;

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Thread-safe token bucket. Shared process-wide behind an `Arc`.
pub struct TokenBucket {
    capacity: f64,
    refill_per_sec: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// Bucket holding at most `capacity` tokens, refilled evenly over
    /// `window`.
    pub fn new(capacity: u32, window: Duration) -> Self {
        let capacity = f64::from(capacity.max(1));
        let window_secs = window.as_secs_f64().max(0.001);
        Self {
            capacity,
            refill_per_sec: capacity / window_secs,
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    fn refill(&self, state: &mut BucketState) {
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        state.last_refill = now;
    }

    /// Take a token if one is available right now.
    pub fn try_acquire(&self) -> bool {
        let mut state = self.state.lock();
        self.refill(&mut state);
        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Wait until a token is available, then take it.
    ///
    /// The lock is never held across an await: each iteration samples the
    /// deficit, sleeps just long enough for one token to accrue, and retries.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock();
                self.refill(&mut state);
                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    return;
                }
                let deficit = 1.0 - state.tokens;
                Duration::from_secs_f64(deficit / self.refill_per_sec)
            };
            debug!(wait_ms = wait.as_millis() as u64, "rate limit reached, waiting for refill");
            tokio::time::sleep(wait).await;
        }
    }

    /// Current token count (diagnostic).
    pub fn available(&self) -> f64 {
        let mut state = self.state.lock();
        self.refill(&mut state);
        state.tokens
    }
}

impl std::fmt::Debug for TokenBucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenBucket")
            .field("capacity", &self.capacity)
            .field("refill_per_sec", &self.refill_per_sec)
            .field("available", &self.available())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn burst_up_to_capacity_then_blocks() {
        let bucket = TokenBucket::new(3, Duration::from_secs(60));
        assert!(bucket.try_acquire());
        assert!(bucket.try_acquire());
        assert!(bucket.try_acquire());
        assert!(!bucket.try_acquire());
    }

    #[test]
    fn tokens_refill_over_time() {
        // 100 tokens per 100 ms = one per millisecond.
        let bucket = TokenBucket::new(100, Duration::from_millis(100));
        while bucket.try_acquire() {}
        assert!(!bucket.try_acquire());

        std::thread::sleep(Duration::from_millis(20));
        assert!(bucket.try_acquire(), "refill should have produced tokens");
    }

    #[test]
    fn refill_never_exceeds_capacity() {
        let bucket = TokenBucket::new(5, Duration::from_millis(10));
        std::thread::sleep(Duration::from_millis(50));
        assert!(bucket.available() <= 5.0 + f64::EPSILON);
    }

    #[tokio::test]
    async fn acquire_waits_for_a_token() {
        let bucket = TokenBucket::new(2, Duration::from_millis(100));
        bucket.acquire().await;
        bucket.acquire().await;

        let start = Instant::now();
        bucket.acquire().await; // must wait ~50 ms for the next token
        assert!(start.elapsed() >= Duration::from_millis(20));
    }
}
