//! Token-bucket rate limiting for the sender loop (component B).
//!
//! The lock-compute-then-sleep-outside-the-lock shape mirrors the teacher's
//! `DbSharedState::purge_expired_keys` / `purge_expired_tasks` pair in
//! `db.rs`: a synchronous critical section recomputes state and returns how
//! long to wait, the lock is released, and only then does the caller await a
//! timer (here, a bounded `sleep` instead of `sleep_until` combined with a
//! `Notify`, since nothing needs to wake this limiter early except
//! cancellation).

use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// A classic token bucket: refills continuously at `rate` tokens/second up to
/// `burst` tokens, lazily computed on each `acquire` rather than via a
/// background ticking task.
#[derive(Debug)]
pub struct TokenBucket {
    rate: f64,
    burst: f64,
    state: Mutex<BucketState>,
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Error returned when the caller's cancellation fired while waiting for a
/// token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cancelled;

impl TokenBucket {
    /// `rate <= 0.0` or non-finite disables limiting entirely: every
    /// `acquire` returns immediately. This is how `spec.md` scenario 1
    /// ("rate=∞") is realized.
    pub fn new(rate_per_sec: f64, burst: u32) -> Self {
        Self {
            rate: rate_per_sec,
            burst: burst as f64,
            state: Mutex::new(BucketState { tokens: burst as f64, last_refill: Instant::now() }),
        }
    }

    fn unlimited(&self) -> bool {
        !self.rate.is_finite() || self.rate <= 0.0
    }

    /// Wait until a token is available, consuming it, or until `cancel`
    /// fires. The wait is re-evaluated in a loop because the bucket may have
    /// been refilled by the time the computed sleep elapses (no-op in
    /// practice for a single waiter, but keeps this correct if multiple
    /// sender loops ever shared one bucket).
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<(), Cancelled> {
        if self.unlimited() {
            return Ok(());
        }
        loop {
            let wait = {
                let mut state = self.state.lock().expect("token bucket lock poisoned");
                self.refill(&mut state);
                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    return Ok(());
                }
                let deficit = 1.0 - state.tokens;
                Duration::from_secs_f64(deficit / self.rate)
            };

            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = cancel.cancelled() => return Err(Cancelled),
            }
        }
    }

    fn refill(&self, state: &mut BucketState) {
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.rate).min(self.burst);
        state.last_refill = now;
    }
}
