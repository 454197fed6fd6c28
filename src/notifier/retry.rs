//! The smart retry policy from spec section 4.B: distinguishes terminal from
//! transient failures, honors a backend-supplied retry-after hint over the
//! local base delay, and allows exactly one markup-fallback retry beyond the
//! normal attempt budget.
//!
//! This is a pure decision object — it performs no I/O or sleeping itself,
//! so it can be unit tested attempt-by-attempt without a runtime. `sender`
//! drives it and owns the actual waiting (so cancellation composition stays
//! in one place, per the concurrency model). The classification input/output
//! shape is grounded on `jdertmann-AllrisBot/bot-utils/src/broadcasting.rs`'s
//! `handle_response`, which resolves a Telegram response into exactly the
//! same four buckets (success, retry-with-backoff, reschedule, give up).

use std::time::Duration;

use crate::backend::SendOutcome;

/// What the sender loop should do after the most recent attempt.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RetryDecision {
    /// No further attempts: either delivered, or the failure is terminal, or
    /// the attempt/markup-fallback budget is exhausted.
    Stop,
    /// Wait `delay`, then attempt again. `use_html` tells the sender loop
    /// whether to request markup on the next attempt (`false` only for the
    /// one-shot markup-fallback retry).
    RetryAfter { delay: Duration, use_html: bool },
}

/// Per-request retry state. One instance is created per notification and
/// discarded after the request reaches a terminal decision.
#[derive(Debug)]
pub struct RetryPolicy {
    max_retries: u32,
    base_delay: Duration,
    attempts: u32,
    markup_fallback_used: bool,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self { max_retries, base_delay, attempts: 0, markup_fallback_used: false }
    }

    /// Total attempts made so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Call once immediately before making an attempt.
    pub fn record_attempt(&mut self) {
        self.attempts += 1;
    }

    /// Decide what to do after an attempt made with `used_html` returned
    /// `outcome`.
    pub fn decide(&mut self, outcome: &SendOutcome, used_html: bool) -> RetryDecision {
        match outcome {
            SendOutcome::Success => RetryDecision::Stop,
            // Terminal failures produce exactly one attempt: no retry ever.
            SendOutcome::Terminal(_) => RetryDecision::Stop,
            SendOutcome::MarkupRejected => {
                if used_html && !self.markup_fallback_used {
                    self.markup_fallback_used = true;
                    // Immediate retry in plain text; this attempt is granted
                    // even if the normal attempt budget is already spent.
                    RetryDecision::RetryAfter { delay: Duration::ZERO, use_html: false }
                } else {
                    RetryDecision::Stop
                }
            }
            SendOutcome::RateLimited { retry_after } => {
                if self.attempts >= self.max_retries {
                    RetryDecision::Stop
                } else {
                    // The backend's hint is authoritative; never add it to
                    // the local base delay.
                    RetryDecision::RetryAfter { delay: *retry_after, use_html: used_html }
                }
            }
            SendOutcome::Transient(_) => {
                if self.attempts >= self.max_retries {
                    RetryDecision::Stop
                } else {
                    RetryDecision::RetryAfter { delay: self.base_delay, use_html: used_html }
                }
            }
        }
    }
}
