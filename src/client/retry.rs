//! Reconnect policy.
//!
//! After a socket closes while someone still needs it, the engine asks
//! [`RetryPolicy::decide`] what to do next.
//!
//! | Problem | Decision |
//! |---------|----------|
//! | Fatal close code | [`Decision::Fatal`] |
//! | Client disposed | [`Decision::Stop`] |
//! | `1000` with subscribers left | [`Decision::Reconnect`] |
//! | `1000` with nobody left | [`Decision::Stop`] |
//! | Attempts exhausted or `should_retry` refuses | [`Decision::Fatal`] |
//! | Anything else | [`Decision::Wait`] |

// ============================================================================
// Imports
// ============================================================================

use std::time::Duration;

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use rand::Rng;

use crate::error::SubscriptionError;
use crate::protocol::{CloseCode, is_fatal_internal_close_code, is_terminal_protocol_close_code};

use super::options::ShouldRetryFn;

// ============================================================================
// Defaults
// ============================================================================

/// Randomised exponential backoff: `1s * 2^retries` plus 300 to 3000 ms.
pub fn default_retry_wait(retries: u32) -> BoxFuture<'static, ()> {
    let delay = retry_delay(retries, rand::rng().random_range(300..3000));
    tokio::time::sleep(delay).boxed()
}

/// Retries every problem that is not fatal.
pub fn default_should_retry(_problem: &SubscriptionError) -> bool {
    true
}

/// Backoff for `retries` previous attempts with the given jitter.
fn retry_delay(retries: u32, jitter_ms: u64) -> Duration {
    let base_ms = 1000u64.saturating_mul(1u64 << retries.min(30));
    Duration::from_millis(base_ms.saturating_add(jitter_ms))
}

// ============================================================================
// Decision
// ============================================================================

/// What to do after a connection problem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Decision {
    /// Report the problem to every subscriber.
    Fatal,
    /// Do nothing.
    Stop,
    /// Connect again right away without counting an attempt.
    Reconnect,
    /// Wait, then connect again.
    Wait,
}

/// Returns `true` for close codes that are reported without retrying.
pub(crate) fn is_fatal_close(problem: &SubscriptionError) -> bool {
    problem.close_code().is_some_and(|code| {
        is_fatal_internal_close_code(code) || is_terminal_protocol_close_code(code)
    })
}

// ============================================================================
// RetryPolicy
// ============================================================================

/// Retry budget and predicate.
pub(crate) struct RetryPolicy {
    pub(crate) attempts: u32,
    pub(crate) should_retry: ShouldRetryFn,
}

impl RetryPolicy {
    /// Classifies a problem.
    ///
    /// `retries` is the number of reconnects already made since the last
    /// acknowledged connection; `locks` counts who still needs a connection.
    pub(crate) fn decide(
        &self,
        problem: &SubscriptionError,
        disposed: bool,
        retries: u32,
        locks: usize,
    ) -> Decision {
        if is_fatal_close(problem) {
            return Decision::Fatal;
        }
        if disposed {
            return Decision::Stop;
        }
        if problem.close_code() == Some(CloseCode::NormalClosure.code()) {
            return if locks > 0 {
                Decision::Reconnect
            } else {
                Decision::Stop
            };
        }
        if self.attempts == 0 || retries >= self.attempts {
            return Decision::Fatal;
        }
        if !(self.should_retry)(problem) {
            return Decision::Fatal;
        }
        Decision::Wait
    }
}

// ============================================================================
// Tests
// ============================================================================
