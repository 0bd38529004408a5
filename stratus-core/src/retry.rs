//! Reconnect policy shared by every transport adapter.
//!
//! On unexpected disconnect an adapter consults its [`RetryState`]: while
//! the attempt budget lasts, it reconnects after a fixed delay; once the
//! budget is exhausted it gives up and the failure becomes observable to
//! the owner. A successful reconnect resets the counter. An explicit
//! `close()` never triggers the policy.

use std::time::Duration;

/// Lifecycle of one adapter's connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No connection and none in progress.
    Disconnected,
    /// Handshake in flight.
    Connecting,
    /// Live connection.
    Connected,
    /// Explicitly terminated by the owner; no reconnects follow.
    Closing,
}

/// Reconnect configuration: attempt budget and fixed delay.
///
/// `attempts == 0` disables automatic reconnection entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of reconnect attempts after an unexpected close.
    pub attempts: u32,
    /// Fixed delay before each attempt.
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 0,
            delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Create a policy with no automatic reconnection.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the reconnect attempt budget.
    #[must_use]
    pub fn attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    /// Set the fixed delay between attempts.
    #[must_use]
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

/// What to do after an unexpected disconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectDecision {
    /// Schedule one reconnect attempt after `delay`.
    Retry {
        /// 1-based number of this attempt.
        attempt: u32,
        /// Delay before the attempt.
        delay: Duration,
    },
    /// The budget is exhausted (or reconnection is disabled).
    GiveUp,
}

/// Per-adapter attempt counter driving the reconnect state machine.
#[derive(Debug, Clone)]
pub struct RetryState {
    policy: RetryPolicy,
    attempt: u32,
}

impl RetryState {
    /// Create a fresh state for the given policy.
    #[must_use]
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy, attempt: 0 }
    }

    /// Record an unexpected disconnect and decide the next step.
    pub fn on_disconnect(&mut self) -> ReconnectDecision {
        if self.policy.attempts == 0 || self.attempt >= self.policy.attempts {
            return ReconnectDecision::GiveUp;
        }
        self.attempt += 1;
        ReconnectDecision::Retry {
            attempt: self.attempt,
            delay: self.policy.delay,
        }
    }

    /// Record a successful reconnect, resetting the attempt counter.
    pub fn on_connected(&mut self) {
        self.attempt = 0;
    }

    /// Number of attempts made since the last successful connect.
    #[must_use]
    pub fn attempts_made(&self) -> u32 {
        self.attempt
    }

    /// The policy this state was built from.
    #[must_use]
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_attempt_budget() {
        let mut state = RetryState::new(RetryPolicy::new().attempts(3).delay(Duration::ZERO));

        for expected in 1..=3 {
            match state.on_disconnect() {
                ReconnectDecision::Retry { attempt, delay } => {
                    assert_eq!(attempt, expected);
                    assert_eq!(delay, Duration::ZERO);
                }
                ReconnectDecision::GiveUp => panic!("gave up early at attempt {expected}"),
            }
        }

        // budget of 3 is spent: nothing further is scheduled
        assert_eq!(state.on_disconnect(), ReconnectDecision::GiveUp);
        assert_eq!(state.on_disconnect(), ReconnectDecision::GiveUp);
    }

    #[test]
    fn test_zero_attempts_disables_reconnect() {
        let mut state = RetryState::new(RetryPolicy::new());
        assert_eq!(state.on_disconnect(), ReconnectDecision::GiveUp);
    }

    #[test]
    fn test_successful_reconnect_resets_counter() {
        let mut state = RetryState::new(RetryPolicy::new().attempts(2));

        assert!(matches!(
            state.on_disconnect(),
            ReconnectDecision::Retry { attempt: 1, .. }
        ));
        state.on_connected();
        assert_eq!(state.attempts_made(), 0);
        assert!(matches!(
            state.on_disconnect(),
            ReconnectDecision::Retry { attempt: 1, .. }
        ));
    }

    #[test]
    fn test_fixed_delay_not_exponential() {
        let delay = Duration::from_millis(250);
        let mut state = RetryState::new(RetryPolicy::new().attempts(3).delay(delay));

        for _ in 0..3 {
            match state.on_disconnect() {
                ReconnectDecision::Retry { delay: d, .. } => assert_eq!(d, delay),
                ReconnectDecision::GiveUp => panic!("unexpected give-up"),
            }
        }
    }
}
