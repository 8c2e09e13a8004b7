//! Wait and back-off policy
//!
//! Both sides coordinate by spin-polling the shared region with a short sleep
//! between polls. All intervals and retry budgets live here so tests can swap
//! in [`PollPolicy::immediate`] instead of real sleeping.

use std::time::Duration;

/// Retry budgets and poll intervals
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollPolicy {
    /// Attempts to open the shared region before giving up (sender)
    pub connect_attempts: u32,
    /// Delay between open attempts
    pub connect_interval: Duration,
    /// Polls of `ready` before reporting the receiver unavailable (sender)
    pub ready_attempts: u32,
    /// Delay between `ready` polls
    pub ready_interval: Duration,
    /// Delay between `msg_len` and `done` polls (receiver)
    pub length_interval: Duration,
    /// Delay between `turn` polls on the receiver side
    pub receiver_turn_interval: Duration,
    /// Delay between `turn` polls on the sender side
    pub sender_turn_interval: Duration,
    /// Spin iterations after a cache operation before handing over the turn
    pub settle_spins: u32,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            connect_attempts: 10_000,
            connect_interval: Duration::from_millis(1),
            ready_attempts: 5_000,
            ready_interval: Duration::from_millis(1),
            length_interval: Duration::from_millis(1),
            receiver_turn_interval: Duration::from_micros(100),
            sender_turn_interval: Duration::from_micros(50),
            settle_spins: 400,
        }
    }
}

impl PollPolicy {
    /// Zero-delay policy: every wait yields the thread instead of sleeping
    pub fn immediate() -> Self {
        Self {
            connect_interval: Duration::ZERO,
            ready_interval: Duration::ZERO,
            length_interval: Duration::ZERO,
            receiver_turn_interval: Duration::ZERO,
            sender_turn_interval: Duration::ZERO,
            settle_spins: 0,
            ..Self::default()
        }
    }
}

/// Back off between two polls
#[inline]
pub fn backoff(interval: Duration) {
    if interval.is_zero() {
        std::thread::yield_now();
    } else {
        std::thread::sleep(interval);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_matches_reference_timings() {
        let policy = PollPolicy::default();
        assert_eq!(policy.ready_attempts, 5_000);
        assert_eq!(policy.receiver_turn_interval, Duration::from_micros(100));
        assert_eq!(policy.sender_turn_interval, Duration::from_micros(50));
    }

    #[test]
    fn test_immediate_keeps_budgets() {
        let policy = PollPolicy::immediate();
        assert_eq!(policy.ready_attempts, PollPolicy::default().ready_attempts);
        assert!(policy.ready_interval.is_zero());
        assert_eq!(policy.settle_spins, 0);
    }
}
