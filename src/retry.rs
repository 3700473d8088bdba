use std::error;
use std::fmt;
use std::time::Duration;

/// Retransmissions allowed per block wait before the session gives up.
pub const MAX_RETRIES: u32 = 3;

/// Signals that a block wait has timed out more times than the policy allows.
#[derive(Debug, PartialEq)]
pub struct RetriesExhausted;

impl error::Error for RetriesExhausted {}

impl fmt::Display for RetriesExhausted {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "retry limit of {MAX_RETRIES} reached")
    }
}

/// Pure retransmission state: how long each wait may take, and how many
/// timeouts have accumulated for the block currently being waited on.
///
/// Only timeouts consume attempts. A stale-ack retransmission re-enters the
/// wait without touching the counter, and the counter is reset whenever the
/// session starts waiting on a new block.
#[derive(Debug)]
pub struct RetryPolicy {
    attempts: u32,
    limit: u32,
    timeout: Duration,
}

impl RetryPolicy {
    pub fn new(timeout: Duration) -> RetryPolicy {
        RetryPolicy {
            attempts: 0,
            limit: MAX_RETRIES,
            timeout,
        }
    }

    /// The uniform wait bound for a single receive.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Called at the start of each new block's wait.
    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    /// Records one timed-out wait. `Ok` means the caller should retransmit
    /// and wait again; `Err` means the session must abort.
    pub fn register_timeout(&mut self) -> Result<(), RetriesExhausted> {
        self.attempts += 1;
        if self.attempts > self.limit {
            Err(RetriesExhausted)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allows_exactly_max_retries_timeouts() {
        let mut policy = RetryPolicy::new(Duration::from_millis(100));
        for _ in 0..MAX_RETRIES {
            assert_eq!(policy.register_timeout(), Ok(()));
        }
        assert_eq!(policy.register_timeout(), Err(RetriesExhausted));
    }

    #[test]
    fn test_reset_restores_full_budget() {
        let mut policy = RetryPolicy::new(Duration::from_millis(100));
        for _ in 0..MAX_RETRIES {
            assert_eq!(policy.register_timeout(), Ok(()));
        }
        policy.reset();
        for _ in 0..MAX_RETRIES {
            assert_eq!(policy.register_timeout(), Ok(()));
        }
        assert_eq!(policy.register_timeout(), Err(RetriesExhausted));
    }

    #[test]
    fn test_timeout_is_what_was_configured() {
        let policy = RetryPolicy::new(Duration::from_secs_f64(0.5));
        assert_eq!(policy.timeout(), Duration::from_millis(500));
    }
}
