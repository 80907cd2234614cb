use std::time::Duration;

/// Bounded retry schedule shared by I/O and coordinator paths.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    max_attempts: usize,
    start: Duration,
    max: Duration,
    exponential: bool,
}

impl RetryPolicy {
    /// Fixed delay between up to `max_attempts` attempts.
    pub fn linear(max_attempts: usize, delay: Duration) -> Self {
        Self {
            max_attempts,
            start: delay,
            max: delay,
            exponential: false,
        }
    }

    /// Delay doubles from `start`, capped at `max`.
    pub fn exponential(max_attempts: usize, start: Duration, max: Duration) -> Self {
        Self {
            max_attempts,
            start,
            max,
            exponential: true,
        }
    }

    pub fn handle(&self) -> RetryHandle {
        RetryHandle {
            policy: *self,
            attempts: 0,
        }
    }
}

/// Mutable cursor over one retry sequence.
#[derive(Debug)]
pub struct RetryHandle {
    policy: RetryPolicy,
    attempts: usize,
}

impl RetryHandle {
    /// Delay to sleep before the next attempt, or `None` when the budget
    /// is exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempts + 1 >= self.policy.max_attempts {
            return None;
        }
        let delay = if self.policy.exponential {
            let factor = 1u32 << self.attempts.min(20) as u32;
            self.policy
                .start
                .saturating_mul(factor)
                .min(self.policy.max)
        } else {
            self.policy.start
        };
        self.attempts += 1;
        Some(delay)
    }

    pub fn attempts(&self) -> usize {
        self.attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn linear_policy_yields_fixed_delays_then_exhausts() {
        let mut handle = RetryPolicy::linear(3, Duration::from_millis(20)).handle();
        assert_eq!(handle.next_delay(), Some(Duration::from_millis(20)));
        assert_eq!(handle.next_delay(), Some(Duration::from_millis(20)));
        assert_eq!(handle.next_delay(), None);
        assert_eq!(handle.attempts(), 2);
    }

    #[test]
    fn exponential_policy_doubles_and_caps() {
        let mut handle =
            RetryPolicy::exponential(6, Duration::from_millis(100), Duration::from_millis(400))
                .handle();
        assert_eq!(handle.next_delay(), Some(Duration::from_millis(100)));
        assert_eq!(handle.next_delay(), Some(Duration::from_millis(200)));
        assert_eq!(handle.next_delay(), Some(Duration::from_millis(400)));
        assert_eq!(handle.next_delay(), Some(Duration::from_millis(400)));
    }
}
