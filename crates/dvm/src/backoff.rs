//! Exponential backoff with optional jitter.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Jitter strategy to apply to backoff delays.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Jitter {
    /// Always return the capped exponential delay.
    None,
    /// Return a random delay in `[0, capped_delay]`.
    Full,
}

/// Serializable backoff parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    #[serde(default = "default_jitter")]
    pub jitter: Jitter,
}

fn default_jitter() -> Jitter {
    Jitter::Full
}

impl RetryPolicy {
    pub const fn new(initial_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            initial_delay_ms,
            max_delay_ms,
            jitter: Jitter::Full,
        }
    }

    pub fn with_jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = jitter;
        self
    }

    /// A backoff sequence limited to `max_attempts` delays (0 = unlimited).
    pub fn backoff(&self, max_attempts: u32) -> ExponentialBackoff {
        ExponentialBackoff::new(
            Duration::from_millis(self.initial_delay_ms),
            Duration::from_millis(self.max_delay_ms),
            max_attempts,
        )
        .with_jitter(self.jitter)
    }
}

/// Exponential backoff calculator.
#[derive(Clone, Debug)]
pub struct ExponentialBackoff {
    base_delay: Duration,
    max_delay: Duration,
    max_attempts: Option<u32>,
    jitter: Jitter,
    attempt: u32,
}

impl ExponentialBackoff {
    /// `max_attempts` of 0 means unlimited attempts.
    pub fn new(base_delay: Duration, max_delay: Duration, max_attempts: u32) -> Self {
        Self {
            base_delay,
            max_delay,
            max_attempts: (max_attempts > 0).then_some(max_attempts),
            jitter: Jitter::Full,
            attempt: 0,
        }
    }

    pub fn with_jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = jitter;
        self
    }

    /// Get the next delay in the sequence, or `None` once exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.is_exhausted() {
            return None;
        }

        // min(base * 2^attempt, max)
        let base_ms = self.base_delay.as_millis();
        let max_ms = self.max_delay.as_millis();
        let multiplier = 1u128.checked_shl(self.attempt.min(63)).unwrap_or(u128::MAX);
        let capped_ms = base_ms.saturating_mul(multiplier).min(max_ms);

        let delay_ms = match self.jitter {
            Jitter::None => capped_ms,
            Jitter::Full => {
                let capped = capped_ms.min(u64::MAX as u128) as u64;
                rand::thread_rng().gen_range(0..=capped) as u128
            }
        };

        self.attempt = self.attempt.saturating_add(1);
        Some(Duration::from_millis(delay_ms.min(u64::MAX as u128) as u64))
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Number of delays handed out so far.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn is_exhausted(&self) -> bool {
        self.max_attempts.is_some_and(|max| self.attempt >= max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn millis(ms: &[u64]) -> Vec<Duration> {
        ms.iter().copied().map(Duration::from_millis).collect()
    }

    #[test]
    fn policy_without_jitter_doubles_up_to_cap() {
        let mut backoff = RetryPolicy::new(250, 1_500)
            .with_jitter(Jitter::None)
            .backoff(5);
        let delays: Vec<Duration> = std::iter::from_fn(|| backoff.next_delay()).collect();
        assert_eq!(delays, millis(&[250, 500, 1_000, 1_500, 1_500]));
        assert!(backoff.is_exhausted());
        assert_eq!(backoff.attempt(), 5);
    }

    #[test]
    fn unlimited_policy_restarts_after_reset() {
        let mut backoff = RetryPolicy::new(40, 1_000)
            .with_jitter(Jitter::None)
            .backoff(0);
        for _ in 0..20 {
            assert!(backoff.next_delay().is_some());
        }
        assert!(!backoff.is_exhausted());
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(1_000)));

        backoff.reset();
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(40)));
    }

    #[test]
    fn jittered_policy_never_exceeds_cap() {
        let policy = RetryPolicy::new(300, 700);
        assert_eq!(policy.jitter, Jitter::Full);
        let mut backoff = policy.backoff(12);
        while let Some(delay) = backoff.next_delay() {
            assert!(delay <= Duration::from_millis(700));
        }
        assert_eq!(backoff.attempt(), 12);
    }

    #[test]
    fn policy_jitter_defaults_to_full_when_omitted() {
        let policy: RetryPolicy =
            toml::from_str("initial_delay_ms = 100\nmax_delay_ms = 900\n").unwrap();
        assert_eq!(policy, RetryPolicy::new(100, 900));

        let explicit: RetryPolicy = toml::from_str(
            "initial_delay_ms = 100\nmax_delay_ms = 900\njitter = \"none\"\n",
        )
        .unwrap();
        assert_eq!(explicit.jitter, Jitter::None);
    }
}
