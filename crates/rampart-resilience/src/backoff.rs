//! Wait intervals between retry attempts
//!
//! Fixed waits, exponential growth with random jitter, and AWS-style
//! decorrelated jitter. Each retried call draws its delays from a fresh
//! [`Delays`] iterator.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Backoff strategy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Backoff {
    /// Same wait before every retry
    Fixed {
        /// Wait between attempts
        wait: Duration,
    },
    /// Wait grows by `multiplier` after every retry, capped at `max_delay`
    Exponential {
        /// Wait before the first retry
        initial_delay: Duration,
        /// Maximum delay cap
        max_delay: Duration,
        /// Multiplier for each retry (typically 2.0)
        multiplier: f64,
        /// Jitter factor (0.0 to 1.0, recommended 0.1-0.3)
        jitter: f64,
    },
    /// `min(cap, random_between(base, previous * 3))`
    DecorrelatedJitter {
        /// Lower bound and first wait
        base: Duration,
        /// Maximum delay cap
        cap: Duration,
    },
}

impl Default for Backoff {
    fn default() -> Self {
        Self::fixed(Duration::from_millis(500))
    }
}

impl Backoff {
    /// Fixed wait between attempts
    pub fn fixed(wait: Duration) -> Self {
        Self::Fixed { wait }
    }

    /// Retry immediately
    pub fn none() -> Self {
        Self::fixed(Duration::ZERO)
    }

    /// Exponential backoff starting at `initial_delay`, doubling up to 30s
    /// with 20% jitter
    pub fn exponential(initial_delay: Duration) -> Self {
        Self::Exponential {
            initial_delay,
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: 0.2,
        }
    }

    /// Decorrelated jitter between `base` and `cap`
    pub fn decorrelated(base: Duration, cap: Duration) -> Self {
        Self::DecorrelatedJitter { base, cap }
    }

    /// Create an aggressive config for fast retries
    pub fn aggressive() -> Self {
        Self::Exponential {
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(5),
            multiplier: 1.5,
            jitter: 0.1,
        }
    }

    /// Create a conservative config for slow retries
    pub fn conservative() -> Self {
        Self::Exponential {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
            jitter: 0.3,
        }
    }

    /// Set maximum delay (exponential only)
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        if let Self::Exponential { max_delay, .. } = &mut self {
            *max_delay = delay;
        }
        self
    }

    /// Set multiplier (exponential only)
    pub fn with_multiplier(mut self, value: f64) -> Self {
        if let Self::Exponential { multiplier, .. } = &mut self {
            *multiplier = value.max(1.0);
        }
        self
    }

    /// Set jitter factor, clamped to 0.0..=1.0 (exponential only)
    pub fn with_jitter(mut self, value: f64) -> Self {
        if let Self::Exponential { jitter, .. } = &mut self {
            *jitter = value.clamp(0.0, 1.0);
        }
        self
    }

    /// Whether every delay this strategy produces is zero
    pub fn is_immediate(&self) -> bool {
        match self {
            Self::Fixed { wait } => wait.is_zero(),
            Self::Exponential { initial_delay, .. } => initial_delay.is_zero(),
            Self::DecorrelatedJitter { base, cap } => base.is_zero() && cap.is_zero(),
        }
    }

    /// Fresh delay sequence for one call
    pub fn delays(&self) -> Delays {
        let current = match self {
            Self::Fixed { wait } => *wait,
            Self::Exponential { initial_delay, .. } => *initial_delay,
            Self::DecorrelatedJitter { base, .. } => *base,
        };
        Delays {
            backoff: self.clone(),
            current,
        }
    }
}

/// Endless iterator of retry delays
#[derive(Debug, Clone)]
pub struct Delays {
    backoff: Backoff,
    current: Duration,
}

fn delay_with_jitter(base_delay: Duration, jitter: f64) -> Duration {
    let jitter_range = base_delay.as_secs_f64() * jitter;
    if jitter_range <= 0.0 {
        return base_delay;
    }

    let mut rng = rand::thread_rng();
    let offset = rng.gen_range(-jitter_range..jitter_range);
    Duration::from_secs_f64((base_delay.as_secs_f64() + offset).max(0.0))
}

impl Iterator for Delays {
    type Item = Duration;

    fn next(&mut self) -> Option<Self::Item> {
        let delay = match &self.backoff {
            Backoff::Fixed { wait } => *wait,
            Backoff::Exponential {
                max_delay,
                multiplier,
                jitter,
                ..
            } => {
                let delay = delay_with_jitter(self.current, *jitter).min(*max_delay);
                self.current = Duration::from_secs_f64(
                    (self.current.as_secs_f64() * multiplier).min(max_delay.as_secs_f64()),
                );
                delay
            }
            Backoff::DecorrelatedJitter { base, cap } => {
                let base = base.as_secs_f64();
                let prev = self.current.as_secs_f64();
                let next = rand::thread_rng().gen_range(base..(prev * 3.0).max(base + 0.001));
                self.current = Duration::from_secs_f64(next.min(cap.as_secs_f64()));
                self.current
            }
        };
        Some(delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_fixed_500ms() {
        let delays: Vec<_> = Backoff::default().delays().take(3).collect();
        assert_eq!(delays, vec![Duration::from_millis(500); 3]);
    }

    #[test]
    fn test_exponential_iteration() {
        let backoff = Backoff::exponential(Duration::from_millis(100)).with_jitter(0.0); // No jitter for predictable testing

        let delays: Vec<_> = backoff.delays().take(3).collect();

        assert_eq!(delays[0], Duration::from_millis(100));
        assert_eq!(delays[1], Duration::from_millis(200));
        assert_eq!(delays[2], Duration::from_millis(400));
    }

    #[test]
    fn test_max_delay_cap() {
        let backoff = Backoff::exponential(Duration::from_secs(10))
            .with_max_delay(Duration::from_secs(15))
            .with_jitter(0.0);

        for delay in backoff.delays().take(5) {
            assert!(delay <= Duration::from_secs(15));
        }
    }

    #[test]
    fn test_each_call_starts_over() {
        let backoff = Backoff::exponential(Duration::from_millis(10)).with_jitter(0.0);
        let mut first = backoff.delays();
        first.next();
        first.next();

        assert_eq!(backoff.delays().next(), Some(Duration::from_millis(10)));
    }

    #[test]
    fn test_jitter_applied() {
        let backoff = Backoff::exponential(Duration::from_secs(1))
            .with_multiplier(1.0)
            .with_jitter(0.5);

        let delays: Vec<_> = backoff.delays().take(5).collect();
        for delay in &delays {
            assert!(*delay >= Duration::from_millis(500));
            assert!(*delay <= Duration::from_millis(1500));
        }
    }

    #[test]
    fn test_zero_delay_with_jitter_does_not_panic() {
        let backoff = Backoff::exponential(Duration::ZERO).with_jitter(0.5);
        assert_eq!(backoff.delays().next(), Some(Duration::ZERO));
        assert!(backoff.is_immediate());
    }

    #[test]
    fn test_presets() {
        assert!(matches!(
            Backoff::aggressive(),
            Backoff::Exponential { initial_delay, .. } if initial_delay == Duration::from_millis(50)
        ));
        assert!(matches!(
            Backoff::conservative(),
            Backoff::Exponential { max_delay, .. } if max_delay == Duration::from_secs(60)
        ));
        assert!(Backoff::none().is_immediate());
    }

    #[test]
    fn test_decorrelated_jitter() {
        let backoff = Backoff::decorrelated(Duration::from_millis(100), Duration::from_secs(10));

        for delay in backoff.delays().take(5) {
            assert!(delay <= Duration::from_secs(10));
            assert!(delay >= Duration::from_millis(100));
        }
    }

    #[test]
    fn test_serde_tagged() {
        let backoff: Backoff =
            serde_json::from_str(r#"{"type":"fixed","wait":{"secs":1,"nanos":0}}"#).unwrap();
        assert_eq!(backoff, Backoff::fixed(Duration::from_secs(1)));
    }
}
