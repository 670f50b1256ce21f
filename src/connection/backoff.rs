//! Exponential backoff for "server unavailable" refusals
//!
//! Delays start at the initial interval and grow by the multiplier, with
//! integer truncation, up to the per-attempt cap. A delay that would push the
//! cumulative wait past the total budget is never handed out.

use crate::config::RetrySection;
use std::time::Duration;

const MIN_INTERVAL_MS: u64 = 1;

#[derive(Debug, Clone)]
pub struct Backoff {
    multiplier: f64,
    max_interval_ms: u64,
    max_elapsed_ms: u64,
    next_ms: u64,
    elapsed_ms: u64,
    delays: u32,
}

impl Backoff {
    /// Degenerate settings are clamped: intervals are at least 1 ms and the
    /// multiplier at least 1.0, so the budget always runs out.
    pub fn new(retry: &RetrySection) -> Self {
        let multiplier = if retry.multiplier.is_finite() && retry.multiplier >= 1.0 {
            retry.multiplier
        } else {
            1.0
        };
        let max_interval_ms = retry.max_interval_ms.max(MIN_INTERVAL_MS);

        Self {
            multiplier,
            max_interval_ms,
            max_elapsed_ms: retry.max_elapsed_ms,
            next_ms: retry
                .initial_interval_ms
                .clamp(MIN_INTERVAL_MS, max_interval_ms),
            elapsed_ms: 0,
            delays: 0,
        }
    }

    /// Next wait, or `None` once the total budget would be exceeded
    pub fn next_delay(&mut self) -> Option<Duration> {
        let delay = self.next_ms;
        let elapsed = self.elapsed_ms.checked_add(delay)?;
        if elapsed > self.max_elapsed_ms {
            return None;
        }

        self.elapsed_ms = elapsed;
        self.delays += 1;
        let grown = (self.next_ms as f64 * self.multiplier) as u64;
        self.next_ms = grown.min(self.max_interval_ms);
        Some(Duration::from_millis(delay))
    }

    /// Sum of every delay handed out so far
    pub fn elapsed(&self) -> Duration {
        Duration::from_millis(self.elapsed_ms)
    }

    pub fn max_elapsed(&self) -> Duration {
        Duration::from_millis(self.max_elapsed_ms)
    }

    /// Number of delays handed out so far
    pub fn delays(&self) -> u32 {
        self.delays
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_default_sequence() {
        let mut backoff = Backoff::new(&RetrySection::default());
        let first: Vec<u64> = (0..9)
            .map(|_| backoff.next_delay().unwrap().as_millis() as u64)
            .collect();
        assert_eq!(first, vec![500, 750, 1125, 1687, 2530, 3795, 5692, 6000, 6000]);
    }

    #[test]
    fn test_budget_stops_before_overrun() {
        let mut backoff = Backoff::new(&RetrySection::default());
        while backoff.next_delay().is_some() {}

        // 7 growing delays (16079 ms) then 147 capped ones
        assert_eq!(backoff.delays(), 154);
        assert_eq!(backoff.elapsed(), Duration::from_millis(898_079));
        assert!(backoff.elapsed() <= backoff.max_elapsed());
        assert_eq!(backoff.next_delay(), None);
    }

    #[test]
    fn test_initial_interval_respects_cap() {
        let retry = RetrySection {
            initial_interval_ms: 10_000,
            max_interval_ms: 2_000,
            ..RetrySection::default()
        };
        let mut backoff = Backoff::new(&retry);
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(2_000)));
    }

    #[test]
    fn test_zero_budget_yields_nothing() {
        let retry = RetrySection {
            max_elapsed_ms: 0,
            ..RetrySection::default()
        };
        assert_eq!(Backoff::new(&retry).next_delay(), None);
    }

    #[test]
    fn test_zero_interval_is_clamped_and_terminates() {
        let retry = RetrySection {
            initial_interval_ms: 0,
            max_elapsed_ms: 10_000,
            ..RetrySection::default()
        };
        let mut backoff = Backoff::new(&retry);

        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(1)));
        while backoff.next_delay().is_some() {}
        // 1 ms * 1.5 truncates back to 1 ms, so the budget is spent 1 ms at a time
        assert_eq!(backoff.elapsed(), Duration::from_millis(10_000));
        assert_eq!(backoff.delays(), 10_000);
    }

    #[test]
    fn test_shrinking_or_nan_multiplier_holds_interval() {
        for multiplier in [0.0, 0.5, -2.0, f64::NAN] {
            let retry = RetrySection {
                multiplier,
                max_elapsed_ms: 2_000,
                ..RetrySection::default()
            };
            let mut backoff = Backoff::new(&retry);
            let delays: Vec<u64> = std::iter::from_fn(|| backoff.next_delay())
                .map(|d| d.as_millis() as u64)
                .collect();
            assert_eq!(delays, vec![500, 500, 500, 500], "multiplier {multiplier}");
        }
    }

    #[test]
    fn test_zero_cap_is_clamped() {
        let retry = RetrySection {
            max_interval_ms: 0,
            max_elapsed_ms: 3,
            ..RetrySection::default()
        };
        let mut backoff = Backoff::new(&retry);
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(1)));
        assert_eq!(backoff.delays(), 1);
        while backoff.next_delay().is_some() {}
        assert_eq!(backoff.delays(), 3);
    }

    proptest! {
        #[test]
        fn cumulative_wait_never_exceeds_budget(
            initial in 10u64..5_000,
            multiplier in 1.0f64..3.0,
            cap in 10u64..20_000,
            budget in 0u64..60_000,
        ) {
            let retry = RetrySection {
                initial_interval_ms: initial,
                multiplier,
                max_interval_ms: cap,
                max_elapsed_ms: budget,
                publish_retries: 3,
            };
            let mut backoff = Backoff::new(&retry);
            let mut total = 0u64;
            while let Some(delay) = backoff.next_delay() {
                prop_assert!(delay.as_millis() as u64 <= cap);
                total += delay.as_millis() as u64;
            }
            prop_assert!(total <= budget);
            prop_assert_eq!(Duration::from_millis(total), backoff.elapsed());
        }
    }
}
