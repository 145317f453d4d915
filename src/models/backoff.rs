use chrono::{DateTime, Utc};
use std::time::Duration;

/// Exponential retry delay: `base_delay * 2^attempts`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    base_delay: Duration,
}

impl Backoff {
    /// Exponents above this stop growing the delay, so `delay` is strictly
    /// increasing only up to this attempt count (for a non-zero base).
    pub const MAX_EXPONENT: u32 = 20;

    pub const fn new(base_delay: Duration) -> Self {
        Self { base_delay }
    }

    pub const fn base_delay(&self) -> Duration {
        self.base_delay
    }

    pub fn delay(&self, attempts: i32) -> Duration {
        let exponent = u32::try_from(attempts)
            .unwrap_or(0)
            .min(Self::MAX_EXPONENT);
        self.base_delay.saturating_mul(1 << exponent)
    }

    pub fn next_run_at(&self, attempts: i32, now: DateTime<Utc>) -> DateTime<Utc> {
        chrono::Duration::from_std(self.delay(attempts))
            .ok()
            .and_then(|delay| now.checked_add_signed(delay))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::new(Duration::from_secs(60))
    }
}

#[tokio::test]
async fn backoff_doubles_per_attempt() -> anyhow::Result<()> {
    // arrange
    let backoff = Backoff::default();

    // act & assert
    assert_eq!(Duration::from_secs(60), backoff.delay(0));
    assert_eq!(Duration::from_secs(120), backoff.delay(1));
    assert_eq!(Duration::from_secs(240), backoff.delay(2));
    assert_eq!(Duration::from_secs(480), backoff.delay(3));
    Ok(())
}

#[tokio::test]
async fn backoff_next_run_at_is_monotonic() -> anyhow::Result<()> {
    // arrange
    let backoff = Backoff::new(Duration::from_secs(60));
    let now = Utc::now();

    // act & assert
    for attempts in 0..Backoff::MAX_EXPONENT as i32 {
        let current = backoff.next_run_at(attempts, now) - now;
        let next = backoff.next_run_at(attempts + 1, now) - now;
        assert!(next > current, "attempts={attempts}");
    }
    Ok(())
}

#[tokio::test]
async fn backoff_next_run_at_offsets_now() -> anyhow::Result<()> {
    // arrange
    let backoff = Backoff::new(Duration::from_secs(60));
    let now = Utc::now();

    // act
    let at = backoff.next_run_at(2, now);

    // assert
    assert_eq!(chrono::Duration::seconds(240), at - now);
    Ok(())
}

#[tokio::test]
async fn backoff_zero_base_is_immediate() -> anyhow::Result<()> {
    // arrange
    let backoff = Backoff::new(Duration::ZERO);
    let now = Utc::now();

    // act & assert
    assert_eq!(now, backoff.next_run_at(5, now));
    Ok(())
}

#[tokio::test]
async fn backoff_negative_attempts_use_base() -> anyhow::Result<()> {
    // arrange
    let backoff = Backoff::default();

    // act & assert
    assert_eq!(backoff.base_delay(), backoff.delay(-1));
    Ok(())
}

#[tokio::test]
async fn backoff_delay_stops_growing_past_max_exponent() -> anyhow::Result<()> {
    // arrange
    let backoff = Backoff::new(Duration::from_millis(1));
    let cap = Backoff::MAX_EXPONENT as i32;

    // act & assert
    assert!(backoff.delay(cap - 1) < backoff.delay(cap));
    assert_eq!(backoff.delay(cap), backoff.delay(cap + 1));
    Ok(())
}
