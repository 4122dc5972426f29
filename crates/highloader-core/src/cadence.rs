use std::time::Duration;
use tokio::time::{interval, Interval, MissedTickBehavior};

const MICROS_PER_SECOND: u64 = 1_000_000;

/// Fixed-rate ticker using integer microsecond periods.
///
/// The first tick completes immediately. Ticks missed because the runtime
/// was busy are skipped rather than replayed in a burst.
pub struct Cadence {
    rate: u64,
    interval: Interval,
}

impl Cadence {
    /// `rate` must be non-zero; callers validate it first.
    pub fn new(rate: u64) -> Self {
        let mut interval = interval(Self::period_for(rate));
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        Self { rate, interval }
    }

    /// `1 / rate` seconds, floored to whole microseconds and never zero.
    /// Rates above one million per second are capped at one tick per
    /// microsecond.
    pub fn period_for(rate: u64) -> Duration {
        let rate = rate.max(1);
        Duration::from_micros((MICROS_PER_SECOND / rate).max(1))
    }

    pub fn rate(&self) -> u64 {
        self.rate
    }

    pub fn period(&self) -> Duration {
        self.interval.period()
    }

    pub async fn tick(&mut self) {
        self.interval.tick().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Instant;

    #[test]
    fn test_period_for_rate() {
        assert_eq!(Cadence::period_for(1), Duration::from_secs(1));
        assert_eq!(Cadence::period_for(10), Duration::from_millis(100));
        assert_eq!(Cadence::period_for(3), Duration::from_micros(333_333));
        assert_eq!(Cadence::period_for(1_000_000), Duration::from_micros(1));
        assert_eq!(Cadence::period_for(5_000_000), Duration::from_micros(1));
        assert_eq!(Cadence::period_for(0), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticks_at_rate() {
        let mut cadence = Cadence::new(100);
        assert_eq!(cadence.rate(), 100);
        assert_eq!(cadence.period(), Duration::from_millis(10));

        let start = Instant::now();
        cadence.tick().await;
        assert_eq!(start.elapsed(), Duration::ZERO);

        for _ in 0..100 {
            cadence.tick().await;
        }
        assert_eq!(start.elapsed(), Duration::from_secs(1));
    }
}
