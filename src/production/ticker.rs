use crate::io::{Clock, SystemClock, Ticker, Timestamp};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};

/// Ticks on wall-clock multiples of the period, so every server with the same
/// interval surveys at the same instants (`:00`, `:10`, `:20`, ...).
///
/// A tick that falls behind is skipped rather than replayed.
pub struct AlignedTicker {
    interval: Interval,
    period: Duration,
    clock: Arc<dyn Clock>,
}

impl AlignedTicker {
    pub fn new(period: Duration) -> Self {
        Self::with_clock(period, Arc::new(SystemClock))
    }

    pub fn with_clock(period: Duration, clock: Arc<dyn Clock>) -> Self {
        let period = period.max(Duration::from_millis(1));
        let period_ms = period.as_millis() as u64;
        let now_ms = clock.now().as_millis();
        let wait = Duration::from_millis(period_ms - now_ms % period_ms);

        let mut interval = interval_at(Instant::now() + wait, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        AlignedTicker {
            interval,
            period,
            clock,
        }
    }
}

/// Round `now` to the nearest multiple of `period`, in unix seconds. Timers
/// can fire a little early or late relative to the wall clock.
pub fn align(now: Timestamp, period: Duration) -> i64 {
    let period_ms = (period.as_millis() as u64).max(1);
    let rounded = (now.as_millis() + period_ms / 2) / period_ms * period_ms;
    Timestamp::from_millis(rounded).as_secs()
}

impl Ticker for AlignedTicker {
    fn tick(&mut self) -> Pin<Box<dyn Future<Output = Option<i64>> + Send + '_>> {
        Box::pin(async move {
            self.interval.tick().await;
            Some(align(self.clock.now(), self.period))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Wall clock that follows tokio's (pausable) time.
    struct FollowClock {
        base: Timestamp,
        start: Instant,
    }

    impl Clock for FollowClock {
        fn now(&self) -> Timestamp {
            self.base + self.start.elapsed()
        }
    }

    #[test]
    fn test_align() {
        let ten = Duration::from_secs(10);
        assert_eq!(align(Timestamp::from_millis(1_000_000), ten), 1000);
        assert_eq!(align(Timestamp::from_millis(1_000_004), ten), 1000);
        assert_eq!(align(Timestamp::from_millis(999_998), ten), 1000);
        assert_eq!(align(Timestamp::from_millis(1_006_000), ten), 1010);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticks_on_period_boundaries() {
        let clock = Arc::new(FollowClock {
            base: Timestamp::from_millis(1_003_500),
            start: Instant::now(),
        });
        let mut ticker = AlignedTicker::with_clock(Duration::from_secs(10), clock);
        let start = Instant::now();

        assert_eq!(ticker.tick().await, Some(1010));
        let waited = start.elapsed();
        assert!(waited >= Duration::from_millis(6_500) && waited < Duration::from_millis(6_600));

        assert_eq!(ticker.tick().await, Some(1020));
        assert_eq!(ticker.tick().await, Some(1030));
        assert!(start.elapsed() < Duration::from_millis(26_600));
    }
}
